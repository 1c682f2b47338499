//! CS101 unbalanced controlling station: a polled primary driving one or
//! more secondary stations over a shared half-duplex channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::asdu::Asdu;
use crate::command::{CommandSpec, CommandValue};
use crate::common::{AppLayerParameters, LinkLayerParameters, TypeId};
use crate::cs101::frame::Ft12Frame;
use crate::cs101::link::{LinkChannel, LinkControl, PrimaryFunction, SecondaryFunction};
use crate::error::{Iec60870Error, Iec60870Result};
use crate::events::{ControlEvent, DataPoint, EventSink};
use crate::transport::Transport;

/// Unbalanced master configuration.
#[derive(Debug, Clone)]
pub struct Iec101MasterConfig {
    /// Identifier used in events
    pub client_id: String,
    /// Own station address, placed in balanced-mode frames; the
    /// unbalanced master addresses the polled slave instead
    pub link_address: u16,
    /// Common address used for commands without an explicit override
    pub asdu_address: u16,
    pub originator_address: u8,
    pub link: LinkLayerParameters,
    pub app_params: AppLayerParameters,
    /// Bound of each slave's outbound ASDU queue
    pub queue_size: usize,
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    /// Interrogate a slave automatically when its link becomes available
    pub auto_interrogation: bool,
}

impl Default for Iec101MasterConfig {
    fn default() -> Self {
        Self {
            client_id: "iec101-master".to_string(),
            link_address: 1,
            asdu_address: 1,
            originator_address: 0,
            link: LinkLayerParameters::default(),
            app_params: AppLayerParameters::default(),
            queue_size: 100,
            reconnect_delay: Duration::from_secs(5),
            max_retries: 10,
            auto_interrogation: true,
        }
    }
}

impl Iec101MasterConfig {
    pub fn validate(&self) -> Iec60870Result<()> {
        self.link.validate()?;
        self.app_params.validate()?;
        if self.queue_size == 0 {
            return Err(Iec60870Error::Config("queue_size must be > 0".to_string()));
        }
        if self.reconnect_delay < Duration::from_secs(1) {
            return Err(Iec60870Error::Config(
                "reconnect_delay must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of the master.
#[derive(Debug, Clone, Default)]
pub struct MasterStatus {
    pub connected: bool,
    /// Software activation flag; the unbalanced link has no STARTDT
    pub activated: bool,
    pub client_id: String,
    pub last_error: String,
}

enum MasterCommand {
    AddSlave(u16),
    RemoveSlave(u16),
    PollSlave(u16),
    SendAsdus { slave: u16, asdus: Vec<Asdu> },
}

/// Per-secondary link state kept by the polling loop.
struct SlaveState {
    address: u16,
    /// Link status negotiated and FCB synchronized
    link_available: bool,
    /// FCB used by the previous confirmed request
    fcb: bool,
    /// The previous confirmed request was acknowledged, so the next
    /// request toggles FCB; a retransmission keeps it.
    acked: bool,
    retries: u8,
    /// ACD seen: serve class 1 on the next poll
    class1_pending: bool,
    /// Link failure already reported; cleared on recovery
    error_reported: bool,
    queue: VecDeque<Asdu>,
    poll_now: bool,
}

impl SlaveState {
    fn new(address: u16) -> Self {
        Self {
            address,
            link_available: false,
            fcb: false,
            acked: true,
            retries: 0,
            class1_pending: false,
            error_reported: false,
            queue: VecDeque::new(),
            poll_now: false,
        }
    }

    /// FCB for the next confirmed frame, honoring the retransmit rule.
    fn next_fcb(&mut self) -> bool {
        if self.acked {
            self.fcb = !self.fcb;
            self.acked = false;
        }
        self.fcb
    }
}

/// IEC 101 unbalanced master.
pub struct Iec101MasterUnbalanced {
    config: Iec101MasterConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<MasterStatus>>,
    commands: Mutex<Option<mpsc::Sender<MasterCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Iec101MasterUnbalanced {
    pub fn new(config: Iec101MasterConfig, sink: Arc<dyn EventSink>) -> Iec60870Result<Self> {
        config.validate()?;
        let status = MasterStatus {
            client_id: config.client_id.clone(),
            ..Default::default()
        };
        Ok(Self {
            config,
            sink,
            running: Arc::new(RwLock::new(false)),
            status: Arc::new(RwLock::new(status)),
            commands: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Take ownership of the transport and start polling.
    pub async fn connect(&self, transport: Box<dyn Transport>) -> Iec60870Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;
        drop(running);

        let (tx, rx) = mpsc::channel(self.config.queue_size);
        *self.commands.lock().await = Some(tx);

        let worker = Worker {
            config: self.config.clone(),
            sink: self.sink.clone(),
            running: self.running.clone(),
            status: self.status.clone(),
        };
        let handle = tokio::spawn(worker.run(transport, rx));
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.running.write().await = false;
        *self.commands.lock().await = None;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Register a secondary station.
    pub async fn add_slave(&self, address: u16) -> Iec60870Result<()> {
        if address > 0xFF && self.config.link.address_length <= 1 {
            return Err(Iec60870Error::Config(format!(
                "slave address {address} does not fit a one-byte address field"
            )));
        }
        self.send_worker_command(MasterCommand::AddSlave(address)).await
    }

    pub async fn remove_slave(&self, address: u16) -> Iec60870Result<()> {
        self.send_worker_command(MasterCommand::RemoveSlave(address)).await
    }

    /// Force an immediate poll cycle for one slave.
    pub async fn poll_slave(&self, address: u16) -> Iec60870Result<()> {
        self.send_worker_command(MasterCommand::PollSlave(address)).await
    }

    /// The unbalanced link has no STARTDT; this toggles the software
    /// activation flag only and is idempotent.
    pub async fn send_start_dt(&self) -> Iec60870Result<()> {
        if !self.status.read().await.connected {
            return Err(Iec60870Error::NotConnected);
        }
        let mut status = self.status.write().await;
        if !status.activated {
            status.activated = true;
            drop(status);
            self.sink
                .control(
                    &self.config.client_id,
                    ControlEvent::Activated,
                    "data transfer enabled",
                )
                .await;
        }
        Ok(())
    }

    pub async fn send_stop_dt(&self) -> Iec60870Result<()> {
        let mut status = self.status.write().await;
        if status.activated {
            status.activated = false;
            drop(status);
            self.sink
                .control(
                    &self.config.client_id,
                    ControlEvent::Deactivated,
                    "data transfer disabled",
                )
                .await;
        }
        Ok(())
    }

    /// Validate and queue commands for the addressed slave.
    pub async fn send_commands(
        &self,
        slave: u16,
        specs: Vec<CommandSpec>,
    ) -> Iec60870Result<()> {
        let status = self.status.read().await.clone();
        if !status.connected {
            return Err(Iec60870Error::NotConnected);
        }
        if !status.activated {
            return Err(Iec60870Error::NotActivated);
        }
        let mut asdus = Vec::with_capacity(specs.len());
        for spec in &specs {
            if !(spec.type_id.is_command() || spec.type_id.is_system()) {
                return Err(Iec60870Error::Config(format!(
                    "{:?} is not a control-direction type",
                    spec.type_id
                )));
            }
            let object = spec.to_object()?;
            asdus.push(Asdu::new(
                spec.effective_cause(),
                self.config.originator_address,
                spec.asdu_address.unwrap_or(self.config.asdu_address),
                vec![object],
            )?);
        }
        self.send_worker_command(MasterCommand::SendAsdus { slave, asdus })
            .await
    }

    pub async fn get_status(&self) -> MasterStatus {
        self.status.read().await.clone()
    }

    async fn send_worker_command(&self, command: MasterCommand) -> Iec60870Result<()> {
        let guard = self.commands.lock().await;
        let tx = guard.as_ref().ok_or(Iec60870Error::NotConnected)?;
        tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Iec60870Error::NotConnected,
        })
    }
}

struct Worker {
    config: Iec101MasterConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<MasterStatus>>,
}

impl Worker {
    async fn run(self, transport: Box<dyn Transport>, mut commands: mpsc::Receiver<MasterCommand>) {
        let endpoint = self.config.client_id.clone();
        let mut channel = LinkChannel::new(transport, self.config.link);
        let mut slaves: Vec<SlaveState> = Vec::new();
        let mut cursor = 0usize;
        let mut attempt = 0u32;

        while *self.running.read().await {
            match channel.open().await {
                Ok(()) => {
                    info!(peer = %channel.peer(), client_id = %endpoint, "link transport open");
                    attempt = 0;
                    {
                        let mut status = self.status.write().await;
                        status.connected = true;
                        status.activated = true;
                        status.last_error.clear();
                    }
                    self.sink
                        .control(&endpoint, ControlEvent::Opened, "transport opened")
                        .await;
                    self.sink
                        .control(&endpoint, ControlEvent::Activated, "polling started")
                        .await;

                    let reason = self
                        .poll_loop(&mut channel, &mut commands, &mut slaves, &mut cursor)
                        .await;
                    {
                        let mut status = self.status.write().await;
                        status.connected = false;
                        status.activated = false;
                    }
                    for slave in slaves.iter_mut() {
                        slave.link_available = false;
                        slave.acked = true;
                        slave.retries = 0;
                    }
                    match reason {
                        None => {
                            self.sink
                                .control(&endpoint, ControlEvent::Closed, "master stopped")
                                .await;
                            channel.close().await;
                            return;
                        }
                        Some(reason) => {
                            warn!(client_id = %endpoint, %reason, "link session ended");
                            self.status.write().await.last_error = reason.clone();
                            self.sink
                                .control(&endpoint, ControlEvent::Closed, &reason)
                                .await;
                            channel.close().await;
                        }
                    }
                }
                Err(e) => {
                    self.status.write().await.last_error = e.to_string();
                    debug!(error = %e, "transport open failed");
                }
            }

            if !*self.running.read().await {
                return;
            }
            attempt += 1;
            if attempt > self.config.max_retries {
                self.sink
                    .control(
                        &endpoint,
                        ControlEvent::Failed,
                        "max reconnection attempts reached",
                    )
                    .await;
                *self.running.write().await = false;
                return;
            }
            self.sink
                .control(
                    &endpoint,
                    ControlEvent::Reconnecting,
                    &format!("attempt {attempt} of {}", self.config.max_retries),
                )
                .await;
            self.sleep_while_running(self.config.reconnect_delay).await;
        }
    }

    /// Drive the polling schedule until the link dies or the master stops.
    /// `None` means a graceful stop.
    async fn poll_loop(
        &self,
        channel: &mut LinkChannel,
        commands: &mut mpsc::Receiver<MasterCommand>,
        slaves: &mut Vec<SlaveState>,
        cursor: &mut usize,
    ) -> Option<String> {
        loop {
            if !*self.running.read().await {
                return None;
            }
            self.drain_commands(commands, slaves).await;

            let Some(index) = pick_slave(slaves, *cursor) else {
                sleep(Duration::from_millis(100)).await;
                continue;
            };
            *cursor = (index + 1) % slaves.len().max(1);

            match self.serve_slave(channel, &mut slaves[index]).await {
                Ok(()) => {}
                Err(e) => return Some(e.to_string()),
            }

            // Pace the poll cycle so an idle channel is not saturated.
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn drain_commands(
        &self,
        commands: &mut mpsc::Receiver<MasterCommand>,
        slaves: &mut Vec<SlaveState>,
    ) {
        loop {
            match commands.try_recv() {
                Ok(MasterCommand::AddSlave(address)) => {
                    if !slaves.iter().any(|s| s.address == address) {
                        info!(slave = address, "slave registered");
                        slaves.push(SlaveState::new(address));
                    }
                }
                Ok(MasterCommand::RemoveSlave(address)) => {
                    slaves.retain(|s| s.address != address);
                }
                Ok(MasterCommand::PollSlave(address)) => {
                    if let Some(slave) = slaves.iter_mut().find(|s| s.address == address) {
                        slave.poll_now = true;
                    }
                }
                Ok(MasterCommand::SendAsdus { slave, asdus }) => {
                    match slaves.iter_mut().find(|s| s.address == slave) {
                        Some(state) => {
                            if state.queue.len() + asdus.len() > self.config.queue_size {
                                warn!(slave, "command queue full, dropping batch");
                                self.sink
                                    .control(
                                        &self.config.client_id,
                                        ControlEvent::Busy,
                                        &format!("queue full for slave {slave}"),
                                    )
                                    .await;
                            } else {
                                state.queue.extend(asdus);
                            }
                        }
                        None => warn!(slave, "commands for an unregistered slave dropped"),
                    }
                }
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }
    }

    /// One scheduling tick for one slave.
    async fn serve_slave(
        &self,
        channel: &mut LinkChannel,
        slave: &mut SlaveState,
    ) -> Iec60870Result<()> {
        if !slave.link_available {
            return self.bring_up_link(channel, slave).await;
        }
        slave.poll_now = false;
        if !slave.queue.is_empty() {
            self.send_user_data(channel, slave).await
        } else {
            self.poll_class(channel, slave).await
        }
    }

    /// Link-status negotiation followed by reset of the remote link.
    async fn bring_up_link(
        &self,
        channel: &mut LinkChannel,
        slave: &mut SlaveState,
    ) -> Iec60870Result<()> {
        let timeout = Duration::from_millis(self.config.link.timeout_link_state_ms);
        let request = Ft12Frame::fixed(
            LinkControl::primary(PrimaryFunction::RequestLinkStatus, false, false).to_byte(),
            slave.address,
        );
        let reply = self.exchange(channel, slave.address, &request, timeout).await?;
        let got_status = matches!(
            reply,
            Some(ref frame) if frame
                .control()
                .map(LinkControl::from_byte)
                .and_then(LinkControl::secondary_function)
                == Some(SecondaryFunction::StatusOfLink)
        );
        if !got_status {
            return self.confirmed_request_failed(slave, "no status of link").await;
        }

        let reset = Ft12Frame::fixed(
            LinkControl::primary(PrimaryFunction::ResetRemoteLink, false, false).to_byte(),
            slave.address,
        );
        let reply = self.exchange(channel, slave.address, &reset, timeout).await?;
        if !is_ack(&reply) {
            return self
                .confirmed_request_failed(slave, "reset of remote link not acknowledged")
                .await;
        }

        // FCB starts from a known state after the reset: the first
        // confirmed frame carries FCB = true.
        slave.link_available = true;
        slave.fcb = false;
        slave.acked = true;
        slave.retries = 0;
        slave.error_reported = false;
        info!(slave = slave.address, "link available");

        if self.config.auto_interrogation {
            match self.station_interrogation() {
                Ok(asdu) => slave.queue.push_front(asdu),
                Err(e) => warn!(error = %e, "station interrogation not queued"),
            }
        }
        Ok(())
    }

    /// Transmit the head of the slave's queue as confirmed user data.
    async fn send_user_data(
        &self,
        channel: &mut LinkChannel,
        slave: &mut SlaveState,
    ) -> Iec60870Result<()> {
        let timeout = Duration::from_millis(self.config.link.timeout_for_ack_ms);
        let Some(asdu) = slave.queue.front() else {
            return Ok(());
        };
        let user_data = asdu.encode(&self.config.app_params)?;
        let fcb = slave.next_fcb();
        let frame = Ft12Frame::variable(
            LinkControl::primary(PrimaryFunction::UserDataConfirmed, fcb, true).to_byte(),
            slave.address,
            user_data,
        );
        let reply = self.exchange(channel, slave.address, &frame, timeout).await?;
        if is_ack(&reply) {
            slave.queue.pop_front();
            slave.acked = true;
            slave.retries = 0;
            slave.error_reported = false;
            Ok(())
        } else {
            self.confirmed_request_failed(slave, "user data not acknowledged")
                .await
        }
    }

    /// Class 1 / class 2 request for data.
    async fn poll_class(
        &self,
        channel: &mut LinkChannel,
        slave: &mut SlaveState,
    ) -> Iec60870Result<()> {
        let timeout = Duration::from_millis(self.config.link.timeout_for_ack_ms);
        let function = if slave.class1_pending {
            PrimaryFunction::RequestClass1
        } else {
            PrimaryFunction::RequestClass2
        };
        let fcb = slave.next_fcb();
        let frame = Ft12Frame::fixed(
            LinkControl::primary(function, fcb, true).to_byte(),
            slave.address,
        );
        let reply = self.exchange(channel, slave.address, &frame, timeout).await?;
        let Some(frame) = reply else {
            return self.confirmed_request_failed(slave, "class poll not answered").await;
        };

        slave.acked = true;
        slave.retries = 0;
        slave.error_reported = false;
        match &frame {
            Ft12Frame::SingleChar => {
                slave.class1_pending = false;
            }
            Ft12Frame::Fixed { control, .. } => {
                let control = LinkControl::from_byte(*control);
                slave.class1_pending = control.fcb_acd;
            }
            Ft12Frame::Variable {
                control, user_data, ..
            } => {
                let control = LinkControl::from_byte(*control);
                slave.class1_pending = control.fcb_acd;
                self.deliver(user_data).await;
            }
        }
        Ok(())
    }

    /// Send and wait for a reply addressed by the polled slave, tolerating
    /// frames from other stations on a shared channel.
    async fn exchange(
        &self,
        channel: &mut LinkChannel,
        address: u16,
        frame: &Ft12Frame,
        timeout: Duration,
    ) -> Iec60870Result<Option<Ft12Frame>> {
        channel.send(frame).await?;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match channel.recv(remaining).await? {
                None => return Ok(None),
                Some(reply) => {
                    let matches_station = match reply.address() {
                        // The single control character carries no address.
                        None => true,
                        Some(a) => {
                            self.config.link.address_length == 0 || a == address
                        }
                    };
                    if matches_station {
                        return Ok(Some(reply));
                    }
                    debug!(?reply, "frame for another station ignored");
                }
            }
        }
    }

    async fn confirmed_request_failed(
        &self,
        slave: &mut SlaveState,
        what: &str,
    ) -> Iec60870Result<()> {
        slave.retries += 1;
        if slave.retries > self.config.link.max_retries {
            slave.link_available = false;
            slave.retries = 0;
            return self.link_setback(slave, what).await;
        }
        debug!(
            slave = slave.address,
            retries = slave.retries,
            "retransmitting with unchanged FCB"
        );
        sleep(Duration::from_millis(self.config.link.timeout_repeat_ms)).await;
        Ok(())
    }

    /// Report a dead link once and leave the slave for the next cycle.
    async fn link_setback(&self, slave: &mut SlaveState, what: &str) -> Iec60870Result<()> {
        if !slave.error_reported {
            slave.error_reported = true;
            warn!(slave = slave.address, %what, "link layer error");
            self.sink
                .error(
                    &self.config.client_id,
                    &format!("link error for slave {}: {what}", slave.address),
                )
                .await;
        }
        sleep(Duration::from_millis(self.config.link.timeout_repeat_ms)).await;
        Ok(())
    }

    async fn deliver(&self, user_data: &[u8]) {
        if Asdu::peek_type(user_data).is_none() {
            debug!("user data with unsupported type id not dispatched");
            return;
        }
        match Asdu::decode(&self.config.app_params, user_data) {
            Ok(asdu) => {
                self.sink
                    .data(&self.config.client_id, DataPoint::from_asdu(&asdu))
                    .await;
            }
            Err(e) => debug!(error = %e, "undecodable user data dropped"),
        }
    }

    fn station_interrogation(&self) -> Iec60870Result<Asdu> {
        let spec = CommandSpec::new(TypeId::InterrogationCommand, 0, CommandValue::Int(20));
        Asdu::new(
            spec.effective_cause(),
            self.config.originator_address,
            self.config.asdu_address,
            vec![spec.to_object()?],
        )
    }

    async fn sleep_while_running(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if !*self.running.read().await {
                return;
            }
            let step = remaining.min(slice);
            sleep(step).await;
            remaining -= step;
        }
    }
}

fn is_ack(reply: &Option<Ft12Frame>) -> bool {
    match reply {
        Some(Ft12Frame::SingleChar) => true,
        Some(Ft12Frame::Fixed { control, .. }) => {
            LinkControl::from_byte(*control).secondary_function() == Some(SecondaryFunction::Ack)
        }
        _ => false,
    }
}

/// Round-robin with priority: a slave with queued commands or an explicit
/// poll request is served before one needing only a class-2 poll.
fn pick_slave(slaves: &[SlaveState], cursor: usize) -> Option<usize> {
    if slaves.is_empty() {
        return None;
    }
    let order = (0..slaves.len()).map(|i| (cursor + i) % slaves.len());
    let mut first = None;
    for i in order {
        if !slaves[i].queue.is_empty() || slaves[i].poll_now {
            return Some(i);
        }
        first.get_or_insert(i);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn slave_with(address: u16, queued: usize, poll_now: bool) -> SlaveState {
        let mut slave = SlaveState::new(address);
        slave.poll_now = poll_now;
        for _ in 0..queued {
            slave.queue.push_back(
                Asdu::new(
                    crate::common::Cause::Activation,
                    0,
                    1,
                    vec![crate::information::InformationObject::SingleCommand {
                        ioa: 1,
                        value: true,
                        select: false,
                        ql: 0,
                    }],
                )
                .unwrap(),
            );
        }
        slave
    }

    #[test]
    fn fcb_toggles_only_after_acknowledgement() {
        let mut slave = SlaveState::new(1);
        assert!(slave.next_fcb());
        // Not acknowledged: the retransmission reuses the FCB.
        assert!(slave.next_fcb());
        slave.acked = true;
        assert!(!slave.next_fcb());
        slave.acked = true;
        assert!(slave.next_fcb());
    }

    #[test]
    fn command_bearing_slave_is_served_first() {
        let slaves = vec![
            slave_with(1, 0, false),
            slave_with(2, 1, false),
            slave_with(3, 0, false),
        ];
        assert_eq!(pick_slave(&slaves, 0), Some(1));
        // Round robin otherwise.
        let idle = vec![slave_with(1, 0, false), slave_with(2, 0, false)];
        assert_eq!(pick_slave(&idle, 0), Some(0));
        assert_eq!(pick_slave(&idle, 1), Some(1));
    }

    #[test]
    fn poll_request_has_command_priority() {
        let slaves = vec![slave_with(1, 0, false), slave_with(2, 0, true)];
        assert_eq!(pick_slave(&slaves, 0), Some(1));
    }

    #[test]
    fn no_slaves_no_pick() {
        assert_eq!(pick_slave(&[], 0), None);
    }

    #[test]
    fn config_validation() {
        assert!(Iec101MasterConfig::default().validate().is_ok());
        let bad = Iec101MasterConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
