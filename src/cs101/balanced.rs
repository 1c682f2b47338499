//! CS101 balanced mode: both stations may initiate transfers, so the
//! endpoint acts as primary for its own queue and secondary for the
//! peer's, with FCB state kept per direction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::asdu::Asdu;
use crate::command::CommandSpec;
use crate::cs101::frame::Ft12Frame;
use crate::cs101::link::{LinkChannel, LinkControl, PrimaryFunction, SecondaryFunction};
use crate::cs101::unbalanced::{Iec101MasterConfig, MasterStatus};
use crate::error::{Iec60870Error, Iec60870Result};
use crate::events::{ControlEvent, DataPoint, EventSink};
use crate::transport::Transport;

enum BalancedCommand {
    SendAsdus(Vec<Asdu>),
}

/// IEC 101 balanced endpoint (controlling-station flavor).
pub struct Iec101MasterBalanced {
    config: Iec101MasterConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<MasterStatus>>,
    commands: Mutex<Option<mpsc::Sender<BalancedCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Iec101MasterBalanced {
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

    /// The balanced link needs no activation; provided for API symmetry.
    pub async fn send_start_dt(&self) -> Iec60870Result<()> {
        Ok(())
    }

    /// The balanced link needs no deactivation; provided for API symmetry.
    pub async fn send_stop_dt(&self) -> Iec60870Result<()> {
        Ok(())
    }

    pub async fn send_commands(&self, specs: Vec<CommandSpec>) -> Iec60870Result<()> {
        if !self.status.read().await.connected {
            return Err(Iec60870Error::NotConnected);
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
        let guard = self.commands.lock().await;
        let tx = guard.as_ref().ok_or(Iec60870Error::NotConnected)?;
        tx.try_send(BalancedCommand::SendAsdus(asdus))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => Iec60870Error::NotConnected,
            })
    }

    pub async fn get_status(&self) -> MasterStatus {
        self.status.read().await.clone()
    }
}

/// Our primary-direction send state.
struct SendState {
    queue: VecDeque<Asdu>,
    /// FCB used by the previous confirmed frame
    fcb: bool,
    /// Previous frame acknowledged; the next one toggles FCB
    acked: bool,
    /// A confirmed frame is in flight since this instant
    in_flight: Option<Instant>,
    retries: u8,
}

impl SendState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            fcb: false,
            acked: true,
            in_flight: None,
            retries: 0,
        }
    }

    fn next_fcb(&mut self) -> bool {
        if self.acked {
            self.fcb = !self.fcb;
            self.acked = false;
        }
        self.fcb
    }
}

struct Worker {
    config: Iec101MasterConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<MasterStatus>>,
}

impl Worker {
    async fn run(
        self,
        transport: Box<dyn Transport>,
        mut commands: mpsc::Receiver<BalancedCommand>,
    ) {
        let endpoint = self.config.client_id.clone();
        let mut channel = LinkChannel::new(transport, self.config.link);
        let mut attempt = 0u32;

        while *self.running.read().await {
            match channel.open().await {
                Ok(()) => {
                    info!(peer = %channel.peer(), client_id = %endpoint, "balanced link open");
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
                        .control(&endpoint, ControlEvent::Activated, "balanced link running")
                        .await;

                    let reason = self.session(&mut channel, &mut commands).await;
                    {
                        let mut status = self.status.write().await;
                        status.connected = false;
                        status.activated = false;
                    }
                    match reason {
                        None => {
                            self.sink
                                .control(&endpoint, ControlEvent::Closed, "endpoint stopped")
                                .await;
                            channel.close().await;
                            return;
                        }
                        Some(reason) => {
                            warn!(client_id = %endpoint, %reason, "balanced session ended");
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
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn session(
        &self,
        channel: &mut LinkChannel,
        commands: &mut mpsc::Receiver<BalancedCommand>,
    ) -> Option<String> {
        let own = self.config.link_address;
        let mut send = SendState::new();
        // FCB of the last accepted frame from the peer's primary side.
        let mut peer_fcb: Option<bool> = None;

        // Reset of remote link synchronizes both FCB directions.
        let reset = Ft12Frame::fixed(
            LinkControl::primary(PrimaryFunction::ResetRemoteLink, false, false)
                .with_dir(true)
                .to_byte(),
            own,
        );
        if let Err(e) = channel.send(&reset).await {
            return Some(e.to_string());
        }

        loop {
            if !*self.running.read().await {
                return None;
            }

            loop {
                match commands.try_recv() {
                    Ok(BalancedCommand::SendAsdus(asdus)) => send.queue.extend(asdus),
                    Err(mpsc::error::TryRecvError::Empty)
                    | Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }

            // Retransmission bookkeeping for our confirmed frame in flight.
            if let Some(sent_at) = send.in_flight {
                if sent_at.elapsed() >= Duration::from_millis(self.config.link.timeout_for_ack_ms)
                {
                    send.retries += 1;
                    if send.retries > self.config.link.max_retries {
                        return Some("user data not acknowledged".to_string());
                    }
                    debug!(retries = send.retries, "retransmitting with unchanged FCB");
                    send.in_flight = None;
                }
            }

            if send.in_flight.is_none() {
                if let Some(asdu) = send.queue.front() {
                    let user_data = match asdu.encode(&self.config.app_params) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(error = %e, "unencodable ASDU dropped");
                            send.queue.pop_front();
                            continue;
                        }
                    };
                    let fcb = send.next_fcb();
                    let frame = Ft12Frame::variable(
                        LinkControl::primary(PrimaryFunction::UserDataConfirmed, fcb, true)
                            .with_dir(true)
                            .to_byte(),
                        own,
                        user_data,
                    );
                    if let Err(e) = channel.send(&frame).await {
                        return Some(e.to_string());
                    }
                    send.in_flight = Some(Instant::now());
                }
            }

            let frame = match channel.recv(Duration::from_millis(100)).await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => return Some(e.to_string()),
            };

            match self
                .handle_frame(channel, frame, &mut send, &mut peer_fcb)
                .await
            {
                Ok(()) => {}
                Err(e) => return Some(e.to_string()),
            }
        }
    }

    async fn handle_frame(
        &self,
        channel: &mut LinkChannel,
        frame: Ft12Frame,
        send: &mut SendState,
        peer_fcb: &mut Option<bool>,
    ) -> Iec60870Result<()> {
        let own = self.config.link_address;
        let (control, user_data) = match &frame {
            Ft12Frame::SingleChar => {
                self.note_ack(send);
                return Ok(());
            }
            Ft12Frame::Fixed { control, .. } => (LinkControl::from_byte(*control), None),
            Ft12Frame::Variable {
                control, user_data, ..
            } => (LinkControl::from_byte(*control), Some(user_data.as_slice())),
        };

        if control.prm {
            // Peer acting as primary towards us.
            match control.primary_function() {
                Some(PrimaryFunction::ResetRemoteLink) => {
                    *peer_fcb = None;
                    self.send_ack(channel, own).await?;
                }
                Some(PrimaryFunction::TestFunction) => {
                    self.send_ack(channel, own).await?;
                }
                Some(PrimaryFunction::RequestLinkStatus) => {
                    let status = Ft12Frame::fixed(
                        LinkControl::secondary(SecondaryFunction::StatusOfLink, false, false)
                            .to_byte(),
                        own,
                    );
                    channel.send(&status).await?;
                }
                Some(PrimaryFunction::UserDataConfirmed) => {
                    if control.fcv_dfc && *peer_fcb == Some(control.fcb_acd) {
                        debug!("repeated FCB from peer, acknowledging without dispatch");
                    } else {
                        *peer_fcb = Some(control.fcb_acd);
                        if let Some(data) = user_data {
                            self.deliver(data).await;
                        }
                    }
                    self.send_ack(channel, own).await?;
                }
                Some(PrimaryFunction::UserDataUnconfirmed) => {
                    if let Some(data) = user_data {
                        self.deliver(data).await;
                    }
                }
                _ => debug!(?control, "unsupported primary function ignored"),
            }
        } else {
            // Peer acting as secondary: a response to our request.
            match control.secondary_function() {
                Some(SecondaryFunction::Ack) => self.note_ack(send),
                Some(SecondaryFunction::Nack) | Some(SecondaryFunction::NotFunctioning) => {
                    debug!("negative acknowledgement, will retransmit");
                    send.in_flight = None;
                }
                Some(SecondaryFunction::StatusOfLink) => {
                    debug!("status of link from peer");
                }
                _ => debug!(?control, "unsupported secondary function ignored"),
            }
        }
        Ok(())
    }

    fn note_ack(&self, send: &mut SendState) {
        if send.in_flight.take().is_some() {
            send.queue.pop_front();
            send.acked = true;
            send.retries = 0;
        }
    }

    async fn send_ack(&self, channel: &mut LinkChannel, own: u16) -> Iec60870Result<()> {
        if channel.params().use_single_char_ack {
            channel.send(&Ft12Frame::SingleChar).await
        } else {
            let ack = Ft12Frame::fixed(
                LinkControl::secondary(SecondaryFunction::Ack, false, false).to_byte(),
                own,
            );
            channel.send(&ack).await
        }
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
}
