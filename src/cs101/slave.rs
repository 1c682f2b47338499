//! CS101 controlled station (slave): a secondary answering the primary's
//! polls from class-1 and class-2 priority queues.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::asdu::Asdu;
use crate::command::{build_grouped_asdus, CommandSpec};
use crate::common::{AppLayerParameters, LinkLayerParameters, TypeId};
use crate::cs101::frame::Ft12Frame;
use crate::cs101::link::{LinkChannel, LinkControl, PrimaryFunction, SecondaryFunction};
use crate::error::{Iec60870Error, Iec60870Result};
use crate::events::{ControlEvent, DataPoint, EventSink};
use crate::transport::Transport;

/// Slave configuration.
#[derive(Debug, Clone)]
pub struct Iec101SlaveConfig {
    /// Own link address
    pub link_address: u16,
    /// Identifier used in events
    pub slave_id: String,
    /// Common address used when a spec has no override
    pub asdu_address: u16,
    pub originator_address: u8,
    pub link: LinkLayerParameters,
    pub app_params: AppLayerParameters,
    /// Bound of each of the class-1 and class-2 queues
    pub queue_size: usize,
}

impl Default for Iec101SlaveConfig {
    fn default() -> Self {
        Self {
            link_address: 1,
            slave_id: "iec101-slave".to_string(),
            asdu_address: 1,
            originator_address: 0,
            link: LinkLayerParameters::default(),
            app_params: AppLayerParameters::default(),
            queue_size: 100,
        }
    }
}

impl Iec101SlaveConfig {
    pub fn validate(&self) -> Iec60870Result<()> {
        self.link.validate()?;
        self.app_params.validate()?;
        if self.queue_size == 0 {
            return Err(Iec60870Error::Config("queue_size must be > 0".to_string()));
        }
        if self.link.address_length <= 1 && self.link_address > 0xFF {
            return Err(Iec60870Error::Config(format!(
                "link address {} does not fit a one-byte address field",
                self.link_address
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of the slave.
#[derive(Debug, Clone, Default)]
pub struct SlaveStatus {
    pub running: bool,
    pub connected: bool,
    pub slave_id: String,
    pub last_error: String,
}

enum SlaveCommand {
    Enqueue(Vec<Asdu>),
}

/// IEC 101 slave.
pub struct Iec101Slave {
    config: Iec101SlaveConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<SlaveStatus>>,
    commands: Mutex<Option<mpsc::Sender<SlaveCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Iec101Slave {
    pub fn new(config: Iec101SlaveConfig, sink: Arc<dyn EventSink>) -> Iec60870Result<Self> {
        config.validate()?;
        let status = SlaveStatus {
            slave_id: config.slave_id.clone(),
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

    /// Take ownership of the transport and start answering polls.
    pub async fn start(&self, transport: Box<dyn Transport>) -> Iec60870Result<()> {
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
        self.status.write().await.running = true;
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        *self.commands.lock().await = None;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.status.write().await.running = false;
    }

    /// Queue monitoring data (or command mirrors) for collection by the
    /// master. Specs are grouped by `(type, address)` into single ASDUs.
    pub async fn send_commands(&self, specs: Vec<CommandSpec>) -> Iec60870Result<()> {
        if !*self.running.read().await {
            return Err(Iec60870Error::NotConnected);
        }
        let asdus = build_grouped_asdus(
            &specs,
            self.config.originator_address,
            self.config.asdu_address,
        )?;
        let guard = self.commands.lock().await;
        let tx = guard.as_ref().ok_or(Iec60870Error::NotConnected)?;
        tx.try_send(SlaveCommand::Enqueue(asdus)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Iec60870Error::NotConnected,
        })
    }

    pub async fn get_status(&self) -> SlaveStatus {
        self.status.read().await.clone()
    }
}

/// Class-1 events take timed types and command mirrors; plain measurands
/// wait in class 2.
fn is_class1(type_id: TypeId) -> bool {
    type_id.is_command() || type_id.is_system() || type_id.has_cp56() || type_id.has_cp24()
}

struct Worker {
    config: Iec101SlaveConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<SlaveStatus>>,
}

impl Worker {
    async fn run(self, transport: Box<dyn Transport>, mut commands: mpsc::Receiver<SlaveCommand>) {
        let endpoint = self.config.slave_id.clone();
        let mut channel = LinkChannel::new(transport, self.config.link);
        if let Err(e) = channel.open().await {
            self.status.write().await.last_error = e.to_string();
            self.sink
                .control(&endpoint, ControlEvent::Failed, &e.to_string())
                .await;
            *self.running.write().await = false;
            return;
        }
        self.status.write().await.connected = true;
        self.sink
            .control(&endpoint, ControlEvent::Opened, "transport opened")
            .await;

        let mut class1: VecDeque<Asdu> = VecDeque::new();
        let mut class2: VecDeque<Asdu> = VecDeque::new();
        // FCB of the last accepted confirmed frame and the response it
        // got, replayed when the primary retransmits. Reset clears both.
        let mut last_fcb: Option<bool> = None;
        let mut last_reply: Option<Ft12Frame> = None;
        let mut busy_reported = false;

        let reason = loop {
            if !*self.running.read().await {
                break "slave stopped".to_string();
            }

            // Host data moves into the class queues between polls.
            loop {
                match commands.try_recv() {
                    Ok(SlaveCommand::Enqueue(asdus)) => {
                        for asdu in asdus {
                            let queue = if is_class1(asdu.type_id) {
                                &mut class1
                            } else {
                                &mut class2
                            };
                            if queue.len() >= self.config.queue_size {
                                if !busy_reported {
                                    busy_reported = true;
                                    self.sink
                                        .control(
                                            &endpoint,
                                            ControlEvent::Busy,
                                            "link layer busy",
                                        )
                                        .await;
                                }
                                warn!("class queue full, oldest entry dropped");
                                queue.pop_front();
                            } else {
                                busy_reported = false;
                            }
                            queue.push_back(asdu);
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty)
                    | Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }

            let frame = match channel.recv(Duration::from_millis(100)).await {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => break e.to_string(),
            };

            let (control, address, user_data) = match &frame {
                Ft12Frame::SingleChar => continue,
                Ft12Frame::Fixed { control, address } => (*control, *address, None),
                Ft12Frame::Variable {
                    control,
                    address,
                    user_data,
                } => (*control, *address, Some(user_data.as_slice())),
            };
            if self.config.link.address_length > 0 && address != self.config.link_address {
                continue;
            }
            let control = LinkControl::from_byte(control);
            let Some(function) = control.primary_function() else {
                debug!(?control, "non-primary frame ignored");
                continue;
            };

            if function == PrimaryFunction::ResetRemoteLink {
                last_fcb = None;
                last_reply = None;
            } else if control.fcv_dfc {
                if last_fcb == Some(control.fcb_acd) {
                    debug!("repeated FCB, replaying the previous response");
                    if let Some(reply) = &last_reply {
                        if let Err(e) = channel.send(reply).await {
                            break e.to_string();
                        }
                    }
                    continue;
                }
                last_fcb = Some(control.fcb_acd);
            }

            match self
                .answer(function, user_data, &mut class1, &mut class2)
                .await
            {
                Ok(Some(reply)) => {
                    if let Err(e) = channel.send(&reply).await {
                        break e.to_string();
                    }
                    if control.fcv_dfc {
                        last_reply = Some(reply);
                    }
                }
                Ok(None) => {}
                Err(e) => break e.to_string(),
            }
        };

        self.status.write().await.connected = false;
        channel.close().await;
        self.sink
            .control(&endpoint, ControlEvent::Closed, &reason)
            .await;
    }

    /// Produce the reply for one primary request. Reset and FCB handling
    /// happen in the receive loop; this only builds the response.
    async fn answer(
        &self,
        function: PrimaryFunction,
        user_data: Option<&[u8]>,
        class1: &mut VecDeque<Asdu>,
        class2: &mut VecDeque<Asdu>,
    ) -> Iec60870Result<Option<Ft12Frame>> {
        let own = self.config.link_address;
        let acd = !class1.is_empty();
        let reply = match function {
            PrimaryFunction::ResetRemoteLink | PrimaryFunction::TestFunction => {
                Some(self.ack_frame())
            }
            PrimaryFunction::RequestLinkStatus => Some(Ft12Frame::fixed(
                LinkControl::secondary(SecondaryFunction::StatusOfLink, acd, false).to_byte(),
                own,
            )),
            PrimaryFunction::UserDataConfirmed => {
                if let Some(data) = user_data {
                    self.deliver(data).await;
                }
                Some(self.ack_frame())
            }
            PrimaryFunction::UserDataUnconfirmed => {
                if let Some(data) = user_data {
                    self.deliver(data).await;
                }
                None
            }
            PrimaryFunction::RequestClass1 => Some(self.serve_queue(class1, class2, true)?),
            PrimaryFunction::RequestClass2 => Some(self.serve_queue(class2, class1, false)?),
        };
        Ok(reply)
    }

    /// Answer a class poll from `queue`; `other` only matters for the ACD
    /// bit advertising pending class-1 data.
    fn serve_queue(
        &self,
        queue: &mut VecDeque<Asdu>,
        other: &VecDeque<Asdu>,
        serving_class1: bool,
    ) -> Iec60870Result<Ft12Frame> {
        let own = self.config.link_address;
        match queue.pop_front() {
            Some(asdu) => {
                let user_data = asdu.encode(&self.config.app_params)?;
                let class1_left = if serving_class1 {
                    !queue.is_empty()
                } else {
                    !other.is_empty()
                };
                Ok(Ft12Frame::variable(
                    LinkControl::secondary(SecondaryFunction::UserData, class1_left, false)
                        .to_byte(),
                    own,
                    user_data,
                ))
            }
            None => {
                let class1_left = if serving_class1 {
                    false
                } else {
                    !other.is_empty()
                };
                Ok(Ft12Frame::fixed(
                    LinkControl::secondary(SecondaryFunction::NackNoData, class1_left, false)
                        .to_byte(),
                    own,
                ))
            }
        }
    }

    fn ack_frame(&self) -> Ft12Frame {
        if self.config.link.use_single_char_ack {
            Ft12Frame::SingleChar
        } else {
            Ft12Frame::fixed(
                LinkControl::secondary(SecondaryFunction::Ack, false, false).to_byte(),
                self.config.link_address,
            )
        }
    }

    /// Dispatch a received command ASDU to the host.
    async fn deliver(&self, user_data: &[u8]) {
        if Asdu::peek_type(user_data).is_none() {
            debug!("user data with unsupported type id not dispatched");
            return;
        }
        match Asdu::decode(&self.config.app_params, user_data) {
            Ok(asdu) => {
                info!(type_id = ?asdu.type_id, cot = %asdu.cot, "command received");
                self.sink
                    .data(&self.config.slave_id, DataPoint::from_asdu(&asdu))
                    .await;
            }
            Err(e) => debug!(error = %e, "undecodable user data dropped"),
        }
    }
}
