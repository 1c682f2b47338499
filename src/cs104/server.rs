//! IEC 60870-5-104 controlled station (server).
//!
//! One acceptor task plus one worker task per TCP connection. Events for a
//! connection use the peer's `ip:port` as the endpoint identifier; that
//! same string addresses the connection in [`Iec104Server::send_commands`].
//! Server-level events use the configured `server_id`.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::asdu::Asdu;
use crate::command::{build_grouped_asdus, CommandSpec};
use crate::common::{ApciParameters, AppLayerParameters, Cause};
use crate::cs104::apci::{Apdu, ApduReader, UFrame};
use crate::cs104::connection::ApciEngine;
use crate::error::{Iec60870Error, Iec60870Result};
use crate::events::{ControlEvent, DataPoint, EventSink};
use crate::information::InformationObject;

/// How concurrent connections share the activation right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Every connection is its own redundancy group: any peer may
    /// activate independently.
    Multi,
    /// Named groups with IP allow-lists; at most one activated
    /// connection per group.
    Redundant,
}

/// One redundancy group: a name and the peers allowed into it.
#[derive(Debug, Clone)]
pub struct RedundancyGroupConfig {
    pub name: String,
    pub allowed_ips: Vec<IpAddr>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Iec104ServerConfig {
    pub bind_host: String,
    pub port: u16,
    /// Identifier used in server-level events
    pub server_id: String,
    pub mode: ServerMode,
    pub max_clients: usize,
    /// Bound of each connection's outbound ASDU queue
    pub queue_size: usize,
    /// Common address used when a command spec has no override
    pub asdu_address: u16,
    pub originator_address: u8,
    pub app_params: AppLayerParameters,
    pub apci: ApciParameters,
    /// Mandatory in redundant mode; ignored in multi mode
    pub groups: Vec<RedundancyGroupConfig>,
}

impl Default for Iec104ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 2404,
            server_id: "iec104-server".to_string(),
            mode: ServerMode::Multi,
            max_clients: 10,
            queue_size: 100,
            asdu_address: 1,
            originator_address: 0,
            app_params: AppLayerParameters::default(),
            apci: ApciParameters::default(),
            groups: Vec::new(),
        }
    }
}

impl Iec104ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.port = port;
        self
    }

    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    pub fn with_mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_group(mut self, name: impl Into<String>, allowed_ips: Vec<IpAddr>) -> Self {
        self.groups.push(RedundancyGroupConfig {
            name: name.into(),
            allowed_ips,
        });
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_apci(mut self, apci: ApciParameters) -> Self {
        self.apci = apci;
        self
    }

    pub fn validate(&self) -> Iec60870Result<()> {
        self.app_params.validate()?;
        self.apci.validate()?;
        if self.max_clients == 0 || self.queue_size == 0 {
            return Err(Iec60870Error::Config(
                "max_clients and queue_size must be > 0".to_string(),
            ));
        }
        if self.mode == ServerMode::Redundant {
            // A redundant server without allow-lists would silently degrade
            // to multi semantics, so the groups are mandatory.
            if self.groups.is_empty() {
                return Err(Iec60870Error::Config(
                    "redundant mode requires at least one group with an IP allow-list"
                        .to_string(),
                ));
            }
            let mut names: Vec<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            if names.len() != self.groups.len() {
                return Err(Iec60870Error::Config(
                    "redundancy group names must be unique".to_string(),
                ));
            }
            if self.groups.iter().any(|g| g.allowed_ips.is_empty()) {
                return Err(Iec60870Error::Config(
                    "every redundancy group needs a non-empty IP allow-list".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Snapshot of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub client_id: String,
    pub activated: bool,
    pub group: Option<String>,
}

/// Snapshot of the server.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub running: bool,
    pub server_id: String,
    pub mode: ServerMode,
    pub connections: Vec<ConnectionStatus>,
}

enum ConnCommand {
    SendAsdus(Vec<Asdu>),
    /// The group's activation right passed to this connection
    GrantStart,
}

struct ConnectionEntry {
    tx: mpsc::Sender<ConnCommand>,
    activated: Arc<RwLock<bool>>,
    group: Option<String>,
}

#[derive(Default)]
struct GroupState {
    active: Option<String>,
    waiting: VecDeque<String>,
}

struct Shared {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    groups: Mutex<HashMap<String, GroupState>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// IEC 104 server.
pub struct Iec104Server {
    config: Iec104ServerConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    shared: Arc<Shared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Iec104Server {
    pub fn new(config: Iec104ServerConfig, sink: Arc<dyn EventSink>) -> Iec60870Result<Self> {
        config.validate()?;
        let groups = config
            .groups
            .iter()
            .map(|g| (g.name.clone(), GroupState::default()))
            .collect();
        Ok(Self {
            config,
            sink,
            running: Arc::new(RwLock::new(false)),
            shared: Arc::new(Shared {
                connections: RwLock::new(HashMap::new()),
                groups: Mutex::new(groups),
                workers: Mutex::new(Vec::new()),
            }),
            acceptor: Mutex::new(None),
        })
    }

    /// Bind and start accepting. Binding errors surface synchronously.
    pub async fn start(&self) -> Iec60870Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        let address = format!("{}:{}", self.config.bind_host, self.config.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| Iec60870Error::Connection(format!("bind {address}: {e}")))?;
        *running = true;
        drop(running);

        info!(%address, server_id = %self.config.server_id, "server listening");
        let acceptor = Acceptor {
            config: self.config.clone(),
            sink: self.sink.clone(),
            running: self.running.clone(),
            shared: self.shared.clone(),
        };
        *self.acceptor.lock().await = Some(tokio::spawn(acceptor.run(listener)));
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        if let Some(handle) = self.acceptor.lock().await.take() {
            let _ = handle.await;
        }
        // Workers poll the running flag and exit by themselves.
        let handles: Vec<_> = self.shared.workers.lock().await.drain(..).collect();
        futures::future::join_all(handles).await;
    }

    /// Queue data for the identified peer, grouped by `(type, address)`.
    pub async fn send_commands(
        &self,
        client_id: &str,
        specs: Vec<CommandSpec>,
    ) -> Iec60870Result<()> {
        let asdus = build_grouped_asdus(
            &specs,
            self.config.originator_address,
            self.config.asdu_address,
        )?;
        let connections = self.shared.connections.read().await;
        let entry = connections.get(client_id).ok_or_else(|| {
            Iec60870Error::Connection(format!("no connection from {client_id}"))
        })?;
        if !*entry.activated.read().await {
            return Err(Iec60870Error::NotActivated);
        }
        entry
            .tx
            .try_send(ConnCommand::SendAsdus(asdus))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    Iec60870Error::Connection(format!("connection {client_id} is closing"))
                }
            })
    }

    pub async fn get_status(&self) -> ServerStatus {
        let connections = self.shared.connections.read().await;
        let mut list = Vec::with_capacity(connections.len());
        for (client_id, entry) in connections.iter() {
            list.push(ConnectionStatus {
                client_id: client_id.clone(),
                activated: *entry.activated.read().await,
                group: entry.group.clone(),
            });
        }
        list.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        ServerStatus {
            running: *self.running.read().await,
            server_id: self.config.server_id.clone(),
            mode: self.config.mode,
            connections: list,
        }
    }
}

struct Acceptor {
    config: Iec104ServerConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    shared: Arc<Shared>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            if !*self.running.read().await {
                break;
            }
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = sleep(Duration::from_millis(200)) => continue,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let client_id = peer.to_string();

            if self.shared.connections.read().await.len() >= self.config.max_clients {
                warn!(%client_id, max = self.config.max_clients, "connection refused: server full");
                drop(stream);
                continue;
            }

            let group = match self.config.mode {
                ServerMode::Multi => None,
                ServerMode::Redundant => {
                    match self
                        .config
                        .groups
                        .iter()
                        .find(|g| g.allowed_ips.contains(&peer.ip()))
                    {
                        Some(group) => Some(group.name.clone()),
                        None => {
                            warn!(%client_id, "connection refused: IP not in any redundancy group");
                            drop(stream);
                            continue;
                        }
                    }
                }
            };

            let (tx, rx) = mpsc::channel(self.config.queue_size);
            let activated = Arc::new(RwLock::new(false));
            self.shared.connections.write().await.insert(
                client_id.clone(),
                ConnectionEntry {
                    tx,
                    activated: activated.clone(),
                    group: group.clone(),
                },
            );

            info!(%client_id, ?group, "client connected");
            self.sink
                .control(&client_id, ControlEvent::Opened, "connection accepted")
                .await;

            let worker = ConnectionWorker {
                config: self.config.clone(),
                sink: self.sink.clone(),
                running: self.running.clone(),
                shared: self.shared.clone(),
                client_id,
                group,
                activated,
            };
            let handle = tokio::spawn(worker.run(stream, rx));
            self.shared.workers.lock().await.push(handle);
        }
    }
}

struct ConnectionWorker {
    config: Iec104ServerConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    shared: Arc<Shared>,
    client_id: String,
    group: Option<String>,
    activated: Arc<RwLock<bool>>,
}

impl ConnectionWorker {
    async fn run(self, mut stream: TcpStream, mut commands: mpsc::Receiver<ConnCommand>) {
        let reason = self.session(&mut stream, &mut commands).await;
        debug!(client_id = %self.client_id, %reason, "connection worker exiting");

        self.shared.connections.write().await.remove(&self.client_id);
        self.release_activation().await;
        self.sink
            .control(&self.client_id, ControlEvent::Closed, &reason)
            .await;
    }

    async fn session(
        &self,
        stream: &mut TcpStream,
        commands: &mut mpsc::Receiver<ConnCommand>,
    ) -> String {
        use tokio::io::AsyncReadExt;

        let app_params = self.config.app_params;
        let mut engine = ApciEngine::new(self.config.apci, Instant::now());
        let mut reader = ApduReader::new();
        let mut pending: VecDeque<Asdu> = VecDeque::new();
        let mut start_requested = false;
        let mut buf = [0u8; 1024];

        loop {
            if !*self.running.read().await {
                return "server stopped".to_string();
            }

            loop {
                match commands.try_recv() {
                    Ok(ConnCommand::SendAsdus(asdus)) => pending.extend(asdus),
                    Ok(ConnCommand::GrantStart) => {
                        if start_requested && !engine.started() {
                            start_requested = false;
                            if let Err(reason) = self.activate(&mut engine, stream).await {
                                return reason;
                            }
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty)
                    | Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }

            while engine.can_send_i() {
                let Some(asdu) = pending.pop_front() else {
                    break;
                };
                match engine.make_i_frame(asdu, Instant::now()) {
                    Ok(apdu) => {
                        if let Err(e) = write_apdu(stream, &apdu, &app_params).await {
                            return e.to_string();
                        }
                    }
                    Err(e) => return e.to_string(),
                }
            }

            match engine.poll_timers(Instant::now()) {
                Ok(due) => {
                    for apdu in due {
                        if let Err(e) = write_apdu(stream, &apdu, &app_params).await {
                            return e.to_string();
                        }
                    }
                }
                Err(e) => return e.to_string(),
            }

            match tokio::time::timeout(engine.read_timeout(), stream.read(&mut buf)).await {
                Ok(Ok(0)) => return "client closed connection".to_string(),
                Ok(Ok(n)) => {
                    reader.push(&buf[..n]);
                    while let Some(apdu) = reader.next(&app_params) {
                        match engine.handle(apdu, Instant::now()) {
                            Ok(reaction) => {
                                for out in reaction.send {
                                    if let Err(e) = write_apdu(stream, &out, &app_params).await {
                                        return e.to_string();
                                    }
                                }
                                if let Some(request) = reaction.u_request {
                                    match self
                                        .on_u_request(
                                            request,
                                            &mut engine,
                                            stream,
                                            &mut start_requested,
                                        )
                                        .await
                                    {
                                        Ok(()) => {}
                                        Err(reason) => return reason,
                                    }
                                }
                                if let Some(asdu) = reaction.deliver {
                                    self.dispatch(asdu).await;
                                }
                            }
                            Err(e) => return e.to_string(),
                        }
                    }
                }
                Ok(Err(e)) => return format!("read error: {e}"),
                Err(_) => {}
            }
        }
    }

    /// STARTDT/STOPDT arbitration.
    async fn on_u_request(
        &self,
        request: UFrame,
        engine: &mut ApciEngine,
        stream: &mut TcpStream,
        start_requested: &mut bool,
    ) -> Result<(), String> {
        match request {
            UFrame::StartDtAct => {
                if engine.started() {
                    // Already active: repeat the confirmation.
                    return write_apdu(stream, &Apdu::u_frame(UFrame::StartDtCon), &self.config.app_params)
                        .await
                        .map_err(|e| e.to_string());
                }
                match &self.group {
                    None => self.activate(engine, stream).await,
                    Some(group) => {
                        let granted = {
                            let mut groups = self.shared.groups.lock().await;
                            let state = groups.entry(group.clone()).or_default();
                            match &state.active {
                                None => {
                                    state.active = Some(self.client_id.clone());
                                    true
                                }
                                Some(active) if *active == self.client_id => true,
                                Some(_) => {
                                    if !state.waiting.contains(&self.client_id) {
                                        state.waiting.push_back(self.client_id.clone());
                                    }
                                    false
                                }
                            }
                        };
                        if granted {
                            self.activate(engine, stream).await
                        } else {
                            debug!(
                                client_id = %self.client_id,
                                group = %group,
                                "STARTDT deferred: group already active"
                            );
                            *start_requested = true;
                            Ok(())
                        }
                    }
                }
            }
            UFrame::StopDtAct => {
                if engine.started() && self.group.is_some() {
                    // The handover marker the redundant mode transmits
                    // before confirming the stop.
                    match activation_termination(&self.config) {
                        Ok(asdu) => match engine.make_i_frame(asdu, Instant::now()) {
                            Ok(apdu) => {
                                write_apdu(stream, &apdu, &self.config.app_params)
                                    .await
                                    .map_err(|e| e.to_string())?;
                            }
                            Err(e) => {
                                debug!(error = %e, "activation termination not sent");
                            }
                        },
                        Err(e) => debug!(error = %e, "activation termination not built"),
                    }
                }
                engine.set_started(false);
                *self.activated.write().await = false;
                write_apdu(stream, &Apdu::u_frame(UFrame::StopDtCon), &self.config.app_params)
                    .await
                    .map_err(|e| e.to_string())?;
                self.sink
                    .control(&self.client_id, ControlEvent::Deactivated, "STOPDT received")
                    .await;
                self.release_activation().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn activate(
        &self,
        engine: &mut ApciEngine,
        stream: &mut TcpStream,
    ) -> Result<(), String> {
        write_apdu(stream, &Apdu::u_frame(UFrame::StartDtCon), &self.config.app_params)
            .await
            .map_err(|e| e.to_string())?;
        engine.set_started(true);
        *self.activated.write().await = true;
        self.sink
            .control(&self.client_id, ControlEvent::Activated, "STARTDT confirmed")
            .await;
        Ok(())
    }

    /// Give up the group's active slot (if held) and wake the next waiter.
    async fn release_activation(&self) {
        let Some(group) = &self.group else {
            return;
        };
        let next = {
            let mut groups = self.shared.groups.lock().await;
            let Some(state) = groups.get_mut(group) else {
                return;
            };
            state.waiting.retain(|id| *id != self.client_id);
            if state.active.as_deref() != Some(self.client_id.as_str()) {
                return;
            }
            state.active = None;
            state.waiting.pop_front()
        };
        if let Some(next_id) = next {
            // Transfer the slot before waking the waiter so a racing
            // STARTDT cannot sneak in between.
            {
                let mut groups = self.shared.groups.lock().await;
                if let Some(state) = groups.get_mut(group) {
                    state.active = Some(next_id.clone());
                }
            }
            let connections = self.shared.connections.read().await;
            if let Some(entry) = connections.get(&next_id) {
                if entry.tx.try_send(ConnCommand::GrantStart).is_err() {
                    warn!(client_id = %next_id, "could not wake waiting peer");
                }
            }
        }
    }

    async fn dispatch(&self, asdu: Asdu) {
        self.sink
            .data(&self.client_id, DataPoint::from_asdu(&asdu))
            .await;
    }
}

/// C_IC_NA_1 with COT activation-termination, the redundant-mode marker
/// sent when the active peer deactivates.
fn activation_termination(config: &Iec104ServerConfig) -> Iec60870Result<Asdu> {
    Asdu::new(
        Cause::ActivationTermination,
        config.originator_address,
        config.asdu_address,
        vec![InformationObject::InterrogationCommand { ioa: 0, qoi: 20 }],
    )
}

async fn write_apdu(
    stream: &mut TcpStream,
    apdu: &Apdu,
    params: &AppLayerParameters,
) -> Iec60870Result<()> {
    use tokio::io::AsyncWriteExt;
    let bytes = apdu.encode(params)?;
    stream.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TypeId;

    #[test]
    fn redundant_mode_requires_groups() {
        let config = Iec104ServerConfig {
            mode: ServerMode::Redundant,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Iec60870Error::Config(_))
        ));

        let with_group = config.with_group("G", vec!["127.0.0.1".parse().unwrap()]);
        assert!(with_group.validate().is_ok());
    }

    #[test]
    fn group_names_must_be_unique() {
        let config = Iec104ServerConfig {
            mode: ServerMode::Redundant,
            ..Default::default()
        }
        .with_group("G", vec!["10.0.0.1".parse().unwrap()])
        .with_group("G", vec!["10.0.0.2".parse().unwrap()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_allow_list_is_rejected() {
        let config = Iec104ServerConfig {
            mode: ServerMode::Redundant,
            ..Default::default()
        }
        .with_group("G", vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn activation_termination_shape() {
        let asdu = activation_termination(&Iec104ServerConfig::default()).unwrap();
        assert_eq!(asdu.type_id, TypeId::InterrogationCommand);
        assert_eq!(asdu.cot.cause, Cause::ActivationTermination);
    }

    #[test]
    fn multi_mode_ignores_groups() {
        assert!(Iec104ServerConfig::default().validate().is_ok());
    }
}
