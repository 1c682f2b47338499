//! IEC 60870-5-104 controlling station (client).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::asdu::Asdu;
use crate::command::{CommandSpec, CommandValue};
use crate::common::{ApciParameters, AppLayerParameters, Cause, TypeId};
use crate::cs104::apci::{Apdu, ApduReader, UFrame};
use crate::cs104::connection::ApciEngine;
use crate::error::{Iec60870Error, Iec60870Result};
use crate::events::{ControlEvent, DataPoint, EventSink};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct Iec104ClientConfig {
    /// Server hostname or IP address
    pub host: String,
    /// Server TCP port
    pub port: u16,
    /// Identifier used in every event this client emits
    pub client_id: String,
    /// Common address used for commands without an explicit override
    pub asdu_address: u16,
    /// Originator address placed in outgoing ASDUs
    pub originator_address: u8,
    pub app_params: AppLayerParameters,
    pub apci: ApciParameters,
    /// Delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Reconnection attempts before giving up
    pub max_retries: u32,
    /// Bound of the outbound ASDU queue
    pub queue_size: usize,
    /// Send a station interrogation automatically after each activation
    pub initial_interrogation: bool,
}

impl Default for Iec104ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2404,
            client_id: "iec104-client".to_string(),
            asdu_address: 1,
            originator_address: 0,
            app_params: AppLayerParameters::default(),
            apci: ApciParameters::default(),
            reconnect_delay: Duration::from_secs(5),
            max_retries: 10,
            queue_size: 100,
            initial_interrogation: false,
        }
    }
}

impl Iec104ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn with_asdu_address(mut self, address: u16) -> Self {
        self.asdu_address = address;
        self
    }

    pub fn with_apci(mut self, apci: ApciParameters) -> Self {
        self.apci = apci;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_interrogation(mut self, on: bool) -> Self {
        self.initial_interrogation = on;
        self
    }

    pub fn validate(&self) -> Iec60870Result<()> {
        self.app_params.validate()?;
        self.apci.validate()?;
        if self.queue_size == 0 {
            return Err(Iec60870Error::Config("queue_size must be > 0".to_string()));
        }
        if self.reconnect_delay < Duration::from_secs(1) {
            return Err(Iec60870Error::Config(
                "reconnect_delay must be at least one second".to_string(),
            ));
        }
        if self.asdu_address == 0 {
            return Err(Iec60870Error::Config(
                "asdu_address must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of the client.
#[derive(Debug, Clone, Default)]
pub struct ClientStatus {
    pub connected: bool,
    pub activated: bool,
    pub client_id: String,
    pub last_error: String,
}

enum WorkerCommand {
    SendAsdus(Vec<Asdu>),
    StartDt,
    StopDt,
}

/// How one TCP session ended.
enum SessionEnd {
    /// `disconnect()` was called
    Graceful,
    /// The transport or the protocol failed; reconnect may follow
    Broken(String),
}

/// IEC 104 client: one worker task owning the socket, reconnecting per
/// policy, reporting through the event sink.
pub struct Iec104Client {
    config: Iec104ClientConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<ClientStatus>>,
    commands: Mutex<Option<mpsc::Sender<WorkerCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Iec104Client {
    pub fn new(config: Iec104ClientConfig, sink: Arc<dyn EventSink>) -> Iec60870Result<Self> {
        config.validate()?;
        let status = ClientStatus {
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

    /// Spawn the connection worker. Transport failures do not surface
    /// here; they drive the reconnect loop and the event sink.
    pub async fn connect(&self) -> Iec60870Result<()> {
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
        let handle = tokio::spawn(worker.run(rx));
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    /// Graceful shutdown: STOPDT if activated, close, join the worker.
    pub async fn disconnect(&self) {
        *self.running.write().await = false;
        *self.commands.lock().await = None;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Request STARTDT activation. The `activated` event follows the CON.
    pub async fn send_start_dt(&self) -> Iec60870Result<()> {
        self.send_worker_command(WorkerCommand::StartDt).await
    }

    /// Request STOPDT. The `deactivated` event follows the CON.
    pub async fn send_stop_dt(&self) -> Iec60870Result<()> {
        if !self.status.read().await.activated {
            return Err(Iec60870Error::NotActivated);
        }
        self.send_worker_command(WorkerCommand::StopDt).await
    }

    /// Validate all commands, then enqueue one ASDU per command.
    /// Nothing is enqueued when any entry is invalid.
    pub async fn send_commands(&self, specs: Vec<CommandSpec>) -> Iec60870Result<()> {
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
        self.send_worker_command(WorkerCommand::SendAsdus(asdus)).await
    }

    pub async fn get_status(&self) -> ClientStatus {
        self.status.read().await.clone()
    }

    async fn send_worker_command(&self, command: WorkerCommand) -> Iec60870Result<()> {
        let guard = self.commands.lock().await;
        let tx = guard.as_ref().ok_or(Iec60870Error::NotConnected)?;
        tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Iec60870Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Iec60870Error::NotConnected,
        })
    }
}

struct Worker {
    config: Iec104ClientConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    status: Arc<RwLock<ClientStatus>>,
}

impl Worker {
    async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let endpoint = self.config.client_id.clone();
        let mut attempt = 0u32;

        while *self.running.read().await {
            let address = format!("{}:{}", self.config.host, self.config.port);
            let t0 = Duration::from_secs(self.config.apci.t0 as u64);
            match tokio::time::timeout(t0, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => {
                    info!(%address, client_id = %endpoint, "connected");
                    attempt = 0;
                    self.set_status(|s| {
                        s.connected = true;
                        s.last_error.clear();
                    })
                    .await;
                    self.sink
                        .control(&endpoint, ControlEvent::Opened, "connection established")
                        .await;

                    let end = self.session(stream, &mut commands).await;
                    self.set_status(|s| {
                        s.connected = false;
                        s.activated = false;
                    })
                    .await;
                    match end {
                        SessionEnd::Graceful => {
                            self.sink
                                .control(&endpoint, ControlEvent::Closed, "client closed connection")
                                .await;
                            break;
                        }
                        SessionEnd::Broken(reason) => {
                            warn!(client_id = %endpoint, %reason, "session ended");
                            self.set_status(|s| s.last_error = reason.clone()).await;
                            self.sink
                                .control(&endpoint, ControlEvent::Closed, &reason)
                                .await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.set_status(|s| s.last_error = e.to_string()).await;
                    debug!(%address, error = %e, "connect failed");
                }
                Err(_) => {
                    self.set_status(|s| s.last_error = "connect timed out (t0)".to_string())
                        .await;
                    debug!(%address, "connect timed out");
                }
            }

            if !*self.running.read().await {
                break;
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
                break;
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

    /// Drive one TCP session until it breaks or the client is stopped.
    async fn session(
        &self,
        mut stream: TcpStream,
        commands: &mut mpsc::Receiver<WorkerCommand>,
    ) -> SessionEnd {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let endpoint = self.config.client_id.clone();
        let app_params = self.config.app_params;
        let mut engine = ApciEngine::new(self.config.apci, Instant::now());
        let mut reader = ApduReader::new();
        let mut pending: VecDeque<Asdu> = VecDeque::new();
        let mut buf = [0u8; 1024];

        loop {
            if !*self.running.read().await {
                // Graceful shutdown: best-effort STOPDT before closing.
                if engine.started() {
                    let apdu = Apdu::u_frame(UFrame::StopDtAct);
                    if let Ok(bytes) = apdu.encode(&app_params) {
                        let _ = stream.write_all(&bytes).await;
                    }
                }
                let _ = stream.shutdown().await;
                return SessionEnd::Graceful;
            }

            // Host requests.
            loop {
                match commands.try_recv() {
                    Ok(WorkerCommand::SendAsdus(asdus)) => pending.extend(asdus),
                    Ok(WorkerCommand::StartDt) => {
                        match engine.make_u_act(UFrame::StartDtAct, Instant::now()) {
                            Ok(apdu) => {
                                if let Err(e) = write_apdu(&mut stream, &apdu, &app_params).await {
                                    return SessionEnd::Broken(e.to_string());
                                }
                            }
                            Err(e) => warn!(error = %e, "STARTDT not sent"),
                        }
                    }
                    Ok(WorkerCommand::StopDt) => {
                        match engine.make_u_act(UFrame::StopDtAct, Instant::now()) {
                            Ok(apdu) => {
                                if let Err(e) = write_apdu(&mut stream, &apdu, &app_params).await {
                                    return SessionEnd::Broken(e.to_string());
                                }
                            }
                            Err(e) => warn!(error = %e, "STOPDT not sent"),
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }

            // Drain the queue into the window.
            while engine.can_send_i() {
                let Some(asdu) = pending.pop_front() else {
                    break;
                };
                match engine.make_i_frame(asdu, Instant::now()) {
                    Ok(apdu) => {
                        if let Err(e) = write_apdu(&mut stream, &apdu, &app_params).await {
                            return SessionEnd::Broken(e.to_string());
                        }
                    }
                    Err(e) => return SessionEnd::Broken(e.to_string()),
                }
            }

            // Timer sweep.
            match engine.poll_timers(Instant::now()) {
                Ok(due) => {
                    for apdu in due {
                        if let Err(e) = write_apdu(&mut stream, &apdu, &app_params).await {
                            return SessionEnd::Broken(e.to_string());
                        }
                    }
                }
                Err(e) => return SessionEnd::Broken(e.to_string()),
            }

            // Bounded read.
            match tokio::time::timeout(engine.read_timeout(), stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return SessionEnd::Broken("server closed connection or timeout".to_string())
                }
                Ok(Ok(n)) => {
                    reader.push(&buf[..n]);
                    while let Some(apdu) = reader.next(&app_params) {
                        match engine.handle(apdu, Instant::now()) {
                            Ok(reaction) => {
                                for out in reaction.send {
                                    if let Err(e) =
                                        write_apdu(&mut stream, &out, &app_params).await
                                    {
                                        return SessionEnd::Broken(e.to_string());
                                    }
                                }
                                if let Some(confirmed) = reaction.u_confirmed {
                                    self.on_u_confirmed(confirmed, &mut pending).await;
                                }
                                if let Some(asdu) = reaction.deliver {
                                    self.dispatch(&endpoint, asdu).await;
                                }
                            }
                            Err(e) => return SessionEnd::Broken(e.to_string()),
                        }
                    }
                }
                Ok(Err(e)) => return SessionEnd::Broken(format!("read error: {e}")),
                Err(_) => {}
            }
        }
    }

    async fn on_u_confirmed(&self, confirmed: UFrame, pending: &mut VecDeque<Asdu>) {
        let endpoint = &self.config.client_id;
        match confirmed {
            UFrame::StartDtCon => {
                self.set_status(|s| s.activated = true).await;
                self.sink
                    .control(endpoint, ControlEvent::Activated, "STARTDT confirmed")
                    .await;
                if self.config.initial_interrogation {
                    match station_interrogation(&self.config) {
                        Ok(asdu) => pending.push_back(asdu),
                        Err(e) => warn!(error = %e, "station interrogation not queued"),
                    }
                }
            }
            UFrame::StopDtCon => {
                self.set_status(|s| s.activated = false).await;
                self.sink
                    .control(endpoint, ControlEvent::Deactivated, "STOPDT confirmed")
                    .await;
            }
            _ => {}
        }
    }

    async fn dispatch(&self, endpoint: &str, asdu: Asdu) {
        if asdu.type_id.is_monitoring() || asdu.type_id.is_command() {
            self.sink.data(endpoint, DataPoint::from_asdu(&asdu)).await;
        } else {
            debug!(
                type_id = ?asdu.type_id,
                cot = %asdu.cot,
                "system ASDU not dispatched"
            );
        }
    }

    async fn set_status(&self, update: impl FnOnce(&mut ClientStatus)) {
        update(&mut *self.status.write().await);
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

/// The automatic station interrogation queued after activation.
fn station_interrogation(config: &Iec104ClientConfig) -> Iec60870Result<Asdu> {
    let spec = CommandSpec::new(
        TypeId::InterrogationCommand,
        0,
        CommandValue::Int(20),
    )
    .with_cause(Cause::Activation);
    Asdu::new(
        spec.effective_cause(),
        config.originator_address,
        config.asdu_address,
        vec![spec.to_object()?],
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
    use crate::information::InformationObject;

    #[test]
    fn config_validation() {
        assert!(Iec104ClientConfig::default().validate().is_ok());

        let bad_queue = Iec104ClientConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(bad_queue.validate().is_err());

        let bad_delay = Iec104ClientConfig {
            reconnect_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(bad_delay.validate().is_err());
    }

    #[test]
    fn station_interrogation_shape() {
        let asdu = station_interrogation(&Iec104ClientConfig::default()).unwrap();
        assert_eq!(asdu.type_id, TypeId::InterrogationCommand);
        assert_eq!(asdu.cot.cause, Cause::Activation);
        assert_eq!(asdu.common_address, 1);
        assert_eq!(
            asdu.objects,
            vec![InformationObject::InterrogationCommand { ioa: 0, qoi: 20 }]
        );
    }

    #[tokio::test]
    async fn send_commands_requires_connection() {
        let (sink, _rx) = crate::events::ChannelSink::new();
        let client =
            Iec104Client::new(Iec104ClientConfig::default(), Arc::new(sink)).unwrap();
        let err = client
            .send_commands(vec![CommandSpec::new(TypeId::SingleCommand, 1, true)])
            .await;
        assert!(matches!(err, Err(Iec60870Error::NotConnected)));
    }
}
