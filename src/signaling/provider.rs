//! Managed Voice Provider
//!
//! Der Provider kapselt Signaling und Medien komplett: wir registrieren ein
//! Gerät mit dem Token aus `initiate`, starten den Anruf über `connect` und
//! bekommen Lebenszyklus-Events zurück. Das Mikrofon fordert die
//! Provider-Session selbst an.
//!
//! `WsProviderDevice` spricht das Provider-Protokoll über WebSocket:
//! - Registrierung mit Timeout
//! - Anruf anlegen/auflegen
//! - Pegel-Meldungen während des Anrufs

use super::backend::{BackendEvent, EstablishmentError, Established, EventSink, SessionHandle};
use super::messages::*;
use crate::call_engine::{
    AudioConstraints, BackendKind, HardwareGate, LocalMediaStream, MediaError, MediaPlatform,
    ResourceCleanupGuard, SessionObject, TargetNumber,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Intervall der Pegel-Meldungen
const VOLUME_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to voice provider")]
    NotConnected,

    #[error("Device is not registered")]
    NotRegistered,

    #[error("Device has been destroyed")]
    Destroyed,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Call setup failed: {0}")]
    ConnectFailed(String),

    #[error("No provider response during {0}")]
    Timeout(&'static str),

    #[error("Provider error: {code} - {message}")]
    Server { code: i32, message: String },

    #[error(transparent)]
    Media(#[from] MediaError),
}

// ============================================================================
// PROVIDER EVENTS
// ============================================================================

/// Events eines Provider-Geräts
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Registrierung erfolgreich
    Registered,
    /// Gegenseite hat angenommen
    Accepted,
    /// Pegel (0.0 - 1.0)
    Volume { input: f32, output: f32 },
    /// Anruf beendet
    Disconnected,
    /// Fehler vom Provider
    Error { code: i32, message: String },
}

// ============================================================================
// DEVICE ABSTRACTION
// ============================================================================

/// Geräte-Optionen für die Registrierung
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOptions {
    pub codec_preferences: Vec<Codec>,
    pub max_average_bitrate: u32,
    pub register_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            codec_preferences: vec![Codec::Opus, Codec::Pcmu],
            max_average_bitrate: 32000,
            register_timeout: Duration::from_secs(10),
        }
    }
}

/// Ein Provider-Gerät (eine Registrierung, höchstens ein Anruf)
#[async_trait]
pub trait ProviderDevice: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    async fn register(&self) -> Result<(), ProviderError>;

    /// Startet den Anruf; kehrt zurück, sobald der Provider ihn angelegt hat
    async fn connect(
        &self,
        params: ConnectParams,
        constraints: AudioConstraints,
    ) -> Result<(), ProviderError>;

    /// Legt auf (idempotent)
    async fn disconnect(&self);

    /// Zerstört das Gerät und gibt alles frei (idempotent)
    async fn destroy(&self);
}

/// Erzeugt Geräte für ein Provider-Token
pub trait ProviderConnector: Send + Sync {
    fn create_device(&self, token: &str, options: DeviceOptions) -> Arc<dyn ProviderDevice>;
}

// ============================================================================
// MANAGED PROVIDER BACKEND
// ============================================================================

/// Provider-Gerät als Ressource des Cleanup Guards
struct ProviderSession(Arc<dyn ProviderDevice>);

#[async_trait]
impl SessionObject for ProviderSession {
    fn describe(&self) -> String {
        "provider device".to_string()
    }

    async fn close(&self) {
        self.0.destroy().await;
    }
}

pub struct ManagedProviderBackend {
    connector: Arc<dyn ProviderConnector>,
    gate: HardwareGate,
    token: String,
    options: DeviceOptions,
}

impl ManagedProviderBackend {
    pub fn new(
        connector: Arc<dyn ProviderConnector>,
        gate: HardwareGate,
        token: String,
        options: DeviceOptions,
    ) -> Self {
        Self {
            connector,
            gate,
            token,
            options,
        }
    }

    pub async fn establish(
        &self,
        target: &TargetNumber,
        guard: &ResourceCleanupGuard,
    ) -> Result<Established, EstablishmentError> {
        let device = self.connector.create_device(&self.token, self.options.clone());
        // Vor register abonnieren, sonst gehen frühe Events verloren
        let provider_events = device.subscribe();
        guard
            .adopt_session(Arc::new(ProviderSession(Arc::clone(&device))))
            .await?;

        {
            // Keine Device-Probe, solange der Provider das Mikrofon anfordert
            let _hardware = self.gate.exclusive().await;
            device.register().await?;
            device
                .connect(
                    ConnectParams {
                        to: target.as_str().to_string(),
                    },
                    AudioConstraints::unprocessed(),
                )
                .await?;
        }

        let (sink, events) = EventSink::channel();
        tokio::spawn(forward_provider_events(provider_events, sink.clone()));

        tracing::info!("Provider call to {} created", target);
        Ok(Established {
            handle: SessionHandle::new(BackendKind::ManagedProvider, &sink).with_provider(device),
            events,
        })
    }
}

/// Übersetzt Provider-Events in Backend-Events
///
/// Remote-Audio wird beim Annehmen gemeldet, spätestens aber mit dem ersten
/// Pegel-Event.
async fn forward_provider_events(mut rx: broadcast::Receiver<ProviderEvent>, sink: EventSink) {
    let mut remote_surfaced = false;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Provider event stream lagged, skipped {}", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if sink.is_terminated() {
            break;
        }

        match event {
            ProviderEvent::Registered => {}
            ProviderEvent::Accepted => {
                sink.emit(BackendEvent::Accepted);
                if !std::mem::replace(&mut remote_surfaced, true) {
                    sink.emit(BackendEvent::RemoteMediaAvailable);
                }
            }
            ProviderEvent::Volume { input, output } => {
                if !std::mem::replace(&mut remote_surfaced, true) {
                    sink.emit(BackendEvent::RemoteMediaAvailable);
                }
                sink.emit(BackendEvent::AudioLevel { input, output });
            }
            ProviderEvent::Disconnected => {
                sink.emit(BackendEvent::Disconnected);
                break;
            }
            ProviderEvent::Error { code, message } => {
                sink.emit(BackendEvent::Errored(format!("{} ({})", message, code)));
                break;
            }
        }
    }
}

// ============================================================================
// WEBSOCKET DEVICE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct DeviceSessionState {
    registered: bool,
    destroyed: bool,
    identity: Option<String>,
    call_sid: Option<String>,
}

/// Provider-Gerät über WebSocket
pub struct WsProviderDevice {
    server_url: String,
    token: String,
    options: DeviceOptions,
    media: Arc<dyn MediaPlatform>,
    state: Arc<RwLock<DeviceSessionState>>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    replies: tokio::sync::Mutex<Option<mpsc::Receiver<ProviderMessage>>>,
    event_tx: broadcast::Sender<ProviderEvent>,
    audio: Arc<Mutex<Option<LocalMediaStream>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsProviderDevice {
    pub fn new(
        server_url: String,
        token: String,
        options: DeviceOptions,
        media: Arc<dyn MediaPlatform>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            token,
            options,
            media,
            state: Arc::new(RwLock::new(DeviceSessionState::default())),
            tx: Mutex::new(None),
            replies: tokio::sync::Mutex::new(None),
            event_tx,
            audio: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Identität nach erfolgreicher Registrierung
    pub fn identity(&self) -> Option<String> {
        self.state.read().identity.clone()
    }

    /// Sendet eine Nachricht über den Write-Task
    async fn send(&self, request: ProviderRequest) -> Result<(), ProviderError> {
        let tx = self.tx.lock().clone().ok_or(ProviderError::NotConnected)?;
        let text =
            serde_json::to_string(&request).map_err(|e| ProviderError::SendFailed(e.to_string()))?;

        tx.send(text)
            .await
            .map_err(|e| ProviderError::SendFailed(e.to_string()))
    }

    /// Wartet auf die nächste Antwort (registered, call_created oder error)
    async fn await_reply(&self, phase: &'static str) -> Result<ProviderMessage, ProviderError> {
        let mut replies = self.replies.lock().await;
        let replies = replies.as_mut().ok_or(ProviderError::NotConnected)?;

        tokio::select! {
            reply = replies.recv() => match reply {
                Some(ProviderMessage::Error { code, message }) => {
                    Err(ProviderError::Server { code, message })
                }
                Some(msg) => Ok(msg),
                None => Err(ProviderError::ConnectionFailed(format!(
                    "connection closed during {}",
                    phase
                ))),
            },
            _ = tokio::time::sleep(self.options.register_timeout) => {
                Err(ProviderError::Timeout(phase))
            }
        }
    }

    fn stop_audio(audio: &Mutex<Option<LocalMediaStream>>) {
        if let Some(mut stream) = audio.lock().take() {
            stream.stop();
        }
    }

    /// Meldet regelmäßig den Pegel des Provider-Mikrofons
    fn start_volume_ticker(&self) {
        let audio = Arc::clone(&self.audio);
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(VOLUME_INTERVAL);
            loop {
                interval.tick().await;
                let level = audio.lock().as_ref().map(|s| s.level());
                let Some(input) = level else {
                    break;
                };
                // Das Protokoll liefert keinen Ausgabepegel
                let _ = event_tx.send(ProviderEvent::Volume { input, output: 0.0 });
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Verarbeitet eingehende Provider-Nachrichten
    fn handle_provider_message(
        msg: ProviderMessage,
        state: &RwLock<DeviceSessionState>,
        audio: &Mutex<Option<LocalMediaStream>>,
        event_tx: &broadcast::Sender<ProviderEvent>,
        reply_tx: &mpsc::Sender<ProviderMessage>,
    ) {
        match msg {
            ProviderMessage::Registered { ref identity } => {
                tracing::info!("Provider device registered as {:?}", identity);
                {
                    let mut s = state.write();
                    s.registered = true;
                    s.identity = identity.clone();
                }
                let _ = reply_tx.try_send(msg);
                let _ = event_tx.send(ProviderEvent::Registered);
            }

            ProviderMessage::CallCreated { ref call_sid } => {
                tracing::info!("Provider call {} created", call_sid);
                state.write().call_sid = Some(call_sid.clone());
                let _ = reply_tx.try_send(msg);
            }

            ProviderMessage::Accept { call_sid } => {
                tracing::info!("Provider call {} accepted", call_sid);
                let _ = event_tx.send(ProviderEvent::Accepted);
            }

            ProviderMessage::Disconnect { call_sid } => {
                tracing::info!("Provider call {:?} disconnected", call_sid);
                state.write().call_sid = None;
                Self::stop_audio(audio);
                let _ = event_tx.send(ProviderEvent::Disconnected);
            }

            ProviderMessage::Error { code, ref message } => {
                tracing::error!("Provider error {}: {}", code, message);
                Self::stop_audio(audio);
                let _ = event_tx.send(ProviderEvent::Error {
                    code,
                    message: message.clone(),
                });
                let _ = reply_tx.try_send(msg);
            }
        }
    }
}

#[async_trait]
impl ProviderDevice for WsProviderDevice {
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.event_tx.subscribe()
    }

    async fn register(&self) -> Result<(), ProviderError> {
        if self.state.read().destroyed {
            return Err(ProviderError::Destroyed);
        }

        tracing::info!("Connecting to voice provider: {}", self.server_url);

        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.lock() = Some(tx);

        // Channel für Antworten auf register/connect
        let (reply_tx, reply_rx) = mpsc::channel::<ProviderMessage>(8);
        *self.replies.lock().await = Some(reply_rx);

        // Read-Task starten
        let state = Arc::clone(&self.state);
        let audio = Arc::clone(&self.audio);
        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ProviderMessage>(&text) {
                            Ok(msg) => {
                                Self::handle_provider_message(msg, &state, &audio, &event_tx, &reply_tx)
                            }
                            Err(e) => tracing::warn!("Ignoring provider message: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Provider closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Provider WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Ohne Verbindung kein Anruf
            let had_call = {
                state.write().call_sid.take().is_some()
            };
            Self::stop_audio(&audio);
            if had_call {
                let _ = event_tx.send(ProviderEvent::Disconnected);
            }
        });

        // Write-Task starten (endet, sobald der Sender gedroppt wird)
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send provider message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.tasks.lock().push(reader);

        self.send(ProviderRequest::Register {
            token: self.token.clone(),
            codec_preferences: self.options.codec_preferences.clone(),
            max_average_bitrate: self.options.max_average_bitrate,
        })
        .await?;

        match self.await_reply("registration").await? {
            ProviderMessage::Registered { .. } => Ok(()),
            other => Err(ProviderError::RegistrationFailed(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    }

    async fn connect(
        &self,
        params: ConnectParams,
        constraints: AudioConstraints,
    ) -> Result<(), ProviderError> {
        {
            let state = self.state.read();
            if state.destroyed {
                return Err(ProviderError::Destroyed);
            }
            if !state.registered {
                return Err(ProviderError::NotRegistered);
            }
        }

        let stream = self.media.acquire_audio(constraints).await?;
        if let Some(mut previous) = self.audio.lock().replace(stream) {
            previous.stop();
        }

        let result = match self
            .send(ProviderRequest::Connect {
                params,
                rtc_constraints: RtcConstraints { audio: constraints },
            })
            .await
        {
            Ok(()) => self.await_reply("call setup").await,
            Err(e) => Err(e),
        };

        match result {
            Ok(ProviderMessage::CallCreated { .. }) => {
                self.start_volume_ticker();
                Ok(())
            }
            Ok(other) => {
                Self::stop_audio(&self.audio);
                Err(ProviderError::ConnectFailed(format!("unexpected reply {:?}", other)))
            }
            Err(e) => {
                Self::stop_audio(&self.audio);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        let call_sid = self.state.write().call_sid.take();
        if let Some(call_sid) = call_sid {
            tracing::info!("Hanging up provider call {}", call_sid);
            if let Err(e) = self
                .send(ProviderRequest::Disconnect {
                    call_sid: Some(call_sid),
                })
                .await
            {
                tracing::warn!("Failed to send hangup: {}", e);
            }
        }
        Self::stop_audio(&self.audio);
    }

    async fn destroy(&self) {
        if std::mem::replace(&mut self.state.write().destroyed, true) {
            return;
        }
        self.disconnect().await;

        // Sender droppen beendet den Write-Task, der schließt den Socket
        self.tx.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::debug!("Provider device destroyed");
    }
}

impl std::fmt::Debug for WsProviderDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsProviderDevice")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Erzeugt `WsProviderDevice`s für einen Provider-Endpoint
pub struct WsProviderConnector {
    server_url: String,
    media: Arc<dyn MediaPlatform>,
}

impl WsProviderConnector {
    pub fn new(server_url: impl Into<String>, media: Arc<dyn MediaPlatform>) -> Self {
        Self {
            server_url: server_url.into(),
            media,
        }
    }
}

impl ProviderConnector for WsProviderConnector {
    fn create_device(&self, token: &str, options: DeviceOptions) -> Arc<dyn ProviderDevice> {
        Arc::new(WsProviderDevice::new(
            self.server_url.clone(),
            token.to_string(),
            options,
            Arc::clone(&self.media),
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{FakeConnector, FakeMedia, ProviderScript};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    fn target() -> TargetNumber {
        TargetNumber::parse("+14155550123").unwrap()
    }

    /// Minimaler Provider-Server: beantwortet register/connect/disconnect
    async fn spawn_provider(answer_register: bool) -> (String, JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seen = Vec::new();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let value: Value = serde_json::from_str(&text).unwrap();
                seen.push(value.clone());

                let replies = match value["type"].as_str() {
                    Some("register") if answer_register => {
                        vec![json!({"type": "registered", "identity": "agent"})]
                    }
                    Some("connect") => vec![
                        json!({"type": "call_created", "callSid": "CA1"}),
                        json!({"type": "accept", "callSid": "CA1"}),
                    ],
                    Some("disconnect") => vec![json!({"type": "disconnect", "callSid": "CA1"})],
                    _ => Vec::new(),
                };
                for reply in replies {
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            seen
        });

        (format!("ws://{}", addr), server)
    }

    #[tokio::test]
    async fn test_ws_device_call_flow() {
        let (url, server) = spawn_provider(true).await;
        let media = FakeMedia::new();
        let device = WsProviderDevice::new(url, "tok".into(), DeviceOptions::default(), media.clone());
        let mut events = device.subscribe();

        device.register().await.unwrap();
        assert_eq!(device.identity().as_deref(), Some("agent"));

        device
            .connect(
                ConnectParams {
                    to: target().as_str().to_string(),
                },
                AudioConstraints::unprocessed(),
            )
            .await
            .unwrap();
        assert_eq!(media.live_streams(), 1);

        loop {
            if events.recv().await.unwrap() == ProviderEvent::Accepted {
                break;
            }
        }

        device.disconnect().await;
        assert_eq!(media.live_streams(), 0);
        device.destroy().await;
        device.destroy().await;

        let seen = server.await.unwrap();
        assert_eq!(seen[0]["type"], "register");
        assert_eq!(seen[0]["token"], "tok");
        assert_eq!(seen[0]["codecPreferences"], json!(["opus", "pcmu"]));
        assert_eq!(seen[0]["maxAverageBitrate"], 32000);
        assert_eq!(seen[1]["type"], "connect");
        assert_eq!(seen[1]["params"]["To"], "+14155550123");
        assert_eq!(seen[1]["rtcConstraints"]["audio"]["echoCancellation"], false);
        assert_eq!(seen[2]["type"], "disconnect");
        assert_eq!(seen[2]["callSid"], "CA1");
    }

    #[tokio::test]
    async fn test_configured_bitrate_reaches_register() {
        let (url, server) = spawn_provider(true).await;
        let config = crate::config::AppConfig {
            max_average_bitrate: 24000,
            ..Default::default()
        };
        let device = WsProviderDevice::new(url, "tok".into(), config.device_options(), FakeMedia::new());

        device.register().await.unwrap();
        device.destroy().await;

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["maxAverageBitrate"], 24000);
        assert_eq!(seen[0]["codecPreferences"], json!(["opus", "pcmu"]));
    }

    #[tokio::test]
    async fn test_ws_device_registration_timeout() {
        let (url, _server) = spawn_provider(false).await;
        let options = DeviceOptions {
            register_timeout: Duration::from_millis(200),
            ..DeviceOptions::default()
        };
        let device = WsProviderDevice::new(url, "tok".into(), options, FakeMedia::new());

        let err = device.register().await.unwrap_err();
        assert_eq!(err, ProviderError::Timeout("registration"));
        device.destroy().await;
    }

    #[tokio::test]
    async fn test_ws_device_connection_refused() {
        let device = WsProviderDevice::new(
            "ws://127.0.0.1:9".into(),
            "tok".into(),
            DeviceOptions::default(),
            FakeMedia::new(),
        );
        let err = device.register().await.unwrap_err();
        assert!(matches!(err, ProviderError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_registration() {
        let media = FakeMedia::new();
        let device = WsProviderDevice::new("ws://unused".into(), "tok".into(), DeviceOptions::default(), media.clone());
        let err = device
            .connect(ConnectParams { to: "+1".into() }, AudioConstraints::unprocessed())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::NotRegistered);
        assert_eq!(media.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_backend_translates_provider_events() {
        let connector = FakeConnector::new();
        let backend = ManagedProviderBackend::new(
            connector.clone(),
            HardwareGate::new(),
            "jwt".into(),
            DeviceOptions::default(),
        );
        let guard = ResourceCleanupGuard::new("managed");

        let mut established = backend.establish(&target(), &guard).await.unwrap();
        let device = connector.last_device().unwrap();
        assert_eq!(device.token(), "jwt");
        assert_eq!(device.connected_to().as_deref(), Some("+14155550123"));
        assert!(guard.holds_session());

        device.emit(ProviderEvent::Accepted);
        device.emit(ProviderEvent::Volume { input: 0.5, output: 0.25 });
        device.emit(ProviderEvent::Disconnected);

        let mut received = Vec::new();
        while let Some(event) = established.events.recv().await {
            received.push(event);
            if received.len() == 4 {
                break;
            }
        }
        assert_eq!(
            received,
            vec![
                BackendEvent::Accepted,
                BackendEvent::RemoteMediaAvailable,
                BackendEvent::AudioLevel { input: 0.5, output: 0.25 },
                BackendEvent::Disconnected,
            ]
        );

        assert!(established.handle.terminate().await);
        assert_eq!(device.disconnects(), 1);
        guard.release_all().await;
        assert_eq!(device.destroys(), 1);
    }

    #[tokio::test]
    async fn test_backend_registration_failure_keeps_device_with_guard() {
        let connector = FakeConnector::with_script(ProviderScript::FailRegister);
        let backend = ManagedProviderBackend::new(
            connector.clone(),
            HardwareGate::new(),
            "jwt".into(),
            DeviceOptions::default(),
        );
        let guard = ResourceCleanupGuard::new("managed");

        let err = backend.establish(&target(), &guard).await.unwrap_err();
        assert!(matches!(err, EstablishmentError::Provider(ProviderError::RegistrationFailed(_))));
        assert!(guard.holds_session());

        guard.release_all().await;
        assert_eq!(connector.last_device().unwrap().destroys(), 1);
    }
}
