//! Signaling Backends
//!
//! Wie ein Anruf tatsächlich aufgebaut wird, entscheidet die Antwort von
//! `initiate`. Die drei Varianten teilen sich eine Schnittstelle
//! (`establish` → `SessionHandle` + Event-Stream), der Orchestrator
//! unterscheidet nach dem Aufbau nicht mehr zwischen ihnen.

use super::api::ApiError;
use super::messages::{IceServer, InitiateResponse};
use super::peer::PeerNegotiationBackend;
use super::provider::{DeviceOptions, ManagedProviderBackend, ProviderConnector, ProviderDevice, ProviderError};
use crate::call_engine::{
    AudioConstraints, BackendKind, CleanupError, HardwareGate, MediaError, MediaPlatform,
    ResourceCleanupGuard, TargetNumber,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler beim Aufbau einer Session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstablishmentError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Microphone unavailable: {0}")]
    Media(#[from] MediaError),

    #[error("Peer negotiation failed: {0}")]
    Negotiation(String),

    #[error("Voice provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Resource handling failed: {0}")]
    Resources(#[from] CleanupError),
}

// ============================================================================
// BACKEND EVENTS
// ============================================================================

/// Lebenszyklus-Events nach erfolgreichem Aufbau
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Gegenseite hat angenommen / Verbindung steht
    Accepted,
    /// Remote-Audio ist verfügbar
    RemoteMediaAvailable,
    /// Pegel (0.0 - 1.0)
    AudioLevel { input: f32, output: f32 },
    /// Verbindung von der Gegenseite beendet
    Disconnected,
    /// Laufzeitfehler nach dem Aufbau
    Errored(String),
}

/// Sender-Seite des Event-Streams einer Session
///
/// Nach `terminate` werden keine Events mehr weitergegeben.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BackendEvent>,
    terminated: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                terminated: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: BackendEvent) {
        if self.is_terminated() {
            tracing::debug!("Dropping {:?} from terminated session", event);
            return;
        }
        let _ = self.tx.send(event);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SESSION HANDLE
// ============================================================================

/// Handle auf eine aufgebaute Session
///
/// `terminate` legt nur auf; die Ressourcen gibt ausschließlich der
/// `ResourceCleanupGuard` frei.
pub struct SessionHandle {
    kind: BackendKind,
    terminated: Arc<AtomicBool>,
    provider: Option<Arc<dyn ProviderDevice>>,
    local_description: Option<String>,
}

impl SessionHandle {
    pub fn new(kind: BackendKind, sink: &EventSink) -> Self {
        Self {
            kind,
            terminated: Arc::clone(&sink.terminated),
            provider: None,
            local_description: None,
        }
    }

    pub fn with_provider(mut self, device: Arc<dyn ProviderDevice>) -> Self {
        self.provider = Some(device);
        self
    }

    pub fn with_local_description(mut self, sdp: String) -> Self {
        self.local_description = Some(sdp);
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Lokale SDP Answer (nur Peer-Verhandlung)
    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Legt auf (idempotent). Gibt `true` zurück, wenn dies der erste Aufruf war.
    pub async fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Terminating {:?} session", self.kind);
        if let Some(device) = &self.provider {
            device.disconnect().await;
        }
        true
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("kind", &self.kind)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Ergebnis von `establish`
#[derive(Debug)]
pub struct Established {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

// ============================================================================
// RAW MEDIA BACKEND
// ============================================================================

/// Nur lokales Audio, keine Verhandlung mit der Gegenseite
///
/// Der einzige Austausch mit dem Backend ist `initiate` selbst; danach gilt
/// der Anruf sofort als angenommen.
pub struct RawMediaBackend {
    media: Arc<dyn MediaPlatform>,
}

impl RawMediaBackend {
    pub fn new(media: Arc<dyn MediaPlatform>) -> Self {
        Self { media }
    }

    pub async fn establish(
        &self,
        target: &TargetNumber,
        guard: &ResourceCleanupGuard,
    ) -> Result<Established, EstablishmentError> {
        let stream = self.media.acquire_audio(AudioConstraints::default()).await?;
        guard.adopt_stream(stream)?;

        let (sink, events) = EventSink::channel();
        sink.emit(BackendEvent::Accepted);

        tracing::info!("Raw media session to {} ready", target);
        Ok(Established {
            handle: SessionHandle::new(BackendKind::RawMedia, &sink),
            events,
        })
    }
}

// ============================================================================
// BACKEND SELECTION
// ============================================================================

/// Gemeinsame Abhängigkeiten aller Backends
#[derive(Clone)]
pub struct BackendContext {
    pub media: Arc<dyn MediaPlatform>,
    pub connector: Arc<dyn ProviderConnector>,
    pub gate: HardwareGate,
    pub ice_servers: Vec<IceServer>,
    pub device_options: DeviceOptions,
}

/// Tagged Union über die Backend-Varianten
pub enum SignalingBackend {
    RawMedia(RawMediaBackend),
    PeerNegotiation(PeerNegotiationBackend),
    ManagedProvider(ManagedProviderBackend),
}

impl SignalingBackend {
    /// Wählt das Backend anhand der `initiate`-Antwort
    ///
    /// Provider-Credential vor Verhandlungsparametern vor reinem Audio.
    pub fn select(response: &InitiateResponse, ctx: &BackendContext) -> Self {
        if let Some(token) = response.provider_credential() {
            return SignalingBackend::ManagedProvider(ManagedProviderBackend::new(
                Arc::clone(&ctx.connector),
                ctx.gate.clone(),
                token.to_string(),
                ctx.device_options.clone(),
            ));
        }

        if let Some(offer) = response.negotiation_offer() {
            let ice_servers = response
                .ice_servers
                .clone()
                .filter(|servers| !servers.is_empty())
                .unwrap_or_else(|| ctx.ice_servers.clone());
            return SignalingBackend::PeerNegotiation(PeerNegotiationBackend::new(
                Arc::clone(&ctx.media),
                offer.to_string(),
                ice_servers,
            ));
        }

        SignalingBackend::RawMedia(RawMediaBackend::new(Arc::clone(&ctx.media)))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            SignalingBackend::RawMedia(_) => BackendKind::RawMedia,
            SignalingBackend::PeerNegotiation(_) => BackendKind::PeerNegotiation,
            SignalingBackend::ManagedProvider(_) => BackendKind::ManagedProvider,
        }
    }

    /// Baut die Session auf. Alle erworbenen Ressourcen landen im `guard`,
    /// auch wenn der Aufbau danach fehlschlägt.
    pub async fn establish(
        &self,
        target: &TargetNumber,
        guard: &ResourceCleanupGuard,
    ) -> Result<Established, EstablishmentError> {
        match self {
            SignalingBackend::RawMedia(backend) => backend.establish(target, guard).await,
            SignalingBackend::PeerNegotiation(backend) => backend.establish(target, guard).await,
            SignalingBackend::ManagedProvider(backend) => backend.establish(target, guard).await,
        }
    }
}

impl std::fmt::Debug for SignalingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignalingBackend::{:?}", self.kind())
    }
}

// ============================================================================
// TESTS
// ============================================================================
