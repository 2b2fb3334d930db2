//! Pulse Dialer - ausgehende Anrufe an Telefonnummern
//!
//! Verwaltet den Lebenszyklus eines einzelnen ausgehenden Anrufs:
//! - Geräteprüfung (Mikrofon, Lautsprecher) vor dem Wählen
//! - Call-API (`initiate` / `terminate`) per HTTP
//! - Drei Signaling-Backends: reines Audio, WebRTC-Verhandlung, Voice-Provider
//! - Garantierte Freigabe aller Audio- und Verbindungsressourcen

pub mod call_engine;
pub mod config;
pub mod signaling;

pub use call_engine::{
    CallError, CallEvent, CallOrchestrator, CallSession, CallStatus, DeviceState, NumberError,
    TargetNumber,
};
pub use config::{AppConfig, ConfigError};
pub use signaling::Credential;

use call_engine::{CpalPlatform, DeviceProbe, MediaPlatform};
use once_cell::sync::OnceCell;
use signaling::{ApiError, CallApi, HttpCallApi, ProviderConnector, WsProviderConnector};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging (nur beim ersten Aufruf)
///
/// `RUST_LOG` hat Vorrang vor dem konfigurierten Filter.
pub fn init_logging(filter: &str) {
    LOGGING.get_or_init(|| {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(filter))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulse_dialer=info"));

        if tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global subscriber already set, keeping it");
        }
    });
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DialerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Invalid number: {0}")]
    Number(#[from] NumberError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Dialer already initialized")]
    AlreadyInitialized,
}

// ============================================================================
// DIALER
// ============================================================================

/// Fassade für die Oberfläche: Geräteprüfung + Orchestrator
pub struct Dialer {
    probe: Arc<DeviceProbe>,
    orchestrator: Arc<CallOrchestrator>,
}

/// Singleton für den Dialer
static DIALER: OnceCell<Arc<Dialer>> = OnceCell::new();

impl Dialer {
    /// Initialisiert den globalen Dialer
    pub async fn init(config: AppConfig) -> Result<Arc<Self>, DialerError> {
        if DIALER.get().is_some() {
            return Err(DialerError::AlreadyInitialized);
        }

        let dialer = Arc::new(Self::from_config(&config).await?);
        DIALER
            .set(Arc::clone(&dialer))
            .map_err(|_| DialerError::AlreadyInitialized)?;

        Ok(dialer)
    }

    /// Gibt den globalen Dialer zurück
    pub fn get() -> Option<Arc<Self>> {
        DIALER.get().cloned()
    }

    /// Baut den Dialer mit Audio über cpal, HTTP-API und WebSocket-Provider
    pub async fn from_config(config: &AppConfig) -> Result<Self, DialerError> {
        config.validate()?;
        tracing::info!("Initializing dialer against {}", config.api_base_url);

        let media: Arc<dyn MediaPlatform> = Arc::new(CpalPlatform);
        let api = Arc::new(HttpCallApi::new(&config.api_base_url, config.request_timeout())?);
        let connector = Arc::new(WsProviderConnector::new(
            config.provider_url.clone(),
            Arc::clone(&media),
        ));

        Ok(Self::with_parts(config, media, api, connector).await)
    }

    /// Baut den Dialer aus fertigen Komponenten und prüft einmal die Geräte
    pub async fn with_parts(
        config: &AppConfig,
        media: Arc<dyn MediaPlatform>,
        api: Arc<dyn CallApi>,
        connector: Arc<dyn ProviderConnector>,
    ) -> Self {
        let probe = Arc::new(DeviceProbe::new(Arc::clone(&media)));
        let orchestrator = Arc::new(CallOrchestrator::new(
            api,
            Arc::clone(&probe),
            media,
            connector,
            config.orchestrator_settings(),
        ));

        let devices = probe.check().await;
        tracing::info!(
            "Initial device check: microphone={:?} speaker={:?}",
            devices.microphone_ok,
            devices.speaker_ok
        );

        Self {
            probe,
            orchestrator,
        }
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    /// Wählt Ländervorwahl + nationale Nummer
    pub async fn start_call(
        &self,
        dial_code: &str,
        national: &str,
        token: &str,
    ) -> Result<CallSession, DialerError> {
        let target = TargetNumber::from_parts(dial_code, national)?;
        self.dial(target, token).await
    }

    /// Wählt eine vollständige E.164 Nummer
    pub async fn start_call_e164(&self, number: &str, token: &str) -> Result<CallSession, DialerError> {
        let target = TargetNumber::parse(number)?;
        self.dial(target, token).await
    }

    async fn dial(&self, target: TargetNumber, token: &str) -> Result<CallSession, DialerError> {
        self.orchestrator
            .start(target, Credential::new(token))
            .await?;
        Ok(self.orchestrator.session())
    }

    /// Legt auf. `false`, wenn kein Anruf lief.
    pub async fn hang_up(&self) -> bool {
        self.orchestrator.end().await
    }

    pub fn session(&self) -> CallSession {
        self.orchestrator.session()
    }

    pub fn status(&self) -> CallStatus {
        self.orchestrator.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.orchestrator.subscribe()
    }

    /// Abbau beim Schließen der Oberfläche
    pub async fn teardown(&self) {
        self.orchestrator.teardown().await;
    }

    // ========================================================================
    // DEVICES
    // ========================================================================

    pub fn device_state(&self) -> DeviceState {
        self.probe.state()
    }

    pub async fn recheck_devices(&self) -> DeviceState {
        self.probe.recheck().await
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceState> {
        self.probe.subscribe()
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("status", &self.status())
            .field("devices", &self.device_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{FakeApi, FakeConnector, FakeMedia};
    use crate::call_engine::{MediaError, PreconditionError};

    async fn dialer(media: Arc<FakeMedia>, api: Arc<FakeApi>) -> Dialer {
        Dialer::with_parts(&AppConfig::default(), media, api, FakeConnector::new()).await
    }

    #[tokio::test]
    async fn test_initial_device_check_on_construction() {
        let media = FakeMedia::new();
        let dialer = dialer(media.clone(), FakeApi::new()).await;

        let devices = dialer.device_state();
        assert_eq!(devices.microphone_ok, Some(true));
        assert_eq!(devices.speaker_ok, Some(true));
        assert_eq!(media.acquisitions(), 1);
        assert_eq!(dialer.status(), CallStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_call_and_hang_up() {
        let api = FakeApi::new();
        let dialer = dialer(FakeMedia::new(), api.clone()).await;
        let mut events = dialer.subscribe();

        let session = dialer.start_call("+1", "(415) 555-0123", "jwt").await.unwrap();
        assert!(session.status.is_active());
        assert_eq!(
            session.target_number.as_ref().map(TargetNumber::as_str),
            Some("+14155550123")
        );

        loop {
            if let CallEvent::StateChanged(s) = events.recv().await.unwrap() {
                if s.status == CallStatus::Talking {
                    break;
                }
            }
        }

        assert!(dialer.hang_up().await);
        assert_eq!(dialer.status(), CallStatus::Finished);
        assert_eq!(api.terminated(), vec!["call-1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_number_never_reaches_api() {
        let api = FakeApi::new();
        let dialer = dialer(FakeMedia::new(), api.clone()).await;

        let err = dialer.start_call("+49", "1234", "jwt").await.unwrap_err();
        assert!(matches!(err, DialerError::Number(NumberError::TooShort)));

        let err = dialer.start_call_e164("4155550123", "jwt").await.unwrap_err();
        assert!(matches!(err, DialerError::Number(NumberError::MissingCountryCode)));

        assert_eq!(api.initiates(), 0);
        assert_eq!(dialer.status(), CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_blank_token_is_missing_credential() {
        let api = FakeApi::new();
        let dialer = dialer(FakeMedia::new(), api.clone()).await;

        let err = dialer.start_call_e164("+14155550123", "  ").await.unwrap_err();
        assert!(matches!(
            err,
            DialerError::Call(CallError::Precondition(PreconditionError::MissingCredential))
        ));
        assert_eq!(api.initiates(), 0);
    }

    #[tokio::test]
    async fn test_recheck_after_permission_granted() {
        let media = FakeMedia::new();
        media.fail_with(MediaError::PermissionDenied("denied".into()));
        let dialer = dialer(media.clone(), FakeApi::new()).await;
        assert!(dialer.device_state().permission_denied);

        let mut devices = dialer.subscribe_devices();
        media.clear_failure();
        let state = dialer.recheck_devices().await;

        assert_eq!(state.microphone_ok, Some(true));
        assert!(devices.recv().await.unwrap().checking);
        assert_eq!(devices.recv().await.unwrap(), state);
    }

    #[test]
    fn test_init_logging_is_repeatable() {
        init_logging("pulse_dialer=debug");
        init_logging("not a [valid filter");
    }
}
