//! Device Probe - Prüfung der Audio-Hardware vor einem Anruf
//!
//! Fordert kurz ein Mikrofon an, gibt es sofort wieder frei und zählt die
//! Ausgabegeräte. Das Ergebnis (`DeviceState`) ist die Vorbedingung für
//! `CallOrchestrator::start`.

use super::audio::{AudioConstraints, MediaError, MediaPlatform};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};

// ============================================================================
// DEVICE STATE
// ============================================================================

/// Snapshot der Hardware-Fähigkeiten
///
/// `None` bei den Tri-State-Feldern bedeutet "noch nicht geprüft".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub microphone_ok: Option<bool>,
    pub speaker_ok: Option<bool>,
    pub permission_denied: bool,
    pub checking: bool,
    pub last_error: Option<String>,
}

impl DeviceState {
    /// Mikrofon ist bekanntermaßen unbrauchbar
    pub fn microphone_blocked(&self) -> bool {
        self.microphone_ok == Some(false)
    }

    fn unsupported() -> Self {
        Self {
            microphone_ok: Some(false),
            speaker_ok: None,
            permission_denied: false,
            checking: false,
            last_error: Some(MediaError::Unsupported.to_string()),
        }
    }

    fn failed(err: &MediaError) -> Self {
        Self {
            microphone_ok: Some(false),
            speaker_ok: None,
            permission_denied: err.is_permission_denied(),
            checking: false,
            last_error: Some(err.to_string()),
        }
    }
}

// ============================================================================
// HARDWARE GATE
// ============================================================================

/// Exklusiver Zugriff auf die Audio-Hardware
///
/// Wird von der Probe während ihrer kurzen Anforderung gehalten und vom
/// Managed-Provider-Backend während register/connect, weil dessen Session
/// das Mikrofon selbst anfordert.
#[derive(Debug, Clone, Default)]
pub struct HardwareGate {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl HardwareGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn exclusive(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner).lock_owned().await
    }
}

// ============================================================================
// DEVICE PROBE
// ============================================================================

/// Prüft Mikrofon und Lautsprecher
pub struct DeviceProbe {
    platform: Arc<dyn MediaPlatform>,
    state: Arc<Mutex<DeviceState>>,
    latest_run: AtomicU64,
    gate: HardwareGate,
    event_tx: broadcast::Sender<DeviceState>,
}

impl DeviceProbe {
    pub fn new(platform: Arc<dyn MediaPlatform>) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            platform,
            state: Arc::new(Mutex::new(DeviceState::default())),
            latest_run: AtomicU64::new(0),
            gate: HardwareGate::new(),
            event_tx,
        }
    }

    /// Gibt einen Receiver für Zustandsänderungen zurück
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceState> {
        self.event_tx.subscribe()
    }

    /// Letzter bekannter Zustand
    pub fn state(&self) -> DeviceState {
        self.state.lock().clone()
    }

    /// Gate, das mit dem Managed-Provider-Backend geteilt wird
    pub fn gate(&self) -> HardwareGate {
        self.gate.clone()
    }

    /// Führt die Prüfung aus
    ///
    /// Ein neuer Aufruf während eine Prüfung läuft ersetzt diese: nur das
    /// Ergebnis des zuletzt gestarteten Laufs wird übernommen.
    pub async fn check(&self) -> DeviceState {
        let run = self.latest_run.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.platform.media_api_available() {
            tracing::warn!("Media device APIs not available on this platform");
            return self.publish(run, DeviceState::unsupported());
        }

        self.publish(
            run,
            DeviceState {
                checking: true,
                permission_denied: false,
                last_error: None,
                ..self.state()
            },
        );

        let acquired = {
            let _hardware = self.gate.exclusive().await;
            match self.platform.acquire_audio(AudioConstraints::default()).await {
                Ok(mut stream) => {
                    // Sofort wieder freigeben, bevor das Ergebnis gemeldet wird
                    stream.stop();
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        let result = match acquired {
            Ok(()) => {
                let speaker_ok = match self.platform.output_devices().await {
                    Ok(devices) => !devices.is_empty(),
                    Err(e) => {
                        tracing::warn!("Output enumeration failed: {}", e);
                        false
                    }
                };
                DeviceState {
                    microphone_ok: Some(true),
                    speaker_ok: Some(speaker_ok),
                    permission_denied: false,
                    checking: false,
                    last_error: None,
                }
            }
            Err(e) => {
                tracing::warn!("Microphone check failed: {}", e);
                DeviceState::failed(&e)
            }
        };

        self.publish(run, result)
    }

    /// Erneute Prüfung (z.B. nachdem der Benutzer die Berechtigung erteilt hat)
    pub async fn recheck(&self) -> DeviceState {
        self.check().await
    }

    /// Übernimmt den Zustand nur, wenn `run` der neueste Lauf ist
    fn publish(&self, run: u64, next: DeviceState) -> DeviceState {
        if self.latest_run.load(Ordering::SeqCst) != run {
            tracing::debug!("Discarding result of superseded device check #{}", run);
            return self.state();
        }

        *self.state.lock() = next.clone();
        let _ = self.event_tx.send(next.clone());
        next
    }
}

impl std::fmt::Debug for DeviceProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProbe")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
