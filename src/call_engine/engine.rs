//! Call Orchestrator
//!
//! Zustandsmaschine eines ausgehenden Anrufs:
//!
//! ```text
//! Idle → Connecting → Talking → Finished ─(Haltezeit)→ Idle
//!            └──────────┴──→ Failed ────(Haltezeit)→ Idle
//! ```
//!
//! Der Orchestrator prüft die Vorbedingungen, meldet den Anruf beim Backend
//! an, wählt anhand der Antwort das Signaling-Backend und übersetzt dessen
//! Events in Statusübergänge. Freigegeben wird ausschließlich über den
//! `ResourceCleanupGuard` der jeweiligen Session.

use super::cleanup::ResourceCleanupGuard;
use super::devices::DeviceProbe;
use super::session::{CallSession, CallStatus, TargetNumber};
use super::MediaPlatform;
use crate::signaling::{
    BackendContext, BackendEvent, CallApi, Credential, DeviceOptions, EstablishmentError,
    Established, IceServer, ProviderConnector, SessionHandle, SignalingBackend,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vorbedingung für `start` nicht erfüllt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("Microphone access was denied")]
    PermissionDenied,

    #[error("Microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    #[error("Not signed in")]
    MissingCredential,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("A call is already in progress")]
    AlreadyActive,

    #[error(transparent)]
    Establishment(#[from] EstablishmentError),

    #[error("Call was ended before it was established")]
    Cancelled,
}

// ============================================================================
// EVENTS & SETTINGS
// ============================================================================

/// Events für UI-Subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Neuer Snapshot der Session
    StateChanged(CallSession),
    /// Remote-Audio ist verfügbar
    RemoteMedia,
    /// Pegel (0.0 - 1.0)
    AudioLevel { input: f32, output: f32 },
    /// Benutzerrelevanter Fehler
    Error(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Anzeigedauer von Finished/Failed vor dem Reset auf Idle
    pub hold_period: Duration,
    /// Fallback, wenn die Backend-Antwort keine ICE Server enthält
    pub ice_servers: Vec<IceServer>,
    pub device_options: DeviceOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            hold_period: Duration::from_millis(2000),
            ice_servers: crate::signaling::default_ice_servers(),
            device_options: DeviceOptions::default(),
        }
    }
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

struct ActiveCall {
    handle: SessionHandle,
    guard: Arc<ResourceCleanupGuard>,
    credential: Credential,
    call_id: String,
    pump: AbortHandle,
}

enum Phase {
    /// Kein Anruf (auch während der Haltezeit)
    Idle,
    /// `initiate` + `establish` laufen
    Establishing {
        cancel: Arc<AtomicBool>,
        settled: watch::Receiver<bool>,
    },
    Active(ActiveCall),
    /// Teardown läuft; `closed` wird `true`, sobald alles freigegeben ist
    Closing { closed: watch::Receiver<bool> },
}

struct Inner {
    session: CallSession,
    /// Wird bei jedem Start erhöht; Events älterer Sessions werden verworfen
    generation: u64,
    phase: Phase,
    pending_reset: Option<AbortHandle>,
}

/// Wie eine Session endet
struct Outcome {
    status: CallStatus,
    error: Option<String>,
}

impl Outcome {
    fn finished() -> Self {
        Self {
            status: CallStatus::Finished,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            status: CallStatus::Failed,
            error: Some(error),
        }
    }
}

struct Shared {
    api: Arc<dyn CallApi>,
    backends: BackendContext,
    hold_period: Duration,
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL ORCHESTRATOR
// ============================================================================

pub struct CallOrchestrator {
    shared: Arc<Shared>,
    probe: Arc<DeviceProbe>,
}

impl CallOrchestrator {
    /// Erstellt einen Orchestrator
    ///
    /// Das Managed-Provider-Backend teilt sich das Hardware-Gate der Probe.
    pub fn new(
        api: Arc<dyn CallApi>,
        probe: Arc<DeviceProbe>,
        media: Arc<dyn MediaPlatform>,
        connector: Arc<dyn ProviderConnector>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        let backends = BackendContext {
            media,
            connector,
            gate: probe.gate(),
            ice_servers: settings.ice_servers,
            device_options: settings.device_options,
        };

        Self {
            shared: Arc::new(Shared {
                api,
                backends,
                hold_period: settings.hold_period,
                inner: Mutex::new(Inner {
                    session: CallSession::idle(),
                    generation: 0,
                    phase: Phase::Idle,
                    pending_reset: None,
                }),
                event_tx,
            }),
            probe,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Snapshot der aktuellen Session
    pub fn session(&self) -> CallSession {
        self.shared.inner.lock().session.clone()
    }

    pub fn status(&self) -> CallStatus {
        self.shared.inner.lock().session.status
    }

    /// Startet einen Anruf
    ///
    /// Alle Vorbedingungen werden vor dem ersten `.await` geprüft. Kehrt
    /// zurück, sobald die Session aufgebaut ist (Connecting oder Talking)
    /// oder der Aufbau endgültig gescheitert ist.
    pub async fn start(
        &self,
        target: TargetNumber,
        credential: Option<Credential>,
    ) -> Result<(), CallError> {
        let credential = credential.ok_or(PreconditionError::MissingCredential)?;

        let devices = self.probe.state();
        if devices.microphone_blocked() {
            return Err(if devices.permission_denied {
                PreconditionError::PermissionDenied
            } else {
                PreconditionError::MicrophoneUnavailable(
                    devices.last_error.unwrap_or_else(|| "unknown error".to_string()),
                )
            }
            .into());
        }

        let (generation, cancel, settled_tx) = {
            let mut inner = self.shared.inner.lock();
            if inner.session.status.is_active() || !matches!(inner.phase, Phase::Idle) {
                return Err(CallError::AlreadyActive);
            }

            // Neuer Anruf während der Haltezeit ersetzt den Reset
            if let Some(reset) = inner.pending_reset.take() {
                reset.abort();
            }

            let cancel = Arc::new(AtomicBool::new(false));
            let (settled_tx, settled_rx) = watch::channel(false);

            inner.generation += 1;
            inner.session = CallSession::connecting(target.clone());
            inner.phase = Phase::Establishing {
                cancel: Arc::clone(&cancel),
                settled: settled_rx,
            };
            self.shared.emit_state(&inner);

            (inner.generation, cancel, settled_tx)
        };

        tracing::info!("Starting call #{} to {}", generation, target);

        let shared = Arc::clone(&self.shared);
        let attempt = tokio::spawn(async move {
            let result = shared
                .run_attempt(generation, target, credential, cancel)
                .await;
            let _ = settled_tx.send(true);
            result
        });

        match attempt.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Call attempt #{} aborted: {}", generation, e);
                Err(CallError::Cancelled)
            }
        }
    }

    /// Beendet den aktuellen Anruf
    ///
    /// Während des Aufbaus wird abgebrochen, sobald die laufende Operation
    /// zurückkehrt. Läuft bereits ein Abbau, wird auf dessen Ende gewartet.
    /// Gibt `false` zurück, wenn dieser Aufruf keinen Anruf beendet hat.
    pub async fn end(&self) -> bool {
        enum Step {
            AwaitSettle(watch::Receiver<bool>),
            Close(u64, ActiveCall, watch::Sender<bool>),
            AwaitClose(watch::Receiver<bool>),
            Nothing,
        }

        let step = {
            let mut inner = self.shared.inner.lock();
            let generation = inner.generation;
            match std::mem::replace(&mut inner.phase, Phase::Idle) {
                Phase::Establishing { cancel, settled } => {
                    cancel.store(true, Ordering::SeqCst);
                    inner.phase = Phase::Establishing {
                        cancel,
                        settled: settled.clone(),
                    };
                    Step::AwaitSettle(settled)
                }
                Phase::Active(active) => {
                    let (closed_tx, closed) = watch::channel(false);
                    inner.phase = Phase::Closing { closed };
                    Step::Close(generation, active, closed_tx)
                }
                Phase::Closing { closed } => {
                    inner.phase = Phase::Closing {
                        closed: closed.clone(),
                    };
                    Step::AwaitClose(closed)
                }
                Phase::Idle => Step::Nothing,
            }
        };

        match step {
            Step::AwaitSettle(mut settled) => {
                tracing::info!("Cancelling call while connecting");
                let _ = settled.wait_for(|done| *done).await;
                true
            }
            Step::Close(generation, active, closed_tx) => {
                tracing::info!("Ending call #{}", generation);
                active.pump.abort();
                self.shared
                    .close_active(generation, active, Outcome::finished())
                    .await;
                let _ = closed_tx.send(true);
                true
            }
            Step::AwaitClose(mut closed) => {
                tracing::debug!("Waiting for running teardown");
                let _ = closed.wait_for(|done| *done).await;
                false
            }
            Step::Nothing => false,
        }
    }

    /// Abbau beim Schließen der Oberfläche: beendet alles und setzt sofort auf Idle
    pub async fn teardown(&self) {
        self.end().await;

        let mut inner = self.shared.inner.lock();
        if let Some(reset) = inner.pending_reset.take() {
            reset.abort();
        }
        inner.generation += 1;
        inner.phase = Phase::Idle;
        inner.session = CallSession::idle();
        self.shared.emit_state(&inner);
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("session", &self.session())
            .finish()
    }
}

// ========================================================================
// ATTEMPT & TEARDOWN
// ========================================================================

impl Shared {
    /// `initiate`, Backend-Auswahl und `establish` einer Session
    async fn run_attempt(
        self: &Arc<Self>,
        generation: u64,
        target: TargetNumber,
        credential: Credential,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), CallError> {
        let guard = Arc::new(ResourceCleanupGuard::new(format!("call #{}", generation)));

        let response = match self.api.initiate(&credential, &target).await {
            Ok(response) => response,
            Err(e) => {
                return self
                    .settle_failure(generation, &guard, None, &cancel, e.into())
                    .await;
            }
        };
        let call_id = response.call_id.clone();

        if cancel.load(Ordering::SeqCst) {
            self.close_out(generation, &guard, Some((credential, call_id)), Outcome::finished())
                .await;
            return Err(CallError::Cancelled);
        }

        let backend = SignalingBackend::select(&response, &self.backends);
        tracing::info!("Call {} uses {:?}", call_id, backend);
        {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.session.session_id = Some(call_id.clone());
                inner.session.backend_kind = Some(backend.kind());
                self.emit_state(&inner);
            }
        }

        let Established { handle, events } = match backend.establish(&target, &guard).await {
            Ok(established) => established,
            Err(e) => {
                return self
                    .settle_failure(generation, &guard, Some((credential, call_id)), &cancel, e)
                    .await;
            }
        };

        // Der Pump startet unter dem Lock, damit kein Event vor `Active` ankommt
        let discarded = {
            let mut inner = self.inner.lock();
            let current = inner.generation == generation
                && matches!(inner.phase, Phase::Establishing { .. });
            if current && !cancel.load(Ordering::SeqCst) {
                let pump = tokio::spawn(Arc::clone(self).pump(generation, events));
                inner.phase = Phase::Active(ActiveCall {
                    handle,
                    guard: Arc::clone(&guard),
                    credential,
                    call_id,
                    pump: pump.abort_handle(),
                });
                None
            } else {
                Some((handle, credential, call_id))
            }
        };

        // Erfolg nach Abbruch wird nicht sichtbar, nur abgebaut
        if let Some((handle, credential, call_id)) = discarded {
            tracing::info!("Discarding call #{} established after cancellation", generation);
            handle.terminate().await;
            self.close_out(generation, &guard, Some((credential, call_id)), Outcome::finished())
                .await;
            return Err(CallError::Cancelled);
        }

        tracing::info!("Call #{} established", generation);
        Ok(())
    }

    async fn settle_failure(
        self: &Arc<Self>,
        generation: u64,
        guard: &ResourceCleanupGuard,
        notify: Option<(Credential, String)>,
        cancel: &AtomicBool,
        err: EstablishmentError,
    ) -> Result<(), CallError> {
        if cancel.load(Ordering::SeqCst) {
            tracing::info!("Call #{} failed after cancellation: {}", generation, err);
            self.close_out(generation, guard, notify, Outcome::finished())
                .await;
            return Err(CallError::Cancelled);
        }

        tracing::warn!("Call #{} could not be established: {}", generation, err);
        self.close_out(generation, guard, notify, Outcome::failed(err.to_string()))
            .await;
        Err(CallError::Establishment(err))
    }

    /// Verarbeitet die Events einer aktiven Session in Reihenfolge
    async fn pump(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
        while let Some(event) = events.recv().await {
            if let Some(outcome) = self.handle_backend_event(generation, event) {
                self.close_session(generation, outcome).await;
                break;
            }
        }
    }

    /// Wendet ein Backend-Event an; `Some` bedeutet, die Session endet
    fn handle_backend_event(&self, generation: u64, event: BackendEvent) -> Option<Outcome> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!("Ignoring {:?} from stale session #{}", event, generation);
            return None;
        }
        if !matches!(inner.phase, Phase::Active(_)) {
            tracing::debug!("Ignoring {:?} from session #{} while closing", event, generation);
            return None;
        }

        match event {
            BackendEvent::Accepted => {
                if inner.session.status == CallStatus::Connecting {
                    inner.session.status = CallStatus::Talking;
                    tracing::info!("Call #{} accepted", generation);
                    self.emit_state(&inner);
                }
                None
            }
            BackendEvent::RemoteMediaAvailable => {
                let _ = self.event_tx.send(CallEvent::RemoteMedia);
                None
            }
            BackendEvent::AudioLevel { input, output } => {
                let _ = self.event_tx.send(CallEvent::AudioLevel { input, output });
                None
            }
            BackendEvent::Disconnected => {
                tracing::info!("Call #{} disconnected by remote", generation);
                Some(Outcome::finished())
            }
            BackendEvent::Errored(message) => {
                tracing::error!("Call #{} failed: {}", generation, message);
                Some(Outcome::failed(message))
            }
        }
    }

    /// Beendet die aktive Session aus dem Event-Pump heraus
    async fn close_session(self: &Arc<Self>, generation: u64, outcome: Outcome) {
        let (active, closed_tx) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match std::mem::replace(&mut inner.phase, Phase::Idle) {
                Phase::Active(active) => {
                    let (closed_tx, closed) = watch::channel(false);
                    inner.phase = Phase::Closing { closed };
                    (active, closed_tx)
                }
                other => {
                    inner.phase = other;
                    return;
                }
            }
        };
        self.close_active(generation, active, outcome).await;
        let _ = closed_tx.send(true);
    }

    async fn close_active(self: &Arc<Self>, generation: u64, active: ActiveCall, outcome: Outcome) {
        let ActiveCall {
            handle,
            guard,
            credential,
            call_id,
            ..
        } = active;

        handle.terminate().await;
        self.close_out(generation, &guard, Some((credential, call_id)), outcome)
            .await;
    }

    /// Gemeinsamer Abschluss aller Exit-Pfade: freigeben, Backend
    /// benachrichtigen, Endstatus setzen, Reset planen
    async fn close_out(
        self: &Arc<Self>,
        generation: u64,
        guard: &ResourceCleanupGuard,
        notify: Option<(Credential, String)>,
        outcome: Outcome,
    ) {
        guard.release_all().await;

        if let Some((credential, call_id)) = notify {
            if let Err(e) = self.api.terminate(&credential, &call_id).await {
                tracing::warn!("Could not notify backend about end of {}: {}", call_id, e);
            }
        }

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!("Session #{} was replaced during teardown", generation);
            return;
        }

        inner.session.status = outcome.status;
        inner.session.ended_at = Some(Utc::now());
        if let Some(error) = &outcome.error {
            inner.session.last_error = Some(error.clone());
            let _ = self.event_tx.send(CallEvent::Error(error.clone()));
        }
        inner.phase = Phase::Idle;
        tracing::info!("Call #{} {}", generation, outcome.status.as_str());
        self.emit_state(&inner);
        self.schedule_reset(&mut inner);
    }

    /// Plant den Reset auf Idle nach der Haltezeit (abbrechbar)
    fn schedule_reset(self: &Arc<Self>, inner: &mut Inner) {
        let shared = Arc::clone(self);
        let generation = inner.generation;

        let task = tokio::spawn(async move {
            tokio::time::sleep(shared.hold_period).await;

            let mut inner = shared.inner.lock();
            if inner.generation != generation || inner.session.status.is_active() {
                return;
            }
            inner.pending_reset = None;
            inner.session = CallSession::idle();
            shared.emit_state(&inner);
        });

        if let Some(previous) = inner.pending_reset.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    fn emit_state(&self, inner: &Inner) {
        let _ = self
            .event_tx
            .send(CallEvent::StateChanged(inner.session.clone()));
    }
}

// ============================================================================
// TESTS
// ============================================================================
