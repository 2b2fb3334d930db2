//! Test-Doubles für Hardware, Call-Backend und Voice Provider

use super::audio::{
    AudioConstraints, LocalMediaStream, MediaError, MediaPlatform, MediaTrack, OutputDevice,
};
use super::cleanup::SessionObject;
use crate::signaling::{
    ApiError, CallApi, ConnectParams, Credential, DeviceOptions, InitiateResponse, ProviderConnector,
    ProviderDevice, ProviderError, ProviderEvent, TerminateResponse,
};
use crate::call_engine::TargetNumber;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// JOURNAL
// ============================================================================

/// Protokolliert Freigaben in Reihenfolge
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct JournalTrack {
    journal: Journal,
    live: bool,
}

impl MediaTrack for JournalTrack {
    fn label(&self) -> &str {
        "journal"
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn level(&self) -> f32 {
        0.0
    }

    fn stop(&mut self) {
        if std::mem::replace(&mut self.live, false) {
            self.journal.record("track stopped");
        }
    }
}

pub fn fake_stream(journal: &Journal) -> LocalMediaStream {
    LocalMediaStream::new(vec![Box::new(JournalTrack {
        journal: journal.clone(),
        live: true,
    })])
}

pub struct FakeSession {
    name: String,
    journal: Journal,
}

impl FakeSession {
    pub fn new(name: &str, journal: &Journal) -> Arc<dyn SessionObject> {
        Arc::new(Self {
            name: name.to_string(),
            journal: journal.clone(),
        })
    }
}

#[async_trait]
impl SessionObject for FakeSession {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn close(&self) {
        self.journal.record(format!("{} closed", self.name));
    }
}

// ============================================================================
// FAKE MEDIA PLATFORM
// ============================================================================

/// Track, der die Anzahl lebender Streams mitzählt
struct CountedTrack {
    live: bool,
    live_streams: Arc<AtomicUsize>,
}

impl MediaTrack for CountedTrack {
    fn label(&self) -> &str {
        "fake microphone"
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn level(&self) -> f32 {
        if self.live {
            0.3
        } else {
            0.0
        }
    }

    fn stop(&mut self) {
        if std::mem::replace(&mut self.live, false) {
            self.live_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for CountedTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct FakeMedia {
    api_available: AtomicBool,
    failure: Mutex<Option<MediaError>>,
    outputs: Mutex<Vec<OutputDevice>>,
    delay: Mutex<Duration>,
    acquisitions: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            api_available: AtomicBool::new(true),
            failure: Mutex::new(None),
            outputs: Mutex::new(vec![OutputDevice {
                name: "Speakers".to_string(),
                is_default: true,
            }]),
            delay: Mutex::new(Duration::ZERO),
            acquisitions: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            live_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn fail_with(&self, err: MediaError) {
        *self.failure.lock() = Some(err);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    pub fn set_api_available(&self, available: bool) {
        self.api_available.store(available, Ordering::SeqCst);
    }

    pub fn set_outputs(&self, outputs: Vec<OutputDevice>) {
        *self.outputs.lock() = outputs;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Anzahl gestarteter Anforderungen
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Höchste Zahl gleichzeitig laufender Anforderungen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Streams, deren Tracks noch nicht gestoppt wurden
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaPlatform for FakeMedia {
    fn media_api_available(&self) -> bool {
        self.api_available.load(Ordering::SeqCst)
    }

    async fn acquire_audio(
        &self,
        _constraints: AudioConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let failure = self.failure.lock().clone();

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = failure {
            return Err(err);
        }

        self.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMediaStream::new(vec![Box::new(CountedTrack {
            live: true,
            live_streams: Arc::clone(&self.live_streams),
        })]))
    }

    async fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError> {
        Ok(self.outputs.lock().clone())
    }
}

// ============================================================================
// FAKE CALL API
// ============================================================================

pub fn raw_response(call_id: &str) -> InitiateResponse {
    InitiateResponse {
        call_id: call_id.to_string(),
        session_id: None,
        sdp_offer: None,
        ice_servers: None,
        voice_token: None,
        status: Some("connecting".to_string()),
        start_time: None,
    }
}

pub fn managed_response(call_id: &str, token: &str) -> InitiateResponse {
    InitiateResponse {
        session_id: Some("voice_sdk".to_string()),
        voice_token: Some(token.to_string()),
        ..raw_response(call_id)
    }
}

pub struct FakeApi {
    response: Mutex<Result<InitiateResponse, ApiError>>,
    terminate_failure: Mutex<Option<ApiError>>,
    delay: Mutex<Duration>,
    terminate_delay: Mutex<Duration>,
    initiates: AtomicUsize,
    terminated: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(raw_response("call-1"))),
            terminate_failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            terminate_delay: Mutex::new(Duration::ZERO),
            initiates: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
        })
    }

    pub fn respond_with(&self, response: InitiateResponse) {
        *self.response.lock() = Ok(response);
    }

    pub fn fail_with(&self, err: ApiError) {
        *self.response.lock() = Err(err);
    }

    pub fn fail_terminate(&self, err: ApiError) {
        *self.terminate_failure.lock() = Some(err);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Verzögert `terminate`; der Aufruf wird erst danach protokolliert
    pub fn set_terminate_delay(&self, delay: Duration) {
        *self.terminate_delay.lock() = delay;
    }

    pub fn initiates(&self) -> usize {
        self.initiates.load(Ordering::SeqCst)
    }

    /// call_ids aller terminate-Aufrufe
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl CallApi for FakeApi {
    async fn initiate(
        &self,
        _credential: &Credential,
        _target: &TargetNumber,
    ) -> Result<InitiateResponse, ApiError> {
        self.initiates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.response.lock().clone()
    }

    async fn terminate(
        &self,
        _credential: &Credential,
        call_id: &str,
    ) -> Result<TerminateResponse, ApiError> {
        let delay = *self.terminate_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.terminated.lock().push(call_id.to_string());
        if let Some(err) = self.terminate_failure.lock().clone() {
            return Err(err);
        }
        Ok(TerminateResponse {
            call_id: call_id.to_string(),
            duration_seconds: 0,
            status: "completed".to_string(),
        })
    }
}

// ============================================================================
// FAKE PROVIDER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderScript {
    Succeed,
    FailRegister,
}

pub struct FakeProvider {
    token: String,
    script: ProviderScript,
    media: Option<Arc<FakeMedia>>,
    event_tx: broadcast::Sender<ProviderEvent>,
    connected_to: Mutex<Option<String>>,
    audio: Mutex<Option<LocalMediaStream>>,
    disconnects: AtomicUsize,
    destroys: AtomicUsize,
}

impl FakeProvider {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn connected_to(&self) -> Option<String> {
        self.connected_to.lock().clone()
    }

    /// Simuliert ein Event des Providers
    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    fn stop_audio(&self) {
        if let Some(mut stream) = self.audio.lock().take() {
            stream.stop();
        }
    }
}

#[async_trait]
impl ProviderDevice for FakeProvider {
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.event_tx.subscribe()
    }

    async fn register(&self) -> Result<(), ProviderError> {
        if self.destroys() > 0 {
            return Err(ProviderError::Destroyed);
        }
        match self.script {
            ProviderScript::Succeed => {
                self.emit(ProviderEvent::Registered);
                Ok(())
            }
            ProviderScript::FailRegister => {
                Err(ProviderError::RegistrationFailed("invalid token".to_string()))
            }
        }
    }

    async fn connect(
        &self,
        params: ConnectParams,
        constraints: AudioConstraints,
    ) -> Result<(), ProviderError> {
        if let Some(media) = &self.media {
            let stream = media.acquire_audio(constraints).await?;
            *self.audio.lock() = Some(stream);
        }
        *self.connected_to.lock() = Some(params.to);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.stop_audio();
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.stop_audio();
    }
}

pub struct FakeConnector {
    script: ProviderScript,
    media: Option<Arc<FakeMedia>>,
    devices: Mutex<Vec<Arc<FakeProvider>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Self::with_script(ProviderScript::Succeed)
    }

    pub fn with_script(script: ProviderScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            media: None,
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Provider, der in `connect` selbst das Mikrofon anfordert
    pub fn with_media(media: Arc<FakeMedia>) -> Arc<Self> {
        Arc::new(Self {
            script: ProviderScript::Succeed,
            media: Some(media),
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn last_device(&self) -> Option<Arc<FakeProvider>> {
        self.devices.lock().last().cloned()
    }
}

impl ProviderConnector for FakeConnector {
    fn create_device(&self, token: &str, _options: DeviceOptions) -> Arc<dyn ProviderDevice> {
        let (event_tx, _) = broadcast::channel(32);
        let device = Arc::new(FakeProvider {
            token: token.to_string(),
            script: self.script,
            media: self.media.clone(),
            event_tx,
            connected_to: Mutex::new(None),
            audio: Mutex::new(None),
            disconnects: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        });
        self.devices.lock().push(Arc::clone(&device));
        device
    }
}
