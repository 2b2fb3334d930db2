//! Audio - Lokale Medien (Mikrofon Capture)
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Die Hardware liegt hinter
//! `MediaPlatform`, damit Device-Probe und Backends dieselbe Schnittstelle
//! nutzen und in Tests ohne echtes Mikrofon laufen.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BackendSpecificError, BuildStreamError, Device, PlayStreamError, SampleFormat, Stream,
    StreamConfig, SupportedStreamConfigRange, SupportedStreamConfigsError,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Voice über WebRTC)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media devices not supported")]
    Unsupported,

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to enumerate audio devices: {0}")]
    Enumeration(String),
}

impl MediaError {
    /// Unterscheidet Berechtigungsfehler von fehlender/defekter Hardware
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, MediaError::PermissionDenied(_))
    }
}

/// Ordnet eine backend-spezifische Fehlermeldung ein.
///
/// cpal kennt keine eigene Variante für verweigerte Berechtigungen, die
/// Host-APIs (CoreAudio, WASAPI, PulseAudio) melden sie als Freitext.
pub fn classify_backend_error(description: &str, fallback: fn(String) -> MediaError) -> MediaError {
    let lower = description.to_lowercase();
    let denied = ["permission", "denied", "not allowed", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle));

    if denied {
        MediaError::PermissionDenied(description.to_string())
    } else {
        fallback(description.to_string())
    }
}

impl From<BuildStreamError> for MediaError {
    fn from(err: BuildStreamError) -> Self {
        match err {
            BuildStreamError::DeviceNotAvailable => MediaError::NoInputDevice,
            BuildStreamError::StreamConfigNotSupported => {
                MediaError::UnsupportedConfig("stream config not supported".to_string())
            }
            BuildStreamError::BackendSpecific {
                err: BackendSpecificError { description },
            } => classify_backend_error(&description, MediaError::StreamBuildError),
            other => MediaError::StreamBuildError(other.to_string()),
        }
    }
}

impl From<PlayStreamError> for MediaError {
    fn from(err: PlayStreamError) -> Self {
        match err {
            PlayStreamError::DeviceNotAvailable => MediaError::NoInputDevice,
            PlayStreamError::BackendSpecific {
                err: BackendSpecificError { description },
            } => classify_backend_error(&description, MediaError::StreamPlayError),
            #[allow(unreachable_patterns)]
            other => MediaError::StreamPlayError(other.to_string()),
        }
    }
}

impl From<SupportedStreamConfigsError> for MediaError {
    fn from(err: SupportedStreamConfigsError) -> Self {
        match err {
            SupportedStreamConfigsError::DeviceNotAvailable => MediaError::NoInputDevice,
            SupportedStreamConfigsError::BackendSpecific {
                err: BackendSpecificError { description },
            } => classify_backend_error(&description, MediaError::UnsupportedConfig),
            other => MediaError::UnsupportedConfig(other.to_string()),
        }
    }
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Audio-Constraints für die Aufnahme (Browser-Semantik von getUserMedia)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl AudioConstraints {
    /// Ohne adaptive Verarbeitung - vorhersehbare Latenz statt adaptiver Qualität
    pub fn unprocessed() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

// ============================================================================
// TRACKS & STREAMS
// ============================================================================

/// Ein lokal gehaltener Medien-Track
pub trait MediaTrack: Send {
    fn label(&self) -> &str;

    fn is_live(&self) -> bool;

    /// Aktueller Pegel (0.0 - 1.0)
    fn level(&self) -> f32;

    /// Stoppt den Track. Mehrfaches Stoppen ist erlaubt.
    fn stop(&mut self);
}

/// Lokaler Medien-Stream (entspricht einem getUserMedia-Ergebnis)
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Box<dyn MediaTrack>>,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<Box<dyn MediaTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    /// Höchster Pegel über alle Tracks
    pub fn level(&self) -> f32 {
        self.tracks.iter().map(|t| t.level()).fold(0.0, f32::max)
    }

    /// Stoppt alle Tracks
    pub fn stop(&mut self) {
        for track in self.tracks.iter_mut().filter(|t| t.is_live()) {
            tracing::debug!("Stopping track '{}' of stream {}", track.label(), self.id);
            track.stop();
        }
    }
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA PLATFORM
// ============================================================================

/// Ausgabegerät (Lautsprecher/Kopfhörer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDevice {
    pub name: String,
    pub is_default: bool,
}

/// Plattform-Schnittstelle für Audio-Hardware
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    /// Ob die Plattform überhaupt Media-Device-APIs bereitstellt
    fn media_api_available(&self) -> bool;

    /// Fordert einen Audio-Stream an (Mikrofon)
    async fn acquire_audio(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalMediaStream, MediaError>;

    /// Listet die Ausgabegeräte auf
    async fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError>;
}

/// cpal-basierte Plattform (Default Host)
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalPlatform;

#[async_trait]
impl MediaPlatform for CpalPlatform {
    fn media_api_available(&self) -> bool {
        !cpal::available_hosts().is_empty()
    }

    /// cpal liefert Rohdaten ohne Echo-/Rauschunterdrückung oder AGC; die
    /// Verarbeitungs-Flags können hier nicht angewendet werden und wirken nur
    /// dort, wo sie mitgesendet werden (Provider `connect`).
    async fn acquire_audio(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        let mut track = MicrophoneTrack::open(constraints)?;
        track.start_capture()?;
        Ok(LocalMediaStream::new(vec![Box::new(track)]))
    }

    async fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError> {
        let host = cpal::default_host();
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| MediaError::Enumeration(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| OutputDevice {
                    is_default: Some(&name) == default_output.as_ref(),
                    name,
                })
            })
            .collect();

        Ok(devices)
    }
}

// ============================================================================
// MICROPHONE TRACK
// ============================================================================

/// Mikrofon-Track über cpal
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct MicrophoneTrack {
    label: String,
    device: Device,
    // Stream wird bei stop() gedroppt, das gibt die Hardware frei
    stream: Option<Stream>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    level: Arc<Mutex<f32>>,
}

// Stream ist nicht automatisch Send, wird aber nur hinter dem Track bewegt
// und nie gleichzeitig aus mehreren Threads benutzt
unsafe impl Send for MicrophoneTrack {}

impl MicrophoneTrack {
    /// Öffnet das Default-Eingabegerät
    pub fn open(constraints: AudioConstraints) -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(MediaError::NoInputDevice)?;
        let label = device.name().unwrap_or_else(|_| "default input".to_string());

        tracing::info!("Microphone opened: {} ({:?})", label, constraints);

        Ok(Self {
            label,
            device,
            stream: None,
            level: Arc::new(Mutex::new(0.0)),
        })
    }

    /// Startet Audio Capture
    pub fn start_capture(&mut self) -> Result<(), MediaError> {
        let config = Self::find_best_input_config(&self.device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let level = Arc::clone(&self.level);
        let stream = self.device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if data.is_empty() {
                    return;
                }
                // Audio Level berechnen (RMS)
                let rms: f32 = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                *level.lock() = rms.min(1.0);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )?;

        stream.play()?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device.supported_input_configs()?;
        select_best_config(configs.collect())
    }
}

impl MediaTrack for MicrophoneTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    fn level(&self) -> f32 {
        *self.level.lock()
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            *self.level.lock() = 0.0;
            tracing::info!("Audio capture stopped: {}", self.label);
        }
    }
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: 48kHz F32 > F32 mit höchster Rate > erste verfügbare
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(*c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|config| config.with_max_sample_rate().into())
        .ok_or_else(|| MediaError::UnsupportedConfig("No suitable audio configuration found".to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
