//! Call Engine Module - Lebenszyklus eines ausgehenden Anrufs
//!
//! Dieses Modul verwaltet:
//! - Audio-Hardware (Mikrofon Capture, Ausgabegeräte)
//! - Device-Probe als Vorbedingung für Anrufe
//! - Freigabe der Ressourcen einer Session
//! - Die Zustandsmaschine des Anrufs

mod audio;
mod cleanup;
mod devices;
mod engine;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::{
    AudioConstraints, CpalPlatform, LocalMediaStream, MediaError, MediaPlatform, MediaTrack,
    MicrophoneTrack, OutputDevice, CHANNELS, SAMPLE_RATE,
};
pub use cleanup::{CleanupError, ResourceCleanupGuard, SessionObject};
pub use devices::{DeviceProbe, DeviceState, HardwareGate};
pub use engine::{CallError, CallEvent, CallOrchestrator, OrchestratorSettings, PreconditionError};
pub use session::{BackendKind, CallSession, CallStatus, NumberError, TargetNumber, MIN_NATIONAL_DIGITS};
