//! Message Types für Call-Backend und Voice-Provider
//!
//! Die HTTP-Strukturen spiegeln die JSON-Antworten des Call-Backends wider,
//! die WebSocket-Strukturen das Protokoll des Managed Voice Providers.

use crate::call_engine::AudioConstraints;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL BACKEND (HTTP)
// ============================================================================

/// Anruf beim Backend anmelden
#[derive(Debug, Clone, Serialize)]
pub struct InitiateRequest {
    pub phone_number: String,
}

/// ICE Server aus der Backend-Antwort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// Antwort auf `initiate`
///
/// Welche optionalen Felder gesetzt sind, bestimmt das Signaling-Backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitiateResponse {
    pub call_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sdp_offer: Option<String>,
    #[serde(default)]
    pub ice_servers: Option<Vec<IceServer>>,
    #[serde(default)]
    pub voice_token: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl InitiateResponse {
    /// Provider-Credential (leere Strings zählen nicht)
    pub fn provider_credential(&self) -> Option<&str> {
        self.voice_token.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Remote SDP Offer für die Peer-Verhandlung
    pub fn negotiation_offer(&self) -> Option<&str> {
        self.sdp_offer.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Anruf beim Backend beenden
#[derive(Debug, Clone, Serialize)]
pub struct TerminateRequest {
    pub call_id: String,
}

/// Antwort auf `terminate`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TerminateResponse {
    pub call_id: String,
    #[serde(default, rename = "duration")]
    pub duration_seconds: i64,
    #[serde(default)]
    pub status: String,
}

/// Fehler-Body des Backends
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// VOICE PROVIDER: CLIENT → SERVER
// ============================================================================

/// Codecs in Präferenz-Reihenfolge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Pcmu,
}

/// Alle Client-Nachrichten an den Provider
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderRequest {
    /// Gerät mit dem Access Token registrieren
    Register {
        token: String,
        #[serde(rename = "codecPreferences")]
        codec_preferences: Vec<Codec>,
        #[serde(rename = "maxAverageBitrate")]
        max_average_bitrate: u32,
    },

    /// Ausgehenden Anruf starten
    Connect {
        params: ConnectParams,
        #[serde(rename = "rtcConstraints")]
        rtc_constraints: RtcConstraints,
    },

    /// Aktiven Anruf auflegen
    Disconnect {
        #[serde(rename = "callSid", skip_serializing_if = "Option::is_none")]
        call_sid: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectParams {
    #[serde(rename = "To")]
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RtcConstraints {
    pub audio: AudioConstraints,
}

// ============================================================================
// VOICE PROVIDER: SERVER → CLIENT
// ============================================================================

/// Alle möglichen Provider-Nachrichten
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderMessage {
    /// Gerät registriert
    Registered {
        #[serde(default)]
        identity: Option<String>,
    },

    /// Anruf angelegt (noch nicht angenommen)
    CallCreated {
        #[serde(rename = "callSid")]
        call_sid: String,
    },

    /// Gegenseite hat angenommen
    Accept {
        #[serde(rename = "callSid")]
        call_sid: String,
    },

    /// Anruf beendet
    Disconnect {
        #[serde(rename = "callSid", default)]
        call_sid: Option<String>,
    },

    /// Fehler
    Error { code: i32, message: String },
}

// ============================================================================
// TESTS
// ============================================================================
