//! Call Session - Datenmodell eines ausgehenden Anrufs

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Mindestanzahl nationaler Ziffern (ohne Ländervorwahl)
pub const MIN_NATIONAL_DIGITS: usize = 5;

/// E.164: höchstens 15 Ziffern inklusive Ländervorwahl
const MAX_E164_DIGITS: usize = 15;

/// Untergrenze der Backend-Validierung (`+[1-9]\d{6,14}`)
const MIN_E164_DIGITS: usize = 7;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NumberError {
    #[error("Phone number is empty")]
    Empty,

    #[error("Phone number must start with a country dial code")]
    MissingCountryCode,

    #[error("Phone number is too short")]
    TooShort,

    #[error("Phone number is too long")]
    TooLong,

    #[error("Country code must not start with 0")]
    LeadingZero,
}

// ============================================================================
// TARGET NUMBER
// ============================================================================

/// E.164-normalisierte Zielnummer (`+` und Ziffern)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TargetNumber(String);

impl TargetNumber {
    /// Normalisiert eine Nummer mit führender Ländervorwahl
    ///
    /// Alle Zeichen außer Ziffern werden entfernt; eine bereits normalisierte
    /// Nummer bleibt unverändert.
    pub fn parse(raw: &str) -> Result<Self, NumberError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(NumberError::Empty);
        }

        let trimmed = if let Some(rest) = trimmed.strip_prefix("00") {
            rest
        } else if let Some(rest) = trimmed.strip_prefix('+') {
            rest
        } else {
            return Err(NumberError::MissingCountryCode);
        };

        Self::from_digits(trimmed.chars().filter(char::is_ascii_digit).collect())
    }

    /// Setzt eine Nummer aus Ländervorwahl und nationaler Nummer zusammen
    pub fn from_parts(dial_code: &str, national: &str) -> Result<Self, NumberError> {
        let national: String = national.chars().filter(char::is_ascii_digit).collect();
        if national.is_empty() {
            return Err(NumberError::Empty);
        }
        if national.len() < MIN_NATIONAL_DIGITS {
            return Err(NumberError::TooShort);
        }

        let prefix: String = dial_code.chars().filter(char::is_ascii_digit).collect();
        if prefix.is_empty() {
            return Err(NumberError::MissingCountryCode);
        }

        Self::from_digits(prefix + &national)
    }

    fn from_digits(digits: String) -> Result<Self, NumberError> {
        match digits.len() {
            0 => Err(NumberError::Empty),
            n if n < MIN_E164_DIGITS => Err(NumberError::TooShort),
            n if n > MAX_E164_DIGITS => Err(NumberError::TooLong),
            _ if digits.starts_with('0') => Err(NumberError::LeadingZero),
            _ => Ok(Self(format!("+{}", digits))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TargetNumber {
    type Err = NumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Kein Anruf
    Idle,
    /// Anruf wird aufgebaut
    Connecting,
    /// Anruf aktiv
    Talking,
    /// Anruf beendet (wird nach der Anzeigedauer zu Idle)
    Finished,
    /// Anruf fehlgeschlagen (wird nach der Anzeigedauer zu Idle)
    Failed,
}

impl CallStatus {
    /// Connecting oder Talking
    pub fn is_active(self) -> bool {
        matches!(self, CallStatus::Connecting | CallStatus::Talking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Talking => "talking",
            CallStatus::Finished => "finished",
            CallStatus::Failed => "failed",
        }
    }
}

/// Welches Signaling-Backend die Session trägt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    RawMedia,
    PeerNegotiation,
    ManagedProvider,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein ausgehender Anrufversuch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub session_id: Option<String>,
    pub target_number: Option<TargetNumber>,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub backend_kind: Option<BackendKind>,
    pub last_error: Option<String>,
}

impl CallSession {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            target_number: None,
            status: CallStatus::Idle,
            started_at: None,
            ended_at: None,
            backend_kind: None,
            last_error: None,
        }
    }

    pub fn connecting(target: TargetNumber) -> Self {
        Self {
            target_number: Some(target),
            status: CallStatus::Connecting,
            started_at: Some(Utc::now()),
            ..Self::idle()
        }
    }

    /// Dauer seit dem Start (bis zum Ende, falls beendet)
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - started)
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::idle()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_formatting() {
        let n = TargetNumber::parse("+1 (415) 555-0123").unwrap();
        assert_eq!(n.as_str(), "+14155550123");

        let n = TargetNumber::parse("0049 30 1234567").unwrap();
        assert_eq!(n.as_str(), "+49301234567");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for raw in ["+14155550123", "+44 20 7946 0958", "0033-1-23-45-67-89"] {
            let once = TargetNumber::parse(raw).unwrap();
            let twice = TargetNumber::parse(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_from_parts() {
        let n = TargetNumber::from_parts("+7", "(912) 345-67-89").unwrap();
        assert_eq!(n.as_str(), "+79123456789");
        assert_eq!(TargetNumber::parse(n.as_str()).unwrap(), n);
    }

    #[test]
    fn test_from_parts_requires_national_digits() {
        assert_eq!(TargetNumber::from_parts("+1", "1234"), Err(NumberError::TooShort));
        assert_eq!(TargetNumber::from_parts("+1", "  "), Err(NumberError::Empty));
        assert_eq!(
            TargetNumber::from_parts("", "4155550123"),
            Err(NumberError::MissingCountryCode)
        );
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert_eq!(TargetNumber::parse(""), Err(NumberError::Empty));
        assert_eq!(TargetNumber::parse("4155550123"), Err(NumberError::MissingCountryCode));
        assert_eq!(TargetNumber::parse("+12345"), Err(NumberError::TooShort));
        assert_eq!(TargetNumber::parse("+1234567890123456"), Err(NumberError::TooLong));
        assert_eq!(TargetNumber::parse("+0123456789"), Err(NumberError::LeadingZero));
    }

    #[test]
    fn test_status_activity() {
        assert!(CallStatus::Connecting.is_active());
        assert!(CallStatus::Talking.is_active());
        assert!(!CallStatus::Finished.is_active());
        assert!(!CallStatus::Idle.is_active());
        assert_eq!(CallStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_session_timestamps() {
        let session = CallSession::connecting(TargetNumber::parse("+14155550123").unwrap());
        assert_eq!(session.status, CallStatus::Connecting);
        assert!(session.started_at.is_some());
        assert!(session.ended_at.is_none());
        assert!(session.duration().is_some());
        assert!(CallSession::idle().duration().is_none());
    }
}
