//! Konfiguration
//!
//! Reihenfolge: Defaults ← optionale JSON-Datei im Konfigurationsverzeichnis
//! der Plattform ← Umgebungsvariablen.

use crate::call_engine::OrchestratorSettings;
use crate::signaling::{default_ice_servers, DeviceOptions, IceServer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_API_URL: &str = "PULSE_API_URL";
pub const ENV_PROVIDER_URL: &str = "PULSE_PROVIDER_URL";
pub const ENV_HOLD_MS: &str = "PULSE_HOLD_MS";
pub const ENV_LOG: &str = "PULSE_LOG";

const CONFIG_FILE: &str = "config.json";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Basis-URL der Call-API (`/initiate`, `/terminate`)
    pub api_base_url: String,
    /// WebSocket-URL des Voice-Providers
    pub provider_url: String,
    pub request_timeout_secs: u64,
    pub register_timeout_secs: u64,
    pub hold_period_ms: u64,
    pub max_average_bitrate: u32,
    pub ice_servers: Vec<IceServer>,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/webrtc".to_string(),
            provider_url: "wss://voice.localhost/signal".to_string(),
            request_timeout_secs: 15,
            register_timeout_secs: 10,
            hold_period_ms: 2000,
            max_average_bitrate: 32000,
            ice_servers: default_ice_servers(),
            log_filter: "pulse_dialer=debug,webrtc=warn".to_string(),
        }
    }
}

impl AppConfig {
    /// Lädt die Konfiguration (Datei optional, Umgebung überschreibt)
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::get_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Liest eine JSON-Datei; fehlende Felder bekommen Defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    fn get_config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "pulse-dialer")?;
        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push(CONFIG_FILE);
        Some(path)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup(ENV_PROVIDER_URL) {
            self.provider_url = url;
        }
        if let Some(ms) = lookup(ENV_HOLD_MS) {
            self.hold_period_ms = ms
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(ENV_HOLD_MS, ms.clone()))?;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.log_filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_url("provider_url", &self.provider_url, &["ws", "wss"])?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "request_timeout_secs",
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            max_average_bitrate: self.max_average_bitrate,
            register_timeout: Duration::from_secs(self.register_timeout_secs),
            ..DeviceOptions::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            hold_period: Duration::from_millis(self.hold_period_ms),
            ice_servers: self.ice_servers.clone(),
            device_options: self.device_options(),
        }
    }
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
