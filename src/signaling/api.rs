//! HTTP Client für das Call-Backend
//!
//! Zwei Request/Response-Aufrufe, beide mit Bearer-Credential:
//! - `initiate`: meldet den Anruf an, die Antwort bestimmt das Signaling-Backend
//! - `terminate`: meldet das Ende (best effort)

use super::messages::*;
use crate::call_engine::TargetNumber;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// CREDENTIAL
// ============================================================================

/// Bearer-Credential vom Auth-Collaborator
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Leere Tokens gelten als fehlendes Credential
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

// ============================================================================
// CALL API
// ============================================================================

/// Schnittstelle zum Call-Backend
#[async_trait]
pub trait CallApi: Send + Sync {
    async fn initiate(
        &self,
        credential: &Credential,
        target: &TargetNumber,
    ) -> Result<InitiateResponse, ApiError>;

    async fn terminate(
        &self,
        credential: &Credential,
        call_id: &str,
    ) -> Result<TerminateResponse, ApiError>;
}

/// reqwest-basierte Implementierung
#[derive(Debug, Clone)]
pub struct HttpCallApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCallApi {
    /// Erstellt einen Client für `base_url` (z.B. `http://localhost:8080/api/webrtc`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        // Ohne abschließenden Slash würde `join` das letzte Segment ersetzen
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, name: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(name)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    /// Sendet einen authentifizierten POST und dekodiert die Antwort
    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        credential: &Credential,
        name: &str,
        body: &B,
    ) -> Result<R, ApiError> {
        let url = self.endpoint(name)?;
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .bearer_auth(credential.as_str())
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            let message = body
                .message
                .or(body.error)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
                _ => ApiError::Rejected {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl CallApi for HttpCallApi {
    async fn initiate(
        &self,
        credential: &Credential,
        target: &TargetNumber,
    ) -> Result<InitiateResponse, ApiError> {
        let request = InitiateRequest {
            phone_number: target.as_str().to_string(),
        };
        let response: InitiateResponse = self.post(credential, "initiate", &request).await?;
        tracing::info!("Call {} initiated for {}", response.call_id, target);
        Ok(response)
    }

    async fn terminate(
        &self,
        credential: &Credential,
        call_id: &str,
    ) -> Result<TerminateResponse, ApiError> {
        let request = TerminateRequest {
            call_id: call_id.to_string(),
        };
        let response: TerminateResponse = self.post(credential, "terminate", &request).await?;
        tracing::info!(
            "Call {} terminated after {}s ({})",
            response.call_id,
            response.duration_seconds,
            response.status
        );
        Ok(response)
    }
}

// ============================================================================
// TESTS
// ============================================================================
