//! Voice-call provider seam.
//!
//! The engine talks to the provider only through `CallProvider`: create an
//! outbound call, and fetch a call's current state. `VapiClient` is the
//! production implementation; tests script an in-process fake.

pub mod client;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbProject;

pub use client::{normalize_phone, VapiClient};

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    #[error("Call not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Network failures, rate limits and provider-side 5xx are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Unreachable(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Outbound call request, already resolved to provider ids.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateCallRequest {
    pub assistant_id: String,
    pub phone_number_id: String,
    pub customer_number: String,
    pub customer_name: Option<String>,
}

/// A provider call as returned by `GET /call/{id}` (the subset we use).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCall {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ended_reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub artifact: Option<CallArtifact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArtifact {
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub recording: Option<Recording>,
    /// Keyed by structured-output id; each value carries a `result` object.
    #[serde(default)]
    pub structured_outputs: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Recordings arrive either as a bare URL or as `{ "url": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recording {
    Url(String),
    Object {
        #[serde(default)]
        url: Option<String>,
    },
}

impl Recording {
    pub fn url(&self) -> Option<&str> {
        let url = match self {
            Recording::Url(url) => Some(url.as_str()),
            Recording::Object { url } => url.as_deref(),
        };
        url.map(str::trim).filter(|u| !u.is_empty())
    }
}

#[async_trait]
pub trait CallProvider: Send + Sync {
    /// Place an outbound call. Returns the provider call id.
    async fn create_call(&self, request: &CreateCallRequest) -> Result<String, ProviderError>;

    /// Fetch a call's current state. `ProviderError::NotFound` when the provider
    /// has no such call (never existed or purged).
    async fn get_call(&self, call_id: &str) -> Result<ProviderCall, ProviderError>;
}

/// Resolves the provider assistant that runs a project's calls.
#[async_trait]
pub trait AssistantResolver: Send + Sync {
    async fn ensure_assistant_id(&self, project: &DbProject) -> Result<String, ProviderError>;
}

/// Uses the assistant id stored on the project. Assistant provisioning
/// happens outside the engine.
pub struct StoredAssistantResolver;

#[async_trait]
impl AssistantResolver for StoredAssistantResolver {
    async fn ensure_assistant_id(&self, project: &DbProject) -> Result<String, ProviderError> {
        project
            .assistant_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "project '{}' has no assistant; create one before calling",
                    project.name
                ))
            })
    }
}
