//! Shared type definitions for the database layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row data: {0}")]
    Corrupt(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

/// Calling lifecycle of a contact.
///
/// No state is absorbing: `success` and `failed` both re-enter `calling`
/// on retry / "call again".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Calling,
    Success,
    Failed,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::Calling => "calling",
            ContactStatus::Success => "success",
            ContactStatus::Failed => "failed",
        }
    }

    /// Whether a dispatch may move a contact in this state to `calling`.
    pub fn can_dispatch(&self) -> bool {
        !matches!(self, ContactStatus::Calling)
    }
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContactStatus::Pending),
            "calling" => Ok(ContactStatus::Calling),
            "success" => Ok(ContactStatus::Success),
            "failed" => Ok(ContactStatus::Failed),
            other => Err(DbError::Corrupt(format!("unknown contact status '{}'", other))),
        }
    }
}

/// Values captured from a call, keyed by the project's declared capture field keys.
pub type CapturedData = BTreeMap<String, serde_json::Value>;

/// One outcome of a call attempt. Immutable once appended to a contact's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResultEntry {
    pub attempted_at: String,
    pub duration_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_data: Option<CapturedData>,
    /// Absent means the call succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_reason: Option<String>,
    /// Provider call this outcome came from. `None` for dispatch-time failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,
}

impl CallResultEntry {
    /// A failed outcome. Failed calls never carry billable duration.
    pub fn failure(
        attempted_at: String,
        reason: impl Into<String>,
        provider_call_id: Option<String>,
    ) -> Self {
        Self {
            attempted_at,
            duration_seconds: 0,
            transcript: None,
            recording_url: None,
            captured_data: None,
            failure_reason: Some(reason.into()),
            ended_reason: None,
            provider_call_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure_reason.is_some()
    }
}

/// A row from the `contacts` table, with its call history attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbContact {
    pub id: String,
    pub project_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub status: ContactStatus,
    pub opt_out: bool,
    pub provider_call_id: Option<String>,
    pub last_provider_call_id: Option<String>,
    /// When the current (or most recent) dispatch claimed this contact.
    pub dispatch_started_at: Option<String>,
    pub call_result: Option<CallResultEntry>,
    #[serde(default)]
    pub call_history: Vec<CallResultEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl DbContact {
    /// `status = calling` iff a provider call id is held.
    pub fn satisfies_call_invariant(&self) -> bool {
        (self.status == ContactStatus::Calling) == self.provider_call_id.is_some()
    }
}

/// Input for creating a contact.
#[derive(Debug, Clone)]
pub struct NewContact<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub phone: &'a str,
    pub name: Option<&'a str>,
    pub opt_out: bool,
}

/// A capture field declared on a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureField {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
}

/// A row from the `projects` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProject {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub assistant_id: Option<String>,
    /// Project-specific caller number; falls back to the org default when unset.
    pub agent_phone_number_id: Option<String>,
    #[serde(default)]
    pub capture_fields: Vec<CaptureField>,
    pub updated_at: String,
}

impl DbProject {
    /// Declared capture keys, blanks removed.
    pub fn capture_field_keys(&self) -> Vec<String> {
        self.capture_fields
            .iter()
            .map(|f| f.key.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Org-level usage counters and plan limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub org_id: String,
    pub calls_used: i64,
    pub minutes_used: f64,
    pub calls_limit: Option<i64>,
    pub minutes_limit: Option<f64>,
}

impl UsageCounters {
    /// Both counters must be strictly under their limit (absent limit = unlimited).
    pub fn is_within_limits(&self) -> bool {
        let calls_ok = self.calls_limit.map_or(true, |limit| self.calls_used < limit);
        let minutes_ok = self
            .minutes_limit
            .map_or(true, |limit| self.minutes_used < limit);
        calls_ok && minutes_ok
    }
}

/// A row from `queue_entries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbQueueEntry {
    pub project_id: String,
    pub contact_id: String,
    pub scheduled_time: Option<String>,
    pub added_at: String,
}

/// One page of a contact listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPage {
    pub contacts: Vec<DbContact>,
    pub total: usize,
}

/// Contact counts per status plus billed minutes for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCallStats {
    pub pending: usize,
    pub calling: usize,
    pub success: usize,
    pub failed: usize,
    pub total_minutes: f64,
}
