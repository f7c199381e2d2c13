//! Error types for dispatch and reconciliation.
//!
//! Errors are classified by recoverability:
//! - Retryable: provider unreachable, rate limits, provider 5xx
//! - NonRetryable: bad input, unknown project, every contact failed
//! - RequiresUserAction: missing provider setup, plan limit reached

use thiserror::Error;

use crate::db::DbError;
use crate::dispatch::ContactFailure;
use crate::provider::ProviderError;

/// Batch-level dispatch errors. When one of these is returned nothing was
/// dispatched; per-contact problems live in the batch report instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Usage limit reached for organization {org_id}. Upgrade your plan.")]
    QuotaExceeded { org_id: String },

    #[error("No contacts to call")]
    NothingToDispatch,

    #[error("Failed to create any calls ({} attempted)", failures.len())]
    AllContactsFailedInBatch { failures: Vec<ContactFailure> },

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::AllContactsFailedInBatch { failures } => {
                !failures.is_empty() && failures.iter().all(|f| f.retryable)
            }
            DispatchError::Store(_) => true,
            _ => false,
        }
    }

    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            DispatchError::Configuration(_) | DispatchError::QuotaExceeded { .. }
        )
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            DispatchError::Configuration(_) => {
                "Set VAPI_API_KEY and VAPI_PHONE_NUMBER_ID, or check ~/.intellidial/config.json"
            }
            DispatchError::ProjectNotFound(_) => "Check the project id.",
            DispatchError::QuotaExceeded { .. } => "Upgrade your plan or wait for the next cycle.",
            DispatchError::NothingToDispatch => {
                "Select contacts or add them to the queue. Opted-out contacts are never called."
            }
            DispatchError::AllContactsFailedInBatch { .. } => {
                "Check the contacts' phone numbers and the provider configuration."
            }
            DispatchError::Store(_) => "Check disk space and database permissions, then retry.",
        }
    }
}

/// Why a single contact in a batch was not dispatched.
#[derive(Debug, Error)]
pub enum ContactDispatchError {
    #[error("Contact not found in project")]
    NotFound,

    #[error("Contact has opted out")]
    OptedOut,

    #[error("Contact already has a call in progress")]
    AlreadyCalling,

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl ContactDispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ContactDispatchError::Provider(err) => err.is_retryable(),
            ContactDispatchError::Store(_) => true,
            _ => false,
        }
    }
}

/// Errors that stop a whole reconcile pass. Per-contact problems are logged
/// and skipped.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Store(_))
    }

    pub fn requires_user_action(&self) -> bool {
        matches!(self, ReconcileError::Configuration(_))
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ReconcileError::Configuration(_) => "Set VAPI_API_KEY or check ~/.intellidial/config.json",
            ReconcileError::ProjectNotFound(_) => "Check the project id.",
            ReconcileError::Store(_) => "Check disk space and database permissions, then retry.",
        }
    }
}

/// Serializable error representation for UI callers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl ErrorPayload {
    fn classify(
        message: String,
        retryable: bool,
        requires_user_action: bool,
        recovery_suggestion: &str,
    ) -> Self {
        let error_type = if requires_user_action {
            ErrorType::RequiresUserAction
        } else if retryable {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };
        ErrorPayload {
            message,
            error_type,
            can_retry: retryable,
            recovery_suggestion: recovery_suggestion.to_string(),
        }
    }
}

impl From<&DispatchError> for ErrorPayload {
    fn from(err: &DispatchError) -> Self {
        ErrorPayload::classify(
            err.to_string(),
            err.is_retryable(),
            err.requires_user_action(),
            err.recovery_suggestion(),
        )
    }
}

impl From<&ReconcileError> for ErrorPayload {
    fn from(err: &ReconcileError) -> Self {
        ErrorPayload::classify(
            err.to_string(),
            err.is_retryable(),
            err.requires_user_action(),
            err.recovery_suggestion(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str, retryable: bool) -> ContactFailure {
        ContactFailure {
            contact_id: id.to_string(),
            reason: "boom".to_string(),
            retryable,
        }
    }

    #[test]
    fn test_quota_payload_requires_user_action() {
        let err = DispatchError::QuotaExceeded {
            org_id: "org-1".to_string(),
        };
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.error_type, ErrorType::RequiresUserAction);
        assert!(!payload.can_retry);
        assert!(payload.message.contains("org-1"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["errorType"], "requiresUserAction");
        assert!(json.get("recoverySuggestion").is_some());
    }

    #[test]
    fn test_all_failed_is_retryable_only_if_every_failure_is() {
        let transient = DispatchError::AllContactsFailedInBatch {
            failures: vec![failure("a", true), failure("b", true)],
        };
        assert!(transient.is_retryable());
        assert_eq!(
            transient.to_string(),
            "Failed to create any calls (2 attempted)"
        );

        let mixed = DispatchError::AllContactsFailedInBatch {
            failures: vec![failure("a", true), failure("b", false)],
        };
        assert!(!mixed.is_retryable());
        assert_eq!(ErrorPayload::from(&mixed).error_type, ErrorType::NonRetryable);
    }

    #[test]
    fn test_contact_error_retryability_follows_provider() {
        let err = ContactDispatchError::from(ProviderError::Unreachable("timeout".to_string()));
        assert!(err.is_retryable());
        assert!(!ContactDispatchError::OptedOut.is_retryable());
    }
}
