//! Call dispatch.
//!
//! A batch checks its preconditions once (provider, caller number, assistant,
//! quota), then walks the targets in caller order. Each contact is claimed
//! (`calling`), the call is requested, and the provider call id recorded. A
//! contact that fails is recorded as `failed` and the batch moves on; only the
//! report carries per-contact errors.

use serde::Serialize;

use crate::db::{CallResultEntry, ClaimOutcome, DbProject};
use crate::error::{ContactDispatchError, DispatchError};
use crate::provider::{CallProvider, CreateCallRequest};
use crate::state::AppState;
use crate::util::now_ts;

/// A contact the batch could not dispatch, and why.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFailure {
    pub contact_id: String,
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub dispatched_ids: Vec<String>,
    pub errors: Vec<ContactFailure>,
}

/// Everything a batch resolves once before touching contacts.
struct BatchContext {
    project: DbProject,
    assistant_id: String,
    phone_number_id: String,
    status_probe: bool,
}

/// Dispatch calls for `contact_ids`, or for the project's due queue entries
/// when `None`. Contacts dispatched from the queue leave it.
pub async fn dispatch_calls(
    state: &AppState,
    project_id: &str,
    contact_ids: Option<&[String]>,
) -> Result<BatchReport, DispatchError> {
    let provider = state.call_provider().ok_or_else(|| {
        DispatchError::Configuration("VAPI_API_KEY is not set".to_string())
    })?;
    let (config_number, status_probe) = {
        let config = state.config.read();
        (
            config.provider.default_phone_number_id.clone(),
            config.dispatch.status_probe,
        )
    };

    let (project, org_number, usage, targets) = {
        let db = state.db.lock();
        let project = db
            .get_project(project_id)?
            .ok_or_else(|| DispatchError::ProjectNotFound(project_id.to_string()))?;
        let org_number = db.get_org_default_phone_number(&project.org_id)?;
        let usage = db.get_org_usage(&project.org_id)?.ok_or_else(|| {
            DispatchError::Configuration(format!("organization {} not found", project.org_id))
        })?;
        let targets = match contact_ids {
            Some(ids) => dedup_in_order(ids),
            None => db.due_queue_contact_ids(project_id, &now_ts())?,
        };
        (project, org_number, usage, targets)
    };

    let phone_number_id = [
        project.agent_phone_number_id.as_deref(),
        org_number.as_deref(),
        config_number.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|n| !n.is_empty())
    .map(str::to_string)
    .ok_or_else(|| {
        DispatchError::Configuration(
            "Phone number not configured. Set VAPI_PHONE_NUMBER_ID or a caller number on the project."
                .to_string(),
        )
    })?;

    let assistant_id = state
        .assistants
        .ensure_assistant_id(&project)
        .await
        .map_err(|e| DispatchError::Configuration(e.to_string()))?;

    if !usage.is_within_limits() {
        log::warn!(
            "Dispatch: org {} over plan limits ({} calls, {:.1} minutes used)",
            usage.org_id,
            usage.calls_used,
            usage.minutes_used
        );
        return Err(DispatchError::QuotaExceeded {
            org_id: usage.org_id,
        });
    }

    if targets.is_empty() {
        return Err(DispatchError::NothingToDispatch);
    }

    let ctx = BatchContext {
        project,
        assistant_id,
        phone_number_id,
        status_probe,
    };

    let mut report = BatchReport::default();
    // Provider create requests issued; claim rejections never reach the provider.
    let mut attempted = 0;
    for contact_id in &targets {
        match dispatch_contact(state, provider.as_ref(), &ctx, contact_id, &mut attempted).await {
            Ok(call_id) => {
                log::info!("Dispatch: contact {} -> call {}", contact_id, call_id);
                report.dispatched_ids.push(contact_id.clone());
            }
            Err(err) => {
                log::warn!("Dispatch: contact {} not dispatched: {}", contact_id, err);
                report.errors.push(ContactFailure {
                    contact_id: contact_id.clone(),
                    reason: err.to_string(),
                    retryable: err.is_retryable(),
                });
            }
        }
    }

    if contact_ids.is_none() && !report.dispatched_ids.is_empty() {
        let drained = state
            .db
            .lock()
            .remove_from_queue(project_id, &report.dispatched_ids);
        if let Err(e) = drained {
            log::warn!("Dispatch: failed to drain queue for project {}: {}", project_id, e);
        }
    }

    log::info!(
        "Dispatch: project {} dispatched {}/{} contact(s)",
        project_id,
        report.dispatched_ids.len(),
        targets.len()
    );

    if attempted == 0 {
        return Err(DispatchError::NothingToDispatch);
    }
    if report.dispatched_ids.is_empty() {
        return Err(DispatchError::AllContactsFailedInBatch {
            failures: report.errors,
        });
    }

    state.reconcile_wake.notify_one();
    Ok(report)
}

/// Dispatch a single contact ("call now"). Bypasses the queue.
pub async fn dispatch_one(
    state: &AppState,
    project_id: &str,
    contact_id: &str,
) -> Result<BatchReport, DispatchError> {
    let targets = [contact_id.to_string()];
    dispatch_calls(state, project_id, Some(&targets[..])).await
}

async fn dispatch_contact(
    state: &AppState,
    provider: &dyn CallProvider,
    ctx: &BatchContext,
    contact_id: &str,
    attempted: &mut usize,
) -> Result<String, ContactDispatchError> {
    let started_at = now_ts();
    let contact = {
        let db = state.db.lock();
        match db.claim_for_dispatch(&ctx.project.id, contact_id, &started_at)? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::NotFound => return Err(ContactDispatchError::NotFound),
            ClaimOutcome::OptedOut => return Err(ContactDispatchError::OptedOut),
            ClaimOutcome::AlreadyCalling => return Err(ContactDispatchError::AlreadyCalling),
        }
        db.get_contact(contact_id)?
            .ok_or(ContactDispatchError::NotFound)?
    };

    let request = CreateCallRequest {
        assistant_id: ctx.assistant_id.clone(),
        phone_number_id: ctx.phone_number_id.clone(),
        customer_number: contact.phone.clone(),
        customer_name: contact.name.clone(),
    };

    *attempted += 1;
    match provider.create_call(&request).await {
        Ok(call_id) => {
            let recorded = state
                .db
                .lock()
                .record_provider_call_id(contact_id, &call_id)?;
            if !recorded {
                log::warn!(
                    "Dispatch: claim on contact {} lapsed before call {} was recorded",
                    contact_id,
                    call_id
                );
            }
            if ctx.status_probe {
                probe_call(provider, &call_id).await;
            }
            Ok(call_id)
        }
        Err(err) => {
            let entry = CallResultEntry::failure(started_at, err.to_string(), None);
            state.db.lock().fail_dispatch(contact_id, &entry)?;
            Err(err.into())
        }
    }
}

/// Diagnostics only: never fails the dispatch, never changes state.
async fn probe_call(provider: &dyn CallProvider, call_id: &str) {
    match provider.get_call(call_id).await {
        Ok(call) => log::debug!(
            "Dispatch: call {} status={:?} startedAt={:?} endedReason={:?}",
            call_id,
            call.status,
            call.started_at,
            call.ended_reason
        ),
        Err(e) => log::warn!("Dispatch: status probe for call {} failed: {}", call_id, e),
    }
}

fn dedup_in_order(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContactStatus, DbContact};
    use crate::provider::ProviderError;
    use crate::state::test_utils::test_state;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn contact(state: &AppState, id: &str) -> DbContact {
        state.db.lock().get_contact(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_batch_continues_past_failed_contact() {
        let (state, provider) = test_state(5);
        provider.fail_create_for(
            "082 000 0003",
            ProviderError::Api {
                status: 400,
                message: "Invalid number".to_string(),
            },
        );

        let report = dispatch_calls(&state, "p1", Some(ids(&["c1", "c2", "c3", "c4", "c5"]).as_slice()))
            .await
            .unwrap();

        assert_eq!(report.dispatched_ids, ids(&["c1", "c2", "c4", "c5"]));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].contact_id, "c3");
        assert_eq!(report.errors[0].reason, "Invalid number");

        let failed = contact(&state, "c3");
        assert_eq!(failed.status, ContactStatus::Failed);
        let result = failed.call_result.clone().unwrap();
        assert_eq!(result.failure_reason.as_deref(), Some("Invalid number"));
        assert_eq!(result.duration_seconds, 0);

        for id in ["c1", "c2", "c3", "c4", "c5"] {
            assert!(contact(&state, id).satisfies_call_invariant(), "{}", id);
        }
        assert_eq!(contact(&state, "c4").status, ContactStatus::Calling);

        let requests = provider.created_requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[0].phone_number_id, "pn-project");
        assert_eq!(requests[0].assistant_id, "asst-1");
        assert_eq!(requests[0].customer_name.as_deref(), Some("Contact 1"));
    }

    #[tokio::test]
    async fn test_quota_exceeded_attempts_nothing() {
        let (state, provider) = test_state(3);
        state
            .db
            .lock()
            .increment_org_usage("org-1", 10, 0.0)
            .unwrap();

        let err = dispatch_calls(&state, "p1", Some(ids(&["c1", "c2"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QuotaExceeded { .. }));
        assert!(provider.created_requests().is_empty());
        let calling = state
            .db
            .lock()
            .list_contacts("p1", Some(ContactStatus::Calling), 0, 10)
            .unwrap();
        assert_eq!(calling.total, 0);
    }

    #[tokio::test]
    async fn test_missing_assistant_is_configuration_error() {
        let (state, provider) = test_state(1);
        {
            let db = state.db.lock();
            let mut project = db.get_project("p1").unwrap().unwrap();
            project.assistant_id = None;
            db.upsert_project(&project).unwrap();
        }
        let err = dispatch_calls(&state, "p1", Some(ids(&["c1"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
        assert!(provider.created_requests().is_empty());
        assert_eq!(contact(&state, "c1").status, ContactStatus::Pending);
    }

    #[tokio::test]
    async fn test_caller_number_falls_back_to_org_then_config() {
        let (state, provider) = test_state(2);
        {
            let db = state.db.lock();
            let mut project = db.get_project("p1").unwrap().unwrap();
            project.agent_phone_number_id = None;
            db.upsert_project(&project).unwrap();
        }
        let err = dispatch_calls(&state, "p1", Some(ids(&["c1"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));

        state.config.write().provider.default_phone_number_id = Some("pn-env".to_string());
        dispatch_calls(&state, "p1", Some(ids(&["c1"]).as_slice())).await.unwrap();

        state
            .db
            .lock()
            .set_org_default_phone_number("org-1", Some("pn-org"))
            .unwrap();
        dispatch_calls(&state, "p1", Some(ids(&["c2"]).as_slice())).await.unwrap();

        let numbers: Vec<String> = provider
            .created_requests()
            .into_iter()
            .map(|r| r.phone_number_id)
            .collect();
        assert_eq!(numbers, ids(&["pn-env", "pn-org"]));
    }

    #[tokio::test]
    async fn test_all_failed_is_distinct_error() {
        let (state, provider) = test_state(2);
        provider.fail_create_for("082 000 0001", ProviderError::Unreachable("reset".into()));
        provider.fail_create_for("082 000 0002", ProviderError::Unreachable("reset".into()));

        let err = dispatch_calls(&state, "p1", Some(ids(&["c1", "c2"]).as_slice()))
            .await
            .unwrap_err();
        match err {
            DispatchError::AllContactsFailedInBatch { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|f| f.retryable));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(contact(&state, "c1").status, ContactStatus::Failed);
    }

    #[tokio::test]
    async fn test_opted_out_and_in_flight_contacts_are_reported() {
        let (state, provider) = test_state(3);
        state.db.lock().set_opt_out("c1", true).unwrap();
        dispatch_calls(&state, "p1", Some(ids(&["c2"]).as_slice())).await.unwrap();

        let report = dispatch_calls(&state, "p1", Some(ids(&["c1", "c2", "c3", "ghost"]).as_slice()))
            .await
            .unwrap();
        assert_eq!(report.dispatched_ids, ids(&["c3"]));
        let reasons: Vec<&str> = report.errors.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "Contact has opted out",
                "Contact already has a call in progress",
                "Contact not found in project",
            ]
        );
        assert_eq!(contact(&state, "c1").status, ContactStatus::Pending);
        assert_eq!(contact(&state, "c2").provider_call_id.as_deref(), Some("call-1"));
        assert_eq!(provider.created_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_only_ineligible_targets_is_nothing_to_dispatch() {
        let (state, provider) = test_state(2);
        state.db.lock().set_opt_out("c1", true).unwrap();
        state.db.lock().set_opt_out("c2", true).unwrap();

        let err = dispatch_calls(&state, "p1", Some(ids(&["c1", "c2", "ghost"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NothingToDispatch));
        assert!(provider.created_requests().is_empty());
        assert_eq!(contact(&state, "c1").status, ContactStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_assistant_reported_before_quota() {
        let (state, provider) = test_state(1);
        {
            let db = state.db.lock();
            db.increment_org_usage("org-1", 10, 0.0).unwrap();
            let mut project = db.get_project("p1").unwrap().unwrap();
            project.assistant_id = None;
            db.upsert_project(&project).unwrap();
        }
        let err = dispatch_calls(&state, "p1", Some(ids(&["c1"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
        assert!(provider.created_requests().is_empty());
    }

    #[tokio::test]
    async fn test_queue_run_dispatches_due_entries_and_drains_them() {
        let (state, provider) = test_state(3);
        {
            let db = state.db.lock();
            db.add_to_queue("p1", &ids(&["c1", "c2"]), None).unwrap();
            db.add_to_queue("p1", &ids(&["c3"]), Some("2099-01-01T00:00:00Z"))
                .unwrap();
        }

        let report = dispatch_calls(&state, "p1", None).await.unwrap();
        assert_eq!(report.dispatched_ids, ids(&["c1", "c2"]));
        assert_eq!(provider.created_requests().len(), 2);

        let remaining: Vec<String> = state
            .db
            .lock()
            .list_queue("p1")
            .unwrap()
            .into_iter()
            .map(|e| e.contact_id)
            .collect();
        assert_eq!(remaining, ids(&["c3"]));
    }

    #[tokio::test]
    async fn test_empty_queue_is_nothing_to_dispatch() {
        let (state, _provider) = test_state(1);
        let err = dispatch_calls(&state, "p1", None).await.unwrap_err();
        assert!(matches!(err, DispatchError::NothingToDispatch));
    }

    #[tokio::test]
    async fn test_call_now_bypasses_queue() {
        let (state, _provider) = test_state(2);
        state
            .db
            .lock()
            .add_to_queue("p1", &ids(&["c1"]), None)
            .unwrap();
        let report = dispatch_one(&state, "p1", "c1").await.unwrap();
        assert_eq!(report.dispatched_ids, ids(&["c1"]));
        assert_eq!(state.db.lock().list_queue("p1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal() {
        let (state, provider) = test_state(1);
        provider.set_call_error("call-1", ProviderError::Unreachable("connection reset".into()));
        let report = dispatch_calls(&state, "p1", Some(ids(&["c1"]).as_slice())).await.unwrap();
        assert_eq!(report.dispatched_ids, ids(&["c1"]));
        assert_eq!(provider.get_call_count(), 1);
        assert_eq!(contact(&state, "c1").status, ContactStatus::Calling);
    }

    #[tokio::test]
    async fn test_unknown_project_and_missing_provider() {
        let (state, _provider) = test_state(1);
        let err = dispatch_calls(&state, "nope", Some(ids(&["c1"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProjectNotFound(_)));

        let unconfigured = AppState::new(
            crate::types::Config::default(),
            crate::db::test_utils::test_db(),
        );
        let err = dispatch_calls(&unconfigured, "p1", Some(ids(&["c1"]).as_slice()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration(_)));
    }

    #[test]
    fn test_dedup_keeps_caller_order() {
        assert_eq!(
            dedup_in_order(&ids(&["c2", " c1 ", "c2", "", "c3"])),
            ids(&["c2", "c1", "c3"])
        );
    }
}
