//! Status reconciliation.
//!
//! Merges provider call outcomes into the contact store. Polling
//! (`reconcile_project`) and push (`apply_call_report`) both settle through
//! `CampaignDb::complete_call`, which only applies while the contact still holds
//! the observed provider call id. That makes every pass idempotent and meters
//! each call exactly once, however many passes or deliveries observe it.

pub mod outcome;
pub mod poller;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{CallResultEntry, DbContact, DbError};
use crate::error::ReconcileError;
use crate::provider::{CallArtifact, ProviderCall, ProviderError};
use crate::state::AppState;
use crate::util::{format_ts, parse_ts};

pub use outcome::{is_terminal, terminal_outcome};

const ORPHAN_REASON: &str = "call id was never recorded";
const ABANDONED_REASON: &str = "call abandoned";
const PURGED_REASON: &str = "provider no longer has this call";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Contacts settled by this pass.
    pub synced_count: usize,
    /// Of those, settled as failed without being metered.
    pub abandoned: usize,
    pub still_in_progress: usize,
    /// Skipped because the provider could not be asked (retried next pass
    /// until the stale bound).
    pub skipped: usize,
}

/// Reconcile every `calling` contact of one project against the provider.
pub async fn reconcile_project(
    state: &AppState,
    project_id: &str,
) -> Result<ReconcileReport, ReconcileError> {
    let provider = state.call_provider().ok_or_else(|| {
        ReconcileError::Configuration("VAPI_API_KEY is not set".to_string())
    })?;
    let settings = state.config.read().reconcile.clone();
    let now = Utc::now();
    let orphan_cutoff = format_ts(now - Duration::minutes(settings.orphan_claim_minutes as i64));
    let stale_after = Duration::hours(settings.stale_call_hours as i64);

    let (capture_keys, candidates, orphans) = {
        let db = state.db.lock();
        let project = db
            .get_project(project_id)?
            .ok_or_else(|| ReconcileError::ProjectNotFound(project_id.to_string()))?;
        (
            project.capture_field_keys(),
            db.reconcile_candidates(project_id)?,
            db.orphan_claims(project_id, &orphan_cutoff)?,
        )
    };

    let mut report = ReconcileReport::default();

    for orphan in &orphans {
        let entry = CallResultEntry::failure(
            orphan
                .dispatch_started_at
                .clone()
                .unwrap_or_else(|| format_ts(now)),
            ORPHAN_REASON,
            None,
        );
        let settled = state.db.lock().fail_orphan_claim(
            &orphan.id,
            orphan.dispatch_started_at.as_deref(),
            &entry,
        );
        record_abandoned(&mut report, &orphan.id, ORPHAN_REASON, settled);
    }

    for contact in &candidates {
        let Some(call_id) = contact.provider_call_id.as_deref() else {
            continue;
        };

        match provider.get_call(call_id).await {
            Ok(call) if is_terminal(&call) => {
                let entry = terminal_outcome(&call, &capture_keys, Utc::now());
                let settled = state.db.lock().complete_call(&contact.id, call_id, &entry);
                match settled {
                    Ok(true) => {
                        report.synced_count += 1;
                        log::info!(
                            "Reconcile: contact {} call {} ended ({}) -> {}",
                            contact.id,
                            call_id,
                            entry.ended_reason.as_deref().unwrap_or("no reason"),
                            if entry.is_failure() { "failed" } else { "success" }
                        );
                    }
                    Ok(false) => {
                        log::debug!("Reconcile: call {} already settled elsewhere", call_id)
                    }
                    Err(e) => log::warn!("Reconcile: failed to settle call {}: {}", call_id, e),
                }
            }
            Ok(call) => {
                if is_stale(contact, now, stale_after) {
                    let entry = abandoned_entry(contact, call_id, ABANDONED_REASON, now);
                    let settled = state.db.lock().abandon_call(&contact.id, call_id, &entry);
                    record_abandoned(&mut report, &contact.id, ABANDONED_REASON, settled);
                } else {
                    report.still_in_progress += 1;
                    log::debug!(
                        "Reconcile: call {} still {}",
                        call_id,
                        call.status.as_deref().unwrap_or("unknown")
                    );
                }
            }
            Err(ProviderError::NotFound(_)) => {
                let entry = abandoned_entry(contact, call_id, PURGED_REASON, now);
                let settled = state.db.lock().abandon_call(&contact.id, call_id, &entry);
                record_abandoned(&mut report, &contact.id, PURGED_REASON, settled);
            }
            Err(e) if is_stale(contact, now, stale_after) => {
                log::warn!("Reconcile: call {} past stale bound, last error: {}", call_id, e);
                let entry = abandoned_entry(contact, call_id, ABANDONED_REASON, now);
                let settled = state.db.lock().abandon_call(&contact.id, call_id, &entry);
                record_abandoned(&mut report, &contact.id, ABANDONED_REASON, settled);
            }
            Err(e) => {
                report.skipped += 1;
                log::warn!("Reconcile: could not fetch call {}: {}", call_id, e);
            }
        }
    }

    if report.synced_count > 0 || report.skipped > 0 {
        log::info!(
            "Reconcile: project {} synced {} contact(s), {} in progress, {} skipped",
            project_id,
            report.synced_count,
            report.still_in_progress,
            report.skipped
        );
    }
    Ok(report)
}

/// Reconcile every project that has contacts mid-call. Returns total synced.
pub async fn reconcile_all(state: &AppState) -> Result<usize, ReconcileError> {
    let project_ids = state.db.lock().projects_with_calling_contacts()?;
    let mut synced = 0;
    for project_id in project_ids {
        match reconcile_project(state, &project_id).await {
            Ok(report) => synced += report.synced_count,
            Err(e @ ReconcileError::Configuration(_)) => return Err(e),
            Err(e) => log::warn!("Reconcile: project {} failed: {}", project_id, e),
        }
    }
    Ok(synced)
}

fn is_stale(contact: &DbContact, now: DateTime<Utc>, stale_after: Duration) -> bool {
    contact
        .dispatch_started_at
        .as_deref()
        .or(Some(contact.updated_at.as_str()))
        .and_then(parse_ts)
        .map_or(false, |started| now - started > stale_after)
}

fn abandoned_entry(
    contact: &DbContact,
    call_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> CallResultEntry {
    CallResultEntry::failure(
        contact
            .dispatch_started_at
            .clone()
            .unwrap_or_else(|| format_ts(now)),
        reason,
        Some(call_id.to_string()),
    )
}

fn record_abandoned(
    report: &mut ReconcileReport,
    contact_id: &str,
    reason: &str,
    settled: Result<bool, DbError>,
) {
    match settled {
        Ok(true) => {
            report.synced_count += 1;
            report.abandoned += 1;
            log::warn!("Reconcile: contact {} failed: {}", contact_id, reason);
        }
        Ok(false) => {}
        Err(e) => log::warn!("Reconcile: failed to settle contact {}: {}", contact_id, e),
    }
}

// =============================================================================
// Push ingestion
// =============================================================================

/// Provider end-of-call webhook body (the subset we use).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndOfCallReport {
    #[serde(default)]
    pub message: Option<ReportMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMessage {
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub ended_reason: Option<String>,
    #[serde(default)]
    pub call: Option<ReportCall>,
    #[serde(default)]
    pub artifact: Option<CallArtifact>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCall {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportOutcome {
    /// Not an end-of-call report, or no call id.
    Ignored,
    /// No contact currently holds this call (already settled, or not ours).
    NotTracked,
    Applied,
}

/// Apply a pushed end-of-call report through the same conditional settle as polling.
pub fn apply_call_report(
    state: &AppState,
    report: &EndOfCallReport,
) -> Result<ReportOutcome, ReconcileError> {
    let Some(message) = report.message.as_ref() else {
        return Ok(ReportOutcome::Ignored);
    };
    if message.message_type.as_deref() != Some("end-of-call-report") {
        return Ok(ReportOutcome::Ignored);
    }
    let Some(call) = message.call.as_ref() else {
        return Ok(ReportOutcome::Ignored);
    };
    let Some(call_id) = call.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(ReportOutcome::Ignored);
    };

    let db = state.db.lock();
    let Some(contact) = db.find_contact_by_provider_call(call_id)? else {
        log::debug!("Reconcile: report for untracked call {}", call_id);
        return Ok(ReportOutcome::NotTracked);
    };
    let capture_keys = db
        .get_project(&contact.project_id)?
        .map(|p| p.capture_field_keys())
        .unwrap_or_default();

    let provider_call = ProviderCall {
        id: call_id.to_string(),
        status: Some("ended".to_string()),
        ended_reason: message.ended_reason.clone(),
        created_at: None,
        started_at: call.started_at.clone(),
        ended_at: call.ended_at.clone(),
        artifact: message.artifact.clone(),
    };
    let entry = terminal_outcome(&provider_call, &capture_keys, Utc::now());

    if db.complete_call(&contact.id, call_id, &entry)? {
        log::info!(
            "Reconcile: report applied for contact {} call {}",
            contact.id,
            call_id
        );
        Ok(ReportOutcome::Applied)
    } else {
        Ok(ReportOutcome::NotTracked)
    }
}
