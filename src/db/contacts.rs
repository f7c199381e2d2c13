use rusqlite::{params, types::Type, OptionalExtension};

use super::*;
use crate::util::now_ts;

const CONTACT_COLUMNS: &str = "id, project_id, phone, name, status, opt_out, provider_call_id,
     last_provider_call_id, dispatch_started_at, call_result_json, created_at, updated_at";

/// Result of trying to move a contact into `calling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    NotFound,
    OptedOut,
    AlreadyCalling,
}

fn conversion_error(
    col: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(err))
}

impl CampaignDb {
    /// Helper: map a row selected with `CONTACT_COLUMNS` to `DbContact`.
    /// History is not loaded here.
    pub(crate) fn map_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbContact> {
        let status = row
            .get::<_, String>(4)?
            .parse::<ContactStatus>()
            .map_err(|e| conversion_error(4, e))?;
        let call_result = row
            .get::<_, Option<String>>(9)?
            .map(|json| serde_json::from_str::<CallResultEntry>(&json))
            .transpose()
            .map_err(|e| conversion_error(9, e))?;

        Ok(DbContact {
            id: row.get(0)?,
            project_id: row.get(1)?,
            phone: row.get(2)?,
            name: row.get(3)?,
            status,
            opt_out: row.get::<_, i32>(5)? != 0,
            provider_call_id: row.get(6)?,
            last_provider_call_id: row.get(7)?,
            dispatch_started_at: row.get(8)?,
            call_result,
            call_history: Vec::new(),
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn query_contacts(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DbContact>, DbError> {
        let sql = format!("SELECT {} FROM contacts WHERE {}", CONTACT_COLUMNS, where_clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params, Self::map_contact_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn with_history(&self, mut contacts: Vec<DbContact>) -> Result<Vec<DbContact>, DbError> {
        for contact in &mut contacts {
            contact.call_history = self.get_call_history(&contact.id)?;
        }
        Ok(contacts)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Insert a new `pending` contact.
    pub fn insert_contact(&self, contact: &NewContact<'_>) -> Result<(), DbError> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO contacts (id, project_id, phone, name, status, opt_out, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
            params![
                contact.id,
                contact.project_id,
                contact.phone,
                contact.name,
                contact.opt_out as i32,
                now,
            ],
        )?;
        Ok(())
    }

    /// Get a contact by ID with its full call history.
    pub fn get_contact(&self, id: &str) -> Result<Option<DbContact>, DbError> {
        let mut contacts = self.query_contacts("id = ?1", params![id])?;
        match contacts.pop() {
            Some(contact) => Ok(self.with_history(vec![contact])?.pop()),
            None => Ok(None),
        }
    }

    /// Look up the contact currently holding a provider call.
    pub fn find_contact_by_provider_call(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<DbContact>, DbError> {
        Ok(self
            .query_contacts("provider_call_id = ?1", params![provider_call_id])?
            .pop())
    }

    /// List a project's contacts, optionally filtered by status, oldest first.
    pub fn list_contacts(
        &self,
        project_id: &str,
        status: Option<ContactStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<ContactPage, DbError> {
        let status = status.map(|s| s.as_str());
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM contacts
             WHERE project_id = ?1 AND (?2 IS NULL OR status = ?2)",
            params![project_id, status],
            |row| row.get(0),
        )?;
        let contacts = self.query_contacts(
            "project_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, id LIMIT ?3 OFFSET ?4",
            params![project_id, status, limit as i64, offset as i64],
        )?;
        Ok(ContactPage {
            contacts: self.with_history(contacts)?,
            total: total as usize,
        })
    }

    /// Contacts mid-call with a recorded provider call id. History not loaded.
    pub fn reconcile_candidates(&self, project_id: &str) -> Result<Vec<DbContact>, DbError> {
        self.query_contacts(
            "project_id = ?1 AND status = 'calling' AND provider_call_id IS NOT NULL
             ORDER BY dispatch_started_at",
            params![project_id],
        )
    }

    /// Contacts claimed for dispatch before `claimed_before` whose provider call id
    /// was never stored. History not loaded.
    pub fn orphan_claims(
        &self,
        project_id: &str,
        claimed_before: &str,
    ) -> Result<Vec<DbContact>, DbError> {
        self.query_contacts(
            "project_id = ?1 AND status = 'calling' AND provider_call_id IS NULL
             AND (dispatch_started_at IS NULL OR dispatch_started_at < ?2)",
            params![project_id, claimed_before],
        )
    }

    /// Projects that currently have at least one contact in `calling`.
    pub fn projects_with_calling_contacts(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT project_id FROM contacts WHERE status = 'calling' ORDER BY project_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// A contact's call history, oldest first.
    pub fn get_call_history(&self, contact_id: &str) -> Result<Vec<CallResultEntry>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entry_json FROM call_history WHERE contact_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![contact_id], |row| row.get::<_, String>(0))?;
        let mut entries = Vec::new();
        for json in rows {
            entries.push(serde_json::from_str(&json?)?);
        }
        Ok(entries)
    }

    /// Per-status counts plus minutes across the project's recorded calls.
    pub fn project_stats(&self, project_id: &str) -> Result<ProjectCallStats, DbError> {
        let mut stats = ProjectCallStats::default();
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM contacts WHERE project_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            match status.parse::<ContactStatus>()? {
                ContactStatus::Pending => stats.pending = count,
                ContactStatus::Calling => stats.calling = count,
                ContactStatus::Success => stats.success = count,
                ContactStatus::Failed => stats.failed = count,
            }
        }

        let seconds: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(h.duration_seconds), 0)
             FROM call_history h JOIN contacts c ON c.id = h.contact_id
             WHERE c.project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        stats.total_minutes = seconds as f64 / 60.0;
        Ok(stats)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Set or clear a contact's opt-out flag.
    pub fn set_opt_out(&self, contact_id: &str, opt_out: bool) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE contacts SET opt_out = ?1, updated_at = ?2 WHERE id = ?3",
            params![opt_out as i32, now_ts(), contact_id],
        )?;
        Ok(changed > 0)
    }

    /// Move a contact into `calling` ahead of call creation.
    ///
    /// The contact holds no provider call id until `record_provider_call_id`.
    /// A contact already in `calling` is never claimed twice.
    pub fn claim_for_dispatch(
        &self,
        project_id: &str,
        contact_id: &str,
        started_at: &str,
    ) -> Result<ClaimOutcome, DbError> {
        self.with_transaction(|db| {
            let row: Option<(String, i32)> = db
                .conn
                .query_row(
                    "SELECT status, opt_out FROM contacts WHERE id = ?1 AND project_id = ?2",
                    params![contact_id, project_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((status, opt_out)) = row else {
                return Ok(ClaimOutcome::NotFound);
            };
            if opt_out != 0 {
                return Ok(ClaimOutcome::OptedOut);
            }
            if !status.parse::<ContactStatus>()?.can_dispatch() {
                return Ok(ClaimOutcome::AlreadyCalling);
            }

            let changed = db.conn.execute(
                "UPDATE contacts
                 SET status = 'calling', provider_call_id = NULL,
                     dispatch_started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND project_id = ?3 AND status != 'calling' AND opt_out = 0",
                params![started_at, contact_id, project_id],
            )?;
            Ok(if changed == 1 {
                ClaimOutcome::Claimed
            } else {
                ClaimOutcome::AlreadyCalling
            })
        })
    }

    /// Store the provider call id on a claimed contact. Returns false when the
    /// claim no longer stands (e.g. swept as an orphan in the meantime).
    pub fn record_provider_call_id(
        &self,
        contact_id: &str,
        provider_call_id: &str,
    ) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE contacts SET provider_call_id = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'calling' AND provider_call_id IS NULL",
            params![provider_call_id, now_ts(), contact_id],
        )?;
        Ok(changed == 1)
    }

    /// Fail a claimed contact whose call could not be created.
    pub fn fail_dispatch(&self, contact_id: &str, entry: &CallResultEntry) -> Result<bool, DbError> {
        self.fail_unrecorded_call(contact_id, None, entry)
    }

    /// Fail a claim that never received a provider call id. Only applies while the
    /// claim observed at `claimed_at` is still the current one.
    pub fn fail_orphan_claim(
        &self,
        contact_id: &str,
        claimed_at: Option<&str>,
        entry: &CallResultEntry,
    ) -> Result<bool, DbError> {
        self.fail_unrecorded_call(contact_id, Some(claimed_at.unwrap_or("")), entry)
    }

    fn fail_unrecorded_call(
        &self,
        contact_id: &str,
        claimed_at: Option<&str>,
        entry: &CallResultEntry,
    ) -> Result<bool, DbError> {
        if !entry.is_failure() {
            return Err(DbError::InvalidArgument(
                "an unrecorded call can only settle as a failure".to_string(),
            ));
        }
        self.with_transaction(|db| {
            let json = serde_json::to_string(entry)?;
            let changed = db.conn.execute(
                "UPDATE contacts
                 SET status = 'failed', call_result_json = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'calling' AND provider_call_id IS NULL
                   AND (?4 IS NULL OR COALESCE(dispatch_started_at, '') = ?4)",
                params![json, now_ts(), contact_id, claimed_at],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            db.append_history(contact_id, entry)?;
            Ok(true)
        })
    }

    /// Settle a terminal call: status, latest result, history, usage.
    ///
    /// Applies only while the contact still holds `provider_call_id`; a second
    /// observation of the same call changes nothing and meters nothing.
    pub fn complete_call(
        &self,
        contact_id: &str,
        provider_call_id: &str,
        entry: &CallResultEntry,
    ) -> Result<bool, DbError> {
        self.settle_tracked_call(contact_id, provider_call_id, entry, true)
    }

    /// Fail a tracked call without metering it (abandoned or purged by the provider).
    pub fn abandon_call(
        &self,
        contact_id: &str,
        provider_call_id: &str,
        entry: &CallResultEntry,
    ) -> Result<bool, DbError> {
        if !entry.is_failure() {
            return Err(DbError::InvalidArgument(
                "an abandoned call must carry a failure reason".to_string(),
            ));
        }
        self.settle_tracked_call(contact_id, provider_call_id, entry, false)
    }

    fn settle_tracked_call(
        &self,
        contact_id: &str,
        provider_call_id: &str,
        entry: &CallResultEntry,
        meter: bool,
    ) -> Result<bool, DbError> {
        let status = if entry.is_failure() {
            ContactStatus::Failed
        } else {
            ContactStatus::Success
        };

        self.with_transaction(|db| {
            let json = serde_json::to_string(entry)?;
            let changed = db.conn.execute(
                "UPDATE contacts
                 SET status = ?1, call_result_json = ?2,
                     last_provider_call_id = provider_call_id, provider_call_id = NULL,
                     updated_at = ?3
                 WHERE id = ?4 AND status = 'calling' AND provider_call_id = ?5",
                params![status.as_str(), json, now_ts(), contact_id, provider_call_id],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            db.append_history(contact_id, entry)?;

            if meter {
                let org_id: Option<String> = db
                    .conn
                    .query_row(
                        "SELECT p.org_id FROM contacts c JOIN projects p ON p.id = c.project_id
                         WHERE c.id = ?1",
                        params![contact_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let minutes = entry.duration_seconds as f64 / 60.0;
                let metered = match org_id {
                    Some(org_id) => db.increment_org_usage(&org_id, 1, minutes)?,
                    None => false,
                };
                if !metered {
                    log::warn!(
                        "Usage: no organization for contact {}; call {} not metered",
                        contact_id,
                        provider_call_id
                    );
                }
            }
            Ok(true)
        })
    }

    fn append_history(&self, contact_id: &str, entry: &CallResultEntry) -> Result<(), DbError> {
        let json = serde_json::to_string(entry)?;
        self.conn.execute(
            "INSERT INTO call_history (
                contact_id, provider_call_id, attempted_at, duration_seconds,
                failure_reason, entry_json, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contact_id,
                entry.provider_call_id,
                entry.attempted_at,
                entry.duration_seconds,
                entry.failure_reason,
                json,
                now_ts(),
            ],
        )?;
        Ok(())
    }
}
