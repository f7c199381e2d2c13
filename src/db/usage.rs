//! Org-level usage meter.
//!
//! Counters only ever grow, and only through `increment_org_usage`, which is a
//! single `SET x = x + ?` statement. Callers never read-modify-write.

use rusqlite::{params, OptionalExtension};

use super::*;
use crate::util::now_ts;

impl CampaignDb {
    /// Insert or update an organization's name and plan limits. Counters are
    /// never touched here.
    pub fn upsert_organization(
        &self,
        id: &str,
        name: &str,
        calls_limit: Option<i64>,
        minutes_limit: Option<f64>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO organizations (id, name, calls_limit, minutes_limit, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                calls_limit = excluded.calls_limit,
                minutes_limit = excluded.minutes_limit,
                updated_at = excluded.updated_at",
            params![id, name, calls_limit, minutes_limit, now_ts()],
        )?;
        Ok(())
    }

    /// Set the caller number used when a project has none of its own.
    pub fn set_org_default_phone_number(
        &self,
        org_id: &str,
        phone_number_id: Option<&str>,
    ) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE organizations SET default_phone_number_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![phone_number_id, now_ts(), org_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_org_default_phone_number(&self, org_id: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT default_phone_number_id FROM organizations WHERE id = ?1",
                params![org_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// Current counters and limits for an org.
    pub fn get_org_usage(&self, org_id: &str) -> Result<Option<UsageCounters>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, calls_used, minutes_used, calls_limit, minutes_limit
                 FROM organizations WHERE id = ?1",
                params![org_id],
                |row| {
                    Ok(UsageCounters {
                        org_id: row.get(0)?,
                        calls_used: row.get(1)?,
                        minutes_used: row.get(2)?,
                        calls_limit: row.get(3)?,
                        minutes_limit: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Atomically add to an org's counters. Returns false if the org does not exist.
    pub fn increment_org_usage(
        &self,
        org_id: &str,
        calls_delta: i64,
        minutes_delta: f64,
    ) -> Result<bool, DbError> {
        if calls_delta < 0 || minutes_delta < 0.0 || !minutes_delta.is_finite() {
            return Err(DbError::InvalidArgument(format!(
                "usage deltas must be non-negative (calls {}, minutes {})",
                calls_delta, minutes_delta
            )));
        }
        let changed = self.conn.execute(
            "UPDATE organizations
             SET calls_used = calls_used + ?1, minutes_used = minutes_used + ?2, updated_at = ?3
             WHERE id = ?4",
            params![calls_delta, minutes_delta, now_ts(), org_id],
        )?;
        Ok(changed > 0)
    }
}
