//! Dispatch queue: an advisory (project, contact) membership set.
//!
//! Queue membership never affects contact status. It only supplies the default
//! target set when a batch is started without explicit contact ids.

use rusqlite::params;

use super::*;
use crate::util::{format_ts, now_ts, parse_ts};

impl CampaignDb {
    /// Add contacts to a project's queue. Ids that are not contacts of the project
    /// are ignored. A `None` schedule keeps any existing one; `Some` replaces it.
    ///
    /// Returns how many contacts are now queued from this call.
    pub fn add_to_queue(
        &self,
        project_id: &str,
        contact_ids: &[String],
        scheduled_time: Option<&str>,
    ) -> Result<usize, DbError> {
        let scheduled_time = match scheduled_time {
            Some(raw) => Some(parse_ts(raw).map(format_ts).ok_or_else(|| {
                DbError::InvalidArgument(format!("invalid scheduled time '{}'", raw))
            })?),
            None => None,
        };
        let now = now_ts();

        self.with_transaction(|db| {
            let mut queued = 0;
            for contact_id in contact_ids {
                queued += db.conn.execute(
                    "INSERT INTO queue_entries (project_id, contact_id, scheduled_time, added_at)
                     SELECT project_id, id, ?3, ?4 FROM contacts
                     WHERE id = ?2 AND project_id = ?1
                     ON CONFLICT(project_id, contact_id) DO UPDATE SET
                        scheduled_time = COALESCE(excluded.scheduled_time, queue_entries.scheduled_time)",
                    params![project_id, contact_id, scheduled_time, now],
                )?;
            }
            Ok(queued)
        })
    }

    /// Remove contacts from a project's queue, dropping their schedule.
    pub fn remove_from_queue(
        &self,
        project_id: &str,
        contact_ids: &[String],
    ) -> Result<usize, DbError> {
        self.with_transaction(|db| {
            let mut removed = 0;
            for contact_id in contact_ids {
                removed += db.conn.execute(
                    "DELETE FROM queue_entries WHERE project_id = ?1 AND contact_id = ?2",
                    params![project_id, contact_id],
                )?;
            }
            Ok(removed)
        })
    }

    /// Queue membership with scheduling metadata, in insertion order.
    pub fn list_queue(&self, project_id: &str) -> Result<Vec<DbQueueEntry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, contact_id, scheduled_time, added_at
             FROM queue_entries WHERE project_id = ?1
             ORDER BY added_at, rowid",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok(DbQueueEntry {
                project_id: row.get(0)?,
                contact_id: row.get(1)?,
                scheduled_time: row.get(2)?,
                added_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Queued contacts that are due at `now`: unscheduled, or scheduled at or before it.
    pub fn due_queue_contact_ids(&self, project_id: &str, now: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_id FROM queue_entries
             WHERE project_id = ?1 AND (scheduled_time IS NULL OR scheduled_time <= ?2)
             ORDER BY added_at, rowid",
        )?;
        let rows = stmt.query_map(params![project_id, now], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
