use rusqlite::{params, types::Type};

use super::*;
use crate::util::now_ts;

impl CampaignDb {
    // =========================================================================
    // Projects
    // =========================================================================

    /// Helper: map a row to `DbProject`.
    pub(crate) fn map_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbProject> {
        let capture_fields_json: String = row.get(5)?;
        let capture_fields = serde_json::from_str(&capture_fields_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
        })?;
        Ok(DbProject {
            id: row.get(0)?,
            org_id: row.get(1)?,
            name: row.get(2)?,
            assistant_id: row.get(3)?,
            agent_phone_number_id: row.get(4)?,
            capture_fields,
            updated_at: row.get(6)?,
        })
    }

    /// Insert or update a project.
    pub fn upsert_project(&self, project: &DbProject) -> Result<(), DbError> {
        let capture_fields_json = serde_json::to_string(&project.capture_fields)?;
        self.conn.execute(
            "INSERT INTO projects (
                id, org_id, name, assistant_id, agent_phone_number_id,
                capture_fields_json, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                org_id = excluded.org_id,
                name = excluded.name,
                assistant_id = excluded.assistant_id,
                agent_phone_number_id = excluded.agent_phone_number_id,
                capture_fields_json = excluded.capture_fields_json,
                updated_at = excluded.updated_at",
            params![
                project.id,
                project.org_id,
                project.name,
                project.assistant_id,
                project.agent_phone_number_id,
                capture_fields_json,
                project.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a project by ID.
    pub fn get_project(&self, id: &str) -> Result<Option<DbProject>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, name, assistant_id, agent_phone_number_id,
                    capture_fields_json, updated_at
             FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], Self::map_project_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Store the provider assistant created for a project.
    pub fn set_assistant_id(&self, project_id: &str, assistant_id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE projects SET assistant_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![assistant_id, now_ts(), project_id],
        )?;
        Ok(changed > 0)
    }
}
