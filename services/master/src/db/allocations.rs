//! Allocation records and their transition history.

use chrono::Utc;
use gantry_events::AllocationEventEnvelope;
use gantry_id::AllocationId;
use rusqlite::{params, OptionalExtension};

use super::{DbError, Store};
use crate::allocation::Allocation;

impl Store {
    /// Insert or replace the current record of an allocation.
    pub fn save_allocation(&self, allocation: &Allocation) -> Result<(), DbError> {
        let record_json = serde_json::to_string(allocation)?;
        self.conn().execute(
            r#"
            INSERT INTO allocations (allocation_id, pool, record_json, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(allocation_id) DO UPDATE SET
                record_json = excluded.record_json,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                allocation.id.to_string(),
                allocation.request.pool,
                record_json,
                allocation.state.name(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Save the record together with the history entries that produced it.
    ///
    /// Entries must continue the stored sequence without gaps.
    pub fn record_transitions(
        &self,
        allocation: &Allocation,
        entries: &[AllocationEventEnvelope],
    ) -> Result<(), DbError> {
        let record_json = serde_json::to_string(allocation)?;
        let id = allocation.id.to_string();

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let last: Option<i64> = tx.query_row(
            "SELECT MAX(seq) FROM allocation_events WHERE allocation_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let mut expected = last.map(|s| s as u64 + 1).unwrap_or(1);

        for entry in entries {
            if entry.seq.value() != expected {
                return Err(DbError::SequenceConflict {
                    allocation_id: id,
                    expected,
                    actual: entry.seq.value(),
                });
            }
            tx.execute(
                "INSERT INTO allocation_events (allocation_id, seq, event_json, occurred_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    entry.seq.value() as i64,
                    serde_json::to_string(entry)?,
                    entry.occurred_at.to_rfc3339(),
                ],
            )?;
            expected += 1;
        }

        tx.execute(
            r#"
            INSERT INTO allocations (allocation_id, pool, record_json, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(allocation_id) DO UPDATE SET
                record_json = excluded.record_json,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                id,
                allocation.request.pool,
                record_json,
                allocation.state.name(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn load_allocation(&self, id: &AllocationId) -> Result<Option<Allocation>, DbError> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record_json FROM allocations WHERE allocation_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn allocation_exists(&self, id: &AllocationId) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM allocations WHERE allocation_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Every allocation not yet terminated, oldest first.
    pub fn load_active_allocations(&self) -> Result<Vec<Allocation>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT record_json FROM allocations WHERE state != 'terminated' ORDER BY allocation_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut allocations = Vec::new();
        for row in rows {
            allocations.push(serde_json::from_str(&row?)?);
        }
        Ok(allocations)
    }

    /// Full transition history of one allocation, in sequence order.
    pub fn load_history(
        &self,
        id: &AllocationId,
    ) -> Result<Vec<AllocationEventEnvelope>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_json FROM allocation_events WHERE allocation_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

        let mut history = Vec::new();
        for row in rows {
            history.push(serde_json::from_str(&row?)?);
        }
        Ok(history)
    }
}
