//! Appended task log records.

use gantry_events::LogRecord;
use gantry_id::AllocationId;
use rusqlite::params;

use super::{DbError, Store};

impl Store {
    /// Append a batch of sequenced records in one transaction.
    pub fn append_logs(&self, records: &[LogRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO task_logs (allocation_id, seq, ts, record_json) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.allocation_id.to_string(),
                    record.seq.value() as i64,
                    record.timestamp.to_rfc3339(),
                    serde_json::to_string(record)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All records of one allocation in append order.
    pub fn load_logs(&self, id: &AllocationId) -> Result<Vec<LogRecord>, DbError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT record_json FROM task_logs WHERE allocation_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }
}
