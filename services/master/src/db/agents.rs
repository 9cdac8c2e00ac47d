//! Historical agent inventory.

use chrono::{DateTime, Utc};
use gantry_events::DeviceKind;
use gantry_id::AgentId;
use rusqlite::params;

use super::{corrupt, DbError, Store};

/// One agent as last seen by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRow {
    pub agent_id: AgentId,
    pub pool: String,
    pub slots: Vec<DeviceKind>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Store {
    /// Record an agent's slot inventory, keeping its first sighting.
    pub fn upsert_agent(
        &self,
        agent_id: &AgentId,
        pool: &str,
        slots: &[DeviceKind],
        seen_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let slots_json = serde_json::to_string(slots)?;
        let seen_at = seen_at.to_rfc3339();
        self.conn().execute(
            r#"
            INSERT INTO agents (agent_id, pool, slots_json, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(agent_id) DO UPDATE SET
                pool = excluded.pool,
                slots_json = excluded.slots_json,
                last_seen = excluded.last_seen
            "#,
            params![agent_id.to_string(), pool, slots_json, seen_at],
        )?;
        Ok(())
    }

    /// Every agent ever registered, in id order.
    pub fn load_inventory(&self) -> Result<Vec<InventoryRow>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT agent_id, pool, slots_json, first_seen, last_seen FROM agents ORDER BY agent_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut inventory = Vec::new();
        for row in rows {
            let (agent_id, pool, slots_json, first_seen, last_seen) = row?;
            inventory.push(InventoryRow {
                agent_id: agent_id.parse().map_err(|e| corrupt("agents", e))?,
                pool,
                slots: serde_json::from_str(&slots_json)?,
                first_seen: parse_ts("agents", &first_seen)?,
                last_seen: parse_ts("agents", &last_seen)?,
            });
        }
        Ok(inventory)
    }
}

pub(super) fn parse_ts(table: &'static str, value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(table, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_first_seen() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let first = Utc::now() - chrono::Duration::hours(1);
        let later = Utc::now();

        store
            .upsert_agent(&agent, "compute", &[DeviceKind::gpu()], first)
            .unwrap();
        store
            .upsert_agent(&agent, "compute", &[DeviceKind::gpu(), DeviceKind::gpu()], later)
            .unwrap();

        let inventory = store.load_inventory().unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].slots.len(), 2);
        assert_eq!(inventory[0].first_seen.timestamp(), first.timestamp());
        assert_eq!(inventory[0].last_seen.timestamp(), later.timestamp());
    }
}
