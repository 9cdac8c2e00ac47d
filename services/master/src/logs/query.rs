//! Log filters, ordering, and pagination.

use chrono::{DateTime, Utc};
use gantry_events::{LogLevel, LogRecord, StdType};
use gantry_id::AgentId;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: usize = 1000;
pub const MAX_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Record predicate. Empty lists match everything; a non-empty list
/// matches records whose dimension equals any listed value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Inclusive lower bound on the timestamp.
    pub after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the timestamp.
    pub before: Option<DateTime<Utc>>,
    pub agent_ids: Vec<AgentId>,
    pub container_ids: Vec<String>,
    pub ranks: Vec<u32>,
    pub sources: Vec<String>,
    pub stdtypes: Vec<StdType>,
    pub levels: Vec<LogLevel>,
    /// Substring of the message.
    pub search: Option<String>,
}

fn any_of<T: PartialEq>(wanted: &[T], value: Option<&T>) -> bool {
    wanted.is_empty() || value.is_some_and(|v| wanted.contains(v))
}

impl LogFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        if self.after.is_some_and(|after| record.timestamp < after) {
            return false;
        }
        if self.before.is_some_and(|before| record.timestamp > before) {
            return false;
        }
        if !self.levels.is_empty() && !self.levels.contains(&record.level) {
            return false;
        }
        if let Some(search) = &self.search {
            if !record.message.contains(search.as_str()) {
                return false;
            }
        }
        any_of(&self.agent_ids, record.agent_id.as_ref())
            && any_of(&self.container_ids, record.container_id.as_ref())
            && any_of(&self.ranks, record.rank.as_ref())
            && any_of(&self.sources, record.source.as_ref())
            && any_of(&self.stdtypes, record.stdtype.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub filter: LogFilter,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl LogQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }

    /// Filter, sort by (timestamp, seq), then page.
    pub fn apply<'a, I>(&self, records: I) -> Vec<LogRecord>
    where
        I: IntoIterator<Item = &'a LogRecord>,
    {
        let mut matched: Vec<&LogRecord> = records
            .into_iter()
            .filter(|r| self.filter.matches(r))
            .collect();
        matched.sort_by_key(|r| r.sort_key());
        if self.order == SortOrder::Desc {
            matched.reverse();
        }
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.effective_limit())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use gantry_events::LogEntry;
    use gantry_id::{AllocationId, Seq};
    use rstest::rstest;

    use super::*;

    fn records() -> Vec<LogRecord> {
        let base = Utc::now();
        let allocation = AllocationId::new();
        let agent = AgentId::new();
        let lines = [
            (3, LogLevel::Info, "epoch 1 done", Some(0), StdType::Stdout),
            (1, LogLevel::Warning, "slow disk", Some(1), StdType::Stderr),
            (2, LogLevel::Error, "epoch 1 failed", Some(0), StdType::Stderr),
            (2, LogLevel::Info, "epoch 2 start", None, StdType::Stdout),
        ];
        lines
            .into_iter()
            .enumerate()
            .map(|(i, (secs, level, message, rank, stdtype))| {
                let mut entry = LogEntry::new(base + Duration::seconds(secs), message);
                entry.level = level;
                entry.rank = rank;
                entry.stdtype = Some(stdtype);
                entry.agent_id = Some(agent);
                LogRecord::from_entry(allocation, Seq::new(i as u64 + 1), entry)
            })
            .collect()
    }

    fn seqs(records: &[LogRecord]) -> Vec<u64> {
        records.iter().map(|r| r.seq.value()).collect()
    }

    #[test]
    fn test_orders_by_timestamp_then_seq() {
        let records = records();
        let asc = LogQuery::default().apply(&records);
        assert_eq!(seqs(&asc), vec![2, 3, 4, 1]);

        let desc = LogQuery {
            order: SortOrder::Desc,
            ..Default::default()
        }
        .apply(&records);
        let mut reversed = seqs(&asc);
        reversed.reverse();
        assert_eq!(seqs(&desc), reversed);
    }

    #[rstest]
    #[case(LogFilter { levels: vec![LogLevel::Error, LogLevel::Warning], ..Default::default() }, vec![2, 3])]
    #[case(LogFilter { ranks: vec![0], ..Default::default() }, vec![3, 1])]
    #[case(LogFilter { stdtypes: vec![StdType::Stdout], ..Default::default() }, vec![4, 1])]
    #[case(LogFilter { search: Some("epoch 1".to_string()), ..Default::default() }, vec![3, 1])]
    #[case(LogFilter { sources: vec!["harness".to_string()], ..Default::default() }, vec![])]
    fn test_filters(#[case] filter: LogFilter, #[case] expected: Vec<u64>) {
        let query = LogQuery {
            filter,
            ..Default::default()
        };
        assert_eq!(seqs(&query.apply(&records())), expected);
    }

    #[test]
    fn test_time_bounds_are_inclusive() {
        let records = records();
        let at = records[2].timestamp;
        let query = LogQuery {
            filter: LogFilter {
                after: Some(at),
                before: Some(at),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(seqs(&query.apply(&records)), vec![3, 4]);
    }

    #[test]
    fn test_pagination() {
        let records = records();
        let page = LogQuery {
            limit: Some(2),
            offset: 1,
            ..Default::default()
        };
        assert_eq!(seqs(&page.apply(&records)), vec![3, 4]);

        let huge = LogQuery {
            limit: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(huge.effective_limit(), MAX_LIMIT);
    }
}
