//! Typed ID definitions for scheduler resources.

use crate::{define_id, IdError};

// =============================================================================
// Resources
// =============================================================================

define_id!(AllocationId, "alloc");
define_id!(AgentId, "agent");
define_id!(RequestId, "req");

// =============================================================================
// Slots
// =============================================================================

/// A device slot, addressed by its owning agent and its position in the
/// agent's ordered slot list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId {
    pub agent: AgentId,
    pub index: u32,
}

impl SlotId {
    #[must_use]
    pub const fn new(agent: AgentId, index: u32) -> Self {
        Self { agent, index }
    }

    /// Parses a slot reference of the form `{agent_id}/{index}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((agent, index)) = s.rsplit_once('/') else {
            return Err(IdError::InvalidSlot(s.to_string()));
        };
        let agent = AgentId::parse(agent)?;
        let index = index
            .parse::<u32>()
            .map_err(|_| IdError::InvalidSlot(s.to_string()))?;
        Ok(Self { agent, index })
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent, self.index)
    }
}

impl std::str::FromStr for SlotId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for SlotId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SlotId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Sequence Numbers
// =============================================================================

/// Monotonic sequence number scoped to one allocation.
///
/// Used both for allocation history entries and for log records, where it
/// breaks timestamp ties deterministically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// The first sequence number handed out in a fresh scope.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Seq {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl From<Seq> for u64 {
    fn from(seq: Seq) -> Self {
        seq.0
    }
}

impl serde::Serialize for Seq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Seq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_allocation_id_roundtrip() {
        let id = AllocationId::new();
        let parsed: AllocationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("alloc_"));
    }

    #[test]
    fn test_allocation_id_invalid_prefix() {
        let result: Result<AllocationId, _> = "agent_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidPrefix { expected: "alloc", .. }
        ));
    }

    #[test]
    fn test_missing_separator_and_empty() {
        let missing: Result<AgentId, _> = "agent01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(missing.unwrap_err(), IdError::MissingSeparator);

        let empty: Result<AgentId, _> = "".parse();
        assert!(empty.unwrap_err().is_empty());
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<AgentId, _> = "agent_not-a-ulid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = AllocationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = AllocationId::new();
        assert!(first < second);
    }

    #[test]
    fn test_slot_id_display_and_parse() {
        let agent = AgentId::new();
        let slot = SlotId::new(agent, 3);
        let text = slot.to_string();
        assert_eq!(text, format!("{agent}/3"));
        assert_eq!(SlotId::parse(&text).unwrap(), slot);
    }

    #[test]
    fn test_slot_id_rejects_bad_index() {
        let agent = AgentId::new();
        assert!(matches!(
            SlotId::parse(&format!("{agent}/x")),
            Err(IdError::InvalidSlot(_))
        ));
        assert!(matches!(
            SlotId::parse(&agent.to_string()),
            Err(IdError::InvalidSlot(_))
        ));
    }

    #[test]
    fn test_slot_id_json_is_string() {
        let slot = SlotId::new(AgentId::new(), 0);
        let json = serde_json::to_value(slot).unwrap();
        assert!(json.is_string());
        let back: SlotId = serde_json::from_value(json).unwrap();
        assert_eq!(back, slot);
    }

    #[test]
    fn test_seq_next() {
        assert_eq!(Seq::FIRST.value(), 1);
        assert_eq!(Seq::FIRST.next(), Seq::new(2));
        assert!(Seq::new(9) < Seq::new(10));
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [AllocationId::PREFIX, AgentId::PREFIX, RequestId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_agent_id_parse_display(raw in any::<u128>()) {
            let id = AgentId::from_ulid(crate::Ulid::from(raw));
            prop_assert_eq!(AgentId::parse(&id.to_string()).unwrap(), id);
        }

        #[test]
        fn prop_slot_id_parse_display(raw in any::<u128>(), index in any::<u32>()) {
            let slot = SlotId::new(AgentId::from_ulid(crate::Ulid::from(raw)), index);
            prop_assert_eq!(SlotId::parse(&slot.to_string()).unwrap(), slot);
        }
    }
}
