//! # gantry-events
//!
//! Shared types for the gantry resource manager: the vocabulary spoken by
//! the master, its agents, and its clients.
//!
//! ## Contents
//!
//! - Resource requirements (`DeviceKind`, `Colocation`, `ResourceSpec`)
//! - The allocation state machine's states and terminal outcomes
//! - Typed events that drive allocation transitions (`AgentEvent`,
//!   `SignalEvent`, `TimerEvent`, `SchedulerEvent`)
//! - The history envelope recorded for every transition
//! - Task log records and their filterable dimensions
//!
//! Events are immutable records. Every history entry belongs to exactly one
//! allocation and carries a per-allocation sequence number.

mod allocation;
mod envelope;
mod error;
mod logs;
mod resources;

pub use allocation::*;
pub use envelope::*;
pub use error::EventError;
pub use logs::*;
pub use resources::*;
