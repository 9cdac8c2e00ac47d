//! # gantry-id
//!
//! Typed identifiers for the gantry resource manager.
//!
//! Resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! - `alloc_01HV4Z2WQXKJNM8GPQY6VBKC3D` identifies an allocation
//! - `agent_01HV4Z3MXNKPQR9HSTZ7WCLD4E` identifies a worker agent
//! - `req_01HV4Z4NYPLTRS0JTUA8XDME5F` identifies an API request
//!
//! Slots are addressed relative to their agent (`agent_…/3`), and
//! sequence numbers ([`Seq`]) order allocation history and log records.
//!
//! ULIDs are time-ordered, so IDs created later sort later. The scheduler
//! relies on this as the final tie-break between otherwise equal requests.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
