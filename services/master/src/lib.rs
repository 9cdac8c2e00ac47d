//! gantry master library.
//!
//! The crate ships the `gantry-master` binary; the library surface exists
//! for integration testing and reuse.

pub mod agent;
pub mod allocation;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod heartbeat;
pub mod logs;
pub mod master;
pub mod pool;
pub mod registry;
pub mod scheduler;

pub use error::MasterError;
pub use master::Master;
