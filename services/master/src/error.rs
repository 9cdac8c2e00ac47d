//! Top-level error type of the master.

use thiserror::Error;

use crate::allocation::AllocationError;
use crate::db::DbError;
use crate::logs::LogError;
use crate::pool::PoolError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Logs(#[from] LogError),

    #[error(transparent)]
    Store(#[from] DbError),
}
