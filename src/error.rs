//! Fatal error taxonomy. Retryable back-pressure is never an `Err` (see
//! the `add_*`/`try_*` methods on [`crate::channel::Channel`] and
//! [`crate::cache::Cache`], which return `bool`); only construction-time
//! configuration mistakes and the driver's deadlock detector produce one
//! of these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },

    #[error("{field} must be nonzero")]
    Zero { field: &'static str },

    #[error("offset_bits mismatch between coupled channels: {upper} vs {lower}")]
    OffsetBitsMismatch { upper: u32, lower: u32 },

    #[error("PSCL dimensions invalid at level {level}: sets={sets} ways={ways}")]
    InvalidPsclDimensions {
        level: usize,
        sets: usize,
        ways: usize,
    },

    #[error("virtual memory page-table page size {page_size} must exceed {minimum} bytes")]
    PteTooSmall { page_size: u64, minimum: u64 },

    #[error("virtual memory capacity exhausted: requested {requested} pages, pool has {available}")]
    VirtualMemoryTooSmall { requested: u64, available: u64 },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no forward progress for {cycles} cycles at cycle {cycle}")]
    Deadlock { cycle: u64, cycles: u64 },
}
