#[macro_use]
extern crate log;

pub mod address;
pub mod cache;
pub mod channel;
pub mod constants;
pub mod error;
pub mod lru_table;
pub mod operable;
pub mod policy;
pub mod ptw;
pub mod request;
pub mod stats;
pub mod vmem;

pub use crate::address::Address;
pub use crate::cache::{Cache, CacheBuilder, CacheConfig};
pub use crate::channel::{Channel, ChannelArena, ChannelBuilder, ChannelId};
pub use crate::error::{ConfigError, DriverError};
pub use crate::operable::{Driver, Operable};
pub use crate::policy::{
    prefetch_by_name, replacement_by_name, CacheContext, NextLinePrefetcher, NoPrefetch,
    PrefetchPolicy, ReplacementPolicy, Victim,
};
pub use crate::ptw::{Ptw, PtwBuilder};
pub use crate::request::{InstrIdSet, Request, RequestKind, Response};
pub use crate::vmem::{VirtualMemory, VirtualMemoryBuilder};
