//! Storage engine
//!
//! A shard-local, single-owner keyspace: sorted sets indexed by key,
//! deadlines tracked beside them, expiry enforced lazily on access and
//! proactively by sweeps.

mod expiry;
mod memory;
mod value;
mod zset;

pub use expiry::ExpiryRegistry;
pub use memory::{SortedSetStore, StoreStats};
pub use value::Value;
pub use zset::{Applied, ScoreBound, SortedSet, UpdateMode};
