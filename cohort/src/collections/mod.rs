//! Typed distributed collections
//!
//! Thin views over the grid's caches, queues and atomics. Keys and values
//! are encoded with bincode, so any serde type works; equality of encoded
//! bytes stands in for value equality in compare-and-set operations.

mod atomic;
mod map;
mod multimap;
mod queue;
mod set;
mod transaction;

pub use atomic::{AtomicLong, AtomicReference, ATOMIC_REFERENCES_CACHE};
pub use map::DistributedMap;
pub use multimap::DistributedMultiMap;
pub use queue::DistributedQueue;
pub use set::DistributedSet;
pub use transaction::Transaction;

use crate::error::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bounds for anything stored in a distributed collection
pub trait Storable: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Storable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(raw)?)
}

pub(crate) fn decode_opt<T: DeserializeOwned>(raw: Option<Bytes>) -> Result<Option<T>> {
    raw.map(|b| decode(&b)).transpose()
}
