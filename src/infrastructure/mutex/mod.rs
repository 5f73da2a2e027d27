//! Per-key serialization primitive

mod keyed_mutex;

pub use keyed_mutex::{Acquire, KeyedMutex, LockToken};
