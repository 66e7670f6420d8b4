//! DRN Realtime Shared Types and Utilities
//!
//! This crate contains the room/presence types and the shared presence store
//! abstraction used by every DRN realtime instance.

pub mod error;
pub mod store;
pub mod types;

pub use error::*;
pub use store::{Expiry, Keyspace, MemoryStore, RedisStore, SharedStore, Subscription};
pub use types::*;
