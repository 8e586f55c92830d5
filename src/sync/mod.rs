//! Change synchronization - push updates from the store into cached entities.
//!
//! ## Architecture
//!
//! - `EventHub` - one per process, fans the store's change feed out by record type
//! - `Synchronizer` - one per record type, multiplexes hub events into per-key streams
//!
//! Wrappers attach to a key's stream through the `Synchronizer`; the hub itself never
//! filters by key.

mod error;
mod hub;
mod synchronizer;

pub use error::{FeedError, SyncError};
pub use hub::{Change, ChangeEvent, EventHub, HubItem};
pub use synchronizer::{SyncItem, SyncStream, Synchronizer};
