//! Live entity cache.
//!
//! - `EntityWrapper` - handle to one stored record, optionally kept in sync
//! - `CacheManager` - keyed registry of wrappers with single-flight fetches
//!
//! ## Usage
//!
//! ```rust
//! let settings = state.move_settings.fetch(chat_id).await?;
//! if settings.value().is_some_and(|s| s.enabled) {
//!     // ...
//! }
//! ```

mod manager;
mod wrapper;

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use manager::CacheManager;
pub use wrapper::EntityWrapper;

use crate::database::StoreError;
use crate::sync::SyncError;

/// A value persisted in its own collection, keyed by `_id`.
pub trait Record:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Key: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Collection name, also the record type on the change feed.
    const COLLECTION: &'static str;

    fn key(&self) -> Self::Key;
}

/// Errors surfaced by `CacheManager` and the interaction cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
