//! Moka-backed lookup caches.
//!
//! These hold answers from the Telegram API and the users collection that
//! are not live-synced records: admin rights, chat membership and username
//! resolution. Entries simply age out; nothing invalidates them remotely.

mod config;
mod typed;

pub use config::CacheConfig;
pub use typed::TypedCache;
