//! Database module exports.

mod change_feed;
mod models;
mod mongo;
mod store;
mod users;

#[cfg(test)]
pub mod memory;

pub use change_feed::open_change_feed;
pub use models::*;
pub use mongo::Database;
pub use store::{MongoStore, RecordStore, StoreError};
pub use users::UserRepo;

#[cfg(test)]
pub use memory::MemoryStore;
