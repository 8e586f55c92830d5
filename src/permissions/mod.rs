//! Chat-member and admin-rights checks with caching.
//!
//! Bot owners (from `OWNER_IDS`) pass every rights check. Membership is a
//! fact about the chat and is never bypassed.

mod checker;

pub use checker::{AdminRights, Permissions};
