//! Expiring interaction cache - multi-step command continuations.
//!
//! A command that needs an asynchronous follow-up (a button press in a DM, for
//! example) stores its state as an `InteractionRecord`, arms listeners for the
//! triggers it waits on and lets the cache expire it at a deadline.
//!
//! Every interaction ends exactly once, either *resolved* by a trigger (the
//! command's `Continuation` runs) or *expired* by its timer (nothing runs).
//! Both paths evict the cached entry and delete the stored record.

mod cache;
mod listeners;
mod record;

pub use cache::{Continuation, Interaction, InteractionCache, Phase};
pub use listeners::TriggerListeners;
pub use record::{InteractionPayload, InteractionRecord, TriggerKey};
