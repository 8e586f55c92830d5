//! Bot module - dispatcher, shared state and the polling runtime.

pub mod dispatcher;
mod runtime;

pub use dispatcher::{AppState, build_dispatcher};
pub use runtime::run;
