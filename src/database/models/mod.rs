//! Database models.

pub mod move_request;
pub mod move_settings;
pub mod user;

pub use move_request::MoveRequest;
pub use move_settings::MoveSettings;
pub use user::CachedUser;
