//! Repositories.

pub mod poll;

pub use poll::{PollRepository, map_db_err};
