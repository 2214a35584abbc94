//! Database entities.

#![allow(missing_docs)]

pub mod poll;
pub mod poll_option;
pub mod vote_record;

pub use poll::Entity as Poll;
pub use poll_option::Entity as PollOption;
pub use vote_record::Entity as VoteRecord;
