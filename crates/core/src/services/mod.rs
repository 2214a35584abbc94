//! Business logic services.

#![allow(missing_docs)]

pub mod cache;
pub mod credentials;
pub mod ledger;
pub mod notifier;
pub mod poll;
pub mod scheduler;

pub use cache::{MemorySnapshotCache, RedisSnapshotCache, SnapshotCache};
pub use credentials::{CredentialMap, CredentialVault};
pub use ledger::{CastReceipt, VoteLedger};
pub use notifier::ChangeNotifier;
pub use poll::{
    CreatePollInput, CreatedPoll, EditPollInput, Expiration, OptionView, OptionWeight,
    PollAnalytics, PollService, PollView, TimelinePoint, VoterStatus,
};
pub use scheduler::{PollSweeper, SchedulerConfig, SweepExecutor, run_expiry_sweep};

#[cfg(test)]
pub(crate) mod testing;
