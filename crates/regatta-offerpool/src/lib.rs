//! Offer pool: holding, matching, pruning and rescinding host offers.

pub mod matcher;
pub mod pool;
pub mod summary;

pub use matcher::{FilterResult, HostFilter, MatchStats};
pub use pool::{ClaimedHost, DeclineListener, OfferPool};
pub use summary::{HostState, HostSummary};
