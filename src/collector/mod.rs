//! The two collection loops the supervisor owns.

pub mod chat;
pub mod stats;

pub use chat::ChatCollector;
pub use stats::{PollOutcome, StatsCollector};
