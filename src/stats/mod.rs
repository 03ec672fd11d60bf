//! Stream statistics boundary.
//!
//! One poll of the stats endpoint yields a [`StreamStats`] snapshot: the
//! broadcast-lifecycle status plus viewer/engagement counters. The snapshot
//! is persisted raw; lifecycle transitions derived from it drive the
//! supervisor's state machine.

pub mod youtube;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::target::TargetDescriptor;

pub use youtube::YouTubeStatsSource;

/// Broadcast-lifecycle status as reported by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastStatus {
    /// Scheduled but not started; waiting-room chat may already be open.
    Upcoming,
    /// Currently broadcasting.
    Live,
    /// Not broadcasting (status string "none").
    None,
}

impl BroadcastStatus {
    /// Parse the upstream `liveBroadcastContent` string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "upcoming" => Self::Upcoming,
            "live" => Self::Live,
            _ => Self::None,
        }
    }
}

/// One snapshot of the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub status: BroadcastStatus,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub concurrent_viewers: Option<u64>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

impl StreamStats {
    /// Whether the broadcast has ended.
    ///
    /// A stream counts as ended when the endpoint reports no broadcast at
    /// all or carries an actual end time (some streams report `live` with
    /// an end time for a short window after finishing).
    pub fn stream_ended(&self) -> bool {
        self.status == BroadcastStatus::None || self.actual_end_time.is_some()
    }
}

/// One-shot stats fetch for a target stream.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch(&self, target: &TargetDescriptor) -> Result<StreamStats>;
}
