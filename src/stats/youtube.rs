//! YouTube Data API stats source.
//!
//! One `videos.list` GET per poll, with
//! `part=snippet,liveStreamingDetails,statistics`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::stats::{BroadcastStatus, StatsSource, StreamStats};
use crate::target::TargetDescriptor;
use crate::{Error, Result};

const VIDEOS_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/videos";

/// Stats source backed by the YouTube Data API.
pub struct YouTubeStatsSource {
    client: reqwest::Client,
    api_key: String,
}

impl YouTubeStatsSource {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl StatsSource for YouTubeStatsSource {
    async fn fetch(&self, target: &TargetDescriptor) -> Result<StreamStats> {
        let response = self
            .client
            .get(VIDEOS_ENDPOINT)
            .query(&[
                ("part", "snippet,liveStreamingDetails,statistics"),
                ("id", target.stream_id.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let item = body
            .pointer("/items/0")
            .ok_or_else(|| Error::stats(format!("no such stream: {}", target.stream_id)))?;

        Ok(parse_video_item(item))
    }
}

/// Parse one `videos.list` item into a snapshot.
pub fn parse_video_item(item: &Value) -> StreamStats {
    let status = item
        .pointer("/snippet/liveBroadcastContent")
        .and_then(Value::as_str)
        .map(BroadcastStatus::parse)
        .unwrap_or(BroadcastStatus::None);

    let actual_end_time = item
        .pointer("/liveStreamingDetails/actualEndTime")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let concurrent_viewers = counter(item, "/liveStreamingDetails/concurrentViewers");

    StreamStats {
        status,
        actual_end_time,
        concurrent_viewers,
        view_count: counter(item, "/statistics/viewCount"),
        like_count: counter(item, "/statistics/likeCount"),
        comment_count: counter(item, "/statistics/commentCount"),
        observed_at: Utc::now(),
    }
}

// The API reports counters as decimal strings.
fn counter(item: &Value, pointer: &str) -> Option<u64> {
    item.pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}
