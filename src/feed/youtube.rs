//! YouTube live-chat feed.
//!
//! Connecting resolves the target's active live-chat id via `videos.list`;
//! pulls page `liveChatMessages.list`, buffering each page's items and
//! honoring the server-advised polling interval between pages.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::feed::{ChatFeed, FeedConnection};
use crate::target::TargetDescriptor;
use crate::{Error, Result};

const VIDEOS_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/videos";
const MESSAGES_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3/liveChat/messages";

/// Fallback wait between pages when the server does not advise one.
const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(5);

/// Live-chat feed backed by the YouTube Data API.
pub struct YouTubeChatFeed {
    client: reqwest::Client,
    api_key: String,
}

impl YouTubeChatFeed {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    async fn resolve_chat_id(&self, target: &TargetDescriptor) -> Result<String> {
        let body: Value = self
            .client
            .get(VIDEOS_ENDPOINT)
            .query(&[
                ("part", "liveStreamingDetails"),
                ("id", target.stream_id.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        body.pointer("/items/0/liveStreamingDetails/activeLiveChatId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::feed(format!("no active live chat for {}", target.stream_id)))
    }
}

#[async_trait]
impl ChatFeed for YouTubeChatFeed {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn FeedConnection>> {
        let chat_id = self.resolve_chat_id(target).await?;
        debug!(stream_id = %target.stream_id, chat_id, "live chat resolved");

        Ok(Box::new(YouTubeChatConnection {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            chat_id,
            closed: CancellationToken::new(),
            state: Mutex::new(PageState {
                queue: VecDeque::new(),
                page_token: None,
                next_poll_at: None,
                ended: false,
            }),
        }))
    }
}

struct PageState {
    queue: VecDeque<Value>,
    page_token: Option<String>,
    /// Absolute deadline for the next page fetch. An absolute instant
    /// rather than a duration: a caller may drop a pending `next()` future
    /// mid-wait and call again, and the re-created wait must not restart.
    next_poll_at: Option<tokio::time::Instant>,
    ended: bool,
}

struct YouTubeChatConnection {
    client: reqwest::Client,
    api_key: String,
    chat_id: String,
    closed: CancellationToken,
    state: Mutex<PageState>,
}

impl YouTubeChatConnection {
    /// Fetch the next page into the queue. Returns false when the chat has
    /// ended.
    async fn fetch_page(&self, state: &mut PageState) -> Result<bool> {
        let mut query = vec![
            ("liveChatId", self.chat_id.clone()),
            ("part", "id,snippet,authorDetails".to_string()),
            ("key", self.api_key.clone()),
        ];
        if let Some(token) = &state.page_token {
            query.push(("pageToken", token.clone()));
        }

        let body: Value = self
            .client
            .get(MESSAGES_ENDPOINT)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // `offlineAt` marks a chat that is no longer accepting reads.
        if body.get("offlineAt").is_some() {
            state.ended = true;
            return Ok(false);
        }

        state.page_token = body
            .get("nextPageToken")
            .and_then(Value::as_str)
            .map(str::to_string);
        let advised = body
            .get("pollingIntervalMillis")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PAGE_DELAY);
        state.next_poll_at = Some(tokio::time::Instant::now() + advised);

        if let Some(items) = body.get("items").and_then(Value::as_array) {
            for item in items {
                if item
                    .pointer("/snippet/type")
                    .and_then(Value::as_str)
                    .map(|t| t == "chatEndedEvent")
                    .unwrap_or(false)
                {
                    state.ended = true;
                } else {
                    state.queue.push_back(item.clone());
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl FeedConnection for YouTubeChatConnection {
    async fn next(&self) -> Result<Option<Value>> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }

            let mut state = self.state.lock().await;
            if let Some(item) = state.queue.pop_front() {
                return Ok(Some(item));
            }
            if state.ended {
                return Ok(None);
            }

            // Wait out the advised polling interval; close() preempts it.
            if let Some(deadline) = state.next_poll_at {
                if deadline > tokio::time::Instant::now() {
                    drop(state);
                    tokio::select! {
                        _ = self.closed.cancelled() => return Ok(None),
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    state = self.state.lock().await;
                    // An item may have arrived from a racing pull.
                    if let Some(item) = state.queue.pop_front() {
                        return Ok(Some(item));
                    }
                    if state.ended {
                        return Ok(None);
                    }
                }
            }

            let fetched = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                result = self.fetch_page(&mut state) => result?,
            };
            if !fetched {
                return Ok(None);
            }
            // Empty page: loop around and wait the advised interval again.
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_unblocks_pending_next() {
        let conn = YouTubeChatConnection {
            client: reqwest::Client::new(),
            api_key: "k".to_string(),
            chat_id: "chat".to_string(),
            closed: CancellationToken::new(),
            state: Mutex::new(PageState {
                queue: VecDeque::new(),
                page_token: None,
                // Far-future deadline: next() would block here for an hour.
                next_poll_at: Some(tokio::time::Instant::now() + Duration::from_secs(3600)),
                ended: false,
            }),
        };

        let closed = conn.closed.clone();
        let pull = tokio::spawn(async move { conn.next().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        closed.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pull)
            .await
            .expect("next() must unblock after close")
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_queued_items_drain_before_paging() {
        let conn = YouTubeChatConnection {
            client: reqwest::Client::new(),
            api_key: "k".to_string(),
            chat_id: "chat".to_string(),
            closed: CancellationToken::new(),
            state: Mutex::new(PageState {
                queue: VecDeque::from([serde_json::json!({ "id": "m1" })]),
                page_token: None,
                next_poll_at: Some(tokio::time::Instant::now() + Duration::from_secs(3600)),
                ended: true,
            }),
        };

        let first = conn.next().await.unwrap();
        assert_eq!(first.unwrap()["id"], "m1");
        // Queue drained and the chat is marked ended.
        assert!(conn.next().await.unwrap().is_none());
    }
}
