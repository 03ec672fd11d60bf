//! Upstream chat feed boundary.
//!
//! The feed is a pull iterator over a live target. A connection must
//! support a hard close that unblocks an in-progress pull; this is the only
//! genuinely blocking call in the worker and cooperative cancellation alone
//! cannot interrupt it.

pub mod youtube;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::target::TargetDescriptor;

pub use youtube::YouTubeChatFeed;

/// An open pull connection to one live chat.
#[async_trait]
pub trait FeedConnection: Send + Sync {
    /// Pull the next raw event record.
    ///
    /// `Ok(None)` means the stream's chat has ended (or the connection was
    /// force-closed). Errors are transport-level and retryable.
    async fn next(&self) -> Result<Option<Value>>;

    /// Force the connection closed, unblocking any pending [`next`].
    ///
    /// [`next`]: FeedConnection::next
    async fn close(&self);
}

/// Factory for feed connections.
#[async_trait]
pub trait ChatFeed: Send + Sync {
    async fn connect(&self, target: &TargetDescriptor) -> Result<Box<dyn FeedConnection>>;
}
