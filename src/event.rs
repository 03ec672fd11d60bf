//! Typed chat event records.
//!
//! The upstream feed yields loosely structured JSON. Everything downstream
//! of the feed works with [`IngestedEvent`], produced by a validating
//! constructor that sorts raw records into supported events and an explicit
//! unsupported variant instead of branching on ad hoc JSON shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of chat events the worker records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Plain text chat message.
    Text,
    /// Paid message (super chat).
    SuperChat,
    /// Paid sticker.
    SuperSticker,
    /// New channel membership.
    NewMember,
    /// Membership milestone message.
    MemberMilestone,
}

impl EventKind {
    /// Stable lowercase name used in persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::SuperChat => "super_chat",
            Self::SuperSticker => "super_sticker",
            Self::NewMember => "new_member",
            Self::MemberMilestone => "member_milestone",
        }
    }

    fn from_upstream(kind: &str) -> Option<Self> {
        match kind {
            "textMessageEvent" => Some(Self::Text),
            "superChatEvent" => Some(Self::SuperChat),
            "superStickerEvent" => Some(Self::SuperSticker),
            "newSponsorEvent" => Some(Self::NewMember),
            "memberMilestoneChatEvent" => Some(Self::MemberMilestone),
            _ => None,
        }
    }
}

/// One raw chat event as produced by the upstream feed.
///
/// Created by classification, owned by the buffer until flushed, then
/// handed to persistence; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedEvent {
    /// Unique upstream message identifier.
    pub id: String,
    /// Author channel identifier.
    pub author_id: String,
    /// Classified event kind.
    pub kind: EventKind,
    /// Upstream publish timestamp, when present.
    pub published_at: Option<DateTime<Utc>>,
    /// Rendered message text, when present.
    pub display_text: Option<String>,
    /// The complete raw upstream record.
    pub raw: Value,
}

/// Result of classifying one raw upstream record.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// A well-formed, supported event, ready to buffer.
    Event(IngestedEvent),
    /// Malformed or deliberately unsupported (moderation/removal etc.);
    /// goes to the filtered side-channel, never the buffer.
    Unsupported {
        /// Upstream type tag, or a reason when the record is malformed.
        kind: String,
        raw: Value,
    },
}

impl ParsedEvent {
    /// Classify one raw upstream record.
    ///
    /// Records missing a message id or author id are unsupported even when
    /// their type tag is recognized: both identifiers are required by the
    /// idempotent persistence merge.
    pub fn classify(raw: Value) -> Self {
        let kind_tag = raw
            .pointer("/snippet/type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let Some(kind) = EventKind::from_upstream(&kind_tag) else {
            let kind = if kind_tag.is_empty() {
                "missing-type".to_string()
            } else {
                kind_tag
            };
            return Self::Unsupported { kind, raw };
        };

        let Some(id) = raw.get("id").and_then(Value::as_str) else {
            return Self::Unsupported {
                kind: format!("{kind_tag}:missing-id"),
                raw,
            };
        };
        let Some(author_id) = raw
            .pointer("/authorDetails/channelId")
            .and_then(Value::as_str)
        else {
            return Self::Unsupported {
                kind: format!("{kind_tag}:missing-author"),
                raw,
            };
        };

        let published_at = raw
            .pointer("/snippet/publishedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let display_text = raw
            .pointer("/snippet/displayMessage")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self::Event(IngestedEvent {
            id: id.to_string(),
            author_id: author_id.to_string(),
            kind,
            published_at,
            display_text,
            raw,
        })
    }
}
