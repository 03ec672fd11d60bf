//! Target descriptor for the actively collected stream.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifies the live stream the worker is currently pointed at.
///
/// Replacing the supervisor's descriptor is what triggers a retarget:
/// teardown and recreation of both collectors bound to the new stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Upstream video/stream identifier.
    pub stream_id: String,
}

impl TargetDescriptor {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }

    /// Parse a descriptor from operator input: either a bare stream id or a
    /// watch URL (`https://www.youtube.com/watch?v=<id>`, `youtu.be/<id>`).
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::config("empty stream target"));
        }

        if let Ok(parsed) = url::Url::parse(trimmed) {
            if let Some(host) = parsed.host_str() {
                if host.ends_with("youtube.com") {
                    if let Some((_, id)) = parsed.query_pairs().find(|(k, _)| k == "v") {
                        return Ok(Self::new(id.into_owned()));
                    }
                    // /live/<id> style URLs carry the id in the path
                    if let Some(id) = parsed
                        .path_segments()
                        .and_then(|mut s| {
                            s.find(|seg| !seg.is_empty() && *seg != "live" && *seg != "watch")
                        })
                    {
                        return Ok(Self::new(id));
                    }
                    return Err(Error::config(format!("no stream id in URL: {trimmed}")));
                }
                if host.ends_with("youtu.be") {
                    if let Some(id) = parsed.path_segments().and_then(|mut s| s.next()) {
                        if !id.is_empty() {
                            return Ok(Self::new(id));
                        }
                    }
                    return Err(Error::config(format!("no stream id in URL: {trimmed}")));
                }
            }
            // Unknown scheme/host but syntactically a URL: refuse rather
            // than silently treating the whole URL as an id.
            if trimmed.contains("://") {
                return Err(Error::config(format!("unsupported stream URL: {trimmed}")));
            }
        }

        Ok(Self::new(trimmed))
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_id() {
        let t = TargetDescriptor::parse("dQw4w9WgXcQ").unwrap();
        assert_eq!(t.stream_id, "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_watch_url() {
        let t = TargetDescriptor::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10").unwrap();
        assert_eq!(t.stream_id, "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_short_url() {
        let t = TargetDescriptor::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(t.stream_id, "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_live_url() {
        let t = TargetDescriptor::parse("https://www.youtube.com/live/abc123").unwrap();
        assert_eq!(t.stream_id, "abc123");
    }

    #[test]
    fn test_parse_rejects_empty_and_foreign() {
        assert!(TargetDescriptor::parse("  ").is_err());
        assert!(TargetDescriptor::parse("https://example.com/stream").is_err());
    }
}
