//! Chat platform clients.
//!
//! Every platform implements [`PlatformClient`] (single send, chunked send,
//! credential check). Platforms that can turn a human-readable username
//! into a canonical destination ID additionally expose an
//! [`IdentifierResolver`] through [`PlatformClient::identifier_resolver`].

pub mod cache;
pub mod chunking;
pub mod slack;
pub mod telegram;

pub use cache::IdentifierCache;
pub use chunking::LengthUnit;
pub use slack::SlackClient;
pub use telegram::TelegramClient;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PlatformError;

/// Timeout applied to every outbound platform request.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Supported chat destinations, selected by the recipient's domain-part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Slack,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Telegram, Platform::Slack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Slack => "slack",
        }
    }

    /// Map an address domain-part to a platform (case-insensitive).
    pub fn from_domain(domain: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(domain))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound side of a chat platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Which platform this client talks to.
    fn platform(&self) -> Platform;

    /// Maximum length of a single message, in [`Self::length_unit`] units.
    fn max_message_length(&self) -> usize;

    /// Unit the platform counts its message limit in.
    fn length_unit(&self) -> LengthUnit {
        LengthUnit::Chars
    }

    /// Pause between consecutive chunks of one long message.
    fn chunk_delay(&self) -> Duration;

    /// Marker prepended to every chunk after the first (`part` is 1-based).
    fn part_marker(&self, part: usize) -> String {
        format!("[Part {part}]\n")
    }

    /// Post one already length-bounded message to `destination`.
    async fn send(&self, text: &str, destination: &str) -> Result<(), PlatformError>;

    /// Post a message of any length, splitting it into ordered chunks.
    ///
    /// Stops at the first failed chunk; remaining chunks are not sent.
    async fn send_long(&self, text: &str, destination: &str) -> Result<(), PlatformError> {
        let limit = self.max_message_length();
        let unit = self.length_unit();
        if unit.measure(text) <= limit {
            return self.send(text, destination).await;
        }

        let chunks = chunking::split_message(text, limit, unit, |part| self.part_marker(part));
        let total = chunks.len();
        info!(
            platform = %self.platform(),
            destination,
            length = unit.measure(text),
            chunks = total,
            "Message too long, splitting into chunks"
        );

        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.send(chunk, destination).await {
                warn!(
                    platform = %self.platform(),
                    destination,
                    chunk = i + 1,
                    total,
                    error = %e,
                    "Chunk send failed, dropping remaining chunks"
                );
                return Err(e);
            }

            if i + 1 < total {
                tokio::time::sleep(self.chunk_delay()).await;
            }
        }

        info!(
            platform = %self.platform(),
            destination,
            chunks = total,
            "Sent all message chunks"
        );
        Ok(())
    }

    /// Verify the configured credential without posting anything visible.
    async fn test_connection(&self) -> Result<(), PlatformError>;

    /// Username resolution capability, if this platform has one.
    fn identifier_resolver(&self) -> Option<&dyn IdentifierResolver> {
        None
    }
}

/// Resolves a human-readable username to the platform's canonical ID.
#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    async fn resolve_identifier(&self, username: &str) -> Result<String, PlatformError>;
}

/// Build the shared HTTP client used by a platform.
pub(crate) fn http_client(platform: Platform) -> Result<reqwest::Client, PlatformError> {
    reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| PlatformError::Transport {
            platform,
            reason: format!("failed to build HTTP client: {e}"),
        })
}

/// Classify a reqwest failure as a transport error.
pub(crate) fn transport_error(platform: Platform, err: reqwest::Error) -> PlatformError {
    let reason = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    PlatformError::Transport { platform, reason }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingClient;
    use super::*;

    #[test]
    fn platform_from_domain_is_case_insensitive() {
        assert_eq!(Platform::from_domain("telegram"), Some(Platform::Telegram));
        assert_eq!(Platform::from_domain("TeleGram"), Some(Platform::Telegram));
        assert_eq!(Platform::from_domain("SLACK"), Some(Platform::Slack));
        assert_eq!(Platform::from_domain("discord"), None);
        assert_eq!(Platform::from_domain(""), None);
    }

    #[test]
    fn platform_display_matches_tag() {
        assert_eq!(Platform::Telegram.to_string(), "telegram");
        assert_eq!(Platform::Slack.to_string(), "slack");
    }

    #[tokio::test]
    async fn send_long_short_message_is_single_send_without_marker() {
        let client = RecordingClient::new(Platform::Telegram).with_limit(100);
        client.send_long("hello\nworld", "42").await.unwrap();

        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("42".to_string(), "hello\nworld".to_string()));
    }

    #[tokio::test]
    async fn send_long_sends_chunks_in_order_with_markers() {
        let client = RecordingClient::new(Platform::Telegram).with_limit(100);
        let lines: Vec<String> = (0..20).map(|i| format!("line number {i:02}")).collect();
        let text = lines.join("\n");

        client.send_long(&text, "42").await.unwrap();

        let sent = client.sent();
        assert!(sent.len() > 1);
        assert!(!sent[0].1.starts_with("[Part"));
        for (i, (dest, chunk)) in sent.iter().enumerate().skip(1) {
            assert_eq!(dest, "42");
            assert!(chunk.starts_with(&format!("[Part {}]\n", i + 1)));
        }
        for (_, chunk) in &sent {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[tokio::test]
    async fn send_long_aborts_on_first_failure() {
        let client = RecordingClient::new(Platform::Slack)
            .with_limit(100)
            .failing_on(2);
        let text = (0..40)
            .map(|i| format!("row {i}"))
            .collect::<Vec<_>>()
            .join("\n");

        let err = client.send_long(&text, "C1234567890").await.unwrap_err();
        assert!(matches!(err, PlatformError::Api { .. }));
        // Only the first chunk went out.
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test]
    async fn send_long_waits_between_chunks() {
        tokio::time::pause();
        let client = RecordingClient::new(Platform::Telegram)
            .with_limit(100)
            .with_delay(Duration::from_millis(500));
        let text = (0..30)
            .map(|i| format!("line number {i:02}"))
            .collect::<Vec<_>>()
            .join("\n");

        let start = tokio::time::Instant::now();
        client.send_long(&text, "42").await.unwrap();
        let elapsed = start.elapsed();

        let chunks = client.sent().len() as u32;
        assert!(chunks >= 3);
        // One pause between each pair of chunks, none after the last.
        let expected = Duration::from_millis(500) * (chunks - 1);
        assert!(elapsed >= expected, "{elapsed:?} < {expected:?}");
        assert!(elapsed < expected + Duration::from_millis(100));
    }
}
