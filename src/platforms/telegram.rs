//! Telegram Bot API client.
//!
//! Posts HTML-formatted messages with `sendMessage` and checks the bot
//! token with `getMe`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::PlatformError;
use crate::platforms::{LengthUnit, Platform, PlatformClient, http_client, transport_error};

/// Default Bot API endpoint.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Maximum message length for Telegram's sendMessage API.
pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Delay between message chunks.
const TELEGRAM_CHUNK_DELAY: Duration = Duration::from_millis(500);

/// Envelope every Bot API response is wrapped in.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

/// Subset of the `getMe` result.
#[derive(Debug, Clone, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Telegram client. One bot token, any number of destination chats.
pub struct TelegramClient {
    bot_token: SecretString,
    base_url: String,
    chunk_delay: Duration,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(bot_token: SecretString) -> Result<Self, PlatformError> {
        Ok(Self {
            bot_token,
            base_url: TELEGRAM_API_BASE.to_string(),
            chunk_delay: TELEGRAM_CHUNK_DELAY,
            client: http_client(Platform::Telegram)?,
        })
    }

    /// Point the client at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    /// Fetch the bot's own identity.
    pub async fn get_me(&self) -> Result<BotInfo, PlatformError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| transport_error(Platform::Telegram, e))?;

        let info: BotInfo = read_response(resp).await?.ok_or_else(|| {
            PlatformError::InvalidResponse {
                platform: Platform::Telegram,
                reason: "getMe returned no result".into(),
            }
        })?;
        Ok(info)
    }
}

#[async_trait]
impl PlatformClient for TelegramClient {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn max_message_length(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_LENGTH
    }

    fn length_unit(&self) -> LengthUnit {
        LengthUnit::Utf16
    }

    fn chunk_delay(&self) -> Duration {
        self.chunk_delay
    }

    async fn send(&self, text: &str, chat_id: &str) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        debug!(chat_id, length = text.chars().count(), "Sending message to Telegram");

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Platform::Telegram, e))?;

        read_response::<serde_json::Value>(resp).await?;

        info!(chat_id, "Message sent to Telegram");
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), PlatformError> {
        let me = self.get_me().await?;
        info!(
            bot_id = me.id,
            username = me.username.as_deref().unwrap_or("unknown"),
            "Telegram bot token accepted"
        );
        Ok(())
    }
}

/// Check status and the `ok` flag, returning the `result` payload.
async fn read_response<T>(resp: reqwest::Response) -> Result<Option<T>, PlatformError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| transport_error(Platform::Telegram, e))?;

    let parsed = serde_json::from_str::<ApiResponse<T>>(&body);

    if !status.is_success() {
        let message = match parsed {
            Ok(ApiResponse {
                description: Some(d),
                ..
            }) => d,
            _ => body,
        };
        return Err(PlatformError::Api {
            platform: Platform::Telegram,
            status: Some(status.as_u16()),
            message,
        });
    }

    let parsed = parsed.map_err(|e| PlatformError::InvalidResponse {
        platform: Platform::Telegram,
        reason: e.to_string(),
    })?;

    if !parsed.ok {
        return Err(PlatformError::Api {
            platform: Platform::Telegram,
            status: None,
            message: parsed.description.unwrap_or_else(|| "unknown error".into()),
        });
    }

    Ok(parsed.result)
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};

    use super::*;

    fn client_for(server: &Server) -> TelegramClient {
        TelegramClient::new(SecretString::from("123:ABC"))
            .unwrap()
            .with_base_url(server.url())
            .with_chunk_delay(Duration::ZERO)
    }

    #[test]
    fn telegram_api_url() {
        let ch = TelegramClient::new(SecretString::from("123:ABC")).unwrap();
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_limits() {
        let ch = TelegramClient::new(SecretString::from("t")).unwrap();
        assert_eq!(ch.max_message_length(), 4096);
        assert_eq!(ch.length_unit(), LengthUnit::Utf16);
        assert_eq!(ch.chunk_delay(), Duration::from_millis(500));
        assert_eq!(ch.part_marker(2), "[Part 2]\n");
        assert!(ch.identifier_resolver().is_none());
    }

    #[tokio::test]
    async fn send_posts_html_message() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": "-123456",
                "text": "<b>hi</b>",
                "parse_mode": "HTML",
            })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":1}}"#)
            .expect(1)
            .create_async()
            .await;

        client_for(&server).send("<b>hi</b>", "-123456").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_preserves_platform_error_text() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#)
            .create_async()
            .await;

        let err = client_for(&server).send("hi", "42").await.unwrap_err();
        match err {
            PlatformError::Api {
                status, message, ..
            } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "Bad Request: chat not found");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_non_json_error_keeps_raw_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let err = client_for(&server).send("hi", "42").await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::Api { status: Some(502), ref message, .. } if message == "Bad Gateway"
        ));
    }

    #[tokio::test]
    async fn send_unreachable_host_is_transport_failure() {
        let client = TelegramClient::new(SecretString::from("t"))
            .unwrap()
            .with_base_url("http://127.0.0.1:1");
        let err = client.send("hi", "42").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn send_long_splits_into_marked_chunks() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .match_body(Matcher::Regex(r#""text":"a{10}"#.into()))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{}}"#)
            .expect(1)
            .create_async()
            .await;
        let rest = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .match_body(Matcher::Regex(r#""text":"\[Part \d\]\\n"#.into()))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{}}"#)
            .expect(2)
            .create_async()
            .await;

        let line = "a".repeat(3000);
        let text = format!("{line}\n{line}\n{line}");
        client_for(&server).send_long(&text, "42").await.unwrap();

        first.assert_async().await;
        rest.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_uses_get_me() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/bot123:ABC/getMe")
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"id":42,"is_bot":true,"username":"relay_bot"}}"#)
            .expect(1)
            .create_async()
            .await;

        client_for(&server).test_connection().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_rejected_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/bot123:ABC/getMe")
            .with_status(401)
            .with_body(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let err = client_for(&server).test_connection().await.unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }
}
