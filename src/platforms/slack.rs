//! Slack Web API client.
//!
//! Posts mrkdwn messages with `chat.postMessage`, checks the token with
//! `auth.test`, and resolves usernames through `users.list`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::PlatformError;
use crate::platforms::{
    IdentifierCache, IdentifierResolver, Platform, PlatformClient, http_client, transport_error,
};

/// Default Web API endpoint.
const SLACK_API_BASE: &str = "https://slack.com/api";

/// Maximum message length for chat.postMessage.
pub const SLACK_MAX_MESSAGE_LENGTH: usize = 40_000;

/// Delay between message chunks.
const SLACK_CHUNK_DELAY: Duration = Duration::from_millis(1000);

/// Page size for users.list.
const USERS_PAGE_LIMIT: &str = "200";

/// Fields shared by every Web API response.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsersListResponse {
    #[serde(default)]
    members: Vec<Member>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct Member {
    id: String,
    name: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Subset of the `auth.test` response.
#[derive(Debug, Deserialize)]
struct AuthTest {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    team: Option<String>,
}

/// Slack client. One bot token, any channel or user.
pub struct SlackClient {
    bot_token: SecretString,
    base_url: String,
    chunk_delay: Duration,
    client: reqwest::Client,
    cache: Arc<IdentifierCache>,
}

impl SlackClient {
    pub fn new(bot_token: SecretString) -> Result<Self, PlatformError> {
        Ok(Self {
            bot_token,
            base_url: SLACK_API_BASE.to_string(),
            chunk_delay: SLACK_CHUNK_DELAY,
            client: http_client(Platform::Slack)?,
            cache: Arc::new(IdentifierCache::new()),
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

    /// The username cache backing [`IdentifierResolver`].
    pub fn cache(&self) -> &IdentifierCache {
        &self.cache
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    /// Walk every page of `users.list`, returning (username, ID) pairs.
    ///
    /// Each member is keyed by `name`, and also by `display_name` when
    /// one is set. A `name` always wins over another member's display name.
    async fn fetch_user_directory(&self) -> Result<HashMap<String, String>, PlatformError> {
        let mut names = HashMap::new();
        let mut display_names = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut query = vec![("limit", USERS_PAGE_LIMIT)];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.as_str()));
            }

            let resp = self
                .client
                .get(self.api_url("users.list"))
                .bearer_auth(self.bot_token.expose_secret())
                .query(&query)
                .send()
                .await
                .map_err(|e| transport_error(Platform::Slack, e))?;

            let page: UsersListResponse = read_response(resp).await?;

            for member in page.members.into_iter().filter(|m| !m.deleted) {
                if let Some(display) = member
                    .profile
                    .and_then(|p| p.display_name)
                    .filter(|d| !d.is_empty() && *d != member.name)
                {
                    display_names.push((display, member.id.clone()));
                }
                names.insert(member.name, member.id);
            }

            cursor = page
                .response_metadata
                .and_then(|m| m.next_cursor)
                .unwrap_or_default();
            if cursor.is_empty() {
                break;
            }
        }

        for (display, id) in display_names {
            names.entry(display).or_insert(id);
        }

        debug!(entries = names.len(), "Fetched Slack user directory");
        Ok(names)
    }
}

#[async_trait]
impl PlatformClient for SlackClient {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    fn max_message_length(&self) -> usize {
        SLACK_MAX_MESSAGE_LENGTH
    }

    fn chunk_delay(&self) -> Duration {
        self.chunk_delay
    }

    fn part_marker(&self, part: usize) -> String {
        format!("*[Part {part}]*\n")
    }

    async fn send(&self, text: &str, channel: &str) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "channel": channel,
            "text": text,
            "as_user": true,
        });

        debug!(channel, length = text.chars().count(), "Sending message to Slack");

        let resp = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(Platform::Slack, e))?;

        read_response::<serde_json::Value>(resp).await?;

        info!(channel, "Message sent to Slack");
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), PlatformError> {
        let resp = self
            .client
            .post(self.api_url("auth.test"))
            .bearer_auth(self.bot_token.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(Platform::Slack, e))?;

        let auth: AuthTest = read_response(resp).await?;
        info!(
            user = auth.user.as_deref().unwrap_or("unknown"),
            team = auth.team.as_deref().unwrap_or("unknown"),
            "Slack bot token accepted"
        );
        Ok(())
    }

    fn identifier_resolver(&self) -> Option<&dyn IdentifierResolver> {
        Some(self)
    }
}

#[async_trait]
impl IdentifierResolver for SlackClient {
    async fn resolve_identifier(&self, username: &str) -> Result<String, PlatformError> {
        if let Some(id) = self.cache.get(username).await {
            debug!(username, id = %id, "Slack username served from cache");
            return Ok(id);
        }

        info!(username, "Slack username not cached, fetching user directory");
        let directory = self.fetch_user_directory().await?;
        self.cache.extend(directory).await;

        match self.cache.get(username).await {
            Some(id) => {
                info!(username, id = %id, "Resolved Slack username");
                Ok(id)
            }
            None => Err(PlatformError::UnknownIdentifier {
                platform: Platform::Slack,
                username: username.to_string(),
            }),
        }
    }
}

/// Check HTTP status and the `ok` flag, then decode the full body as `T`.
async fn read_response<T>(resp: reqwest::Response) -> Result<T, PlatformError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| transport_error(Platform::Slack, e))?;

    if !status.is_success() {
        return Err(PlatformError::Api {
            platform: Platform::Slack,
            status: Some(status.as_u16()),
            message: body,
        });
    }

    let api_status: ApiStatus =
        serde_json::from_str(&body).map_err(|e| PlatformError::InvalidResponse {
            platform: Platform::Slack,
            reason: e.to_string(),
        })?;

    if !api_status.ok {
        return Err(PlatformError::Api {
            platform: Platform::Slack,
            status: None,
            message: api_status.error.unwrap_or_else(|| "unknown error".into()),
        });
    }

    serde_json::from_str(&body).map_err(|e| PlatformError::InvalidResponse {
        platform: Platform::Slack,
        reason: e.to_string(),
    })
}
