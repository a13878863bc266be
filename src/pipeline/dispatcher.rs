//! Dispatch orchestrator.
//!
//! Runs resolve → normalize → finalize → format → send for one message and
//! writes an audit line for every outcome. Every failure is returned to the
//! caller as a `DispatchError`; nothing here panics or retries.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{DispatchError, PlatformError};
use crate::pipeline::formatter::format_for_platform;
use crate::pipeline::normalizer::normalize;
use crate::pipeline::resolver::{self, PlatformIdentifier, SlackTarget, TelegramTarget};
use crate::platforms::{Platform, PlatformClient};

/// Routes messages to the configured platform clients.
///
/// Shared by every session; holds no per-message state.
pub struct Dispatcher {
    clients: HashMap<Platform, Arc<dyn PlatformClient>>,
    audit: Arc<dyn AuditSink>,
}

impl Dispatcher {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            clients: HashMap::new(),
            audit,
        }
    }

    /// Register a client under the platform it reports.
    pub fn with_client(mut self, client: Arc<dyn PlatformClient>) -> Self {
        self.clients.insert(client.platform(), client);
        self
    }

    /// Platforms with a configured client, in a stable order.
    pub fn configured_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.clients.contains_key(p))
            .collect()
    }

    pub fn client(&self, platform: Platform) -> Option<&Arc<dyn PlatformClient>> {
        self.clients.get(&platform)
    }

    /// Forward one message to the destination named by its first recipient.
    pub async fn process_message(
        &self,
        raw: &[u8],
        sender: &str,
        recipients: &[String],
        remote_addr: &str,
    ) -> Result<(), DispatchError> {
        debug!(bytes = raw.len(), sender, "Processing message");

        let target = match resolver::resolve(recipients) {
            Ok(target) => target,
            Err(e) => {
                self.audit
                    .record(&AuditEvent::new(
                        remote_addr,
                        sender,
                        format!("Invalid destination: {e}"),
                    ))
                    .await;
                return Err(e);
            }
        };

        let event = |message: String| {
            AuditEvent::new(remote_addr, sender, message)
                .with_destination(target.platform, &target.raw)
        };

        let message = match normalize(raw) {
            Ok(message) => message,
            Err(e) => {
                self.audit.record(&event(format!("Parse error: {e}"))).await;
                return Err(e);
            }
        };

        self.audit.record(&event("Processing email".to_string())).await;
        info!(
            from = %message.from,
            platform = %target.platform,
            identifier = %target.raw,
            subject = %message.subject,
            "Processed email"
        );

        let outcome = async {
            let client = self
                .clients
                .get(&target.platform)
                .ok_or(DispatchError::PlatformNotConfigured(target.platform))?;
            let destination = finalize_identifier(client.as_ref(), &target).await?;
            let text = format_for_platform(&message, target.platform);
            client.send_long(&text, &destination).await?;
            Ok::<_, DispatchError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.audit
                    .record(&event("Email sent successfully".to_string()))
                    .await;
                info!(platform = %target.platform, identifier = %target.raw, "Email forwarded");
                Ok(())
            }
            Err(e) => {
                self.audit.record(&event(format!("Send failed: {e}"))).await;
                warn!(platform = %target.platform, identifier = %target.raw, error = %e, "Email not forwarded");
                Err(e)
            }
        }
    }
}

/// Turn a raw identifier into the value the platform API expects.
async fn finalize_identifier(
    client: &dyn PlatformClient,
    target: &PlatformIdentifier,
) -> Result<String, DispatchError> {
    let invalid = |reason: &str| DispatchError::InvalidIdentifier {
        platform: target.platform,
        identifier: target.raw.clone(),
        reason: reason.to_string(),
    };

    match target.platform {
        Platform::Telegram => {
            let chat = TelegramTarget::parse(&target.raw).map_err(invalid)?;
            let chat_id = chat.chat_id();
            if matches!(chat, TelegramTarget::Group(_)) {
                debug!(from = %target.raw, to = %chat_id, "Converted group ID");
            }
            Ok(chat_id)
        }
        Platform::Slack => match SlackTarget::parse(&target.raw).map_err(invalid)? {
            SlackTarget::Username(username) => {
                let resolver = client
                    .identifier_resolver()
                    .ok_or_else(|| DispatchError::UnknownIdentifier(username.clone()))?;
                let id = resolver
                    .resolve_identifier(&username)
                    .await
                    .map_err(|e| match e {
                        PlatformError::UnknownIdentifier { .. } => {
                            DispatchError::UnknownIdentifier(username.clone())
                        }
                        other => DispatchError::Platform(other),
                    })?;
                debug!(%username, %id, "Resolved username");
                Ok(id)
            }
            SlackTarget::UserId(id) | SlackTarget::ChannelId(id) | SlackTarget::ChannelName(id) => {
                Ok(id)
            }
        },
    }
}
