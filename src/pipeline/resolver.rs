//! Address resolver.
//!
//! The first envelope recipient selects the destination: the domain part
//! names the platform and the local part is the platform identifier.
//! Only the first recipient is used; the rest are ignored.
//!
//! Validation here is side-effect free. Group rewriting and username
//! lookup happen later, at dispatch time.

use tracing::debug;

use crate::error::DispatchError;
use crate::platforms::Platform;

/// Prefix letter for Telegram group notation (`g123456` → `-123456`).
const TELEGRAM_GROUP_PREFIX: char = 'g';

/// Minimum length of a Slack user or channel ID.
const SLACK_ID_MIN_LEN: usize = 9;

/// A destination decoded from a recipient address, not yet finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformIdentifier {
    pub platform: Platform,
    /// Local part as supplied, never empty.
    pub raw: String,
}

/// Resolve the first recipient into a platform and raw identifier.
pub fn resolve<S: AsRef<str>>(recipients: &[S]) -> Result<PlatformIdentifier, DispatchError> {
    let first = recipients.first().ok_or(DispatchError::NoRecipient)?.as_ref();

    let (local, domain) = split_address(first)?;

    let platform = Platform::from_domain(domain)
        .ok_or_else(|| DispatchError::UnsupportedPlatform(domain.to_lowercase()))?;

    validate_identifier(platform, local)?;

    debug!(%platform, identifier = local, "Resolved destination");
    Ok(PlatformIdentifier {
        platform,
        raw: local.to_string(),
    })
}

/// Check that `identifier` has a shape the platform accepts.
pub fn validate_identifier(platform: Platform, identifier: &str) -> Result<(), DispatchError> {
    let invalid = |reason: &str| DispatchError::InvalidIdentifier {
        platform,
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    };

    if identifier.is_empty() {
        return Err(invalid("empty ID"));
    }

    match platform {
        Platform::Telegram => TelegramTarget::parse(identifier).map(|_| ()).map_err(invalid),
        Platform::Slack => SlackTarget::parse(identifier).map(|_| ()).map_err(invalid),
    }
}

/// Split `local@domain`, accepting `<addr>` and `Name <addr>` forms.
///
/// The address must contain exactly one `@` with both sides non-empty.
fn split_address(address: &str) -> Result<(&str, &str), DispatchError> {
    let malformed = || DispatchError::MalformedAddress(address.to_string());

    let trimmed = address.trim();
    let bare = match (trimmed.rfind('<'), trimmed.ends_with('>')) {
        (Some(start), true) => &trimmed[start + 1..trimmed.len() - 1],
        (None, false) => trimmed,
        _ => return Err(malformed()),
    };
    let bare = bare.trim();

    if bare.is_empty() || bare.chars().any(char::is_whitespace) {
        return Err(malformed());
    }

    let mut parts = bare.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => {
            Ok((local, domain))
        }
        _ => Err(malformed()),
    }
}

// ── Telegram ────────────────────────────────────────────────────────

/// A validated Telegram destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramTarget {
    /// A user, group or channel ID as Telegram reports it.
    Chat(i64),
    /// `g<digits>` notation for a group whose native ID is negative.
    /// Holds the magnitude, which must fit in a negative `i64`.
    Group(i64),
}

impl TelegramTarget {
    pub fn parse(identifier: &str) -> Result<Self, &'static str> {
        if let Some(digits) = identifier.strip_prefix(TELEGRAM_GROUP_PREFIX) {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err("invalid group ID format, expected g followed by digits");
            }
            let id: i64 = digits.parse().map_err(|_| "group ID out of range")?;
            if id == 0 {
                return Err("ID cannot be zero");
            }
            return Ok(Self::Group(id));
        }

        let id: i64 = identifier.parse().map_err(|_| "not a valid integer")?;
        if id == 0 {
            return Err("ID cannot be zero");
        }
        Ok(Self::Chat(id))
    }

    /// The `chat_id` value sent to the Bot API.
    pub fn chat_id(&self) -> String {
        match self {
            Self::Chat(id) => id.to_string(),
            Self::Group(id) => format!("-{id}"),
        }
    }
}

// ── Slack ───────────────────────────────────────────────────────────

/// A validated Slack destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlackTarget {
    /// `U…` member ID.
    UserId(String),
    /// `C…` conversation ID.
    ChannelId(String),
    /// `#name`, posted to as-is.
    ChannelName(String),
    /// Bare username, resolved to a member ID before sending.
    Username(String),
}

impl SlackTarget {
    pub fn parse(identifier: &str) -> Result<Self, &'static str> {
        let long_enough = identifier.chars().count() >= SLACK_ID_MIN_LEN;

        if identifier.starts_with('U') && long_enough {
            return Ok(Self::UserId(identifier.to_string()));
        }
        if identifier.starts_with('C') && long_enough {
            return Ok(Self::ChannelId(identifier.to_string()));
        }
        if let Some(name) = identifier.strip_prefix('#') {
            if name.is_empty() {
                return Err("channel name is empty");
            }
            return Ok(Self::ChannelName(identifier.to_string()));
        }
        if !identifier.is_empty() && !identifier.contains(['#', '@']) {
            return Ok(Self::Username(identifier.to_string()));
        }
        Err("invalid Slack ID format (expected U1234567890, C1234567890, #channel, or username)")
    }

    /// Whether a lookup is needed before posting.
    pub fn needs_resolution(&self) -> bool {
        matches!(self, Self::Username(_))
    }
}
