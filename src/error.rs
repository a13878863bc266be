//! Error types for mail2chat.

use crate::platforms::Platform;

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Errors reported by a platform client.
///
/// The platform's own error text is carried verbatim so operators can
/// diagnose it from the audit line.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("{platform} transport failure: {reason}")]
    Transport { platform: Platform, reason: String },

    #[error("{platform} API error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Api {
        platform: Platform,
        status: Option<u16>,
        message: String,
    },

    #[error("{platform} returned an unreadable response: {reason}")]
    InvalidResponse { platform: Platform, reason: String },

    #[error("{platform} has no user named '{username}'")]
    UnknownIdentifier { platform: Platform, username: String },
}

impl PlatformError {
    /// Whether the failure happened below the platform API (network, timeout, IO).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Message-level failures caught at the dispatch boundary.
///
/// All of these are recoverable: the transaction fails, the connection
/// stays open.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no recipient addresses provided")]
    NoRecipient,

    #[error("invalid email address format: {0}")]
    MalformedAddress(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("invalid {platform} ID '{identifier}': {reason}")]
    InvalidIdentifier {
        platform: Platform,
        identifier: String,
        reason: String,
    },

    #[error("failed to parse email: {0}")]
    ParseFailure(String),

    #[error("failed to resolve username '{0}'")]
    UnknownIdentifier(String),

    #[error("{0} client not configured")]
    PlatformNotConfigured(Platform),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl DispatchError {
    /// Whether the sender should treat the failure as permanent.
    ///
    /// Addressing and parse problems will fail again on retry; platform
    /// and transport failures may not.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Platform(_) | Self::PlatformNotConfigured(_))
    }
}

/// Errors surfaced through the session callback surface.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("connection not allowed from {peer}")]
    Rejected { peer: String },

    #[error("failed to read email data: {0}")]
    DataRead(#[from] std::io::Error),

    #[error("failed to process email: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("dispatch task aborted: {0}")]
    Aborted(String),
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
