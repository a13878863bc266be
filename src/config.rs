//! Process configuration, read from the environment.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::audit::DEFAULT_SYSLOG_SOCKET;
use crate::error::ConfigError;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 2525;
pub const DEFAULT_SMTP_DOMAIN: &str = "localhost";

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub telegram_bot_token: Option<SecretString>,
    pub slack_bot_token: Option<SecretString>,
    pub listen_host: String,
    pub listen_port: u16,
    /// Raw CIDR strings; parsed (and filtered) by the admission filter.
    pub allowed_networks: Vec<String>,
    /// Domain announced in the SMTP greeting.
    pub smtp_domain: String,
    pub audit_syslog_socket: String,
    /// Certificate and key for STARTTLS, when enabled.
    pub tls: Option<TlsFiles>,
}

/// PEM files backing the STARTTLS acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_bot_token = non_empty("TELEGRAM_BOT_TOKEN").map(SecretString::from);
        let slack_bot_token = non_empty("SLACK_BOT_TOKEN").map(SecretString::from);

        if telegram_bot_token.is_none() && slack_bot_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "TELEGRAM_BOT_TOKEN or SLACK_BOT_TOKEN".to_string(),
                hint: "Configure at least one platform token.".to_string(),
            });
        }

        let listen_port = match non_empty("SMTP_LISTEN_PORT") {
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "SMTP_LISTEN_PORT".to_string(),
                        message: format!("'{raw}' is not a port between 1 and 65535"),
                    });
                }
            },
            None => DEFAULT_LISTEN_PORT,
        };

        let allowed_networks: Vec<String> = non_empty("ALLOWED_NETWORKS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let tls_enabled = match non_empty("TLS_ENABLE") {
            Some(raw) => parse_flag(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "TLS_ENABLE".to_string(),
                message: format!("'{raw}' is not a boolean, use true/false"),
            })?,
            None => false,
        };
        let tls = if tls_enabled {
            Some(TlsFiles {
                cert_path: existing_file(non_empty("TLS_CERT_PATH"), "TLS_CERT_PATH")?,
                key_path: existing_file(non_empty("TLS_KEY_PATH"), "TLS_KEY_PATH")?,
            })
        } else {
            None
        };

        Ok(Self {
            telegram_bot_token,
            slack_bot_token,
            listen_host: non_empty("SMTP_LISTEN_HOST")
                .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string()),
            listen_port,
            allowed_networks,
            smtp_domain: non_empty("SMTP_DOMAIN")
                .unwrap_or_else(|| DEFAULT_SMTP_DOMAIN.to_string()),
            audit_syslog_socket: non_empty("AUDIT_SYSLOG_SOCKET")
                .unwrap_or_else(|| DEFAULT_SYSLOG_SOCKET.to_string()),
            tls,
        })
    }

    /// `host:port` the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }
}

/// `true/1/yes/on` or `false/0/no/off`, case-insensitive.
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A path that must be set and name an existing file when TLS is enabled.
fn existing_file(value: Option<String>, key: &str) -> Result<PathBuf, ConfigError> {
    let Some(value) = value else {
        return Err(ConfigError::MissingRequired {
            key: key.to_string(),
            hint: "Required when TLS_ENABLE=true.".to_string(),
        });
    };
    let path = PathBuf::from(value);
    if !path.is_file() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("file not found: {}", path.display()),
        });
    }
    Ok(path)
}

/// Usage text printed for `--help`.
pub const USAGE: &str = "\
mail2chat - forward inbound SMTP mail to Telegram and Slack

USAGE:
    mail2chat [--help]

Recipient addresses select the destination:
    123456789@telegram     Telegram chat ID
    g123456@telegram       Telegram group (sent to -123456)
    U1234567890@slack      Slack user ID
    C1234567890@slack      Slack channel ID
    #general@slack         Slack channel name
    john.doe@slack         Slack username (resolved via users.list)

ENVIRONMENT:
    TELEGRAM_BOT_TOKEN     Telegram bot token
    SLACK_BOT_TOKEN        Slack bot token (at least one token is required)
    SMTP_LISTEN_HOST       Bind address (default 0.0.0.0)
    SMTP_LISTEN_PORT       Bind port (default 2525)
    ALLOWED_NETWORKS       Comma-separated CIDR ranges (default: allow all)
    SMTP_DOMAIN            Domain in the SMTP greeting (default localhost)
    AUDIT_SYSLOG_SOCKET    Syslog socket for audit lines (default /dev/log)
    TLS_ENABLE             Offer STARTTLS: true/false (default false)
    TLS_CERT_PATH          PEM certificate chain (required with TLS_ENABLE)
    TLS_KEY_PATH           PEM private key (required with TLS_ENABLE)
    RUST_LOG               Log filter (default info)
";
