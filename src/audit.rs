//! Audit trail: one line per dispatch event.
//!
//! Line format (stable, `key=value`, space separated):
//!
//! ```text
//! src=<peer> from=<sender> platform=<tag> user_id=<identifier> msg=<status>
//! ```
//!
//! `platform` is empty when resolution failed before a platform was known.

use std::fmt;
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::platforms::Platform;

/// Tag syslog lines are written under.
pub const SYSLOG_TAG: &str = "mail2chat";

/// Default local syslog socket.
pub const DEFAULT_SYSLOG_SOCKET: &str = "/dev/log";

/// `LOG_MAIL | LOG_INFO`.
const SYSLOG_PRIORITY: u8 = (2 << 3) | 6;

/// A single auditable outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub source: String,
    pub sender: String,
    pub platform: Option<Platform>,
    pub identifier: String,
    pub message: String,
}

impl AuditEvent {
    pub fn new(source: &str, sender: &str, message: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            sender: sender.to_string(),
            platform: None,
            identifier: String::new(),
            message: message.into(),
        }
    }

    pub fn with_destination(mut self, platform: Platform, identifier: &str) -> Self {
        self.platform = Some(platform);
        self.identifier = identifier.to_string();
        self
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src={} from={} platform={} user_id={} msg={}",
            self.source,
            self.sender,
            self.platform.map(|p| p.as_str()).unwrap_or_default(),
            self.identifier,
            self.message
        )
    }
}

/// Destination for audit lines.
///
/// Recording never fails the caller; sinks handle their own errors.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent);
}

/// Emits audit lines through `tracing` under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) {
        info!(target: "audit", "{event}");
    }
}

/// Keeps every audit event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Rendered lines, oldest first.
    pub async fn lines(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) {
        self.events.lock().await.push(event.clone());
    }
}

/// Writes RFC 3164 datagrams to the local syslog socket.
///
/// A failed write is re-emitted through `tracing` so the line is never lost.
#[cfg(unix)]
pub struct SyslogAuditSink {
    socket: tokio::net::UnixDatagram,
    fallback: TracingAuditSink,
}

#[cfg(unix)]
impl SyslogAuditSink {
    pub fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let socket = tokio::net::UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self {
            socket,
            fallback: TracingAuditSink,
        })
    }

    fn frame(event: &AuditEvent) -> String {
        let timestamp = chrono::Local::now().format("%b %e %H:%M:%S");
        format!(
            "<{SYSLOG_PRIORITY}>{timestamp} {SYSLOG_TAG}[{}]: {event}",
            std::process::id()
        )
    }
}

#[cfg(unix)]
#[async_trait]
impl AuditSink for SyslogAuditSink {
    async fn record(&self, event: &AuditEvent) {
        let frame = Self::frame(event);
        if let Err(e) = self.socket.send(frame.as_bytes()).await {
            warn!(error = %e, "Failed to write to syslog");
            self.fallback.record(event).await;
        }
    }
}

/// Open the syslog sink, falling back to tracing output when unavailable.
pub fn open_audit_sink(socket_path: &str) -> Arc<dyn AuditSink> {
    match connect_syslog(socket_path) {
        Ok(sink) => {
            info!(socket = socket_path, "Audit lines go to syslog");
            sink
        }
        Err(e) => {
            warn!(
                socket = socket_path,
                error = %e,
                "Syslog unavailable, audit lines go to the log stream"
            );
            Arc::new(TracingAuditSink)
        }
    }
}

#[cfg(unix)]
fn connect_syslog(socket_path: &str) -> std::io::Result<Arc<dyn AuditSink>> {
    Ok(Arc::new(SyslogAuditSink::connect(socket_path)?))
}

#[cfg(not(unix))]
fn connect_syslog(_socket_path: &str) -> std::io::Result<Arc<dyn AuditSink>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "syslog needs a unix datagram socket",
    ))
}
