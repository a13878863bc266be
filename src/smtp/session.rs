//! Session gateway: the callback surface the protocol engine drives.
//!
//! `SessionGateway::accept` runs the admission check and hands out a
//! `Session` per connection. The session accumulates the envelope and,
//! on `data`, hands the message to the dispatcher.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionFilter;
use crate::error::GatewayError;
use crate::pipeline::Dispatcher;

/// Creates sessions for admitted peers.
pub struct SessionGateway {
    admission: AdmissionFilter,
    dispatcher: Arc<Dispatcher>,
}

impl SessionGateway {
    pub fn new(admission: AdmissionFilter, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            admission,
            dispatcher,
        }
    }

    /// Connection-accepted hook.
    ///
    /// A rejected peer gets no session at all.
    pub fn accept(&self, remote_addr: &str) -> Result<Session, GatewayError> {
        if !self.admission.is_allowed(remote_addr) {
            warn!(peer = remote_addr, "Connection rejected, not in allowed networks");
            return Err(GatewayError::Rejected {
                peer: remote_addr.to_string(),
            });
        }

        let session = Session::new(remote_addr, Arc::clone(&self.dispatcher));
        info!(peer = remote_addr, session_id = %session.id, "New SMTP session");
        Ok(session)
    }

    pub fn admission(&self) -> &AdmissionFilter {
        &self.admission
    }
}

/// Envelope progress within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TransactionOpen,
}

/// Per-connection envelope state. Owned by one connection handler.
pub struct Session {
    id: Uuid,
    remote_addr: String,
    from: Option<String>,
    to: Vec<String>,
    authenticated: bool,
    dispatcher: Arc<Dispatcher>,
}

impl Session {
    fn new(remote_addr: &str, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr: remote_addr.to_string(),
            from: None,
            to: Vec::new(),
            authenticated: false,
            dispatcher,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.to
    }

    pub fn state(&self) -> SessionState {
        if self.from.is_some() {
            SessionState::TransactionOpen
        } else {
            SessionState::Idle
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Authentication hook. Any credentials are accepted; access control is
    /// by source address only.
    pub fn authenticate(&mut self, mechanism: &str) -> Result<(), GatewayError> {
        debug!(session_id = %self.id, mechanism, "SMTP auth accepted");
        self.authenticated = true;
        Ok(())
    }

    /// Sender hook; opens a transaction.
    pub fn mail(&mut self, from: &str) {
        debug!(session_id = %self.id, from, "MAIL FROM");
        self.from = Some(from.to_string());
    }

    /// Recipient hook; recipients keep their arrival order.
    pub fn rcpt(&mut self, to: &str) {
        debug!(session_id = %self.id, to, "RCPT TO");
        self.to.push(to.to_string());
    }

    /// Data hook: read the whole message and dispatch it.
    ///
    /// The dispatch runs in its own task, so dropping this future does not
    /// cancel a delivery already under way. The envelope is cleared whatever
    /// the outcome.
    pub async fn data<R>(&mut self, mut reader: R) -> Result<(), GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = Vec::new();
        let read = reader.read_to_end(&mut raw).await;

        let sender = self.from.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.to);

        if let Err(e) = read {
            warn!(session_id = %self.id, error = %e, "Failed to read email data");
            return Err(GatewayError::DataRead(e));
        }

        info!(
            session_id = %self.id,
            bytes = raw.len(),
            from = %sender,
            recipients = recipients.len(),
            "Received email data"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let remote_addr = self.remote_addr.clone();
        let task = tokio::spawn(async move {
            dispatcher
                .process_message(&raw, &sender, &recipients, &remote_addr)
                .await
        });

        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Dispatch(e)),
            Err(e) => Err(GatewayError::Aborted(e.to_string())),
        }
    }

    /// Reset hook: drop the envelope, keep the connection.
    pub fn reset(&mut self) {
        debug!(session_id = %self.id, "SMTP session reset");
        self.from = None;
        self.to.clear();
    }

    /// TLS upgrade hook: state learned before the handshake is discarded.
    pub fn tls_started(&mut self) {
        debug!(session_id = %self.id, "TLS established, session restarted");
        self.from = None;
        self.to.clear();
        self.authenticated = false;
    }

    /// Logout hook.
    pub fn logout(self) {
        debug!(session_id = %self.id, peer = %self.remote_addr, "SMTP session closed");
    }
}
