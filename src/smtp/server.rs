//! Minimal SMTP listener driving the session gateway.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufStream};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::DEFAULT_SMTP_DOMAIN;
use crate::smtp::command::{Command, Reply};
use crate::smtp::session::{Session, SessionGateway, SessionState};

/// Longest command line accepted, CRLF included.
const MAX_COMMAND_LINE: usize = 512;

/// Upper bound on a single read while receiving message data.
const DATA_READ_CHUNK: u64 = 64 * 1024;

/// Byte stream a connection runs over, plaintext or TLS.
pub trait SmtpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SmtpStream for T {}

pub type BoxedStream = Box<dyn SmtpStream>;

/// Protocol limits and identity.
#[derive(Clone)]
pub struct ServerConfig {
    pub domain: String,
    pub read_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    /// STARTTLS is offered only when set.
    pub tls: Option<TlsAcceptor>,
    /// How long open connections may run on after shutdown starts.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_SMTP_DOMAIN.to_string(),
            read_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024, // 1 MiB
            max_recipients: 50,
            tls: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("domain", &self.domain)
            .field("read_timeout", &self.read_timeout)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("max_recipients", &self.max_recipients)
            .field("tls", &self.tls.is_some())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Accepts TCP connections and runs one task per connection.
pub struct SmtpServer {
    config: Arc<ServerConfig>,
    gateway: Arc<SessionGateway>,
}

impl SmtpServer {
    pub fn new(config: ServerConfig, gateway: Arc<SessionGateway>) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
        }
    }

    /// Serve until `shutdown` completes, then wait up to the drain timeout
    /// for open connections before aborting them.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> crate::error::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            domain = %self.config.domain,
            starttls = self.config.tls.is_some(),
            "SMTP server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let config = Arc::clone(&self.config);
                    let gateway = Arc::clone(&self.gateway);
                    connections.spawn(handle_connection(stream, peer.to_string(), config, gateway));
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(open = connections.len(), "SMTP server stopped accepting connections");

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                open = connections.len(),
                "Drain timeout elapsed, closing remaining connections"
            );
            connections.shutdown().await;
        }
        Ok(())
    }
}

/// Run the admission check and, if admitted, the SMTP dialogue.
pub async fn handle_connection<T>(
    stream: T,
    peer: String,
    config: Arc<ServerConfig>,
    gateway: Arc<SessionGateway>,
) where
    T: SmtpStream + 'static,
{
    let boxed: BoxedStream = Box::new(stream);
    let mut stream = BufStream::new(boxed);

    let session = match gateway.accept(&peer) {
        Ok(session) => session,
        Err(e) => {
            let reply = Reply::new(554, format!("5.7.1 {} {e}", config.domain));
            reply.write_to(&mut stream).await.ok();
            return;
        }
    };

    let span = info_span!("smtp_session", session_id = %session.id(), peer = %peer);
    let mut connection = Connection {
        stream: Some(stream),
        config,
        session: Some(session),
        greeted: false,
        secure: false,
    };

    async move {
        if let Err(e) = connection.run().await {
            debug!(error = %e, "Connection ended with error");
        }
        if let Some(session) = connection.session.take() {
            session.logout();
        }
    }
    .instrument(span)
    .await;
}

/// What the read loop should do next.
enum Flow {
    Continue,
    Close,
}

struct Connection {
    /// `None` only while a TLS handshake owns the stream.
    stream: Option<BufStream<BoxedStream>>,
    config: Arc<ServerConfig>,
    session: Option<Session>,
    greeted: bool,
    secure: bool,
}

impl Connection {
    async fn run(&mut self) -> io::Result<()> {
        let greeting = format!("{} ESMTP mail2chat ready", self.config.domain);
        self.reply(Reply::new(220, greeting)).await?;

        loop {
            let line = match self.read_command_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e) => return self.fail(e).await,
            };

            let flow = match Command::parse(&line) {
                Ok(command) => match self.handle(command).await {
                    Ok(flow) => flow,
                    Err(e) => return self.fail(e).await,
                },
                Err(e) => {
                    self.reply(Reply::new(501, format!("5.5.4 {e}"))).await?;
                    Flow::Continue
                }
            };

            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    /// Tell the client why the connection is closing, where that helps.
    async fn fail(&mut self, err: io::Error) -> io::Result<()> {
        match err.kind() {
            io::ErrorKind::TimedOut => {
                let text = format!("4.4.2 {} Idle timeout, closing connection", self.config.domain);
                self.reply(Reply::new(421, text)).await.ok();
                Ok(())
            }
            io::ErrorKind::InvalidData => {
                self.reply(Reply::new(500, format!("5.5.6 {err}"))).await.ok();
                Ok(())
            }
            io::ErrorKind::UnexpectedEof => Ok(()),
            _ => Err(err),
        }
    }

    fn session(&mut self) -> io::Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| io::Error::other("session already closed"))
    }

    fn stream(&mut self) -> io::Result<&mut BufStream<BoxedStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::other("connection stream unavailable"))
    }

    async fn handle(&mut self, command: Command) -> io::Result<Flow> {
        let domain = self.config.domain.clone();

        match command {
            Command::Helo(client) => {
                self.greeted = true;
                self.session()?.reset();
                self.reply(Reply::new(250, format!("{domain} Hello {client}")))
                    .await?;
            }
            Command::Ehlo(client) => {
                self.greeted = true;
                self.session()?.reset();
                let mut lines = vec![
                    format!("{domain} Hello {client}"),
                    format!("SIZE {}", self.config.max_message_bytes),
                    "8BITMIME".to_string(),
                ];
                if self.config.tls.is_some() && !self.secure {
                    lines.push("STARTTLS".to_string());
                }
                lines.push("AUTH PLAIN LOGIN".to_string());
                self.reply(Reply::multiline(250, lines)).await?;
            }
            Command::Mail { address, size } => {
                if !self.greeted {
                    self.reply(Reply::new(503, "5.5.1 Error: send HELO/EHLO first"))
                        .await?;
                } else if self.session()?.state() == SessionState::TransactionOpen {
                    self.reply(Reply::new(503, "5.5.1 Error: nested MAIL command"))
                        .await?;
                } else if size.is_some_and(|s| s > self.config.max_message_bytes) {
                    self.reply(Reply::new(552, "5.3.4 Error: message size exceeds limit"))
                        .await?;
                } else {
                    self.session()?.mail(&address);
                    self.reply(Reply::new(250, "2.1.0 Ok")).await?;
                }
            }
            Command::Rcpt(address) => {
                let max = self.config.max_recipients;
                let session = self.session()?;
                if session.state() == SessionState::Idle {
                    self.reply(Reply::new(503, "5.5.1 Error: need MAIL command"))
                        .await?;
                } else if session.recipients().len() >= max {
                    self.reply(Reply::new(452, "4.5.3 Error: too many recipients"))
                        .await?;
                } else {
                    session.rcpt(&address);
                    self.reply(Reply::new(250, "2.1.5 Ok")).await?;
                }
            }
            Command::Data => {
                let session = self.session()?;
                if session.state() == SessionState::Idle {
                    self.reply(Reply::new(503, "5.5.1 Error: need MAIL command"))
                        .await?;
                } else if session.recipients().is_empty() {
                    self.reply(Reply::new(503, "5.5.1 Error: need RCPT command"))
                        .await?;
                } else {
                    self.receive_data().await?;
                }
            }
            Command::Rset => {
                self.session()?.reset();
                self.reply(Reply::new(250, "2.0.0 Ok")).await?;
            }
            Command::Noop => {
                self.reply(Reply::new(250, "2.0.0 Ok")).await?;
            }
            Command::Vrfy => {
                self.reply(Reply::new(
                    252,
                    "2.5.0 Cannot VRFY user, but will accept message",
                ))
                .await?;
            }
            Command::Quit => {
                self.reply(Reply::new(221, "2.0.0 Bye")).await?;
                return Ok(Flow::Close);
            }
            Command::StartTls => match self.config.tls.clone() {
                None => {
                    self.reply(Reply::new(454, "4.7.0 TLS not available")).await?;
                }
                Some(_) if self.secure => {
                    self.reply(Reply::new(503, "5.5.1 Error: TLS already active"))
                        .await?;
                }
                Some(_) if !self.greeted => {
                    self.reply(Reply::new(503, "5.5.1 Error: send EHLO first"))
                        .await?;
                }
                Some(acceptor) => {
                    self.reply(Reply::new(220, "2.0.0 Ready to start TLS"))
                        .await?;
                    self.start_tls(acceptor).await?;
                }
            },
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                self.authenticate(&mechanism, initial_response).await?;
            }
            Command::Unknown(line) => {
                debug!(command = %line, "Unrecognized command");
                self.reply(Reply::new(500, "5.5.2 Error: command not recognized"))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Run the server side of the handshake on the current stream.
    ///
    /// Bytes the client pipelined after STARTTLS are discarded with the
    /// plaintext buffer, and the client must greet again.
    async fn start_tls(&mut self, acceptor: TlsAcceptor) -> io::Result<()> {
        let plain = self
            .stream
            .take()
            .ok_or_else(|| io::Error::other("connection stream unavailable"))?
            .into_inner();

        let tls = match tokio::time::timeout(self.config.read_timeout, acceptor.accept(plain)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                warn!(error = %e, "TLS handshake failed");
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, e));
            }
            Err(_) => {
                warn!("TLS handshake timed out");
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "TLS handshake timed out"));
            }
        };

        let boxed: BoxedStream = Box::new(tls);
        self.stream = Some(BufStream::new(boxed));
        self.secure = true;
        self.greeted = false;
        self.session()?.tls_started();
        Ok(())
    }

    /// AUTH PLAIN / LOGIN. Credentials are read and discarded.
    async fn authenticate(
        &mut self,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> io::Result<()> {
        if !self.greeted {
            return self
                .reply(Reply::new(503, "5.5.1 Error: send HELO/EHLO first"))
                .await;
        }
        if self.session()?.is_authenticated() {
            return self
                .reply(Reply::new(503, "5.5.1 Error: already authenticated"))
                .await;
        }
        if self.session()?.state() == SessionState::TransactionOpen {
            return self
                .reply(Reply::new(503, "5.5.1 Error: AUTH not allowed during a transaction"))
                .await;
        }

        // Server challenges, each answered by one client line.
        let challenges: &[&str] = match (mechanism, initial_response.is_some()) {
            ("PLAIN", true) => &[],
            ("PLAIN", false) => &[""],
            ("LOGIN", _) => &["VXNlcm5hbWU6", "UGFzc3dvcmQ6"],
            _ => {
                return self
                    .reply(Reply::new(504, "5.5.4 Unrecognized authentication type"))
                    .await;
            }
        };

        for challenge in challenges {
            self.reply(Reply::new(334, *challenge)).await?;
            let Some(answer) = self.read_command_line().await? else {
                return Err(io::ErrorKind::UnexpectedEof.into());
            };
            if answer.trim_end() == "*" {
                return self
                    .reply(Reply::new(501, "5.7.0 Authentication cancelled"))
                    .await;
            }
        }

        match self.session()?.authenticate(mechanism) {
            Ok(()) => {
                self.reply(Reply::new(235, "2.7.0 Authentication successful"))
                    .await
            }
            Err(e) => self.reply(Reply::new(535, format!("5.7.8 {e}"))).await,
        }
    }

    /// Read the message after DATA, dot-unstuffed, and hand it to the session.
    async fn receive_data(&mut self) -> io::Result<()> {
        self.reply(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
            .await?;

        let max = self.config.max_message_bytes;
        let mut data = Vec::new();
        let mut too_large = false;
        let mut at_line_start = true;

        loop {
            let chunk = self.read_chunk(DATA_READ_CHUNK).await?;
            if chunk.is_empty() {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }

            let content = if at_line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };
            at_line_start = chunk.ends_with(b"\n");

            if too_large {
                continue;
            }
            if data.len() + content.len() > max {
                too_large = true;
                data = Vec::new();
                continue;
            }
            data.extend_from_slice(content);
        }

        let session = self.session()?;
        if too_large {
            session.reset();
            warn!(limit = max, "Message exceeded size limit");
            return self
                .reply(Reply::new(552, "5.3.4 Error: maximum message size exceeded"))
                .await;
        }

        let outcome = session.data(data.as_slice()).await;
        match outcome {
            Ok(()) => {
                self.reply(Reply::new(250, "2.0.0 OK: message forwarded"))
                    .await
            }
            Err(e) => {
                error!(error = %e, "Message not forwarded");
                self.reply(Reply::from(&e)).await
            }
        }
    }

    /// Read one command line. `Ok(None)` on a clean EOF.
    async fn read_command_line(&mut self) -> io::Result<Option<String>> {
        let line = self.read_chunk(MAX_COMMAND_LINE as u64).await?;
        if line.is_empty() {
            return Ok(None);
        }
        if !line.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Error: line too long",
            ));
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Read up to and including `\n`, at most `limit` bytes, within the read timeout.
    async fn read_chunk(&mut self, limit: u64) -> io::Result<Vec<u8>> {
        let timeout = self.config.read_timeout;
        let mut buf = Vec::new();
        let mut limited = self.stream()?.take(limit);
        let read = limited.read_until(b'\n', &mut buf);
        match tokio::time::timeout(timeout, read).await {
            Ok(result) => result.map(|_| buf),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        }
    }

    async fn reply(&mut self, reply: Reply) -> io::Result<()> {
        reply.write_to(self.stream()?).await
    }
}
