//! End-to-end tests: a real TCP listener, raw SMTP, and a mocked Telegram API.

use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Server};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;

use mail2chat::admission::AdmissionFilter;
use mail2chat::audit::MemoryAuditSink;
use mail2chat::pipeline::Dispatcher;
use mail2chat::platforms::TelegramClient;
use mail2chat::smtp::{ServerConfig, SessionGateway, SmtpServer};

struct Bridge {
    addr: std::net::SocketAddr,
    audit: Arc<MemoryAuditSink>,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_bridge(telegram_url: &str, ranges: &[&str]) -> Bridge {
    let audit = Arc::new(MemoryAuditSink::new());
    let telegram = TelegramClient::new(SecretString::from("123:ABC"))
        .unwrap()
        .with_base_url(telegram_url)
        .with_chunk_delay(Duration::ZERO);
    let dispatcher = Dispatcher::new(audit.clone()).with_client(Arc::new(telegram));
    let gateway = Arc::new(SessionGateway::new(
        AdmissionFilter::from_ranges(ranges.iter().copied()),
        Arc::new(dispatcher),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        SmtpServer::new(ServerConfig::default(), gateway)
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    Bridge {
        addr,
        audit,
        stop: Some(stop),
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    /// One full reply; multi-line replies are joined.
    async fn reply(&mut self) -> String {
        let mut out = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await.unwrap() == 0 {
                return out;
            }
            out.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return out;
            }
        }
    }

    async fn command(&mut self, line: &str) -> String {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.reply().await
    }

    /// Greeting through DATA; returns the reply to the message body.
    async fn send_mail(&mut self, rcpt: &str, message: &str) -> String {
        assert!(self.reply().await.starts_with("220"));
        assert!(self.command("EHLO test.local\r\n").await.starts_with("250"));
        assert!(
            self.command("MAIL FROM:<sender@example.com>\r\n")
                .await
                .starts_with("250")
        );
        assert!(
            self.command(&format!("RCPT TO:<{rcpt}>\r\n"))
                .await
                .starts_with("250")
        );
        assert!(self.command("DATA\r\n").await.starts_with("354"));
        self.command(message).await
    }
}

const MESSAGE: &str = "From: Sender <sender@example.com>\r\n\
    To: 123456789@telegram\r\n\
    Subject: Disk alert\r\n\
    Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
    \r\n\
    hello from the backup host\r\n\
    .\r\n";

// ── Delivery ────────────────────────────────────────────────────────

#[tokio::test]
async fn telegram_recipient_is_delivered() {
    let mut api = Server::new_async().await;
    let mock = api
        .mock("POST", "/bot123:ABC/sendMessage")
        .match_body(Matcher::AllOf(vec![
            Matcher::PartialJson(serde_json::json!({
                "chat_id": "123456789",
                "parse_mode": "HTML",
            })),
            Matcher::Regex("hello from the backup host".into()),
            Matcher::Regex("Disk alert".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"ok":true,"result":{"message_id":7}}"#)
        .expect(1)
        .create_async()
        .await;

    let bridge = start_bridge(&api.url(), &[]).await;
    let mut client = Client::connect(bridge.addr).await;

    let reply = client.send_mail("123456789@telegram", MESSAGE).await;
    assert!(reply.starts_with("250 "), "{reply}");
    assert!(client.command("QUIT\r\n").await.starts_with("221"));

    mock.assert_async().await;

    let lines = bridge.audit.lines().await;
    assert_eq!(lines.len(), 2, "{lines:?}");
    assert!(lines[0].contains("from=sender@example.com"));
    assert!(lines[0].contains("platform=telegram user_id=123456789 msg=Processing email"));
    assert!(lines[1].ends_with("msg=Email sent successfully"));
}

#[tokio::test]
async fn platform_rejection_is_reported_as_transient() {
    let mut api = Server::new_async().await;
    let _mock = api
        .mock("POST", "/bot123:ABC/sendMessage")
        .with_status(400)
        .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#)
        .create_async()
        .await;

    let bridge = start_bridge(&api.url(), &[]).await;
    let mut client = Client::connect(bridge.addr).await;

    let reply = client.send_mail("123456789@telegram", MESSAGE).await;
    assert!(reply.starts_with("451 "), "{reply}");

    let lines = bridge.audit.lines().await;
    assert!(
        lines
            .last()
            .is_some_and(|l| l.contains("Send failed:") && l.contains("chat not found")),
        "{lines:?}"
    );
}

// ── Refusals ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_platform_is_refused_without_sending() {
    let mut api = Server::new_async().await;
    let mock = api
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let bridge = start_bridge(&api.url(), &[]).await;
    let mut client = Client::connect(bridge.addr).await;

    let reply = client.send_mail("bogus@unknownplatform", MESSAGE).await;
    assert!(reply.starts_with("550 "), "{reply}");

    mock.assert_async().await;
    let lines = bridge.audit.lines().await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with("msg=Invalid destination: unsupported platform: unknownplatform"));
}

#[tokio::test]
async fn peer_outside_allowed_networks_is_rejected() {
    let api = Server::new_async().await;
    let bridge = start_bridge(&api.url(), &["10.0.0.0/8"]).await;
    let mut client = Client::connect(bridge.addr).await;

    let reply = client.reply().await;
    assert!(reply.starts_with("554 5.7.1"), "{reply}");
    // Server closes the connection after the rejection.
    assert_eq!(client.reply().await, "");
    assert!(bridge.audit.lines().await.is_empty());
}

#[tokio::test]
async fn loopback_range_is_admitted() {
    let api = Server::new_async().await;
    let bridge = start_bridge(&api.url(), &["127.0.0.0/8", "not-a-cidr"]).await;
    let mut client = Client::connect(bridge.addr).await;

    assert!(client.reply().await.starts_with("220"));
    assert!(client.command("QUIT\r\n").await.starts_with("221"));
}
