use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use mail2chat::admission::AdmissionFilter;
use mail2chat::audit::open_audit_sink;
use mail2chat::config::{BridgeConfig, USAGE};
use mail2chat::pipeline::Dispatcher;
use mail2chat::platforms::PlatformClient;
use mail2chat::platforms::slack::SlackClient;
use mail2chat::platforms::telegram::TelegramClient;
use mail2chat::smtp::{ServerConfig, SessionGateway, SmtpServer, tls};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().skip(1).any(|a| a == "--help" || a == "-h") {
        print!("{USAGE}");
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BridgeConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  Run with --help for the list of environment variables.");
        std::process::exit(1);
    });

    eprintln!("📧 mail2chat v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   SMTP: {}", config.listen_addr());

    let audit = open_audit_sink(&config.audit_syslog_socket);
    let mut dispatcher = Dispatcher::new(audit);

    // ── Platform clients ────────────────────────────────────────────────
    if let Some(token) = config.telegram_bot_token.clone() {
        let client = Arc::new(TelegramClient::new(token).context("building Telegram client")?);
        check_connection(client.as_ref()).await;
        dispatcher = dispatcher.with_client(client);
        eprintln!("   Telegram: enabled");
    }

    if let Some(token) = config.slack_bot_token.clone() {
        let client = Arc::new(SlackClient::new(token).context("building Slack client")?);
        check_connection(client.as_ref()).await;
        dispatcher = dispatcher.with_client(client);
        eprintln!("   Slack: enabled");
    }

    // ── SMTP server ─────────────────────────────────────────────────────
    let admission = AdmissionFilter::from_ranges(&config.allowed_networks);
    if admission.is_empty() {
        eprintln!("   Allowed networks: any");
    } else {
        eprintln!("   Allowed networks: {} range(s)", admission.len());
    }

    let starttls = match &config.tls {
        Some(files) => {
            let acceptor = tls::load_acceptor(files).context("loading TLS certificate")?;
            eprintln!("   STARTTLS: enabled ({})", files.cert_path.display());
            Some(acceptor)
        }
        None => {
            eprintln!("   STARTTLS: disabled");
            None
        }
    };

    let gateway = Arc::new(SessionGateway::new(admission, Arc::new(dispatcher)));
    let server_config = ServerConfig {
        domain: config.smtp_domain.clone(),
        tls: starttls,
        ..Default::default()
    };

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding SMTP listener on {}", config.listen_addr()))?;

    SmtpServer::new(server_config, gateway)
        .serve(listener, shutdown_signal())
        .await?;

    info!("mail2chat stopped");
    Ok(())
}

/// Startup credential check. A failure is logged, not fatal.
async fn check_connection(client: &dyn PlatformClient) {
    match client.test_connection().await {
        Ok(()) => info!(platform = %client.platform(), "Platform connection verified"),
        Err(e) => warn!(
            platform = %client.platform(),
            error = %e,
            "Platform connection test failed, continuing anyway"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
