//! SMTP front end: command parsing, the session gateway, the listener
//! and its STARTTLS acceptor.

pub mod command;
pub mod server;
pub mod session;
pub mod tls;

pub use command::{Command, Reply};
pub use server::{BoxedStream, ServerConfig, SmtpServer, SmtpStream};
pub use session::{Session, SessionGateway, SessionState};
