//! mail2chat: receive mail over SMTP and forward it to chat platforms.

pub mod admission;
pub mod audit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod platforms;
pub mod smtp;
