//! Inbound-to-outbound dispatch pipeline.
//!
//! Every accepted message flows through:
//! 1. `resolver::resolve()`: first recipient → (platform, raw identifier)
//! 2. `normalizer::normalize()`: raw bytes → `NormalizedMessage`
//! 3. identifier finalization (group rewrite, username lookup)
//! 4. `formatter::format_for_platform()`: platform markup
//! 5. `PlatformClient::send_long()`: chunked delivery
//!
//! `Dispatcher` drives the steps and writes an audit line for each outcome.

pub mod dispatcher;
pub mod formatter;
pub mod normalizer;
pub mod resolver;

pub use dispatcher::Dispatcher;
pub use normalizer::NormalizedMessage;
pub use resolver::PlatformIdentifier;
