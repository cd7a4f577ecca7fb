//! line-echo: a concurrent line-oriented TCP echo service.
//!
//! Every line a client sends is written back verbatim, followed by `\n`.
//!
//! Features:
//! - One task per connection; a slow or broken client never delays others
//! - Bounded line length, optional idle timeout and connection limit
//! - Graceful shutdown that closes every live connection
//! - Interactive client relaying standard input to the server
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;

pub use client::{Client, Relay};
pub use config::{ClientConfig, Config, ConfigError, DEFAULT_PORT};
pub use error::ConnError;
pub use server::{Server, ServerStats};
