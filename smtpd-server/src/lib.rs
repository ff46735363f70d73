//! Listener and session manager for the `smtpd` embeddable SMTP server:
//! socket binding, the `maxClients` accept gate, implicit-TLS-on-accept,
//! and graceful shutdown, wired around the `smtpd` crate's per-connection
//! protocol engine. One module per concern, re-exported flat at the
//! crate root.

pub mod config;
pub mod error;
pub mod listener;
pub mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{ConfigError, ListenerError};
pub use listener::{BoundListener, Listener};
pub use server::Server;
