//! The per-connection SMTP protocol engine: line framing, command/address
//! parsing, capability advertising, the AUTH sub-protocol engine, the
//! connection state machine, and the `Session` conversation loop that
//! ties them together and calls out to consumer-supplied callbacks.

pub mod auth;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod framer;
pub mod session;
pub mod sink;
pub mod state;

pub use auth::{AuthMechanism, AuthOutcome, AuthRequest, XOAuth2Challenge};
pub use command::Command;
pub use connection::{Connection, TlsContext, TlsInfo};
pub use extensions::{advertised, Capability, CapabilityInputs};
pub use session::{Handlers, Outcome, Session, SessionConfig, SessionInfo, Signal};
pub use sink::{DataSource, DataStream};
pub use state::ConnectionState;
