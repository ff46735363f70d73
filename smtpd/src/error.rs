//! Error types for the protocol engine: one `thiserror` enum per concern,
//! composing via `#[from]` rather than one catch-all.
//! `smtpd_common::error` supplies the shared, cross-crate
//! `ProtocolError`/`SessionError`; this module adds the kinds specific to
//! the protocol engine (TLS, auth, policy callbacks, the data sink
//! boundary).

use std::io;

use thiserror::Error;

/// Errors that can occur sending/receiving on the underlying transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("response formatting error: {0}")]
    Format(#[from] std::fmt::Error),

    #[error("connection closed by peer")]
    Closed,
}

/// Errors from the STARTTLS upgrade path.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors from the AUTH sub-protocol engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid base64")]
    Base64,

    #[error("malformed SASL response")]
    MalformedResponse,

    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("authentication failed{}", .0.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    Rejected(Option<String>),

    #[error("authentication requires a secure channel")]
    InsecureChannel,
}

/// A policy decision returned by a `mailFrom`/`rcptTo` consumer callback
///: surfaced to the client verbatim, code and message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
pub struct PolicyError {
    pub code: u16,
    pub message: String,
}

impl PolicyError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Default for PolicyError {
    fn default() -> Self {
        Self::new(550, "Mailbox unavailable")
    }
}

/// An error surfaced by the `onData` consumer callback via `done(err)`
///. Defaults to `450` per the DATA Sink Adapter contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}: {message}", response_code)]
pub struct SinkError {
    pub response_code: u16,
    pub message: String,
}

impl SinkError {
    pub fn new(response_code: u16, message: impl Into<String>) -> Self {
        Self {
            response_code,
            message: message.into(),
        }
    }
}

impl Default for SinkError {
    fn default() -> Self {
        Self::new(450, "Requested action not taken")
    }
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_error_default_is_550() {
        assert_eq!(PolicyError::default().code, 550);
    }

    #[test]
    fn sink_error_default_is_450() {
        assert_eq!(SinkError::default().response_code, 450);
    }

    #[test]
    fn auth_error_rejected_message_optional() {
        assert_eq!(
            AuthError::Rejected(None).to_string(),
            "authentication failed"
        );
        assert_eq!(
            AuthError::Rejected(Some("bad creds".into())).to_string(),
            "authentication failed: bad creds"
        );
    }
}
