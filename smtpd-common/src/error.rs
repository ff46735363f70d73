//! Error types shared across the protocol and listener layers: one
//! `thiserror`-derived enum per concern, composing via `#[from]` rather
//! than a single catch-all error.

use thiserror::Error;

/// Syntax/sequence-level protocol errors: local, non-terminal error kinds
/// that carry a reply but never close the connection; the state machine
/// emits the reply and continues with state unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("line too long")]
    LineTooLong,
    #[error("syntax error in parameters or arguments")]
    SyntaxError,
    #[error("bad sequence of commands")]
    BadSequence,
    #[error("command not recognized: {0}")]
    UnknownCommand(String),
    #[error("command not implemented")]
    NotImplemented,
}

/// Session-terminal errors: a reply is written (if any) and the
/// connection closes. The distinct termination causes a session can end
/// with (client quit, idle timeout, server shutdown, protocol-violation
/// caps) are reported by `session::Outcome` instead; this type only
/// carries the I/O failures that abort a session mid-operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_messages_are_stable() {
        assert_eq!(ProtocolError::LineTooLong.to_string(), "line too long");
        assert_eq!(
            ProtocolError::UnknownCommand("FROB".into()).to_string(),
            "command not recognized: FROB"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let session_err: SessionError = io_err.into();
        assert!(matches!(session_err, SessionError::Io(_)));
    }
}
