//! The connection state machine: a payload-free state set (`Ready`,
//! `MailAccepted`, etc.) separate from the `Envelope`/`Session` data it
//! gates, so transitions can be checked without touching the data they
//! guard.

use core::fmt::{self, Display, Formatter};

use crate::auth::AuthMechanism;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSubState {
    Plain,
    LoginUser,
    LoginPass,
    XOAuth2,
}

/// The per-connection conversation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    GreetingSent,
    Ready,
    MailAccepted,
    DataReceiving,
    Authenticating(AuthSubState),
    Closing,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::GreetingSent => f.write_str("GREETING_SENT"),
            Self::Ready => f.write_str("READY"),
            Self::MailAccepted => f.write_str("MAIL_ACCEPTED"),
            Self::DataReceiving => f.write_str("DATA_RECEIVING"),
            Self::Authenticating(AuthSubState::Plain) => f.write_str("AUTHENTICATING_PLAIN"),
            Self::Authenticating(AuthSubState::LoginUser) => {
                f.write_str("AUTHENTICATING_LOGIN_USER")
            }
            Self::Authenticating(AuthSubState::LoginPass) => {
                f.write_str("AUTHENTICATING_LOGIN_PASS")
            }
            Self::Authenticating(AuthSubState::XOAuth2) => f.write_str("AUTHENTICATING_XOAUTH2"),
            Self::Closing => f.write_str("CLOSING"),
        }
    }
}

impl ConnectionState {
    /// `MAIL FROM` is legal only in `READY`.
    #[must_use]
    pub const fn can_mail_from(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// `RCPT TO` is legal only in `MAIL_ACCEPTED`.
    #[must_use]
    pub const fn can_rcpt_to(self) -> bool {
        matches!(self, Self::MailAccepted)
    }

    /// `DATA` is legal only in `MAIL_ACCEPTED`; callers must separately
    /// check that `rcptTo` is non-empty.
    #[must_use]
    pub const fn can_data(self) -> bool {
        matches!(self, Self::MailAccepted)
    }

    /// `AUTH` is legal only before any envelope command, i.e. in `READY`
    ///.
    #[must_use]
    pub const fn can_auth(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// `STARTTLS` is legal only when not already secure; the caller
    /// additionally checks `!secure` and that STARTTLS is enabled.
    #[must_use]
    pub const fn can_starttls(self) -> bool {
        matches!(self, Self::Ready | Self::GreetingSent)
    }

    #[must_use]
    pub const fn is_authenticating(self) -> bool {
        matches!(self, Self::Authenticating(_))
    }
}

/// Inputs required to decide `AUTH` legality beyond state: legal only
/// when TLS is in effect or `allowInsecureAuth` is set.
#[must_use]
pub fn auth_allowed(state: ConnectionState, secure: bool, allow_insecure: bool) -> bool {
    state.can_auth() && (secure || allow_insecure)
}

/// All recognized mechanisms an operator may enable, in the order they
/// should be advertised.
pub const ALL_MECHANISMS: [AuthMechanism; 3] =
    [AuthMechanism::Plain, AuthMechanism::Login, AuthMechanism::XOAuth2];
