//! SMTP reply status codes, covering the full set the wire protocol and
//! connection state machine use (greeting through AUTH/TLS replies).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    HelpMessage = 214,
    ServiceReady = 220,
    Closing = 221,
    AuthSuccessful = 235,
    Ok = 250,
    CannotVerify = 252,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    ActionNotTaken = 450,
    InsufficientStorage = 452,
    SyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequence = 503,
    ParameterNotImplemented = 504,
    AuthenticationRequired = 530,
    AuthenticationFailed = 535,
    MailboxUnavailable = 550,
    ExceededStorage = 552,
    TransactionFailed = 554,
    Unknown(u16),
}

impl Status {
    pub const fn code(self) -> u16 {
        match self {
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::Closing => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionNotTaken => 450,
            Status::InsufficientStorage => 452,
            Status::SyntaxError => 500,
            Status::ParameterSyntaxError => 501,
            Status::CommandNotImplemented => 502,
            Status::BadSequence => 503,
            Status::ParameterNotImplemented => 504,
            Status::AuthenticationRequired => 530,
            Status::AuthenticationFailed => 535,
            Status::MailboxUnavailable => 550,
            Status::ExceededStorage => 552,
            Status::TransactionFailed => 554,
            Status::Unknown(code) => code,
        }
    }

    pub const fn is_permanent(self) -> bool {
        self.code() >= 500
    }

    pub const fn is_temporary(self) -> bool {
        let code = self.code();
        code >= 400 && code < 500
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        match code {
            214 => Status::HelpMessage,
            220 => Status::ServiceReady,
            221 => Status::Closing,
            235 => Status::AuthSuccessful,
            250 => Status::Ok,
            252 => Status::CannotVerify,
            334 => Status::AuthContinue,
            354 => Status::StartMailInput,
            421 => Status::Unavailable,
            450 => Status::ActionNotTaken,
            452 => Status::InsufficientStorage,
            500 => Status::SyntaxError,
            501 => Status::ParameterSyntaxError,
            502 => Status::CommandNotImplemented,
            503 => Status::BadSequence,
            504 => Status::ParameterNotImplemented,
            530 => Status::AuthenticationRequired,
            535 => Status::AuthenticationFailed,
            550 => Status::MailboxUnavailable,
            552 => Status::ExceededStorage,
            554 => Status::TransactionFailed,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_and_temporariness() {
        assert!(Status::TransactionFailed.is_permanent());
        assert!(!Status::TransactionFailed.is_temporary());
        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());
        assert!(!Status::Ok.is_permanent());
        assert!(!Status::Ok.is_temporary());
    }

    #[test]
    fn round_trips_through_u16() {
        for status in [
            Status::ServiceReady,
            Status::AuthSuccessful,
            Status::Ok,
            Status::BadSequence,
            Status::AuthenticationFailed,
            Status::TransactionFailed,
        ] {
            let code: u16 = status.into();
            assert_eq!(Status::from(code), status);
        }
    }

    #[test]
    fn unknown_code_preserved() {
        assert_eq!(Status::from(999).code(), 999);
    }
}
