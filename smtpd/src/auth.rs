//! AUTH sub-protocol engine: PLAIN, LOGIN, XOAUTH2 over the standard
//! base64 SASL wire encodings (PLAIN's `\0user\0pass`, LOGIN's two
//! `334`-prompted continuations, XOAUTH2's
//! `user=<u>\x01auth=Bearer <token>\x01\x01`), driven by a narrow,
//! replaceable `authenticate` callback returning a structured outcome.

use core::fmt::{self, Display, Formatter};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// A SASL mechanism this engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthMechanism {
    Plain,
    Login,
    XOAuth2,
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::XOAuth2 => "XOAUTH2",
        })
    }
}

impl AuthMechanism {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "XOAUTH2" => Some(Self::XOAuth2),
            _ => None,
        }
    }
}

/// The credential bundle handed to the consumer's `authenticate` callback
/// once a mechanism's exchange completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub method: AuthMechanism,
    pub username: String,
    pub password: Option<String>,
    pub access_token: Option<String>,
}

/// A structured XOAUTH2 failure the consumer callback may return; relayed
/// back to the client as a base64'd JSON blob on the first failure, then a
/// bare `535` on the client's blank continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XOAuth2Challenge {
    pub status: String,
    pub schemes: String,
    pub scope: String,
}

/// The outcome of an authentication attempt, returned by the consumer's
/// `authenticate` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success { user: String },
    Rejected { message: Option<String> },
    XOAuth2Challenge(XOAuth2Challenge),
}

fn decode_base64(data: &str) -> Result<Vec<u8>, AuthError> {
    BASE64.decode(data.trim()).map_err(|_| AuthError::Base64)
}

/// Decodes an `AUTH PLAIN` payload: `authzid\0username\0password`. An
/// empty `authzid` is permitted.
pub fn decode_plain(payload: &str) -> Result<(String, String), AuthError> {
    let raw = decode_base64(payload)?;
    let text = String::from_utf8(raw).map_err(|_| AuthError::MalformedResponse)?;
    let mut parts = text.splitn(3, '\0');
    let _authzid = parts.next().ok_or(AuthError::MalformedResponse)?;
    let username = parts.next().ok_or(AuthError::MalformedResponse)?;
    let password = parts.next().ok_or(AuthError::MalformedResponse)?;
    Ok((username.to_string(), password.to_string()))
}

/// Decodes a single base64'd LOGIN continuation line (username or password).
pub fn decode_login_field(payload: &str) -> Result<String, AuthError> {
    let raw = decode_base64(payload)?;
    String::from_utf8(raw).map_err(|_| AuthError::MalformedResponse)
}

/// Decodes an `AUTH XOAUTH2` payload:
/// `user=<u>\x01auth=Bearer <token>\x01\x01`.
pub fn decode_xoauth2(payload: &str) -> Result<(String, String), AuthError> {
    let raw = decode_base64(payload)?;
    let text = String::from_utf8(raw).map_err(|_| AuthError::MalformedResponse)?;

    let mut user = None;
    let mut token = None;
    for field in text.split('\u{1}') {
        if field.is_empty() {
            continue;
        }
        if let Some(value) = field.strip_prefix("user=") {
            user = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("auth=Bearer ") {
            token = Some(value.to_string());
        }
    }

    match (user, token) {
        (Some(user), Some(token)) => Ok((user, token)),
        _ => Err(AuthError::MalformedResponse),
    }
}

/// `334 VXNlcm5hbWU6` -- the base64 encoding of `Username:`.
#[must_use]
pub fn login_username_prompt() -> String {
    BASE64.encode("Username:")
}

/// `334 UGFzc3dvcmQ6` -- the base64 encoding of `Password:`.
#[must_use]
pub fn login_password_prompt() -> String {
    BASE64.encode("Password:")
}

/// Encodes a structured XOAUTH2 challenge as base64'd JSON for the `334`
/// continuation line.
#[must_use]
pub fn encode_xoauth2_challenge(challenge: &XOAuth2Challenge) -> String {
    let json = serde_json::to_string(challenge).unwrap_or_default();
    BASE64.encode(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trip() {
        let payload = BASE64.encode("\0testuser\0testpass");
        let (user, pass) = decode_plain(&payload).unwrap();
        assert_eq!(user, "testuser");
        assert_eq!(pass, "testpass");
    }

    #[test]
    fn plain_with_authzid() {
        let payload = BASE64.encode("authz\0testuser\0testpass");
        let (user, pass) = decode_plain(&payload).unwrap();
        assert_eq!(user, "testuser");
        assert_eq!(pass, "testpass");
    }

    #[test]
    fn plain_rejects_bad_base64() {
        assert_eq!(decode_plain("not base64!!"), Err(AuthError::Base64));
    }

    #[test]
    fn plain_rejects_missing_fields() {
        let payload = BASE64.encode("\0onlyuser");
        assert_eq!(decode_plain(&payload), Err(AuthError::MalformedResponse));
    }

    #[test]
    fn login_prompts_are_stable() {
        assert_eq!(login_username_prompt(), "VXNlcm5hbWU6");
        assert_eq!(login_password_prompt(), "UGFzc3dvcmQ6");
    }

    #[test]
    fn login_field_round_trip() {
        let payload = BASE64.encode("alice");
        assert_eq!(decode_login_field(&payload).unwrap(), "alice");
    }

    #[test]
    fn xoauth2_round_trip() {
        let sasl = "user=alice@example.com\u{1}auth=Bearer ya29.abc\u{1}\u{1}";
        let payload = BASE64.encode(sasl);
        let (user, token) = decode_xoauth2(&payload).unwrap();
        assert_eq!(user, "alice@example.com");
        assert_eq!(token, "ya29.abc");
    }

    #[test]
    fn xoauth2_missing_token_is_malformed() {
        let sasl = "user=alice@example.com\u{1}\u{1}";
        let payload = BASE64.encode(sasl);
        assert_eq!(decode_xoauth2(&payload), Err(AuthError::MalformedResponse));
    }

    #[test]
    fn xoauth2_challenge_encodes_valid_json() {
        let challenge = XOAuth2Challenge {
            status: "400".into(),
            schemes: "Bearer".into(),
            scope: "https://mail.example.com/".into(),
        };
        let encoded = encode_xoauth2_challenge(&challenge);
        let decoded = BASE64.decode(encoded).unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.contains(r#""status":"400""#));
        assert!(text.contains(r#""schemes":"Bearer""#));
    }

    #[test]
    fn mechanism_parse_case_insensitive() {
        assert_eq!(AuthMechanism::parse("plain"), Some(AuthMechanism::Plain));
        assert_eq!(AuthMechanism::parse("Login"), Some(AuthMechanism::Login));
        assert_eq!(AuthMechanism::parse("XOAUTH2"), Some(AuthMechanism::XOAuth2));
        assert_eq!(AuthMechanism::parse("CRAM-MD5"), None);
    }
}
