//! SMTP verb and address-command parsing.
//!
//! `MAIL FROM:`/`RCPT TO:` are special-cased by prefix inspection and a
//! lenient regex-shaped grammar rather than delegated to a full mailbox
//! grammar crate, which would be stricter than this wire format allows
//! and couldn't express the `MailParameters::None`/`Some(..)` sentinel
//! this crate needs to preserve.

use std::collections::BTreeMap;

use smtpd_common::address::{Address, MailParameters};

/// A parsed command line, split into its verb and argument region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom(Address),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    StartTls,
    Auth(String),
    Unknown(String),
}

impl Command {
    /// The leading alphabetic token, uppercased, used for sequence/unknown
    /// bookkeeping and for the HTTP-method guard.
    #[must_use]
    pub fn verb(line: &str) -> &str {
        line.trim_start()
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
    }

    /// Parse a single CRLF-stripped command line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let verb = Self::verb(line).to_ascii_uppercase();

        match verb.as_str() {
            "EHLO" => match rest_after_verb(line, verb.len()) {
                Some(host) if !host.is_empty() => Self::Ehlo(host.to_string()),
                _ => Self::Unknown(line.to_string()),
            },
            "HELO" => match rest_after_verb(line, verb.len()) {
                Some(host) if !host.is_empty() => Self::Helo(host.to_string()),
                _ => Self::Unknown(line.to_string()),
            },
            "MAIL" => parse_address_command(line, "MAIL FROM")
                .map(Self::MailFrom)
                .unwrap_or_else(|| Self::Unknown(line.to_string())),
            "RCPT" => parse_address_command(line, "RCPT TO")
                .map(Self::RcptTo)
                .unwrap_or_else(|| Self::Unknown(line.to_string())),
            "DATA" if is_bare(line, &verb) => Self::Data,
            "RSET" if is_bare(line, &verb) => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" if is_bare(line, &verb) => Self::Quit,
            "VRFY" => Self::Vrfy,
            "HELP" => Self::Help,
            "STARTTLS" if is_bare(line, &verb) => Self::StartTls,
            "AUTH" => Self::Auth(rest_after_verb(line, verb.len()).unwrap_or("").to_string()),
            _ => Self::Unknown(line.to_string()),
        }
    }
}

fn is_bare(line: &str, verb: &str) -> bool {
    line.trim().len() == verb.len()
}

fn rest_after_verb(line: &str, verb_len: usize) -> Option<&str> {
    line.get(verb_len..).map(str::trim)
}

/// Parses `MAIL FROM:<addr> [KEY=VALUE ...]` / `RCPT TO:<addr> [...]`
/// against the grammar:
///
/// ```text
/// ^(MAIL FROM|RCPT TO)\s*:\s*<([^>]*)>(\s+.*)?$
/// ```
///
/// case-insensitively. Whitespace before the colon is accepted leniently,
/// though RFC 5321 forbids it.
fn parse_address_command(line: &str, expected_verb: &str) -> Option<Address> {
    let upper = line.to_ascii_uppercase();
    let verb_prefix = expected_verb; // e.g. "MAIL FROM" / "RCPT TO", both uppercase already
    if !upper.starts_with(verb_prefix) {
        return None;
    }

    let after_verb = &line[verb_prefix.len()..];
    let after_verb_upper = &upper[verb_prefix.len()..];

    // Optional whitespace, a colon, optional whitespace.
    let trimmed_ws = after_verb_upper.trim_start();
    let consumed_ws = after_verb_upper.len() - trimmed_ws.len();
    if !trimmed_ws.starts_with(':') {
        return None;
    }
    let after_colon = &after_verb[consumed_ws + 1..];
    let after_colon_trimmed = after_colon.trim_start();

    if !after_colon_trimmed.starts_with('<') {
        return None;
    }
    let close = after_colon_trimmed.find('>')?;
    let mailbox = &after_colon_trimmed[1..close];
    let trailer = after_colon_trimmed[close + 1..].trim();

    let params = if trailer.is_empty() {
        MailParameters::None
    } else {
        let mut map = BTreeMap::new();
        for token in trailer.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) => {
                    map.insert(key.to_ascii_uppercase(), value.to_string());
                }
                None => {
                    map.insert(token.to_ascii_uppercase(), String::new());
                }
            }
        }
        MailParameters::Some(map)
    };

    Some(Address::new(mailbox, params))
}
