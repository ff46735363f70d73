//! The envelope address type: a parsed mailbox plus its ESMTP parameters.
//!
//! A full RFC 5322 mailbox grammar doesn't carry a distinction between "no
//! parameters supplied" and "an empty parameter map" and can't express the
//! empty-angle-brackets null sender cleanly, so this is a lenient,
//! from-scratch type rather than a wrapper around one.

use std::collections::BTreeMap;
use std::fmt;

/// The ESMTP parameters trailing a `MAIL FROM`/`RCPT TO` command.
///
/// `None` means no parameter token was present at all; `Some(map)` means a
/// parameter region was present (possibly parsing to an empty map). The
/// distinction matters for round-tripping and is called out explicitly as
/// a required tagged variant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MailParameters {
    #[default]
    None,
    Some(BTreeMap<String, String>),
}

impl MailParameters {
    pub fn is_none(&self) -> bool {
        matches!(self, MailParameters::None)
    }

    /// Looks up a parameter by its uppercased key; absent either because
    /// there were no parameters or because this key wasn't among them.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            MailParameters::None => None,
            MailParameters::Some(map) => map.get(&key.to_ascii_uppercase()).map(String::as_str),
        }
    }
}

impl fmt::Display for MailParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailParameters::None => Ok(()),
            MailParameters::Some(map) => {
                for (key, value) in map {
                    if value.is_empty() {
                        write!(f, " {key}")?;
                    } else {
                        write!(f, " {key}={value}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// A parsed `MAIL FROM`/`RCPT TO` mailbox. `mailbox` is empty for the null
/// sender (`MAIL FROM:<>`); `params` carries any ESMTP parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub mailbox: String,
    pub params: MailParameters,
}

impl Address {
    pub fn new(mailbox: impl Into<String>, params: MailParameters) -> Self {
        Self {
            mailbox: mailbox.into(),
            params,
        }
    }

    /// The null sender, `MAIL FROM:<>`.
    pub fn null_sender() -> Self {
        Self::default()
    }

    pub fn is_null_sender(&self) -> bool {
        self.mailbox.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>{}", self.mailbox, self.params)
    }
}

/// An ordered sequence of `RCPT TO` addresses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressList(pub Vec<Address>);

impl AddressList {
    pub fn push(&mut self, address: Address) {
        self.0.push(address);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Address> {
        self.0.iter()
    }
}

impl fmt::Display for AddressList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for address in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{address}")?;
        }
        Ok(())
    }
}

impl FromIterator<Address> for AddressList {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        AddressList(iter.into_iter().collect())
    }
}
