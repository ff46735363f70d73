//! The `MAIL FROM` + `RCPT TO` set bounding a single message submission.

use crate::address::{Address, AddressList};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    mail_from: Option<Address>,
    rcpt_to: AddressList,
}

impl Envelope {
    pub fn mail_from(&self) -> Option<&Address> {
        self.mail_from.as_ref()
    }

    pub fn rcpt_to(&self) -> &AddressList {
        &self.rcpt_to
    }

    pub fn set_mail_from(&mut self, address: Address) {
        self.mail_from = Some(address);
    }

    pub fn add_recipient(&mut self, address: Address) {
        self.rcpt_to.push(address);
    }

    /// Resets to an empty envelope: on `RSET`, session start, and after a
    /// successful `DATA` completion.
    pub fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to = AddressList::default();
    }

    pub fn is_empty(&self) -> bool {
        self.mail_from.is_none() && self.rcpt_to.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MailParameters;

    #[test]
    fn reset_clears_both_fields() {
        let mut envelope = Envelope::default();
        envelope.set_mail_from(Address::new("a@example.com", MailParameters::None));
        envelope.add_recipient(Address::new("b@example.com", MailParameters::None));
        assert!(!envelope.is_empty());

        envelope.reset();
        assert!(envelope.is_empty());
        assert!(envelope.mail_from().is_none());
        assert!(envelope.rcpt_to().is_empty());
    }

    #[test]
    fn recipients_preserve_insertion_order() {
        let mut envelope = Envelope::default();
        envelope.add_recipient(Address::new("first@example.com", MailParameters::None));
        envelope.add_recipient(Address::new("second@example.com", MailParameters::None));
        let mailboxes: Vec<_> = envelope
            .rcpt_to()
            .iter()
            .map(|a| a.mailbox.as_str())
            .collect();
        assert_eq!(mailboxes, vec!["first@example.com", "second@example.com"]);
    }
}
