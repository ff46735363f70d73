//! EHLO capability advertiser: computes the ordered, precondition-gated
//! list of extensions a session advertises in response to EHLO.

use core::fmt::{self, Display, Formatter};

use crate::auth::AuthMechanism;

/// A single advertised EHLO capability line (without the `250-`/`250 `
/// prefix, which the session/reply formatter adds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Pipelining,
    EightBitMime,
    SmtpUtf8,
    Size(usize),
    Auth(Vec<AuthMechanism>),
    StartTls,
    Other(String),
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipelining => f.write_str("PIPELINING"),
            Self::EightBitMime => f.write_str("8BITMIME"),
            Self::SmtpUtf8 => f.write_str("SMTPUTF8"),
            Self::Size(max) => write!(f, "SIZE {max}"),
            Self::Auth(methods) => {
                write!(f, "AUTH")?;
                for method in methods {
                    write!(f, " {method}")?;
                }
                Ok(())
            }
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Other(extra) => f.write_str(extra),
        }
    }
}

/// Inputs needed to compute the advertised capability set; a narrow view
/// over `ServerConfig`/`SessionState` so this module doesn't depend on the
/// session/listener types directly.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityInputs<'a> {
    pub secure: bool,
    pub size_limit: Option<usize>,
    pub auth_enabled: bool,
    pub auth_methods: &'a [AuthMechanism],
    pub allow_insecure_auth: bool,
    pub disabled_commands: &'a [&'a str],
    pub tls_available: bool,
    pub hide_starttls: bool,
    pub starttls_disabled: bool,
    pub extra: &'a [String],
}

/// Computes the ordered capability list, omitting any whose precondition
/// fails.
#[must_use]
pub fn advertised(inputs: CapabilityInputs<'_>) -> Vec<Capability> {
    let mut caps = vec![
        Capability::Pipelining,
        Capability::EightBitMime,
        Capability::SmtpUtf8,
    ];

    if let Some(size) = inputs.size_limit {
        caps.push(Capability::Size(size));
    }

    if inputs.auth_enabled
        && (inputs.secure || inputs.allow_insecure_auth)
        && !inputs.disabled_commands.contains(&"AUTH")
        && !inputs.auth_methods.is_empty()
    {
        caps.push(Capability::Auth(inputs.auth_methods.to_vec()));
    }

    if inputs.tls_available
        && !inputs.secure
        && !inputs.starttls_disabled
        && !inputs.hide_starttls
    {
        caps.push(Capability::StartTls);
    }

    for extra in inputs.extra {
        caps.push(Capability::Other(extra.clone()));
    }

    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CapabilityInputs<'static> {
        CapabilityInputs {
            secure: false,
            size_limit: None,
            auth_enabled: false,
            auth_methods: &[],
            allow_insecure_auth: false,
            disabled_commands: &[],
            tls_available: false,
            hide_starttls: false,
            starttls_disabled: false,
            extra: &[],
        }
    }

    #[test]
    fn always_advertises_pipelining_8bitmime_smtputf8() {
        let caps = advertised(base());
        assert_eq!(
            caps,
            vec![Capability::Pipelining, Capability::EightBitMime, Capability::SmtpUtf8]
        );
    }

    #[test]
    fn size_only_when_configured() {
        let mut inputs = base();
        inputs.size_limit = Some(10_000_000);
        assert!(advertised(inputs).contains(&Capability::Size(10_000_000)));
    }

    #[test]
    fn auth_requires_secure_or_allow_insecure() {
        let methods = [AuthMechanism::Plain];
        let mut inputs = base();
        inputs.auth_enabled = true;
        inputs.auth_methods = &methods;
        assert!(!advertised(inputs).iter().any(|c| matches!(c, Capability::Auth(_))));

        inputs.secure = true;
        assert!(advertised(inputs).iter().any(|c| matches!(c, Capability::Auth(_))));
    }

    #[test]
    fn auth_omitted_when_disabled_command() {
        let methods = [AuthMechanism::Plain];
        let disabled = ["AUTH"];
        let mut inputs = base();
        inputs.auth_enabled = true;
        inputs.secure = true;
        inputs.auth_methods = &methods;
        inputs.disabled_commands = &disabled;
        assert!(!advertised(inputs).iter().any(|c| matches!(c, Capability::Auth(_))));
    }

    #[test]
    fn starttls_needs_available_not_secure_not_disabled_not_hidden() {
        let mut inputs = base();
        inputs.tls_available = true;
        assert!(advertised(inputs).contains(&Capability::StartTls));

        inputs.secure = true;
        assert!(!advertised(inputs).contains(&Capability::StartTls));

        inputs.secure = false;
        inputs.hide_starttls = true;
        assert!(!advertised(inputs).contains(&Capability::StartTls));
    }

    #[test]
    fn operator_extras_appended_last() {
        let extra = ["X-CUSTOM".to_string()];
        let mut inputs = base();
        inputs.extra = &extra;
        let caps = advertised(inputs);
        assert_eq!(caps.last(), Some(&Capability::Other("X-CUSTOM".to_string())));
    }
}
