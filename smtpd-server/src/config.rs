//! Server-wide configuration: a serde-deserializable-plus-builder shape
//! that loads from TOML or is assembled programmatically, then narrows
//! to the per-session subset `smtpd::Session` needs.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use smtpd::auth::AuthMechanism;
use smtpd::connection::TlsContext;
use smtpd::session::SessionConfig;

use crate::error::ConfigError;

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

const fn default_port() -> u16 {
    25
}

const fn default_socket_timeout_ms() -> u64 {
    60_000
}

const fn default_close_timeout_ms() -> u64 {
    30_000
}

const fn default_max_recipients() -> usize {
    100
}

const fn default_unauthenticated_command_cap() -> usize {
    10
}

const fn default_unrecognized_command_cap() -> usize {
    10
}

/// Top-level server configuration, deserializable from a TOML file via
/// [`ServerConfig::from_file`] or assembled programmatically via
/// [`ServerConfig::builder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Implicit TLS on accept, performed before a session is allocated
    ///, as opposed to the in-conversation STARTTLS
    /// upgrade.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub tls_context: Option<TlsContext>,
    #[serde(default)]
    pub hide_starttls: bool,

    #[serde(default)]
    pub disabled_commands: Vec<String>,
    #[serde(default)]
    pub auth_methods: Vec<AuthMechanism>,
    #[serde(default)]
    pub allow_insecure_auth: bool,

    /// `0`/absent means unlimited.
    #[serde(default)]
    pub max_clients: usize,

    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    #[serde(default = "default_unauthenticated_command_cap")]
    pub unauthenticated_command_cap: usize,
    #[serde(default = "default_unrecognized_command_cap")]
    pub unrecognized_command_cap: usize,

    #[serde(default)]
    pub banner: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secure: false,
            tls_context: None,
            hide_starttls: false,
            disabled_commands: Vec::new(),
            auth_methods: Vec::new(),
            allow_insecure_auth: false,
            max_clients: 0,
            size: None,
            max_recipients: default_max_recipients(),
            socket_timeout_ms: default_socket_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            unauthenticated_command_cap: default_unauthenticated_command_cap(),
            unrecognized_command_cap: default_unrecognized_command_cap(),
            banner: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Loads and parses a TOML config file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(ConfigError::Parse)
    }

    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// `0`/unset means unlimited; the listener maps this to a semaphore
    /// sized at its maximum permit count.
    #[must_use]
    pub fn max_clients(&self) -> Option<usize> {
        (self.max_clients > 0).then_some(self.max_clients)
    }

    fn disables(&self, verb: &str) -> bool {
        self.disabled_commands.iter().any(|c| c.eq_ignore_ascii_case(verb))
    }

    /// Narrows this server-wide config to the per-session subset
    /// `smtpd::Session` needs.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let starttls_available = self.tls_context.is_some() && !self.secure && !self.disables("STARTTLS");
        SessionConfig::builder()
            .with_banner(self.banner.clone().unwrap_or_else(|| "localhost".to_string()))
            .with_tls_context(starttls_available.then(|| self.tls_context.clone().unwrap()))
            .with_auth_methods(self.auth_methods.clone())
            .with_allow_insecure_auth(self.allow_insecure_auth)
            .with_size_limit(self.size)
            .with_disabled_commands(self.disabled_commands.clone())
            .with_hide_starttls(self.hide_starttls)
            .with_socket_timeout(self.socket_timeout())
            .with_max_recipients(self.max_recipients)
            .with_unauthenticated_command_cap(self.unauthenticated_command_cap)
            .with_unrecognized_command_cap(self.unrecognized_command_cap)
            .build()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.config.secure = secure;
        self
    }

    #[must_use]
    pub fn with_tls_context(mut self, tls_context: Option<TlsContext>) -> Self {
        self.config.tls_context = tls_context;
        self
    }

    #[must_use]
    pub const fn with_hide_starttls(mut self, hide: bool) -> Self {
        self.config.hide_starttls = hide;
        self
    }

    #[must_use]
    pub fn with_disabled_commands(mut self, commands: Vec<String>) -> Self {
        self.config.disabled_commands = commands;
        self
    }

    #[must_use]
    pub fn with_auth_methods(mut self, methods: Vec<AuthMechanism>) -> Self {
        self.config.auth_methods = methods;
        self
    }

    #[must_use]
    pub const fn with_allow_insecure_auth(mut self, allow: bool) -> Self {
        self.config.allow_insecure_auth = allow;
        self
    }

    #[must_use]
    pub const fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.config.max_clients = max_clients;
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: Option<usize>) -> Self {
        self.config.size = size;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max_recipients: usize) -> Self {
        self.config.max_recipients = max_recipients;
        self
    }

    #[must_use]
    pub const fn with_socket_timeout_ms(mut self, ms: u64) -> Self {
        self.config.socket_timeout_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_close_timeout_ms(mut self, ms: u64) -> Self {
        self.config.close_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = Some(banner.into());
        self
    }

    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
