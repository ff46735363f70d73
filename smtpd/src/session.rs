//! The per-connection conversation driver: wires the line framer, command
//! parser, and state machine together, and drives each suspension point
//! (auth, mailFrom, rcptTo, data) as an explicit awaited step inside a
//! `tokio::select!` raced against the listener's shutdown broadcast.
//! Protocol state transitions are kept separate from the business-logic
//! callback trait ([`Handlers`]) that decides policy outcomes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use smtpd_common::address::Address;
use smtpd_common::envelope::Envelope;
use smtpd_common::error::{ProtocolError, SessionError};
use smtpd_common::status::Status;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::auth::{self, AuthMechanism, AuthOutcome, AuthRequest};
use crate::command::Command;
use crate::connection::{Connection, TlsContext};
use crate::error::{AuthError, PolicyError, SinkError};
use crate::extensions::{advertised, CapabilityInputs};
use crate::framer::{Frame, LineFramer};
use crate::sink::{DataSource, DataStream};
use crate::state::{auth_allowed, AuthSubState, ConnectionState};

const READ_CHUNK: usize = 4096;

/// A broadcast message telling all live sessions the listener is shutting
/// down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "CONNECT", "TRACE", "PATCH",
];

/// Read-only session facts exposed to consumer callbacks, minus the
/// mutable envelope/counters the engine itself owns.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub peer: SocketAddr,
    pub hostname: Option<String>,
    pub secure: bool,
    pub user: Option<String>,
    pub esmtp: bool,
}

/// The consumer callback surface, grouped into one trait. Only
/// [`Handlers::on_data`] has no sensible default: a server that cannot
/// consume a message has no purpose.
#[async_trait]
pub trait Handlers: Send + Sync {
    async fn on_connect(&self, session: &SessionInfo) -> Result<(), PolicyError> {
        let _ = session;
        Ok(())
    }

    async fn on_auth(&self, request: AuthRequest, session: &SessionInfo) -> AuthOutcome {
        let _ = (request, session);
        AuthOutcome::Rejected { message: None }
    }

    async fn on_mail_from(&self, address: &Address, session: &SessionInfo) -> Result<(), PolicyError> {
        let _ = (address, session);
        Ok(())
    }

    async fn on_rcpt_to(&self, address: &Address, session: &SessionInfo) -> Result<(), PolicyError> {
        let _ = (address, session);
        Ok(())
    }

    async fn on_data(&self, stream: DataStream, session: &SessionInfo) -> Result<(), SinkError>;

    async fn on_close(&self, session: &SessionInfo) {
        let _ = session;
    }
}

/// Tunables that bear directly on one session's behavior (the
/// `maxClients`/`closeTimeout` knobs live in `smtpd-server`, which owns
/// many sessions at once).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub banner: String,
    pub tls_context: Option<TlsContext>,
    pub auth_methods: Vec<AuthMechanism>,
    pub allow_insecure_auth: bool,
    pub size_limit: Option<usize>,
    pub disabled_commands: Vec<String>,
    pub hide_starttls: bool,
    pub max_recipients: usize,
    pub unauthenticated_command_cap: usize,
    pub unrecognized_command_cap: usize,
    pub sink_channel_capacity: usize,
    pub early_talker_window: Duration,
    pub socket_timeout: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            banner: "localhost".to_string(),
            tls_context: None,
            auth_methods: Vec::new(),
            allow_insecure_auth: false,
            size_limit: None,
            disabled_commands: Vec::new(),
            hide_starttls: false,
            max_recipients: 100,
            unauthenticated_command_cap: 10,
            unrecognized_command_cap: 10,
            sink_channel_capacity: 4,
            early_talker_window: Duration::from_millis(200),
            socket_timeout: Duration::from_secs(60),
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.config.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_tls_context(mut self, tls_context: Option<TlsContext>) -> Self {
        self.config.tls_context = tls_context;
        self
    }

    #[must_use]
    pub fn with_auth_methods(mut self, methods: Vec<AuthMechanism>) -> Self {
        self.config.auth_methods = methods;
        self
    }

    #[must_use]
    pub fn with_allow_insecure_auth(mut self, allow: bool) -> Self {
        self.config.allow_insecure_auth = allow;
        self
    }

    #[must_use]
    pub fn with_size_limit(mut self, size: Option<usize>) -> Self {
        self.config.size_limit = size;
        self
    }

    #[must_use]
    pub fn with_disabled_commands(mut self, commands: Vec<String>) -> Self {
        self.config.disabled_commands = commands;
        self
    }

    #[must_use]
    pub fn with_hide_starttls(mut self, hide: bool) -> Self {
        self.config.hide_starttls = hide;
        self
    }

    #[must_use]
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max_recipients: usize) -> Self {
        self.config.max_recipients = max_recipients;
        self
    }

    #[must_use]
    pub const fn with_unauthenticated_command_cap(mut self, cap: usize) -> Self {
        self.config.unauthenticated_command_cap = cap;
        self
    }

    #[must_use]
    pub const fn with_unrecognized_command_cap(mut self, cap: usize) -> Self {
        self.config.unrecognized_command_cap = cap;
        self
    }

    #[must_use]
    pub const fn with_sink_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.sink_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_early_talker_window(mut self, window: Duration) -> Self {
        self.config.early_talker_window = window;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

impl SessionConfig {
    fn disables(&self, verb: &str) -> bool {
        self.disabled_commands.iter().any(|c| c.eq_ignore_ascii_case(verb))
    }
}

/// Whether the session was opened with EHLO (speaking ESMTP) or HELO
/// (plain SMTP, no extensions advertised). Default before any greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transmission {
    Smtp,
    Esmtp,
}

/// What the caller (the listener's accept loop) should do once [`Session::run`]
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ClosedByClient,
    Shutdown,
    Timeout,
    EarlyTalker,
    ProtocolViolation,
    Eof,
}

/// The per-connection state machine, wired to one transport `Stream` and one
/// [`Handlers`] implementation.
pub struct Session<Stream, H>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    H: Handlers + 'static,
{
    connection: Option<Connection<Stream>>,
    framer: LineFramer,
    state: ConnectionState,
    envelope: Envelope,
    info: SessionInfo,
    config: Arc<SessionConfig>,
    handlers: Arc<H>,
    transmission: Transmission,
    unauthenticated_count: usize,
    unrecognized_count: usize,
    pending_login_username: Option<String>,
    data_source: Option<DataSource>,
    data_task: Option<tokio::task::JoinHandle<Result<(), SinkError>>>,
    data_bytes_received: usize,
    data_size_exceeded: bool,
    first_command_seen: bool,
}

impl<Stream, H> Session<Stream, H>
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    H: Handlers + 'static,
{
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        peer: SocketAddr,
        stream: Stream,
        config: Arc<SessionConfig>,
        handlers: Arc<H>,
    ) -> Self {
        Self::with_connection(id, peer, Connection::plain(stream), false, config, handlers)
    }

    /// Builds a session atop an already-constructed [`Connection`], secure
    /// or not. Used for implicit-TLS listeners, which complete the TLS
    /// handshake before allocating a session at all, so the transport is
    /// already a `TlsStream` by the time the session is created.
    #[must_use]
    pub fn with_connection(
        id: impl Into<String>,
        peer: SocketAddr,
        connection: Connection<Stream>,
        secure: bool,
        config: Arc<SessionConfig>,
        handlers: Arc<H>,
    ) -> Self {
        Self {
            connection: Some(connection),
            framer: LineFramer::new(),
            state: ConnectionState::GreetingSent,
            envelope: Envelope::default(),
            info: SessionInfo {
                id: id.into(),
                peer,
                hostname: None,
                secure,
                user: None,
                esmtp: false,
            },
            config,
            handlers,
            transmission: Transmission::Smtp,
            unauthenticated_count: 0,
            unrecognized_count: 0,
            pending_login_username: None,
            data_source: None,
            data_task: None,
            data_bytes_received: 0,
            data_size_exceeded: false,
            first_command_seen: false,
        }
    }

    fn conn(&mut self) -> &mut Connection<Stream> {
        self.connection.as_mut().expect("connection always present between transport operations")
    }

    async fn reply(&mut self, line: impl AsRef<str>) -> Result<(), SessionError> {
        smtpd_common::logging::outgoing(&self.info.id, line.as_ref());
        self.conn()
            .send(line.as_ref())
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    async fn reply_multiline(&mut self, code: u16, lines: &[String]) -> Result<(), SessionError> {
        let Some((last, rest)) = lines.split_last() else {
            return Ok(());
        };
        for line in rest {
            self.reply(format!("{code}-{line}")).await?;
        }
        self.reply(format!("{code} {last}")).await
    }

    /// Watches the socket for a short window before the banner is written;
    /// any inbound byte means the client didn't wait for `220`.
    async fn is_early_talker(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(
            tokio::time::timeout(self.config.early_talker_window.clone(), self.conn().receive(&mut probe)).await,
            Ok(Ok(n)) if n > 0
        )
    }

    /// Runs the full conversation: early-talker probe, banner, command
    /// loop, until the client quits, a terminal error occurs, or `shutdown`
    /// fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Outcome {
        if self.is_early_talker().await {
            let _ = self.reply(format!("{} Go ahead", Status::TransactionFailed)).await;
            return Outcome::EarlyTalker;
        }

        if let Err(policy) = self.handlers.on_connect(&self.info.clone()).await {
            let _ = self.reply(format!("{} {}", policy.code, policy.message)).await;
            return Outcome::ProtocolViolation;
        }

        if self.reply(format!("{} {}", Status::ServiceReady, self.config.banner)).await.is_err() {
            return Outcome::Eof;
        }

        let outcome = loop {
            let mut frames = Vec::new();
            tokio::select! {
                biased;
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown)) {
                        let _ = self.reply(format!("{} Server shutting down", Status::Unavailable)).await;
                        break Outcome::Shutdown;
                    }
                }
                received = tokio::time::timeout(self.config.socket_timeout.clone(), self.read_frames(&mut frames)) => {
                    match received {
                        Err(_elapsed) => {
                            let _ = self.reply(format!("{} Timeout", Status::Unavailable)).await;
                            break Outcome::Timeout;
                        }
                        Ok(Err(_io)) => break Outcome::Eof,
                        Ok(Ok(true)) => break Outcome::Eof,
                        Ok(Ok(false)) => {}
                    }
                }
            }

            match self.process_frames(frames).await {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {}
                Err(_terminal) => break Outcome::ProtocolViolation,
            }
        };

        self.handlers.on_close(&self.info.clone()).await;
        outcome
    }

    /// Reads one chunk and feeds it to the framer. Returns `Ok(true)` on
    /// EOF.
    async fn read_frames(&mut self, out: &mut Vec<Frame>) -> std::io::Result<bool> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self
            .conn()
            .receive(&mut buf)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        if n == 0 {
            return Ok(true);
        }
        self.framer
            .feed(&buf[..n], out)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(false)
    }

    async fn process_frames(&mut self, frames: Vec<Frame>) -> Result<Option<Outcome>, SessionError> {
        for frame in frames {
            match frame {
                Frame::LineTooLong => {
                    self.reply(format!("{} {}", Status::SyntaxError, ProtocolError::LineTooLong)).await?;
                }
                Frame::Line(line) => {
                    if let Some(outcome) = self.handle_line(line).await? {
                        return Ok(Some(outcome));
                    }
                }
                Frame::Payload(bytes) => {
                    self.data_bytes_received += bytes.len();
                    if let Some(limit) = self.config.size_limit {
                        if self.data_bytes_received > limit && !self.data_size_exceeded {
                            // Stop feeding the consumer once the declared
                            // limit is blown; the sender side of the
                            // channel is dropped, so the consumer observes
                            // a clean (if premature) end-of-stream rather
                            // than a stalled read.
                            self.data_size_exceeded = true;
                            self.data_source = None;
                        }
                    }
                    if let Some(source) = self.data_source.as_mut() {
                        source.feed(bytes).await;
                    }
                }
                Frame::DataComplete => {
                    if let Some(mut source) = self.data_source.take() {
                        source.finish();
                    }
                    self.finish_data().await?;
                }
            }
        }
        Ok(None)
    }

    async fn handle_line(&mut self, line: String) -> Result<Option<Outcome>, SessionError> {
        if !self.state.is_authenticating() {
            smtpd_common::logging::incoming(&self.info.id, &line);
        }

        if !self.first_command_seen {
            self.first_command_seen = true;
            let verb = Command::verb(&line).to_ascii_uppercase();
            if HTTP_METHODS.contains(&verb.as_str()) {
                self.reply(format!("{} Command not recognized", Status::TransactionFailed)).await?;
                return Ok(Some(Outcome::ProtocolViolation));
            }
        }

        if self.state.is_authenticating() {
            return self.handle_auth_continuation(line).await;
        }

        let verb = Command::verb(&line).to_ascii_uppercase();
        if self.config.disables(&verb) {
            return self.handle_unrecognized(&line).await.and_then(|outcome| self.bump_unauthenticated(outcome));
        }

        let command = Command::parse(&line);
        match command {
            Command::Ehlo(host) => self.handle_greeting(host, Transmission::Esmtp).await,
            Command::Helo(host) => self.handle_greeting(host, Transmission::Smtp).await,
            Command::MailFrom(address) => self.handle_mail_from(address).await,
            Command::RcptTo(address) => self.handle_rcpt_to(address).await,
            Command::Data => self.handle_data().await,
            Command::Rset => {
                self.envelope.reset();
                self.reply(format!("{} OK", Status::Ok)).await?;
                Ok(None)
            }
            Command::Noop => {
                self.reply(format!("{} OK", Status::Ok)).await?;
                Ok(None)
            }
            Command::Quit => {
                self.reply(format!("{} Bye", Status::Closing)).await?;
                self.state = ConnectionState::Closing;
                Ok(Some(Outcome::ClosedByClient))
            }
            Command::Vrfy => {
                self.reply(format!("{} Cannot VRFY", Status::CannotVerify)).await?;
                Ok(None)
            }
            Command::Help => {
                self.reply(format!("{} See RFC 5321", Status::HelpMessage)).await?;
                Ok(None)
            }
            Command::StartTls => self.handle_starttls().await,
            Command::Auth(rest) => self.handle_auth_start(rest).await,
            Command::Unknown(_) => {
                if verb == "MAIL" || verb == "RCPT" {
                    self.reply(format!("{} {}", Status::ParameterSyntaxError, ProtocolError::SyntaxError)).await?;
                    Ok(None)
                } else {
                    self.handle_unrecognized(&line).await
                }
            }
        }
        .and_then(|outcome| self.bump_unauthenticated(outcome))
    }

    /// Increments the unauthenticated-command counter for any accepted
    /// command while `user` is unset, enforcing the cap.
    fn bump_unauthenticated(&mut self, outcome: Option<Outcome>) -> Result<Option<Outcome>, SessionError> {
        if outcome.is_some() || self.info.user.is_some() {
            return Ok(outcome);
        }
        self.unauthenticated_count += 1;
        if self.unauthenticated_count > self.config.unauthenticated_command_cap {
            return Ok(Some(Outcome::ProtocolViolation));
        }
        Ok(outcome)
    }

    async fn handle_unrecognized(&mut self, line: &str) -> Result<Option<Outcome>, SessionError> {
        let verb = Command::verb(line).to_string();
        self.reply(format!("{} {}", Status::SyntaxError, ProtocolError::UnknownCommand(verb))).await?;
        self.unrecognized_count += 1;
        if self.unrecognized_count > self.config.unrecognized_command_cap {
            self.reply(format!("{} Too many unrecognized commands", Status::Unavailable)).await?;
            return Ok(Some(Outcome::ProtocolViolation));
        }
        Ok(None)
    }

    async fn handle_greeting(&mut self, host: String, transmission: Transmission) -> Result<Option<Outcome>, SessionError> {
        self.info.hostname = Some(host.clone());
        self.info.esmtp = matches!(transmission, Transmission::Esmtp);
        self.transmission = transmission;
        self.envelope.reset();
        self.state = ConnectionState::Ready;

        match transmission {
            Transmission::Smtp => {
                self.reply(format!("{} {} says hello to {host}", Status::Ok, self.config.banner)).await?;
            }
            Transmission::Esmtp => {
                let disabled: Vec<&str> = self.config.disabled_commands.iter().map(String::as_str).collect();
                let caps = advertised(CapabilityInputs {
                    secure: self.info.secure,
                    size_limit: self.config.size_limit,
                    auth_enabled: !self.config.auth_methods.is_empty(),
                    auth_methods: &self.config.auth_methods,
                    allow_insecure_auth: self.config.allow_insecure_auth,
                    disabled_commands: &disabled,
                    tls_available: self.config.tls_context.is_some(),
                    hide_starttls: self.config.hide_starttls,
                    starttls_disabled: self.config.disables("STARTTLS"),
                    extra: &[],
                });
                let mut lines = vec![format!("{} Hello {host}", self.config.banner)];
                lines.extend(caps.iter().map(ToString::to_string));
                self.reply_multiline(Status::Ok.code(), &lines).await?;
            }
        }
        Ok(None)
    }

    async fn handle_mail_from(&mut self, address: Address) -> Result<Option<Outcome>, SessionError> {
        if !self.state.can_mail_from() {
            self.reply(format!("{} {}", Status::BadSequence, ProtocolError::BadSequence)).await?;
            return Ok(None);
        }
        if let Some(limit) = self.config.size_limit {
            let declared = address.params.get("SIZE").and_then(|v| v.parse::<usize>().ok());
            if declared.is_some_and(|size| size > limit) {
                self.reply(format!("{} Message size exceeds fixed maximum message size", Status::ExceededStorage)).await?;
                return Ok(None);
            }
        }
        match self.handlers.on_mail_from(&address, &self.info.clone()).await {
            Ok(()) => {
                self.envelope.set_mail_from(address);
                self.state = ConnectionState::MailAccepted;
                self.reply(format!("{} OK", Status::Ok)).await?;
            }
            Err(policy) => {
                self.reply(format!("{} {}", policy.code, policy.message)).await?;
            }
        }
        Ok(None)
    }

    async fn handle_rcpt_to(&mut self, address: Address) -> Result<Option<Outcome>, SessionError> {
        if !self.state.can_rcpt_to() {
            self.reply(format!("{} {}", Status::BadSequence, ProtocolError::BadSequence)).await?;
            return Ok(None);
        }
        if self.envelope.rcpt_to().len() >= self.config.max_recipients {
            self.reply(format!("{} Too many recipients", Status::InsufficientStorage)).await?;
            return Ok(None);
        }
        match self.handlers.on_rcpt_to(&address, &self.info.clone()).await {
            Ok(()) => {
                self.envelope.add_recipient(address);
                self.reply(format!("{} OK", Status::Ok)).await?;
            }
            Err(policy) => {
                self.reply(format!("{} {}", policy.code, policy.message)).await?;
            }
        }
        Ok(None)
    }

    async fn handle_data(&mut self) -> Result<Option<Outcome>, SessionError> {
        if !self.state.can_data() || self.envelope.rcpt_to().is_empty() {
            self.reply(format!("{} {}", Status::BadSequence, ProtocolError::BadSequence)).await?;
            return Ok(None);
        }

        self.reply(format!("{} End data with <CR><LF>.<CR><LF>", Status::StartMailInput)).await?;
        self.framer.enter_data_mode();
        self.state = ConnectionState::DataReceiving;

        self.data_bytes_received = 0;
        self.data_size_exceeded = false;

        let (source, stream) = DataSource::channel(self.config.sink_channel_capacity);
        self.data_source = Some(source);
        let handlers = Arc::clone(&self.handlers);
        let info = self.info.clone();
        self.data_task = Some(tokio::spawn(async move { handlers.on_data(stream, &info).await }));
        Ok(None)
    }

    async fn finish_data(&mut self) -> Result<(), SessionError> {
        let Some(task) = self.data_task.take() else {
            return Ok(());
        };
        self.state = ConnectionState::Ready;
        self.envelope.reset();
        let exceeded = self.data_size_exceeded;
        match task.await {
            Ok(Ok(())) if exceeded => {
                self.reply(format!("{} Message size exceeds fixed maximum message size", Status::ExceededStorage)).await
            }
            Ok(Ok(())) => self.reply(format!("{} OK: message queued", Status::Ok)).await,
            Ok(Err(err)) => self.reply(format!("{} {}", err.response_code, err.message)).await,
            Err(_join_error) => {
                self.reply(format!("{} Internal error processing message", Status::Unavailable)).await?;
                Err(SessionError::Io(std::io::Error::other("data sink task panicked")))
            }
        }
    }

    async fn handle_starttls(&mut self) -> Result<Option<Outcome>, SessionError> {
        if self.info.secure || !self.state.can_starttls() || self.config.disables("STARTTLS") {
            self.reply(format!("{} {}", Status::BadSequence, ProtocolError::BadSequence)).await?;
            return Ok(None);
        }
        let Some(tls_context) = self.config.tls_context.clone() else {
            self.reply(format!("{} STARTTLS not available", Status::CommandNotImplemented)).await?;
            return Ok(None);
        };

        self.reply(format!("{} Ready to start TLS", Status::ServiceReady)).await?;
        let connection = self.connection.take().expect("connection present");
        match connection.upgrade(&tls_context).await {
            Ok((upgraded, _info)) => {
                self.connection = Some(upgraded);
                self.info.secure = true;
                self.info.hostname = None;
                self.envelope.reset();
                self.state = ConnectionState::GreetingSent;
                self.framer = LineFramer::new();
                Ok(None)
            }
            Err(_err) => Ok(Some(Outcome::ProtocolViolation)),
        }
    }

    async fn handle_auth_start(&mut self, rest: String) -> Result<Option<Outcome>, SessionError> {
        if !auth_allowed(self.state, self.info.secure, self.config.allow_insecure_auth) {
            self.reply(format!("{} {}", Status::BadSequence, ProtocolError::BadSequence)).await?;
            return Ok(None);
        }

        let mut parts = rest.splitn(2, char::is_whitespace);
        let mechanism_name = parts.next().unwrap_or("");
        let initial_response = parts.next().map(str::trim).filter(|s| !s.is_empty());

        let Some(mechanism) = AuthMechanism::parse(mechanism_name) else {
            self.reply(format!("{} Unrecognized authentication type", Status::ParameterNotImplemented)).await?;
            return Ok(None);
        };
        if !self.config.auth_methods.contains(&mechanism) {
            self.reply(format!("{} Unrecognized authentication type", Status::ParameterNotImplemented)).await?;
            return Ok(None);
        }

        match mechanism {
            AuthMechanism::Plain => match initial_response {
                Some(payload) => self.complete_plain_auth(payload).await,
                None => {
                    self.state = ConnectionState::Authenticating(AuthSubState::Plain);
                    self.reply(format!("{} ", Status::AuthContinue)).await?;
                    Ok(None)
                }
            },
            AuthMechanism::Login => {
                self.state = ConnectionState::Authenticating(AuthSubState::LoginUser);
                self.reply(format!("{} {}", Status::AuthContinue, auth::login_username_prompt())).await?;
                Ok(None)
            }
            AuthMechanism::XOAuth2 => match initial_response {
                Some(payload) => self.complete_xoauth2_auth(payload).await,
                None => {
                    self.reply(format!("{} Malformed SASL response", Status::ParameterSyntaxError)).await?;
                    Ok(None)
                }
            },
        }
    }

    async fn handle_auth_continuation(&mut self, line: String) -> Result<Option<Outcome>, SessionError> {
        if line.trim() == "*" {
            self.reset_auth_state();
            self.reply(format!("{} Authentication cancelled", Status::ParameterSyntaxError)).await?;
            return Ok(None);
        }

        match self.state {
            ConnectionState::Authenticating(AuthSubState::Plain) => self.complete_plain_auth(&line).await,
            ConnectionState::Authenticating(AuthSubState::LoginUser) => {
                match auth::decode_login_field(&line) {
                    Ok(username) => {
                        self.pending_login_username = Some(username);
                        self.state = ConnectionState::Authenticating(AuthSubState::LoginPass);
                        self.reply(format!("{} {}", Status::AuthContinue, auth::login_password_prompt())).await?;
                    }
                    Err(_) => {
                        self.reset_auth_state();
                        self.reply(format!("{} Authentication failed", Status::ParameterSyntaxError)).await?;
                    }
                }
                Ok(None)
            }
            ConnectionState::Authenticating(AuthSubState::LoginPass) => {
                let username = self.pending_login_username.take().unwrap_or_default();
                match auth::decode_login_field(&line) {
                    Ok(password) => {
                        self.resolve_auth(AuthRequest {
                            method: AuthMechanism::Login,
                            username,
                            password: Some(password),
                            access_token: None,
                        })
                        .await
                    }
                    Err(_) => {
                        self.reset_auth_state();
                        self.reply(format!("{} Authentication failed", Status::ParameterSyntaxError)).await?;
                        Ok(None)
                    }
                }
            }
            ConnectionState::Authenticating(AuthSubState::XOAuth2) => {
                // The client's only valid continuation here is a blank
                // line acknowledging the structured-error challenge.
                self.reset_auth_state();
                self.reply(format!("{} Authentication failed", Status::AuthenticationFailed)).await?;
                Ok(None)
            }
            _ => unreachable!("handle_auth_continuation called outside an authenticating state"),
        }
    }

    async fn complete_plain_auth(&mut self, payload: &str) -> Result<Option<Outcome>, SessionError> {
        match auth::decode_plain(payload) {
            Ok((username, password)) => {
                self.resolve_auth(AuthRequest {
                    method: AuthMechanism::Plain,
                    username,
                    password: Some(password),
                    access_token: None,
                })
                .await
            }
            Err(_) => {
                self.reset_auth_state();
                self.reply(format!("{} Authentication failed", Status::ParameterSyntaxError)).await?;
                Ok(None)
            }
        }
    }

    async fn complete_xoauth2_auth(&mut self, payload: &str) -> Result<Option<Outcome>, SessionError> {
        match auth::decode_xoauth2(payload) {
            Ok((username, access_token)) => {
                self.resolve_auth(AuthRequest {
                    method: AuthMechanism::XOAuth2,
                    username,
                    password: None,
                    access_token: Some(access_token),
                })
                .await
            }
            Err(AuthError::MalformedResponse | AuthError::Base64) => {
                self.reset_auth_state();
                self.reply(format!("{} Malformed SASL response", Status::ParameterSyntaxError)).await?;
                Ok(None)
            }
            Err(_) => {
                self.reset_auth_state();
                self.reply(format!("{} Authentication failed", Status::AuthenticationFailed)).await?;
                Ok(None)
            }
        }
    }

    async fn resolve_auth(&mut self, request: AuthRequest) -> Result<Option<Outcome>, SessionError> {
        let outcome = self.handlers.on_auth(request, &self.info.clone()).await;
        match outcome {
            AuthOutcome::Success { user } => {
                smtpd_common::logging::internal(&self.info.id, &format!("authenticated as {user}"));
                self.info.user = Some(user);
                self.reset_auth_state();
                self.reply(format!("{} Authentication successful", Status::AuthSuccessful)).await?;
            }
            AuthOutcome::Rejected { message } => {
                smtpd_common::logging::internal(&self.info.id, "authentication rejected");
                self.reset_auth_state();
                match message {
                    Some(msg) => self.reply(format!("{} {msg}", Status::AuthenticationFailed)).await?,
                    None => self.reply(format!("{} Authentication failed", Status::AuthenticationFailed)).await?,
                }
            }
            AuthOutcome::XOAuth2Challenge(challenge) => {
                self.state = ConnectionState::Authenticating(AuthSubState::XOAuth2);
                self.reply(format!("{} {}", Status::AuthContinue, auth::encode_xoauth2_challenge(&challenge))).await?;
            }
        }
        Ok(None)
    }

    fn reset_auth_state(&mut self) {
        self.state = ConnectionState::Ready;
        self.pending_login_username = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct AcceptAll;

    #[async_trait]
    impl Handlers for AcceptAll {
        async fn on_auth(&self, request: AuthRequest, _session: &SessionInfo) -> AuthOutcome {
            if request.username == "testuser" && request.password.as_deref() == Some("testpass") {
                AuthOutcome::Success { user: request.username }
            } else {
                AuthOutcome::Rejected { message: None }
            }
        }

        async fn on_data(&self, mut stream: DataStream, _session: &SessionInfo) -> Result<(), SinkError> {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.map_err(|e| SinkError::new(450, e.to_string()))?;
            Ok(())
        }
    }

    fn config() -> Arc<SessionConfig> {
        Arc::new(
            SessionConfig::builder()
                .with_banner("testhost")
                .with_auth_methods(vec![AuthMechanism::Plain])
                .with_allow_insecure_auth(true)
                .build(),
        )
    }

    async fn read_line(client: &mut tokio::io::DuplexStream) -> String {
        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn plain_ehlo_quit_round_trip() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (_tx, rx) = broadcast::channel(1);
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config(), Arc::new(AcceptAll));

        let handle = tokio::spawn(session.run(rx));

        let banner = read_line(&mut client).await;
        assert!(banner.starts_with("220 "));

        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let ehlo = read_line(&mut client).await;
        assert!(ehlo.contains("250-") || ehlo.contains("250 "));

        client.write_all(b"QUIT\r\n").await.unwrap();
        let bye = read_line(&mut client).await;
        assert!(bye.starts_with("221"));

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, Outcome::ClosedByClient);
    }

    #[tokio::test]
    async fn auth_plain_success_then_mail_from() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (_tx, rx) = broadcast::channel(1);
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config(), Arc::new(AcceptAll));
        let handle = tokio::spawn(session.run(rx));

        let _ = read_line(&mut client).await; // banner
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let _ = read_line(&mut client).await;

        let creds = BASE64.encode("\0testuser\0testpass");
        client.write_all(format!("AUTH PLAIN {creds}\r\n").as_bytes()).await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("235"));

        client.write_all(b"MAIL FROM:<a@example.com>\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("250"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rcpt_before_mail_is_bad_sequence() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (_tx, rx) = broadcast::channel(1);
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config(), Arc::new(AcceptAll));
        let handle = tokio::spawn(session.run(rx));

        let _ = read_line(&mut client).await;
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let _ = read_line(&mut client).await;

        client.write_all(b"RCPT TO:<a@example.com>\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("503"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn data_round_trip_queues_message() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (_tx, rx) = broadcast::channel(1);
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config(), Arc::new(AcceptAll));
        let handle = tokio::spawn(session.run(rx));

        let _ = read_line(&mut client).await;
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        client.write_all(b"MAIL FROM:<a@example.com>\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        client.write_all(b"RCPT TO:<b@example.com>\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        client.write_all(b"DATA\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("354"));

        client.write_all(b"Subject: hi\r\n\r\nbody\r\n.\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("250"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_terminates_with_421() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (tx, rx) = broadcast::channel(1);
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config(), Arc::new(AcceptAll));
        let handle = tokio::spawn(session.run(rx));

        let _ = read_line(&mut client).await;
        tx.send(Signal::Shutdown).unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("421"));
        assert_eq!(handle.await.unwrap(), Outcome::Shutdown);
    }

    #[tokio::test]
    async fn mail_from_declared_size_over_limit_is_rejected() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (_tx, rx) = broadcast::channel(1);
        let config = Arc::new(SessionConfig::builder().with_banner("testhost").with_size_limit(Some(1024)).build());
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config, Arc::new(AcceptAll));
        let handle = tokio::spawn(session.run(rx));

        let _ = read_line(&mut client).await;
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let _ = read_line(&mut client).await;

        client.write_all(b"MAIL FROM:<a@example.com> SIZE=4096\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("552"), "unexpected reply: {reply}");

        client.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn data_over_configured_size_limit_is_rejected() {
        let (mut client, server) = tokio::io::duplex(8192);
        let (_tx, rx) = broadcast::channel(1);
        let config = Arc::new(SessionConfig::builder().with_banner("testhost").with_size_limit(Some(16)).build());
        let session = Session::new("s1", "127.0.0.1:1".parse().unwrap(), server, config, Arc::new(AcceptAll));
        let handle = tokio::spawn(session.run(rx));

        let _ = read_line(&mut client).await;
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        client.write_all(b"MAIL FROM:<a@example.com>\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        client.write_all(b"RCPT TO:<b@example.com>\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        client.write_all(b"DATA\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("354"));

        client.write_all(b"this body is well over sixteen octets long\r\n.\r\n").await.unwrap();
        let reply = read_line(&mut client).await;
        assert!(reply.starts_with("552"), "unexpected reply: {reply}");

        client.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_line(&mut client).await;
        handle.await.unwrap();
    }
}
