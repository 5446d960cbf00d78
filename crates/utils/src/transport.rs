//! SMTP client session.
//!
//! [`SmtpSession`] drives a single connection through the states of
//! [`SessionState`]: greeting, `EHLO`, the optional `STARTTLS` upgrade
//! (followed by a second `EHLO`), the optional login and finally any
//! number of sequential mail transactions. [`deliver`] wraps the whole
//! life cycle and guarantees that the session is closed once, whatever
//! the outcome of the sends.

use std::{
    fmt::{self, Display},
    io,
    sync::Arc,
};

use rustls::pki_types::ServerName;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, info, warn};

use crate::{
    encode_login_step, encode_plain, has_control_chars, load_tls_client_config, Capabilities,
    Mechanism, Message, Reply, TlsOptions, WireMessage,
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 2525;
pub const DEFAULT_HELLO_NAME: &str = "localhost";

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur during an SMTP session.
#[derive(Debug)]
pub enum TransportError {
    /// The TCP connection could not be established.
    Connect { address: String, source: io::Error },
    /// Reading from or writing to the connection failed.
    Io(io::Error),
    /// The server closed the connection unexpectedly.
    Disconnected,
    /// The session was already closed.
    Closed,
    /// The server sent something that is not a valid SMTP reply.
    Protocol(String),
    /// The TLS upgrade failed.
    Tls(String),
    /// The server rejected the greeting or a handshake command.
    Handshake { command: &'static str, reply: Reply },
    /// The server does not advertise a required extension.
    Unsupported(String),
    /// The name announced in `EHLO`/`HELO` can't be sent on a command line.
    InvalidHelloName(String),
    /// An envelope address can't be sent on a command line.
    InvalidAddress(String),
    /// The envelope has no recipient.
    NoRecipients,
    /// The server rejected the credentials.
    Auth(Reply),
    /// The envelope sender was rejected.
    SenderRefused { sender: String, reply: Reply },
    /// Every envelope recipient was rejected.
    RecipientsRefused(Vec<Refusal>),
    /// The message content was rejected.
    DataRefused(Reply),
}

impl TransportError {
    /// Classifies the error for top level reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Connect { .. }
            | TransportError::Io(_)
            | TransportError::Disconnected
            | TransportError::Closed => FailureKind::Connection,
            TransportError::Protocol(_)
            | TransportError::Tls(_)
            | TransportError::Handshake { .. }
            | TransportError::Unsupported(_)
            | TransportError::InvalidHelloName(_) => FailureKind::Handshake,
            TransportError::Auth(_) => FailureKind::Authentication,
            TransportError::InvalidAddress(_)
            | TransportError::NoRecipients
            | TransportError::SenderRefused { .. }
            | TransportError::RecipientsRefused(_)
            | TransportError::DataRefused(_) => FailureKind::Delivery,
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect { address, source } => {
                write!(f, "Failed to connect to {address}: {source}")
            }
            TransportError::Io(e) => write!(f, "Connection I/O error: {e}"),
            TransportError::Disconnected => write!(f, "Connection closed by server"),
            TransportError::Closed => write!(f, "Session already closed"),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            TransportError::Tls(msg) => write!(f, "TLS error: {msg}"),
            TransportError::Handshake { command, reply } => {
                write!(f, "Server rejected {command}: {reply}")
            }
            TransportError::Unsupported(extension) => {
                write!(f, "Extension not supported by server: {extension}")
            }
            TransportError::InvalidHelloName(name) => write!(f, "Invalid hello name: {name}"),
            TransportError::InvalidAddress(address) => {
                write!(f, "Invalid envelope address: {address}")
            }
            TransportError::NoRecipients => write!(f, "Envelope has no recipients"),
            TransportError::Auth(reply) => write!(f, "Authentication failed: {reply}"),
            TransportError::SenderRefused { sender, reply } => {
                write!(f, "Sender {sender} refused: {reply}")
            }
            TransportError::RecipientsRefused(refused) => {
                write!(f, "All recipients refused")?;
                for refusal in refused {
                    write!(f, "; {}: {}", refusal.recipient, refusal.reply)?;
                }
                Ok(())
            }
            TransportError::DataRefused(reply) => write!(f, "Message data refused: {reply}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Connect { source, .. } => Some(source),
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error)
    }
}

/// Coarse classes of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    Handshake,
    Authentication,
    Delivery,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Connection => "connection",
            FailureKind::Handshake => "handshake",
            FailureKind::Authentication => "authentication",
            FailureKind::Delivery => "delivery",
        };
        write!(f, "{name}")
    }
}

/// Whether the session upgrades the connection before authenticating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    None,
    StartTls,
}

/// Username and password used for the login exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to open the session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityMode,
    pub credentials: Option<Credentials>,
    /// Domain announced in `EHLO`/`HELO`.
    pub hello_name: String,
    pub tls: TlsOptions,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn starttls(mut self) -> Self {
        self.security = SecurityMode::StartTls;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            security: SecurityMode::None,
            credentials: None,
            hello_name: DEFAULT_HELLO_NAME.to_string(),
            tls: TlsOptions::default(),
        }
    }
}

/// Routing addresses handed to the server, independent of the `From`
/// and `To` headers of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
}

impl Envelope {
    pub fn new<I, S>(from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
        }
    }

    /// Envelope mirroring the `From`/`To` fields of the message.
    pub fn of(message: &Message) -> Self {
        Self::new(message.from(), message.to().iter().cloned())
    }
}

/// A serialized message together with its envelope.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub envelope: Envelope,
    pub wire: WireMessage,
}

impl Outgoing {
    pub fn new(envelope: Envelope, wire: WireMessage) -> Self {
        Self { envelope, wire }
    }
}

impl From<&Message> for Outgoing {
    fn from(message: &Message) -> Self {
        Self::new(Envelope::of(message), message.to_wire())
    }
}

/// A recipient rejected during `RCPT TO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub recipient: String,
    pub reply: Reply,
}

/// Outcome of an accepted send.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Final reply to the message data.
    pub reply: Reply,
    /// Recipients refused while others were accepted.
    pub refused: Vec<Refusal>,
}

/// Stage reached by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Greeted,
    Secured,
    Authenticated,
    Ready,
    Closed,
}

/// Plain or TLS socket, so that the rest of the session is agnostic.
enum SmtpStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl SmtpStream {
    async fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        match self {
            SmtpStream::Plain(reader) => reader.read_line(buf).await,
            SmtpStream::Tls(reader) => reader.read_line(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            SmtpStream::Plain(reader) => reader.get_mut().write_all(data).await,
            SmtpStream::Tls(reader) => reader.get_mut().write_all(data).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            SmtpStream::Plain(reader) => reader.get_mut().flush().await,
            SmtpStream::Tls(reader) => reader.get_mut().flush().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            SmtpStream::Plain(reader) => reader.get_mut().shutdown().await,
            SmtpStream::Tls(reader) => reader.get_mut().shutdown().await,
        }
    }
}

/// A client session against a single SMTP server.
pub struct SmtpSession {
    stream: Option<SmtpStream>,
    config: TransportConfig,
    state: SessionState,
    capabilities: Capabilities,
    handshakes: usize,
    sent: usize,
}

impl SmtpSession {
    /// Connects and walks the session up to [`SessionState::Ready`].
    ///
    /// The session is closed before returning if any step fails.
    pub async fn open(config: TransportConfig) -> TransportResult<Self> {
        let address = config.address();
        debug!(address = %address, "Connecting to SMTP server");
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|source| TransportError::Connect {
                address: address.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream: Some(SmtpStream::Plain(BufReader::new(stream))),
            config,
            state: SessionState::Connected,
            capabilities: Capabilities::default(),
            handshakes: 0,
            sent: 0,
        };

        match session.negotiate().await {
            Ok(()) => Ok(session),
            Err(error) => {
                warn!(address = %address, error = %error, "SMTP session setup failed");
                session.close().await;
                Err(error)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Number of `EHLO` handshakes issued so far.
    pub fn handshakes(&self) -> usize {
        self.handshakes
    }

    /// Number of messages accepted by the server in this session.
    pub fn messages_sent(&self) -> usize {
        self.sent
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.stream, Some(SmtpStream::Tls(_)))
    }

    async fn negotiate(&mut self) -> TransportResult<()> {
        let greeting = self.read_reply().await?;
        if greeting.code != 220 {
            return Err(TransportError::Handshake {
                command: "greeting",
                reply: greeting,
            });
        }
        info!(
            address = %self.config.address(),
            greeting = %greeting.message(),
            "Connected to SMTP server"
        );

        self.hello().await?;
        self.state = SessionState::Greeted;

        if self.config.security == SecurityMode::StartTls {
            self.starttls().await?;
            self.state = SessionState::Secured;
        }

        if let Some(credentials) = self.config.credentials.clone() {
            self.login(&credentials).await?;
            self.state = SessionState::Authenticated;
        }

        self.state = SessionState::Ready;
        Ok(())
    }

    /// Issues `EHLO`, falling back to `HELO` for servers without ESMTP.
    async fn hello(&mut self) -> TransportResult<()> {
        let name = self.config.hello_name.clone();
        if name.trim().is_empty() || has_control_chars(&name) {
            return Err(TransportError::InvalidHelloName(name.escape_debug().to_string()));
        }
        self.handshakes += 1;

        let reply = self.command(&format!("EHLO {name}")).await?;
        if reply.is_positive() {
            self.capabilities = Capabilities::from_reply(&reply);
            return Ok(());
        }

        debug!(reply = %reply, "EHLO rejected, falling back to HELO");
        let reply = self.command(&format!("HELO {name}")).await?;
        if !reply.is_positive() {
            return Err(TransportError::Handshake {
                command: "HELO",
                reply,
            });
        }
        self.capabilities = Capabilities::default();
        Ok(())
    }

    async fn starttls(&mut self) -> TransportResult<()> {
        if !self.capabilities.supports("STARTTLS") {
            return Err(TransportError::Unsupported("STARTTLS".to_string()));
        }

        // a bad configuration must fail while QUIT can still be sent
        let tls_config = load_tls_client_config(&self.config.tls)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let name = self
            .config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| self.config.host.clone());
        let server_name = ServerName::try_from(name)
            .map_err(|e| TransportError::Tls(format!("Invalid server name: {e}")))?;

        let reply = self.command("STARTTLS").await?;
        if reply.code != 220 {
            return Err(TransportError::Handshake {
                command: "STARTTLS",
                reply,
            });
        }

        let tcp = match self.stream.take() {
            Some(SmtpStream::Plain(reader)) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(TransportError::Protocol("TLS already active".to_string()));
            }
        };

        let tls_stream = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(format!("TLS handshake failed: {e}")))?;
        self.stream = Some(SmtpStream::Tls(Box::new(BufReader::new(tls_stream))));
        info!("STARTTLS upgrade complete");

        // capabilities must be negotiated again over the secure channel
        self.capabilities = Capabilities::default();
        self.hello().await
    }

    async fn login(&mut self, credentials: &Credentials) -> TransportResult<()> {
        let advertised = self.capabilities.auth_mechanisms();
        if advertised.is_empty() {
            return Err(TransportError::Unsupported("AUTH".to_string()));
        }
        let mechanism = Mechanism::select(&advertised).ok_or_else(|| {
            TransportError::Unsupported(format!("AUTH {}", advertised.join(" ")))
        })?;

        let reply = match mechanism {
            Mechanism::Plain => {
                let response = encode_plain(&credentials.username, &credentials.password);
                self.command_secret(&format!("AUTH PLAIN {response}"))
                    .await?
            }
            Mechanism::Login => {
                let reply = self.command("AUTH LOGIN").await?;
                if reply.code != 334 {
                    return Err(TransportError::Auth(reply));
                }
                let reply = self
                    .command_secret(&encode_login_step(&credentials.username))
                    .await?;
                if reply.code != 334 {
                    return Err(TransportError::Auth(reply));
                }
                self.command_secret(&encode_login_step(&credentials.password))
                    .await?
            }
        };

        if reply.code != 235 {
            return Err(TransportError::Auth(reply));
        }
        info!(
            username = %credentials.username,
            mechanism = %mechanism,
            "Authenticated"
        );
        Ok(())
    }

    /// Runs one mail transaction: `MAIL FROM`, one `RCPT TO` per envelope
    /// recipient and `DATA` with the message bytes.
    ///
    /// Recipients refused while at least one is accepted are reported in the
    /// [`Receipt`], the transaction is reset when the sender, every
    /// recipient or the data is refused. Envelopes without recipients or
    /// with addresses holding control characters are refused before any
    /// command is sent.
    pub async fn send(&mut self, wire: &WireMessage, envelope: &Envelope) -> TransportResult<Receipt> {
        if self.state != SessionState::Ready {
            return Err(TransportError::Closed);
        }
        if envelope.to.is_empty() {
            return Err(TransportError::NoRecipients);
        }
        let sender = command_address(&envelope.from)?;
        let recipients = envelope
            .to
            .iter()
            .map(|recipient| command_address(recipient))
            .collect::<TransportResult<Vec<_>>>()?;

        let reply = self.command(&format!("MAIL FROM:<{sender}>")).await?;
        if !reply.is_positive() {
            self.reset().await;
            return Err(TransportError::SenderRefused {
                sender: sender.to_string(),
                reply,
            });
        }

        let mut refused = Vec::new();
        for address in recipients {
            let reply = self.command(&format!("RCPT TO:<{address}>")).await?;
            if !reply.is_positive() {
                warn!(recipient = %address, reply = %reply, "Recipient refused");
                refused.push(Refusal {
                    recipient: address.to_string(),
                    reply,
                });
            }
        }
        if refused.len() == envelope.to.len() {
            self.reset().await;
            return Err(TransportError::RecipientsRefused(refused));
        }

        let reply = self.command("DATA").await?;
        if reply.code != 354 {
            self.reset().await;
            return Err(TransportError::DataRefused(reply));
        }

        debug!(size = wire.len(), "C: <message data>");
        let data = dot_stuff(wire.as_bytes());
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream.write_all(&data).await?;
        stream.write_all(b".\r\n").await?;
        stream.flush().await?;

        let reply = self.read_reply().await?;
        if !reply.is_positive() {
            self.reset().await;
            return Err(TransportError::DataRefused(reply));
        }

        self.sent += 1;
        info!(
            from = %sender,
            recipients = envelope.to.len() - refused.len(),
            size = wire.len(),
            reply = %reply,
            "Message accepted"
        );
        Ok(Receipt { reply, refused })
    }

    /// Sends the messages in order, stopping at the first failure.
    pub async fn send_all(&mut self, batch: &[Outgoing]) -> TransportResult<Vec<Receipt>> {
        let mut receipts = Vec::with_capacity(batch.len());
        for outgoing in batch {
            receipts.push(self.send(&outgoing.wire, &outgoing.envelope).await?);
        }
        Ok(receipts)
    }

    /// Ends the session with `QUIT` (when the connection is still usable)
    /// and drops the connection.
    ///
    /// Only the first call has any effect, it returns `true`, every
    /// following call returns `false`.
    pub async fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }

        if self.stream.is_some() {
            if let Err(error) = self.command("QUIT").await {
                debug!(error = %error, "QUIT failed, dropping connection");
            }
            if let Some(mut stream) = self.stream.take() {
                stream.shutdown().await.ok();
            }
        }

        self.state = SessionState::Closed;
        info!(messages = self.sent, "SMTP session closed");
        true
    }

    async fn reset(&mut self) {
        if let Err(error) = self.command("RSET").await {
            debug!(error = %error, "RSET failed");
        }
    }

    async fn command(&mut self, line: &str) -> TransportResult<Reply> {
        debug!("C: {line}");
        self.write_line(line).await?;
        self.read_reply().await
    }

    /// Same as [`command`](Self::command) but keeps the line out of the logs.
    async fn command_secret(&mut self, line: &str) -> TransportResult<Reply> {
        debug!("C: <redacted>");
        self.write_line(line).await?;
        self.read_reply().await
    }

    async fn write_line(&mut self, line: &str) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream.write_all(format!("{line}\r\n").as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> TransportResult<Reply> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut raw = String::new();
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await? == 0 {
                return Err(TransportError::Disconnected);
            }
            debug!("S: {}", line.trim_end());
            let is_last = Reply::is_last_line(&line);
            raw.push_str(&line);
            if is_last {
                break;
            }
        }
        Reply::parse(&raw)
            .ok_or_else(|| TransportError::Protocol(format!("Malformed reply: {}", raw.trim_end())))
    }
}

impl Drop for SmtpSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            warn!("SMTP session dropped without being closed");
        }
    }
}

/// Opens a session, sends the whole batch in order and closes the
/// session whether the sends succeeded or not.
///
/// Messages after the first failed one are not attempted, messages
/// already accepted stay delivered.
pub async fn deliver(config: &TransportConfig, batch: &[Outgoing]) -> TransportResult<Vec<Receipt>> {
    let mut session = SmtpSession::open(config.clone()).await?;
    let result = session.send_all(batch).await;
    session.close().await;
    result
}

/// Extracts the bare address from `Name <address>` forms.
///
/// # Examples
///
/// ```rust
/// assert_eq!(mailpost_utils::envelope_address("Jane <jane@example.com>"), "jane@example.com");
/// assert_eq!(mailpost_utils::envelope_address(" jane@example.com "), "jane@example.com");
/// ```
pub fn envelope_address(address: &str) -> &str {
    match (address.rfind('<'), address.rfind('>')) {
        (Some(start), Some(end)) if start < end => address[start + 1..end].trim(),
        _ => address.trim(),
    }
}

/// Bare address to place in `MAIL FROM`/`RCPT TO`, refused when it would
/// break out of the command line.
fn command_address(address: &str) -> TransportResult<&str> {
    if has_control_chars(address) {
        return Err(TransportError::InvalidAddress(address.escape_debug().to_string()));
    }
    Ok(envelope_address(address))
}

/// Applies SMTP dot-stuffing (RFC 5321 §4.5.2) and normalizes every line
/// ending to CRLF.
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(data.len() + 64);
    let mut lines = data.split(|byte| *byte == b'\n').peekable();
    while let Some(line) = lines.next() {
        if line.is_empty() && lines.peek().is_none() {
            break;
        }
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            stuffed.push(b'.');
        }
        stuffed.extend_from_slice(line);
        stuffed.extend_from_slice(b"\r\n");
    }
    stuffed
}
