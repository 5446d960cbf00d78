//! In-memory SMTP capture server.
//!
//! Accepts connections, speaks enough ESMTP for a client to deliver
//! (`EHLO`/`HELO`, `STARTTLS`, `AUTH PLAIN`/`AUTH LOGIN`, `MAIL`, `RCPT`,
//! `DATA`, `RSET`, `NOOP`, `QUIT`) and keeps the accepted messages in a
//! shared, bounded [`MailStore`] instead of relaying them.

use std::{borrow::Cow, collections::VecDeque, io, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use rustls::ServerConfig;
use tokio::{
    io::{split, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{
    decode_login_step, decode_plain, header_value, parse_raw_headers, AuthEngine, AuthError,
    AuthResult, Mechanism,
};

pub const DEFAULT_SERVER_NAME: &str = "localhost";

/// Messages kept by default, the oldest ones are dropped first.
pub const DEFAULT_MAX_MAILS: usize = 1000;

/// Connection logs kept by default, the oldest ones are dropped first.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Behaviour of a [`CaptureServer`].
#[derive(Clone)]
pub struct CaptureOptions {
    /// Name announced in the greeting and the `EHLO` reply.
    pub server_name: String,
    /// Enables `STARTTLS` when set.
    pub tls: Option<Arc<ServerConfig>>,
    /// Enables `AUTH` when set.
    pub auth: Option<Arc<dyn AuthEngine>>,
    /// Refuses transactions until the client has authenticated.
    pub auth_required: bool,
    /// Recipients refused with `550` during `RCPT TO`.
    pub reject: Vec<String>,
    /// Maximum number of messages kept, `0` keeps all of them.
    pub max_mails: usize,
    /// Maximum number of connection logs kept, `0` keeps all of them.
    pub max_sessions: usize,
}

impl CaptureOptions {
    pub fn tls(mut self, config: ServerConfig) -> Self {
        self.tls = Some(Arc::new(config));
        self
    }

    pub fn auth(mut self, engine: impl AuthEngine + 'static) -> Self {
        self.auth = Some(Arc::new(engine));
        self
    }

    pub fn auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    pub fn reject(mut self, recipient: impl Into<String>) -> Self {
        self.reject.push(recipient.into());
        self
    }

    pub fn limits(mut self, max_mails: usize, max_sessions: usize) -> Self {
        self.max_mails = max_mails;
        self.max_sessions = max_sessions;
        self
    }

    fn is_rejected(&self, recipient: &str) -> bool {
        self.reject
            .iter()
            .any(|rejected| rejected.eq_ignore_ascii_case(recipient))
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            tls: None,
            auth: None,
            auth_required: false,
            reject: Vec::new(),
            max_mails: DEFAULT_MAX_MAILS,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// A message accepted by the capture server.
#[derive(Debug, Clone)]
pub struct CapturedMail {
    /// Assigned by the [`MailStore`], unique for the life of the store.
    pub id: u64,
    pub envelope_from: String,
    pub envelope_to: Vec<String>,
    /// Message content after dot-unstuffing, without the terminator.
    pub data: Vec<u8>,
    /// Whether the message was received over TLS.
    pub secure: bool,
    pub authenticated_as: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl CapturedMail {
    pub fn new<I, S>(envelope_from: impl Into<String>, envelope_to: I, data: Vec<u8>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: 0,
            envelope_from: envelope_from.into(),
            envelope_to: envelope_to.into_iter().map(Into::into).collect(),
            data,
            secure: false,
            authenticated_as: None,
            received_at: Utc::now(),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Raw `Subject` header of the message, if any.
    pub fn subject(&self) -> Option<String> {
        let text = self.text();
        let (headers, _) = parse_raw_headers(&text);
        header_value(&headers, "Subject").map(str::to_string)
    }
}

/// A command as received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    /// Upper-cased verb, followed by the argument (credentials omitted).
    pub line: String,
    /// Whether the command arrived over TLS.
    pub secure: bool,
}

impl LoggedCommand {
    pub fn verb(&self) -> &str {
        self.line.split(' ').next().unwrap_or_default()
    }
}

/// Every command received on a single connection, in order.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    pub id: u64,
    pub commands: Vec<LoggedCommand>,
}

impl SessionLog {
    /// Number of commands with the given verb.
    pub fn count(&self, verb: &str) -> usize {
        self.commands
            .iter()
            .filter(|command| command.verb().eq_ignore_ascii_case(verb))
            .count()
    }

    /// Verbs in the order they were received.
    pub fn verbs(&self) -> Vec<&str> {
        self.commands.iter().map(LoggedCommand::verb).collect()
    }
}

/// Change notification published by a [`MailStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Captured(u64),
    Removed(u64),
    Cleared,
}

#[derive(Debug)]
struct StoreInner {
    mails: VecDeque<CapturedMail>,
    sessions: VecDeque<SessionLog>,
    next_mail: u64,
    next_session: u64,
    max_mails: usize,
    max_sessions: usize,
}

/// Shared storage for captured messages and per-connection command logs.
///
/// Both are bounded, once a limit is reached the oldest entry is dropped
/// to make room for the new one.
#[derive(Debug, Clone)]
pub struct MailStore {
    inner: Arc<Mutex<StoreInner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MailStore {
    /// Creates an empty store, a limit of `0` disables it.
    pub fn with_limits(max_mails: usize, max_sessions: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                mails: VecDeque::new(),
                sessions: VecDeque::new(),
                next_mail: 1,
                next_session: 1,
                max_mails,
                max_sessions,
            })),
            events,
        }
    }

    pub async fn mails(&self) -> Vec<CapturedMail> {
        self.inner.lock().await.mails.iter().cloned().collect()
    }

    pub async fn get(&self, id: u64) -> Option<CapturedMail> {
        let inner = self.inner.lock().await;
        inner.mails.iter().find(|mail| mail.id == id).cloned()
    }

    pub async fn sessions(&self) -> Vec<SessionLog> {
        self.inner.lock().await.sessions.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.mails.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.mails.is_empty()
    }

    /// Stores the message under a fresh id, which is returned.
    pub async fn push(&self, mut mail: CapturedMail) -> u64 {
        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_mail;
            inner.next_mail += 1;
            mail.id = id;
            if inner.max_mails > 0 && inner.mails.len() >= inner.max_mails {
                inner.mails.pop_front();
            }
            inner.mails.push_back(mail);
            id
        };
        self.notify(StoreEvent::Captured(id));
        id
    }

    /// Removes a single message, `false` when no message has that id.
    pub async fn remove(&self, id: u64) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            let before = inner.mails.len();
            inner.mails.retain(|mail| mail.id != id);
            inner.mails.len() != before
        };
        if removed {
            self.notify(StoreEvent::Removed(id));
        }
        removed
    }

    /// Drops every message and every connection log.
    pub async fn clear(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.mails.clear();
            inner.sessions.clear();
        }
        self.notify(StoreEvent::Cleared);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        self.events.send(event).ok();
    }

    async fn open_session(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_session;
        inner.next_session += 1;
        if inner.max_sessions > 0 && inner.sessions.len() >= inner.max_sessions {
            inner.sessions.pop_front();
        }
        inner.sessions.push_back(SessionLog {
            id,
            commands: Vec::new(),
        });
        id
    }

    async fn record(&self, session: u64, line: String, secure: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(log) = inner.sessions.iter_mut().rev().find(|log| log.id == session) {
            log.commands.push(LoggedCommand { line, secure });
        }
    }
}

impl Default for MailStore {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_MAILS, DEFAULT_MAX_SESSIONS)
    }
}

/// SMTP server keeping every accepted message in memory.
pub struct CaptureServer {
    listener: TcpListener,
    options: Arc<CaptureOptions>,
    store: MailStore,
}

impl CaptureServer {
    pub async fn bind(addr: impl ToSocketAddrs, options: CaptureOptions) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            store: MailStore::with_limits(options.max_mails, options.max_sessions),
            options: Arc::new(options),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> MailStore {
        self.store.clone()
    }

    /// Accepts connections until the listener fails, each one handled by
    /// its own task.
    pub async fn run(self) -> io::Result<()> {
        let acceptor = self.options.tls.clone().map(TlsAcceptor::from);
        info!(
            address = %self.listener.local_addr()?,
            starttls = acceptor.is_some(),
            auth = self.options.auth.is_some(),
            "Capture server listening"
        );

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let id = self.store.open_session().await;
            let session = CaptureSession::new(id, self.store.clone(), self.options.clone());
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                debug!(session = id, peer = %peer, "Accepted connection");
                if let Err(error) = session.serve(stream, acceptor).await {
                    warn!(session = id, peer = %peer, error = %error, "Capture session failed");
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<io::Result<()>> {
        tokio::spawn(self.run())
    }
}

/// What the command loop asks its caller to do next.
enum Next {
    Done,
    StartTls,
}

/// State of a single connection.
struct CaptureSession {
    id: u64,
    store: MailStore,
    options: Arc<CaptureOptions>,
    greeted: bool,
    secure: bool,
    from: Option<String>,
    rcpts: Vec<String>,
    authenticated_as: Option<String>,
}

impl CaptureSession {
    fn new(id: u64, store: MailStore, options: Arc<CaptureOptions>) -> Self {
        Self {
            id,
            store,
            options,
            greeted: false,
            secure: false,
            from: None,
            rcpts: Vec::new(),
            authenticated_as: None,
        }
    }

    async fn serve(mut self, stream: TcpStream, acceptor: Option<TlsAcceptor>) -> io::Result<()> {
        stream.set_nodelay(true)?;

        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        let greeting = format!("{} Mailpost capture ready", self.options.server_name);
        self.write_response(&mut writer, 220, &greeting).await?;

        let acceptor = match self.dialogue(&mut reader, &mut writer, acceptor.is_some()).await? {
            Next::Done => return Ok(()),
            Next::StartTls => match acceptor {
                Some(acceptor) => acceptor,
                None => return Ok(()),
            },
        };

        let stream = reader.into_inner().unsplit(writer);
        let tls_stream = acceptor.accept(stream).await?;
        debug!(session = self.id, "TLS handshake complete");

        // the client must start over after the upgrade (RFC 3207 §4.2)
        self.secure = true;
        self.greeted = false;
        self.authenticated_as = None;
        self.reset();

        let (reader, mut writer) = split(tls_stream);
        let mut reader = BufReader::new(reader);
        self.dialogue(&mut reader, &mut writer, false).await?;
        Ok(())
    }

    async fn dialogue<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        tls_available: bool,
    ) -> io::Result<Next>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::with_capacity(512);
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(Next::Done);
            }

            let trimmed = line.trim_end();
            let (verb, argument) = match trimmed.split_once(' ') {
                Some((verb, argument)) => (verb.to_ascii_uppercase(), argument.trim().to_string()),
                None => (trimmed.to_ascii_uppercase(), String::new()),
            };
            let logged = match verb.as_str() {
                "AUTH" => format!(
                    "AUTH {}",
                    argument.split(' ').next().unwrap_or_default().to_ascii_uppercase()
                ),
                _ if argument.is_empty() => verb.clone(),
                _ => format!("{verb} {argument}"),
            };
            debug!(session = self.id, secure = self.secure, "C: {logged}");
            self.store.record(self.id, logged, self.secure).await;

            match verb.as_str() {
                "EHLO" => self.handle_ehlo(writer, tls_available).await?,
                "HELO" => {
                    self.reset();
                    self.greeted = true;
                    let name = self.options.server_name.clone();
                    self.write_response(writer, 250, &name).await?;
                }
                "STARTTLS" if tls_available && !self.secure => {
                    self.write_response(writer, 220, "Ready to start TLS").await?;
                    return Ok(Next::StartTls);
                }
                "STARTTLS" if self.secure => {
                    self.write_response(writer, 503, "TLS already active").await?;
                }
                "AUTH" => self.handle_auth(reader, writer, &argument).await?,
                "MAIL" => self.handle_mail(writer, &argument).await?,
                "RCPT" => self.handle_rcpt(writer, &argument).await?,
                "DATA" => self.handle_data(reader, writer).await?,
                "RSET" => {
                    self.reset();
                    self.write_response(writer, 250, "OK").await?;
                }
                "NOOP" => self.write_response(writer, 250, "OK").await?,
                "QUIT" => {
                    self.write_response(writer, 221, "Bye").await?;
                    return Ok(Next::Done);
                }
                _ => {
                    self.write_response(writer, 502, "Command not implemented")
                        .await?
                }
            }
        }
    }

    async fn handle_ehlo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        tls_available: bool,
    ) -> io::Result<()> {
        self.reset();
        self.greeted = true;

        let mut lines = vec![format!("{} greets you", self.options.server_name)];
        if tls_available && !self.secure {
            lines.push("STARTTLS".to_string());
        }
        if self.options.auth.is_some() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.push("8BITMIME".to_string());
        self.write_multiple(writer, 250, &lines).await
    }

    async fn handle_auth<R, W>(&mut self, reader: &mut R, writer: &mut W, argument: &str) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let engine = match &self.options.auth {
            Some(engine) => engine.clone(),
            None => return self.write_response(writer, 502, "Command not implemented").await,
        };
        if self.authenticated_as.is_some() {
            return self.write_response(writer, 503, "Already authenticated").await;
        }

        let mut words = argument.split_whitespace();
        let mechanism = match words.next().map(str::parse::<Mechanism>) {
            Some(Ok(mechanism)) => mechanism,
            _ => {
                return self
                    .write_response(writer, 504, "Unrecognized authentication type")
                    .await
            }
        };
        let initial = words.next().map(str::to_string);

        let credentials = match mechanism {
            Mechanism::Plain => {
                let response = match initial {
                    Some(response) => Some(response),
                    None => self.challenge(reader, writer, "").await?,
                };
                response.map(|response| decode_plain(&response)).transpose()
            }
            Mechanism::Login => self.login_exchange(reader, writer, initial).await?,
        };

        let outcome = match credentials {
            Ok(Some((username, password))) => verify(engine.as_ref(), username, &password),
            Ok(None) => {
                return self
                    .write_response(writer, 501, "Authentication cancelled")
                    .await
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok(username) => {
                info!(session = self.id, username = %username, mechanism = %mechanism, "Client authenticated");
                self.authenticated_as = Some(username);
                self.write_response(writer, 235, "Authentication successful")
                    .await
            }
            Err(AuthError::InvalidCredentials) => {
                warn!(session = self.id, "Authentication failed");
                self.write_response(writer, 535, "Authentication failed")
                    .await
            }
            Err(error) => {
                let message = error.to_string();
                self.write_response(writer, 501, &message).await
            }
        }
    }

    /// Runs the two `AUTH LOGIN` rounds, the username may already have
    /// been given as initial response.
    async fn login_exchange<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        initial: Option<String>,
    ) -> io::Result<AuthResult<Option<(String, String)>>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let username = match initial {
            Some(username) => username,
            None => match self.challenge(reader, writer, "VXNlcm5hbWU6").await? {
                Some(username) => username,
                None => return Ok(Ok(None)),
            },
        };
        let password = match self.challenge(reader, writer, "UGFzc3dvcmQ6").await? {
            Some(password) => password,
            None => return Ok(Ok(None)),
        };

        Ok(decode_login_step(&username).and_then(|username| {
            decode_login_step(&password).map(|password| Some((username, password)))
        }))
    }

    /// Sends a `334` challenge and reads the client response, `None` when
    /// the client cancels the exchange with `*`.
    async fn challenge<R, W>(&mut self, reader: &mut R, writer: &mut W, prompt: &str) -> io::Result<Option<String>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.write_response(writer, 334, prompt).await?;
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let response = line.trim();
        Ok((response != "*").then(|| response.to_string()))
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, argument: &str) -> io::Result<()> {
        if !self.may_transact() {
            return self.write_response(writer, 530, "Authentication required").await;
        }
        if !self.greeted {
            return self.write_response(writer, 503, "Send EHLO first").await;
        }

        match parse_path(argument, "FROM:") {
            Some(from) => {
                self.from = Some(from);
                self.rcpts.clear();
                self.write_response(writer, 250, "OK").await
            }
            None => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, argument: &str) -> io::Result<()> {
        if !self.may_transact() {
            return self.write_response(writer, 530, "Authentication required").await;
        }
        if self.from.is_none() {
            return self.write_response(writer, 503, "Need MAIL command").await;
        }

        match parse_path(argument, "TO:") {
            Some(rcpt) if self.options.is_rejected(&rcpt) => {
                debug!(session = self.id, recipient = %rcpt, "Recipient rejected");
                self.write_response(writer, 550, "No such user here").await
            }
            Some(rcpt) => {
                self.rcpts.push(rcpt);
                self.write_response(writer, 250, "OK").await
            }
            None => {
                self.write_response(writer, 501, "Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_data<R, W>(&mut self, reader: &mut R, writer: &mut W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !self.may_transact() {
            return self.write_response(writer, 530, "Authentication required").await;
        }
        let from = match &self.from {
            Some(from) => from.clone(),
            None => return self.write_response(writer, 503, "Need MAIL command").await,
        };
        if self.rcpts.is_empty() {
            return self.write_response(writer, 554, "No valid recipients").await;
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let mut data = Vec::with_capacity(4096);
        let mut line = Vec::with_capacity(1024);
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            let content = match line.first() {
                Some(b'.') => &line[1..],
                _ => &line[..],
            };
            data.extend_from_slice(content);
        }

        let mut mail = CapturedMail::new(from, std::mem::take(&mut self.rcpts), data);
        mail.secure = self.secure;
        mail.authenticated_as = self.authenticated_as.clone();
        let size = mail.data.len();
        info!(
            session = self.id,
            from = %mail.envelope_from,
            to = %mail.envelope_to.join(", "),
            subject = %mail.subject().unwrap_or_default(),
            size,
            secure = mail.secure,
            "Message captured"
        );
        self.store.push(mail).await;
        self.reset();

        self.write_response(writer, 250, "Message accepted for delivery")
            .await
    }

    fn may_transact(&self) -> bool {
        !self.options.auth_required || self.authenticated_as.is_some()
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn write_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> io::Result<()> {
        self.write_inner(writer, code, message, " ").await?;
        writer.flush().await
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[String],
    ) -> io::Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let separator = if index == messages.len() - 1 { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await?;
        }
        writer.flush().await
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        debug!(session = self.id, secure = self.secure, "S: {code}{separator}{message}");
        writer
            .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
            .await
    }
}

/// Checks the credentials, returning the username on success.
fn verify(engine: &dyn AuthEngine, username: String, password: &str) -> AuthResult<String> {
    if engine.authenticate(&username, password)? {
        Ok(username)
    } else {
        Err(AuthError::InvalidCredentials)
    }
}

/// Extracts the address of a `FROM:<…>`/`TO:<…>` argument, ignoring any
/// ESMTP parameters after the path.
fn parse_path(argument: &str, prefix: &str) -> Option<String> {
    let head = argument.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let path = argument[prefix.len()..].trim_start();
    let path = path.strip_prefix('<')?;
    let end = path.find('>')?;
    Some(path[..end].trim().to_string())
}
