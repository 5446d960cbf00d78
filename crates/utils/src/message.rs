//! Outgoing email composition.
//!
//! This module defines [`MessageBuilder`], which assembles the headers, the
//! single body part and the attachments of an email into an immutable
//! [`Message`], and [`WireMessage`], the serialized MIME document handed
//! over to the SMTP transport.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::Local;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    encode_header_value, filename_param, has_control_chars, normalize_crlf, requires_base64,
    wrap_base64,
};

/// Character set declared for the body when none is given.
pub const DEFAULT_CHARSET: &str = "utf-8";

/// Content type used for every attachment.
pub const ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

/// Result type for message building operations.
pub type MessageResult<T> = Result<T, MessageError>;

/// Errors that can occur while building a message.
#[derive(Debug)]
pub enum MessageError {
    /// A mandatory field (sender or recipients) was not provided.
    MissingField(&'static str),
    /// An address holds a line break or another control character.
    InvalidHeader { name: &'static str, value: String },
    /// The declared character set is not supported, or the body can't be
    /// represented in it.
    Charset(String),
    /// An attachment file exists but could not be read.
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::MissingField(field) => write!(f, "Missing message field: {field}"),
            MessageError::InvalidHeader { name, value } => {
                write!(f, "Invalid {name} header value: {value}")
            }
            MessageError::Charset(charset) => {
                write!(f, "Body can't be encoded using charset {charset}")
            }
            MessageError::Attachment { path, source } => {
                write!(f, "Failed to read attachment {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageError::Attachment { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Declared subtype of the body part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Plain,
    Html,
}

impl BodyType {
    /// MIME subtype, as used in `text/<subtype>`.
    pub fn subtype(&self) -> &'static str {
        match self {
            BodyType::Plain => "plain",
            BodyType::Html => "html",
        }
    }
}

impl Display for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "text/{}", self.subtype())
    }
}

impl FromStr for BodyType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "plain" | "text" | "text/plain" => Ok(BodyType::Plain),
            "html" | "text/html" => Ok(BodyType::Html),
            other => Err(format!("Unknown body type: {other}")),
        }
    }
}

/// A file attached to a message, already loaded in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    filename: String,
    content: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
        }
    }

    /// Loads an attachment from the filesystem, naming it after the base
    /// name of the path.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn from_path(path: &Path) -> MessageResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(path).map_err(|source| MessageError::Attachment {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(Self::new(base_name(path), content)))
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

/// Returns the last component of the path, without any directory.
fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// An attachment waiting for [`MessageBuilder::build`], either already in
/// memory or still to be read from disk.
#[derive(Debug, Clone)]
enum PendingAttachment {
    Memory(Attachment),
    File(PathBuf),
}

/// Builder for [`Message`], collecting the fields in any order.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    subject: String,
    body: String,
    body_type: BodyType,
    charset: Option<String>,
    attachments: Vec<PendingAttachment>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, sender: impl Into<String>) -> Self {
        self.from = Some(sender.into());
        self
    }

    /// Adds a recipient, keeping the insertion order.
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    pub fn recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to.extend(recipients.into_iter().map(Into::into));
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the body and declares it as `text/html`.
    pub fn html(self, body: impl Into<String>) -> Self {
        self.body(body).body_type(BodyType::Html)
    }

    pub fn body_type(mut self, body_type: BodyType) -> Self {
        self.body_type = body_type;
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(PendingAttachment::Memory(attachment));
        self
    }

    /// Queues a file to be attached, the file is only looked up when
    /// [`build`](Self::build) runs.
    pub fn attach_file(mut self, path: impl AsRef<Path>) -> Self {
        self.attachments
            .push(PendingAttachment::File(path.as_ref().to_path_buf()));
        self
    }

    pub fn attach_files<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths
            .into_iter()
            .fold(self, |builder, path| builder.attach_file(path))
    }

    /// Validates the fields and loads the queued attachment files.
    ///
    /// The body is kept as UTF-8, so only `utf-8` and `us-ascii` (for an
    /// ASCII body) can be declared. Files that don't exist are skipped
    /// with a warning and listed in [`Message::skipped`], they never cause
    /// the build to fail.
    pub fn build(self) -> MessageResult<Message> {
        let from = self
            .from
            .filter(|from| !from.trim().is_empty())
            .ok_or(MessageError::MissingField("from"))?;
        if self.to.is_empty() {
            return Err(MessageError::MissingField("to"));
        }
        check_header("From", &from)?;
        for recipient in &self.to {
            check_header("To", recipient)?;
        }

        let charset = self.charset.unwrap_or_else(|| DEFAULT_CHARSET.to_string());
        match charset.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => (),
            "us-ascii" | "ascii" if self.body.is_ascii() => (),
            _ => return Err(MessageError::Charset(charset)),
        }

        let mut attachments = Vec::with_capacity(self.attachments.len());
        let mut skipped = Vec::new();
        for pending in self.attachments {
            match pending {
                PendingAttachment::Memory(attachment) => attachments.push(attachment),
                PendingAttachment::File(path) => match Attachment::from_path(&path)? {
                    Some(attachment) => {
                        debug!(
                            path = %path.display(),
                            filename = %attachment.filename,
                            size = attachment.content.len(),
                            "Attachment loaded"
                        );
                        attachments.push(attachment);
                    }
                    None => {
                        warn!(path = %path.display(), "Attachment file not found, skipping");
                        skipped.push(path);
                    }
                },
            }
        }

        let message_id = format!("<{}@{}>", Uuid::new_v4().simple(), sender_domain(&from));
        Ok(Message {
            from,
            to: self.to,
            subject: self.subject,
            body: self.body,
            body_type: self.body_type,
            charset,
            attachments,
            skipped,
            message_id,
            date: Local::now().to_rfc2822(),
            boundary: format!("===============mailpost-{}==", Uuid::new_v4().simple()),
        })
    }
}

fn check_header(name: &'static str, value: &str) -> MessageResult<()> {
    if has_control_chars(value) {
        return Err(MessageError::InvalidHeader {
            name,
            value: value.escape_debug().to_string(),
        });
    }
    Ok(())
}

/// Domain part of the sender address, used for the `Message-ID`.
fn sender_domain(from: &str) -> &str {
    from.rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('>').trim())
        .filter(|domain| !domain.is_empty())
        .unwrap_or("localhost")
}

/// An email ready to be serialized, immutable once built.
///
/// The `Message-ID`, `Date` and MIME boundary are fixed at build time so
/// that every call to [`to_wire`](Self::to_wire) yields the same bytes.
#[derive(Debug, Clone)]
pub struct Message {
    from: String,
    to: Vec<String>,
    subject: String,
    body: String,
    body_type: BodyType,
    charset: String,
    attachments: Vec<Attachment>,
    skipped: Vec<PathBuf>,
    message_id: String,
    date: String,
    boundary: String,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Attachment paths that were skipped because the file did not exist.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Serializes the message into a `multipart/mixed` MIME document,
    /// the body being the first part followed by the attachments.
    pub fn to_wire(&self) -> WireMessage {
        let attachments_len: usize = self
            .attachments
            .iter()
            .map(|attachment| attachment.content.len() * 4 / 3 + 256)
            .sum();
        let mut out = String::with_capacity(self.body.len() * 2 + attachments_len + 1024);

        push_header(&mut out, "From", &self.from);
        push_header(&mut out, "To", &self.to.join(", "));
        push_header(&mut out, "Subject", &encode_header_value(&self.subject));
        push_header(&mut out, "Date", &self.date);
        push_header(&mut out, "Message-ID", &self.message_id);
        push_header(&mut out, "MIME-Version", "1.0");
        push_header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", self.boundary),
        );
        out.push_str("\r\n");
        out.push_str("This is a multi-part message in MIME format.\r\n");

        out.push_str(&format!("\r\n--{}\r\n", self.boundary));
        self.write_body(&mut out);

        for attachment in &self.attachments {
            out.push_str(&format!("\r\n--{}\r\n", self.boundary));
            push_header(&mut out, "Content-Type", ATTACHMENT_CONTENT_TYPE);
            push_header(&mut out, "Content-Transfer-Encoding", "base64");
            push_header(
                &mut out,
                "Content-Disposition",
                &format!("attachment; {}", filename_param(&attachment.filename)),
            );
            out.push_str("\r\n");
            out.push_str(&wrap_base64(&attachment.content));
        }

        out.push_str(&format!("\r\n--{}--\r\n", self.boundary));
        WireMessage(out.into_bytes())
    }

    fn write_body(&self, out: &mut String) {
        push_header(
            out,
            "Content-Type",
            &format!("{}; charset=\"{}\"", self.body_type, self.charset),
        );
        if requires_base64(&self.body) {
            push_header(out, "Content-Transfer-Encoding", "base64");
            out.push_str("\r\n");
            out.push_str(&wrap_base64(self.body.as_bytes()));
        } else {
            push_header(out, "Content-Transfer-Encoding", "7bit");
            out.push_str("\r\n");
            out.push_str(&normalize_crlf(&self.body));
        }
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// Serialized MIME document, CRLF line terminated, ready for `DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage(Vec<u8>);

impl WireMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for WireMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for WireMessage {
    fn from(raw: String) -> Self {
        Self(raw.into_bytes())
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        message.to_wire()
    }
}

impl Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Builds a single-recipient message and serializes it.
///
/// Attachment paths that don't exist are skipped with a warning.
pub fn build<P: AsRef<Path>>(
    sender: &str,
    recipient: &str,
    subject: &str,
    body: &str,
    body_type: BodyType,
    attachments: &[P],
) -> MessageResult<WireMessage> {
    let message = Message::builder()
        .from(sender)
        .to(recipient)
        .subject(subject)
        .body(body)
        .body_type(body_type)
        .attach_files(attachments)
        .build()?;
    Ok(message.to_wire())
}
