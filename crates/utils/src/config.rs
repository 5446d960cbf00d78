use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    BodyType, Credentials, Envelope, Message, MessageBuilder, SecurityMode, TlsOptions,
    TransportConfig, DEFAULT_CHARSET, DEFAULT_HELLO_NAME, DEFAULT_HOST, DEFAULT_MAX_MAILS,
    DEFAULT_MAX_SESSIONS, DEFAULT_PORT,
};

/// Top-level configuration shared by the sender and the capture server.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportSection,

    /// Messages sent, in order, over a single session.
    #[serde(default)]
    pub messages: Vec<MessageConfig>,

    #[serde(default)]
    pub sink: SinkConfig,
}

/// Where the sender connects and how.
#[derive(Debug, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub security: SecurityMode,

    #[serde(default = "default_hello_name")]
    pub hello_name: String,

    pub auth: Option<AuthSection>,

    #[serde(default)]
    pub tls: ClientTlsSection,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            security: SecurityMode::default(),
            hello_name: default_hello_name(),
            auth: None,
            tls: ClientTlsSection::default(),
        }
    }
}

impl TransportSection {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            security: self.security,
            credentials: self
                .auth
                .as_ref()
                .map(|auth| Credentials::new(&auth.username, &auth.password)),
            hello_name: self.hello_name.clone(),
            tls: TlsOptions {
                ca_cert: self.tls.ca_cert.clone(),
                accept_invalid_certs: self.tls.accept_invalid_certs,
                server_name: self.tls.server_name.clone(),
                ..Default::default()
            },
        }
    }
}

/// Login credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    pub username: String,
    pub password: String,
}

/// Client side TLS settings.
#[derive(Debug, Default, Deserialize)]
pub struct ClientTlsSection {
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    pub server_name: Option<String>,
}

/// A single message of the batch.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageConfig {
    pub from: String,

    pub to: Vec<String>,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub body_type: BodyType,

    #[serde(default = "default_charset")]
    pub charset: String,

    /// Files attached in order, relative paths are resolved against the
    /// working directory.
    #[serde(default)]
    pub attachments: Vec<PathBuf>,

    /// Overrides the envelope, by default derived from `from`/`to`.
    pub envelope: Option<EnvelopeSection>,
}

impl MessageConfig {
    pub fn builder(&self) -> MessageBuilder {
        Message::builder()
            .from(&self.from)
            .recipients(&self.to)
            .subject(&self.subject)
            .body(&self.body)
            .body_type(self.body_type)
            .charset(&self.charset)
            .attach_files(&self.attachments)
    }

    /// Envelope to use for the built message, fields missing from the
    /// `[messages.envelope]` table fall back to the headers.
    pub fn envelope(&self) -> Envelope {
        let overrides = self.envelope.clone().unwrap_or_default();
        Envelope::new(
            overrides.from.unwrap_or_else(|| self.from.clone()),
            overrides.to.unwrap_or_else(|| self.to.clone()),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeSection {
    pub from: Option<String>,
    pub to: Option<Vec<String>>,
}

/// Capture server configuration.
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub auth_required: bool,

    /// `username:password` per line, enables `AUTH` when set.
    pub credentials_file: Option<PathBuf>,

    /// Enables `STARTTLS` when set.
    pub tls: Option<ServerTlsSection>,

    /// Recipients refused during `RCPT TO`.
    #[serde(default)]
    pub reject: Vec<String>,

    /// Messages kept in memory, `0` keeps all of them.
    #[serde(default = "default_max_mails")]
    pub max_mails: usize,

    /// Connection logs kept in memory, `0` keeps all of them.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default)]
    pub inspect: InspectSection,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: default_sink_host(),
            port: default_port(),
            auth_required: false,
            credentials_file: None,
            tls: None,
            reject: Vec::new(),
            max_mails: default_max_mails(),
            max_sessions: default_max_sessions(),
            inspect: InspectSection::default(),
        }
    }
}

/// HTTP inspection API of the capture server.
#[derive(Debug, Deserialize)]
pub struct InspectSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_sink_host")]
    pub host: String,

    #[serde(default = "default_inspect_port")]
    pub port: u16,
}

impl Default for InspectSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_sink_host(),
            port: default_inspect_port(),
        }
    }
}

/// TLS certificate configuration.
#[derive(Debug, Deserialize)]
pub struct ServerTlsSection {
    #[serde(default = "default_cert")]
    pub cert: PathBuf,

    #[serde(default = "default_key")]
    pub key: PathBuf,
}

/// Loads and parses the TOML configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_sink_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_inspect_port() -> u16 {
    8025
}

fn default_enabled() -> bool {
    true
}

fn default_max_mails() -> usize {
    DEFAULT_MAX_MAILS
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_hello_name() -> String {
    DEFAULT_HELLO_NAME.to_string()
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

fn default_cert() -> PathBuf {
    PathBuf::from("certs/server.cert.pem")
}

fn default_key() -> PathBuf {
    PathBuf::from("certs/server.key.pem")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.transport.host, "localhost");
        assert_eq!(config.transport.port, 2525);
        assert_eq!(config.transport.security, SecurityMode::None);
        assert_eq!(config.transport.hello_name, "localhost");
        assert!(config.transport.auth.is_none());
        assert!(!config.transport.tls.accept_invalid_certs);
        assert!(config.messages.is_empty());
        assert_eq!(config.sink.host, "127.0.0.1");
        assert_eq!(config.sink.port, 2525);
        assert!(config.sink.tls.is_none());
        assert_eq!(config.sink.max_mails, 1000);
        assert!(config.sink.inspect.enabled);
        assert_eq!(config.sink.inspect.port, 8025);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[transport]
host = "mail.example.com"
port = 587
security = "starttls"
hello_name = "client.example.com"

[transport.auth]
username = "user"
password = "secret"

[transport.tls]
ca_cert = "certs/ca.pem"
accept_invalid_certs = true

[[messages]]
from = "a@x.com"
to = ["b@x.com", "c@x.com"]
subject = "Hi"
body = "<p>hello</p>"
body_type = "html"
attachments = ["file.txt"]

[messages.envelope]
to = ["bounce@x.com"]

[[messages]]
from = "d@x.com"
to = ["e@x.com"]

[sink]
host = "0.0.0.0"
port = 2626
auth_required = true
credentials_file = "passwords/example.txt"
reject = ["nobody@x.com"]
max_mails = 10
max_sessions = 0

[sink.tls]
cert = "my/cert.pem"

[sink.inspect]
enabled = false
port = 9025
"#;
        let config: Config = toml::from_str(toml).unwrap();

        let transport = config.transport.to_transport_config();
        assert_eq!(transport.address(), "mail.example.com:587");
        assert_eq!(transport.security, SecurityMode::StartTls);
        assert_eq!(transport.hello_name, "client.example.com");
        assert_eq!(transport.credentials.unwrap().username, "user");
        assert_eq!(transport.tls.ca_cert, Some(PathBuf::from("certs/ca.pem")));
        assert!(transport.tls.accept_invalid_certs);

        assert_eq!(config.messages.len(), 2);
        let first = &config.messages[0];
        assert_eq!(first.body_type, BodyType::Html);
        assert_eq!(first.charset, "utf-8");
        assert_eq!(first.attachments, vec![PathBuf::from("file.txt")]);
        assert_eq!(
            first.envelope(),
            Envelope::new("a@x.com", ["bounce@x.com"])
        );
        let second = &config.messages[1];
        assert_eq!(second.body_type, BodyType::Plain);
        assert_eq!(second.envelope(), Envelope::new("d@x.com", ["e@x.com"]));

        assert_eq!(config.sink.port, 2626);
        assert!(config.sink.auth_required);
        assert_eq!(config.sink.reject, vec!["nobody@x.com"]);
        assert_eq!(config.sink.max_mails, 10);
        assert_eq!(config.sink.max_sessions, 0);
        assert!(!config.sink.inspect.enabled);
        assert_eq!(config.sink.inspect.port, 9025);
        assert_eq!(config.sink.inspect.host, "127.0.0.1");
        let tls = config.sink.tls.unwrap();
        assert_eq!(tls.cert, PathBuf::from("my/cert.pem"));
        assert_eq!(tls.key, PathBuf::from("certs/server.key.pem"));
    }

    #[test]
    fn test_message_config_builder() {
        let toml = r#"
[[messages]]
from = "test@example.com"
to = ["saitama.sf@example.com"]
subject = "明日の会議について"
body = "明日の会議はなしで"
attachments = ["does/not/exist.txt"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let message = config.messages[0].builder().build().unwrap();
        assert_eq!(message.from(), "test@example.com");
        assert_eq!(message.subject(), "明日の会議について");
        assert!(message.attachments().is_empty());
        assert_eq!(message.skipped().len(), 1);
    }

    #[test]
    fn test_parse_demo_batch() {
        let config: Config = toml::from_str(include_str!("../../../config/mailpost.toml")).unwrap();
        assert_eq!(config.transport.port, 2525);
        assert_eq!(config.messages.len(), 3);
        assert_eq!(config.messages[0].attachments.len(), 2);
        assert_eq!(config.messages[2].subject, "欠席連絡");
        assert!(config.sink.tls.is_none());
    }

    #[test]
    fn test_parse_invalid_security() {
        let result: Result<Config, _> = toml::from_str("[transport]\nsecurity = \"ssl\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_errors() {
        let error = load_config(Path::new("does/not/exist.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Io(_)));

        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "[transport\nhost = 1").unwrap();
        let error = load_config(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
        assert!(error.to_string().starts_with("Config parse error"));
    }
}
