use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};

use clap::Parser;
use mailpost_utils::{
    deliver, load_config, BodyType, Config, ConfigError, Credentials, Message, MessageError,
    Outgoing, Refusal, SecurityMode, TransportConfig, TransportError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FROM: &str = "sender@example.com";
const DEFAULT_TO: &str = "recipient@example.com";
const DEFAULT_SUBJECT: &str = "Mailpost test message";
const DEFAULT_BODY: &str = "This is a test message sent through the local SMTP server.";
const DEFAULT_HTML_BODY: &str = "<html><body><h1>Mailpost</h1>\
    <p>This is a test message sent through the local SMTP server.</p></body></html>";

#[derive(Parser, Debug)]
#[command(name = "mailpost-smtp", version)]
#[command(about = "Builds email messages and delivers them over SMTP", long_about = None)]
struct Args {
    /// TOML file with the transport settings and the message batch
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SMTP server host
    #[arg(long)]
    host: Option<String>,

    /// SMTP server port
    #[arg(long)]
    port: Option<u16>,

    /// Sends the body as text/html
    #[arg(long)]
    html: bool,

    /// Upgrades the session with STARTTLS
    #[arg(long)]
    tls: bool,

    #[arg(long)]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    #[arg(long, value_name = "ADDRESS")]
    from: Option<String>,

    /// Recipient address, can be repeated
    #[arg(long, value_name = "ADDRESS")]
    to: Vec<String>,

    #[arg(long)]
    subject: Option<String>,

    #[arg(long)]
    body: Option<String>,

    /// File to attach, can be repeated
    #[arg(long, value_name = "PATH")]
    attach: Vec<PathBuf>,

    /// PEM file with extra CA certificates to trust
    #[arg(long, value_name = "FILE")]
    ca_cert: Option<PathBuf>,

    /// Skips server certificate verification
    #[arg(long)]
    insecure: bool,

    /// Prints the full error chain on failure
    #[arg(long)]
    trace: bool,
}

/// Outcome of a successful run.
#[derive(Debug)]
struct Report {
    address: String,
    sent: usize,
    skipped: usize,
    refused: Vec<Refusal>,
}

/// Every failure that can stop a run, classified for reporting.
#[derive(Debug)]
enum Failure {
    Config(ConfigError),
    Message(MessageError),
    Transport(TransportError),
}

impl Failure {
    fn class(&self) -> String {
        match self {
            Failure::Config(_) => "config".to_string(),
            Failure::Message(_) => "message".to_string(),
            Failure::Transport(error) => error.kind().to_string(),
        }
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Config(error) => write!(f, "{error}"),
            Failure::Message(error) => write!(f, "{error}"),
            Failure::Transport(error) => write!(f, "{error}"),
        }
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Failure::Config(error) => error.source(),
            Failure::Message(error) => error.source(),
            Failure::Transport(error) => error.source(),
        }
    }
}

impl From<ConfigError> for Failure {
    fn from(error: ConfigError) -> Self {
        Failure::Config(error)
    }
}

impl From<MessageError> for Failure {
    fn from(error: MessageError) -> Self {
        Failure::Message(error)
    }
}

impl From<TransportError> for Failure {
    fn from(error: TransportError) -> Self {
        Failure::Transport(error)
    }
}

/// Applies the command line overrides on top of the configured transport.
fn transport_config(args: &Args, config: &Config) -> TransportConfig {
    let mut transport = config.transport.to_transport_config();
    if let Some(host) = &args.host {
        transport.host = host.clone();
    }
    if let Some(port) = args.port {
        transport.port = port;
    }
    if args.tls {
        transport.security = SecurityMode::StartTls;
    }
    if let Some(username) = &args.username {
        let password = args.password.clone().unwrap_or_default();
        transport.credentials = Some(Credentials::new(username, password));
    }
    if let Some(ca_cert) = &args.ca_cert {
        transport.tls.ca_cert = Some(ca_cert.clone());
    }
    if args.insecure {
        transport.tls.accept_invalid_certs = true;
    }
    transport
}

/// Builds the messages to send, either the configured batch or a single
/// message described on the command line (when `--to` is given or the
/// configuration has no messages). Returns the number of skipped
/// attachments along with the batch.
fn build_batch(args: &Args, config: &Config) -> Result<(Vec<Outgoing>, usize), MessageError> {
    if !args.to.is_empty() || config.messages.is_empty() {
        let message = cli_message(args)?;
        return Ok((vec![Outgoing::from(&message)], message.skipped().len()));
    }

    let mut batch = Vec::with_capacity(config.messages.len());
    let mut skipped = 0;
    for entry in &config.messages {
        let message = entry.builder().build()?;
        skipped += message.skipped().len();
        batch.push(Outgoing::new(entry.envelope(), message.to_wire()));
    }
    Ok((batch, skipped))
}

fn cli_message(args: &Args) -> Result<Message, MessageError> {
    let body_type = if args.html {
        BodyType::Html
    } else {
        BodyType::Plain
    };
    let body = args.body.clone().unwrap_or_else(|| {
        match body_type {
            BodyType::Html => DEFAULT_HTML_BODY,
            BodyType::Plain => DEFAULT_BODY,
        }
        .to_string()
    });
    let recipients = if args.to.is_empty() {
        vec![DEFAULT_TO.to_string()]
    } else {
        args.to.clone()
    };

    Message::builder()
        .from(args.from.as_deref().unwrap_or(DEFAULT_FROM))
        .recipients(recipients)
        .subject(args.subject.as_deref().unwrap_or(DEFAULT_SUBJECT))
        .body(body)
        .body_type(body_type)
        .attach_files(&args.attach)
        .build()
}

async fn run(args: &Args) -> Result<Report, Failure> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let transport = transport_config(args, &config);
    let (batch, skipped) = build_batch(args, &config)?;

    info!(
        address = %transport.address(),
        security = ?transport.security,
        messages = batch.len(),
        "Delivering messages"
    );
    let receipts = deliver(&transport, &batch).await?;

    Ok(Report {
        address: transport.address(),
        sent: receipts.len(),
        skipped,
        refused: receipts
            .into_iter()
            .flat_map(|receipt| receipt.refused)
            .collect(),
    })
}

fn print_failure(failure: &Failure, trace: bool) {
    eprintln!("error [{}]: {failure}", failure.class());
    if !trace {
        return;
    }
    eprintln!("{failure:?}");
    let mut source = failure.source();
    while let Some(error) = source {
        eprintln!("  caused by: {error}");
        source = error.source();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // failures are reported, never turned into an exit code
    match run(&args).await {
        Ok(report) => {
            println!("Sent {} message(s) to {}", report.sent, report.address);
            if report.skipped > 0 {
                println!("Skipped {} missing attachment(s)", report.skipped);
            }
            for refusal in &report.refused {
                println!("Recipient refused: {} ({})", refusal.recipient, refusal.reply);
            }
        }
        Err(failure) => print_failure(&failure, args.trace),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use mailpost_utils::{CaptureOptions, CaptureServer, FailureKind};
    use tempfile::TempDir;

    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mailpost-smtp").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_transport_overrides() {
        let args = parse(&[
            "--host",
            "mail.example.com",
            "--port",
            "587",
            "--tls",
            "--username",
            "user",
            "--password",
            "secret",
            "--insecure",
        ]);
        let transport = transport_config(&args, &Config::default());
        assert_eq!(transport.address(), "mail.example.com:587");
        assert_eq!(transport.security, SecurityMode::StartTls);
        assert_eq!(
            transport.credentials,
            Some(Credentials::new("user", "secret"))
        );
        assert!(transport.tls.accept_invalid_certs);
    }

    #[test]
    fn test_password_requires_username() {
        let result = Args::try_parse_from(["mailpost-smtp", "--password", "secret"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_transport() {
        let transport = transport_config(&parse(&[]), &Config::default());
        assert_eq!(transport.address(), "localhost:2525");
        assert_eq!(transport.security, SecurityMode::None);
        assert!(transport.credentials.is_none());
    }

    #[test]
    fn test_cli_message_modes() {
        let message = cli_message(&parse(&[])).unwrap();
        assert_eq!(message.from(), DEFAULT_FROM);
        assert_eq!(message.to(), [DEFAULT_TO]);
        assert_eq!(message.body_type(), BodyType::Plain);

        let message = cli_message(&parse(&["--html", "--to", "a@x.com", "--to", "b@x.com"])).unwrap();
        assert_eq!(message.body_type(), BodyType::Html);
        assert_eq!(message.body(), DEFAULT_HTML_BODY);
        assert_eq!(message.to(), ["a@x.com", "b@x.com"]);
    }

    #[test]
    fn test_batch_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mailpost.toml");
        fs::write(
            &path,
            r#"
[[messages]]
from = "a@x.com"
to = ["b@x.com"]

[[messages]]
from = "c@x.com"
to = ["d@x.com"]
attachments = ["missing.txt"]
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();

        let (batch, skipped) = build_batch(&parse(&[]), &config).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(skipped, 1);
        assert_eq!(batch[1].envelope.from, "c@x.com");

        let (batch, _) = build_batch(&parse(&["--to", "z@x.com"]), &config).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope.to, vec!["z@x.com"]);
    }

    #[tokio::test]
    async fn test_run_against_capture_server() {
        let server = CaptureServer::bind("127.0.0.1:0", CaptureOptions::default())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port().to_string();
        let store = server.store();
        server.spawn();

        let temp_dir = TempDir::new().unwrap();
        let attachment = temp_dir.path().join("file.txt");
        fs::write(&attachment, "attached").unwrap();
        let attachment = attachment.to_string_lossy().into_owned();

        let args = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            &port,
            "--to",
            "b@x.com",
            "--attach",
            &attachment,
            "--attach",
            "missing.png",
        ]);
        let report = run(&args).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.refused.is_empty());

        let mails = store.mails().await;
        assert_eq!(mails[0].envelope_to, vec!["b@x.com"]);
        assert_eq!(mails[0].subject().as_deref(), Some(DEFAULT_SUBJECT));
    }

    #[tokio::test]
    async fn test_run_failure_classes() {
        let args = parse(&["--config", "does/not/exist.toml"]);
        let failure = run(&args).await.unwrap_err();
        assert_eq!(failure.class(), "config");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);
        let args = parse(&["--host", "127.0.0.1", "--port", &port]);
        let failure = run(&args).await.unwrap_err();
        assert!(matches!(
            failure,
            Failure::Transport(ref error) if error.kind() == FailureKind::Connection
        ));
        assert_eq!(failure.class(), "connection");
        assert!(failure.source().is_some());
    }
}
