//! Local capture server, accepts every message and keeps it in memory
//! instead of relaying it, the messages can be browsed through the HTTP
//! inspection API.

use std::{error::Error, path::PathBuf};

use clap::Parser;
use mailpost_utils::{
    load_config, load_tls_server_config, serve_inspect, CaptureOptions, CaptureServer, Config,
    MemoryAuthEngine, SinkConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mailpost-sink", version)]
#[command(about = "SMTP capture server for local delivery tests", long_about = None)]
struct Args {
    /// TOML file with a `[sink]` section
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Port of the HTTP inspection API
    #[arg(long)]
    inspect_port: Option<u16>,

    /// Disables the HTTP inspection API
    #[arg(long)]
    no_inspect: bool,
}

/// Turns the `[sink]` section into server options, loading the
/// certificate and the credentials file when configured.
fn capture_options(sink: &SinkConfig) -> Result<CaptureOptions, Box<dyn Error + Send + Sync>> {
    let mut options = CaptureOptions::default()
        .auth_required(sink.auth_required)
        .limits(sink.max_mails, sink.max_sessions);
    options.reject = sink.reject.clone();

    if let Some(tls) = &sink.tls {
        options = options.tls(load_tls_server_config(&tls.cert, &tls.key)?);
    }
    if let Some(path) = &sink.credentials_file {
        let engine = MemoryAuthEngine::from_file(path)?;
        info!(path = %path.display(), users = engine.len(), "Loaded credentials");
        options = options.auth(engine);
    }
    if options.auth_required && options.auth.is_none() {
        return Err("auth_required needs a credentials_file".into());
    }
    Ok(options)
}

async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(host) = args.host {
        config.sink.host = host;
    }
    if let Some(port) = args.port {
        config.sink.port = port;
    }
    if let Some(port) = args.inspect_port {
        config.sink.inspect.port = port;
    }
    if args.no_inspect {
        config.sink.inspect.enabled = false;
    }

    let sink = &config.sink;
    let options = capture_options(sink)?;
    let server = CaptureServer::bind((sink.host.as_str(), sink.port), options).await?;
    println!("Mailpost sink running on {}", server.local_addr()?);

    if !sink.inspect.enabled {
        server.run().await?;
        return Ok(());
    }
    let store = server.store();
    println!(
        "Inspection API on http://{}:{}/api/emails",
        sink.inspect.host, sink.inspect.port
    );
    tokio::try_join!(
        server.run(),
        serve_inspect((sink.inspect.host.as_str(), sink.inspect.port), store)
    )?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("{e}");
    }
}
