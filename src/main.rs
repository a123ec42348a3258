//! HTTP Stub Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use http_stub_server::{ConfigLoader, ConfigSource, ServerOptions, StubServer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "http-stub-server",
    about = "Declarative HTTP stub server - request matching rules and canned responses",
    version
)]
struct Args {
    /// Path to a JSON or YAML ruleset
    #[arg(short, long)]
    config: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 12345)]
    port: u16,

    /// Directory that relative response files resolve against
    /// (defaults to the ruleset's directory)
    #[arg(long, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Milliseconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 5000)]
    grace_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    }

    info!(path = ?args.config, "Loading configuration");
    let mut loader = ConfigLoader::new();
    if let Some(base_dir) = &args.base_dir {
        loader = loader.with_base_dir(base_dir);
    }
    let rules = loader.load(ConfigSource::file(&args.config))?;

    if args.validate {
        println!("Configuration is valid ({} rules defined)", rules.len());
        return Ok(());
    }

    let options = ServerOptions::default()
        .with_host(args.host)
        .with_port(args.port)
        .with_shutdown_grace(Duration::from_millis(args.grace_ms));

    let mut server = StubServer::with_rules(options, rules);
    let addr = server.start().await?;
    info!(%addr, "Listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.stop().await;

    Ok(())
}
