//! dbtunnel - carry database TCP connections over HTTP/2
//!
//! `dbtunnel connect` runs next to the database client and forwards each local
//! connection as an HTTP/2 request; `dbtunnel serve` runs next to the database
//! and turns those requests back into TCP connections.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dbtunnel_initiator::{
    CredentialSource, Initiator, InitiatorConfig, MetadataIdentityToken, NoCredentials,
    StaticToken, TokenFile,
};
use dbtunnel_terminator::{Terminator, TerminatorConfig};
use dbtunnel_transport::{DialPolicy, ShutdownController};
use dbtunnel_transport_h2::{H2Config, TunnelTarget};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// dbtunnel - Tunnel database connections through HTTP/2
#[derive(Parser, Debug)]
#[command(name = "dbtunnel")]
#[command(about = "dbtunnel - Tunnel database connections through HTTP/2")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept local database connections and tunnel them to a remote endpoint
    #[command(long_about = r#"
Listen for database clients on a local port and carry every connection to
the remote endpoint inside its own HTTP/2 request.

EXAMPLES:
  # Tunnel local port 3306 to a Cloud Run service
  dbtunnel connect --url https://db-abc123.a.run.app --metadata-identity

  # Development setup against a local `dbtunnel serve`
  dbtunnel connect --url http://127.0.0.1:8080 --no-tls --port 13306

ENVIRONMENT VARIABLES:
  DBTUNNEL_TOKEN   Bearer token sent with every tunnel request
    "#)]
    Connect(ConnectArgs),

    /// Serve HTTP/2 tunnel requests and forward them to a local backend
    #[command(long_about = r#"
Accept HTTP/2 tunnel requests and connect each one to the backend database.
The backend is dialed with retries so the service can come up before the
database is ready.

EXAMPLES:
  # Behind a TLS-terminating front end (h2c)
  dbtunnel serve --backend 127.0.0.1:5432

  # Terminate TLS here
  dbtunnel serve --tls-cert cert.pem --tls-key key.pem

ENVIRONMENT VARIABLES:
  PORT   Port to listen on
    "#)]
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Remote tunnel endpoint (e.g., https://db-abc123.a.run.app)
    #[arg(long)]
    url: Option<String>,

    /// Local port to accept database clients on
    #[arg(long, default_value_t = 3306, value_parser = clap::value_parser!(u16).range(1000..))]
    port: u16,

    /// Speak cleartext HTTP/2 (h2c) to the remote endpoint
    #[arg(long)]
    no_tls: bool,

    /// Skip TLS certificate verification (INSECURE - development only)
    #[arg(long)]
    insecure: bool,

    /// Bearer token for tunnel requests
    #[arg(long, env = "DBTUNNEL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// File holding the bearer token, re-read for every connection
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Fetch an identity token for --url from the GCE metadata server
    #[arg(long)]
    metadata_identity: bool,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Backend address to forward tunnels to (host:port)
    #[arg(long, default_value = "127.0.0.1:3306")]
    backend: String,

    /// TLS certificate chain (PEM); serves h2c when omitted
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// How long to keep retrying the backend before answering 500, in seconds
    #[arg(long, default_value_t = 30)]
    dial_timeout_secs: u64,

    /// Pause between backend dial attempts, in milliseconds
    #[arg(long, default_value_t = 50)]
    dial_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    init_logging(log_level)?;

    let shutdown = ShutdownController::new();
    tokio::spawn(listen_for_signals(shutdown.clone()));

    match cli.command {
        Commands::Connect(args) => run_connect(args, shutdown).await,
        Commands::Serve(args) => run_serve(args, shutdown).await,
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_connect(args: ConnectArgs, shutdown: ShutdownController) -> Result<()> {
    let Some(url) = args.url.as_deref() else {
        info!("No --url given, nothing to tunnel to");
        return Ok(());
    };

    let target = TunnelTarget::parse(url).with_context(|| format!("Invalid --url '{}'", url))?;

    let h2 = if args.no_tls {
        if target.is_https() {
            warn!("--no-tls given with an https:// URL, speaking h2c to {}", target);
        }
        H2Config::client_cleartext()
    } else if args.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
        H2Config::client_insecure()
    } else {
        H2Config::client_default()
    };

    let credentials = credential_source(&args, url);
    debug!("Credential source: {:?}", credentials);

    let config = InitiatorConfig::new(args.port, target).with_h2_config(h2);
    let initiator = Initiator::bind(config, credentials, shutdown)
        .await
        .context("Failed to start initiator")?;

    info!("dbtunnel connect starting...");
    let result = initiator.run().await;
    if let Err(ref e) = result {
        error!("Initiator error: {:#}", e);
    }
    result.context("Initiator stopped")?;

    info!("dbtunnel stopped");
    Ok(())
}

/// First configured source wins: `--token`, then `--token-file`, then
/// `--metadata-identity` (with `audience` as the token audience).
fn credential_source(args: &ConnectArgs, audience: &str) -> Arc<dyn CredentialSource> {
    if let Some(token) = &args.token {
        return Arc::new(StaticToken::new(token.clone()));
    }
    if let Some(path) = &args.token_file {
        return Arc::new(TokenFile::new(path.clone()));
    }
    if args.metadata_identity {
        return Arc::new(MetadataIdentityToken::new(audience));
    }
    Arc::new(NoCredentials)
}

async fn run_serve(args: ServeArgs, shutdown: ShutdownController) -> Result<()> {
    let h2 = match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => H2Config::server_tls(cert, key),
        _ => H2Config::server_cleartext(),
    };

    let policy = DialPolicy {
        budget: Duration::from_secs(args.dial_timeout_secs),
        interval: Duration::from_millis(args.dial_interval_ms),
    };

    let config = TerminatorConfig::new(args.port, args.backend)
        .with_dial_policy(policy)
        .with_h2_config(h2);
    let terminator = Terminator::bind(config, shutdown).context("Failed to start terminator")?;

    info!("dbtunnel serve starting...");
    let result = terminator.run().await;
    if let Err(ref e) = result {
        error!("Terminator error: {:#}", e);
    }
    result.context("Terminator stopped")?;

    info!("dbtunnel stopped");
    Ok(())
}

#[cfg(unix)]
async fn listen_for_signals(shutdown: ShutdownController) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        info!("Received {}, shutting down...", name);
        shutdown.trigger();
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(shutdown: ShutdownController) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down...");
        shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_connect_defaults() {
        let cli = Cli::try_parse_from(["dbtunnel", "connect"]).unwrap();
        match cli.command {
            Commands::Connect(args) => {
                assert_eq!(args.port, 3306);
                assert!(args.url.is_none());
                assert!(!args.no_tls);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_connect_port_range() {
        assert!(Cli::try_parse_from(["dbtunnel", "connect", "--port", "999"]).is_err());
        assert!(Cli::try_parse_from(["dbtunnel", "connect", "--port", "1000"]).is_ok());
        assert!(Cli::try_parse_from(["dbtunnel", "connect", "--port", "65535"]).is_ok());
    }

    #[test]
    fn test_serve_tls_flags_go_together() {
        assert!(Cli::try_parse_from(["dbtunnel", "serve", "--tls-cert", "c.pem"]).is_err());
        let cli = Cli::try_parse_from([
            "dbtunnel",
            "serve",
            "--tls-cert",
            "c.pem",
            "--tls-key",
            "k.pem",
            "--backend",
            "10.0.0.5:5432",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.backend, "10.0.0.5:5432");
                assert_eq!(args.tls_cert, Some(PathBuf::from("c.pem")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn connect_args() -> ConnectArgs {
        ConnectArgs {
            url: Some("https://db.example.run.app".to_string()),
            port: 3306,
            no_tls: false,
            insecure: false,
            token: None,
            token_file: None,
            metadata_identity: false,
        }
    }

    #[test]
    fn test_credential_precedence() {
        let audience = "https://db.example.run.app";

        let args = ConnectArgs {
            token: Some("abc".to_string()),
            token_file: Some(PathBuf::from("/tmp/token")),
            metadata_identity: true,
            ..connect_args()
        };
        let source = credential_source(&args, audience);
        assert!(format!("{:?}", source).starts_with("StaticToken"));

        let args = ConnectArgs {
            token_file: Some(PathBuf::from("/tmp/token")),
            metadata_identity: true,
            ..connect_args()
        };
        let source = credential_source(&args, audience);
        assert!(format!("{:?}", source).starts_with("TokenFile"));

        let args = ConnectArgs {
            metadata_identity: true,
            ..connect_args()
        };
        let source = credential_source(&args, audience);
        assert!(format!("{:?}", source).starts_with("MetadataIdentityToken"));

        let source = credential_source(&connect_args(), audience);
        assert!(format!("{:?}", source).starts_with("NoCredentials"));
    }

    #[test]
    fn test_token_flag_parses() {
        let cli = Cli::try_parse_from(["dbtunnel", "connect", "--token", "abc"]).unwrap();
        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        assert_eq!(args.token.as_deref(), Some("abc"));
    }
}
