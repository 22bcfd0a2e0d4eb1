//! easy-dotnet service binary.
//!
//! Loads `~/.easy-dotnet/config.toml`, binds the JSON-RPC endpoint on
//! loopback, prints the bound port on stdout and serves until interrupted.
//!
//! ```text
//! main() -> ServiceConfig::load -> init_tracing -> Services::new
//!        -> EndpointServer::bind -> serve(token) <- ctrl-c
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use easy_dotnet_config::{ServiceConfig, SettingsStore, config_path, log_dir, settings_path};
use easy_dotnet_engine::{EndpointServer, MsBuildPropertiesProvider, Services};
use easy_dotnet_utils::TokioProcessLauncher;

#[derive(Parser, Debug)]
#[command(name = "easy-dotnet", version, about = "Test and debug service for .NET projects")]
struct Args {
    /// Address to listen on. Overrides `server.host`.
    #[arg(long)]
    host: Option<IpAddr>,
    /// Port to listen on, 0 for any. Overrides `server.port`.
    #[arg(long)]
    port: Option<u16>,
    /// Config file to load instead of `~/.easy-dotnet/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log filter used when `RUST_LOG` is unset. Overrides `logging.level`.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries the port handshake; no log file means no logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    vec![
        log_dir().join("easy-dotnet.log"),
        // Fallback for environments without a writable home.
        PathBuf::from(".easy-dotnet").join("logs").join("easy-dotnet.log"),
    ]
}

/// Config from `path` (or the default location). Read before logging is up,
/// so problems come back as a message for later.
fn load_config(path: Option<&PathBuf>) -> (ServiceConfig, Option<String>) {
    let loaded = match path {
        Some(path) => ServiceConfig::load_from(path),
        None => ServiceConfig::load(),
    };
    match loaded {
        Ok(Some(config)) => (config, None),
        Ok(None) => (ServiceConfig::default(), None),
        Err(e) => (
            ServiceConfig::default(),
            Some(format!("{e} ({}); using defaults", e.path().display())),
        ),
    }
}

fn listen_addr(args: &Args, config: &ServiceConfig) -> Result<SocketAddr> {
    let host = match args.host {
        Some(host) => host,
        None => config
            .server
            .host
            .parse()
            .with_context(|| format!("invalid server.host {:?}", config.server.host))?,
    };
    Ok(SocketAddr::new(host, args.port.unwrap_or(config.server.port)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_warning) = load_config(args.config.as_ref());
    let level = args.log_level.as_deref().or(config.logging.level.as_deref());
    init_tracing(level);
    match config_warning {
        Some(warning) => tracing::warn!("{warning}"),
        None => tracing::debug!(
            path = %args.config.clone().unwrap_or_else(config_path).display(),
            "Configuration ready"
        ),
    }

    let launcher = Arc::new(TokioProcessLauncher);
    let properties = Arc::new(MsBuildPropertiesProvider::new(
        launcher.clone(),
        config.msbuild.dotnet.clone(),
    ));
    let settings = SettingsStore::open_or_default(settings_path());
    let services = Arc::new(Services::new(&config, launcher, properties, settings));

    let server = EndpointServer::bind(listen_addr(&args, &config)?, services.clone()).await?;
    let addr = server.local_addr().context("failed to read bound address")?;
    tracing::info!(%addr, "easy-dotnet listening");
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", addr.port())?;
        stdout.flush()?;
    }

    let token = CancellationToken::new();
    let serve = tokio::spawn(server.serve(token.clone()));
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    token.cancel();
    services.shutdown().await;
    serve.await.context("endpoint server panicked")??;
    Ok(())
}
