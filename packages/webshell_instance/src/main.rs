use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;
use webshell_instance::config::{self, FileConfig};
use webshell_instance::identity;
use webshell_instance::{ConnectionManager, DataEncoding, PtySpawner};

#[derive(Parser, Debug)]
#[command(name = "webshell")]
#[command(about = "Expose interactive shells on this host through a routing server")]
struct Cli {
    /// Router WebSocket URL
    #[arg(long)]
    url: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Extra handshake header, `Name: value` (repeatable)
    #[arg(long = "header", value_name = "KEY:VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Where the instance identity is stored
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Delay between failed connection attempts, in milliseconds
    #[arg(long)]
    backoff_ms: Option<u64>,

    /// Shell to spawn for each session (defaults to $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// How outbound terminal bytes are carried
    #[arg(long, value_enum)]
    encoding: Option<DataEncoding>,

    /// Config file (defaults to ~/.config/instance/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Parse `Name: value`, trimming around the colon.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected KEY:VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl Cli {
    /// CLI flags win over file and env config.
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(url) = &self.url {
            fc.connection.url = url.clone();
        }
        if self.insecure {
            fc.connection.insecure = true;
        }
        for (name, value) in &self.headers {
            fc.connection.headers.insert(name.clone(), value.clone());
        }
        if let Some(path) = &self.identity_file {
            fc.identity_file = Some(path.clone());
        }
        if let Some(backoff_ms) = self.backoff_ms {
            fc.connection.backoff_ms = backoff_ms;
        }
        if let Some(shell) = &self.shell {
            fc.session.shell = Some(shell.clone());
        }
        if let Some(encoding) = self.encoding {
            fc.session.encoding = encoding;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "webshell_instance=debug,webshell=debug,pty_manager=debug,info"
    } else {
        "webshell_instance=info,webshell=info,pty_manager=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    // Errors only if another provider was installed first, which is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let mut fc: FileConfig = config::load_config(config_path.as_deref())
        .extract()
        .context("invalid configuration")?;
    cli.apply(&mut fc);

    let identity_path = match &fc.identity_file {
        Some(path) => path.clone(),
        None => identity::default_identity_path()?,
    };
    let identity = identity::load_or_generate(&identity_path)?;

    info!(
        url = %fc.connection.url,
        identity = %identity,
        encoding = ?fc.session.encoding,
        "starting webshell instance"
    );

    let spawner = Arc::new(PtySpawner::new(fc.session.pty_config()));
    let manager = ConnectionManager::connect(
        &fc.connection.url,
        &fc.connection.header_pairs(),
        &fc.connection.dialer_config(),
        fc.manager_settings(identity),
        spawner,
    )
    .context("failed to set up connection")?;

    shutdown_signal().await?;
    info!("received shutdown signal, closing sessions");
    manager.close().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to install Ctrl+C handler"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")
}
