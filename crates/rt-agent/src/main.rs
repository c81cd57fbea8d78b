//! rtunnel agent daemon
//!
//! Runs next to a private service and keeps it reachable through a public
//! relay: an outbound SSH session asks the relay to forward a public port
//! back to this machine, and the session is re-established whenever it
//! drops.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rt_agent::ReconnectSupervisor;
use rt_core::config::{self, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "rt-agent")]
#[command(about = "rtunnel agent - exposes a local service through an SSH reverse tunnel")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Public relay to SSH into
    #[arg(long, env = "PUBLIC_VPS_IP")]
    relay_host: Option<String>,

    /// SSH port on the relay
    #[arg(long, env = "SSH_SERVER_PORT")]
    ssh_port: Option<u16>,

    /// Login on the relay
    #[arg(short, long, env = "SSH_USER")]
    user: Option<String>,

    /// Password authentication
    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key for public key authentication (`~` is expanded)
    #[arg(short, long, env = "SSH_PRIVATE_KEY_PATH")]
    key: Option<PathBuf>,

    /// Passphrase of the private key
    #[arg(long, env = "SSH_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Port the relay exposes publicly
    #[arg(long, env = "PUBLIC_PORT")]
    public_port: Option<u16>,

    /// Address the relay binds the public port on ("" for all interfaces)
    #[arg(long)]
    bind_address: Option<String>,

    /// Local service port the tunnel forwards into
    #[arg(long, env = "PRIVATE_SERVER_PORT")]
    local_port: Option<u16>,

    /// Used as the local service port when no other is given
    #[arg(long, env = "PORT", hide = true)]
    fallback_port: Option<u16>,

    /// Local service host
    #[arg(long)]
    local_host: Option<String>,

    /// Seconds between reconnect attempts
    #[arg(long, env = "RECONNECT_DELAY_SECS")]
    reconnect_delay: Option<u64>,

    /// Seconds between SSH keepalives
    #[arg(long, env = "SSH_KEEPALIVE_SECS")]
    keepalive: Option<u64>,

    /// Expected relay host key fingerprint
    #[arg(long, env = "RELAY_HOST_KEY")]
    relay_host_key: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("rtunnel agent starting...");

    let config = build_config(&args)?;
    tracing::info!(
        "Relay {} as '{}', public port {} -> {}",
        config.relay_address(),
        config.ssh_user,
        config.public_port,
        config.local_target()
    );

    let supervisor =
        ReconnectSupervisor::from_config(config).context("Invalid tunnel configuration")?;

    supervisor
        .start()
        .await
        .context("Tunnel could not authenticate with the relay")?;

    if let Err(e) = shutdown_signal().await {
        tracing::error!("Signal handling failed: {}", e);
    }

    supervisor.stop().await;

    let metrics = supervisor.tunnel_state().metrics().snapshot();
    tracing::info!(
        "Shutdown complete: {} session(s), {} connect failure(s), \
         {} bridge(s) opened, {} rejected, {} bytes in, {} bytes out",
        metrics.sessions_established,
        metrics.connect_failures,
        metrics.bridges_opened,
        metrics.bridges_rejected,
        metrics.bytes_relay_to_local,
        metrics.bytes_local_to_relay
    );

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

/// Configuration file first, then environment and command line on top
fn build_config(args: &Args) -> Result<TunnelConfig> {
    let mut config = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let path = config::default_config_path();
            if path.exists() {
                config::load_config(&path)
                    .with_context(|| format!("Failed to load config from {:?}", path))?
            } else {
                TunnelConfig::default()
            }
        }
    };

    if let Some(host) = &args.relay_host {
        config.relay_host = host.clone();
    }
    if let Some(port) = args.ssh_port {
        config.relay_ssh_port = port;
    }
    if let Some(user) = &args.user {
        config.ssh_user = user.clone();
    }
    if let Some(password) = &args.password {
        config.auth.password = Some(password.clone());
    }
    if let Some(key) = &args.key {
        config.auth.private_key_path = Some(key.clone());
    }
    if let Some(passphrase) = &args.passphrase {
        config.auth.passphrase = Some(passphrase.clone());
    }
    if let Some(port) = args.public_port {
        config.public_port = port;
    }
    if let Some(bind) = &args.bind_address {
        config.bind_address = bind.clone();
    }
    if let Some(port) = args.local_port.or(args.fallback_port) {
        config.local_target_port = port;
    }
    if let Some(host) = &args.local_host {
        config.local_target_host = host.clone();
    }
    if let Some(secs) = args.reconnect_delay {
        config.reconnect_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = args.keepalive {
        config.keepalive_interval = Duration::from_secs(secs);
    }
    if let Some(fingerprint) = &args.relay_host_key {
        config.relay_host_key = Some(fingerprint.clone());
    }

    config.validate().context("Invalid tunnel configuration")?;
    Ok(config)
}
