//! harvestd - GitHub artifact mirroring daemon.
//!
//! Main entry point for the daemon binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{bail, WrapErr};
use harvest_core::Config;
use harvestd::Daemon;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "harvestd",
    version,
    about = "Listens to github events and mirrors artifacts, packages and releases"
)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, env = "HARVESTD_CONFIG")]
    config: Option<PathBuf>,

    /// host:port for the server to listen on.
    #[arg(long, env = "HARVESTD_SERVER_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// Logging level.
    #[arg(long, env = "HARVESTD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Logging mode (dev or prod).
    #[arg(long, env = "HARVESTD_LOG_MODE")]
    log_mode: Option<String>,

    /// Path to a .pem file with the private key of the github app.
    #[arg(long, env = "HARVESTD_GITHUB_PRIVATE_KEY_PATH")]
    github_private_key_path: Option<PathBuf>,

    /// Path to a file with the secret token for the github webhook.
    #[arg(long, env = "HARVESTD_GITHUB_WEBHOOK_SECRET_PATH")]
    github_webhook_secret_path: Option<PathBuf>,
}

fn load_config(args: &Args) -> eyre::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(listen_address) = &args.listen_address {
        config.server.listen_address.clone_from(listen_address);
    }
    if let Some(level) = &args.log_level {
        config.log.level.clone_from(level);
    }
    if let Some(mode) = &args.log_mode {
        config.log.mode.clone_from(mode);
    }

    if let Some(path) = &args.github_private_key_path {
        if !config.github.app.private_key.is_empty() {
            bail!("cannot specify both a github private key and a private key path");
        }
        config.github.app.private_key = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    }
    if let Some(path) = &args.github_webhook_secret_path {
        if !config.github.webhook_secret.is_empty() {
            bail!("cannot specify both a github webhook secret and a webhook secret path");
        }
        config.github.webhook_secret = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?
            .trim()
            .to_string();
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    if config.log.mode == "dev" {
        fmt().with_env_filter(filter).init();
    } else {
        fmt().json().with_env_filter(filter).init();
    }
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Arc::new(Daemon::new(config)?);
        let cancel = CancellationToken::new();

        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(signal) => signal,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("received interrupt");
            }
            signal_cancel.cancel();
        });

        daemon.run(cancel).await
    })
}
