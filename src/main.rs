//! icloud-sync-rs: keeps local mirrors of iCloud Drive and iCloud Photos.
//!
//! A single loop alternates between the two resources on independent
//! timers. Each sync lists the remote, filters it, downloads what is new or
//! changed with a bounded worker pool and, if enabled, prunes local files the
//! remote no longer has. Photos that appear in several albums can be stored
//! once and hard-linked everywhere else.

#![warn(clippy::all)]

mod auth;
mod cleanup;
mod cli;
mod config;
mod daemon;
mod download;
mod filter;
mod freshness;
mod hardlink;
mod notify;
mod remote;
pub mod retry;
mod scheduler;
mod shutdown;
mod state;
mod stats;
mod sync;
mod systemd;
mod types;
mod unicode;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use auth::credential::{CredentialSource, KeyringStore, SecretStore, ENV_PASSWORD};
use cli::{Command, SyncArgs};

async fn run_sync(config_path: &Path, args: SyncArgs) -> anyhow::Result<()> {
    let Some(remote_root) = args.remote_root else {
        anyhow::bail!(
            "No remote backend configured: pass --remote-root <DIR> or set ICLOUD_SYNC_REMOTE_ROOT"
        );
    };
    tracing::info!(
        config = %config_path.display(),
        remote = %remote_root.display(),
        "Starting icloud-sync-rs"
    );

    let remote = Arc::new(remote::LocalRemote::new(remote_root));
    let credentials = CredentialSource::from_env(Arc::new(KeyringStore::new()));
    let shutdown_token = shutdown::install_signal_handler();

    daemon::Daemon::new(
        config_path,
        remote,
        credentials,
        Arc::new(notify::LogNotifier),
    )
    .notify_systemd(args.notify_systemd)
    .no_progress_bar(args.no_progress_bar)
    .run(shutdown_token)
    .await?;

    Ok(())
}

fn run_check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = config::Config::load(config_path)?;
    println!("Configuration: {}", config_path.display());
    print!("{config}");
    if !config.has_resources() {
        anyhow::bail!("Nothing to sync: neither drive nor photos is configured");
    }
    Ok(())
}

fn run_store_password(config_path: &Path) -> anyhow::Result<()> {
    let config = config::Config::load(config_path)?;
    let username = config
        .app
        .username
        .context("app.credentials.username is not set")?;

    let password = match std::env::var(ENV_PASSWORD) {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password(format!("iCloud password for {username}: "))
            .context("Failed to read password")?,
    };
    if password.is_empty() {
        anyhow::bail!("Empty password, nothing stored");
    }

    KeyringStore::new().set(&username, &password)?;
    println!("Password for {username} saved to the system keyring");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config_path = cli.config.clone();
    match cli.effective_command() {
        Command::Sync(args) => run_sync(&config_path, args).await,
        Command::CheckConfig => run_check_config(&config_path),
        Command::StorePassword => run_store_password(&config_path),
    }
}
