use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "icloud-sync-rs",
    version,
    about = "Keep local copies of iCloud Drive and iCloud Photos in sync",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// YAML configuration file, re-read before every sync
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "ICLOUD_SYNC_CONFIG",
        default_value = "./config.yaml"
    )]
    pub config: PathBuf,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, global = true, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments for the default `sync` command
    #[command(flatten)]
    pub sync: SyncArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sync loop (default)
    Sync(SyncArgs),

    /// Print the resolved configuration and schedule, then exit
    CheckConfig,

    /// Save the account password in the OS keyring
    StorePassword,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Serve the remote from an exported directory tree
    /// (`drive/...`, `photos/<library>/<album>/...`)
    #[arg(long, env = "ICLOUD_SYNC_REMOTE_ROOT")]
    pub remote_root: Option<PathBuf>,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Report READY/STATUS/STOPPING to systemd
    #[arg(long)]
    pub notify_systemd: bool,
}

impl Cli {
    /// The subcommand to run; `sync` when none was given.
    pub fn effective_command(self) -> Command {
        match self.command {
            Some(command) => command,
            None => Command::Sync(self.sync),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("icloud-sync-rs").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_no_subcommand_defaults_to_sync() {
        let cli = parse(&["--no-progress-bar", "--remote-root", "/srv/export"]);
        match cli.effective_command() {
            Command::Sync(args) => {
                assert!(args.no_progress_bar);
                assert_eq!(args.remote_root, Some(PathBuf::from("/srv/export")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["check-config", "--config", "/etc/sync.yaml", "--log-level", "debug"]);
        assert_eq!(cli.config, PathBuf::from("/etc/sync.yaml"));
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(matches!(cli.effective_command(), Command::CheckConfig));
    }

    #[test]
    fn test_explicit_sync_subcommand() {
        let cli = parse(&["sync", "--notify-systemd"]);
        match cli.effective_command() {
            Command::Sync(args) => assert!(args.notify_systemd),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
