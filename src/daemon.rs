//! The sync loop.
//!
//! One task drives everything: reload the config, ask the scheduler what is
//! due, sleep until then, make sure there is a session, sync one resource,
//! hand the result to the notifier. Downloads fan out inside a sync, never
//! across resources.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::credential::CredentialSource;
use crate::auth::error::AuthError;
use crate::auth::{AuthMachine, AuthStep};
use crate::config::{Config, ConfigError};
use crate::notify::{AuthAlert, Notifier};
use crate::remote::{RemoteService, RemoteSession};
use crate::retry::RetryConfig;
use crate::scheduler::Scheduler;
use crate::stats::{format_duration, CycleStats, ErrorClass, ItemError, SyncSummary};
use crate::sync::{drive::sync_drive, photos::sync_photos, SyncContext, SyncError};
use crate::systemd::SystemdNotifier;
use crate::types::Resource;

/// Consecutive session expirations tolerated for one resource before the
/// cycle is written off.
const MAX_REAUTH_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Giving up on login: {0}")]
    Auth(#[from] AuthError),
}

pub struct Daemon {
    config_path: PathBuf,
    remote: Arc<dyn RemoteService>,
    credentials: CredentialSource,
    notifier: Arc<dyn Notifier>,
    systemd: SystemdNotifier,
    retry: RetryConfig,
    no_progress_bar: bool,
}

impl Daemon {
    pub fn new(
        config_path: impl Into<PathBuf>,
        remote: Arc<dyn RemoteService>,
        credentials: CredentialSource,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            remote,
            credentials,
            notifier,
            systemd: SystemdNotifier::new(false),
            retry: RetryConfig::default(),
            no_progress_bar: false,
        }
    }

    pub fn notify_systemd(mut self, enabled: bool) -> Self {
        self.systemd = SystemdNotifier::new(enabled);
        self
    }

    pub fn no_progress_bar(mut self, disabled: bool) -> Self {
        self.no_progress_bar = disabled;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run until every oneshot resource has synced, the shutdown token
    /// fires, or login gives up for good.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let mut config = Config::load(&self.config_path)?;
        if !config.has_resources() {
            tracing::warn!(
                config = %self.config_path.display(),
                "Nothing to sync: neither drive nor photos is configured"
            );
            return Ok(());
        }

        let mut scheduler = Scheduler::new(config.drive_interval(), config.photos_interval());
        let mut auth = AuthMachine::new(config.retry_policy());
        let mut expirations: HashMap<Resource, u32> = HashMap::new();
        let mut first = true;

        tracing::info!(
            drive = config.drive.is_some(),
            photos = config.photos.is_some(),
            root = %config.app.root.display(),
            "Starting sync loop"
        );
        self.systemd.ready();

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, exiting...");
                break;
            }

            if !first {
                config = self.reload(config);
                scheduler.reconfigure(config.drive_interval(), config.photos_interval());
                auth.set_policy(config.retry_policy(), Instant::now());
            }
            first = false;

            let Some(plan) = scheduler.next() else {
                if config.has_resources() {
                    tracing::info!("All oneshot syncs done, exiting");
                } else {
                    tracing::warn!("No resource left in the configuration, exiting");
                }
                break;
            };

            if !plan.sleep.is_zero() {
                tracing::info!(
                    "Next: {} sync in {}",
                    plan.resource,
                    format_duration(plan.sleep)
                );
                self.systemd.waiting(plan.resource, plan.sleep);
                if !pause(plan.sleep, &shutdown).await {
                    break;
                }
            }
            scheduler.advance(plan.sleep);

            let session = match auth
                .ensure_session(
                    self.remote.as_ref(),
                    &self.credentials,
                    config.app.username.as_deref(),
                    config.app.region,
                    Instant::now(),
                )
                .await
            {
                AuthStep::Ready(session) => session,
                AuthStep::Retry { after, alert } => {
                    self.alert(alert).await;
                    self.systemd.status("Waiting for login");
                    if !pause(after, &shutdown).await {
                        break;
                    }
                    scheduler.advance(after);
                    continue;
                }
                AuthStep::Exhausted { error, alert } => {
                    self.alert(alert).await;
                    self.systemd.stopping();
                    return Err(error.into());
                }
            };

            let resource = plan.resource;
            self.systemd.syncing(resource);
            let started = Instant::now();
            let result = self.sync_resource(resource, &config, session.as_ref()).await;
            scheduler.advance(started.elapsed());

            let stats = match result {
                Ok(stats) => {
                    expirations.remove(&resource);
                    stats
                }
                Err(SyncError::SessionExpired { auth_errors, .. }) => {
                    auth.invalidate();
                    let attempts = expirations.entry(resource).or_insert(0);
                    *attempts += 1;
                    if *attempts < MAX_REAUTH_ATTEMPTS {
                        tracing::warn!(
                            %resource,
                            "Session expired ({} auth errors), attempting re-auth ({}/{})",
                            auth_errors,
                            attempts,
                            MAX_REAUTH_ATTEMPTS
                        );
                        continue;
                    }
                    tracing::error!(
                        %resource,
                        "Session expired {} times in a row, giving up on this cycle",
                        MAX_REAUTH_ATTEMPTS
                    );
                    expirations.remove(&resource);
                    failed_cycle(resource, ErrorClass::Authentication, "session expired")
                }
                Err(e @ SyncError::Destination { .. }) => {
                    tracing::error!(%resource, error = %e, "Sync aborted");
                    failed_cycle(resource, ErrorClass::Filesystem, e)
                }
            };

            scheduler.complete(resource);
            stats.log_summary();
            let summary = SyncSummary {
                should_notify: config.app.summary.should_notify(&stats),
                next_drive_in: scheduler.remaining(Resource::Drive),
                next_photos_in: scheduler.remaining(Resource::Photos),
                stats,
            };
            self.notifier.send_summary(&summary).await;
        }

        self.systemd.stopping();
        Ok(())
    }

    /// Re-read the config file. An unreadable file keeps the last good one.
    fn reload(&self, current: Config) -> Config {
        match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Cannot reload configuration, keeping the previous one");
                current
            }
        }
    }

    async fn sync_resource(
        &self,
        resource: Resource,
        config: &Config,
        session: &dyn RemoteSession,
    ) -> Result<CycleStats, SyncError> {
        let ctx = SyncContext {
            root: config.app.root.clone(),
            max_workers: config.app.max_threads,
            retry: self.retry,
            no_progress_bar: self.no_progress_bar,
        };
        match (resource, &config.drive, &config.photos) {
            (Resource::Drive, Some(drive), _) => sync_drive(&ctx, session, drive).await,
            (Resource::Photos, _, Some(photos)) => sync_photos(&ctx, session, photos).await,
            _ => Ok(CycleStats::new(resource)),
        }
    }

    async fn alert(&self, alert: Option<AuthAlert>) {
        if let Some(alert) = alert {
            self.notifier.send_alert(&alert).await;
        }
    }
}

/// Sleep unless shutdown comes first. Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown during wait, exiting...");
            false
        }
    }
}

fn failed_cycle(resource: Resource, class: ErrorClass, reason: impl ToString) -> CycleStats {
    let mut stats = CycleStats::new(resource);
    stats.listing_complete = false;
    stats.record_error(ItemError::new(resource.to_string(), class, reason));
    stats
}
