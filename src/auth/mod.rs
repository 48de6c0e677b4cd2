//! Authentication state machine.
//!
//! The machine is driven by the sync loop: every time the loop needs a
//! session it calls [`AuthMachine::ensure_session`] with the current time.
//! The machine either hands out the cached session, tries to log in, or
//! reports how long to wait before the next attempt. It never sleeps on its
//! own, so tests can drive it with a simulated clock.
//!
//! ```text
//! Unauthenticated ──ok──────────────► Authenticated
//!        │                                  │ invalidate()
//!        ├─challenge─► SecondFactorRequired │
//!        │                 │ retry          ▼
//!        └─error─► Failed ◄┴──────── Unauthenticated
//! ```

pub mod credential;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use self::credential::CredentialSource;
use self::error::AuthError;
use crate::notify::AuthAlert;
use crate::remote::{Credential, LoginOutcome, RemoteError, RemoteService, RemoteSession};
use crate::types::Region;

/// How failed logins are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Every(Duration),
    /// One immediate re-attempt, then give up.
    Once,
}

impl RetryPolicy {
    /// Negative values select [`RetryPolicy::Once`].
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            RetryPolicy::Once
        } else {
            RetryPolicy::Every(Duration::from_secs(secs.unsigned_abs()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoCredential,
    Rejected(String),
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    SecondFactorRequired,
    Failed(FailureReason),
}

pub enum AuthStep {
    Ready(Arc<dyn RemoteSession>),
    /// Not authenticated yet; ask again after `after`.
    Retry {
        after: Duration,
        alert: Option<AuthAlert>,
    },
    /// The retry budget is spent.
    Exhausted {
        error: AuthError,
        alert: Option<AuthAlert>,
    },
}

impl std::fmt::Debug for AuthStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStep::Ready(_) => f.write_str("Ready"),
            AuthStep::Retry { after, alert } => f
                .debug_struct("Retry")
                .field("after", after)
                .field("alert", alert)
                .finish(),
            AuthStep::Exhausted { error, alert } => f
                .debug_struct("Exhausted")
                .field("error", error)
                .field("alert", alert)
                .finish(),
        }
    }
}

pub struct AuthMachine {
    state: AuthState,
    session: Option<Arc<dyn RemoteSession>>,
    policy: RetryPolicy,
    next_attempt_at: Option<Instant>,
    retried_once: bool,
    /// The alerting state of the current episode. Only a successful login
    /// ends the episode, so transient errors in between do not re-alert.
    alerted: Option<AuthState>,
}

impl AuthMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: AuthState::Unauthenticated,
            session: None,
            policy,
            next_attempt_at: None,
            retried_once: false,
            alerted: None,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Picks up a new retry interval from a reloaded config. A pending
    /// wait is shortened if the new interval ends sooner.
    pub fn set_policy(&mut self, policy: RetryPolicy, now: Instant) {
        if policy == self.policy {
            return;
        }
        self.policy = policy;
        if let (RetryPolicy::Every(d), Some(at)) = (policy, self.next_attempt_at) {
            self.next_attempt_at = Some(at.min(now + d));
        }
    }

    /// Forget the cached session after the remote reported it expired.
    pub fn invalidate(&mut self) {
        if self.session.take().is_some() {
            tracing::info!("Session expired, will log in again");
        }
        self.state = AuthState::Unauthenticated;
        self.next_attempt_at = None;
    }

    pub async fn ensure_session(
        &mut self,
        remote: &dyn RemoteService,
        credentials: &CredentialSource,
        username: Option<&str>,
        region: Region,
        now: Instant,
    ) -> AuthStep {
        if let (AuthState::Authenticated, Some(session)) = (&self.state, &self.session) {
            return AuthStep::Ready(Arc::clone(session));
        }
        if let Some(at) = self.next_attempt_at {
            if at > now {
                return AuthStep::Retry {
                    after: at - now,
                    alert: None,
                };
            }
        }

        let username = username.unwrap_or_default();
        let (state, error) = match self.attempt(remote, credentials, username, region).await {
            Ok(session) => {
                tracing::info!(username, "Logged in");
                self.state = AuthState::Authenticated;
                self.session = Some(Arc::clone(&session));
                self.next_attempt_at = None;
                self.retried_once = false;
                self.alerted = None;
                return AuthStep::Ready(session);
            }
            Err(failure) => failure,
        };
        self.fail(state, error, username, now)
    }

    async fn attempt(
        &self,
        remote: &dyn RemoteService,
        credentials: &CredentialSource,
        username: &str,
        region: Region,
    ) -> Result<Arc<dyn RemoteSession>, (AuthState, AuthError)> {
        let no_credential = || {
            (
                AuthState::Failed(FailureReason::NoCredential),
                AuthError::NoCredential(username.to_string()),
            )
        };
        if username.is_empty() {
            return Err(no_credential());
        }
        let password = match credentials.password(username) {
            Ok(Some(p)) => p,
            Ok(None) => return Err(no_credential()),
            Err(e) => {
                return Err((
                    AuthState::Failed(FailureReason::Unavailable(e.to_string())),
                    e,
                ))
            }
        };

        let credential = Credential {
            username: username.to_string(),
            password,
            region,
        };
        tracing::debug!(username, region = region.as_str(), "Authenticating");
        match remote.authenticate(&credential).await {
            Ok(LoginOutcome::Session(session)) => Ok(session),
            Ok(LoginOutcome::SecondFactorRequired) => Err((
                AuthState::SecondFactorRequired,
                AuthError::SecondFactorPending(username.to_string()),
            )),
            Err(RemoteError::Rejected(msg)) => Err((
                AuthState::Failed(FailureReason::Rejected(msg.clone())),
                AuthError::Rejected(msg),
            )),
            Err(e) => Err((
                AuthState::Failed(FailureReason::Unavailable(e.to_string())),
                e.into(),
            )),
        }
    }

    fn fail(&mut self, state: AuthState, error: AuthError, username: &str, now: Instant) -> AuthStep {
        let alert = match state {
            AuthState::SecondFactorRequired => Some(AuthAlert::SecondFactorRequired {
                username: username.to_string(),
            }),
            AuthState::Failed(FailureReason::NoCredential) => Some(AuthAlert::NoCredential {
                username: username.to_string(),
            }),
            _ => None,
        };
        let alert = alert.filter(|_| self.alerted.as_ref() != Some(&state));
        if alert.is_some() {
            self.alerted = Some(state.clone());
        }
        self.state = state;
        self.session = None;

        match self.policy {
            RetryPolicy::Every(interval) => {
                tracing::warn!(
                    error = %error,
                    retry_in_secs = interval.as_secs(),
                    "Login did not complete"
                );
                self.next_attempt_at = Some(now + interval);
                AuthStep::Retry {
                    after: interval,
                    alert,
                }
            }
            RetryPolicy::Once if !self.retried_once => {
                tracing::warn!(error = %error, "Login did not complete, trying once more");
                self.retried_once = true;
                self.next_attempt_at = None;
                AuthStep::Retry {
                    after: Duration::ZERO,
                    alert,
                }
            }
            RetryPolicy::Once => AuthStep::Exhausted { error, alert },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::credential::testing::MemoryStore;
    use super::*;
    use crate::remote::Scope;
    use crate::types::SizeVariant;
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct NullSession;

    #[async_trait]
    impl RemoteSession for NullSession {
        fn list_items(&self, _: &Scope) -> BoxStream<'_, Result<crate::remote::RemoteItem, RemoteError>> {
            Box::pin(futures_util::stream::empty())
        }
        async fn list_libraries(&self) -> Result<Vec<String>, RemoteError> {
            Ok(vec![])
        }
        async fn list_albums(&self, _: &str) -> Result<Vec<String>, RemoteError> {
            Ok(vec![])
        }
        async fn download(
            &self,
            item: &crate::remote::RemoteItem,
            _: SizeVariant,
        ) -> Result<crate::remote::ByteStream, RemoteError> {
            Err(RemoteError::NotFound(item.name.clone()))
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Ok,
        Challenge,
        Reject,
        Down,
    }

    /// Replays scripted login outcomes; repeats the last one when exhausted.
    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: &[Reply]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().copied().collect()),
                calls: AtomicU32::new(0),
            }
        }
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteService for Scripted {
        async fn authenticate(&self, _: &Credential) -> Result<LoginOutcome, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = {
                let mut q = self.replies.lock().unwrap();
                if q.len() > 1 {
                    q.pop_front().unwrap()
                } else {
                    *q.front().unwrap()
                }
            };
            match reply {
                Reply::Ok => Ok(LoginOutcome::Session(Arc::new(NullSession))),
                Reply::Challenge => Ok(LoginOutcome::SecondFactorRequired),
                Reply::Reject => Err(RemoteError::Rejected("bad password".into())),
                Reply::Down => Err(RemoteError::Connection("connection reset".into())),
            }
        }
    }

    fn creds() -> CredentialSource {
        CredentialSource::new(None, Arc::new(MemoryStore::with("me", "pw")))
    }

    async fn step(m: &mut AuthMachine, remote: &Scripted, now: Instant) -> AuthStep {
        m.ensure_session(remote, &creds(), Some("me"), Region::Global, now)
            .await
    }

    #[test]
    fn test_retry_policy_from_secs() {
        assert_eq!(RetryPolicy::from_secs(-1), RetryPolicy::Once);
        assert_eq!(
            RetryPolicy::from_secs(600),
            RetryPolicy::Every(Duration::from_secs(600))
        );
    }

    #[tokio::test]
    async fn test_login_success_caches_session() {
        let remote = Scripted::new(&[Reply::Ok]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(600));
        let now = Instant::now();
        assert!(matches!(step(&mut m, &remote, now).await, AuthStep::Ready(_)));
        assert!(matches!(step(&mut m, &remote, now).await, AuthStep::Ready(_)));
        assert_eq!(remote.calls(), 1);
        assert_eq!(m.state(), &AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_second_factor_waits_full_interval_and_alerts_once() {
        let remote = Scripted::new(&[Reply::Challenge]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(600));
        let t0 = Instant::now();

        match step(&mut m, &remote, t0).await {
            AuthStep::Retry { after, alert } => {
                assert_eq!(after, Duration::from_secs(600));
                assert!(matches!(alert, Some(AuthAlert::SecondFactorRequired { .. })));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.state(), &AuthState::SecondFactorRequired);

        match step(&mut m, &remote, t0 + Duration::from_secs(599)).await {
            AuthStep::Retry { after, alert } => {
                assert_eq!(after, Duration::from_secs(1));
                assert!(alert.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(remote.calls(), 1);

        for k in 1..=3u64 {
            match step(&mut m, &remote, t0 + Duration::from_secs(600 * k)).await {
                AuthStep::Retry { alert, .. } => assert!(alert.is_none()),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(remote.calls(), 4);
    }

    #[tokio::test]
    async fn test_new_challenge_episode_alerts_again() {
        let remote = Scripted::new(&[Reply::Challenge, Reply::Ok, Reply::Challenge]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(10));
        let t0 = Instant::now();
        let alerts = |s: AuthStep| match s {
            AuthStep::Retry { alert, .. } => alert.is_some(),
            _ => false,
        };

        assert!(alerts(step(&mut m, &remote, t0).await));
        assert!(matches!(
            step(&mut m, &remote, t0 + Duration::from_secs(10)).await,
            AuthStep::Ready(_)
        ));
        m.invalidate();
        assert!(alerts(step(&mut m, &remote, t0 + Duration::from_secs(11)).await));
    }

    #[tokio::test]
    async fn test_transient_error_inside_challenge_does_not_realert() {
        let remote = Scripted::new(&[Reply::Challenge, Reply::Down, Reply::Challenge]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(600));
        let t0 = Instant::now();

        let mut alerts = 0;
        for k in 0..3u64 {
            match step(&mut m, &remote, t0 + Duration::from_secs(600 * k)).await {
                AuthStep::Retry { alert, .. } => alerts += usize::from(alert.is_some()),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(remote.calls(), 3);
        assert_eq!(alerts, 1);
        assert_eq!(m.state(), &AuthState::SecondFactorRequired);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_with_alert() {
        let remote = Scripted::new(&[Reply::Ok]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(60));
        let source = CredentialSource::new(None, Arc::new(MemoryStore::default()));
        let out = m
            .ensure_session(&remote, &source, Some("nobody"), Region::Global, Instant::now())
            .await;
        assert!(matches!(
            out,
            AuthStep::Retry {
                alert: Some(AuthAlert::NoCredential { .. }),
                ..
            }
        ));
        assert_eq!(m.state(), &AuthState::Failed(FailureReason::NoCredential));
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_once_policy_retries_once_then_exhausts() {
        let remote = Scripted::new(&[Reply::Reject]);
        let mut m = AuthMachine::new(RetryPolicy::Once);
        let now = Instant::now();
        assert!(matches!(
            step(&mut m, &remote, now).await,
            AuthStep::Retry { after, .. } if after == Duration::ZERO
        ));
        assert!(matches!(
            step(&mut m, &remote, now).await,
            AuthStep::Exhausted {
                error: AuthError::Rejected(_),
                ..
            }
        ));
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn test_once_policy_second_attempt_can_succeed() {
        let remote = Scripted::new(&[Reply::Challenge, Reply::Ok]);
        let mut m = AuthMachine::new(RetryPolicy::Once);
        let now = Instant::now();
        assert!(matches!(step(&mut m, &remote, now).await, AuthStep::Retry { .. }));
        assert!(matches!(step(&mut m, &remote, now).await, AuthStep::Ready(_)));
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_login() {
        let remote = Scripted::new(&[Reply::Ok]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(600));
        let now = Instant::now();
        step(&mut m, &remote, now).await;
        m.invalidate();
        assert_eq!(m.state(), &AuthState::Unauthenticated);
        assert!(matches!(step(&mut m, &remote, now).await, AuthStep::Ready(_)));
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn test_shorter_policy_pulls_next_attempt_forward() {
        let remote = Scripted::new(&[Reply::Challenge]);
        let mut m = AuthMachine::new(RetryPolicy::from_secs(600));
        let t0 = Instant::now();
        step(&mut m, &remote, t0).await;
        m.set_policy(RetryPolicy::from_secs(30), t0);
        match step(&mut m, &remote, t0 + Duration::from_secs(10)).await {
            AuthStep::Retry { after, .. } => assert_eq!(after, Duration::from_secs(20)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
