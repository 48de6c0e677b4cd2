//! sd_notify integration for running under a systemd `Type=notify` unit.
//!
//! Everything is a no-op when disabled or off Linux, so callers never need
//! `#[cfg]` of their own.

use std::time::Duration;

use crate::stats::format_duration;
use crate::types::Resource;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub(crate) fn ready(&self) {
        self.send(State::Ready);
    }

    pub(crate) fn stopping(&self) {
        self.send(State::Stopping);
    }

    pub(crate) fn syncing(&self, resource: Resource) {
        self.send(State::Status(&format!("Syncing {resource}")));
    }

    pub(crate) fn waiting(&self, resource: Resource, sleep: Duration) {
        self.send(State::Status(&format!(
            "Next: {resource} in {}",
            format_duration(sleep)
        )));
    }

    pub(crate) fn status(&self, msg: &str) {
        self.send(State::Status(msg));
    }

    fn send(&self, state: State<'_>) {
        if !self.enabled {
            return;
        }
        send_impl(state);
    }
}

#[derive(Debug)]
enum State<'a> {
    Ready,
    Stopping,
    Status(&'a str),
}

#[cfg(target_os = "linux")]
fn send_impl(state: State<'_>) {
    let notify_state = match &state {
        State::Ready => sd_notify::NotifyState::Ready,
        State::Stopping => sd_notify::NotifyState::Stopping,
        State::Status(msg) => sd_notify::NotifyState::Status(msg),
    };
    if let Err(e) = sd_notify::notify(false, &[notify_state]) {
        tracing::debug!(error = %e, ?state, "sd_notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn send_impl(_state: State<'_>) {}
