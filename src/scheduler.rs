//! Countdown timers for the two resources.
//!
//! The scheduler never sleeps; it tells the loop what to run next and how
//! long to wait first. The loop reports elapsed wall-clock time back through
//! [`Scheduler::advance`] and calls [`Scheduler::complete`] after a sync.

use std::time::Duration;

use crate::types::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Every(Duration),
    /// Sync exactly once, then never again.
    Once,
}

impl Interval {
    /// Negative values select [`Interval::Once`].
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            Interval::Once
        } else {
            Interval::Every(Duration::from_secs(secs.unsigned_abs()))
        }
    }

    fn initial(self) -> Duration {
        match self {
            Interval::Every(d) => d,
            Interval::Once => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub resource: Resource,
    pub sleep: Duration,
}

#[derive(Debug, Clone)]
struct Timer {
    interval: Interval,
    remaining: Duration,
    /// Oneshot timer that has already fired.
    done: bool,
}

impl Timer {
    fn new(interval: Interval) -> Self {
        Self {
            interval,
            remaining: interval.initial(),
            done: false,
        }
    }

    fn pending(&self) -> Option<Duration> {
        (!self.done).then_some(self.remaining)
    }

    fn retune(&mut self, interval: Interval) {
        if interval == self.interval {
            return;
        }
        match interval {
            Interval::Every(d) => {
                self.done = false;
                self.remaining = self.remaining.min(d);
                if self.interval == Interval::Once {
                    self.remaining = d;
                }
            }
            Interval::Once => {
                self.done = false;
                self.remaining = Duration::ZERO;
            }
        }
        self.interval = interval;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    drive: Option<Timer>,
    photos: Option<Timer>,
}

impl Scheduler {
    pub fn new(drive: Option<Interval>, photos: Option<Interval>) -> Self {
        Self {
            drive: drive.map(Timer::new),
            photos: photos.map(Timer::new),
        }
    }

    /// Apply intervals from a reloaded configuration. A newly configured
    /// resource starts a fresh timer; a shorter interval pulls the next sync
    /// forward; a dropped resource stops being scheduled.
    pub fn reconfigure(&mut self, drive: Option<Interval>, photos: Option<Interval>) {
        fn apply(slot: &mut Option<Timer>, interval: Option<Interval>, resource: Resource) {
            match (slot.as_mut(), interval) {
                (Some(timer), Some(interval)) => timer.retune(interval),
                (None, Some(interval)) => {
                    tracing::info!(%resource, "Resource enabled");
                    *slot = Some(Timer::new(interval));
                }
                (Some(_), None) => {
                    tracing::info!(%resource, "Resource disabled");
                    *slot = None;
                }
                (None, None) => {}
            }
        }
        apply(&mut self.drive, drive, Resource::Drive);
        apply(&mut self.photos, photos, Resource::Photos);
    }

    /// The resource whose timer runs out first. Drive wins ties.
    /// `None` once nothing is left to schedule.
    pub fn next(&self) -> Option<Plan> {
        let drive = self.drive.as_ref().and_then(Timer::pending);
        let photos = self.photos.as_ref().and_then(Timer::pending);
        match (drive, photos) {
            (Some(d), Some(p)) if p < d => Some(Plan {
                resource: Resource::Photos,
                sleep: p,
            }),
            (Some(d), _) => Some(Plan {
                resource: Resource::Drive,
                sleep: d,
            }),
            (None, Some(p)) => Some(Plan {
                resource: Resource::Photos,
                sleep: p,
            }),
            (None, None) => None,
        }
    }

    /// Count down every pending timer.
    pub fn advance(&mut self, elapsed: Duration) {
        for timer in [&mut self.drive, &mut self.photos].into_iter().flatten() {
            timer.remaining = timer.remaining.saturating_sub(elapsed);
        }
    }

    /// A resource finished a sync: rearm it, or retire it if oneshot.
    pub fn complete(&mut self, resource: Resource) {
        let slot = match resource {
            Resource::Drive => &mut self.drive,
            Resource::Photos => &mut self.photos,
        };
        if let Some(timer) = slot {
            match timer.interval {
                Interval::Every(d) => timer.remaining = d,
                Interval::Once => timer.done = true,
            }
        }
    }

    /// Time until the resource's next sync, if it will run again.
    pub fn remaining(&self, resource: Resource) -> Option<Duration> {
        match resource {
            Resource::Drive => self.drive.as_ref(),
            Resource::Photos => self.photos.as_ref(),
        }
        .and_then(Timer::pending)
    }

    pub fn is_finished(&self) -> bool {
        self.next().is_none()
    }
}
