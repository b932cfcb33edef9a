//! Time source and "fire at or after instant T" primitive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Wall clock plus a one-shot sleep, so engines can be driven by a fake in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve at or after `at`. Returns immediately if `at` is not in the future.
    async fn sleep_until(&self, at: DateTime<Utc>);
}

/// The real clock, backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// A clock that only moves when told to.
///
/// Sleepers wake as soon as [`ManualClock::advance`] or [`ManualClock::set`]
/// moves time to or past their deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        self.now.send_modify(|now| *now += by);
    }

    /// Jump to `at`. Moving backwards is ignored.
    pub fn set(&self, at: DateTime<Utc>) {
        self.now.send_modify(|now| {
            if at > *now {
                *now = at;
            }
        });
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= at {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
