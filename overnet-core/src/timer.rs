//! Monotonic clock and deferred callbacks.
//!
//! A node runs on a single-threaded `LocalSet`; [`Timeout`] spawns a local
//! task, so it must be created from inside one.

use std::fmt;
use std::future::Future;
use std::ops::{Add, Sub};
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::status::Status;

/// Boxed non-`Send` future.
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Time since the timer's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_micros(us: u64) -> Self {
        Timestamp(Duration::from_micros(us))
    }

    pub fn as_micros(&self) -> u64 {
        self.0.as_micros() as u64
    }

    pub fn since_origin(&self) -> Duration {
        self.0
    }

    /// Elapsed time from `earlier` to `self`; zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.as_micros())
    }
}

/// Time source consumed by the mesh.
pub trait Timer {
    fn now(&self) -> Timestamp;

    /// Future that completes once `now() >= deadline`.
    fn sleep_until(&self, deadline: Timestamp) -> LocalBoxFuture<()>;
}

/// [`Timer`] on top of tokio's clock. Under `tokio::time::pause` (tests) it is
/// fully deterministic.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    origin: tokio::time::Instant,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed())
    }

    fn sleep_until(&self, deadline: Timestamp) -> LocalBoxFuture<()> {
        Box::pin(tokio::time::sleep_until(self.origin + deadline.0))
    }
}

/// A scheduled callback. The callback runs exactly once: with `Status::ok()`
/// when the deadline passes, or with a cancelled status when [`Timeout::cancel`]
/// is called (or the handle is dropped) first.
pub struct Timeout {
    cancel: Option<oneshot::Sender<()>>,
    deadline: Timestamp,
}

impl Timeout {
    pub fn new(
        timer: &Rc<dyn Timer>,
        deadline: Timestamp,
        on_fire: impl FnOnce(Status) + 'static,
    ) -> Self {
        let (tx, rx) = oneshot::channel::<()>();
        let sleep = timer.sleep_until(deadline);
        tokio::task::spawn_local(async move {
            let status = tokio::select! {
                biased;
                _ = rx => Status::cancelled("timeout cancelled"),
                _ = sleep => Status::ok(),
            };
            on_fire(status);
        });
        Self {
            cancel: Some(tx),
            deadline,
        }
    }

    /// Convenience for `now + delay`.
    pub fn after(
        timer: &Rc<dyn Timer>,
        delay: Duration,
        on_fire: impl FnOnce(Status) + 'static,
    ) -> Self {
        let deadline = timer.now() + delay;
        Self::new(timer, deadline, on_fire)
    }

    pub fn deadline(&self) -> Timestamp {
        self.deadline
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline", &self.deadline)
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use std::cell::RefCell;

    fn timer() -> Rc<dyn Timer> {
        Rc::new(TokioTimer::new())
    }

    #[tokio::test(start_paused = true)]
    async fn fires_ok_on_expiry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let timer = timer();
                let fired = Rc::new(RefCell::new(None));
                let f = fired.clone();
                let _t = Timeout::after(&timer, Duration::from_millis(42), move |s| {
                    *f.borrow_mut() = Some(s.code());
                });
                tokio::time::sleep(Duration::from_millis(41)).await;
                assert!(fired.borrow().is_none());
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(*fired.borrow(), Some(StatusCode::Ok));
                assert!(timer.now() >= Timestamp::from_micros(42_000));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reports_cancelled_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let timer = timer();
                let calls = Rc::new(RefCell::new(Vec::new()));
                let c = calls.clone();
                let mut t = Timeout::after(&timer, Duration::from_secs(1), move |s| {
                    c.borrow_mut().push(s.code());
                });
                t.cancel();
                t.cancel();
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(*calls.borrow(), vec![StatusCode::Cancelled]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let timer = timer();
                let calls = Rc::new(RefCell::new(Vec::new()));
                let c = calls.clone();
                drop(Timeout::after(&timer, Duration::from_millis(5), move |s| {
                    c.borrow_mut().push(s.code());
                }));
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(*calls.borrow(), vec![StatusCode::Cancelled]);
            })
            .await;
    }
}
