//! One-shot and repeating callbacks on the local scheduler.
//!
//! Timers are plain tasks: sleep, check the cancellation flag, invoke. A
//! repeating timer keeps firing until its callback returns `false` or the
//! handle is cancelled. Cancellation is a one-shot boolean; cancelling after
//! the callback ran is a no-op.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::spawn_local;

/// Cancellation handle for a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

pub struct Timer;

impl Timer {
    /// Run `callback` once after `delay`.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn once<F>(delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        let handle = TimerHandle {
            cancelled: Rc::new(Cell::new(false)),
        };

        let guard = handle.clone();
        spawn_local(async move {
            tokio::time::sleep(delay).await;
            if !guard.is_cancelled() {
                callback();
            }
        });

        handle
    }

    /// Run `callback` every `interval` until it returns `false` or the
    /// handle is cancelled.
    pub fn repeating<F>(interval: Duration, callback: F) -> TimerHandle
    where
        F: Fn() -> bool + 'static,
    {
        let handle = TimerHandle {
            cancelled: Rc::new(Cell::new(false)),
        };

        let guard = handle.clone();
        spawn_local(async move {
            loop {
                tokio::time::sleep(interval).await;

                if guard.is_cancelled() || !callback() {
                    break;
                }
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::task::LocalSet;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_after_delay() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let fired = Rc::new(Cell::new(false));
                let flag = fired.clone();
                Timer::once(Duration::from_millis(100), move || flag.set(true));

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(!fired.get());

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert!(fired.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_one_shot_never_fires() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let fired = Rc::new(Cell::new(false));
                let flag = fired.clone();
                let handle = Timer::once(Duration::from_millis(100), move || flag.set(true));
                handle.cancel();

                tokio::time::sleep(Duration::from_millis(200)).await;
                assert!(!fired.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_runs_until_callback_declines() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let ticks = Rc::new(RefCell::new(0));
                let counter = ticks.clone();
                Timer::repeating(Duration::from_millis(10), move || {
                    *counter.borrow_mut() += 1;
                    *counter.borrow() < 3
                });

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(*ticks.borrow(), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_stops_on_cancel() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let ticks = Rc::new(RefCell::new(0));
                let counter = ticks.clone();
                let handle = Timer::repeating(Duration::from_millis(10), move || {
                    *counter.borrow_mut() += 1;
                    true
                });

                tokio::time::sleep(Duration::from_millis(35)).await;
                handle.cancel();
                let seen = *ticks.borrow();

                tokio::time::sleep(Duration::from_millis(100)).await;
                // at most one already-sleeping tick may still fire
                assert!(*ticks.borrow() <= seen + 1);
            })
            .await;
    }
}
