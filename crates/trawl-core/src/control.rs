//! Cooperative pause/stop signals owned by an external load controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Signals the scheduler polls before every dispatch.
///
/// Pausing blocks new dispatch without discarding queued work; stopping
/// prevents any further dispatch. Neither interrupts in-flight calls.
pub trait LoadController: Send + Sync {
    fn is_pause_requested(&self) -> bool;

    fn is_stop_requested(&self) -> bool;

    /// Whether the host is otherwise idle, allowing a higher session
    /// concurrency.
    fn is_host_idle(&self) -> bool {
        false
    }

    /// Resolves once the pause is lifted or a stop is requested.
    ///
    /// The default implementation polls every `poll`; controllers with change
    /// notification should override it.
    fn wait_while_paused(&self, poll: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            while self.is_pause_requested() && !self.is_stop_requested() {
                tokio::time::sleep(poll).await;
            }
        })
    }
}

/// A controller that never pauses or stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

impl LoadController for Unthrottled {
    fn is_pause_requested(&self) -> bool {
        false
    }

    fn is_stop_requested(&self) -> bool {
        false
    }
}

/// In-process controller handle with notification-driven waits.
///
/// Clones share state: hand one to the scheduler and keep one to steer it.
#[derive(Clone)]
pub struct ControlHandle {
    stop: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
    host_idle: Arc<AtomicBool>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            stop: CancellationToken::new(),
            pause: Arc::new(pause),
            host_idle: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop when `token` is cancelled (e.g. on Ctrl-C).
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            stop: token,
            ..Self::new()
        }
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn set_host_idle(&self, idle: bool) {
        self.host_idle.store(idle, Ordering::Relaxed);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl LoadController for ControlHandle {
    fn is_pause_requested(&self) -> bool {
        *self.pause.borrow()
    }

    fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn is_host_idle(&self) -> bool {
        self.host_idle.load(Ordering::Relaxed)
    }

    fn wait_while_paused(&self, _poll: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut rx = self.pause.subscribe();
            loop {
                let paused = *rx.borrow_and_update();
                if !paused || self.stop.is_cancelled() {
                    return;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = self.stop.cancelled() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let control = ControlHandle::new();
        tokio::time::timeout(Duration::from_millis(50), control.wait_while_paused(Duration::ZERO))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resume_wakes_waiter() {
        let control = ControlHandle::new();
        control.pause();
        assert!(control.is_pause_requested());

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move {
                control.wait_while_paused(Duration::from_secs(60)).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        control.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_wakes_paused_waiter() {
        let control = ControlHandle::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move {
                control.wait_while_paused(Duration::from_secs(60)).await;
            })
        };
        control.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(control.is_stop_requested());
    }

    struct Flag(AtomicBool);

    impl LoadController for Flag {
        fn is_pause_requested(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }

        fn is_stop_requested(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_wait_polls_until_cleared() {
        let flag = Arc::new(Flag(AtomicBool::new(true)));
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move {
                flag.wait_while_paused(Duration::from_millis(100)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!waiter.is_finished());
        flag.0.store(false, Ordering::Relaxed);
        waiter.await.unwrap();
    }
}
