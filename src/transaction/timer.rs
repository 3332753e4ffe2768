// ============================================================================
// Abort Signal and Deadline Timer
// ============================================================================
//
// The operation loop checks the abort signal before every item. The deadline
// timer is a cancellable task owned by the transaction; it is cancelled on
// any terminal transition and never fires after cleanup.
//
// ============================================================================

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    Requested(String),
    TimedOut,
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::Requested(reason) => write!(f, "aborted: {}", reason),
            AbortCause::TimedOut => write!(f, "deadline exceeded"),
        }
    }
}

/// Cooperative stop flag. The first cause wins.
#[derive(Debug, Default)]
pub struct AbortSignal {
    cause: OnceLock<AbortCause>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the signal was already triggered.
    pub fn trigger(&self, cause: AbortCause) -> bool {
        self.cause.set(cause).is_ok()
    }

    pub fn cause(&self) -> Option<&AbortCause> {
        self.cause.get()
    }

    pub fn is_triggered(&self) -> bool {
        self.cause.get().is_some()
    }
}

/// Deadline timer for one transaction.
pub struct TimeoutGuard {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TimeoutGuard {
    /// Runs `on_timeout` on its own task once `deadline` elapses, unless the
    /// guard is cancelled or dropped first.
    pub fn spawn<F, Fut>(deadline: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                _ = tokio::time::sleep(deadline) => {
                    // Detached so that cancelling this guard from inside the
                    // timeout handler cannot abort the handler itself.
                    tokio::spawn(on_timeout());
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Stops the timer and waits for its task to finish.
    pub async fn cancel(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_cause_wins() {
        let signal = AbortSignal::new();
        assert!(signal.trigger(AbortCause::Requested("user".into())));
        assert!(!signal.trigger(AbortCause::TimedOut));
        assert_eq!(signal.cause(), Some(&AbortCause::Requested("user".into())));
    }

    #[tokio::test]
    async fn test_timer_fires_after_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _guard = TimeoutGuard::spawn(Duration::from_millis(10), move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let guard = TimeoutGuard::spawn(Duration::from_millis(20), move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        guard.cancel().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
