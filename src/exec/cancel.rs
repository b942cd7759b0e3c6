//! Per-query cancellation, shared by the caller, the runners and every
//! worker of one query.

use std::thread;
use std::time::{Duration, Instant};

/// Granularity of the blocking wait used by retry backoff.
const WAIT_SLICE: Duration = Duration::from_millis(2);

/// Cooperative cancellation flag of one query.
///
/// Child tokens are cancelled with their parent but can also be cancelled on
/// their own, which is how a failing partition stops its siblings without
/// cancelling the whole query.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    /// Creates an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token cancelled whenever `self` is.
    pub fn child(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.child_token(),
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Sleeps for up to `timeout` on the calling thread, waking early on
    /// cancellation. Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(WAIT_SLICE));
        }
        self.is_cancelled()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_follow_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();
        grandchild.cancel();
        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn wait_timeout_wakes_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let start = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn wait_timeout_expires() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn cancelled_future_resolves_after_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            tokio::spawn(async move { remote.cancel() });
            token.cancelled().await;
            assert!(token.is_cancelled());
        });
    }
}
