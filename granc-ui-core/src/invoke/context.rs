//! Cancellation and deadlines for a single call.
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// A cancellable scope with an optional deadline.
///
/// Contexts derived with [`CallContext::with_timeout`] are cancelled along with their parent,
/// and never outlive its deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a child context that expires after `timeout`, or at the parent's deadline if
    /// that comes first. A timeout too large to represent leaves the deadline unchanged.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };

        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The status describing why this context is done, if it already is.
    pub fn err(&self) -> Option<Status> {
        if self.token.is_cancelled() {
            return Some(cancelled());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(deadline_exceeded()),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => cancelled(),
                _ = tokio::time::sleep_until(deadline) => deadline_exceeded(),
            },
            None => {
                self.token.cancelled().await;
                cancelled()
            }
        }
    }
}

/// Converts a timeout in seconds. Non-positive and NaN values mean "no timeout"; values too
/// large for a `Duration` clamp to `Duration::MAX`.
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    } else {
        None
    }
}

fn cancelled() -> Status {
    Status::cancelled("context canceled")
}

fn deadline_exceeded() -> Status {
    Status::deadline_exceeded("context deadline exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_timeout_from_secs() {
        assert_eq!(timeout_from_secs(0.0), None);
        assert_eq!(timeout_from_secs(-3.0), None);
        assert_eq!(timeout_from_secs(f64::NAN), None);
        assert_eq!(timeout_from_secs(1.5), Some(Duration::from_millis(1500)));
        assert_eq!(timeout_from_secs(1e20), Some(Duration::MAX));
        assert_eq!(timeout_from_secs(f64::INFINITY), Some(Duration::MAX));
    }

    #[tokio::test]
    async fn test_huge_timeout_means_no_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::MAX);
        assert_eq!(ctx.deadline(), None);
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_parent_deadline() {
        let parent = CallContext::new().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_done() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));

        let status = ctx.done().await;

        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(ctx.err().map(|s| s.code()), Some(Code::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_child() {
        let parent = CallContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));

        parent.cancel();

        assert_eq!(child.done().await.code(), Code::Cancelled);
    }
}
