//! Bounded retry around [`CodeBackend::prompt`].
//!
//! Only transient transport failures are retried. The invoker never
//! recreates a backend; after [`SessionError::RetriesExhausted`] the caller
//! closes the session through the registry and asks for a fresh one.

use std::time::Duration;

use log::warn;

use crate::backend::{CodeBackend, Response};
use crate::error::{SessionError, SessionResult};

/// Lower-cased message fragments that mark an error as transient.
pub const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "broken pipe",
    "process has already exited",
    "connection reset by peer",
    "resource temporarily unavailable",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn normalized(self) -> Self {
        let max_attempts = self.max_attempts.max(1);
        let backoff_max = self.backoff_max.max(self.backoff_base);
        Self {
            max_attempts,
            backoff_base: self.backoff_base,
            backoff_max,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): linear, capped.
    pub fn backoff_delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(attempt.max(1))
            .min(self.backoff_max)
    }
}

/// Whether `err` is worth another attempt.
///
/// Structured variants decide first; the message patterns catch transient
/// failures that only surface as text (for example inside IO errors).
pub fn is_transient(err: &SessionError) -> bool {
    match err {
        SessionError::BrokenPipe(_) | SessionError::ProcessExited(_) => true,
        SessionError::Configuration(_)
        | SessionError::Auth { .. }
        | SessionError::UnsafePath { .. }
        | SessionError::Timeout { .. }
        | SessionError::Closed
        | SessionError::RetriesExhausted { .. } => false,
        other => {
            let message = other.to_string().to_lowercase();
            TRANSIENT_ERROR_PATTERNS
                .iter()
                .any(|pattern| message.contains(pattern))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn prompt_with_retry(
        &self,
        backend: &dyn CodeBackend,
        message: &str,
    ) -> SessionResult<Response> {
        let mut attempt = 1_u32;
        loop {
            let error = match backend.prompt(message).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !is_transient(&error) {
                return Err(error);
            }

            if attempt >= self.policy.max_attempts {
                return Err(SessionError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.policy.backoff_delay_for_attempt(attempt);
            warn!(
                "{} prompt attempt {}/{} failed ({}), retrying in {}ms",
                backend.kind(),
                attempt,
                self.policy.max_attempts,
                error,
                delay.as_millis()
            );
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

/// Retry `backend.prompt(message)` up to `max_attempts` times with the
/// default backoff.
pub async fn prompt_with_retry(
    backend: &dyn CodeBackend,
    message: &str,
    max_attempts: u32,
) -> SessionResult<Response> {
    RetryingInvoker::new(RetryPolicy::with_max_attempts(max_attempts))
        .prompt_with_retry(backend, message)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, BackendStatus, SessionState};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails with the queued errors, then answers "ok".
    struct Flaky {
        errors: Mutex<VecDeque<SessionError>>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(errors: Vec<SessionError>) -> Self {
            Self {
                errors: Mutex::new(errors.into()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CodeBackend for Flaky {
        async fn prompt(&self, _message: &str) -> SessionResult<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.errors.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(Response::from_bytes("ok")),
            }
        }

        async fn close(&self) -> SessionResult<()> {
            Ok(())
        }

        fn kind(&self) -> BackendKind {
            BackendKind::LocalProcess
        }

        async fn status(&self) -> BackendStatus {
            BackendStatus {
                kind: BackendKind::LocalProcess,
                state: SessionState::Ready,
                container: None,
                session: None,
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_broken_pipes_then_success() {
        let backend = Flaky::new(vec![
            SessionError::BrokenPipe("write".into()),
            SessionError::BrokenPipe("write".into()),
        ]);
        let started = Instant::now();

        let response = RetryingInvoker::new(policy())
            .prompt_with_retry(&backend, "hi")
            .await
            .unwrap();

        assert_eq!(response.text().await.unwrap(), "ok");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        // Slept 100ms after attempt 1 and 200ms after attempt 2.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_is_not_retried() {
        let backend = Flaky::new(vec![SessionError::Auth {
            output: "broken pipe while reading key".into(),
        }]);
        let err = RetryingInvoker::new(policy())
            .prompt_with_retry(&backend, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Auth { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_names_attempts_and_cause() {
        let backend = Flaky::new(vec![
            SessionError::ProcessExited("a".into()),
            SessionError::ProcessExited("b".into()),
            SessionError::ProcessExited("c".into()),
        ]);
        let err = prompt_with_retry(&backend, "hi", 3).await.unwrap_err();
        match err {
            SessionError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "process has already exited: c");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_message_patterns() {
        let io = SessionError::Io(std::io::Error::other("Connection reset by peer"));
        assert!(is_transient(&io));
        let exec = SessionError::Execution {
            status: "exit status: 1".into(),
            output: "syntax error".into(),
        };
        assert!(!is_transient(&exec));
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let p = policy();
        assert_eq!(p.backoff_delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(p.backoff_delay_for_attempt(50), Duration::from_secs(1));
    }
}
