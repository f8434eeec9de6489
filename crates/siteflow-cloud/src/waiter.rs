//! Waiting on external completion conditions (certificate issuance)

use crate::provider::ProviderResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State of a validation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Waiting,
    Satisfied,
    TimedOut,
}

/// A pending readiness condition on one node
#[derive(Debug, Clone)]
pub struct ValidationTask {
    pub node_id: String,
    /// Human-readable condition, e.g. `status == ISSUED`
    pub condition: String,
    pub state: ValidationState,
    pub deadline: Instant,
    /// Number of probes made so far
    pub polls: u32,
    /// Last probe error, if any
    pub last_error: Option<String>,
}

impl ValidationTask {
    pub fn new(node_id: impl Into<String>, condition: impl Into<String>, timeout: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            condition: condition.into(),
            state: ValidationState::Waiting,
            deadline: Instant::now() + timeout,
            polls: 0,
            last_error: None,
        }
    }
}

/// Polls a condition on a fixed interval until it holds or the deadline passes
#[derive(Debug, Clone)]
pub struct ValidationWaiter {
    interval: Duration,
}

impl ValidationWaiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Drive `task` to Satisfied or TimedOut.
    ///
    /// Probe errors are recorded and polling continues; cancellation ends the
    /// wait as TimedOut.
    pub async fn wait<F, Fut>(
        &self,
        task: &mut ValidationTask,
        cancel: &CancellationToken,
        mut probe: F,
    ) -> ValidationState
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<bool>>,
    {
        info!(node = %task.node_id, condition = %task.condition, "Waiting for validation");

        loop {
            task.polls += 1;
            match probe().await {
                Ok(true) => {
                    info!(node = %task.node_id, polls = task.polls, "Validation satisfied");
                    task.state = ValidationState::Satisfied;
                    return task.state;
                }
                Ok(false) => {
                    debug!(node = %task.node_id, polls = task.polls, "Condition not met yet");
                }
                Err(e) => {
                    debug!(node = %task.node_id, error = %e, "Validation probe failed");
                    task.last_error = Some(e.to_string());
                }
            }

            let now = Instant::now();
            if now >= task.deadline {
                break;
            }
            let next = (now + self.interval).min(task.deadline);

            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = cancel.cancelled() => {
                    warn!(node = %task.node_id, "Validation wait cancelled");
                    task.state = ValidationState::TimedOut;
                    return task.state;
                }
            }
        }

        // One last probe at the deadline
        task.polls += 1;
        if let Ok(true) = probe().await {
            task.state = ValidationState::Satisfied;
            return task.state;
        }

        warn!(
            node = %task.node_id,
            condition = %task.condition,
            polls = task.polls,
            "Validation timed out"
        );
        task.state = ValidationState::TimedOut;
        task.state
    }
}

impl Default for ValidationWaiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_satisfied_after_polls() {
        let waiter = ValidationWaiter::new(Duration::from_millis(2));
        let mut task = ValidationTask::new("certificate", "status == ISSUED", Duration::from_secs(5));
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let state = waiter
            .wait(&mut task, &CancellationToken::new(), || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            })
            .await;

        assert_eq!(state, ValidationState::Satisfied);
        assert_eq!(task.state, ValidationState::Satisfied);
        assert_eq!(task.polls, 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let waiter = ValidationWaiter::new(Duration::from_millis(5));
        let mut task = ValidationTask::new("certificate", "status == ISSUED", Duration::from_millis(30));

        let state = waiter
            .wait(&mut task, &CancellationToken::new(), || async { Ok(false) })
            .await;

        assert_eq!(state, ValidationState::TimedOut);
        assert!(task.polls >= 2);
    }

    #[tokio::test]
    async fn test_probe_errors_are_recorded() {
        let waiter = ValidationWaiter::new(Duration::from_millis(5));
        let mut task = ValidationTask::new("certificate", "status == ISSUED", Duration::from_millis(20));

        let state = waiter
            .wait(&mut task, &CancellationToken::new(), || async {
                Err(ProviderError::transient("not found yet"))
            })
            .await;

        assert_eq!(state, ValidationState::TimedOut);
        assert!(task.last_error.unwrap().contains("not found yet"));
    }

    #[tokio::test]
    async fn test_cancel_ends_wait() {
        let waiter = ValidationWaiter::new(Duration::from_secs(60));
        let mut task = ValidationTask::new("certificate", "status == ISSUED", Duration::from_secs(600));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let state = waiter.wait(&mut task, &cancel, || async { Ok(false) }).await;
        assert_eq!(state, ValidationState::TimedOut);
    }
}
