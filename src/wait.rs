//! Convergence polling
//!
//! Remote resources settle asynchronously: a compute environment is `VALID`
//! only some time after creation returns, and deletions linger in
//! `DELETING`. `poll_until` wraps a describe call in an exponential backoff
//! loop with jitter, a hard timeout, and cooperative cancellation.

use crate::descriptor::ResourceKind;
use crate::error::ProvisionError;
use crate::store::{RemoteHealth, StoreError};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff and timeout budget for one resource's convergence wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergencePolicy {
    /// Delay before the second poll; doubles each round
    pub initial_delay: Duration,
    /// Ceiling for the per-round delay
    pub max_delay: Duration,
    /// Total budget; exceeding it is `ConvergenceTimeout`
    pub timeout: Duration,
    /// Fractional jitter added to each delay, in [0, jitter)
    pub jitter: f64,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            jitter: 0.25,
        }
    }
}

impl ConvergencePolicy {
    /// Millisecond-scale policy for tests
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_millis(250),
            jitter: 0.0,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let doubled = (current * 2).min(self.max_delay);
        if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
            doubled.mul_f64(factor)
        } else {
            doubled
        }
    }
}

/// The remote state a wait is driving towards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// Creation/update settled, resource usable by dependents
    Ready,
    /// Deletion settled, resource no longer observable
    Gone,
}

/// Poll `check` until the resource reaches `target`, the policy's timeout
/// elapses, or `cancel` fires. A resource observed `Gone` while waiting for
/// `Ready` is a hard failure; `NotFound` while waiting for `Gone` is
/// success.
pub async fn poll_until<F, Fut>(
    policy: &ConvergencePolicy,
    cancel: Option<&CancellationToken>,
    resource: &str,
    kind: ResourceKind,
    target: WaitTarget,
    mut check: F,
) -> Result<(), ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RemoteHealth, StoreError>>,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match check().await {
            Ok(RemoteHealth::Ready) if target == WaitTarget::Ready => {
                debug!(resource, %kind, attempts, "converged");
                return Ok(());
            }
            Ok(RemoteHealth::Gone) if target == WaitTarget::Gone => {
                debug!(resource, %kind, attempts, "removal settled");
                return Ok(());
            }
            Ok(RemoteHealth::Gone) => {
                // Disappeared out from under the apply
                return Err(ProvisionError::RemoteCallFailure {
                    resource: resource.to_string(),
                    kind,
                    attempts,
                    source: StoreError::NotFound,
                });
            }
            Ok(RemoteHealth::Failed(reason)) if target == WaitTarget::Ready => {
                return Err(ProvisionError::RemoteCallFailure {
                    resource: resource.to_string(),
                    kind,
                    attempts,
                    source: StoreError::Rejected(reason),
                });
            }
            // Still settling towards the target
            Ok(RemoteHealth::Creating | RemoteHealth::Ready | RemoteHealth::Failed(_)) => {}
            Err(err) if err.is_not_found() && target == WaitTarget::Gone => return Ok(()),
            Err(err) if err.is_retryable() => {
                warn!(resource, %kind, error = %err, "poll failed, retrying");
            }
            Err(err) => {
                return Err(ProvisionError::RemoteCallFailure {
                    resource: resource.to_string(),
                    kind,
                    attempts,
                    source: err,
                });
            }
        }

        if started.elapsed() + delay > policy.timeout {
            return Err(ProvisionError::ConvergenceTimeout {
                resource: resource.to_string(),
                kind,
                waited_secs: started.elapsed().as_secs(),
            });
        }

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(ProvisionError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn settles_after_a_few_creating_polls() {
        let polls = AtomicU32::new(0);
        poll_until(
            &ConvergencePolicy::fast(),
            None,
            "ComputeEnvironment",
            ResourceKind::ComputeEnvironment,
            WaitTarget::Ready,
            || async {
                if polls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(RemoteHealth::Creating)
                } else {
                    Ok(RemoteHealth::Ready)
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn times_out_when_never_ready() {
        let err = poll_until(
            &ConvergencePolicy::fast(),
            None,
            "JobQueue",
            ResourceKind::JobQueue,
            WaitTarget::Ready,
            || async { Ok(RemoteHealth::Creating) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::ConvergenceTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn gone_while_awaiting_ready_is_fatal() {
        let err = poll_until(
            &ConvergencePolicy::fast(),
            None,
            "Vpc",
            ResourceKind::Vpc,
            WaitTarget::Ready,
            || async { Ok(RemoteHealth::Gone) },
        )
        .await
        .unwrap_err();
        match err {
            ProvisionError::RemoteCallFailure { source, .. } => assert!(source.is_not_found()),
            other => panic!("expected RemoteCallFailure, got {other}"),
        }
    }

    #[tokio::test]
    async fn not_found_counts_as_gone() {
        poll_until(
            &ConvergencePolicy::fast(),
            None,
            "Repository",
            ResourceKind::Repository,
            WaitTarget::Gone,
            || async { Err(StoreError::NotFound) },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let err = poll_until(
            &ConvergencePolicy::fast(),
            Some(&token),
            "SecurityGroup",
            ResourceKind::SecurityGroup,
            WaitTarget::Ready,
            || async { Ok(RemoteHealth::Creating) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
    }
}
