use crate::domain::{HeartbeatReconciler, NotificationHandler, RetryPolicy};
use async_trait::async_trait;
use common::domain::{DomainResult, Notification};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Reconciles inline on the caller's task, retrying with linear backoff.
///
/// A device that no longer exists is reported immediately without retrying.
pub struct SynchronousHandler {
    reconciler: HeartbeatReconciler,
    retry_policy: RetryPolicy,
}

impl SynchronousHandler {
    pub fn new(reconciler: HeartbeatReconciler, retry_policy: RetryPolicy) -> Self {
        Self {
            reconciler,
            retry_policy,
        }
    }
}

#[async_trait]
impl NotificationHandler for SynchronousHandler {
    fn start(&self) {}

    #[instrument(
        skip(self, ctx, notification),
        fields(device_id = %notification.device_id, namespace = %notification.namespace)
    )]
    async fn process(
        &self,
        ctx: CancellationToken,
        mut notification: Notification,
    ) -> DomainResult<()> {
        notification.validate()?;

        let mut attempt: u32 = 1;
        loop {
            let err = match self.reconciler.reconcile(&notification).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if err.is_not_found() {
                debug!("device not found, dropping heartbeat");
                return Err(err);
            }

            if !self.retry_policy.allows_retry(attempt) {
                warn!(attempts = attempt, error = %err, "giving up on heartbeat");
                return Err(err);
            }

            let delay = self.retry_policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "heartbeat failed, retrying");

            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("cancelled while backing off");
                    return Err(err);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            notification.retry = notification.retry.saturating_add(1);
            attempt = attempt.saturating_add(1);
        }
    }
}
