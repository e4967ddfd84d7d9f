use crate::domain::{HeartbeatReconciler, NotificationHandler, RetryPolicy};
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, Notification};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queues every notification and reconciles them on a fixed pool of workers.
///
/// Failed notifications are requeued with `retry` incremented, so events are
/// only emitted on the first attempt. Ordering across workers is not
/// preserved; stale heartbeats are caught by the status check instead.
pub struct ProcessAllHandler {
    inner: Arc<ProcessAllInner>,
}

struct ProcessAllInner {
    reconciler: HeartbeatReconciler,
    retry_policy: RetryPolicy,
    workers: usize,
    sender: mpsc::UnboundedSender<Notification>,
    receiver: Mutex<mpsc::UnboundedReceiver<Notification>>,
    shutdown_token: CancellationToken,
    started: AtomicBool,
}

impl ProcessAllHandler {
    pub fn new(
        reconciler: HeartbeatReconciler,
        retry_policy: RetryPolicy,
        workers: usize,
        shutdown_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ProcessAllInner {
                reconciler,
                retry_policy,
                workers: workers.max(1),
                sender,
                receiver: Mutex::new(receiver),
                shutdown_token,
                started: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl NotificationHandler for ProcessAllHandler {
    fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(workers = self.inner.workers, "starting heartbeat workers");
        for worker_id in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_worker(worker_id).await });
        }
    }

    async fn process(&self, _ctx: CancellationToken, notification: Notification) -> DomainResult<()> {
        notification.validate()?;

        if self.inner.shutdown_token.is_cancelled() {
            return Err(DomainError::HandlerStopped);
        }

        self.inner
            .sender
            .send(notification)
            .map_err(|_| DomainError::HandlerStopped)
    }
}

impl ProcessAllInner {
    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "heartbeat worker started");

        loop {
            let next = tokio::select! {
                _ = self.shutdown_token.cancelled() => None,
                notification = self.next_notification() => notification,
            };

            let Some(notification) = next else {
                break;
            };
            self.handle(notification).await;
        }

        debug!(worker_id, "heartbeat worker stopped");
    }

    async fn next_notification(&self) -> Option<Notification> {
        self.receiver.lock().await.recv().await
    }

    async fn handle(&self, mut notification: Notification) {
        let err = match self.reconciler.reconcile(&notification).await {
            Ok(()) => return,
            Err(err) => err,
        };

        if err.is_not_found() {
            debug!(
                device_id = %notification.device_id,
                namespace = %notification.namespace,
                "device not found, dropping heartbeat"
            );
            return;
        }

        let Some(attempts) = self.retry_policy.next_attempt(notification.retry) else {
            error!(
                device_id = %notification.device_id,
                namespace = %notification.namespace,
                retry = notification.retry,
                error = %err,
                "dropping heartbeat after exhausting retries"
            );
            return;
        };

        warn!(
            device_id = %notification.device_id,
            namespace = %notification.namespace,
            retry = notification.retry,
            error = %err,
            "heartbeat failed, requeueing"
        );
        notification.retry = attempts;
        self.requeue(notification, self.retry_policy.delay_for(attempts));
    }

    fn requeue(&self, notification: Notification, delay: Duration) {
        if delay.is_zero() {
            if self.sender.send(notification).is_err() {
                debug!("queue closed, heartbeat not requeued");
            }
            return;
        }

        let sender = self.sender.clone();
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if sender.send(notification).is_err() {
                        debug!("queue closed, heartbeat not requeued");
                    }
                }
            }
        });
    }
}
