use crate::domain::{HeartbeatReconciler, NotificationHandler, RetryPolicy};
use async_trait::async_trait;
use common::domain::{DeviceKey, DomainError, DomainResult, Notification};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Keeps at most one pending notification per device and reconciles them on
/// a single consumer.
///
/// A notification arriving for a device that is already queued is merged
/// into the pending one (see [`coalesce`]); the device keeps its place in the
/// queue.
pub struct CompactingHandler {
    inner: Arc<CompactingInner>,
}

struct CompactingInner {
    reconciler: HeartbeatReconciler,
    retry_policy: RetryPolicy,
    queue: Mutex<CompactingQueue>,
    notify: Notify,
    shutdown_token: CancellationToken,
    started: AtomicBool,
}

/// FIFO of device keys with one pending notification per key
#[derive(Default)]
struct CompactingQueue {
    order: VecDeque<DeviceKey>,
    pending: HashMap<DeviceKey, Notification>,
}

impl CompactingQueue {
    /// Returns true when the notification was merged into a pending one
    fn push(&mut self, notification: Notification) -> bool {
        let key = notification.key();
        match self.pending.remove(&key) {
            Some(existing) => {
                self.pending.insert(key, coalesce(existing, notification));
                true
            }
            None => {
                self.order.push_back(key.clone());
                self.pending.insert(key, notification);
                false
            }
        }
    }

    fn pop(&mut self) -> Option<Notification> {
        while let Some(key) = self.order.pop_front() {
            if let Some(notification) = self.pending.remove(&key) {
                return Some(notification);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Merge two notifications for the same device into one.
///
/// The newer heartbeat supplies the status. Labels are unioned with the newer
/// value winning. Events that were never emitted (those of first-attempt
/// notifications) are kept in arrival order; the merged notification is a
/// first attempt whenever either input was.
pub fn coalesce(pending: Notification, incoming: Notification) -> Notification {
    let (older, newer) = if incoming.heartbeat.time >= pending.heartbeat.time {
        (pending, incoming)
    } else {
        (incoming, pending)
    };

    let retry = older.retry.min(newer.retry);
    let older_fresh = older.is_first_attempt();
    let newer_fresh = newer.is_first_attempt();

    let mut heartbeat = newer.heartbeat;
    let mut labels = older.heartbeat.status.labels;
    labels.append(&mut heartbeat.status.labels);
    heartbeat.status.labels = labels;

    let mut events = Vec::new();
    if older_fresh {
        events.extend(older.heartbeat.events);
    }
    if newer_fresh {
        events.append(&mut heartbeat.events);
    }
    heartbeat.events = events;

    Notification {
        device_id: newer.device_id,
        namespace: newer.namespace,
        heartbeat,
        retry,
    }
}

impl CompactingHandler {
    pub fn new(
        reconciler: HeartbeatReconciler,
        retry_policy: RetryPolicy,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(CompactingInner {
                reconciler,
                retry_policy,
                queue: Mutex::new(CompactingQueue::default()),
                notify: Notify::new(),
                shutdown_token,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Number of devices with a pending notification
    pub fn pending(&self) -> usize {
        self.inner.lock_queue().len()
    }
}

#[async_trait]
impl NotificationHandler for CompactingHandler {
    fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("starting compacting heartbeat consumer");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await });
    }

    async fn process(&self, _ctx: CancellationToken, notification: Notification) -> DomainResult<()> {
        notification.validate()?;

        if self.inner.shutdown_token.is_cancelled() {
            return Err(DomainError::HandlerStopped);
        }

        self.inner.enqueue(notification);
        Ok(())
    }
}

impl CompactingInner {
    fn lock_queue(&self) -> MutexGuard<'_, CompactingQueue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, notification: Notification) {
        let key = notification.key();
        let coalesced = self.lock_queue().push(notification);
        if coalesced {
            debug!(device = %key, "coalesced heartbeat into pending notification");
        }
        self.notify.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            let next = self.lock_queue().pop();
            match next {
                Some(notification) => self.handle(notification).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown_token.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }

        debug!("compacting heartbeat consumer stopped");
    }

    async fn handle(self: &Arc<Self>, mut notification: Notification) {
        let err = match self.reconciler.reconcile(&notification).await {
            Ok(()) => return,
            Err(err) => err,
        };

        if err.is_not_found() {
            debug!(device = %notification.key(), "device not found, dropping heartbeat");
            return;
        }

        let Some(attempts) = self.retry_policy.next_attempt(notification.retry) else {
            error!(
                device = %notification.key(),
                retry = notification.retry,
                error = %err,
                "dropping heartbeat after exhausting retries"
            );
            return;
        };

        warn!(device = %notification.key(), retry = notification.retry, error = %err, "heartbeat failed, requeueing");
        notification.retry = attempts;

        let delay = self.retry_policy.delay_for(attempts);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.enqueue(notification),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use common::domain::{
        DeviceEvent, EdgeDevice, EdgeDeviceStatus, EventKind, Heartbeat, HeartbeatStatus,
        MockEdgeDeviceRepository, MockEventRecorder, MockMetrics,
    };
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn notification(
        device_id: &str,
        time: DateTime<Utc>,
        labels: &[(&str, &str)],
        reasons: &[&str],
    ) -> Notification {
        Notification::new(
            device_id,
            "fleet",
            Heartbeat {
                time,
                status: HeartbeatStatus {
                    phase: "up".to_string(),
                    labels: labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    ..Default::default()
                },
                events: reasons
                    .iter()
                    .map(|reason| DeviceEvent {
                        kind: EventKind::Normal,
                        reason: reason.to_string(),
                        message: String::new(),
                    })
                    .collect(),
            },
        )
    }

    fn handler(
        repository: MockEdgeDeviceRepository,
        recorder: MockEventRecorder,
        metrics: MockMetrics,
        shutdown_token: CancellationToken,
    ) -> CompactingHandler {
        CompactingHandler::new(
            HeartbeatReconciler::new(Arc::new(repository), Arc::new(recorder), Arc::new(metrics)),
            RetryPolicy::bounded(5, Duration::from_millis(1)),
            shutdown_token,
        )
    }

    #[test]
    fn test_coalesce_newer_status_wins_and_labels_union() {
        let t0 = Utc::now();
        let older = notification("dev-1", t0, &[("a", "1"), ("b", "1")], &["first"]);
        let newer = notification(
            "dev-1",
            t0 + ChronoDuration::seconds(1),
            &[("b", "2")],
            &["second"],
        );

        // Arrival order does not matter for which status wins
        let merged = coalesce(newer.clone(), older.clone());

        assert_eq!(merged.heartbeat.time, newer.heartbeat.time);
        assert_eq!(merged.heartbeat.status.labels.get("a").map(String::as_str), Some("1"));
        assert_eq!(merged.heartbeat.status.labels.get("b").map(String::as_str), Some("2"));
        let reasons: Vec<_> = merged.heartbeat.events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["first", "second"]);
        assert_eq!(merged.retry, 0);
    }

    #[test]
    fn test_coalesce_drops_already_emitted_events() {
        let t0 = Utc::now();
        let mut retried = notification("dev-1", t0, &[], &["emitted"]);
        retried.retry = 2;
        let fresh = notification("dev-1", t0 + ChronoDuration::seconds(1), &[], &["new"]);

        let merged = coalesce(retried, fresh);

        let reasons: Vec<_> = merged.heartbeat.events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["new"]);
        assert_eq!(merged.retry, 0);
    }

    #[test]
    fn test_coalesce_of_retries_keeps_retry_count() {
        let t0 = Utc::now();
        let mut first = notification("dev-1", t0, &[], &["emitted"]);
        first.retry = 3;
        let mut second = notification("dev-1", t0 + ChronoDuration::seconds(1), &[], &["emitted"]);
        second.retry = 1;

        let merged = coalesce(first, second);

        assert!(merged.heartbeat.events.is_empty());
        assert_eq!(merged.retry, 1);
    }

    #[test]
    fn test_queue_is_fifo_by_first_enqueue() {
        let t0 = Utc::now();
        let mut queue = CompactingQueue::default();

        assert!(!queue.push(notification("dev-1", t0, &[], &[])));
        assert!(!queue.push(notification("dev-2", t0, &[], &[])));
        assert!(queue.push(notification("dev-1", t0 + ChronoDuration::seconds(1), &[], &[])));
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        assert_eq!(first.device_id, "dev-1");
        assert_eq!(first.heartbeat.time, t0 + ChronoDuration::seconds(1));
        assert_eq!(queue.pop().unwrap().device_id, "dev-2");
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_burst_for_one_device_reconciles_once() {
        // Arrange
        let t0 = Utc::now();
        let patched = Arc::new(Mutex::new(Vec::<EdgeDeviceStatus>::new()));
        let patched_in_mock = patched.clone();

        let mut repository = MockEdgeDeviceRepository::new();
        repository
            .expect_read()
            .times(1)
            .returning(|_, _| Ok(EdgeDevice::new("fleet", "dev-1")));
        repository
            .expect_patch_status()
            .times(1)
            .returning(move |device, status| {
                patched_in_mock.lock().unwrap().push(status.clone());
                let mut stored = device.clone();
                stored.status = status;
                Ok(stored)
            });
        repository
            .expect_update_labels()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut recorder = MockEventRecorder::new();
        recorder.expect_emit().times(3).return_const(());

        let presence = Arc::new(AtomicU32::new(0));
        let presence_in_mock = presence.clone();
        let mut metrics = MockMetrics::new();
        metrics.expect_record_edge_device_presence().returning(move |_, _| {
            presence_in_mock.fetch_add(1, Ordering::SeqCst);
        });
        metrics.expect_set_process_heartbeat_time().return_const(());
        metrics.expect_set_patch_edge_device_status_time().return_const(());
        metrics.expect_set_patch_edge_device_time().return_const(());

        let shutdown_token = CancellationToken::new();
        let handler = handler(repository, recorder, metrics, shutdown_token.clone());

        // Act: queue a burst before the consumer runs
        for (offset, reason) in ["one", "two", "three"].iter().enumerate() {
            handler
                .process(
                    CancellationToken::new(),
                    notification(
                        "dev-1",
                        t0 + ChronoDuration::seconds(offset as i64),
                        &[("zone", "eu")],
                        &[reason],
                    ),
                )
                .await
                .unwrap();
        }
        assert_eq!(handler.pending(), 1);
        handler.start();

        // Assert
        tokio::time::timeout(Duration::from_secs(5), async {
            while presence.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let patched = patched.lock().unwrap();
        assert_eq!(patched[0].last_seen_time, Some(t0 + ChronoDuration::seconds(2)));
        shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_not_found_is_dropped_without_retry() {
        // Arrange
        let reads = Arc::new(AtomicU32::new(0));
        let reads_in_mock = reads.clone();
        let mut repository = MockEdgeDeviceRepository::new();
        repository.expect_read().returning(move |name, namespace| {
            reads_in_mock.fetch_add(1, Ordering::SeqCst);
            Err(DomainError::DeviceNotFound(format!("{namespace}/{name}")))
        });

        let shutdown_token = CancellationToken::new();
        let handler = handler(
            repository,
            MockEventRecorder::new(),
            MockMetrics::new(),
            shutdown_token.clone(),
        );
        handler.start();

        // Act
        handler
            .process(
                CancellationToken::new(),
                notification("gone", Utc::now(), &[], &[]),
            )
            .await
            .unwrap();

        // Assert
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(handler.pending(), 0);
        shutdown_token.cancel();
    }

    fn unavailable() -> DomainError {
        DomainError::RepositoryError(anyhow::anyhow!("store unavailable"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_heartbeat_is_retried_with_backoff_then_dropped() {
        // Arrange
        let reads = Arc::new(Mutex::new(Vec::<tokio::time::Instant>::new()));
        let reads_in_mock = reads.clone();
        let mut repository = MockEdgeDeviceRepository::new();
        repository.expect_read().returning(move |_, _| {
            reads_in_mock.lock().unwrap().push(tokio::time::Instant::now());
            Err(unavailable())
        });

        let shutdown_token = CancellationToken::new();
        let handler = CompactingHandler::new(
            HeartbeatReconciler::new(
                Arc::new(repository),
                Arc::new(MockEventRecorder::new()),
                Arc::new(MockMetrics::new()),
            ),
            RetryPolicy::bounded(5, Duration::from_millis(50)),
            shutdown_token.clone(),
        );
        handler.start();

        // Act
        handler
            .process(
                CancellationToken::new(),
                notification("dev-1", Utc::now(), &[], &[]),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Assert: five attempts spaced 50, 100, 150 and 200ms apart
        let reads = reads.lock().unwrap();
        assert_eq!(reads.len(), 5);
        for (attempt, pair) in reads.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let expected = Duration::from_millis(50 * (attempt as u64 + 1));
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(5),
                "attempt {} waited {:?}",
                attempt + 1,
                gap
            );
        }
        assert_eq!(handler.pending(), 0);
        shutdown_token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_heartbeat_merges_with_pending_without_reemitting() {
        // Arrange: reads succeed, status patches keep failing
        let t0 = Utc::now();
        let mut repository = MockEdgeDeviceRepository::new();
        repository
            .expect_read()
            .returning(|name, namespace| Ok(EdgeDevice::new(namespace, name)));
        repository
            .expect_patch_status()
            .returning(|_, _| Err(unavailable()));

        let emitted = Arc::new(Mutex::new(Vec::<String>::new()));
        let emitted_in_mock = emitted.clone();
        let mut recorder = MockEventRecorder::new();
        recorder.expect_emit().returning(move |_, _, reason, _| {
            emitted_in_mock.lock().unwrap().push(reason.to_string());
        });

        let mut metrics = MockMetrics::new();
        metrics.expect_set_patch_edge_device_status_time().return_const(());

        let shutdown_token = CancellationToken::new();
        let handler = CompactingHandler::new(
            HeartbeatReconciler::new(Arc::new(repository), Arc::new(recorder), Arc::new(metrics)),
            RetryPolicy::bounded(5, Duration::from_millis(50)),
            shutdown_token.clone(),
        );

        // Act: the first attempt fails and is requeued after 50ms, while a
        // newer heartbeat for the same device is already pending
        handler
            .inner
            .handle(notification("dev-1", t0, &[("zone", "eu")], &["first"]))
            .await;
        handler
            .process(
                CancellationToken::new(),
                notification("dev-1", t0 + ChronoDuration::seconds(1), &[], &["second"]),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Assert
        assert_eq!(handler.pending(), 1);
        let merged = handler.inner.lock_queue().pop().unwrap();
        let reasons: Vec<_> = merged.heartbeat.events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["second"]);
        assert_eq!(merged.retry, 0);
        assert_eq!(merged.heartbeat.time, t0 + ChronoDuration::seconds(1));
        assert_eq!(
            merged.heartbeat.status.labels.get("zone").map(String::as_str),
            Some("eu")
        );

        handler.inner.handle(merged).await;
        assert_eq!(*emitted.lock().unwrap(), vec!["first", "second"]);
        shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_retry_counter_at_ceiling_is_dropped_and_consumer_keeps_running() {
        // Arrange: "bad" always fails, "dev-1" reconciles
        let bad_reads = Arc::new(AtomicU32::new(0));
        let bad_reads_in_mock = bad_reads.clone();
        let mut repository = MockEdgeDeviceRepository::new();
        repository.expect_read().returning(move |name, namespace| {
            if name == "bad" {
                bad_reads_in_mock.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            } else {
                Ok(EdgeDevice::new(namespace, name))
            }
        });
        repository.expect_patch_status().returning(|device, status| {
            let mut stored = device.clone();
            stored.status = status;
            Ok(stored)
        });
        repository.expect_update_labels().returning(|_, _| Ok(()));

        let presence = Arc::new(AtomicU32::new(0));
        let presence_in_mock = presence.clone();
        let mut metrics = MockMetrics::new();
        metrics.expect_record_edge_device_presence().returning(move |_, _| {
            presence_in_mock.fetch_add(1, Ordering::SeqCst);
        });
        metrics.expect_set_process_heartbeat_time().return_const(());
        metrics.expect_set_patch_edge_device_status_time().return_const(());
        metrics.expect_set_patch_edge_device_time().return_const(());

        let shutdown_token = CancellationToken::new();
        let handler = handler(
            repository,
            MockEventRecorder::new(),
            metrics,
            shutdown_token.clone(),
        );
        handler.start();

        let mut exhausted = notification("bad", Utc::now(), &[], &["never"]);
        exhausted.retry = u32::MAX;

        // Act
        handler
            .process(CancellationToken::new(), exhausted)
            .await
            .unwrap();
        handler
            .process(
                CancellationToken::new(),
                notification("dev-1", Utc::now(), &[], &[]),
            )
            .await
            .unwrap();

        // Assert
        tokio::time::timeout(Duration::from_secs(5), async {
            while presence.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bad_reads.load(Ordering::SeqCst), 1);
        assert_eq!(handler.pending(), 0);
        shutdown_token.cancel();
    }

    #[tokio::test]
    async fn test_process_after_shutdown_is_rejected() {
        let shutdown_token = CancellationToken::new();
        let handler = handler(
            MockEdgeDeviceRepository::new(),
            MockEventRecorder::new(),
            MockMetrics::new(),
            shutdown_token.clone(),
        );
        shutdown_token.cancel();

        let result = handler
            .process(
                CancellationToken::new(),
                notification("dev-1", Utc::now(), &[], &[]),
            )
            .await;

        assert!(matches!(result, Err(DomainError::HandlerStopped)));
    }
}
