use crate::domain::{
    CompactingHandler, HeartbeatHandlerConfig, HeartbeatReconciler, ProcessAllHandler,
    SynchronousHandler,
};
use async_trait::async_trait;
use common::domain::{DomainResult, EdgeDeviceRepository, EventRecorder, Metrics, Notification};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Accepts heartbeat notifications and drives them into the device store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Launch background workers. Idempotent; a no-op for handlers without any.
    fn start(&self);

    /// Hand over one notification.
    ///
    /// Synchronous handlers return the reconciliation outcome. Queueing
    /// handlers return once the notification is accepted.
    async fn process(&self, ctx: CancellationToken, notification: Notification) -> DomainResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStrategy {
    Synchronous,
    Compacting,
    ProcessAll,
}

impl fmt::Display for HandlerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerStrategy::Synchronous => "synchronous",
            HandlerStrategy::Compacting => "compacting",
            HandlerStrategy::ProcessAll => "process_all",
        };
        f.write_str(name)
    }
}

impl FromStr for HandlerStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "synchronous" => Ok(HandlerStrategy::Synchronous),
            "compacting" => Ok(HandlerStrategy::Compacting),
            "process_all" => Ok(HandlerStrategy::ProcessAll),
            other => anyhow::bail!(
                "unknown handler strategy '{other}', expected synchronous, compacting or process_all"
            ),
        }
    }
}

/// Collaborators every handler reconciles through
#[derive(Clone)]
pub struct HandlerDependencies {
    pub device_repository: Arc<dyn EdgeDeviceRepository>,
    pub recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<dyn Metrics>,
}

/// Build the handler selected by `config.strategy`.
///
/// Queueing handlers stop their workers when `shutdown_token` is cancelled.
pub fn create_notification_handler(
    config: &HeartbeatHandlerConfig,
    deps: HandlerDependencies,
    shutdown_token: CancellationToken,
) -> Arc<dyn NotificationHandler> {
    let reconciler = HeartbeatReconciler::new(deps.device_repository, deps.recorder, deps.metrics);

    info!(strategy = %config.strategy, "creating heartbeat notification handler");

    match config.strategy {
        HandlerStrategy::Synchronous => Arc::new(SynchronousHandler::new(
            reconciler,
            config.synchronous_retry.clone(),
        )),
        HandlerStrategy::Compacting => Arc::new(CompactingHandler::new(
            reconciler,
            config.compacting_retry.clone(),
            shutdown_token,
        )),
        HandlerStrategy::ProcessAll => Arc::new(ProcessAllHandler::new(
            reconciler,
            config.process_all_retry.clone(),
            config.workers,
            shutdown_token,
        )),
    }
}
