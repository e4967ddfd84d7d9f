use crate::domain::{
    create_notification_handler, HandlerDependencies, HeartbeatHandlerConfig, NotificationHandler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Owns the configured notification handler and ties its workers to the
/// lifetime of a runner process.
pub struct HeartbeatWorker {
    handler: Arc<dyn NotificationHandler>,
    handler_shutdown_token: CancellationToken,
}

impl HeartbeatWorker {
    pub fn new(deps: HandlerDependencies, config: &HeartbeatHandlerConfig) -> Self {
        debug!(strategy = %config.strategy, "initializing heartbeat worker");

        let handler_shutdown_token = CancellationToken::new();
        let handler = create_notification_handler(config, deps, handler_shutdown_token.clone());

        Self::from_handler(handler, handler_shutdown_token)
    }

    pub fn from_handler(
        handler: Arc<dyn NotificationHandler>,
        handler_shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            handler,
            handler_shutdown_token,
        }
    }

    /// Handle for submitting notifications
    pub fn handler(&self) -> Arc<dyn NotificationHandler> {
        Arc::clone(&self.handler)
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new(move |ctx| {
            Box::pin(async move {
                self.handler.start();
                info!("heartbeat worker started");

                ctx.cancelled().await;
                self.handler_shutdown_token.cancel();
                info!("heartbeat worker stopped");
                Ok(())
            })
        })
    }
}
