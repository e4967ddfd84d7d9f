//! Runs named long-lived processes side by side and shuts them down together.
//!
//! - Every process receives the same cancellation token
//! - The first failing process cancels the rest
//! - SIGINT/SIGTERM cancel all processes
//! - Closers run afterwards under a shared timeout, whatever the outcome
//!
//! # Example
//!
//! ```no_run
//! use fleet_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Runner::new()
//!         .with_named_process("ticker", |ctx| async move {
//!             while !ctx.is_cancelled() {
//!                 tokio::time::sleep(Duration::from_secs(1)).await;
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .run()
//!         .await
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub type Closer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds; signal handling is on
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("process-{}", self.app_processes.len());
        self.with_named_process(name, process)
    }

    /// Add a process; its name shows up in shutdown logs
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Closers run concurrently after every process has stopped
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Do not install SIGINT/SIGTERM handlers
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run until every process has returned, one fails, or a shutdown signal
    /// arrives. Returns the first process error.
    pub async fn run(self) -> anyhow::Result<()> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        if self.handle_signals {
            let signal_token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal_token.cancelled() => {}
                    _ = shutdown_signal() => signal_token.cancel(),
                }
            });
        }

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(process = %name, "process completed"),
                Ok((name, Err(err))) => {
                    if token.is_cancelled() {
                        warn!(process = %name, error = %format!("{err:#}"), "process failed during shutdown");
                    } else {
                        error!(process = %name, error = %format!("{err:#}"), "process failed, shutting down");
                        first_error = Some(err.context(format!("process '{name}' failed")));
                        token.cancel();
                    }
                }
                Err(err) => {
                    error!(error = %err, "process panicked, shutting down");
                    if first_error.is_none() && !token.is_cancelled() {
                        first_error = Some(anyhow::anyhow!("process panicked: {err}"));
                    }
                    token.cancel();
                }
            }
        }

        Self::run_closers(self.closers, self.closer_timeout).await;

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("all processes stopped");
                Ok(())
            }
        }
    }

    async fn run_closers(closers: Vec<Closer>, timeout: Duration) {
        if closers.is_empty() {
            return;
        }

        info!(timeout_ms = timeout.as_millis() as u64, "running closers");
        let mut closer_set = JoinSet::new();
        for closer in closers {
            closer_set.spawn(closer());
        }

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = closer_set.join_next().await {
                match joined {
                    Ok(Ok(())) => debug!("closer completed"),
                    Ok(Err(err)) => error!(error = %format!("{err:#}"), "closer failed"),
                    Err(err) => error!(error = %err, "closer panicked"),
                }
            }
        })
        .await;

        if drained.is_err() {
            error!(timeout_ms = timeout.as_millis() as u64, "closers timed out");
            closer_set.abort_all();
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT"),
            Err(err) => {
                error!(error = %err, "cannot listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
            }
            Err(err) => {
                error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
