use anyhow::Context;
use common::domain::{Heartbeat, Notification};
use heartbeat_worker::NotificationHandler;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One line of a heartbeat replay file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRecord {
    device_id: String,
    namespace: String,
    heartbeat: Heartbeat,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub accepted: usize,
    pub rejected: usize,
    pub malformed: usize,
}

pub fn parse_record(line: &str) -> anyhow::Result<Notification> {
    let record: HeartbeatRecord =
        serde_json::from_str(line).context("malformed heartbeat record")?;
    Ok(Notification::new(
        record.device_id,
        record.namespace,
        record.heartbeat,
    ))
}

/// Feed every JSON line from `reader` through the handler until the input
/// ends or `ctx` is cancelled
pub async fn replay_lines<R>(
    reader: R,
    handler: &dyn NotificationHandler,
    ctx: CancellationToken,
) -> anyhow::Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            line = lines.next_line() => line.context("failed to read heartbeat replay")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let notification = match parse_record(&line) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "skipping heartbeat record");
                summary.malformed += 1;
                continue;
            }
        };

        let device_id = notification.device_id.clone();
        match handler.process(ctx.clone(), notification).await {
            Ok(()) => summary.accepted += 1,
            Err(err) => {
                debug!(device_id = %device_id, error = %err, "heartbeat not applied");
                summary.rejected += 1;
            }
        }
    }

    Ok(summary)
}

/// Replays a heartbeat file as a runner process
pub struct HeartbeatReplay {
    path: String,
    handler: Arc<dyn NotificationHandler>,
}

impl HeartbeatReplay {
    pub fn new(path: impl Into<String>, handler: Arc<dyn NotificationHandler>) -> Self {
        Self {
            path: path.into(),
            handler,
        }
    }

    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open heartbeat replay {}", self.path))?;

        let summary = replay_lines(BufReader::new(file), self.handler.as_ref(), ctx).await?;
        info!(
            path = %self.path,
            accepted = summary.accepted,
            rejected = summary.rejected,
            malformed = summary.malformed,
            "heartbeat replay finished"
        );
        Ok(())
    }
}
