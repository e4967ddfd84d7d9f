mod config;
mod replay;
mod seed;

use common::domain::{Metrics, StoreEdgeDeviceRepository};
use common::events::TracingEventRecorder;
use common::memory::InMemoryDeviceStore;
use common::metrics::{register_metrics, PrometheusMetrics};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use crate::config::ServiceConfig;
use fleet_runner::Runner;
use heartbeat_worker::{HandlerDependencies, HeartbeatWorker};
use metrics_exporter_prometheus::PrometheusBuilder;
use replay::HeartbeatReplay;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
        json_logs: config.json_logs,
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        strategy = %config.handler_strategy,
        otel_enabled = config.otel_enabled,
        "Starting fleet-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    let runner = match build_runner(&config).await {
        Ok(runner) => runner,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to initialize service");
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let result = runner
        .with_closer(move || async move {
            info!("Shutting down telemetry");
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer_timeout(config.shutdown_timeout())
        .run()
        .await;

    if let Err(e) = result {
        eprintln!("Service stopped with error: {:#}", e);
        std::process::exit(1);
    }
}

async fn build_runner(config: &ServiceConfig) -> anyhow::Result<Runner> {
    if config.metrics_enabled {
        let listen_addr: SocketAddr = config.metrics_listen_addr.parse()?;
        PrometheusBuilder::new()
            .with_http_listener(listen_addr)
            .install()?;
        register_metrics();
        info!(%listen_addr, "Prometheus exporter listening");
    }

    let handler_config = config.handler_config()?;
    let seed_keys = config.seed_device_keys()?;

    let store = Arc::new(InMemoryDeviceStore::new());
    let metrics: Arc<dyn Metrics> = Arc::new(PrometheusMetrics::new());
    seed::seed_devices(store.as_ref(), metrics.as_ref(), &seed_keys).await;

    let deps = HandlerDependencies {
        device_repository: Arc::new(StoreEdgeDeviceRepository::new(store)),
        recorder: Arc::new(TracingEventRecorder::new()),
        metrics,
    };
    let worker = HeartbeatWorker::new(deps, &handler_config);
    let handler = worker.handler();

    let mut runner = Runner::new().with_named_process("heartbeat_worker", worker.into_runner_process());

    if let Some(path) = &config.heartbeat_replay_path {
        let replay = HeartbeatReplay::new(path.clone(), handler);
        runner = runner.with_named_process("heartbeat_replay", move |ctx| replay.run(ctx));
    }

    Ok(runner)
}
