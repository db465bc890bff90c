use anyhow::Result;
use futures::future;
use sensor_rollups::config::Config;
use sensor_rollups::ingest::{ReadingIngestor, RetryPolicy};
use sensor_rollups::pipeline::{spawn_workers, IngestStats, PipelineOptions};
use sensor_rollups::rollup::{spawn_refresh_scheduler, RollupRefresher};
use sensor_rollups::store::{build_pool, ensure_schema, PgStore};
use sensor_rollups::{mqtt, offsets};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

const ACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

enum Exit {
    Mqtt(Result<Result<()>, JoinError>),
    Ack(Result<(), JoinError>),
    Signal,
}

/// Resolves when the task finishes; never resolves for `None`.
async fn wait_for<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => future::pending().await,
    }
}

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_rollups=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-rollups"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    ensure_schema(&pool).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let stats = Arc::new(IngestStats::new());

    let (ack_tx, ack_rx) = offsets::channel();
    let ack_tx = config.enable_mqtt_listener.then_some(ack_tx);
    let mut ack_handle = if config.enable_mqtt_listener {
        let ack_config = config.clone();
        let ack_pool = pool.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = offsets::run_ack_manager(ack_config, ack_pool, ack_rx).await {
                tracing::error!(error = %err, "offset manager exited");
            }
        }))
    } else {
        None
    };

    let ingestor = ReadingIngestor::new(
        store.clone(),
        store.clone(),
        RetryPolicy::from_config(&config),
        stats.clone(),
    );
    let (pipeline, worker_handles) = spawn_workers(
        ingestor,
        PipelineOptions {
            workers: config.workers,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_queue: config.max_queue,
        },
        ack_tx,
    );
    tracing::info!(
        workers = pipeline.worker_count(),
        batch_size = config.batch_size,
        "ingest pipeline started"
    );

    let refresher = RollupRefresher::new(store.clone(), store.clone());
    let refresh_handle = config
        .refresh_interval()
        .map(|interval| spawn_refresh_scheduler(refresher, interval));

    let mut mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let pipeline_clone = pipeline.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, pipeline_clone).await
        }))
    } else {
        None
    };

    let exit = tokio::select! {
        res = wait_for(&mut mqtt_handle) => Exit::Mqtt(res),
        res = wait_for(&mut ack_handle) => Exit::Ack(res),
        _ = tokio::signal::ctrl_c() => Exit::Signal,
    };
    match exit {
        Exit::Mqtt(res) => {
            mqtt_handle = None;
            match res {
                Ok(Err(err)) => tracing::warn!(error = %err, "MQTT listener exited"),
                Err(err) => tracing::warn!(error = %err, "MQTT task failed"),
                Ok(Ok(())) => {}
            }
        }
        Exit::Ack(res) => {
            ack_handle = None;
            if let Err(err) = res {
                tracing::warn!(error = %err, "offset manager task failed");
            }
        }
        Exit::Signal => tracing::info!("shutdown signal received"),
    }

    if let Some(handle) = refresh_handle {
        handle.abort();
    }
    // The listener owns a pipeline handle; the workers only drain once it
    // is gone.
    if let Some(handle) = mqtt_handle.take() {
        handle.abort();
        let _ = handle.await;
    }
    pipeline.shutdown(worker_handles).await;
    if let Some(handle) = ack_handle.take() {
        match tokio::time::timeout(ACK_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => tracing::info!("committed offsets saved"),
            Ok(Err(err)) => tracing::warn!(error = %err, "offset manager task failed"),
            Err(_) => tracing::warn!("timed out saving committed offsets"),
        }
    }
    tracing::info!(
        received = stats.received.load(Ordering::Relaxed),
        written = stats.written.load(Ordering::Relaxed),
        dropped = stats.dropped.load(Ordering::Relaxed),
        dead_lettered = stats.dead_lettered.load(Ordering::Relaxed),
        "ingest stopped"
    );

    Ok(())
}
