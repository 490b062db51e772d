use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_writer::admin::ensure_required_topics;
use telemetry_writer::config::Config;
use telemetry_writer::dlq::DlqProducer;
use telemetry_writer::health::{self, HealthState};
use telemetry_writer::pool::WorkerPool;
use telemetry_writer::source::MessageSource;
use telemetry_writer::source::kafka::KafkaSource;
use telemetry_writer::stats::{self, Counters, StatsReporter};
use telemetry_writer::store::EventStore;
use telemetry_writer::store::clickhouse_store::ClickHouseStore;
use telemetry_writer::worker::WorkerSettings;
use telemetry_writer::writer::{RetryPolicy, Writer};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::from_env().context("load writer config")?;

    if config.kafka_auto_create_topics {
        ensure_required_topics(&config)
            .await
            .context("ensure kafka topics")?;
    }

    let store = ClickHouseStore::connect(&config)
        .await
        .context("connect to clickhouse")?;
    if config.clickhouse_create_table {
        store
            .ensure_table()
            .await
            .context("ensure clickhouse table")?;
    }
    let store: Arc<dyn EventStore> = Arc::new(store);

    let dlq = if config.max_deliver > 0 {
        Some(DlqProducer::from_config(&config).context("initialize dlq producer")?)
    } else {
        None
    };

    let mut sources: Vec<Arc<dyn MessageSource>> = Vec::with_capacity(config.worker_count);
    for worker_id in 0..config.worker_count {
        let source = tokio::task::block_in_place(|| {
            KafkaSource::connect(&config, worker_id, dlq.clone())
        })
        .with_context(|| format!("initialize kafka consumer for worker {worker_id}"))?;
        sources.push(Arc::new(source));
    }

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_on_signal(cancel.clone()));

    let counters = Arc::new(Counters::default());
    let writer = Writer::new(
        store,
        RetryPolicy::new(config.insert_max_retries, config.insert_retry_backoff()),
    );
    let settings = WorkerSettings {
        batch_size: config.batch_size,
        batch_timeout: config.batch_timeout(),
        fetch_wait: config.fetch_wait(),
    };
    let pool = WorkerPool::new(writer, counters.clone(), settings, config.max_deliver);

    let reporter = {
        let counters = counters.clone();
        let cancel = cancel.clone();
        let interval = config.stats_interval();
        tokio::spawn(async move { StatsReporter::new(interval).run(&counters, cancel).await })
    };

    let health_server = config.health_bind.clone().map(|bind| {
        let state = HealthState {
            status: pool.status(),
            counters: counters.clone(),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = health::serve(&bind, state, cancel).await {
                error!(error = %format!("{error:#}"), "health server failed");
            }
        })
    });

    info!(
        workers = config.worker_count,
        batch_size = config.batch_size,
        batch_timeout_ms = config.batch_timeout_ms,
        topic = %config.kafka_topic,
        table = %config.clickhouse_table,
        "telemetry writer started"
    );

    pool.run(sources, cancel.clone()).await;

    cancel.cancel();
    let _ = reporter.await;
    if let Some(health_server) = health_server {
        let _ = health_server.await;
    }
    signals.abort();

    stats::log_final(&counters);
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            error!(error = %error, "install SIGTERM handler failed");
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT; shutting down"),
        _ = terminate.recv() => info!("received SIGTERM; shutting down"),
    }
    cancel.cancel();
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
