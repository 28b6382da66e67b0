use std::sync::Arc;

use clap::Parser;
use fleetwatch::{
    alarm::AlarmLifecycle,
    collector::{CollectorRegistry, HttpCollector},
    config::{Config, StorageConfig, read_config_file},
    notify::{DingTalkNotifier, Notifier, NullNotifier},
    rules::AlertRuleEngine,
    scheduler::{
        Scheduler,
        periodic::{Orchestrator, Retention},
    },
    storage::{
        AlarmStore, MemoryAlarmStore, MemoryConfigStore, MemoryDeviceRegistry, MemoryMetricStore,
        MetricStore, TaskArchive,
    },
    task::TaskTracker,
};
use serde_json::json;
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleetwatch", LevelFilter::TRACE),
        ("hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    dotenv::dotenv().ok();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let collectors = CollectorRegistry::new();
    collectors
        .register(
            "http",
            Arc::new(HttpCollector::new()),
            Some(json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                }
            })),
        )
        .await;

    let mut retention = Retention {
        task_days: config.scheduler.task_retention_days,
        ..Retention::default()
    };

    let (metric_store, alarm_store, task_archive) = build_stores(&config, &mut retention).await?;

    let notifier: Arc<dyn Notifier> = match &config.notify.dingtalk {
        Some(dingtalk) => Arc::new(DingTalkNotifier::new(dingtalk.clone())),
        None => {
            warn!("no notification channel configured, alarms will not be dispatched");
            Arc::new(NullNotifier)
        }
    };

    let alarms = Arc::new(AlarmLifecycle::new(alarm_store, notifier));
    let rules = Arc::new(AlertRuleEngine::new(config.rules.clone().unwrap_or_default()));
    let tracker = Arc::new(TaskTracker::new());

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        collectors,
        metric_store.clone(),
        rules,
        alarms.clone(),
        tracker,
    ));

    let devices = Arc::new(MemoryDeviceRegistry::new(
        config.devices.clone().unwrap_or_default(),
    ));
    let monitors = Arc::new(MemoryConfigStore::new(
        config.monitors.clone().unwrap_or_default(),
    ));

    let orchestrator = Orchestrator::new(
        scheduler.clone(),
        devices,
        monitors,
        alarms,
        metric_store,
        task_archive,
        retention,
    );
    let orchestrator_handle = tokio::spawn(orchestrator.run());

    info!("fleetwatch hub running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    scheduler.cancel();
    orchestrator_handle.await?;

    if let Ok(scheduler) = Arc::try_unwrap(scheduler) {
        scheduler.shutdown().await;
    }

    Ok(())
}

type Stores = (
    Arc<dyn MetricStore>,
    Arc<dyn AlarmStore>,
    Option<Arc<dyn TaskArchive>>,
);

async fn build_stores(config: &Config, retention: &mut Retention) -> anyhow::Result<Stores> {
    match config.storage.clone().unwrap_or(StorageConfig::None) {
        StorageConfig::None => {
            info!("using in-memory storage (no persistence)");
            Ok((
                Arc::new(MemoryMetricStore::new()),
                Arc::new(MemoryAlarmStore::new()),
                None,
            ))
        }
        StorageConfig::Sqlite {
            path,
            retention_days,
        } => {
            #[cfg(feature = "storage-sqlite")]
            {
                let backend = Arc::new(fleetwatch::storage::SqliteBackend::new(&path).await?);
                retention.metric_days = retention_days;
                Ok((backend.clone(), backend.clone(), Some(backend)))
            }
            #[cfg(not(feature = "storage-sqlite"))]
            {
                let _ = (path, retention_days, retention);
                warn!(
                    "sqlite storage requested but the storage-sqlite feature is disabled, using in-memory storage"
                );
                Ok((
                    Arc::new(MemoryMetricStore::new()),
                    Arc::new(MemoryAlarmStore::new()),
                    None,
                ))
            }
        }
    }
}
