//! spindle - run the worker pool, or poke at tasks from the command line.
//!
//! Configuration comes from the environment (a `.env` file is honoured):
//! WORKER_COUNT, REDIS_ADDR, BROKER_KEY, DATABASE_URL, LOG_FORMAT, RUST_LOG.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use spindle_core::app::{TaskService, WorkerConfig, WorkerPool, WorkerPoolBuilder};
use spindle_core::config::Settings;
use spindle_core::domain::{NewTask, RetryPolicy, TaskId, TaskRecord, TaskStatus};
use spindle_core::impls::{DoubleExecutor, FaultInjector, InMemoryBroker, InMemoryRecordStore};
use spindle_core::observability::init_tracing;
use spindle_core::ports::{Broker, RecordStore};

#[derive(Parser)]
#[command(name = "spindle", about = "Broker-backed background task processor")]
struct Cli {
    /// Use process-local broker and store instead of Redis and PostgreSQL
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until SIGINT or SIGTERM
    Run {
        /// Overrides WORKER_COUNT; must be a positive integer
        #[arg(long, value_parser = positive_count)]
        workers: Option<usize>,
        /// Fraction of executions to fail on purpose (chaos runs only)
        #[arg(long, env = "SPINDLE_FAIL_RATE", default_value_t = 0.0)]
        fail_rate: f64,
    },
    /// Submit a task
    Submit {
        /// Task type, e.g. "double"
        task_type: String,
        /// Raw payload, e.g. "5"
        payload: String,
    },
    /// Show one task
    Get { id: TaskId },
    /// List tasks, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Cancel a task that is still queued
    Cancel { id: TaskId },
    /// Per-status counts and broker depth
    Status,
    /// Submit a batch of `double` tasks to an in-memory pool and wait for them
    Demo {
        #[arg(long, default_value_t = 20)]
        tasks: u32,
        #[arg(long, default_value_t = 0.3)]
        fail_rate: f64,
        /// Retry backoff base, shrunk so the demo finishes quickly
        #[arg(long, default_value_t = 100)]
        base_delay_ms: u64,
    },
}

/// Human-readable record: payload and result as text rather than base64.
#[derive(Serialize)]
struct RecordView {
    id: TaskId,
    #[serde(rename = "type")]
    task_type: String,
    status: TaskStatus,
    retries: u32,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<&TaskRecord> for RecordView {
    fn from(r: &TaskRecord) -> Self {
        Self {
            id: r.id,
            task_type: r.task_type.to_string(),
            status: r.status,
            retries: r.retries,
            payload: r.payload.to_string_lossy(),
            result: r.result.as_ref().map(|p| p.to_string_lossy()),
            last_error: r.last_error.clone(),
            created_at: r.created_at.to_rfc3339(),
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

fn positive_count(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("{raw:?} is not a positive integer")),
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::from_env();
    init_tracing(settings.log_format);
    for warning in settings.warnings() {
        tracing::warn!("{warning}");
    }

    if let Commands::Demo {
        tasks,
        fail_rate,
        base_delay_ms,
    } = cli.command
    {
        return demo(tasks, fail_rate, Duration::from_millis(base_delay_ms)).await;
    }

    let (broker, store) = backends(&settings, cli.memory).await?;
    let service = TaskService::new(broker.clone(), store.clone());

    match cli.command {
        Commands::Run { workers, fail_rate } => {
            let mut config = settings.worker_config();
            if let Some(workers) = workers {
                config = config.with_worker_count(workers);
            }
            let pool = build_pool(broker, store, config, RetryPolicy::default(), fail_rate)?;
            let handle = pool.spawn();

            shutdown_signal().await;
            tracing::info!("shutdown requested, waiting for workers");
            handle.shutdown_and_join().await;
        }
        Commands::Submit { task_type, payload } => {
            let record = service
                .submit(NewTask::new(task_type, payload.as_str()))
                .await
                .context("Submit task")?;
            print_json(&RecordView::from(&record))?;
        }
        Commands::Get { id } => {
            let record = service.get(id).await?;
            print_json(&RecordView::from(&record))?;
        }
        Commands::List { status } => {
            let records = service.list(status).await?;
            let views: Vec<RecordView> = records.iter().map(RecordView::from).collect();
            print_json(&views)?;
        }
        Commands::Cancel { id } => {
            service.cancel(id).await?;
            print_json(&serde_json::json!({ "id": id, "status": TaskStatus::Cancelled }))?;
        }
        Commands::Status => {
            let counts = service.counts().await?;
            let depth = service.broker_depth().await?;
            print_json(&serde_json::json!({ "counts": counts, "broker_depth": depth }))?;
        }
        Commands::Demo { .. } => {}
    }

    Ok(())
}

fn build_pool(
    broker: Arc<dyn Broker>,
    store: Arc<dyn RecordStore>,
    config: WorkerConfig,
    policy: RetryPolicy,
    fail_rate: f64,
) -> anyhow::Result<WorkerPool> {
    let builder = WorkerPoolBuilder::new(broker, store)
        .config(config)
        .retry_policy(policy);
    let builder = if fail_rate > 0.0 {
        tracing::warn!(fail_rate, "fault injection enabled");
        builder.register(
            DoubleExecutor::TYPE,
            FaultInjector::new(DoubleExecutor, fail_rate),
        )?
    } else {
        builder.register(DoubleExecutor::TYPE, DoubleExecutor)?
    };
    let pool = builder
        .expect_types(&[DoubleExecutor::TYPE])
        .build()
        .context("Build worker pool")?;
    Ok(pool)
}

async fn demo(tasks: u32, fail_rate: f64, base_delay: Duration) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let service = TaskService::new(broker.clone(), store.clone());

    let config = WorkerConfig::default().with_poll_timeout(Duration::from_millis(200));
    let policy = RetryPolicy::default().with_base_delay(base_delay);
    let handle = build_pool(broker, store, config, policy, fail_rate)?.spawn();

    for n in 1..=tasks {
        service
            .submit(NewTask::new(DoubleExecutor::TYPE, n.to_string().as_str()))
            .await?;
    }

    // 全タスクが終端状態になるまで待つ
    loop {
        let counts = service.counts().await?;
        if counts.terminal() >= tasks as usize {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.shutdown_and_join().await;

    print_json(&service.counts().await?)?;
    Ok(())
}

async fn backends(
    settings: &Settings,
    memory: bool,
) -> anyhow::Result<(Arc<dyn Broker>, Arc<dyn RecordStore>)> {
    if memory {
        tracing::info!("using in-memory broker and record store");
        return Ok((
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryRecordStore::new()),
        ));
    }
    Ok((connect_broker(settings).await?, connect_store(settings).await?))
}

#[cfg(feature = "redis")]
async fn connect_broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    let broker =
        spindle_core::impls::RedisBroker::connect(&settings.redis_url, settings.broker_key.as_str())
            .await
            .with_context(|| format!("Connect to Redis at {}", settings.redis_url))?;
    tracing::info!(url = %settings.redis_url, key = %settings.broker_key, "redis broker ready");
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(_settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    tracing::warn!("built without the redis feature, falling back to the in-memory broker");
    Ok(Arc::new(InMemoryBroker::new()))
}

#[cfg(feature = "postgres")]
async fn connect_store(settings: &Settings) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store = spindle_core::impls::PgRecordStore::connect(&settings.database_url)
        .await
        .context("Connect to PostgreSQL")?;
    store.ensure_schema().await.context("Create tasks table")?;
    tracing::info!("postgres record store ready");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_store(_settings: &Settings) -> anyhow::Result<Arc<dyn RecordStore>> {
    tracing::warn!("built without the postgres feature, falling back to the in-memory store");
    Ok(Arc::new(InMemoryRecordStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
