use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tradebot::controller::{ControllerRegistry, ControllerRunner};
use tradebot::gateway::{ExchangeGateway, PaperGateway};
use tradebot::market_data::{BookTickerFeed, MarketDataProvider, PriceBoard};
use tradebot::orchestrator::Orchestrator;
use tradebot::persistence::{InMemoryRecorder, PostgresRecorder, Recorder, RedisRecorder};
use tradebot::settings::{RecorderBackend, RecorderSettings, Settings};

#[derive(Parser, Debug)]
#[command(name = "tradebot", about = "Controller / executor trading runtime")]
struct Args {
    /// Settings file (TOML). Defaults to config/default.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tracing filter, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Recorder backend, overrides the settings file
    #[arg(long, value_enum)]
    recorder: Option<RecorderBackend>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.log_filter.as_deref());

    let mut settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    if let Some(backend) = args.recorder {
        settings.recorder.backend = backend;
        settings.validate().context("validating settings")?;
    }

    tracing::info!(
        controllers = settings.controllers.len(),
        recorder = ?settings.recorder.backend,
        "🚀 tradebot starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Market data
    let board = Arc::new(PriceBoard::new());
    let mut feed_task = None;
    if let Some(base_url) = &settings.market_data.base_url {
        let mut instruments = settings.market_data.instruments.clone();
        for controller in &settings.controllers {
            if !instruments.contains(&controller.instrument) {
                instruments.push(controller.instrument.clone());
            }
        }
        let feed = BookTickerFeed::new(base_url.clone(), settings.market_data.requests_per_minute, board.clone())
            .context("building book ticker feed")?;
        feed_task = Some(tokio::spawn(feed.run(
            instruments,
            settings.market_data.poll_interval(),
            shutdown_rx.clone(),
        )));
    } else {
        tracing::warn!("market_data.base_url not set, prices must be published by another source");
    }

    let market: Arc<dyn MarketDataProvider> = board.clone();
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(PaperGateway::new(board.clone(), settings.gateway.taker_fee));
    let recorder = connect_recorder(&settings.recorder).await?;

    let mut orchestrator = Orchestrator::new(settings.orchestrator.clone(), gateway, market.clone(), recorder)
        .with_recorder_retry(settings.recorder.retry.clone());
    let recovered = orchestrator
        .recover()
        .await
        .context("recovering orchestrator state")?;
    tracing::info!(
        executors = recovered.executors,
        archived = recovered.archived,
        closed_positions = recovered.closed_positions,
        held_positions = recovered.held_positions,
        "State recovered"
    );

    // Controllers
    let registry = ControllerRegistry::with_builtins();
    let mut controller_tasks = Vec::new();
    let mut handles = Vec::new();
    for controller_settings in &settings.controllers {
        let controller = registry
            .build(controller_settings)
            .with_context(|| format!("building controller '{}'", controller_settings.id))?;
        let (runner, handle) = ControllerRunner::new(
            controller,
            market.clone(),
            orchestrator.reports(),
            orchestrator.sender(controller_settings.id.clone()),
            controller_settings.tick_interval(),
        );
        handles.push(handle);
        controller_tasks.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }
    if handles.is_empty() {
        tracing::warn!("No controllers configured, only recovered executors will run");
    }

    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    for task in controller_tasks {
        task.await.ok();
    }
    if let Some(task) = feed_task {
        task.await.ok();
    }
    let summary = orchestrator_task.await.context("orchestrator task")?;
    drop(handles);

    if !summary.failed.is_empty() {
        tracing::warn!(failed = ?summary.failed, "Executors closed as failed at shutdown");
    }
    if summary.persistence_degraded {
        tracing::error!("Shutdown finished with unsaved state");
    }
    tracing::info!("👋 tradebot stopped");
    Ok(())
}

fn setup_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => tracing_subscriber::EnvFilter::new(filter),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradebot=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_recorder(settings: &RecorderSettings) -> Result<Arc<dyn Recorder>> {
    let recorder: Arc<dyn Recorder> = match settings.backend {
        RecorderBackend::Memory => {
            tracing::warn!("In-memory recorder, state is lost on exit");
            Arc::new(InMemoryRecorder::new())
        }
        RecorderBackend::Redis => {
            let Some(url) = &settings.url else {
                bail!("recorder.url is required for redis");
            };
            let recorder = RedisRecorder::new(url, &settings.namespace)
                .await
                .context("connecting to redis")?;
            tracing::info!(namespace = %settings.namespace, "Redis recorder connected");
            Arc::new(recorder)
        }
        RecorderBackend::Postgres => {
            let Some(url) = &settings.url else {
                bail!("recorder.url is required for postgres");
            };
            let recorder = PostgresRecorder::new(url)
                .await
                .context("connecting to postgres")?;
            tracing::info!("Postgres recorder connected");
            Arc::new(recorder)
        }
    };
    Ok(recorder)
}
