use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use echo_monitor::broker::{Broker, RedisBroker};
use echo_monitor::config::{Cli, Command, Settings};
use echo_monitor::logging;
use echo_monitor::scheduler::Scheduler;
use echo_monitor::server;
use echo_monitor::stats::PipelineStats;
use echo_monitor::store::PgStore;
use echo_monitor::worker::{HttpProber, RegionWorker};
use echo_monitor::writer::BatchWriter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init_tracing(&cli.settings.log_config());

    if let Err(e) = run(cli.command, cli.settings).await {
        error!("startup failed: {e:#}");
        std::process::exit(1);
    }
}

/// Each consuming loop gets its own connection: a blocking group read
/// holds the multiplexed connection until it returns.
async fn connect_broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::connect(&settings.redis_url)
        .await
        .context("connecting to redis")?;
    Ok(Arc::new(broker))
}

async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    let run_scheduler = matches!(command, Command::Scheduler | Command::All);
    let run_writer = matches!(command, Command::Writer | Command::All);
    let run_worker = matches!(command, Command::Worker | Command::All);

    // ── 1. Validate configuration ───────────────────────────────
    settings.validate()?;
    let writer_config = run_writer.then(|| settings.writer_config()).transpose()?;
    let worker_config = run_worker.then(|| settings.worker_config()).transpose()?;
    let probe_timeout = settings.probe_timeout()?;

    info!(?command, version = env!("CARGO_PKG_VERSION"), "echo-monitor starting");

    // ── 2. Connect to the store ─────────────────────────────────
    let store = Arc::new(
        PgStore::connect(&settings.database_url, settings.database_max_connections)
            .await
            .context("connecting to database")?,
    );
    if settings.init_schema {
        store.ensure_schema().await.context("creating schema")?;
    }

    // ── 3. Shared state & shutdown signal ───────────────────────
    let stats = Arc::new(PipelineStats::new());
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
        });
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── 4. Stats listener ───────────────────────────────────────
    if let Some(addr) = settings.stats_addr {
        let stats = Arc::clone(&stats);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(addr, stats, shutdown).await {
                error!(%addr, error = %e, "stats listener failed");
            }
        }));
    }

    // ── 5. Components ───────────────────────────────────────────
    if run_scheduler {
        let scheduler = Arc::new(Scheduler::new(
            connect_broker(&settings).await?,
            store.clone(),
            settings.check_stream.clone(),
            Arc::clone(&stats),
        ));
        tasks.extend(scheduler.spawn(shutdown.clone()));
    }

    if let Some(config) = writer_config {
        let writer = BatchWriter::start(
            config,
            connect_broker(&settings).await?,
            store.clone(),
            Arc::clone(&stats),
        )
        .await
        .context("starting batch writer")?;
        tasks.push(tokio::spawn(writer.run(shutdown.clone())));
    }

    if let Some(config) = worker_config {
        let prober = HttpProber::new(probe_timeout).context("building probe client")?;
        let worker = RegionWorker::start(
            config,
            connect_broker(&settings).await?,
            store.as_ref(),
            Arc::new(prober),
            Arc::clone(&stats),
        )
        .await
        .context("starting region worker")?;
        tasks.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    // ── 6. Wait for every loop to wind down ─────────────────────
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "task aborted");
        }
    }
    info!("echo-monitor stopped");
    Ok(())
}
