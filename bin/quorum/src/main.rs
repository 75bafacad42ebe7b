mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};

use common::{ExecutionClient, InstrumentGroup, Settings};
use engine::{open_feed, report_path, JsonLinesReport, Worker};
use paper::PaperClient;
use supervisor::{partition, resolve_universe, LogRouter, ProcessLauncher, Supervisor, WorkerStatus};

#[derive(Parser)]
#[command(name = "quorum", version, about = "Multi-strategy trading engine")]
struct Cli {
    /// Settings file. Defaults to `QUORUM_CONFIG`, then config/quorum.toml.
    #[arg(long, short, global = true, env = "QUORUM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Partition the universe and supervise one worker process per group.
    Run,
    /// Print the instrument groups `run` would start, as JSON.
    Plan,
    /// Run the evaluation loop for one group. Normally started by `run`.
    Worker {
        #[arg(long)]
        group_id: usize,
        #[arg(long, value_delimiter = ',', required = true)]
        instruments: Vec<String>,
        /// Do not treat EOF on stdin as a stop request.
        #[arg(long)]
        ignore_stdin: bool,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv(); // ignore error if .env not present
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Settings::path_from_env);
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;

    match cli.command {
        Command::Run => {
            telemetry::init_tracing(&settings.logging.filter, true)?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(orchestrate(settings, &config_path))
        }
        Command::Plan => {
            let groups = plan(&settings)?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
            Ok(())
        }
        Command::Worker {
            group_id,
            instruments,
            ignore_stdin,
        } => {
            telemetry::init_tracing(&settings.logging.filter, false)?;
            let group = InstrumentGroup::new(group_id, instruments);
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let span = info_span!("worker", group = group_id);
            let result = rt.block_on(run_worker(settings, group, ignore_stdin).instrument(span));
            // a blocked stdin read must not hold the process open
            rt.shutdown_background();
            result
        }
    }
}

fn plan(settings: &Settings) -> Result<Vec<InstrumentGroup>> {
    let universe = resolve_universe(&settings.universe)?;
    Ok(partition(&universe, &settings.partition)?)
}

async fn orchestrate(settings: Settings, config_path: &Path) -> Result<()> {
    info!(name = %settings.name, "Quorum starting");
    let groups = plan(&settings)?;
    for group in &groups {
        info!(group = group.id, instruments = %group.instruments.join(","), "Planned worker group");
    }

    // workers re-read the same file; make the path independent of their cwd
    let config_path = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());
    let launcher = ProcessLauncher::current_exe(vec![
        "--config".into(),
        config_path.into_os_string(),
    ])?;
    let router = LogRouter::new(&settings.logging.dir, &settings.name);
    let supervisor = Supervisor::new(groups, router, Arc::new(launcher), &settings.supervisor);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping workers");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for Ctrl-C");
                // keep the sender alive; dropping it reads as a stop request
                std::future::pending::<()>().await;
            }
        }
    });

    let records = supervisor.run(stop_rx).await?;
    for record in &records {
        info!(
            group = record.group,
            status = ?record.status,
            restarts = record.restart_count,
            last_exit = ?record.last_exit.and_then(|e| e.code),
            "Worker group final state"
        );
    }

    let down = records
        .iter()
        .filter(|r| r.status == WorkerStatus::Down)
        .count();
    if down > 0 {
        bail!("{down} worker group(s) went down");
    }
    info!("Quorum stopped");
    Ok(())
}

async fn run_worker(settings: Settings, group: InstrumentGroup, ignore_stdin: bool) -> Result<()> {
    let (client, executions) = PaperClient::new(settings.execution.clone());
    let client: Arc<dyn ExecutionClient> = Arc::new(client);

    let path = report_path(&settings.logging.dir, &settings.name, group.id);
    let report = JsonLinesReport::open(&path)
        .with_context(|| format!("opening report {}", path.display()))?;

    let worker = Worker::new(&settings, group.clone(), client, executions, Box::new(report))?;
    let feed = open_feed(&settings.feed, &group).await?;

    match worker.run(feed, stop_requested(ignore_stdin)).await {
        Ok(outcome) => {
            info!(
                end = ?outcome.end,
                bars = outcome.summary.bars_processed,
                closed = outcome.summary.positions_closed,
                "Worker finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Worker stopped on a fatal error");
            Err(e.into())
        }
    }
}

/// Resolves on Ctrl-C or when stdin reaches EOF, which is how the
/// orchestrator asks a worker to stop.
async fn stop_requested(ignore_stdin: bool) {
    let stdin_closed = async {
        if ignore_stdin {
            return std::future::pending::<()>().await;
        }
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };

    tokio::select! {
        _ = stdin_closed => info!("Stdin closed, stopping"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
    }
}
