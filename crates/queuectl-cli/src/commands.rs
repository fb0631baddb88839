//! Command dispatch and `[OK]` / `[ERROR]` presentation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use queuectl_core::app::manager::uptime;
use queuectl_core::app::worker_loop::DEFAULT_ERROR_BACKOFF;
use queuectl_core::app::{App, AppBuilder, ManagerError, SpawnedWorker, StopReport};
use queuectl_core::config::{ConfigKey, QueueConfig};
use queuectl_core::domain::{Job, JobId, JobState, WorkerId, WorkerRecord};
use queuectl_core::impls::OsProcessLauncher;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api;
use crate::args::{Args, Command, ConfigCommand, DlqCommand, WorkerCommand};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) async fn run(args: Args) -> Result<()> {
    let config_path = QueueConfig::resolve_path(args.config.as_deref());
    let command = match args.command {
        Command::Config(cmd) => return config_command(cmd, &config_path),
        other => other,
    };

    let config = QueueConfig::load_with_env(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    if let Command::Worker(WorkerCommand::Run { id, parent_pid }) = command {
        return run_worker(config, id, parent_pid).await;
    }
    let app = connect(config).await?;

    match command {
        Command::Enqueue {
            command,
            max_retries,
        } => {
            let job = app.engine.submit(&command, max_retries).await?;
            println!("[OK] Job enqueued: {}", job.id);
            print_job(&job);
        }
        Command::Worker(cmd) => worker_command(app, cmd, &config_path).await?,
        Command::Status => print_status(&app).await?,
        Command::List { state } => {
            let state = state.map(|s| s.parse::<JobState>()).transpose()?;
            let jobs = app.engine.list_jobs(state).await?;
            print_jobs("[LIST]", &jobs);
        }
        Command::Dlq(DlqCommand::List) => {
            let jobs = app.dlq.list().await?;
            print_jobs("[DLQ]", &jobs);
        }
        Command::Dlq(DlqCommand::Retry { job_id }) => {
            match app.dlq.retry(&JobId::new(job_id.clone())).await {
                Ok(job) => println!("[OK] Retried job {} (back to {})", job.id, job.state),
                Err(e) if e.is_not_found() => println!("[NOT FOUND] No job {job_id}"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Scheduler => run_scheduler(app).await,
        Command::Serve { listen } => serve(app, listen).await?,
        Command::Config(cmd) => config_command(cmd, &config_path)?,
    }
    Ok(())
}

async fn connect(config: QueueConfig) -> Result<App> {
    let url = config.redis_url.clone();
    let builder = AppBuilder::new(config)
        .connect_redis()
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(builder.build()?)
}

fn config_command(cmd: ConfigCommand, path: &Path) -> Result<()> {
    let mut config = QueueConfig::load(path)?;
    match cmd {
        ConfigCommand::Set { key, value } => {
            let key: ConfigKey = key.parse()?;
            config.set(key, &value)?;
            config.save(path)?;
            println!("[CONFIG] Updated config {key}={}", config.get(key));
        }
        ConfigCommand::Get { key } => {
            let key: ConfigKey = key.parse()?;
            println!("{}", config.get(key));
        }
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

async fn worker_command(app: App, cmd: WorkerCommand, config_path: &Path) -> Result<()> {
    match cmd {
        WorkerCommand::Start { count, detach } => {
            start_workers(&app, config_path, count, detach).await
        }
        WorkerCommand::Stop { pid, all } => {
            let manager = app.manager(Arc::new(OsProcessLauncher::current_exe()?));
            let report = match pid {
                Some(pid) => {
                    println!("[STOP] Stopping worker with PID {pid}...");
                    match manager.stop_by_pid(pid).await {
                        Ok(report) => report,
                        Err(ManagerError::WorkerNotFound { pid }) => {
                            println!("[NOT FOUND] No registered worker with PID {pid}");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None if all => {
                    println!("[STOP] Stopping all workers...");
                    manager.stop_all().await?
                }
                None => bail!("pass --pid <PID> or --all"),
            };
            print_stop_report(&report);
            Ok(())
        }
        WorkerCommand::List => {
            let workers = app.registry.list().await?;
            print_workers(&workers, &app);
            Ok(())
        }
        WorkerCommand::Run { .. } => bail!("`worker run` is dispatched before connecting"),
    }
}

async fn start_workers(app: &App, config_path: &Path, count: usize, detach: bool) -> Result<()> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    let mut launcher = OsProcessLauncher::current_exe()
        .context("locating the queuectl executable")?
        .with_config_path(config_path);
    let logs = log_dir(config_path);
    if detach {
        launcher = launcher.detached(&logs);
    }
    let manager = app.manager(Arc::new(launcher));

    println!("[START] Starting {count} worker(s)...");
    let mut spawned = manager.start(count).await?;
    for worker in &spawned {
        println!(
            "  Worker {}: PID {}",
            worker.record.worker_id, worker.record.pid
        );
    }
    if detach {
        println!(
            "[OK] {count} worker(s) running in the background; logs in {}",
            logs.display()
        );
        return Ok(());
    }

    println!("[OK] {count} worker(s) running; press Ctrl-C to stop");
    let records: Vec<WorkerRecord> = spawned.iter().map(|w| w.record.clone()).collect();
    let interrupted = tokio::select! {
        _ = wait_for_children(&mut spawned) => false,
        _ = shutdown_signal() => true,
    };
    if interrupted {
        println!("[STOP] Stopping workers...");
        let report = manager.stop_workers(records).await?;
        print_stop_report(&report);
    } else {
        let reaped = manager.reap_exited(&mut spawned).await?;
        for worker in &reaped {
            println!(
                "  Worker {} (PID {}) exited without deregistering; record removed",
                worker.worker_id, worker.pid
            );
        }
        println!("[OK] All workers exited");
    }
    Ok(())
}

fn log_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("logs")
}

async fn wait_for_children(spawned: &mut [SpawnedWorker]) {
    loop {
        if spawned.iter_mut().all(|w| !w.process.is_alive()) {
            return;
        }
        tokio::time::sleep(CHILD_POLL_INTERVAL).await;
    }
}

/// Entry point of a spawned worker process: the worker loop plus a retry
/// scheduler, both stopped by SIGINT/SIGTERM.
///
/// An unreachable store at startup is retried like any other store error.
async fn run_worker(config: QueueConfig, id: WorkerId, parent_pid: Option<u32>) -> Result<()> {
    let (tx, mut rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        tx.send_replace(true);
    });

    let url = config.redis_url.clone();
    let connected = retry_until_ready(
        || AppBuilder::new(config.clone()).connect_redis(),
        DEFAULT_ERROR_BACKOFF,
        &mut rx,
    )
    .await;
    let Some(builder) = connected else {
        signals.abort();
        warn!(worker_id = %id, redis_url = %url, "shutdown before the store was reachable");
        return Ok(());
    };
    let app = builder.build()?;

    let scheduler = tokio::spawn(app.scheduler().run(rx.clone()));

    let record = app.worker_record(id, parent_pid);
    let stats = app.worker_loop(record, app.executor()).run(rx).await;

    signals.abort();
    scheduler.abort();
    info!(
        worker_id = %id,
        processed = stats.processed,
        completed = stats.completed,
        failed = stats.failed,
        exit_reason = ?stats.exit_reason,
        "worker exited"
    );
    Ok(())
}

/// Call `attempt` every `backoff` until it succeeds. `None` if shutdown
/// arrives first.
async fn retry_until_ready<T, E, F, Fut>(
    mut attempt: F,
    backoff: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match attempt().await {
            Ok(value) => return Some(value),
            Err(e) => warn!(
                error = %e,
                retry_in_ms = backoff.as_millis() as u64,
                "store not reachable; retrying"
            ),
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                if stopped {
                    return None;
                }
                // sender gone: no shutdown can arrive any more
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn run_scheduler(app: App) {
    let (tx, rx) = watch::channel(false);
    println!(
        "[OK] Retry scheduler running every {}ms; press Ctrl-C to stop",
        app.config.scheduler_interval_ms
    );
    let scheduler = tokio::spawn(app.scheduler().run(rx));
    shutdown_signal().await;
    tx.send_replace(true);
    if let Err(e) = scheduler.await {
        warn!(error = %e, "retry scheduler task failed");
    }
}

async fn serve(app: App, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| app.config.api_listen.clone());
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let addr = listener.local_addr()?;
    info!(%addr, "listening");
    println!("[OK] Serving API on http://{addr}");

    axum::serve(listener, api::router(Arc::new(app)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn print_status(app: &App) -> Result<()> {
    let report = app.status().await?;
    println!("[STATUS] Queue summary:");
    for state in JobState::ALL {
        println!("  {:<12}{}", state.as_str(), report.summary.count(state));
    }
    println!("  {:<12}{}", "TOTAL", report.summary.total);
    if report.summary.malformed > 0 {
        println!("  malformed records skipped: {}", report.summary.malformed);
    }
    println!(
        "[STATUS] Queues: pending {}, delayed {}, dead {}",
        report.depths.pending, report.depths.delayed, report.depths.dead
    );
    for (id, ready_at) in app.engine.delayed_jobs().await?.iter().take(5) {
        println!("  retry {id} at {}", ready_at.to_rfc3339());
    }
    println!("[STATUS] Workers: {}", report.worker_count);
    print_workers(&report.workers, app);
    Ok(())
}

fn print_workers(workers: &[WorkerRecord], app: &App) {
    if workers.is_empty() {
        println!("[LIST] No workers running");
        return;
    }
    println!("[LIST] {} worker(s) running:", workers.len());
    let now = app.clock.now();
    for worker in workers {
        println!(
            "  Worker {}: PID {}, host {}, started {} (up {}s)",
            worker.worker_id,
            worker.pid,
            worker.hostname.as_deref().unwrap_or("?"),
            worker.started_at.to_rfc3339(),
            uptime(worker, now).as_secs()
        );
    }
}

fn print_jobs(prefix: &str, jobs: &[Job]) {
    if jobs.is_empty() {
        println!("{prefix} No jobs");
        return;
    }
    println!("{prefix} {} job(s):", jobs.len());
    for job in jobs {
        print_job(job);
    }
}

fn print_job(job: &Job) {
    println!(
        "  {}  {:<10}  attempts {}/{}  {}",
        job.id,
        job.state.as_str(),
        job.attempts,
        job.max_retries,
        job.command
    );
    if let Some(err) = &job.last_error {
        println!("      last error: {err}");
    }
}

fn print_stop_report(report: &StopReport) {
    if report.is_empty() {
        println!("[OK] No workers running");
        return;
    }
    for worker in &report.exited {
        println!("  Worker {} (PID {}) stopped", worker.worker_id, worker.pid);
    }
    for worker in &report.terminated {
        println!(
            "  Worker {} (PID {}) did not stop in time and was terminated",
            worker.worker_id, worker.pid
        );
    }
    for worker in &report.unreachable {
        println!(
            "  Worker {} (PID {}) runs on {} and could not be stopped from here",
            worker.worker_id,
            worker.pid,
            worker.hostname.as_deref().unwrap_or("another host")
        );
    }
    println!(
        "[OK] {} stopped, {} terminated, {} unreachable",
        report.exited.len(),
        report.terminated.len(),
        report.unreachable.len()
    );
}
