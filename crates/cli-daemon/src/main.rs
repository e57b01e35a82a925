use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pocketvid::{
    job::job_id_of_file,
    validate_source_reference, ConverterConfig, JobRecord, JobState, Orchestrator, OutputFormat, RetentionSweeper,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// How often the inbox is polled for new requests
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long shutdown waits for workers to notice their tools were killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Video-to-feature-phone conversion daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: poll the inbox, run jobs, sweep old files (default)
    Run,
    /// Queue a conversion for the running daemon and print its job id
    Submit {
        source_reference: String,
        /// Output format: 3gp or mp3
        #[arg(short, long, default_value = "3gp")]
        format: String,
        /// Quality preset: low, medium or high
        #[arg(short, long)]
        preset: Option<String>,
    },
    /// Convert one source in this process and wait for the result
    Convert {
        source_reference: String,
        #[arg(short, long, default_value = "3gp")]
        format: String,
        #[arg(short, long)]
        preset: Option<String>,
    },
    /// Show the status of one job as JSON
    Status { job_id: String },
    /// List every job in the store
    List,
    /// Split a completed job's output into parts
    Split {
        job_id: String,
        #[arg(default_value_t = 2)]
        parts: usize,
    },
    /// Run one retention sweep and exit
    Sweep,
}

/// Submission request dropped into the inbox
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct SubmitRequest {
    job_id: String,
    source_reference: String,
    #[serde(default)]
    output_format: Option<String>,
    #[serde(default)]
    preset: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with -v
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(cfg).await,
        Command::Submit { source_reference, format, preset } => {
            let id = submit_request(&cfg.request_dir(), &source_reference, &format, preset)?;
            println!("{}", id);
            Ok(())
        }
        Command::Convert { source_reference, format, preset } => {
            convert_once(&cfg, &source_reference, &format, preset).await
        }
        Command::Status { job_id } => {
            let orch = Orchestrator::from_config(&cfg)?;
            println!("{}", serde_json::to_string_pretty(&orch.status_view(&job_id))?);
            Ok(())
        }
        Command::List => {
            let orch = Orchestrator::from_config(&cfg)?;
            print_job_list(&orch.store().list_all());
            Ok(())
        }
        Command::Split { job_id, parts } => {
            let orch = Orchestrator::from_config(&cfg)?;
            let parts = orch
                .split_job(&job_id, parts)
                .await
                .with_context(|| format!("Failed to split job {}", job_id))?;
            for part in parts {
                println!(
                    "{}\t{:.1}s+{:.1}s\t{} bytes",
                    part.filename, part.start_secs, part.duration_secs, part.size_bytes
                );
            }
            Ok(())
        }
        Command::Sweep => {
            let orch = Orchestrator::from_config(&cfg)?;
            let sweeper = RetentionSweeper::new(
                Arc::clone(orch.store()),
                cfg.scratch_dir.clone(),
                cfg.retention_horizon(),
            )
            .keep_file(cfg.proxy_cache_file());
            let report = sweeper.sweep_once(Utc::now()).context("Retention sweep failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn run_daemon(cfg: ConverterConfig) -> Result<()> {
    info!("pocketvid daemon starting");
    info!("Configuration loaded:");
    info!("  Scratch dir: {}", cfg.scratch_dir.display());
    info!("  State file: {}", cfg.state_file.display());
    info!("  Max duration: {}s", cfg.max_duration_secs);
    info!("  Acquire timeout: {:?}", cfg.acquire_timeout);
    info!("  Transcode timeout: {:?}", cfg.transcode_timeout);
    info!("  Retention: {}h, sweep every {}s", cfg.retention_hours, cfg.sweep_interval_secs);
    info!("  Disk threshold: {} MB", cfg.disk_threshold_mb);
    match cfg.max_concurrent_jobs {
        Some(n) => info!("  Max concurrent jobs: {}", n),
        None => info!("  Max concurrent jobs: unlimited"),
    }

    let orch = Arc::new(Orchestrator::from_config(&cfg)?);

    // Recovery on startup: jobs a previous process left unfinished
    let recovered = orch.fail_unfinished();
    if recovered > 0 {
        info!("⚠️  Marked {} unfinished job(s) from a previous run as interrupted", recovered);
    }

    // First tick runs immediately and catches orphans of a crash
    let sweeper = Arc::new(
        RetentionSweeper::new(Arc::clone(orch.store()), cfg.scratch_dir.clone(), cfg.retention_horizon())
            .keep_file(cfg.proxy_cache_file()),
    );
    let sweeper_task = tokio::spawn(sweeper.run_periodic(
        Duration::from_secs(cfg.sweep_interval_secs.max(1)),
        orch.supervisor().subscribe(),
    ));

    let limiter = cfg.max_concurrent_jobs.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let mut workers: JoinSet<()> = JoinSet::new();
    let request_dir = cfg.request_dir();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        for id in process_request_files(&orch, &request_dir) {
            spawn_worker(&mut workers, Arc::clone(&orch), limiter.clone(), id);
        }
        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                error!("Worker task failed: {}", e);
            }
        }

        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    info!("Shutdown signal received, cleaning up");
    let interrupted = orch.shutdown_cleanup(SHUTDOWN_GRACE).await;
    if tokio::time::timeout(SHUTDOWN_GRACE, async { while workers.join_next().await.is_some() {} })
        .await
        .is_err()
    {
        warn!("Workers still running after {:?}, aborting", SHUTDOWN_GRACE);
        workers.abort_all();
    }
    sweeper_task.abort();
    info!("✅ Shutdown complete: {} job(s) interrupted", interrupted);
    Ok(())
}

fn spawn_worker(
    workers: &mut JoinSet<()>,
    orch: Arc<Orchestrator>,
    limiter: Option<Arc<Semaphore>>,
    id: String,
) {
    workers.spawn(async move {
        let _permit = match limiter {
            Some(sem) => match sem.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };
        match orch.run_job(&id).await {
            Ok(record) => debug!("Job {}: worker finished ({})", id, record.state),
            Err(e) => error!("Job {}: worker aborted on store error: {}", id, e),
        }
    });
}

/// Claim every request file in the inbox: create its queued job and
/// delete the file. Returns the ids of jobs created.
fn process_request_files(orch: &Orchestrator, request_dir: &Path) -> Vec<String> {
    let mut created = Vec::new();

    let entries = match fs::read_dir(request_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read request directory {}: {}", request_dir.display(), e);
            return created;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read request file {}: {}", path.display(), e);
                continue;
            }
        };

        match serde_json::from_str::<SubmitRequest>(&content) {
            Ok(req) if job_id_of_file(&req.job_id) == Some(req.job_id.as_str()) => {
                match validate_source_reference(&req.source_reference) {
                    Ok(source_reference) => {
                        let format = OutputFormat::parse_or_default(req.output_format.as_deref().unwrap_or(""));
                        let preset = req.preset.as_deref().unwrap_or(format.default_preset());
                        match orch.enqueue(&req.job_id, &source_reference, format, preset) {
                            Ok(()) => created.push(req.job_id),
                            Err(e) => warn!("Job {}: request rejected: {}", req.job_id, e),
                        }
                    }
                    Err(e) => warn!("Job {}: request rejected: {} ({:?})", req.job_id, e, req.source_reference),
                }
            }
            Ok(req) => warn!("Ignoring request with malformed job id {:?}", req.job_id),
            Err(e) => warn!("Failed to parse request file {}: {}", path.display(), e),
        }

        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to delete request file {}: {}", path.display(), e);
        }
    }

    if !created.is_empty() {
        info!("✅ Claimed {} request(s)", created.len());
    }
    created
}

/// Write a request file for the daemon; the file appears under its final
/// name only once complete
fn submit_request(request_dir: &Path, source_reference: &str, format: &str, preset: Option<String>) -> Result<String> {
    let source_reference = validate_source_reference(source_reference)?;
    fs::create_dir_all(request_dir)
        .with_context(|| format!("Failed to create request directory: {}", request_dir.display()))?;

    let job_id = JobRecord::generate_id(&source_reference, Utc::now());
    let request = SubmitRequest {
        job_id: job_id.clone(),
        source_reference,
        output_format: Some(format.to_string()),
        preset,
    };
    let path = request_dir.join(format!("{}.json", job_id));
    let tmp = request_dir.join(format!("{}.json.tmp", job_id));
    fs::write(&tmp, serde_json::to_vec_pretty(&request)?)
        .with_context(|| format!("Failed to write request file: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to publish request file: {}", path.display()))?;
    Ok(job_id)
}

async fn convert_once(cfg: &ConverterConfig, source_reference: &str, format: &str, preset: Option<String>) -> Result<()> {
    let source_reference = validate_source_reference(source_reference)?;
    let orch = Orchestrator::from_config(cfg)?;
    let format = OutputFormat::parse_or_default(format);
    let preset = preset.unwrap_or_else(|| format.default_preset().to_string());
    let id = orch.submit(&source_reference, format, &preset)?;
    info!("Job {}: converting {}", id, source_reference);

    let record = tokio::select! {
        record = orch.run_job(&id) => record?,
        _ = tokio::signal::ctrl_c() => {
            orch.shutdown_cleanup(SHUTDOWN_GRACE).await;
            orch.store().get(&id)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&orch.status_view(&id))?);
    if record.state != JobState::Completed {
        bail!(
            "Job {} failed: {}",
            id,
            record.error_message.unwrap_or_else(|| record.progress_message.clone())
        );
    }
    Ok(())
}

fn print_job_list(jobs: &[JobRecord]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    let mut jobs: Vec<&JobRecord> = jobs.iter().collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    println!("{:<12}  {:<11}  {:<19}  {:<4}  {}", "ID", "STATE", "CREATED", "FMT", "PROGRESS");
    for job in jobs {
        println!(
            "{:<12}  {:<11}  {:<19}  {:<4}  {}",
            job.id,
            job.state.as_str(),
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.output_format.extension(),
            job.progress_message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator(dir: &Path) -> Orchestrator {
        let mut cfg = ConverterConfig::default_config();
        cfg.scratch_dir = dir.to_path_buf();
        cfg.state_file = dir.join("status.json");
        Orchestrator::from_config(&cfg).unwrap()
    }

    #[test]
    fn submitted_requests_are_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let inbox = dir.path().join("requests");

        let id = submit_request(&inbox, "https://youtu.be/x", "mp3", None).unwrap();
        fs::write(inbox.join("garbage.json"), b"{not json").unwrap();
        fs::write(inbox.join("pending.json.tmp"), b"{}").unwrap();

        let claimed = process_request_files(&orch, &inbox);
        assert_eq!(claimed, vec![id.clone()]);
        let record = orch.store().get(&id).unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.output_format, OutputFormat::AudioMp3);
        assert_eq!(record.preset, "medium");

        assert!(!inbox.join(format!("{}.json", id)).exists());
        assert!(!inbox.join("garbage.json").exists());
        assert!(inbox.join("pending.json.tmp").exists());
        assert!(process_request_files(&orch, &inbox).is_empty());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let inbox = dir.path().join("requests");
        let req = SubmitRequest {
            job_id: "../../etc".to_string(),
            source_reference: "https://youtu.be/x".to_string(),
            output_format: None,
            preset: None,
        };
        fs::write(inbox.join("bad.json"), serde_json::to_vec(&req).unwrap()).unwrap();
        assert!(process_request_files(&orch, &inbox).is_empty());
        assert!(orch.store().list_all().is_empty());
    }

    #[test]
    fn foreign_or_empty_sources_never_reach_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let inbox = dir.path().join("requests");

        for bad in ["", "https://www.google.com"] {
            let err = submit_request(&inbox, bad, "3gp", None).unwrap_err();
            assert!(err.to_string().starts_with("Please enter"), "{}", err);
        }
        assert_eq!(fs::read_dir(&inbox).unwrap().count(), 0);

        let req = SubmitRequest {
            job_id: "0123456789ab".to_string(),
            source_reference: "https://www.google.com".to_string(),
            output_format: None,
            preset: None,
        };
        fs::write(inbox.join("foreign.json"), serde_json::to_vec(&req).unwrap()).unwrap();
        assert!(process_request_files(&orch, &inbox).is_empty());
        assert!(orch.store().list_all().is_empty());
        assert!(!inbox.join("foreign.json").exists());
    }
}
