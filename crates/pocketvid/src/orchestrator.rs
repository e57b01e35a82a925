//! Job orchestration: turns one submitted request into admission,
//! acquisition, conversion and completion, recording every step in the
//! job store. Failures are classified here, at the worker boundary.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::acquire::ytdlp::{FetchOptions, YtDlp};
use crate::acquire::{AcquireTarget, AcquisitionEngine, BackoffPolicy};
use crate::admission::AdmissionController;
use crate::config::ConverterConfig;
use crate::error::{JobError, StoreError};
use crate::job::{job_id_of_file, output_path, source_prefix, JobRecord, JobState, JobUpdate, OutputDescriptor, PartDescriptor};
use crate::preset::{OutputFormat, QualityPreset};
use crate::probe::FfProbe;
use crate::process::ProcessSupervisor;
use crate::proxy::{proxy_source_from_config, ProxySource};
use crate::segment::Segmenter;
use crate::store::JobStore;
use crate::tools::{AcquisitionTool, DiskSpace, Ffmpeg, MediaProbe, SystemDisk, TranscodeTool};
use crate::transcode::{completion_message, remove_quietly, TranscodeEngine};

/// The external collaborators one orchestrator drives
#[derive(Clone)]
pub struct Toolset {
    pub acquisition: Arc<dyn AcquisitionTool>,
    pub transcoder: Arc<dyn TranscodeTool>,
    pub probe: Arc<dyn MediaProbe>,
    pub disk: Arc<dyn DiskSpace>,
    pub proxies: Arc<dyn ProxySource>,
}

impl Toolset {
    /// yt-dlp, ffmpeg, ffprobe and the real filesystem, as configured
    pub fn from_config(cfg: &ConverterConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            acquisition: Arc::new(YtDlp {
                bin: cfg.ytdlp_bin.clone(),
                timeout: cfg.acquire_timeout,
                options: FetchOptions::from_config(cfg),
                supervisor: Arc::clone(&supervisor),
            }),
            transcoder: Arc::new(Ffmpeg {
                bin: cfg.ffmpeg_bin.clone(),
                timeout: cfg.transcode_timeout,
                supervisor,
            }),
            probe: Arc::new(FfProbe { bin: cfg.ffprobe_bin.clone() }),
            disk: Arc::new(SystemDisk),
            proxies: Arc::from(proxy_source_from_config(cfg)),
        }
    }
}

/// What a status lookup returns; unknown ids get a synthetic view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub job_id: String,
    pub state: String,
    pub progress_message: String,
    pub error_message: Option<String>,
    pub output: Option<OutputDescriptor>,
    pub download_name: Option<String>,
    pub parts: Vec<PartDescriptor>,
}

impl StatusView {
    fn unknown(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: "unknown".to_string(),
            progress_message: "File not found".to_string(),
            error_message: None,
            output: None,
            download_name: None,
            parts: Vec::new(),
        }
    }

    fn of(record: &JobRecord) -> Self {
        Self {
            job_id: record.id.clone(),
            state: record.state.to_string(),
            progress_message: record.progress_message.clone(),
            error_message: record.error_message.clone(),
            output: record.output_descriptor.clone(),
            download_name: record.output_descriptor.as_ref().map(|_| record.download_name()),
            parts: record.parts.clone(),
        }
    }
}

pub struct Orchestrator {
    store: Arc<JobStore>,
    scratch_dir: PathBuf,
    admission: AdmissionController,
    acquisition: AcquisitionEngine,
    transcoder: TranscodeEngine,
    segmenter: Segmenter,
    supervisor: Arc<ProcessSupervisor>,
    /// Jobs with a worker currently running in this process
    in_flight: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        cfg: &ConverterConfig,
        store: Arc<JobStore>,
        supervisor: Arc<ProcessSupervisor>,
        tools: Toolset,
    ) -> Self {
        let acquisition = AcquisitionEngine::new(tools.acquisition)
            .with_proxies(tools.proxies)
            .with_cookies_file(Some(cfg.cookies_file.clone()));
        Self {
            store,
            scratch_dir: cfg.scratch_dir.clone(),
            admission: AdmissionController::new(cfg.scratch_dir.clone(), cfg.disk_threshold_bytes(), tools.disk),
            acquisition,
            transcoder: TranscodeEngine::new(Arc::clone(&tools.transcoder), Arc::clone(&tools.probe), cfg.max_duration_secs),
            segmenter: Segmenter::new(tools.transcoder, tools.probe),
            supervisor,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Open the store, create the scratch directories and wire the real tools
    pub fn from_config(cfg: &ConverterConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.scratch_dir)
            .with_context(|| format!("Failed to create scratch dir: {}", cfg.scratch_dir.display()))?;
        fs::create_dir_all(cfg.request_dir())
            .with_context(|| format!("Failed to create request dir: {}", cfg.request_dir().display()))?;
        let store = Arc::new(
            JobStore::open(&cfg.state_file)
                .with_context(|| format!("Failed to open job store: {}", cfg.state_file.display()))?,
        );
        let supervisor = Arc::new(ProcessSupervisor::new());
        let tools = Toolset::from_config(cfg, Arc::clone(&supervisor));
        Ok(Self::new(cfg, store, supervisor, tools))
    }

    /// Replace the backoff between acquisition attempts
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.acquisition = self.acquisition.with_backoff(backoff);
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Create a queued job under a fresh id
    pub fn submit(&self, source_reference: &str, format: OutputFormat, preset: &str) -> Result<String, StoreError> {
        let id = JobRecord::generate_id(source_reference, Utc::now());
        self.enqueue(&id, source_reference, format, preset)?;
        Ok(id)
    }

    /// Create a queued job under a caller-chosen id. Unknown preset names
    /// are stored as the family default.
    pub fn enqueue(&self, id: &str, source_reference: &str, format: OutputFormat, preset: &str) -> Result<(), StoreError> {
        let preset = QualityPreset::resolve(format, preset);
        let record = JobRecord::new(id.to_string(), source_reference.to_string(), format, preset.name.to_string());
        self.store.create(record)?;
        info!("Job {}: queued {} as {} ({})", id, source_reference, format, preset.name);
        Ok(())
    }

    /// Run a queued job to a terminal state. Only store failures escape;
    /// every pipeline failure ends as a `failed` record.
    pub async fn run_job(&self, id: &str) -> Result<JobRecord, StoreError> {
        let record = self.store.get(id)?;
        if record.state != JobState::Queued {
            warn!("Job {}: not queued ({}), skipping", id, record.state);
            return Ok(record);
        }

        let result = {
            let _running = self.track_in_flight(id);
            self.pipeline(&record).await
        };

        let update = match result {
            Ok(descriptor) => {
                let message = completion_message(&descriptor);
                info!("Job {}: ✅ {}", id, message);
                JobUpdate::completed(descriptor, message)
            }
            Err(err) => {
                error!("Job {}: failed: {}", id, err);
                self.remove_job_files(id);
                JobUpdate::failed(err.user_message())
            }
        };
        match self.store.upsert(id, update) {
            Ok(record) => Ok(record),
            Err(StoreError::Transition { source, .. }) => {
                // Shutdown cleanup may have finalized the record first
                warn!("Job {}: final update dropped: {}", id, source);
                self.store.get(id)
            }
            Err(e) => Err(e),
        }
    }

    async fn pipeline(&self, record: &JobRecord) -> Result<OutputDescriptor, JobError> {
        let id = record.id.as_str();
        let protected = self.in_flight_ids();
        self.admission.admit_job(id, &protected)?;

        self.store
            .upsert(id, JobUpdate::state(JobState::Downloading, "Starting download..."))?;
        let progress = |message: String| {
            if let Err(e) = self.store.upsert(id, JobUpdate::progress(message)) {
                warn!("Job {}: progress update failed: {}", id, e);
            }
        };

        let prefix = source_prefix(id);
        let target = AcquireTarget {
            job_id: id,
            source_reference: &record.source_reference,
            scratch_dir: &self.scratch_dir,
            output_prefix: &prefix,
            format: record.output_format,
        };
        let source = self.acquisition.acquire(target, &progress).await?;

        let source_bytes = fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        if let Err(e) = self.admission.check_conversion(source_bytes) {
            remove_quietly(&source);
            return Err(e);
        }
        self.transcoder.check_duration(id, &source).await?;

        let preset = QualityPreset::resolve(record.output_format, &record.preset);
        self.store.upsert(
            id,
            JobUpdate::state(JobState::Converting, format!("Converting to {}...", preset.describe())),
        )?;
        let output = output_path(&self.scratch_dir, id, record.output_format);
        self.transcoder
            .transcode(id, &source, &output, record.output_format, &record.preset, &progress)
            .await
    }

    /// Split a completed job's output into parts, replacing any earlier split
    pub async fn split_job(&self, id: &str, part_count: usize) -> Result<Vec<PartDescriptor>, JobError> {
        let record = self.store.get(id)?;
        let descriptor = match (&record.state, &record.output_descriptor) {
            (JobState::Completed, Some(d)) => d.clone(),
            _ => return Err(JobError::SplitFailure(format!("job {} is {}, not completed", id, record.state))),
        };
        for old in &record.parts {
            remove_quietly(&self.scratch_dir.join(&old.filename));
        }

        let output = self.scratch_dir.join(&descriptor.filename);
        match self.segmenter.split(id, &output, part_count).await {
            Ok(parts) => {
                self.store.upsert(id, JobUpdate::parts(parts.clone()))?;
                Ok(parts)
            }
            Err(e) => {
                warn!("Job {}: split failed: {}", id, e);
                if !record.parts.is_empty() {
                    self.store.upsert(id, JobUpdate::parts(Vec::new()))?;
                }
                Err(e)
            }
        }
    }

    pub fn status_view(&self, id: &str) -> StatusView {
        match self.store.get(id) {
            Ok(record) => StatusView::of(&record),
            Err(_) => StatusView::unknown(id),
        }
    }

    /// Kill running tools, give workers `grace` to notice, then fail every
    /// unfinished job and delete its scratch files
    pub async fn shutdown_cleanup(&self, grace: Duration) -> usize {
        info!("Shutting down: stopping {} running tools", self.supervisor.running_count());
        self.supervisor.shutdown();

        let deadline = tokio::time::Instant::now() + grace;
        while !self.in_flight_ids().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.fail_unfinished()
    }

    /// Fail every non-terminal job in the store. Used at shutdown and at
    /// startup for jobs a crashed process left behind.
    pub fn fail_unfinished(&self) -> usize {
        let mut failed = 0;
        for record in self.store.list_all() {
            if record.state.is_terminal() {
                continue;
            }
            self.remove_job_files(&record.id);
            match self.store.upsert(&record.id, JobUpdate::failed(JobError::Interrupted.user_message())) {
                Ok(_) => {
                    info!("Job {}: marked interrupted", record.id);
                    failed += 1;
                }
                Err(e) => debug!("Job {}: not marked interrupted: {}", record.id, e),
            }
        }
        failed
    }

    pub fn in_flight_ids(&self) -> HashSet<String> {
        self.in_flight
            .lock()
            .map(|set| set.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Mark `id` running until the guard drops, including when the
    /// `run_job` future itself is dropped mid-pipeline
    fn track_in_flight(&self, id: &str) -> InFlightGuard<'_> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string());
        InFlightGuard { set: &self.in_flight, id: id.to_string() }
    }

    /// Best-effort removal of every scratch file named after `id`
    fn remove_job_files(&self, id: &str) {
        let Ok(entries) = fs::read_dir(&self.scratch_dir) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_str().and_then(job_id_of_file) != Some(id) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => debug!("Job {}: 🗑️ removed {}", id, entry.path().display()),
                Err(e) => warn!("Job {}: failed to remove {}: {}", id, entry.path().display(), e),
            }
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessOutput, RunError};
    use crate::proxy::NoProxy;
    use crate::tools::FetchRequest;
    use async_trait::async_trait;

    struct WritesSource;

    #[async_trait]
    impl AcquisitionTool for WritesSource {
        async fn fetch(&self, request: &FetchRequest<'_>) -> Result<ProcessOutput, RunError> {
            let path = request.output_dir.join(format!("{}.mp4", request.output_prefix));
            fs::write(path, b"source-bytes").unwrap();
            Ok(ProcessOutput { exit_code: Some(0), success: true, stdout: String::new(), stderr: String::new(), elapsed_secs: 0.1 })
        }
    }

    /// Never finishes a fetch
    struct Hangs;

    #[async_trait]
    impl AcquisitionTool for Hangs {
        async fn fetch(&self, _request: &FetchRequest<'_>) -> Result<ProcessOutput, RunError> {
            std::future::pending().await
        }
    }

    struct WritesOutput;

    #[async_trait]
    impl TranscodeTool for WritesOutput {
        async fn transcode(&self, _job_id: &str, args: &[String]) -> Result<ProcessOutput, RunError> {
            fs::write(args.last().unwrap(), b"encoded").unwrap();
            Ok(ProcessOutput { exit_code: Some(0), success: true, stdout: String::new(), stderr: String::new(), elapsed_secs: 0.1 })
        }
    }

    struct Probe(f64);

    #[async_trait]
    impl MediaProbe for Probe {
        async fn duration_secs(&self, _path: &Path) -> f64 {
            self.0
        }
    }

    struct Disk(Option<u64>);

    impl DiskSpace for Disk {
        fn free_bytes(&self, _path: &Path) -> Option<u64> {
            self.0
        }
    }

    fn orchestrator(dir: &Path, free: Option<u64>, duration: f64) -> Orchestrator {
        orchestrator_with(dir, free, duration, Arc::new(WritesSource))
    }

    fn orchestrator_with(
        dir: &Path,
        free: Option<u64>,
        duration: f64,
        acquisition: Arc<dyn AcquisitionTool>,
    ) -> Orchestrator {
        let mut cfg = ConverterConfig::default_config();
        cfg.scratch_dir = dir.to_path_buf();
        cfg.state_file = dir.join("status.json");
        cfg.cookies_file = dir.join("cookies.txt");
        let store = Arc::new(JobStore::open(&cfg.state_file).unwrap());
        let tools = Toolset {
            acquisition,
            transcoder: Arc::new(WritesOutput),
            probe: Arc::new(Probe(duration)),
            disk: Arc::new(Disk(free)),
            proxies: Arc::new(NoProxy),
        };
        Orchestrator::new(&cfg, store, Arc::new(ProcessSupervisor::new()), tools)
            .with_backoff(BackoffPolicy::with_unit(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn happy_path_completes_and_cleans_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Some(10 << 30), 42.0);
        let id = orch.submit("https://youtu.be/x", OutputFormat::Video3gp, "nonsense").unwrap();
        assert_eq!(orch.store().get(&id).unwrap().preset, "low");

        let record = orch.run_job(&id).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert!(record.is_consistent());
        assert!(record.progress_message.starts_with("Conversion complete!"));
        let desc = record.output_descriptor.unwrap();
        assert_eq!(desc.filename, format!("{}.3gp", id));
        assert!(dir.path().join(&desc.filename).exists());
        assert!(!dir.path().join(format!("{}_source.mp4", id)).exists());
        assert!(orch.in_flight_ids().is_empty());
    }

    #[tokio::test]
    async fn full_disk_rejects_before_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Some(100 * 1024 * 1024), 42.0);
        let id = orch.submit("https://youtu.be/x", OutputFormat::AudioMp3, "medium").unwrap();
        let record = orch.run_job(&id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error_message.as_deref(), Some("Server storage is full. Please try again later."));
        assert!(!dir.path().join(format!("{}_source.mp4", id)).exists());
    }

    #[tokio::test]
    async fn overlong_source_fails_and_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), None, 30_000.0);
        let id = orch.submit("https://youtu.be/x", OutputFormat::Video3gp, "low").unwrap();
        let record = orch.run_job(&id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error_message.unwrap().starts_with("Video is too long"));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(&id))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_get_a_synthetic_status() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), None, 1.0);
        let view = orch.status_view("ffffffffffff");
        assert_eq!(view.state, "unknown");
        assert_eq!(view.progress_message, "File not found");
    }

    #[tokio::test]
    async fn abandoned_run_leaves_nothing_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_with(dir.path(), None, 1.0, Arc::new(Hangs));
        let id = orch.submit("https://youtu.be/x", OutputFormat::Video3gp, "low").unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), orch.run_job(&id)).await;
        assert!(abandoned.is_err());
        assert!(orch.in_flight_ids().is_empty());

        let started = tokio::time::Instant::now();
        assert_eq!(orch.shutdown_cleanup(Duration::from_secs(5)).await, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unfinished_jobs_are_failed_as_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), None, 1.0);
        let id = orch.submit("https://youtu.be/x", OutputFormat::Video3gp, "low").unwrap();
        orch.store().upsert(&id, JobUpdate::state(JobState::Downloading, "Downloading")).unwrap();
        let stray = dir.path().join(format!("{}_source.webm.part", id));
        fs::write(&stray, b"half").unwrap();

        assert_eq!(orch.shutdown_cleanup(Duration::from_millis(10)).await, 1);
        let record = orch.store().get(&id).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error_message, Some(JobError::Interrupted.user_message()));
        assert!(!stray.exists());
        assert!(orch.supervisor().is_shutting_down());
    }

    #[tokio::test]
    async fn splitting_requires_a_completed_job() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), None, 300.0);
        let id = orch.submit("https://youtu.be/x", OutputFormat::Video3gp, "low").unwrap();
        assert!(matches!(orch.split_job(&id, 3).await, Err(JobError::SplitFailure(_))));

        orch.run_job(&id).await.unwrap();
        let parts = orch.split_job(&id, 3).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(orch.status_view(&id).parts.len(), 3);

        let again = orch.split_job(&id, 2).await.unwrap();
        assert_eq!(again.len(), 2);
        assert!(!dir.path().join(format!("{}_part3.3gp", id)).exists());
    }
}
