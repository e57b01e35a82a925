//! End-to-end runs of the orchestrator over scripted tools.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pocketvid::acquire::BackoffPolicy;
use pocketvid::process::{ProcessOutput, ProcessSupervisor, RunError};
use pocketvid::proxy::NoProxy;
use pocketvid::tools::{AcquisitionTool, DiskSpace, FetchRequest, MediaProbe, TranscodeTool};
use pocketvid::{ConverterConfig, JobState, JobStore, Orchestrator, OutputFormat, Toolset};

const MB: u64 = 1024 * 1024;

fn exit(code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(code),
        success: code == 0,
        stdout: String::new(),
        stderr: stderr.to_string(),
        elapsed_secs: 0.01,
    }
}

/// Plays back one diagnostic per attempt; `None` means the attempt succeeds
struct ScriptedFetcher {
    script: Mutex<VecDeque<Option<&'static str>>>,
    seen: Mutex<Vec<(String, Option<PathBuf>)>>,
}

impl ScriptedFetcher {
    fn new(script: &[Option<&'static str>]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl AcquisitionTool for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<ProcessOutput, RunError> {
        self.seen
            .lock()
            .unwrap()
            .push((request.profile.name.to_string(), request.cookies.map(Path::to_path_buf)));
        let step = self.script.lock().unwrap().pop_front().unwrap_or(None);
        match step {
            None => {
                let path = request.output_dir.join(format!("{}.webm", request.output_prefix));
                fs::write(path, b"downloaded media").unwrap();
                Ok(exit(0, ""))
            }
            Some(diagnostic) => Ok(exit(1, diagnostic)),
        }
    }
}

/// Fails the listed 1-based calls, otherwise writes the output (last arg)
struct ScriptedEncoder {
    failing_calls: Vec<usize>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedEncoder {
    fn new(failing_calls: &[usize]) -> Arc<Self> {
        Arc::new(Self { failing_calls: failing_calls.to_vec(), calls: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl TranscodeTool for ScriptedEncoder {
    async fn transcode(&self, _job_id: &str, args: &[String]) -> Result<ProcessOutput, RunError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(args.to_vec());
            calls.len()
        };
        if self.failing_calls.contains(&n) {
            return Ok(exit(1, "Unknown encoder 'libamr_nb'"));
        }
        fs::write(args.last().unwrap(), vec![0u8; 2048]).unwrap();
        Ok(exit(0, ""))
    }
}

struct FixedProbe(f64);

#[async_trait]
impl MediaProbe for FixedProbe {
    async fn duration_secs(&self, _path: &Path) -> f64 {
        self.0
    }
}

/// Reports successive free-space readings, repeating the last one
struct ScriptedDisk(Mutex<VecDeque<u64>>);

impl ScriptedDisk {
    fn new(readings_mb: &[u64]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(readings_mb.iter().map(|mb| mb * MB).collect())))
    }
}

impl DiskSpace for ScriptedDisk {
    fn free_bytes(&self, _path: &Path) -> Option<u64> {
        let mut readings = self.0.lock().unwrap();
        if readings.len() > 1 {
            readings.pop_front()
        } else {
            readings.front().copied()
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    orch: Arc<Orchestrator>,
}

fn harness(
    fetcher: Arc<ScriptedFetcher>,
    encoder: Arc<ScriptedEncoder>,
    disk: Arc<ScriptedDisk>,
    cookies: Option<&str>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ConverterConfig::default_config();
    cfg.scratch_dir = dir.path().to_path_buf();
    cfg.state_file = dir.path().join("conversion_status.json");
    cfg.cookies_file = dir.path().join("cookies.txt");
    if let Some(content) = cookies {
        fs::write(&cfg.cookies_file, content).unwrap();
    }

    let store = Arc::new(JobStore::open(&cfg.state_file).unwrap());
    let tools = Toolset {
        acquisition: fetcher,
        transcoder: encoder,
        probe: Arc::new(FixedProbe(95.0)),
        disk,
        proxies: Arc::new(NoProxy),
    };
    let orch = Orchestrator::new(&cfg, store, Arc::new(ProcessSupervisor::new()), tools)
        .with_backoff(BackoffPolicy::with_unit(Duration::from_millis(1)));
    Harness { dir, orch: Arc::new(orch) }
}

fn plenty_of_disk() -> Arc<ScriptedDisk> {
    ScriptedDisk::new(&[50_000])
}

#[tokio::test]
async fn fallback_encode_completes_the_job() {
    let encoder = ScriptedEncoder::new(&[1]);
    let h = harness(ScriptedFetcher::new(&[None]), Arc::clone(&encoder), plenty_of_disk(), None);

    let id = h.orch.submit("https://www.youtube.com/watch?v=abc", OutputFormat::Video3gp, "low").unwrap();
    let record = h.orch.run_job(&id).await.unwrap();

    assert_eq!(record.state, JobState::Completed);
    assert!(record.is_consistent());
    assert!(record.completed_at.is_some());
    let desc = record.output_descriptor.unwrap();
    assert_eq!(desc.size_bytes, 2048);
    assert_eq!(desc.format, "3gp");
    assert!((desc.duration_secs - 95.0).abs() < 1e-9);

    let calls = encoder.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    let fallback = &calls[1];
    assert!(fallback.windows(2).any(|w| w[0] == "-r" && w[1] == "10"));

    let names: Vec<String> = fs::read_dir(h.dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with(&id))
        .collect();
    assert_eq!(names, vec![format!("{}.3gp", id)]);
}

#[tokio::test]
async fn both_encodes_failing_is_a_transcoding_failure() {
    let h = harness(ScriptedFetcher::new(&[None]), ScriptedEncoder::new(&[1, 2]), plenty_of_disk(), None);
    let id = h.orch.submit("https://youtu.be/abc", OutputFormat::AudioMp3, "high").unwrap();
    let record = h.orch.run_job(&id).await.unwrap();

    assert_eq!(record.state, JobState::Failed);
    let message = record.error_message.unwrap();
    assert!(message.starts_with("Conversion failed:"), "{}", message);
    assert!(record.output_descriptor.is_none());
    assert!(!h.dir.path().join(format!("{}.mp3", id)).exists());
}

#[tokio::test]
async fn permanent_failure_stops_after_the_second_profile() {
    let fetcher = ScriptedFetcher::new(&[
        Some("ERROR: HTTP Error 403: Forbidden"),
        Some("ERROR: [youtube] abc: Video unavailable"),
        None,
    ]);
    let h = harness(Arc::clone(&fetcher), ScriptedEncoder::new(&[]), plenty_of_disk(), None);
    let id = h.orch.submit("https://youtu.be/abc", OutputFormat::Video3gp, "low").unwrap();
    let record = h.orch.run_job(&id).await.unwrap();

    assert_eq!(fetcher.attempts(), vec!["android", "ios"]);
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("This video is unavailable. It may have been removed or the link may be wrong.")
    );
}

#[tokio::test]
async fn rate_limited_everywhere_exhausts_every_profile() {
    let fetcher = ScriptedFetcher::new(&[Some("ERROR: HTTP Error 429: Too Many Requests"); 7]);
    let h = harness(Arc::clone(&fetcher), ScriptedEncoder::new(&[]), plenty_of_disk(), None);
    let id = h.orch.submit("https://youtu.be/abc", OutputFormat::Video3gp, "low").unwrap();
    let record = h.orch.run_job(&id).await.unwrap();

    assert_eq!(
        fetcher.attempts(),
        vec!["android", "ios", "tv_embedded", "mweb", "web_safari", "web", "android_vr"]
    );
    assert_eq!(record.state, JobState::Failed);
    let message = record.error_message.unwrap();
    assert!(message.contains("rate limiting"));
    assert!(message.contains("cookies"));
    assert!(fetcher.seen.lock().unwrap().iter().all(|(_, cookies)| cookies.is_none()));
}

#[tokio::test]
async fn usable_cookies_are_passed_and_suppress_the_hint() {
    let cookies = "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc123\n";
    let fetcher = ScriptedFetcher::new(&[Some("Sign in to confirm you're not a bot"); 7]);
    let h = harness(Arc::clone(&fetcher), ScriptedEncoder::new(&[]), plenty_of_disk(), Some(cookies));
    let id = h.orch.submit("https://youtu.be/abc", OutputFormat::Video3gp, "low").unwrap();
    let record = h.orch.run_job(&id).await.unwrap();

    assert_eq!(
        record.error_message.as_deref(),
        Some("YouTube asked this server to sign in to confirm it is not a bot.")
    );
    let seen = fetcher.seen.lock().unwrap();
    assert_eq!(seen.len(), 7);
    assert!(seen.iter().all(|(_, c)| c.as_deref() == Some(h.dir.path().join("cookies.txt").as_path())));
}

#[tokio::test]
async fn low_space_after_download_discards_the_source() {
    // Admission sees 2000 MB, the conversion check sees 1000 MB
    let h = harness(
        ScriptedFetcher::new(&[None]),
        ScriptedEncoder::new(&[]),
        ScriptedDisk::new(&[2000, 1000]),
        None,
    );
    let id = h.orch.submit("https://youtu.be/abc", OutputFormat::Video3gp, "low").unwrap();
    let record = h.orch.run_job(&id).await.unwrap();

    assert_eq!(record.state, JobState::Failed);
    assert!(record.error_message.unwrap().starts_with("Insufficient space for conversion"));
    assert!(!h.dir.path().join(format!("{}_source.webm", id)).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_jobs_keep_the_store_consistent() {
    let fetcher = ScriptedFetcher::new(&[]);
    let h = harness(fetcher, ScriptedEncoder::new(&[]), plenty_of_disk(), None);

    let mut ids = Vec::new();
    for i in 0..6 {
        let format = if i % 2 == 0 { OutputFormat::Video3gp } else { OutputFormat::AudioMp3 };
        ids.push(h.orch.submit(&format!("https://youtu.be/v{}", i), format, "medium").unwrap());
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let orch = Arc::clone(&h.orch);
        handles.push(tokio::spawn(async move { orch.run_job(&id).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let records = h.orch.store().list_all();
    assert_eq!(records.len(), 6);
    for record in &records {
        assert_eq!(record.state, JobState::Completed, "{}", record.id);
        assert!(record.is_consistent());
    }
    for id in &ids {
        assert_eq!(h.orch.status_view(id).state, "completed");
    }
}
