//! Acquisition strategy engine.
//!
//! Drives the acquisition tool through an ordered list of client profiles,
//! backing off between attempts, until one attempt produces a file, a
//! failure is known to be permanent, or every profile has been tried.

pub mod classify;
pub mod profile;
pub mod ytdlp;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};

use crate::credentials::usable_cookies;
use crate::error::{bounded_prefix, JobError, DIAGNOSTIC_PREFIX_LEN};
use crate::preset::OutputFormat;
use crate::process::RunError;
use crate::proxy::{NoProxy, ProxySource};
use crate::tools::{AcquisitionTool, FetchRequest};

pub use classify::{classify_attempt, classify_failure, AttemptClass, FailureCategory};
pub use profile::{default_profiles, BackoffPolicy, ClientProfile};

/// Result of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(PathBuf),
    Permanent(String),
    Transient(String),
    Unknown(String),
    TimedOut,
}

impl AttemptOutcome {
    fn from_diagnostic(text: String) -> Self {
        match classify_attempt(&text) {
            AttemptClass::Permanent => AttemptOutcome::Permanent(text),
            AttemptClass::Transient => AttemptOutcome::Transient(text),
            AttemptClass::Unknown => AttemptOutcome::Unknown(text),
        }
    }
}

/// What happened on one attempt, for logs and tests
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub profile: &'static str,
    /// Backoff slept before this attempt
    pub delay: Duration,
    pub proxy: Option<String>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug)]
pub struct AcquisitionReport {
    pub attempts: Vec<AttemptRecord>,
    pub result: Result<PathBuf, JobError>,
}

/// Everything one acquisition needs to know about its job
#[derive(Debug, Clone, Copy)]
pub struct AcquireTarget<'a> {
    pub job_id: &'a str,
    pub source_reference: &'a str,
    pub scratch_dir: &'a Path,
    /// Prefix of the file the tool must produce
    pub output_prefix: &'a str,
    pub format: OutputFormat,
}

pub struct AcquisitionEngine {
    tool: Arc<dyn AcquisitionTool>,
    profiles: Vec<ClientProfile>,
    backoff: BackoffPolicy,
    proxies: Arc<dyn ProxySource>,
    cookies_file: Option<PathBuf>,
}

impl AcquisitionEngine {
    pub fn new(tool: Arc<dyn AcquisitionTool>) -> Self {
        Self {
            tool,
            profiles: default_profiles(),
            backoff: BackoffPolicy::default(),
            proxies: Arc::new(NoProxy),
            cookies_file: None,
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<ClientProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_proxies(mut self, proxies: Arc<dyn ProxySource>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_cookies_file(mut self, path: Option<PathBuf>) -> Self {
        self.cookies_file = path;
        self
    }

    pub fn profiles(&self) -> &[ClientProfile] {
        &self.profiles
    }

    /// Acquire the source, returning the local file
    pub async fn acquire(
        &self,
        target: AcquireTarget<'_>,
        on_progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<PathBuf, JobError> {
        self.acquire_reported(target, on_progress).await.result
    }

    /// Like [`acquire`](Self::acquire) but also returns every attempt made
    pub async fn acquire_reported(
        &self,
        target: AcquireTarget<'_>,
        on_progress: &(dyn Fn(String) + Send + Sync),
    ) -> AcquisitionReport {
        let job_id = target.job_id;
        let cookies = self.cookies_file.as_deref().and_then(usable_cookies);
        let has_credentials = cookies.is_some();
        let total = self.profiles.len();
        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(total);

        for (i, profile) in self.profiles.iter().enumerate() {
            let delay = self.backoff.delay_before(i);
            if !delay.is_zero() {
                debug!("Job {}: backing off {:?} before client {}", job_id, delay, profile.name);
                tokio::time::sleep(delay).await;
            }

            on_progress(format!(
                "Downloading video (attempt {}/{}, client {})...",
                i + 1,
                total,
                profile.name
            ));
            remove_leftovers(target.scratch_dir, target.output_prefix);

            let proxy = self.proxies.next_proxy();
            let request = FetchRequest {
                job_id,
                source_reference: target.source_reference,
                output_dir: target.scratch_dir,
                output_prefix: target.output_prefix,
                format: target.format,
                profile,
                proxy: proxy.as_deref(),
                cookies,
                attempt: i + 1,
            };

            let outcome = match self.tool.fetch(&request).await {
                Ok(out) if out.success => match find_output(target.scratch_dir, target.output_prefix) {
                    Some(path) => AttemptOutcome::Success(path),
                    // A skipped download (e.g. over --max-filesize) exits 0 and explains itself on stdout
                    None if out.diagnostic().trim().is_empty() => {
                        AttemptOutcome::Unknown("acquisition tool exited cleanly but produced no file".to_string())
                    }
                    None => AttemptOutcome::from_diagnostic(out.diagnostic().to_string()),
                },
                Ok(out) => AttemptOutcome::from_diagnostic(out.diagnostic().to_string()),
                Err(RunError::TimedOut { .. }) => AttemptOutcome::TimedOut,
                Err(RunError::Shutdown { .. }) => {
                    return AcquisitionReport { attempts, result: Err(JobError::Interrupted) };
                }
                Err(e) => AttemptOutcome::Unknown(e.to_string()),
            };

            // Only network-class trouble counts against the proxy
            if let Some(p) = &proxy {
                match outcome {
                    AttemptOutcome::Success(_) => self.proxies.report_success(p),
                    AttemptOutcome::Transient(_) | AttemptOutcome::TimedOut => self.proxies.report_failure(p),
                    AttemptOutcome::Permanent(_) | AttemptOutcome::Unknown(_) => {}
                }
            }

            log_outcome(job_id, profile.name, &outcome);
            attempts.push(AttemptRecord {
                profile: profile.name,
                delay,
                proxy,
                outcome: outcome.clone(),
            });

            match outcome {
                AttemptOutcome::Success(path) => {
                    info!("Job {}: ✅ acquired with client {} on attempt {}", job_id, profile.name, i + 1);
                    return AcquisitionReport { attempts, result: Ok(path) };
                }
                AttemptOutcome::Permanent(text) => {
                    let category = classify_failure(&text);
                    remove_leftovers(target.scratch_dir, target.output_prefix);
                    return AcquisitionReport {
                        attempts,
                        result: Err(JobError::AcquisitionPermanentFailure {
                            message: category.user_message(has_credentials),
                        }),
                    };
                }
                AttemptOutcome::Transient(_) | AttemptOutcome::Unknown(_) | AttemptOutcome::TimedOut => {}
            }
        }

        remove_leftovers(target.scratch_dir, target.output_prefix);
        let result = Err(exhaustion_error(&attempts, has_credentials));
        warn!("Job {}: all {} client profiles exhausted", job_id, attempts.len());
        AcquisitionReport { attempts, result }
    }
}

/// Pick the single error reported once every profile failed
fn exhaustion_error(attempts: &[AttemptRecord], has_credentials: bool) -> JobError {
    match attempts.last().map(|a| &a.outcome) {
        Some(AttemptOutcome::TimedOut) => JobError::AcquisitionTimeout,
        Some(AttemptOutcome::Transient(text)) | Some(AttemptOutcome::Unknown(text)) => {
            JobError::AcquisitionTransientExhausted {
                attempts: attempts.len(),
                message: classify_failure(text).user_message(has_credentials),
            }
        }
        _ => JobError::AcquisitionTransientExhausted {
            attempts: attempts.len(),
            message: FailureCategory::Generic.user_message(has_credentials),
        },
    }
}

fn log_outcome(job_id: &str, profile: &str, outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::Success(path) => debug!("Job {}: client {} produced {}", job_id, profile, path.display()),
        AttemptOutcome::Permanent(text) => warn!(
            "Job {}: client {} failed permanently: {}",
            job_id,
            profile,
            bounded_prefix(text, DIAGNOSTIC_PREFIX_LEN)
        ),
        AttemptOutcome::Transient(text) | AttemptOutcome::Unknown(text) => warn!(
            "Job {}: client {} failed: {}",
            job_id,
            profile,
            bounded_prefix(text, DIAGNOSTIC_PREFIX_LEN)
        ),
        AttemptOutcome::TimedOut => warn!("Job {}: client {} timed out", job_id, profile),
    }
}

/// Partial-download suffixes the tool leaves behind
fn is_partial(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".temp") || name.contains(".part-Frag")
}

/// The finished, non-empty file for `prefix`, if any
pub fn find_output(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let wanted = format!("{}.", prefix);
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&wanted) && !is_partial(&name)
        })
        .filter(|e| e.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false))
        .map(|e| e.path())
        .next()
}

/// Delete anything a previous attempt left under `prefix`
pub fn remove_leftovers(dir: &Path, prefix: &str) {
    let wanted = format!("{}.", prefix);
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&wanted) {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("Failed to remove leftover {}: {}", entry.path().display(), e);
            }
        }
    }
}
