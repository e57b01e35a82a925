use std::fs;
use std::path::Path;
use std::sync::Arc;
use humansize::{format_size, DECIMAL};
use log::{info, warn};

use crate::error::{bounded_prefix, JobError, DIAGNOSTIC_PREFIX_LEN};
use crate::job::OutputDescriptor;
use crate::preset::{OutputFormat, QualityPreset};
use crate::process::RunError;
use crate::tools::{MediaProbe, TranscodeTool};

/// Build the ffmpeg command line for one encode
pub fn build_transcode_args(input: &Path, output: &Path, preset: &QualityPreset) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
    ];
    args.extend(preset.encoder_args());
    args.push(output.to_string_lossy().to_string());
    args
}

/// Same, restricted to the slice `[start, start + duration)` of the input
pub fn build_slice_args(input: &Path, output: &Path, preset: &QualityPreset, start_secs: f64, duration_secs: f64) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        format!("{:.3}", start_secs),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-t".to_string(),
        format!("{:.3}", duration_secs),
    ];
    args.extend(preset.encoder_args());
    args.push(output.to_string_lossy().to_string());
    args
}

/// Progress text stored once a job completes
pub fn completion_message(descriptor: &OutputDescriptor) -> String {
    format!("Conversion complete! File size: {}", format_size(descriptor.size_bytes, DECIMAL))
}

/// Encodes an acquired source into the requested output
pub struct TranscodeEngine {
    tool: Arc<dyn TranscodeTool>,
    probe: Arc<dyn MediaProbe>,
    max_duration_secs: u64,
}

impl TranscodeEngine {
    pub fn new(tool: Arc<dyn TranscodeTool>, probe: Arc<dyn MediaProbe>, max_duration_secs: u64) -> Self {
        Self { tool, probe, max_duration_secs }
    }

    /// Reject sources longer than the configured maximum, deleting them.
    /// An unknown duration (probe failure) is let through.
    pub async fn check_duration(&self, job_id: &str, source: &Path) -> Result<f64, JobError> {
        let duration = self.probe.duration_secs(source).await;
        if duration > self.max_duration_secs as f64 {
            warn!(
                "Job {}: duration {:.0}s exceeds limit {}s",
                job_id, duration, self.max_duration_secs
            );
            remove_quietly(source);
            return Err(JobError::DurationExceeded {
                duration_secs: duration,
                limit_secs: self.max_duration_secs,
            });
        }
        Ok(duration)
    }

    /// Encode `source` into `output`, retrying once with the safe preset.
    /// The source is deleted whatever the outcome.
    pub async fn transcode(
        &self,
        job_id: &str,
        source: &Path,
        output: &Path,
        format: OutputFormat,
        preset_name: &str,
        on_progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<OutputDescriptor, JobError> {
        let result = self.encode_with_fallback(job_id, source, output, format, preset_name, on_progress).await;
        remove_quietly(source);
        if let Err(e) = result {
            remove_quietly(output);
            return Err(e);
        }

        let size_bytes = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if size_bytes == 0 {
            remove_quietly(output);
            return Err(JobError::OutputMissing(output.display().to_string()));
        }
        let duration_secs = self.probe.duration_secs(output).await;
        let filename = output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let descriptor = OutputDescriptor {
            filename,
            size_bytes,
            duration_secs,
            format: format.extension().to_string(),
        };
        info!(
            "Job {}: ✅ encoded {} ({}, {:.1}s)",
            job_id,
            descriptor.filename,
            format_size(size_bytes, DECIMAL),
            duration_secs
        );
        Ok(descriptor)
    }

    async fn encode_with_fallback(
        &self,
        job_id: &str,
        source: &Path,
        output: &Path,
        format: OutputFormat,
        preset_name: &str,
        on_progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), JobError> {
        let primary = QualityPreset::resolve(format, preset_name);
        on_progress(format!("Converting to {}...", primary.describe()));

        let first_diagnostic = match self.run_once(job_id, source, output, &primary).await? {
            None => return Ok(()),
            Some(diagnostic) => diagnostic,
        };
        warn!(
            "Job {}: primary encode ({}) failed, retrying with safe preset: {}",
            job_id,
            primary.name,
            bounded_prefix(&first_diagnostic, DIAGNOSTIC_PREFIX_LEN)
        );
        remove_quietly(output);

        let safe = QualityPreset::safe(format);
        on_progress(format!("Retrying conversion with safe settings ({})...", safe.describe()));
        match self.run_once(job_id, source, output, &safe).await? {
            None => Ok(()),
            Some(diagnostic) => Err(JobError::TranscodingFailure { diagnostic }),
        }
    }

    /// `Ok(None)` on success, `Ok(Some(diagnostic))` on a failed encode,
    /// `Err` for outcomes that must not be retried
    async fn run_once(
        &self,
        job_id: &str,
        source: &Path,
        output: &Path,
        preset: &QualityPreset,
    ) -> Result<Option<String>, JobError> {
        let args = build_transcode_args(source, output, preset);
        match self.tool.transcode(job_id, &args).await {
            Ok(out) if out.success => Ok(None),
            Ok(out) => Ok(Some(format!(
                "exit code {}: {}",
                out.exit_code.unwrap_or(-1),
                out.diagnostic().trim()
            ))),
            Err(RunError::TimedOut { .. }) => Err(JobError::TranscodingTimeout),
            Err(RunError::Shutdown { .. }) => Err(JobError::Interrupted),
            Err(e) => Ok(Some(e.to_string())),
        }
    }
}

pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}
