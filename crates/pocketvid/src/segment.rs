//! Splitting a finished output into independently playable parts.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use log::{info, warn};

use crate::error::JobError;
use crate::job::{part_path, PartDescriptor};
use crate::preset::{OutputFormat, QualityPreset};
use crate::process::RunError;
use crate::tools::{MediaProbe, TranscodeTool};
use crate::transcode::{build_slice_args, remove_quietly};

/// No part is planned shorter than this unless the source itself is
pub const MIN_PART_SECS: f64 = 10.0;

/// A planned time slice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPlan {
    pub start_secs: f64,
    pub duration_secs: f64,
}

/// Slice `total_secs` into at most `requested` parts of equal length,
/// dropping parts until each is at least [`MIN_PART_SECS`]. The last part
/// absorbs the remainder so durations sum to `total_secs`.
pub fn plan_segments(total_secs: f64, requested: usize) -> Vec<SegmentPlan> {
    if !(total_secs > 0.0) || !total_secs.is_finite() {
        return Vec::new();
    }
    let by_floor = (total_secs / MIN_PART_SECS).floor().max(1.0) as usize;
    let count = requested.max(1).min(by_floor);
    let per_part = total_secs / count as f64;

    (0..count)
        .map(|i| {
            let start_secs = per_part * i as f64;
            let duration_secs = if i + 1 == count { total_secs - start_secs } else { per_part };
            SegmentPlan { start_secs, duration_secs }
        })
        .collect()
}

pub struct Segmenter {
    tool: Arc<dyn TranscodeTool>,
    probe: Arc<dyn MediaProbe>,
}

impl Segmenter {
    pub fn new(tool: Arc<dyn TranscodeTool>, probe: Arc<dyn MediaProbe>) -> Self {
        Self { tool, probe }
    }

    /// Split `output` into `part_count` parts next to it. Either every part
    /// is produced or none is left on disk.
    pub async fn split(&self, job_id: &str, output: &Path, part_count: usize) -> Result<Vec<PartDescriptor>, JobError> {
        let extension = output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        let format = OutputFormat::from_extension(&extension)
            .ok_or_else(|| JobError::SplitFailure(format!("unsupported output type: {}", output.display())))?;
        let dir = output
            .parent()
            .ok_or_else(|| JobError::SplitFailure(format!("no parent directory: {}", output.display())))?;
        if !output.exists() {
            return Err(JobError::SplitFailure(format!("output missing: {}", output.display())));
        }

        let total = self.probe.duration_secs(output).await;
        let plan = plan_segments(total, part_count);
        if plan.is_empty() {
            return Err(JobError::SplitFailure(format!("cannot split: duration is {:.2}s", total)));
        }
        if plan.len() < part_count {
            info!(
                "Job {}: reducing split from {} to {} parts ({:.1}s total)",
                job_id,
                part_count,
                plan.len(),
                total
            );
        }

        let preset = QualityPreset::resolve(format, format.default_preset());
        let mut parts: Vec<PartDescriptor> = Vec::with_capacity(plan.len());
        for (i, slice) in plan.iter().enumerate() {
            let index = i + 1;
            let path = part_path(dir, job_id, index, &extension);
            match self.encode_part(job_id, output, &path, &preset, slice).await {
                Ok(size_bytes) => parts.push(PartDescriptor {
                    index,
                    filename: format!("{}_part{}.{}", job_id, index, extension),
                    start_secs: slice.start_secs,
                    duration_secs: slice.duration_secs,
                    size_bytes,
                }),
                Err(e) => {
                    warn!("Job {}: part {} failed, discarding {} written parts", job_id, index, parts.len());
                    remove_quietly(&path);
                    for written in &parts {
                        remove_quietly(&dir.join(&written.filename));
                    }
                    return Err(e);
                }
            }
        }
        info!("Job {}: ✂️ split into {} parts", job_id, parts.len());
        Ok(parts)
    }

    async fn encode_part(
        &self,
        job_id: &str,
        input: &Path,
        path: &Path,
        preset: &QualityPreset,
        slice: &SegmentPlan,
    ) -> Result<u64, JobError> {
        let args = build_slice_args(input, path, preset, slice.start_secs, slice.duration_secs);
        match self.tool.transcode(job_id, &args).await {
            Ok(out) if out.success => {}
            Ok(out) => {
                return Err(JobError::SplitFailure(format!(
                    "encoder exit code {}: {}",
                    out.exit_code.unwrap_or(-1),
                    out.diagnostic().trim()
                )))
            }
            Err(RunError::Shutdown { .. }) => return Err(JobError::Interrupted),
            Err(e) => return Err(JobError::SplitFailure(e.to_string())),
        }
        match fs::metadata(path) {
            Ok(m) if m.len() > 0 => Ok(m.len()),
            _ => Err(JobError::SplitFailure(format!("part missing: {}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[test]
    fn three_hundred_seconds_in_three_parts() {
        let plan = plan_segments(300.0, 3);
        assert_eq!(plan.len(), 3);
        for p in &plan {
            assert!((p.duration_secs - 100.0).abs() < 1e-9);
        }
        assert!((plan[2].start_secs + plan[2].duration_secs - 300.0).abs() < 1e-9);
    }

    #[test]
    fn floor_reduces_the_part_count() {
        assert_eq!(plan_segments(25.0, 5).len(), 2);
        assert_eq!(plan_segments(5.0, 3).len(), 1);
        assert_eq!(plan_segments(5.0, 3)[0].duration_secs, 5.0);
        assert!(plan_segments(0.0, 3).is_empty());
        assert!(plan_segments(f64::NAN, 3).is_empty());
        assert_eq!(plan_segments(60.0, 0).len(), 1);
    }

    proptest! {
        /// Durations sum to the source and only the floor shortens the count
        #[test]
        fn durations_cover_the_source(total in 0.5f64..20_000.0, requested in 1usize..40) {
            let plan = plan_segments(total, requested);
            prop_assert!(!plan.is_empty());
            prop_assert!(plan.len() <= requested);
            let sum: f64 = plan.iter().map(|p| p.duration_secs).sum();
            prop_assert!((sum - total).abs() < 1e-6);

            let per = total / plan.len() as f64;
            for p in &plan {
                prop_assert!(p.duration_secs >= per - 1e-6);
            }
            if plan.len() > 1 {
                prop_assert!(per >= MIN_PART_SECS - 1e-9);
            }
            if plan.len() < requested {
                prop_assert!(total / ((plan.len() + 1) as f64) < MIN_PART_SECS);
            }
            for pair in plan.windows(2) {
                prop_assert!((pair[0].start_secs + pair[0].duration_secs - pair[1].start_secs).abs() < 1e-6);
            }
        }
    }

    /// Writes the output file for each call, failing on call `fail_on`
    struct PartEncoder {
        fail_on: Option<usize>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl TranscodeTool for PartEncoder {
        async fn transcode(&self, _job_id: &str, args: &[String]) -> Result<ProcessOutput, RunError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            let ok = self.fail_on != Some(n);
            let output = PathBuf::from(args.last().unwrap());
            fs::write(&output, if ok { &b"part"[..] } else { &b""[..] }).unwrap();
            Ok(ProcessOutput {
                exit_code: Some(if ok { 0 } else { 1 }),
                success: ok,
                stdout: String::new(),
                stderr: if ok { String::new() } else { "Invalid data".to_string() },
                elapsed_secs: 0.1,
            })
        }
    }

    struct FixedProbe(f64);

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn duration_secs(&self, _path: &Path) -> f64 {
            self.0
        }
    }

    fn segmenter(fail_on: Option<usize>, duration: f64) -> Segmenter {
        Segmenter::new(
            Arc::new(PartEncoder { fail_on, calls: Mutex::new(0) }),
            Arc::new(FixedProbe(duration)),
        )
    }

    #[tokio::test]
    async fn split_produces_named_parts() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("abcdef012345.3gp");
        fs::write(&output, b"video").unwrap();
        let parts = segmenter(None, 300.0).split("abcdef012345", &output, 3).await.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].filename, "abcdef012345_part2.3gp");
        assert!((parts[2].start_secs - 200.0).abs() < 1e-9);
        for p in &parts {
            assert!(dir.path().join(&p.filename).exists());
        }
    }

    #[tokio::test]
    async fn failing_part_discards_everything_written() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("abcdef012345.mp3");
        fs::write(&output, b"audio").unwrap();
        let err = segmenter(Some(3), 400.0).split("abcdef012345", &output, 4).await.unwrap_err();
        assert!(matches!(err, JobError::SplitFailure(_)));
        let remaining: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().map(|e| e.file_name()).collect();
        assert_eq!(remaining, vec![std::ffi::OsString::from("abcdef012345.mp3")]);
    }

    #[tokio::test]
    async fn zero_duration_cannot_be_split() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("abcdef012345.3gp");
        fs::write(&output, b"video").unwrap();
        let err = segmenter(None, 0.0).split("abcdef012345", &output, 2).await.unwrap_err();
        assert!(matches!(err, JobError::SplitFailure(_)));
    }
}
