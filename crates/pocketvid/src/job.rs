use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::preset::OutputFormat;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Downloading,
    Converting,
    Completed,
    Failed,
}

impl JobState {
    /// `completed` and `failed` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Downloading => 1,
            JobState::Converting => 2,
            JobState::Completed => 3,
            JobState::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the state machine.
    /// Staying in the same non-terminal state is allowed (progress updates).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed => true,
            JobState::Queued => *self == JobState::Queued,
            _ => next.rank() >= self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Downloading => "downloading",
            JobState::Converting => "converting",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of a finished output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// File name inside the scratch directory
    pub filename: String,
    pub size_bytes: u64,
    pub duration_secs: f64,
    /// Container tag, e.g. "3gp" or "mp3"
    pub format: String,
}

/// One independently playable slice produced by the segmenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// 1-based part number
    pub index: usize,
    pub filename: String,
    pub start_secs: f64,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// Persistent record of one acquire-and-transcode request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub source_reference: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub preset: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress_message: String,
    #[serde(default)]
    pub output_descriptor: Option<OutputDescriptor>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub parts: Vec<PartDescriptor>,
}

impl JobRecord {
    /// Create a freshly queued job
    pub fn new(id: String, source_reference: String, output_format: OutputFormat, preset: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Queued,
            source_reference,
            output_format,
            preset,
            created_at: now,
            updated_at: Some(now),
            completed_at: None,
            progress_message: "Queued".to_string(),
            output_descriptor: None,
            error_message: None,
            parts: Vec::new(),
        }
    }

    /// Derive a job id from the source reference, salted with the submission
    /// time so resubmitting the same reference never collides with a live job
    pub fn generate_id(source_reference: &str, submitted_at: DateTime<Utc>) -> String {
        let nanos = submitted_at.timestamp_nanos_opt().unwrap_or_else(|| submitted_at.timestamp_micros());
        let name = format!("{}#{}", source_reference, nanos);
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
        uuid.simple().to_string()[..12].to_string()
    }

    /// Name offered to the user when downloading the output
    pub fn download_name(&self) -> String {
        format!("video_{}.{}", self.id, self.output_format.extension())
    }

    /// Moment the retention horizon is measured from
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        match (self.state, self.completed_at) {
            (JobState::Completed, Some(done)) => done,
            _ => self.created_at,
        }
    }

    /// Check the state/field invariants: descriptor iff completed, error iff failed
    pub fn is_consistent(&self) -> bool {
        let descriptor_ok = self.output_descriptor.is_some() == (self.state == JobState::Completed);
        let error_ok = self.error_message.is_some() == (self.state == JobState::Failed);
        descriptor_ok && error_ok
    }

    /// Every scratch file this job may own, present or not
    pub fn owned_files(&self, scratch_dir: &Path) -> Vec<PathBuf> {
        let mut files = vec![output_path(scratch_dir, &self.id, self.output_format)];
        if let Some(desc) = &self.output_descriptor {
            let named = scratch_dir.join(&desc.filename);
            if !files.contains(&named) {
                files.push(named);
            }
        }
        files.extend(self.parts.iter().map(|p| scratch_dir.join(&p.filename)));
        files
    }
}

/// Partial update merged into a record under the store lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub progress_message: Option<String>,
    pub output_descriptor: Option<OutputDescriptor>,
    pub error_message: Option<String>,
    pub parts: Option<Vec<PartDescriptor>>,
}

impl JobUpdate {
    /// Only overwrite the progress message
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            progress_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Move to a non-terminal state with a new progress message
    pub fn state(state: JobState, message: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            progress_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn completed(descriptor: OutputDescriptor, message: impl Into<String>) -> Self {
        Self {
            state: Some(JobState::Completed),
            progress_message: Some(message.into()),
            output_descriptor: Some(descriptor),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            state: Some(JobState::Failed),
            progress_message: Some(format!("Error: {}", message)),
            error_message: Some(message),
            ..Default::default()
        }
    }

    pub fn parts(parts: Vec<PartDescriptor>) -> Self {
        Self {
            parts: Some(parts),
            ..Default::default()
        }
    }
}

/// Why an update could not be merged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: JobState, to: JobState },
    #[error("completed state requires an output descriptor")]
    MissingDescriptor,
    #[error("failed state requires an error message")]
    MissingErrorMessage,
}

impl JobUpdate {
    /// Merge into `record`, enforcing the state machine and the
    /// descriptor/error invariants. The record is untouched on error.
    pub fn apply(self, record: &mut JobRecord, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next_state = self.state.unwrap_or(record.state);

        let changes_state = next_state != record.state || (record.state.is_terminal() && self.state.is_some());
        if changes_state && !record.state.can_transition_to(next_state) {
            return Err(TransitionError::Illegal { from: record.state, to: next_state });
        }

        match next_state {
            JobState::Completed if self.output_descriptor.is_none() && record.output_descriptor.is_none() => {
                return Err(TransitionError::MissingDescriptor);
            }
            JobState::Failed if self.error_message.is_none() && record.error_message.is_none() => {
                return Err(TransitionError::MissingErrorMessage);
            }
            _ => {}
        }

        let entering_completed = next_state == JobState::Completed && record.state != JobState::Completed;
        record.state = next_state;

        if let Some(message) = self.progress_message {
            record.progress_message = message;
        }
        match next_state {
            JobState::Completed => {
                if let Some(desc) = self.output_descriptor {
                    record.output_descriptor = Some(desc);
                }
                record.error_message = None;
                if entering_completed {
                    record.completed_at = Some(now);
                }
            }
            JobState::Failed => {
                if let Some(err) = self.error_message {
                    record.error_message = Some(err);
                }
                record.output_descriptor = None;
            }
            _ => {
                record.output_descriptor = None;
                record.error_message = None;
            }
        }
        if let Some(parts) = self.parts {
            record.parts = parts;
        }
        record.updated_at = Some(now);
        Ok(())
    }
}

/// Final output location for a job
pub fn output_path(scratch_dir: &Path, job_id: &str, format: OutputFormat) -> PathBuf {
    scratch_dir.join(format!("{}.{}", job_id, format.extension()))
}

/// Prefix the acquisition tool writes the downloaded source under
pub fn source_prefix(job_id: &str) -> String {
    format!("{}_source", job_id)
}

/// Location of part `index` (1-based)
pub fn part_path(scratch_dir: &Path, job_id: &str, index: usize, extension: &str) -> PathBuf {
    scratch_dir.join(format!("{}_part{}.{}", job_id, index, extension))
}

/// Job id a scratch file belongs to, if its name follows the naming scheme
pub fn job_id_of_file(file_name: &str) -> Option<&str> {
    let stem = file_name.split('.').next()?;
    let id = stem.split('_').next()?;
    if id.len() == 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(id)
    } else {
        None
    }
}
