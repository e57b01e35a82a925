use thiserror::Error;

use crate::job::TransitionError;

/// Longest slice of raw tool diagnostics ever shown to a user
pub const DIAGNOSTIC_PREFIX_LEN: usize = 500;

/// Classified, terminal failure of one job.
///
/// Every variant renders to exactly one user-facing message through
/// [`JobError::user_message`]; raw diagnostics stay in the logs.
#[derive(Debug, Error)]
pub enum JobError {
    /// Scratch storage is exhausted even after reclamation
    #[error("admission rejected: {free_mb} MB free, {required_mb} MB required")]
    AdmissionRejected { free_mb: u64, required_mb: u64 },

    /// The downloaded source is too large to convert with the space left
    #[error("insufficient space for conversion: {free_mb} MB free, {required_mb} MB required")]
    InsufficientSpaceForConversion { free_mb: u64, required_mb: u64 },

    /// Content is unavailable and retrying other profiles cannot help
    #[error("acquisition failed permanently: {message}")]
    AcquisitionPermanentFailure { message: String },

    /// Every client profile was tried and blocked or rate limited
    #[error("acquisition exhausted after {attempts} attempts: {message}")]
    AcquisitionTransientExhausted { attempts: usize, message: String },

    #[error("acquisition timed out")]
    AcquisitionTimeout,

    #[error("duration {duration_secs:.0}s exceeds limit of {limit_secs}s")]
    DurationExceeded { duration_secs: f64, limit_secs: u64 },

    /// Primary and fallback encodes both failed
    #[error("transcoding failed: {diagnostic}")]
    TranscodingFailure { diagnostic: String },

    #[error("transcoding timed out")]
    TranscodingTimeout,

    /// The tool reported success but produced nothing usable
    #[error("output missing: {0}")]
    OutputMissing(String),

    #[error("split failed: {0}")]
    SplitFailure(String),

    #[error("interrupted by shutdown")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// The single classified message stored on a failed job
    pub fn user_message(&self) -> String {
        match self {
            JobError::AdmissionRejected { .. } => {
                "Server storage is full. Please try again later.".to_string()
            }
            JobError::InsufficientSpaceForConversion { .. } => {
                "Insufficient space for conversion. The video is too large to process right now.".to_string()
            }
            JobError::AcquisitionPermanentFailure { message } => message.clone(),
            JobError::AcquisitionTransientExhausted { message, .. } => message.clone(),
            JobError::AcquisitionTimeout => {
                "Processing timeout: the download took too long. Try a shorter video.".to_string()
            }
            JobError::DurationExceeded { limit_secs, .. } => format!(
                "Video is too long. Maximum duration is {}.",
                format_limit(*limit_secs)
            ),
            JobError::TranscodingFailure { diagnostic } => format!(
                "Conversion failed: {}",
                bounded_prefix(diagnostic, DIAGNOSTIC_PREFIX_LEN)
            ),
            JobError::TranscodingTimeout => {
                "Processing timeout: the conversion took too long. Try a shorter video.".to_string()
            }
            JobError::OutputMissing(_) => {
                "Conversion failed: no output file was produced.".to_string()
            }
            JobError::SplitFailure(_) => "Splitting the video into parts failed.".to_string(),
            JobError::Interrupted => "Processing was interrupted by a server restart. Please try again.".to_string(),
            JobError::Internal(detail) => format!(
                "Internal error: {}",
                bounded_prefix(detail, DIAGNOSTIC_PREFIX_LEN)
            ),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Internal(format!("{:#}", err))
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        JobError::Internal(err.to_string())
    }
}

/// Failure of the job store itself
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} already exists")]
    AlreadyExists(String),

    #[error("job {id}: {source}")]
    Transition { id: String, source: TransitionError },

    #[error("job store I/O on {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("job store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// First `max_chars` characters of `text`, trimmed, with an ellipsis when cut
pub fn bounded_prefix(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn format_limit(secs: u64) -> String {
    if secs >= 3600 && secs % 3600 == 0 {
        let hours = secs / 3600;
        format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}
