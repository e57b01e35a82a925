//! Gate for source references before a job is created.

use thiserror::Error;
use url::Url;

/// Hosts the acquisition pipeline accepts, matched exactly or as a parent domain
const ACCEPTED_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Please enter a YouTube URL")]
    Empty,

    #[error("Please enter a valid YouTube URL")]
    Unsupported(String),
}

/// Check that `raw` points at a supported video host and return it in
/// canonical form. A missing scheme is taken as https.
pub fn validate_source_reference(raw: &str) -> Result<String, SourceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SourceError::Empty);
    }

    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("https://{}", trimmed))
    }
    .map_err(|_| SourceError::Unsupported(trimmed.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SourceError::Unsupported(trimmed.to_string()));
    }
    let host = parsed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| SourceError::Unsupported(trimmed.to_string()))?;
    let accepted = ACCEPTED_HOSTS
        .iter()
        .any(|allowed| host == *allowed || host.ends_with(&format!(".{}", allowed)));
    if !accepted {
        return Err(SourceError::Unsupported(trimmed.to_string()));
    }
    Ok(parsed.to_string())
}
