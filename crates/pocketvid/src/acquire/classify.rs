//! Classification of acquisition-tool diagnostics.
//!
//! The tool only reports free text, so classification is a heuristic: an
//! ordered table of (patterns, category) evaluated top to bottom, first
//! match wins. Extend the table, not the control flow.

/// Why an acquisition failed, as far as the diagnostics tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    RateLimited,
    AgeRestricted,
    Private,
    GeoBlocked,
    Copyright,
    LiveStream,
    SignInRequired,
    TooLarge,
    TooLong,
    Unavailable,
    Generic,
}

/// How the attempt loop should react to one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    /// Retrying with another profile cannot help
    Permanent,
    /// Blocked or throttled; the next profile may get through
    Transient,
    Unknown,
}

const CLASSIFICATION_TABLE: &[(&[&str], FailureCategory)] = &[
    (
        &["http error 429", "too many requests", "rate limit", "rate-limit", "ratelimit"],
        FailureCategory::RateLimited,
    ),
    (
        &["confirm your age", "age-restricted", "age restricted", "inappropriate for some users"],
        FailureCategory::AgeRestricted,
    ),
    (
        &["private video", "video is private", "members-only", "members only", "join this channel"],
        FailureCategory::Private,
    ),
    (
        &["not available in your country", "geo restrict", "geo-restrict", "blocked it in your country", "not made this video available in your country"],
        FailureCategory::GeoBlocked,
    ),
    (&["copyright"], FailureCategory::Copyright),
    (
        &["live event will begin", "premieres in", "is currently live", "live stream", "is_live"],
        FailureCategory::LiveStream,
    ),
    (
        &["sign in to confirm", "not a bot", "sign in", "login required", "use --cookies"],
        FailureCategory::SignInRequired,
    ),
    (&["larger than max-filesize", "max-filesize", "file is larger than"], FailureCategory::TooLarge),
    (&["video is too long", "exceeds maximum duration", "duration limit"], FailureCategory::TooLong),
    (
        &[
            "video unavailable",
            "has been removed",
            "does not exist",
            "no longer available",
            "not available",
            "http error 404",
            "unsupported url",
            "account associated with this video has been terminated",
        ],
        FailureCategory::Unavailable,
    ),
];

/// Markers of transient trouble that map to no specific category
const TRANSIENT_MARKERS: &[&str] = &[
    "http error 403",
    "forbidden",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "temporary failure",
    "http error 5",
    "unable to download webpage",
];

const CREDENTIALS_HINT: &str = " Uploading cookies from a signed-in browser session may help.";

/// Map diagnostic text to a category; unmatched text is `Generic`
pub fn classify_failure(diagnostic: &str) -> FailureCategory {
    let text = diagnostic.to_lowercase();
    CLASSIFICATION_TABLE
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| text.contains(p)))
        .map(|(_, category)| *category)
        .unwrap_or(FailureCategory::Generic)
}

/// Decide whether the loop should stop or move to the next profile
pub fn classify_attempt(diagnostic: &str) -> AttemptClass {
    match classify_failure(diagnostic) {
        FailureCategory::RateLimited | FailureCategory::AgeRestricted | FailureCategory::SignInRequired => {
            AttemptClass::Transient
        }
        FailureCategory::Private
        | FailureCategory::GeoBlocked
        | FailureCategory::Copyright
        | FailureCategory::LiveStream
        | FailureCategory::TooLarge
        | FailureCategory::TooLong
        | FailureCategory::Unavailable => AttemptClass::Permanent,
        FailureCategory::Generic => {
            let text = diagnostic.to_lowercase();
            if TRANSIENT_MARKERS.iter().any(|m| text.contains(m)) {
                AttemptClass::Transient
            } else {
                AttemptClass::Unknown
            }
        }
    }
}

impl FailureCategory {
    /// Whether cookies could plausibly change the outcome
    fn credentials_may_help(&self) -> bool {
        matches!(
            self,
            FailureCategory::RateLimited
                | FailureCategory::AgeRestricted
                | FailureCategory::Private
                | FailureCategory::SignInRequired
                | FailureCategory::Generic
        )
    }

    /// The fixed user-facing message, with the credentials hint appended
    /// only when no usable credentials are configured
    pub fn user_message(&self, has_credentials: bool) -> String {
        let base = match self {
            FailureCategory::RateLimited => {
                "YouTube is rate limiting this server. Please wait a few minutes and try again."
            }
            FailureCategory::AgeRestricted => "This video is age-restricted and requires a signed-in account.",
            FailureCategory::Private => "This video is private or for channel members only.",
            FailureCategory::GeoBlocked => "This video is not available in the server's region.",
            FailureCategory::Copyright => "This video was removed because of a copyright claim.",
            FailureCategory::LiveStream => "Live streams cannot be converted until the broadcast has ended.",
            FailureCategory::SignInRequired => "YouTube asked this server to sign in to confirm it is not a bot.",
            FailureCategory::TooLarge => "The video file exceeds the maximum allowed download size.",
            FailureCategory::TooLong => "The video is longer than the maximum allowed duration.",
            FailureCategory::Unavailable => {
                "This video is unavailable. It may have been removed or the link may be wrong."
            }
            FailureCategory::Generic => "Could not download the video after trying every client profile.",
        };
        if !has_credentials && self.credentials_may_help() {
            format!("{}{}", base, CREDENTIALS_HINT)
        } else {
            base.to_string()
        }
    }
}
