use std::time::Duration;

/// One acquisition "personality": a player-client hint plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub name: &'static str,
    /// Value for `--extractor-args youtube:player_client=<..>`
    pub player_client: &'static str,
    pub user_agent: &'static str,
    /// Extra `Header: value` pairs
    pub headers: Vec<(&'static str, &'static str)>,
}

impl ClientProfile {
    pub fn extractor_args(&self) -> String {
        format!("youtube:player_client={}", self.player_client)
    }
}

/// Profiles in the order they are tried, most reliable first
pub fn default_profiles() -> Vec<ClientProfile> {
    vec![
        ClientProfile {
            name: "android",
            player_client: "android",
            user_agent: "com.google.android.youtube/19.09.37 (Linux; U; Android 11) gzip",
            headers: vec![("X-YouTube-Client-Name", "3")],
        },
        ClientProfile {
            name: "ios",
            player_client: "ios",
            user_agent: "com.google.ios.youtube/19.09.3 (iPhone14,3; U; CPU iOS 15_6 like Mac OS X)",
            headers: vec![("X-YouTube-Client-Name", "5")],
        },
        ClientProfile {
            name: "tv_embedded",
            player_client: "tv_embedded",
            user_agent: "Mozilla/5.0 (PlayStation; PlayStation 4/11.00) AppleWebKit/605.1.15 (KHTML, like Gecko)",
            headers: vec![],
        },
        ClientProfile {
            name: "mweb",
            player_client: "mweb",
            user_agent: "Mozilla/5.0 (Linux; Android 11; Pixel 5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
            headers: vec![("Accept-Language", "en-US,en;q=0.9")],
        },
        ClientProfile {
            name: "web_safari",
            player_client: "web_safari",
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
            headers: vec![("Accept-Language", "en-US,en;q=0.9")],
        },
        ClientProfile {
            name: "web",
            player_client: "web",
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            headers: vec![("Accept-Language", "en-US,en;q=0.9")],
        },
        ClientProfile {
            name: "android_vr",
            player_client: "android_vr",
            user_agent: "com.google.android.apps.youtube.vr.oculus/1.56.21 (Linux; U; Android 12L; eureka-user Build/SQ3A.220605.009.A1) gzip",
            headers: vec![],
        },
    ]
}

/// Delay schedule between profiles, in units; the last entry repeats
const BACKOFF_SCHEDULE: [u32; 6] = [2, 4, 8, 12, 15, 20];

/// Inter-profile backoff.
///
/// The schedule is fixed; `unit` scales it so tests can run in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { unit: Duration::from_secs(1) }
    }
}

impl BackoffPolicy {
    pub fn with_unit(unit: Duration) -> Self {
        Self { unit }
    }

    /// Delay before 0-based attempt `attempt`; the first attempt never waits
    pub fn delay_before(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let idx = (attempt - 1).min(BACKOFF_SCHEDULE.len() - 1);
        self.unit.saturating_mul(BACKOFF_SCHEDULE[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn profile_order_is_fixed() {
        let names: Vec<_> = default_profiles().iter().map(|p| p.name).collect();
        assert_eq!(names, ["android", "ios", "tv_embedded", "mweb", "web_safari", "web", "android_vr"]);
        assert_eq!(default_profiles()[2].extractor_args(), "youtube:player_client=tv_embedded");
    }

    #[test]
    fn schedule_matches_documented_values() {
        let p = BackoffPolicy::default();
        let secs: Vec<u64> = (0..9).map(|i| p.delay_before(i).as_secs()).collect();
        assert_eq!(secs, vec![0, 2, 4, 8, 12, 15, 20, 20, 20]);
    }

    proptest! {
        /// Delays never shrink and are capped at the last schedule entry
        #[test]
        fn backoff_is_monotone_and_capped(a in 0usize..64, b in 0usize..64) {
            let p = BackoffPolicy::with_unit(Duration::from_millis(1));
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(p.delay_before(lo) <= p.delay_before(hi));
            prop_assert!(p.delay_before(hi) <= Duration::from_millis(20));
        }
    }
}
