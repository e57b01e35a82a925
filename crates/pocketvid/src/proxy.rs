//! Optional network-proxy layer under the acquisition attempt loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ConverterConfig;
use crate::store::write_atomic;

/// Consecutive failures after which an endpoint is dropped
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Most endpoints a pool keeps unless told otherwise
pub const DEFAULT_MAX_ENDPOINTS: usize = 20;

/// Supplies one proxy endpoint per attempt and learns from outcomes
pub trait ProxySource: Send + Sync {
    /// Endpoint for the next attempt; `None` means connect directly
    fn next_proxy(&self) -> Option<String>;

    fn report_success(&self, proxy: &str);

    fn report_failure(&self, proxy: &str);
}

/// Direct connections only
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxy;

impl ProxySource for NoProxy {
    fn next_proxy(&self) -> Option<String> {
        None
    }

    fn report_success(&self, _proxy: &str) {}

    fn report_failure(&self, _proxy: &str) {}
}

/// The same endpoint on every attempt, never evicted
#[derive(Debug, Clone)]
pub struct FixedProxy(pub String);

impl ProxySource for FixedProxy {
    fn next_proxy(&self) -> Option<String> {
        Some(self.0.clone())
    }

    fn report_success(&self, _proxy: &str) {}

    fn report_failure(&self, _proxy: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub url: String,
    #[serde(default)]
    pub success_count: u64,
    /// Failures since the last success
    #[serde(default)]
    pub fail_count: u32,
}

impl ProxyEntry {
    fn new(url: String) -> Self {
        Self { url, success_count: 0, fail_count: 0 }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProxyCache {
    proxies: Vec<ProxyEntry>,
    #[serde(default)]
    loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PoolState {
    proxies: Vec<ProxyEntry>,
    cursor: usize,
    loaded_at: Option<DateTime<Utc>>,
}

/// Where a rotating pool re-reads its endpoints from on refresh
#[derive(Debug, Clone, Default)]
pub struct EndpointOrigin {
    pub fixed: Vec<String>,
    pub list_file: Option<PathBuf>,
}

impl EndpointOrigin {
    pub fn read(&self) -> Vec<String> {
        let mut endpoints = self.fixed.clone();
        if let Some(list) = &self.list_file {
            endpoints.extend(read_proxy_list(list));
        }
        endpoints
    }
}

#[derive(Debug)]
struct Refresh {
    origin: EndpointOrigin,
    interval: chrono::Duration,
}

/// Snapshot of the pool for status output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyStats {
    pub enabled: bool,
    pub total_proxies: usize,
    pub current_index: usize,
    pub loaded_at: Option<DateTime<Utc>>,
    pub cache_age_secs: Option<i64>,
}

/// Round-robin pool with eviction after repeated failures
#[derive(Debug)]
pub struct ProxyPool {
    state: Mutex<PoolState>,
    cache_path: Option<PathBuf>,
    refresh: Option<Refresh>,
    max_endpoints: usize,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<String>, cache_path: Option<PathBuf>) -> Self {
        let mut proxies: Vec<ProxyEntry> = Vec::new();
        for url in endpoints {
            if !proxies.iter().any(|p| p.url == url) {
                proxies.push(ProxyEntry::new(url));
            }
        }
        proxies.truncate(DEFAULT_MAX_ENDPOINTS);
        Self {
            state: Mutex::new(PoolState {
                proxies,
                cursor: 0,
                loaded_at: Some(Utc::now()),
            }),
            cache_path,
            refresh: None,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
        }
    }

    /// Re-read endpoints from `origin` whenever the pool is empty or older than `interval`
    pub fn with_refresh(mut self, origin: EndpointOrigin, interval: chrono::Duration) -> Self {
        self.refresh = Some(Refresh { origin, interval });
        self
    }

    /// Cap the pool at `max` endpoints, dropping the tail
    pub fn with_max_endpoints(mut self, max: usize) -> Self {
        self.max_endpoints = max.max(1);
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.proxies.truncate(self.max_endpoints);
        if state.cursor >= state.proxies.len() {
            state.cursor = 0;
        }
        self
    }

    /// Build the pool from configured endpoints, merging counters from the cache
    pub fn load(endpoints: Vec<String>, cache_path: PathBuf) -> Self {
        let pool = Self::new(endpoints, Some(cache_path.clone()));
        match read_cache(&cache_path) {
            Some(cache) => {
                let mut state = pool.lock_state();
                for cached in cache.proxies {
                    match state.proxies.iter_mut().find(|p| p.url == cached.url) {
                        Some(entry) => *entry = cached,
                        None => state.proxies.push(cached),
                    }
                }
                if cache.loaded_at.is_some() {
                    state.loaded_at = cache.loaded_at;
                }
                state.proxies.truncate(DEFAULT_MAX_ENDPOINTS);
                info!("Proxy pool: {} endpoints (cache {})", state.proxies.len(), cache_path.display());
            }
            None => debug!("No proxy cache at {}", cache_path.display()),
        }
        pool
    }

    pub fn stats(&self) -> ProxyStats {
        let state = self.lock_state();
        ProxyStats {
            enabled: true,
            total_proxies: state.proxies.len(),
            current_index: state.cursor,
            loaded_at: state.loaded_at,
            cache_age_secs: state.loaded_at.map(|t| (Utc::now() - t).num_seconds()),
        }
    }

    pub fn endpoints(&self) -> Vec<ProxyEntry> {
        self.lock_state().proxies.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn needs_refresh(&self, state: &PoolState, now: DateTime<Utc>) -> bool {
        let Some(refresh) = &self.refresh else { return false };
        match state.loaded_at {
            _ if state.proxies.is_empty() => true,
            Some(loaded_at) => now - loaded_at >= refresh.interval,
            None => true,
        }
    }

    /// Replace the endpoint list from the origin, keeping counters of survivors
    fn refresh_locked(&self, state: &mut PoolState, now: DateTime<Utc>) {
        let Some(refresh) = &self.refresh else { return };
        let mut fresh: Vec<ProxyEntry> = Vec::new();
        for url in refresh.origin.read() {
            if fresh.len() >= self.max_endpoints {
                break;
            }
            if fresh.iter().any(|p| p.url == url) {
                continue;
            }
            let entry = state
                .proxies
                .iter()
                .find(|p| p.url == url)
                .cloned()
                .unwrap_or_else(|| ProxyEntry::new(url));
            fresh.push(entry);
        }
        info!("Proxy pool refreshed: {} -> {} endpoints", state.proxies.len(), fresh.len());
        state.proxies = fresh;
        state.loaded_at = Some(now);
        if state.cursor >= state.proxies.len() {
            state.cursor = 0;
        }
        self.persist(state);
    }

    fn persist(&self, state: &PoolState) {
        let Some(path) = &self.cache_path else { return };
        let cache = ProxyCache {
            proxies: state.proxies.clone(),
            loaded_at: state.loaded_at,
        };
        let result = serde_json::to_vec_pretty(&cache)
            .map_err(Into::into)
            .and_then(|bytes| write_atomic(path, &bytes));
        if let Err(e) = result {
            warn!("Failed to save proxy cache {}: {}", path.display(), e);
        }
    }
}

impl ProxySource for ProxyPool {
    fn next_proxy(&self) -> Option<String> {
        let mut state = self.lock_state();
        let now = Utc::now();
        if self.needs_refresh(&state, now) {
            self.refresh_locked(&mut state, now);
        }
        if state.proxies.is_empty() {
            warn!("No proxies available, connecting directly");
            return None;
        }
        if state.cursor >= state.proxies.len() {
            state.cursor = 0;
        }
        let url = state.proxies[state.cursor].url.clone();
        state.cursor = (state.cursor + 1) % state.proxies.len();
        debug!("Using proxy {}/{}: {}", state.cursor, state.proxies.len(), url);
        Some(url)
    }

    fn report_success(&self, proxy: &str) {
        let mut state = self.lock_state();
        if let Some(entry) = state.proxies.iter_mut().find(|p| p.url == proxy) {
            entry.success_count += 1;
            entry.fail_count = 0;
        }
        self.persist(&state);
    }

    fn report_failure(&self, proxy: &str) {
        let mut state = self.lock_state();
        if let Some(pos) = state.proxies.iter().position(|p| p.url == proxy) {
            state.proxies[pos].fail_count += 1;
            if state.proxies[pos].fail_count >= MAX_CONSECUTIVE_FAILURES {
                warn!("Removing failed proxy: {}", proxy);
                state.proxies.remove(pos);
                if pos < state.cursor {
                    state.cursor -= 1;
                }
                if state.cursor >= state.proxies.len() {
                    state.cursor = 0;
                }
            }
        }
        self.persist(&state);
    }
}

fn read_cache(path: &Path) -> Option<ProxyCache> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("Ignoring unreadable proxy cache {}: {}", path.display(), e);
            None
        }
    }
}

/// Endpoints from a list file: one per line, `#` comments and blanks skipped
pub fn read_proxy_list(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(e) => {
            warn!("Cannot read proxy list {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Pick the proxy strategy the configuration asks for
pub fn proxy_source_from_config(cfg: &ConverterConfig) -> Box<dyn ProxySource> {
    if !cfg.proxy_rotation {
        return match &cfg.proxy_url {
            Some(url) => Box::new(FixedProxy(url.clone())),
            None => Box::new(NoProxy),
        };
    }
    let origin = EndpointOrigin {
        fixed: cfg.proxy_url.iter().cloned().collect(),
        list_file: cfg.proxy_list_file.clone(),
    };
    let interval = chrono::Duration::seconds(cfg.proxy_refresh_secs as i64);
    Box::new(
        ProxyPool::load(origin.read(), cfg.proxy_cache_file())
            .with_max_endpoints(cfg.max_proxy_cache)
            .with_refresh(origin, interval),
    )
}
