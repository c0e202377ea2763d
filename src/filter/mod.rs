//! Blocked-hostname filter: an approximate-membership set fed from remote
//! newline-delimited blocklists. False positives are possible and show up as
//! spurious blocks; entries inserted since the last reset are never missed.

use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bloom::{BloomFilter, ASMS};
use tracing::{info, warn};

/// Built-in blocklist source.
pub const DEFAULT_SOURCES: &[&str] = &["https://zerodot1.gitlab.io/CoinBlockerLists/list.txt"];

const FILTER_CAPACITY: u32 = 1_000_000;
const FILTER_FP_RATE: f32 = 0.01;
const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

pub struct DomainFilter {
    inner: RwLock<BloomFilter>,
    sources: Mutex<Vec<String>>,
    /// Serializes whole-filter reloads; reads never wait on the network
    /// because the replacement filter is staged outside `inner`'s lock.
    reload: tokio::sync::Mutex<()>,
    http: reqwest::Client,
}

impl DomainFilter {
    pub fn new(sources: Vec<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            inner: RwLock::new(BloomFilter::with_rate(FILTER_FP_RATE, FILTER_CAPACITY)),
            sources: Mutex::new(sources),
            reload: tokio::sync::Mutex::new(()),
            http,
        }
    }

    pub fn with_default_sources() -> Self {
        Self::new(DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect())
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.read().contains(&domain)
    }

    pub fn insert(&self, domain: &str) {
        self.write().insert(&domain);
    }

    /// Drop every entry. Membership answers start over from empty.
    pub fn reset(&self) {
        self.write().clear();
    }

    /// Fetch each URL and insert every non-empty line into the live filter.
    /// Failed sources are logged and skipped; whatever loaded stays loaded.
    /// The URLs are appended to the configured source list for later
    /// upgrades.
    pub async fn add_sources(&self, urls: &[String]) {
        for url in urls {
            match self.fetch_lines(url).await {
                Ok(lines) => {
                    let mut filter = self.write();
                    for line in &lines {
                        filter.insert(&line.as_str());
                    }
                    info!(url = url.as_str(), entries = lines.len(), "blocklist source loaded");
                }
                Err(e) => warn!(url = url.as_str(), error = %e, "blocklist fetch failed"),
            }
        }

        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        for url in urls {
            if !sources.contains(url) {
                sources.push(url.clone());
            }
        }
    }

    /// Rebuild from the configured sources: reset plus re-add, atomic from
    /// the reader's point of view. The fresh filter is filled off-lock and
    /// swapped in at the end.
    pub async fn upgrade(&self) {
        let _guard = self.reload.lock().await;
        let sources: Vec<String> = self
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut fresh = BloomFilter::with_rate(FILTER_FP_RATE, FILTER_CAPACITY);
        for url in &sources {
            match self.fetch_lines(url).await {
                Ok(lines) => {
                    for line in &lines {
                        fresh.insert(&line.as_str());
                    }
                    info!(url = url.as_str(), entries = lines.len(), "blocklist source reloaded");
                }
                Err(e) => warn!(url = url.as_str(), error = %e, "blocklist fetch failed"),
            }
        }

        *self.write() = fresh;
    }

    async fn fetch_lines(&self, url: &str) -> anyhow::Result<Vec<String>> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {} for {}", resp.status(), url);
        }
        let body = resp.text().await?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn read(&self) -> RwLockReadGuard<'_, BloomFilter> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BloomFilter> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
