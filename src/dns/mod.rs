//! Cached hostname resolution with blocklist consultation.
//!
//! Entries never expire during the process lifetime (until `reset`); blocks
//! are cached, lookup failures and private-address rejections are not, so a
//! transient failure cannot poison the cache.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::common::{Error, IpPolicy, Result};
use crate::filter::DomainFilter;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The hostname is on the blocklist.
    Blocked,
    Ip(Ipv4Addr),
}

pub struct Resolver {
    filter: Arc<DomainFilter>,
    policy: Arc<IpPolicy>,
    dns: TokioAsyncResolver,
    cache: RwLock<HashMap<String, Lookup>>,
    /// One in-flight upstream query per hostname; followers wait and re-read.
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Resolver {
    pub fn new(filter: Arc<DomainFilter>, policy: Arc<IpPolicy>) -> Self {
        let dns = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            filter,
            policy,
            dns,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, domain: &str) -> Result<Lookup> {
        if let Some(hit) = self.cache.read().await.get(domain) {
            return Ok(*hit);
        }

        if self.filter.contains(domain) {
            debug!(domain, "blocked by filter");
            self.cache
                .write()
                .await
                .insert(domain.to_string(), Lookup::Blocked);
            return Ok(Lookup::Blocked);
        }

        let (notify, leader) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(domain) {
                Some(n) => (n.clone(), false),
                None => {
                    let n = Arc::new(Notify::new());
                    inflight.insert(domain.to_string(), n.clone());
                    (n, true)
                }
            }
        };

        if !leader {
            notify.notified().await;
            if let Some(hit) = self.cache.read().await.get(domain) {
                return Ok(*hit);
            }
            // The leader failed; failures are not cached, query directly.
            return self.lookup_uncached(domain).await;
        }

        let result = self.lookup_uncached(domain).await;
        if let Ok(lookup) = &result {
            self.cache.write().await.insert(domain.to_string(), *lookup);
        }
        self.inflight.lock().await.remove(domain);
        notify.notify_waiters();
        result
    }

    async fn lookup_uncached(&self, domain: &str) -> Result<Lookup> {
        let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, self.dns.ipv4_lookup(domain))
            .await
            .map_err(|_| Error::ResolveFailed("cannot find a host".into()))?
            .map_err(|_| Error::ResolveFailed("cannot find a host".into()))?;

        let records: Vec<Ipv4Addr> = lookup.iter().map(|a| a.0).collect();
        let Some(ip) = records.choose(&mut rand::thread_rng()).copied() else {
            return Err(Error::ResolveFailed("cannot find a host".into()));
        };

        if self.policy.is_rejected(IpAddr::V4(ip)) {
            return Err(Error::ResolveFailed("private addr".into()));
        }

        debug!(domain, ip = %ip, candidates = records.len(), "resolved");
        Ok(Lookup::Ip(ip))
    }

    /// Drop every cached entry.
    pub async fn reset(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_resolver() -> (Resolver, Arc<DomainFilter>) {
        let filter = Arc::new(DomainFilter::new(Vec::new()));
        let policy = Arc::new(IpPolicy::new());
        (Resolver::new(filter.clone(), policy), filter)
    }

    #[tokio::test]
    async fn blocked_domain_is_cached() {
        let (resolver, filter) = make_resolver();
        filter.insert("ads.example");

        assert_eq!(resolver.resolve("ads.example").await.unwrap(), Lookup::Blocked);

        // The verdict sticks even after the filter forgets the domain.
        filter.reset();
        assert_eq!(resolver.resolve("ads.example").await.unwrap(), Lookup::Blocked);
    }

    #[tokio::test]
    async fn reset_clears_cached_verdicts() {
        let (resolver, filter) = make_resolver();
        filter.insert("ads.example");
        assert_eq!(resolver.resolve("ads.example").await.unwrap(), Lookup::Blocked);

        resolver.reset().await;
        filter.reset();

        // No cache, no filter hit: the query now goes upstream and fails
        // against the reserved .invalid TLD.
        let result = resolver.resolve("ads.example.invalid").await;
        assert!(matches!(result, Err(Error::ResolveFailed(_))));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (resolver, filter) = make_resolver();

        let first = resolver.resolve("no-such-host.invalid").await;
        assert!(first.is_err());
        assert!(resolver.cache.read().await.is_empty());

        // A later filter insert takes effect because no failure was cached.
        filter.insert("no-such-host.invalid");
        assert_eq!(
            resolver.resolve("no-such-host.invalid").await.unwrap(),
            Lookup::Blocked
        );
    }
}
