//! Process-scoped cache of probe results.
//!
//! Nothing is cached unless a [`ProbeRegistry`] is built and handed to a
//! [`super::ClientProvider`]. The owner decides its lifetime; [`ProbeRegistry::clear`]
//! tears the cached state down explicitly.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use url::Url;

use super::config::{ProxyEndpoint, ProxyProtocol};
use super::probe::ProbeResult;

/// Normalized `(base_url, proxy)` identity used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    base_url: String,
    protocol: ProxyProtocol,
    host: String,
    port: u16,
    /// Digest of username and password; the password itself is never stored.
    credentials: Option<u64>,
}

impl ProbeKey {
    /// Builds a key; hosts compare case-insensitively, credentials in full.
    pub fn new(base_url: &Url, endpoint: &ProxyEndpoint) -> Self {
        Self {
            base_url: base_url.as_str().to_string(),
            protocol: endpoint.protocol,
            host: endpoint.host.to_ascii_lowercase(),
            port: endpoint.port,
            credentials: endpoint.auth.as_ref().map(|auth| {
                let mut hasher = DefaultHasher::new();
                auth.hash(&mut hasher);
                hasher.finish()
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedProbe {
    result: ProbeResult,
    recorded_at: Instant,
}

/// TTL-bounded store of probe outcomes shared by concurrent calls.
#[derive(Debug)]
pub struct ProbeRegistry {
    ttl: Duration,
    entries: DashMap<ProbeKey, CachedProbe>,
}

impl ProbeRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a fresh result for `key`, evicting it if the TTL has passed.
    pub fn lookup(&self, key: &ProbeKey) -> Option<ProbeResult> {
        let cached = *self.entries.get(key)?;
        if cached.recorded_at.elapsed() < self.ttl {
            tracing::debug!(
                host = %key.host,
                port = key.port,
                result = cached.result.as_str(),
                "cached probe result reused"
            );
            return Some(cached.result);
        }
        self.entries
            .remove_if(key, |_, entry| entry.recorded_at == cached.recorded_at);
        tracing::debug!(host = %key.host, port = key.port, "cached probe result expired");
        None
    }

    pub fn record(&self, key: ProbeKey, result: ProbeResult) {
        self.entries.insert(
            key,
            CachedProbe {
                result,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Drops every cached result.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
