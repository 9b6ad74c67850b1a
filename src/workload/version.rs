//! Workload version identity.
//!
//! A workload tarball's version is derived from whichever upstream response
//! header identifies the resource, in priority order: `ETag`, `Last-Modified`,
//! `Content-Length`, falling back to the URL itself. The chosen string is
//! hashed (SHA-256, first 8 bytes, lowercase hex) and that digest names the
//! cache file, the container, and the manager's map key.
//!
//! Probes are `HEAD` requests. Results are cached per URL for a configured
//! TTL, and a per-URL gate collapses concurrent probes into one upstream hit.

use dashmap::DashMap;
use reqwest::header::{CONTENT_LENGTH, ETAG, LAST_MODIFIED};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// 8-byte hex digest identifying one revision of a workload tarball.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionHash(String);

impl VersionHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashes a resource identity string into a [`VersionHash`].
pub fn derive_version_hash(identity: &str) -> VersionHash {
    let digest = Sha256::digest(identity.as_bytes());
    VersionHash(hex::encode(&digest[..8]))
}

/// Picks the identity string for a probe response: first present of `ETag`,
/// `Last-Modified`, `Content-Length`, then the URL.
pub fn resource_identity(
    etag: Option<&str>,
    last_modified: Option<&str>,
    content_length: Option<&str>,
    url: &str,
) -> String {
    etag.or(last_modified)
        .or(content_length)
        .unwrap_or(url)
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("head request to {url} failed: {source}")]
    Head {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Clone)]
struct CacheEntry {
    hash: VersionHash,
    expires_at: Instant,
}

pub struct VersionProber {
    http: reqwest::Client,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl VersionProber {
    pub fn new(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            cache: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    /// Returns the current version hash for `url`, probing the upstream at
    /// most once per TTL window regardless of caller concurrency.
    pub async fn probe(&self, url: &str) -> Result<VersionHash, ProbeError> {
        if let Some(hash) = self.cached(url) {
            return Ok(hash);
        }

        let gate = self
            .gates
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A concurrent probe may have landed while we waited on the gate.
        if let Some(hash) = self.cached(url) {
            return Ok(hash);
        }

        let hash = self.probe_upstream(url).await?;
        self.cache.insert(
            url.to_string(),
            CacheEntry {
                hash: hash.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(hash)
    }

    fn cached(&self, url: &str) -> Option<VersionHash> {
        let entry = self.cache.get(url)?;
        if entry.expires_at > Instant::now() {
            Some(entry.hash.clone())
        } else {
            None
        }
    }

    async fn probe_upstream(&self, url: &str) -> Result<VersionHash, ProbeError> {
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|source| ProbeError::Head {
                url: url.to_string(),
                source,
            })?;
        let headers = response.headers();
        let header = |name| headers.get(name).and_then(|v| v.to_str().ok());
        let identity = resource_identity(
            header(ETAG),
            header(LAST_MODIFIED),
            header(CONTENT_LENGTH),
            url,
        );
        let hash = derive_version_hash(&identity);
        tracing::debug!(url, version = %hash, "probed workload version");
        Ok(hash)
    }

    #[cfg(test)]
    fn seed(&self, url: &str, hash: VersionHash, ttl: Duration) {
        self.cache.insert(
            url.to_string(),
            CacheEntry {
                hash,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_etag_over_everything() {
        let id = resource_identity(
            Some("\"v1\""),
            Some("Mon, 01 Jan 2024 00:00:00 GMT"),
            Some("123"),
            "https://example.test/echo.tar",
        );
        assert_eq!(id, "\"v1\"");
    }

    #[test]
    fn identity_falls_back_in_order() {
        assert_eq!(
            resource_identity(None, Some("yesterday"), Some("123"), "u"),
            "yesterday"
        );
        assert_eq!(resource_identity(None, None, Some("123"), "u"), "123");
        assert_eq!(
            resource_identity(None, None, None, "https://example.test/echo.tar"),
            "https://example.test/echo.tar"
        );
    }

    #[test]
    fn hash_is_eight_bytes_of_lowercase_hex() {
        let hash = derive_version_hash("\"v1\"");
        assert_eq!(hash.as_str().len(), 16);
        assert!(
            hash.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn hash_is_deterministic_and_header_sensitive() {
        assert_eq!(derive_version_hash("\"v1\""), derive_version_hash("\"v1\""));
        assert_ne!(derive_version_hash("\"v1\""), derive_version_hash("\"v2\""));
    }

    #[tokio::test]
    async fn fresh_cache_entry_skips_the_upstream() {
        // No HTTP server behind this prober: a cache hit must not touch it.
        let prober = VersionProber::new(reqwest::Client::new(), Duration::from_secs(30));
        let seeded = derive_version_hash("\"v1\"");
        prober.seed(
            "https://unreachable.invalid/echo.tar",
            seeded.clone(),
            Duration::from_secs(30),
        );
        let hash = prober
            .probe("https://unreachable.invalid/echo.tar")
            .await
            .unwrap();
        assert_eq!(hash, seeded);
    }

    #[tokio::test]
    async fn expired_cache_entry_reprobes() {
        let prober = VersionProber::new(reqwest::Client::new(), Duration::from_secs(30));
        let seeded = derive_version_hash("\"v1\"");
        prober.seed(
            "https://unreachable.invalid/echo.tar",
            seeded,
            Duration::ZERO,
        );
        // Entry is expired, so the prober must hit the (unreachable) upstream.
        let result = prober.probe("https://unreachable.invalid/echo.tar").await;
        assert!(result.is_err());
    }
}
