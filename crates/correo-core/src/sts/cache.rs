//! Persistent MTA-STS policy cache
//!
//! Policies are cached by domain, one file per domain in a single
//! directory. A file's mtime is the instant its policy expires, which
//! keeps the store free of per-entry metadata. There is no in-memory
//! caching layer.

use super::fetch::StsFetcher;
use super::metrics::CacheMetrics;
use super::policy::Policy;
use super::StsError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

/// Name prefix of the files managed by the cache.
const ENTRY_PREFIX: &str = "pol:";

/// Time between background refresh passes; this is background work and
/// there is no need to poke the policy hosts very often.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Deadline for refreshing a single domain.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// A persistent, read-through cache of MTA-STS policies.
///
/// Concurrent fetches of the same domain may each go upstream; writers
/// are serialized by the atomic rename in `store` and the last one wins.
pub struct PolicyCache {
    dir: PathBuf,
    fetcher: StsFetcher,
    metrics: CacheMetrics,
}

impl PolicyCache {
    /// Create a cache backed by the given directory, creating it (mode
    /// 0770) if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StsError> {
        let dir = dir.into();

        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o770)
                .create(&dir)?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            fetcher: StsFetcher::new(),
            metrics: CacheMetrics::default(),
        })
    }

    /// Replace the policy fetcher (testing seam)
    pub fn with_fetcher(mut self, fetcher: StsFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// The cache counters.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn entry_path(&self, domain: &str) -> PathBuf {
        // Domains are normalized well before they get here; a slash would
        // escape the cache directory, so treat it as a programmer error.
        assert!(!domain.contains('/'), "domain contains slash");

        self.dir.join(format!("{}{}", ENTRY_PREFIX, domain))
    }

    async fn load(&self, domain: &str) -> Result<Policy, StsError> {
        let fname = self.entry_path(domain);

        let meta = tokio::fs::metadata(&fname).await?;
        let mtime = meta.modified()?;
        if mtime <= SystemTime::now() {
            self.metrics.expired.inc();
            return Err(StsError::Expired);
        }

        // No size cap on the read: we wrote this file ourselves.
        let data = tokio::fs::read(&fname).await.map_err(|e| {
            self.metrics.io_errors.inc();
            StsError::Io(e)
        })?;

        let p: Policy = serde_json::from_slice(&data).map_err(|e| {
            self.metrics.unmarshal_errors.inc();
            StsError::Deserialize(e)
        })?;

        // The policy was valid when we stored it; check again anyway.
        p.check().map_err(|e| {
            self.metrics.invalid.inc();
            e
        })?;

        Ok(p)
    }

    async fn store(&self, domain: &str, p: &Policy) -> Result<(), StsError> {
        let data = serde_json::to_vec(p).map_err(|e| {
            self.metrics.marshal_errors.inc();
            StsError::Serialize(e)
        })?;

        // The file's modification time is set to the instant the policy
        // expires; load checks it to detect expired entries.
        let expires = SystemTime::now() + p.max_age;
        let dir = self.dir.clone();
        let fname = self.entry_path(domain);

        let written = tokio::task::spawn_blocking(move || write_entry(&dir, &fname, &data, expires))
            .await
            .map_err(|e| StsError::Io(std::io::Error::other(e)))?;

        written.map_err(|e| {
            self.metrics.io_errors.inc();
            e
        })
    }

    /// Fetch the policy for a domain, consulting the cache first.
    ///
    /// On a miss the policy is fetched upstream and stored; a store
    /// failure is logged but does not withhold the policy from the
    /// caller. Callers impose deadlines by timing out the future.
    pub async fn fetch(&self, domain: &str) -> Result<Policy, StsError> {
        self.metrics.fetches.inc();

        match self.load(domain).await {
            Ok(p) => {
                debug!(domain = %domain, "STS cache hit");
                self.metrics.hits.inc();
                return Ok(p);
            }
            Err(e) => debug!(domain = %domain, error = %e, "STS cache miss"),
        }

        let p = match self.fetcher.fetch(domain).await {
            Ok(p) => p,
            Err(e) => {
                debug!(domain = %domain, error = %e, "failed to fetch STS policy");
                self.metrics.failed_fetch.inc();
                return Err(e);
            }
        };

        // Stored synchronously: it keeps troubleshooting simple, and at
        // this point the policy goes to the caller even if the store
        // fails.
        if let Err(e) = self.store(domain, &p).await {
            warn!(domain = %domain, error = %e, "failed to store STS policy");
        }

        Ok(p)
    }

    /// Periodically refresh the cache by re-fetching all entries.
    ///
    /// Runs until the task is cancelled; the bootstrap aborts it on
    /// shutdown.
    pub async fn periodically_refresh(&self) {
        loop {
            self.refresh().await;
            tokio::time::sleep(REFRESH_INTERVAL).await;
        }
    }

    /// One refresh pass over the whole cache directory.
    ///
    /// Every `pol:` entry is re-fetched, fresh or not; failures leave the
    /// old entry untouched. Entries are never deleted here: a stale file
    /// either gets replaced by a successful refresh, or sits there as an
    /// expired entry that `load` rejects.
    async fn refresh(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "failed to list STS cache directory");
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(dir = %self.dir.display(), error = %e, "failed to read STS cache directory");
                    break;
                }
            };

            let name = entry.file_name();
            let Some(domain) = name.to_str().and_then(|n| n.strip_prefix(ENTRY_PREFIX)) else {
                continue;
            };

            self.metrics.refreshes.inc();

            let fetched =
                tokio::time::timeout(REFRESH_TIMEOUT, self.fetcher.fetch(domain)).await;
            let p = match fetched {
                Ok(Ok(p)) => p,
                Ok(Err(e)) => {
                    debug!(domain = %domain, error = %e, "STS refresh failed");
                    self.metrics.refresh_errors.inc();
                    continue;
                }
                Err(_) => {
                    debug!(domain = %domain, "STS refresh timed out");
                    self.metrics.refresh_errors.inc();
                    continue;
                }
            };

            if let Err(e) = self.store(domain, &p).await {
                warn!(domain = %domain, error = %e, "failed to store refreshed STS policy");
            } else {
                debug!(domain = %domain, "refreshed STS policy");
            }
        }

        self.metrics.refresh_cycles.inc();
    }
}

/// Write a cache entry atomically (temp file, then rename), mode 0640,
/// with both atime and mtime set to the expiry instant.
fn write_entry(
    dir: &Path,
    fname: &Path,
    data: &[u8],
    expires: SystemTime,
) -> Result<(), StsError> {
    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o640))?;
    }

    let file = tmp.persist(fname).map_err(|e| StsError::Io(e.error))?;
    file.set_times(
        std::fs::FileTimes::new()
            .set_accessed(expires)
            .set_modified(expires),
    )?;

    Ok(())
}
