//! MTA-STS (Strict Transport Security) Module
//!
//! Implements RFC 8461 - SMTP MTA Strict Transport Security: policy
//! discovery over DNS, policy retrieval over HTTPS, and a persistent
//! per-domain policy cache with a background refresh loop.
//!
//! "Report" mode is not supported.

mod cache;
mod fetch;
mod metrics;
mod policy;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::PolicyCache;
pub use fetch::{DnsTxtLookup, StsFetcher, TxtLookup};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use policy::{domain_to_ascii, Mode, Policy};

use thiserror::Error;

/// Errors from policy validation, fetching, and the cache.
///
/// The fetch pipeline and the cache need callers to be able to tell these
/// apart: a missing TXT record is the quiet "domain does not do MTA-STS"
/// path, an expired cache entry triggers a refetch, and everything else is
/// a real failure.
#[derive(Debug, Error)]
pub enum StsError {
    #[error("unknown policy version")]
    UnknownVersion,

    #[error("invalid max_age")]
    InvalidMaxAge,

    #[error("invalid mode")]
    InvalidMode,

    #[error("invalid mx")]
    InvalidMx,

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("MTA-STS TXT record missing")]
    NoStsRecord,

    #[error("DNS lookup failed: {0}")]
    Dns(String),

    #[error("redirects not allowed in MTA-STS")]
    RedirectNotAllowed,

    #[error("invalid HTTP media type")]
    InvalidMediaType,

    #[error("HTTP response status code: {0}")]
    HttpStatus(u16),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cache entry expired")]
    Expired,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode policy: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to decode policy: {0}")]
    Deserialize(#[source] serde_json::Error),
}
