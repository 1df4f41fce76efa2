//! MTA-STS policy discovery and retrieval
//!
//! Discovery is a TXT lookup at `_mta-sts.<domain>`; retrieval is a
//! strict HTTPS GET of `https://mta-sts.<domain>/.well-known/mta-sts.txt`
//! (RFC 8461 sections 3.2 and 3.3).

use super::policy::{domain_to_ascii, Policy};
use super::StsError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// Read the response body up to this many bytes; policies are far smaller,
/// and the cap prevents abuse or accidents with very large replies.
const MAX_POLICY_SIZE: usize = 10 * 1024;

/// TXT record lookup, as a trait so tests can substitute the resolver.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// Return the TXT values at `name`. A name with no TXT records is an
    /// empty result, not an error; errors are transport-level failures.
    async fn txt(&self, name: &str) -> Result<Vec<String>, StsError>;
}

/// The production TXT lookup, backed by trust-dns.
pub struct DnsTxtLookup {
    resolver: TokioAsyncResolver,
}

impl DnsTxtLookup {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for DnsTxtLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtLookup for DnsTxtLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, StsError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d))
                        .collect::<String>()
                })
                .collect()),
            Err(e) => {
                if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Ok(Vec::new())
                } else {
                    Err(StsError::Dns(e.to_string()))
                }
            }
        }
    }
}

/// Fetches and parses MTA-STS policies.
///
/// Two testing seams: the TXT lookup can be replaced, and the policy URL
/// base can be overridden (`<base>/<domain>`) so end-to-end tests can run
/// against a local HTTP server.
pub struct StsFetcher {
    txt_lookup: Arc<dyn TxtLookup>,
    http: reqwest::Client,
    base_url: Option<String>,
}

impl StsFetcher {
    pub fn new() -> Self {
        // We MUST NOT follow redirects, see RFC 8461 section 3.3.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to create HTTP client");

        Self {
            txt_lookup: Arc::new(DnsTxtLookup::new()),
            http,
            base_url: None,
        }
    }

    /// Replace the TXT lookup implementation
    pub fn with_txt_lookup(mut self, txt_lookup: Arc<dyn TxtLookup>) -> Self {
        self.txt_lookup = txt_lookup;
        self
    }

    /// Override the policy URL base, so the policy for `domain` is fetched
    /// from `<base>/<domain>`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Check whether there is an MTA-STS TXT record for the domain.
    ///
    /// Full parsing is skipped and the `id=` field ignored: policy ids do
    /// not drive cache invalidation here.
    pub async fn has_sts_record(&self, domain: &str) -> Result<bool, StsError> {
        let values = self.txt_lookup.txt(&format!("_mta-sts.{}", domain)).await?;
        Ok(values.iter().any(|txt| txt.starts_with("v=STSv1;")))
    }

    fn url_for_domain(&self, domain: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, domain),
            None => format!("https://mta-sts.{}/.well-known/mta-sts.txt", domain),
        }
    }

    /// Fetch and parse the policy, without checking it.
    ///
    /// Useful for debugging and troubleshooting; every production path
    /// must use [`StsFetcher::fetch`] instead.
    pub async fn unchecked_fetch(&self, domain: &str) -> Result<Policy, StsError> {
        let domain = domain_to_ascii(domain)?;

        if !self.has_sts_record(&domain).await? {
            return Err(StsError::NoStsRecord);
        }

        let url = self.url_for_domain(&domain);
        debug!(domain = %domain, url = %url, "fetching MTA-STS policy");

        let raw = self.http_get(&url).await?;
        Ok(Policy::parse(&raw))
    }

    /// Fetch a policy for the given domain.
    ///
    /// This performs network lookups and an HTTPS GET, so it can be slow;
    /// callers impose deadlines by timing out the future. The returned
    /// policy has passed `Policy::check`.
    pub async fn fetch(&self, domain: &str) -> Result<Policy, StsError> {
        let p = self.unchecked_fetch(domain).await?;
        p.check()?;
        Ok(p)
    }

    async fn http_get(&self, url: &str) -> Result<Vec<u8>, StsError> {
        let resp = self.http.get(url).send().await?;

        let status = resp.status();
        if status.is_redirection() {
            return Err(StsError::RedirectNotAllowed);
        }
        if status != reqwest::StatusCode::OK {
            return Err(StsError::HttpStatus(status.as_u16()));
        }

        // The media type must be "text/plain" (parameters ignored), to
        // guard against webservers that let untrusted users host non-text
        // content at a user-chosen path. RFC 8461 section 3.2.
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let media_type: mime::Mime = content_type
            .parse()
            .map_err(|_| StsError::InvalidMediaType)?;
        if media_type.essence_str() != "text/plain" {
            return Err(StsError::InvalidMediaType);
        }

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let remaining = MAX_POLICY_SIZE - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            if body.len() == MAX_POLICY_SIZE {
                break;
            }
        }

        Ok(body)
    }
}

impl Default for StsFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{policy_fixture, FakeTxt};
    use super::*;
    use crate::sts::Mode;
    use std::time::Duration;

    fn fetcher_with(txt: FakeTxt) -> StsFetcher {
        StsFetcher::new().with_txt_lookup(Arc::new(txt))
    }

    #[tokio::test]
    async fn test_has_sts_record() {
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.example.com", vec!["v=STSv1; id=20250101"]);
        txt.insert("_mta-sts.other.com", vec!["not an sts record"]);
        txt.insert("_mta-sts.almost.com", vec!["v=STSv2; id=1"]);

        let fetcher = fetcher_with(txt);
        assert!(fetcher.has_sts_record("example.com").await.unwrap());
        assert!(!fetcher.has_sts_record("other.com").await.unwrap());
        assert!(!fetcher.has_sts_record("almost.com").await.unwrap());
        // Absent name: empty answer, not an error.
        assert!(!fetcher.has_sts_record("nothing.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_has_sts_record_dns_error() {
        let txt = FakeTxt::new();
        txt.fail("_mta-sts.broken.com");

        let fetcher = fetcher_with(txt);
        assert!(matches!(
            fetcher.has_sts_record("broken.com").await,
            Err(StsError::Dns(_))
        ));
    }

    #[test]
    fn test_url_for_domain() {
        let fetcher = StsFetcher::new();
        assert_eq!(
            fetcher.url_for_domain("example.com"),
            "https://mta-sts.example.com/.well-known/mta-sts.txt"
        );

        let fetcher = fetcher.with_base_url("http://127.0.0.1:9999");
        assert_eq!(
            fetcher.url_for_domain("example.com"),
            "http://127.0.0.1:9999/example.com"
        );
    }

    #[tokio::test]
    async fn test_fetch_happy_path() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.ok.example", vec!["v=STSv1; id=abc"]);

        let fetcher = fetcher_with(txt).with_base_url(base);
        let p = fetcher.fetch("ok.example").await.unwrap();

        assert_eq!(p.version, "STSv1");
        assert_eq!(p.mode, Mode::Enforce);
        assert_eq!(p.mxs, vec!["mail.ok.example"]);
        assert_eq!(p.max_age, Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn test_fetch_no_txt_record() {
        let base = policy_fixture().await;
        let fetcher = fetcher_with(FakeTxt::new()).with_base_url(base);

        assert!(matches!(
            fetcher.fetch("ok.example").await,
            Err(StsError::NoStsRecord)
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_redirect() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.redirect.example", vec!["v=STSv1; id=abc"]);

        let fetcher = fetcher_with(txt).with_base_url(base);
        assert!(matches!(
            fetcher.fetch("redirect.example").await,
            Err(StsError::RedirectNotAllowed)
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_html() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.html.example", vec!["v=STSv1; id=abc"]);

        let fetcher = fetcher_with(txt).with_base_url(base);
        assert!(matches!(
            fetcher.fetch("html.example").await,
            Err(StsError::InvalidMediaType)
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_404() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.missing.example", vec!["v=STSv1; id=abc"]);

        let fetcher = fetcher_with(txt).with_base_url(base);
        assert!(matches!(
            fetcher.fetch("missing.example").await,
            Err(StsError::HttpStatus(404))
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_policy() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.invalid.example", vec!["v=STSv1; id=abc"]);

        let fetcher = fetcher_with(txt).with_base_url(base);
        assert!(matches!(
            fetcher.fetch("invalid.example").await,
            Err(StsError::InvalidMaxAge)
        ));
    }

    #[tokio::test]
    async fn test_unchecked_fetch_skips_check() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.invalid.example", vec!["v=STSv1; id=abc"]);

        let fetcher = fetcher_with(txt).with_base_url(base);
        let p = fetcher.unchecked_fetch("invalid.example").await.unwrap();
        assert_eq!(p.max_age, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_fetch_truncates_large_body() {
        let base = policy_fixture().await;
        let txt = FakeTxt::new();
        txt.insert("_mta-sts.huge.example", vec!["v=STSv1; id=abc"]);

        // The fixture serves ~20 KiB; everything past the 10 KiB cap is
        // discarded, including an "mx: evil.huge.example" line near the
        // end, and the truncated prefix still parses.
        let fetcher = fetcher_with(txt).with_base_url(base);
        let p = fetcher.fetch("huge.example").await.unwrap();
        assert_eq!(p.mxs, vec!["mail.huge.example"]);
    }
}
