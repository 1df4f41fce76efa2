//! Shared fixtures for the STS tests: a fake TXT resolver and a local
//! HTTP server that stands in for the policy hosts.

use super::fetch::TxtLookup;
use super::StsError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// In-memory TXT lookup. Records lookups so tests can assert that a cache
/// hit performed no DNS I/O.
#[derive(Default)]
pub(crate) struct FakeTxt {
    records: Mutex<HashMap<String, Vec<String>>>,
    failures: Mutex<HashSet<String>>,
    calls: AtomicU64,
}

impl FakeTxt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, values: Vec<&str>) {
        self.records.lock().unwrap().insert(
            name.to_string(),
            values.into_iter().map(String::from).collect(),
        );
    }

    pub fn fail(&self, name: &str) {
        self.failures.lock().unwrap().insert(name.to_string());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TxtLookup for FakeTxt {
    async fn txt(&self, name: &str) -> Result<Vec<String>, StsError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.failures.lock().unwrap().contains(name) {
            return Err(StsError::Dns(format!("injected failure for {}", name)));
        }

        Ok(self
            .records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Spawn an HTTP server that serves policy documents at `/<domain>`, with
/// a few special domains exercising the failure paths. Returns the base
/// URL for `StsFetcher::with_base_url`.
pub(crate) async fn policy_fixture() -> String {
    use axum::extract::Path;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;

    fn plain(body: String) -> Response {
        ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }

    async fn policy(Path(domain): Path<String>) -> Response {
        match domain.as_str() {
            "redirect.example" => (
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, "https://elsewhere.example/")],
                String::new(),
            )
                .into_response(),
            "html.example" => (
                [(header::CONTENT_TYPE, "text/html")],
                "<p>version: STSv1</p>".to_string(),
            )
                .into_response(),
            "missing.example" => StatusCode::NOT_FOUND.into_response(),
            "invalid.example" => plain(
                "version: STSv1\nmode: enforce\nmx: mail.invalid.example\nmax_age: 0\n"
                    .to_string(),
            ),
            "huge.example" => {
                let mut body = String::from(
                    "version: STSv1\nmode: enforce\nmx: mail.huge.example\nmax_age: 86400\n",
                );
                while body.len() < 20 * 1024 {
                    body.push_str("padding line with no separator\n");
                }
                body.push_str("mx: evil.huge.example\n");
                plain(body)
            }
            d => plain(format!(
                "version: STSv1\nmode: enforce\nmx: mail.{}\nmax_age: 86400\n",
                d
            )),
        }
    }

    let app = Router::new().route("/:domain", get(policy));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}
