//! Transport and persistence for gradfeed: polite HTTP fetching, the raw page
//! archive, and the relational applicant store.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use gradfeed_core::RawPage;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod applicants;

pub use applicants::{
    ApplicantStore, MemoryApplicantStore, PgApplicantStore, StoreError, StoreSummary,
    UpsertCounts,
};

pub const CRATE_NAME: &str = "gradfeed-storage";

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw listing pages, laid out as
/// `<root>/<fetch stamp>/page-<n>/<sha256>.html`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        page: u32,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(format!("page-{page}"))
            .join(format!("{content_hash}.html"))
    }

    /// Writes the page markup through a temp file + rename so a crash never
    /// leaves a truncated file at the final path.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        page: &RawPage,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = page.markup.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, page.page, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .with_context(|| format!("archive path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp page file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp page {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Listing pages are worth another try only when the site is overloaded or
/// throttling us; anything else in the 4xx range will not change on retry.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Transport failures that a later attempt can plausibly get past.
pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Doubling delay between attempts on the same page, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means a single try.
    pub retries: u32,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.delay_cap)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Minimum spacing between listing requests; `None` disables pacing.
    pub request_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            request_interval: Some(Duration::from_millis(500)),
        }
    }
}

/// Single-token bucket that spaces requests at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Shared client for listing pages and the enrichment service.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to listing site failed")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
}

/// What to do with one attempt's result.
enum Attempt {
    Done(FetchedResponse),
    Retry(FetchError),
    GiveUp(FetchError),
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let HttpClientConfig {
            timeout,
            user_agent,
            retry,
            request_interval,
        } = config;
        let builder = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true);
        let builder = match user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };
        Ok(Self {
            client: builder.build().context("building http client")?,
            pacer: request_interval.map(RequestPacer::new),
            retry,
        })
    }

    /// GETs `url` as text, retrying transient failures with exponential backoff.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }

        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            match self.attempt(url).await {
                Attempt::Done(response) => return Ok(response),
                Attempt::GiveUp(err) => return Err(err),
                Attempt::Retry(err) if retry >= self.retry.retries => return Err(err),
                Attempt::Retry(err) => {
                    let delay = self.retry.delay_before_retry(retry);
                    debug!(error = %err, retry, delay_ms = delay.as_millis() as u64, "retrying page");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) if is_retryable_error(&err) => return Attempt::Retry(err.into()),
            Err(err) => return Attempt::GiveUp(err.into()),
        };
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return if is_retryable_status(status) {
                Attempt::Retry(err)
            } else {
                Attempt::GiveUp(err)
            };
        }
        match resp.text().await {
            Ok(body) => Attempt::Done(FetchedResponse {
                status,
                final_url,
                body,
            }),
            Err(err) => Attempt::Retry(err.into()),
        }
    }

    /// POSTs a JSON body once and decodes a JSON reply. No retries: callers
    /// treat any failure as the service being unavailable.
    pub async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, FetchError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}
