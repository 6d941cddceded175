//! Persistence and network plumbing for starwatch: the rating history store, a
//! content-addressed archive for raw snapshots, and a retrying HTTP fetcher built on a
//! shared backoff policy.

pub mod history;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use history::{HistoryLock, HistoryStore, MergeCounts, MergeReport, PersistenceError};

pub const CRATE_NAME: &str = "starwatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Archive of raw snapshot bodies, addressed by publication date, source, and content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        published_on: NaiveDate,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(published_on.format("%Y-%m-%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write bytes once; a second store of identical content is reported as deduplicated.
    pub async fn store_bytes(
        &self,
        published_on: NaiveDate,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(published_on, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let artifact = |deduplicated: bool| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

/// 429 and 5xx are worth retrying; every other status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Overall run deadline. Retry loops consult it before every new attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// True if waiting `wait` would still leave time before the deadline.
    pub fn allows(&self, wait: Duration) -> bool {
        self.0.map_or(true, |at| Instant::now() + wait < at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    Exhausted,
    NonRetryable,
    DeadlineExceeded,
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub give_up: GiveUp,
    pub last_error: Option<E>,
}

impl<E: fmt::Display> RetryFailure<E> {
    pub fn reason(&self) -> String {
        let last = self
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no attempt made".to_string());
        match self.give_up {
            GiveUp::Exhausted => format!("gave up after {} attempt(s): {last}", self.attempts),
            GiveUp::NonRetryable => last,
            GiveUp::DeadlineExceeded => {
                format!("deadline exceeded after {} attempt(s): {last}", self.attempts)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Exponential backoff with jitter and a bounded attempt count, shared by snapshot
/// fetching and notification delivery.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added at random, 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        delay + delay.mul_f64(jitter * rand::random::<f64>())
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out of attempts,
    /// or the deadline leaves no room for another backoff. `op` receives the 1-based attempt.
    pub async fn retry<T, E, F, Fut>(
        &self,
        deadline: Deadline,
        mut op: F,
    ) -> Result<Retried<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut last_error: Option<E> = None;

        loop {
            if deadline.expired() {
                return Err(RetryFailure {
                    attempts,
                    give_up: GiveUp::DeadlineExceeded,
                    last_error,
                });
            }

            attempts += 1;
            let err = match op(attempts).await {
                Ok(value) => return Ok(Retried { value, attempts }),
                Err(err) => err,
            };

            if err.disposition() == RetryDisposition::NonRetryable {
                return Err(RetryFailure {
                    attempts,
                    give_up: GiveUp::NonRetryable,
                    last_error: Some(err),
                });
            }
            if attempts >= max_attempts {
                return Err(RetryFailure {
                    attempts,
                    give_up: GiveUp::Exhausted,
                    last_error: Some(err),
                });
            }

            let delay = self.jittered_delay(attempts - 1);
            if !deadline.allows(delay) {
                return Err(RetryFailure {
                    attempts,
                    give_up: GiveUp::DeadlineExceeded,
                    last_error: Some(err),
                });
            }
            warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed; backing off"
            );
            last_error = Some(err);
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-call timeout, independent of the retry budget.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure fetching {url} after {attempts} attempt(s): {reason}")]
    Transient {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("permanent failure fetching {url}: {reason}")]
    Permanent {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("deadline exceeded fetching {url} after {attempts} attempt(s)")]
    DeadlineExceeded { url: String, attempts: u32 },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transient { attempts, .. }
            | Self::Permanent { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    fn from_retry(url: &str, failure: RetryFailure<AttemptError>) -> Self {
        let reason = failure
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match failure.give_up {
            GiveUp::Exhausted => Self::Transient {
                url: url.to_string(),
                attempts: failure.attempts,
                reason,
            },
            GiveUp::NonRetryable => Self::Permanent {
                url: url.to_string(),
                attempts: failure.attempts,
                reason,
            },
            GiveUp::DeadlineExceeded => Self::DeadlineExceeded {
                url: url.to_string(),
                attempts: failure.attempts,
            },
        }
    }
}

/// One failed HTTP attempt, classified for the retry loop.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct AttemptError {
    pub disposition: RetryDisposition,
    pub reason: String,
}

impl Retryable for AttemptError {
    fn disposition(&self) -> RetryDisposition {
        self.disposition
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url`, retrying transient failures under the configured backoff policy.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        deadline: Deadline,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Permanent {
                url: url.to_string(),
                attempts: 0,
                reason: "fetcher is shut down".to_string(),
            })?;

        self.backoff
            .retry(deadline, |_attempt| self.attempt(url))
            .instrument(info_span!("http_fetch", url))
            .await
            .map(|retried| FetchedResponse {
                attempts: retried.attempts,
                ..retried.value
            })
            .map_err(|failure| FetchError::from_retry(url, failure))
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, AttemptError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AttemptError {
                disposition: classify_reqwest_error(&err),
                reason: err.to_string(),
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(AttemptError {
                disposition: classify_status(status),
                reason: format!("http status {} for {final_url}", status.as_u16()),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await.map_err(|err| AttemptError {
            disposition: RetryDisposition::Retryable,
            reason: format!("reading body from {final_url}: {err}"),
        })?;

        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body: body.to_vec(),
            attempts: 1,
        })
    }
}
