//! HTTP Embedder Client
//!
//! Talks to an external embedding service. Transient failures (timeout, 5xx)
//! retry with exponential backoff and jitter; repeated primary failure falls
//! back to a secondary endpoint; exhausting both yields
//! `ErrorKind::Degraded`. A token bucket rate-limits outbound requests by
//! suspending callers rather than erroring.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::EmbedderConfig;
use crate::embed::{Embedder, Embedding, EMBEDDING_DIMENSIONS, MAX_BATCH, MAX_TEXT_LENGTH};
use crate::error::{lock_poisoned, Error, Result};

/// Backoff base delay
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Backoff multiplier per attempt
const BACKOFF_FACTOR: u32 = 2;

/// Maximum attempts per endpoint
const MAX_ATTEMPTS: u32 = 5;

/// Jitter applied to each backoff delay (fraction of the delay)
const JITTER: f64 = 0.10;

// ============================================================================
// TOKEN BUCKET
// ============================================================================

/// Token-bucket rate limiter
///
/// Refills continuously at `rate` tokens per second up to a burst of one
/// second's worth. `acquire` suspends until a token is available, applying
/// backpressure instead of erroring on overflow.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// Bucket refilling at `rate_per_sec`, bursting to one second of tokens
    pub fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
            rate,
            burst: rate,
        }
    }

    /// Take one token, suspending until one is available
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().map_err(lock_poisoned)?;
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.refilled_at = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };
            match wait {
                None => return Ok(()),
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Tokens currently available (test hook)
    pub fn available(&self) -> f64 {
        let state = self.state.lock().expect("bucket lock");
        let elapsed = Instant::now().duration_since(state.refilled_at).as_secs_f64();
        (state.tokens + elapsed * self.rate).min(self.burst)
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(serde::Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

// ============================================================================
// HTTP EMBEDDER
// ============================================================================

/// Production embedder backed by an HTTP service
pub struct HttpEmbedder {
    http: reqwest::Client,
    endpoint: String,
    fallback_endpoint: Option<String>,
    bucket: TokenBucket,
    timeout: Duration,
}

impl HttpEmbedder {
    /// Build from configuration
    pub fn new(config: &EmbedderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            fallback_endpoint: config.fallback_endpoint.clone(),
            bucket: TokenBucket::new(config.rate_limit_rps),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// One attempt against one endpoint
    async fn attempt(&self, endpoint: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        let response = self
            .http
            .post(endpoint)
            .json(&EmbedRequest { texts })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::degraded(format!("embedder request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::degraded(format!("embedder returned {status}")));
        }
        if !status.is_success() {
            // 4xx is not transient; report it as-is without retrying
            return Err(Error::validation(format!("embedder rejected batch: {status}")));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::degraded(format!("embedder response decode: {e}")))?;

        if body.embeddings.len() != texts.len() {
            return Err(Error::degraded(format!(
                "embedder returned {} vectors for {} texts",
                body.embeddings.len(),
                texts.len()
            )));
        }
        for vector in &body.embeddings {
            if vector.len() != EMBEDDING_DIMENSIONS {
                return Err(Error::degraded(format!(
                    "embedder returned {}-dim vector, expected {}",
                    vector.len(),
                    EMBEDDING_DIMENSIONS
                )));
            }
        }

        Ok(body.embeddings.into_iter().map(Embedding::new).collect())
    }

    /// Retry one endpoint with exponential backoff and jitter
    async fn attempt_with_retries(&self, endpoint: &str, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut delay = BACKOFF_BASE;
        let mut last_err = Error::degraded("embedder unavailable");

        for attempt in 0..MAX_ATTEMPTS {
            self.bucket.acquire().await?;
            match self.attempt(endpoint, texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.kind == crate::error::ErrorKind::Degraded => {
                    tracing::debug!(
                        endpoint,
                        attempt,
                        error = %e,
                        "embedder attempt failed, backing off"
                    );
                    last_err = e;
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(jittered(delay)).await;
                        delay *= BACKOFF_FACTOR;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

/// Apply ±10% jitter to a delay
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..1.0 + JITTER);
    delay.mul_f64(factor)
}

/// Truncate oversized texts before submission
fn truncate_batch(texts: &[String]) -> Vec<String> {
    texts
        .iter()
        .map(|t| {
            if t.len() > MAX_TEXT_LENGTH {
                let mut end = MAX_TEXT_LENGTH;
                while !t.is_char_boundary(end) {
                    end -= 1;
                }
                t[..end].to_string()
            } else {
                t.clone()
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.len() > MAX_BATCH {
            return Err(Error::validation(format!(
                "batch of {} exceeds maximum of {MAX_BATCH}",
                texts.len()
            )));
        }
        let texts = truncate_batch(texts);

        match self.attempt_with_retries(&self.endpoint, &texts).await {
            Ok(vectors) => Ok(vectors),
            Err(primary_err) if primary_err.kind == crate::error::ErrorKind::Degraded => {
                let Some(fallback) = &self.fallback_endpoint else {
                    return Err(primary_err);
                };
                tracing::warn!(
                    error = %primary_err,
                    "primary embedder exhausted, trying fallback"
                );
                self.attempt_with_retries(fallback, &texts).await
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
