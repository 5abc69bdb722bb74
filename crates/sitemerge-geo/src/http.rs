use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{GeoError, Result};

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

// ─── RateLimitedClient ────────────────────────────────────────────────────────

/// HTTP client that keeps a minimum interval between requests and retries
/// transport errors and 429 responses.
pub struct RateLimitedClient {
    client: reqwest::Client,
    min_interval: Duration,
    last_request: Arc<Mutex<Option<Instant>>>,
    max_retries: u32,
}

impl RateLimitedClient {
    pub fn new(min_interval: Duration, max_retries: u32, user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            min_interval,
            last_request: Arc::new(Mutex::new(None)),
            max_retries,
        })
    }

    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(t) = *last {
            let elapsed = t.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// GET `url` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            self.wait_for_rate_limit().await;
            let resp = self.client.get(url).query(query).send().await;
            match resp {
                Ok(r) if r.status() == 429 => {
                    let wait = retry_after_secs(&r);
                    if attempt >= self.max_retries {
                        return Err(GeoError::RateLimit(host_of(url), wait));
                    }
                    warn!(url, wait, "rate limited; backing off");
                    sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    return Err(GeoError::Api(url.to_string(), format!("HTTP {status}: {body}")));
                }
                Ok(r) => {
                    let text = r.text().await?;
                    return serde_json::from_str(&text).map_err(|e| GeoError::Parse(e.to_string()));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(GeoError::Http(e));
                    }
                    let backoff = 2u64.pow(attempt);
                    debug!(url, attempt, backoff, error = %e, "transport error; retrying");
                    sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn retry_after_secs(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn host_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string()
}
