//! Shared HTTP client with per-host politeness controls.
//!
//! All outbound traffic (source fetches and chat delivery) funnels through
//! one `HttpClient`: a global socket cap, a per-host concurrency cap, and
//! an optional per-host token bucket keep the process polite to public APIs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use url::Url;

use crate::error::Result;
use crate::models::HttpConfig;

/// Continuous-refill token bucket; capacity equals the per-minute rate.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(rate: u32) -> Self {
        let capacity = rate.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, sleeping until one is available.
    async fn take(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - self.tokens;
            let wait = deficit / self.refill_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// Per-host concurrency slot and rate bucket.
struct HostSlot {
    permits: Arc<Semaphore>,
    bucket: Mutex<Option<TokenBucket>>,
}

/// Shared outbound HTTP client.
pub struct HttpClient {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
    per_host: usize,
}

impl HttpClient {
    /// Build the shared client from configuration.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            global: Arc::new(Semaphore::new(config.max_sockets)),
            hosts: Mutex::new(HashMap::new()),
            per_host: config.per_host_concurrency,
        })
    }

    async fn host_slot(&self, host: &str) -> Arc<HostSlot> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    permits: Arc::new(Semaphore::new(self.per_host)),
                    bucket: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Wait out the host's rate limit, then take the concurrency permits.
    ///
    /// The rate wait holds only the host's bucket lock; socket permits are
    /// acquired afterwards, so a slow rate-limited host never starves other
    /// hosts of sockets.
    async fn admit(
        &self,
        host: &str,
        rate_per_minute: Option<u32>,
    ) -> std::result::Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), String> {
        let slot = self.host_slot(host).await;

        if let Some(rate) = rate_per_minute {
            let mut bucket = slot.bucket.lock().await;
            bucket
                .get_or_insert_with(|| TokenBucket::per_minute(rate))
                .take()
                .await;
        }

        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| "http client shut down".to_string())?;
        let per_host = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| "http client shut down".to_string())?;
        Ok((global, per_host))
    }

    /// Execute a request under the global and per-host caps.
    ///
    /// Returns the status code and full body text; transport-level failures
    /// come back as a plain description for the caller to classify.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        host: &str,
        rate_per_minute: Option<u32>,
    ) -> std::result::Result<(u16, String), String> {
        let (_global, _host) = self.admit(host, rate_per_minute).await?;

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok((status, body))
    }

    /// GET a URL, honouring the host's rate limit.
    pub async fn get(
        &self,
        url: &Url,
        rate_per_minute: Option<u32>,
    ) -> std::result::Result<(u16, String), String> {
        let host = url.host_str().unwrap_or_default().to_string();
        self.execute(self.client.get(url.clone()), &host, rate_per_minute)
            .await
    }

    /// POST a JSON body to a URL.
    pub async fn post_json(
        &self,
        url: &Url,
        body: &serde_json::Value,
    ) -> std::result::Result<(u16, String), String> {
        let host = url.host_str().unwrap_or_default().to_string();
        self.execute(self.client.post(url.clone()).json(body), &host, None)
            .await
    }
}
