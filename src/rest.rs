//! Rate-limited HTTP transport for the companion REST API.
//!
//! A request only ever waits for quota; it is never dropped by the client.
//! It either succeeds or fails with the server's own error.

use crate::bucket::MAX_RATE_LIMIT_WAIT;
use crate::config::RestConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::ratelimit::{duration_from_secs, RateLimitHeaders, RateLimiter, Route};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A successful response
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RestResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Body of a 429 response
#[derive(Debug, Default, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// Body of any other error response
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

/// Result of the plain gateway metadata endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

/// Identify budget reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    /// Shards allowed to identify concurrently
    pub max_concurrency: u32,
}

/// Result of the authenticated gateway metadata endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// HTTP client that respects the global and per-route quotas.
#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    config: RestConfig,
    limiter: Arc<RateLimiter>,
}

impl RestClient {
    /// Create a client with its own metrics
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    /// Create a client that records into shared metrics
    pub fn with_metrics(config: RestConfig, metrics: Arc<Metrics>) -> Result<Self, Error> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        let limiter = Arc::new(RateLimiter::new(
            config.global_limit,
            config.global_window,
            metrics,
        ));

        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    /// Rate-limit state shared by every request from this client
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Issue a request, waiting for quota and retrying after 429 responses.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<RestResponse, Error> {
        let route = Route::new(&method, path);
        let url = self.url(path);

        loop {
            self.limiter.acquire(&route).await;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(
                    http::header::AUTHORIZATION,
                    format!("{} {}", self.config.auth_scheme, self.config.token),
                );
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.bytes().await?.to_vec();
            let rate_limit = RateLimitHeaders::parse(&headers);

            if status == StatusCode::TOO_MANY_REQUESTS {
                let parsed: RateLimitedBody = serde_json::from_slice(&bytes).unwrap_or_default();
                let retry_after = retry_delay(rate_limit.as_ref(), &parsed);
                let global = parsed.global || rate_limit.as_ref().is_some_and(RateLimitHeaders::is_global);

                self.limiter
                    .block(&route, rate_limit.as_ref(), global, retry_after)
                    .await;
                debug!(
                    "{} rate limited ({}), retrying in {:?}",
                    route.key,
                    if global { "global" } else { "route" },
                    retry_after
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if let Some(rate_limit) = &rate_limit {
                self.limiter.update(&route, rate_limit).await;
            }

            if !status.is_success() {
                let parsed: ApiErrorBody = serde_json::from_slice(&bytes).unwrap_or_default();
                let message = parsed.message.unwrap_or_else(|| {
                    status.canonical_reason().unwrap_or("unknown error").to_string()
                });
                warn!("{} failed with {}: {}", route.key, status, message);
                return Err(Error::Api {
                    status: status.as_u16(),
                    code: parsed.code,
                    message,
                });
            }

            return Ok(RestResponse {
                status,
                headers,
                body: bytes,
            });
        }
    }

    /// Issue a request and decode the JSON response
    pub async fn request<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> Result<T, Error> {
        self.send(method, path, body).await?.json()
    }

    /// Fetch the gateway endpoint
    pub async fn gateway(&self) -> Result<GatewayInfo, Error> {
        self.request(Method::GET, "/gateway", None).await
    }

    /// Fetch the gateway endpoint, recommended shard count and identify budget
    pub async fn gateway_bot(&self) -> Result<GatewayBotInfo, Error> {
        self.request(Method::GET, "/gateway/bot", None).await
    }
}

/// Wait before retrying a 429: the Retry-After header, then the body, then one second.
fn retry_delay(headers: Option<&RateLimitHeaders>, body: &RateLimitedBody) -> Duration {
    headers
        .and_then(|h| h.retry_after)
        .or_else(|| body.retry_after.and_then(duration_from_secs))
        .unwrap_or(Duration::from_secs(1))
        .min(MAX_RATE_LIMIT_WAIT)
}
