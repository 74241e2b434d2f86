//! Shared request quota state for the REST transport.
//!
//! Every request first takes a slot from the global bucket, then from the
//! bucket the server assigned to its route (once known). Route buckets are
//! learned lazily from response headers and kept for the lifetime of the
//! limiter.

use crate::bucket::{RateLimitBucket, GLOBAL_BUCKET, MAX_RATE_LIMIT_WAIT};
use crate::metrics::Metrics;
use http::{HeaderMap, Method};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Path segments whose following id is part of the bucket identity
const MAJOR_PARAMETERS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// A request target normalised for rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Method plus path with minor ids replaced, used for `route -> bucket id`
    pub key: String,
    /// Major parameter value (`channels/123`), empty if none
    pub major: String,
}

impl Route {
    /// Normalise a request path.
    ///
    /// Numeric ids are replaced with `:id` unless they directly follow a
    /// major parameter segment. A webhook token following a webhook id is
    /// kept in the major parameter and stripped from the key.
    pub fn new(method: &Method, path: &str) -> Self {
        let path = path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let mut key_parts = Vec::with_capacity(segments.len());
        let mut major = String::new();
        let mut previous = "";

        for (index, segment) in segments.iter().enumerate() {
            let is_id = !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit());

            if is_id && index == 1 && MAJOR_PARAMETERS.contains(&previous) {
                major = format!("{}/{}", previous, segment);
                key_parts.push(*segment);
            } else if is_id {
                key_parts.push(":id");
            } else if index == 2 && previous.chars().all(|c| c.is_ascii_digit()) && segments[0] == "webhooks" {
                // webhooks/{id}/{token}
                major.push('/');
                major.push_str(segment);
                key_parts.push(":token");
            } else {
                key_parts.push(segment);
            }
            previous = segment;
        }

        Self {
            key: format!("{} /{}", method, key_parts.join("/")),
            major,
        }
    }
}

/// Scope of a rate limit as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Limit applies to the whole token
    Global,
    /// Limit applies to this route's bucket
    User,
    /// Limit applies to a resource shared with other users
    Shared,
}

impl RateLimitScope {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "global" => RateLimitScope::Global,
            "shared" => RateLimitScope::Shared,
            _ => RateLimitScope::User,
        }
    }
}

/// Rate-limit metadata read from a response
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until reset (from `Reset-After`, or `Reset` minus now)
    pub reset_after: Option<Duration>,
    pub scope: Option<RateLimitScope>,
    pub global: bool,
    pub retry_after: Option<Duration>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Non-negative float seconds as a duration, saturating instead of overflowing
pub(crate) fn duration_from_secs(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

fn seconds(value: &str) -> Option<Duration> {
    duration_from_secs(value.parse().ok()?)
}

impl RateLimitHeaders {
    /// Parse rate-limit headers. Returns `None` if none are present.
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let bucket = header_str(headers, "x-ratelimit-bucket").map(str::to_string);
        let limit = header_str(headers, "x-ratelimit-limit").and_then(|v| v.parse().ok());
        let remaining = header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse().ok());

        let reset_after = header_str(headers, "x-ratelimit-reset-after")
            .and_then(seconds)
            .or_else(|| {
                let reset = header_str(headers, "x-ratelimit-reset").and_then(seconds)?;
                let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
                Some(reset.saturating_sub(now))
            })
            .map(|d| d.min(MAX_RATE_LIMIT_WAIT));

        let scope = header_str(headers, "x-ratelimit-scope").map(RateLimitScope::parse);
        let global = header_str(headers, "x-ratelimit-global")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let retry_after = header_str(headers, "retry-after")
            .and_then(seconds)
            .map(|d| d.min(MAX_RATE_LIMIT_WAIT));

        if bucket.is_none()
            && limit.is_none()
            && remaining.is_none()
            && reset_after.is_none()
            && scope.is_none()
            && retry_after.is_none()
            && !global
        {
            return None;
        }

        Some(Self {
            bucket,
            limit,
            remaining,
            reset_after,
            scope,
            global,
            retry_after,
        })
    }

    /// Whether a 429 carrying these headers blocks every route
    pub fn is_global(&self) -> bool {
        self.global || self.scope == Some(RateLimitScope::Global)
    }
}

/// Global and per-route buckets shared by every caller of one transport.
///
/// Owned by the transport (or injected into it) rather than stored in a
/// static, so independent limiters can coexist in one process.
#[derive(Debug)]
pub struct RateLimiter {
    global: RateLimitBucket,
    /// route key -> server bucket hash
    routes: RwLock<HashMap<String, String>>,
    /// `<bucket hash>:<major>` -> bucket state
    buckets: RwLock<HashMap<String, Arc<RateLimitBucket>>>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    /// Create a limiter with the given global ceiling
    pub fn new(global_limit: u32, global_window: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            global: RateLimitBucket::new(GLOBAL_BUCKET, global_limit, global_window),
            routes: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    fn bucket_key(hash: &str, route: &Route) -> String {
        format!("{}:{}", hash, route.major)
    }

    /// The bucket currently assigned to `route`, if the server has named one
    pub fn bucket_for(&self, route: &Route) -> Option<Arc<RateLimitBucket>> {
        let hash = self.routes.read().get(&route.key).cloned()?;
        self.buckets.read().get(&Self::bucket_key(&hash, route)).cloned()
    }

    /// The global bucket
    pub fn global(&self) -> &RateLimitBucket {
        &self.global
    }

    /// Take a global slot, then a slot from the route's bucket if known.
    pub async fn acquire(&self, route: &Route) {
        let waited = self.global.acquire().await;
        if !waited.is_zero() {
            self.metrics.record_rate_limit_wait();
            debug!("Waited {:?} on global bucket for {}", waited, route.key);
        }

        if let Some(bucket) = self.bucket_for(route) {
            let waited = bucket.acquire().await;
            if !waited.is_zero() {
                self.metrics.record_rate_limit_wait();
                debug!(
                    "Waited {:?} on bucket {} for {}",
                    waited,
                    bucket.id(),
                    route.key
                );
            }
        }
    }

    /// Record what a response said about the route's bucket.
    pub async fn update(&self, route: &Route, headers: &RateLimitHeaders) {
        let (Some(hash), Some(limit), Some(remaining), Some(reset_after)) = (
            headers.bucket.as_deref(),
            headers.limit,
            headers.remaining,
            headers.reset_after,
        ) else {
            return;
        };

        let key = Self::bucket_key(hash, route);

        let previous = self
            .routes
            .write()
            .insert(route.key.clone(), hash.to_string());
        if previous.as_deref() != Some(hash) {
            trace!("Route {} mapped to bucket {}", route.key, hash);
        }

        let existing = self.buckets.read().get(&key).cloned();
        match existing {
            Some(bucket) => bucket.update(limit, remaining, reset_after).await,
            None => {
                let bucket = Arc::new(RateLimitBucket::from_headers(
                    key.clone(),
                    limit,
                    remaining,
                    reset_after,
                ));
                // Another caller may have created it in the meantime; keep the first.
                let mut buckets = self.buckets.write();
                buckets.entry(key).or_insert(bucket);
            }
        }
    }

    /// Block the scope named by a 429 response for `retry_after`.
    pub async fn block(&self, route: &Route, headers: Option<&RateLimitHeaders>, global: bool, retry_after: Duration) {
        self.metrics.record_rate_limited_response();
        if global {
            warn!("Global rate limit hit, blocking all requests for {:?}", retry_after);
            self.global.block_for(retry_after).await;
            return;
        }

        if let Some(headers) = headers {
            self.update(route, headers).await;
        }
        if let Some(bucket) = self.bucket_for(route) {
            warn!(
                "Rate limited on bucket {} ({}), blocking for {:?}",
                bucket.id(),
                route.key,
                retry_after
            );
            bucket.block_for(retry_after).await;
        }
    }

    /// Number of route buckets learned so far
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_route_keeps_major_parameter() {
        let a = Route::new(&Method::GET, "/channels/111/messages/222");
        let b = Route::new(&Method::GET, "/channels/111/messages/333");
        let c = Route::new(&Method::GET, "/channels/999/messages/222");

        assert_eq!(a.key, "GET /channels/111/messages/:id");
        assert_eq!(a, b);
        assert_ne!(a.major, c.major);
        assert_eq!(a.major, "channels/111");
    }

    #[test]
    fn test_route_method_and_query() {
        let get = Route::new(&Method::GET, "/gateway/bot?v=10");
        let post = Route::new(&Method::POST, "/gateway/bot");
        assert_eq!(get.key, "GET /gateway/bot");
        assert_ne!(get.key, post.key);
        assert!(get.major.is_empty());
    }

    #[test]
    fn test_route_webhook_token() {
        let route = Route::new(&Method::POST, "/webhooks/42/secret-token");
        assert_eq!(route.key, "POST /webhooks/42/:token");
        assert_eq!(route.major, "webhooks/42/secret-token");
    }

    #[test]
    fn test_parse_headers_prefers_reset_after() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("x-ratelimit-bucket", "abcd"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset", "1"),
            ("x-ratelimit-reset-after", "1.5"),
        ]))
        .expect("headers present");

        assert_eq!(parsed.bucket.as_deref(), Some("abcd"));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(4));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1500)));
        assert!(!parsed.is_global());
    }

    #[test]
    fn test_parse_headers_epoch_reset() {
        let future = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
            + 30.0;
        let parsed = RateLimitHeaders::parse(&headers(&[(
            "x-ratelimit-reset",
            &format!("{:.3}", future),
        )]))
        .expect("headers present");

        let reset_after = parsed.reset_after.unwrap();
        assert!(reset_after > Duration::from_secs(28));
        assert!(reset_after <= Duration::from_secs(30));
    }

    #[test]
    fn test_parse_headers_scope() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("retry-after", "2"),
            ("x-ratelimit-scope", "global"),
        ]))
        .unwrap();
        assert!(parsed.is_global());
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));

        let parsed = RateLimitHeaders::parse(&headers(&[("x-ratelimit-global", "true")])).unwrap();
        assert!(parsed.is_global());

        assert!(RateLimitHeaders::parse(&HeaderMap::new()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_creates_bucket_once() {
        let limiter = RateLimiter::new(50, Duration::from_secs(1), Arc::new(Metrics::new()));
        let route = Route::new(&Method::GET, "/channels/1/messages");
        assert!(limiter.bucket_for(&route).is_none());

        let info = RateLimitHeaders {
            bucket: Some("hash".to_string()),
            limit: Some(5),
            remaining: Some(4),
            reset_after: Some(Duration::from_secs(1)),
            scope: None,
            global: false,
            retry_after: None,
        };
        limiter.update(&route, &info).await;
        limiter.update(&route, &info).await;

        assert_eq!(limiter.bucket_count(), 1);
        let snapshot = limiter.bucket_for(&route).unwrap().snapshot().await;
        assert_eq!(snapshot.remaining, 4);

        // Same hash, different major parameter -> separate bucket
        let other = Route::new(&Method::GET, "/channels/2/messages");
        limiter.update(&other, &info).await;
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_block_delays_every_route() {
        let limiter = RateLimiter::new(50, Duration::from_secs(1), Arc::new(Metrics::new()));
        let route = Route::new(&Method::GET, "/users/@me");

        limiter.block(&route, None, true, Duration::from_secs(2)).await;

        let start = tokio::time::Instant::now();
        limiter.acquire(&Route::new(&Method::GET, "/gateway")).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_parse_headers_clamps_huge_values() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("retry-after", "1e300"),
            ("x-ratelimit-reset-after", "inf"),
        ]))
        .unwrap();
        assert_eq!(parsed.retry_after, Some(MAX_RATE_LIMIT_WAIT));
        assert_eq!(parsed.reset_after, Some(MAX_RATE_LIMIT_WAIT));
    }

    #[test]
    fn test_duration_from_secs_rejects_nan_and_negative() {
        assert_eq!(duration_from_secs(f64::NAN), None);
        assert_eq!(duration_from_secs(-0.5), None);
        assert_eq!(duration_from_secs(f64::INFINITY), Some(Duration::MAX));
        assert_eq!(duration_from_secs(1.5), Some(Duration::from_millis(1500)));
    }
}
