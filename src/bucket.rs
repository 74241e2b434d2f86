use std::pin::pin;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

/// Identifier of the bucket that caps every request
pub const GLOBAL_BUCKET: &str = "global";

/// Longest window or retry delay a bucket accepts; larger values are clamped
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + after`, with `after` clamped to [`MAX_RATE_LIMIT_WAIT`]
fn deadline(now: Instant, after: Duration) -> Instant {
    now + after.min(MAX_RATE_LIMIT_WAIT)
}

/// A single quota counter for a route bucket or the global ceiling.
///
/// Acquirers take turns through `queue`, so waiters are served in FIFO
/// order. The counters sit behind a separate lock that is never held while
/// sleeping; `update` and `block_for` only take that one and wake the
/// sleeping acquirer so it re-reads the window.
#[derive(Debug)]
pub struct RateLimitBucket {
    id: String,
    queue: Mutex<()>,
    state: Mutex<BucketState>,
    changed: Notify,
}

/// Point-in-time view of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Time left until the window replenishes (`None` if no window is open)
    pub reset_after: Option<Duration>,
    /// Window length used when no fresher header data has arrived
    pub fallback_interval: Duration,
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    fallback_interval: Duration,
}

impl BucketState {
    /// Replenish if the window elapsed, advancing `reset_at` by the fallback interval.
    fn refresh(&mut self, now: Instant) {
        match self.reset_at {
            Some(reset_at) if reset_at <= now => {
                self.remaining = self.limit;
                self.reset_at = Some(now + self.fallback_interval);
            }
            None => {
                self.reset_at = Some(now + self.fallback_interval);
            }
            _ => {}
        }
    }
}

impl RateLimitBucket {
    /// Create a bucket with a full window of `limit` slots.
    pub fn new(id: impl Into<String>, limit: u32, interval: Duration) -> Self {
        Self {
            id: id.into(),
            queue: Mutex::new(()),
            changed: Notify::new(),
            state: Mutex::new(BucketState {
                limit,
                remaining: limit,
                reset_at: None,
                fallback_interval: interval.min(MAX_RATE_LIMIT_WAIT),
            }),
        }
    }

    /// Create a bucket from the first response that named it.
    pub fn from_headers(id: impl Into<String>, limit: u32, remaining: u32, reset_after: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            queue: Mutex::new(()),
            changed: Notify::new(),
            state: Mutex::new(BucketState {
                limit,
                remaining: remaining.min(limit),
                reset_at: Some(deadline(now, reset_after)),
                fallback_interval: reset_after.min(MAX_RATE_LIMIT_WAIT),
            }),
        }
    }

    /// Bucket identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take one slot, sleeping until the window resets when none are left.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let _turn = self.queue.lock().await;

        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();

            let reset_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refresh(now);

                if state.remaining > 0 {
                    state.remaining -= 1;
                    trace!(
                        "Bucket {} acquired ({}/{} left)",
                        self.id,
                        state.remaining,
                        state.limit
                    );
                    return started.elapsed();
                }

                let reset_at = match state.reset_at {
                    Some(at) if at > now => at,
                    _ => deadline(now, state.fallback_interval),
                };
                debug!(
                    "Bucket {} exhausted, waiting {:?}",
                    self.id,
                    reset_at.saturating_duration_since(now)
                );
                reset_at
            };

            tokio::select! {
                _ = sleep_until(reset_at) => {}
                _ = changed => trace!("Bucket {} changed while waiting", self.id),
            }
        }
    }

    /// Apply fresh rate-limit data from a response.
    pub async fn update(&self, limit: u32, remaining: u32, reset_after: Duration) {
        let mut state = self.state.lock().await;
        let reset_after = reset_after.min(MAX_RATE_LIMIT_WAIT);
        state.limit = limit;
        state.remaining = remaining.min(limit);
        state.reset_at = Some(Instant::now() + reset_after);
        if !reset_after.is_zero() {
            state.fallback_interval = reset_after;
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Empty the bucket until `duration` has elapsed (429 handling).
    pub async fn block_for(&self, duration: Duration) {
        let mut state = self.state.lock().await;
        let until = deadline(Instant::now(), duration);
        state.remaining = 0;
        state.reset_at = Some(match state.reset_at {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        drop(state);
        self.changed.notify_waiters();
    }

    /// Read the current counters without consuming a slot.
    pub async fn snapshot(&self) -> BucketSnapshot {
        let state = self.state.lock().await;
        let now = Instant::now();
        BucketSnapshot {
            limit: state.limit,
            remaining: state.remaining,
            reset_after: state.reset_at.map(|at| at.saturating_duration_since(now)),
            fallback_interval: state.fallback_interval,
        }
    }
}
