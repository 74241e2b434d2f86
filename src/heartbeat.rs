use crate::error::Error;
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Tracks heartbeat state for a single connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// Interval announced by Hello
    interval: Option<Duration>,

    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last ack received
    last_ack: Option<Instant>,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,

    /// Number of consecutive heartbeats without an ack
    missed: u32,

    /// Misses that mark the connection dead
    max_missed: u32,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor
    pub fn new(max_missed: u32) -> Self {
        Self {
            interval: None,
            last_sent: None,
            last_ack: None,
            latency: None,
            missed: 0,
            max_missed,
        }
    }

    /// Start tracking a new connection with the interval from Hello
    pub fn start(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.last_sent = None;
        self.missed = 0;
    }

    /// Record that we sent a heartbeat
    pub fn record_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    /// Record an ack. Resets the miss counter and returns the measured latency.
    pub fn record_ack(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.last_ack = Some(now);
        self.missed = 0;
        self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        self.latency
    }

    /// Record that an interval passed without an ack; returns the miss count
    pub fn record_miss(&mut self) -> u32 {
        self.missed += 1;
        self.missed
    }

    /// Whether enough consecutive heartbeats went unanswered
    pub fn is_dead(&self) -> bool {
        self.missed >= self.max_missed
    }

    /// Consecutive unanswered heartbeats
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Last measured round trip
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// When the last ack arrived
    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack
    }

    /// Interval announced by the server
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

/// Sends one heartbeat frame.
pub(crate) trait Beat: Send + Sync {
    fn beat(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Called after an interval passed without an ack
    fn missed(&self, _count: u32) {}
}

/// Why the heartbeat loop stopped
#[derive(Debug)]
pub(crate) enum HeartbeatOutcome {
    /// Stopped by the connection
    Cancelled,
    /// Too many consecutive heartbeats went unanswered
    Dead { missed: u32 },
    /// The socket refused the heartbeat
    SendFailed(Error),
}

/// Signals shared between the read loop and the heartbeat loop
pub(crate) struct HeartbeatSignals {
    /// Single-slot "ack received" signal
    pub ack_rx: mpsc::Receiver<()>,
    /// Server asked for an immediate heartbeat
    pub beat_now: std::sync::Arc<Notify>,
    pub cancel: CancellationToken,
}

/// Create the single-slot ack channel
pub(crate) fn ack_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// Run the heartbeat loop for one connection.
///
/// Sleeps one interval, sends a heartbeat, then waits until the next beat is
/// due for the ack. Each interval without an ack counts as a miss; reaching
/// `max_missed` consecutive misses ends the loop with `Dead`.
pub(crate) async fn run_heartbeat<B: Beat>(
    shard_id: u32,
    beat: &B,
    interval: Duration,
    monitor: &Mutex<HeartbeatMonitor>,
    mut signals: HeartbeatSignals,
) -> HeartbeatOutcome {
    let mut next_beat = Instant::now() + interval;

    loop {
        tokio::select! {
            _ = signals.cancel.cancelled() => return HeartbeatOutcome::Cancelled,
            _ = sleep_until(next_beat) => {}
            _ = signals.beat_now.notified() => {
                debug!("[SHARD-{}] Heartbeat requested by server", shard_id);
            }
        }

        // Acks belonging to earlier heartbeats must not satisfy this one
        while signals.ack_rx.try_recv().is_ok() {}

        if let Err(e) = beat.beat().await {
            return HeartbeatOutcome::SendFailed(e);
        }
        monitor.lock().record_sent();
        next_beat = Instant::now() + interval;
        trace!("[SHARD-{}] Heartbeat sent", shard_id);

        loop {
            tokio::select! {
                _ = signals.cancel.cancelled() => return HeartbeatOutcome::Cancelled,
                ack = signals.ack_rx.recv() => {
                    if ack.is_none() {
                        return HeartbeatOutcome::Cancelled;
                    }
                    break;
                }
                _ = sleep_until(next_beat) => {
                    let (missed, dead) = {
                        let mut monitor = monitor.lock();
                        let missed = monitor.record_miss();
                        (missed, monitor.is_dead())
                    };
                    beat.missed(missed);
                    warn!("[SHARD-{}] Heartbeat not acknowledged (missed: {})", shard_id, missed);
                    if dead {
                        return HeartbeatOutcome::Dead { missed };
                    }
                    break;
                }
                _ = signals.beat_now.notified() => {
                    debug!("[SHARD-{}] Heartbeat requested while awaiting ack", shard_id);
                    if let Err(e) = beat.beat().await {
                        return HeartbeatOutcome::SendFailed(e);
                    }
                    monitor.lock().record_sent();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Acks every heartbeat after `delay` when `ack` is set
    struct FakeBeat {
        sent: AtomicU32,
        ack: Option<(mpsc::Sender<()>, Duration)>,
        monitor: Arc<Mutex<HeartbeatMonitor>>,
    }

    impl Beat for FakeBeat {
        async fn beat(&self) -> Result<(), Error> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if let Some((tx, delay)) = &self.ack {
                let tx = tx.clone();
                let delay = *delay;
                let monitor = self.monitor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    monitor.lock().record_ack();
                    let _ = tx.try_send(());
                });
            }
            Ok(())
        }
    }

    fn signals(ack_rx: mpsc::Receiver<()>, cancel: CancellationToken) -> (HeartbeatSignals, Arc<Notify>) {
        let beat_now = Arc::new(Notify::new());
        (
            HeartbeatSignals {
                ack_rx,
                beat_now: beat_now.clone(),
                cancel,
            },
            beat_now,
        )
    }

    #[test]
    fn test_initial_state() {
        let monitor = HeartbeatMonitor::new(3);
        assert_eq!(monitor.missed(), 0);
        assert!(!monitor.is_dead());
        assert!(monitor.latency().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_measures_latency_and_resets_misses() {
        let mut monitor = HeartbeatMonitor::new(3);
        monitor.start(Duration::from_secs(1));
        monitor.record_sent();
        monitor.record_miss();
        monitor.record_miss();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let latency = monitor.record_ack().unwrap();

        assert_eq!(latency, Duration::from_millis(120));
        assert_eq!(monitor.missed(), 0);
        assert!(monitor.last_ack_at().is_some());
    }

    #[test]
    fn test_dead_after_threshold() {
        let mut monitor = HeartbeatMonitor::new(3);
        for _ in 0..3 {
            monitor.record_miss();
        }
        assert!(monitor.is_dead());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_heartbeats_never_miss() {
        let interval = Duration::from_millis(100);
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(3)));
        monitor.lock().start(interval);
        let (ack_tx, ack_rx) = ack_channel();
        let cancel = CancellationToken::new();
        let (signals, _) = signals(ack_rx, cancel.clone());

        let beat = Arc::new(FakeBeat {
            sent: AtomicU32::new(0),
            ack: Some((ack_tx, Duration::from_millis(40))),
            monitor: monitor.clone(),
        });

        let task = {
            let beat = beat.clone();
            let monitor = monitor.clone();
            tokio::spawn(async move { run_heartbeat(0, beat.as_ref(), interval, &monitor, signals).await })
        };

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(monitor.lock().missed(), 0);
        }
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), HeartbeatOutcome::Cancelled));
        assert!(beat.sent.load(Ordering::SeqCst) >= 9);
        assert_eq!(monitor.lock().missed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_misses_declare_dead() {
        let interval = Duration::from_millis(100);
        let monitor = Mutex::new(HeartbeatMonitor::new(3));
        let (_ack_tx, ack_rx) = ack_channel();
        let (signals, _) = signals(ack_rx, CancellationToken::new());
        let beat = FakeBeat {
            sent: AtomicU32::new(0),
            ack: None,
            monitor: Arc::new(Mutex::new(HeartbeatMonitor::new(3))),
        };

        let started = Instant::now();
        let outcome = run_heartbeat(0, &beat, interval, &monitor, signals).await;

        assert!(matches!(outcome, HeartbeatOutcome::Dead { missed: 3 }));
        assert_eq!(beat.sent.load(Ordering::SeqCst), 3);
        // First beat after one interval, then three unanswered intervals
        assert_eq!(started.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beat_now_skips_the_wait() {
        let interval = Duration::from_secs(30);
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(3)));
        let (_ack_tx, ack_rx) = ack_channel();
        let cancel = CancellationToken::new();
        let (signals, beat_now) = signals(ack_rx, cancel.clone());
        let beat = Arc::new(FakeBeat {
            sent: AtomicU32::new(0),
            ack: None,
            monitor: monitor.clone(),
        });

        let task = {
            let beat = beat.clone();
            let monitor = monitor.clone();
            tokio::spawn(async move { run_heartbeat(0, beat.as_ref(), interval, &monitor, signals).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        beat_now.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(beat.sent.load(Ordering::SeqCst), 1);

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), HeartbeatOutcome::Cancelled));
    }
}
