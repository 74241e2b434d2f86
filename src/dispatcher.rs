use crate::protocol::EventEnvelope;
use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Trait that users implement to consume gateway events.
///
/// # Example
///
/// ```ignore
/// use ws_gateway::{EventEnvelope, EventHandler};
///
/// struct LogHandler;
///
/// impl EventHandler for LogHandler {
///     async fn on_event(&self, event: EventEnvelope) {
///         println!("[{}] {:?}", event.shard_id, event.event_name);
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync + 'static {
    /// Called once per event, in the order the event's shard received it.
    fn on_event(&self, event: EventEnvelope) -> impl Future<Output = ()> + Send;
}

/// Consumer end of the merged event stream.
///
/// Events from one shard arrive in the order that shard received them;
/// events from different shards interleave in no particular order. The
/// stream ends after the coordinator shuts down and every shard is gone.
#[derive(Debug)]
pub struct Dispatcher {
    rx: mpsc::Receiver<EventEnvelope>,
}

impl Dispatcher {
    pub(crate) fn new(rx: mpsc::Receiver<EventEnvelope>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the stream has ended
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

    /// Hand every event to `handler`, one at a time, until the stream ends.
    ///
    /// Each call runs in its own task so a panicking handler loses only the
    /// event it was processing.
    pub async fn run<H: EventHandler>(mut self, handler: Arc<H>) {
        while let Some(event) = self.rx.recv().await {
            let shard_id = event.shard_id;
            let handler = handler.clone();
            let result = tokio::spawn(async move { handler.on_event(event).await }).await;

            if let Err(e) = result {
                error!("[SHARD-{}] Event handler panicked: {:?}", shard_id, e);
            }
        }
        debug!("Event stream ended");
    }
}

impl Stream for Dispatcher {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(shard_id: u32, sequence: u64) -> EventEnvelope {
        EventEnvelope {
            shard_id,
            opcode: Opcode::Dispatch,
            sequence: Some(sequence),
            event_name: Some("MESSAGE_CREATE".to_string()),
            payload: json!({ "n": sequence }),
        }
    }

    struct Recorder {
        seen: Mutex<Vec<(u32, u64)>>,
    }

    impl EventHandler for Recorder {
        async fn on_event(&self, event: EventEnvelope) {
            let sequence = event.sequence.unwrap_or_default();
            if sequence == 2 && event.shard_id == 1 {
                panic!("handler failure");
            }
            self.seen.lock().push((event.shard_id, sequence));
        }
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(rx);

        for seq in 1..=3 {
            tx.send(event(0, seq)).await.unwrap();
        }
        drop(tx);

        let sequences: Vec<u64> = dispatcher
            .map(|e| e.sequence.unwrap_or_default())
            .collect()
            .await;
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_run_survives_handler_panic() {
        let (tx, rx) = mpsc::channel(8);
        for (shard, seq) in [(0, 1), (1, 2), (0, 2), (0, 3)] {
            tx.send(event(shard, seq)).await.unwrap();
        }
        drop(tx);

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        Dispatcher::new(rx).run(recorder.clone()).await;

        assert_eq!(*recorder.seen.lock(), vec![(0, 1), (0, 2), (0, 3)]);
    }
}
