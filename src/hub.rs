use crate::frame::{Frame, MediaSpec};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

/// Per-publish fan-out budget. Shared across all subscribers of a single
/// `Publish` call, not per-subscriber — see DESIGN.md for why.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(1);

/// Depth of a subscriber's delivery channel. Small and bounded: a consumer
/// that can't keep up loses frames under [PUBLISH_DEADLINE], it doesn't stall
/// the hub.
const SUBSCRIBER_CHANNEL_DEPTH: usize = 64;

/// Depth of the source-announcement channel.
const NOTIFY_CHANNEL_DEPTH: usize = 1024;

/// An opaque producer identity advertising its `streamID` and media specs.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub stream_id: String,
    pub media_specs: Vec<MediaSpec>,
}

pub type DeliveryReceiver = mpsc::Receiver<Frame>;

struct StreamState {
    subscribers: Vec<mpsc::Sender<Frame>>,
}

/// The per-stream publish/subscribe bus connecting ingress producers to
/// egress consumers.
pub struct Hub {
    streams: RwLock<HashMap<String, StreamState>>,
    notify_tx: mpsc::Sender<Source>,
    notify_rx: RwLock<Option<mpsc::Receiver<Source>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_DEPTH);
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            notify_tx,
            notify_rx: RwLock::new(Some(notify_rx)),
        })
    }

    /// Allocates a delivery channel for `stream_id`. Late-subscribe is
    /// allowed; there is no replay of frames published before this call.
    pub async fn subscribe(&self, stream_id: &str) -> DeliveryReceiver {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_DEPTH);
        let mut streams = self.streams.write().await;
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamState {
                subscribers: Vec::new(),
            })
            .subscribers
            .push(tx);
        rx
    }

    /// Delivers `frame` to every current subscriber of `stream_id`, spending
    /// at most [PUBLISH_DEADLINE] total across the whole fan-out. Slow
    /// subscribers are skipped for this frame only; the drop is not reported
    /// to the caller.
    pub async fn publish(&self, stream_id: &str, frame: Frame) {
        let streams = self.streams.read().await;
        let Some(state) = streams.get(stream_id) else {
            return;
        };
        if state.subscribers.is_empty() {
            return;
        }

        if timeout(PUBLISH_DEADLINE, deliver_all(&state.subscribers, frame))
            .await
            .is_err()
        {
            warn!(
                "publish deadline reached for stream {stream_id}: remaining subscribers skipped for this frame"
            );
        }
    }

    /// Closes every subscriber channel for `stream_id` and removes the entry.
    /// Idempotent.
    pub async fn unpublish(&self, stream_id: &str) {
        let mut streams = self.streams.write().await;
        // Dropping the senders closes the channels; subscribers observe this
        // as `recv()` returning `None`.
        streams.remove(stream_id);
    }

    /// Announces a newly-registered [Source]. Non-blocking: drops the
    /// announcement (logged) if the notification channel is full.
    pub fn notify(&self, source: Source) {
        if self.notify_tx.try_send(source).is_err() {
            warn!("source announcement channel full, dropping notification");
        }
    }

    /// Takes the receiving half of the announcement bus. Only one caller
    /// (the supervisor) is expected to hold this at a time.
    pub async fn subscribe_sources(&self) -> Option<mpsc::Receiver<Source>> {
        self.notify_rx.write().await.take()
    }
}

/// Delivers `frame` (cloned per subscriber) to every sender. A subscriber
/// whose receiver was dropped is silently skipped; it's pruned on the next
/// subscribe/unpublish cycle.
async fn deliver_all(subscribers: &[mpsc::Sender<Frame>], frame: Frame) {
    for tx in subscribers {
        let _ = tx.send(frame.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Codec, MediaType, OpusAudio};

    fn opus_frame(dts: i64) -> Frame {
        Frame::OpusAudio(OpusAudio {
            data: vec![1, 2, 3],
            pts: dts,
            dts,
            clock_rate: 48_000,
        })
    }

    #[tokio::test]
    async fn fan_out_completeness_for_single_subscriber() {
        let hub = Hub::new();
        let mut rx = hub.subscribe("s1").await;
        for i in 0..5 {
            hub.publish("s1", opus_frame(i)).await;
        }
        let mut count = 0;
        while let Ok(f) = rx.try_recv() {
            assert_eq!(f.dts(), count);
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn publish_is_isolated_per_stream() {
        let hub = Hub::new();
        let mut rx_b = hub.subscribe("b").await;
        hub.publish("a", opus_frame(0)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribe_does_not_replay() {
        let hub = Hub::new();
        hub.publish("s1", opus_frame(0)).await; // no subscribers yet, dropped
        let mut rx = hub.subscribe("s1").await;
        hub.publish("s1", opus_frame(1)).await;
        let f = rx.recv().await.unwrap();
        assert_eq!(f.dts(), 1);
    }

    #[tokio::test]
    async fn unpublish_closes_subscriber_channels() {
        let hub = Hub::new();
        let mut rx = hub.subscribe("s1").await;
        hub.unpublish("s1").await;
        assert!(rx.recv().await.is_none());
        // further publishes are no-ops, not errors
        hub.publish("s1", opus_frame(0)).await;
    }

    #[tokio::test]
    async fn notify_and_subscribe_sources_roundtrip() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_sources().await.unwrap();
        hub.notify(Source {
            name: "rtmp".into(),
            stream_id: "s1".into(),
            media_specs: vec![MediaSpec {
                media_type: MediaType::Video,
                codec: Codec::H264,
                clock_rate: 90_000,
            }],
        });
        let src = rx.recv().await.unwrap();
        assert_eq!(src.stream_id, "s1");
    }
}
