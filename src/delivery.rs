//! Per-client delivery channels.
//!
//! A channel polls the latest snapshot of one source at a fixed client
//! interval and relays a single view to its sink. Delivery is lossy: a slow
//! client misses intermediate snapshots instead of queueing them, and a channel
//! ending never affects the producer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buffer::FrameBuffers;
use crate::encode::EncodedImage;
use crate::view::ViewKey;

pub const DEFAULT_CLIENT_INTERVAL: Duration = Duration::from_millis(40);

/// One relayed image with the producer's measured rate.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveredFrame {
    pub key: ViewKey,
    pub image: EncodedImage,
    pub fps: f32,
    pub sequence: u64,
}

impl DeliveredFrame {
    /// Client wire message: `{"image": <base64 jpeg>, "fps": <float>}`.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "image": general_purpose::STANDARD.encode(self.image.bytes()),
            "fps": self.fps,
        })
        .to_string()
    }
}

/// Destination of a delivery channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Relays one frame. An error means the client is gone.
    async fn deliver(&mut self, frame: DeliveredFrame) -> Result<()>;

    /// Whether the client has disconnected.
    fn is_closed(&self) -> bool {
        false
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<DeliveredFrame> {
    async fn deliver(&mut self, frame: DeliveredFrame) -> Result<()> {
        match self.try_send(frame) {
            Ok(()) => Ok(()),
            // Client still holds an undelivered frame; drop this one.
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("client disconnected")),
        }
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub polls: u64,
    pub delivered: u64,
}

pub struct DeliveryChannel {
    buffers: Arc<FrameBuffers>,
    source_id: String,
    key: ViewKey,
    interval: Duration,
}

impl DeliveryChannel {
    pub fn new(buffers: Arc<FrameBuffers>, source_id: impl Into<String>, key: ViewKey) -> Self {
        Self {
            buffers,
            source_id: source_id.into(),
            key,
            interval: DEFAULT_CLIENT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Polls until the sink disconnects.
    pub async fn run<S: FrameSink>(self, mut sink: S) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        log::debug!("delivery {}/{} started", self.source_id, self.key);
        loop {
            if sink.is_closed() {
                break;
            }
            stats.polls += 1;
            let frame = self.buffers.latest(&self.source_id).and_then(|snapshot| {
                snapshot.image(self.key).map(|image| DeliveredFrame {
                    key: self.key,
                    image: image.clone(),
                    fps: snapshot.meta.fps,
                    sequence: snapshot.meta.sequence,
                })
            });
            if let Some(frame) = frame {
                if let Err(err) = sink.deliver(frame).await {
                    log::debug!("delivery {}/{} ended: {}", self.source_id, self.key, err);
                    break;
                }
                stats.delivered += 1;
            }
            tokio::time::sleep(self.interval).await;
        }
        log::debug!(
            "delivery {}/{} closed after {} frames",
            self.source_id,
            self.key,
            stats.delivered
        );
        stats
    }

    pub fn spawn<S: FrameSink + 'static>(self, sink: S) -> JoinHandle<DeliveryStats> {
        tokio::spawn(self.run(sink))
    }
}
