use std::fmt::Debug;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::frames::codec::PartialFrame;
use crate::frames::Frame;

/// a DATA frame as it was received from a station
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrameReceived {
    pub station: String,
    pub frame: Frame,
}

/// Receives DATA frames for downstream processing. `publish` is awaited by the connection's read
///  loop, so a slow publisher slows down reading from the station rather than buffering without
///  bound.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataPublisher: Debug + Send + Sync + 'static {
    async fn publish(&self, data: DataFrameReceived) -> anyhow::Result<()>;
}

/// Hands frames over to a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<DataFrameReceived>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (ChannelPublisher, mpsc::Receiver<DataFrameReceived>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (ChannelPublisher { sender }, receiver)
    }
}

#[async_trait]
impl DataPublisher for ChannelPublisher {
    async fn publish(&self, data: DataFrameReceived) -> anyhow::Result<()> {
        self.sender.send(data).await
            .map_err(|e| anyhow!("data frame receiver was dropped, discarding frame #{} from {}", e.0.frame.sequence_number(), e.0.station))
    }
}

/// Destination for bytes that could not be parsed into a frame
#[cfg_attr(test, automock)]
pub trait MalformedSink: Debug + Send + Sync + 'static {
    fn on_malformed(&self, station: &str, partial: &PartialFrame);
}

#[derive(Debug, Default, Clone)]
pub struct LoggingMalformedSink;

impl MalformedSink for LoggingMalformedSink {
    fn on_malformed(&self, station: &str, partial: &PartialFrame) {
        warn!(station, frame_type = ?partial.claimed_frame_type(), num_bytes = partial.raw.len(), crc_valid = partial.is_valid_crc(),
            "received malformed frame: {}", partial.error);
    }
}
