//! Destinations for decoded inbound frames

use crossbeam_channel::{Sender, TrySendError};
use sss3_core::ReceivedFrame;
use tracing::warn;

/// Receives every decoded inbound frame
///
/// Called on the data-plane thread; implementations should not block.
pub trait FrameConsumer: Send + Sync {
    fn consume(&self, frame: ReceivedFrame);
}

/// Forwards frames into a channel, dropping them when the channel is full
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: Sender<ReceivedFrame>,
}

impl ChannelConsumer {
    pub fn new(tx: Sender<ReceivedFrame>) -> Self {
        Self { tx }
    }
}

impl FrameConsumer for ChannelConsumer {
    fn consume(&self, frame: ReceivedFrame) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(id = frame.frame.id, "Frame consumer is full"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl<F> FrameConsumer for F
where
    F: Fn(ReceivedFrame) + Send + Sync,
{
    fn consume(&self, frame: ReceivedFrame) {
        self(frame)
    }
}
