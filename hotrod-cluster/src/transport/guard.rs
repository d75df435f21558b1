use super::{Channel, ChannelProvider};
use crate::error::{ClientError, Result};
use crate::metrics;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

/// Borrowed channel that goes back to the provider exactly once.
///
/// `release` and `discard` consume the guard. If the guard is dropped
/// instead, the channel is released, unless a response is still
/// outstanding, in which case it is discarded since its next frame belongs
/// to nobody.
pub(crate) struct ChannelGuard {
    provider: Arc<dyn ChannelProvider>,
    channel: Option<Box<dyn Channel>>,
    awaiting_response: bool,
}

impl ChannelGuard {
    pub(crate) fn new(provider: Arc<dyn ChannelProvider>, channel: Box<dyn Channel>) -> Self {
        Self {
            provider,
            channel: Some(channel),
            awaiting_response: false,
        }
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn Channel>> {
        self.channel
            .as_mut()
            .ok_or_else(|| ClientError::Internal("Channel already returned".into()))
    }

    pub(crate) async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        self.channel_mut()?.write_frame(frame).await?;
        self.awaiting_response = true;
        Ok(())
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Bytes> {
        let frame = self.channel_mut()?.read_frame().await?;
        self.awaiting_response = false;
        Ok(frame)
    }

    pub(crate) fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            trace!("Releasing channel {} to {}", channel.id(), channel.address());
            metrics::record_channel_released(&channel.address().to_string());
            self.provider.release_channel(channel);
        }
    }

    pub(crate) fn discard(mut self, reason: &str) {
        if let Some(channel) = self.channel.take() {
            debug!(
                "Discarding channel {} to {}: {}",
                channel.id(),
                channel.address(),
                reason
            );
            metrics::record_channel_discarded(&channel.address().to_string(), reason);
            self.provider.discard_channel(channel);
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let address = channel.address().to_string();
            if self.awaiting_response {
                debug!("Dropping channel {} with a response in flight", channel.id());
                metrics::record_channel_discarded(&address, "abandoned");
                self.provider.discard_channel(channel);
            } else {
                metrics::record_channel_released(&address);
                self.provider.release_channel(channel);
            }
        }
    }
}
