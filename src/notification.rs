use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::instrument;

use crate::error::LinkError;

/// One inbound notification chunk, stamped when the transport handed it over.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InboundMessage {
    source_address: String,
    payload: Vec<u8>,
    received_at: Instant,
}

impl InboundMessage {
    /// Returns the address of the peripheral that produced this chunk.
    #[must_use]
    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    /// Returns the raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the monotonic arrival time.
    #[must_use]
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Decodes the payload as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Decode`] when the payload is not valid UTF-8.
    #[instrument(skip(self), level = "trace", fields(address = %self.source_address, payload_len = self.payload.len()))]
    pub fn decode_text(&self) -> Result<String, LinkError> {
        std::str::from_utf8(&self.payload)
            .map(str::to_owned)
            .map_err(|source| LinkError::Decode {
                address: self.source_address.clone(),
                source,
            })
    }
}

/// Returned when the receiving session has gone away.
#[derive(Debug, Clone, Copy, Error, Eq, PartialEq)]
#[error("notification channel is closed")]
pub struct ChannelClosed;

/// Transport-side handle used to push notifications towards a session.
///
/// Dropping every clone of the sender ends the stream, which the session
/// treats as loss of the link.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    address: String,
    inner: mpsc::Sender<InboundMessage>,
}

impl NotificationSender {
    /// Returns the address this channel belongs to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queues one payload, waiting while the session's buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelClosed`] when the session has stopped receiving.
    pub async fn deliver(&self, payload: Vec<u8>) -> Result<(), ChannelClosed> {
        let message = InboundMessage {
            source_address: self.address.clone(),
            payload,
            received_at: Instant::now(),
        };
        self.inner.send(message).await.map_err(|_| ChannelClosed)
    }

    /// Returns whether the receiving session has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Session-side end of a notification channel.
#[derive(Debug)]
pub(crate) struct NotificationReceiver {
    inner: mpsc::Receiver<InboundMessage>,
}

impl NotificationReceiver {
    /// Waits for the next message, or `None` once every sender is gone.
    pub(crate) async fn recv(&mut self) -> Option<InboundMessage> {
        self.inner.recv().await
    }

    /// Stops accepting new messages and discards anything still buffered.
    pub(crate) fn close(&mut self) -> usize {
        self.inner.close();
        let mut dropped = 0usize;
        while self.inner.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Creates a bounded, order-preserving notification channel for one address.
pub(crate) fn notification_channel(
    address: &str,
    capacity: usize,
) -> (NotificationSender, NotificationReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        NotificationSender {
            address: address.to_string(),
            inner: sender,
        },
        NotificationReceiver { inner: receiver },
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[tokio::test]
    async fn channel_preserves_arrival_order() {
        let (sender, mut receiver) = notification_channel("AA:01", 4);

        for chunk in ["N1", "N2", "N3"] {
            sender
                .deliver(chunk.as_bytes().to_vec())
                .await
                .expect("receiver is alive");
        }
        drop(sender);

        let mut seen = Vec::new();
        while let Some(message) = receiver.recv().await {
            assert_eq!("AA:01", message.source_address());
            seen.push(message.decode_text().expect("fixtures are UTF-8"));
        }
        assert_eq!(vec!["N1", "N2", "N3"], seen);
    }

    #[tokio::test]
    async fn deliver_fails_once_receiver_is_closed() {
        let (sender, mut receiver) = notification_channel("AA:01", 4);
        sender.deliver(b"late".to_vec()).await.expect("open");

        assert_eq!(1, receiver.close());
        assert!(sender.is_closed());
        assert_matches!(sender.deliver(b"x".to_vec()).await, Err(ChannelClosed));
    }

    #[rstest]
    #[case(b"hello".as_slice(), Some("hello"))]
    #[case("温度:23".as_bytes(), Some("温度:23"))]
    #[case(&[0xFF, 0xFE, 0x41], None)]
    fn decode_text_accepts_only_utf8(#[case] payload: &[u8], #[case] expected: Option<&str>) {
        let message = InboundMessage {
            source_address: "AA:01".to_string(),
            payload: payload.to_vec(),
            received_at: Instant::now(),
        };

        match expected {
            Some(text) => assert_eq!(Ok(text.to_string()), message.decode_text()),
            None => assert_matches!(
                message.decode_text(),
                Err(LinkError::Decode { address, .. }) if address == "AA:01"
            ),
        }
    }
}
