use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::registry::DeviceRecord;

/// Callbacks a caller registers when connecting to a device.
///
/// All callbacks for one session are invoked from that session's task, so
/// they never run concurrently with each other. Exactly one of
/// [`SessionObserver::on_connected`] and [`SessionObserver::on_connect_failed`]
/// is called per connect, and `on_connected` always precedes the first
/// [`SessionObserver::on_data`].
pub trait SessionObserver: Send + Sync + 'static {
    fn on_connected(&self, device: &DeviceRecord);

    fn on_connect_failed(&self, error: &LinkError);

    /// Receives one decoded notification, in arrival order.
    fn on_data(&self, address: &str, text: &str);

    /// Receives notifications that could not be decoded; the session stays ready.
    fn on_data_error(&self, _error: &LinkError) {}

    /// Called once a ready session has been disconnected, whatever the cause.
    fn on_disconnected(&self, _address: &str) {}
}

/// Lifecycle events as values, for callers that prefer a stream to callbacks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    Connected(DeviceRecord),
    ConnectFailed(LinkError),
    Data { address: String, text: String },
    DataError(LinkError),
    Disconnected { address: String },
}

/// Observer that forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    /// Creates an observer and the receiver its events are sent to.
    ///
    /// The same observer may be shared by several sessions; events carry the
    /// originating address.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), receiver)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("session event receiver dropped");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_connected(&self, device: &DeviceRecord) {
        self.emit(SessionEvent::Connected(device.clone()));
    }

    fn on_connect_failed(&self, error: &LinkError) {
        self.emit(SessionEvent::ConnectFailed(error.clone()));
    }

    fn on_data(&self, address: &str, text: &str) {
        self.emit(SessionEvent::Data {
            address: address.to_string(),
            text: text.to_string(),
        });
    }

    fn on_data_error(&self, error: &LinkError) {
        self.emit(SessionEvent::DataError(error.clone()));
    }

    fn on_disconnected(&self, address: &str) {
        self.emit(SessionEvent::Disconnected {
            address: address.to_string(),
        });
    }
}
