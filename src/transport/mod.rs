mod btleplug_backend;
mod fake_backend;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::notification::NotificationSender;

pub use self::btleplug_backend::BtleplugTransport;
pub use self::fake_backend::{
    FakeTransport, FakeTransportConfig, NotificationFixture, ScanFixture,
};

/// One advertisement sighting reported during discovery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Advertisement {
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
}

impl Advertisement {
    #[must_use]
    pub fn new(address: impl Into<String>, name: Option<&str>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_owned),
            rssi,
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

/// Channel on which a transport reports advertisements while discovering.
pub type AdvertisementSink = mpsc::UnboundedSender<Advertisement>;

/// Identifies one active discovery run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
#[display("discovery#{_0}")]
pub struct DiscoveryHandle(u64);

impl DiscoveryHandle {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Identifies one open transport connection.
#[derive(Debug, Clone, Eq, PartialEq, Hash, derive_more::Display)]
#[display("connection#{id} ({address})")]
pub struct ConnectionHandle {
    id: u64,
    address: String,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Radio stack consumed by the session core.
///
/// Implementations report raw [`TransportError`]s; the session layer applies
/// timeouts and translates failures before they reach a caller.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts reporting advertisements on `sink` until [`Transport::end_discovery`].
    async fn begin_discovery(
        &self,
        sink: AdvertisementSink,
    ) -> Result<DiscoveryHandle, TransportError>;

    /// Stops a discovery run started by [`Transport::begin_discovery`].
    async fn end_discovery(&self, handle: DiscoveryHandle) -> Result<(), TransportError>;

    /// Opens a link to the peripheral at `address`.
    async fn open_connection(&self, address: &str) -> Result<ConnectionHandle, TransportError>;

    /// Subscribes to `characteristic` and forwards each notification to `notifications`.
    ///
    /// The transport drops `notifications` when the link is lost.
    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        characteristic: Uuid,
        notifications: NotificationSender,
    ) -> Result<(), TransportError>;

    /// Writes one payload to `characteristic`.
    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Closes the link and releases every resource tied to it.
    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError>;
}
