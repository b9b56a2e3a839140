mod app;
mod cli;
mod config;
mod error;
mod manager;
mod notification;
mod observer;
mod registry;
mod session;
mod telemetry;
mod transport;

pub use app::{RunOptions, fake_transport, real_transport, run_with_io, run_with_transport};
pub use cli::{Args, Command, ConnectArgs, FakeArgs, LogLevel, OutputFormat, ScanArgs};
pub use config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_SCAN_WINDOW,
    DEFAULT_SUBSCRIBE_TIMEOUT, DEFAULT_WRITE_TIMEOUT, SERIAL_NOTIFY_UUID16, SERIAL_WRITE_UUID16,
    SessionConfig,
};
pub use error::{FixtureError, LinkError, TransportError, UsageError};
pub use manager::{OutboundRequest, PendingConnect, SessionManager};
pub use notification::{ChannelClosed, InboundMessage, NotificationSender};
pub use observer::{ChannelObserver, SessionEvent, SessionObserver};
pub use registry::{DeviceRecord, DeviceRegistry, ScanCompletion, UNKNOWN_DEVICE_NAME};
pub use session::{SessionId, SessionState, WriteReceipt};
pub use transport::{
    Advertisement, AdvertisementSink, BtleplugTransport, ConnectionHandle, DiscoveryHandle,
    FakeTransport, FakeTransportConfig, NotificationFixture, ScanFixture, Transport,
};
