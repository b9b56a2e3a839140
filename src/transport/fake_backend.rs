use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Advertisement, AdvertisementSink, ConnectionHandle, DiscoveryHandle, Transport};
use crate::error::{FixtureError, TransportError};
use crate::notification::NotificationSender;

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    advertisements: Vec<Advertisement>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let advertisements = parse_scan_fixture(value)?;
        Ok(Self { advertisements })
    }
}

/// Parsed fake notification payloads, one UTF-8 chunk per comma-separated item.
#[derive(Debug, Clone, derive_more::Into)]
pub struct NotificationFixture {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = if value.is_empty() {
            Vec::new()
        } else {
            value.split(',').map(|item| item.as_bytes().to_vec()).collect()
        };
        Ok(Self { payloads })
    }
}

/// Settings for constructing a [`FakeTransport`].
#[derive(Debug, Default, Builder)]
pub struct FakeTransportConfig {
    #[builder(default)]
    advertisements: Vec<Advertisement>,
    /// Payloads pushed to every new subscription, in order.
    #[builder(default)]
    notifications: Vec<Vec<u8>>,
    #[builder(default)]
    discovery_delay: Duration,
}

#[derive(Debug, Clone)]
enum Behaviour {
    Fail(String),
    Hang,
}

#[derive(Debug)]
struct FakeConnection {
    address: String,
    notifications: Option<NotificationSender>,
}

#[derive(Debug, Default)]
struct FakeState {
    advertisements: Vec<Advertisement>,
    discovery_failure: Option<String>,
    connection_behaviour: HashMap<String, Behaviour>,
    subscription_behaviour: HashMap<String, Behaviour>,
    write_failures: HashMap<String, VecDeque<String>>,
    connections: HashMap<u64, FakeConnection>,
    active_discoveries: usize,
    opened: usize,
    closed: usize,
    started_writes: HashMap<String, Vec<Vec<u8>>>,
    completed_writes: HashMap<String, Vec<Vec<u8>>>,
    next_id: u64,
}

/// In-memory transport for tests and hardware-free runs.
///
/// Every operation succeeds unless told otherwise, and every call is counted
/// so tests can assert on resource accounting.
#[derive(Debug)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
    auto_notifications: Vec<Vec<u8>>,
    discovery_delay: Duration,
    writes_released: watch::Sender<bool>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new(FakeTransportConfig::default())
    }
}

impl FakeTransport {
    #[must_use]
    pub fn new(config: FakeTransportConfig) -> Self {
        let (writes_released, _receiver) = watch::channel(true);
        Self {
            state: Mutex::new(FakeState {
                advertisements: config.advertisements,
                ..FakeState::default()
            }),
            auto_notifications: config.notifications,
            discovery_delay: config.discovery_delay,
            writes_released,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the advertisements reported by later discovery runs.
    pub fn set_advertisements(&self, advertisements: Vec<Advertisement>) {
        self.lock().advertisements = advertisements;
    }

    /// Makes every later discovery start fail with `reason`.
    pub fn fail_discovery(&self, reason: impl Into<String>) {
        self.lock().discovery_failure = Some(reason.into());
    }

    /// Makes opening a connection to `address` fail with `reason`.
    pub fn fail_connection(&self, address: &str, reason: impl Into<String>) {
        self.lock()
            .connection_behaviour
            .insert(address.to_string(), Behaviour::Fail(reason.into()));
    }

    /// Makes opening a connection to `address` never complete.
    pub fn hang_connection(&self, address: &str) {
        self.lock()
            .connection_behaviour
            .insert(address.to_string(), Behaviour::Hang);
    }

    /// Makes subscribing on a connection to `address` fail with `reason`.
    pub fn fail_subscription(&self, address: &str, reason: impl Into<String>) {
        self.lock()
            .subscription_behaviour
            .insert(address.to_string(), Behaviour::Fail(reason.into()));
    }

    /// Makes subscribing on a connection to `address` never complete.
    pub fn hang_subscription(&self, address: &str) {
        self.lock()
            .subscription_behaviour
            .insert(address.to_string(), Behaviour::Hang);
    }

    /// Makes the next write to `address` fail with `reason`.
    pub fn fail_next_write(&self, address: &str, reason: impl Into<String>) {
        self.lock()
            .write_failures
            .entry(address.to_string())
            .or_default()
            .push_back(reason.into());
    }

    /// Holds every write that starts from now on until [`Self::release_writes`].
    pub fn hold_writes(&self) {
        self.writes_released.send_replace(false);
    }

    /// Lets held and future writes complete.
    pub fn release_writes(&self) {
        self.writes_released.send_replace(true);
    }

    /// Pushes one notification to the subscription on `address`.
    ///
    /// Returns `false` when nothing is subscribed or the session has gone away.
    pub async fn notify(&self, address: &str, payload: impl Into<Vec<u8>>) -> bool {
        let sender = self
            .lock()
            .connections
            .values()
            .filter(|connection| connection.address == address)
            .find_map(|connection| connection.notifications.clone());
        match sender {
            Some(sender) => sender.deliver(payload.into()).await.is_ok(),
            None => false,
        }
    }

    /// Simulates loss of the radio link by ending the notification stream.
    pub fn drop_link(&self, address: &str) {
        let mut state = self.lock();
        for connection in state.connections.values_mut() {
            if connection.address == address {
                connection.notifications = None;
            }
        }
    }

    /// Returns how many connections were successfully opened.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock().opened
    }

    /// Returns how many connections were closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().closed
    }

    /// Returns whether a connection to `address` is currently open.
    #[must_use]
    pub fn is_open(&self, address: &str) -> bool {
        self.lock()
            .connections
            .values()
            .any(|connection| connection.address == address)
    }

    /// Returns whether a discovery run is active.
    #[must_use]
    pub fn is_discovering(&self) -> bool {
        self.lock().active_discoveries > 0
    }

    /// Returns payloads whose write has started on `address`, in order.
    #[must_use]
    pub fn started_writes(&self, address: &str) -> Vec<Vec<u8>> {
        self.lock()
            .started_writes
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns payloads successfully written to `address`, in order.
    #[must_use]
    pub fn written(&self, address: &str) -> Vec<Vec<u8>> {
        self.lock()
            .completed_writes
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    fn address_of(&self, connection: &ConnectionHandle) -> Result<String, TransportError> {
        self.lock()
            .connections
            .get(&connection.id())
            .map(|open| open.address.clone())
            .ok_or(TransportError::UnknownConnection {
                id: connection.id(),
            })
    }
}

async fn apply(behaviour: Option<Behaviour>) -> Result<(), TransportError> {
    match behaviour {
        None => Ok(()),
        Some(Behaviour::Fail(reason)) => Err(TransportError::Rejected { reason }),
        Some(Behaviour::Hang) => std::future::pending().await,
    }
}

#[async_trait]
impl Transport for FakeTransport {
    #[instrument(skip(self, sink), level = "debug")]
    async fn begin_discovery(
        &self,
        sink: AdvertisementSink,
    ) -> Result<DiscoveryHandle, TransportError> {
        let (advertisements, id) = {
            let mut state = self.lock();
            if let Some(reason) = state.discovery_failure.clone() {
                return Err(TransportError::Rejected { reason });
            }
            state.next_id += 1;
            state.active_discoveries += 1;
            (state.advertisements.clone(), state.next_id)
        };

        let delay = self.discovery_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            for advertisement in advertisements {
                if sink.send(advertisement).is_err() {
                    break;
                }
            }
        });

        info!("using fake BLE discovery");
        Ok(DiscoveryHandle::new(id))
    }

    async fn end_discovery(&self, _handle: DiscoveryHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.active_discoveries = state.active_discoveries.saturating_sub(1);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn open_connection(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let behaviour = self.lock().connection_behaviour.get(address).cloned();
        apply(behaviour).await?;

        let mut state = self.lock();
        state.next_id += 1;
        state.opened += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            FakeConnection {
                address: address.to_string(),
                notifications: None,
            },
        );
        Ok(ConnectionHandle::new(id, address))
    }

    #[instrument(skip(self, notifications), level = "debug", fields(%connection))]
    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        _characteristic: Uuid,
        notifications: NotificationSender,
    ) -> Result<(), TransportError> {
        let address = self.address_of(connection)?;
        let behaviour = self.lock().subscription_behaviour.get(&address).cloned();
        apply(behaviour).await?;

        if let Some(open) = self.lock().connections.get_mut(&connection.id()) {
            open.notifications = Some(notifications.clone());
        }

        let payloads = self.auto_notifications.clone();
        if !payloads.is_empty() {
            tokio::spawn(async move {
                for payload in payloads {
                    if notifications.deliver(payload).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    #[instrument(skip(self, payload), level = "trace", fields(%connection, payload_len = payload.len()))]
    async fn write(
        &self,
        connection: &ConnectionHandle,
        _characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let address = self.address_of(connection)?;
        self.lock()
            .started_writes
            .entry(address.clone())
            .or_default()
            .push(payload.to_vec());

        let mut released = self.writes_released.subscribe();
        if released.wait_for(|released| *released).await.is_err() {
            debug!("write gate closed");
        }

        let mut state = self.lock();
        if let Some(reason) = state
            .write_failures
            .get_mut(&address)
            .and_then(VecDeque::pop_front)
        {
            return Err(TransportError::Rejected { reason });
        }
        state
            .completed_writes
            .entry(address)
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%connection))]
    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.connections.remove(&connection.id()).is_none() {
            return Err(TransportError::UnknownConnection {
                id: connection.id(),
            });
        }
        state.closed += 1;
        Ok(())
    }
}

impl From<ScanFixture> for FakeTransportConfig {
    fn from(fixture: ScanFixture) -> Self {
        Self::builder().advertisements(fixture.into()).build()
    }
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<Advertisement>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture.split(';').map(parse_scan_record).collect()
}

fn parse_scan_record(raw_record: &str) -> Result<Advertisement, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    let [address, name, rssi] = fields.as_slice() else {
        return Err(FixtureError::InvalidRecordFieldCount);
    };
    if address.is_empty() {
        return Err(FixtureError::EmptyAddress);
    }

    let name = match *name {
        "-" | "" => None,
        value => Some(value),
    };
    let rssi = match *rssi {
        "-" | "" => None,
        value => Some(value.parse::<i16>()?),
    };

    Ok(Advertisement::new(*address, name, rssi))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:01|HC-05|-43", 1)]
    #[case("AA:01|HC-05|-43;AA:02|-|-", 2)]
    fn parse_scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let advertisements = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, advertisements.len());
    }

    #[test]
    fn parse_scan_fixture_maps_dash_to_missing_fields() {
        let advertisements = parse_scan_fixture("AA:02|-|-").expect("fixture should parse");
        assert_eq!(vec![Advertisement::new("AA:02", None, None)], advertisements);
    }

    #[rstest]
    #[case("AA:01|HC-05")]
    #[case("AA:01|HC-05|-43|extra")]
    fn parse_scan_fixture_rejects_invalid_field_count(#[case] fixture: &str) {
        let result = parse_scan_fixture(fixture);
        assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount));
    }

    #[test]
    fn parse_scan_fixture_rejects_bad_rssi() {
        let result = parse_scan_fixture("AA:01|HC-05|loud");
        assert_matches!(result, Err(FixtureError::InvalidRssi(_)));
    }

    #[test]
    fn notification_fixture_splits_on_commas() {
        let fixture: NotificationFixture = "temp=21,temp=22".parse().expect("always parses");
        let payloads: Vec<Vec<u8>> = fixture.into();
        assert_eq!(vec![b"temp=21".to_vec(), b"temp=22".to_vec()], payloads);
    }

    #[tokio::test]
    async fn failed_write_is_not_recorded_as_written() {
        let transport = FakeTransport::default();
        let connection = transport
            .open_connection("AA:01")
            .await
            .expect("open should succeed");
        transport.fail_next_write("AA:01", "busy");

        let first = transport
            .write(&connection, Uuid::nil(), b"one")
            .await;
        let second = transport
            .write(&connection, Uuid::nil(), b"two")
            .await;

        assert_matches!(first, Err(TransportError::Rejected { reason }) if reason == "busy");
        assert_matches!(second, Ok(()));
        assert_eq!(vec![b"two".to_vec()], transport.written("AA:01"));
        assert_eq!(2, transport.started_writes("AA:01").len());
    }
}
