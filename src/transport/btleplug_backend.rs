use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{Advertisement, AdvertisementSink, ConnectionHandle, DiscoveryHandle, Transport};
use crate::error::TransportError;
use crate::notification::NotificationSender;

/// Transport backed by the host's BLE adapters through `btleplug`.
///
/// Peripheral identifiers reported by `btleplug` are used as addresses, since
/// some platforms hide the hardware address.
#[derive(Debug)]
pub struct BtleplugTransport {
    manager: Manager,
    next_id: AtomicU64,
    discoveries: Mutex<HashMap<u64, DiscoveryRun>>,
    connections: Mutex<HashMap<u64, OpenConnection>>,
}

#[derive(Debug)]
struct DiscoveryRun {
    adapters: Vec<Adapter>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct OpenConnection {
    adapter: Adapter,
    peripheral: Peripheral,
    notifications: Option<CancellationToken>,
}

impl BtleplugTransport {
    /// Creates the real BLE transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform BLE manager cannot be created.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        Ok(Self {
            manager,
            next_id: AtomicU64::new(1),
            discoveries: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, OpenConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn discoveries(&self) -> MutexGuard<'_, HashMap<u64, DiscoveryRun>> {
        self.discoveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self), level = "trace")]
    async fn adapters(&self) -> Result<Vec<Adapter>, TransportError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::NoAdapters);
        }
        Ok(adapters)
    }

    fn peripheral_for(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<(Adapter, Peripheral), TransportError> {
        self.connections()
            .get(&connection.id())
            .map(|open| (open.adapter.clone(), open.peripheral.clone()))
            .ok_or(TransportError::UnknownConnection {
                id: connection.id(),
            })
    }

    async fn find_peripheral(&self, address: &str) -> Result<(Adapter, Peripheral), TransportError> {
        for adapter in self.adapters().await? {
            for peripheral in adapter.peripherals().await? {
                if peripheral_matches(&peripheral, address).await {
                    return Ok((adapter, peripheral));
                }
            }
        }

        Err(TransportError::UnknownPeripheral {
            address: address.to_string(),
        })
    }
}

async fn peripheral_matches(peripheral: &Peripheral, address: &str) -> bool {
    if peripheral.id().to_string().eq_ignore_ascii_case(address) {
        return true;
    }

    match peripheral.properties().await {
        Ok(Some(properties)) => properties.address.to_string().eq_ignore_ascii_case(address),
        Ok(None) => false,
        Err(error) => {
            trace!(?error, "failed to read peripheral properties while matching");
            false
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    #[instrument(skip(self, sink), level = "debug")]
    async fn begin_discovery(
        &self,
        sink: AdvertisementSink,
    ) -> Result<DiscoveryHandle, TransportError> {
        let adapters = self.adapters().await?;
        let cancel = CancellationToken::new();

        for adapter in &adapters {
            let events = adapter.events().await?;
            adapter.start_scan(ScanFilter::default()).await?;
            let adapter_name = adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_error| "unknown".to_string());
            info!(adapter = %adapter_name, "started BLE scan");
            tokio::spawn(forward_advertisements(
                adapter.clone(),
                events,
                sink.clone(),
                cancel.clone(),
            ));
        }

        let id = self.allocate_id();
        self.discoveries()
            .insert(id, DiscoveryRun { adapters, cancel });
        Ok(DiscoveryHandle::new(id))
    }

    #[instrument(skip(self), level = "debug", fields(%handle))]
    async fn end_discovery(&self, handle: DiscoveryHandle) -> Result<(), TransportError> {
        let Some(run) = self.discoveries().remove(&handle.id()) else {
            return Ok(());
        };
        run.cancel.cancel();

        let mut first_error = None;
        for adapter in &run.adapters {
            if let Err(error) = adapter.stop_scan().await {
                debug!(?error, "failed to stop adapter scan cleanly");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn open_connection(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let (adapter, peripheral) = self.find_peripheral(address).await?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        let mut rollback = LinkRollback::new(disconnect_quietly(peripheral.clone()));
        if let Err(error) = peripheral.discover_services().await {
            rollback.run().await;
            return Err(error.into());
        }
        rollback.disarm();

        let id = self.allocate_id();
        self.connections().insert(
            id,
            OpenConnection {
                adapter,
                peripheral,
                notifications: None,
            },
        );
        info!(id, "peripheral connected");
        Ok(ConnectionHandle::new(id, address))
    }

    #[instrument(skip(self, notifications), level = "debug", fields(%connection, %characteristic))]
    async fn subscribe(
        &self,
        connection: &ConnectionHandle,
        characteristic: Uuid,
        notifications: NotificationSender,
    ) -> Result<(), TransportError> {
        let (adapter, peripheral) = self.peripheral_for(connection)?;
        let target = find_characteristic(&peripheral, connection.address(), characteristic)?;

        let stream = peripheral.notifications().await?;
        let events = adapter.events().await?;
        peripheral.subscribe(&target).await?;

        let cancel = CancellationToken::new();
        if let Some(open) = self.connections().get_mut(&connection.id()) {
            if let Some(previous) = open.notifications.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        tokio::spawn(async move {
            let peripheral_id = peripheral.id();
            let mut stream = stream;
            let mut events = events;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe_notification = stream.next() => match maybe_notification {
                        Some(notification) => {
                            if notification.uuid != characteristic {
                                continue;
                            }
                            if notifications.deliver(notification.value).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("notification stream closed");
                            break;
                        }
                    },
                    maybe_event = events.next() => match maybe_event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("peripheral reported disconnect");
                            break;
                        }
                        Some(_other) => {}
                        None => break,
                    },
                }
            }
            drop(notifications);
        });

        Ok(())
    }

    #[instrument(skip(self, payload), level = "trace", fields(%connection, %characteristic, payload_len = payload.len()))]
    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let (_adapter, peripheral) = self.peripheral_for(connection)?;
        let target = find_characteristic(&peripheral, connection.address(), characteristic)?;
        let write_type =
            write_type_for_characteristic(target.properties).ok_or_else(|| {
                TransportError::Rejected {
                    reason: format!("characteristic {characteristic} is not writable"),
                }
            })?;

        peripheral.write(&target, payload, write_type).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%connection))]
    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let open = self.connections().remove(&connection.id()).ok_or(
            TransportError::UnknownConnection {
                id: connection.id(),
            },
        )?;
        if let Some(cancel) = open.notifications {
            cancel.cancel();
        }

        if open.peripheral.is_connected().await? {
            open.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

/// Undoes a half-finished connect unless disarmed.
///
/// Dropping an armed rollback, e.g. when a connect timeout cancels
/// `open_connection`, spawns the undo on the current runtime.
struct LinkRollback {
    undo: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl LinkRollback {
    fn new(undo: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            undo: Some(Box::pin(undo)),
        }
    }

    async fn run(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo.await;
        }
    }

    fn disarm(&mut self) {
        self.undo = None;
    }
}

impl Drop for LinkRollback {
    fn drop(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(undo);
            }
            Err(_error) => warn!("no runtime to release a half-open connection"),
        }
    }
}

async fn disconnect_quietly(peripheral: Peripheral) {
    if let Err(error) = peripheral.disconnect().await {
        debug!(?error, "failed to release half-open connection");
    }
}

async fn forward_advertisements(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn tokio_stream::Stream<Item = CentralEvent> + Send>>,
    sink: AdvertisementSink,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            maybe_event = events.next() => match maybe_event {
                Some(event) => event,
                None => break,
            },
        };

        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _other => continue,
        };
        match advertisement_for(&adapter, &id).await {
            Some(advertisement) => {
                if sink.send(advertisement).is_err() {
                    break;
                }
            }
            None => trace!(?id, "peripheral has no properties yet"),
        }
    }
}

async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(error) => {
            warn!(?error, "failed to look up discovered peripheral");
            return None;
        }
    };
    let properties = peripheral.properties().await.ok().flatten()?;

    Some(Advertisement::new(
        peripheral.id().to_string(),
        properties.local_name.as_deref(),
        properties.rssi,
    ))
}

fn find_characteristic(
    peripheral: &Peripheral,
    address: &str,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or_else(|| TransportError::MissingCharacteristic {
            address: address.to_string(),
            uuid,
        })
}

/// Prefers acknowledged writes so completion means the peripheral accepted the data.
fn write_type_for_characteristic(properties: CharPropFlags) -> Option<WriteType> {
    if properties.contains(CharPropFlags::WRITE) {
        return Some(WriteType::WithResponse);
    }
    if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        return Some(WriteType::WithoutResponse);
    }
    None
}
