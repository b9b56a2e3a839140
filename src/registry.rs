use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::error::{LinkError, UsageError};
use crate::transport::{Advertisement, Transport};

/// Display name used when a peripheral never advertised one.
pub const UNKNOWN_DEVICE_NAME: &str = "unknown";

/// A discovered peripheral, unique by address within one scan.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceRecord {
    address: String,
    display_name: String,
    signal_strength: Option<i16>,
}

impl DeviceRecord {
    /// Creates a record, mapping a missing or blank name to [`UNKNOWN_DEVICE_NAME`].
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        name: Option<&str>,
        signal_strength: Option<i16>,
    ) -> Self {
        Self {
            address: address.into(),
            display_name: display_name(name)
                .unwrap_or(UNKNOWN_DEVICE_NAME)
                .to_string(),
            signal_strength,
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the last-seen RSSI, if any advertisement carried one.
    #[must_use]
    pub fn signal_strength(&self) -> Option<i16> {
        self.signal_strength
    }

    fn absorb(&mut self, advertisement: &Advertisement) {
        if let Some(name) = display_name(advertisement.name()) {
            self.display_name = name.to_string();
        }
        if let Some(rssi) = advertisement.rssi() {
            self.signal_strength = Some(rssi);
        }
    }
}

fn display_name(name: Option<&str>) -> Option<&str> {
    name.map(str::trim).filter(|name| !name.is_empty())
}

#[derive(Debug, Default)]
struct RegistryState {
    records: IndexMap<String, DeviceRecord>,
    scanning: bool,
}

/// Accumulates unique advertisements during scan windows.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a scan window of `window` and returns without waiting for it.
    ///
    /// Prior records are cleared before discovery begins. The returned
    /// [`ScanCompletion`] resolves once, with the ordered snapshot, when the
    /// window closes.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ScanInProgress`] while another window is open and
    /// [`LinkError::Discovery`] when the transport cannot start discovery.
    #[instrument(skip(self, transport), level = "debug", fields(window = %humantime::format_duration(window)))]
    pub async fn start_scan(
        &self,
        transport: Arc<dyn Transport>,
        window: Duration,
    ) -> Result<ScanCompletion, LinkError> {
        {
            let mut state = self.lock();
            if state.scanning {
                return Err(UsageError::ScanInProgress.into());
            }
            state.scanning = true;
            state.records.clear();
        }

        let (advertisement_sender, mut advertisements) = mpsc::unbounded_channel();
        let discovery = match transport.begin_discovery(advertisement_sender).await {
            Ok(handle) => handle,
            Err(error) => {
                self.lock().scanning = false;
                warn!(%error, "failed to start discovery");
                return Err(LinkError::Discovery {
                    reason: error.to_string(),
                });
            }
        };
        info!("scan window opened");

        let (completion_sender, completion) = oneshot::channel();
        let registry = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    maybe_advertisement = advertisements.recv() => match maybe_advertisement {
                        Some(advertisement) => registry.record_advertisement(&advertisement),
                        None => {
                            debug!("advertisement stream ended before the window closed");
                            (&mut deadline).await;
                            break;
                        }
                    },
                }
            }

            if let Err(error) = transport.end_discovery(discovery).await {
                debug!(%error, "failed to end discovery cleanly");
            }
            while let Ok(advertisement) = advertisements.try_recv() {
                registry.record_advertisement(&advertisement);
            }

            let devices = registry.finish_scan();
            info!(device_count = devices.len(), "scan window closed");
            if completion_sender.send(devices).is_err() {
                debug!("scan completion receiver dropped");
            }
        });

        Ok(ScanCompletion { completion })
    }

    /// Records one advertisement, inserting unseen addresses in first-seen order.
    pub fn record_advertisement(&self, advertisement: &Advertisement) {
        let mut state = self.lock();
        match state.records.get_mut(advertisement.address()) {
            Some(record) => record.absorb(advertisement),
            None => {
                debug!(
                    address = advertisement.address(),
                    name = advertisement.name(),
                    "discovered device"
                );
                let record = DeviceRecord::new(
                    advertisement.address(),
                    advertisement.name(),
                    advertisement.rssi(),
                );
                state
                    .records
                    .insert(advertisement.address().to_string(), record);
            }
        }
    }

    /// Returns the records collected so far, in first-seen order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Returns the record for `address`, if it was seen in the latest scan.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<DeviceRecord> {
        self.lock().records.get(address).cloned()
    }

    /// Returns whether a scan window is currently open.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    fn finish_scan(&self) -> Vec<DeviceRecord> {
        let mut state = self.lock();
        state.scanning = false;
        state.records.values().cloned().collect()
    }
}

/// Pending result of a scan window.
#[derive(Debug)]
pub struct ScanCompletion {
    completion: oneshot::Receiver<Vec<DeviceRecord>>,
}

impl ScanCompletion {
    /// Waits for the window to close and returns the discovered devices.
    pub async fn devices(self) -> Vec<DeviceRecord> {
        self.completion.await.unwrap_or_default()
    }
}
