use std::time::Duration;

use bon::Builder;
use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/// Default length of a scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);
/// Default bound on opening a transport connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on subscribing to the notify characteristic.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on a single outbound write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of inbound notifications buffered per session.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// Short UUID of the serial-bridge notify characteristic.
pub const SERIAL_NOTIFY_UUID16: u16 = 0xFFE0;
/// Short UUID of the serial-bridge write characteristic.
pub const SERIAL_WRITE_UUID16: u16 = 0xFFE1;

/// Timeouts, window length, and characteristic identifiers used by sessions.
///
/// ```
/// use std::time::Duration;
///
/// let config = blelink::SessionConfig::builder()
///     .scan_window(Duration::from_secs(3))
///     .build();
/// assert_eq!(Duration::from_secs(3), config.scan_window());
/// assert_eq!(blelink::DEFAULT_WRITE_TIMEOUT, config.write_timeout());
/// ```
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    #[builder(default = DEFAULT_SCAN_WINDOW)]
    scan_window: Duration,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    #[builder(default = DEFAULT_SUBSCRIBE_TIMEOUT)]
    subscribe_timeout: Duration,
    #[builder(default = DEFAULT_WRITE_TIMEOUT)]
    write_timeout: Duration,
    #[builder(default = DEFAULT_NOTIFICATION_CAPACITY)]
    notification_capacity: usize,
    #[builder(default = uuid_from_u16(SERIAL_NOTIFY_UUID16))]
    notify_characteristic: Uuid,
    #[builder(default = uuid_from_u16(SERIAL_WRITE_UUID16))]
    write_characteristic: Uuid,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn scan_window(&self) -> Duration {
        self.scan_window
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn subscribe_timeout(&self) -> Duration {
        self.subscribe_timeout
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Returns the per-session inbound buffer size, never less than one.
    #[must_use]
    pub fn notification_capacity(&self) -> usize {
        self.notification_capacity.max(1)
    }

    #[must_use]
    pub fn notify_characteristic(&self) -> Uuid {
        self.notify_characteristic
    }

    #[must_use]
    pub fn write_characteristic(&self) -> Uuid {
        self.write_characteristic
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_use_serial_bridge_characteristics() {
        let config = SessionConfig::default();

        assert_eq!(
            "0000ffe0-0000-1000-8000-00805f9b34fb",
            config.notify_characteristic().to_string()
        );
        assert_eq!(
            "0000ffe1-0000-1000-8000-00805f9b34fb",
            config.write_characteristic().to_string()
        );
        assert_eq!(DEFAULT_SCAN_WINDOW, config.scan_window());
    }

    #[test]
    fn zero_notification_capacity_is_clamped() {
        let config = SessionConfig::builder().notification_capacity(0).build();
        assert_eq!(1, config.notification_capacity());
    }
}
