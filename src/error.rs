use std::str::Utf8Error;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Errors reported to callers of the session manager.
///
/// Transport failures are translated into this taxonomy at the session
/// boundary, so no backend-specific error type ever reaches a caller.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum LinkError {
    #[error("failed to start device discovery: {reason}")]
    Discovery { reason: String },
    #[error("failed to connect to `{address}`: {reason}")]
    Connection { address: String, reason: String },
    #[error("failed to subscribe to notifications from `{address}`: {reason}")]
    Subscription { address: String, reason: String },
    #[error("failed to write to `{address}`: {reason}")]
    Write { address: String, reason: String },
    #[error("notification from `{address}` is not valid UTF-8")]
    Decode {
        address: String,
        #[source]
        source: Utf8Error,
    },
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl LinkError {
    pub(crate) fn connection(address: &str, reason: impl ToString) -> Self {
        Self::Connection {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn subscription(address: &str, reason: impl ToString) -> Self {
        Self::Subscription {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn write(address: &str, reason: impl ToString) -> Self {
        Self::Write {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Contract violations rejected synchronously by the session manager.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum UsageError {
    #[error("a session for `{address}` is already active")]
    AlreadyConnected { address: String },
    #[error("no target: no connected device to send to")]
    NoTarget,
    #[error("{count} devices are connected; specify a target address")]
    AmbiguousTarget { count: usize },
    #[error("no session exists for `{address}`")]
    UnknownSession { address: String },
    #[error("session for `{address}` is {state}, not ready")]
    NotReady {
        address: String,
        state: SessionState,
    },
    #[error("session for `{address}` is closed")]
    SessionClosed { address: String },
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("session for `{address}` cannot move from {from} to {to}")]
    IllegalTransition {
        address: String,
        from: SessionState,
        to: SessionState,
    },
}

/// Errors raised by a radio transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("no peripheral with address `{address}` has been discovered")]
    UnknownPeripheral { address: String },
    #[error("connection #{id} is not open")]
    UnknownConnection { id: u64 },
    #[error("characteristic {uuid} was not found on `{address}`")]
    MissingCharacteristic { address: String, uuid: uuid::Uuid },
    #[error("{operation} timed out after {}", humantime::format_duration(*limit))]
    TimedOut {
        operation: &'static str,
        limit: Duration,
    },
    #[error("{reason}")]
    Rejected { reason: String },
}

/// Errors returned when parsing fake transport fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain three pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain an empty address")]
    EmptyAddress,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn usage_errors_render_through_link_error() {
        let error = LinkError::from(UsageError::NoTarget);
        assert_eq!("no target: no connected device to send to", error.to_string());
    }

    #[test]
    fn timed_out_renders_humantime_duration() {
        let error = TransportError::TimedOut {
            operation: "connect",
            limit: Duration::from_millis(1500),
        };
        assert_eq!("connect timed out after 1s 500ms", error.to_string());
    }
}
