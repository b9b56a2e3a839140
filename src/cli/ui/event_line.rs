use serde::Serialize;

use crate::cli::OutputFormat;
use crate::observer::SessionEvent;

use super::painter::Painter;

/// One line of `connect` output.
#[derive(Debug)]
pub(crate) enum EventLine<'a> {
    Session(&'a SessionEvent),
    Sent { address: &'a str, text: &'a str },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventRecord<'a> {
    Connected {
        address: &'a str,
        name: &'a str,
        rssi: Option<i16>,
    },
    ConnectFailed {
        error: String,
    },
    Received {
        address: &'a str,
        text: &'a str,
    },
    ReceiveFailed {
        error: String,
    },
    Disconnected {
        address: &'a str,
    },
    Sent {
        address: &'a str,
        text: &'a str,
    },
}

impl EventLine<'_> {
    /// Renders the line in `format`.
    pub(crate) fn render(
        &self,
        format: OutputFormat,
        painter: &Painter,
    ) -> Result<String, serde_json::Error> {
        match format {
            OutputFormat::Pretty => Ok(self.pretty(painter)),
            OutputFormat::Json => serde_json::to_string(&self.record()),
        }
    }

    fn pretty(&self, painter: &Painter) -> String {
        match self {
            Self::Session(SessionEvent::Connected(device)) => format!(
                "{} connected to {} ({})",
                painter.success("✓"),
                painter.value(device.display_name()),
                device.address()
            ),
            Self::Session(SessionEvent::ConnectFailed(error)) => {
                format!("{} {error}", painter.failure("✗"))
            }
            Self::Session(SessionEvent::Data { text, .. }) => {
                format!("{} {text}", painter.heading("←"))
            }
            Self::Session(SessionEvent::DataError(error)) => {
                format!("{} {error}", painter.warning("!"))
            }
            Self::Session(SessionEvent::Disconnected { address }) => {
                format!("{} disconnected from {address}", painter.muted("•"))
            }
            Self::Sent { text, .. } => format!("{} {text}", painter.muted("→")),
        }
    }

    fn record(&self) -> EventRecord<'_> {
        match self {
            Self::Session(SessionEvent::Connected(device)) => EventRecord::Connected {
                address: device.address(),
                name: device.display_name(),
                rssi: device.signal_strength(),
            },
            Self::Session(SessionEvent::ConnectFailed(error)) => EventRecord::ConnectFailed {
                error: error.to_string(),
            },
            Self::Session(SessionEvent::Data { address, text }) => {
                EventRecord::Received { address, text }
            }
            Self::Session(SessionEvent::DataError(error)) => EventRecord::ReceiveFailed {
                error: error.to_string(),
            },
            Self::Session(SessionEvent::Disconnected { address }) => {
                EventRecord::Disconnected { address }
            }
            Self::Sent { address, text } => EventRecord::Sent { address, text },
        }
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use rstest::rstest;

    use super::*;
    use crate::error::{LinkError, UsageError};
    use crate::registry::DeviceRecord;

    fn render(line: &EventLine<'_>, format: OutputFormat) -> String {
        line.render(format, &Painter::new(false))
            .expect("event lines always serialise")
    }

    #[test]
    fn connected_line_names_device() {
        let event = SessionEvent::Connected(DeviceRecord::new("AA:01", Some("HC-05"), Some(-43)));
        let line = EventLine::Session(&event);

        assert_snapshot!(render(&line, OutputFormat::Pretty), @"✓ connected to HC-05 (AA:01)");
        assert_snapshot!(
            render(&line, OutputFormat::Json),
            @r#"{"event":"connected","address":"AA:01","name":"HC-05","rssi":-43}"#
        );
    }

    #[rstest]
    #[case::received(
        SessionEvent::Data { address: "AA:01".into(), text: "temp=21".into() },
        r#"{"event":"received","address":"AA:01","text":"temp=21"}"#
    )]
    #[case::disconnected(
        SessionEvent::Disconnected { address: "AA:01".into() },
        r#"{"event":"disconnected","address":"AA:01"}"#
    )]
    #[case::connect_failed(
        SessionEvent::ConnectFailed(LinkError::Usage(UsageError::NoTarget)),
        r#"{"event":"connect_failed","error":"no target: no connected device to send to"}"#
    )]
    fn json_lines_are_tagged_by_event(#[case] event: SessionEvent, #[case] expected: &str) {
        pretty_assertions::assert_eq!(expected, render(&EventLine::Session(&event), OutputFormat::Json));
    }

    #[test]
    fn sent_line_echoes_text() {
        let line = EventLine::Sent {
            address: "AA:01",
            text: "hello",
        };
        assert_snapshot!(render(&line, OutputFormat::Pretty), @"→ hello");
    }
}
