use std::fmt::{self, Display, Formatter};

use crate::registry::DeviceRecord;

use super::painter::Painter;
use super::table::Table;

/// Renders scan results as a numbered table.
pub(crate) struct DeviceTableView<'a> {
    devices: &'a [DeviceRecord],
    painter: &'a Painter,
}

impl<'a> DeviceTableView<'a> {
    pub(crate) fn new(devices: &'a [DeviceRecord], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for DeviceTableView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.devices.is_empty() {
            return write!(f, "{}", self.painter.muted("no devices found"));
        }

        writeln!(
            f,
            "{}",
            self.painter
                .heading(format!("found {} device(s)", self.devices.len()))
        )?;
        let rows = self
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                vec![
                    (index + 1).to_string(),
                    self.painter.value(device.address()),
                    device.display_name().to_string(),
                    format_rssi(device.signal_strength()),
                ]
            })
            .collect();
        write!(f, "{}", Table::grid(["#", "address", "name", "rssi"], rows))
    }
}

fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn renders_devices_in_scan_order() {
        let devices = vec![
            DeviceRecord::new("AA:01", Some("HC-05"), Some(-43)),
            DeviceRecord::new("AA:02", None, None),
        ];
        let painter = Painter::new(false);

        assert_snapshot!(DeviceTableView::new(&devices, &painter).to_string(), @r"
        found 2 device(s)
        ╭───┬─────────┬─────────┬─────────╮
        │ # │ address │ name    │ rssi    │
        ├───┼─────────┼─────────┼─────────┤
        │ 1 │ AA:01   │ HC-05   │ -43 dBm │
        │ 2 │ AA:02   │ unknown │ -       │
        ╰───┴─────────┴─────────┴─────────╯
        ");
    }

    #[test]
    fn empty_scan_says_so() {
        let painter = Painter::new(false);
        assert_snapshot!(DeviceTableView::new(&[], &painter).to_string(), @"no devices found");
    }
}
