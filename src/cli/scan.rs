use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;

use crate::cli::OutputFormat;
use crate::cli::command::parse_duration;
use crate::manager::SessionManager;

use super::ui::{DeviceTableView, Painter, Spinner};

/// Arguments for the `scan` command.
#[derive(Debug, Default, Args)]
pub struct ScanArgs {
    /// Length of the scan window (e.g. `5s`); defaults to ten seconds.
    #[arg(long, value_parser = parse_duration)]
    window: Option<Duration>,
}

impl ScanArgs {
    #[must_use]
    pub fn new(window: Option<Duration>) -> Self {
        Self { window }
    }

    pub(crate) fn window(&self) -> Option<Duration> {
        self.window
    }
}

/// Executes the `scan` command.
pub(crate) async fn run<W>(
    manager: &SessionManager,
    out: &mut W,
    output_format: OutputFormat,
    painter: &Painter,
    spinner: &Spinner,
) -> Result<()>
where
    W: io::Write,
{
    let window = humantime::format_duration(manager.config().scan_window()).to_string();
    let devices = spinner
        .run(&format!("scanning for {window}"), manager.scan_devices())
        .await?;

    match output_format {
        OutputFormat::Pretty => writeln!(out, "{}", DeviceTableView::new(&devices, painter))?,
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(&devices)?)?,
    }
    Ok(())
}
