use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;
use uuid::Uuid;

use crate::cli::connect::ConnectArgs;
use crate::cli::scan::ScanArgs;
use crate::config::SessionConfig;
use crate::error::{CliConfigError, FixtureError};
use crate::transport::{FakeTransportConfig, NotificationFixture, ScanFixture};

/// Command-line options for the BLE serial terminal.
#[derive(Debug, Parser)]
#[command(
    name = "blelink",
    about = "Scan for, connect to, and exchange text with BLE serial bridges."
)]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long = "output", global = true, value_enum)]
    output_format: Option<OutputFormat>,
    /// How long to wait for a connection (e.g. `500ms`, `10s`).
    #[arg(long, global = true, value_parser = parse_duration)]
    connect_timeout: Option<Duration>,
    /// How long to wait for the notification subscription.
    #[arg(long, global = true, value_parser = parse_duration)]
    subscribe_timeout: Option<Duration>,
    /// How long to wait for one write to be accepted.
    #[arg(long, global = true, value_parser = parse_duration)]
    write_timeout: Option<Duration>,
    /// Characteristic that carries inbound notifications.
    #[arg(long, global = true)]
    notify_uuid: Option<Uuid>,
    /// Characteristic that outbound text is written to.
    #[arg(long, global = true)]
    write_uuid: Option<Uuid>,
    /// Uses the in-memory transport with fixture-driven discovery and payloads.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `address|name|rssi;...`; `-` marks a missing field.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Fake notification payloads, comma separated, pushed after every subscription.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationFixture>,
    /// Artificial fake discovery delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use blelink::{Args, Command, ScanArgs};
    ///
    /// let args = Args::new(Command::Scan(ScanArgs::default()));
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output_format: None,
            connect_timeout: None,
            subscribe_timeout: None,
            write_timeout: None,
            notify_uuid: None,
            write_uuid: None,
            fake: false,
            fake_scan: None,
            fake_notifications: None,
            fake_discovery_delay: None,
            command,
        }
    }

    /// Enables fake transport mode with pre-parsed fixtures.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            notifications,
            discovery_delay,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_notifications = notifications;
        self.fake_discovery_delay = Some(discovery_delay);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    /// Builds the session configuration from the timeout and UUID flags.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let window = match &self.command {
            Command::Scan(scan) => scan.window(),
            Command::Connect(_connect) => None,
        };

        SessionConfig::builder()
            .maybe_scan_window(window)
            .maybe_connect_timeout(self.connect_timeout)
            .maybe_subscribe_timeout(self.subscribe_timeout)
            .maybe_write_timeout(self.write_timeout)
            .maybe_notify_characteristic(self.notify_uuid)
            .maybe_write_characteristic(self.write_uuid)
            .build()
    }

    /// Splits parsed CLI arguments into command and optional fake-transport settings.
    ///
    /// # Errors
    ///
    /// Returns an error if fake mode is enabled without a scan fixture.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_notifications,
            fake_discovery_delay,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                notifications: fake_notifications,
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake transport arguments for programmatic runs.
///
/// ```
/// # fn main() -> Result<(), blelink::FixtureError> {
/// let fake = blelink::FakeArgs::builder()
///     .scan_fixture("AA:01|HC-05|-43;AA:02|-|-")?
///     .notifications("hello,world")?
///     .build();
/// let _ = fake;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationFixture>,
    #[builder(default)]
    discovery_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_transport_config(self) -> FakeTransportConfig {
        let Self {
            scan_fixture,
            notifications,
            discovery_delay,
        } = self;

        FakeTransportConfig::builder()
            .advertisements(scan_fixture.into())
            .notifications(notifications.map(Into::into).unwrap_or_default())
            .discovery_delay(discovery_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for one window and list every device seen.
    Scan(ScanArgs),
    /// Connect to one device, send text, and print what it sends back.
    Connect(ConnectArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_args) => "scan",
            Self::Connect(_args) => "connect",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables and coloured lines.
    Pretty,
    /// One JSON document per result or event.
    Json,
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
