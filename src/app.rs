use std::io;
use std::sync::Arc;

use anyhow::Result;
use bon::Builder;
use tokio::io::{AsyncRead, BufReader};
use tracing::instrument;

use crate::cli::ui::{Painter, Spinner};
use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::config::SessionConfig;
use crate::manager::SessionManager;
use crate::telemetry;
use crate::transport::{BtleplugTransport, FakeTransport, Transport};

/// Creates the transport backed by the host's BLE adapters.
///
/// # Errors
///
/// Returns an error if the platform BLE manager cannot be created.
pub async fn real_transport() -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(BtleplugTransport::new().await?))
}

/// Creates an in-memory transport driven by fake fixtures.
#[must_use]
pub fn fake_transport(fake_args: FakeArgs) -> Arc<FakeTransport> {
    Arc::new(FakeTransport::new(fake_args.into_transport_config()))
}

/// Process-level settings for one CLI run.
#[derive(Debug, Clone, Builder)]
pub struct RunOptions {
    #[builder(default)]
    session_config: SessionConfig,
    #[builder(default = OutputFormat::Json)]
    output_format: OutputFormat,
    /// Whether stdout and stderr are attached to a terminal.
    #[builder(default)]
    interactive: bool,
    log_level: Option<LogLevel>,
}

/// Runs one CLI command against `transport`, reading `--stdin` lines from the process stdin.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = blelink::Args::try_parse_from([
///     "blelink",
///     "--fake",
///     "--fake-scan",
///     "AA:01|HC-05|-43",
///     "scan",
///     "--window",
///     "10ms",
/// ])?;
/// let options = blelink::RunOptions::builder()
///     .session_config(args.session_config())
///     .build();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let transport: std::sync::Arc<dyn blelink::Transport> = match maybe_fake_args {
///     Some(fake_args) => blelink::fake_transport(fake_args),
///     None => blelink::real_transport().await?,
/// };
/// let mut out = Vec::new();
/// blelink::run_with_transport(command, &mut out, transport, options).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, a BLE operation fails, or
/// output writing fails.
pub async fn run_with_transport<W>(
    command: Command,
    out: &mut W,
    transport: Arc<dyn Transport>,
    options: RunOptions,
) -> Result<()>
where
    W: io::Write,
{
    run_with_io(command, out, tokio::io::stdin(), transport, options).await
}

/// Runs one CLI command with injected output, input, and transport.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, a BLE operation fails, or
/// output writing fails.
#[instrument(
    skip(out, input, transport, options),
    level = "info",
    fields(command = command.name(), output = ?options.output_format)
)]
pub async fn run_with_io<W, R>(
    command: Command,
    out: &mut W,
    input: R,
    transport: Arc<dyn Transport>,
    options: RunOptions,
) -> Result<()>
where
    W: io::Write,
    R: AsyncRead + Unpin,
{
    telemetry::initialise_tracing(
        env!("CARGO_PKG_NAME"),
        options.interactive,
        options.log_level.map(LogLevel::as_level_filter),
    )?;

    let pretty = options.output_format == OutputFormat::Pretty;
    let painter = Painter::new(pretty && options.interactive);
    let spinner = Spinner::new(pretty && options.interactive);
    let manager = SessionManager::new(transport, options.session_config);

    match command {
        Command::Scan(_args) => {
            crate::cli::scan::run(&manager, out, options.output_format, &painter, &spinner).await
        }
        Command::Connect(args) => {
            crate::cli::connect::run(
                &manager,
                &args,
                out,
                BufReader::new(input),
                options.output_format,
                &painter,
                &spinner,
            )
            .await
        }
    }
}
