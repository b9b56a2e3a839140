use std::future::pending;
use std::io;

use anyhow::Result;
use clap::Args;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::OutputFormat;
use crate::manager::{OutboundRequest, SessionManager};
use crate::observer::{ChannelObserver, SessionEvent};

use super::ui::{EventLine, Painter, Spinner};

/// Arguments for the `connect` command.
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Address (or platform peripheral id) of the device to connect to.
    address: String,
    /// Text to send once connected; repeat to send several messages in order.
    #[arg(long = "send", value_name = "TEXT")]
    messages: Vec<String>,
    /// Send every line typed on stdin; end of input disconnects.
    #[arg(long)]
    stdin: bool,
    /// Disconnect after receiving this many messages. If omitted, run until Ctrl+C.
    #[arg(long)]
    max_messages: Option<usize>,
}

impl ConnectArgs {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            messages: Vec::new(),
            stdin: false,
            max_messages: None,
        }
    }

    /// Adds one message to send after connecting.
    #[must_use]
    pub fn send(mut self, text: impl Into<String>) -> Self {
        self.messages.push(text.into());
        self
    }

    #[must_use]
    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    #[must_use]
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = Some(max_messages);
        self
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
enum StopReason {
    #[display("message limit reached")]
    Limit,
    #[display("input closed")]
    EndOfInput,
    #[display("interrupted")]
    Interrupted,
    #[display("link lost")]
    LinkLost,
}

struct Printer<'a, W> {
    out: &'a mut W,
    output_format: OutputFormat,
    painter: &'a Painter,
}

impl<W: io::Write> Printer<'_, W> {
    fn print(&mut self, line: &EventLine<'_>) -> Result<()> {
        writeln!(self.out, "{}", line.render(self.output_format, self.painter)?)?;
        Ok(())
    }
}

/// Executes the `connect` command.
///
/// `input` is read line by line only when `--stdin` was given.
pub(crate) async fn run<W, R>(
    manager: &SessionManager,
    args: &ConnectArgs,
    out: &mut W,
    input: R,
    output_format: OutputFormat,
    painter: &Painter,
    spinner: &Spinner,
) -> Result<()>
where
    W: io::Write,
    R: AsyncBufRead + Unpin,
{
    let mut printer = Printer {
        out,
        output_format,
        painter,
    };
    let (observer, mut events) = ChannelObserver::channel();
    let pending_connect = manager.connect(&args.address, observer)?;
    let outcome = spinner
        .run(
            &format!("connecting to {}", args.address),
            pending_connect.outcome(),
        )
        .await;
    if let Some(event) = events.recv().await {
        printer.print(&EventLine::Session(&event))?;
    }
    let device = outcome?;

    let result = converse(manager, args, &mut printer, &mut events, input).await;
    match &result {
        Ok(reason) => info!(%reason, "ending session"),
        Err(error) => debug!(%error, "ending session after error"),
    }

    manager.disconnect_all().await;
    while let Some(event) = events.recv().await {
        printer.print(&EventLine::Session(&event))?;
    }
    debug!(address = device.address(), "connect command finished");
    result.map(|_reason| ())
}

async fn converse<W, R>(
    manager: &SessionManager,
    args: &ConnectArgs,
    printer: &mut Printer<'_, W>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    input: R,
) -> Result<StopReason>
where
    W: io::Write,
    R: AsyncBufRead + Unpin,
{
    for text in &args.messages {
        send_line(manager, &args.address, text, printer).await?;
    }

    let mut received = 0usize;
    if args.max_messages == Some(0) {
        return Ok(StopReason::Limit);
    }
    let mut lines = args.stdin.then(|| input.lines());
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    return Ok(StopReason::LinkLost);
                };
                printer.print(&EventLine::Session(&event))?;
                match event {
                    SessionEvent::Data { .. } => {
                        received += 1;
                        if args.max_messages.is_some_and(|limit| received >= limit) {
                            return Ok(StopReason::Limit);
                        }
                    }
                    SessionEvent::Disconnected { .. } => return Ok(StopReason::LinkLost),
                    SessionEvent::Connected(_)
                    | SessionEvent::ConnectFailed(_)
                    | SessionEvent::DataError(_) => {}
                }
            }
            maybe_line = next_line(&mut lines), if lines.is_some() => match maybe_line? {
                Some(line) => send_line(manager, &args.address, &line, printer).await?,
                None => return Ok(StopReason::EndOfInput),
            },
            interrupted = &mut interrupt => {
                interrupted?;
                return Ok(StopReason::Interrupted);
            }
        }
    }
}

async fn send_line<W: io::Write>(
    manager: &SessionManager,
    address: &str,
    text: &str,
    printer: &mut Printer<'_, W>,
) -> Result<()> {
    manager
        .send(OutboundRequest::new(text).to(address))
        .await?;
    printer.print(&EventLine::Sent { address, text })
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => pending().await,
    }
}
