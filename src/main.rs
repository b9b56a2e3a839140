use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use blelink::{Args, OutputFormat, RunOptions, Transport, fake_transport, real_transport};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let interactive = stdout.is_terminal();
        let output_format = args.output_format().unwrap_or(if interactive {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        });
        let options = RunOptions::builder()
            .session_config(args.session_config())
            .output_format(output_format)
            .interactive(interactive)
            .maybe_log_level(args.log_level())
            .build();
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let transport: Arc<dyn Transport> = match maybe_fake_args {
            Some(fake_args) => fake_transport(fake_args),
            None => real_transport().await?,
        };

        blelink::run_with_transport(command, &mut stdout, transport, options).await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
