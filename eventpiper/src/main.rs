use clap::Parser;
use eventpiper::{ConsoleSink, Interrupt, Options, Outcome, Target};
use std::{ffi::OsString, time::Duration};
use tracing_subscriber::EnvFilter;

/// Prints the exceptions a .NET process throws, as it throws them
#[derive(Parser)]
#[clap(version)]
struct Command {
    /// Size of the runtime's event buffer, in megabytes
    #[clap(long, default_value_t = 256)]
    buffer_size: u32,
    /// Seconds a launched program has to connect back before it is killed
    #[clap(long, default_value_t = 30)]
    connect_timeout: u64,
    /// Requests rundown events when the session ends
    #[clap(long)]
    rundown: bool,
    /// The id of a running process, or a program and its arguments
    #[clap(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PID | PROGRAM [ARGS]..."
    )]
    target: Vec<OsString>,
}

fn main() {
    // Before anything else spawns a thread
    let interrupt = match Interrupt::install() {
        Ok(interrupt) => interrupt,
        Err(err) => {
            eprintln!("failed to install the interrupt handler: {err}");
            std::process::exit(1);
        }
    };

    let cmd = Command::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
                .with_env_var("EVENTPIPER_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match real_main(cmd, &interrupt) {
        Ok(outcome) => {
            log::debug!("trace ended: {outcome:?}");
        }
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(1);
        }
    }
}

fn real_main(cmd: Command, interrupt: &Interrupt) -> anyhow::Result<Outcome> {
    let target = Target::parse(cmd.target)?;

    let mut options = Options {
        connect_timeout: Duration::from_secs(cmd.connect_timeout),
        ..Default::default()
    };
    options.session.circular_buffer_mb = cmd.buffer_size;
    options.session.request_rundown = cmd.rundown;

    eventpiper::run(target, &options, interrupt, &mut ConsoleSink::stdout())
}
