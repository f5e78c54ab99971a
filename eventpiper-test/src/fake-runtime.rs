//! Stands in for a .NET runtime that was started with `DOTNET_DiagnosticPorts`
//! pointing at us, and that suspends until it is resumed.

use anyhow::Context as _;
use clap::Parser;
use diagnostics_ipc::{
    Advertise, IpcMessage, Transport,
    ipc::{self, command_set, event_pipe, process, response},
};
use eventpiper_test::{SESSION_ID, exception_trace, parse_thrown};
use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    time::Duration,
};

#[derive(Parser)]
struct Command {
    /// An exception to throw once resumed, as <type>:<message>
    #[clap(long = "throw", value_parser = parse_thrown)]
    thrown: Vec<(String, String)>,
    /// Keeps the stream open until the other end closes it
    #[clap(long)]
    hold: bool,
    /// Declares the payload layout of exception events in their metadata
    #[clap(long)]
    declare_fields: bool,
    /// Advertises a process id other than our own
    #[clap(long)]
    wrong_pid: bool,
    /// Never connects to the diagnostics server
    #[clap(long)]
    never_connect: bool,
}

fn connect(path: &str, pid: u32, cookie: uuid::Uuid) -> anyhow::Result<Transport> {
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("failed to connect to {path}"))?;
    stream.write_all(&Advertise::new(pid, cookie).encode()?)?;
    Ok(Transport::from(stream))
}

fn expect_command(transport: &mut Transport, set: u8, id: u8) -> anyhow::Result<IpcMessage> {
    let request = ipc::receive(transport)?;
    anyhow::ensure!(
        (request.command_set, request.command_id) == (set, id),
        "expected command {set:#04x}/{id:#04x} but received {:#04x}/{:#04x}",
        request.command_set,
        request.command_id
    );
    Ok(request)
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let pid = std::process::id();

    if cmd.never_connect {
        std::thread::sleep(Duration::from_secs(60));
        return Ok(());
    }

    let ports = std::env::var(eventpiper::DIAGNOSTIC_PORTS_VAR)
        .context("not launched with a diagnostics port")?;
    // Options such as `,suspend` follow the address
    let (path, options) = ports.split_once(',').unwrap_or((ports.as_str(), ""));
    anyhow::ensure!(
        options.split(',').any(|opt| opt == "suspend"),
        "expected to be suspended until resumed, but the port options are '{options}'"
    );

    let advertised = if cmd.wrong_pid { pid.wrapping_add(1) } else { pid };
    let cookie = uuid::Uuid::from_u128(u128::from(pid) << 64 | 0xc00c1e);

    let mut stream = connect(path, advertised, cookie)?;
    expect_command(&mut stream, command_set::EVENT_PIPE, event_pipe::COLLECT_TRACING_2)?;
    ipc::send(
        &mut stream,
        &IpcMessage::new(command_set::SERVER, response::OK, SESSION_ID.to_le_bytes()),
    )?;

    // Nothing is emitted until we are resumed
    let mut control = connect(path, advertised, cookie)?;
    expect_command(&mut control, command_set::PROCESS, process::RESUME_RUNTIME)?;
    ipc::send(
        &mut control,
        &IpcMessage::new(command_set::SERVER, response::OK, 0u32.to_le_bytes()),
    )?;
    drop(control);

    let trace = exception_trace(pid, &cmd.thrown, cmd.declare_fields);
    if cmd.hold {
        stream.write_all(&trace.into_bytes())?;

        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    } else {
        stream.write_all(&trace.finish())?;
    }

    Ok(())
}
