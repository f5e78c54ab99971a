use anyhow::Context as _;
use diagnostics_ipc::{ControlPath, Server, SessionConfig, TraceSession, resume_runtime};
use std::{
    ffi::OsStr,
    process::{Child, Command},
    sync::atomic::AtomicBool,
    time::Duration,
};

/// The variable that tells a runtime where to connect during startup. Unless
/// told otherwise the runtime suspends until it is resumed over that
/// connection.
pub const DIAGNOSTIC_PORTS_VAR: &str = "DOTNET_DiagnosticPorts";

/// A program launched under a trace session
pub struct Launched {
    pub child: Child,
    pub session: TraceSession,
    /// Removes the socket once the runtime has connected
    _server: Server,
}

/// Spawns `program` with a diagnostics server for it to connect back to, then
/// starts a trace session and lets the runtime continue.
///
/// If anything goes wrong before the runtime is resumed the child is killed.
pub fn launch<S: AsRef<OsStr>>(
    program: &OsStr,
    args: &[S],
    config: &SessionConfig,
    connect_timeout: Duration,
    shutdown: &AtomicBool,
) -> anyhow::Result<Launched> {
    let mut server = Server::with_name(Server::unique_name(std::env::temp_dir()))
        .context("failed to create the diagnostics server")?;

    // The runtime must not run any managed code until it is resumed
    let mut ports = server.path().as_os_str().to_owned();
    ports.push(",suspend");

    let mut child = Command::new(program)
        .args(args)
        .env(DIAGNOSTIC_PORTS_VAR, ports)
        .spawn()
        .with_context(|| format!("failed to launch '{}'", program.to_string_lossy()))?;

    log::debug!(
        "launched pid {}, waiting on {}",
        child.id(),
        server.path().display()
    );

    match start(&mut server, child.id(), config, connect_timeout, shutdown) {
        Ok(session) => Ok(Launched {
            child,
            session,
            _server: server,
        }),
        Err(err) => {
            if is_cancelled(&err) {
                log::info!(
                    "interrupted before pid {} was resumed, killing it",
                    child.id()
                );
            }

            if let Err(kill_err) = child.kill() {
                log::warn!("failed to kill pid {}: {kill_err}", child.id());
            }
            let _ = child.wait();
            Err(err)
        }
    }
}

fn start(
    server: &mut Server,
    pid: u32,
    config: &SessionConfig,
    connect_timeout: Duration,
    shutdown: &AtomicBool,
) -> anyhow::Result<TraceSession> {
    // Each connection carries a single command, the first one becomes the
    // trace stream
    let (transport, endpoint) = server
        .accept_one(pid, connect_timeout, shutdown)
        .context("the runtime did not connect to the diagnostics server")?;

    if let Some(cookie) = endpoint.cookie {
        log::debug!("runtime {pid} connected, instance {cookie}");
    }

    // The runtime can only be stopped by closing its connection, it never
    // listens for new ones while connected to us
    let session = TraceSession::start(transport, config, ControlPath::None)
        .context("failed to start the trace session")?;

    let (mut transport, _) = server
        .accept_one(pid, connect_timeout, shutdown)
        .context("the runtime did not reconnect to be resumed")?;

    resume_runtime(&mut transport).context("failed to resume the runtime")?;
    transport.close();

    Ok(session)
}

/// Whether `err` is the rendezvous being cancelled by an interrupt
pub(crate) fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<diagnostics_ipc::Error>(),
        Some(diagnostics_ipc::Error::Cancelled)
    )
}
