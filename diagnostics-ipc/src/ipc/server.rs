use super::{Advertise, Listener, Stream, Transport};
use crate::{Error, HandshakeFault, RuntimeEndpoint};
use polling::{Event, Events, Poller};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

/// How often the shutdown flag is checked while waiting for a connection
const TICK: Duration = Duration::from_millis(10);

/// Reverse diagnostics server, which a runtime started with
/// `DOTNET_DiagnosticPorts=<path>` connects back to.
///
/// The server must be created before the runtime is started, otherwise the
/// runtime may try to connect before anyone is listening. The runtime opens a
/// new connection, and advertises itself on it, for every command it serves,
/// so [`Self::accept_one`] is called once per command.
pub struct Server {
    listener: Option<Listener>,
    socket_path: PathBuf,
    /// The first runtime instance that advertised itself to us
    instance: Option<RuntimeEndpoint>,
}

impl Server {
    /// Creates a socket path in `dir` that is unique to this process and the
    /// current time
    pub fn unique_name(dir: impl AsRef<Path>) -> PathBuf {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        dir.as_ref()
            .join(format!("eventpiper-{}-{stamp}.socket", std::process::id()))
    }

    /// Creates a new server listening on the given path.
    ///
    /// This always attempts to delete the specified path first, as a socket
    /// file may be left behind by a previous process that aborted.
    ///
    /// # Errors
    ///
    /// The path is empty, or the listener socket could not be bound to it
    pub fn with_name(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidName);
        }

        let _res = std::fs::remove_file(path);

        let listener = Listener::bind(path)?;
        listener.set_nonblocking(true)?;

        log::debug!("listening for runtimes on {}", path.display());

        Ok(Self {
            listener: Some(listener),
            socket_path: path.to_owned(),
            instance: None,
        })
    }

    /// The path the runtime should connect to
    #[inline]
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// The runtime instance that first advertised itself, if any
    #[inline]
    pub fn instance(&self) -> Option<RuntimeEndpoint> {
        self.instance
    }

    /// Waits for the runtime of process `expected_pid` to connect and
    /// advertise itself.
    ///
    /// Every advertise from the same process is treated as coming from the
    /// same runtime instance, the endpoint returned is always the first one
    /// that was accepted.
    ///
    /// # Errors
    ///
    /// - [`Error::RendezvousTimeout`] if no advertise arrived within `timeout`
    /// - [`Error::Cancelled`] if `shutdown` was set while waiting
    /// - [`Error::HandshakeMismatch`] if the connected peer sent a bad advertise
    ///   or is a different process. The server keeps listening and can be
    ///   used again.
    pub fn accept_one(
        &mut self,
        expected_pid: u32,
        timeout: Duration,
        shutdown: &AtomicBool,
    ) -> Result<(Transport, RuntimeEndpoint), Error> {
        let deadline = Instant::now() + timeout;

        let stream = {
            let listener = self.listener.as_ref().ok_or(Error::InvalidName)?;
            let poller = Poller::new()?;

            // SAFETY: We ensure we delete the listener before the poller is dropped
            #[allow(unsafe_code)]
            unsafe {
                poller.add(listener, Event::readable(0))?;
            }

            let res = wait_for_connection(&poller, listener, deadline, timeout, shutdown);

            if let Err(err) = poller.delete(listener) {
                log::error!("failed to deregister listener: {err}");
            }

            res?
        };

        self.handshake(stream, expected_pid, deadline, timeout)
    }

    fn handshake(
        &mut self,
        stream: Stream,
        expected_pid: u32,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(Transport, RuntimeEndpoint), Error> {
        // Some platforms hand out accepted sockets that inherited the
        // listener's non-blocking mode
        stream.set_nonblocking(false)?;

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        stream.set_read_timeout(Some(remaining))?;

        let mut transport = Transport::from(stream);

        let mut buf = [0u8; Advertise::SIZE];
        super::read_full(&mut transport, &mut buf, "advertise").map_err(|err| match err {
            Error::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Error::RendezvousTimeout(timeout)
            }
            other => other,
        })?;

        transport.set_read_timeout(None)?;

        let advertise = Advertise::decode(&buf)?;

        if advertise.pid != u64::from(expected_pid) {
            return Err(Error::HandshakeMismatch(HandshakeFault::ProcessId {
                expected: expected_pid,
                advertised: advertise.pid,
            }));
        }

        let cookie = advertise.cookie();

        let endpoint = match self.instance {
            Some(first) => {
                if first.cookie != Some(cookie) {
                    log::warn!(
                        "process {expected_pid} advertised cookie {cookie}, keeping the first instance {:?}",
                        first.cookie
                    );
                } else {
                    log::debug!("runtime {cookie} reconnected");
                }

                first
            }
            None => {
                let endpoint = RuntimeEndpoint {
                    pid: expected_pid,
                    cookie: Some(cookie),
                };
                log::debug!("runtime {cookie} of process {expected_pid} connected");
                self.instance = Some(endpoint);
                endpoint
            }
        };

        Ok((transport, endpoint))
    }
}

fn wait_for_connection(
    poller: &Poller,
    listener: &Listener,
    deadline: Instant,
    timeout: Duration,
    shutdown: &AtomicBool,
) -> Result<Stream, Error> {
    let mut events = Events::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(Error::RendezvousTimeout(timeout)),
        };

        events.clear();
        match poller.wait(&mut events, Some(remaining.min(TICK))) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }

        if !events.iter().any(|ev| ev.key == 0) {
            continue;
        }

        match listener.accept() {
            Ok((accepted, _addr)) => return Ok(accepted),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                log::error!("failed to accept socket connection: {err}");
            }
        }

        // We need to reregister interest every time
        poller.modify(listener, Event::readable(0))?;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.listener.take();
        let _res = std::fs::remove_file(&self.socket_path);
    }
}
