//! EventPipe trace sessions.
//!
//! A session is started by sending `CollectTracing2` over a [`Transport`].
//! Once the runtime acknowledges it, that connection no longer carries IPC
//! messages, every following byte is part of the `Nettrace` stream, which is
//! read through the [`TraceSession`]'s [`Read`] implementation.

use crate::{
    Error,
    ipc::{self, Client, IpcMessage, Transport, command_set, event_pipe, process},
};
use scroll::{LE, Pread};
use std::{
    io::{self, Read},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// The provider the runtime emits its own events through
pub const CLR_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";
/// Keyword of [`CLR_PROVIDER`] that enables exception events
pub const EXCEPTION_KEYWORD: u64 = 0x8000;

/// The only stream format we understand
const NETTRACE_FORMAT: u32 = 1;
/// How long a stop request may take before we give up on it and just close
/// the stream
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum EventLevel {
    LogAlways = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

/// A subscription to the events of a single provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub level: EventLevel,
    /// Bitmask of the event categories to enable
    pub keywords: u64,
    /// Provider specific filter arguments, eg. `Key1=Value1;Key2=Value2`
    pub filter: Option<String>,
}

impl Provider {
    #[inline]
    pub fn new(name: impl Into<String>, level: EventLevel, keywords: u64) -> Self {
        Self {
            name: name.into(),
            level,
            keywords,
            filter: None,
        }
    }
}

/// The parameters a session is started with
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Size of the runtime's in-process event buffer, in megabytes
    pub circular_buffer_mb: u32,
    /// Whether the runtime should emit rundown events when the session ends
    pub request_rundown: bool,
    pub providers: Vec<Provider>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            circular_buffer_mb: 256,
            request_rundown: false,
            providers: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// A session that only receives the runtime's exception events
    pub fn exceptions() -> Self {
        Self {
            providers: vec![Provider::new(
                CLR_PROVIDER,
                EventLevel::Informational,
                EXCEPTION_KEYWORD,
            )],
            ..Default::default()
        }
    }

    /// Encodes the `CollectTracing2` payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.circular_buffer_mb.to_le_bytes());
        buf.extend_from_slice(&NETTRACE_FORMAT.to_le_bytes());
        buf.push(u8::from(self.request_rundown));
        buf.extend_from_slice(&(self.providers.len() as u32).to_le_bytes());

        for provider in &self.providers {
            buf.extend_from_slice(&provider.keywords.to_le_bytes());
            buf.extend_from_slice(&(provider.level as u32).to_le_bytes());
            write_string(&mut buf, Some(&provider.name));
            write_string(&mut buf, provider.filter.as_deref());
        }

        buf
    }
}

/// Strings are a character count, including the terminator, followed by
/// NUL terminated UTF-16. A missing string is encoded as a count of 0.
fn write_string(buf: &mut Vec<u8>, s: Option<&str>) {
    let Some(s) = s.filter(|s| !s.is_empty()) else {
        buf.extend_from_slice(&0u32.to_le_bytes());
        return;
    };

    let units: Vec<u16> = s.encode_utf16().chain(std::iter::once(0)).collect();
    buf.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

/// How a session can be asked to stop, other than by closing its stream
#[derive(Clone, Debug)]
pub enum ControlPath {
    /// Closing the stream is the only option, eg. when the runtime connected
    /// back to us and we can't open new connections to it
    None,
    /// A `StopTracing` command is sent over a new connection
    Connect(Client),
}

struct StopState {
    stopped: AtomicBool,
    session_id: u64,
    /// Taken by the first stop
    transport: parking_lot::Mutex<Option<Transport>>,
    control: ControlPath,
}

/// Stops a [`TraceSession`], from any thread.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    fn new(session_id: u64, transport: Transport, control: ControlPath) -> Self {
        Self {
            inner: Arc::new(StopState {
                stopped: AtomicBool::new(false),
                session_id,
                transport: parking_lot::Mutex::new(Some(transport)),
                control,
            }),
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops the session.
    ///
    /// A read blocked on the session's stream returns end of file. Only the
    /// first call does anything.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);

        let Some(transport) = self.inner.transport.lock().take() else {
            return;
        };

        if let ControlPath::Connect(client) = &self.inner.control {
            match stop_tracing(client, self.inner.session_id) {
                Ok(()) => log::debug!("stopped session {:#x}", self.inner.session_id),
                Err(err) => log::warn!(
                    "failed to request stop of session {:#x}: {err}",
                    self.inner.session_id
                ),
            }
        }

        transport.close();
    }
}

/// A live EventPipe session, reading from it yields the `Nettrace` stream
pub struct TraceSession {
    id: u64,
    transport: Transport,
    stop: StopHandle,
}

impl TraceSession {
    /// Starts a session over `transport`
    ///
    /// # Errors
    ///
    /// The runtime rejected the session, or did not respond with a valid
    /// message
    pub fn start(
        mut transport: Transport,
        config: &SessionConfig,
        control: ControlPath,
    ) -> Result<Self, Error> {
        let request = IpcMessage::new(
            command_set::EVENT_PIPE,
            event_pipe::COLLECT_TRACING_2,
            config.encode(),
        );

        ipc::send(&mut transport, &request)?;
        let response = ipc::receive(&mut transport)?;
        let payload = ipc::expect_ok(response, "collect tracing")?;

        let id: u64 = payload.pread_with(0, LE).map_err(|_err| {
            Error::ProtocolFraming("collect tracing response is missing the session id".into())
        })?;

        log::debug!("started session {id:#x}");

        let stop = StopHandle::new(id, transport.try_clone()?, control);

        Ok(Self { id, transport, stop })
    }

    /// The id the runtime assigned to this session
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    #[inline]
    pub fn stop(&self) {
        self.stop.stop();
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

impl Read for TraceSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stop.is_stopped() {
            return Ok(0);
        }

        match self.transport.read(buf) {
            Ok(read) => Ok(read),
            Err(err) if self.stop.is_stopped() => {
                log::debug!("read failed after stop: {err}");
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }
}

/// Lets a runtime that was started suspended, waiting for a diagnostics
/// client, continue
pub fn resume_runtime(transport: &mut Transport) -> Result<(), Error> {
    let request = IpcMessage::new(command_set::PROCESS, process::RESUME_RUNTIME, Vec::new());
    ipc::send(transport, &request)?;

    let response = ipc::receive(transport)?;
    let payload = ipc::expect_ok(response, "resume runtime")?;

    if let Ok(status) = payload.pread_with::<u32>(0, LE) {
        if status != 0 {
            return Err(Error::SessionRejected {
                command: "resume runtime",
                status,
            });
        }
    }

    Ok(())
}

fn stop_tracing(client: &Client, session_id: u64) -> Result<(), Error> {
    let mut transport = client.connect()?;
    transport.set_read_timeout(Some(STOP_TIMEOUT))?;

    let request = IpcMessage::new(
        command_set::EVENT_PIPE,
        event_pipe::STOP_TRACING,
        session_id.to_le_bytes(),
    );
    ipc::send(&mut transport, &request)?;

    let response = ipc::receive(&mut transport)?;
    ipc::expect_ok(response, "stop tracing")?;
    transport.close();

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ipc::response;
    use std::io::Write;

    fn respond(transport: &mut Transport, id: u8, payload: &[u8]) {
        ipc::send(
            transport,
            &IpcMessage::new(command_set::SERVER, id, payload.to_vec()),
        )
        .unwrap();
    }

    #[test]
    fn collect_tracing_payload() {
        let encoded = SessionConfig::exceptions().encode();

        let mut expected = Vec::new();
        expected.extend_from_slice(&256u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(0);
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&0x8000u64.to_le_bytes());
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(&(CLR_PROVIDER.len() as u32 + 1).to_le_bytes());
        for c in CLR_PROVIDER.encode_utf16() {
            expected.extend_from_slice(&c.to_le_bytes());
        }
        expected.extend_from_slice(&[0, 0]);
        expected.extend_from_slice(&0u32.to_le_bytes());

        assert_eq!(encoded, expected);
    }

    #[test]
    fn provider_filter() {
        let mut config = SessionConfig::default();
        let mut provider = Provider::new("P", EventLevel::Verbose, u64::MAX);
        provider.filter = Some("A=1".into());
        config.providers.push(provider);

        let encoded = config.encode();
        // "P" + NUL, then "A=1" + NUL
        let tail = &encoded[encoded.len() - (4 + 8)..];
        assert_eq!(&tail[..4], &4u32.to_le_bytes());
        assert_eq!(&tail[4..], &[b'A', 0, b'=', 0, b'1', 0, 0, 0]);
    }

    #[test]
    fn start_and_stream() {
        let (ours, mut theirs) = Transport::pair().unwrap();

        let runtime = std::thread::spawn(move || {
            let request = ipc::receive(&mut theirs).unwrap();
            assert_eq!(request.command_set, command_set::EVENT_PIPE);
            assert_eq!(request.command_id, event_pipe::COLLECT_TRACING_2);
            assert_eq!(request.payload, SessionConfig::exceptions().encode());

            respond(&mut theirs, response::OK, &0xabcdu64.to_le_bytes());
            theirs.write_all(b"Nettrace").unwrap();
        });

        let mut session =
            TraceSession::start(ours, &SessionConfig::exceptions(), ControlPath::None).unwrap();
        assert_eq!(session.id(), 0xabcd);

        let mut streamed = Vec::new();
        session.read_to_end(&mut streamed).unwrap();
        assert_eq!(streamed, b"Nettrace");

        runtime.join().unwrap();
    }

    #[test]
    fn rejected_session() {
        let (ours, mut theirs) = Transport::pair().unwrap();

        let runtime = std::thread::spawn(move || {
            ipc::receive(&mut theirs).unwrap();
            respond(&mut theirs, response::ERROR, &0x8013_1384u32.to_le_bytes());
        });

        let res = TraceSession::start(ours, &SessionConfig::exceptions(), ControlPath::None);
        assert!(matches!(
            res,
            Err(Error::SessionRejected {
                status: 0x8013_1384,
                ..
            })
        ));

        runtime.join().unwrap();
    }

    #[test]
    fn stop_unblocks_read() {
        let (ours, mut theirs) = Transport::pair().unwrap();

        let runtime = std::thread::spawn(move || {
            ipc::receive(&mut theirs).unwrap();
            respond(&mut theirs, response::OK, &1u64.to_le_bytes());
            // Keep the connection open, but never send anything
            let mut rest = Vec::new();
            let _ = theirs.read_to_end(&mut rest);
        });

        let mut session =
            TraceSession::start(ours, &SessionConfig::exceptions(), ControlPath::None).unwrap();

        let stopper = session.stop_handle();
        let stop_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
            stopper.stop();
        });

        let started = std::time::Instant::now();
        let mut buf = [0u8; 64];
        assert_eq!(session.read(&mut buf).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(session.is_stopped());
        assert_eq!(session.read(&mut buf).unwrap(), 0);

        stop_thread.join().unwrap();
        runtime.join().unwrap();
    }

    #[test]
    fn resume() {
        let (mut ours, mut theirs) = Transport::pair().unwrap();

        let runtime = std::thread::spawn(move || {
            let request = ipc::receive(&mut theirs).unwrap();
            assert_eq!(
                (request.command_set, request.command_id),
                (command_set::PROCESS, process::RESUME_RUNTIME)
            );
            respond(&mut theirs, response::OK, &0u32.to_le_bytes());

            ipc::receive(&mut theirs).unwrap();
            respond(&mut theirs, response::OK, &5u32.to_le_bytes());
        });

        resume_runtime(&mut ours).unwrap();
        assert!(matches!(
            resume_runtime(&mut ours),
            Err(Error::SessionRejected { status: 5, .. })
        ));

        runtime.join().unwrap();
    }
}
