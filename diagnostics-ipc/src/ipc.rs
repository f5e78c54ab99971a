use crate::Error;
use scroll::{LE, Pread, Pwrite};
use std::io::{self, Read, Write};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        type Stream = std::os::unix::net::UnixStream;
        type Listener = std::os::unix::net::UnixListener;
    } else {
        compile_error!("unimplemented target platform");
    }
}

mod client;
mod server;

pub use client::Client;
pub use server::Server;

/// Magic that starts every diagnostics IPC message, in both directions
pub const IPC_MAGIC: [u8; 14] = *b"DOTNET_IPC_V1\0";
/// Magic that starts the advertise message a runtime sends when it connects
/// back to a [`Server`], the `V1` is the advertise protocol version
pub const ADVERTISE_MAGIC: [u8; 8] = *b"ADVR_V1\0";

/// Command sets understood by the runtime's diagnostics server
pub mod command_set {
    pub const DUMP: u8 = 0x01;
    pub const EVENT_PIPE: u8 = 0x02;
    pub const PROFILER: u8 = 0x03;
    pub const PROCESS: u8 = 0x04;
    /// Only used for responses
    pub const SERVER: u8 = 0xff;
}

/// Commands in [`command_set::EVENT_PIPE`]
pub mod event_pipe {
    pub const STOP_TRACING: u8 = 0x01;
    pub const COLLECT_TRACING: u8 = 0x02;
    pub const COLLECT_TRACING_2: u8 = 0x03;
}

/// Commands in [`command_set::PROCESS`]
pub mod process {
    pub const PROCESS_INFO: u8 = 0x00;
    pub const RESUME_RUNTIME: u8 = 0x01;
}

/// Response ids in [`command_set::SERVER`]
pub mod response {
    pub const OK: u8 = 0x00;
    pub const ERROR: u8 = 0xff;
}

/// A bidirectional byte stream to a runtime.
///
/// Closing a transport, from any thread, wakes up a read that is blocked on
/// it, which then observes end of file.
pub struct Transport {
    stream: Stream,
}

impl Transport {
    /// Creates a pair of connected transports
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = Stream::pair()?;
        Ok((Self::from(a), Self::from(b)))
    }

    #[inline]
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }

    #[inline]
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Shuts down both directions of the connection.
    ///
    /// Calling this more than once, or on a connection the peer already
    /// closed, is fine.
    pub fn close(&self) {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
            Err(err) => log::debug!("failed to shutdown transport: {err}"),
        }
    }
}

impl From<Stream> for Transport {
    fn from(stream: Stream) -> Self {
        Self { stream }
    }
}

impl Read for Transport {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Transport {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[derive(Copy, Clone, Pread, Pwrite)]
#[cfg_attr(test, derive(PartialEq, Debug))]
pub(crate) struct Header {
    magic: [u8; 14],
    /// The size of the whole message, including this header
    size: u16,
    command_set: u8,
    command_id: u8,
    reserved: u16,
}

impl Header {
    pub(crate) const SIZE: usize = 20;

    fn parse(buf: &[u8]) -> Result<Self, Error> {
        let header: Self = buf.pread_with(0, LE)?;

        if header.magic != IPC_MAGIC {
            return Err(Error::ProtocolFraming(format!(
                "unexpected message magic {:02x?}",
                header.magic
            )));
        }

        if usize::from(header.size) < Self::SIZE {
            return Err(Error::ProtocolFraming(format!(
                "declared message size {} is smaller than the header",
                header.size
            )));
        }

        Ok(header)
    }
}

/// A single command or response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcMessage {
    pub command_set: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl IpcMessage {
    /// The largest message the 16-bit size field can describe
    pub const MAX_SIZE: usize = u16::MAX as usize;

    #[inline]
    pub fn new(command_set: u8, command_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command_set,
            command_id,
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        Header::SIZE + self.payload.len()
    }

    /// Encodes the message, failing if it is too large to be framed
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let size = u16::try_from(self.encoded_len()).map_err(|_err| {
            Error::ProtocolFraming(format!(
                "message of {} bytes exceeds the maximum of {}",
                self.encoded_len(),
                Self::MAX_SIZE
            ))
        })?;

        let header = Header {
            magic: IPC_MAGIC,
            size,
            command_set: self.command_set,
            command_id: self.command_id,
            reserved: 0,
        };

        let mut buf = vec![0u8; self.encoded_len()];
        buf.pwrite_with(header, 0, LE)?;
        buf[Header::SIZE..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes exactly one message, the declared size must match the length
    /// of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Header::SIZE {
            return Err(Error::ProtocolFraming(format!(
                "{} bytes is too short for a message header",
                buf.len()
            )));
        }

        let header = Header::parse(buf)?;

        if usize::from(header.size) != buf.len() {
            return Err(Error::ProtocolFraming(format!(
                "declared message size {} does not match the actual size {}",
                header.size,
                buf.len()
            )));
        }

        Ok(Self {
            command_set: header.command_set,
            command_id: header.command_id,
            payload: buf[Header::SIZE..].to_vec(),
        })
    }
}

/// Writes a single message
pub fn send(writer: &mut impl Write, msg: &IpcMessage) -> Result<(), Error> {
    let buf = msg.encode()?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads a single message, a message may be delivered over any number of
/// reads
pub fn receive(reader: &mut impl Read) -> Result<IpcMessage, Error> {
    let mut hdr_buf = [0u8; Header::SIZE];
    read_full(reader, &mut hdr_buf, "message header")?;

    let header = Header::parse(&hdr_buf)?;

    let mut payload = vec![0u8; usize::from(header.size) - Header::SIZE];
    read_full(reader, &mut payload, "message payload")?;

    Ok(IpcMessage {
        command_set: header.command_set,
        command_id: header.command_id,
        payload,
    })
}

/// Checks that `response` is a successful response, returning its payload
pub(crate) fn expect_ok(response: IpcMessage, command: &'static str) -> Result<Vec<u8>, Error> {
    match (response.command_set, response.command_id) {
        (command_set::SERVER, response::OK) => Ok(response.payload),
        (command_set::SERVER, response::ERROR) => {
            let status: u32 = response.payload.pread_with(0, LE).map_err(|_err| {
                Error::ProtocolFraming(format!("{command} error response is missing its status"))
            })?;
            Err(Error::SessionRejected { command, status })
        }
        (set, id) => Err(Error::ProtocolFraming(format!(
            "unexpected response {set:#04x}/{id:#04x} to the {command} command"
        ))),
    }
}

/// Fills `buf` completely, reporting a peer that goes away part way through
/// as [`Error::TransportClosed`]
pub(crate) fn read_full(
    reader: &mut impl Read,
    buf: &mut [u8],
    stage: &'static str,
) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::TransportClosed { stage }),
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// The first message a runtime sends after connecting to a [`Server`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pread, Pwrite)]
pub struct Advertise {
    pub magic: [u8; 8],
    /// The runtime instance cookie, in the little endian GUID layout
    pub cookie: [u8; 16],
    pub pid: u64,
    pub reserved: u16,
}

impl Advertise {
    pub const SIZE: usize = 34;

    #[inline]
    pub fn new(pid: u32, cookie: uuid::Uuid) -> Self {
        Self {
            magic: ADVERTISE_MAGIC,
            cookie: cookie.to_bytes_le(),
            pid: pid.into(),
            reserved: 0,
        }
    }

    #[inline]
    pub fn cookie(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes_le(self.cookie)
    }

    pub fn encode(&self) -> Result<[u8; Self::SIZE], Error> {
        let mut buf = [0u8; Self::SIZE];
        buf.pwrite_with(*self, 0, LE)?;
        Ok(buf)
    }

    /// Decodes an advertise message, rejecting anything without the expected
    /// magic
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let adv: Self = buf.pread_with(0, LE)?;

        if adv.magic != ADVERTISE_MAGIC {
            return Err(Error::HandshakeMismatch(crate::HandshakeFault::Magic(
                adv.magic,
            )));
        }

        Ok(adv)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn resume() -> IpcMessage {
        IpcMessage::new(command_set::PROCESS, process::RESUME_RUNTIME, Vec::new())
    }

    #[test]
    fn header_bytes() {
        let encoded = resume().encode().unwrap();

        assert_eq!(encoded.len(), Header::SIZE);
        assert_eq!(&encoded[..14], b"DOTNET_IPC_V1\0");
        assert_eq!(&encoded[14..], &[20, 0, 0x04, 0x01, 0, 0]);

        let expected = Header {
            magic: IPC_MAGIC,
            size: 20,
            command_set: command_set::PROCESS,
            command_id: process::RESUME_RUNTIME,
            reserved: 0,
        };
        assert_eq!(Header::parse(&encoded).unwrap(), expected);
    }

    #[test]
    fn message_round_trip() {
        let msg = IpcMessage::new(
            command_set::EVENT_PIPE,
            event_pipe::STOP_TRACING,
            0x1122_3344_5566_7788u64.to_le_bytes(),
        );

        assert_eq!(IpcMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn forged_size() {
        let msg = IpcMessage::new(command_set::EVENT_PIPE, event_pipe::STOP_TRACING, [1u8; 8]);
        let mut encoded = msg.encode().unwrap();
        encoded[14..16].copy_from_slice(&40u16.to_le_bytes());

        assert!(matches!(
            IpcMessage::decode(&encoded),
            Err(Error::ProtocolFraming(_))
        ));

        // The same forgery when read from a stream leaves us waiting on bytes
        // that never arrive
        assert!(matches!(
            receive(&mut encoded.as_slice()),
            Err(Error::TransportClosed { .. })
        ));
    }

    #[test]
    fn undersized_and_bad_magic() {
        let mut encoded = resume().encode().unwrap();
        encoded[14..16].copy_from_slice(&4u16.to_le_bytes());
        assert!(matches!(
            receive(&mut encoded.as_slice()),
            Err(Error::ProtocolFraming(_))
        ));

        let mut encoded = resume().encode().unwrap();
        encoded[0] = b'X';
        assert!(matches!(
            IpcMessage::decode(&encoded),
            Err(Error::ProtocolFraming(_))
        ));
    }

    #[test]
    fn oversized_message() {
        let msg = IpcMessage::new(command_set::EVENT_PIPE, 0, vec![0u8; IpcMessage::MAX_SIZE]);
        assert!(matches!(msg.encode(), Err(Error::ProtocolFraming(_))));
    }

    /// Hands out a single byte per read
    struct Trickle<'buf>(&'buf [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn partial_reads() {
        let msg = IpcMessage::new(command_set::SERVER, response::OK, 7u64.to_le_bytes());
        let encoded = msg.encode().unwrap();

        assert_eq!(receive(&mut Trickle(&encoded)).unwrap(), msg);
    }

    #[test]
    fn error_response() {
        let rejected = IpcMessage::new(
            command_set::SERVER,
            response::ERROR,
            0x8013_1384u32.to_le_bytes(),
        );

        assert!(matches!(
            expect_ok(rejected, "collect tracing"),
            Err(Error::SessionRejected {
                command: "collect tracing",
                status: 0x8013_1384
            })
        ));

        let unexpected = IpcMessage::new(command_set::EVENT_PIPE, 0, Vec::new());
        assert!(matches!(
            expect_ok(unexpected, "resume"),
            Err(Error::ProtocolFraming(_))
        ));
    }

    #[test]
    fn advertise_bytes() {
        let cookie = uuid::Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let adv = Advertise::new(4242, cookie);
        let encoded = adv.encode().unwrap();

        assert_eq!(&encoded[..8], b"ADVR_V1\0");
        assert_eq!(&encoded[8..24], &cookie.to_bytes_le());
        assert_eq!(&encoded[24..32], &4242u64.to_le_bytes());

        let decoded = Advertise::decode(&encoded).unwrap();
        assert_eq!(decoded, adv);
        assert_eq!(decoded.cookie(), cookie);

        let mut bad = encoded;
        bad[4] = b'2';
        assert!(matches!(
            Advertise::decode(&bad),
            Err(Error::HandshakeMismatch(crate::HandshakeFault::Magic(_)))
        ));
    }
}
