use super::{IpcMessage, Stream, Transport};
use crate::{Error, RuntimeEndpoint};
use std::path::{Path, PathBuf};

/// Connects to the diagnostics socket a runtime listens on by default.
///
/// The runtime only serves a single command per connection, so every command
/// is sent over a fresh [`Transport`] obtained via [`Self::connect`].
#[derive(Clone, Debug)]
pub struct Client {
    path: PathBuf,
    pid: u32,
}

impl Client {
    /// Finds the diagnostics socket of the specified process in the temp
    /// directory, which is where the runtime creates it unless told otherwise
    ///
    /// # Errors
    ///
    /// The temp directory could not be read, or the process has no socket
    pub fn for_pid(pid: u32) -> Result<Self, Error> {
        Self::for_pid_in(std::env::temp_dir(), pid)
    }

    /// Finds the diagnostics socket of the specified process in `dir`.
    ///
    /// Sockets are named `dotnet-diagnostic-<pid>-<disambiguation>-socket`,
    /// if there are several (eg. left behind by a previous process that had
    /// the same pid), the most recently modified one is used.
    pub fn for_pid_in(dir: impl AsRef<Path>, pid: u32) -> Result<Self, Error> {
        let prefix = format!("dotnet-diagnostic-{pid}-");

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if !name.starts_with(&prefix) || !name.ends_with("-socket") {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|md| md.modified())
                .unwrap_or(std::time::UNIX_EPOCH);

            if newest.as_ref().is_none_or(|(ts, _)| modified > *ts) {
                newest = Some((modified, entry.path()));
            }
        }

        let (_, path) = newest.ok_or(Error::NoRuntimeEndpoint { pid })?;
        log::debug!("found diagnostics socket {}", path.display());

        Ok(Self { path, pid })
    }

    /// Uses an explicit socket path for the specified process
    #[inline]
    pub fn with_path(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn endpoint(&self) -> RuntimeEndpoint {
        RuntimeEndpoint {
            pid: self.pid,
            cookie: None,
        }
    }

    /// Opens a new connection to the runtime
    ///
    /// # Errors
    ///
    /// The runtime is not listening on the socket (anymore)
    pub fn connect(&self) -> Result<Transport, Error> {
        Ok(Transport::from(Stream::connect(&self.path)?))
    }

    /// Sends a single command over a new connection and waits for the
    /// response
    pub fn send_command(&self, msg: &IpcMessage) -> Result<IpcMessage, Error> {
        let mut transport = self.connect()?;
        super::send(&mut transport, msg)?;
        let response = super::receive(&mut transport)?;
        transport.close();
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_newest_socket() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(dir.path().join("dotnet-diagnostic-12-1-socket"), b"").unwrap();
        std::fs::write(dir.path().join("dotnet-diagnostic-123-2-socket"), b"").unwrap();
        std::fs::write(dir.path().join("dotnet-diagnostic-12-3-sock"), b"").unwrap();
        let newest = std::fs::File::create(dir.path().join("dotnet-diagnostic-12-9-socket")).unwrap();
        newest
            .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(60))
            .unwrap();

        let client = Client::for_pid_in(dir.path(), 12).unwrap();
        assert_eq!(
            client.path(),
            dir.path().join("dotnet-diagnostic-12-9-socket")
        );
        assert_eq!(client.endpoint().pid, 12);
        assert_eq!(client.endpoint().cookie, None);

        assert!(matches!(
            Client::for_pid_in(dir.path(), 1),
            Err(Error::NoRuntimeEndpoint { pid: 1 })
        ));
    }
}
