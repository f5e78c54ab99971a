use diagnostics_ipc::{Advertise, Error, HandshakeFault, Server};
use std::{
    io::Write,
    os::unix::net::UnixStream,
    path::Path,
    sync::{Arc, atomic},
    time::{Duration, Instant},
};

fn advertise(path: &Path, pid: u32, cookie: uuid::Uuid) -> UnixStream {
    let mut stream = UnixStream::connect(path).unwrap();
    stream
        .write_all(&Advertise::new(pid, cookie).encode().unwrap())
        .unwrap();
    stream
}

/// A runtime that advertises itself gets the cookie it sent back verbatim,
/// and later advertises from that process are the same instance
#[test]
fn rendezvous() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::with_name(Server::unique_name(dir.path())).unwrap();
    let shutdown = atomic::AtomicBool::new(false);

    let first = uuid::Uuid::from_u128(0x6c1f_09b2_3cc4_4e2a_9a3d_35ee_cb12_0f77);
    let path = server.path().to_owned();
    let runtime = std::thread::spawn(move || {
        let a = advertise(&path, 4321, first);
        let b = advertise(&path, 4321, uuid::Uuid::from_u128(1));
        (a, b)
    });

    let (_transport, endpoint) = server
        .accept_one(4321, Duration::from_secs(5), &shutdown)
        .unwrap();
    assert_eq!(endpoint.pid, 4321);
    assert_eq!(endpoint.cookie, Some(first));

    let (_transport, again) = server
        .accept_one(4321, Duration::from_secs(5), &shutdown)
        .unwrap();
    assert_eq!(again, endpoint);
    assert_eq!(server.instance(), Some(endpoint));

    drop(runtime.join().unwrap());
}

#[test]
fn mismatched_pid() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::with_name(dir.path().join("mismatch.socket")).unwrap();
    let shutdown = atomic::AtomicBool::new(false);

    let _stranger = advertise(server.path(), 99, uuid::Uuid::from_u128(2));

    match server.accept_one(100, Duration::from_secs(5), &shutdown) {
        Err(Error::HandshakeMismatch(HandshakeFault::ProcessId {
            expected: 100,
            advertised: 99,
        })) => {}
        other => panic!("unexpected result {:?}", other.map(|(_, ep)| ep)),
    }

    // The server is still listening
    let cookie = uuid::Uuid::from_u128(3);
    let _ours = advertise(server.path(), 100, cookie);
    let (_transport, endpoint) = server
        .accept_one(100, Duration::from_secs(5), &shutdown)
        .unwrap();
    assert_eq!(endpoint.cookie, Some(cookie));
}

#[test]
fn bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::with_name(dir.path().join("magic.socket")).unwrap();
    let shutdown = atomic::AtomicBool::new(false);

    let mut peer = UnixStream::connect(server.path()).unwrap();
    peer.write_all(&[0xaa; Advertise::SIZE]).unwrap();

    assert!(matches!(
        server.accept_one(1, Duration::from_secs(5), &shutdown),
        Err(Error::HandshakeMismatch(HandshakeFault::Magic(_)))
    ));
}

#[test]
fn timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::with_name(dir.path().join("timeout.socket")).unwrap();
    let shutdown = atomic::AtomicBool::new(false);

    let started = Instant::now();
    assert!(matches!(
        server.accept_one(1, Duration::from_millis(100), &shutdown),
        Err(Error::RendezvousTimeout(_))
    ));
    assert!(started.elapsed() >= Duration::from_millis(100));

    // A peer that connects but never finishes its advertise also times out
    let mut silent = UnixStream::connect(server.path()).unwrap();
    silent.write_all(b"ADVR").unwrap();
    assert!(matches!(
        server.accept_one(1, Duration::from_millis(200), &shutdown),
        Err(Error::RendezvousTimeout(_))
    ));
}

#[test]
fn shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::with_name(dir.path().join("shutdown.socket")).unwrap();

    let shutdown = Arc::new(atomic::AtomicBool::new(false));
    let is_shutdown = shutdown.clone();
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        is_shutdown.store(true, atomic::Ordering::Relaxed);
    });

    assert!(matches!(
        server.accept_one(1, Duration::from_secs(30), &shutdown),
        Err(Error::Cancelled)
    ));

    trigger.join().unwrap();
}

#[test]
fn socket_removed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drop.socket");

    // Stale files are replaced
    std::fs::write(&path, b"stale").unwrap();

    let server = Server::with_name(&path).unwrap();
    assert!(path.exists());
    drop(server);
    assert!(!path.exists());
}
