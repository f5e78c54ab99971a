use diagnostics_ipc::{
    Client, IpcMessage, SessionConfig, Transport,
    ipc::{self, command_set, event_pipe, response},
};
use eventpiper::Outcome;
use eventpiper_test::*;
use std::{io::Write, os::unix::net::UnixListener, path::Path};

/// Listens where a runtime with `pid` would, serves one session and then
/// waits for it to be stopped, returning the id it was asked to stop
fn runtime(dir: &Path, pid: u32, thrown: Vec<(String, String)>) -> std::thread::JoinHandle<u64> {
    let listener =
        UnixListener::bind(dir.join(format!("dotnet-diagnostic-{pid}-1234567-socket"))).unwrap();

    std::thread::spawn(move || {
        let mut stream = Transport::from(listener.accept().unwrap().0);

        let request = ipc::receive(&mut stream).unwrap();
        assert_eq!(
            (request.command_set, request.command_id),
            (command_set::EVENT_PIPE, event_pipe::COLLECT_TRACING_2)
        );
        assert_eq!(request.payload, SessionConfig::exceptions().encode());

        ipc::send(
            &mut stream,
            &IpcMessage::new(command_set::SERVER, response::OK, SESSION_ID.to_le_bytes()),
        )
        .unwrap();

        stream
            .write_all(&exception_trace(pid, &thrown, false).into_bytes())
            .unwrap();

        // The stop request arrives on a connection of its own
        let mut control = Transport::from(listener.accept().unwrap().0);
        let request = ipc::receive(&mut control).unwrap();
        assert_eq!(
            (request.command_set, request.command_id),
            (command_set::EVENT_PIPE, event_pipe::STOP_TRACING)
        );
        ipc::send(
            &mut control,
            &IpcMessage::new(command_set::SERVER, response::OK, SESSION_ID.to_le_bytes()),
        )
        .unwrap();

        u64::from_le_bytes(request.payload[..8].try_into().unwrap())
    })
}

#[test]
fn attach_and_stop() {
    capture_output();

    let dir = tempfile::tempdir().unwrap();
    let pid = 31337;
    let runtime = runtime(
        dir.path(),
        pid,
        vec![
            ("System.NullReferenceException".into(), "oops".into()),
            ("System.TimeoutException".into(), "too slow".into()),
        ],
    );

    let client = Client::for_pid_in(dir.path(), pid).unwrap();
    let mut session = eventpiper::attach(client, &SessionConfig::exceptions()).unwrap();
    assert_eq!(session.id(), SESSION_ID);

    let mut handler = Collect {
        exit_after: 2,
        ..Default::default()
    };
    assert_eq!(
        eventpiper::stream_exceptions(&mut session, &mut handler).unwrap(),
        Outcome::Stopped
    );
    assert_eq!(
        handler.pairs(),
        [
            ("System.NullReferenceException", "oops"),
            ("System.TimeoutException", "too slow"),
        ]
    );

    assert_eq!(runtime.join().unwrap(), SESSION_ID);
}

#[test]
fn no_such_process() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        Client::for_pid_in(dir.path(), 4),
        Err(diagnostics_ipc::Error::NoRuntimeEndpoint { pid: 4 })
    ));
}
