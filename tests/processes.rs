//! Runs the real binary in its `worker` and `supervisor` roles.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_reuseport-echo");

/// Kills the child if the test bails out early.
struct Process(Child);

impl Process {
    fn spawn(args: &[&str], stdout: Stdio) -> Self {
        let child = Command::new(BIN)
            .args(args)
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        Self(child)
    }

    fn terminate(&self) {
        kill(Pid::from_raw(self.0.id() as i32), Signal::SIGTERM).unwrap();
    }

    fn wait_timeout(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.0.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "process did not exit in time");
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(e) if Instant::now() >= deadline => panic!("no listener on {port}: {e}"),
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn echo(port: u16, message: &[u8]) -> Vec<u8> {
    let mut stream = connect(port);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(message).unwrap();
    stream.shutdown(Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    reply
}

#[test]
fn test_worker_echoes_and_stops_on_sigterm() {
    let port = free_port();
    let port_arg = port.to_string();
    let mut worker = Process::spawn(
        &["worker", "--host", "127.0.0.1", "--port", &port_arg],
        Stdio::null(),
    );

    assert_eq!(echo(port, b"Hello, server!"), b"Hello, server!");

    worker.terminate();
    let status = worker.wait_timeout(Duration::from_secs(5));
    assert!(status.success(), "worker exited with {status}");
}

#[test]
fn test_worker_exits_nonzero_when_port_is_taken() {
    let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
    let port_arg = blocker.local_addr().unwrap().port().to_string();
    let mut worker = Process::spawn(
        &["worker", "--host", "127.0.0.1", "--port", &port_arg],
        Stdio::null(),
    );

    let status = worker.wait_timeout(Duration::from_secs(5));
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_supervisor_pool_serves_echo() {
    let port = free_port();
    let port_arg = port.to_string();
    let mut supervisor = Process::spawn(
        &[
            "supervisor",
            "--workers",
            "2",
            "--host",
            "127.0.0.1",
            "--port",
            &port_arg,
        ],
        Stdio::null(),
    );

    for _ in 0..4 {
        assert_eq!(echo(port, b"Hello, server!"), b"Hello, server!");
    }

    supervisor.terminate();
    let status = supervisor.wait_timeout(Duration::from_secs(10));
    assert!(status.success(), "supervisor exited with {status}");
}

#[test]
fn test_supervisor_replaces_worker_that_cannot_bind() {
    let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
    let port_arg = blocker.local_addr().unwrap().port().to_string();
    let mut supervisor = Process::spawn(
        &[
            "supervisor",
            "--workers",
            "1",
            "--host",
            "127.0.0.1",
            "--port",
            &port_arg,
        ],
        Stdio::piped(),
    );

    let stdout = supervisor.0.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    // The first worker fails to bind, and so does its replacement.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut deaths = 0;
    while deaths < 2 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = rx
            .recv_timeout(remaining)
            .expect("supervisor did not report two worker exits");
        if line.contains("died") && line.contains("exited with code 1") {
            deaths += 1;
        }
    }

    supervisor.terminate();
    let status = supervisor.wait_timeout(Duration::from_secs(10));
    assert!(status.success(), "supervisor exited with {status}");
}
