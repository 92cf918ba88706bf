#![cfg(unix)]

use std::io::Write;
use std::net::SocketAddr;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use capstream_codec::{pump_pair, CodecError, FrameSink, PumpConfig, WireFrame};
use capstream_transport::{RpcStream, TcpSocket};

fn run_with_stdin(args: &[&str], input: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_capstream"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("command should start");
    child
        .stdin
        .as_mut()
        .expect("stdin should be piped")
        .write_all(input)
        .expect("stdin should accept input");
    child.wait_with_output().expect("command should finish")
}

#[test]
fn pack_then_unpack_round_trips_stdin() {
    let original: Vec<u8> = (0..64u8).map(|i| if i % 3 == 0 { 0 } else { i }).collect();

    let packed = run_with_stdin(&["pack"], &original);
    assert!(packed.status.success(), "pack failed: {packed:?}");
    assert!(packed.stdout.len() < original.len());

    let unpacked = run_with_stdin(&["unpack"], &packed.stdout);
    assert!(unpacked.status.success(), "unpack failed: {unpacked:?}");
    assert_eq!(unpacked.stdout, original);
}

#[test]
fn pack_rejects_unaligned_stdin() {
    let output = run_with_stdin(&["pack"], &[1, 2, 3]);
    assert_eq!(output.status.code(), Some(60));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("packing failed"), "stderr: {stderr}");
}

#[test]
fn unpack_rejects_truncated_stream() {
    let packed = run_with_stdin(&["pack"], &[0xAA; 16]);
    assert!(packed.status.success());

    let truncated = &packed.stdout[..packed.stdout.len() - 1];
    let output = run_with_stdin(&["unpack"], truncated);
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn version_prints_package_version() {
    let output = run_with_stdin(&["version"], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")), "stdout: {stdout}");
}

#[test]
fn version_extended_prints_provenance() {
    let output = run_with_stdin(&["version", "--extended"], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("target_os:"), "stdout: {stdout}");
}

fn wait_for_connect(addr: SocketAddr, timeout: Duration) -> RpcStream {
    let start = Instant::now();
    loop {
        match TcpSocket::connect(addr) {
            Ok(stream) => return stream,
            Err(err) => {
                assert!(start.elapsed() < timeout, "connect timeout: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn free_port() -> SocketAddr {
    let probe = TcpSocket::bind("127.0.0.1:0".parse().expect("loopback addr"))
        .expect("probe bind should succeed");
    probe.local_addr()
    // probe drops here; the serve child re-binds the port
}

#[test]
fn serve_echoes_frames_over_tcp() {
    let addr = free_port();

    let mut child = Command::new(env!("CARGO_BIN_EXE_capstream"))
        .args(["--log-level", "error", "serve", &addr.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve command should start");

    let stream = wait_for_connect(addr, Duration::from_secs(5));

    let (tx, rx) = std::sync::mpsc::channel();
    let sink: FrameSink = Box::new(move |frame| {
        tx.send(frame)
            .map_err(|e| CodecError::Receiver(e.to_string()))
    });
    let (mut pump, sender, handle) =
        pump_pair(stream, PumpConfig::default(), sink).expect("pump pair should wire");
    let reader = thread::spawn(move || pump.run());

    let sent = WireFrame::single_segment(vec![0x5Au8; 24]).expect("aligned payload");
    sender.send(&sent).expect("send should succeed");

    let reply = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo reply should arrive");
    assert_eq!(reply.as_bytes(), sent.as_bytes());

    handle.dispose();
    let _ = reader.join();
    child.kill().expect("serve child should be killable");
    let _ = child.wait();
}
