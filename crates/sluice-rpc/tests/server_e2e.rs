use std::{
    collections::HashSet,
    io::{Read, Write},
    net::TcpStream,
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use sluice_reactor::EventLoop;
use sluice_rpc::{Reply, ServerConfig, SocketServer};

// Each test forks its worker pool; serialize them so a fork never races
// another test's helper threads.
static SERIAL: Mutex<()> = Mutex::new(());

fn echo(payload: &[u8], reply: Reply<'_>) -> sluice_rpc::Result<()> {
    reply.send(payload)
}

fn pid_reply(_payload: &[u8], reply: Reply<'_>) -> sluice_rpc::Result<()> {
    reply.send(&std::process::id().to_le_bytes())
}

fn delayed_echo(payload: &[u8], reply: Reply<'_>) -> sluice_rpc::Result<()> {
    thread::sleep(Duration::from_millis(200));
    reply.send(payload)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as i32).to_le_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

fn read_frame(sock: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    sock.read_exact(&mut header).expect("frame header");
    let len = i32::from_le_bytes(header);
    assert!(len > 0, "unexpected frame header {len}");
    let mut payload = vec![0u8; len as usize];
    sock.read_exact(&mut payload).expect("frame payload");
    payload
}

fn pump_while(event_loop: &EventLoop, mut running: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while running() {
        assert!(Instant::now() < deadline, "timed out pumping the loop");
        event_loop.poll_once(Some(Duration::from_millis(5))).expect("poll");
    }
}

fn pump(event_loop: &EventLoop, for_how_long: Duration) {
    let deadline = Instant::now() + for_how_long;
    while Instant::now() < deadline {
        event_loop.poll_once(Some(Duration::from_millis(5))).expect("poll");
    }
}

#[test]
fn echo_roundtrip() {
    let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    let event_loop = EventLoop::new().expect("loop");
    let config = ServerConfig::default().with_worker_num(2);
    let server = SocketServer::bind(config, &event_loop, echo).expect("bind");
    let addr = server.local_addr().expect("addr");

    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).expect("connect");
        sock.write_all(&frame(b"helloworld")).expect("request");
        read_frame(&mut sock)
    });

    pump_while(&event_loop, || !client.is_finished());
    assert_eq!(client.join().expect("client"), b"helloworld");
    server.shutdown();
}

#[test]
fn requests_round_robin_across_workers() {
    let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    let event_loop = EventLoop::new().expect("loop");
    let config = ServerConfig::default().with_worker_num(4);
    let server = SocketServer::bind(config, &event_loop, pid_reply).expect("bind");
    let addr = server.local_addr().expect("addr");

    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).expect("connect");
        let mut pids = Vec::with_capacity(8);
        for _ in 0..8 {
            sock.write_all(&frame(b"ping")).expect("request");
            let payload = read_frame(&mut sock);
            pids.push(u32::from_le_bytes(payload.try_into().expect("pid payload")));
        }
        pids
    });

    pump_while(&event_loop, || !client.is_finished());
    let pids = client.join().expect("client");

    // Strict rotation: four distinct workers, then the same sequence again.
    let distinct: HashSet<u32> = pids[..4].iter().copied().collect();
    assert_eq!(distinct.len(), 4, "requests were not spread over all workers: {pids:?}");
    assert_eq!(pids[..4], pids[4..], "rotation order changed between rounds: {pids:?}");
    server.shutdown();
}

#[test]
fn response_for_a_disconnected_client_is_dropped() {
    let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    let event_loop = EventLoop::new().expect("loop");
    let config = ServerConfig::default().with_worker_num(1);
    let server = SocketServer::bind(config, &event_loop, delayed_echo).expect("bind");
    let addr = server.local_addr().expect("addr");

    // Request, then hang up before the worker's delayed reply lands.
    {
        let mut sock = TcpStream::connect(addr).expect("connect");
        sock.write_all(&frame(b"orphan")).expect("request");
    }
    pump(&event_loop, Duration::from_millis(500));

    // The reply went nowhere and the server is still healthy.
    let client = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).expect("connect");
        sock.write_all(&frame(b"alive")).expect("request");
        read_frame(&mut sock)
    });
    pump_while(&event_loop, || !client.is_finished());
    assert_eq!(client.join().expect("client"), b"alive");
    server.shutdown();
}
