//! End-to-end RPC tests over loopback: echo calls, dispatch errors,
//! corrupted frames, and dropped completions on abrupt close.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};

use rivet_core::{Buffer, Config};
use rivet_net::TcpServer;
use rivet_reactor::{EventLoop, LoopHandle};
use rivet_rpc::{
    codec, decode_request, encode_response, Done, ErrorCode, RpcClient, RpcServer, Service,
};

fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = bounded(1);
    let join = thread::spawn(move || {
        let lp = EventLoop::new().unwrap();
        lp.set_poll_timeout(Duration::from_millis(100));
        tx.send(lp.handle()).unwrap();
        lp.run();
    });
    (rx.recv().unwrap(), join)
}

fn test_config() -> Config {
    Config {
        connect_retry_initial: Duration::from_millis(50),
        connect_retry_max: Duration::from_millis(200),
        ..Config::default()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct EchoRequest {
    #[prost(bytes = "vec", tag = "1")]
    payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct EchoResponse {
    #[prost(bytes = "vec", tag = "1")]
    payload: Vec<u8>,
}

struct EchoService {
    calls: Arc<AtomicUsize>,
}

impl Service for EchoService {
    fn name(&self) -> &str {
        "rivet.test.EchoService"
    }

    fn methods(&self) -> &[&str] {
        &["Echo"]
    }

    fn call_method(&self, method: &str, request: &[u8], done: Done) -> Result<(), ErrorCode> {
        match method {
            "Echo" => {
                let req: EchoRequest = decode_request(request)?;
                self.calls.fetch_add(1, Ordering::SeqCst);
                done(encode_response(&EchoResponse { payload: req.payload }));
                Ok(())
            }
            // The dispatcher checks methods() first; an unknown name must
            // never reach this point.
            other => unreachable!("dispatched unknown method {}", other),
        }
    }
}

struct Harness {
    server: Arc<RpcServer>,
    client: Arc<RpcClient>,
    server_loop: LoopHandle,
    client_loop: LoopHandle,
    joins: Vec<thread::JoinHandle<()>>,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    fn start() -> Harness {
        let (server_loop, sj) = spawn_loop();
        let (client_loop, cj) = spawn_loop();
        let calls = Arc::new(AtomicUsize::new(0));

        let server = RpcServer::new(
            server_loop.clone(),
            "rpc-echo",
            "127.0.0.1:0".parse().unwrap(),
            test_config(),
        )
        .unwrap();
        server.register_service(Arc::new(EchoService { calls: Arc::clone(&calls) }));
        server.start().unwrap();

        let client =
            RpcClient::new(client_loop.clone(), "rpc-client", server.listen_addr(), test_config());
        let (ready_tx, ready_rx) = bounded(1);
        client.set_connect_callback(Arc::new(move |_channel| {
            let _ = ready_tx.send(());
        }));
        client.connect();
        ready_rx.recv_timeout(Duration::from_secs(5)).expect("client should connect");

        Harness { server, client, server_loop, client_loop, joins: vec![sj, cj], calls }
    }

    fn finish(self) {
        let Harness { server, client, server_loop, client_loop, joins, .. } = self;
        drop(client);
        drop(server);
        thread::sleep(Duration::from_millis(200));
        client_loop.quit();
        server_loop.quit();
        for join in joins {
            join.join().unwrap();
        }
    }
}

#[test]
fn test_echo_call_completes() {
    let h = Harness::start();
    let channel = h.client.channel();

    let (tx, rx) = bounded(1);
    channel.call(
        "rivet.test.EchoService",
        "Echo",
        &EchoRequest { payload: b"hello".to_vec() },
        move |result: Result<EchoResponse, ErrorCode>| {
            let _ = tx.send(result);
        },
    );
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap().payload, b"hello");
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.outstanding_count(), 0);

    h.finish();
}

#[test]
fn test_call_ids_increase_across_calls() {
    let h = Harness::start();
    let channel = h.client.channel();

    let (tx, rx) = unbounded();
    let mut ids = Vec::new();
    for i in 0..10 {
        let tx = tx.clone();
        let id = channel.call(
            "rivet.test.EchoService",
            "Echo",
            &EchoRequest { payload: vec![i as u8] },
            move |result: Result<EchoResponse, ErrorCode>| {
                let _ = tx.send(result.map(|r| r.payload));
            },
        );
        ids.push(id);
    }
    for _ in 0..10 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    }
    for pair in ids.windows(2) {
        assert!(pair[1] > pair[0], "ids must be strictly increasing: {:?}", ids);
    }

    h.finish();
}

#[test]
fn test_unknown_method_reports_no_method() {
    let h = Harness::start();
    let channel = h.client.channel();

    let (tx, rx) = bounded(1);
    channel.call(
        "rivet.test.EchoService",
        "Missing",
        &EchoRequest { payload: Vec::new() },
        move |result: Result<EchoResponse, ErrorCode>| {
            let _ = tx.send(result);
        },
    );
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap_err(), ErrorCode::NoMethod);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    h.finish();
}

#[test]
fn test_unknown_service_reports_no_service() {
    let h = Harness::start();
    let channel = h.client.channel();

    let (tx, rx) = bounded(1);
    channel.call(
        "rivet.test.Nonexistent",
        "Echo",
        &EchoRequest { payload: Vec::new() },
        move |result: Result<EchoResponse, ErrorCode>| {
            let _ = tx.send(result);
        },
    );
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap_err(), ErrorCode::NoService);

    h.finish();
}

#[test]
fn test_corrupted_frame_stops_codec_and_leaves_connection_open() {
    let h = Harness::start();

    // Raw client speaking the framing by hand.
    let mut raw = std::net::TcpStream::connect(h.server.listen_addr()).unwrap();
    raw.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let mut buf = Buffer::new();
    codec::fill_empty_buffer(
        &mut buf,
        &rivet_rpc::RpcMessage::request(
            1,
            "rivet.test.EchoService",
            "Echo",
            encode_response(&EchoRequest { payload: b"x".to_vec() }),
        ),
    );
    let mut wire = buf.peek().to_vec();
    // Flip the last payload byte (pre-checksum).
    let idx = wire.len() - codec::CHECKSUM_LEN - 1;
    wire[idx] ^= 0xff;
    raw.write_all(&wire).unwrap();

    // The decoder reports a checksum error, invokes no service, and leaves
    // the connection open: the read times out instead of seeing EOF.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    let mut probe = [0u8; 16];
    match raw.read(&mut probe) {
        Ok(0) => panic!("server closed the connection on a framing error"),
        Ok(_) => panic!("server must not answer a corrupt frame"),
        Err(e) => assert!(
            matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
            "unexpected read error: {}",
            e
        ),
    }

    h.finish();
}

#[test]
fn test_outstanding_calls_dropped_on_abrupt_close() {
    // A plain TCP server that accepts frames and never answers.
    let (server_loop, sj) = spawn_loop();
    let (client_loop, cj) = spawn_loop();

    let server = TcpServer::new(
        server_loop.clone(),
        "blackhole",
        "127.0.0.1:0".parse().unwrap(),
        test_config(),
    )
    .unwrap();
    server.set_message_callback(Arc::new(|_conn, buf| buf.retrieve_all()));
    server.start().unwrap();

    let client =
        RpcClient::new(client_loop.clone(), "doomed", server.listen_addr(), test_config());
    let (ready_tx, ready_rx) = bounded(2);
    client.set_connect_callback(Arc::new(move |_channel| {
        let _ = ready_tx.send(());
    }));
    client.connect();
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let channel = client.channel();
    let completions = Arc::new(AtomicUsize::new(0));
    {
        let completions = Arc::clone(&completions);
        channel.call(
            "any.Service",
            "Any",
            &EchoRequest { payload: Vec::new() },
            move |_result: Result<EchoResponse, ErrorCode>| {
                completions.fetch_add(1, Ordering::SeqCst);
            },
        );
    }
    assert_eq!(channel.outstanding_count(), 1);

    // Server side goes away; the client channel must drop the completion
    // without running it.
    let mut tries = 0;
    while server.connection_count() != 1 {
        thread::sleep(Duration::from_millis(20));
        tries += 1;
        assert!(tries < 100, "server never saw the connection");
    }
    drop(server); // dropping the server destroys its connections

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while channel.outstanding_count() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(channel.outstanding_count(), 0, "outstanding table must drain");
    assert_eq!(completions.load(Ordering::SeqCst), 0, "completion must not run");

    client.stop();
    drop(client);
    thread::sleep(Duration::from_millis(200));
    client_loop.quit();
    server_loop.quit();
    cj.join().unwrap();
    sj.join().unwrap();
}
