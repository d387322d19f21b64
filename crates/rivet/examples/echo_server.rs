//! RPC echo server.
//!
//! Run:
//! - cargo run -p rivet --example echo_server
//! - cargo run -p rivet --example echo_server -- 127.0.0.1:7777

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use rivet::{decode_request, encode_response, Config, Done, ErrorCode, EventLoop, RpcServer, Service};

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

struct EchoService;

impl Service for EchoService {
    fn name(&self) -> &str {
        "rivet.example.EchoService"
    }

    fn methods(&self) -> &[&str] {
        &["Echo"]
    }

    fn call_method(&self, method: &str, request: &[u8], done: Done) -> Result<(), ErrorCode> {
        match method {
            "Echo" => {
                let req: EchoRequest = decode_request(request)?;
                println!("echo {} bytes", req.payload.len());
                done(encode_response(&EchoResponse { payload: req.payload }));
                Ok(())
            }
            _ => Err(ErrorCode::NoMethod),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listen_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9981".to_string())
        .parse()?;

    let mut config = Config::default();
    config.worker_threads = 2;

    let lp = EventLoop::new()?;
    let server = RpcServer::new(lp.handle(), "echo", listen_addr, config)?;
    server.register_service(Arc::new(EchoService));
    server.start()?;
    println!("echo server listening on {}", server.listen_addr());

    lp.run();
    Ok(())
}
