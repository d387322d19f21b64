//! RPC echo client.
//!
//! Run (against a running echo_server):
//! - cargo run -p rivet --example echo_client
//! - cargo run -p rivet --example echo_client -- 127.0.0.1:7777 "some text"

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use rivet::{Config, ErrorCode, EventLoop, RpcClient};

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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let server_addr: SocketAddr =
        args.next().unwrap_or_else(|| "127.0.0.1:9981".to_string()).parse()?;
    let text = args.next().unwrap_or_else(|| "hello, rivet".to_string());

    let lp = EventLoop::new()?;
    let client = RpcClient::new(lp.handle(), "echo-client", server_addr, Config::default());

    let handle = lp.handle();
    client.set_connect_callback(Arc::new(move |channel| {
        let quit = handle.clone();
        channel.call(
            "rivet.example.EchoService",
            "Echo",
            &EchoRequest { payload: text.clone().into_bytes() },
            move |result: Result<EchoResponse, ErrorCode>| {
                match result {
                    Ok(resp) => println!("echoed: {}", String::from_utf8_lossy(&resp.payload)),
                    Err(code) => eprintln!("call failed: {:?}", code),
                }
                quit.quit();
            },
        );
    }));
    client.connect();

    lp.run();
    Ok(())
}
