//! Echo RPC server: every data payload comes straight back on the same
//! connection. Smoke driver for manual poking with a framing-aware client.

use sluice_reactor::EventLoop;
use sluice_rpc::{Reply, ServerConfig, SocketServer};
use tracing_subscriber::EnvFilter;

fn echo(payload: &[u8], reply: Reply<'_>) -> sluice_rpc::Result<()> {
    reply.send(payload)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 20000,
    };

    let event_loop = EventLoop::new()?;
    let config = ServerConfig::default().with_port(port);
    let server = SocketServer::bind(config, &event_loop, echo)?;
    server.start()?;
    Ok(())
}
