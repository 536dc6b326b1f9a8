//! STOMP over WebSocket, e.g. RabbitMQ's web-stomp plugin.
//!
//! `cargo run --example websocket`

use std::time::Duration;
use stomp_vu::{AckMode, ClientConfig, Protocol, SendOptions, VirtualContext};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let ctx = VirtualContext::new(runtime.handle().clone());

    let config = ClientConfig::new("localhost:15674")
        .protocol(Protocol::Ws)
        .path("/ws")
        .login("guest", "guest")
        .heartbeat(Duration::from_secs(10), Duration::from_secs(10))
        .timeout(Duration::from_secs(2));
    let client = ctx.connect(config)?;

    client.send_with(
        "/queue/demo",
        "text/plain",
        "Hello over WebSocket!",
        SendOptions::new().receipt(true),
    )?;

    let subscription = client.subscribe("/queue/demo", AckMode::ClientIndividual)?;
    let msg = subscription.read(Some(Duration::from_secs(5)))?;
    println!("msg {}", msg.text_lossy());
    client.ack(&msg)?;

    subscription.unsubscribe()?;
    client.disconnect()?;
    Ok(())
}
