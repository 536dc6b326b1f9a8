//! Send, read, ack, unsubscribe through the synchronous facade.
//!
//! Run with a broker on localhost:61613:
//! `cargo run --example basic`

use serde_json::json;
use std::time::Duration;
use stomp_vu::{AckMode, Client, VirtualContext};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let ctx = VirtualContext::new(runtime.handle().clone());

    let client = Client::connect_value(
        &ctx,
        &json!({
            "protocol": "tcp",
            "addr": "localhost:61613",
            "timeout": "2s",
            "heartbeat": {"incoming": "30s", "outgoing": "30s"},
        }),
    )?;
    println!("connected to {:?}, session {:?}", client.server(), client.session());

    client.send("/queue/demo", "application/json", r#"{"test": "123"}"#)?;

    let subscription = client.subscribe("/queue/demo", AckMode::Client)?;
    let msg = subscription.read(Some(Duration::from_secs(5)))?;
    println!("msg {}", msg.text_lossy());
    println!("test = {:?}", msg.json_select("test")?);
    client.ack(&msg)?;

    subscription.unsubscribe()?;
    client.disconnect()?;
    Ok(())
}
