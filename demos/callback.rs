//! Listener-style subscription: callbacks run when the context sleeps.
//!
//! `cargo run --example callback`

use std::rc::Rc;
use std::time::Duration;
use stomp_vu::{AckMode, ClientConfig, StompError, VirtualContext};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let ctx = VirtualContext::new(runtime.handle().clone());

    let config = ClientConfig::new("localhost:61613").timeout(Duration::from_secs(2));
    let client = Rc::new(ctx.connect(config)?);

    client.send("/queue/demo", "text/plain", "Hello from a listener!")?;

    // The context owns the listener, and the client holds the context.
    let acker = Rc::downgrade(&client);
    let subscription = client.subscribe_listener(
        "/queue/demo",
        AckMode::Client,
        move |msg| {
            println!("msg {}", msg.text()?);
            if let Some(client) = acker.upgrade() {
                client.ack(&msg)?;
            }
            Ok(())
        },
        Some(Box::new(|err: StompError| eprintln!("subscription failed: {}", err))),
    )?;

    // Safe point: queued deliveries run here.
    ctx.sleep(Duration::from_secs(1));

    subscription.unsubscribe()?;
    client.disconnect()?;
    Ok(())
}
