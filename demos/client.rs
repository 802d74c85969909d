//! Client - example of calling a remote dispatcher through the router.
//!
//! This example demonstrates:
//! - Keeping a transport connected with `ReconnectSupervisor`
//! - Forwarding unhandled router calls to the remote peer
//! - Receiving remote broadcasts and lifecycle events as router events
//!
//! Start the `dispatcher` example first.

use std::sync::Arc;
use std::time::Duration;

use butler_bus::config::DEFAULT_ADDRESS;
use butler_bus::transport::{ReconnectPolicy, OPEN_EVENT};
use butler_bus::{ReconnectSupervisor, Router, Transport};
use tokio::sync::Notify;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let router = Arc::new(Router::new());

    router.on("status", |ctx, args| {
        println!("status {}: {:?}", ctx.suffix(), args);
        Ok(())
    });
    router.on("player", |ctx, args| {
        println!("player event {}: {:?}", ctx.name(), args);
        Ok(())
    });

    let connected = Arc::new(Notify::new());
    let on_open = Arc::clone(&connected);
    router.on(OPEN_EVENT, move |_, _| {
        on_open.notify_one();
        Ok(())
    });

    let transport = Transport::new(Arc::clone(&router));
    transport.forward_calls();
    let supervisor = ReconnectSupervisor::start(
        transport.clone(),
        DEFAULT_ADDRESS,
        ReconnectPolicy::Backoff {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(8),
        },
    );

    connected.notified().await;
    println!("Connected to {DEFAULT_ADDRESS}");

    let volume: i64 = router.call_as("player.volume", &()).await?;
    println!("volume: {volume}");

    router.call("player.set_volume", &(volume + 5,)).await?;

    let echoed = router.call("echo", &("hello", 42)).await?;
    println!("echo: {echoed}");

    if let Err(e) = router.call("player.eject", &()).await {
        println!("eject failed: {e}");
    }

    // Watch broadcasts for a while
    tokio::time::sleep(Duration::from_secs(5)).await;

    supervisor.stop();
    transport.close();
    Ok(())
}
