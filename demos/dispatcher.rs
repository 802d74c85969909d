//! Dispatcher - example of serving delegates and broadcasting events.
//!
//! This example demonstrates:
//! - Registering sync and async delegates on a router
//! - Serving them to WebSocket peers with `Dispatcher::serve`
//! - Emitting events that are relayed to every connected peer
//! - Keeping the `log` namespace local
//!
//! # Running
//!
//! ```sh
//! cargo run --example dispatcher
//! # in another terminal
//! cargo run --example client
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use butler_bus::config::DEFAULT_ADDRESS;
use butler_bus::{ButlerError, Context, Dispatcher, Router};
use serde_json::Value;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let router = Arc::new(Router::new());
    let volume = Arc::new(AtomicI64::new(50));

    // Every "player.*" call lands here; the suffix picks the action
    let player_volume = Arc::clone(&volume);
    let events = Arc::downgrade(&router);
    router.register("player", move |ctx: Context, args: Vec<Value>| {
        let volume = Arc::clone(&player_volume);
        let events = events.clone();
        async move {
            match ctx.suffix() {
                "volume" => Ok(Value::from(volume.load(Ordering::Relaxed))),
                "set_volume" => {
                    let level = args
                        .first()
                        .and_then(Value::as_i64)
                        .ok_or_else(|| ButlerError::handler("set_volume expects a number"))?;
                    volume.store(level, Ordering::Relaxed);
                    if let Some(events) = events.upgrade() {
                        events.emit("player.volume", &(level,))?;
                    }
                    Ok(Value::Null)
                }
                other => Err(ButlerError::handler(format!("unknown player action {other}"))),
            }
        }
    });

    router.register_fn("echo", |_: &Context, args: Vec<Value>| Ok(args));

    let dispatcher = Dispatcher::new(Arc::clone(&router));
    let address = DEFAULT_ADDRESS.trim_start_matches("ws://");
    let listener = TcpListener::bind(address).await?;
    println!("Listening on {DEFAULT_ADDRESS}");

    // Heartbeat for connected peers; log events never leave this process
    let ticker = Arc::clone(&router);
    tokio::spawn(async move {
        let mut tick = 0u64;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tick += 1;
            let _ = ticker.emit("status.tick", &(tick,));
            let _ = ticker.emit("log.debug", &(format!("tick {tick}"),));
        }
    });

    dispatcher.serve(listener).await?;
    Ok(())
}
