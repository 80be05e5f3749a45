//! Scan for peripherals, connect to one by name and print what it exposes.
//!
//! ```text
//! cargo run --example scan_and_inspect -- "SensorX"
//! ```

use pointo::{AllowAll, BtleplugTransport, Engine, Notification, Notifier, TimeoutConfig};
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};

const SCAN_WINDOW: Duration = Duration::from_secs(5);
const INSPECT_WINDOW: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let target = std::env::args().nth(1);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = BtleplugTransport::new(events_tx).await?;
    let (notifier, mut notifications) = Notifier::channel();
    let engine =
        Engine::new(transport, AllowAll, notifier, TimeoutConfig::default()).spawn(events_rx);

    println!("Scanning for {}s...", SCAN_WINDOW.as_secs());
    engine.start_scan().await?;
    tokio::time::sleep(SCAN_WINDOW).await;

    let devices = engine.devices().await?;
    for (name, address) in &devices {
        println!("  {name} ({address})");
    }

    let Some(target) = target else {
        println!("Pass a device name to connect");
        engine.shutdown().await?;
        return Ok(());
    };

    engine.stop_scan().await?;
    engine.connect_by_name(target.as_str()).await?;

    let finished = timeout(INSPECT_WINDOW, async {
        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::Ready { .. } => return true,
                Notification::Disconnected { .. } => return false,
                Notification::Error(e) => eprintln!("{e}"),
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if let Some(snapshot) = engine.snapshot().await? {
        println!("{snapshot}");
    }
    if !finished {
        eprintln!("Inspection of {target} did not complete");
    }

    engine.shutdown().await?;
    Ok(())
}
