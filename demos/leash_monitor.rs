use pebbleash::{
    ChannelSubscriber, IndicatorStatus, ProximityWatcher, Result, WatcherConfig, WatcherError,
    WatcherEvent, WatcherState,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("⌚ Pebbleash Leash Monitor Example (v{})", pebbleash::VERSION);
    info!("Press Ctrl+C to stop watching");

    let (subscriber, mut events) = ChannelSubscriber::new();
    let watcher = ProximityWatcher::with_bluetooth(WatcherConfig::default());
    watcher.set_subscriber(&subscriber).await;
    watcher.start().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watcher...");
                break;
            }
            event = events.recv() => match event {
                Some(WatcherEvent::StateChanged { state, error }) => {
                    let status = IndicatorStatus::from(state);
                    println!("📡 {state:<10} │ badge {} ({status})", status.badge_number());

                    if !state.is_active() {
                        info!("💤 Watcher is not running");
                    }
                    if state == WatcherState::Error {
                        match error {
                            WatcherError::Unauthorized => error!("❌ Bluetooth access was denied"),
                            WatcherError::Unsupported => error!("❌ Bluetooth LE is not available"),
                            WatcherError::Okay => {}
                        }
                    }
                    if let Some(target) = watcher.target().await {
                        if state == WatcherState::Connected {
                            info!("✅ Linked with {}", target);
                        }
                    }
                }
                Some(WatcherEvent::SignalStrength(rssi)) => {
                    println!("📶 {rssi}");
                }
                None => break,
            },
        }
    }

    watcher.stop().await?;
    info!("👋 Watcher stopped");
    Ok(())
}
