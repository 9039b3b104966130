#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pebbleash ⌚
//!
//! Keep a Bluetooth Low Energy wearable on a leash.
//!
//! [`ProximityWatcher`] finds a Pebble-style wearable, links with it and
//! reports how close it is by sampling the link's signal strength. Owners
//! start and stop the watcher and receive state changes and signal strength
//! samples through a [`Subscriber`].
//!
//! ## States
//!
//! | State        | Meaning                                                      |
//! |--------------|--------------------------------------------------------------|
//! | `Off`        | Switched off                                                 |
//! | `Unknown`    | Starting, waiting for the radio to report readiness          |
//! | `Error`      | Not authorized to use Bluetooth, or Bluetooth LE unsupported |
//! | `Idle`       | Radio powered off or not scanning yet                        |
//! | `Searching`  | Scanning for the wearable                                    |
//! | `Connecting` | Connecting to a found wearable                               |
//! | `Connected`  | Linked; signal strength samples flow                         |
//!
//! A lost link sends the watcher back to `Searching`. Only `stop()` leaves
//! `Error`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pebbleash::{ChannelSubscriber, IndicatorStatus, ProximityWatcher, WatcherConfig, WatcherEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (subscriber, mut events) = ChannelSubscriber::new();
//!     let watcher = ProximityWatcher::with_bluetooth(WatcherConfig::default());
//!     watcher.set_subscriber(&subscriber).await;
//!     watcher.start().await;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             WatcherEvent::StateChanged { state, .. } => {
//!                 println!("{state} (badge {})", IndicatorStatus::from(state).badge_number());
//!             }
//!             WatcherEvent::SignalStrength(rssi) => println!("{rssi}"),
//!         }
//!     }
//!
//!     watcher.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! Enable the `mock` feature for [`mock::MockRadio`], a scriptable in-memory
//! radio that lets downstream tests drive a watcher without hardware.

/// Bluetooth Low Energy radio backed by btleplug
pub mod ble;
/// Error types and handling
pub mod error;
/// Status indicator derived from the watcher state
pub mod indicator;
pub mod machine;
/// Radio abstraction driven by the watcher
pub mod radio;
/// Event delivery to the watcher's owner
pub mod subscriber;
/// Type definitions and data structures
pub mod types;
/// The proximity watcher
pub mod watcher;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export the main types for convenient usage
pub use ble::BtleplugRadio;
pub use error::{LeashError, Result};
pub use indicator::IndicatorStatus;
pub use radio::{EventSink, Radio, RadioEvent};
pub use subscriber::{ChannelSubscriber, Subscriber, WatcherEvent};
pub use types::{
    Advertisement, RevocationPolicy, Rssi, Target, TargetFilter, WatcherConfig, WatcherError,
    WatcherSnapshot, WatcherState,
};
pub use watcher::ProximityWatcher;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bluetooth SIG company identifier of Pebble Technology
///
/// Carried in the manufacturer data of Pebble advertisements and used by the
/// default [`TargetFilter`].
pub const PEBBLE_MANUFACTURER_ID: u16 = 0x0154;
