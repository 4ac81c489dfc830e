//! # Heatmiser UH1 Core Library
//!
//! Talks the Heatmiser V3 protocol to PRT and PRT-HW thermostats behind a
//! UH1 wiring centre, over a serial line or a serial-over-TCP adapter:
//! - Frame codec with CRC-16/CCITT checksum
//! - DCB register map for both models
//! - One shared link with per-transaction timeouts and pacing
//! - Cached device state that keeps serving values while a device is offline
//! - Virtual UH1 bus for tests and demos
//! - CLI with exit codes
//!
//! ## Example
//!
//! ```rust,no_run
//! use heatmiser_core::{Hub, LinkConfig, Model, PollOutcome, Setting};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let devices = [(1, Model::Prt), (2, Model::PrtHw)];
//!     let hub = Hub::open_link("socket://192.168.1.50:1024", &devices, LinkConfig::default()).await?;
//!
//!     for (id, outcome) in hub.poll_all().await {
//!         if let PollOutcome::Offline(reason) = outcome {
//!             println!("{id}: {reason}");
//!         }
//!     }
//!
//!     hub.write_attribute(1, Setting::TargetTemperature(21)).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{DeviceConfig, HubConfig};
pub use crate::core::device::{DeviceCache, DeviceState};
pub use crate::core::error::{HubError, HubResult};
pub use crate::core::hub::{Hub, PollOutcome, Reading, Setting};
pub use crate::core::logger::{FrameTrace, TraceFormat};
pub use crate::core::protocol::dcb::{AttributeValue, Dcb, HotWaterMode, Model, Register, RunMode};
pub use crate::core::session::{LinkConfig, LinkEvent, LinkSession, LinkState};
pub use crate::core::simulator::{VirtualBus, VirtualThermostat};
pub use crate::core::transport::{SerialConfig, TcpConfig, Transport, TransportType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
