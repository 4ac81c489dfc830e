//! Core module containing the Heatmiser protocol engine
//!
//! This module provides:
//! - Transport layer for serial and TCP links to a UH1 hub
//! - V3 frame codec, checksum and DCB register map
//! - Link session with one transaction on the bus at a time
//! - Device state cache
//! - Frame trace with timestamps
//! - Virtual UH1 bus for tests and demos
//! - Hub boundary: polling, settings and cached attribute reads

pub mod device;
pub mod error;
pub mod hub;
pub mod logger;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod transport;
