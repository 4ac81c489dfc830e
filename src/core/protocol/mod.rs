//! Heatmiser V3 protocol
//!
//! - CRC-16/CCITT checksum
//! - Request and response frames
//! - DCB register map and value decoding

pub mod checksum;
pub mod dcb;
pub mod frame;

pub use checksum::Crc16;
pub use dcb::{AttributeValue, Dcb, Model, Register};
pub use frame::{decode_read_response, decode_write_ack, encode_read, encode_write, FrameError, Operation, WriteAck};
