//! Errors surfaced by the link session and hub

use super::protocol::{dcb::Model, frame::FrameError};
use super::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Result alias for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Failures of a single transaction or hub call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    /// Response failed its checksum
    #[error("device {device}: {source}")]
    Checksum {
        /// Device addressed
        device: u8,
        /// Decoder detail
        source: FrameError,
    },

    /// Response was malformed
    #[error("device {device}: protocol error: {detail}")]
    Protocol {
        /// Device addressed
        device: u8,
        /// What was wrong
        detail: String,
    },

    /// No complete response within the window
    #[error("device {device} did not answer within {timeout:?}")]
    DeviceTimeout {
        /// Device addressed
        device: u8,
        /// Window that elapsed
        timeout: Duration,
    },

    /// Transport could not be opened or failed mid-transaction
    #[error("link error: {0}")]
    Link(String),

    /// Serial port named in the link address does not exist
    #[error("serial port not found: {0}")]
    PortNotFound(String),

    /// Link stayed busy for the whole acquisition window
    #[error("link busy for {0:?}")]
    ContentionTimeout(Duration),

    /// Requested value outside the accepted range
    #[error("{attribute} = {value} outside {min}..={max}")]
    InvalidAttributeRange {
        /// Attribute name
        attribute: &'static str,
        /// Rejected value
        value: i64,
        /// Lowest accepted value
        min: i64,
        /// Highest accepted value
        max: i64,
    },

    /// Attribute does not exist on this model
    #[error("{attribute} is not supported by {model}")]
    UnsupportedByModel {
        /// Attribute name
        attribute: &'static str,
        /// Device model
        model: Model,
    },

    /// Device id not configured
    #[error("unknown device {0}")]
    UnknownDevice(u8),
}

impl HubError {
    /// Build from a frame decoding failure
    pub fn from_frame(device: u8, err: FrameError) -> Self {
        if err.is_checksum() {
            HubError::Checksum { device, source: err }
        } else {
            HubError::Protocol {
                device,
                detail: err.to_string(),
            }
        }
    }

    /// Fault isolated to one device; the link is still usable
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            HubError::Checksum { .. } | HubError::Protocol { .. } | HubError::DeviceTimeout { .. }
        )
    }

    /// Fault of the shared link; every device is affected
    pub fn is_link_fault(&self) -> bool {
        matches!(self, HubError::Link(_) | HubError::PortNotFound(_))
    }

    /// Rejected before anything was sent
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            HubError::InvalidAttributeRange { .. }
                | HubError::UnsupportedByModel { .. }
                | HubError::UnknownDevice(_)
        )
    }
}

impl From<TransportError> for HubError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PortNotFound(port) => HubError::PortNotFound(port),
            other => HubError::Link(other.to_string()),
        }
    }
}
