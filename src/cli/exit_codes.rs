//! CLI Exit Codes
//!
//! Exit codes for scripts driving the CLI.

use crate::config::ConfigError;
use crate::core::error::HubError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Link could not be opened or failed
    pub const LINK_FAILED: u8 = 3;

    /// Device did not answer in time
    pub const TIMEOUT: u8 = 4;

    /// Link stayed busy
    pub const LINK_BUSY: u8 = 5;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Bad checksum or malformed frame
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not configured
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Some devices did not answer a poll
    pub const PARTIAL: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Value rejected before sending
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

const ALL_CODES: &[u8] = &[
    ExitCodes::SUCCESS,
    ExitCodes::ERROR,
    ExitCodes::INVALID_ARGS,
    ExitCodes::LINK_FAILED,
    ExitCodes::TIMEOUT,
    ExitCodes::LINK_BUSY,
    ExitCodes::CONFIG_ERROR,
    ExitCodes::PROTOCOL_ERROR,
    ExitCodes::CANCELLED,
    ExitCodes::DEVICE_NOT_FOUND,
    ExitCodes::PARTIAL,
    ExitCodes::PORT_NOT_FOUND,
    ExitCodes::VALIDATION_FAILED,
    ExitCodes::INTERNAL_ERROR,
];

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for stderr
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Bad command-line input
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::INVALID_ARGS, msg.into())
    }

    /// Serial port missing
    pub fn port_not_found(port: &str) -> Self {
        Self::Error(ExitCodes::PORT_NOT_FOUND, format!("Port not found: {port}"))
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to `ExitCode`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&HubError> for CliResult {
    fn from(err: &HubError) -> Self {
        let code = match err {
            HubError::PortNotFound(port) => return Self::port_not_found(port),
            HubError::Checksum { .. } | HubError::Protocol { .. } => ExitCodes::PROTOCOL_ERROR,
            HubError::DeviceTimeout { .. } => ExitCodes::TIMEOUT,
            HubError::Link(_) => ExitCodes::LINK_FAILED,
            HubError::ContentionTimeout(_) => ExitCodes::LINK_BUSY,
            HubError::InvalidAttributeRange { .. } | HubError::UnsupportedByModel { .. } => {
                ExitCodes::VALIDATION_FAILED
            }
            HubError::UnknownDevice(_) => ExitCodes::DEVICE_NOT_FOUND,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<HubError> for CliResult {
    fn from(err: HubError) -> Self {
        Self::from(&err)
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::AddrInUse => ExitCodes::LINK_FAILED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Link failed",
        4 => "Device timeout",
        5 => "Link busy",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not configured",
        13 => "Some devices offline",
        14 => "Port not found",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for &code in ALL_CODES {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Link failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Link failed"));
    }

    #[test]
    fn test_from_hub_error() {
        let timeout = HubError::DeviceTimeout {
            device: 2,
            timeout: Duration::from_secs(3),
        };
        assert_eq!(CliResult::from(timeout).code(), ExitCodes::TIMEOUT);
        assert_eq!(
            CliResult::from(HubError::Link("refused".into())).code(),
            ExitCodes::LINK_FAILED
        );
        let missing = CliResult::from(HubError::PortNotFound("/dev/ttyUSB9".into()));
        assert_eq!(missing.code(), ExitCodes::PORT_NOT_FOUND);
        assert_eq!(missing.message(), Some("Port not found: /dev/ttyUSB9"));
        assert_eq!(
            CliResult::from(HubError::UnknownDevice(9)).code(),
            ExitCodes::DEVICE_NOT_FOUND
        );
        let range = HubError::InvalidAttributeRange {
            attribute: "target_temperature",
            value: 40,
            min: 5,
            max: 35,
        };
        assert_eq!(CliResult::from(range).code(), ExitCodes::VALIDATION_FAILED);
    }

    #[test]
    fn test_every_code_is_described() {
        for &code in ALL_CODES {
            assert_ne!(exit_code_description(code), "Unknown error");
        }
    }
}
