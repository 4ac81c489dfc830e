//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Parsing of `set` command arguments

pub mod args;
pub mod exit_codes;

pub use args::{parse_setting, SETTING_USAGE};
pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
