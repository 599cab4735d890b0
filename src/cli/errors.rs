//! CLI-specific error types
//!
//! Every CLI error ends the process with exit code 1. Failures from the
//! backup service keep their own `RV_BACKUP_*` code.

use std::fmt;
use std::io;

use crate::backup::{BackupError, BackupErrorCode};
use crate::host::HostError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file missing or invalid
    ConfigError,
    /// I/O error (stdout, archive files)
    IoError,
    AlreadyInitialized,
    NotInitialized,
    /// Malformed command-line value
    InvalidArgument,
    /// Could not open the live dataset
    HostFailed,
    Backup(BackupErrorCode),
}

impl CliErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "RV_CLI_CONFIG_ERROR",
            Self::IoError => "RV_CLI_IO_ERROR",
            Self::AlreadyInitialized => "RV_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "RV_CLI_NOT_INITIALIZED",
            Self::InvalidArgument => "RV_CLI_INVALID_ARGUMENT",
            Self::HostFailed => "RV_CLI_HOST_FAILED",
            Self::Backup(code) => code.as_str(),
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn already_initialized() -> Self {
        Self::new(
            CliErrorCode::AlreadyInitialized,
            "State directory already initialized",
        )
    }

    pub fn not_initialized() -> Self {
        Self::new(
            CliErrorCode::NotInitialized,
            "State directory not initialized. Run 'regionvault init' first.",
        )
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<BackupError> for CliError {
    fn from(e: BackupError) -> Self {
        Self::new(CliErrorCode::Backup(e.code()), e.message())
    }
}

impl From<HostError> for CliError {
    fn from(e: HostError) -> Self {
        Self::new(CliErrorCode::HostFailed, e.to_string())
    }
}

pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_errors_keep_their_code() {
        let err: CliError = BackupError::busy().into();
        assert_eq!(err.code_str(), "RV_BACKUP_BUSY");
        assert!(err.to_string().starts_with("RV_BACKUP_BUSY: "));
    }

    #[test]
    fn test_config_error_code() {
        assert_eq!(CliError::config_error("x").code_str(), "RV_CLI_CONFIG_ERROR");
    }
}
