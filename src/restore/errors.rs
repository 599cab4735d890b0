//! Restore error types
//!
//! Restore errors carry the label of the component or shard that failed.
//! Severity encodes whether live data was touched:
//! - ERROR: the restore was refused or aborted before any region file
//!   was replaced; the dataset is exactly as before
//! - FATAL: the failure happened after the swap began; on-disk data may
//!   be a mix of old and new and needs manual intervention

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreErrorCode {
    /// Generic refusal (bad scope, nothing to restore)
    RvRestoreFailed,
    /// Unknown backup id or missing blob
    RvRestoreNotFound,
    /// Backup failed its integrity check
    RvRestoreIntegrity,
    /// Another restore or backup is running
    RvRestoreBusy,
    /// Quiesce or staging failed; nothing on disk changed
    RvRestoreAborted,
    /// Failure after the swap started
    RvRestorePartiallyApplied,
}

impl RestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreErrorCode::RvRestoreFailed => "RV_RESTORE_FAILED",
            RestoreErrorCode::RvRestoreNotFound => "RV_RESTORE_NOT_FOUND",
            RestoreErrorCode::RvRestoreIntegrity => "RV_RESTORE_INTEGRITY",
            RestoreErrorCode::RvRestoreBusy => "RV_RESTORE_BUSY",
            RestoreErrorCode::RvRestoreAborted => "RV_RESTORE_ABORTED",
            RestoreErrorCode::RvRestorePartiallyApplied => "RV_RESTORE_PARTIALLY_APPLIED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RestoreErrorCode::RvRestorePartiallyApplied => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for RestoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct RestoreError {
    code: RestoreErrorCode,
    message: String,
    /// Shard or component label the failure came from
    component: Option<String>,
    source: Option<io::Error>,
}

impl RestoreError {
    fn new(code: RestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            component: None,
            source: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::RvRestoreFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::RvRestoreNotFound, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::RvRestoreIntegrity, message)
    }

    pub fn busy() -> Self {
        Self::new(
            RestoreErrorCode::RvRestoreBusy,
            "another backup or restore is in progress",
        )
    }

    /// Fatal failure before the swap; the restore is aborted.
    pub fn aborted(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::RvRestoreAborted, message).with_component(component)
    }

    /// Fatal failure once the swap began.
    pub fn partially_applied(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::RvRestorePartiallyApplied, message).with_component(component)
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Re-tags an abort as partially applied, keeping message and context.
    pub fn into_partially_applied(self) -> Self {
        Self {
            code: RestoreErrorCode::RvRestorePartiallyApplied,
            ..self
        }
    }

    pub fn code(&self) -> RestoreErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub fn is_partially_applied(&self) -> bool {
        self.code == RestoreErrorCode::RvRestorePartiallyApplied
    }
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code, self.message)?;
        if let Some(ref component) = self.component {
            write!(f, " (component: {})", component)?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for RestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type RestoreResult<T> = Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(RestoreErrorCode::RvRestoreAborted.as_str(), "RV_RESTORE_ABORTED");
        assert_eq!(
            RestoreErrorCode::RvRestorePartiallyApplied.as_str(),
            "RV_RESTORE_PARTIALLY_APPLIED"
        );
    }

    #[test]
    fn test_only_partial_is_fatal() {
        assert!(!RestoreError::aborted("overworld/r.0.0", "drain failed").is_fatal());
        assert!(!RestoreError::integrity("blob corrupt").is_fatal());
        let partial = RestoreError::partially_applied("overworld/r.1.0", "rename failed");
        assert!(partial.is_fatal());
        assert!(partial.is_partially_applied());
    }

    #[test]
    fn test_display_names_component() {
        let err = RestoreError::aborted("overworld/r.0.0", "I/O error")
            .with_source(io::Error::new(io::ErrorKind::Other, "disk gone"));
        let display = err.to_string();
        assert!(display.starts_with("[ERROR] RV_RESTORE_ABORTED"));
        assert!(display.contains("overworld/r.0.0"));
        assert!(display.contains("disk gone"));
    }

    #[test]
    fn test_into_partially_applied_keeps_context() {
        let err = RestoreError::aborted("nether/r.0.0", "boom").into_partially_applied();
        assert!(err.is_partially_applied());
        assert_eq!(err.component(), Some("nether/r.0.0"));
        assert_eq!(err.message(), "boom");
    }
}
