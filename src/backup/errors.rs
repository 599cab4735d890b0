//! Backup service errors
//!
//! Backup errors are ERROR severity: a failed backup never changes the
//! live dataset. Restore failures are wrapped with their own code so the
//! caller can still tell an abort from a partially applied restore.

use std::fmt;
use std::io;

use crate::catalog::CatalogError;
use crate::content_store::BlobError;
use crate::restore::RestoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    /// Live data may be a mix of two datasets
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
pub enum BackupErrorCode {
    /// General backup creation failure
    RvBackupFailed,
    /// I/O failure in the blob store or catalog
    RvBackupIo,
    /// Unknown backup id or blob hash
    RvBackupNotFound,
    /// Another create, restore or delete is running
    RvBackupBusy,
    /// A referenced blob failed verification
    RvBackupIntegrity,
    /// Cloud provider missing, already set, or failing
    RvBackupCloud,
    /// Malformed archive on import
    RvBackupArchive,
    /// Restore aborted before the swap
    RvBackupRestoreAborted,
    /// Restore failed after the swap began
    RvBackupRestoreInconsistent,
}

impl BackupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupErrorCode::RvBackupFailed => "RV_BACKUP_FAILED",
            BackupErrorCode::RvBackupIo => "RV_BACKUP_IO",
            BackupErrorCode::RvBackupNotFound => "RV_BACKUP_NOT_FOUND",
            BackupErrorCode::RvBackupBusy => "RV_BACKUP_BUSY",
            BackupErrorCode::RvBackupIntegrity => "RV_BACKUP_INTEGRITY",
            BackupErrorCode::RvBackupCloud => "RV_BACKUP_CLOUD",
            BackupErrorCode::RvBackupArchive => "RV_BACKUP_ARCHIVE",
            BackupErrorCode::RvBackupRestoreAborted => "RV_BACKUP_RESTORE_ABORTED",
            BackupErrorCode::RvBackupRestoreInconsistent => "RV_BACKUP_RESTORE_INCONSISTENT",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            BackupErrorCode::RvBackupRestoreInconsistent => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for BackupErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct BackupError {
    code: BackupErrorCode,
    message: String,
    source: Option<io::Error>,
}

impl BackupError {
    fn new(code: BackupErrorCode, message: impl Into<String>, source: Option<io::Error>) -> Self {
        Self {
            code,
            message: message.into(),
            source,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::RvBackupFailed, message, None)
    }

    pub fn io_error(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(BackupErrorCode::RvBackupIo, message, Some(source))
    }

    pub fn io_error_at_path(path: &std::path::Path, source: io::Error) -> Self {
        Self::io_error(format!("I/O error at {}", path.display()), source)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::RvBackupNotFound, message, None)
    }

    pub fn busy() -> Self {
        Self::new(
            BackupErrorCode::RvBackupBusy,
            "another backup operation is in progress",
            None,
        )
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::RvBackupIntegrity, message, None)
    }

    pub fn cloud(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::RvBackupCloud, message, None)
    }

    pub fn archive(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::RvBackupArchive, message, None)
    }

    pub fn code(&self) -> BackupErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub fn is_not_found(&self) -> bool {
        self.code == BackupErrorCode::RvBackupNotFound
    }

    pub fn is_busy(&self) -> bool {
        self.code == BackupErrorCode::RvBackupBusy
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;

impl From<BlobError> for BackupError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(hash) => BackupError::not_found(format!("blob {} not found", hash)),
            BlobError::Integrity { hash, actual } => {
                BackupError::integrity(format!("blob {} hashes to {}", hash, actual))
            }
            BlobError::Undecodable { hash, reason } => {
                BackupError::integrity(format!("blob {} is not valid gzip: {}", hash, reason))
            }
            BlobError::InvalidHash(s) => BackupError::failed(format!("invalid blob hash '{}'", s)),
            BlobError::Io { context, source } => BackupError::io_error(context, source),
        }
    }
}

impl From<CatalogError> for BackupError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => BackupError::not_found(format!("backup #{} not found", id)),
            CatalogError::Io { context, source } => BackupError::io_error(context, source),
            other => BackupError::failed(other.to_string()),
        }
    }
}

impl From<RestoreError> for BackupError {
    fn from(err: RestoreError) -> Self {
        let code = if err.is_partially_applied() {
            BackupErrorCode::RvBackupRestoreInconsistent
        } else if err.code() == crate::restore::RestoreErrorCode::RvRestoreBusy {
            BackupErrorCode::RvBackupBusy
        } else {
            BackupErrorCode::RvBackupRestoreAborted
        };
        Self::new(code, err.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BackupErrorCode::RvBackupFailed.as_str(), "RV_BACKUP_FAILED");
        assert_eq!(BackupErrorCode::RvBackupBusy.as_str(), "RV_BACKUP_BUSY");
        assert_eq!(
            BackupErrorCode::RvBackupRestoreInconsistent.as_str(),
            "RV_BACKUP_RESTORE_INCONSISTENT"
        );
    }

    #[test]
    fn test_only_inconsistent_restore_is_fatal() {
        assert!(!BackupError::failed("x").is_fatal());
        assert!(!BackupError::integrity("x").is_fatal());
        let err: BackupError = RestoreError::partially_applied("overworld/r.0.0", "rename failed").into();
        assert!(err.is_fatal());
        assert!(err.message().contains("overworld/r.0.0"));
    }

    #[test]
    fn test_display_contains_code_and_cause() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let err = BackupError::io_error("writing catalog", io_err);
        let display = format!("{}", err);
        assert!(display.contains("ERROR"));
        assert!(display.contains("RV_BACKUP_IO"));
        assert!(display.contains("caused by: disk full"));
    }

    #[test]
    fn test_blob_not_found_maps() {
        let err: BackupError = BlobError::NotFound("ab".into()).into();
        assert!(err.is_not_found());
    }
}
