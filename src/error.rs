use std::{fmt, io, sync::Arc};

pub type Result<T> = std::result::Result<T, Error>;

/// How far an I/O failure reaches.
///
/// `Recoverable` means the log was rolled back to its last good length and only
/// the failing operation is lost. `Fatal` means the on-disk state is unknown and
/// the engine must stop accepting writes until it is resumed or reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

/// Errors are `Clone` so a single log failure can be handed to every member of
/// a write group.
#[derive(Debug, Clone)]
pub enum Error {
    Io {
        severity: Severity,
        context: &'static str,
        source: Arc<io::Error>,
    },
    InvalidArgument(String),
    /// Admission was refused for a `no_slowdown` writer.
    Incomplete(String),
    /// The engine hit a fatal background error and rejects writes.
    ReadOnly(String),
    InvalidData(String),
    InvalidHeader,
    InvalidWalMagic,
    UnsupportedWalVersion(u32),
    ChecksumMismatch,
    InvalidState(String),
    LockError(Arc<io::Error>),
    ShutdownInProgress,
}

impl Error {
    pub fn io(context: &'static str, severity: Severity, err: io::Error) -> Self {
        Error::Io {
            severity,
            context,
            source: Arc::new(err),
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            Error::Io { severity, .. } => Some(*severity),
            Error::ReadOnly(_) => Some(Severity::Fatal),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Some(Severity::Fatal)
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. })
    }

    /// Re-tags an I/O error as fatal. Other variants pass through unchanged.
    pub fn into_fatal(self) -> Self {
        match self {
            Error::Io {
                context, source, ..
            } => Error::Io {
                severity: Severity::Fatal,
                context,
                source,
            },
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io("io", Severity::Recoverable, err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io {
                severity,
                context,
                source,
            } => write!(f, "I/O error ({:?}) during {}: {}", severity, context, source),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Incomplete(msg) => write!(f, "Incomplete: {}", msg),
            Error::ReadOnly(msg) => write!(f, "Database is read-only: {}", msg),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::InvalidWalMagic => write!(f, "Invalid WAL magic"),
            Error::UnsupportedWalVersion(v) => write!(f, "Unsupported WAL version: {}", v),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::ShutdownInProgress => write!(f, "Shutdown in progress"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } | Error::LockError(source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        let recoverable = Error::io("append", Severity::Recoverable, io::Error::other("boom"));
        assert_eq!(recoverable.severity(), Some(Severity::Recoverable));
        assert!(!recoverable.is_fatal());

        let fatal = recoverable.clone().into_fatal();
        assert!(fatal.is_fatal());

        assert!(Error::ReadOnly("bg".into()).is_fatal());
        assert_eq!(Error::Incomplete("stall".into()).severity(), None);
    }

    #[test]
    fn test_clone_shares_source() {
        let err = Error::io("sync", Severity::Fatal, io::Error::other("disk gone"));
        let copy = err.clone();
        match (&err, &copy) {
            (Error::Io { source: a, .. }, Error::Io { source: b, .. }) => {
                assert!(Arc::ptr_eq(a, b))
            }
            _ => panic!("expected io errors"),
        }
        assert!(copy.to_string().contains("disk gone"));
    }
}
