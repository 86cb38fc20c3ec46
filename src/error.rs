//! Error types for the NTFS metadata runtime.
//!
//! Errors are value-returning, never panicking. Structural corruption is
//! surfaced to the caller as-is; the runtime does not attempt repair.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur while reading NTFS metadata structures.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("master file table has already been read")]
    AlreadyInitialized,

    #[error("offset {offset} is out of bounds (max: {max})")]
    OutOfBounds { offset: u64, max: u64 },

    #[error("missing {0}")]
    MissingValue(&'static str),

    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("corrupt data runs at offset {offset}: {reason}")]
    CorruptRuns { offset: u64, reason: String },

    #[error("corrupt allocation bitmap: {0}")]
    CorruptBitmap(String),

    #[error("truncated attribute at offset {offset}")]
    TruncatedAttribute { offset: u64 },

    #[error("unknown attribute kind {kind:#010x} at offset {offset}")]
    UnknownAttributeKind { kind: u32, offset: u64 },

    #[error("attribute list reference cycle involving MFT entry {entry}")]
    CyclicAttributeList { entry: u64 },

    #[error("MFT entry {index} is out of range ({count} entries)")]
    EntryOutOfRange { index: u64, count: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session still has outstanding entry references")]
    BusyOnRelease,

    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    /// Wraps the error with a description of the structure being read, so
    /// callers see which entry or attribute failed without losing the cause.
    pub fn with_context(self, message: impl Into<String>) -> FsError {
        FsError::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Walks the cause chain to the underlying error.
    pub fn root_cause(&self) -> &FsError {
        match self {
            FsError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
