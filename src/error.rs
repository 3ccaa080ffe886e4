use thiserror::Error;

/// All error kinds surfaced by the engine.
///
/// Structural errors (`IntegrityViolated`, `LogInvFileHeader`) are fatal to
/// the environment: the environment is marked closed and every further call
/// returns `InvalidParameter`. Everything else leaves the environment usable
/// with the current change set rolled back.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("invalid file header")]
    InvFileHeader,

    #[error("invalid file version")]
    InvFileVersion,

    #[error("invalid page size")]
    InvPageSize,

    #[error("invalid key size")]
    InvKeySize,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("blob not found")]
    BlobNotFound,

    #[error("integrity violated: {0}")]
    IntegrityViolated(String),

    #[error("database is write protected")]
    WriteProtected,

    #[error("environment is locked by another process")]
    WouldBlock,

    #[error("cache is full")]
    CacheFull,

    #[error("limits reached")]
    LimitsReached,

    #[error("recovery is required but not enabled")]
    NeedRecovery,

    #[error("log file has an invalid header")]
    LogInvFileHeader,

    #[error("transaction conflict")]
    TxnConflict,

    #[error("cursor is nil")]
    CursorIsNil,

    #[error("cursors are still open")]
    CursorStillOpen,

    #[error("not implemented in this mode")]
    NotImplemented,
}

impl Error {
    /// Errors which poison the environment. Once one of these happened the
    /// on-disk state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::IntegrityViolated(_) | Error::LogInvFileHeader)
    }
}
