//! Flag sets accepted by the public calls. Unknown bits are rejected with
//! `InvalidParameter` at the call boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags for `Environment::create` / `Environment::open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Keep everything in memory, never touch the file system.
        const IN_MEMORY           = 0x0000_0001;
        /// Open the file read-only; writes fail with `WriteProtected`.
        const READ_ONLY           = 0x0000_0002;
        /// Maintain a physical write-ahead log for crash recovery.
        const ENABLE_RECOVERY     = 0x0000_0004;
        /// Replay a non-empty log automatically on open.
        const AUTO_RECOVERY       = 0x0000_0008;
        /// Allow `txn_begin`; operations can be grouped in transactions.
        const ENABLE_TRANSACTIONS = 0x0000_0010;
        /// fsync the log and the data file on every commit.
        const ENABLE_FSYNC        = 0x0000_0020;
        /// Never memory-map the data file, use plain reads.
        const DISABLE_MMAP        = 0x0000_0040;
        /// Fail with `CacheFull` instead of growing past the cache limit.
        const CACHE_STRICT        = 0x0000_0080;
        /// No cache limit at all (implied by `IN_MEMORY`).
        const CACHE_UNLIMITED     = 0x0000_0100;
        /// Close open databases and cursors automatically on `close`.
        const AUTO_CLEANUP        = 0x0000_0200;
        /// Keep the log contents on close (used by the recovery tests).
        const DONT_CLEAR_LOG      = 0x0000_0400;
    }
}

bitflags! {
    /// Flags for `create_db` / `open_db`, persisted in the descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// A key may carry more than one record.
        const ENABLE_DUPLICATE_KEYS = 0x0000_0001;
        /// Keys longer than the inline slot width spill into blobs.
        const ENABLE_EXTENDED_KEYS  = 0x0000_0002;
        /// Keys are auto-allocated 64bit record numbers.
        const RECORD_NUMBER         = 0x0000_0004;
    }
}

bitflags! {
    /// Flags for `insert` and `Cursor::insert`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        /// Replace the record if the key exists.
        const OVERWRITE               = 0x0000_0001;
        /// Add a duplicate if the key exists (duplicates must be enabled).
        const DUPLICATE               = 0x0000_0002;
        const DUPLICATE_INSERT_FIRST  = 0x0000_0004;
        const DUPLICATE_INSERT_LAST   = 0x0000_0008;
        const DUPLICATE_INSERT_BEFORE = 0x0000_0010;
        const DUPLICATE_INSERT_AFTER  = 0x0000_0020;
        /// Only the window described by the record's partial offset/size
        /// is written; the remainder is zero-filled (fresh records) or
        /// left untouched (overwrites).
        const PARTIAL                 = 0x0000_0040;
        /// Hint: the key sorts after every existing key.
        const HINT_APPEND             = 0x0000_0080;
        /// Hint: the key sorts before every existing key.
        const HINT_PREPEND            = 0x0000_0100;
    }
}

impl InsertFlags {
    pub(crate) fn any_duplicate(&self) -> bool {
        self.intersects(
            InsertFlags::DUPLICATE
                | InsertFlags::DUPLICATE_INSERT_FIRST
                | InsertFlags::DUPLICATE_INSERT_LAST
                | InsertFlags::DUPLICATE_INSERT_BEFORE
                | InsertFlags::DUPLICATE_INSERT_AFTER,
        )
    }
}

bitflags! {
    /// Flags for `find` and `Cursor::find`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FindFlags: u32 {
        const EXACT_MATCH = 0x0000_0001;
        /// Accept the nearest smaller key when there is no exact match.
        const LT_MATCH    = 0x0000_0002;
        /// Accept the nearest greater key when there is no exact match.
        const GT_MATCH    = 0x0000_0004;
        /// Read only the window described by the record's partial fields.
        const PARTIAL     = 0x0000_0040;
    }
}

impl FindFlags {
    /// `<=`: exact match, or the nearest smaller key.
    pub const LEQ_MATCH: FindFlags =
        FindFlags::from_bits_truncate(0x0000_0001 | 0x0000_0002);
    /// `>=`: exact match, or the nearest greater key.
    pub const GEQ_MATCH: FindFlags =
        FindFlags::from_bits_truncate(0x0000_0001 | 0x0000_0004);
    /// Exact match, or the nearest key in either direction.
    pub const NEAR_MATCH: FindFlags =
        FindFlags::from_bits_truncate(0x0000_0001 | 0x0000_0002 | 0x0000_0004);

    pub(crate) fn is_approximate(&self) -> bool {
        self.intersects(FindFlags::LT_MATCH | FindFlags::GT_MATCH)
    }
}

bitflags! {
    /// Flags for `Cursor::move_to`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CursorFlags: u32 {
        const FIRST           = 0x0000_0001;
        const LAST            = 0x0000_0002;
        const NEXT            = 0x0000_0004;
        const PREVIOUS        = 0x0000_0008;
        /// Step over remaining duplicates of the current key.
        const SKIP_DUPLICATES = 0x0000_0010;
        /// Stay on the current key, only move within its duplicates.
        const ONLY_DUPLICATES = 0x0000_0020;
    }
}

bitflags! {
    /// Flags for `txn_begin`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u32 {
        const READ_ONLY = 0x0000_0001;
    }
}

/// How an approximate find resolved, annotated on the returned key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// The key was found verbatim.
    Exact,
    /// The returned key is the nearest smaller one.
    Less,
    /// The returned key is the nearest greater one.
    Greater,
}
