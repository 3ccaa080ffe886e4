//! Runtime parameters of an environment and its databases, validated once
//! at creation and carried unchanged afterwards.

use crate::{
    error::Error,
    flags::{DbFlags, EnvFlags},
    types::Result,
    utils::is_power_of_two,
};

pub const MIN_PAGE_SIZE: u32 = 1024;
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default cache limit in bytes.
pub const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;

pub const DEFAULT_MAX_DATABASES: u16 = 16;

/// Sub-page allocation granularity of the freelist, in bytes.
pub const CHUNK_SIZE: u32 = 32;

/// Default starting-address alignment for blobs.
pub const DEFAULT_BLOB_ALIGNMENT: u32 = 32;

/// Marker for "keys have no fixed size".
pub const KEY_SIZE_UNLIMITED: u32 = u32::MAX;

/// Marker for "records have no fixed size".
pub const RECORD_SIZE_UNLIMITED: u32 = u32::MAX;

/// Inline slot width used for unlimited-size keys. Longer keys spill their
/// tail into an extended-key blob.
pub const DEFAULT_INLINE_KEY_SIZE: u16 = 32;

/// Parameters for `Environment::create` / `Environment::open`.
#[derive(Debug, Clone)]
pub struct EnvParams {
    /// Page size in bytes; power of two in `[1024, 65536]`.
    pub page_size: u32,
    /// Cache limit in bytes.
    pub cache_size: usize,
    /// Number of descriptor slots reserved in the header page.
    pub max_databases: u16,
    /// Blob starting-address alignment; power of two >= 8.
    pub blob_alignment: u32,
    /// Directory for the physical log; defaults to the data file's.
    pub log_directory: Option<std::path::PathBuf>,
    /// File mode bits for created files (unix permissions).
    pub mode: u32,
}

impl Default for EnvParams {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            blob_alignment: DEFAULT_BLOB_ALIGNMENT,
            log_directory: None,
            mode: 0o644,
        }
    }
}

impl EnvParams {
    pub(crate) fn validate(&self, flags: EnvFlags) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !is_power_of_two(self.page_size as u64)
        {
            return Err(Error::InvPageSize);
        }
        if self.blob_alignment < 8 || !is_power_of_two(self.blob_alignment as u64) {
            return Err(Error::InvalidParameter);
        }
        if self.max_databases == 0 {
            return Err(Error::InvalidParameter);
        }
        // every descriptor must fit into the header page payload
        let payload = self.page_size as usize - crate::page::PAGE_HEADER_SIZE;
        let available = payload - crate::env::ENV_HEADER_FIXED_SIZE;
        if self.max_databases as usize * crate::env::DESCRIPTOR_SIZE > available {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(EnvFlags::IN_MEMORY)
            && flags.intersects(EnvFlags::ENABLE_RECOVERY | EnvFlags::AUTO_RECOVERY)
        {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(EnvFlags::AUTO_RECOVERY)
            && !flags.contains(EnvFlags::ENABLE_RECOVERY)
        {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Parameters for `create_db`.
#[derive(Debug, Clone)]
pub struct DbParams {
    /// Fixed key size in bytes, or `KEY_SIZE_UNLIMITED`.
    pub key_size: u32,
    /// Fixed record size in bytes, or `RECORD_SIZE_UNLIMITED`.
    pub record_size: u32,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            key_size: KEY_SIZE_UNLIMITED,
            record_size: RECORD_SIZE_UNLIMITED,
        }
    }
}

impl DbParams {
    pub(crate) fn validate(&self, flags: DbFlags) -> Result<()> {
        if flags.contains(DbFlags::RECORD_NUMBER)
            && self.key_size != KEY_SIZE_UNLIMITED
            && self.key_size != 8
        {
            return Err(Error::InvKeySize);
        }
        if self.key_size == 0 {
            return Err(Error::InvKeySize);
        }
        Ok(())
    }
}

/// The environment-wide configuration after validation.
#[derive(Debug, Clone)]
pub(crate) struct EnvConfig {
    pub flags: EnvFlags,
    pub page_size: u32,
    pub cache_size: usize,
    pub max_databases: u16,
    pub blob_alignment: u32,
    pub path: Option<std::path::PathBuf>,
    pub log_directory: Option<std::path::PathBuf>,
    pub mode: u32,
}

impl EnvConfig {
    pub fn page_payload(&self) -> usize {
        self.page_size as usize - crate::page::PAGE_HEADER_SIZE
    }

    pub fn is_in_memory(&self) -> bool {
        self.flags.contains(EnvFlags::IN_MEMORY)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(EnvFlags::READ_ONLY)
    }

    pub fn recovery_enabled(&self) -> bool {
        self.flags.contains(EnvFlags::ENABLE_RECOVERY)
    }

    /// Path of the physical log: `<data file>.log0`, possibly redirected
    /// into a dedicated log directory.
    pub fn log_path(&self) -> std::path::PathBuf {
        let data = self.path.as_ref().expect("in-memory envs have no log");
        let mut name = data
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".log0");
        match &self.log_directory {
            Some(dir) => dir.join(name),
            None => data.with_file_name(name),
        }
    }
}
