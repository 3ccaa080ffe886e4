//! The physical write-ahead log: an append-only file of page images with a
//! fixed trailer per entry. The payload is written before the trailer so a
//! torn write is detectable; iteration walks backward from the end of the
//! file, one trailer at a time.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    device::Device,
    error::Error,
    io::{get_u32, get_u64, set_u32, set_u64},
    types::{DbResult, Result},
};

/// "hlog"
const LOG_MAGIC: u32 =
    ((b'h' as u32) << 24) | ((b'l' as u32) << 16) | ((b'o' as u32) << 8) | (b'g' as u32);

/// File header: magic, last committed lsn, reserved.
const LOG_HEADER_SIZE: u64 = 16;

/// Entry trailer: lsn, flags, pad, offset, data size.
const ENTRY_SIZE: u64 = 32;

/// Set on the last entry of a committed change set.
pub(crate) const ENTRY_CHANGESET_COMPLETE: u32 = 1;

pub(crate) struct Wal {
    file: File,
    /// Last committed lsn, persisted in the file header.
    lsn: u64,
    /// Current end of file.
    tail: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WalEntry {
    pub lsn: u64,
    pub flags: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Wal {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::Io)?;
        let mut wal = Self {
            file,
            lsn: 0,
            tail: LOG_HEADER_SIZE,
        };
        wal.write_header()?;
        Ok(wal)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(Error::Io)?;

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|_| Error::LogInvFileHeader)?;
        if get_u32(&header, 0) != LOG_MAGIC {
            warn!("logfile has unknown magic or is corrupt");
            return Err(Error::LogInvFileHeader);
        }
        let lsn = get_u64(&header, 4);
        let tail = file.metadata().map_err(Error::Io)?.len();
        Ok(Self { file, lsn, tail })
    }

    pub fn is_empty(&self) -> bool {
        self.tail <= LOG_HEADER_SIZE
    }

    pub fn last_lsn(&self) -> u64 {
        self.lsn
    }

    /// Append one page image. `complete` marks the end of a change set.
    pub fn append_page(
        &mut self,
        lsn: u64,
        offset: u64,
        data: &[u8],
        complete: bool,
    ) -> DbResult {
        let mut entry = [0u8; ENTRY_SIZE as usize];
        set_u64(&mut entry, 0, lsn);
        set_u32(
            &mut entry,
            8,
            if complete { ENTRY_CHANGESET_COMPLETE } else { 0 },
        );
        set_u64(&mut entry, 16, offset);
        set_u64(&mut entry, 24, data.len() as u64);

        self.file.seek(SeekFrom::Start(self.tail)).map_err(Error::Io)?;
        // payload first, trailer last: a torn write leaves a trailer-less
        // tail which the next open ignores
        self.file.write_all(data).map_err(Error::Io)?;
        self.file.write_all(&entry).map_err(Error::Io)?;
        self.tail += data.len() as u64 + ENTRY_SIZE;
        Ok(())
    }

    pub fn flush(&mut self) -> DbResult {
        self.file.sync_data().map_err(Error::Io)
    }

    /// Persist `lsn` as the last committed lsn and drop all entries.
    pub fn checkpoint(&mut self, lsn: u64) -> DbResult {
        self.lsn = lsn;
        self.write_header()?;
        self.file.set_len(LOG_HEADER_SIZE).map_err(Error::Io)?;
        self.tail = LOG_HEADER_SIZE;
        Ok(())
    }

    /// Read the entry whose trailer ends at `*cursor`; moves the cursor to
    /// the start of that entry. Returns `None` at the file header.
    pub fn read_prev(&mut self, cursor: &mut u64) -> Result<Option<WalEntry>> {
        if *cursor <= LOG_HEADER_SIZE + ENTRY_SIZE {
            return Ok(None);
        }
        let trailer_at = *cursor - ENTRY_SIZE;
        let mut trailer = [0u8; ENTRY_SIZE as usize];
        self.file
            .seek(SeekFrom::Start(trailer_at))
            .map_err(Error::Io)?;
        self.file.read_exact(&mut trailer).map_err(Error::Io)?;

        let lsn = get_u64(&trailer, 0);
        let flags = get_u32(&trailer, 8);
        let offset = get_u64(&trailer, 16);
        let data_size = get_u64(&trailer, 24);

        if data_size > trailer_at - LOG_HEADER_SIZE {
            return Err(Error::LogInvFileHeader);
        }
        let data_at = trailer_at - data_size;
        let mut data = vec![0u8; data_size as usize];
        self.file.seek(SeekFrom::Start(data_at)).map_err(Error::Io)?;
        self.file.read_exact(&mut data).map_err(Error::Io)?;

        *cursor = data_at;
        Ok(Some(WalEntry {
            lsn,
            flags,
            offset,
            data,
        }))
    }

    /// Replay the log against the device: walk entries newest to oldest; if
    /// the newest entry does not close a change set the log is discarded as
    /// an incomplete commit. Otherwise the entries are applied oldest first
    /// and the log is truncated.
    pub fn recover(&mut self, device: &mut Device) -> Result<u64> {
        let mut entries = Vec::new();
        let mut cursor = self.tail;
        let mut first = true;

        loop {
            let entry = match self.read_prev(&mut cursor) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                // a torn tail leaves arbitrary bytes where the newest
                // trailer should be; the unfinished change set is dropped
                Err(_) if first => {
                    info!("log tail is torn and will be ignored");
                    let lsn = self.lsn;
                    self.checkpoint(lsn)?;
                    return Ok(lsn);
                }
                Err(e) => return Err(e),
            };
            if first {
                if entry.flags & ENTRY_CHANGESET_COMPLETE == 0 {
                    info!("log is incomplete and will be ignored");
                    let lsn = self.lsn;
                    self.checkpoint(lsn)?;
                    return Ok(lsn);
                }
                first = false;
            }
            entries.push(entry);
        }

        let mut filesize = device.filesize()?;
        let mut last_lsn = self.lsn;
        for entry in entries.iter().rev() {
            debug!(
                "recovering page at 0x{:x}, lsn {}",
                entry.offset, entry.lsn
            );
            if entry.offset == filesize {
                filesize += entry.data.len() as u64;
            }
            device.write(entry.offset, &entry.data)?;
            last_lsn = std::cmp::max(last_lsn, entry.lsn);
        }
        device.flush()?;

        self.checkpoint(last_lsn)?;
        Ok(last_lsn)
    }

    pub fn close(&mut self, clear: bool) -> DbResult {
        if clear {
            let lsn = self.lsn;
            self.checkpoint(lsn)?;
        } else {
            self.write_header()?;
        }
        self.file.sync_all().map_err(Error::Io)?;
        Ok(())
    }

    fn write_header(&mut self) -> DbResult {
        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        set_u32(&mut header, 0, LOG_MAGIC);
        set_u64(&mut header, 4, self.lsn);
        self.file.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        self.file.write_all(&header).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> PathBuf {
        let dir = std::env::temp_dir();
        dir.join(format!("wal-test-{}.log0", std::process::id()))
    }

    #[test]
    fn append_and_iterate_backward() {
        let path = temp_log();
        let mut wal = Wal::create(&path).unwrap();
        wal.append_page(1, 0, &[0xaa; 64], false).unwrap();
        wal.append_page(1, 64, &[0xbb; 64], true).unwrap();

        let mut cursor = wal.tail;
        let newest = wal.read_prev(&mut cursor).unwrap().unwrap();
        assert_eq!(newest.offset, 64);
        assert_eq!(newest.flags, ENTRY_CHANGESET_COMPLETE);
        let older = wal.read_prev(&mut cursor).unwrap().unwrap();
        assert_eq!(older.offset, 0);
        assert_eq!(older.data, vec![0xaa; 64]);
        assert!(wal.read_prev(&mut cursor).unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn checkpoint_clears_entries() {
        let path = temp_log();
        let mut wal = Wal::create(&path).unwrap();
        wal.append_page(7, 0, &[1; 16], true).unwrap();
        wal.checkpoint(7).unwrap();
        assert!(wal.is_empty());
        drop(wal);

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.last_lsn(), 7);
        assert!(wal.is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bad_magic_is_rejected() {
        let path = temp_log();
        std::fs::write(&path, b"not a log file at all").unwrap();
        assert!(matches!(Wal::open(&path), Err(Error::LogInvFileHeader)));
        std::fs::remove_file(&path).ok();
    }
}
