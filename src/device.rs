//! Raw storage behind the page store: a file (optionally memory-mapped for
//! reads) or an in-memory page map.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::Path,
};

use fs2::FileExt;
use log::{debug, warn};
use memmap2::Mmap;

use crate::{
    error::Error,
    flags::EnvFlags,
    page::Page,
    types::{DbResult, Result},
};

pub(crate) enum Device {
    File(FileDevice),
    Memory(MemoryDevice),
}

impl Device {
    pub fn create<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        mode: u32,
        page_size: usize,
    ) -> Result<Self> {
        Ok(Device::File(FileDevice::create(path, flags, mode, page_size)?))
    }

    pub fn open<P: AsRef<Path>>(path: P, flags: EnvFlags, page_size: usize) -> Result<Self> {
        Ok(Device::File(FileDevice::open(path, flags, page_size)?))
    }

    pub fn new_in_memory(page_size: usize) -> Self {
        Device::Memory(MemoryDevice::new(page_size))
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> DbResult {
        match self {
            Device::File(d) => d.read(offset, buf),
            Device::Memory(d) => d.read(offset, buf),
        }
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> DbResult {
        match self {
            Device::File(d) => d.write(offset, data),
            Device::Memory(d) => d.write(offset, data),
        }
    }

    pub fn read_page(&self, page: &mut Page) -> DbResult {
        match self {
            Device::File(d) => d.read(page.address(), page.raw_data_mut()),
            Device::Memory(d) => d.read(page.address(), page.raw_data_mut()),
        }?;
        page.set_dirty(false);
        Ok(())
    }

    pub fn write_page(&mut self, page: &Page) -> DbResult {
        self.write(page.address(), page.raw_data())
    }

    /// Extend the backing store by one page and return its address.
    pub fn alloc_page(&mut self) -> Result<u64> {
        match self {
            Device::File(d) => d.alloc_pages(1),
            Device::Memory(d) => d.alloc_pages(1),
        }
    }

    /// Extend the backing store by `count` contiguous pages and return the
    /// address of the first.
    pub fn alloc_pages(&mut self, count: usize) -> Result<u64> {
        match self {
            Device::File(d) => d.alloc_pages(count),
            Device::Memory(d) => d.alloc_pages(count),
        }
    }

    pub fn truncate(&mut self, size: u64) -> DbResult {
        match self {
            Device::File(d) => d.truncate(size),
            Device::Memory(_) => Err(Error::NotImplemented),
        }
    }

    pub fn filesize(&self) -> Result<u64> {
        match self {
            Device::File(d) => Ok(d.size),
            Device::Memory(_) => Err(Error::NotImplemented),
        }
    }

    pub fn flush(&mut self) -> DbResult {
        match self {
            Device::File(d) => d.flush(),
            Device::Memory(_) => Ok(()),
        }
    }

    pub fn close(&mut self) -> DbResult {
        match self {
            Device::File(d) => d.close(),
            Device::Memory(_) => Ok(()),
        }
    }
}

pub(crate) struct FileDevice {
    file: File,
    mmap: Option<Mmap>,
    page_size: usize,
    read_only: bool,
    size: u64,
}

impl FileDevice {
    fn create<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        mode: u32,
        page_size: usize,
    ) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options.open(&path).map_err(Error::Io)?;
        Self::lock(&file, false)?;

        let mut device = Self {
            file,
            mmap: None,
            page_size,
            read_only: false,
            size: 0,
        };
        device.remap(flags);
        Ok(device)
    }

    fn open<P: AsRef<Path>>(path: P, flags: EnvFlags, page_size: usize) -> Result<Self> {
        let read_only = flags.contains(EnvFlags::READ_ONLY);
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(Error::Io)?;
        Self::lock(&file, read_only)?;

        let size = file.metadata().map_err(Error::Io)?.len();
        let mut device = Self {
            file,
            mmap: None,
            page_size,
            read_only,
            size,
        };
        device.remap(flags);
        Ok(device)
    }

    fn lock(file: &File, shared: bool) -> DbResult {
        let st = if shared {
            fs2::FileExt::try_lock_shared(file)
        } else {
            fs2::FileExt::try_lock_exclusive(file)
        };
        st.map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                Error::WouldBlock
            } else {
                Error::Io(e)
            }
        })
    }

    /// (Re-)establish the read map. Mapping is skipped when disabled, when
    /// the page size is not a multiple of the OS granularity, or when the
    /// file is still empty. Failures fall back to plain reads.
    fn remap(&mut self, flags: EnvFlags) {
        self.mmap = None;
        if flags.contains(EnvFlags::DISABLE_MMAP) {
            return;
        }
        if self.page_size % page_granularity() != 0 {
            debug!(
                "page size {} is not aligned to the OS granularity, mmap disabled",
                self.page_size
            );
            return;
        }
        if self.size == 0 {
            return;
        }
        match unsafe { Mmap::map(&self.file) } {
            Ok(map) => self.mmap = Some(map),
            Err(e) => {
                warn!("mmap failed, falling back to plain reads: {}", e);
            }
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> DbResult {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of file",
            )));
        }
        if let Some(map) = &self.mmap {
            let end = offset as usize + buf.len();
            if end <= map.len() {
                buf.copy_from_slice(&map[offset as usize..end]);
                return Ok(());
            }
            // the file has grown past the map; fall through to a plain read
        }
        read_at(&self.file, offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> DbResult {
        if self.read_only {
            return Err(Error::WriteProtected);
        }
        write_at(&self.file, offset, data)?;
        if offset + data.len() as u64 > self.size {
            self.size = offset + data.len() as u64;
        }
        Ok(())
    }

    fn alloc_pages(&mut self, count: usize) -> Result<u64> {
        if self.read_only {
            return Err(Error::WriteProtected);
        }
        let address = self.size;
        self.size += (self.page_size * count) as u64;
        self.file.set_len(self.size).map_err(Error::Io)?;
        Ok(address)
    }

    fn truncate(&mut self, size: u64) -> DbResult {
        if self.read_only {
            return Err(Error::WriteProtected);
        }
        self.file.set_len(size).map_err(Error::Io)?;
        self.size = size;
        if let Some(map) = &self.mmap {
            if map.len() as u64 > size {
                self.mmap = None;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> DbResult {
        self.file.sync_data().map_err(Error::Io)
    }

    fn close(&mut self) -> DbResult {
        self.mmap = None;
        self.file.unlock().map_err(Error::Io)?;
        Ok(())
    }
}

/// Page map backing an in-memory environment. Addresses are handed out the
/// same way the file device does it, so the upper layers cannot tell the
/// difference.
pub(crate) struct MemoryDevice {
    pages: HashMap<u64, Vec<u8>>,
    page_size: usize,
    size: u64,
}

impl MemoryDevice {
    fn new(page_size: usize) -> Self {
        Self {
            pages: HashMap::new(),
            page_size,
            size: 0,
        }
    }

    fn page_of(&self, offset: u64) -> u64 {
        offset - offset % self.page_size as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> DbResult {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page_addr = self.page_of(pos);
            let in_page = (pos - page_addr) as usize;
            let chunk = std::cmp::min(buf.len() - done, self.page_size - in_page);
            match self.pages.get(&page_addr) {
                Some(data) => {
                    buf[done..done + chunk].copy_from_slice(&data[in_page..in_page + chunk])
                }
                None => {
                    for b in buf[done..done + chunk].iter_mut() {
                        *b = 0;
                    }
                }
            }
            done += chunk;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> DbResult {
        let page_size = self.page_size;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page_addr = self.page_of(pos);
            let in_page = (pos - page_addr) as usize;
            let chunk = std::cmp::min(data.len() - done, page_size - in_page);
            let page = self
                .pages
                .entry(page_addr)
                .or_insert_with(|| vec![0u8; page_size]);
            page[in_page..in_page + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        if offset + data.len() as u64 > self.size {
            self.size = offset + data.len() as u64;
        }
        Ok(())
    }

    fn alloc_pages(&mut self, count: usize) -> Result<u64> {
        let address = self.size;
        self.size += (self.page_size * count) as u64;
        Ok(address)
    }
}

#[cfg(unix)]
fn page_granularity() -> usize {
    // the engine's minimum page size is 1 KiB; 4 KiB covers every platform
    // this runs on
    4096
}

#[cfg(not(unix))]
fn page_granularity() -> usize {
    4096
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> DbResult {
    use std::os::unix::fs::FileExt as UnixFileExt;
    file.read_exact_at(buf, offset).map_err(Error::Io)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> DbResult {
    use std::os::unix::fs::FileExt as UnixFileExt;
    file.write_all_at(data, offset).map_err(Error::Io)
}

#[cfg(not(unix))]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> DbResult {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
    f.read_exact(buf).map_err(Error::Io)
}

#[cfg(not(unix))]
fn write_at(file: &File, offset: u64, data: &[u8]) -> DbResult {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
    f.write_all(data).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trip() {
        let mut device = Device::new_in_memory(1024);
        let addr = device.alloc_page().unwrap();
        assert_eq!(addr, 0);
        device.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        device.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn memory_device_rejects_truncate() {
        let mut device = Device::new_in_memory(1024);
        assert!(matches!(device.truncate(0), Err(Error::NotImplemented)));
    }

    #[test]
    fn memory_device_read_past_end() {
        let device = Device::new_in_memory(1024);
        let mut buf = [0u8; 4];
        assert!(matches!(device.read(0, &mut buf), Err(Error::Io(_))));
    }
}
