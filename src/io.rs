//! Volume I/O abstractions.
//!
//! The runtime reads a volume through the [`VolumeRead`] trait, allowing the
//! same parsing logic to work on raw disks, partition images, or in-memory
//! metadata dumps. Geometry values normally supplied by the boot sector are
//! carried separately in [`VolumeGeometry`]; boot-sector validation itself
//! happens upstream of this crate.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;
use parking_lot::Mutex;

use crate::error::{FsError, Result};

/// A source of raw volume bytes.
///
/// `read_at` is positional and takes `&self`; implementations either support
/// concurrent reads natively or serialize internally. Reads starting at or
/// past the end of the source return `Ok(0)`; reads crossing the end are
/// short.
pub trait VolumeRead: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;
}

/// Reads exactly `buf.len()` bytes at `offset` or fails.
///
/// Short reads surface as an I/O error; callers reading fixed-size records
/// translate that into record corruption.
pub(crate) fn read_exact_at(io: &dyn VolumeRead, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let count = io.read_at(offset + filled as u64, &mut buf[filled..])?;
        if count == 0 {
            return Err(FsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at offset {}", offset + filled as u64),
            )));
        }
        filled += count;
    }
    Ok(())
}

/// Volume layout values the runtime consumes, as decoded by the volume
/// opener from the boot sector.
#[derive(Debug, Clone)]
pub struct VolumeGeometry {
    pub bytes_per_sector: u16,
    pub cluster_size: u32,
    pub mft_entry_size: u32,
    pub mft_offset: u64,
    pub volume_size: u64,
}

impl VolumeGeometry {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.bytes_per_sector == 0 || !self.bytes_per_sector.is_power_of_two() {
            return Err(FsError::InvalidArgument("bytes per sector"));
        }
        if self.cluster_size == 0 || !self.cluster_size.is_power_of_two() {
            return Err(FsError::InvalidArgument("cluster size"));
        }
        if self.mft_entry_size < self.bytes_per_sector as u32
            || !self.mft_entry_size.is_power_of_two()
        {
            return Err(FsError::InvalidArgument("MFT entry size"));
        }
        Ok(())
    }
}

/// Memory-mapped volume image.
///
/// Preferred for image files: the kernel handles prefetching and page
/// management, and concurrent `read_at` calls need no locking. Block devices
/// may refuse mmap; callers fall back to [`FileImage`] in that case.
pub struct MmapImage {
    mmap: Mmap,
}

impl MmapImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let metadata = file.metadata()?;
        if metadata.len() == 0 {
            return Err(FsError::InvalidArgument("cannot map an empty image"));
        }
        // SAFETY: the mapping is read-only and forensic sources are treated
        // as immutable for the session's duration.
        let mmap = unsafe { Mmap::map(&file) }.map_err(FsError::Io)?;
        if mmap.is_empty() {
            return Err(FsError::InvalidArgument(
                "mmap returned an empty mapping (source not mappable)",
            ));
        }
        Ok(Self { mmap })
    }
}

impl VolumeRead for MmapImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.mmap.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let end = start.saturating_add(buf.len()).min(self.mmap.len());
        let count = end - start;
        buf[..count].copy_from_slice(&self.mmap[start..end]);
        Ok(count)
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

/// File-backed volume serialized through an internal mutex.
///
/// Used for block devices that do not support mmap. All reads go through one
/// seek-and-read critical section, which satisfies the requirement that I/O
/// on the underlying byte source is serialized.
pub struct FileImage {
    file: Mutex<File>,
    size: u64,
}

impl FileImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl VolumeRead for FileImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let count = file.read(&mut buf[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// In-memory volume, used for metadata dumps and tests.
pub struct MemImage {
    data: Vec<u8>,
}

impl MemImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl VolumeRead for MemImage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let end = start.saturating_add(buf.len()).min(self.data.len());
        let count = end - start;
        buf[..count].copy_from_slice(&self.data[start..end]);
        Ok(count)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
