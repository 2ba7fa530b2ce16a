//! Architecture-aware memory mapping of partition files
//!
//! A partition is mapped read-write while it is a plain slot array, and read-only when it
//! is served from a decompressed copy of an archived file. In the latter case the mapping
//! owns the temporary copy and deletes it when dropped.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;
use std::io;
use tempfile::TempPath;

/// Maximum map size for different architectures
#[cfg(any(target_arch = "x86", target_arch = "arm"))]
pub const MAX_MAP_SIZE: usize = 0x7FFFFFFF; // 2GB for 32-bit

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const MAX_MAP_SIZE: usize = usize::MAX; // No practical limit on 64-bit

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "x86_64",
    target_arch = "aarch64"
)))]
pub const MAX_MAP_SIZE: usize = 0x7FFFFFFF; // Default to 2GB for unknown architectures

enum Region {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A mapped partition file.
pub struct PlatformMmap {
    // Field order matters: the region is unmapped before the file closes and before the
    // temporary copy is removed.
    region: Region,
    #[allow(dead_code)]
    file: File,
    temp: Option<TempPath>,
}

impl PlatformMmap {
    /// Maps `length` bytes of `file` for reading and writing.
    pub fn read_write(file: File, length: usize) -> io::Result<Self> {
        check_length(length)?;
        let mmap = unsafe { MmapOptions::new().len(length).map_mut(&file)? };
        #[cfg(unix)]
        unix::madvise_random(&mmap[..])?;

        Ok(PlatformMmap {
            region: Region::ReadWrite(mmap),
            file,
            temp: None,
        })
    }

    /// Maps `length` bytes of `file` read-only.
    pub fn read_only(file: File, length: usize) -> io::Result<Self> {
        check_length(length)?;
        let mmap = unsafe { MmapOptions::new().len(length).map(&file)? };
        #[cfg(unix)]
        unix::madvise_random(&mmap[..])?;

        Ok(PlatformMmap {
            region: Region::ReadOnly(mmap),
            file,
            temp: None,
        })
    }

    /// Ties the lifetime of a temporary backing file to this mapping.
    pub fn with_temp_path(mut self, temp: TempPath) -> Self {
        self.temp = Some(temp);
        self
    }

    /// Returns the memory-mapped data as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        match &self.region {
            Region::ReadWrite(mmap) => &mmap[..],
            Region::ReadOnly(mmap) => &mmap[..],
        }
    }

    /// Returns the mapped bytes for writing, or `None` for a read-only mapping.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.region {
            Region::ReadWrite(mmap) => Some(&mut mmap[..]),
            Region::ReadOnly(_) => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.region, Region::ReadWrite(_))
    }

    /// True when the mapping is served from a temporary copy.
    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Writes dirty pages of a read-write mapping back to the file.
    pub fn flush(&self) -> io::Result<()> {
        match &self.region {
            Region::ReadWrite(mmap) => mmap.flush(),
            Region::ReadOnly(_) => Ok(()),
        }
    }

    /// Returns the length of the mapped region
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Checks if the mapped region is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[inline]
fn check_length(length: usize) -> io::Result<()> {
    if length == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot map an empty file",
        ));
    }
    // Only enforce the configured ceiling on platforms where MAX_MAP_SIZE is not unbounded.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        if length > MAX_MAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Map size {} exceeds maximum {} for this architecture",
                    length, MAX_MAP_SIZE
                ),
            ));
        }
    }
    Ok(())
}

/// Platform-specific optimizations for Unix-like systems
#[cfg(unix)]
pub mod unix {
    use std::io;

    /// Slots are read and written at random offsets; tell the kernel not to read ahead.
    pub fn madvise_random(region: &[u8]) -> io::Result<()> {
        use libc::{MADV_RANDOM, madvise};

        let ret = unsafe {
            madvise(
                region.as_ptr() as *mut libc::c_void,
                region.len(),
                MADV_RANDOM,
            )
        };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}
