//! Snapshot store: a raw memory image plus the virtual address it was dumped from.

use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::Path;

use log::{debug, info, log_enabled, Level};
use memmap2::Mmap;

use crate::pointer_scan::error::LoadError;
use crate::pointer_scan::types::AddressableRange;

/// Backing store of a snapshot.
enum SnapshotBytes {
    Owned(Box<[u8]>),
    Mapped(Mmap),
}

impl Deref for SnapshotBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SnapshotBytes::Owned(bytes) => bytes,
            SnapshotBytes::Mapped(mmap) => mmap,
        }
    }
}

/// Immutable memory image. Addresses are 32-bit virtual addresses starting at `virtual_base`.
pub struct Snapshot {
    bytes: SnapshotBytes,
    virtual_base: u32,
    is_little_endian: bool,
}

impl Snapshot {
    /// Largest snapshot that still fits a 32-bit address space starting at `virtual_base`.
    pub fn max_len(virtual_base: u32) -> u64 {
        (u32::MAX - virtual_base) as u64
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>, virtual_base: u32, is_little_endian: bool) -> Result<Self, LoadError> {
        let bytes: Vec<u8> = bytes.into();
        check_len(bytes.len() as u64, virtual_base)?;
        Ok(Self {
            bytes: SnapshotBytes::Owned(bytes.into_boxed_slice()),
            virtual_base,
            is_little_endian,
        })
    }

    pub fn from_reader<R: Read>(mut reader: R, virtual_base: u32, is_little_endian: bool) -> Result<Self, LoadError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(bytes, virtual_base, is_little_endian)
    }

    /// Maps a dump file read-only. The file must not be truncated while the snapshot is alive.
    pub fn map_file(path: impl AsRef<Path>, virtual_base: u32, is_little_endian: bool) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        check_len(len, virtual_base)?;

        let bytes = if len == 0 {
            SnapshotBytes::Owned(Box::default())
        } else {
            // Safety: the mapping is read-only and owned by the snapshot for its whole lifetime.
            SnapshotBytes::Mapped(unsafe { Mmap::map(&file)? })
        };

        if log_enabled!(Level::Debug) {
            debug!("Mapped snapshot {:?}: {} bytes at 0x{:08X}", path, len, virtual_base);
        }

        Ok(Self {
            bytes,
            virtual_base,
            is_little_endian,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn virtual_base(&self) -> u32 {
        self.virtual_base
    }

    #[inline]
    pub fn is_little_endian(&self) -> bool {
        self.is_little_endian
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `[virtual_base, virtual_base + len)`
    pub fn addressable_range(&self) -> AddressableRange {
        AddressableRange::new(self.virtual_base, self.bytes.len() as u32)
    }

    /// Reads a u32 at a byte offset into the buffer. The caller guarantees `offset + 4 <= len`.
    #[inline]
    pub fn read_u32_at(&self, offset: usize) -> u32 {
        let raw: u32 = bytemuck::pod_read_unaligned(&self.bytes[offset..offset + 4]);
        if self.is_little_endian {
            u32::from_le(raw)
        } else {
            u32::from_be(raw)
        }
    }

    /// Reads a u32 at a virtual address, `None` when any of its bytes fall outside the snapshot.
    pub fn try_read_u32(&self, address: u32) -> Option<u32> {
        let offset = address.checked_sub(self.virtual_base)? as usize;
        if offset.checked_add(4)? > self.bytes.len() {
            return None;
        }
        Some(self.read_u32_at(offset))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("len", &self.bytes.len())
            .field("virtual_base", &format_args!("0x{:08X}", self.virtual_base))
            .field("is_little_endian", &self.is_little_endian)
            .finish()
    }
}

fn check_len(len: u64, virtual_base: u32) -> Result<(), LoadError> {
    let limit = Snapshot::max_len(virtual_base).min(isize::MAX as u64);
    if len > limit {
        info!("Rejected snapshot of {} bytes at 0x{:08X}, limit is {}", len, virtual_base, limit);
        return Err(LoadError::TooLarge { size: len, limit });
    }
    Ok(())
}
