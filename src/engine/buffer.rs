//! Page-aligned buffer allocation
//!
//! Regions are anonymous mappings rounded up to whole pages so they can be
//! handed to an accelerator's DMA engine without copying. A `PageBuffer` is a
//! reference-counted ownership token: cloning it adds an owner, and the
//! mapping is released exactly once when the last owner drops.

use std::fmt;
use std::sync::{Arc, OnceLock};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::AllocationError;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Platform page size in bytes
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

/// Round `size` up to the nearest page boundary
pub fn align_to_page_size(size: usize) -> usize {
    size.div_ceil(page_size()) * page_size()
}

/// Allocate a zeroed, page-aligned buffer of `size` bytes.
///
/// The mapping covers `align_to_page_size(size)` bytes (at least one page);
/// `len()` of the returned buffer is the requested size.
pub fn allocate(size: usize) -> Result<PageBuffer, AllocationError> {
    if size > isize::MAX as usize - page_size() {
        return Err(AllocationError {
            size,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "size overflows address space"),
        });
    }

    let capacity = align_to_page_size(size.max(1));
    let map = MmapMut::map_anon(capacity).map_err(|source| AllocationError { size, source })?;
    let addr = map.as_ptr() as usize;

    Ok(PageBuffer(Arc::new(Region {
        storage: RwLock::new(Storage::Mapped(map)),
        len: size,
        capacity,
        addr,
    })))
}

enum Storage {
    Mapped(MmapMut),
    Imported(Arc<[u8]>),
}

struct Region {
    storage: RwLock<Storage>,
    len: usize,
    capacity: usize,
    addr: usize,
}

/// Shared handle to a page-aligned (or imported) memory region
#[derive(Clone)]
pub struct PageBuffer(Arc<Region>);

impl PageBuffer {
    /// Wrap a caller-owned buffer without taking over its allocation.
    ///
    /// Imported buffers are read-only to the pipeline and are never unmapped
    /// by it; the caller's own handle keeps the bytes alive.
    pub fn import(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        let len = bytes.len();
        let addr = bytes.as_ptr() as usize;

        PageBuffer(Arc::new(Region {
            storage: RwLock::new(Storage::Imported(bytes)),
            len,
            capacity: len,
            addr,
        }))
    }

    /// Allocate a page-aligned buffer holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Result<Self, AllocationError> {
        let buffer = allocate(data.len())?;
        buffer.copy_from(data);
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// Mapped size, a whole number of pages for allocated buffers
    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    pub fn is_imported(&self) -> bool {
        matches!(*self.0.storage.read(), Storage::Imported(_))
    }

    /// Base address of the region, for identity checks only
    pub fn addr(&self) -> usize {
        self.0.addr
    }

    /// Number of live owners of this region
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether two handles refer to the same region
    pub fn same_region(&self, other: &PageBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Run `f` over the buffer contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.0.storage.read();
        match &*storage {
            Storage::Mapped(map) => f(&map[..self.0.len]),
            Storage::Imported(bytes) => f(bytes),
        }
    }

    /// Run `f` over the mutable buffer contents.
    ///
    /// Returns `None` for imported buffers.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut storage = self.0.storage.write();
        match &mut *storage {
            Storage::Mapped(map) => Some(f(&mut map[..self.0.len])),
            Storage::Imported(_) => None,
        }
    }

    /// Copy `data` into the start of the buffer; returns the number of bytes copied
    pub fn copy_from(&self, data: &[u8]) -> usize {
        self.write(|dst| {
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
            n
        })
        .unwrap_or(0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }

    /// Bounds-checked view of `len` bytes starting at `offset`
    pub fn view(&self, offset: usize, len: usize) -> Option<BufferView> {
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }
        Some(BufferView {
            buffer: self.clone(),
            offset,
            len,
        })
    }

    /// View covering the whole buffer
    pub fn full_view(&self) -> BufferView {
        BufferView {
            buffer: self.clone(),
            offset: 0,
            len: self.len(),
        }
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("owners", &self.owners())
            .finish()
    }
}

/// Explicit-length slice of a `PageBuffer`.
///
/// This is the only form in which memory crosses the device boundary. A view
/// holds a strong reference to its buffer, so it doubles as a lifetime guard.
#[derive(Clone, Debug)]
pub struct BufferView {
    buffer: PageBuffer,
    offset: usize,
    len: usize,
}

impl BufferView {
    pub fn buffer(&self) -> &PageBuffer {
        &self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        !self.buffer.is_imported()
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let (start, end) = (self.offset, self.offset + self.len);
        self.buffer.read(|bytes| f(&bytes[start..end]))
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let (start, end) = (self.offset, self.offset + self.len);
        self.buffer.write(|bytes| f(&mut bytes[start..end]))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }
}
