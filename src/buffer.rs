//! Reference-counted buffers with zero-copy slicing.
//!
//! A [`Buffer`] is a shared owning handle to a byte region plus an
//! offset/length view into it. The region is allocated once and never
//! reallocated, so the pointer handed to the kernel stays valid from
//! submission until completion regardless of how many handles exist or which
//! one is dropped first. Cloning and slicing share the region; the region is
//! freed when the last handle goes away.
//!
//! The kernel writes through the raw pointer while handles may be aliased
//! (e.g. one message broadcast to many connections), so the bytes live in an
//! `UnsafeCell`. All handle operations happen on the loop thread; the count
//! is a plain `Rc`.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr;
use std::rc::Rc;

use crate::error::{Error, Result};

/// The shared byte region behind one or more [`Buffer`] handles.
pub struct BufferData {
    bytes: UnsafeCell<Box<[u8]>>,
}

impl BufferData {
    fn new(size: usize) -> Rc<BufferData> {
        Rc::new(BufferData {
            bytes: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    fn size(&self) -> usize {
        unsafe { (&*self.bytes.get()).len() }
    }

    fn as_ptr(&self) -> *mut u8 {
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// Zero the whole region.
    fn clear(&self) {
        unsafe { ptr::write_bytes(self.as_ptr(), 0, self.size()) };
    }
}

/// A shared, sliceable handle to a stable byte region.
#[derive(Clone, Default)]
pub struct Buffer {
    data: Option<Rc<BufferData>>,
    offset: usize,
    len: usize,
}

impl Buffer {
    /// Allocate a zero-initialized region of `size` bytes.
    pub fn allocate(size: usize) -> Buffer {
        let data = BufferData::new(size);
        Buffer {
            data: Some(data),
            offset: 0,
            len: size,
        }
    }

    /// Allocate a region and copy `bytes` into it.
    pub fn from_bytes(bytes: &[u8]) -> Buffer {
        let buffer = Buffer::allocate(bytes.len());
        buffer.copy_from(bytes);
        buffer
    }

    /// An empty handle: `size() == 0`, `data()` null.
    pub fn empty() -> Buffer {
        Buffer::default()
    }

    /// Raw pointer to the start of this view, or null for an empty handle.
    pub fn data(&self) -> *mut u8 {
        match &self.data {
            Some(data) => unsafe { data.as_ptr().add(self.offset) },
            None => ptr::null_mut(),
        }
    }

    /// Length of this view in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero the whole underlying region (not just this view).
    pub fn clear(&self) {
        if let Some(data) = &self.data {
            data.clear();
        }
    }

    /// Copy `src` into the start of this view. Panics if `src` is longer
    /// than the view.
    pub fn copy_from(&self, src: &[u8]) {
        assert!(src.len() <= self.len, "copy_from source exceeds buffer view");
        if !src.is_empty() {
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.data(), src.len()) };
        }
    }

    /// The bytes of this view.
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data(), self.len) }
        }
    }

    /// A new handle viewing `len` bytes starting `offset` bytes into the
    /// underlying region. Shares the region; copies nothing.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Buffer> {
        let underlying = self.underlying_size();
        if offset >= underlying || offset + len > underlying {
            return Err(Error::BufferRange {
                offset,
                len,
                size: underlying,
            });
        }
        Ok(Buffer {
            data: self.data.clone(),
            offset,
            len,
        })
    }

    /// Number of live handles on the underlying region. Zero for an empty
    /// handle.
    pub fn use_count(&self) -> usize {
        match &self.data {
            Some(data) => Rc::strong_count(data),
            None => 0,
        }
    }

    fn underlying_size(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.size())
    }

    /// Whether this handle is the only one and views the whole region.
    fn is_sole_whole_region(&self) -> bool {
        self.use_count() == 1 && self.offset == 0 && self.len == self.underlying_size()
    }
}

/// Recycles same-sized buffer regions.
///
/// `deallocate` only stores a handle when it is the sole owner of its whole
/// region; otherwise the handle is simply dropped and the region is freed
/// when the remaining handles go away.
#[derive(Default)]
pub struct BufferPool {
    free: HashMap<usize, Vec<Buffer>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool::default()
    }

    /// A zeroed buffer of exactly `size` bytes, recycled when possible.
    pub fn allocate(&mut self, size: usize) -> Buffer {
        if let Some(list) = self.free.get_mut(&size) {
            if let Some(buffer) = list.pop() {
                buffer.clear();
                return buffer;
            }
        }
        Buffer::allocate(size)
    }

    /// Return a buffer to the pool.
    pub fn deallocate(&mut self, buffer: Buffer) {
        if buffer.is_sole_whole_region() && buffer.size() > 0 {
            self.free.entry(buffer.size()).or_default().push(buffer);
        }
    }

    /// Number of regions currently held for reuse.
    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}
