//! Bases: engine-owned, contiguous, untyped storage behind views.

use crate::dtype::DType;
use crate::slab::SlabId;

/// Handle into the engine's base arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BaseId(pub(crate) u32);

impl SlabId for BaseId {
    fn from_usize(x: usize) -> Self {
        BaseId(u32::try_from(x).unwrap())
    }

    fn into_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("b{}", self.0))
    }
}

/// Untyped byte buffer backed by `u64` words. Compiled kernels cast the
/// data pointer to the element type, so the storage must be at least
/// 8-byte aligned; a plain byte vector does not guarantee that.
#[derive(Debug)]
pub struct Buffer {
    words: Vec<u64>,
    bytes: usize,
}

impl Buffer {
    #[must_use]
    pub fn new(bytes: usize) -> Buffer {
        Buffer { words: vec![0u64; bytes.div_ceil(8)], bytes }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr().cast()
    }

    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.bytes) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.bytes) }
    }

    pub fn zero(&mut self) {
        self.words.fill(0);
    }
}

/// A contiguous data region. Storage is allocated lazily at first write and
/// returned to the victim cache when a `Free` instruction names the base.
#[derive(Debug)]
pub struct Base {
    pub dtype: DType,
    pub nelem: i64,
    pub data: Option<Buffer>,
}

impl Base {
    #[must_use]
    pub const fn new(dtype: DType, nelem: i64) -> Base {
        Base { dtype, nelem, data: None }
    }

    #[must_use]
    pub fn nbytes(&self) -> usize {
        usize::try_from(self.nelem).unwrap() * self.dtype.byte_size()
    }
}
