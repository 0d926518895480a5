use std::ptr::NonNull;

use ahash::AHashMap;
use hemem_common::{Error, Result};
use hemem_page_alloc::page_buffer::PageBuffer;

/// Smallest block handed out by the pool.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Largest block served from a size class; bigger requests get dedicated pages.
pub const MAX_BLOCK_SIZE: usize = 256 * 1024;

/// Size of the page run carved into blocks when a size class runs dry.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const CLASS_COUNT: usize =
    (MAX_BLOCK_SIZE.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize + 1;

/// A size-class pool over page-mapped chunks.
///
/// Requests are rounded up to a power of two between [`MIN_BLOCK_SIZE`] and
/// [`MAX_BLOCK_SIZE`] and served from a per-class free list. Freed blocks go back
/// to their free list; chunks are only unmapped when the pool is dropped. Every
/// block is aligned to at least [`MIN_BLOCK_SIZE`].
pub struct PagePool {
    name: &'static str,
    free: [Vec<NonNull<u8>>; CLASS_COUNT],
    chunks: Vec<PageBuffer>,
    large: AHashMap<usize, PageBuffer>,
    outstanding: AHashMap<usize, usize>,
    bytes_in_use: usize,
}

impl PagePool {
    pub fn new(name: &'static str) -> PagePool {
        PagePool {
            name,
            free: std::array::from_fn(|_| Vec::new()),
            chunks: Vec::new(),
            large: AHashMap::new(),
            outstanding: AHashMap::new(),
            bytes_in_use: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block bytes currently handed out, including size-class rounding.
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    /// Bytes mapped by the pool, whether handed out or cached.
    pub fn bytes_reserved(&self) -> usize {
        self.chunks.iter().map(PageBuffer::capacity).sum::<usize>()
            + self.large.values().map(PageBuffer::capacity).sum::<usize>()
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        if bytes > MAX_BLOCK_SIZE {
            let buf = PageBuffer::allocate(bytes)
                .map_err(|e| Error::allocation_io(self.name, bytes, e))?;
            let ptr = NonNull::new(buf.ptr()).ok_or_else(|| Error::allocation(self.name, bytes))?;
            self.bytes_in_use += buf.capacity();
            self.large.insert(ptr.as_ptr() as usize, buf);
            return Ok(ptr);
        }

        let class = size_class(bytes);
        if self.free[class].is_empty() {
            self.refill(class)?;
        }
        let ptr = self.free[class]
            .pop()
            .ok_or_else(|| Error::allocation(self.name, bytes))?;
        self.outstanding.insert(ptr.as_ptr() as usize, class);
        self.bytes_in_use += block_size(class);
        Ok(ptr)
    }

    /// Returns a block to the pool.
    ///
    /// Fails with `InvalidOperation` if `ptr` was not handed out by this pool or
    /// was already returned.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        if let Some(class) = self.outstanding.remove(&addr) {
            self.free[class].push(ptr);
            self.bytes_in_use -= block_size(class);
            Ok(())
        } else if let Some(buf) = self.large.remove(&addr) {
            self.bytes_in_use -= buf.capacity();
            Ok(())
        } else {
            Err(Error::invalid_operation(format!(
                "{} free of unknown address {addr:#x}",
                self.name
            )))
        }
    }

    fn refill(&mut self, class: usize) -> Result<()> {
        let block = block_size(class);
        let chunk = PageBuffer::allocate(CHUNK_SIZE)
            .map_err(|e| Error::allocation_io(self.name, block, e))?;
        let base = chunk.ptr();
        let count = chunk.capacity() / block;
        let list = &mut self.free[class];
        list.reserve(count);
        // Pushed in reverse so blocks are handed out in address order.
        for i in (0..count).rev() {
            if let Some(ptr) = NonNull::new(unsafe { base.add(i * block) }) {
                list.push(ptr);
            }
        }
        self.chunks.push(chunk);
        log::trace!("{}: new chunk for {block}-byte blocks", self.name);
        Ok(())
    }
}

fn size_class(bytes: usize) -> usize {
    let rounded = bytes.max(MIN_BLOCK_SIZE).next_power_of_two();
    (rounded.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize
}

fn block_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

// SAFETY: the pool exclusively owns its chunks; the raw block pointers it
// caches point into those chunks.
unsafe impl Send for PagePool {}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("name", &self.name)
            .field("chunks", &self.chunks.len())
            .field("large", &self.large.len())
            .field("bytes_in_use", &self.bytes_in_use)
            .finish()
    }
}
