use spin::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const BLOCK_DATA_SIZE: usize = 2 * 1024 * 1024;
// Record decoding reads key/value length varints through a fixed five-byte
// window, so every allocation keeps this much zeroed slack behind it.
const ALLOC_SLACK: usize = 8;

struct Block {
    // u64 storage keeps the base pointer aligned for the node towers.
    data: Vec<u64>,
    offset: AtomicUsize,
}

impl Block {
    fn with_size(size: usize, offset: usize) -> Box<Block> {
        Box::new(Block {
            data: vec![0u64; (size + 7) / 8],
            offset: AtomicUsize::new(offset),
        })
    }

    fn byte_len(&self) -> usize {
        self.data.len() * 8
    }

    fn base(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }
}

/// Bump allocator backing one memtable. Memory is handed out in 2MB blocks
/// and is never reclaimed until the arena itself is dropped, so raw pointers
/// into it stay valid for the lifetime of the skip list built on top.
pub struct ConcurrentArena {
    content: Mutex<ArenaContent>,
    current: AtomicPtr<Block>,
    mem_size: AtomicUsize,
}

struct ArenaContent {
    blocks: Vec<Box<Block>>,
    current: Box<Block>,
}

impl Default for ConcurrentArena {
    fn default() -> Self {
        let mut content = ArenaContent {
            blocks: vec![],
            current: Block::with_size(BLOCK_DATA_SIZE, 0),
        };
        ConcurrentArena {
            current: AtomicPtr::new(content.current.as_mut()),
            content: Mutex::new(content),
            mem_size: AtomicUsize::new(0),
        }
    }
}

impl ConcurrentArena {
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// The returned region is zero-initialized and aligned for pointers.
    pub unsafe fn allocate(&self, alloc_size: usize) -> *mut u8 {
        let data_size = (((alloc_size - 1) | 7) + 1) + ALLOC_SLACK;
        self.mem_size.fetch_add(data_size, Ordering::Relaxed);
        let addr = self.allocate_from_current_block(data_size);
        if !addr.is_null() {
            return addr;
        }
        self.allocate_fallback(data_size)
    }

    unsafe fn allocate_from_current_block(&self, data_size: usize) -> *mut u8 {
        let current = self.current.load(Ordering::Acquire);
        if (*current).offset.load(Ordering::Acquire) + data_size <= (*current).byte_len() {
            let offset = (*current).offset.fetch_add(data_size, Ordering::SeqCst);
            if offset + data_size <= (*current).byte_len() {
                return (*current).base().add(offset);
            }
        }
        null_mut()
    }

    unsafe fn allocate_fallback(&self, data_size: usize) -> *mut u8 {
        let mut content = self.content.lock();
        // Another caller may have installed a fresh block while we waited.
        if content.current.offset.load(Ordering::Acquire) + data_size
            <= content.current.byte_len()
        {
            let offset = content.current.offset.fetch_add(data_size, Ordering::SeqCst);
            if offset + data_size <= content.current.byte_len() {
                return content.current.base().add(offset);
            }
        }
        let block_size = std::cmp::max(BLOCK_DATA_SIZE, data_size);
        let mut block = Block::with_size(block_size, data_size);
        self.current.store(block.as_mut(), Ordering::Release);
        let old = std::mem::replace(&mut content.current, block);
        content.blocks.push(old);
        content.current.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_tracks_usage() {
        let arena = ConcurrentArena::default();
        assert_eq!(arena.mem_size(), 0);
        unsafe {
            let p = arena.allocate(100);
            assert!(!p.is_null());
            assert_eq!(p as usize % std::mem::size_of::<*mut u8>(), 0);
        }
        // Rounded up to pointer alignment, plus the decode slack.
        assert_eq!(arena.mem_size(), 104 + ALLOC_SLACK);
    }

    #[test]
    fn test_allocate_larger_than_block() {
        let arena = ConcurrentArena::default();
        unsafe {
            let p = arena.allocate(3 * 1024 * 1024);
            assert!(!p.is_null());
            // Subsequent small allocations still succeed.
            let q = arena.allocate(64);
            assert!(!q.is_null());
        }
    }
}
