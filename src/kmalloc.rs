//! kmalloc front end.
//!
//! The entry point kernel subsystems call. It is generic over the engine that
//! actually satisfies requests, which is normally a [`HeapRegistry`] but can be
//! any [`KmallocEngine`], and it can serve as the `#[global_allocator]`.
//!
//! [`HeapRegistry`]: crate::HeapRegistry

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Once;

use crate::{is_aligned, AllocError, AllocResult, KmallocEngine};

#[cfg(feature = "log")]
use log::{error, warn};

/// Kernel allocation entry point, initialized once with its engine.
pub struct Kmalloc<E: KmallocEngine> {
    engine: Once<E>,
}

impl<E: KmallocEngine> Kmalloc<E> {
    pub const fn new() -> Self {
        Self {
            engine: Once::new(),
        }
    }

    /// Install the engine. Only the first call succeeds.
    pub fn init(&self, engine: E) -> AllocResult {
        let mut installed = false;
        self.engine.call_once(|| {
            installed = true;
            engine
        });
        if installed {
            Ok(())
        } else {
            error!("kmalloc: already initialized");
            Err(AllocError::InvalidParam)
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_completed()
    }

    pub fn engine(&self) -> Option<&E> {
        self.engine.get()
    }

    /// Allocate `size` bytes.
    pub fn kmalloc(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let engine = match self.engine.get() {
            Some(engine) => engine,
            None => {
                error!("kmalloc: allocator not initialized");
                return Err(AllocError::OutOfMemory);
            }
        };
        let addr = engine.allocate(size)?;
        match NonNull::new(addr as *mut u8) {
            Some(ptr) => Ok(ptr),
            None => {
                // A heap based at address zero; the block is unusable.
                let _ = engine.free(addr, size);
                Err(AllocError::OutOfMemory)
            }
        }
    }

    /// Free a block returned by [`kmalloc`](Self::kmalloc) for the same `size`.
    pub fn kfree(&self, ptr: NonNull<u8>, size: usize) -> AllocResult {
        match self.engine.get() {
            Some(engine) => engine.free(ptr.as_ptr() as usize, size),
            None => {
                error!("kmalloc: freeing {:p} before initializing", ptr);
                Err(AllocError::InvalidFree)
            }
        }
    }
}

impl<E: KmallocEngine> Default for Kmalloc<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes requested from the engine for `layout`. Buddy blocks are aligned to
/// their size relative to the heap base, so asking for at least `align` bytes
/// gives aligned blocks in heaps whose base is aligned.
#[inline]
fn request_size(layout: Layout) -> usize {
    layout.size().max(layout.align())
}

unsafe impl<E: KmallocEngine> GlobalAlloc for Kmalloc<E> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = request_size(layout);
        match self.kmalloc(size) {
            Ok(ptr) if is_aligned(ptr.as_ptr() as usize, layout.align()) => ptr.as_ptr(),
            Ok(ptr) => {
                warn!(
                    "kmalloc: block {:p} misses alignment {} for layout {:?}",
                    ptr,
                    layout.align(),
                    layout
                );
                let _ = self.kfree(ptr, size);
                core::ptr::null_mut()
            }
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let _ = self.kfree(ptr, request_size(layout));
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(new_layout) => new_layout,
            Err(_) => return core::ptr::null_mut(),
        };

        // Stay in place while the new size still maps to the very same block,
        // so a later dealloc with `new_layout` frees the right node.
        if let Some(engine) = self.engine() {
            let addr = ptr as usize;
            let usable = engine.usable_size(addr, request_size(layout));
            if engine.usable_size(addr, request_size(new_layout)) == usable
                && request_size(new_layout) <= usable
            {
                return ptr;
            }
        }

        let new_ptr = GlobalAlloc::alloc(self, new_layout);
        if !new_ptr.is_null() {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, core::cmp::min(layout.size(), new_size));
            GlobalAlloc::dealloc(self, ptr, layout);
        }
        new_ptr
    }
}
