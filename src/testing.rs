//! Mock collaborators for exercising queue-pair and fragmentation logic
//! without real hardware or a real IOMMU. `MockAllocator` backs DMA
//! allocations with ordinary heap memory and reports the virtual address as
//! its own physical address, which is sound for *this process* to poke at
//! directly — exactly what the unit tests below need, not a faithful IOMMU.
//! `fake_register_window` backs a `RegisterWindow` with a leaked heap buffer
//! so doorbell writes land somewhere valid instead of a real BAR.

use crate::dma::Allocator;
use crate::regs::RegisterWindow;
use std::alloc::{alloc_zeroed, dealloc};
use std::boxed::Box;
use std::error::Error as StdError;

pub(crate) struct MockAllocator;

/// A `RegisterWindow` over ordinary heap memory, large enough for 16
/// queues' worth of doorbells past the fixed register block. Never reads
/// back anything resembling real controller state — tests that need CAP/CC
/// semantics build those directly rather than going through this window.
pub(crate) fn fake_register_window() -> RegisterWindow {
    let buf = Box::leak(Box::new([0u8; 0x2000]));
    RegisterWindow::new(buf.as_mut_ptr(), buf.len())
}

impl Allocator for MockAllocator {
    fn allocate<T>(&self, layout: core::alloc::Layout) -> Result<*mut [T], Box<dyn StdError>> {
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err("mock allocation failed".into());
        }
        let count = layout.size() / core::mem::size_of::<T>().max(1);
        Ok(core::ptr::slice_from_raw_parts_mut(ptr as *mut T, count))
    }

    fn deallocate<T>(&self, slice: *mut [T]) -> Result<(), Box<dyn StdError>> {
        let len = slice.len();
        let layout =
            core::alloc::Layout::array::<T>(len).map_err(|e| Box::new(e) as Box<dyn StdError>)?;
        unsafe { dealloc(slice as *mut T as *mut u8, layout) };
        Ok(())
    }

    fn translate_virtual_to_physical<T>(
        &self,
        virtual_address: *const T,
    ) -> Result<*const T, Box<dyn StdError>> {
        Ok(virtual_address)
    }
}
