use crate::dma::{Allocator, Dma};
use crate::error::Error;
use ahash::RandomState;
use alloc::vec::Vec;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// How many pages a freshly grown region holds. Chosen so a region covers a
/// handful of typical I/O buffers before another `Allocator::allocate` call
/// is needed.
const GROWTH_PAGES: usize = 32;

/// `(virt, iova, length)` returned to callers. `region` and `chunk` identify
/// where it came from in the owning arena, so `free` can validate ownership
/// without scanning pointer ranges.
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    pub virt: *mut u8,
    pub iova: *mut u8,
    pub length: usize,
    pub(crate) region: u64,
    pub(crate) chunk: Option<usize>,
}

unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

struct Region {
    dma: Dma<u8>,
    page_size: usize,
    /// `None` means this region is one dedicated contiguous allocation
    /// (a single multi-page buffer with no further slab subdivision).
    free_chunks: Option<Vec<usize>>,
    chunk_count: usize,
}

impl Region {
    fn chunk_ptr(&self, index: usize) -> (*mut u8, *mut u8) {
        (
            unsafe { self.dma.virtual_address().add(index * self.page_size) },
            unsafe { self.dma.physical_address().add(index * self.page_size) },
        )
    }
}

/// Slab arena over a page-sized free-list, growing by allocating large
/// backing regions from the collaborating `Allocator` as needed. A region
/// is only returned to the allocator once every chunk carved from it has
/// been freed.
pub(crate) struct DmaArena<A: Allocator> {
    allocator: Arc<A>,
    page_size: usize,
    regions: Mutex<HashMap<u64, Region, RandomState>>,
    next_region_id: AtomicU64,
}

impl<A: Allocator> DmaArena<A> {
    pub(crate) fn new(allocator: Arc<A>, page_size: usize) -> Self {
        Self {
            allocator,
            page_size,
            regions: Mutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))),
            next_region_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn alloc(&self, length: usize) -> Result<DmaBuffer, Error> {
        if length == 0 {
            return Err(Error::InvalidArgument("allocation length is zero".into()));
        }
        let pages = length.div_ceil(self.page_size);

        if pages == 1 {
            self.alloc_chunk()
        } else {
            self.alloc_contiguous(pages)
        }
    }

    fn alloc_chunk(&self) -> Result<DmaBuffer, Error> {
        {
            let mut regions = self.regions.lock().unwrap();
            for (&id, region) in regions.iter_mut() {
                if let Some(free) = region.free_chunks.as_mut() {
                    if let Some(index) = free.pop() {
                        let (virt, iova) = region.chunk_ptr(index);
                        return Ok(DmaBuffer {
                            virt,
                            iova,
                            length: self.page_size,
                            region: id,
                            chunk: Some(index),
                        });
                    }
                }
            }
        }

        // No region has room: grow. The allocation syscall runs without the
        // arena lock held; only the bookkeeping insert below needs it.
        let dma = Dma::<u8>::allocate(GROWTH_PAGES, self.page_size, self.allocator.as_ref())
            .map_err(|_| Error::OutOfResource("DMA region growth failed".into()))?;
        let virt = dma.virtual_address();
        let iova = dma.physical_address();

        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        let free_chunks: Vec<usize> = (1..GROWTH_PAGES).collect();
        let mut regions = self.regions.lock().unwrap();
        regions.insert(
            id,
            Region {
                dma,
                page_size: self.page_size,
                free_chunks: Some(free_chunks),
                chunk_count: GROWTH_PAGES,
            },
        );
        Ok(DmaBuffer {
            virt,
            iova,
            length: self.page_size,
            region: id,
            chunk: Some(0),
        })
    }

    fn alloc_contiguous(&self, pages: usize) -> Result<DmaBuffer, Error> {
        let dma = Dma::<u8>::allocate(pages * self.page_size, self.page_size, self.allocator.as_ref())
            .map_err(|_| Error::OutOfResource("DMA region growth failed".into()))?;
        let virt = dma.virtual_address();
        let iova = dma.physical_address();
        let length = pages * self.page_size;

        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        let mut regions = self.regions.lock().unwrap();
        regions.insert(
            id,
            Region {
                dma,
                page_size: self.page_size,
                free_chunks: None,
                chunk_count: pages,
            },
        );
        Ok(DmaBuffer {
            virt,
            iova,
            length,
            region: id,
            chunk: None,
        })
    }

    pub(crate) fn free(&self, buffer: DmaBuffer) -> Result<(), Error> {
        let mut regions = self.regions.lock().unwrap();
        let region = regions.get_mut(&buffer.region).ok_or(Error::NotOwned)?;

        match buffer.chunk {
            Some(index) => {
                let free = region.free_chunks.as_mut().ok_or(Error::NotOwned)?;
                if index >= region.chunk_count || free.contains(&index) {
                    return Err(Error::NotOwned);
                }
                free.push(index);
                Ok(())
            }
            None => {
                if region.free_chunks.is_some() {
                    return Err(Error::NotOwned);
                }
                let region = regions.remove(&buffer.region).unwrap();
                region
                    .dma
                    .deallocate(self.allocator.as_ref())
                    .map_err(|_| Error::NotOwned)
            }
        }
    }

    /// `true` if `buffer` was allocated from this arena. Backs the
    /// debug-mode ownership check on `aread`/`awrite`.
    pub(crate) fn owns(&self, buffer: &DmaBuffer) -> bool {
        self.regions.lock().unwrap().contains_key(&buffer.region)
    }

    /// Returns every backing region to the allocator, regardless of whether
    /// its chunks were individually freed first. Called once, when the last
    /// namespace handle on the owning controller closes.
    pub(crate) fn teardown(&self) -> Result<(), Error> {
        let mut regions = self.regions.lock().unwrap();
        for (_, region) in regions.drain() {
            region.dma.deallocate(self.allocator.as_ref())?;
        }
        Ok(())
    }
}
