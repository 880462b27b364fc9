#![no_std]
#![cfg_attr(target_arch = "aarch64", feature(stdarch_arm_hints))]

mod bdf;
mod cmd;
#[cfg(feature = "std")]
mod controller;
mod descriptor;
mod dma;
#[cfg(feature = "std")]
mod dma_arena;
mod error;
mod fragment;
#[cfg(feature = "std")]
mod huge_pages;
#[cfg(feature = "std")]
mod pci;
mod prp;
mod queue_pairs;
mod queues;
mod regs;
#[cfg(feature = "std")]
mod registry;
#[cfg(feature = "std")]
mod session;
#[cfg(all(test, feature = "std"))]
mod testing;

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub use bdf::Bdf;
#[cfg(feature = "std")]
pub use controller::{Controller, ControllerInformation, NamespaceInfo, QueueConfig};
pub use descriptor::{Descriptor, NvmeStatus, Outcome};
pub use dma::Allocator;
pub use error::Error;
#[cfg(feature = "std")]
pub use huge_pages::{HugePageAllocator, HUGE_PAGE_SIZE};
pub use queue_pairs::{IoQueuePair, IoQueuePairId};
#[cfg(feature = "std")]
pub use session::{Namespace, Session};

/// Opens `bdf` with the hugepage-backed allocator, the convenience entry
/// point for callers that do not need to share a `Session` across multiple
/// namespaces.
#[cfg(feature = "std")]
pub fn open_with_huge_pages(
    bdf: &str,
    queue: QueueConfig,
) -> Result<Namespace<HugePageAllocator>, Error> {
    let session = Session::new();
    session.open(bdf, queue, HUGE_PAGE_SIZE, HugePageAllocator)
}
