use crate::bdf::Bdf;
use crate::cmd::NvmeCommand;
use crate::controller::{Controller, QueueConfig};
use crate::descriptor::{Descriptor, Outcome};
use crate::dma::Allocator;
use crate::dma_arena::DmaBuffer;
use crate::error::Error;
use crate::fragment;
use crate::queue_pairs::{IoQueuePair, IoQueuePairId};
use crate::registry::Registry;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;

/// Every `open()` against one process shares this table, so repeated opens
/// of the same BDF reuse one `Controller` instead of remapping its BAR.
pub struct Session<A: Allocator> {
    registry: Registry<A>,
}

impl<A: Allocator> Default for Session<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> Session<A> {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn open_controller_count(&self) -> usize {
        self.registry.open_count()
    }
}

/// A handle to one open namespace: the geometry a caller needs to build
/// valid I/O, plus the set of thread-affine I/O queue pairs it was opened
/// with, addressed by a caller-supplied `qid` (`0..qcount`).
pub struct Namespace<A: Allocator> {
    controller: Arc<Controller<A>>,
    qps: Vec<IoQueuePair<A>>,
    id: u32,
    pub blockcount: u64,
    pub blocksize: u64,
    pub blockshift: u32,
    pub pagesize: usize,
    pub nbpp: usize,
    pub maxbpio: u16,
    pub qcount: u16,
    pub qsize: u32,
    pub maxqcount: u16,
    pub maxqsize: u32,
    pub maxiopq: u32,
}

impl<A: Allocator> Session<A> {
    /// Opens `bdf`, attaching the controller if this is the first open for
    /// its address, then creates the I/O queue pairs `queue` asks for, all
    /// bound to the calling thread.
    pub fn open(
        &self,
        bdf: &str,
        queue: QueueConfig,
        page_size: usize,
        allocator: A,
    ) -> Result<Namespace<A>, Error>
    where
        A: Clone,
    {
        let bdf = Bdf::parse(bdf)?;
        let controller = self
            .registry
            .get_or_attach(bdf, || Controller::attach(bdf, page_size, allocator.clone()))?;

        let namespace_info = controller
            .namespace(bdf.nsid)
            .ok_or(Error::NamespaceDoesNotExist(bdf.nsid))?;

        let maxqcount = controller.controller_information().maximum_number_of_io_queue_pairs;
        let maxqsize = controller.controller_information().maximum_queue_entries_supported;
        let qcount = if queue.queue_count == 0 {
            maxqcount
        } else {
            queue.queue_count
        };
        if qcount == 0 || qcount > maxqcount {
            return Err(Error::InvalidArgument(format!(
                "requested queue count {qcount} exceeds the device maximum {maxqcount}"
            )));
        }

        let maximum_transfer_size = controller.controller_information().maximum_transfer_size;
        let maxbpio = if namespace_info.block_size == 0 {
            0
        } else {
            (maximum_transfer_size / namespace_info.block_size as usize).min(0xFFFF) as u16
        };

        // `Controller::create_io_queue_pair` takes `&self`: the admin path
        // is serialized behind its own mutex, so two namespaces opening
        // against the same already-attached controller never race setting
        // up their queue pairs.
        let mut qps = Vec::with_capacity(qcount as usize);
        let mut qsize = 0u32;
        for _ in 0..qcount {
            let qp = controller.create_io_queue_pair(queue)?;
            qsize = qp.depth() as u32;
            qps.push(qp);
        }

        let blockshift = if namespace_info.block_size == 0 {
            0
        } else {
            namespace_info.block_size.trailing_zeros()
        };
        let nbpp = if namespace_info.block_size == 0 {
            0
        } else {
            page_size / namespace_info.block_size as usize
        };

        Ok(Namespace {
            controller,
            qps,
            id: namespace_info.id,
            blockcount: namespace_info.blocks,
            blocksize: namespace_info.block_size,
            blockshift,
            pagesize: page_size,
            nbpp,
            maxbpio,
            qcount,
            qsize,
            maxqcount,
            maxqsize,
            maxiopq: qsize.saturating_sub(1),
        })
    }
}

impl<A: Allocator> Namespace<A> {
    pub fn alloc(&self, length: usize) -> Result<DmaBuffer, Error> {
        self.controller.arena().alloc(length)
    }

    pub fn free(&self, buffer: DmaBuffer) -> Result<(), Error> {
        self.controller.arena().free(buffer)
    }

    fn check_io_bounds(&self, buffer: &DmaBuffer, logical_block_address: u64, number_of_blocks: u32) -> Result<(), Error> {
        if self.blocksize == 0 {
            return Err(Error::NamespaceDoesNotExist(self.id));
        }
        if number_of_blocks == 0 {
            return Err(Error::InvalidArgument("nlb must be at least 1".into()));
        }
        let length = number_of_blocks as u64 * self.blocksize;
        if buffer.length as u64 != length {
            return Err(Error::BufferLengthNotAMultipleOfNamespaceBlockSize(
                buffer.length,
                self.blocksize,
            ));
        }
        if logical_block_address + number_of_blocks as u64 > self.blockcount {
            return Err(Error::InvalidArgument(
                "logical block range exceeds namespace capacity".into(),
            ));
        }
        debug_assert!(self.controller.arena().owns(buffer), "buffer was not allocated from this controller's arena");
        Ok(())
    }

    fn queue_pair(&mut self, qid: u16) -> Result<&mut IoQueuePair<A>, Error> {
        let len = self.qps.len();
        self.qps.get_mut(qid as usize).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "qid {qid} is out of range for this namespace's {len} queue pairs"
            ))
        })
    }

    fn submit_fragmented(
        &mut self,
        qid: u16,
        buffer: &DmaBuffer,
        logical_block_address: u64,
        number_of_blocks: u32,
        write: bool,
    ) -> Result<Descriptor, Error> {
        let fragments = fragment::split(
            logical_block_address,
            number_of_blocks,
            self.maxbpio.max(1),
            self.blocksize as usize,
        );
        let namespace_id = self.id;
        let blocksize = self.blocksize;
        let qp = self.queue_pair(qid)?;
        let descriptor_id = qp.begin_descriptor(fragments.len() as u32);
        for frag in &fragments {
            let virt = unsafe { buffer.virt.add(frag.buffer_offset) };
            let iova = unsafe { buffer.iova.add(frag.buffer_offset) };
            let length = frag.number_of_blocks as usize * blocksize as usize;
            // NLB in DW12 is the number of blocks minus one (NVMe spec 6.x);
            // `fragment::split` never hands out a zero-block fragment.
            let nlb_field = frag.number_of_blocks - 1;
            qp.submit_fragment(
                descriptor_id,
                Some((virt, iova, length)),
                move |command_id, prp_1, prp_2| {
                    if write {
                        NvmeCommand::io_write(
                            command_id,
                            namespace_id,
                            frag.logical_block_address,
                            nlb_field,
                            prp_1,
                            prp_2,
                        )
                    } else {
                        NvmeCommand::io_read(
                            command_id,
                            namespace_id,
                            frag.logical_block_address,
                            nlb_field,
                            prp_1,
                            prp_2,
                        )
                    }
                },
            )?;
        }
        Ok(qp.handle(descriptor_id))
    }

    pub fn aread(
        &mut self,
        qid: u16,
        buffer: &DmaBuffer,
        logical_block_address: u64,
        number_of_blocks: u32,
    ) -> Result<Descriptor, Error> {
        self.check_io_bounds(buffer, logical_block_address, number_of_blocks)?;
        self.submit_fragmented(qid, buffer, logical_block_address, number_of_blocks, false)
    }

    pub fn awrite(
        &mut self,
        qid: u16,
        buffer: &DmaBuffer,
        logical_block_address: u64,
        number_of_blocks: u32,
    ) -> Result<Descriptor, Error> {
        self.check_io_bounds(buffer, logical_block_address, number_of_blocks)?;
        self.submit_fragmented(qid, buffer, logical_block_address, number_of_blocks, true)
    }

    pub fn aflush(&mut self, qid: u16) -> Result<Descriptor, Error> {
        let namespace_id = self.id;
        let qp = self.queue_pair(qid)?;
        let descriptor_id = qp.begin_descriptor(1);
        qp.submit_fragment(descriptor_id, None, move |command_id, _prp_1, _prp_2| {
            NvmeCommand::flush(command_id, namespace_id)
        })?;
        Ok(qp.handle(descriptor_id))
    }

    /// Routes by the descriptor's hardware `qid` (the wire-level queue
    /// identifier the controller assigned `create_io_queue_pair`), not by
    /// the caller-facing `qid` index into `self.qps` that `aread`/`awrite`
    /// take — a `Descriptor` only ever travels with the queue pair that
    /// issued it, so this always finds exactly one match.
    pub fn apoll(&mut self, descriptor: Descriptor) -> Result<Option<Outcome>, Error> {
        let hardware_qid = descriptor.qid;
        let qp = self
            .qps
            .iter_mut()
            .find(|qp| qp.id().0 == hardware_qid)
            .ok_or(Error::IoQueuePairDoesNotExist(IoQueuePairId(hardware_qid)))?;
        qp.apoll(descriptor)
    }

    /// Submits and spins until resolved. Bypasses the async split for
    /// callers that have no reason to overlap I/O with other work.
    pub fn read(&mut self, qid: u16, buffer: &DmaBuffer, logical_block_address: u64, number_of_blocks: u32) -> Result<(), Error> {
        let descriptor = self.aread(qid, buffer, logical_block_address, number_of_blocks)?;
        self.wait(descriptor)
    }

    pub fn write(&mut self, qid: u16, buffer: &DmaBuffer, logical_block_address: u64, number_of_blocks: u32) -> Result<(), Error> {
        let descriptor = self.awrite(qid, buffer, logical_block_address, number_of_blocks)?;
        self.wait(descriptor)
    }

    pub fn flush(&mut self, qid: u16) -> Result<(), Error> {
        let descriptor = self.aflush(qid)?;
        self.wait(descriptor)
    }

    fn wait(&mut self, descriptor: Descriptor) -> Result<(), Error> {
        loop {
            match self.apoll(descriptor)? {
                Some(Outcome::Done) => return Ok(()),
                Some(Outcome::Error(status)) => {
                    return Err(Error::NvmeStatus {
                        status_type: status.status_type,
                        status_code: status.status_code,
                    })
                }
                None => spin_loop(),
            }
        }
    }

    /// Deletes every I/O queue pair this handle created. If this was the
    /// last namespace handle open against the controller (the `Arc` this
    /// handle holds is the sole surviving strong reference, since the
    /// registry only ever keeps a `Weak`), also disables the controller and
    /// tears down its shared DMA arena.
    pub fn close(mut self) -> Result<(), Error> {
        for qp in self.qps.drain(..) {
            self.controller.delete_io_queue_pair(qp)?;
        }
        if Arc::strong_count(&self.controller) == 1 {
            self.controller.disable()?;
            self.controller.arena().teardown()?;
        }
        Ok(())
    }
}
