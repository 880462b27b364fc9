use crate::cmd::{Completion, NvmeCommand};
use crate::descriptor::{Descriptor, DescriptorState, NvmeStatus, Outcome};
use crate::dma::Allocator;
use crate::error::Error;
use crate::prp::{self, PrpContainer};
use crate::queues::{CompletionQueue, SubmissionQueue};
use crate::regs::RegisterWindow;
use ahash::RandomState;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;

/// Bounds how long the admin queue pair spins waiting for a bring-up
/// command. Bring-up commands are infrequent and always complete quickly on
/// real hardware; this exists to turn a wedged controller into a reported
/// error instead of a hang.
const ADMIN_SPIN_ITERATIONS: u32 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoQueuePairId(pub(crate) u16);

impl fmt::Display for IoQueuePairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The admin submission/completion queue pair. One per controller, used
/// only during bring-up and teardown; commands are submitted and waited on
/// one at a time.
pub(crate) struct AdminQueuePair {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    next_cid: u16,
}

impl AdminQueuePair {
    pub(crate) fn new<A: Allocator>(
        number_of_queue_entries: usize,
        page_size: usize,
        allocator: &A,
    ) -> Result<Self, Error> {
        Ok(Self {
            sq: SubmissionQueue::new(number_of_queue_entries, page_size, allocator)?,
            cq: CompletionQueue::new(number_of_queue_entries, page_size, allocator)?,
            next_cid: 0,
        })
    }

    pub(crate) fn sq_addr(&self) -> usize {
        self.sq.get_addr()
    }

    pub(crate) fn cq_addr(&self) -> usize {
        self.cq.get_addr()
    }

    /// Submits `builder(command_id)`, rings both doorbells as needed and
    /// spins until the matching completion arrives. Returns the completion
    /// itself so callers that need its command-specific DW0 (e.g. the
    /// granted queue count from SET FEATURES) can read it back.
    pub(crate) fn submit_and_wait(
        &mut self,
        regs: &RegisterWindow,
        builder: impl FnOnce(u16) -> NvmeCommand,
    ) -> Result<Completion, Error> {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);

        let entry = builder(cid);
        self.sq.submit(entry);
        regs.ring_doorbell(0, true, self.sq.tail as u32)?;

        for _ in 0..ADMIN_SPIN_ITERATIONS {
            let (completions, new_head) = self.cq.reap();
            if let Some(head) = new_head {
                regs.ring_doorbell(0, false, head as u32)?;
            }
            for completion in completions {
                // SQHD tells the host how far the device has consumed the
                // submission ring; without this, `is_full` would stay
                // pinned at its initial value forever.
                self.sq.head = completion.sq_head as usize;
                if completion.command_id == cid {
                    if completion.is_success() {
                        return Ok(completion);
                    }
                    return Err(Error::NvmeStatus {
                        status_type: completion.status_type,
                        status_code: completion.status_code,
                    });
                }
            }
        }
        Err(Error::DeviceTimeout(
            "admin command did not complete".into(),
        ))
    }
}

/// One I/O submission/completion queue pair, confined to the thread that
/// created it: submission and polling are never synchronized against each
/// other, so sharing a queue pair across threads without external locking
/// would race on the ring indices.
pub struct IoQueuePair<A: Allocator> {
    id: IoQueuePairId,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    regs: RegisterWindow,
    depth: usize,
    page_size: usize,
    allocator: Arc<A>,
    descriptors: HashMap<u64, DescriptorState, RandomState>,
    slot_to_descriptor: Vec<Option<u64>>,
    prp_containers: HashMap<u16, PrpContainer, RandomState>,
    resolved: HashMap<u64, Outcome, RandomState>,
    next_descriptor_id: u64,
    #[cfg(feature = "std")]
    owner: std::thread::ThreadId,
}

impl<A: Allocator> IoQueuePair<A> {
    pub(crate) fn new(
        id: IoQueuePairId,
        sq: SubmissionQueue,
        cq: CompletionQueue,
        regs: RegisterWindow,
        depth: usize,
        page_size: usize,
        allocator: Arc<A>,
    ) -> Result<Self, Error> {
        if depth == 0 || depth > 4096 {
            return Err(Error::BadQueueConfig(
                "queue depth must be in 1..=4096 to fit the command-id slot field".into(),
            ));
        }
        if id.0 > 0x0F {
            return Err(Error::BadQueueConfig(
                "queue id must fit in the 4 high bits of a command id (0..=15)".into(),
            ));
        }
        Ok(Self {
            id,
            sq,
            cq,
            regs,
            depth,
            page_size,
            allocator,
            descriptors: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            slot_to_descriptor: vec![None; depth],
            prp_containers: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            resolved: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            next_descriptor_id: 0,
            #[cfg(feature = "std")]
            owner: std::thread::current().id(),
        })
    }

    pub fn id(&self) -> IoQueuePairId {
        self.id
    }

    #[cfg(feature = "std")]
    fn assert_owning_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "IoQueuePair used from a thread other than the one that created it"
        );
    }

    #[cfg(not(feature = "std"))]
    fn assert_owning_thread(&self) {}

    pub(crate) fn is_full(&self) -> bool {
        self.sq.is_full()
    }

    /// Allocates a fresh descriptor id tracking `fragments` outstanding
    /// sub-commands. Callers submit each fragment with `submit_fragment`
    /// before returning the `Descriptor` handle to their own caller.
    pub(crate) fn begin_descriptor(&mut self, fragments: u32) -> u64 {
        let id = self.next_descriptor_id;
        self.next_descriptor_id = self.next_descriptor_id.wrapping_add(1);
        self.descriptors.insert(id, DescriptorState::new(fragments));
        id
    }

    /// Submits one fragment of `descriptor_id`'s command, stamping
    /// `command_id` as `(qid << 12) | slot` so a later completion routes
    /// back to both this queue pair and the slot that produced it.
    ///
    /// `dma` is the `(virtual_address, physical_address, length)` of the
    /// fragment's data buffer, or `None` for commands that carry no data
    /// (`flush`). When present, a PRP1/PRP2 (or PRP-list) layout is built for
    /// it and handed to `builder` alongside the command id; the list stays
    /// keyed by slot until that slot's completion is reaped, so it outlives
    /// the in-flight command without the caller having to track it.
    pub(crate) fn submit_fragment(
        &mut self,
        descriptor_id: u64,
        dma: Option<(*mut u8, *mut u8, usize)>,
        builder: impl FnOnce(u16, u64, u64) -> NvmeCommand,
    ) -> Result<(), Error> {
        self.assert_owning_thread();
        if self.sq.is_full() {
            return Err(Error::SubmissionQueueFull);
        }
        let slot = self.sq.next_slot();
        let cid = (self.id.0 << 12) | (slot as u16 & 0x0FFF);

        let (prp_1, prp_2) = match dma {
            Some((virt, phys, length)) => {
                let container =
                    prp::allocate(virt, phys, length, self.page_size, self.allocator.as_ref())?;
                let prp_1 = container.prp_1() as u64;
                let prp_2 = container.prp_2().map(|p| p as u64).unwrap_or(0);
                self.prp_containers.insert(slot as u16, container);
                (prp_1, prp_2)
            }
            None => (0, 0),
        };

        let entry = builder(cid, prp_1, prp_2);
        self.sq.submit(entry);
        self.slot_to_descriptor[slot] = Some(descriptor_id);
        self.regs.ring_doorbell(self.id.0, true, self.sq.tail as u32)
    }

    pub fn handle(&self, descriptor_id: u64) -> Descriptor {
        Descriptor {
            qid: self.id.0,
            id: descriptor_id,
        }
    }

    /// Drains the completion queue, updates every affected descriptor and
    /// returns the set that newly resolved this call. Previously resolved
    /// descriptors not yet claimed by `apoll` stay buffered in `resolved`.
    pub fn poll(&mut self) -> Result<(), Error> {
        self.assert_owning_thread();
        let (completions, new_head) = self.cq.reap();
        if let Some(head) = new_head {
            self.regs.ring_doorbell(self.id.0, false, head as u32)?;
        }
        for completion in completions {
            // SQHD tells the host how far the device has consumed the
            // submission ring; without this, `is_full` would stay pinned at
            // its initial value forever.
            self.sq.head = completion.sq_head as usize;
            if completion.more {
                // More notifications are coming for this command; its slot
                // stays bound and its PRP container stays alive until the
                // completion with `more == false` arrives.
                continue;
            }
            let slot = completion.slot() as usize;
            if let Some(container) = self.prp_containers.remove(&(slot as u16)) {
                prp::deallocate(container, self.allocator.as_ref())?;
            }
            let Some(descriptor_id) = self.slot_to_descriptor.get_mut(slot).and_then(Option::take)
            else {
                continue;
            };
            let Some(state) = self.descriptors.get_mut(&descriptor_id) else {
                continue;
            };
            let status = NvmeStatus {
                status_type: completion.status_type,
                status_code: completion.status_code,
                do_not_retry: completion.do_not_retry,
            };
            state.complete_fragment(status, completion.is_success());
            if state.is_resolved() {
                let state = self.descriptors.remove(&descriptor_id).unwrap();
                let outcome = match state.status {
                    crate::descriptor::DescriptorStatus::Done => Outcome::Done,
                    crate::descriptor::DescriptorStatus::Error(status) => Outcome::Error(status),
                    crate::descriptor::DescriptorStatus::Pending(_) => unreachable!(),
                };
                self.resolved.insert(descriptor_id, outcome);
            }
        }
        Ok(())
    }

    /// Non-blocking: polls the queue once, then reports whether `descriptor`
    /// has resolved. Returns `Ok(None)` while fragments are still in flight.
    pub fn apoll(&mut self, descriptor: Descriptor) -> Result<Option<Outcome>, Error> {
        if descriptor.qid != self.id.0 {
            return Err(Error::IoQueuePairDoesNotExist(IoQueuePairId(descriptor.qid)));
        }
        self.poll()?;
        Ok(self.resolved.remove(&descriptor.id))
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::testing::{fake_register_window, MockAllocator};

    fn make_pair(qid: u16, depth: usize) -> IoQueuePair<MockAllocator> {
        let allocator = Arc::new(MockAllocator);
        let sq = SubmissionQueue::new(depth, 4096, allocator.as_ref()).unwrap();
        let cq = CompletionQueue::new(depth, 4096, allocator.as_ref()).unwrap();
        IoQueuePair::new(
            IoQueuePairId(qid),
            sq,
            cq,
            fake_register_window(),
            depth,
            4096,
            allocator,
        )
        .unwrap()
    }

    fn noop(command_id: u16, _prp_1: u64, _prp_2: u64) -> NvmeCommand {
        NvmeCommand {
            command_id,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_queue_depth_out_of_range() {
        let allocator = Arc::new(MockAllocator);
        let sq = SubmissionQueue::new(1, 4096, allocator.as_ref()).unwrap();
        let cq = CompletionQueue::new(1, 4096, allocator.as_ref()).unwrap();
        let err = IoQueuePair::<MockAllocator>::new(
            IoQueuePairId(0),
            sq,
            cq,
            fake_register_window(),
            0,
            4096,
            allocator,
        );
        assert!(matches!(err, Err(Error::BadQueueConfig(_))));
    }

    #[test]
    fn rejects_qid_outside_four_bits() {
        let allocator = Arc::new(MockAllocator);
        let sq = SubmissionQueue::new(4, 4096, allocator.as_ref()).unwrap();
        let cq = CompletionQueue::new(4, 4096, allocator.as_ref()).unwrap();
        let err = IoQueuePair::<MockAllocator>::new(
            IoQueuePairId(16),
            sq,
            cq,
            fake_register_window(),
            4,
            4096,
            allocator,
        );
        assert!(matches!(err, Err(Error::BadQueueConfig(_))));
    }

    #[test]
    fn round_trip_submit_and_poll_resolves_descriptor() {
        let mut qp = make_pair(1, 4);
        let descriptor_id = qp.begin_descriptor(1);
        qp.submit_fragment(descriptor_id, None, noop).unwrap();
        let descriptor = qp.handle(descriptor_id);

        // Simulate the device completing slot 0 on this queue pair's cid.
        qp.cq.inject(0, (1u16 << 12) | 0, 1, true);

        let outcome = qp.apoll(descriptor).unwrap();
        assert!(matches!(outcome, Some(Outcome::Done)));
    }

    #[test]
    fn completion_for_a_different_queue_pair_is_rejected_by_apoll() {
        let mut qp = make_pair(2, 4);
        let descriptor_id = qp.begin_descriptor(1);
        qp.submit_fragment(descriptor_id, None, noop).unwrap();

        let foreign_descriptor = Descriptor {
            qid: 3,
            id: descriptor_id,
        };
        let err = qp.apoll(foreign_descriptor);
        assert!(matches!(err, Err(Error::IoQueuePairDoesNotExist(_))));
    }

    #[test]
    fn multi_fragment_descriptor_stays_pending_until_every_fragment_completes() {
        let mut qp = make_pair(0, 4);
        let descriptor_id = qp.begin_descriptor(2);
        qp.submit_fragment(descriptor_id, None, noop).unwrap();
        qp.submit_fragment(descriptor_id, None, noop).unwrap();
        let descriptor = qp.handle(descriptor_id);

        qp.cq.inject(0, 0, 1, true);
        assert_eq!(qp.apoll(descriptor).unwrap(), None);

        qp.cq.inject(1, 1, 2, true);
        assert!(matches!(qp.apoll(descriptor).unwrap(), Some(Outcome::Done)));
    }

    #[test]
    fn first_failing_fragment_is_reported_even_if_a_later_one_succeeds() {
        let mut qp = make_pair(0, 4);
        let descriptor_id = qp.begin_descriptor(2);
        qp.submit_fragment(descriptor_id, None, noop).unwrap();
        qp.submit_fragment(descriptor_id, None, noop).unwrap();
        let descriptor = qp.handle(descriptor_id);

        qp.cq.inject(0, 0, 1, false);
        assert_eq!(qp.apoll(descriptor).unwrap(), None);

        qp.cq.inject(1, 1, 2, true);
        let outcome = qp.apoll(descriptor).unwrap();
        assert!(matches!(outcome, Some(Outcome::Error(_))));
    }

    #[test]
    fn sq_slot_is_reused_once_its_descriptor_resolves() {
        let mut qp = make_pair(0, 2);
        let first = qp.begin_descriptor(1);
        qp.submit_fragment(first, None, noop).unwrap(); // lands in slot 0
        let second = qp.begin_descriptor(1);
        qp.submit_fragment(second, None, noop).unwrap(); // lands in slot 1

        qp.cq.inject(0, 0, 1, true);
        let first_handle = qp.handle(first);
        assert!(matches!(qp.apoll(first_handle).unwrap(), Some(Outcome::Done)));
        assert!(qp.slot_to_descriptor[0].is_none());

        let third = qp.begin_descriptor(1);
        qp.submit_fragment(third, None, noop).unwrap(); // wraps back to slot 0
        assert_eq!(qp.slot_to_descriptor[0], Some(third));

        let _ = second;
    }

    #[test]
    fn multi_page_fragment_gets_a_real_prp2_and_is_freed_on_completion() {
        use crate::dma::Dma;

        let mut qp = make_pair(0, 2);
        let allocator = MockAllocator;
        let buffer = Dma::<u8>::allocate(2 * 4096, 4096, &allocator).unwrap();
        let virt = buffer.virtual_address();
        let iova = buffer.physical_address();

        let descriptor_id = qp.begin_descriptor(1);
        qp.submit_fragment(descriptor_id, Some((virt, iova, 2 * 4096)), |command_id, prp_1, prp_2| {
            assert_eq!(prp_1, iova as u64);
            assert_ne!(prp_2, 0, "a two-page fragment must carry a real PRP2");
            NvmeCommand {
                command_id,
                ..Default::default()
            }
        })
        .unwrap();
        assert!(qp.prp_containers.contains_key(&0));

        qp.cq.inject(0, 0, 1, true);
        let descriptor = qp.handle(descriptor_id);
        assert!(matches!(qp.apoll(descriptor).unwrap(), Some(Outcome::Done)));
        assert!(
            !qp.prp_containers.contains_key(&0),
            "the PRP container must be freed once its slot's completion is reaped"
        );

        buffer.deallocate(&allocator).unwrap();
    }

    #[test]
    fn more_bit_gates_slot_release_until_final_completion() {
        let mut qp = make_pair(0, 4);
        let descriptor_id = qp.begin_descriptor(1);
        qp.submit_fragment(descriptor_id, None, noop).unwrap();
        let descriptor = qp.handle(descriptor_id);

        qp.cq.inject_with_more(0, 0, 1, true, true);
        assert_eq!(qp.apoll(descriptor).unwrap(), None);
        assert!(
            qp.slot_to_descriptor[0].is_some(),
            "a more=1 completion must not release its slot yet"
        );

        qp.cq.inject_with_more(1, 0, 1, true, false);
        assert!(matches!(qp.apoll(descriptor).unwrap(), Some(Outcome::Done)));
    }
}
