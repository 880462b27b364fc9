use crate::cmd::{Completion, NvmeCommand};
use crate::dma::{Allocator, Dma};
use crate::error::Error;
use alloc::vec::Vec;

#[derive(Debug)]
pub(crate) struct SubmissionQueue {
    commands: Dma<NvmeCommand>,
    pub(crate) head: usize,
    pub(crate) tail: usize,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct CompletionQueue {
    commands: Dma<CompletionQueueEntry>,
    head: usize,
    phase: bool,
    len: usize,
}

/// NVMe specification 4.6 Completion queue entry
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub(crate) struct CompletionQueueEntry {
    pub(crate) command_specific: u32,
    pub(crate) _reserved: u32,
    pub(crate) sq_head: u16,
    pub(crate) sq_id: u16,
    pub(crate) command_id: u16,
    pub(crate) status: u16,
}

impl CompletionQueueEntry {
    pub(crate) fn parse(&self) -> Completion {
        let status = self.status;
        Completion {
            command_specific: self.command_specific,
            sq_head: self.sq_head,
            command_id: self.command_id,
            status_type: ((status >> 9) & 0x7) as u8,
            status_code: ((status >> 1) & 0xFF) as u8,
            do_not_retry: (status >> 15) & 1 == 1,
            more: (status >> 14) & 1 == 1,
        }
    }
}

impl SubmissionQueue {
    pub(crate) fn new<A: Allocator>(
        number_of_queue_entries: usize,
        page_size: usize,
        allocator: &A,
    ) -> Result<Self, Error> {
        Ok(Self {
            commands: Dma::allocate(number_of_queue_entries, page_size, allocator)?,
            head: 0,
            tail: 0,
            len: number_of_queue_entries,
        })
    }

    pub(crate) fn is_full(&self) -> bool {
        self.head == (self.tail + 1) % self.len
    }

    /// The ring index a command submitted right now would land on. Callers
    /// stamp this into the command's `command_id` before calling `submit`,
    /// so completions route back to the slot that produced them.
    pub(crate) fn next_slot(&self) -> usize {
        self.tail
    }

    /// Writes `entry` at the current tail and advances it. The entry must
    /// be fully written before the tail is observed to move, so the write
    /// happens before the index update here.
    pub(crate) fn submit(&mut self, entry: NvmeCommand) -> usize {
        let slot = self.tail;
        self.commands[slot] = entry;
        self.tail = (slot + 1) % self.len;
        slot
    }

    pub(crate) fn get_addr(&self) -> usize {
        self.commands.physical_address() as usize
    }
}

impl CompletionQueue {
    pub(crate) fn new<A: Allocator>(
        number_of_queue_entries: usize,
        page_size: usize,
        allocator: &A,
    ) -> Result<Self, Error> {
        Ok(Self {
            commands: Dma::allocate(number_of_queue_entries, page_size, allocator)?,
            head: 0,
            phase: true,
            len: number_of_queue_entries,
        })
    }

    /// Drains every completion ready at or after the current head, flipping
    /// the expected phase bit on each wrap. Returns the parsed completions
    /// plus the new head, so the caller can ring the doorbell once, only if
    /// progress was made.
    pub(crate) fn reap(&mut self) -> (Vec<Completion>, Option<usize>) {
        let mut out = Vec::new();
        loop {
            let entry = self.commands[self.head];
            if ((entry.status & 1) == 1) != self.phase {
                break;
            }
            out.push(entry.parse());
            self.head += 1;
            if self.head == self.len {
                self.head = 0;
                self.phase = !self.phase;
            }
        }
        if out.is_empty() {
            (out, None)
        } else {
            (out, Some(self.head))
        }
    }

    pub(crate) fn get_addr(&self) -> usize {
        self.commands.physical_address() as usize
    }

    /// Writes a completion directly into the ring at `slot`, as if the
    /// device had just produced it, flipping in whichever phase bit `reap`
    /// is currently expecting there. Lets unit tests drive `reap` without a
    /// real controller.
    #[cfg(test)]
    pub(crate) fn inject(&mut self, slot: usize, command_id: u16, sq_head: u16, success: bool) {
        self.inject_with_more(slot, command_id, sq_head, success, false)
    }

    /// Same as `inject`, but also sets the `more` status bit, so tests can
    /// drive a multi-part completion sequence for one command.
    #[cfg(test)]
    pub(crate) fn inject_with_more(
        &mut self,
        slot: usize,
        command_id: u16,
        sq_head: u16,
        success: bool,
        more: bool,
    ) {
        let phase_for_slot = if slot < self.head { !self.phase } else { self.phase };
        let status = (if success { 0u16 } else { 0b10 })
            | ((more as u16) << 14)
            | (phase_for_slot as u16);
        self.commands[slot] = CompletionQueueEntry {
            command_specific: 0,
            _reserved: 0,
            sq_head,
            sq_id: 0,
            command_id,
            status,
        };
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::testing::MockAllocator;

    #[test]
    fn submission_queue_is_full_when_tail_would_catch_head() {
        let allocator = MockAllocator;
        let mut sq = SubmissionQueue::new(4, 4096, &allocator).unwrap();
        assert!(!sq.is_full());
        for _ in 0..3 {
            sq.submit(NvmeCommand::default());
        }
        assert!(sq.is_full());
    }

    #[test]
    fn submit_returns_successive_slots_and_wraps() {
        let allocator = MockAllocator;
        let mut sq = SubmissionQueue::new(4, 4096, &allocator).unwrap();
        assert_eq!(sq.submit(NvmeCommand::default()), 0);
        assert_eq!(sq.submit(NvmeCommand::default()), 1);
        assert_eq!(sq.submit(NvmeCommand::default()), 2);
    }

    #[test]
    fn reap_drains_contiguous_ready_entries_and_stops_at_phase_mismatch() {
        let allocator = MockAllocator;
        let mut cq = CompletionQueue::new(4, 4096, &allocator).unwrap();
        cq.inject(0, 10, 1, true);
        cq.inject(1, 11, 2, false);
        // slot 2 left zeroed: its phase bit (0) does not match the expected
        // phase (true), so reap must stop there.
        let (completions, new_head) = cq.reap();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].command_id, 10);
        assert!(!completions[0].do_not_retry);
        assert_eq!(completions[0].status_code, 0);
        assert_eq!(completions[1].command_id, 11);
        assert_eq!(completions[1].status_code, 1);
        assert_eq!(new_head, Some(2));
    }

    #[test]
    fn reap_reports_no_progress_when_nothing_is_ready() {
        let allocator = MockAllocator;
        let mut cq = CompletionQueue::new(4, 4096, &allocator).unwrap();
        let (completions, new_head) = cq.reap();
        assert!(completions.is_empty());
        assert_eq!(new_head, None);
    }
}
