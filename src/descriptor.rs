use core::fmt;

/// Status of a completed command, as reported in its completion queue
/// entry's dword 3 (NVMe spec 4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub status_type: u8,
    pub status_code: u8,
    pub do_not_retry: bool,
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sct={:#x} sc={:#x}{}",
            self.status_type,
            self.status_code,
            if self.do_not_retry { " (dnr)" } else { "" }
        )
    }
}

/// Where a fragmented I/O stands. A read or write that needed `n`
/// sub-commands starts at `Pending(n)`; each sub-command's completion
/// decrements the count, and the descriptor resolves to `Done` only once
/// every fragment has completed successfully, or to `Error` on the first
/// failing fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorStatus {
    Pending(u32),
    Done,
    Error(NvmeStatus),
}

/// Bookkeeping for one outstanding asynchronous command, keyed by
/// descriptor id in the owning queue pair's table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DescriptorState {
    pub(crate) status: DescriptorStatus,
}

impl DescriptorState {
    pub(crate) fn new(fragments: u32) -> Self {
        Self {
            status: DescriptorStatus::Pending(fragments),
        }
    }

    /// Applies one fragment's completion. Once a fragment fails the
    /// descriptor latches that error and further completions for sibling
    /// fragments no longer change it.
    pub(crate) fn complete_fragment(&mut self, status: NvmeStatus, success: bool) {
        if let DescriptorStatus::Error(_) = self.status {
            return;
        }
        if !success {
            self.status = DescriptorStatus::Error(status);
            return;
        }
        if let DescriptorStatus::Pending(remaining) = self.status {
            self.status = if remaining <= 1 {
                DescriptorStatus::Done
            } else {
                DescriptorStatus::Pending(remaining - 1)
            };
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        !matches!(self.status, DescriptorStatus::Pending(_))
    }
}

/// A handle to one outstanding asynchronous command, returned by the
/// `aread`/`awrite`/`aflush` entry points and consumed by `apoll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub(crate) qid: u16,
    pub(crate) id: u64,
}

/// The outcome `apoll` reports for a resolved `Descriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Error(NvmeStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> NvmeStatus {
        NvmeStatus {
            status_type: 0,
            status_code: 0,
            do_not_retry: false,
        }
    }

    fn failed() -> NvmeStatus {
        NvmeStatus {
            status_type: 2,
            status_code: 0x81,
            do_not_retry: true,
        }
    }

    #[test]
    fn single_fragment_resolves_on_first_completion() {
        let mut state = DescriptorState::new(1);
        state.complete_fragment(ok(), true);
        assert_eq!(state.status, DescriptorStatus::Done);
    }

    #[test]
    fn multi_fragment_stays_pending_until_last_completion() {
        let mut state = DescriptorState::new(3);
        state.complete_fragment(ok(), true);
        assert!(!state.is_resolved());
        state.complete_fragment(ok(), true);
        assert!(!state.is_resolved());
        state.complete_fragment(ok(), true);
        assert_eq!(state.status, DescriptorStatus::Done);
    }

    #[test]
    fn first_failing_fragment_latches_error() {
        let mut state = DescriptorState::new(4);
        state.complete_fragment(ok(), true);
        state.complete_fragment(failed(), false);
        state.complete_fragment(ok(), true);
        assert_eq!(state.status, DescriptorStatus::Error(failed()));
    }
}
