/// One sub-command's share of a fragmented read or write: its own LBA,
/// block count and the byte offset into the caller's buffer it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) logical_block_address: u64,
    pub(crate) number_of_blocks: u16,
    pub(crate) buffer_offset: usize,
}

/// Splits a `number_of_blocks`-block transfer starting at
/// `logical_block_address` into fragments of at most `max_blocks_per_command`
/// blocks each, in ascending LBA order. `block_size` converts block counts
/// to the buffer-offset byte units the caller's data pointer is in.
///
/// Returns one fragment even when the transfer already fits in a single
/// command, so callers never special-case the unfragmented path.
pub(crate) fn split(
    logical_block_address: u64,
    number_of_blocks: u32,
    max_blocks_per_command: u16,
    block_size: usize,
) -> alloc::vec::Vec<Fragment> {
    let max = max_blocks_per_command as u32;
    let count = number_of_blocks.div_ceil(max).max(1);
    let mut fragments = alloc::vec::Vec::with_capacity(count as usize);

    let mut remaining = number_of_blocks;
    let mut lba = logical_block_address;
    let mut offset = 0usize;
    while remaining > 0 || fragments.is_empty() {
        let this = remaining.min(max) as u16;
        fragments.push(Fragment {
            logical_block_address: lba,
            number_of_blocks: this,
            buffer_offset: offset,
        });
        lba += this as u64;
        offset += this as usize * block_size;
        remaining -= this as u32;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_in_one_command_yields_single_fragment() {
        let fragments = split(10, 8, 64, 512);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].logical_block_address, 10);
        assert_eq!(fragments[0].number_of_blocks, 8);
        assert_eq!(fragments[0].buffer_offset, 0);
    }

    #[test]
    fn oversize_transfer_is_chunked_in_order() {
        let fragments = split(0, 150, 64, 512);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].number_of_blocks, 64);
        assert_eq!(fragments[1].number_of_blocks, 64);
        assert_eq!(fragments[2].number_of_blocks, 22);
        assert_eq!(fragments[1].logical_block_address, 64);
        assert_eq!(fragments[2].logical_block_address, 128);
        assert_eq!(fragments[1].buffer_offset, 64 * 512);
    }

    #[test]
    fn exact_multiple_does_not_emit_trailing_empty_fragment() {
        let fragments = split(0, 128, 64, 512);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].number_of_blocks, 64);
    }

    #[test]
    fn zero_blocks_still_emits_one_fragment() {
        let fragments = split(5, 0, 64, 512);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].number_of_blocks, 0);
    }
}
