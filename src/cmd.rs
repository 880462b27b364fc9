/// NVMe Spec 4.2
/// Submission queue entry
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub(crate) struct NvmeCommand {
    pub(crate) opcode: u8,
    /// Flags; FUSE (2 bits) | Reserved (4 bits) | PSDT (2 bits)
    pub(crate) flags: u8,
    pub(crate) command_id: u16,
    pub(crate) namespace_id: u32,
    pub(crate) _reserved: u64,
    pub(crate) metadata_pointer: u64,
    pub(crate) data_pointer: [u64; 2],
    /// Command dword 10
    pub(crate) cdw10: u32,
    /// Command dword 11
    pub(crate) cdw11: u32,
    /// Command dword 12
    pub(crate) cdw12: u32,
    /// Command dword 13
    pub(crate) cdw13: u32,
    /// Command dword 14
    pub(crate) cdw14: u32,
    /// Command dword 15
    pub(crate) cdw15: u32,
}

impl NvmeCommand {
    pub(crate) fn create_io_completion_queue(
        command_id: u16,
        queue_id: u16,
        data_pointer: usize,
        size: u16,
    ) -> Self {
        Self {
            opcode: 5,
            flags: 0,
            command_id,
            namespace_id: 0,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [data_pointer as u64, 0],
            cdw10: ((size as u32) << 16) | (queue_id as u32),
            cdw11: 1, // Physically Contiguous
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn create_io_submission_queue(
        command_id: u16,
        submission_queue_id: u16,
        data_pointer: usize,
        size: u16,
        completion_queue_id: u16,
    ) -> Self {
        Self {
            opcode: 1,
            flags: 0,
            command_id,
            namespace_id: 0,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [data_pointer as u64, 0],
            cdw10: ((size as u32) << 16) | (submission_queue_id as u32),
            cdw11: ((completion_queue_id as u32) << 16) | 1, /* Physically Contiguous */
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn delete_io_submission_queue(command_id: u16, queue_id: u16) -> Self {
        Self {
            opcode: 0,
            command_id,
            cdw10: queue_id as u32,
            ..Default::default()
        }
    }

    pub(crate) fn delete_io_completion_queue(command_id: u16, queue_id: u16) -> Self {
        Self {
            opcode: 4,
            command_id,
            cdw10: queue_id as u32,
            ..Default::default()
        }
    }

    pub(crate) fn identify_namespace(
        command_id: u16,
        data_pointer: usize,
        namespace_id: u32,
    ) -> Self {
        Self {
            opcode: 6,
            flags: 0,
            command_id,
            namespace_id,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [data_pointer as u64, 0],
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn identify_controller(command_id: u16, data_pointer: usize) -> Self {
        Self {
            opcode: 6,
            flags: 0,
            command_id,
            namespace_id: 0,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [data_pointer as u64, 0],
            cdw10: 1,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn identify_namespace_list(command_id: u16, data_pointer: usize, base: u32) -> Self {
        Self {
            opcode: 6,
            flags: 0,
            command_id,
            namespace_id: base,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [data_pointer as u64, 0],
            cdw10: 2,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn set_features_number_of_queues(command_id: u16, qcount: u16) -> Self {
        Self {
            opcode: 0x9,
            command_id,
            cdw10: FeatureIdentifier::NumberOfQueues as u32,
            // identical submission and completion queue count requested, 0's based
            cdw11: ((qcount as u32 - 1) << 16) | (qcount as u32 - 1),
            ..Default::default()
        }
    }

    pub(crate) fn io_read(
        command_id: u16,
        namespace_id: u32,
        logical_block_address: u64,
        number_of_blocks: u16,
        prp_1: u64,
        prp_2: u64,
    ) -> Self {
        Self {
            opcode: 2,
            flags: 0,
            command_id,
            namespace_id,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [prp_1, prp_2],
            cdw10: logical_block_address as u32,
            cdw11: (logical_block_address >> 32) as u32,
            cdw12: number_of_blocks as u32,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn io_write(
        command_id: u16,
        namespace_id: u32,
        logical_block_address: u64,
        number_of_blocks: u16,
        prp_1: u64,
        prp_2: u64,
    ) -> Self {
        Self {
            opcode: 1,
            flags: 0,
            command_id,
            namespace_id,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [prp_1, prp_2],
            cdw10: logical_block_address as u32,
            cdw11: (logical_block_address >> 32) as u32,
            cdw12: number_of_blocks as u32,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn flush(command_id: u16, namespace_id: u32) -> Self {
        Self {
            opcode: 0,
            flags: 0,
            command_id,
            namespace_id,
            ..Default::default()
        }
    }

    /// A caller-supplied opaque opcode for vendor-specific "translate/
    /// compute-offload" commands. The opcode byte and dword layout are
    /// device-specific and not defined here; the core only plumbs them
    /// through unmodified.
    pub(crate) fn vendor_passthrough(
        opcode: u8,
        command_id: u16,
        namespace_id: u32,
        prp_1: u64,
        prp_2: u64,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
    ) -> Self {
        Self {
            opcode,
            flags: 0,
            command_id,
            namespace_id,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [prp_1, prp_2],
            cdw10,
            cdw11,
            cdw12,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub(crate) fn format_nvm(command_id: u16, namespace_id: u32) -> Self {
        Self {
            opcode: 0x80,
            flags: 0,
            command_id,
            namespace_id,
            _reserved: 0,
            metadata_pointer: 0,
            data_pointer: [0, 0],
            cdw10: 1 << 9,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

#[allow(dead_code)]
/// FID
#[derive(Debug, Clone, Copy)]
pub(crate) enum FeatureIdentifier {
    Arbitration = 0x1,
    PowerManagement = 0x2,
    TemperatureThreshold = 0x4,
    VolatileWriteCache = 0x6,
    NumberOfQueues = 0x7,
    InterruptCoalescing = 0x08,
    AsynchronousEventConfiguration = 0x0B,
}

#[repr(C, packed)]
#[derive(Debug, Clone)]
pub(crate) struct IdentifyNamespace {
    pub(crate) namespace_size: u64,
    pub(crate) namespace_capacity: u64,
    pub(crate) namespace_uitilization: u64,
    pub(crate) namespace_features: u8,
    pub(crate) number_of_lba_formats: u8,
    pub(crate) formatted_lba_size: u8,
    pub(crate) metadata_capabilites: u8,
    pub(crate) end_to_end_data_protection_capabilites: u8,
    pub(crate) end_to_end_data_protection_type_settings: u8,
    pub(crate) namespace_multi_path_io_and_namespace_sharing_capabilites: u8,
    pub(crate) reservation_capabilities: u8,
    pub(crate) format_progress_indicator: u8,
    pub(crate) deallocate_logical_block_features: u8,
    pub(crate) namespace_atomic_write_unit_normal: u16,
    pub(crate) namespace_atomic_write_unit_power_fail: u16,
    pub(crate) namespace_atomic_compare_and_write_unit: u16,
    pub(crate) namespace_atomic_boundary_size_normal: u16,
    pub(crate) namespace_atomic_boundary_offset: u16,
    pub(crate) namespace_atomic_boundary_size_power_fail: u16,
    pub(crate) namespace_optimal_io_boundary: u16,
    pub(crate) nvm_capacity: u128,
    pub(crate) namespace_preferred_write_granularity: u16,
    pub(crate) namespace_preferred_write_alignment: u16,
    pub(crate) namespace_preferred_dallocate_granularity: u16,
    pub(crate) namespace_preferred_dallocate_alignment: u16,
    pub(crate) namespace_optimal_write_size: u16,
    pub(crate) maximum_single_source_range_length: u16,
    pub(crate) maximum_copy_length: u32,
    pub(crate) maximum_source_range_count: u8,
    pub(crate) _reserved_1: [u8; 11],
    pub(crate) ana_group_identifier: u32,
    pub(crate) _reserved_2: [u8; 3],
    pub(crate) namespace_attributes: u8,
    pub(crate) nvm_set_identifier: u16,
    pub(crate) endurance_group_identifier: u16,
    pub(crate) namespace_globally_unique_identifier: [u8; 16],
    pub(crate) ieee_extended_unique_identifier: u64,
    pub(crate) lba_formats_list: [u32; 64],
    pub(crate) vendor_specific: [u8; 3712],
}

/// A parsed 16-byte completion queue entry (NVMe spec 4.6).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub(crate) command_specific: u32,
    pub(crate) sq_head: u16,
    pub(crate) command_id: u16,
    pub(crate) status_type: u8,
    pub(crate) status_code: u8,
    pub(crate) do_not_retry: bool,
    pub(crate) more: bool,
}

impl Completion {
    pub(crate) fn is_success(&self) -> bool {
        self.status_type == 0 && self.status_code == 0
    }

    /// `qid` and slot are encoded into `command_id` by the caller that
    /// stamped it: the top nibbles carry `qid`, the low 12 bits the slot.
    pub(crate) fn qid(&self) -> u16 {
        self.command_id >> 12
    }

    pub(crate) fn slot(&self) -> u16 {
        self.command_id & 0x0FFF
    }
}
