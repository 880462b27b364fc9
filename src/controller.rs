use crate::bdf::Bdf;
use crate::cmd::{IdentifyNamespace, NvmeCommand};
use crate::dma::{Allocator, Dma};
use crate::dma_arena::DmaArena;
use crate::pci;
use crate::queue_pairs::{AdminQueuePair, IoQueuePair, IoQueuePairId};
use crate::queues::{CompletionQueue, SubmissionQueue};
use crate::regs::{Reg32, Reg64, RegisterWindow};
use ahash::RandomState;
use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use hashbrown::HashMap;
use log::debug;
use std::sync::Mutex;

use crate::error::Error;

#[derive(Debug)]
pub struct ControllerInformation {
    pub pci_vendor_id: u16,
    pub pci_subsystem_vendor_id: u16,
    pub serial_number: String,
    pub model_number: String,
    pub firmware_revision: String,
    pub minimum_memory_page_size: u64,
    pub maximum_memory_page_size: u64,
    pub memory_page_size: usize,
    pub maximum_number_of_io_queue_pairs: u16,
    pub maximum_queue_entries_supported: u32,
    pub maximum_transfer_size: usize,
    pub controller_id: u16,
    pub version: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct NamespaceInfo {
    pub id: u32,
    pub blocks: u64,
    pub block_size: u64,
}

/// A requested set of I/O queue pairs. `0` in either field means "use the
/// controller's identified maximum" rather than a literal zero-sized
/// request, which the device would reject.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueConfig {
    /// How many I/O queue pairs to pre-create for the namespace handle.
    pub queue_count: u16,
    /// Entries per queue pair; the same depth is used for all of them.
    pub queue_entries: u32,
}

impl QueueConfig {
    fn resolve(self, max_entries: u32) -> u32 {
        if self.queue_entries == 0 {
            max_entries
        } else {
            self.queue_entries
        }
    }
}

/// The admin path and its scratch buffer: everything a bring-up or
/// queue-management command needs exclusive access to while it runs.
struct AdminState {
    admin_queue_pair: AdminQueuePair,
    io_queue_pair_ids: Vec<IoQueuePairId>,
    buffer: Dma<u8>,
}

/// An open NVMe controller, shared through an `Arc` by every `Namespace`
/// opened against it. The register window is immutable after bring-up and
/// freely read from any thread; the admin queue pair and its scratch buffer
/// are serialized behind `admin`, since NVMe has exactly one admin queue
/// pair per controller regardless of how many namespaces share it.
pub struct Controller<A: Allocator> {
    allocator: Arc<A>,
    regs: RegisterWindow,
    information: ControllerInformation,
    namespaces: HashMap<u32, NamespaceInfo, RandomState>,
    admin: Mutex<AdminState>,
    arena: Arc<DmaArena<A>>,
}

unsafe impl<A: Allocator> Send for Controller<A> {}
unsafe impl<A: Allocator> Sync for Controller<A> {}

impl<A: Allocator> Controller<A> {
    pub fn from_pci_address(pci_address: &str, page_size: usize, allocator: A) -> Result<Self, Error> {
        let mut vendor_file = pci::open_resource_readonly(pci_address, "vendor")
            .map_err(Error::UnixPciError)?;
        let mut device_file = pci::open_resource_readonly(pci_address, "device")
            .map_err(Error::UnixPciError)?;
        let mut config_file = pci::open_resource_readonly(pci_address, "config")
            .map_err(Error::UnixPciError)?;

        let _vendor_id = pci::read_hex(&mut vendor_file).map_err(Error::UnixPciError)?;
        let _device_id = pci::read_hex(&mut device_file).map_err(Error::UnixPciError)?;
        let class_id = pci::read_io32(&mut config_file, 8)
            .map_err(|e| Error::UnixPciError(Box::new(e)))?
            >> 16;

        // 0x01 -> mass storage device class id, 0x08 -> NVMe subclass
        if class_id != 0x0108 {
            return Err(Error::NotABlockDevice(pci_address.to_string()));
        }

        let (address, length) = pci::mmap_resource(pci_address).map_err(Error::UnixPciError)?;
        Controller::new(address, length, page_size, allocator)
    }

    /// Resolves `bdf.address()` through sysfs and attaches it. The session
    /// façade's registry calls this to bring up a controller the first time
    /// its address is opened.
    pub(crate) fn attach(bdf: Bdf, page_size: usize, allocator: A) -> Result<Self, Error> {
        Self::from_pci_address(&bdf.address(), page_size, allocator)
    }

    pub fn new(address: *mut u8, length: usize, page_size: usize, allocator: A) -> Result<Self, Error> {
        let _ = env_logger::try_init();

        let mut regs = RegisterWindow::new(address, length);

        debug!("reading capabilities");
        let cap = regs.get64(Reg64::CAP)?;
        let maximum_queue_entries_supported = (cap & 0xFFFF) as u32 + 1; // MQES
        let doorbell_stride = ((cap >> 32) & 0b1111) as u16; // DSTRD
        let nvm_command_set_support = ((cap >> 37) & 0b1) == 1; // CSS: NCSS
        let minimum_memory_page_size = 1u64 << (((cap >> 48) & 0b1111) + 12); // MPSMIN
        let maximum_memory_page_size = 1u64 << (((cap >> 52) & 0b1111) + 12); // MPSMAX
        regs.set_doorbell_stride(doorbell_stride);

        if maximum_queue_entries_supported == 1 {
            return Err(Error::MaximumQueueEntriesSupportedInvalidlyZero);
        }
        if !nvm_command_set_support {
            return Err(Error::NvmCommandSetNotSupported);
        }
        if minimum_memory_page_size > maximum_memory_page_size {
            return Err(Error::MemoryPageSizeMinimumBiggerThanMaximum(
                minimum_memory_page_size,
                maximum_memory_page_size,
            ));
        }

        let ps_4_kibi_byte = 2usize.pow(12);
        let ps_128_mebi_byte = 2usize.pow(28);
        if page_size < ps_4_kibi_byte {
            return Err(Error::PageSizeLessThanNvmeMinimum(page_size));
        }
        if page_size > ps_128_mebi_byte {
            return Err(Error::PageSizeMoreThanNvmeMaximum(page_size));
        }
        if (page_size as u64) < minimum_memory_page_size {
            return Err(Error::PageSizeLessThanControllerMinimum(
                page_size,
                minimum_memory_page_size,
            ));
        }
        if page_size as u64 > maximum_memory_page_size {
            return Err(Error::PageSizeMoreThanControllerMaximum(
                page_size,
                maximum_memory_page_size,
            ));
        }
        if page_size.count_ones() != 1 {
            return Err(Error::PageSizeNotAPowerOfTwo(page_size));
        }

        debug!("disabling controller");
        let mut cc = regs.get32(Reg32::CC)?;
        cc &= 0xFFFF_FFFE;
        regs.set32(Reg32::CC, cc)?;
        loop {
            if regs.get32(Reg32::CSTS)? & 1 == 1 {
                spin_loop();
            } else {
                break;
            }
        }

        debug!("configuring admin queues");
        const ADMIN_QUEUE_ENTRIES: usize = 64;
        let mut admin_queue_pair = AdminQueuePair::new(ADMIN_QUEUE_ENTRIES, page_size, &allocator)?;
        regs.set64(Reg64::ASQ, admin_queue_pair.sq_addr() as u64)?;
        regs.set64(Reg64::ACQ, admin_queue_pair.cq_addr() as u64)?;
        let aqa = (ADMIN_QUEUE_ENTRIES as u32 - 1) << 16 | (ADMIN_QUEUE_ENTRIES as u32 - 1);
        regs.set32(Reg32::AQA, aqa)?;

        debug!("setting controller configuration");
        let enable = 0b1;
        let memory_page_size = ((page_size.ilog2() - 12) & 0b1111) << 7;
        let io_submission_queue_entry_size = 6 << 16; // 64 bytes
        let io_completion_queue_entry_size = 4 << 20; // 16 bytes
        let cc = enable
            | memory_page_size
            | io_submission_queue_entry_size
            | io_completion_queue_entry_size;
        regs.set32(Reg32::CC, cc)?;

        debug!("enabling controller");
        loop {
            if regs.get32(Reg32::CSTS)? & 1 == 0 {
                spin_loop();
            } else {
                break;
            }
        }

        let buffer: Dma<u8> = Dma::allocate(page_size, page_size, &allocator)?;

        debug!("identifying controller");
        admin_queue_pair.submit_and_wait(&regs, |command_id| {
            NvmeCommand::identify_controller(command_id, buffer.physical_address() as usize)
        })?;

        fn read_c_string_from_slice(slice: &[u8]) -> String {
            let mut string = String::new();
            for &byte in slice {
                if byte == 0 {
                    break;
                }
                string.push(byte as char);
            }
            string.trim().to_string()
        }
        let pci_vendor_id = ((buffer[1] as u16) << 8) | buffer[0] as u16;
        let pci_subsystem_vendor_id = ((buffer[3] as u16) << 8) | buffer[2] as u16;
        let serial_number = read_c_string_from_slice(&buffer[4..=23]);
        let model_number = read_c_string_from_slice(&buffer[24..=63]);
        let firmware_revision = read_c_string_from_slice(&buffer[64..=71]);
        let maximum_data_transfer_size = 1usize << buffer[77];
        let controller_id = ((buffer[79] as u16) << 8) | buffer[78] as u16;
        let version = ((buffer[83] as u32) << 24)
            | ((buffer[82] as u32) << 16)
            | ((buffer[81] as u32) << 8)
            | buffer[80] as u32;
        let controller_type = buffer[111];

        if controller_type != 1 {
            let type_name = match controller_type {
                0 => "not reported",
                2 => "discovery controller",
                3 => "administrative controller",
                _ => "unknown",
            };
            return Err(Error::ControllerTypeInvalid(type_name.to_string()));
        }
        let maximum_transfer_size = minimum_memory_page_size as usize * maximum_data_transfer_size;

        debug!("negotiating queue count");
        // The qid field is 4 bits wide (0 reserved for admin), so 15 is the
        // most this driver could ever address regardless of what the device
        // is willing to grant; request that ceiling and let the device tell
        // us how many it actually allocated.
        const REQUESTED_IO_QUEUE_PAIRS: u16 = 15;
        let negotiated = admin_queue_pair.submit_and_wait(&regs, |command_id| {
            NvmeCommand::set_features_number_of_queues(command_id, REQUESTED_IO_QUEUE_PAIRS)
        })?;
        let granted_submission_queues = (negotiated.command_specific & 0xFFFF) as u16 + 1;
        let granted_completion_queues = ((negotiated.command_specific >> 16) & 0xFFFF) as u16 + 1;
        let maximum_number_of_io_queue_pairs = granted_submission_queues
            .min(granted_completion_queues)
            .min(REQUESTED_IO_QUEUE_PAIRS);

        let information = ControllerInformation {
            pci_vendor_id,
            pci_subsystem_vendor_id,
            serial_number,
            model_number,
            firmware_revision,
            minimum_memory_page_size,
            maximum_memory_page_size,
            memory_page_size: page_size,
            maximum_number_of_io_queue_pairs,
            maximum_queue_entries_supported,
            maximum_transfer_size,
            controller_id,
            version,
        };
        debug!("{information:?}");

        debug!("identifying active namespace ids");
        admin_queue_pair.submit_and_wait(&regs, |command_id| {
            NvmeCommand::identify_namespace_list(command_id, buffer.physical_address() as usize, 0)
        })?;
        let buffer_as_u32: &[u32] = unsafe {
            core::slice::from_raw_parts(buffer.virtual_address() as *const u32, buffer.len() / 4)
        };
        let namespace_ids = buffer_as_u32
            .iter()
            .copied()
            .take_while(|&id| id != 0)
            .collect::<Vec<u32>>();

        let mut namespaces = HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0));
        for namespace_id in namespace_ids {
            admin_queue_pair.submit_and_wait(&regs, |command_id| {
                NvmeCommand::identify_namespace(command_id, buffer.physical_address() as usize, namespace_id)
            })?;
            let namespace_data: IdentifyNamespace =
                unsafe { (*(buffer.virtual_address() as *const IdentifyNamespace)).clone() };

            let flba_index = (namespace_data.formatted_lba_size & 0xF) as usize;
            let flba_data = (namespace_data.lba_formats_list[flba_index] >> 16) & 0xFF;
            let block_size = if !(9..32).contains(&flba_data) {
                0
            } else {
                1 << flba_data
            };

            let namespace = NamespaceInfo {
                id: namespace_id,
                blocks: namespace_data.namespace_capacity,
                block_size,
            };
            debug!("{namespace:?}");
            namespaces.insert(namespace_id, namespace);
        }

        let allocator = Arc::new(allocator);
        let arena = Arc::new(DmaArena::new(allocator.clone(), page_size));

        Ok(Self {
            allocator,
            regs,
            information,
            namespaces,
            admin: Mutex::new(AdminState {
                admin_queue_pair,
                io_queue_pair_ids: Vec::new(),
                buffer,
            }),
            arena,
        })
    }

    pub fn controller_information(&self) -> &ControllerInformation {
        &self.information
    }

    pub fn namespace(&self, id: u32) -> Option<NamespaceInfo> {
        self.namespaces.get(&id).copied()
    }

    pub fn namespace_ids(&self) -> Vec<u32> {
        self.namespaces.keys().copied().collect()
    }

    pub(crate) fn allocator(&self) -> &Arc<A> {
        &self.allocator
    }

    /// The shared DMA arena backing every namespace opened against this
    /// controller. One arena per controller, not per namespace: buffers
    /// allocated by one namespace handle are valid to pass to another on the
    /// same device, and the arena is only torn down once, when the last
    /// handle closes.
    pub(crate) fn arena(&self) -> &Arc<DmaArena<A>> {
        &self.arena
    }

    /// Disables the controller (`CC.EN=0`, spin until `CSTS.RDY=0`) and
    /// unmaps its register window. Called once, by the namespace handle that
    /// observes itself as the last one open against this controller.
    pub(crate) fn disable(&self) -> Result<(), Error> {
        if self.regs.len() == 0 {
            // A stub controller built for registry/sharing tests has no
            // real register window to tear down.
            return Ok(());
        }
        debug!("disabling controller");
        let mut cc = self.regs.get32(Reg32::CC)?;
        cc &= 0xFFFF_FFFE;
        self.regs.set32(Reg32::CC, cc)?;
        loop {
            if self.regs.get32(Reg32::CSTS)? & 1 == 1 {
                spin_loop();
            } else {
                break;
            }
        }
        unsafe {
            libc::munmap(self.regs.address() as *mut libc::c_void, self.regs.len());
        }
        Ok(())
    }

    /// Creates one I/O completion queue and one I/O submission queue, in
    /// that order (a submission queue's create command must name an
    /// already-created completion queue). If the submission queue create
    /// fails after the completion queue succeeded, the completion queue is
    /// deleted before the error is returned, so a failed call leaves no
    /// orphaned queue behind.
    pub fn create_io_queue_pair(&self, config: QueueConfig) -> Result<IoQueuePair<A>, Error> {
        let mut admin = self.admin.lock().unwrap();

        if admin.io_queue_pair_ids.len() >= self.information.maximum_number_of_io_queue_pairs as usize
        {
            return Err(Error::MaximumNumberOfQueuesReached);
        }
        let queue_entries = config.resolve(self.information.maximum_queue_entries_supported);
        if queue_entries < 2 {
            return Err(Error::NumberOfQueueEntriesLessThanTwo(queue_entries));
        }
        if queue_entries > self.information.maximum_queue_entries_supported {
            return Err(Error::NumberOfQueueEntriesMoreThanMaximum(
                queue_entries,
                self.information.maximum_queue_entries_supported,
            ));
        }

        let mut queue_id = None;
        for i in 1..=self.information.maximum_number_of_io_queue_pairs {
            if !admin.io_queue_pair_ids.contains(&IoQueuePairId(i)) {
                queue_id = Some(IoQueuePairId(i));
                break;
            }
        }
        let queue_id = queue_id.ok_or(Error::MaximumNumberOfQueuesReached)?;

        debug!("creating i/o queue pair {}", queue_id.0);

        let completion_queue = CompletionQueue::new(
            queue_entries as usize,
            self.information.memory_page_size,
            self.allocator.as_ref(),
        )?;
        admin.admin_queue_pair.submit_and_wait(&self.regs, |command_id| {
            NvmeCommand::create_io_completion_queue(
                command_id,
                queue_id.0,
                completion_queue.get_addr(),
                (queue_entries - 1) as u16,
            )
        })?;

        let submission_queue = SubmissionQueue::new(
            queue_entries as usize,
            self.information.memory_page_size,
            self.allocator.as_ref(),
        )?;
        let submission_created = admin.admin_queue_pair.submit_and_wait(&self.regs, |command_id| {
            NvmeCommand::create_io_submission_queue(
                command_id,
                queue_id.0,
                submission_queue.get_addr(),
                (queue_entries - 1) as u16,
                queue_id.0,
            )
        });
        if let Err(err) = submission_created {
            let _ = admin.admin_queue_pair.submit_and_wait(&self.regs, |command_id| {
                NvmeCommand::delete_io_completion_queue(command_id, queue_id.0)
            });
            return Err(err);
        }

        let io_queue_pair = IoQueuePair::new(
            queue_id,
            submission_queue,
            completion_queue,
            self.regs,
            queue_entries as usize,
            self.information.memory_page_size,
            self.allocator.clone(),
        )?;
        admin.io_queue_pair_ids.push(queue_id);
        Ok(io_queue_pair)
    }

    /// Tears down a queue pair's submission queue, then its completion
    /// queue. Deleting the submission queue first matches the create order
    /// in reverse, so the controller never sees a submission queue
    /// referencing an already-deleted completion queue.
    pub fn delete_io_queue_pair(&self, queue_pair: IoQueuePair<A>) -> Result<(), Error> {
        let id = queue_pair.id();
        debug!("deleting i/o queue pair {}", id.0);
        let mut admin = self.admin.lock().unwrap();
        let index = admin
            .io_queue_pair_ids
            .iter()
            .position(|existing| *existing == id)
            .ok_or(Error::IoQueuePairDoesNotExist(id))?;
        admin.io_queue_pair_ids.remove(index);
        admin.admin_queue_pair.submit_and_wait(&self.regs, |command_id| {
            NvmeCommand::delete_io_submission_queue(command_id, id.0)
        })?;
        admin.admin_queue_pair.submit_and_wait(&self.regs, |command_id| {
            NvmeCommand::delete_io_completion_queue(command_id, id.0)
        })?;
        Ok(())
    }

    pub fn clear_namespace(&self, namespace_id: Option<u32>) -> Result<(), Error> {
        let namespace_id = match namespace_id {
            Some(id) if self.namespaces.contains_key(&id) => id,
            Some(id) => return Err(Error::NamespaceDoesNotExist(id)),
            None => 0xFFFF_FFFF,
        };
        self.admin
            .lock()
            .unwrap()
            .admin_queue_pair
            .submit_and_wait(&self.regs, |command_id| {
                NvmeCommand::format_nvm(command_id, namespace_id)
            })?;
        Ok(())
    }

    pub fn flush_namespace(&self, namespace_id: u32) -> Result<(), Error> {
        self.admin
            .lock()
            .unwrap()
            .admin_queue_pair
            .submit_and_wait(&self.regs, |command_id| {
                NvmeCommand::flush(command_id, namespace_id)
            })?;
        Ok(())
    }
}

#[cfg(test)]
impl<A: Allocator> Controller<A> {
    /// Builds a `Controller` without touching real hardware, so
    /// `registry`/`session` sharing behavior can be exercised without a PCI
    /// device. Its register window is unusable; tests built on this stub
    /// must stick to the sharing/refcounting surface, not I/O.
    pub(crate) fn stub(allocator: A) -> Self {
        let regs = RegisterWindow::new(core::ptr::null_mut(), 0);
        let admin_queue_pair = AdminQueuePair::new(2, 4096, &allocator).unwrap();
        let buffer = Dma::<u8>::allocate(4096, 4096, &allocator).unwrap();
        let allocator = Arc::new(allocator);
        let arena = Arc::new(DmaArena::new(allocator.clone(), 4096));
        Self {
            allocator,
            regs,
            information: ControllerInformation {
                pci_vendor_id: 0,
                pci_subsystem_vendor_id: 0,
                serial_number: String::new(),
                model_number: String::new(),
                firmware_revision: String::new(),
                minimum_memory_page_size: 4096,
                maximum_memory_page_size: 4096,
                memory_page_size: 4096,
                maximum_number_of_io_queue_pairs: 15,
                maximum_queue_entries_supported: 64,
                maximum_transfer_size: 128 * 1024,
                controller_id: 0,
                version: 0,
            },
            namespaces: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            admin: Mutex::new(AdminState {
                admin_queue_pair,
                io_queue_pair_ids: Vec::new(),
                buffer,
            }),
            arena,
        }
    }
}
