use crate::bdf::Bdf;
use crate::queue_pairs::IoQueuePairId;
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use core::fmt;

/// Errors surfaced by the core. `Fatal` wraps a bring-up failure into an
/// unusable-namespace-handle outcome; everything else is a caller-facing
/// return value, not a panic.
#[derive(Debug)]
pub enum Error {
    InvalidArgument(String),
    OutOfResource(String),
    NotOwned,
    DeviceTimeout(String),
    NvmeStatus { status_type: u8, status_code: u8 },
    Fatal(Box<Error>),

    // Bring-up detail variants, inherited from the reference driver.
    Allocate(Box<dyn core::error::Error>),
    Deallocate(Box<dyn core::error::Error>),
    TranslateVirtualToPhysical(Box<dyn core::error::Error>),
    Layout(core::alloc::LayoutError),
    NotABlockDevice(String),
    MaximumQueueEntriesSupportedInvalidlyZero,
    NvmCommandSetNotSupported,
    MemoryPageSizeMinimumBiggerThanMaximum(u64, u64),
    PageSizeLessThanNvmeMinimum(usize),
    PageSizeMoreThanNvmeMaximum(usize),
    PageSizeLessThanControllerMinimum(usize, u64),
    PageSizeMoreThanControllerMaximum(usize, u64),
    PageSizeNotAPowerOfTwo(usize),
    ControllerTypeInvalid(String),
    NamespaceDoesNotExist(u32),
    NumberOfQueueEntriesLessThanTwo(u32),
    NumberOfQueueEntriesMoreThanMaximum(u32, u32),
    MaximumNumberOfQueuesReached,
    IoQueuePairDoesNotExist(IoQueuePairId),
    MemoryAccessOutOfBounds,
    UnixPciError(Box<dyn core::error::Error>),
    VirtualAddressIsNotDwordAligned(usize),
    VirtualAddressIsNotPageAligned(usize),
    BufferLengthBiggerThanMaximumTransferSize(usize, usize),
    BufferLengthNotAMultipleOfNamespaceBlockSize(usize, u64),
    SubmissionQueueFull,
    CompletionQueueCompletionFailure,
    InvalidBdf(String),
    BadQueueConfig(String),
}

impl Error {
    /// Exit-code convention for the synchronous wrappers and CLI
    /// collaborators: `0` success, `-1` timeout, otherwise
    /// `(status-type << 8) | status-code`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::DeviceTimeout(_) => -1,
            Error::NvmeStatus {
                status_type,
                status_code,
            } => ((*status_type as i32) << 8) | *status_code as i32,
            _ => 1,
        }
    }

    pub(crate) fn unknown_bdf(bdf: Bdf) -> Self {
        Error::InvalidArgument(format!("no open controller at {bdf}"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::OutOfResource(msg) => write!(f, "out of resource: {msg}"),
            Error::NotOwned => write!(f, "pointer is not owned by this controller's DMA arena"),
            Error::DeviceTimeout(msg) => write!(f, "device timeout: {msg}"),
            Error::NvmeStatus {
                status_type,
                status_code,
            } => write!(
                f,
                "completion reported status type 0x{status_type:X} code 0x{status_code:X}"
            ),
            Error::Fatal(inner) => write!(f, "fatal bring-up error: {inner}"),
            Error::Allocate(error) => write!(f, "allocation error: {error}."),
            Error::Deallocate(error) => write!(f, "deallocation error: {error}."),
            Error::TranslateVirtualToPhysical(error) => write!(f, "translation error: {error}."),
            Error::Layout(error) => write!(f, "{error}"),
            Error::NotABlockDevice(pci_address) => write!(
                f,
                "the device at PCI address {pci_address} is not a block device"
            ),
            Error::MaximumQueueEntriesSupportedInvalidlyZero => write!(
                f,
                "the value of \"Maximum Queue Entries Supported\" (MQES) in CAP is invalidly 0"
            ),
            Error::NvmCommandSetNotSupported => {
                write!(f, "the device does not support the NVM command set")
            }
            Error::MemoryPageSizeMinimumBiggerThanMaximum(minimum, maximum) => write!(
                f,
                "MPSMIN ({minimum}) is bigger than MPSMAX ({maximum}) in CAP"
            ),
            Error::PageSizeLessThanNvmeMinimum(page_size) => write!(
                f,
                "page size 0x{page_size:X} is less than the NVMe minimum of 4 KiB"
            ),
            Error::PageSizeMoreThanNvmeMaximum(page_size) => write!(
                f,
                "page size 0x{page_size:X} is more than the NVMe maximum of 128 MiB"
            ),
            Error::PageSizeLessThanControllerMinimum(page_size, minimum) => write!(
                f,
                "page size 0x{page_size:X} is less than the controller minimum 0x{minimum:X}"
            ),
            Error::PageSizeMoreThanControllerMaximum(page_size, maximum) => write!(
                f,
                "page size 0x{page_size:X} is more than the controller maximum 0x{maximum:X}"
            ),
            Error::PageSizeNotAPowerOfTwo(page_size) => {
                write!(f, "page size 0x{page_size:X} is not a power of two")
            }
            Error::ControllerTypeInvalid(type_name) => write!(
                f,
                "the controller type is not \"I/O controller\" but instead \"{type_name}\""
            ),
            Error::NamespaceDoesNotExist(id) => {
                write!(f, "the namespace with ID {id} does not exist")
            }
            Error::NumberOfQueueEntriesLessThanTwo(entries) => {
                write!(f, "the number of queue entries ({entries}) must be >= 2")
            }
            Error::NumberOfQueueEntriesMoreThanMaximum(entries, maximum) => write!(
                f,
                "the number of queue entries ({entries}) exceeds the maximum ({maximum})"
            ),
            Error::MaximumNumberOfQueuesReached => write!(f, "maximum number of queues reached"),
            Error::IoQueuePairDoesNotExist(id) => {
                write!(f, "the I/O queue pair with ID {} does not exist", id.0)
            }
            Error::MemoryAccessOutOfBounds => write!(f, "memory access out of bounds"),
            Error::UnixPciError(error) => write!(f, "{error}"),
            Error::VirtualAddressIsNotDwordAligned(address) => {
                write!(f, "virtual address 0x{address:X} is not dword aligned")
            }
            Error::VirtualAddressIsNotPageAligned(address) => {
                write!(f, "virtual address 0x{address:X} is not page aligned")
            }
            Error::BufferLengthBiggerThanMaximumTransferSize(length, max) => write!(
                f,
                "buffer length 0x{length:X} exceeds the maximum transfer size 0x{max:X}"
            ),
            Error::BufferLengthNotAMultipleOfNamespaceBlockSize(length, block_size) => write!(
                f,
                "buffer length 0x{length:X} is not a multiple of the block size 0x{block_size:X}"
            ),
            Error::SubmissionQueueFull => write!(f, "the submission queue is full"),
            Error::CompletionQueueCompletionFailure => {
                write!(f, "the completion queue could not complete the command")
            }
            Error::InvalidBdf(s) => write!(f, "invalid PCI device identifier: {s}"),
            Error::BadQueueConfig(msg) => write!(f, "invalid queue configuration: {msg}"),
        }
    }
}

impl core::error::Error for Error {}
