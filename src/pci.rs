//! Sysfs access to the PCI device backing a `Controller`: unbinding any
//! kernel driver already attached, flipping the bus-master/interrupt bits in
//! config space, and mapping the device's BAR0 into this process.

use core::error::Error;
use core::ptr;
use std::boxed::Box;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::prelude::AsRawFd;
use std::string::String;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

// Command register offset in PCIe config space.
const COMMAND_REGISTER_OFFSET: u64 = 4;
// Bit 2: "bus master enable", see PCIe 3.0 specification section 7.5.1.1.
const BUS_MASTER_ENABLE_BIT: u64 = 2;
// Bit 10: "interrupt disable".
const INTERRUPT_DISABLE_BIT: u64 = 10;

/// Detaches whatever kernel driver (if any) currently owns `pci_address`, so
/// this process can mmap its BAR without the kernel's own NVMe driver
/// fighting over the device. Not being bound to anything is not an error.
pub(crate) fn unbind_driver(pci_address: &str) -> Result<(), Box<dyn Error>> {
    let path = std::format!("/sys/bus/pci/devices/{pci_address}/driver/unbind");

    match fs::OpenOptions::new().write(true).open(path) {
        Ok(mut f) => {
            write!(f, "{pci_address}")?;
            Ok(())
        }
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}

pub(crate) fn enable_dma(pci_address: &str) -> Result<(), Box<dyn Error>> {
    flip_command_register_bit(pci_address, BUS_MASTER_ENABLE_BIT)
}

pub(crate) fn disable_interrupts(pci_address: &str) -> Result<(), Box<dyn Error>> {
    flip_command_register_bit(pci_address, INTERRUPT_DISABLE_BIT)
}

fn flip_command_register_bit(pci_address: &str, bit: u64) -> Result<(), Box<dyn Error>> {
    let path = std::format!("/sys/bus/pci/devices/{pci_address}/config");
    let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;

    let mut command = read_io16(&mut file, COMMAND_REGISTER_OFFSET)?;
    command |= 1 << bit;
    Ok(write_io16(&mut file, command, COMMAND_REGISTER_OFFSET)?)
}

/// Unbinds, arms DMA and interrupt bits, then mmaps `resource0`. Returns the
/// mapped base address and its length; the caller owns the mapping and is
/// responsible for `munmap`-ing it (see `Controller::disable`).
pub(crate) fn mmap_resource(pci_address: &str) -> Result<(*mut u8, usize), Box<dyn Error>> {
    let path = std::format!("/sys/bus/pci/devices/{pci_address}/resource0");

    unbind_driver(pci_address)?;
    enable_dma(pci_address)?;
    disable_interrupts(pci_address)?;

    let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
    let len = fs::metadata(&path)?.len() as usize;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        ) as *mut u8
    };

    if ptr.is_null() || len == 0 {
        Err("pci mapping failed".into())
    } else {
        Ok((ptr, len))
    }
}

pub(crate) fn open_resource_readonly(pci_address: &str, resource: &str) -> Result<File, Box<dyn Error>> {
    let path = std::format!("/sys/bus/pci/devices/{pci_address}/{resource}");
    Ok(OpenOptions::new().read(true).write(false).open(path)?)
}

pub(crate) fn read_io16(file: &mut File, offset: u64) -> Result<u16, io::Error> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_u16::<NativeEndian>()
}

pub(crate) fn read_io32(file: &mut File, offset: u64) -> Result<u32, io::Error> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_u32::<NativeEndian>()
}

pub(crate) fn write_io16(file: &mut File, value: u16, offset: u64) -> Result<(), io::Error> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_u16::<NativeEndian>(value)
}

/// Reads the ASCII-hex contents of a sysfs attribute file (`vendor`,
/// `device`, ...) as a `u64`.
pub(crate) fn read_hex(file: &mut File) -> Result<u64, Box<dyn Error>> {
    let mut buffer = String::new();
    file.read_to_string(&mut buffer)?;

    Ok(u64::from_str_radix(
        buffer.trim().trim_start_matches("0x"),
        16,
    )?)
}
