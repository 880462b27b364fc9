use std::{env, process};

use nvmec::{Error, HugePageAllocator, QueueConfig, Session};

pub fn main() -> Result<(), Error> {
    let mut args = env::args();
    args.next();

    let bdf = match args.next() {
        Some(arg) => arg,
        None => {
            eprintln!("Usage: cargo run --example std_pci_huge <bus:device.function[/namespace]>");
            process::exit(1);
        }
    };

    // One `Session` shared by both opens: the second `open` below reuses the
    // controller the first one attached instead of remapping the BAR.
    let session: Session<HugePageAllocator> = Session::new();
    let queue = QueueConfig::default();

    let mut namespace_1 = session.open(&bdf, queue, nvmec::HUGE_PAGE_SIZE, HugePageAllocator)?;
    let mut namespace_2 = session.open(&bdf, queue, nvmec::HUGE_PAGE_SIZE, HugePageAllocator)?;

    const TEXT: &str = "Hello, world!";
    let logical_block_address = 0;

    let (source_1, dest_1) = write_then_read(&mut namespace_1, logical_block_address, TEXT)?;
    let (source_2, dest_2) = write_then_read(&mut namespace_2, logical_block_address, TEXT)?;

    namespace_1.close()?;
    namespace_2.close()?;

    println!("-----source_1: {source_1}");
    println!("destination_1: {dest_1}");
    println!("-----source_2: {source_2}");
    println!("destination_2: {dest_2}");

    Ok(())
}

fn write_then_read(
    namespace: &mut nvmec::Namespace<HugePageAllocator>,
    logical_block_address: u64,
    text: &str,
) -> Result<(String, String), Error> {
    let write_buffer = namespace.alloc(namespace.blocksize as usize)?;
    unsafe {
        let slice = std::slice::from_raw_parts_mut(write_buffer.virt, write_buffer.length);
        slice[..text.len()].copy_from_slice(text.as_bytes());
    }
    namespace.write(0, &write_buffer, logical_block_address, 1)?;
    namespace.free(write_buffer)?;

    let read_buffer = namespace.alloc(namespace.blocksize as usize)?;
    namespace.read(0, &read_buffer, logical_block_address, 1)?;
    let read_back = unsafe {
        let slice = std::slice::from_raw_parts(read_buffer.virt, text.len());
        std::str::from_utf8(slice).unwrap().to_string()
    };
    namespace.free(read_buffer)?;

    Ok((text.to_string(), read_back))
}
