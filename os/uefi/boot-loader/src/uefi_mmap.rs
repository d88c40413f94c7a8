//! # UEFI Memory Map Utilities
//!
//! Helper functions for dealing with the UEFI memory map after exiting boot
//! services. The memory map itself is retained only for diagnostics - XNU's
//! ARM boot protocol describes physical memory to the kernel through
//! `boot_args.mem_size` and the device tree's `/chosen/memory-map`, built by
//! [`loader_handoff::assemble`], not through a raw UEFI descriptor array.

use alloc::vec;
use alloc::vec::Vec;
use log::info;
use uefi::boot::MemoryType;
use uefi::mem::memory_map::MemoryMap;
use uefi::{Status, boot};

/// A retained copy of the memory map UEFI returned at `ExitBootServices`,
/// kept only so the loader can log how much memory firmware reported.
pub struct ExitedMemoryMap {
    pub descriptor_count: usize,
    pub desc_size: usize,
}

/// Exit UEFI boot services and retain a copy of the final memory map.
pub fn exit_boot_services() -> Result<ExitedMemoryMap, Status> {
    uefi::println!("Exiting boot services ...");
    info!("Exiting boot services ...");

    let mut mmap_copy = allocate_mmap_buffer()?;
    let mmap_copy_ptr = mmap_copy.as_mut_ptr();

    // SAFETY: nothing below touches boot-services allocation again; the
    // buffer above was sized and allocated while services were still live.
    let owned_map = unsafe { boot::exit_boot_services(None) };

    let src = owned_map.buffer().as_ptr();
    let mmap_length = owned_map.buffer().len();

    if mmap_length > mmap_copy.len() {
        return Err(Status::BUFFER_TOO_SMALL);
    }
    // SAFETY: `mmap_length <= mmap_copy.len()` just checked above, and
    // `owned_map.buffer()` is a distinct allocation from `mmap_copy`.
    unsafe {
        core::ptr::copy_nonoverlapping(src, mmap_copy_ptr, mmap_length);
    }

    let desc_size = owned_map.meta().desc_size;
    let descriptor_count = if desc_size == 0 { 0 } else { mmap_length / desc_size };

    // Keep the copy alive; nothing frees it, we never read it back byte for
    // byte, only the counts above are of interest once boot services exit.
    core::mem::forget(mmap_copy);

    Ok(ExitedMemoryMap { descriptor_count, desc_size })
}

/// Allocate a buffer to hold a copy of the memory map returned from
/// `ExitBootServices`.
///
/// This is inherently approximate: the descriptor count can change between
/// the probe below and the real exit call, so extra headroom is budgeted in.
fn allocate_mmap_buffer() -> Result<Vec<u8>, Status> {
    const EXTRA_DESCS: usize = 32;

    let probe = match boot::memory_map(MemoryType::LOADER_DATA) {
        Ok(probe) => probe,
        Err(e) => {
            uefi::println!("Failed to get memory map: {e:?}");
            return Err(Status::UNSUPPORTED);
        }
    };

    let desc_size = probe.meta().desc_size;
    let mut needed_size = probe.meta().map_size;
    drop(probe);

    needed_size += EXTRA_DESCS * desc_size;

    Ok(vec![0u8; needed_size])
}
