//! # UEFI Bootloader for the Darwin/XNU ARM Kernel
//!
//! This UEFI application is the second-stage bootloader for an embedded ARM
//! target: it loads a self-describing boot stream from the ESP, interprets
//! it into physical memory (a Mach-O kernel image, optional driver images, a
//! device tree fragment, and an optional ramdisk), assembles the handoff
//! structures XNU expects, and jumps to the kernel's entry point with
//! interrupts disabled. UEFI boot services stand in for the original
//! U-Boot-derived firmware this design is modeled on; everywhere the two
//! diverge (file loading, `ExitBootServices` instead of a bespoke shell)
//! this binary adapts to the host it actually runs on, while the three
//! driving verbs - `imgx`, `rdx`, `mach_boot` - keep their original
//! dependency order.
//!
//! ## Boot sequence
//!
//! ```text
//! UEFI Firmware Boot
//!         |
//! 1. Initialize logging, global allocator, boot services
//! 2. Load the boot-stream blob from the ESP (imgx)
//!    - interpret TOC -> Mach-O kernel/driver images, device tree fragment
//! 3. Load and register an optional ramdisk (rdx)
//! 4. Assemble the kernel handoff: /chosen/memory-map, DriverInfo records,
//!    boot_args, flattened device tree (mach_boot)
//! 5. Exit boot services, disable interrupts
//! 6. Jump to the kernel's entry point with boot_args in x0
//!         |
//! Kernel Execution
//! ```
//!
//! Everything from "load the boot-stream blob" onward operates on a single
//! physical memory slice reserved up front; see [`memory::allocate_dram_region`]
//! for why it is requested at a fixed physical address rather than wherever
//! UEFI happens to place it.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod file_system;
mod logger;
mod memory;
mod tracing;
mod uefi_mmap;

use crate::file_system::load_file;
use crate::logger::UefiLogger;
use crate::tracing::trace_handoff;
use crate::uefi_mmap::exit_boot_services;
use loader_addr::PhysicalAddress;
use loader_stream::Loader;
use log::{LevelFilter, error, info, warn};
use uefi::cstr16;
use uefi::prelude::*;

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }

    let logger = UefiLogger::new(LevelFilter::Debug);
    let logger = logger.init().expect("logger init");

    info!("UEFI loader reporting for duty");

    // Where the provisioning tool (`tools/image3-packer`) is expected to
    // have written the boot-stream TOC and, optionally, a ramdisk.
    let Ok(stream) = load_file(cstr16!("\\EFI\\BOOT\\bootstream.img")) else {
        error!("failed to load boot stream from \\EFI\\BOOT\\bootstream.img");
        return Status::NOT_FOUND;
    };
    info!("loaded boot stream: {} bytes", stream.len());

    let ramdisk = match load_file(cstr16!("\\EFI\\BOOT\\ramdisk.img")) {
        Ok(bytes) => {
            info!("loaded ramdisk: {} bytes", bytes.len());
            Some(bytes)
        }
        Err(_) => {
            info!("no ramdisk staged, continuing without one");
            None
        }
    };

    let dram_size = loader_info::memory::TOTAL_MEMORY_SIZE as usize;
    let dram_ptr = match memory::allocate_dram_region(dram_size) {
        Ok(ptr) => ptr,
        Err(e) => {
            error!("failed to reserve {dram_size:#x} bytes of DRAM: {e:?}");
            return e.status();
        }
    };
    // SAFETY: `dram_ptr` was just allocated by `allocate_dram_region` as a
    // single `dram_size`-byte region, zeroed, and not aliased anywhere else.
    let memory: &mut [u8] = unsafe { core::slice::from_raw_parts_mut(dram_ptr, dram_size) };

    let mut loader = Loader::new();
    if let Err(e) = loader.imgx(memory, &stream) {
        error!("boot stream interpretation failed: {e}");
        return Status::LOAD_ERROR;
    }

    if let Some(ramdisk) = ramdisk {
        let addr = loader.state().memory_top();
        match stage_ramdisk(memory, addr, &ramdisk) {
            Ok(()) => {
                if let Err(e) = loader.rdx(memory, addr, ramdisk.len() as u32) {
                    warn!("ramdisk rejected: {e}");
                }
            }
            Err(()) => warn!("ramdisk does not fit in the remaining DRAM region, skipping"),
        }
    }

    let handoff = match loader_handoff::assemble(&mut loader, memory) {
        Ok(handoff) => handoff,
        Err(e) => {
            error!("handoff assembly failed: {e}");
            return Status::LOAD_ERROR;
        }
    };

    trace_handoff(&handoff, dram_ptr as usize);

    logger.exit_boot_services();
    let mmap = match exit_boot_services() {
        Ok(mmap) => mmap,
        Err(status) => return status,
    };
    info!(
        "boot services exited, {} memory descriptors ({} bytes each) reported",
        mmap.descriptor_count, mmap.desc_size
    );

    // SAFETY: boot services are gone, the handoff structures are fully
    // written, and every address below was validated by `loader_handoff`
    // against the bounds of `memory`.
    unsafe { jump_to_kernel(dram_ptr as u64 + u64::from(handoff.entry_point), u64::from(handoff.vm_boot_args)) }
}

/// Copy a ramdisk image into the DRAM region at the loader's current memory
/// top, mirroring what the original firmware's own file-load verb would
/// have deposited there before `rdx` validates it.
fn stage_ramdisk(memory: &mut [u8], addr: PhysicalAddress, data: &[u8]) -> Result<(), ()> {
    let start = addr.as_u32() as usize;
    let end = start.checked_add(data.len()).ok_or(())?;
    let dest = memory.get_mut(start..end).ok_or(())?;
    dest.copy_from_slice(data);
    Ok(())
}

/// Disable interrupts and transfer control to the kernel's entry point with
/// the MMU still off, `boot_args` in `x0`. Does not return.
///
/// # Safety
/// `entry` must be the physical address of validly mapped, executable
/// kernel code, and `boot_args` must point at a fully written `BootArgs`
/// record the kernel's entry code expects to find in `x0`.
#[inline(never)]
unsafe fn jump_to_kernel(entry: u64, boot_args: u64) -> ! {
    info!("jumping to kernel entry {entry:#018x} with boot_args={boot_args:#010x}");
    unsafe {
        core::arch::asm!(
            "msr daifset, #0xf",
            "br {entry}",
            entry = in(reg) entry,
            in("x0") boot_args,
            options(noreturn)
        )
    }
}
