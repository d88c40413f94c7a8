//! # Kernel Handoff Assembler
//!
//! Once a kernel, its drivers, an optional ramdisk, and a device tree have
//! all been placed in memory by [`loader_stream::Loader`], this crate
//! assembles the last few structures XNU expects to find at the handoff
//! boundary: the `/chosen/memory-map` node, each driver's `DriverInfo`
//! record, and the [`BootArgs`](loader_info::boot::BootArgs) block itself.
//!
//! It never jumps anywhere. [`assemble`] returns a [`Handoff`] — the
//! physical entry point and the virtual `boot_args` pointer the caller
//! passes in `r0` — and leaves the actual `blx` and any "disable
//! interrupts, stop network/USB" housekeeping to the top-level binary,
//! which is also the only place in this workspace allowed to write that
//! unsafe function-pointer call.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

use alloc::format;
use alloc::vec::Vec;
use loader_dt::{DeviceTree, DtError};
use loader_info::boot::{BootArgs, BootVideo, DEVICE_TREE_MAGIC};
use loader_info::memory::TOTAL_MEMORY_SIZE;
use loader_mem::MemoryRegion;
use loader_stream::{LoadedDriverImage, Loader, DRIVER_PAD_START};

/// `sizeof(struct DriverInfo)`: six 32-bit fields (pointer/length pairs for
/// the plist, executable, and bundle path), each truncated to 32 bits on
/// this target regardless of the original's `long`/pointer widths.
const DRIVER_INFO_LEN: u32 = 24;

const NAME_LEN: u32 = 64;

/// Everything that can go wrong assembling the handoff structures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HandoffError {
    #[error("no device tree has been loaded - load one before starting the kernel")]
    DeviceTreeNotLoaded,
    #[error("no kernel has been loaded")]
    KernelNotLoaded,
    #[error("an offset or length falls outside the destination buffer")]
    OutOfBounds,
    #[error("DRIVER_PAD_START is too small for a DriverInfo record and its bundle name")]
    DriverPadTooSmall,
    #[error("driver has an executable but no Info.plist")]
    DriverMissingInfoPlist,
    #[error(transparent)]
    Tree(#[from] DtError),
}

/// What the caller needs to actually transfer control: a physical code
/// address to branch to, and the `boot_args` pointer to load into `r0`
/// first - both already in the kernel's native address spaces, not this
/// loader's.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Handoff {
    /// Physical address to branch to with the MMU still off.
    pub entry_point: u32,
    /// Virtual address of the `boot_args` block, as the kernel will see it
    /// once it has mapped itself in.
    pub vm_boot_args: u32,
    /// Physical range the flattened device tree occupies, kept only for
    /// diagnostics (it is already folded into `boot_args.dt_base/dt_size`).
    pub device_tree_range: (u32, u32),
}

/// Converts a physical kernel address to the virtual address the kernel
/// itself will use once its own page tables are live.
#[must_use]
const fn ptokv(phys_base: u32, virt_base: u32, addr: u32) -> u32 {
    addr.wrapping_sub(phys_base).wrapping_add(virt_base)
}

/// Converts a virtual kernel address (as linked) back to the physical
/// address this loader can actually branch to with the MMU off - the
/// inverse of [`ptokv`].
#[must_use]
const fn kvtop(phys_base: u32, virt_base: u32, addr: u32) -> u32 {
    addr.wrapping_sub(virt_base).wrapping_add(phys_base)
}

fn write_u32(dest: &mut [u8], off: usize, value: u32) -> Result<(), HandoffError> {
    let end = off.checked_add(4).ok_or(HandoffError::OutOfBounds)?;
    let slot = dest.get_mut(off..end).ok_or(HandoffError::OutOfBounds)?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_bytes(dest: &mut [u8], off: usize, bytes: &[u8]) -> Result<(), HandoffError> {
    let end = off.checked_add(bytes.len()).ok_or(HandoffError::OutOfBounds)?;
    let slot = dest.get_mut(off..end).ok_or(HandoffError::OutOfBounds)?;
    slot.copy_from_slice(bytes);
    Ok(())
}

fn write_boot_args(dest: &mut [u8], args: &BootArgs) -> Result<(), HandoffError> {
    if dest.len() < core::mem::size_of::<BootArgs>() {
        return Err(HandoffError::OutOfBounds);
    }
    write_bytes(dest, 0, &args.revision.to_le_bytes())?;
    write_bytes(dest, 2, &args.version.to_le_bytes())?;
    write_u32(dest, 4, args.virt_base)?;
    write_u32(dest, 8, args.phys_base)?;
    write_u32(dest, 12, args.mem_size)?;
    write_u32(dest, 16, args.data_end)?;
    write_boot_video(dest, 20, &args.video)?;
    write_u32(dest, 44, args.machine)?;
    write_u32(dest, 48, args.dt_base)?;
    write_u32(dest, 52, args.dt_size)?;
    write_bytes(dest, 56, &args.args)?;
    Ok(())
}

fn write_boot_video(dest: &mut [u8], off: usize, video: &BootVideo) -> Result<(), HandoffError> {
    write_u32(dest, off, video.v_base_addr)?;
    write_u32(dest, off + 4, video.v_display)?;
    write_u32(dest, off + 8, video.v_row_bytes)?;
    write_u32(dest, off + 12, video.v_width)?;
    write_u32(dest, off + 16, video.v_height)?;
    write_u32(dest, off + 20, video.v_depth)?;
    Ok(())
}

/// Enter a `(start, length)` range into `/chosen/memory-map` under `name`,
/// matching the original's `allocate_memory_range`.
fn enter_range(tree: &mut DeviceTree, memory_map: loader_dt::NodeId, name: &str, start: u32, length: u32) -> Result<(), HandoffError> {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&start.to_le_bytes());
    data[4..8].copy_from_slice(&length.to_le_bytes());
    tree.add_property(memory_map, name, &data)?;
    Ok(())
}

/// Build and enter one driver's `DriverInfo` record, matching
/// `map_booter_extension`. Returns the record's own address (used as the
/// memory-map entry's numeric suffix, just as the original keys
/// `"Driver-<hex>"` off `(uint32_t)driver`).
fn map_booter_extension(
    memory: &mut [u8],
    tree: &mut DeviceTree,
    memory_map: loader_dt::NodeId,
    driver: &LoadedDriverImage,
) -> Result<(), HandoffError> {
    if DRIVER_INFO_LEN + NAME_LEN > DRIVER_PAD_START {
        return Err(HandoffError::DriverPadTooSmall);
    }
    if driver.info_offset == 0 && driver.has_exec {
        return Err(HandoffError::DriverMissingInfoPlist);
    }

    let pad_base = driver.range.base.as_u32();
    let actual_base = pad_base + DRIVER_PAD_START;
    let actual_size = driver.range.size - DRIVER_PAD_START;

    let (executable_addr, executable_length) =
        if driver.has_exec { (actual_base, driver.info_offset) } else { (0, 0) };
    let plist_addr = actual_base + driver.info_offset;
    let plist_length = actual_size - driver.info_offset;

    let bundle_name_addr = pad_base + DRIVER_INFO_LEN;
    let bundle_name = driver.name_str();

    let plist_bytes = memory
        .get(plist_addr as usize..plist_addr as usize + 5)
        .ok_or(HandoffError::OutOfBounds)?;
    if plist_bytes != b"<?xml" {
        log::warn!(
            target: "loader_handoff",
            "{} has a strange info.plist (starts with {:?})",
            bundle_name,
            plist_bytes
        );
    }

    let pad = memory
        .get_mut(pad_base as usize..pad_base as usize + DRIVER_PAD_START as usize)
        .ok_or(HandoffError::OutOfBounds)?;
    write_u32(pad, 0, plist_addr)?;
    write_u32(pad, 4, plist_length)?;
    write_u32(pad, 8, executable_addr)?;
    write_u32(pad, 12, executable_length)?;
    write_u32(pad, 16, bundle_name_addr)?;
    write_u32(pad, 20, bundle_name.len() as u32)?;
    write_bytes(pad, DRIVER_INFO_LEN as usize, &driver.name)?;

    log::info!(
        target: "loader_handoff",
        "{} E[{:#010x} {:#x}] I[{:#010x} {:#x}]",
        bundle_name,
        executable_addr,
        executable_length,
        plist_addr,
        plist_length
    );

    enter_range(tree, memory_map, &format!("Driver-{pad_base:x}"), pad_base, driver.range.size)
}

/// Assemble `/chosen/memory-map`, every driver's `DriverInfo`, and the
/// `boot_args` block, then flatten the device tree and return the entry
/// point and `boot_args` pointer to hand the kernel.
///
/// `memory` is the same physical-DRAM view every boot-stream command was
/// given; this call both reads placed images (the Info.plist sanity check)
/// and writes the new bookkeeping structures into it.
pub fn assemble(loader: &mut Loader, memory: &mut [u8]) -> Result<Handoff, HandoffError> {
    if !loader.state().has_device_tree() {
        return Err(HandoffError::DeviceTreeNotLoaded);
    }
    let kernel_range = loader.state().kernel_range().ok_or(HandoffError::KernelNotLoaded)?;
    let kernel_entry = loader.state().kernel_entry().ok_or(HandoffError::KernelNotLoaded)?;
    let phys_base = loader.state().phys_base();
    let virt_base = loader.state().virt_base();
    let ramdisk_range = loader.state().ramdisk_range();
    // Snapshot the driver list before taking a mutable borrow of the device
    // tree below - `LoadedDriverImage` is plain data, so this is a copy,
    // not a second live borrow of `loader`.
    let drivers: Vec<LoadedDriverImage> = loader.state().drivers().to_vec();

    let mut kernel_mem = MemoryRegion::new(loader_addr::PhysicalAddress::new(phys_base), false);
    kernel_mem.set_cursor(loader.state().memory_top());

    let boot_args_addr = kernel_mem.reserve(core::mem::size_of::<BootArgs>() as u32, 0).as_u32();

    {
        let tree = loader.device_tree_mut();
        let root = tree.root();
        let chosen = tree.add_child(root);
        tree.add_property(chosen, "name", b"chosen\0")?;
        let memory_map = tree.add_child(chosen);
        tree.add_property(memory_map, "name", b"memory-map\0")?;

        // The original's `iBoot` range comes from an uninitialized stack
        // variable - a latent bug in the source this loader was built from.
        // There is no iBoot-resident memory to describe once this loader
        // has handed off, so an empty range is entered in its place instead
        // of carrying the bug forward.
        enter_range(tree, memory_map, "iBoot", 0, 0)?;
        enter_range(tree, memory_map, "BootArgs", boot_args_addr, core::mem::size_of::<BootArgs>() as u32)?;
        enter_range(tree, memory_map, "Kernel", kernel_range.base.as_u32(), kernel_range.size)?;

        for driver in &drivers {
            map_booter_extension(memory, tree, memory_map, driver)?;
        }

        if let Some(ramdisk) = ramdisk_range {
            log::info!(
                target: "loader_handoff",
                "adding ramdisk [{:#010x}, sz={:#x}] to mem map",
                ramdisk.base.as_u32(),
                ramdisk.size
            );
            enter_range(tree, memory_map, "RAMDisk", ramdisk.base.as_u32(), ramdisk.size)?;
        }
    }

    let dt_len = loader.device_tree().flattened_size() as u32;
    let dt_addr = kernel_mem.reserve(dt_len, 0).as_u32();
    {
        let dest = memory
            .get_mut(dt_addr as usize..dt_addr as usize + dt_len as usize)
            .ok_or(HandoffError::OutOfBounds)?;
        loader.device_tree().flatten(dest)?;
        debug_assert_eq!(u32::from_le_bytes([dest[0], dest[1], dest[2], dest[3]]), DEVICE_TREE_MAGIC);
    }

    // Pad kernel memory up for the kernel's initial L1 page tables - done
    // after the device tree is flattened, not before, matching the order
    // the kernel's own bootstrap code expects.
    kernel_mem.reserve(0, loader_info::memory::BOOT_ARGS_ALIGN);
    let data_end = kernel_mem.cursor().as_u32();

    let mut args = BootArgs::new();
    args.phys_base = phys_base;
    args.virt_base = virt_base;
    args.dt_base = ptokv(phys_base, virt_base, dt_addr);
    args.dt_size = dt_len;
    args.mem_size = TOTAL_MEMORY_SIZE;
    args.data_end = data_end;

    {
        let dest = memory
            .get_mut(boot_args_addr as usize..boot_args_addr as usize + core::mem::size_of::<BootArgs>())
            .ok_or(HandoffError::OutOfBounds)?;
        write_boot_args(dest, &args)?;
    }

    Ok(Handoff {
        entry_point: kvtop(phys_base, virt_base, kernel_entry),
        vm_boot_args: ptokv(phys_base, virt_base, boot_args_addr),
        device_tree_range: (dt_addr, dt_len),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;
    use std::vec::Vec;

    const FLAG_DRIVER: u32 = 0x1;
    const FLAG_KERNEL: u32 = 0x2;
    const FLAG_HAS_INFO_PLIST: u32 = 0x200;
    const MACHO_CMD_MAGIC: u32 = u32::from_le_bytes(*b"hcaM");
    const TOC_MAGIC: u32 = u32::from_le_bytes(*b"CfoT");
    const JS_DT_CMD_MAGIC: u32 = u32::from_le_bytes(*b"TDSJ");

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// A minimal single-segment MH_EXECUTE with one `LC_UNIXTHREAD`, built
    /// the same way `loader-stream`'s own fixtures are, since a kernel can
    /// only reach `LoaderState` through `Loader::imgx`.
    fn kernel_image(vmaddr: u32, payload: &[u8]) -> Vec<u8> {
        use loader_macho::{LC_SEGMENT, LC_UNIXTHREAD, MACH_HEADER_LEN, MH_EXECUTE, MH_MAGIC};

        let mut segcmd = Vec::new();
        push_u32(&mut segcmd, LC_SEGMENT);
        push_u32(&mut segcmd, 56);
        segcmd.extend_from_slice(&[0u8; 16]);
        push_u32(&mut segcmd, vmaddr);
        push_u32(&mut segcmd, payload.len() as u32);
        push_u32(&mut segcmd, 0);
        push_u32(&mut segcmd, payload.len() as u32);
        push_u32(&mut segcmd, 7);
        push_u32(&mut segcmd, 7);
        push_u32(&mut segcmd, 0);
        push_u32(&mut segcmd, 0);

        let mut threadcmd = Vec::new();
        push_u32(&mut threadcmd, LC_UNIXTHREAD);
        push_u32(&mut threadcmd, 8 + 8 + 17 * 4);
        push_u32(&mut threadcmd, 1);
        push_u32(&mut threadcmd, 17);
        for i in 0..17u32 {
            push_u32(&mut threadcmd, if i == 15 { vmaddr } else { 0 });
        }

        let mut blob = Vec::new();
        push_u32(&mut blob, MH_MAGIC);
        push_u32(&mut blob, 0);
        push_u32(&mut blob, 0);
        push_u32(&mut blob, MH_EXECUTE);
        push_u32(&mut blob, 2);
        push_u32(&mut blob, (segcmd.len() + threadcmd.len()) as u32);
        push_u32(&mut blob, 0);

        let fileoff = (MACH_HEADER_LEN + segcmd.len() + threadcmd.len()) as u32;
        segcmd[32..36].copy_from_slice(&fileoff.to_le_bytes());

        blob.extend_from_slice(&segcmd);
        blob.extend_from_slice(&threadcmd);
        blob.extend_from_slice(payload);
        blob
    }

    fn macho_command(flags: u32, load_address: u32, decomp_size: u32, info_offset: u32, name: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        push_u32(&mut body, decomp_size);
        push_u32(&mut body, info_offset);
        push_u32(&mut body, load_address);
        push_u32(&mut body, flags);
        let mut name_buf = [0u8; 64];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());
        body.extend_from_slice(&name_buf);
        body.extend_from_slice(data);

        let mut cmd = Vec::new();
        push_u32(&mut cmd, MACHO_CMD_MAGIC);
        push_u32(&mut cmd, (8 + body.len()) as u32);
        cmd.extend_from_slice(&body);
        cmd
    }

    fn dt_command(json: &[u8]) -> Vec<u8> {
        let mut cmd = Vec::new();
        push_u32(&mut cmd, JS_DT_CMD_MAGIC);
        push_u32(&mut cmd, (8 + json.len()) as u32);
        cmd.extend_from_slice(json);
        cmd
    }

    fn toc(commands: &[Vec<u8>]) -> Vec<u8> {
        let mut blob = Vec::new();
        push_u32(&mut blob, TOC_MAGIC);
        push_u32(&mut blob, commands.len() as u32);
        for cmd in commands {
            blob.extend_from_slice(cmd);
        }
        blob
    }

    fn loader_with_kernel_and_dt(load_address: u32) -> (Loader, Vec<u8>) {
        let image = kernel_image(load_address, b"whatever");
        let kernel_cmd = macho_command(FLAG_KERNEL, load_address, 0, 0, "mach_kernel", &image);
        let dt_cmd = dt_command(b"{'model': 'xnu-arm-virt'}\0");
        let stream = toc(&[kernel_cmd, dt_cmd]);

        let mut memory = vec![0u8; 4 * 1024 * 1024];
        let mut loader = Loader::new();
        loader.imgx(&mut memory, &stream).unwrap();
        (loader, memory)
    }

    #[test]
    fn rejects_missing_device_tree() {
        let load_address = 0x0010_0000;
        let image = kernel_image(load_address, b"whatever");
        let kernel_cmd = macho_command(FLAG_KERNEL, load_address, 0, 0, "mach_kernel", &image);
        let stream = toc(&[kernel_cmd]);

        let mut memory = vec![0u8; 4 * 1024 * 1024];
        let mut loader = Loader::new();
        loader.imgx(&mut memory, &stream).unwrap();

        assert_eq!(assemble(&mut loader, &mut memory).unwrap_err(), HandoffError::DeviceTreeNotLoaded);
    }

    #[test]
    fn assembles_handoff_and_flattens_device_tree() {
        let (mut loader, mut memory) = loader_with_kernel_and_dt(0x0010_0000);

        let phys_base = loader.state().phys_base();
        let virt_base = loader.state().virt_base();
        let kernel_entry = loader.state().kernel_entry().unwrap();

        let handoff = assemble(&mut loader, &mut memory).unwrap();

        // `entry_point` is physical (kv^-1 of the linked, virtual PC), not
        // the raw value `LoaderState` recorded from `LC_UNIXTHREAD`.
        assert_eq!(handoff.entry_point, kvtop(phys_base, virt_base, kernel_entry));
        let (dt_base, dt_len) = handoff.device_tree_range;
        assert!(dt_len >= 12);
        let magic = u32::from_le_bytes(memory[dt_base as usize..dt_base as usize + 4].try_into().unwrap());
        assert_eq!(magic, DEVICE_TREE_MAGIC);
    }

    #[test]
    fn rejects_driver_with_no_info_plist_when_executable() {
        let load_address = 0x0010_0000;
        let image = kernel_image(load_address, b"whatever");
        let kernel_cmd = macho_command(FLAG_KERNEL, load_address, 0, 0, "mach_kernel", &image);
        // HAS_INFO_PLIST set (so the stream accepts it) but info_offset is
        // still zero, reproducing the malformed-but-stream-legal case the
        // handoff assembler independently re-checks.
        let driver_cmd = macho_command(
            FLAG_DRIVER | FLAG_HAS_INFO_PLIST,
            0,
            0,
            0,
            "com.example.driver",
            b"execbytes",
        );
        let dt_cmd = dt_command(b"{'model': 'xnu-arm-virt'}\0");
        let stream = toc(&[kernel_cmd, driver_cmd, dt_cmd]);

        let mut memory = vec![0u8; 4 * 1024 * 1024];
        let mut loader = Loader::new();
        loader.imgx(&mut memory, &stream).unwrap();

        assert_eq!(assemble(&mut loader, &mut memory).unwrap_err(), HandoffError::DriverMissingInfoPlist);
    }
}
