//! # Boot-Stream Interpreter
//!
//! Walks a table-of-contents blob of self-delimiting commands — Mach-O
//! images (kernel or driver), XML/JSON device-tree fragments, a ramdisk
//! registration, and a reserved configuration command — accumulating
//! [`state::LoaderState`] and a [`loader_dt::DeviceTree`] as it goes. A
//! single [`Loader`] owns both; tearing one down (a new kernel command
//! arriving, or the value simply being dropped) discards the other.
//!
//! The interpreter never allocates or owns the memory it places images
//! into — every command is handed a `&mut [u8]` view over physical memory,
//! indexed directly by physical address (byte offset from the DRAM base),
//! by the caller. The one place this crate needs to read and write two
//! non-overlapping parts of that view at once — decompressing a kernel
//! image into scratch space before mapping it to its final destination —
//! is handled by splitting the slice, never by raw pointers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod decompress;
pub mod state;
pub mod toc;

use loader_addr::PhysicalAddress;
use loader_dt::{DeviceTree, DtError};
use loader_dt_front::FrontError;
use loader_image3_abi::unbundle::{Image3Error, Image3View};
use loader_macho::{LoaderContext, MachoError};

pub use state::{LoadedDriverImage, LoaderState, MemoryRange};
use toc::{ImageCommandHeader, RawCommand, Toc};

/// Everything the boot-stream interpreter can fail on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LoaderError {
    #[error("command stream does not start with the expected magic")]
    BadMagic,
    #[error("a command or table of contents is truncated or inconsistent")]
    Malformed,
    #[error("an offset or length in the stream falls outside its bounds")]
    OutOfBounds,
    #[error("a table of contents may not contain another table of contents")]
    NestedToc,
    #[error("unrecognized command magic")]
    UnknownMagic,
    #[error("decompression would write past the end of its destination")]
    DecompressOverflow,
    #[error("QuickLZ-compressed images are not supported")]
    QlzUnsupported,
    #[error("a kernel image must be loaded before this command")]
    KernelNotLoaded,
    #[error("driver command's info_offset falls past the end of its image")]
    DriverInfoOffsetOutOfBounds,
    #[error("a driver with no executable must carry an Info.plist")]
    DriverMissingInfoPlist,
    #[error("ramdisk was not loaded at the current kernel memory top")]
    RamdiskWrongAddress,
    #[error("ramdisk is too small to hold a valid HFS+ volume header")]
    RamdiskTooSmall,
    #[error("ramdisk does not carry a recognized HFS/HFS+ signature")]
    RamdiskBadSignature,
    #[error("Image-3 container: {0:?}")]
    Image3(Image3Error),
    #[error(transparent)]
    Macho(#[from] MachoError),
    #[error(transparent)]
    Tree(#[from] DtError),
    #[error(transparent)]
    Front(#[from] FrontError),
}

impl From<Image3Error> for LoaderError {
    fn from(e: Image3Error) -> Self {
        Self::Image3(e)
    }
}

const FLAG_DRIVER: u32 = 0x1;
const FLAG_KERNEL: u32 = 0x2;
const FLAG_COMPRESSED_LZSS: u32 = 0x100;
const FLAG_HAS_INFO_PLIST: u32 = 0x200;
const FLAG_COMPRESSED_QLZ: u32 = 0x400;
const FLAG_NO_EXEC: u32 = 0x800;

/// Kernel images are assumed to inflate to at most four times their
/// compressed size; the decompression scratch buffer sits that far above
/// the final mapping destination so the two never overlap.
const KERNEL_SCRATCH_FACTOR: u32 = 4;

/// Every driver image is placed this many bytes past the current memory
/// top, leaving room for the `DriverInfo` record the handoff assembler
/// builds there later.
pub const DRIVER_PAD_START: u32 = 256;

const HFS_HEADER_OFFSET: u32 = 1024;
const HFS_VOLUME_HEADER_LEN: u32 = 112;
const HFS_SIG_WORD: u16 = 0x4244; // 'BD'
const HFSPLUS_SIG_WORD: u16 = 0x482B; // 'H+'

#[inline]
const fn page_align_up(value: u32) -> u32 {
    (value + 0xFFF) & !0xFFF
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> Result<u32, LoaderError> {
    let end = off.checked_add(4).ok_or(LoaderError::OutOfBounds)?;
    let s = buf.get(off..end).ok_or(LoaderError::OutOfBounds)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn split_mut(memory: &mut [u8], at: u32) -> Result<(&mut [u8], &mut [u8]), LoaderError> {
    let idx = at as usize;
    if idx > memory.len() {
        return Err(LoaderError::OutOfBounds);
    }
    Ok(memory.split_at_mut(idx))
}

fn decompress_with(flags: u32, dst: &mut [u8], src: &[u8]) -> Result<usize, LoaderError> {
    if flags & FLAG_COMPRESSED_QLZ != 0 {
        decompress::decompress_qlz(dst, src)
    } else {
        decompress::decompress_lzss(dst, src)
    }
}

/// Owns the accumulated loader state and the device tree being built
/// alongside it, and drives both from boot-stream commands.
pub struct Loader {
    state: LoaderState,
    dt: DeviceTree,
}

impl Loader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: LoaderState::new(PhysicalAddress::new(loader_info::memory::MEMORY_BASE)),
            dt: DeviceTree::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> &LoaderState {
        &self.state
    }

    #[must_use]
    pub const fn device_tree(&self) -> &DeviceTree {
        &self.dt
    }

    /// Mutable access to the device tree being built, for the handoff
    /// assembler to graft `/chosen/memory-map` onto before flattening.
    pub fn device_tree_mut(&mut self) -> &mut DeviceTree {
        &mut self.dt
    }

    /// Interpret a top-level image: a table of contents, a single bare
    /// command, or an Image-3 container wrapping either. Corresponds to the
    /// original's `imgx`/`load_general_image` entry point.
    pub fn imgx(&mut self, memory: &mut [u8], blob: &[u8]) -> Result<(), LoaderError> {
        if blob.len() >= 4 && read_u32(blob, 0)? == loader_image3_abi::IMAGE3_MAGIC {
            let view = Image3View::parse(blob)?;
            let (_tag, data) = view.tags().next().transpose()?.ok_or(LoaderError::Malformed)?;
            return self.imgx(memory, data);
        }

        let magic = read_u32(blob, 0)?;
        if magic == toc::TOC_MAGIC {
            let toc = Toc::parse(blob)?;
            for cmd in toc.commands() {
                self.dispatch_command(memory, cmd?)?;
            }
            Ok(())
        } else {
            let total_size = read_u32(blob, 4)?;
            if (total_size as usize) < 8 {
                return Err(LoaderError::Malformed);
            }
            let body = blob.get(8..total_size as usize).ok_or(LoaderError::OutOfBounds)?;
            self.dispatch_command(memory, RawCommand { magic, body })
        }
    }

    fn dispatch_command(&mut self, memory: &mut [u8], cmd: RawCommand<'_>) -> Result<(), LoaderError> {
        match cmd.magic {
            toc::TOC_MAGIC => Err(LoaderError::NestedToc),
            toc::MACHO_CMD_MAGIC => self.handle_macho(memory, cmd.body),
            toc::XML_DT_CMD_MAGIC => self.handle_device_tree(cmd.body, DtSyntax::Xml),
            toc::JS_DT_CMD_MAGIC => self.handle_device_tree(cmd.body, DtSyntax::Json),
            // The ramdisk is registered out of band via `rdx`, once the
            // firmware's own file commands have staged it in memory; a
            // `KSDR` command inline in a stream carries nothing to act on.
            // `FNOC` configuration commands are validated by the framing
            // they already passed through and otherwise ignored.
            toc::RAMDISK_CMD_MAGIC | toc::CONFIG_CMD_MAGIC => Ok(()),
            _ => Err(LoaderError::UnknownMagic),
        }
    }

    fn handle_macho(&mut self, memory: &mut [u8], body: &[u8]) -> Result<(), LoaderError> {
        let header = ImageCommandHeader::parse(body)?;
        let flags = header.flags;
        let is_driver = flags & FLAG_DRIVER != 0;
        let is_kernel = flags & FLAG_KERNEL != 0;
        let is_compressed = flags & (FLAG_COMPRESSED_LZSS | FLAG_COMPRESSED_QLZ) != 0;

        if is_kernel {
            let slide = header.load_address & 0xFFFFF;
            let virt_base = header.load_address & !0xFFFFF;
            let dram_start = loader_info::memory::MEMORY_BASE;
            if self.state.kernel_range().is_some() {
                log::warn!(target: "loader_stream", "a kernel is already loaded - tearing it down");
                self.dt = DeviceTree::new();
            }
            self.state
                .begin_kernel_load(PhysicalAddress::new(dram_start + slide), virt_base, dram_start);
        } else if self.state.kernel_range().is_none() {
            return Err(LoaderError::KernelNotLoaded);
        }

        let mut raw_image_dest = self.state.memory_top().as_u32();
        if is_driver {
            raw_image_dest += DRIVER_PAD_START;
        }

        log::info!(
            target: "loader_stream",
            "macho: '{}' cmp={} dst={:#010x}",
            header.name_str(),
            is_compressed,
            raw_image_dest
        );

        if is_driver {
            self.load_driver(memory, &header, flags, is_compressed, raw_image_dest)
        } else {
            self.load_kernel(memory, &header, flags, is_compressed, raw_image_dest)
        }
    }

    fn load_driver(
        &mut self,
        memory: &mut [u8],
        header: &ImageCommandHeader<'_>,
        flags: u32,
        is_compressed: bool,
        raw_image_dest: u32,
    ) -> Result<(), LoaderError> {
        let image_size = if is_compressed {
            let dest = memory
                .get_mut(raw_image_dest as usize..)
                .and_then(|s| s.get_mut(..header.decomp_size as usize))
                .ok_or(LoaderError::OutOfBounds)?;
            decompress_with(flags, dest, header.data)? as u32
        } else {
            let len = header.data.len();
            let dest = memory
                .get_mut(raw_image_dest as usize..raw_image_dest as usize + len)
                .ok_or(LoaderError::OutOfBounds)?;
            dest.copy_from_slice(header.data);
            len as u32
        };

        if header.info_offset > image_size {
            return Err(LoaderError::DriverInfoOffsetOutOfBounds);
        }

        let has_exec = flags & FLAG_NO_EXEC == 0;
        let info_offset = if flags & FLAG_HAS_INFO_PLIST != 0 {
            header.info_offset
        } else if !has_exec {
            return Err(LoaderError::DriverMissingInfoPlist);
        } else {
            0
        };

        let total_size = image_size + DRIVER_PAD_START;
        self.state.push_driver(LoadedDriverImage {
            range: MemoryRange {
                base: PhysicalAddress::new(raw_image_dest),
                size: total_size,
            },
            info_offset,
            has_exec,
            name: *header.name,
        });
        self.state.reserve(page_align_up(total_size), 0);

        log::info!(target: "loader_stream", "loaded driver '{}'", header.name_str());
        Ok(())
    }

    fn load_kernel(
        &mut self,
        memory: &mut [u8],
        header: &ImageCommandHeader<'_>,
        flags: u32,
        is_compressed: bool,
        raw_image_dest: u32,
    ) -> Result<(), LoaderError> {
        let (vmsize, entry) = if is_compressed {
            let scratch_offset = header
                .decomp_size
                .checked_mul(KERNEL_SCRATCH_FACTOR)
                .ok_or(LoaderError::OutOfBounds)?;
            let decomp_dest = raw_image_dest.checked_add(scratch_offset).ok_or(LoaderError::OutOfBounds)?;
            let (low, high) = split_mut(memory, decomp_dest)?;
            let scratch = high.get_mut(..header.decomp_size as usize).ok_or(LoaderError::OutOfBounds)?;
            let n = decompress_with(flags, scratch, header.data)?;
            map_macho(&high[..n], low, raw_image_dest)?
        } else {
            map_macho(header.data, memory, raw_image_dest)?
        };

        self.state
            .finish_kernel_load(MemoryRange { base: PhysicalAddress::new(raw_image_dest), size: vmsize }, entry);
        self.state.reserve(page_align_up(vmsize), 0);

        log::info!(target: "loader_stream", "loaded kernel '{}' (ep={:#010x})", header.name_str(), entry);
        Ok(())
    }

    fn handle_device_tree(&mut self, body: &[u8], syntax: DtSyntax) -> Result<(), LoaderError> {
        if self.state.has_device_tree() {
            log::warn!(target: "loader_stream", "a device tree is already loaded, skipping");
            return Ok(());
        }
        if self.state.kernel_range().is_none() {
            return Err(LoaderError::KernelNotLoaded);
        }

        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let text = core::str::from_utf8(&body[..end]).map_err(|_| LoaderError::Malformed)?;
        let value = match syntax {
            DtSyntax::Xml => loader_dt_front::xml::parse(text)?,
            DtSyntax::Json => loader_dt_front::json::parse(text)?,
        };
        loader_dt_front::build_device_tree(&value, &mut self.dt)?;
        self.state.set_has_device_tree(true);
        Ok(())
    }

    /// Validate and register a ramdisk staged by the firmware's own file
    /// commands at `addr`/`size`, corresponding to the original's `rdx`.
    pub fn rdx(&mut self, memory: &[u8], addr: PhysicalAddress, size: u32) -> Result<(), LoaderError> {
        if self.state.kernel_range().is_none() {
            return Err(LoaderError::KernelNotLoaded);
        }
        if addr.as_u32() != self.state.memory_top().as_u32() {
            return Err(LoaderError::RamdiskWrongAddress);
        }
        if size < HFS_HEADER_OFFSET + HFS_VOLUME_HEADER_LEN {
            return Err(LoaderError::RamdiskTooSmall);
        }

        let sig_off = (addr.as_u32() + HFS_HEADER_OFFSET) as usize;
        let sig = memory.get(sig_off..sig_off + 2).ok_or(LoaderError::OutOfBounds)?;
        let signature = u16::from_be_bytes([sig[0], sig[1]]);
        if signature != HFS_SIG_WORD && signature != HFSPLUS_SIG_WORD {
            return Err(LoaderError::RamdiskBadSignature);
        }

        self.state.set_ramdisk(MemoryRange { base: addr, size });
        self.state.reserve(page_align_up(size), 0);

        log::info!(target: "loader_stream", "loaded ramdisk [{:#010x}-{:#010x}]", addr.as_u32(), addr.as_u32() + size);
        Ok(())
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

enum DtSyntax {
    Xml,
    Json,
}

/// Parse a Mach-O image from `src`, map and relocate it into `dest` at
/// physical address `raw_image_dest`, and return its mapped size and biased
/// entry point. `dest` is indexed from physical address zero, same as
/// `src` would be if it lived in the same buffer.
fn map_macho(src: &[u8], dest: &mut [u8], raw_image_dest: u32) -> Result<(u32, u32), LoaderError> {
    let mut ctx = LoaderContext::parse(src)?;
    let range = ctx.code_data_range()?;
    let vmsize = ctx.vmsize()?;
    let bias = (i64::from(raw_image_dest) - i64::from(range.low)) as i32;
    ctx.set_vm_bias(bias);
    ctx.set_loader_bias(bias);

    let dest = dest
        .get_mut(raw_image_dest as usize..raw_image_dest as usize + vmsize as usize)
        .ok_or(LoaderError::OutOfBounds)?;
    ctx.map_into(dest)?;
    ctx.relocate_executable(dest)?;
    let entry = ctx.entry_point()?;
    Ok((vmsize, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;
    use std::vec::Vec;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// A minimal single-segment MH_EXECUTE with one `LC_UNIXTHREAD`, placed
    /// at `vmaddr`, that simply returns from its entry point once "run".
    fn kernel_image(vmaddr: u32, payload: &[u8]) -> Vec<u8> {
        use loader_macho::{LC_SEGMENT, LC_UNIXTHREAD, MACH_HEADER_LEN, MH_EXECUTE, MH_MAGIC};

        let mut segcmd = Vec::new();
        push_u32(&mut segcmd, LC_SEGMENT);
        push_u32(&mut segcmd, 56); // cmdsize: SEGMENT_COMMAND_LEN, 0 trailing sections
        segcmd.extend_from_slice(&[0u8; 16]); // segname
        push_u32(&mut segcmd, vmaddr);
        push_u32(&mut segcmd, payload.len() as u32);
        push_u32(&mut segcmd, 0); // fileoff, patched below
        push_u32(&mut segcmd, payload.len() as u32);
        push_u32(&mut segcmd, 7);
        push_u32(&mut segcmd, 7);
        push_u32(&mut segcmd, 0); // nsects
        push_u32(&mut segcmd, 0); // flags

        let mut threadcmd = Vec::new();
        push_u32(&mut threadcmd, LC_UNIXTHREAD);
        push_u32(&mut threadcmd, 8 + 8 + 17 * 4); // cmdsize: header + flavor/count + 17 ARM regs
        push_u32(&mut threadcmd, 1); // flavor
        push_u32(&mut threadcmd, 17); // count
        for i in 0..17u32 {
            if i == 15 {
                push_u32(&mut threadcmd, vmaddr); // pc == entry
            } else {
                push_u32(&mut threadcmd, 0);
            }
        }

        let mut blob = Vec::new();
        push_u32(&mut blob, MH_MAGIC);
        push_u32(&mut blob, 0);
        push_u32(&mut blob, 0);
        push_u32(&mut blob, MH_EXECUTE);
        push_u32(&mut blob, 2); // ncmds
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
        push_u32(&mut cmd, toc::MACHO_CMD_MAGIC);
        push_u32(&mut cmd, (8 + body.len()) as u32);
        cmd.extend_from_slice(&body);
        cmd
    }

    #[test]
    fn loads_uncompressed_kernel_and_reports_entry_point() {
        let load_address = 0x0010_0000;
        let image = kernel_image(load_address, b"whatever");
        let cmd = macho_command(FLAG_KERNEL, load_address, 0, 0, "mach_kernel", &image);

        let mut toc = Vec::new();
        push_u32(&mut toc, toc::TOC_MAGIC);
        push_u32(&mut toc, 1);
        toc.extend_from_slice(&cmd);

        let mut memory = vec![0u8; 4 * 1024 * 1024];
        let mut loader = Loader::new();
        loader.imgx(&mut memory, &toc).unwrap();

        let range = loader.state().kernel_range().unwrap();
        assert_eq!(range.base.as_u32(), 0);
        // kernel_entry() is the recorded PC as linked, not the image's
        // physical placement; converting to a physical jump target is
        // `loader_handoff`'s job (`kv^-1`), not this loader's.
        assert_eq!(loader.state().kernel_entry().unwrap(), load_address);
    }

    #[test]
    fn driver_before_kernel_is_rejected() {
        let cmd = macho_command(FLAG_DRIVER, 0, 0, 0, "com.example.driver", b"hello");
        let mut memory = vec![0u8; 4096];
        let mut loader = Loader::new();
        assert_eq!(loader.imgx(&mut memory, &cmd).unwrap_err(), LoaderError::KernelNotLoaded);
    }

    #[test]
    fn device_tree_before_kernel_is_rejected() {
        let mut cmd = Vec::new();
        push_u32(&mut cmd, toc::JS_DT_CMD_MAGIC);
        let body = b"{}\0";
        push_u32(&mut cmd, (8 + body.len()) as u32);
        cmd.extend_from_slice(body);

        let mut memory = vec![0u8; 4096];
        let mut loader = Loader::new();
        assert_eq!(loader.imgx(&mut memory, &cmd).unwrap_err(), LoaderError::KernelNotLoaded);
    }

    #[test]
    fn nested_toc_is_rejected() {
        let mut inner = Vec::new();
        push_u32(&mut inner, toc::TOC_MAGIC);
        push_u32(&mut inner, 0);

        let mut outer = Vec::new();
        push_u32(&mut outer, toc::TOC_MAGIC);
        push_u32(&mut outer, 1);
        push_u32(&mut outer, toc::TOC_MAGIC);
        push_u32(&mut outer, 8);

        let mut memory = vec![0u8; 4096];
        let mut loader = Loader::new();
        assert_eq!(loader.imgx(&mut memory, &outer).unwrap_err(), LoaderError::NestedToc);
        let _ = inner;
    }

    #[test]
    fn ramdisk_rejects_wrong_address() {
        let memory = vec![0u8; 4096];
        let mut loader = Loader::new();
        loader
            .state
            .begin_kernel_load(PhysicalAddress::new(0x1000), 0x10_0000, 0);
        let err = loader.rdx(&memory, PhysicalAddress::new(0x2000), 2048).unwrap_err();
        assert_eq!(err, LoaderError::RamdiskWrongAddress);
    }

    #[test]
    fn ramdisk_rejects_bad_signature() {
        let mut memory = vec![0u8; 4096];
        memory[1024] = 0xAA;
        memory[1025] = 0xAA;
        let mut loader = Loader::new();
        loader.state.begin_kernel_load(PhysicalAddress::new(0x0), 0x10_0000, 0);
        let err = loader.rdx(&memory, PhysicalAddress::new(0x0), 2048).unwrap_err();
        assert_eq!(err, LoaderError::RamdiskBadSignature);
    }

    #[test]
    fn ramdisk_accepts_hfsplus_signature() {
        let mut memory = vec![0u8; 4096];
        memory[1024] = 0x48; // 'H'
        memory[1025] = 0x2B; // '+'
        let mut loader = Loader::new();
        loader.state.begin_kernel_load(PhysicalAddress::new(0x0), 0x10_0000, 0);
        loader.rdx(&memory, PhysicalAddress::new(0x0), 2048).unwrap();
        assert!(loader.state().ramdisk_range().is_some());
    }
}
