//! # Mach-O Image Loader and Relocator
//!
//! Parses 32-bit classic Mach-O images (`MH_OBJECT` drivers and the
//! `MH_EXECUTE` kernel proper), maps their segments/sections into a
//! destination buffer, and applies the small subset of relocation kinds a
//! statically-linked ARM image can still carry after the static linker has
//! done its work.
//!
//! This crate never allocates or owns memory itself — callers (the
//! boot-stream interpreter) decide where bytes land and hand back a mutable
//! slice to map into.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod header;
mod map;
mod reloc;
mod symtab;

pub use header::{
    ARM_THREAD_STATE, ARM_THREAD_STATE_COUNT, DysymtabCommand, LC_DYLD_INFO, LC_DYLD_INFO_ONLY,
    LC_DYSYMTAB, LC_SEGMENT, LC_SYMTAB, LC_UNIXTHREAD, LoadCommands, MACH_HEADER_LEN, MH_EXECUTE,
    MH_MAGIC, MH_OBJECT, MachHeader, Section, SegmentCommand, Sections, SymtabCommand, ThreadState,
};
pub use map::CodeDataRange;
pub use reloc::Relocation;
pub use symtab::Nlist;

/// Every way Mach-O parsing, mapping, or relocation can fail.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MachoError {
    #[error("image does not start with MH_MAGIC")]
    BadMagic,
    #[error("mach_header.filetype is neither MH_OBJECT nor MH_EXECUTE")]
    BadFileType,
    #[error("a load command or structure is truncated or inconsistent")]
    Malformed,
    #[error("image has no LC_SYMTAB")]
    NoSymtab,
    #[error("MH_EXECUTE uses a load command this loader does not support (e.g. LC_DYLD_INFO)")]
    ExecUnsupported,
    #[error("MH_EXECUTE's segments are not contiguous in virtual address space")]
    ExecNonContiguous,
    #[error("MH_EXECUTE contains a segment this loader does not expect")]
    ExecUnexpectedSegment,
    #[error("MH_OBJECT has more than one LC_SEGMENT, which this loader does not support")]
    ObjectBadSegment,
    #[error("a relocation record is malformed or of an unsupported kind")]
    BadReloc,
    #[error("an offset or length in the image falls outside its bounds")]
    OutOfBounds,
    #[error("symbol lookup found no matching name or address")]
    SymbolNotFound,
}

/// Parsed metadata about a Mach-O image, built once by [`LoaderContext::parse`]
/// and then reused across mapping, relocation, and symbol lookup.
#[derive(Clone, Copy, Debug)]
pub struct LoaderContext<'a> {
    blob: &'a [u8],
    header: MachHeader,
    symtab: Option<SymtabCommand>,
    dysymtab: Option<DysymtabCommand>,
    thread_pc: Option<u32>,
    /// Added to every absolute relocation target and to addresses resolved
    /// through the symbol table. Not applied to `LoaderContext::entry_point`,
    /// which stays the raw, unbiased `LC_UNIXTHREAD` PC.
    vm_bias: i32,
    /// Added only when patching relocations in already-mapped memory (the
    /// executable case, where the image has already been moved once and the
    /// local relocation list still refers to the link-time addresses).
    loader_bias: i32,
}

impl<'a> LoaderContext<'a> {
    /// Parse a Mach-O image's header, symbol table, and (if present)
    /// `LC_UNIXTHREAD` entry point. Rejects dyld-era load commands this
    /// loader has no support for.
    pub fn parse(blob: &'a [u8]) -> Result<Self, MachoError> {
        let header = MachHeader::parse(blob)?;
        if header.filetype != MH_OBJECT && header.filetype != MH_EXECUTE {
            return Err(MachoError::BadFileType);
        }

        let mut symtab = None;
        let mut dysymtab = None;
        let mut thread_pc = None;

        for cmd in LoadCommands::new(blob, &header) {
            let (cmd, _size, body) = cmd?;
            match cmd {
                LC_SYMTAB => symtab = Some(SymtabCommand::parse(body)?),
                LC_DYSYMTAB => dysymtab = Some(DysymtabCommand::parse(body)?),
                LC_UNIXTHREAD => thread_pc = Some(ThreadState::parse(body)?.pc),
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY if header.filetype == MH_EXECUTE => {
                    return Err(MachoError::ExecUnsupported);
                }
                _ => {}
            }
        }

        Ok(Self {
            blob,
            header,
            symtab,
            dysymtab,
            thread_pc,
            vm_bias: 0,
            loader_bias: 0,
        })
    }

    #[must_use]
    pub const fn header(&self) -> MachHeader {
        self.header
    }

    #[must_use]
    pub const fn is_object(&self) -> bool {
        self.header.filetype == MH_OBJECT
    }

    #[must_use]
    pub const fn is_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE
    }

    /// Subtracted from every `vmaddr` when computing where a segment's bytes
    /// land inside the destination buffer — the destination is always
    /// relative to the lowest segment's `vmaddr`, not absolute.
    pub fn set_vm_bias(&mut self, bias: i32) {
        self.vm_bias = bias;
    }

    /// Added to local relocation targets when re-homing an already-mapped
    /// executable to a new load address.
    pub fn set_loader_bias(&mut self, bias: i32) {
        self.loader_bias = bias;
    }

    fn segments(&self) -> impl Iterator<Item = Result<(SegmentCommand, &'a [u8]), MachoError>> {
        LoadCommands::new(self.blob, &self.header).filter_map(|cmd| match cmd {
            Ok((LC_SEGMENT, _size, body)) => Some(
                SegmentCommand::parse(body).map(|seg| (seg, body)),
            ),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    }

    /// Total bytes the image needs once mapped: the `MH_EXECUTE` case is the
    /// span from the lowest to the highest segment's virtual extent; the
    /// `MH_OBJECT` case is its single segment's `vmsize`.
    pub fn vmsize(&self) -> Result<u32, MachoError> {
        let range = self.code_data_range()?;
        Ok(range.high - range.low)
    }

    /// The lowest and highest virtual addresses spanned by this image's
    /// segments, used both to size a mapping destination and to validate
    /// that an `MH_EXECUTE` image's segments pack contiguously.
    pub fn code_data_range(&self) -> Result<CodeDataRange, MachoError> {
        map::code_data_range(self)
    }

    /// Map this image's segments/sections into `dest`, which must be at
    /// least [`Self::vmsize`] bytes, zero-initialized by the caller before the
    /// call (zerofill sections rely on that).
    pub fn map_into(&self, dest: &mut [u8]) -> Result<(), MachoError> {
        map::map_into(self, dest)
    }

    /// Apply this image's local, absolute relocations in place, biasing them
    /// by [`Self::set_loader_bias`] (executables) or [`Self::set_vm_bias`]
    /// (objects, applied per-section during mapping instead — see
    /// [`Self::map_into`]).
    pub fn relocate_executable(&self, dest: &mut [u8]) -> Result<(), MachoError> {
        map::relocate_executable(self, dest)
    }

    /// Apply an `MH_OBJECT`'s per-section relocations in place, biasing
    /// absolute fixups by [`Self::set_vm_bias`].
    pub fn relocate_object(&self, dest: &mut [u8]) -> Result<(), MachoError> {
        map::relocate_object(self, dest)
    }

    /// The kernel/driver's entry point, from `LC_UNIXTHREAD`'s recorded PC,
    /// unbiased. This is the virtual entry address as linked, not a
    /// physical one; converting it to a physical jump target is the
    /// handoff assembler's job (`kv^-1`), not this loader's.
    pub fn entry_point(&self) -> Result<u32, MachoError> {
        self.thread_pc.ok_or(MachoError::Malformed)
    }

    fn string_pool(&self) -> Result<&'a [u8], MachoError> {
        let symtab = self.symtab.ok_or(MachoError::NoSymtab)?;
        self.blob
            .get(symtab.stroff as usize..(symtab.stroff + symtab.strsize) as usize)
            .ok_or(MachoError::OutOfBounds)
    }

    fn symtab_bytes(&self) -> Result<&'a [u8], MachoError> {
        let symtab = self.symtab.ok_or(MachoError::NoSymtab)?;
        self.blob
            .get(symtab.symoff as usize..(symtab.symoff + symtab.nsyms * 12) as usize)
            .ok_or(MachoError::OutOfBounds)
    }

    /// Forward lookup: resolve `name` to an address among the externally
    /// defined symbols. Requires `LC_DYSYMTAB` and, per the original's
    /// assumption, a symbol table with no table-of-contents indirection
    /// (`tocoff == 0`) — the externally-defined range must already be
    /// sorted by name.
    pub fn find_symbol(&self, name: &[u8]) -> Result<u32, MachoError> {
        let dysymtab = self.dysymtab.ok_or(MachoError::NoSymtab)?;
        if dysymtab.tocoff != 0 {
            return Err(MachoError::SymbolNotFound);
        }
        let strings = self.string_pool()?;
        let symtab = self.symtab_bytes()?;

        let found = symtab::binary_search(name, strings, symtab, dysymtab.iextdefsym, dysymtab.nextdefsym)?;
        let nlist = found.ok_or(MachoError::SymbolNotFound)?;
        Ok((nlist.resolved_value() as i64 + i64::from(self.vm_bias)) as u32)
    }

    /// Reverse lookup: find the nearest defined, non-stab symbol at or below
    /// `address`, returning its name. Used to label a crash address in a
    /// backtrace; scans linearly since symbols are not sorted by address.
    pub fn find_symbol_by_address(&self, address: u32) -> Result<&'a [u8], MachoError> {
        let strings = self.string_pool()?;
        let symtab_cmd = self.symtab.ok_or(MachoError::NoSymtab)?;
        let symtab = self.symtab_bytes()?;

        let unbiased = (i64::from(address) - i64::from(self.vm_bias)) as u32;

        let mut best: Option<(u32, u32)> = None; // (value, strx)
        for i in 0..symtab_cmd.nsyms {
            let off = i as usize * 12;
            let nlist = symtab::Nlist::parse(&symtab[off..off + 12])?;
            if nlist.is_stab() || !nlist.is_sect_defined() {
                continue;
            }
            let value = nlist.resolved_value() & !1; // strip thumb bit for comparison
            if value <= unbiased && best.is_none_or(|(best_value, _)| value > best_value) {
                best = Some((value, nlist.n_strx));
            }
        }

        let (_, strx) = best.ok_or(MachoError::SymbolNotFound)?;
        let rest = strings.get(strx as usize..).ok_or(MachoError::OutOfBounds)?;
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Ok(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Builds a minimal single-segment MH_OBJECT with one non-zerofill
    /// section holding `payload`, for exercising parse/map end-to-end.
    fn object_with_section(vmaddr: u32, payload: &[u8]) -> Vec<u8> {
        let mut segcmd = Vec::new();
        push_u32(&mut segcmd, LC_SEGMENT);
        let section_len = header::SECTION_LEN as u32;
        let seg_cmdsize = header::SEGMENT_COMMAND_LEN as u32 + section_len;
        push_u32(&mut segcmd, seg_cmdsize);
        segcmd.extend_from_slice(&[0u8; 16]); // segname
        push_u32(&mut segcmd, vmaddr);
        push_u32(&mut segcmd, payload.len() as u32);
        push_u32(&mut segcmd, 0); // fileoff: filled in after header/cmd size known
        push_u32(&mut segcmd, payload.len() as u32);
        push_u32(&mut segcmd, 7); // maxprot
        push_u32(&mut segcmd, 7); // initprot
        push_u32(&mut segcmd, 1); // nsects
        push_u32(&mut segcmd, 0); // flags

        let mut sectname = [0u8; 16];
        sectname[..5].copy_from_slice(b"__dat");
        segcmd.extend_from_slice(&sectname);
        segcmd.extend_from_slice(&[0u8; 16]); // segname
        push_u32(&mut segcmd, vmaddr); // addr
        push_u32(&mut segcmd, payload.len() as u32); // size
        push_u32(&mut segcmd, 0); // offset: filled below
        push_u32(&mut segcmd, 0); // align
        push_u32(&mut segcmd, 0); // reloff
        push_u32(&mut segcmd, 0); // nreloc
        push_u32(&mut segcmd, 0); // flags
        push_u32(&mut segcmd, 0); // reserved1
        push_u32(&mut segcmd, 0); // reserved2

        let mut blob = Vec::new();
        push_u32(&mut blob, MH_MAGIC);
        push_u32(&mut blob, 0); // cputype
        push_u32(&mut blob, 0); // cpusubtype
        push_u32(&mut blob, MH_OBJECT);
        push_u32(&mut blob, 1); // ncmds
        push_u32(&mut blob, segcmd.len() as u32);
        push_u32(&mut blob, 0); // flags

        let data_fileoff = (MACH_HEADER_LEN + segcmd.len()) as u32;
        // patch fileoff (segment, offset 32) and section offset (offset 76 within segcmd)
        segcmd[32..36].copy_from_slice(&data_fileoff.to_le_bytes());
        let section_offset_field = header::SEGMENT_COMMAND_LEN + 16 + 16 + 4 + 4;
        segcmd[section_offset_field..section_offset_field + 4].copy_from_slice(&data_fileoff.to_le_bytes());

        blob.extend_from_slice(&segcmd);
        blob.extend_from_slice(payload);
        blob
    }

    #[test]
    fn parses_header_and_rejects_bad_magic() {
        let mut blob = object_with_section(0x1000, b"hello!!!");
        assert!(LoaderContext::parse(&blob).is_ok());
        blob[0] = 0;
        assert_eq!(LoaderContext::parse(&blob).unwrap_err(), MachoError::BadMagic);
    }

    #[test]
    fn maps_object_section_payload_at_correct_offset() {
        let blob = object_with_section(0x2000, b"payload!");
        let ctx = LoaderContext::parse(&blob).unwrap();
        let size = ctx.vmsize().unwrap();
        assert_eq!(size, 8);

        let mut dest = vec![0u8; size as usize];
        ctx.map_into(&mut dest).unwrap();
        assert_eq!(&dest, b"payload!");
    }
}
