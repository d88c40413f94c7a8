//! Boot-stream table-of-contents framing.
//!
//! A stream is `TOC_MAGIC, command_count` followed by that many commands,
//! each self-delimiting as `(magic, total_size, ...type-specific body)`.
//! Every command type shares this outer shape so the dispatcher can skip
//! commands it doesn't recognize by `total_size` alone.

use crate::LoaderError;

pub const TOC_MAGIC: u32 = u32::from_le_bytes(*b"CfoT");
pub const MACHO_CMD_MAGIC: u32 = u32::from_le_bytes(*b"hcaM");
pub const XML_DT_CMD_MAGIC: u32 = u32::from_le_bytes(*b"TD-X");
pub const JS_DT_CMD_MAGIC: u32 = u32::from_le_bytes(*b"TDSJ");
pub const RAMDISK_CMD_MAGIC: u32 = u32::from_le_bytes(*b"KSDR");
pub const CONFIG_CMD_MAGIC: u32 = u32::from_le_bytes(*b"FNOC");

const TOC_HEADER_LEN: usize = 8;
const CMD_PREFIX_LEN: usize = 8; // magic, total_size

#[inline]
fn read_u32(buf: &[u8], off: usize) -> Result<u32, LoaderError> {
    let end = off.checked_add(4).ok_or(LoaderError::OutOfBounds)?;
    let s = buf.get(off..end).ok_or(LoaderError::OutOfBounds)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

/// A raw, unparsed command: its magic and the bytes following the
/// `(magic, total_size)` prefix.
pub struct RawCommand<'a> {
    pub magic: u32,
    pub body: &'a [u8],
}

pub struct Toc<'a> {
    blob: &'a [u8],
    count: u32,
}

impl<'a> Toc<'a> {
    pub fn parse(blob: &'a [u8]) -> Result<Self, LoaderError> {
        if blob.len() < TOC_HEADER_LEN {
            return Err(LoaderError::Malformed);
        }
        if read_u32(blob, 0)? != TOC_MAGIC {
            return Err(LoaderError::BadMagic);
        }
        let count = read_u32(blob, 4)?;
        Ok(Self { blob, count })
    }

    #[must_use]
    pub fn commands(&self) -> Commands<'a> {
        Commands {
            blob: self.blob,
            cursor: TOC_HEADER_LEN,
            remaining: self.count,
        }
    }
}

pub struct Commands<'a> {
    blob: &'a [u8],
    cursor: usize,
    remaining: u32,
}

impl<'a> Iterator for Commands<'a> {
    type Item = Result<RawCommand<'a>, LoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let magic = match read_u32(self.blob, self.cursor) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let total_size = match read_u32(self.blob, self.cursor + 4) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        if (total_size as usize) < CMD_PREFIX_LEN {
            return Some(Err(LoaderError::Malformed));
        }
        let body = match self
            .blob
            .get(self.cursor + CMD_PREFIX_LEN..self.cursor + total_size as usize)
        {
            Some(b) => b,
            None => return Some(Err(LoaderError::OutOfBounds)),
        };
        self.cursor += total_size as usize;
        Some(Ok(RawCommand { magic, body }))
    }
}

/// Header shared by the `imgx` (Mach-O) and `rdx` (ramdisk) commands:
/// the payload that follows a `(magic, total_size)` prefix.
pub struct ImageCommandHeader<'a> {
    pub decomp_size: u32,
    pub info_offset: u32,
    pub load_address: u32,
    pub flags: u32,
    pub name: &'a [u8; 64],
    pub data: &'a [u8],
}

pub const IMAGE_COMMAND_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 64;

impl<'a> ImageCommandHeader<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self, LoaderError> {
        if body.len() < IMAGE_COMMAND_HEADER_LEN {
            return Err(LoaderError::Malformed);
        }
        let decomp_size = read_u32(body, 0)?;
        let info_offset = read_u32(body, 4)?;
        let load_address = read_u32(body, 8)?;
        let flags = read_u32(body, 12)?;
        let name: &[u8; 64] = body[16..80].try_into().map_err(|_| LoaderError::Malformed)?;
        Ok(Self {
            decomp_size,
            info_offset,
            load_address,
            flags,
            name,
            data: &body[IMAGE_COMMAND_HEADER_LEN..],
        })
    }

    #[must_use]
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(64);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}
