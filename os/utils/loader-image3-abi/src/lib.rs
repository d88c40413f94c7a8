#![no_std]

extern crate alloc;

#[cfg(feature = "bundle")]
pub mod bundle;
#[cfg(feature = "unbundle")]
pub mod unbundle;

/// Magic identifying a valid Image-3 container: ASCII `"Img3"` stored
/// little-endian, matching the historical `IMG3_MAGIC` constant.
pub const IMAGE3_MAGIC: u32 = 0x496D_6733;

/// Fixed 20-byte header at the start of every Image-3 blob.
///
/// The header is followed immediately by a sequence of [`Tag`] records; the
/// last tag ends exactly at `full_size`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Header {
    /// [`IMAGE3_MAGIC`].
    pub magic: u32,

    /// Total size of the container, header included, in bytes.
    pub full_size: u32,

    /// Sum of every tag's `total_length`; excludes the header itself.
    pub unpacked_size: u32,

    /// Reserved signature-check area; zero when unsigned.
    pub sig_area: u32,

    /// Four-character type code identifying the payload (e.g. the `'krnl'`
    /// kernel image or a ramdisk).
    pub ident: u32,
}

impl Header {
    #[must_use]
    pub const fn new(ident: u32) -> Self {
        Self {
            magic: IMAGE3_MAGIC,
            full_size: size_of::<Header>() as u32,
            unpacked_size: 0,
            sig_area: 0,
            ident,
        }
    }
}

/// One tag within an Image-3 container.
///
/// `data[data_length]` follows the 12-byte header; `total_length - data_length
/// - 12` bytes of padding follow the data so that the next tag starts
/// `total_length` bytes after this one.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Tag {
    /// Four-character tag type.
    pub tag_type: u32,

    /// Size of this tag, including its own header and padding.
    pub total_length: u32,

    /// Size of the payload, excluding header and padding.
    pub data_length: u32,
}

const TAG_HEADER_LEN: u32 = size_of::<Tag>() as u32;
