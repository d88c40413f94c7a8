use crate::{Header, IMAGE3_MAGIC, TAG_HEADER_LEN};
use alloc::vec;
use alloc::vec::Vec;

/// Builds an Image-3 container tag by tag.
///
/// Mirrors the original's `image3_new`/`image3_reserve_tag` pair, but backs
/// the growing blob with an owned [`Vec<u8>`] instead of a realloc'd raw
/// pointer, so there is never a stale `head` pointer to invalidate after a
/// grow.
pub struct Image3Builder {
    blob: Vec<u8>,
}

impl Image3Builder {
    /// Start a new container with the given four-character `ident`.
    #[must_use]
    pub fn new(ident: u32) -> Self {
        let header = Header::new(ident);
        let mut blob = Vec::with_capacity(size_of::<Header>());
        blob.extend_from_slice(&header.magic.to_le_bytes());
        blob.extend_from_slice(&header.full_size.to_le_bytes());
        blob.extend_from_slice(&header.unpacked_size.to_le_bytes());
        blob.extend_from_slice(&header.sig_area.to_le_bytes());
        blob.extend_from_slice(&header.ident.to_le_bytes());
        Self { blob }
    }

    /// Append a new tag of `data_length` bytes (zero-initialized) and return
    /// a mutable slice over its data region to fill in.
    ///
    /// There is no alignment padding between `data` and the next tag's
    /// header, matching the original's `data_length + sizeof(img3_tag_t)`
    /// sizing.
    pub fn reserve_tag(&mut self, tag_type: u32, data_length: u32) -> &mut [u8] {
        let total_length = data_length + TAG_HEADER_LEN;

        let data_start = self.blob.len() + TAG_HEADER_LEN as usize;
        self.blob.extend_from_slice(&tag_type.to_le_bytes());
        self.blob.extend_from_slice(&total_length.to_le_bytes());
        self.blob.extend_from_slice(&data_length.to_le_bytes());
        self.blob.extend(vec![0u8; data_length as usize]);

        let full_size = self.blob.len() as u32;
        self.blob[4..8].copy_from_slice(&full_size.to_le_bytes());
        let unpacked_size = u32::from_le_bytes(self.blob[8..12].try_into().unwrap()) + total_length;
        self.blob[8..12].copy_from_slice(&unpacked_size.to_le_bytes());

        &mut self.blob[data_start..data_start + data_length as usize]
    }

    /// Current container size, header and every reserved tag included.
    #[must_use]
    pub fn full_size(&self) -> u32 {
        u32::from_le_bytes(self.blob[4..8].try_into().unwrap())
    }

    /// Consume the builder, yielding the finished container bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_container_starts_at_header_size_only() {
        let b = Image3Builder::new(u32::from_le_bytes(*b"krnl"));
        assert_eq!(b.full_size() as usize, size_of::<Header>());
        assert_eq!(&b.blob[0..4], &IMAGE3_MAGIC.to_le_bytes());
    }

    #[test]
    #[cfg(feature = "unbundle")]
    fn reserve_tag_grows_full_size_and_is_readable_back() {
        let mut b = Image3Builder::new(u32::from_le_bytes(*b"krnl"));
        let before = b.full_size();

        let data = b.reserve_tag(u32::from_le_bytes(*b"data"), 4);
        data.copy_from_slice(&0xAABBCCDDu32.to_le_bytes());

        assert_eq!(b.full_size(), before + TAG_HEADER_LEN + 4);

        let blob = b.finish();
        let view = crate::unbundle::Image3View::parse(&blob).unwrap();
        let (_, data) = view
            .find_tag(u32::from_le_bytes(*b"data"))
            .unwrap()
            .unwrap();
        assert_eq!(data, &0xAABBCCDDu32.to_le_bytes());
    }

    #[test]
    fn multiple_tags_accumulate_unpacked_size() {
        let mut b = Image3Builder::new(u32::from_le_bytes(*b"krnl"));
        b.reserve_tag(u32::from_le_bytes(*b"data"), 8);
        b.reserve_tag(u32::from_le_bytes(*b"vers"), 4);
        let blob = b.finish();
        let unpacked = u32::from_le_bytes(blob[8..12].try_into().unwrap());
        assert_eq!(unpacked, (TAG_HEADER_LEN + 8) + (TAG_HEADER_LEN + 4));
    }
}
