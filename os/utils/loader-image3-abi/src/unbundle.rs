use crate::{IMAGE3_MAGIC, TAG_HEADER_LEN, Tag};

/// Parsed, read-only view over an in-memory Image-3 blob.
pub struct Image3View<'a> {
    blob: &'a [u8],
    full_size: u32,
}

/// Iterator over `(type, data)` pairs; yields `Result` per tag so a malformed
/// trailing tag surfaces instead of being silently dropped.
pub struct Tags<'a> {
    v: &'a Image3View<'a>,
    cursor: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Image3Error {
    TooShort,
    BadMagic,
    OutOfBounds,
    TagTooSmall,
}

const HEADER_LEN: usize = size_of::<crate::Header>();

#[inline]
fn read_u32_le(buf: &[u8], off: usize) -> Result<u32, Image3Error> {
    let end = off.checked_add(4).ok_or(Image3Error::OutOfBounds)?;
    let s = buf.get(off..end).ok_or(Image3Error::OutOfBounds)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

impl<'a> Image3View<'a> {
    /// Parse and validate the header of an Image-3 blob.
    ///
    /// Only the header's `magic` and `full_size` are checked up front; tag
    /// bounds are checked lazily as each tag is visited, matching the
    /// original's forward-scan `image3_find_tag`.
    pub fn parse(blob: &'a [u8]) -> Result<Self, Image3Error> {
        if blob.len() < HEADER_LEN {
            return Err(Image3Error::TooShort);
        }
        let magic = read_u32_le(blob, 0)?;
        if magic != IMAGE3_MAGIC {
            return Err(Image3Error::BadMagic);
        }
        let full_size = read_u32_le(blob, 4)?;
        if (full_size as usize) > blob.len() {
            return Err(Image3Error::OutOfBounds);
        }
        Ok(Self { blob, full_size })
    }

    #[must_use]
    pub const fn full_size(&self) -> u32 {
        self.full_size
    }

    #[must_use]
    pub fn ident(&self) -> u32 {
        read_u32_le(self.blob, 16).unwrap_or(0)
    }

    /// Iterate over every tag, in on-disk order.
    #[must_use]
    pub fn tags(&self) -> Tags<'_> {
        Tags {
            v: self,
            cursor: HEADER_LEN as u32,
        }
    }

    /// Find the first tag of the given type.
    pub fn find_tag(&self, tag_type: u32) -> Result<Option<(Tag, &'a [u8])>, Image3Error> {
        for item in self.tags() {
            let (tag, data) = item?;
            if tag.tag_type == tag_type {
                return Ok(Some((tag, data)));
            }
        }
        Ok(None)
    }

    /// Whether a tag of the given type is present.
    pub fn tag_present(&self, tag_type: u32) -> Result<bool, Image3Error> {
        Ok(self.find_tag(tag_type)?.is_some())
    }
}

impl<'a> Iterator for Tags<'a> {
    type Item = Result<(Tag, &'a [u8]), Image3Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.v.full_size {
            return None;
        }
        let off = self.cursor as usize;
        if off + TAG_HEADER_LEN as usize > self.v.blob.len() {
            self.cursor = self.v.full_size;
            return Some(Err(Image3Error::OutOfBounds));
        }

        let tag_type = match read_u32_le(self.v.blob, off) {
            Ok(v) => v,
            Err(e) => {
                self.cursor = self.v.full_size;
                return Some(Err(e));
            }
        };
        let total_length = match read_u32_le(self.v.blob, off + 4) {
            Ok(v) => v,
            Err(e) => {
                self.cursor = self.v.full_size;
                return Some(Err(e));
            }
        };
        let data_length = match read_u32_le(self.v.blob, off + 8) {
            Ok(v) => v,
            Err(e) => {
                self.cursor = self.v.full_size;
                return Some(Err(e));
            }
        };

        if total_length < TAG_HEADER_LEN || data_length > total_length - TAG_HEADER_LEN {
            self.cursor = self.v.full_size;
            return Some(Err(Image3Error::TagTooSmall));
        }

        let data_start = off + TAG_HEADER_LEN as usize;
        let data_end = data_start + data_length as usize;
        let data = match self.v.blob.get(data_start..data_end) {
            Some(d) => d,
            None => {
                self.cursor = self.v.full_size;
                return Some(Err(Image3Error::OutOfBounds));
            }
        };

        self.cursor += total_length;
        Some(Ok((
            Tag {
                tag_type,
                total_length,
                data_length,
            },
            data,
        )))
    }
}

impl<'a> core::iter::FusedIterator for Tags<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec::Vec;

    fn push_tag(buf: &mut Vec<u8>, tag_type: u32, data: &[u8]) {
        let total_length = TAG_HEADER_LEN + data.len() as u32;
        buf.extend_from_slice(&tag_type.to_le_bytes());
        buf.extend_from_slice(&total_length.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
    }

    fn sample_blob() -> Vec<u8> {
        let mut tags = Vec::new();
        push_tag(&mut tags, u32::from_le_bytes(*b"data"), b"hello");
        push_tag(&mut tags, u32::from_le_bytes(*b"vers"), b"1");

        let full_size = (HEADER_LEN + tags.len()) as u32;
        let mut blob = Vec::new();
        blob.extend_from_slice(&IMAGE3_MAGIC.to_le_bytes());
        blob.extend_from_slice(&full_size.to_le_bytes());
        blob.extend_from_slice(&(tags.len() as u32).to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes()); // sig_area
        blob.extend_from_slice(&u32::from_le_bytes(*b"krnl").to_le_bytes());
        blob.extend_from_slice(&tags);
        blob
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = sample_blob();
        blob[0] = 0;
        assert_eq!(Image3View::parse(&blob).unwrap_err(), Image3Error::BadMagic);
    }

    #[test]
    fn iterates_all_tags_in_order() {
        let blob = sample_blob();
        let view = Image3View::parse(&blob).unwrap();
        let found: std::vec::Vec<_> = view.tags().collect::<Result<_, _>>().unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, b"hello");
        assert_eq!(found[1].1, b"1");
    }

    #[test]
    fn find_tag_locates_match() {
        let blob = sample_blob();
        let view = Image3View::parse(&blob).unwrap();
        let (_, data) = view
            .find_tag(u32::from_le_bytes(*b"vers"))
            .unwrap()
            .unwrap();
        assert_eq!(data, b"1");
        assert!(!view.tag_present(u32::from_le_bytes(*b"nope")).unwrap());
    }
}
