//! `nlist` decoding and the sorted-symbol binary searches.

use crate::MachoError;

const N_STAB: u8 = 0xE0;
const N_TYPE: u8 = 0x0E;
const N_SECT: u8 = 0x0E;
/// ARM-specific `n_desc` bit marking a definition as Thumb code; the low bit
/// of the resolved address must be set for a caller to `BLX`/`BX` into it
/// correctly.
const N_ARM_THUMB_DEF: u16 = 0x0008;

pub const NLIST_LEN: usize = 12;

/// One decoded `nlist` entry.
#[derive(Clone, Copy, Debug)]
pub struct Nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u32,
}

impl Nlist {
    pub fn parse(buf: &[u8]) -> Result<Self, MachoError> {
        if buf.len() < NLIST_LEN {
            return Err(MachoError::OutOfBounds);
        }
        Ok(Self {
            n_strx: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            n_type: buf[4],
            n_sect: buf[5],
            n_desc: u16::from_le_bytes([buf[6], buf[7]]),
            n_value: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    #[must_use]
    pub const fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    #[must_use]
    pub const fn is_sect_defined(&self) -> bool {
        self.n_type & N_TYPE == N_SECT
    }

    /// The address to hand back to a caller, with the ARM Thumb bit folded
    /// in so an indirect branch through this value lands in the right mode.
    #[must_use]
    pub const fn resolved_value(&self) -> u32 {
        if self.n_desc & N_ARM_THUMB_DEF != 0 {
            self.n_value | 1
        } else {
            self.n_value
        }
    }

    fn name<'a>(&self, string_pool: &'a [u8]) -> Result<&'a [u8], MachoError> {
        let start = self.n_strx as usize;
        let rest = string_pool.get(start..).ok_or(MachoError::OutOfBounds)?;
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Ok(&rest[..len])
    }
}

fn read_nlist(symtab: &[u8], index: u32) -> Result<Nlist, MachoError> {
    let off = index as usize * NLIST_LEN;
    let buf = symtab.get(off..off + NLIST_LEN).ok_or(MachoError::OutOfBounds)?;
    Nlist::parse(buf)
}

/// Binary search over a plain sorted-by-name run of `count` symbols starting
/// at `symtab[base_index..]`.
///
/// Requires the caller to have already sliced to the externally-defined
/// range (`iextdefsym..iextdefsym+nextdefsym`), which the static linker
/// keeps sorted by name specifically so this search works.
pub fn binary_search(
    key: &[u8],
    string_pool: &[u8],
    symtab: &[u8],
    base_index: u32,
    count: u32,
) -> Result<Option<Nlist>, MachoError> {
    let mut n = count;
    let mut base = base_index;
    while n > 0 {
        let pivot_index = base + n / 2;
        let pivot = read_nlist(symtab, pivot_index)?;
        let pivot_name = pivot.name(string_pool)?;

        match key.cmp(pivot_name) {
            core::cmp::Ordering::Equal => return Ok(Some(pivot)),
            core::cmp::Ordering::Greater => {
                base = pivot_index + 1;
                n -= n / 2 + 1;
            }
            core::cmp::Ordering::Less => {
                n /= 2;
            }
        }
    }
    Ok(None)
}

/// Binary search via a `dylib_table_of_contents` indirection, used when
/// `dysymtab.tocoff != 0`. Each TOC entry maps a sorted-by-name position to
/// the symbol's actual index in the (unsorted) symbol table.
pub fn binary_search_toc(
    key: &[u8],
    string_pool: &[u8],
    symtab: &[u8],
    toc: &[u8],
    symbol_count: u32,
    hint_index: u32,
) -> Result<Option<Nlist>, MachoError> {
    if symbol_count == 0 {
        return Ok(None);
    }
    let high_init: i64 = i64::from(symbol_count) - 1;
    let mut mid: i64 = if hint_index as i64 >= symbol_count as i64 {
        i64::from(symbol_count) / 2
    } else {
        i64::from(hint_index)
    };
    let mut low: i64 = 0;
    let mut high = high_init;

    while low <= high {
        let toc_off = (mid as usize) * 8; // { symbol_index: u32, module_index: u32 }
        let toc_entry = toc.get(toc_off..toc_off + 4).ok_or(MachoError::OutOfBounds)?;
        let symbol_index = u32::from_le_bytes([toc_entry[0], toc_entry[1], toc_entry[2], toc_entry[3]]);
        let pivot = read_nlist(symtab, symbol_index)?;
        let pivot_name = pivot.name(string_pool)?;

        match key.cmp(pivot_name) {
            core::cmp::Ordering::Equal => return Ok(Some(pivot)),
            core::cmp::Ordering::Greater => low = mid + 1,
            core::cmp::Ordering::Less => high = mid - 1,
        }
        mid = (low + high) / 2;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlist_bytes(strx: u32, value: u32) -> [u8; NLIST_LEN] {
        let mut b = [0u8; NLIST_LEN];
        b[0..4].copy_from_slice(&strx.to_le_bytes());
        b[4] = N_SECT | 0x01; // N_EXT
        b[5] = 1;
        b[8..12].copy_from_slice(&value.to_le_bytes());
        b
    }

    #[test]
    fn binary_search_finds_sorted_symbol() {
        let strings = b"\0alpha\0beta\0gamma\0";
        // offsets: alpha=1, beta=7, gamma=12
        let mut symtab = Vec::new();
        symtab.extend_from_slice(&nlist_bytes(1, 0x1000));
        symtab.extend_from_slice(&nlist_bytes(7, 0x2000));
        symtab.extend_from_slice(&nlist_bytes(12, 0x3000));

        let found = binary_search(b"beta", strings, &symtab, 0, 3).unwrap().unwrap();
        assert_eq!(found.n_value, 0x2000);

        assert!(binary_search(b"delta", strings, &symtab, 0, 3).unwrap().is_none());
    }

    #[test]
    fn thumb_bit_folds_into_resolved_value() {
        let mut n = Nlist::parse(&nlist_bytes(1, 0x1000)).unwrap();
        n.n_desc = N_ARM_THUMB_DEF;
        assert_eq!(n.resolved_value(), 0x1001);
    }
}
