//! Host-side builder for boot-stream blobs.
//!
//! Packs one or more Mach-O images (kernel or driver) into a table-of-contents
//! stream consumable by the boot-stream interpreter's `imgx` command, and
//! optionally wraps the result in an Image-3 container for provisioning.

use loader_image3_abi::Header as Image3Header;
use std::{env, fs, process};

/// `'CfoT'`, as four bytes on the wire (little-endian `u32`).
const TOC_MAGIC: u32 = u32::from_le_bytes(*b"CfoT");
/// `'hcaM'`, as four bytes on the wire (little-endian `u32`).
const MACHO_CMD_MAGIC: u32 = u32::from_le_bytes(*b"hcaM");
const NAME_LEN: usize = 64;
const MACHO_CMD_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4 + 4 + NAME_LEN; // magic,size,decomp_size,info_offset,load_address,flags,name

const MACH_DRIVER: u32 = 0x001;
const MACH_KERNEL: u32 = 0x002;

struct MachoItem {
    name: String,
    flags: u32,
    load_address: u32,
    info_offset: u32,
    data: Vec<u8>,
}

fn usage() -> ! {
    eprintln!(
        "usage: image3-packer <kernel.macho> <load_address_hex> [--driver <path> <load_address_hex>]... [--img3 <ident>] <out_file>"
    );
    process::exit(2);
}

fn main() -> std::io::Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        usage();
    }

    let out = args.pop().expect("out path");

    let mut img3_ident: Option<u32> = None;
    if args.len() >= 2 && args[args.len() - 2] == "--img3" {
        let ident_str = args.pop().unwrap();
        args.pop(); // "--img3"
        let mut bytes = [0u8; 4];
        let b = ident_str.as_bytes();
        bytes.copy_from_slice(&b[..4.min(b.len())]);
        img3_ident = Some(u32::from_le_bytes(bytes));
    }

    let kernel_path = args.remove(0);
    let kernel_load_addr_str = args.remove(0);
    let kernel_load_address =
        u32::from_str_radix(kernel_load_addr_str.trim_start_matches("0x"), 16)
            .expect("load address must be hex");

    let mut items = vec![MachoItem {
        name: kernel_path.rsplit('/').next().unwrap_or(&kernel_path).to_string(),
        flags: MACH_KERNEL,
        load_address: kernel_load_address,
        info_offset: 0,
        data: fs::read(&kernel_path)?,
    }];

    let mut i = 0;
    while i < args.len() {
        if args[i] == "--driver" {
            let path = args[i + 1].clone();
            let load_address =
                u32::from_str_radix(args[i + 2].trim_start_matches("0x"), 16).expect("hex addr");
            items.push(MachoItem {
                name: path.rsplit('/').next().unwrap_or(&path).to_string(),
                flags: MACH_DRIVER,
                load_address,
                info_offset: 0,
                data: fs::read(&path)?,
            });
            i += 3;
        } else {
            eprintln!("unrecognized argument: {}", args[i]);
            usage();
        }
    }

    let stream = build_boot_stream(&items);

    let out_bytes = if let Some(ident) = img3_ident {
        wrap_image3(ident, &stream)
    } else {
        stream
    };

    fs::write(&out, &out_bytes)?;
    eprintln!(
        "packed {} image(s) into {out} ({} bytes)",
        items.len(),
        out_bytes.len()
    );
    Ok(())
}

fn build_boot_stream(items: &[MachoItem]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&TOC_MAGIC.to_le_bytes());
    out.extend_from_slice(&(items.len() as u32).to_le_bytes());

    for item in items {
        let mut name_field = [0u8; NAME_LEN];
        let name_bytes = item.name.as_bytes();
        let n = name_bytes.len().min(NAME_LEN - 1);
        name_field[..n].copy_from_slice(&name_bytes[..n]);

        let size = (MACHO_CMD_HEADER_LEN + item.data.len()) as u32;

        out.extend_from_slice(&MACHO_CMD_MAGIC.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // decomp_size: payload is uncompressed
        out.extend_from_slice(&item.info_offset.to_le_bytes());
        out.extend_from_slice(&item.load_address.to_le_bytes());
        out.extend_from_slice(&item.flags.to_le_bytes());
        out.extend_from_slice(&name_field);
        out.extend_from_slice(&item.data);
    }

    out
}

fn wrap_image3(ident: u32, payload: &[u8]) -> Vec<u8> {
    const DATA_TAG: u32 = u32::from_le_bytes(*b"data");
    const TAG_HEADER_LEN: usize = 12;

    let hdr_len = size_of::<Image3Header>();
    let tag_total = TAG_HEADER_LEN + payload.len();

    let mut out = Vec::with_capacity(hdr_len + tag_total);
    out.extend_from_slice(&loader_image3_abi::IMAGE3_MAGIC.to_le_bytes());
    out.extend_from_slice(&((hdr_len + tag_total) as u32).to_le_bytes());
    out.extend_from_slice(&(tag_total as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // sig_area
    out.extend_from_slice(&ident.to_le_bytes());

    out.extend_from_slice(&DATA_TAG.to_le_bytes());
    out.extend_from_slice(&(tag_total as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_stream_header_matches_toc_layout() {
        let items = vec![MachoItem {
            name: "kernel".into(),
            flags: MACH_KERNEL,
            load_address: 0x0010_1000,
            info_offset: 0,
            data: vec![0xAAu8; 16],
        }];
        let stream = build_boot_stream(&items);
        assert_eq!(&stream[0..4], &TOC_MAGIC.to_le_bytes());
        assert_eq!(&stream[4..8], &1u32.to_le_bytes());
        assert_eq!(&stream[8..12], &MACHO_CMD_MAGIC.to_le_bytes());
        let size = u32::from_le_bytes(stream[12..16].try_into().unwrap());
        assert_eq!(size as usize, MACHO_CMD_HEADER_LEN + 16);
    }

    #[test]
    fn image3_wrap_reports_consistent_full_size() {
        let payload = vec![1u8, 2, 3, 4];
        let wrapped = wrap_image3(u32::from_le_bytes(*b"krnl"), &payload);
        let full_size = u32::from_le_bytes(wrapped[4..8].try_into().unwrap());
        assert_eq!(full_size as usize, wrapped.len());
    }
}
