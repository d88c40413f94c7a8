//! # Memory Layout Constants

/// Physical base of DRAM on this target.
pub const MEMORY_BASE: u32 = 0x0000_0000;

/// Total DRAM size backing [`total_memory_size`]; mirrors the historical
/// hardcoded `total_memory_size()` constant.
pub const TOTAL_MEMORY_SIZE: u32 = 0x2000_0000; // 512 MiB

/// Physical address the kernel Mach-O is expected to load at.
pub const KERNEL_PHYS_BASE: u32 = 0x0010_0000; // 1 MiB

/// Virtual address the kernel links against; the slide between this and the
/// chosen load address is added to every segment and relocation.
pub const KERNEL_VIRT_BASE: u32 = 0x0010_0000;

/// Alignment enforced on the boot-args allocation ahead of the kernel image.
pub const BOOT_ARGS_ALIGN: u32 = 0x10_0000; // 1 MiB

const _: () = {
    assert!(KERNEL_PHYS_BASE.is_multiple_of(4096));
    assert!(TOTAL_MEMORY_SIZE > KERNEL_PHYS_BASE);
};
