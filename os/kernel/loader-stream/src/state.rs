//! Interpreter state threaded through every boot-stream command.

extern crate alloc;

use alloc::vec::Vec;
use loader_addr::PhysicalAddress;
use loader_mem::MemoryRegion;

/// A physically contiguous range, as recorded for the kernel image, the
/// ramdisk, and each loaded driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRange {
    pub base: PhysicalAddress,
    pub size: u32,
}

impl MemoryRange {
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u32() + self.size)
    }
}

/// One driver image loaded by an `imgx` command, kept around until the
/// handoff assembler walks the list to build `/chosen/memory-map` entries
/// and the kernel's driver list.
#[derive(Clone, Copy)]
pub struct LoadedDriverImage {
    pub range: MemoryRange,
    pub info_offset: u32,
    pub has_exec: bool,
    pub name: [u8; 64],
}

impl LoadedDriverImage {
    #[must_use]
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(64);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Everything the boot-stream interpreter accumulates while walking a
/// stream's table of contents: the kernel and ramdisk ranges, the driver
/// list (most-recently-loaded first, mirroring the original's LIFO push),
/// and the bump cursor used to place bookkeeping structures above the
/// highest address any image has used so far.
pub struct LoaderState {
    cursor: MemoryRegion,
    kernel_range: Option<MemoryRange>,
    kernel_entry: Option<u32>,
    ramdisk_range: Option<MemoryRange>,
    drivers: Vec<LoadedDriverImage>,
    has_device_tree: bool,
    virt_base: u32,
    phys_base: u32,
}

impl LoaderState {
    #[must_use]
    pub fn new(memory_base: PhysicalAddress) -> Self {
        Self {
            cursor: MemoryRegion::new(memory_base, false),
            kernel_range: None,
            kernel_entry: None,
            ramdisk_range: None,
            drivers: Vec::new(),
            has_device_tree: false,
            virt_base: 0,
            phys_base: 0,
        }
    }

    #[must_use]
    pub const fn memory_top(&self) -> PhysicalAddress {
        self.cursor.cursor()
    }

    pub fn reserve(&mut self, size: u32, align: u32) -> PhysicalAddress {
        self.cursor.reserve(size, align)
    }

    /// Advance the bump cursor so it never sits below `at` — called after
    /// mapping an image at its fixed `load_address`, which may land above
    /// (or, for the first image, at) the cursor's current position.
    pub fn bump_past(&mut self, at: PhysicalAddress) {
        if at.as_u32() > self.cursor.cursor().as_u32() {
            self.cursor.set_cursor(at);
        }
    }

    #[must_use]
    pub const fn kernel_range(&self) -> Option<MemoryRange> {
        self.kernel_range
    }

    #[must_use]
    pub const fn kernel_entry(&self) -> Option<u32> {
        self.kernel_entry
    }

    #[must_use]
    pub const fn ramdisk_range(&self) -> Option<MemoryRange> {
        self.ramdisk_range
    }

    #[must_use]
    pub fn drivers(&self) -> &[LoadedDriverImage] {
        &self.drivers
    }

    #[must_use]
    pub const fn has_device_tree(&self) -> bool {
        self.has_device_tree
    }

    #[must_use]
    pub const fn virt_base(&self) -> u32 {
        self.virt_base
    }

    #[must_use]
    pub const fn phys_base(&self) -> u32 {
        self.phys_base
    }

    /// Drop every previously loaded driver image. Called when a new kernel
    /// command arrives after one has already been loaded: the prior
    /// driver set was built against the old kernel's address space and is
    /// meaningless once it's replaced.
    pub fn teardown_loaded_driver_images(&mut self) {
        self.drivers.clear();
        self.has_device_tree = false;
        self.ramdisk_range = None;
    }

    /// Begin loading a new kernel image: tear down whatever the previous
    /// kernel command left behind (drivers, device tree, ramdisk) and hard-set
    /// the bump cursor to `memory_top` — an assignment, not a bump, since the
    /// new kernel's placement is fixed by its own load address rather than
    /// anything the old kernel reserved.
    pub(crate) fn begin_kernel_load(&mut self, memory_top: PhysicalAddress, virt_base: u32, phys_base: u32) {
        if self.kernel_range.is_some() {
            self.teardown_loaded_driver_images();
        }
        self.kernel_range = None;
        self.kernel_entry = None;
        self.cursor.set_cursor(memory_top);
        self.virt_base = virt_base;
        self.phys_base = phys_base;
    }

    pub(crate) fn finish_kernel_load(&mut self, range: MemoryRange, entry: u32) {
        self.kernel_range = Some(range);
        self.kernel_entry = Some(entry);
    }

    pub(crate) fn push_driver(&mut self, driver: LoadedDriverImage) {
        self.drivers.push(driver);
    }

    pub(crate) fn set_ramdisk(&mut self, range: MemoryRange) {
        self.ramdisk_range = Some(range);
    }

    pub(crate) fn set_has_device_tree(&mut self, value: bool) {
        self.has_device_tree = value;
    }
}
