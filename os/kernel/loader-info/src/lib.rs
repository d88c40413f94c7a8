//! # Boot Interface and Layout Constants
//!
//! This crate defines the ABI-stable boot-args record handed to the kernel at
//! the handoff jump, along with the small set of compile-time constants that
//! describe the target's physical memory layout and kernel base addresses.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! Defines the bootloader-to-kernel handoff interface:
//! * **`boot_args`**: the fixed-layout record placed just below the kernel and
//!   pointed to by `r0` at the jump, matching the historical `boot_args_t` ABI.
//! * **Video descriptor**: framebuffer geometry, carried through unchanged
//!   even though this target has no GOP to source it from.
//! * **ABI Stability**: `#[repr(C)]` throughout; no Rust enums with payloads.
//!
//! ### Memory Layout ([`memory`])
//! Establishes the constants that anchor the physical layout:
//! * **DRAM base and size**: fixed for this target, mirroring the historical
//!   `get_memory_base()`/`total_memory_size()` constants.
//! * **Kernel physical/virtual base**: where the Mach-O kernel image is
//!   expected to load and the slide applied to reach its link address.
//!
//! ## Boot Protocol
//!
//! The bootloader-to-kernel handoff follows a well-defined protocol:
//!
//! ```rust
//! # use loader_info::boot::{BootArgs, KernelEntryFn};
//! pub type _EntryCheck = KernelEntryFn;
//! ```
//!
//! * **Calling Convention**: `r0` holds a pointer to [`BootArgs`](boot::BootArgs), `r5` holds the entry point.
//! * **No Return**: the kernel assumes control permanently.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
