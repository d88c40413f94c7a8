//! # Trace output

use loader_handoff::Handoff;

/// Log everything the loader is about to hand the kernel, one line, just
/// before the non-returning jump - the last diagnostic this loader can ever
/// emit once interrupts go down and boot services are gone.
pub fn trace_handoff(handoff: &Handoff, dram_base: usize) {
    use log::info;

    let (dt_base, dt_len) = handoff.device_tree_range;
    info!(
        "Handoff: entry={:#010x} (abs={:#018x}), boot_args(vm)={:#010x}, dt=[{:#010x}, {:#x}]",
        handoff.entry_point,
        dram_base + handoff.entry_point as usize,
        handoff.vm_boot_args,
        dt_base,
        dt_len,
    );
}
