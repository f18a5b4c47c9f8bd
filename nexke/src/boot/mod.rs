// SPDX-License-Identifier: MPL-2.0

//! The boot handoff record: everything the pre-kernel stage
//! hands the kernel core before its own drivers and ACPI parsing exist.
//! Firmware glue, BIOS/UEFI drivers, and the bootloader's own menu/object
//! database are out of scope and treated as an external collaborator
//! that produces this record.

pub mod cmdline;
pub mod memory_region;

use alloc::vec::Vec;

use spin::Once;

use self::memory_region::MemoryRegion;
use crate::mm::Paddr;

/// The platform's display mode at kernel entry.
#[derive(Clone, Copy, Debug)]
pub enum DisplayMode {
    /// A legacy VGA text-mode console; no framebuffer to draw into.
    Text,
    Graphical(FramebufferInfo),
}

#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
    pub base: Paddr,
    pub pitch: usize,
    pub bpp: u8,
    /// (shift, width) pairs for each color channel.
    pub red_mask: (u8, u8),
    pub green_mask: (u8, u8),
    pub blue_mask: (u8, u8),
}

bitflags::bitflags! {
    /// Which optional firmware table addresses the bootloader supplied.
    struct FirmwareTables: u8 {
        const ACPI_RSDP = 1 << 0;
        const MPS       = 1 << 1;
    }
}

/// The kernel entry handoff record. Persisted state: none
/// beyond this record — the core is stateless across boots.
pub struct BootInfo {
    pub memory_regions: Vec<MemoryRegion>,
    pub display: DisplayMode,
    /// Physical base and size of the pool carved out for the pre-paging
    /// boot-stage heap ([`crate::boot`] hands this to `nexboot-alloc`
    /// before the kernel runs; the kernel core only reports it).
    pub boot_pool_base: Paddr,
    pub boot_pool_size: usize,
    firmware: FirmwareTables,
    acpi_rsdp: Paddr,
    mps: Paddr,
    pub cmdline: &'static str,
}

impl BootInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_regions: Vec<MemoryRegion>,
        display: DisplayMode,
        boot_pool_base: Paddr,
        boot_pool_size: usize,
        acpi_rsdp: Option<Paddr>,
        mps: Option<Paddr>,
        cmdline: &'static str,
    ) -> Self {
        let mut firmware = FirmwareTables::empty();
        firmware.set(FirmwareTables::ACPI_RSDP, acpi_rsdp.is_some());
        firmware.set(FirmwareTables::MPS, mps.is_some());
        Self {
            memory_regions,
            display,
            boot_pool_base,
            boot_pool_size,
            firmware,
            acpi_rsdp: acpi_rsdp.unwrap_or(0),
            mps: mps.unwrap_or(0),
            cmdline,
        }
    }

    pub fn acpi_rsdp(&self) -> Option<Paddr> {
        self.firmware.contains(FirmwareTables::ACPI_RSDP).then_some(self.acpi_rsdp)
    }

    pub fn mps(&self) -> Option<Paddr> {
        self.firmware.contains(FirmwareTables::MPS).then_some(self.mps)
    }
}

static BOOT_INFO: Once<BootInfo> = Once::new();

/// Publishes the boot handoff record. Must run exactly once, before any
/// other subsystem queries [`boot_info`].
pub fn init(info: BootInfo) {
    BOOT_INFO.call_once(|| info);
}

pub fn boot_info() -> &'static BootInfo {
    BOOT_INFO.get().expect("boot info not initialized")
}
