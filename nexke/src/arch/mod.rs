// SPDX-License-Identifier: MPL-2.0

//! Architecture-specific glue.
//!
//! Everything outside this module is machine-independent: the frame
//! manager, slab allocator, KV arena, VM object layer, resource arena and
//! timer scheduler never reference a register or an instruction. Only the
//! MMU layer (PTE encoding, TLB flush), the interrupt controller, and the
//! hardware clock live here — the only architecture-specific pieces of
//! the memory and trap subsystems.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as arch;
