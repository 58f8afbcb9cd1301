//! Architecture-specific glue: the raw entry stub, the final handoff to
//! the launched executable, and the panic/allocator shims a freestanding
//! binary needs that a hosted crate gets from `std` for free.
//!
//! Only one target is implemented (spec §1: "an x86-64 operating
//! system"); the module is still split out the way the teacher splits
//! its own per-architecture code, so a second architecture is a sibling
//! module away rather than a rewrite.

#[cfg(target_arch = "x86_64")]
mod x86_64;
