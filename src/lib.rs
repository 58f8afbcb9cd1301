//! Welcome to the dynamic linker.
//!
//! The job of this crate is to bring a freshly `execve`d dynamically linked
//! ELF64 process from "the kernel just mapped the executable and this
//! linker" to "every dynamic symbol is resolved, every relocation is
//! applied, control can be handed to the executable's entry point".
//!
//! # Basic dynamic linking concepts
//!
//! A shared object is an ELF file prepared so that it can be mapped
//! anywhere in the address space (`ET_DYN`) and then fixed up in place: the
//! compiler emits relative references to data it can't know the final
//! address of, and records a relocation table telling the linker "once you
//! know where this object landed, go patch this address". The overall
//! process, for one object:
//!
//! 1. Map its `PT_LOAD` segments into memory at a freshly chosen base.
//! 2. Parse its `PT_DYNAMIC` entry into a [`object::Object`] record.
//! 3. Register it (`registry::Registry::insert`) and append it to the
//!    global search list.
//! 4. Walk its `DT_NEEDED` entries, recursing into any dependency not
//!    already registered.
//! 5. Once every object reachable this way is loaded, apply every object's
//!    relocations in search-list order.
//!
//! Symbol lookup during relocation walks the search list in the order
//! objects were discovered (a breadth-first walk of the `DT_NEEDED` graph
//! rooted at the executable); this order **is** the global symbol scope.
//! A strong (`STB_GLOBAL`) match wins immediately; a weak match is
//! remembered but the walk continues in case a strong definition exists
//! further down the list.
//!
//! # Before any of that: bootstrap
//!
//! The linker is itself a shared object. The kernel maps it and jumps to
//! its entry point with none of *its own* relocations applied yet — every
//! global it has, every function pointer in its own GOT, is still pointing
//! at link-time addresses. [`bootstrap`] is the small, self-contained
//! routine that fixes this, written so that it never reads or writes
//! anything that itself needs a relocation to be valid: stack locals only,
//! plus whatever it can find by walking the auxiliary vector and the
//! kernel-provided VDSO.
//!
//! # Error handling
//!
//! This crate reports errors with [`error::RtldError`]. Every fallible
//! operation below the top-level entry point returns a `Result` and
//! propagates with `?`; only the process entry point converts a terminal
//! `Err` into a diagnostic line on stderr and a nonzero exit.
//!
//! # State
//!
//! All linker state (the object registry, the search list, resolved
//! configuration) lives in one [`context::Context`] value, constructed on
//! the entry function's stack and threaded explicitly through every
//! operation — there is no process-wide mutable global beyond what
//! bootstrap itself, of necessity, must touch before that value can exist.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub(crate) mod arch;

mod alloc_shim;
mod auxv;
mod bootstrap;
mod config;
mod context;
mod deps;
mod error;
mod loader;
mod object;
mod raw;
mod registry;
mod relocate;
mod symbol;
mod sys;

pub use bootstrap::{bootstrap, BootstrapInfo};
pub use config::Config;
pub use context::Context;
pub use error::{RtldError, RtldErrorKind};
pub use object::{Object, ObjectId};

/// Small-vector inline capacity used throughout for collections that are
/// almost always short (a handful of `DT_NEEDED` entries, a handful of
/// related errors) but must not require an allocator to exist yet.
pub(crate) const SMALL_VEC_SIZE: usize = 8;
/// Small-string inline capacity for canonical object names and path
/// components, sized comfortably above a typical `libfoo.so` basename.
pub(crate) const SMALL_STRING_SIZE: usize = 48;

pub(crate) type Vec<T> = alloc::vec::Vec<T>;
pub(crate) type String = smallstr::SmallString<[u8; SMALL_STRING_SIZE]>;
