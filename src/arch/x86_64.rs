//! x86-64 entry stub and handoff, grounded in the `_start`/`jump_to_entry`
//! pair of `other_examples/bf208d71_nexa-sys-nexa-os__userspace-ld-nrlib`
//! — the closest thing in the retrieval pack to a from-scratch freestanding
//! ELF loader entry point.

use core::arch::{asm, naked_asm};

use crate::bootstrap::{bootstrap, BootstrapInfo};
use crate::config::Config;
use crate::context::Context;
use crate::error::RtldError;
use crate::object::ObjectId;
use crate::raw::{Phdr, PT_DYNAMIC, PT_LOAD, PT_PHDR};
use crate::sys;

/// The real process entry point. The kernel jumps here with `rsp`
/// pointing at `argc` and every other register unspecified. We capture
/// that raw stack pointer before touching `rsp` at all, locate our own
/// `PT_DYNAMIC` by its link-time symbol via a RIP-relative load (this
/// works before any relocation has been applied — it is PC-relative, not
/// GOT-mediated), realign the stack to the ABI's 16-byte boundary, and
/// call into Rust.
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        "mov rdi, rsp",
        "lea rsi, [rip + _DYNAMIC]",
        "and rsp, -16",
        "call {main}",
        "ud2",
        main = sym rtld_main,
    )
}

/// Everything from "kernel just handed us the stack" to "jump to the
/// executable's entry point" (spec §1, §6 Handoff).
#[no_mangle]
unsafe extern "C" fn rtld_main(stack_ptr: *const u64, own_dynamic: *const crate::raw::Dyn) -> ! {
    let info = match bootstrap(stack_ptr, own_dynamic) {
        Ok(info) => info,
        Err(msg) => fatal_bootstrap(msg),
    };

    let envp = envp_from_stack(stack_ptr);
    let config = Config::from_envp(envp);
    let mut ctx = Context::new(config);

    if let Err(e) = run(&mut ctx, &info) {
        fatal(&e);
    }

    jump_to_entry(info.entry, stack_ptr)
}

/// Register the executable (already mapped by the kernel, per spec §4.1
/// obligation 2's `AT_PHDR`/`AT_PHNUM`/`AT_PHENT`), then run C4 and C5.
unsafe fn run(ctx: &mut Context, info: &BootstrapInfo) -> Result<(), RtldError> {
    let (slide, map_base, map_len, dynamic) = describe_executable(info.phdr, info.phnum, info.phent);
    let root: ObjectId = ctx.register_existing("<main>", dynamic, slide, map_base, map_len, false)?;
    ctx.resolve_all_dependencies(root)?;
    ctx.relocate_all()?;
    Ok(())
}

/// Walk the executable's program headers (already resident at `AT_PHDR`)
/// to recover its load bias, its `PT_DYNAMIC` address, and the span of
/// its mapped segments — the same "first `PT_LOAD`'s vaddr sets the
/// baseline, `PT_PHDR`'s vaddr lets us back out the bias" technique the
/// retrieval pack's freestanding loaders use.
unsafe fn describe_executable(phdr: u64, phnum: u64, _phent: u64) -> (i64, usize, usize, usize) {
    let phdrs = core::slice::from_raw_parts(phdr as *const Phdr, phnum as usize);

    let mut min_vaddr = u64::MAX;
    let mut max_vaddr = 0u64;
    let mut dynamic_vaddr = 0u64;
    let mut phdr_link_vaddr = 0u64;

    for p in phdrs {
        match p.p_type {
            PT_LOAD => {
                if p.p_vaddr < min_vaddr {
                    min_vaddr = p.p_vaddr;
                }
                let end = p.p_vaddr + p.p_memsz;
                if end > max_vaddr {
                    max_vaddr = end;
                }
            }
            PT_DYNAMIC => dynamic_vaddr = p.p_vaddr,
            PT_PHDR => phdr_link_vaddr = p.p_vaddr,
            _ => {}
        }
    }

    let slide = if phdr_link_vaddr != 0 {
        phdr as i64 - phdr_link_vaddr as i64
    } else {
        0
    };

    let map_base = (min_vaddr as i64 + slide) as usize;
    let map_len = (max_vaddr - min_vaddr) as usize;
    let dynamic = (dynamic_vaddr as i64 + slide) as usize;
    (slide, map_base, map_len, dynamic)
}

/// Re-walk the same `argc`/`argv`/`envp` skip `bootstrap::scan_vdso`'s
/// sibling, `Auxv::from_stack`, performs internally, stopping one step
/// earlier to hand back the `envp` base itself rather than the auxv that
/// follows it.
unsafe fn envp_from_stack(stack_ptr: *const u64) -> *const *const u8 {
    let argc = core::ptr::read(stack_ptr) as usize;
    stack_ptr.add(1 + argc + 1) as *const *const u8
}

fn fatal_bootstrap(msg: &str) -> ! {
    sys::write_all(2, b"rtld: fatal during bootstrap: ");
    sys::write_all(2, msg.as_bytes());
    sys::write_all(2, b"\n");
    sys::exit(1);
}

fn fatal(err: &RtldError) -> ! {
    let msg = alloc::format!("rtld: fatal: {}\n", err);
    sys::write_all(2, msg.as_bytes());
    sys::exit(1);
}

/// Hand control to the executable's entry point with the original stack
/// pointer restored and every other general-purpose register cleared
/// (spec §6 Handoff).
#[inline(never)]
unsafe fn jump_to_entry(entry: u64, stack_ptr: *const u64) -> ! {
    asm!(
        "mov rsp, {stack}",
        "xor rbp, rbp",
        "xor rax, rax",
        "xor rbx, rbx",
        "xor rcx, rcx",
        "xor rdx, rdx",
        "xor rsi, rsi",
        "xor rdi, rdi",
        "xor r8, r8",
        "xor r9, r9",
        "xor r10, r10",
        "xor r11, r11",
        "xor r12, r12",
        "xor r13, r13",
        "xor r14, r14",
        "xor r15, r15",
        "jmp {entry}",
        stack = in(reg) stack_ptr,
        entry = in(reg) entry,
        options(noreturn),
    );
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    sys::write_all(2, b"rtld: panic\n");
    sys::exit(127)
}
