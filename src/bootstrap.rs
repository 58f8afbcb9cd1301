//! Self-bootstrap (C1): relocate the linker's own image before any global
//! variable or GOT-mediated call can be trusted. Grounded almost directly
//! in `original_source/rtld/start.c` — the one piece of this crate with
//! no real counterpart in the teacher repository, since the teacher is
//! itself loaded by a prior-stage loader and never bootstraps itself.
//!
//! Every function here takes its inputs as plain arguments and returns a
//! plain struct by value. None of them touch a `static`, call through a
//! vtable, or allocate — the obligation in spec §4.1 ("no function in the
//! bootstrap's call graph may read or write a global that would itself
//! require a relocation to be valid") is met structurally, by never having
//! a global to touch in the first place.

use crate::raw::*;

/// What bootstrap hands back once the linker's own image is
/// self-consistent: its own slide, and enough of the VDSO's layout to
/// promote it into a proper registry object later.
pub struct BootstrapInfo {
    pub linker_slide: i64,
    pub vdso: VdsoInfo,
    pub entry: u64,
    pub phdr: u64,
    pub phnum: u64,
    pub phent: u64,
}

#[derive(Clone, Copy)]
pub struct VdsoInfo {
    pub base: usize,
    pub dynamic: usize,
    pub hash_buckets: usize,
    pub hash_chains: usize,
    pub nbuckets: u32,
    pub strtab: usize,
    pub symtab: usize,
    pub syment: usize,
}

/// Run bootstrap. `start_info` points at `argc`, as the kernel places it
/// on the initial stack (spec §4.1 contract). `own_dynamic` is this
/// linker's own (link-time) `PT_DYNAMIC` address, computed by the naked
/// entry stub via RIP-relative addressing — never through the GOT.
///
/// # Safety
/// `start_info` must point at a live kernel-provided initial stack layout,
/// and `own_dynamic` must be the live address of this image's own dynamic
/// array (already slide-adjusted by the caller if necessary — see
/// `arch::x86_64::_start`).
pub unsafe fn bootstrap(start_info: *const u64, own_dynamic: *const Dyn) -> Result<BootstrapInfo, &'static str> {
    let auxv = crate::auxv::Auxv::from_stack(start_info);

    let vdso_base = auxv.require(AT_SYSINFO_EHDR, "AT_SYSINFO_EHDR")?;
    let linker_slide = auxv.require(AT_BASE, "AT_BASE")? as i64;
    let entry = auxv.require(AT_ENTRY, "AT_ENTRY")?;
    let phdr = auxv.require(AT_PHDR, "AT_PHDR")?;
    let phnum = auxv.require(AT_PHNUM, "AT_PHNUM")?;
    let phent = auxv.require(AT_PHENT, "AT_PHENT")?;

    let vdso = scan_vdso(vdso_base as usize)?;
    relocate_self(own_dynamic, linker_slide, &vdso)?;

    Ok(BootstrapInfo { linker_slide, vdso, entry, phdr, phnum, phent })
}

/// Parse the VDSO's own program headers (it has no slide; the kernel maps
/// it at `vdso_base` directly) to find `PT_DYNAMIC`, then parse that to
/// locate `DT_HASH`/`DT_STRTAB`/`DT_SYMTAB` (spec §4.1, obligation 3).
unsafe fn scan_vdso(vdso_base: usize) -> Result<VdsoInfo, &'static str> {
    let ehdr = core::ptr::read(vdso_base as *const Ehdr);
    let phdr_base = vdso_base + ehdr.e_phoff as usize;

    let mut dynamic = 0usize;
    for i in 0..ehdr.e_phnum as usize {
        let phdr = core::ptr::read((phdr_base as *const Phdr).add(i));
        if phdr.p_type == PT_DYNAMIC {
            dynamic = vdso_base + phdr.p_vaddr as usize;
        }
    }
    if dynamic == 0 {
        return Err("VDSO has no PT_DYNAMIC");
    }

    let mut strtab = 0usize;
    let mut symtab = 0usize;
    let mut syment = 0usize;
    let mut hash = 0usize;
    let mut p = dynamic as *const Dyn;
    loop {
        let d = core::ptr::read(p);
        if d.d_tag == DT_NULL {
            break;
        }
        match d.d_tag {
            DT_STRTAB => strtab = vdso_base + d.d_val as usize,
            DT_SYMTAB => symtab = vdso_base + d.d_val as usize,
            DT_SYMENT => syment = d.d_val as usize,
            DT_HASH => hash = vdso_base + d.d_val as usize,
            _ => {}
        }
        p = p.add(1);
    }

    if strtab == 0 || symtab == 0 || hash == 0 {
        return Err("VDSO missing DT_HASH/DT_STRTAB/DT_SYMTAB");
    }

    let nbuckets = core::ptr::read(hash as *const u32);
    let hash_buckets = hash + 2 * core::mem::size_of::<u32>();
    let hash_chains = hash_buckets + nbuckets as usize * core::mem::size_of::<u32>();

    Ok(VdsoInfo {
        base: vdso_base,
        dynamic,
        hash_buckets,
        hash_chains,
        nbuckets,
        strtab,
        symtab,
        syment,
    })
}

/// Resolve `name` against the VDSO's own hash table (spec §4.1 obligation
/// 4: "Symbol references that are undefined in the linker must be
/// satisfied against the VDSO"). The VDSO has slide 0 by definition — the
/// kernel places it directly at `vdso.base`.
unsafe fn vdso_symbol(vdso: &VdsoInfo, name: &[u8]) -> Option<u64> {
    let hash = crate::symbol::elf_hash(name);
    let bucket = (hash % vdso.nbuckets) as usize;
    let mut idx = core::ptr::read((vdso.hash_buckets as *const u32).add(bucket));
    while idx != STN_UNDEF {
        let sym = core::ptr::read((vdso.symtab + idx as usize * vdso.syment) as *const Sym);
        if bytes_eq_cstr(vdso.strtab + sym.st_name as usize, name) {
            return Some(vdso.base as u64 + sym.st_value);
        }
        idx = core::ptr::read((vdso.hash_chains as *const u32).add(idx as usize));
    }
    None
}

unsafe fn bytes_eq_cstr(cstr: usize, name: &[u8]) -> bool {
    for (i, &b) in name.iter().enumerate() {
        if core::ptr::read((cstr + i) as *const u8) != b {
            return false;
        }
    }
    core::ptr::read((cstr + name.len()) as *const u8) == 0
}

unsafe fn cstr_bytes(ptr: usize) -> &'static [u8] {
    let mut len = 0usize;
    while core::ptr::read((ptr + len) as *const u8) != 0 {
        len += 1;
    }
    core::slice::from_raw_parts(ptr as *const u8, len)
}

/// Walk the linker's own dynamic array and apply every RELA/JMPREL entry
/// to itself (spec §4.1 obligation 4). Supports the same relocation
/// subset as the main engine (§4.1: "same set in both bootstrap and
/// engine").
unsafe fn relocate_self(own_dynamic: *const Dyn, slide: i64, vdso: &VdsoInfo) -> Result<(), &'static str> {
    let mut strtab = 0usize;
    let mut symtab = 0usize;
    let mut syment = 0usize;
    let mut rela = 0usize;
    let mut relasz = 0usize;
    let mut relaent = 0usize;
    let mut jmprel = 0usize;
    let mut pltrelsz = 0usize;

    let mut p = own_dynamic;
    loop {
        let d = core::ptr::read(p);
        if d.d_tag == DT_NULL {
            break;
        }
        match d.d_tag {
            DT_STRTAB => strtab = (d.d_val as i64 + slide) as usize,
            DT_SYMTAB => symtab = (d.d_val as i64 + slide) as usize,
            DT_SYMENT => syment = d.d_val as usize,
            DT_RELA => rela = (d.d_val as i64 + slide) as usize,
            DT_RELASZ => relasz = d.d_val as usize,
            DT_RELAENT => relaent = d.d_val as usize,
            DT_JMPREL => jmprel = (d.d_val as i64 + slide) as usize,
            DT_PLTRELSZ => pltrelsz = d.d_val as usize,
            _ => {}
        }
        p = p.add(1);
    }

    if rela != 0 && relaent != 0 {
        apply_self_relas(rela, relasz, relaent, slide, strtab, symtab, syment, vdso)?;
    }
    if jmprel != 0 {
        apply_self_relas(jmprel, pltrelsz, core::mem::size_of::<Rela>(), slide, strtab, symtab, syment, vdso)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
unsafe fn apply_self_relas(
    table: usize,
    table_size: usize,
    entsize: usize,
    slide: i64,
    strtab: usize,
    symtab: usize,
    syment: usize,
    vdso: &VdsoInfo,
) -> Result<(), &'static str> {
    if entsize == 0 {
        return Ok(());
    }
    let count = table_size / entsize;
    for i in 0..count {
        let rela = core::ptr::read((table as *const Rela).add(i));
        let addr = (rela.r_offset as i64 + slide) as usize;
        let a = rela.r_addend;
        let b = slide;

        let s = match rela.kind() {
            R_X86_64_NONE | R_X86_64_COPY => continue,
            R_X86_64_RELATIVE => {
                core::ptr::write_unaligned(addr as *mut u64, (b + a) as u64);
                continue;
            }
            R_X86_64_IRELATIVE => {
                let target = (b + a) as u64;
                let f: extern "C" fn() -> u64 = core::mem::transmute(target as usize);
                core::ptr::write_unaligned(addr as *mut u64, f());
                continue;
            }
            R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                if strtab == 0 || symtab == 0 || syment == 0 {
                    return Err("self-relocation needs a symbol but linker has no symbol table");
                }
                let sym_index = rela.sym();
                if sym_index == 0 {
                    0
                } else {
                    let sym = core::ptr::read((symtab + sym_index as usize * syment) as *const Sym);
                    if sym.st_shndx != SHN_UNDEF {
                        (sym.st_value as i64 + slide) as u64
                    } else {
                        let name = cstr_bytes(strtab + sym.st_name as usize);
                        match vdso_symbol(vdso, name) {
                            Some(v) => v,
                            None => return Err("undefined non-VDSO symbol during self-relocation"),
                        }
                    }
                }
            }
            _ => return Err("unsupported relocation type during self-relocation"),
        };

        let value = if rela.kind() == R_X86_64_64 { (s as i64 + a) as u64 } else { s };
        core::ptr::write_unaligned(addr as *mut u64, value);
    }
    Ok(())
}
