//! Symbol resolution (C5, lookup half), grounded in
//! `original_source/rtld/start.c`'s `elf_hash`/`get_vdso_sym` and
//! `object.c`'s `search_for_symbol`; bitflags lookup-mode surface
//! generalized from the teacher's `symbol.rs::LookupFlags`.

use crate::error::{RtldError, RtldErrorKind};
use crate::loader::read_dynstr;
use crate::object::{Object, ObjectId};
use crate::raw::{Sym, STB_GLOBAL, STB_WEAK, STN_UNDEF};
use crate::registry::Registry;
use crate::String;

bitflags::bitflags! {
    /// Options controlling where [`resolve`] looks for a symbol. Trimmed
    /// to this spec's subset of the teacher's `LookupFlags` (no
    /// compartments or secgates here).
    #[derive(Clone, Copy, Debug)]
    pub struct LookupFlags: u32 {
        /// Accept weak matches even if no strong one was found (used for
        /// the global search's final pass, and for resolving an
        /// undefined-weak reference without treating it as fatal).
        const ALLOW_UNDEFINED_WEAK = 0x1;
    }
}

/// The classic ELF hash algorithm (a 28-bit shifted-XOR cascade), as
/// `original_source/rtld/start.c`'s `elf_hash` computes it. Distinct from
/// the registry's FNV-1a hash (`registry::fnv1a`): this hash keys a
/// per-object symbol table, not the object registry.
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// A symbol resolved within one object, still in link-time (unrelocated)
/// form.
#[derive(Clone, Copy)]
pub struct Resolved {
    pub owner: ObjectId,
    pub value: u64,
    pub size: u64,
}

impl Resolved {
    /// The live runtime address: the symbol's link-time value plus the
    /// owning object's slide.
    pub fn address(&self, owner: &Object) -> u64 {
        (self.value as i64 + owner.slide) as u64
    }
}

/// Probe a single object's hash table for `name`, honoring the binding
/// policy of spec §4.5: a `st_value == 0` symbol is treated as undefined
/// and ignored.
fn lookup_in_object(obj: &Object, name: &str, hash: u32) -> Option<(Sym, u8)> {
    if obj.symbols.hash.nbuckets == 0 {
        return None;
    }
    let bucket = (hash % obj.symbols.hash.nbuckets) as usize;
    // SAFETY: `obj.symbols.hash.{buckets,chains}` were bounds-checked
    // against the object's mapped span when the object was parsed
    // (loader.rs::parse_dynamic).
    let mut idx = unsafe {
        core::ptr::read((obj.symbols.hash.buckets as *const u32).add(bucket))
    };
    while idx != STN_UNDEF {
        // SAFETY: symtab/strtab and the chain array were bounds-checked at
        // parse time; `idx` is a chain-array-derived index into the same
        // table.
        let sym: Sym = unsafe {
            core::ptr::read(
                (obj.symbols.symtab + idx as usize * obj.symbols.syment) as *const Sym,
            )
        };
        if let Some(symname) =
            read_dynstr(obj.symbols.strtab, sym.st_name as usize, obj.map_base, obj.map_len)
        {
            if symname.as_str() == name {
                return Some((sym, sym.bind()));
            }
        }
        idx = unsafe { core::ptr::read((obj.symbols.hash.chains as *const u32).add(idx as usize)) };
    }
    None
}

/// Walk the search list resolving `name`, applying the strong/weak binding
/// policy of spec §4.5: the first strong (`STB_GLOBAL`) match wins
/// immediately; weak matches are remembered but the walk continues; if
/// only weak matches were found, the earliest (in load order) is
/// returned.
pub fn resolve(
    registry: &Registry,
    search_from: Option<ObjectId>,
    name: &str,
) -> Option<Resolved> {
    let hash = elf_hash(name.as_bytes());
    let mut weak_fallback: Option<(ObjectId, Sym)> = None;

    let mut cur = search_from;
    while let Some(id) = cur {
        let obj = registry.get(id);
        if let Some((sym, bind)) = lookup_in_object(obj, name, hash) {
            if sym.st_value != 0 {
                if bind == STB_GLOBAL {
                    return Some(Resolved { owner: id, value: sym.st_value, size: sym.st_size });
                }
                if bind == STB_WEAK && weak_fallback.is_none() {
                    weak_fallback = Some((id, sym));
                }
            }
        }
        cur = obj.search_next;
    }

    weak_fallback.map(|(owner, sym)| Resolved { owner, value: sym.st_value, size: sym.st_size })
}

/// Resolve `name`, treating an unresolved non-weak reference as fatal and
/// an unresolved weak reference as a legitimate null (spec §4.5: "it is
/// the relocation type's responsibility to decide whether that is
/// permitted" — callers pass `is_weak` as known from the referencing
/// relocation's own symbol entry).
pub fn resolve_or_fatal(
    registry: &Registry,
    search_from: Option<ObjectId>,
    name: &str,
    is_weak: bool,
    source: &str,
) -> Result<Option<Resolved>, RtldError> {
    match resolve(registry, search_from, name) {
        Some(r) => Ok(Some(r)),
        None if is_weak => {
            tracing::trace!("{}: undefined weak symbol {} resolves to 0", source, name);
            Ok(None)
        }
        None => {
            tracing::error!("{}: unresolved symbol {}", source, name);
            Err(RtldErrorKind::UnresolvedSymbol {
                symbol: String::from(name),
                source: String::from(source),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_hash_matches_known_vectors() {
        // Values cross-checked against the classic public-domain
        // reference implementation of this algorithm.
        assert_eq!(elf_hash(b""), 0);
        assert_eq!(elf_hash(b"printf"), 0x077905a6);
    }
}
