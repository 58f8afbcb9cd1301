//! Dependency resolver (C4): `DT_NEEDED` enumeration and search-path name
//! resolution. Enumeration is grounded in the teacher's
//! `context/deps.rs::enumerate_needed`, generalized off the `elf` crate;
//! resolution precedence is grounded in
//! `original_source/rtld/object.c`'s `open_object`/`find_object`.

use tinyvec::TinyVec;
use tracing::trace;

use crate::config::{Config, DEFAULT_LIBRARY_PATH};
use crate::error::{RtldError, RtldErrorKind};
use crate::loader::read_dynstr;
use crate::object::Object;
use crate::raw::DT_NEEDED;
use crate::{String, SMALL_VEC_SIZE};

/// Enumerate every `DT_NEEDED` name of `obj` (spec §4.4).
pub fn enumerate_needed(obj: &Object) -> Result<TinyVec<[String; SMALL_VEC_SIZE]>, RtldError> {
    trace!("{}: enumerating dependencies", obj.name);
    let mut out = TinyVec::new();

    // SAFETY: `obj.dynamic` was validated and bounds-checked when the
    // object was parsed (loader.rs); re-walking it here to collect
    // DT_NEEDED is a repeat of that same validated traversal.
    let dyns: &[crate::raw::Dyn] = unsafe {
        let mut len = 0usize;
        let mut p = obj.dynamic as *const crate::raw::Dyn;
        loop {
            let d = core::ptr::read(p);
            len += 1;
            if d.d_tag == crate::raw::DT_NULL {
                break;
            }
            p = p.add(1);
        }
        core::slice::from_raw_parts(obj.dynamic as *const crate::raw::Dyn, len)
    };

    for d in dyns {
        if d.d_tag != DT_NEEDED {
            continue;
        }
        let name = read_dynstr(obj.symbols.strtab, d.d_val as usize, obj.map_base, obj.map_len)
            .ok_or_else(|| RtldError::from(RtldErrorKind::DepEnumerationFailed {
                name: obj.name.clone(),
            }))?;
        out.push(name);
    }
    Ok(out)
}

/// The ordered list of search-path strategies this linker tries, per spec
/// §4.4: verbatim path (if the name contains `/`), else RPATH-without-
/// RUNPATH, then `LD_LIBRARY_PATH`, then RUNPATH, then `/usr/lib`.
pub fn candidate_paths<'a>(
    name: &'a str,
    importer_rpath: Option<&'a str>,
    importer_runpath: Option<&'a str>,
    config: &'a Config,
) -> TinyVec<[String; SMALL_VEC_SIZE]> {
    let mut out = TinyVec::new();

    if name.contains('/') {
        out.push(String::from(name));
        return out;
    }

    if importer_runpath.is_none() {
        if let Some(rpath) = importer_rpath {
            for dir in rpath.split(':').filter(|s| !s.is_empty()) {
                out.push(join(dir, name));
            }
        }
    }

    if !config.ld_library_path.is_empty() {
        for dir in config
            .ld_library_path
            .as_str()
            .split(|c| c == ':' || c == ';')
            .filter(|s| !s.is_empty())
        {
            out.push(join(dir, name));
        }
    }

    if let Some(runpath) = importer_runpath {
        for dir in runpath.split(':').filter(|s| !s.is_empty()) {
            out.push(join(dir, name));
        }
    }

    out.push(join(DEFAULT_LIBRARY_PATH, name));
    out
}

fn join(dir: &str, name: &str) -> String {
    let mut s = String::from(dir);
    if !dir.ends_with('/') {
        s.push('/');
    }
    s.push_str(name);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_path_used_as_is() {
        let cfg = Config::empty();
        let paths = candidate_paths("./local/libz.so", None, None, &cfg);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].as_str(), "./local/libz.so");
    }

    #[test]
    fn runpath_present_skips_rpath() {
        let cfg = Config::empty();
        let paths = candidate_paths("libz.so", Some("/rpath"), Some("/runpath"), &cfg);
        assert!(!paths.iter().any(|p| p.as_str() == "/rpath/libz.so"));
        assert!(paths.iter().any(|p| p.as_str() == "/runpath/libz.so"));
    }

    #[test]
    fn rpath_used_when_no_runpath() {
        let cfg = Config::empty();
        let paths = candidate_paths("libz.so", Some("/rpath"), None, &cfg);
        assert!(paths.iter().any(|p| p.as_str() == "/rpath/libz.so"));
    }

    #[test]
    fn ld_library_path_before_runpath_after_rpath_absent() {
        let cfg = Config::new("./local");
        let paths = candidate_paths("libz.so", None, Some("/runpath"), &cfg);
        let local_idx = paths.iter().position(|p| p.as_str() == "./local/libz.so").unwrap();
        let runpath_idx = paths.iter().position(|p| p.as_str() == "/runpath/libz.so").unwrap();
        assert!(local_idx < runpath_idx);
    }

    #[test]
    fn falls_back_to_usr_lib() {
        let cfg = Config::empty();
        let paths = candidate_paths("libz.so", None, None, &cfg);
        assert_eq!(paths.last().unwrap().as_str(), "/usr/lib/libz.so");
    }
}
