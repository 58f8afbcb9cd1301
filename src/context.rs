//! The linker context: the single value that owns the object registry,
//! the resolved configuration, and the orchestration of C2 through C5.
//! Generalizes the teacher's `context.rs` (a single owning struct with
//! explicit methods) off `petgraph`/`StableVec` onto the simpler arena +
//! linked-list model this spec's search list actually needs (spec §9:
//! "package this state in a single linker-context value … passed
//! explicitly to every operation").

use tinyvec::TinyVec;
use tracing::debug;

use crate::config::Config;
use crate::deps::{candidate_paths, enumerate_needed};
use crate::error::{RtldError, RtldErrorKind};
use crate::loader::{map_object, parse_dynamic, read_header, read_phdrs};
use crate::object::ObjectId;
use crate::registry::Registry;
use crate::relocate::relocate_all;
use crate::sys;
use crate::{String, SMALL_VEC_SIZE};

/// A dynamic linker context: the main state value for this crate.
/// Constructed on `rtld_main`'s stack frame and threaded by `&mut`
/// through every subsequent operation (spec §9).
pub struct Context {
    pub registry: Registry,
    pub config: Config,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }

    /// Register an already-mapped object (the executable, placed by the
    /// kernel; or the linker/VDSO, placed by bootstrap) without opening or
    /// mapping anything.
    pub fn register_existing(
        &mut self,
        name: &str,
        dynamic: usize,
        slide: i64,
        map_base: usize,
        map_len: usize,
        skip_relocation: bool,
    ) -> Result<ObjectId, RtldError> {
        let mut obj = parse_dynamic(name, dynamic, slide, map_base, map_len)?;
        obj.skip_relocation = skip_relocation;
        Ok(self.registry.insert(obj))
    }

    /// Open, map, and register a shared object by resolved path (spec
    /// §4.2 + §4.4).
    fn load_from_path(&mut self, canonical_name: &str, path: &str) -> Result<ObjectId, RtldError> {
        let mut path_buf = alloc::vec::Vec::with_capacity(path.len() + 1);
        path_buf.extend_from_slice(path.as_bytes());
        path_buf.push(0);

        debug!("{}: loading from {}", canonical_name, path);
        let fd = sys::open_readonly(&path_buf);
        if fd < 0 {
            return Err(RtldErrorKind::OpenFailed { path: String::from(path) }.into());
        }
        let fd = fd as i32;

        let result = (|| {
            let hdr = read_header(fd, canonical_name)?;
            let phdrs = read_phdrs(fd, &hdr, canonical_name)?;
            let mapped = map_object(fd, &phdrs, canonical_name)?;
            let dynamic = mapped.dynamic.ok_or_else(|| {
                RtldError::from(RtldErrorKind::MissingDynamicEntry {
                    name: String::from(canonical_name),
                    tag: "PT_DYNAMIC",
                })
            })?;
            let obj = parse_dynamic(
                canonical_name,
                dynamic,
                mapped.slide,
                mapped.map_base,
                mapped.map_len,
            )?;
            Ok(self.registry.insert(obj))
        })();

        sys::close(fd);
        result
    }

    /// Resolve `name` (as required by `importer`) to a loaded object,
    /// loading it if it isn't already registered (spec §4.4 step 1/2).
    fn resolve_dependency(&mut self, name: &str, importer: ObjectId) -> Result<ObjectId, RtldError> {
        if let Some(id) = self.registry.lookup(name.as_bytes()) {
            return Ok(id);
        }

        let importer_obj = self.registry.get(importer);
        let rpath = importer_obj.rpath.clone();
        let runpath = importer_obj.runpath.clone();
        let candidates = candidate_paths(
            name,
            rpath.as_ref().map(|s| s.as_str()),
            runpath.as_ref().map(|s| s.as_str()),
            &self.config,
        );

        for candidate in candidates.iter() {
            if let Ok(id) = self.load_from_path(name, candidate.as_str()) {
                return Ok(id);
            }
        }

        tracing::error!("could not locate dependency {} under any search path", name);
        Err(RtldErrorKind::MissingDependency { name: String::from(name) }.into())
    }

    /// Walk the search list from `root` (spec §4.4): for each object
    /// already on the list, enumerate `DT_NEEDED` and append every
    /// not-yet-listed dependency. Terminates because each object is
    /// appended at most once.
    pub fn resolve_all_dependencies(&mut self, root: ObjectId) -> Result<(), RtldError> {
        self.registry.append_search(root);

        let mut cursor = Some(root);
        while let Some(id) = cursor {
            let needed = {
                let obj = self.registry.get(id);
                enumerate_needed(obj)?
            };

            let mut failures: TinyVec<[RtldError; SMALL_VEC_SIZE]> = TinyVec::new();
            for name in needed.iter() {
                match self.resolve_dependency(name.as_str(), id) {
                    Ok(dep_id) => {
                        if !self.on_search_list(dep_id) {
                            self.registry.append_search(dep_id);
                        }
                    }
                    Err(e) => failures.push(e),
                }
            }
            if !failures.is_empty() {
                return Err(RtldError::new_collect(
                    RtldErrorKind::DepsFailed { name: self.registry.get(id).name.clone() },
                    failures,
                ));
            }

            cursor = self.registry.get(id).search_next;
        }
        Ok(())
    }

    fn on_search_list(&self, id: ObjectId) -> bool {
        self.registry.search_list().any(|x| x == id)
    }

    /// Apply every relocation for every non-skipped object on the search
    /// list (spec §4.5's "Ordering rationale": all objects are loaded
    /// first, then everything is relocated in one pass).
    pub fn relocate_all(&mut self) -> Result<(), RtldError> {
        relocate_all(&mut self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_empty_registry() {
        let ctx = Context::new(Config::empty());
        assert_eq!(ctx.registry.len(), 0);
    }
}
