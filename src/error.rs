//! Error taxonomy for the dynamic linker.
use itertools::{Either, Itertools};
use thiserror::Error;
use tinyvec::TinyVec;

use crate::{object::ObjectId, String, SMALL_VEC_SIZE};

/// A single fatal error, optionally carrying the errors of sibling
/// operations that were attempted and also failed (see [`RtldError::collect`]).
#[derive(Debug, Error, Default)]
#[error("{kind}")]
pub struct RtldError {
    pub kind: RtldErrorKind,
    pub related: TinyVec<[RtldError; SMALL_VEC_SIZE]>,
}

impl RtldError {
    pub fn new(kind: RtldErrorKind) -> Self {
        Self {
            kind,
            related: TinyVec::new(),
        }
    }

    pub fn new_collect(kind: RtldErrorKind, related: TinyVec<[RtldError; SMALL_VEC_SIZE]>) -> Self {
        Self { kind, related }
    }

    /// Run an iterator of fallible operations to completion, gathering every
    /// successful value. If any failed, return a single `RtldError` of kind
    /// `parent_kind` with every failure attached as `related`; otherwise
    /// return the successful values.
    pub fn collect<I, T: Default>(
        parent_kind: RtldErrorKind,
        it: I,
    ) -> Result<TinyVec<[T; SMALL_VEC_SIZE]>, RtldError>
    where
        I: IntoIterator<Item = Result<T, RtldError>>,
    {
        let (vals, errs): (
            TinyVec<[T; SMALL_VEC_SIZE]>,
            TinyVec<[RtldError; SMALL_VEC_SIZE]>,
        ) = it.into_iter().partition_map(|item| match item {
            Ok(o) => Either::Left(o),
            Err(e) => Either::Right(e),
        });

        if errs.is_empty() {
            Ok(vals)
        } else {
            Err(RtldError {
                kind: parent_kind,
                related: errs,
            })
        }
    }
}

impl From<RtldErrorKind> for RtldError {
    fn from(value: RtldErrorKind) -> Self {
        Self {
            kind: value,
            related: TinyVec::new(),
        }
    }
}

/// The error-kind families named in the specification's error-handling
/// design, refined into concrete variants.
#[derive(Debug, Error, Default)]
pub enum RtldErrorKind {
    #[default]
    #[error("unknown error")]
    Unknown,

    // -- (a) I/O --
    #[error("failed to open '{path}'")]
    OpenFailed { path: String },
    #[error("failed to read '{name}': {errno}")]
    ReadFailed { name: String, errno: i64 },
    #[error("short read on '{name}': wanted {wanted}, got {got}")]
    TruncatedRead {
        name: String,
        wanted: usize,
        got: usize,
    },
    #[error("failed to map memory for '{name}': {errno}")]
    MapFailed { name: String, errno: i64 },
    #[error("failed to unmap memory: {errno}")]
    UnmapFailed { errno: i64 },

    // -- (b) Invalid object --
    #[error("invalid ELF header for '{name}': {reason}")]
    InvalidHeader { name: String, reason: &'static str },
    #[error("'{name}' has no program headers")]
    NoLoadSegments { name: String },
    #[error("'{name}' is missing required dynamic entry '{tag}'")]
    MissingDynamicEntry { name: String, tag: &'static str },
    #[error("'{name}' has a dynamic pointer outside any PT_LOAD segment")]
    PointerOutOfBounds { name: String },

    // -- (c) Missing dependency --
    #[error("could not locate dependency '{name}' under any search path")]
    MissingDependency { name: String },

    // -- (d) Unresolved symbol --
    #[error("unresolved symbol '{symbol}' required by '{source}'")]
    UnresolvedSymbol { symbol: String, source: String },

    // -- (e) Unsupported construct --
    #[error("'{name}' requires unsupported relocation type {reloc_type}")]
    UnsupportedRelocation { name: String, reloc_type: u32 },
    #[error("'{name}' uses text relocations (DF_TEXTREL), which are not supported")]
    TextRelocationsUnsupported { name: String },
    #[error("relocation table for '{name}' has an unexpected entry size {size}")]
    BadRelocationEntrySize { name: String, size: usize },

    // -- (f) Resource exhaustion --
    #[error("object registry is full")]
    RegistryFull,
    #[error("required auxiliary vector entry '{tag}' is missing")]
    MissingAuxVal { tag: &'static str },

    // -- internal bookkeeping --
    #[error("unknown object id {0:?}")]
    InvalidObjectId(ObjectId),
    #[error("failed to enumerate dependencies of '{name}'")]
    DepEnumerationFailed { name: String },
    #[error("dependencies of '{name}' failed to load or relocate")]
    DepsFailed { name: String },
    #[error("'{name}' failed to relocate")]
    RelocationFailed { name: String },
}
