//! Extracting the object-reference graph from stored object state.
//!
//! The pack algorithm itself never interprets a stored object's serialized bytes; it
//! only needs the set of oids that state refers to, so it can compute the transitive
//! live set from the root object. `RefExtractor` is the seam between the two: the
//! embedding object store supplies the codec (pickle, a custom binary format, whatever
//! it persists state as), and `src/pack.rs` calls it once per `(tid, zoid)` row visited
//! while filling `object_ref`.
//!
//! Grounded on `pre_pack(pack_tid, get_references, gc)` in the system this algorithm is
//! modelled on, where `get_references` is an injected callable with exactly this
//! signature and failure mode: a state blob that cannot be decoded aborts the pack
//! rather than being silently treated as having no references (`checkPackBrokenPickle`).

use crate::{Oid, Tid};

/// Decodes stored object state into the oids it refers to.
///
/// An implementation that cannot interpret `state` must return
/// [`crate::error::ErrorKind::CorruptedState`], not an empty reference list: treating an
/// undecodable blob as reference-free would let `pre_pack` silently garbage-collect
/// still-reachable objects.
pub trait RefExtractor: Send + Sync {
    fn extract_refs(&self, tid: Tid, zoid: Oid, state: &[u8]) -> crate::Result<Vec<Oid>>;
}

/// A `RefExtractor` for state encoded as a flat list of little-endian `u64` oids. Useful
/// for tests and for embedders whose object format already stores references this way
/// rather than behind an opaque application codec.
pub struct FlatOidListExtractor;

impl RefExtractor for FlatOidListExtractor {
    fn extract_refs(&self, tid: Tid, zoid: Oid, state: &[u8]) -> crate::Result<Vec<Oid>> {
        if state.len() % 8 != 0 {
            return Err(crate::error::ErrorKind::CorruptedState { tid, zoid }.into());
        }
        Ok(state
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect())
    }
}
