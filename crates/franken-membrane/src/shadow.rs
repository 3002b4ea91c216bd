//! Shadow targets: minimal mirror objects created per (real value, foreign
//! graph) pair.
//!
//! The shadow is the apparent target the proxy layer observes, so the
//! language invariants (non-configurable descriptors, non-extensibility)
//! are pinned onto the shadow without constraining the real value. A shadow
//! has the same structural kind as the real value it mirrors.

use crate::error::MembraneError;
use crate::object_model::{ObjectHandle, ObjectHeap};

/// Create a fresh shadow for `real`: same structural kind, no properties,
/// no prototype yet (the prototype is mirrored lazily by the traps).
pub fn make_shadow_target(
    heap: &mut ObjectHeap,
    real: ObjectHandle,
) -> Result<ObjectHandle, MembraneError> {
    let kind = heap.kind_of(real)?.shadow_kind();
    Ok(heap.alloc(kind, None))
}
