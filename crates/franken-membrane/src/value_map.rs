//! Membrane value map: any known object reference (real, proxy, or shadow)
//! resolves to its cylinder.
//!
//! Primitives never wrap, so only object handles are keyed. Entries are
//! individually revocable: a key may transition to `Dead` at any time, but a
//! live key may never be rebound to a different cylinder.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::cylinder::ProxyCylinder;
use crate::error::MembraneError;
use crate::object_model::ObjectHandle;

pub type CylinderRef = Rc<RefCell<ProxyCylinder>>;

#[derive(Clone)]
enum MapEntry {
    Live(CylinderRef),
    Dead,
}

/// Reference → cylinder mapping for one membrane.
#[derive(Default)]
pub struct MembraneValueMap {
    entries: BTreeMap<ObjectHandle, MapEntry>,
}

impl MembraneValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, handle: ObjectHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn is_dead(&self, handle: ObjectHandle) -> bool {
        matches!(self.entries.get(&handle), Some(MapEntry::Dead))
    }

    /// The cylinder for a live key.
    pub fn cylinder(&self, handle: ObjectHandle) -> Option<CylinderRef> {
        match self.entries.get(&handle) {
            Some(MapEntry::Live(c)) => Some(Rc::clone(c)),
            _ => None,
        }
    }

    /// Bind `handle` to `cylinder`. Rebinding a live key to a different
    /// cylinder is an engine invariant violation; rebinding to the same
    /// cylinder is a no-op, and a dead key may be rebound (rebuild).
    pub fn set(
        &mut self,
        handle: ObjectHandle,
        cylinder: CylinderRef,
    ) -> Result<(), MembraneError> {
        match self.entries.get(&handle) {
            Some(MapEntry::Live(existing)) if !Rc::ptr_eq(existing, &cylinder) => {
                Err(MembraneError::invariant(format!(
                    "{handle} is already bound to a different cylinder"
                )))
            }
            _ => {
                self.entries.insert(handle, MapEntry::Live(cylinder));
                Ok(())
            }
        }
    }

    /// Tombstone a key. Setting `Dead` is always permitted.
    pub fn kill(&mut self, handle: ObjectHandle) {
        self.entries.insert(handle, MapEntry::Dead);
    }

    /// Every distinct live cylinder, for whole-membrane sweeps.
    pub fn live_cylinders(&self) -> Vec<CylinderRef> {
        let mut seen: Vec<CylinderRef> = Vec::new();
        for entry in self.entries.values() {
            if let MapEntry::Live(c) = entry {
                if !seen.iter().any(|s| Rc::ptr_eq(s, c)) {
                    seen.push(Rc::clone(c));
                }
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
