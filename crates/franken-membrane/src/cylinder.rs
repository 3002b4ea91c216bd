//! ProxyCylinder: the per-real-value record.
//!
//! One cylinder binds one real value to its proxy in every graph it crosses
//! into. For each graph it holds either the origin value, a foreign entry
//! (proxy + shadow), a bound value (see `bind_values_by_handlers`), or a
//! dead tombstone, plus the per-graph local machinery: local descriptors,
//! locally-deleted keys, own-keys filter, cached key list, boolean flags,
//! and the argument-truncation limit.
//!
//! Structural invariants enforced here:
//! - exactly one origin entry once the original value is set;
//! - no entry may be mutated once its graph is dead;
//! - removing the origin graph requires every other graph to be dead;
//! - local descriptors and locally-deleted keys stay disjoint (defining a
//!   local descriptor unmasks a deletion of the same key).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::MembraneError;
use crate::object_model::{GraphName, ObjectHandle, PropertyDescriptor, PropertyKey, Value};
use crate::pipeline::TrapName;

/// Flag name: unknown property writes become graph-local.
pub const FLAG_STORE_UNKNOWN_AS_LOCAL: &str = "storeUnknownAsLocal";

/// Flag name: deletes become graph-local.
pub const FLAG_REQUIRE_LOCAL_DELETE: &str = "requireLocalDelete";

/// Flag name for a disabled trap.
pub fn disable_trap_flag(trap: TrapName) -> String {
    format!("disableTrap({trap})")
}

// ---------------------------------------------------------------------------
// ArgLimit
// ---------------------------------------------------------------------------

/// Argument-truncation setting for a function proxy in one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgLimit {
    /// No truncation.
    Unlimited,
    /// Truncate to the function's declared arity.
    DeclaredArity,
    /// Truncate to a fixed count.
    Count(u32),
}

impl ArgLimit {
    /// Resolve to a concrete bound given the function's declared arity.
    pub fn resolve(self, arity: u32) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::DeclaredArity => Some(arity),
            Self::Count(n) => Some(n),
        }
    }
}

// ---------------------------------------------------------------------------
// KeyFilter
// ---------------------------------------------------------------------------

/// Own-keys filter: an allow-list or an arbitrary predicate.
pub enum KeyFilter {
    AllowList(BTreeSet<PropertyKey>),
    Predicate(Rc<dyn Fn(&PropertyKey) -> bool>),
}

impl KeyFilter {
    pub fn allow_list(keys: impl IntoIterator<Item = PropertyKey>) -> Self {
        Self::AllowList(keys.into_iter().collect())
    }

    pub fn accepts(&self, key: &PropertyKey) -> bool {
        match self {
            Self::AllowList(set) => set.contains(key),
            Self::Predicate(f) => f(key),
        }
    }
}

impl Clone for KeyFilter {
    fn clone(&self) -> Self {
        match self {
            Self::AllowList(set) => Self::AllowList(set.clone()),
            Self::Predicate(f) => Self::Predicate(Rc::clone(f)),
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowList(set) => f.debug_tuple("AllowList").field(set).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cached own keys
// ---------------------------------------------------------------------------

/// Snapshot of the exposed key list plus the unfiltered real key set it was
/// computed from; stale once the real key set drifts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedOwnKeys {
    pub keys: Vec<PropertyKey>,
    pub original: BTreeSet<PropertyKey>,
}

// ---------------------------------------------------------------------------
// Per-graph entry
// ---------------------------------------------------------------------------

/// Per-graph local rule state. Exists for the origin graph too: filters and
/// local flags may be installed origin-side.
#[derive(Debug, Clone, Default)]
pub struct LocalState {
    local_descriptors: BTreeMap<PropertyKey, PropertyDescriptor>,
    deleted_locals: BTreeSet<PropertyKey>,
    own_keys_filter: Option<KeyFilter>,
    cached_own_keys: Option<CachedOwnKeys>,
    truncate_arg_list: Option<ArgLimit>,
    flags: BTreeMap<String, bool>,
}

/// What a live graph entry holds.
#[derive(Debug, Clone)]
pub enum EntryState {
    /// The graph that owns the real value.
    Origin { value: Value },
    /// A proxy-mediated crossing into a foreign graph.
    Foreign {
        proxy: ObjectHandle,
        shadow: ObjectHandle,
    },
    /// A direct binding: this graph sees `value` itself, no proxy.
    Bound { value: Value },
}

#[derive(Debug, Clone)]
enum CylinderEntry {
    Live {
        state: EntryState,
        locals: LocalState,
    },
    Dead,
}

// ---------------------------------------------------------------------------
// ProxyCylinder
// ---------------------------------------------------------------------------

/// The spine for one real value: its origin graph plus every graph it has
/// crossed into.
#[derive(Debug, Default)]
pub struct ProxyCylinder {
    origin_graph: Option<GraphName>,
    entries: BTreeMap<GraphName, CylinderEntry>,
}

impl ProxyCylinder {
    pub fn new() -> Self {
        Self::default()
    }

    // -- queries -------------------------------------------------------------

    pub fn original_value_set(&self) -> bool {
        self.origin_graph.is_some()
    }

    pub fn origin_graph(&self) -> Option<&GraphName> {
        self.origin_graph.as_ref()
    }

    pub fn has_graph(&self, graph: &GraphName) -> bool {
        self.entries.contains_key(graph)
    }

    pub fn is_dead(&self, graph: &GraphName) -> bool {
        matches!(self.entries.get(graph), Some(CylinderEntry::Dead))
    }

    /// Every graph with a live entry, origin included.
    pub fn live_graphs(&self) -> Vec<GraphName> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, CylinderEntry::Live { .. }))
            .map(|(g, _)| g.clone())
            .collect()
    }

    /// Live graphs other than the origin graph.
    pub fn foreign_graphs(&self) -> Vec<GraphName> {
        self.live_graphs()
            .into_iter()
            .filter(|g| Some(g) != self.origin_graph.as_ref())
            .collect()
    }

    fn live(&self, graph: &GraphName) -> Result<(&EntryState, &LocalState), MembraneError> {
        match self.entries.get(graph) {
            Some(CylinderEntry::Live { state, locals }) => Ok((state, locals)),
            Some(CylinderEntry::Dead) => Err(MembraneError::DeadGraph {
                graph: graph.clone(),
            }),
            None => Err(MembraneError::UnknownGraph {
                graph: graph.clone(),
            }),
        }
    }

    fn live_mut(
        &mut self,
        graph: &GraphName,
    ) -> Result<(&mut EntryState, &mut LocalState), MembraneError> {
        match self.entries.get_mut(graph) {
            Some(CylinderEntry::Live { state, locals }) => Ok((state, locals)),
            Some(CylinderEntry::Dead) => Err(MembraneError::DeadGraph {
                graph: graph.clone(),
            }),
            None => Err(MembraneError::UnknownGraph {
                graph: graph.clone(),
            }),
        }
    }

    /// The real value, wherever its origin entry lives.
    pub fn get_original(&self) -> Result<Value, MembraneError> {
        let origin = self
            .origin_graph
            .as_ref()
            .ok_or(MembraneError::OriginalNotSet)?;
        match self.live(origin)? {
            (EntryState::Origin { value }, _) => Ok(value.clone()),
            _ => Err(MembraneError::OriginalNotSet),
        }
    }

    /// The value this graph sees: the real value in the origin graph, the
    /// proxy in a foreign graph, the bound value in a bound graph.
    pub fn get_proxy(&self, graph: &GraphName) -> Result<Value, MembraneError> {
        match self.live(graph)? {
            (EntryState::Origin { value }, _) | (EntryState::Bound { value }, _) => {
                Ok(value.clone())
            }
            (EntryState::Foreign { proxy, .. }, _) => Ok(Value::Object(*proxy)),
        }
    }

    /// The shadow target for a foreign graph; no shadow exists in the
    /// origin graph.
    pub fn get_shadow_target(&self, graph: &GraphName) -> Result<ObjectHandle, MembraneError> {
        match self.live(graph)? {
            (EntryState::Foreign { shadow, .. }, _) => Ok(*shadow),
            _ => Err(MembraneError::validation(format!(
                "graph '{graph}' holds no shadow target"
            ))),
        }
    }

    /// Proxy handle for a foreign graph, if one exists.
    pub fn proxy_handle(&self, graph: &GraphName) -> Option<ObjectHandle> {
        match self.entries.get(graph) {
            Some(CylinderEntry::Live {
                state: EntryState::Foreign { proxy, .. },
                ..
            }) => Some(*proxy),
            _ => None,
        }
    }

    /// True iff `handle` is the shadow stored in any live foreign entry.
    pub fn is_shadow_target(&self, handle: ObjectHandle) -> bool {
        self.entries.values().any(|e| {
            matches!(
                e,
                CylinderEntry::Live {
                    state: EntryState::Foreign { shadow, .. },
                    ..
                } if *shadow == handle
            )
        })
    }

    // -- metadata installation ----------------------------------------------

    /// Install the origin entry. A second origin graph is a structural
    /// violation unless `override_existing` replaces the same graph's
    /// entry.
    pub fn set_origin(
        &mut self,
        graph: GraphName,
        value: Value,
        override_existing: bool,
    ) -> Result<(), MembraneError> {
        if let Some(existing) = &self.origin_graph {
            if *existing != graph {
                return Err(MembraneError::invariant(format!(
                    "cylinder already has origin graph '{existing}'"
                )));
            }
            if !override_existing {
                return Err(MembraneError::invariant(format!(
                    "origin entry for graph '{graph}' already set"
                )));
            }
        }
        if self.is_dead(&graph) {
            return Err(MembraneError::DeadGraph { graph });
        }
        let locals = match self.entries.remove(&graph) {
            Some(CylinderEntry::Live { locals, .. }) => locals,
            _ => LocalState::default(),
        };
        self.entries.insert(
            graph.clone(),
            CylinderEntry::Live {
                state: EntryState::Origin { value },
                locals,
            },
        );
        self.origin_graph = Some(graph);
        Ok(())
    }

    /// Install a foreign entry (proxy + shadow). With `override_existing`
    /// the entry state is swapped while the graph's local rules persist.
    pub fn set_foreign(
        &mut self,
        graph: GraphName,
        proxy: ObjectHandle,
        shadow: ObjectHandle,
        override_existing: bool,
    ) -> Result<(), MembraneError> {
        if Some(&graph) == self.origin_graph.as_ref() {
            return Err(MembraneError::invariant(format!(
                "graph '{graph}' is the origin graph; foreign entry rejected"
            )));
        }
        if self.is_dead(&graph) {
            return Err(MembraneError::DeadGraph { graph });
        }
        if !override_existing
            && matches!(self.entries.get(&graph), Some(CylinderEntry::Live { .. }))
        {
            return Err(MembraneError::invariant(format!(
                "graph '{graph}' already has a live entry"
            )));
        }
        let locals = match self.entries.remove(&graph) {
            Some(CylinderEntry::Live { locals, .. }) => locals,
            _ => LocalState::default(),
        };
        self.entries.insert(
            graph,
            CylinderEntry::Live {
                state: EntryState::Foreign { proxy, shadow },
                locals,
            },
        );
        Ok(())
    }

    /// Install a bound entry: this graph sees `value` directly.
    pub fn set_bound(
        &mut self,
        graph: GraphName,
        value: Value,
        override_existing: bool,
    ) -> Result<(), MembraneError> {
        if Some(&graph) == self.origin_graph.as_ref() {
            return Err(MembraneError::invariant(format!(
                "graph '{graph}' is the origin graph; bound entry rejected"
            )));
        }
        if self.is_dead(&graph) {
            return Err(MembraneError::DeadGraph { graph });
        }
        if !override_existing
            && matches!(self.entries.get(&graph), Some(CylinderEntry::Live { .. }))
        {
            return Err(MembraneError::invariant(format!(
                "graph '{graph}' already has a live entry"
            )));
        }
        let locals = match self.entries.remove(&graph) {
            Some(CylinderEntry::Live { locals, .. }) => locals,
            _ => LocalState::default(),
        };
        self.entries.insert(
            graph,
            CylinderEntry::Live {
                state: EntryState::Bound { value },
                locals,
            },
        );
        Ok(())
    }

    // -- death ---------------------------------------------------------------

    /// Foreign proxy/shadow handles for a graph, if it is live and foreign.
    pub fn foreign_handles(&self, graph: &GraphName) -> Option<(ObjectHandle, ObjectHandle)> {
        match self.entries.get(graph) {
            Some(CylinderEntry::Live {
                state: EntryState::Foreign { proxy, shadow },
                ..
            }) => Some((*proxy, *shadow)),
            _ => None,
        }
    }

    /// Mark a graph dead. Removing the origin graph requires every other
    /// graph to be dead already.
    pub fn remove_graph(&mut self, graph: &GraphName) -> Result<(), MembraneError> {
        if !self.entries.contains_key(graph) {
            return Err(MembraneError::UnknownGraph {
                graph: graph.clone(),
            });
        }
        if Some(graph) == self.origin_graph.as_ref() {
            let survivor = self
                .entries
                .iter()
                .find(|(g, e)| *g != graph && matches!(e, CylinderEntry::Live { .. }));
            if let Some((g, _)) = survivor {
                return Err(MembraneError::invariant(format!(
                    "cannot remove origin graph while graph '{g}' is live"
                )));
            }
        }
        self.entries.insert(graph.clone(), CylinderEntry::Dead);
        Ok(())
    }

    /// Mark every entry dead, foreign graphs first, then the origin.
    /// Returns each formerly-live graph with its foreign handles (if any)
    /// so the caller can tombstone map entries and revoke proxies.
    pub fn mark_all_dead(&mut self) -> Vec<(GraphName, Option<(ObjectHandle, ObjectHandle)>)> {
        let mut order: Vec<GraphName> = self.foreign_graphs();
        if let Some(origin) = &self.origin_graph {
            if matches!(self.entries.get(origin), Some(CylinderEntry::Live { .. })) {
                order.push(origin.clone());
            }
        }
        let mut removed = Vec::new();
        for graph in order {
            let handles = self.foreign_handles(&graph);
            self.entries.insert(graph.clone(), CylinderEntry::Dead);
            removed.push((graph, handles));
        }
        removed
    }

    // -- local descriptors ----------------------------------------------------

    pub fn get_local_descriptor(
        &self,
        graph: &GraphName,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.local_descriptors.get(key).cloned())
    }

    /// Install a local descriptor; unmasks any local deletion of `key`.
    pub fn set_local_descriptor(
        &mut self,
        graph: &GraphName,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.deleted_locals.remove(&key);
        locals.local_descriptors.insert(key, desc);
        locals.cached_own_keys = None;
        Ok(())
    }

    /// Drop the local descriptor for `key`; with `record_local_delete`, the
    /// key joins the locally-deleted set.
    pub fn delete_local_descriptor(
        &mut self,
        graph: &GraphName,
        key: &PropertyKey,
        record_local_delete: bool,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.local_descriptors.remove(key);
        if record_local_delete {
            locals.deleted_locals.insert(key.clone());
        }
        locals.cached_own_keys = None;
        Ok(())
    }

    /// Copy this graph's locally-deleted keys into `out`.
    pub fn append_deleted_names(
        &self,
        graph: &GraphName,
        out: &mut BTreeSet<PropertyKey>,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live(graph)?;
        out.extend(locals.deleted_locals.iter().cloned());
        Ok(())
    }

    pub fn was_deleted_locally(
        &self,
        graph: &GraphName,
        key: &PropertyKey,
    ) -> Result<bool, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.deleted_locals.contains(key))
    }

    pub fn unmask_deletion(
        &mut self,
        graph: &GraphName,
        key: &PropertyKey,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.deleted_locals.remove(key);
        Ok(())
    }

    /// Keys of this graph's local descriptors, in canonical key order.
    pub fn local_own_keys(&self, graph: &GraphName) -> Result<Vec<PropertyKey>, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.local_descriptors.keys().cloned().collect())
    }

    // -- flags ----------------------------------------------------------------

    pub fn get_local_flag(&self, graph: &GraphName, name: &str) -> Result<bool, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.flags.get(name).copied().unwrap_or(false))
    }

    pub fn set_local_flag(
        &mut self,
        graph: &GraphName,
        name: &str,
        value: bool,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.flags.insert(name.to_string(), value);
        Ok(())
    }

    // -- own-keys filter -------------------------------------------------------

    pub fn get_own_keys_filter(
        &self,
        graph: &GraphName,
    ) -> Result<Option<KeyFilter>, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.own_keys_filter.clone())
    }

    /// Install or clear (with `None`) the own-keys filter.
    pub fn set_own_keys_filter(
        &mut self,
        graph: &GraphName,
        filter: Option<KeyFilter>,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.own_keys_filter = filter;
        locals.cached_own_keys = None;
        Ok(())
    }

    // -- cached own keys -------------------------------------------------------

    pub fn cached_own_keys(
        &self,
        graph: &GraphName,
    ) -> Result<Option<CachedOwnKeys>, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.cached_own_keys.clone())
    }

    pub fn set_cached_own_keys(
        &mut self,
        graph: &GraphName,
        keys: Vec<PropertyKey>,
        original: BTreeSet<PropertyKey>,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.cached_own_keys = Some(CachedOwnKeys { keys, original });
        Ok(())
    }

    pub fn invalidate_cached_keys(&mut self, graph: &GraphName) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.cached_own_keys = None;
        Ok(())
    }

    /// Drop every graph's key cache, as after a mutation observed through
    /// own-keys reconciliation.
    pub fn invalidate_all_cached_keys(&mut self) {
        for entry in self.entries.values_mut() {
            if let CylinderEntry::Live { locals, .. } = entry {
                locals.cached_own_keys = None;
            }
        }
    }

    // -- argument truncation ---------------------------------------------------

    pub fn get_truncate_arg_list(
        &self,
        graph: &GraphName,
    ) -> Result<Option<ArgLimit>, MembraneError> {
        let (_, locals) = self.live(graph)?;
        Ok(locals.truncate_arg_list)
    }

    pub fn set_truncate_arg_list(
        &mut self,
        graph: &GraphName,
        limit: Option<ArgLimit>,
    ) -> Result<(), MembraneError> {
        let (_, locals) = self.live_mut(graph)?;
        locals.truncate_arg_list = limit;
        Ok(())
    }
}
