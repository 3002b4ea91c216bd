//! Membrane façade.
//!
//! Owns the object heap, the graph-handler registry, the value→cylinder
//! map, chain handlers, function listeners, the pass-through filter, and
//! the warn-once set. The central operation is
//! [`Membrane::convert_argument_to_proxy`]: expose a value owned by one
//! graph to another graph as an interposed proxy, creating the cylinder and
//! shadow on first crossing.
//!
//! The membrane is also the meta-object surface of the mediated world:
//! `get`/`set`/`has`/`own_keys`/... route to ordinary-object algorithms for
//! plain heap objects and to the graph handler's traps for proxies.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::cylinder::ProxyCylinder;
use crate::error::MembraneError;
use crate::events::{
    FunctionEvent, FunctionListener, LogLevel, LogRecord, MembraneLogger, TrapPhase,
    TrapTraceEvent,
};
use crate::handler::ObjectGraphHandler;
use crate::object_model::{
    GraphName, ObjectHandle, ObjectHeap, ObjectKind, PropertyDescriptor, PropertyKey, Value,
    MAX_PROTOTYPE_CHAIN_DEPTH,
};
use crate::pipeline::{ChainHandler, HandlerPipeline, PipelineNode, TrapName};
use crate::primordials;
use crate::value_map::{CylinderRef, MembraneValueMap};

/// Synthetic read-only property exposing a proxy's graph name when
/// `show_graph_name` is enabled.
pub const GRAPH_NAME_SENTINEL: &str = "membraneGraphName";

/// Pass-through predicate: `true` means the value crosses unwrapped.
pub type PassThroughFilter = Rc<dyn Fn(&Value) -> bool>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which graph-owner code path serves traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphDispatch {
    /// Minimal pipeline: terminal handler only.
    Legacy,
    /// Full staged pipeline.
    Pipeline,
}

/// Construction options for [`Membrane::new`].
#[derive(Default)]
pub struct MembraneConfig {
    /// Global pass-through filter; accepted values cross unwrapped.
    pub pass_through_filter: Option<PassThroughFilter>,
    /// Expose the `membraneGraphName` sentinel on every proxy.
    pub show_graph_name: bool,
    /// Structured log sink.
    pub logger: Option<Rc<dyn MembraneLogger>>,
    /// Compatibility tag: `"0.10"` selects the pipeline-style graph owner,
    /// anything else the legacy one.
    pub refactor: Option<String>,
}

impl std::fmt::Debug for MembraneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembraneConfig")
            .field("pass_through_filter", &self.pass_through_filter.is_some())
            .field("show_graph_name", &self.show_graph_name)
            .field("logger", &self.logger.is_some())
            .field("refactor", &self.refactor)
            .finish()
    }
}

/// Options for [`Membrane::convert_argument_to_proxy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// Self-destruct any existing cylinder for the value first.
    pub override_existing: bool,
}

// ---------------------------------------------------------------------------
// Membrane
// ---------------------------------------------------------------------------

pub struct Membrane {
    heap: ObjectHeap,
    map: MembraneValueMap,
    graphs: std::collections::BTreeMap<GraphName, ObjectGraphHandler>,
    chain_handlers: Vec<ChainHandler>,
    function_listeners: Vec<Rc<dyn FunctionListener>>,
    pass_through: Option<PassThroughFilter>,
    show_graph_name: bool,
    dispatch: GraphDispatch,
    logger: Option<Rc<dyn MembraneLogger>>,
    warned: BTreeSet<String>,
    trap_trace: Vec<TrapTraceEvent>,
    primordials: Vec<Value>,
}

impl Membrane {
    pub fn new(config: MembraneConfig) -> Self {
        let dispatch = match config.refactor.as_deref() {
            Some("0.10") => GraphDispatch::Pipeline,
            _ => GraphDispatch::Legacy,
        };
        let mut heap = ObjectHeap::new();
        let primordials = primordials::install(&mut heap);
        Self {
            heap,
            map: MembraneValueMap::new(),
            graphs: std::collections::BTreeMap::new(),
            chain_handlers: Vec::new(),
            function_listeners: Vec::new(),
            pass_through: config.pass_through_filter,
            show_graph_name: config.show_graph_name,
            dispatch,
            logger: config.logger,
            warned: BTreeSet::new(),
            trap_trace: Vec::new(),
            primordials,
        }
    }

    // -- heap ------------------------------------------------------------------

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ObjectHeap {
        &mut self.heap
    }

    pub fn show_graph_name(&self) -> bool {
        self.show_graph_name
    }

    pub fn dispatch(&self) -> GraphDispatch {
        self.dispatch
    }

    /// Frozen primordial constructors and prototypes, read-only.
    pub fn primordials(&self) -> &[Value] {
        &self.primordials
    }

    // -- logging ---------------------------------------------------------------

    pub(crate) fn log(&self, level: LogLevel, component: &str, event: &str, detail: String) {
        if let Some(logger) = &self.logger {
            logger.log(LogRecord::new(level, component, event, detail));
        }
    }

    /// Log a warning at most once per distinct message.
    pub fn warn_once(&mut self, message: &str) {
        if self.warned.insert(message.to_string()) {
            self.log(LogLevel::Warn, "membrane", "warn_once", message.to_string());
        }
    }

    pub(crate) fn push_trace(&mut self, event: TrapTraceEvent) {
        self.trap_trace.push(event);
    }

    /// Trap-trace records appended by graphs with tracing enabled.
    pub fn trace_events(&self) -> &[TrapTraceEvent] {
        &self.trap_trace
    }

    pub fn drain_trace_events(&mut self) -> Vec<TrapTraceEvent> {
        std::mem::take(&mut self.trap_trace)
    }

    pub(crate) fn tracing_enabled(&self, graph: &GraphName) -> bool {
        self.graphs
            .get(graph)
            .map(|h| h.pipeline.has_tracing())
            .unwrap_or(false)
    }

    pub(crate) fn trace_enter(&mut self, graph: &GraphName, trap: TrapName) {
        if self.tracing_enabled(graph) {
            self.push_trace(TrapTraceEvent {
                graph: graph.clone(),
                trap,
                phase: TrapPhase::Enter,
                outcome: String::new(),
            });
        }
    }

    pub(crate) fn trace_exit(&mut self, graph: &GraphName, trap: TrapName, outcome: String) {
        if self.tracing_enabled(graph) {
            self.push_trace(TrapTraceEvent {
                graph: graph.clone(),
                trap,
                phase: TrapPhase::Exit,
                outcome,
            });
        }
    }

    // -- graph registry --------------------------------------------------------

    /// Register a new graph. Re-registering is a `DuplicateGraph` failure.
    pub fn add_graph(&mut self, graph: GraphName) -> Result<(), MembraneError> {
        if self.graphs.contains_key(&graph) {
            return Err(MembraneError::DuplicateGraph { graph });
        }
        let pipeline = match self.dispatch {
            GraphDispatch::Pipeline => HandlerPipeline::standard(),
            GraphDispatch::Legacy => HandlerPipeline::legacy(),
        };
        self.graphs
            .insert(graph.clone(), ObjectGraphHandler::new(graph, pipeline));
        Ok(())
    }

    /// Look up a graph, creating it when `must_create` is set.
    pub fn get_handler_by_name(
        &mut self,
        graph: &GraphName,
        must_create: bool,
    ) -> Result<GraphName, MembraneError> {
        if !self.graphs.contains_key(graph) {
            if !must_create {
                return Err(MembraneError::UnknownGraph {
                    graph: graph.clone(),
                });
            }
            self.add_graph(graph.clone())?;
        }
        Ok(graph.clone())
    }

    pub fn has_graph(&self, graph: &GraphName) -> bool {
        self.graphs.contains_key(graph)
    }

    pub fn graph_names(&self) -> Vec<GraphName> {
        self.graphs.keys().cloned().collect()
    }

    pub(crate) fn handler(&self, graph: &GraphName) -> Result<&ObjectGraphHandler, MembraneError> {
        self.graphs
            .get(graph)
            .ok_or_else(|| MembraneError::UnknownGraph {
                graph: graph.clone(),
            })
    }

    pub(crate) fn handler_mut(
        &mut self,
        graph: &GraphName,
    ) -> Result<&mut ObjectGraphHandler, MembraneError> {
        self.graphs
            .get_mut(graph)
            .ok_or_else(|| MembraneError::UnknownGraph {
                graph: graph.clone(),
            })
    }

    /// Per-graph pass-through filter; both sides must accept for a value to
    /// cross unwrapped.
    pub fn set_graph_pass_through(
        &mut self,
        graph: &GraphName,
        filter: Option<PassThroughFilter>,
    ) -> Result<(), MembraneError> {
        self.handler_mut(graph)?.pass_through = filter;
        Ok(())
    }

    /// Enable the tracing pipeline stage for a graph.
    pub fn enable_tracing(&mut self, graph: &GraphName) -> Result<(), MembraneError> {
        self.handler_mut(graph)?.pipeline.enable_tracing();
        Ok(())
    }

    /// Insert an application node into a graph's pipeline after the named
    /// lead node.
    pub fn insert_pipeline_handler(
        &mut self,
        graph: &GraphName,
        lead_name: &str,
        node: PipelineNode,
    ) -> Result<(), MembraneError> {
        self.handler_mut(graph)?.pipeline.insert_handler(lead_name, node)
    }

    // -- chain handler registry ------------------------------------------------

    pub(crate) fn push_chain_handler(&mut self, chain: ChainHandler) -> crate::object_model::ChainHandlerId {
        let id = crate::object_model::ChainHandlerId(self.chain_handlers.len() as u32);
        self.chain_handlers.push(chain);
        id
    }

    pub fn chain_handler(
        &self,
        id: crate::object_model::ChainHandlerId,
    ) -> Option<&ChainHandler> {
        self.chain_handlers.get(id.0 as usize)
    }

    pub fn chain_handler_mut(
        &mut self,
        id: crate::object_model::ChainHandlerId,
    ) -> Option<&mut ChainHandler> {
        self.chain_handlers.get_mut(id.0 as usize)
    }

    // -- value map -------------------------------------------------------------

    pub(crate) fn cylinder_for(&self, handle: ObjectHandle) -> Option<CylinderRef> {
        self.map.cylinder(handle)
    }

    pub(crate) fn map_is_dead(&self, handle: ObjectHandle) -> bool {
        self.map.is_dead(handle)
    }

    pub(crate) fn map_set(
        &mut self,
        handle: ObjectHandle,
        cylinder: CylinderRef,
    ) -> Result<(), MembraneError> {
        self.map.set(handle, cylinder)
    }

    pub(crate) fn map_kill(&mut self, handle: ObjectHandle) {
        self.map.kill(handle);
    }

    pub fn has_proxy_for_value(&self, graph: &GraphName, value: &Value) -> bool {
        let Some(handle) = value.as_object() else {
            return false;
        };
        match self.map.cylinder(handle) {
            Some(cyl) => {
                let cyl = cyl.borrow();
                cyl.has_graph(graph) && !cyl.is_dead(graph)
            }
            None => false,
        }
    }

    /// The original value behind any known reference.
    pub fn get_membrane_value(
        &self,
        graph: &GraphName,
        value: &Value,
    ) -> Result<Option<Value>, MembraneError> {
        if !self.has_graph(graph) {
            return Err(MembraneError::UnknownGraph {
                graph: graph.clone(),
            });
        }
        let Some(handle) = value.as_object() else {
            return Ok(None);
        };
        match self.map.cylinder(handle) {
            Some(cyl) => Ok(Some(cyl.borrow().get_original()?)),
            None => Ok(None),
        }
    }

    /// The proxy (or origin value) a known reference resolves to in `graph`.
    pub fn get_membrane_proxy(
        &self,
        graph: &GraphName,
        value: &Value,
    ) -> Result<Option<Value>, MembraneError> {
        if !self.has_graph(graph) {
            return Err(MembraneError::UnknownGraph {
                graph: graph.clone(),
            });
        }
        let Some(handle) = value.as_object() else {
            return Ok(None);
        };
        match self.map.cylinder(handle) {
            Some(cyl) => {
                let cyl = cyl.borrow();
                if cyl.has_graph(graph) && !cyl.is_dead(graph) {
                    Ok(Some(cyl.get_proxy(graph)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    // -- cylinder construction -------------------------------------------------

    /// Cylinder for `value` with `graph` as origin, creating one if absent.
    pub(crate) fn ensure_origin_cylinder(
        &mut self,
        graph: &GraphName,
        value: &Value,
    ) -> Result<CylinderRef, MembraneError> {
        let handle = value.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        if let Some(existing) = self.map.cylinder(handle) {
            return Ok(existing);
        }
        let cylinder: CylinderRef = Rc::new(RefCell::new(ProxyCylinder::new()));
        cylinder
            .borrow_mut()
            .set_origin(graph.clone(), value.clone(), false)?;
        self.map.set(handle, Rc::clone(&cylinder))?;
        Ok(cylinder)
    }

    // -- pass-through ----------------------------------------------------------

    fn passes_through(&self, origin: &GraphName, target: &GraphName, value: &Value) -> bool {
        if let Some(global) = &self.pass_through {
            if global(value) {
                return true;
            }
        }
        let origin_ok = self
            .graphs
            .get(origin)
            .and_then(|h| h.pass_through.as_ref())
            .map(|f| f(value));
        let target_ok = self
            .graphs
            .get(target)
            .and_then(|h| h.pass_through.as_ref())
            .map(|f| f(value));
        matches!((origin_ok, target_ok), (Some(true), Some(true)))
    }

    // -- the central wrap operation --------------------------------------------

    /// Expose `arg` (owned by `origin`) to `target` as a proxy, creating
    /// the cylinder and target mapping on first crossing. Primitives and
    /// pass-through values return unchanged.
    pub fn convert_argument_to_proxy(
        &mut self,
        origin: &GraphName,
        target: &GraphName,
        arg: Value,
        options: ConvertOptions,
    ) -> Result<Value, MembraneError> {
        for graph in [origin, target] {
            let handler = self.handler(graph)?;
            if handler.revoked {
                return Err(MembraneError::Revoked);
            }
        }
        let handle = match arg.as_object() {
            Some(h) => h,
            None => return Ok(arg),
        };
        if self.passes_through(origin, target, &arg) {
            return Ok(arg);
        }

        if options.override_existing {
            if let Some(cyl) = self.map.cylinder(handle) {
                self.self_destruct_cylinder(&cyl);
            }
        }

        let cylinder = match self.map.cylinder(handle) {
            Some(cyl) => {
                {
                    let borrowed = cyl.borrow();
                    if borrowed.is_dead(origin) {
                        return Err(MembraneError::Revoked);
                    }
                    let seen_here = borrowed.get_proxy(origin)?;
                    if seen_here != arg {
                        return Err(MembraneError::ownership(format!(
                            "value is not what graph '{origin}' sees for this cylinder"
                        )));
                    }
                    if borrowed.has_graph(target) {
                        if borrowed.is_dead(target) {
                            return Err(MembraneError::Revoked);
                        }
                        return borrowed.get_proxy(target);
                    }
                }
                cyl
            }
            None => self.ensure_origin_cylinder(origin, &arg)?,
        };

        {
            let borrowed = cylinder.borrow();
            if borrowed.origin_graph() == Some(target) {
                return borrowed.get_original();
            }
        }

        self.build_mapping(target, &cylinder)
    }

    /// Create the shadow and revocable proxy binding `cylinder`'s real
    /// value into `target`, register both in the value map, propagate
    /// non-extensibility, and notify proxy listeners (origin handler first,
    /// then target).
    pub(crate) fn build_mapping(
        &mut self,
        target: &GraphName,
        cylinder: &CylinderRef,
    ) -> Result<Value, MembraneError> {
        let (origin, real) = {
            let borrowed = cylinder.borrow();
            let origin = borrowed
                .origin_graph()
                .cloned()
                .ok_or(MembraneError::OriginalNotSet)?;
            (origin, borrowed.get_original()?)
        };
        let real_h = real.as_object().ok_or(MembraneError::PrimitiveWrap)?;

        let shadow = crate::shadow::make_shadow_target(&mut self.heap, real_h)?;
        let proxy_h = self.heap.alloc_proxy(target.clone(), None);
        cylinder
            .borrow_mut()
            .set_foreign(target.clone(), proxy_h, shadow, false)?;
        self.map.set(proxy_h, Rc::clone(cylinder))?;
        self.map.set(shadow, Rc::clone(cylinder))?;

        if !self.heap.ordinary(real_h)?.extensible {
            self.lock_shadow_for(target, cylinder)?;
        }

        let proxy = self.notify_proxy_listeners(&origin, target, cylinder, real, proxy_h)?;
        Ok(proxy)
    }

    // -- descriptor wrapping -----------------------------------------------------

    /// Rewrite a descriptor so its value/getter/setter slots live in
    /// `target` space. Primitive data descriptors cross intact; flags are
    /// plain booleans by construction.
    pub fn wrap_descriptor(
        &mut self,
        origin: &GraphName,
        target: &GraphName,
        desc: &PropertyDescriptor,
    ) -> Result<PropertyDescriptor, MembraneError> {
        match desc {
            PropertyDescriptor::Data {
                value,
                writable,
                enumerable,
                configurable,
            } => {
                let wrapped = if value.is_primitive() {
                    value.clone()
                } else {
                    self.convert_argument_to_proxy(
                        origin,
                        target,
                        value.clone(),
                        ConvertOptions::default(),
                    )?
                };
                Ok(PropertyDescriptor::Data {
                    value: wrapped,
                    writable: *writable,
                    enumerable: *enumerable,
                    configurable: *configurable,
                })
            }
            PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            } => {
                let wrap_fn = |m: &mut Self, f: &Option<ObjectHandle>| -> Result<
                    Option<ObjectHandle>,
                    MembraneError,
                > {
                    match f {
                        None => Ok(None),
                        Some(h) => {
                            let wrapped = m.convert_argument_to_proxy(
                                origin,
                                target,
                                Value::Object(*h),
                                ConvertOptions::default(),
                            )?;
                            wrapped
                                .as_object()
                                .map(Some)
                                .ok_or_else(|| {
                                    MembraneError::type_error(
                                        "accessor wrapped to a non-object",
                                    )
                                })
                        }
                    }
                };
                let get = wrap_fn(self, get)?;
                let set = wrap_fn(self, set)?;
                Ok(PropertyDescriptor::Accessor {
                    get,
                    set,
                    enumerable: *enumerable,
                    configurable: *configurable,
                })
            }
        }
    }

    // -- binding two real values --------------------------------------------------

    /// Bind two real values such that each is the other's proxy in the
    /// opposite graph. Fails atomically: no state changes unless every
    /// check passes.
    pub fn bind_values_by_handlers(
        &mut self,
        graph0: &GraphName,
        value0: Value,
        graph1: &GraphName,
        value1: Value,
    ) -> Result<(), MembraneError> {
        self.handler(graph0)?;
        self.handler(graph1)?;
        if value0.is_primitive() && value1.is_primitive() {
            return Err(MembraneError::PrimitiveWrap);
        }
        if graph0 == graph1 && value0 != value1 {
            return Err(MembraneError::validation(
                "cannot bind two different values in the same graph",
            ));
        }

        let cyl0 = value0.as_object().and_then(|h| self.map.cylinder(h));
        let cyl1 = value1.as_object().and_then(|h| self.map.cylinder(h));

        // Conflict checks before any mutation.
        if let Some(c) = &cyl0 {
            let c = c.borrow();
            if c.has_graph(graph1) && !c.is_dead(graph1) && c.get_proxy(graph1)? != value1 {
                return Err(MembraneError::rule_conflict(format!(
                    "value is already bound in graph '{graph1}' to a different partner"
                )));
            }
            if c.has_graph(graph0) && !c.is_dead(graph0) && c.get_proxy(graph0)? != value0 {
                return Err(MembraneError::ownership(format!(
                    "value does not belong to graph '{graph0}'"
                )));
            }
        }
        if let Some(c) = &cyl1 {
            let c = c.borrow();
            if c.has_graph(graph0) && !c.is_dead(graph0) && c.get_proxy(graph0)? != value0 {
                return Err(MembraneError::rule_conflict(format!(
                    "value is already bound in graph '{graph0}' to a different partner"
                )));
            }
            if c.has_graph(graph1) && !c.is_dead(graph1) && c.get_proxy(graph1)? != value1 {
                return Err(MembraneError::ownership(format!(
                    "value does not belong to graph '{graph1}'"
                )));
            }
        }
        if let (Some(c0), Some(c1)) = (&cyl0, &cyl1) {
            if !Rc::ptr_eq(c0, c1) {
                return Err(MembraneError::rule_conflict(
                    "both values already belong to distinct cylinders",
                ));
            }
        }

        let cylinder = match (&cyl0, &cyl1) {
            (Some(c), _) | (None, Some(c)) => Rc::clone(c),
            (None, None) => Rc::new(RefCell::new(ProxyCylinder::new())),
        };

        // Pick the origin side: an object value whose graph hosts it.
        let (origin_graph, origin_value, other_graph, other_value) = if value0.is_object() {
            (graph0, &value0, graph1, &value1)
        } else {
            (graph1, &value1, graph0, &value0)
        };

        {
            let mut c = cylinder.borrow_mut();
            if !c.original_value_set() {
                c.set_origin(origin_graph.clone(), origin_value.clone(), false)?;
            }
            if graph0 != graph1 && !c.has_graph(other_graph) {
                c.set_bound(other_graph.clone(), other_value.clone(), false)?;
            }
        }

        for v in [&value0, &value1] {
            if let Some(h) = v.as_object() {
                self.map.set(h, Rc::clone(&cylinder))?;
            }
        }
        Ok(())
    }

    // -- revocation ----------------------------------------------------------------

    /// Delete a cylinder from the membrane without invoking proxy
    /// revocation: entries die, map keys tombstone, proxies dangle until
    /// resolved (and then fail as revoked).
    pub(crate) fn self_destruct_cylinder(&mut self, cylinder: &CylinderRef) {
        let bound_keys = self.cylinder_object_keys(cylinder);
        let removed = cylinder.borrow_mut().mark_all_dead();
        for (_, handles) in removed {
            if let Some((proxy, shadow)) = handles {
                self.map.kill(proxy);
                self.map.kill(shadow);
            }
        }
        for key in bound_keys {
            self.map.kill(key);
        }
    }

    /// Kill a cylinder: mark every entry dead, revoke each foreign proxy,
    /// and tombstone every map key. The cylinder is terminal afterwards.
    pub(crate) fn revoke_cylinder(&mut self, cylinder: &CylinderRef) {
        let bound_keys = self.cylinder_object_keys(cylinder);
        let removed = cylinder.borrow_mut().mark_all_dead();
        for (_, handles) in removed {
            if let Some((proxy, shadow)) = handles {
                if let Ok(state) = self.heap.proxy_state_mut(proxy) {
                    state.revoked = true;
                }
                self.map.kill(proxy);
                self.map.kill(shadow);
            }
        }
        for key in bound_keys {
            self.map.kill(key);
        }
    }

    /// Object handles of the real value and any bound values, while the
    /// cylinder is still live.
    fn cylinder_object_keys(&self, cylinder: &CylinderRef) -> Vec<ObjectHandle> {
        let c = cylinder.borrow();
        let mut keys = Vec::new();
        for graph in c.live_graphs() {
            if let Ok(seen) = c.get_proxy(&graph) {
                if let Some(h) = seen.as_object() {
                    if c.foreign_handles(&graph).is_none() && !keys.contains(&h) {
                        keys.push(h);
                    }
                }
            }
        }
        keys
    }

    /// Mark one value's cylinder dead. The real value keeps its identity;
    /// only the proxies die.
    pub fn revoke_mapping(&mut self, value: &Value) -> Result<(), MembraneError> {
        let handle = value.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        let cylinder = self
            .map
            .cylinder(handle)
            .ok_or_else(|| MembraneError::validation("value is not known to this membrane"))?;
        self.revoke_cylinder(&cylinder);
        Ok(())
    }

    /// Terminate every proxy in a graph. Cylinders whose origin lives in
    /// this graph die entirely; foreign entries in this graph die alone.
    pub fn revoke_everything(&mut self, graph: &GraphName) -> Result<(), MembraneError> {
        self.handler_mut(graph)?.revoked = true;
        let cylinders = self.map.live_cylinders();
        for cylinder in cylinders {
            let (is_origin, has_graph, handles) = {
                let c = cylinder.borrow();
                (
                    c.origin_graph() == Some(graph),
                    c.has_graph(graph) && !c.is_dead(graph),
                    c.foreign_handles(graph),
                )
            };
            if !has_graph {
                continue;
            }
            if is_origin {
                self.revoke_cylinder(&cylinder);
            } else {
                if let Some((proxy, shadow)) = handles {
                    if let Ok(state) = self.heap.proxy_state_mut(proxy) {
                        state.revoked = true;
                    }
                    self.map.kill(proxy);
                    self.map.kill(shadow);
                }
                cylinder.borrow_mut().remove_graph(graph)?;
            }
        }
        Ok(())
    }

    // -- function listeners ----------------------------------------------------------

    pub fn add_function_listener(&mut self, listener: Rc<dyn FunctionListener>) {
        self.function_listeners.push(listener);
    }

    pub fn remove_function_listener(&mut self, listener: &Rc<dyn FunctionListener>) {
        self.function_listeners
            .retain(|l| !Rc::ptr_eq(l, listener));
    }

    /// Deliver a function event to a snapshot of the listener list; errors
    /// from listeners are logged and swallowed.
    pub(crate) fn fire_function_event(&mut self, event: &FunctionEvent) {
        let snapshot: Vec<Rc<dyn FunctionListener>> = self.function_listeners.clone();
        for listener in snapshot {
            if let Err(error) = listener.on_call(event) {
                self.log(
                    LogLevel::Error,
                    "membrane",
                    "function_listener_error",
                    error.to_string(),
                );
            }
        }
    }

    // =======================================================================
    // Meta-object operations: route to ordinary algorithms or proxy traps
    // =======================================================================

    fn require_object(&self, target: &Value) -> Result<ObjectHandle, MembraneError> {
        target.as_object().ok_or_else(|| {
            MembraneError::type_error(format!(
                "operation requires an object, got {}",
                target.type_name()
            ))
        })
    }

    // -- get ---------------------------------------------------------------------

    pub fn get(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
    ) -> Result<Value, MembraneError> {
        let key = key.into();
        let receiver = target.clone();
        self.get_inner(target, &key, receiver, 0)
    }

    pub fn get_with_receiver(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
        receiver: Value,
    ) -> Result<Value, MembraneError> {
        let key = key.into();
        self.get_inner(target, &key, receiver, 0)
    }

    pub(crate) fn get_inner(
        &mut self,
        target: Value,
        key: &PropertyKey,
        receiver: Value,
        depth: u32,
    ) -> Result<Value, MembraneError> {
        if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
            return Err(MembraneError::PrototypeChainTooDeep {
                depth,
                max: MAX_PROTOTYPE_CHAIN_DEPTH,
            });
        }
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_get(handle, key, receiver, depth);
        }
        let desc = self.heap.ordinary(handle)?.get_own_property(key).cloned();
        match desc {
            Some(PropertyDescriptor::Data { value, .. }) => Ok(value),
            Some(PropertyDescriptor::Accessor { get: None, .. }) => Ok(Value::Undefined),
            Some(PropertyDescriptor::Accessor { get: Some(g), .. }) => {
                self.call(Value::Object(g), receiver, &[])
            }
            None => match self.heap.ordinary(handle)?.prototype {
                Some(proto) => self.get_inner(Value::Object(proto), key, receiver, depth + 1),
                None => Ok(Value::Undefined),
            },
        }
    }

    // -- set ---------------------------------------------------------------------

    pub fn set(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
        value: Value,
    ) -> Result<bool, MembraneError> {
        let key = key.into();
        let receiver = target.clone();
        self.set_inner(target, &key, value, receiver, 0)
    }

    pub fn set_with_receiver(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
        value: Value,
        receiver: Value,
    ) -> Result<bool, MembraneError> {
        let key = key.into();
        self.set_inner(target, &key, value, receiver, 0)
    }

    pub(crate) fn set_inner(
        &mut self,
        target: Value,
        key: &PropertyKey,
        value: Value,
        receiver: Value,
        depth: u32,
    ) -> Result<bool, MembraneError> {
        if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
            return Err(MembraneError::PrototypeChainTooDeep {
                depth,
                max: MAX_PROTOTYPE_CHAIN_DEPTH,
            });
        }
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_set(handle, key, value, receiver, depth);
        }
        let own = self.heap.ordinary(handle)?.get_own_property(key).cloned();
        let own = match own {
            Some(d) => d,
            None => match self.heap.ordinary(handle)?.prototype {
                Some(proto) => {
                    return self.set_inner(Value::Object(proto), key, value, receiver, depth + 1)
                }
                None => PropertyDescriptor::data(Value::Undefined),
            },
        };
        match own {
            PropertyDescriptor::Accessor { set: None, .. } => Ok(false),
            PropertyDescriptor::Accessor { set: Some(s), .. } => {
                self.call(Value::Object(s), receiver, &[value])?;
                Ok(true)
            }
            PropertyDescriptor::Data { writable, .. } => {
                if !writable {
                    return Ok(false);
                }
                self.set_on_receiver(receiver, key, value)
            }
        }
    }

    /// CreateDataProperty-or-update on the receiver, the tail of [[Set]].
    pub(crate) fn set_on_receiver(
        &mut self,
        receiver: Value,
        key: &PropertyKey,
        value: Value,
    ) -> Result<bool, MembraneError> {
        if !receiver.is_object() {
            return Ok(false);
        }
        let existing = self.get_own_property_descriptor(receiver.clone(), key.clone())?;
        match existing {
            Some(PropertyDescriptor::Accessor { .. }) => Ok(false),
            Some(PropertyDescriptor::Data {
                writable: false, ..
            }) => Ok(false),
            Some(PropertyDescriptor::Data {
                enumerable,
                configurable,
                ..
            }) => self.define_property(
                receiver,
                key.clone(),
                PropertyDescriptor::Data {
                    value,
                    writable: true,
                    enumerable,
                    configurable,
                },
            ),
            None => self.define_property(receiver, key.clone(), PropertyDescriptor::data(value)),
        }
    }

    // -- has ---------------------------------------------------------------------

    pub fn has(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
    ) -> Result<bool, MembraneError> {
        let key = key.into();
        self.has_inner(target, &key, 0)
    }

    pub(crate) fn has_inner(
        &mut self,
        target: Value,
        key: &PropertyKey,
        depth: u32,
    ) -> Result<bool, MembraneError> {
        if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
            return Err(MembraneError::PrototypeChainTooDeep {
                depth,
                max: MAX_PROTOTYPE_CHAIN_DEPTH,
            });
        }
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_has(handle, key, depth);
        }
        if self.heap.ordinary(handle)?.has_own_property(key) {
            return Ok(true);
        }
        match self.heap.ordinary(handle)?.prototype {
            Some(proto) => self.has_inner(Value::Object(proto), key, depth + 1),
            None => Ok(false),
        }
    }

    // -- descriptors ----------------------------------------------------------------

    pub fn get_own_property_descriptor(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
    ) -> Result<Option<PropertyDescriptor>, MembraneError> {
        let key = key.into();
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_get_own_property_descriptor(handle, &key);
        }
        Ok(self.heap.ordinary(handle)?.get_own_property(&key).cloned())
    }

    pub fn define_property(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
        desc: PropertyDescriptor,
    ) -> Result<bool, MembraneError> {
        let key = key.into();
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_define_property(handle, key, desc, false);
        }
        self.heap.ordinary_mut(handle)?.define_own_property(key, desc)
    }

    pub fn delete_property(
        &mut self,
        target: Value,
        key: impl Into<PropertyKey>,
    ) -> Result<bool, MembraneError> {
        let key = key.into();
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_delete_property(handle, &key);
        }
        Ok(self.heap.ordinary_mut(handle)?.delete(&key))
    }

    // -- keys ------------------------------------------------------------------------

    pub fn own_keys(&mut self, target: Value) -> Result<Vec<PropertyKey>, MembraneError> {
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_own_keys(handle);
        }
        Ok(self.heap.ordinary(handle)?.own_property_keys())
    }

    /// Enumerable own string keys, `Object.keys` style.
    pub fn keys(&mut self, target: Value) -> Result<Vec<String>, MembraneError> {
        let all = self.own_keys(target.clone())?;
        let mut out = Vec::new();
        for key in all {
            if let PropertyKey::String(s) = &key {
                let enumerable = self
                    .get_own_property_descriptor(target.clone(), key.clone())?
                    .map(|d| d.is_enumerable())
                    .unwrap_or(false);
                if enumerable {
                    out.push(s.clone());
                }
            }
        }
        Ok(out)
    }

    // -- prototypes -------------------------------------------------------------------

    pub fn get_prototype_of(&mut self, target: Value) -> Result<Value, MembraneError> {
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_get_prototype_of(handle);
        }
        Ok(match self.heap.ordinary(handle)?.prototype {
            Some(p) => Value::Object(p),
            None => Value::Null,
        })
    }

    pub fn set_prototype_of(
        &mut self,
        target: Value,
        proto: Value,
    ) -> Result<bool, MembraneError> {
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_set_prototype_of(handle, proto);
        }
        let proto_handle = match &proto {
            Value::Null => None,
            Value::Object(h) => Some(*h),
            other => {
                return Err(MembraneError::validation(format!(
                    "prototype must be an object or null, got {}",
                    other.type_name()
                )))
            }
        };
        self.ordinary_set_prototype(handle, proto_handle)
    }

    /// Ordinary `[[SetPrototypeOf]]` with cycle detection.
    pub(crate) fn ordinary_set_prototype(
        &mut self,
        handle: ObjectHandle,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, MembraneError> {
        if let Some(mut current) = proto {
            let mut visited = BTreeSet::new();
            visited.insert(handle);
            loop {
                if !visited.insert(current) {
                    return Err(MembraneError::PrototypeCycleDetected);
                }
                if self.heap.is_proxy(current) {
                    break;
                }
                match self.heap.ordinary(current)?.prototype {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
        let object = self.heap.ordinary_mut(handle)?;
        if !object.extensible {
            return Ok(object.prototype == proto);
        }
        object.prototype = proto;
        Ok(true)
    }

    // -- extensibility ------------------------------------------------------------------

    pub fn is_extensible(&mut self, target: Value) -> Result<bool, MembraneError> {
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_is_extensible(handle);
        }
        Ok(self.heap.ordinary(handle)?.extensible)
    }

    pub fn prevent_extensions(&mut self, target: Value) -> Result<bool, MembraneError> {
        let handle = self.require_object(&target)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_prevent_extensions(handle);
        }
        self.heap.ordinary_mut(handle)?.prevent_extensions();
        Ok(true)
    }

    // -- calls -------------------------------------------------------------------------

    /// Invoke a callable value: a proxy routes through the `apply` trap, an
    /// ordinary function runs its host callback.
    pub fn call(
        &mut self,
        f: Value,
        this_arg: Value,
        args: &[Value],
    ) -> Result<Value, MembraneError> {
        let handle = self.require_object(&f)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_apply(handle, this_arg, args);
        }
        match self.heap.kind_of(handle)? {
            ObjectKind::Function {
                native: Some(id), ..
            } => {
                let native = self
                    .heap
                    .native(id)
                    .ok_or_else(|| MembraneError::type_error("missing native backing"))?;
                native(self, this_arg, args)
            }
            _ => Err(MembraneError::type_error(format!(
                "{f} is not callable"
            ))),
        }
    }

    /// Construct with a callable value: proxies route through the
    /// `construct` trap.
    pub fn construct(
        &mut self,
        f: Value,
        args: &[Value],
        new_target: Option<Value>,
    ) -> Result<Value, MembraneError> {
        let handle = self.require_object(&f)?;
        if self.heap.is_proxy(handle) {
            return self.proxy_construct(handle, args, new_target);
        }
        match self.heap.kind_of(handle)? {
            ObjectKind::Function {
                native: Some(id), ..
            } => {
                let native = self
                    .heap
                    .native(id)
                    .ok_or_else(|| MembraneError::type_error("missing native backing"))?;
                let proto = self
                    .get(f.clone(), "prototype")?
                    .as_object();
                let this_obj = self.heap.alloc(ObjectKind::Plain, proto);
                let result = native(self, Value::Object(this_obj), args)?;
                Ok(if result.is_object() {
                    result
                } else {
                    Value::Object(this_obj)
                })
            }
            _ => Err(MembraneError::type_error(format!(
                "{f} is not constructible"
            ))),
        }
    }
}
