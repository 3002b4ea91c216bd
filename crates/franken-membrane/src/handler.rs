//! Graph handler: the 13 traps for one object graph.
//!
//! Every trap resolves the real value behind the proxy through its
//! cylinder, consults per-graph local rules (local descriptors, deleted
//! keys, own-keys filters, flags), performs the raw operation on the real
//! side, and wraps every reference crossing back into this graph. Language
//! invariants are pinned onto the shadow target: non-configurable
//! descriptors are installed there, and loss of extensibility locks the
//! shadow behind lazy one-shot accessors.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::cylinder::{
    disable_trap_flag, FLAG_REQUIRE_LOCAL_DELETE, FLAG_STORE_UNKNOWN_AS_LOCAL,
};
use crate::error::MembraneError;
use crate::events::{CallPhase, FunctionEvent, LogLevel};
use crate::membrane::{
    ConvertOptions, Membrane, PassThroughFilter, GRAPH_NAME_SENTINEL,
};
use crate::object_model::{
    ChainHandlerId, GraphName, ObjectHandle, ObjectKind, PropertyDescriptor, PropertyKey, Value,
    MAX_PROTOTYPE_CHAIN_DEPTH,
};
use crate::pipeline::{
    ChainBase, HandlerPipeline, StagePhase, TrapName, TrapOverride, TrapReply, TrapRequest,
};
use crate::value_map::CylinderRef;

// ---------------------------------------------------------------------------
// ObjectGraphHandler
// ---------------------------------------------------------------------------

/// Per-graph handler state. Trap logic lives on [`Membrane`] because every
/// trap needs the heap, the value map, and possibly other graphs.
pub struct ObjectGraphHandler {
    pub(crate) graph: GraphName,
    pub(crate) revoked: bool,
    pub(crate) pass_through: Option<PassThroughFilter>,
    pub(crate) proxy_listeners: Vec<Rc<dyn ProxyListener>>,
    pub(crate) pipeline: HandlerPipeline,
    /// Real values whose proxy in this graph is still being constructed;
    /// shadow locking defers while a value is listed here.
    pub(crate) in_construction: BTreeSet<ObjectHandle>,
    pub(crate) finalizers: Vec<Finalizer>,
}

impl ObjectGraphHandler {
    pub(crate) fn new(graph: GraphName, pipeline: HandlerPipeline) -> Self {
        Self {
            graph,
            revoked: false,
            pass_through: None,
            proxy_listeners: Vec::new(),
            pipeline,
            in_construction: BTreeSet::new(),
            finalizers: Vec::new(),
        }
    }

    pub fn graph(&self) -> &GraphName {
        &self.graph
    }
}

/// Deferred work queued while a proxy is under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Finalizer {
    LockShadow { real: ObjectHandle },
}

// ---------------------------------------------------------------------------
// Proxy listeners
// ---------------------------------------------------------------------------

/// How `use_shadow_target` reshapes a freshly created proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowUse {
    Frozen,
    Sealed,
    Prepared,
}

/// Metadata handed to proxy listeners when a foreign-graph proxy is first
/// created. `proxy` is read/write: a listener may substitute its own.
pub struct ProxyMessage {
    /// The real value being wrapped.
    pub target: Value,
    /// The new proxy; listeners may replace it.
    pub proxy: Value,
    /// Graph of the handler whose listeners are firing.
    pub graph: GraphName,
    pub is_origin_graph: bool,
    original_proxy: Value,
    stopped: bool,
    thrown: Option<MembraneError>,
    rebuild: bool,
    shadow_mode: Option<ShadowUse>,
}

impl ProxyMessage {
    fn new(target: Value, proxy: Value, graph: GraphName, is_origin_graph: bool) -> Self {
        Self {
            target,
            original_proxy: proxy.clone(),
            proxy,
            graph,
            is_origin_graph,
            stopped: false,
            thrown: None,
            rebuild: false,
            shadow_mode: None,
        }
    }

    /// Skip the remaining listeners for this notification.
    pub fn stop_iteration(&mut self) {
        self.stopped = true;
    }

    /// Propagate `error` to the caller once the current listener returns.
    pub fn throw_exception(&mut self, error: MembraneError) {
        self.thrown = Some(error);
    }

    /// Discard the proxy built so far and rebuild over the same shadow.
    pub fn rebuild_proxy(&mut self) {
        self.rebuild = true;
    }

    /// Lock the shadow in the requested mode after notification.
    pub fn use_shadow_target(&mut self, mode: ShadowUse) {
        self.shadow_mode = Some(mode);
    }
}

/// Observer of first crossings. An `Err` return is logged and swallowed;
/// use [`ProxyMessage::throw_exception`] to abort the crossing.
pub trait ProxyListener {
    fn handle_proxy(
        &self,
        membrane: &mut Membrane,
        message: &mut ProxyMessage,
    ) -> Result<(), MembraneError>;
}

// ---------------------------------------------------------------------------
// Trap context
// ---------------------------------------------------------------------------

/// Resolved state shared by every trap on one proxy.
pub(crate) struct TrapCtx {
    pub graph: GraphName,
    pub origin: GraphName,
    pub cylinder: CylinderRef,
    pub real: Value,
    pub real_h: ObjectHandle,
    pub shadow: ObjectHandle,
    pub proxy_h: ObjectHandle,
    pub chain: Option<ChainHandlerId>,
}

enum DispatchPlan {
    Override(TrapOverride),
    Forward,
    Terminal,
}

fn outcome<T>(result: &Result<T, MembraneError>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(error) => error.to_string(),
    }
}

impl Membrane {
    // -- resolution -----------------------------------------------------------

    pub(crate) fn resolve_proxy_ctx(
        &self,
        proxy_h: ObjectHandle,
    ) -> Result<TrapCtx, MembraneError> {
        let state = self.heap().proxy_state(proxy_h)?.clone();
        if state.revoked {
            return Err(MembraneError::Revoked);
        }
        if self.handler(&state.graph)?.revoked {
            return Err(MembraneError::Revoked);
        }
        if self.map_is_dead(proxy_h) {
            return Err(MembraneError::Revoked);
        }
        let cylinder = self.cylinder_for(proxy_h).ok_or_else(|| {
            MembraneError::ownership("proxy is not known to this membrane")
        })?;
        let (origin, real, shadow) = {
            let c = cylinder.borrow();
            let origin = c
                .origin_graph()
                .cloned()
                .ok_or(MembraneError::OriginalNotSet)?;
            if c.is_dead(&origin) || c.is_dead(&state.graph) {
                return Err(MembraneError::Revoked);
            }
            let real = c.get_original()?;
            let shadow = c.get_shadow_target(&state.graph)?;
            (origin, real, shadow)
        };
        if self.handler(&origin)?.revoked {
            return Err(MembraneError::Revoked);
        }
        let real_h = real.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        Ok(TrapCtx {
            graph: state.graph,
            origin,
            cylinder,
            real,
            real_h,
            shadow,
            proxy_h,
            chain: state.chain,
        })
    }

    /// Rebuild a context from a cylinder's foreign entry, for paths that
    /// start from the cylinder instead of a proxy handle.
    pub(crate) fn ctx_from_cylinder(
        &self,
        graph: &GraphName,
        cylinder: &CylinderRef,
    ) -> Result<TrapCtx, MembraneError> {
        let (origin, real, shadow, proxy_h) = {
            let c = cylinder.borrow();
            let origin = c
                .origin_graph()
                .cloned()
                .ok_or(MembraneError::OriginalNotSet)?;
            let real = c.get_original()?;
            let shadow = c.get_shadow_target(graph)?;
            let proxy_h = c.proxy_handle(graph).ok_or_else(|| {
                MembraneError::validation(format!("graph '{graph}' holds no proxy"))
            })?;
            (origin, real, shadow, proxy_h)
        };
        let real_h = real.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        let chain = self.heap().proxy_state(proxy_h)?.chain;
        Ok(TrapCtx {
            graph: graph.clone(),
            origin,
            cylinder: Rc::clone(cylinder),
            real,
            real_h,
            shadow,
            proxy_h,
            chain,
        })
    }

    fn check_trap_enabled(&self, ctx: &TrapCtx, trap: TrapName) -> Result<(), MembraneError> {
        let flag = disable_trap_flag(trap);
        let c = ctx.cylinder.borrow();
        if c.get_local_flag(&ctx.graph, &flag)? || c.get_local_flag(&ctx.origin, &flag)? {
            return Err(MembraneError::TrapDisabled { trap });
        }
        Ok(())
    }

    /// The stages every trap passes before dispatch: argument validation,
    /// then the disabled-trap gate.
    fn trap_gate(&self, ctx: &TrapCtx, trap: TrapName) -> Result<(), MembraneError> {
        self.invariant_in(ctx)?;
        self.check_trap_enabled(ctx, trap)
    }

    fn invariant_in(&self, ctx: &TrapCtx) -> Result<(), MembraneError> {
        if self
            .handler(&ctx.graph)?
            .pipeline
            .has_phase(StagePhase::GraphInvariantIn)
            && !ctx.cylinder.borrow().is_shadow_target(ctx.shadow)
        {
            return Err(MembraneError::invariant(
                "trap target is not this cylinder's shadow",
            ));
        }
        Ok(())
    }

    fn dispatch_plan(&self, ctx: &TrapCtx, trap: TrapName) -> DispatchPlan {
        if let Some(chain_id) = ctx.chain {
            if let Some(chain) = self.chain_handler(chain_id) {
                if let Some(f) = chain.override_for(trap) {
                    return DispatchPlan::Override(f);
                }
                if matches!(chain.base(), ChainBase::Forwarding) {
                    return DispatchPlan::Forward;
                }
            }
        }
        if let Ok(handler) = self.handler(&ctx.graph) {
            for chain_id in handler.pipeline.inserted_chains(Some(ctx.shadow)) {
                if let Some(chain) = self.chain_handler(chain_id) {
                    if let Some(f) = chain.override_for(trap) {
                        return DispatchPlan::Override(f);
                    }
                    if matches!(chain.base(), ChainBase::Forwarding) {
                        return DispatchPlan::Forward;
                    }
                }
            }
        }
        DispatchPlan::Terminal
    }

    fn recursive_flag(&self, ctx: &TrapCtx, name: &str) -> Result<bool, MembraneError> {
        if ctx.cylinder.borrow().get_local_flag(&ctx.graph, name)? {
            return Ok(true);
        }
        let mut current = self.heap().ordinary(ctx.real_h)?.prototype;
        let mut depth: u32 = 0;
        while let Some(proto) = current {
            if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                return Err(MembraneError::PrototypeChainTooDeep {
                    depth,
                    max: MAX_PROTOTYPE_CHAIN_DEPTH,
                });
            }
            if let Some(cylinder) = self.cylinder_for(proto) {
                let c = cylinder.borrow();
                if c.has_graph(&ctx.graph)
                    && !c.is_dead(&ctx.graph)
                    && c.get_local_flag(&ctx.graph, name)?
                {
                    return Ok(true);
                }
            }
            if self.heap().is_proxy(proto) {
                break;
            }
            current = self.heap().ordinary(proto)?.prototype;
            depth += 1;
        }
        Ok(false)
    }

    // -- visibility core ------------------------------------------------------

    /// The descriptor `key` presents through the proxy: sentinel, then
    /// locally-deleted masking, then local descriptors (which bypass the
    /// filters), then the own-keys filters, then the wrapped real
    /// descriptor. Non-configurable results are pinned onto the shadow.
    pub(crate) fn visible_own_descriptor(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, MembraneError> {
        if self.show_graph_name() && *key == PropertyKey::from(GRAPH_NAME_SENTINEL) {
            let desc = PropertyDescriptor::Data {
                value: Value::Str(ctx.graph.as_display_string()),
                writable: false,
                enumerable: false,
                configurable: false,
            };
            self.heap_mut()
                .ordinary_mut(ctx.shadow)?
                .properties
                .insert(key.clone(), desc.clone());
            return Ok(Some(desc));
        }

        let (deleted, local, origin_local, origin_filter, local_filter) = {
            let c = ctx.cylinder.borrow();
            let deleted = c.was_deleted_locally(&ctx.graph, key)?
                || c.was_deleted_locally(&ctx.origin, key)?;
            (
                deleted,
                c.get_local_descriptor(&ctx.graph, key)?,
                c.get_local_descriptor(&ctx.origin, key)?,
                c.get_own_keys_filter(&ctx.origin)?,
                c.get_own_keys_filter(&ctx.graph)?,
            )
        };
        if deleted {
            return Ok(None);
        }
        if let Some(desc) = local {
            return Ok(Some(desc));
        }
        if let Some(desc) = origin_local {
            return Ok(Some(self.wrap_descriptor(&ctx.origin, &ctx.graph, &desc)?));
        }
        if origin_filter.map_or(false, |f| !f.accepts(key))
            || local_filter.map_or(false, |f| !f.accepts(key))
        {
            return Ok(None);
        }

        let real_desc = self
            .heap()
            .ordinary(ctx.real_h)?
            .get_own_property(key)
            .cloned();
        match real_desc {
            None => Ok(None),
            Some(desc) => {
                let wrapped = self.wrap_descriptor(&ctx.origin, &ctx.graph, &desc)?;
                if !wrapped.is_configurable() {
                    self.pin_on_shadow(ctx, key, wrapped.clone())?;
                }
                Ok(Some(wrapped))
            }
        }
    }

    /// Install a descriptor on the shadow so proxy invariants hold there.
    fn pin_on_shadow(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<(), MembraneError> {
        let installed = self
            .heap_mut()
            .ordinary_mut(ctx.shadow)?
            .define_own_property(key.clone(), desc.clone())?;
        if !installed {
            let shadow = self.heap_mut().ordinary_mut(ctx.shadow)?;
            if shadow.properties.contains_key(key) {
                // Replace an existing (possibly lazy) slot in place; the
                // engine owns the shadow's storage.
                shadow.properties.insert(key.clone(), desc);
            } else {
                return Err(MembraneError::invariant(format!(
                    "non-extensible shadow rejected new key '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// The proxy's prototype: the wrapped real prototype, mirrored onto the
    /// shadow.
    pub(crate) fn wrapped_prototype(&mut self, ctx: &TrapCtx) -> Result<Value, MembraneError> {
        let proto = self.heap().ordinary(ctx.real_h)?.prototype;
        let wrapped = match proto {
            None => Value::Null,
            Some(p) => self.convert_argument_to_proxy(
                &ctx.origin,
                &ctx.graph,
                Value::Object(p),
                ConvertOptions::default(),
            )?,
        };
        self.heap_mut().ordinary_mut(ctx.shadow)?.prototype = wrapped.as_object();
        Ok(wrapped)
    }

    // -- own-keys core --------------------------------------------------------

    /// The exposed key list: real keys minus local deletions, filtered by
    /// both sides, plus local-only keys (origin side first), plus the
    /// sentinel.
    pub(crate) fn compute_exposed_keys(
        &mut self,
        ctx: &TrapCtx,
    ) -> Result<(Vec<PropertyKey>, BTreeSet<PropertyKey>), MembraneError> {
        let real_keys = self.heap().ordinary(ctx.real_h)?.own_property_keys();
        let real_set: BTreeSet<PropertyKey> = real_keys.iter().cloned().collect();

        let (deleted, origin_filter, local_filter, origin_locals, graph_locals) = {
            let c = ctx.cylinder.borrow();
            let mut deleted = BTreeSet::new();
            c.append_deleted_names(&ctx.origin, &mut deleted)?;
            c.append_deleted_names(&ctx.graph, &mut deleted)?;
            (
                deleted,
                c.get_own_keys_filter(&ctx.origin)?,
                c.get_own_keys_filter(&ctx.graph)?,
                c.local_own_keys(&ctx.origin)?,
                c.local_own_keys(&ctx.graph)?,
            )
        };

        let mut keys: Vec<PropertyKey> = real_keys
            .into_iter()
            .filter(|k| !deleted.contains(k))
            .filter(|k| origin_filter.as_ref().map_or(true, |f| f.accepts(k)))
            .filter(|k| local_filter.as_ref().map_or(true, |f| f.accepts(k)))
            .collect();

        for key in origin_locals.into_iter().chain(graph_locals) {
            if !real_set.contains(&key) && !keys.contains(&key) {
                keys.push(key);
            }
        }

        if self.show_graph_name() {
            let sentinel = PropertyKey::from(GRAPH_NAME_SENTINEL);
            if !keys.contains(&sentinel) {
                keys.push(sentinel);
            }
        }

        Ok((keys, real_set))
    }

    fn term_own_keys(&mut self, ctx: &TrapCtx) -> Result<Vec<PropertyKey>, MembraneError> {
        if !self.heap().ordinary(ctx.shadow)?.extensible {
            return Ok(self.heap().ordinary(ctx.shadow)?.own_property_keys());
        }

        if let Some(cache) = ctx.cylinder.borrow().cached_own_keys(&ctx.graph)? {
            let current: BTreeSet<PropertyKey> = self
                .heap()
                .ordinary(ctx.real_h)?
                .own_property_keys()
                .into_iter()
                .collect();
            if cache.original == current {
                return Ok(cache.keys);
            }
        }

        let (keys, original) = self.compute_exposed_keys(ctx)?;
        ctx.cylinder
            .borrow_mut()
            .set_cached_own_keys(&ctx.graph, keys.clone(), original)?;

        // Reconcile with the shadow: every non-configurable shadow key must
        // be present in the result.
        let pinned: Vec<PropertyKey> = self
            .heap()
            .ordinary(ctx.shadow)?
            .properties
            .iter()
            .filter(|(_, d)| !d.is_configurable())
            .map(|(k, _)| k.clone())
            .collect();
        for key in pinned {
            if !keys.contains(&key) {
                return Err(MembraneError::invariant(format!(
                    "own-keys result omits non-configurable shadow key '{key}'"
                )));
            }
        }

        if self
            .handler(&ctx.graph)?
            .pipeline
            .has_phase(StagePhase::GraphInvariantOut)
        {
            let mut seen = BTreeSet::new();
            for key in &keys {
                if !seen.insert(key.clone()) {
                    return Err(MembraneError::invariant(format!(
                        "own-keys result contains duplicate key '{key}'"
                    )));
                }
            }
        }
        Ok(keys)
    }

    // =======================================================================
    // Trap entry points
    // =======================================================================

    pub(crate) fn proxy_get(
        &mut self,
        proxy_h: ObjectHandle,
        key: &PropertyKey,
        receiver: Value,
        depth: u32,
    ) -> Result<Value, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::Get);
        let result = self
            .trap_gate(&ctx, TrapName::Get)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::Get) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::Get),
                    proxy: Some(Value::Object(proxy_h)),
                    key: Some(key.clone()),
                    receiver: Some(receiver.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_value),
            DispatchPlan::Forward => {
                self.get_inner(ctx.real.clone(), key, ctx.real.clone(), depth + 1)
            }
            DispatchPlan::Terminal => self.term_get(&ctx, key, receiver, depth),
            });
        self.trace_exit(&ctx.graph, TrapName::Get, outcome(&result));
        result
    }

    fn term_get(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
        receiver: Value,
        depth: u32,
    ) -> Result<Value, MembraneError> {
        match self.visible_own_descriptor(ctx, key)? {
            Some(PropertyDescriptor::Data { value, .. }) => Ok(value),
            Some(PropertyDescriptor::Accessor { get: None, .. }) => Ok(Value::Undefined),
            Some(PropertyDescriptor::Accessor { get: Some(g), .. }) => {
                self.call(Value::Object(g), receiver, &[])
            }
            None => {
                let proto = self.wrapped_prototype(ctx)?;
                match proto {
                    Value::Null => Ok(Value::Undefined),
                    proto => self.get_inner(proto, key, receiver, depth + 1),
                }
            }
        }
    }

    pub(crate) fn proxy_set(
        &mut self,
        proxy_h: ObjectHandle,
        key: &PropertyKey,
        value: Value,
        receiver: Value,
        depth: u32,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::Set);
        let result = self
            .trap_gate(&ctx, TrapName::Set)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::Set) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::Set),
                    proxy: Some(Value::Object(proxy_h)),
                    key: Some(key.clone()),
                    value: Some(value.clone()),
                    receiver: Some(receiver.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => {
                self.set_inner(ctx.real.clone(), key, value, ctx.real.clone(), depth + 1)
            }
            DispatchPlan::Terminal => self.term_set(&ctx, key, value, receiver, depth),
            });
        self.trace_exit(&ctx.graph, TrapName::Set, outcome(&result));
        result
    }

    fn term_set(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
        value: Value,
        receiver: Value,
        depth: u32,
    ) -> Result<bool, MembraneError> {
        // A receiver that has never crossed the membrane may be under
        // construction; give it a mapping before delegating.
        if let Some(receiver_h) = receiver.as_object() {
            if self.cylinder_for(receiver_h).is_none() && !self.map_is_dead(receiver_h) {
                self.ensure_origin_cylinder(&ctx.graph, &receiver)?;
            }
        }

        let own = match self.visible_own_descriptor(ctx, key)? {
            Some(desc) => desc,
            None => {
                let proto = self.wrapped_prototype(ctx)?;
                match proto {
                    Value::Null => PropertyDescriptor::data(Value::Undefined),
                    proto => {
                        return self.set_inner(proto, key, value, receiver, depth + 1);
                    }
                }
            }
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

    pub(crate) fn proxy_has(
        &mut self,
        proxy_h: ObjectHandle,
        key: &PropertyKey,
        depth: u32,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::Has);
        let result = self
            .trap_gate(&ctx, TrapName::Has)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::Has) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::Has),
                    proxy: Some(Value::Object(proxy_h)),
                    key: Some(key.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => self.has_inner(ctx.real.clone(), key, depth + 1),
            DispatchPlan::Terminal => {
                if self.visible_own_descriptor(&ctx, key)?.is_some() {
                    Ok(true)
                } else {
                    match self.wrapped_prototype(&ctx)? {
                        Value::Null => Ok(false),
                        proto => self.has_inner(proto, key, depth + 1),
                    }
                }
            }
            });
        self.trace_exit(&ctx.graph, TrapName::Has, outcome(&result));
        result
    }

    pub(crate) fn proxy_get_own_property_descriptor(
        &mut self,
        proxy_h: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::GetOwnPropertyDescriptor);
        let result = self
            .trap_gate(&ctx, TrapName::GetOwnPropertyDescriptor)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::GetOwnPropertyDescriptor) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::GetOwnPropertyDescriptor),
                    proxy: Some(Value::Object(proxy_h)),
                    key: Some(key.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_maybe_descriptor),
            DispatchPlan::Forward => Ok(self
                .heap()
                .ordinary(ctx.real_h)?
                .get_own_property(key)
                .cloned()),
            DispatchPlan::Terminal => self.visible_own_descriptor(&ctx, key),
            });
        self.trace_exit(
            &ctx.graph,
            TrapName::GetOwnPropertyDescriptor,
            outcome(&result),
        );
        result
    }

    pub(crate) fn proxy_define_property(
        &mut self,
        proxy_h: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
        should_be_local: bool,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::DefineProperty);
        let result = self
            .trap_gate(&ctx, TrapName::DefineProperty)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::DefineProperty) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::DefineProperty),
                    proxy: Some(Value::Object(proxy_h)),
                    key: Some(key.clone()),
                    desc: Some(desc.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => self
                .heap_mut()
                .ordinary_mut(ctx.real_h)?
                .define_own_property(key.clone(), desc.clone()),
            DispatchPlan::Terminal => self.term_define_property(&ctx, key, desc, should_be_local),
            });
        self.trace_exit(&ctx.graph, TrapName::DefineProperty, outcome(&result));
        result
    }

    fn term_define_property(
        &mut self,
        ctx: &TrapCtx,
        key: PropertyKey,
        desc: PropertyDescriptor,
        should_be_local_hint: bool,
    ) -> Result<bool, MembraneError> {
        // The sentinel cannot be defined away.
        if self.show_graph_name() && key == PropertyKey::from(GRAPH_NAME_SENTINEL) {
            return Ok(false);
        }

        let (origin_filter, local_filter) = {
            let c = ctx.cylinder.borrow();
            (
                c.get_own_keys_filter(&ctx.origin)?,
                c.get_own_keys_filter(&ctx.graph)?,
            )
        };
        let filtered = origin_filter.as_ref().map_or(false, |f| !f.accepts(&key))
            || local_filter.as_ref().map_or(false, |f| !f.accepts(&key));
        if filtered {
            // Filtered keys do not exist through this proxy; accept the
            // define as an observational no-op.
            return Ok(true);
        }

        let should_be_local =
            should_be_local_hint || self.recursive_flag(ctx, FLAG_STORE_UNKNOWN_AS_LOCAL)?;
        let real_has = self
            .heap()
            .ordinary(ctx.real_h)?
            .has_own_property(&key);

        if should_be_local && !real_has {
            ctx.cylinder
                .borrow_mut()
                .set_local_descriptor(&ctx.graph, key, desc)?;
            return Ok(true);
        }

        {
            let mut c = ctx.cylinder.borrow_mut();
            c.unmask_deletion(&ctx.graph, &key)?;
        }
        let wrapped = self.wrap_descriptor(&ctx.graph, &ctx.origin, &desc)?;
        let defined = self
            .heap_mut()
            .ordinary_mut(ctx.real_h)?
            .define_own_property(key.clone(), wrapped)?;
        ctx.cylinder.borrow_mut().invalidate_all_cached_keys();
        if defined && !desc.is_configurable() {
            self.pin_on_shadow(ctx, &key, desc)?;
        }
        Ok(defined)
    }

    pub(crate) fn proxy_delete_property(
        &mut self,
        proxy_h: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::DeleteProperty);
        let result = self
            .trap_gate(&ctx, TrapName::DeleteProperty)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::DeleteProperty) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::DeleteProperty),
                    proxy: Some(Value::Object(proxy_h)),
                    key: Some(key.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => Ok(self.heap_mut().ordinary_mut(ctx.real_h)?.delete(key)),
            DispatchPlan::Terminal => self.term_delete_property(&ctx, key),
            });
        self.trace_exit(&ctx.graph, TrapName::DeleteProperty, outcome(&result));
        result
    }

    fn term_delete_property(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
    ) -> Result<bool, MembraneError> {
        let (origin_filter, local_filter) = {
            let c = ctx.cylinder.borrow();
            (
                c.get_own_keys_filter(&ctx.origin)?,
                c.get_own_keys_filter(&ctx.graph)?,
            )
        };
        let filtered = origin_filter.as_ref().map_or(false, |f| !f.accepts(key))
            || local_filter.as_ref().map_or(false, |f| !f.accepts(key));
        if filtered {
            return Ok(true);
        }

        if self.recursive_flag(ctx, FLAG_REQUIRE_LOCAL_DELETE)? {
            ctx.cylinder
                .borrow_mut()
                .delete_local_descriptor(&ctx.graph, key, true)?;
            return Ok(true);
        }

        ctx.cylinder
            .borrow_mut()
            .delete_local_descriptor(&ctx.graph, key, false)?;
        let deleted = self.heap_mut().ordinary_mut(ctx.real_h)?.delete(key);
        ctx.cylinder.borrow_mut().invalidate_all_cached_keys();
        Ok(deleted)
    }

    pub(crate) fn proxy_own_keys(
        &mut self,
        proxy_h: ObjectHandle,
    ) -> Result<Vec<PropertyKey>, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::OwnKeys);
        let result = self
            .trap_gate(&ctx, TrapName::OwnKeys)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::OwnKeys) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::OwnKeys),
                    proxy: Some(Value::Object(proxy_h)),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_keys),
            DispatchPlan::Forward => {
                Ok(self.heap().ordinary(ctx.real_h)?.own_property_keys())
            }
            DispatchPlan::Terminal => self.term_own_keys(&ctx),
            });
        self.trace_exit(&ctx.graph, TrapName::OwnKeys, outcome(&result));
        result
    }

    pub(crate) fn proxy_get_prototype_of(
        &mut self,
        proxy_h: ObjectHandle,
    ) -> Result<Value, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::GetPrototypeOf);
        let result = self
            .trap_gate(&ctx, TrapName::GetPrototypeOf)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::GetPrototypeOf) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::GetPrototypeOf),
                    proxy: Some(Value::Object(proxy_h)),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_value),
            DispatchPlan::Forward => Ok(match self.heap().ordinary(ctx.real_h)?.prototype {
                Some(p) => Value::Object(p),
                None => Value::Null,
            }),
            DispatchPlan::Terminal => self.wrapped_prototype(&ctx),
            });
        self.trace_exit(&ctx.graph, TrapName::GetPrototypeOf, outcome(&result));
        result
    }

    pub(crate) fn proxy_set_prototype_of(
        &mut self,
        proxy_h: ObjectHandle,
        proto: Value,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::SetPrototypeOf);
        let result = self
            .trap_gate(&ctx, TrapName::SetPrototypeOf)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::SetPrototypeOf) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::SetPrototypeOf),
                    proxy: Some(Value::Object(proxy_h)),
                    proto: Some(proto.clone()),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => {
                let unwrapped = match &proto {
                    Value::Null => None,
                    Value::Object(h) => Some(*h),
                    other => {
                        return Err(MembraneError::validation(format!(
                            "prototype must be an object or null, got {}",
                            other.type_name()
                        )))
                    }
                };
                self.ordinary_set_prototype(ctx.real_h, unwrapped)
            }
            DispatchPlan::Terminal => self.term_set_prototype_of(&ctx, proto),
            });
        self.trace_exit(&ctx.graph, TrapName::SetPrototypeOf, outcome(&result));
        result
    }

    fn term_set_prototype_of(
        &mut self,
        ctx: &TrapCtx,
        proto: Value,
    ) -> Result<bool, MembraneError> {
        let unwrapped = match &proto {
            Value::Null => None,
            Value::Object(_) => {
                let converted = self.convert_argument_to_proxy(
                    &ctx.graph,
                    &ctx.origin,
                    proto.clone(),
                    ConvertOptions::default(),
                )?;
                Some(converted.as_object().ok_or_else(|| {
                    MembraneError::type_error("prototype wrapped to a non-object")
                })?)
            }
            other => {
                return Err(MembraneError::validation(format!(
                    "prototype must be an object or null, got {}",
                    other.type_name()
                )))
            }
        };
        let changed = self.ordinary_set_prototype(ctx.real_h, unwrapped)?;
        if changed {
            self.heap_mut().ordinary_mut(ctx.shadow)?.prototype = proto.as_object();
        }
        Ok(changed)
    }

    pub(crate) fn proxy_is_extensible(
        &mut self,
        proxy_h: ObjectHandle,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::IsExtensible);
        let result = self
            .trap_gate(&ctx, TrapName::IsExtensible)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::IsExtensible) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::IsExtensible),
                    proxy: Some(Value::Object(proxy_h)),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => Ok(self.heap().ordinary(ctx.real_h)?.extensible),
            DispatchPlan::Terminal => {
                if !self.heap().ordinary(ctx.shadow)?.extensible {
                    Ok(false)
                } else if self.heap().ordinary(ctx.real_h)?.extensible {
                    Ok(true)
                } else {
                    self.lock_shadow_for(&ctx.graph, &ctx.cylinder)?;
                    Ok(false)
                }
            }
            });
        self.trace_exit(&ctx.graph, TrapName::IsExtensible, outcome(&result));
        result
    }

    pub(crate) fn proxy_prevent_extensions(
        &mut self,
        proxy_h: ObjectHandle,
    ) -> Result<bool, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::PreventExtensions);
        let result = self
            .trap_gate(&ctx, TrapName::PreventExtensions)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::PreventExtensions) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::PreventExtensions),
                    proxy: Some(Value::Object(proxy_h)),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_bool),
            DispatchPlan::Forward => {
                self.heap_mut().ordinary_mut(ctx.real_h)?.prevent_extensions();
                Ok(true)
            }
            DispatchPlan::Terminal => {
                if !self.heap().ordinary(ctx.shadow)?.extensible {
                    Ok(true)
                } else {
                    self.heap_mut().ordinary_mut(ctx.real_h)?.prevent_extensions();
                    self.lock_shadow_for(&ctx.graph, &ctx.cylinder)?;
                    Ok(true)
                }
            }
            });
        self.trace_exit(&ctx.graph, TrapName::PreventExtensions, outcome(&result));
        result
    }

    // -- function traps --------------------------------------------------------

    fn truncation_bound(&self, ctx: &TrapCtx) -> Result<Option<usize>, MembraneError> {
        let arity = match self.heap().kind_of(ctx.real_h)? {
            ObjectKind::Function { arity, .. } => arity,
            _ => {
                return Err(MembraneError::type_error(format!(
                    "{} is not callable",
                    ctx.real
                )))
            }
        };
        let (origin_limit, graph_limit) = {
            let c = ctx.cylinder.borrow();
            (
                c.get_truncate_arg_list(&ctx.origin)?,
                c.get_truncate_arg_list(&ctx.graph)?,
            )
        };
        let bound = [origin_limit, graph_limit]
            .into_iter()
            .flatten()
            .filter_map(|limit| limit.resolve(arity))
            .min();
        Ok(bound.map(|n| n as usize))
    }

    pub(crate) fn proxy_apply(
        &mut self,
        proxy_h: ObjectHandle,
        this_arg: Value,
        args: &[Value],
    ) -> Result<Value, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::Apply);
        let result = self
            .trap_gate(&ctx, TrapName::Apply)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::Apply) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::Apply),
                    proxy: Some(Value::Object(proxy_h)),
                    this_arg: Some(this_arg.clone()),
                    args: args.to_vec(),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_value),
            DispatchPlan::Forward => self.call(ctx.real.clone(), this_arg.clone(), args),
            DispatchPlan::Terminal => self.term_apply(&ctx, this_arg, args),
            });
        self.trace_exit(&ctx.graph, TrapName::Apply, outcome(&result));
        result
    }

    fn term_apply(
        &mut self,
        ctx: &TrapCtx,
        this_arg: Value,
        args: &[Value],
    ) -> Result<Value, MembraneError> {
        let bound = self.truncation_bound(ctx)?;
        let truncated: &[Value] = match bound {
            Some(n) if n < args.len() => &args[..n],
            _ => args,
        };

        let wrapped_this = self.convert_argument_to_proxy(
            &ctx.graph,
            &ctx.origin,
            this_arg,
            ConvertOptions::default(),
        )?;
        let mut wrapped_args = Vec::with_capacity(truncated.len());
        for arg in truncated {
            wrapped_args.push(self.convert_argument_to_proxy(
                &ctx.graph,
                &ctx.origin,
                arg.clone(),
                ConvertOptions::default(),
            )?);
        }

        self.fire_function_event(&FunctionEvent {
            reason: CallPhase::Enter,
            trap: TrapName::Apply,
            this_graph: ctx.graph.clone(),
            origin_graph: ctx.origin.clone(),
            target: ctx.real.clone(),
            payload: None,
            error: None,
        });

        match self.call(ctx.real.clone(), wrapped_this, &wrapped_args) {
            Ok(rv) => {
                let wrapped_rv = self.convert_argument_to_proxy(
                    &ctx.origin,
                    &ctx.graph,
                    rv,
                    ConvertOptions::default(),
                )?;
                self.fire_function_event(&FunctionEvent {
                    reason: CallPhase::Return,
                    trap: TrapName::Apply,
                    this_graph: ctx.graph.clone(),
                    origin_graph: ctx.origin.clone(),
                    target: ctx.real.clone(),
                    payload: Some(wrapped_rv.clone()),
                    error: None,
                });
                Ok(wrapped_rv)
            }
            Err(error) => {
                self.fire_function_event(&FunctionEvent {
                    reason: CallPhase::Throw,
                    trap: TrapName::Apply,
                    this_graph: ctx.graph.clone(),
                    origin_graph: ctx.origin.clone(),
                    target: ctx.real.clone(),
                    payload: None,
                    error: Some(error.to_string()),
                });
                Err(error)
            }
        }
    }

    pub(crate) fn proxy_construct(
        &mut self,
        proxy_h: ObjectHandle,
        args: &[Value],
        new_target: Option<Value>,
    ) -> Result<Value, MembraneError> {
        let ctx = self.resolve_proxy_ctx(proxy_h)?;
        self.trace_enter(&ctx.graph, TrapName::Construct);
        let result = self
            .trap_gate(&ctx, TrapName::Construct)
            .and_then(|_| match self.dispatch_plan(&ctx, TrapName::Construct) {
            DispatchPlan::Override(f) => f(
                self,
                &TrapRequest {
                    trap: Some(TrapName::Construct),
                    proxy: Some(Value::Object(proxy_h)),
                    args: args.to_vec(),
                    new_target: new_target.clone(),
                    ..TrapRequest::default()
                },
            )
            .and_then(TrapReply::into_value),
            DispatchPlan::Forward => self.construct(ctx.real.clone(), args, new_target.clone()),
            DispatchPlan::Terminal => self.term_construct(&ctx, args, new_target),
            });
        self.trace_exit(&ctx.graph, TrapName::Construct, outcome(&result));
        result
    }

    fn term_construct(
        &mut self,
        ctx: &TrapCtx,
        args: &[Value],
        new_target: Option<Value>,
    ) -> Result<Value, MembraneError> {
        let bound = self.truncation_bound(ctx)?;
        let truncated: &[Value] = match bound {
            Some(n) if n < args.len() => &args[..n],
            _ => args,
        };

        let mut wrapped_args = Vec::with_capacity(truncated.len());
        for arg in truncated {
            wrapped_args.push(self.convert_argument_to_proxy(
                &ctx.graph,
                &ctx.origin,
                arg.clone(),
                ConvertOptions::default(),
            )?);
        }
        let wrapped_new_target = match new_target {
            None => None,
            Some(nt) => Some(self.convert_argument_to_proxy(
                &ctx.graph,
                &ctx.origin,
                nt,
                ConvertOptions::default(),
            )?),
        };

        self.fire_function_event(&FunctionEvent {
            reason: CallPhase::Enter,
            trap: TrapName::Construct,
            this_graph: ctx.graph.clone(),
            origin_graph: ctx.origin.clone(),
            target: ctx.real.clone(),
            payload: None,
            error: None,
        });

        match self.construct(ctx.real.clone(), &wrapped_args, wrapped_new_target) {
            Ok(rv) => {
                let wrapped_rv = self.convert_argument_to_proxy(
                    &ctx.origin,
                    &ctx.graph,
                    rv,
                    ConvertOptions::default(),
                )?;
                self.fire_function_event(&FunctionEvent {
                    reason: CallPhase::Return,
                    trap: TrapName::Construct,
                    this_graph: ctx.graph.clone(),
                    origin_graph: ctx.origin.clone(),
                    target: ctx.real.clone(),
                    payload: Some(wrapped_rv.clone()),
                    error: None,
                });
                Ok(wrapped_rv)
            }
            Err(error) => {
                self.fire_function_event(&FunctionEvent {
                    reason: CallPhase::Throw,
                    trap: TrapName::Construct,
                    this_graph: ctx.graph.clone(),
                    origin_graph: ctx.origin.clone(),
                    target: ctx.real.clone(),
                    payload: None,
                    error: Some(error.to_string()),
                });
                Err(error)
            }
        }
    }

    // =======================================================================
    // Shadow locking and lazy accessors
    // =======================================================================

    /// Lock the shadow behind lazy one-shot accessors, fix its prototype,
    /// and mark it non-extensible. Deferred while the proxy is still under
    /// construction.
    pub(crate) fn lock_shadow_for(
        &mut self,
        graph: &GraphName,
        cylinder: &CylinderRef,
    ) -> Result<(), MembraneError> {
        let ctx = self.ctx_from_cylinder(graph, cylinder)?;
        if self.handler(graph)?.in_construction.contains(&ctx.real_h) {
            self.handler_mut(graph)?
                .finalizers
                .push(Finalizer::LockShadow { real: ctx.real_h });
            return Ok(());
        }
        if !self.heap().ordinary(ctx.shadow)?.extensible {
            return Ok(());
        }
        self.install_lazy_accessors(&ctx)?;
        let wrapped = self.wrapped_prototype(&ctx)?;
        self.heap_mut().ordinary_mut(ctx.shadow)?.prototype = wrapped.as_object();
        self.heap_mut().ordinary_mut(ctx.shadow)?.prevent_extensions();
        Ok(())
    }

    fn install_lazy_accessors(&mut self, ctx: &TrapCtx) -> Result<(), MembraneError> {
        let (keys, _) = self.compute_exposed_keys(ctx)?;
        for key in keys {
            if self.heap().ordinary(ctx.shadow)?.has_own_property(&key) {
                continue;
            }
            let enumerable = self
                .heap()
                .ordinary(ctx.real_h)?
                .get_own_property(&key)
                .map(PropertyDescriptor::is_enumerable)
                .unwrap_or(true);
            self.install_lazy_accessor(ctx, key, enumerable)?;
        }
        Ok(())
    }

    /// A one-shot accessor: its getter resolves the wrapped real
    /// descriptor, installs it in place of itself, and returns the value.
    fn install_lazy_accessor(
        &mut self,
        ctx: &TrapCtx,
        key: PropertyKey,
        enumerable: bool,
    ) -> Result<(), MembraneError> {
        let weak = Rc::downgrade(&ctx.cylinder);
        let graph = ctx.graph.clone();
        let shadow = ctx.shadow;
        let getter_key = key.clone();
        let getter = self.heap_mut().alloc_function(
            0,
            Rc::new(move |m, this, _args| {
                let cylinder = weak.upgrade().ok_or(MembraneError::Revoked)?;
                m.promote_lazy(&graph, &cylinder, shadow, &getter_key, this)
            }),
        );
        self.heap_mut().ordinary_mut(ctx.shadow)?.properties.insert(
            key,
            PropertyDescriptor::Accessor {
                get: Some(getter),
                set: None,
                enumerable,
                configurable: true,
            },
        );
        Ok(())
    }

    /// First access through a lazy getter: resolve the current wrapped
    /// descriptor and replace the lazy slot with it. When the shadow has
    /// already lost configurability (seal/freeze after locking), the slot
    /// is swapped in place, preserving non-configurability.
    pub(crate) fn promote_lazy(
        &mut self,
        graph: &GraphName,
        cylinder: &CylinderRef,
        shadow: ObjectHandle,
        key: &PropertyKey,
        this_arg: Value,
    ) -> Result<Value, MembraneError> {
        let ctx = self.ctx_from_cylinder(graph, cylinder)?;
        let resolved = self.visible_own_descriptor(&ctx, key)?;

        let slot_configurable = {
            let shadow_obj = self.heap().ordinary(shadow)?;
            match shadow_obj.get_own_property(key) {
                Some(slot) => slot.is_configurable(),
                None => {
                    return Err(MembraneError::invariant(format!(
                        "lazy getter fired for '{key}' on a sealed shadow with no slot"
                    )))
                }
            }
        };

        match resolved {
            None => {
                if slot_configurable {
                    self.heap_mut().ordinary_mut(shadow)?.properties.remove(key);
                }
                Ok(Value::Undefined)
            }
            Some(mut desc) => {
                if !slot_configurable {
                    desc.set_non_configurable();
                }
                self.heap_mut()
                    .ordinary_mut(shadow)?
                    .properties
                    .insert(key.clone(), desc.clone());
                match desc {
                    PropertyDescriptor::Data { value, .. } => Ok(value),
                    PropertyDescriptor::Accessor { get: Some(g), .. } => {
                        self.call(Value::Object(g), this_arg, &[])
                    }
                    PropertyDescriptor::Accessor { get: None, .. } => Ok(Value::Undefined),
                }
            }
        }
    }

    // =======================================================================
    // Proxy notification
    // =======================================================================

    /// Register a proxy listener on a graph.
    pub fn add_proxy_listener(
        &mut self,
        graph: &GraphName,
        listener: Rc<dyn ProxyListener>,
    ) -> Result<(), MembraneError> {
        self.handler_mut(graph)?.proxy_listeners.push(listener);
        Ok(())
    }

    pub fn remove_proxy_listener(
        &mut self,
        graph: &GraphName,
        listener: &Rc<dyn ProxyListener>,
    ) -> Result<(), MembraneError> {
        self.handler_mut(graph)?
            .proxy_listeners
            .retain(|l| !Rc::ptr_eq(l, listener));
        Ok(())
    }

    /// Notify the origin handler's listeners, then the target handler's,
    /// applying rebuild / replacement / shadow-use actions afterwards.
    pub(crate) fn notify_proxy_listeners(
        &mut self,
        origin: &GraphName,
        target: &GraphName,
        cylinder: &CylinderRef,
        real: Value,
        proxy_h: ObjectHandle,
    ) -> Result<Value, MembraneError> {
        let real_h = real.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        self.handler_mut(target)?.in_construction.insert(real_h);

        let result = self
            .notify_one(origin, true, target, cylinder, &real, Value::Object(proxy_h))
            .and_then(|proxy| self.notify_one(target, false, target, cylinder, &real, proxy));

        self.handler_mut(target)?.in_construction.remove(&real_h);
        let finalizer_result = self.run_deferred_finalizers(target, real_h);
        match (result, finalizer_result) {
            (Ok(proxy), Ok(())) => Ok(proxy),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn notify_one(
        &mut self,
        listener_graph: &GraphName,
        is_origin: bool,
        target_graph: &GraphName,
        cylinder: &CylinderRef,
        real: &Value,
        proxy: Value,
    ) -> Result<Value, MembraneError> {
        let listeners = self.handler(listener_graph)?.proxy_listeners.clone();
        if listeners.is_empty() {
            return Ok(proxy);
        }

        let mut message = ProxyMessage::new(
            real.clone(),
            proxy,
            listener_graph.clone(),
            is_origin,
        );
        for listener in listeners {
            if let Err(error) = listener.handle_proxy(self, &mut message) {
                self.log(
                    LogLevel::Error,
                    "handler",
                    "proxy_listener_error",
                    error.to_string(),
                );
            }
            if let Some(error) = message.thrown.take() {
                return Err(error);
            }
            if message.stopped {
                break;
            }
        }

        let mut proxy = message.proxy.clone();
        if message.rebuild {
            proxy = self.rebuild_foreign_proxy(target_graph, cylinder)?;
        } else if proxy != message.original_proxy {
            let new_h = proxy.as_object().ok_or_else(|| {
                MembraneError::validation("listener substituted a non-object proxy")
            })?;
            self.install_replacement_proxy(target_graph, cylinder, new_h)?;
        }
        if let Some(mode) = message.shadow_mode {
            self.apply_shadow_use(target_graph, cylinder, mode)?;
        }
        Ok(proxy)
    }

    /// Replace the foreign proxy with a fresh one over the same shadow.
    pub(crate) fn rebuild_foreign_proxy(
        &mut self,
        graph: &GraphName,
        cylinder: &CylinderRef,
    ) -> Result<Value, MembraneError> {
        let (old, shadow) = cylinder
            .borrow()
            .foreign_handles(graph)
            .ok_or_else(|| MembraneError::validation(format!("graph '{graph}' holds no proxy")))?;
        let new_h = self.heap_mut().alloc_proxy(graph.clone(), None);
        cylinder
            .borrow_mut()
            .set_foreign(graph.clone(), new_h, shadow, true)?;
        if let Ok(state) = self.heap_mut().proxy_state_mut(old) {
            state.revoked = true;
        }
        self.map_kill(old);
        self.map_set(new_h, Rc::clone(cylinder))?;
        Ok(Value::Object(new_h))
    }

    /// Swap in an externally supplied proxy handle for a graph entry.
    pub(crate) fn install_replacement_proxy(
        &mut self,
        graph: &GraphName,
        cylinder: &CylinderRef,
        new_h: ObjectHandle,
    ) -> Result<(), MembraneError> {
        let (old, shadow) = cylinder
            .borrow()
            .foreign_handles(graph)
            .ok_or_else(|| MembraneError::validation(format!("graph '{graph}' holds no proxy")))?;
        if old == new_h {
            return Ok(());
        }
        cylinder
            .borrow_mut()
            .set_foreign(graph.clone(), new_h, shadow, true)?;
        if let Ok(state) = self.heap_mut().proxy_state_mut(old) {
            state.revoked = true;
        }
        self.map_kill(old);
        self.map_set(new_h, Rc::clone(cylinder))?;
        Ok(())
    }

    fn apply_shadow_use(
        &mut self,
        graph: &GraphName,
        cylinder: &CylinderRef,
        mode: ShadowUse,
    ) -> Result<(), MembraneError> {
        let ctx = self.ctx_from_cylinder(graph, cylinder)?;
        match mode {
            ShadowUse::Prepared => {
                self.install_lazy_accessors(&ctx)?;
                let wrapped = self.wrapped_prototype(&ctx)?;
                self.heap_mut().ordinary_mut(ctx.shadow)?.prototype = wrapped.as_object();
                Ok(())
            }
            ShadowUse::Sealed => {
                self.lock_shadow_for(graph, cylinder)?;
                self.heap_mut().ordinary_mut(ctx.shadow)?.seal();
                Ok(())
            }
            ShadowUse::Frozen => {
                self.lock_shadow_for(graph, cylinder)?;
                self.heap_mut().ordinary_mut(ctx.shadow)?.freeze();
                Ok(())
            }
        }
    }

    fn run_deferred_finalizers(
        &mut self,
        graph: &GraphName,
        real_h: ObjectHandle,
    ) -> Result<(), MembraneError> {
        let pending: Vec<Finalizer> = {
            let handler = self.handler_mut(graph)?;
            let (run, keep): (Vec<Finalizer>, Vec<Finalizer>) = handler
                .finalizers
                .drain(..)
                .partition(|f| matches!(f, Finalizer::LockShadow { real } if *real == real_h));
            handler.finalizers = keep;
            run
        };
        let mut ran: BTreeSet<ObjectHandle> = BTreeSet::new();
        for finalizer in pending {
            match finalizer {
                Finalizer::LockShadow { real } => {
                    if !ran.insert(real) {
                        continue;
                    }
                    if let Some(cylinder) = self.cylinder_for(real) {
                        self.lock_shadow_for(graph, &cylinder)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membrane::{ConvertOptions, MembraneConfig};

    fn wet() -> GraphName {
        GraphName::string("wet")
    }

    fn dry() -> GraphName {
        GraphName::string("dry")
    }

    fn setup() -> (Membrane, Value, Value) {
        let mut m = Membrane::new(MembraneConfig::default());
        m.get_handler_by_name(&wet(), true).expect("wet");
        m.get_handler_by_name(&dry(), true).expect("dry");
        let o = m.heap_mut().alloc_plain();
        m.heap_mut()
            .set_data_property(o, "x", Value::Int(10))
            .expect("x");
        let real = Value::Object(o);
        let proxy = m
            .convert_argument_to_proxy(&wet(), &dry(), real.clone(), ConvertOptions::default())
            .expect("convert");
        (m, real, proxy)
    }

    // -----------------------------------------------------------------------
    // 1. Lazy one-shot accessors on locked shadows
    // -----------------------------------------------------------------------

    #[test]
    fn lazy_getter_promotes_itself_on_first_read() {
        let (mut m, real, proxy) = setup();
        m.prevent_extensions(proxy).expect("prevent");

        let cylinder = m
            .cylinder_for(real.as_object().expect("object"))
            .expect("cylinder");
        let shadow = cylinder
            .borrow()
            .get_shadow_target(&dry())
            .expect("shadow");

        // Before the first read the slot is a one-shot accessor.
        assert!(matches!(
            m.heap()
                .ordinary(shadow)
                .expect("shadow")
                .get_own_property(&"x".into()),
            Some(PropertyDescriptor::Accessor { .. })
        ));

        assert_eq!(
            m.get(Value::Object(shadow), "x").expect("lazy read"),
            Value::Int(10)
        );

        // The lazy slot replaced itself with the wrapped data descriptor.
        assert!(matches!(
            m.heap()
                .ordinary(shadow)
                .expect("shadow")
                .get_own_property(&"x".into()),
            Some(PropertyDescriptor::Data { .. })
        ));
        assert_eq!(
            m.get(Value::Object(shadow), "x").expect("second read"),
            Value::Int(10)
        );
    }

    // -----------------------------------------------------------------------
    // 2. Re-entrancy: sealing during construction defers the lock
    // -----------------------------------------------------------------------

    struct SealingListener;

    impl ProxyListener for SealingListener {
        fn handle_proxy(
            &self,
            membrane: &mut Membrane,
            message: &mut ProxyMessage,
        ) -> Result<(), MembraneError> {
            membrane.prevent_extensions(message.proxy.clone())?;
            Ok(())
        }
    }

    #[test]
    fn sealing_during_construction_is_deferred_then_applied() {
        let mut m = Membrane::new(MembraneConfig::default());
        m.get_handler_by_name(&wet(), true).expect("wet");
        m.get_handler_by_name(&dry(), true).expect("dry");
        m.add_proxy_listener(&dry(), Rc::new(SealingListener) as Rc<dyn ProxyListener>)
            .expect("listener");

        let o = m.heap_mut().alloc_plain();
        m.heap_mut()
            .set_data_property(o, "x", Value::Int(10))
            .expect("x");
        let proxy = m
            .convert_argument_to_proxy(
                &wet(),
                &dry(),
                Value::Object(o),
                ConvertOptions::default(),
            )
            .expect("convert");

        // The deferred finalizer ran after notification: the shadow is
        // locked and the proxy reports non-extensible.
        assert!(!m.is_extensible(proxy.clone()).expect("extensible"));
        assert_eq!(m.get(proxy, "x").expect("read"), Value::Int(10));
    }

    // -----------------------------------------------------------------------
    // 3. Forwarding chain base bypasses wrapping
    // -----------------------------------------------------------------------

    #[test]
    fn forwarding_base_returns_unwrapped_references() {
        let (mut m, real, proxy) = setup();
        let child = m.heap_mut().alloc_plain();
        m.heap_mut()
            .set_data_property(real.as_object().expect("object"), "child", Value::Object(child))
            .expect("child");

        // Through the graph handler, the child is wrapped.
        let wrapped = m.get(proxy.clone(), "child").expect("wrapped");
        assert_ne!(wrapped, Value::Object(child));

        let chain = m
            .create_chain_handler(&dry(), crate::pipeline::ChainBase::Forwarding)
            .expect("chain");
        let forwarding = m.replace_proxy(&proxy, chain).expect("replace");

        // Through the forwarding base, the raw reference escapes mediation.
        assert_eq!(
            m.get(forwarding, "child").expect("forwarded"),
            Value::Object(child)
        );
    }
}
