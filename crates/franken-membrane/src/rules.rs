//! ModifyRules: per-proxy rule installation.
//!
//! Every entry point first asserts that the proxy really is what the named
//! graph currently sees for its cylinder; a mismatch is an ownership
//! violation. Rules mutate the cylinder's per-graph local state: local
//! stores, local deletes, own-keys filters, argument truncation, disabled
//! traps. Chain handlers and proxy replacement rewire how traps dispatch.

use std::rc::Rc;

use crate::cylinder::{
    disable_trap_flag, ArgLimit, KeyFilter, FLAG_REQUIRE_LOCAL_DELETE, FLAG_STORE_UNKNOWN_AS_LOCAL,
};
use crate::error::MembraneError;
use crate::membrane::Membrane;
use crate::object_model::{ChainHandlerId, GraphName, ObjectKind, Value};
use crate::pipeline::{ChainBase, ChainHandler, TrapName};
use crate::value_map::CylinderRef;

impl Membrane {
    /// The cylinder behind `proxy`, verified to be what `graph` sees.
    pub(crate) fn assert_proxy_in_graph(
        &self,
        graph: &GraphName,
        proxy: &Value,
    ) -> Result<CylinderRef, MembraneError> {
        self.handler(graph)?;
        let handle = proxy.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        let cylinder = self.cylinder_for(handle).ok_or_else(|| {
            MembraneError::ownership("value is not known to this membrane")
        })?;
        {
            let c = cylinder.borrow();
            if !c.has_graph(graph) {
                return Err(MembraneError::UnknownGraph {
                    graph: graph.clone(),
                });
            }
            if c.is_dead(graph) {
                return Err(MembraneError::DeadGraph {
                    graph: graph.clone(),
                });
            }
            if c.get_proxy(graph)? != *proxy {
                return Err(MembraneError::ownership(format!(
                    "value is not the current proxy for graph '{graph}'"
                )));
            }
        }
        Ok(cylinder)
    }

    /// Unknown property writes through this proxy become graph-local.
    pub fn store_unknown_as_local(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let result = cylinder
            .borrow_mut()
            .set_local_flag(graph, FLAG_STORE_UNKNOWN_AS_LOCAL, true);
        result
    }

    /// Deletes through this proxy become graph-local.
    pub fn require_local_delete(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let result = cylinder
            .borrow_mut()
            .set_local_flag(graph, FLAG_REQUIRE_LOCAL_DELETE, true);
        result
    }

    /// Install a graph-local descriptor: `key` shadows the real property
    /// for this graph only, and unmasks any local deletion of the key.
    pub fn set_local_descriptor(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
        key: impl Into<crate::object_model::PropertyKey>,
        desc: crate::object_model::PropertyDescriptor,
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let result = cylinder
            .borrow_mut()
            .set_local_descriptor(graph, key.into(), desc);
        result
    }

    /// Drop a graph-local descriptor, restoring visibility of the real
    /// property.
    pub fn unset_local_descriptor(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
        key: impl Into<crate::object_model::PropertyKey>,
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let result = cylinder
            .borrow_mut()
            .delete_local_descriptor(graph, &key.into(), false);
        result
    }

    /// Install (or clear, with `None`) an own-keys filter. Rejected once
    /// any shadow in the cylinder has lost extensibility: the exposed key
    /// set is pinned by then.
    pub fn filter_own_keys(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
        filter: Option<KeyFilter>,
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let shadows: Vec<_> = {
            let c = cylinder.borrow();
            c.foreign_graphs()
                .into_iter()
                .filter_map(|g| c.foreign_handles(&g).map(|(_, shadow)| shadow))
                .collect()
        };
        for shadow in shadows {
            if !self.heap().ordinary(shadow)?.extensible {
                return Err(MembraneError::rule_conflict(
                    "cannot filter own keys once a shadow is non-extensible",
                ));
            }
        }
        let result = cylinder.borrow_mut().set_own_keys_filter(graph, filter);
        result
    }

    /// Truncate call arguments through this function proxy.
    pub fn truncate_arg_list(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
        limit: ArgLimit,
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let real = cylinder.borrow().get_original()?;
        let real_h = real.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        if !matches!(self.heap().kind_of(real_h)?, ObjectKind::Function { .. }) {
            return Err(MembraneError::validation(
                "truncate_arg_list requires a function",
            ));
        }
        let result = cylinder
            .borrow_mut()
            .set_truncate_arg_list(graph, Some(limit));
        result
    }

    /// Disable the named traps for this proxy; each disabled trap fails
    /// with `TrapDisabled`.
    pub fn disable_traps(
        &mut self,
        graph: &GraphName,
        proxy: &Value,
        traps: &[TrapName],
    ) -> Result<(), MembraneError> {
        let cylinder = self.assert_proxy_in_graph(graph, proxy)?;
        let mut c = cylinder.borrow_mut();
        for trap in traps {
            c.set_local_flag(graph, &disable_trap_flag(*trap), true)?;
        }
        Ok(())
    }

    /// Create a chain handler over `graph`: its base is either
    /// Reflect-equivalent forwarding or the graph's own handler. The base
    /// and owning graph are fixed at creation; only the recognized trap
    /// names may be overridden.
    pub fn create_chain_handler(
        &mut self,
        graph: &GraphName,
        base: ChainBase,
    ) -> Result<ChainHandlerId, MembraneError> {
        self.handler(graph)?;
        if let ChainBase::Graph(base_graph) = &base {
            self.handler(base_graph)?;
            if base_graph != graph {
                return Err(MembraneError::rule_conflict(format!(
                    "chain handler base graph '{base_graph}' does not match graph '{graph}'"
                )));
            }
        }
        Ok(self.push_chain_handler(ChainHandler::new(graph.clone(), base)))
    }

    /// Install a new proxy over the existing shadow, served by `chain`.
    /// The superseded proxy is revoked and its map entry tombstoned.
    pub fn replace_proxy(
        &mut self,
        old_proxy: &Value,
        chain: ChainHandlerId,
    ) -> Result<Value, MembraneError> {
        let graph = self
            .chain_handler(chain)
            .ok_or_else(|| MembraneError::validation("unknown chain handler"))?
            .graph()
            .clone();
        let old_h = old_proxy.as_object().ok_or(MembraneError::PrimitiveWrap)?;
        let proxy_graph = self.heap().proxy_state(old_h)?.graph.clone();
        if proxy_graph != graph {
            return Err(MembraneError::rule_conflict(format!(
                "chain handler belongs to graph '{graph}', proxy to '{proxy_graph}'"
            )));
        }
        let cylinder = self.assert_proxy_in_graph(&graph, old_proxy)?;
        let shadow = cylinder.borrow().get_shadow_target(&graph)?;

        let new_h = self.heap_mut().alloc_proxy(graph.clone(), Some(chain));
        cylinder
            .borrow_mut()
            .set_foreign(graph.clone(), new_h, shadow, true)?;
        if let Ok(state) = self.heap_mut().proxy_state_mut(old_h) {
            state.revoked = true;
        }
        self.map_kill(old_h);
        self.map_set(new_h, Rc::clone(&cylinder))?;
        Ok(Value::Object(new_h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membrane::{ConvertOptions, MembraneConfig};
    use crate::object_model::{PropertyKey, Value};
    use crate::pipeline::{TrapReply, TrapRequest};

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
            .expect("wrap");
        (m, real, proxy)
    }

    // -----------------------------------------------------------------------
    // 1. Ownership assertions
    // -----------------------------------------------------------------------

    #[test]
    fn rules_reject_foreign_values() {
        let (mut m, real, proxy) = setup();
        // The real value is not what "dry" sees.
        assert!(m.store_unknown_as_local(&dry(), &real).is_err());
        // The proxy is not what "wet" sees.
        assert!(m.store_unknown_as_local(&wet(), &proxy).is_err());
        // Correct pairing works, on both sides.
        m.store_unknown_as_local(&dry(), &proxy).expect("dry rule");
        m.store_unknown_as_local(&wet(), &real).expect("wet rule");
    }

    #[test]
    fn rules_reject_primitives_and_strangers() {
        let (mut m, _, _) = setup();
        assert_eq!(
            m.require_local_delete(&dry(), &Value::Int(3)),
            Err(MembraneError::PrimitiveWrap)
        );
        let stranger = Value::Object(m.heap_mut().alloc_plain());
        assert!(m.require_local_delete(&dry(), &stranger).is_err());
    }

    // -----------------------------------------------------------------------
    // 2. filter_own_keys preconditions
    // -----------------------------------------------------------------------

    #[test]
    fn filter_rejected_after_shadow_lock() {
        let (mut m, _, proxy) = setup();
        m.prevent_extensions(proxy.clone()).expect("prevent");
        let err = m
            .filter_own_keys(
                &dry(),
                &proxy,
                Some(KeyFilter::allow_list([PropertyKey::from("x")])),
            )
            .expect_err("must conflict");
        assert!(matches!(err, MembraneError::RuleConflict { .. }));
    }

    // -----------------------------------------------------------------------
    // 3. truncate_arg_list preconditions
    // -----------------------------------------------------------------------

    #[test]
    fn truncate_requires_function() {
        let (mut m, _, proxy) = setup();
        assert!(m
            .truncate_arg_list(&dry(), &proxy, ArgLimit::Count(1))
            .is_err());
    }

    // -----------------------------------------------------------------------
    // 4. Chain handlers and replace_proxy
    // -----------------------------------------------------------------------

    #[test]
    fn chain_handler_base_graph_must_match() {
        let (mut m, _, _) = setup();
        assert!(m
            .create_chain_handler(&dry(), ChainBase::Graph(wet()))
            .is_err());
        m.create_chain_handler(&dry(), ChainBase::Graph(dry()))
            .expect("same graph");
        m.create_chain_handler(&dry(), ChainBase::Forwarding)
            .expect("forwarding");
    }

    #[test]
    fn replace_proxy_swaps_and_revokes_old() {
        let (mut m, _, proxy) = setup();
        let chain = m
            .create_chain_handler(&dry(), ChainBase::Graph(dry()))
            .expect("chain");
        m.chain_handler_mut(chain)
            .expect("chain")
            .set_trap(
                TrapName::Get,
                Rc::new(|_, req: &TrapRequest| {
                    let key = req.key.clone().expect("key");
                    if key == PropertyKey::from("hijacked") {
                        Ok(TrapReply::Value(Value::Int(777)))
                    } else {
                        Ok(TrapReply::Value(Value::Undefined))
                    }
                }),
            );

        let new_proxy = m.replace_proxy(&proxy, chain).expect("replace");
        assert_ne!(new_proxy, proxy);
        assert_eq!(
            m.get(new_proxy.clone(), "hijacked").expect("override"),
            Value::Int(777)
        );
        // The old proxy is revoked.
        assert_eq!(m.get(proxy, "x"), Err(MembraneError::Revoked));
    }

    #[test]
    fn replace_proxy_rejects_cross_graph_chain() {
        let (mut m, real, _) = setup();
        let chain = m
            .create_chain_handler(&wet(), ChainBase::Forwarding)
            .expect("chain");
        // Wrap the same value into a third graph; its proxy belongs to
        // "damp", not "wet".
        let damp = GraphName::string("damp");
        m.get_handler_by_name(&damp, true).expect("damp");
        let damp_proxy = m
            .convert_argument_to_proxy(&wet(), &damp, real, ConvertOptions::default())
            .expect("wrap");
        let err = m.replace_proxy(&damp_proxy, chain).expect_err("conflict");
        assert!(matches!(err, MembraneError::RuleConflict { .. }));
    }

    // -----------------------------------------------------------------------
    // 5. disable_traps
    // -----------------------------------------------------------------------

    #[test]
    fn disabled_trap_fails_deterministically() {
        let (mut m, _, proxy) = setup();
        m.disable_traps(&dry(), &proxy, &[TrapName::Get, TrapName::OwnKeys])
            .expect("disable");
        assert_eq!(
            m.get(proxy.clone(), "x"),
            Err(MembraneError::TrapDisabled {
                trap: TrapName::Get
            })
        );
        assert_eq!(
            m.own_keys(proxy.clone()),
            Err(MembraneError::TrapDisabled {
                trap: TrapName::OwnKeys
            })
        );
        // Undisabled traps keep working.
        assert!(m.has(proxy, "x").expect("has"));
    }
}
