//! DistortionsListener: a declarative rule catalog applied at first
//! crossing.
//!
//! Configurations are keyed by exact value, by prototype (instances), or by
//! predicate, and translated into ModifyRules calls when the proxy listener
//! fires. An ignorable-value set feeds the membrane's pass-through filter.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cylinder::{ArgLimit, KeyFilter};
use crate::error::MembraneError;
use crate::handler::{ProxyListener, ProxyMessage, ShadowUse};
use crate::membrane::{Membrane, PassThroughFilter};
use crate::object_model::{GraphName, ObjectHandle, PropertyKey, Value};
use crate::pipeline::TrapName;

// ---------------------------------------------------------------------------
// Configuration shape
// ---------------------------------------------------------------------------

/// Argument-truncation setting in a distortions config; meaningful for
/// function values only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateSetting {
    Disabled,
    DeclaredArity,
    Count(u32),
}

impl TruncateSetting {
    fn as_arg_limit(self) -> Option<ArgLimit> {
        match self {
            Self::Disabled => None,
            Self::DeclaredArity => Some(ArgLimit::DeclaredArity),
            Self::Count(n) => Some(ArgLimit::Count(n)),
        }
    }
}

/// One distortion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionsConfig {
    /// `None` disables filtering; a list is an allow-list of exposed keys.
    pub filter_own_keys: Option<Vec<PropertyKey>>,
    /// Traps to keep enabled; every other trap is disabled.
    pub proxy_traps: Vec<TrapName>,
    pub store_unknown_as_local: bool,
    pub require_local_delete: bool,
    pub use_shadow_target: bool,
    pub truncate_arg_list: TruncateSetting,
}

/// The default configuration shape handed to embedders to edit.
pub fn sample_config(_is_function: bool) -> DistortionsConfig {
    DistortionsConfig {
        filter_own_keys: None,
        proxy_traps: TrapName::ALL.to_vec(),
        store_unknown_as_local: false,
        require_local_delete: false,
        use_shadow_target: false,
        truncate_arg_list: TruncateSetting::Disabled,
    }
}

/// How a value is keyed into the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionCategory {
    /// This exact value.
    Value,
    /// The value's `prototype` property, as an exact value.
    Prototype,
    /// Every instance whose prototype chain passes through the value's
    /// `prototype` property.
    Instance,
    /// Every element of an array-like value, as exact values.
    Iterable,
}

/// Predicate over candidate real values.
pub type ValuePredicate = Rc<dyn Fn(&Membrane, &Value) -> bool>;

// ---------------------------------------------------------------------------
// DistortionsListener
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DistortionsListener {
    by_value: RefCell<BTreeMap<ObjectHandle, DistortionsConfig>>,
    by_prototype: RefCell<BTreeMap<ObjectHandle, DistortionsConfig>>,
    filters: RefCell<Vec<(ValuePredicate, DistortionsConfig)>>,
    ignorable: Rc<RefCell<BTreeSet<ObjectHandle>>>,
}

impl DistortionsListener {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register `config` for `value` under the given category.
    pub fn add_listener(
        &self,
        membrane: &mut Membrane,
        value: &Value,
        category: DistortionCategory,
        config: DistortionsConfig,
    ) -> Result<(), MembraneError> {
        match category {
            DistortionCategory::Value => {
                let handle = value.as_object().ok_or(MembraneError::PrimitiveWrap)?;
                self.by_value.borrow_mut().insert(handle, config);
            }
            DistortionCategory::Prototype => {
                let proto = membrane.get(value.clone(), "prototype")?;
                let handle = proto.as_object().ok_or_else(|| {
                    MembraneError::validation("value has no object 'prototype' property")
                })?;
                self.by_value.borrow_mut().insert(handle, config);
            }
            DistortionCategory::Instance => {
                let proto = membrane.get(value.clone(), "prototype")?;
                let handle = proto.as_object().ok_or_else(|| {
                    MembraneError::validation("value has no object 'prototype' property")
                })?;
                self.by_prototype.borrow_mut().insert(handle, config);
            }
            DistortionCategory::Iterable => {
                let handle = value.as_object().ok_or(MembraneError::PrimitiveWrap)?;
                let elements: Vec<Value> = {
                    let object = membrane.heap().ordinary(handle)?;
                    object
                        .own_property_keys()
                        .into_iter()
                        .filter(|k| {
                            matches!(k, PropertyKey::String(s) if s.parse::<u64>().is_ok())
                        })
                        .filter_map(|k| {
                            object.get_own_property(&k).and_then(|d| d.value().cloned())
                        })
                        .collect()
                };
                let mut by_value = self.by_value.borrow_mut();
                for element in elements {
                    if let Some(h) = element.as_object() {
                        by_value.insert(h, config.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Register a config applying to every value the predicate accepts.
    pub fn add_filter(&self, predicate: ValuePredicate, config: DistortionsConfig) {
        self.filters.borrow_mut().push((predicate, config));
    }

    /// Add a value to the ignorable set consumed by the pass-through
    /// filter.
    pub fn ignore(&self, value: &Value) {
        if let Some(handle) = value.as_object() {
            self.ignorable.borrow_mut().insert(handle);
        }
    }

    /// Ignore the membrane's frozen primordials.
    pub fn ignore_primordials(&self, membrane: &Membrane) {
        for value in membrane.primordials().to_vec() {
            self.ignore(&value);
        }
    }

    /// A pass-through filter backed by the ignorable set; install it on
    /// the membrane or on individual graphs.
    pub fn pass_through_filter(&self) -> PassThroughFilter {
        let ignorable = Rc::clone(&self.ignorable);
        Rc::new(move |value: &Value| match value.as_object() {
            Some(handle) => ignorable.borrow().contains(&handle),
            None => false,
        })
    }

    /// Register this catalog as a proxy listener on `graph`.
    pub fn bind_to_handler(
        self: &Rc<Self>,
        membrane: &mut Membrane,
        graph: &GraphName,
    ) -> Result<(), MembraneError> {
        membrane.add_proxy_listener(graph, Rc::clone(self) as Rc<dyn ProxyListener>)
    }

    /// Lookup order: exact value, then the prototype instance map, then
    /// the first matching filter predicate.
    fn config_for(&self, membrane: &Membrane, real: &Value) -> Option<DistortionsConfig> {
        let handle = real.as_object()?;
        if let Some(config) = self.by_value.borrow().get(&handle) {
            return Some(config.clone());
        }
        {
            let by_prototype = self.by_prototype.borrow();
            if !by_prototype.is_empty() {
                let mut current = membrane.heap().ordinary(handle).ok()?.prototype;
                let mut seen = BTreeSet::new();
                while let Some(proto) = current {
                    if !seen.insert(proto) {
                        break;
                    }
                    if let Some(config) = by_prototype.get(&proto) {
                        return Some(config.clone());
                    }
                    current = membrane.heap().ordinary(proto).ok()?.prototype;
                }
            }
        }
        for (predicate, config) in self.filters.borrow().iter() {
            if predicate(membrane, real) {
                return Some(config.clone());
            }
        }
        None
    }

    /// Translate a configuration into ModifyRules calls against the
    /// notifying handler's graph: the real value on the origin side, the
    /// proxy elsewhere.
    pub fn apply_configuration(
        &self,
        membrane: &mut Membrane,
        config: &DistortionsConfig,
        message: &ProxyMessage,
    ) -> Result<(), MembraneError> {
        let graph = message.graph.clone();
        let subject = if message.is_origin_graph {
            message.target.clone()
        } else {
            message.proxy.clone()
        };

        if let Some(keys) = &config.filter_own_keys {
            membrane.filter_own_keys(
                &graph,
                &subject,
                Some(KeyFilter::allow_list(keys.iter().cloned())),
            )?;
        }

        let disabled: Vec<TrapName> = TrapName::ALL
            .into_iter()
            .filter(|t| !config.proxy_traps.contains(t))
            .collect();
        if !disabled.is_empty() {
            membrane.disable_traps(&graph, &subject, &disabled)?;
        }

        if config.store_unknown_as_local {
            membrane.store_unknown_as_local(&graph, &subject)?;
        }
        if config.require_local_delete {
            membrane.require_local_delete(&graph, &subject)?;
        }
        if let Some(limit) = config.truncate_arg_list.as_arg_limit() {
            membrane.truncate_arg_list(&graph, &subject, limit)?;
        }

        if !message.is_origin_graph {
            let real_extensible = match message.target.as_object() {
                Some(h) => membrane.heap().ordinary(h)?.extensible,
                None => true,
            };
            if !real_extensible {
                membrane.prevent_extensions(message.proxy.clone())?;
            }
        }
        Ok(())
    }
}

impl ProxyListener for DistortionsListener {
    fn handle_proxy(
        &self,
        membrane: &mut Membrane,
        message: &mut ProxyMessage,
    ) -> Result<(), MembraneError> {
        if let Some(handle) = message.target.as_object() {
            if self.ignorable.borrow().contains(&handle) {
                return Ok(());
            }
        }
        if let Some(config) = self.config_for(membrane, &message.target) {
            if config.use_shadow_target {
                message.use_shadow_target(ShadowUse::Prepared);
            }
            self.apply_configuration(membrane, &config, message)?;
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

    fn membrane_with_graphs() -> Membrane {
        let mut m = Membrane::new(MembraneConfig::default());
        m.get_handler_by_name(&wet(), true).expect("wet");
        m.get_handler_by_name(&dry(), true).expect("dry");
        m
    }

    #[test]
    fn sample_config_shape() {
        let config = sample_config(true);
        assert_eq!(config.proxy_traps.len(), 13);
        assert_eq!(config.filter_own_keys, None);
        assert!(!config.store_unknown_as_local);
        assert_eq!(config.truncate_arg_list, TruncateSetting::Disabled);

        let json = serde_json::to_string(&config).expect("serialize");
        let back: DistortionsConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }

    #[test]
    fn value_config_applies_on_first_crossing() {
        let mut m = membrane_with_graphs();
        let o = m.heap_mut().alloc_plain();
        m.heap_mut()
            .set_data_property(o, "x", Value::Int(10))
            .expect("x");
        m.heap_mut()
            .set_data_property(o, "y", Value::Str("s".to_string()))
            .expect("y");

        let distortions = DistortionsListener::new();
        let mut config = sample_config(false);
        config.filter_own_keys = Some(vec![PropertyKey::from("x")]);
        config.require_local_delete = true;
        distortions
            .add_listener(&mut m, &Value::Object(o), DistortionCategory::Value, config)
            .expect("add");
        distortions.bind_to_handler(&mut m, &dry()).expect("bind");

        let proxy = m
            .convert_argument_to_proxy(&wet(), &dry(), Value::Object(o), ConvertOptions::default())
            .expect("wrap");
        assert_eq!(m.keys(proxy.clone()).expect("keys"), vec!["x".to_string()]);
        assert!(!m.has(proxy.clone(), "y").expect("has"));

        // require_local_delete came from the config.
        assert!(m.delete_property(proxy.clone(), "x").expect("delete"));
        assert!(!m.has(proxy, "x").expect("has"));
        assert_eq!(
            m.get(Value::Object(o), "x").expect("raw"),
            Value::Int(10)
        );
    }

    #[test]
    fn instance_config_reaches_subclasses() {
        let mut m = membrane_with_graphs();
        // A constructor-shaped function with a prototype object.
        let ctor = m
            .heap_mut()
            .alloc_function(0, Rc::new(|_, _, _| Ok(Value::Undefined)));
        let proto = m.heap_mut().alloc_plain();
        m.heap_mut()
            .set_data_property(ctor, "prototype", Value::Object(proto))
            .expect("prototype");

        let instance = m.heap_mut().alloc(crate::object_model::ObjectKind::Plain, Some(proto));
        m.heap_mut()
            .set_data_property(instance, "secret", Value::Int(1))
            .expect("secret");
        m.heap_mut()
            .set_data_property(instance, "open", Value::Int(2))
            .expect("open");

        let distortions = DistortionsListener::new();
        let mut config = sample_config(false);
        config.filter_own_keys = Some(vec![PropertyKey::from("open")]);
        distortions
            .add_listener(
                &mut m,
                &Value::Object(ctor),
                DistortionCategory::Instance,
                config,
            )
            .expect("add");
        distortions.bind_to_handler(&mut m, &dry()).expect("bind");

        let proxy = m
            .convert_argument_to_proxy(
                &wet(),
                &dry(),
                Value::Object(instance),
                ConvertOptions::default(),
            )
            .expect("wrap");
        assert_eq!(m.keys(proxy).expect("keys"), vec!["open".to_string()]);
    }

    #[test]
    fn ignorable_values_pass_through() {
        let mut m = membrane_with_graphs();
        let shared = m.heap_mut().alloc_plain();

        let distortions = DistortionsListener::new();
        distortions.ignore(&Value::Object(shared));
        let filter = distortions.pass_through_filter();
        m.set_graph_pass_through(&wet(), Some(filter.clone()))
            .expect("wet filter");
        m.set_graph_pass_through(&dry(), Some(filter)).expect("dry filter");

        let crossed = m
            .convert_argument_to_proxy(
                &wet(),
                &dry(),
                Value::Object(shared),
                ConvertOptions::default(),
            )
            .expect("convert");
        assert_eq!(crossed, Value::Object(shared));
    }

    #[test]
    fn filter_predicate_is_last_resort() {
        let mut m = membrane_with_graphs();
        let o = m.heap_mut().alloc_plain();
        m.heap_mut()
            .set_data_property(o, "marker", Value::Bool(true))
            .expect("marker");
        m.heap_mut()
            .set_data_property(o, "hidden", Value::Int(3))
            .expect("hidden");

        let distortions = DistortionsListener::new();
        let mut config = sample_config(false);
        config.filter_own_keys = Some(vec![PropertyKey::from("marker")]);
        distortions.add_filter(
            Rc::new(|m: &Membrane, v: &Value| {
                v.as_object()
                    .and_then(|h| m.heap().ordinary(h).ok())
                    .map(|o| o.has_own_property(&PropertyKey::from("marker")))
                    .unwrap_or(false)
            }),
            config,
        );
        distortions.bind_to_handler(&mut m, &dry()).expect("bind");

        let proxy = m
            .convert_argument_to_proxy(&wet(), &dry(), Value::Object(o), ConvertOptions::default())
            .expect("wrap");
        assert_eq!(m.keys(proxy).expect("keys"), vec!["marker".to_string()]);
    }
}
