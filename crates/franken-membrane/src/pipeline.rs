//! Per-graph handler pipeline and chain handlers.
//!
//! Each graph's effective handler is an ordered list of mediation stages
//! terminating at the base graph handler: tracing, argument validation,
//! forwarding, shadow conversion, application-inserted chain handlers,
//! shadow update, and return validation. Chain handlers hold per-trap
//! overrides; traps they do not override fall through to the next stage.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::MembraneError;
use crate::membrane::Membrane;
use crate::object_model::{
    ChainHandlerId, GraphName, ObjectHandle, PropertyDescriptor, PropertyKey, Value,
};

// ---------------------------------------------------------------------------
// TrapName — the 13 intercepted operations
// ---------------------------------------------------------------------------

/// One of the 13 intercepted meta-object operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TrapName {
    GetPrototypeOf,
    SetPrototypeOf,
    IsExtensible,
    PreventExtensions,
    GetOwnPropertyDescriptor,
    DefineProperty,
    Has,
    Get,
    Set,
    DeleteProperty,
    OwnKeys,
    Apply,
    Construct,
}

impl TrapName {
    pub const ALL: [Self; 13] = [
        Self::GetPrototypeOf,
        Self::SetPrototypeOf,
        Self::IsExtensible,
        Self::PreventExtensions,
        Self::GetOwnPropertyDescriptor,
        Self::DefineProperty,
        Self::Has,
        Self::Get,
        Self::Set,
        Self::DeleteProperty,
        Self::OwnKeys,
        Self::Apply,
        Self::Construct,
    ];

    pub const fn as_label(self) -> &'static str {
        match self {
            Self::GetPrototypeOf => "getPrototypeOf",
            Self::SetPrototypeOf => "setPrototypeOf",
            Self::IsExtensible => "isExtensible",
            Self::PreventExtensions => "preventExtensions",
            Self::GetOwnPropertyDescriptor => "getOwnPropertyDescriptor",
            Self::DefineProperty => "defineProperty",
            Self::Has => "has",
            Self::Get => "get",
            Self::Set => "set",
            Self::DeleteProperty => "deleteProperty",
            Self::OwnKeys => "ownKeys",
            Self::Apply => "apply",
            Self::Construct => "construct",
        }
    }
}

impl fmt::Display for TrapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

// ---------------------------------------------------------------------------
// Trap requests and replies for chain-handler overrides
// ---------------------------------------------------------------------------

/// Arguments of an intercepted operation, handed to chain-handler
/// overrides.
#[derive(Debug, Clone, Default)]
pub struct TrapRequest {
    pub trap: Option<TrapName>,
    pub proxy: Option<Value>,
    pub key: Option<PropertyKey>,
    pub value: Option<Value>,
    pub desc: Option<PropertyDescriptor>,
    pub receiver: Option<Value>,
    pub this_arg: Option<Value>,
    pub args: Vec<Value>,
    pub new_target: Option<Value>,
    pub proto: Option<Value>,
}

/// Result of an intercepted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TrapReply {
    Value(Value),
    Bool(bool),
    Keys(Vec<PropertyKey>),
    MaybeDescriptor(Option<PropertyDescriptor>),
}

impl TrapReply {
    pub fn into_value(self) -> Result<Value, MembraneError> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(MembraneError::validation(format!(
                "trap override returned {other:?}, expected a value"
            ))),
        }
    }

    pub fn into_bool(self) -> Result<bool, MembraneError> {
        match self {
            Self::Bool(b) => Ok(b),
            other => Err(MembraneError::validation(format!(
                "trap override returned {other:?}, expected a boolean"
            ))),
        }
    }

    pub fn into_keys(self) -> Result<Vec<PropertyKey>, MembraneError> {
        match self {
            Self::Keys(keys) => Ok(keys),
            other => Err(MembraneError::validation(format!(
                "trap override returned {other:?}, expected a key list"
            ))),
        }
    }

    pub fn into_maybe_descriptor(self) -> Result<Option<PropertyDescriptor>, MembraneError> {
        match self {
            Self::MaybeDescriptor(d) => Ok(d),
            other => Err(MembraneError::validation(format!(
                "trap override returned {other:?}, expected an optional descriptor"
            ))),
        }
    }
}

/// A per-trap override installed on a chain handler.
pub type TrapOverride = Rc<dyn Fn(&mut Membrane, &TrapRequest) -> Result<TrapReply, MembraneError>>;

// ---------------------------------------------------------------------------
// ChainHandler
// ---------------------------------------------------------------------------

/// Base a chain handler falls through to when a trap is not overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBase {
    /// Reflect-equivalent direct forwarding to the real value, without
    /// membrane wrapping.
    Forwarding,
    /// Fall through to the named graph's base handler.
    Graph(GraphName),
}

/// A derived handler whose base and owning graph cannot be reassigned once
/// created; only the recognized trap names may be overridden.
pub struct ChainHandler {
    graph: GraphName,
    base: ChainBase,
    overrides: BTreeMap<TrapName, TrapOverride>,
}

impl fmt::Debug for ChainHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHandler")
            .field("graph", &self.graph)
            .field("base", &self.base)
            .field(
                "overrides",
                &self.overrides.keys().copied().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ChainHandler {
    pub(crate) fn new(graph: GraphName, base: ChainBase) -> Self {
        Self {
            graph,
            base,
            overrides: BTreeMap::new(),
        }
    }

    pub fn graph(&self) -> &GraphName {
        &self.graph
    }

    pub fn base(&self) -> &ChainBase {
        &self.base
    }

    /// Install an override for one trap. The trap name set is closed; the
    /// enum makes unrecognized names unrepresentable.
    pub fn set_trap(&mut self, trap: TrapName, f: TrapOverride) {
        self.overrides.insert(trap, f);
    }

    pub fn clear_trap(&mut self, trap: TrapName) {
        self.overrides.remove(&trap);
    }

    pub fn override_for(&self, trap: TrapName) -> Option<TrapOverride> {
        self.overrides.get(&trap).cloned()
    }

    pub fn has_override(&self, trap: TrapName) -> bool {
        self.overrides.contains_key(&trap)
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Named phases of the per-graph pipeline, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Tracing,
    GraphInvariantIn,
    Forwarding,
    ConvertFromShadow,
    Inserted,
    UpdateShadow,
    GraphInvariantOut,
}

impl StagePhase {
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Tracing => "tracing",
            Self::GraphInvariantIn => "invariant-in",
            Self::Forwarding => "forwarding",
            Self::ConvertFromShadow => "convert-from-shadow",
            Self::Inserted => "inserted",
            Self::UpdateShadow => "update-shadow",
            Self::GraphInvariantOut => "invariant-out",
        }
    }
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One node of a graph's pipeline.
#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub name: String,
    pub phase: StagePhase,
    /// Chain handler consulted when this is an inserted node.
    pub chain: Option<ChainHandlerId>,
    /// When set, the node applies only to traps on this shadow target.
    pub insert_target: Option<ObjectHandle>,
}

impl PipelineNode {
    pub fn inserted(
        name: impl Into<String>,
        chain: ChainHandlerId,
        insert_target: Option<ObjectHandle>,
    ) -> Self {
        Self {
            name: name.into(),
            phase: StagePhase::Inserted,
            chain: Some(chain),
            insert_target,
        }
    }

    fn builtin(phase: StagePhase) -> Self {
        Self {
            name: phase.as_label().to_string(),
            phase,
            chain: None,
            insert_target: None,
        }
    }
}

/// A graph's ordered stage list, terminating at the base graph handler
/// (which is implicit: it runs after every node).
#[derive(Debug, Clone, Default)]
pub struct HandlerPipeline {
    nodes: Vec<PipelineNode>,
}

impl HandlerPipeline {
    /// The full pipeline used by the current graph owner.
    pub fn standard() -> Self {
        Self {
            nodes: vec![
                PipelineNode::builtin(StagePhase::GraphInvariantIn),
                PipelineNode::builtin(StagePhase::Forwarding),
                PipelineNode::builtin(StagePhase::ConvertFromShadow),
                PipelineNode::builtin(StagePhase::UpdateShadow),
                PipelineNode::builtin(StagePhase::GraphInvariantOut),
            ],
        }
    }

    /// The legacy minimal pipeline: terminal handler only.
    pub fn legacy() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn nodes(&self) -> &[PipelineNode] {
        &self.nodes
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn has_phase(&self, phase: StagePhase) -> bool {
        self.nodes.iter().any(|n| n.phase == phase)
    }

    pub fn has_tracing(&self) -> bool {
        self.has_phase(StagePhase::Tracing)
    }

    /// Prepend the tracing stage if absent.
    pub fn enable_tracing(&mut self) {
        if !self.has_tracing() {
            self.nodes.insert(0, PipelineNode::builtin(StagePhase::Tracing));
        }
    }

    /// Insert `node` after the named lead node. The lead must exist and the
    /// new node's name must be unique in this pipeline.
    pub fn insert_handler(
        &mut self,
        lead_name: &str,
        node: PipelineNode,
    ) -> Result<(), MembraneError> {
        if self.find(&node.name).is_some() {
            return Err(MembraneError::validation(format!(
                "pipeline node '{}' already exists",
                node.name
            )));
        }
        let lead = self.find(lead_name).ok_or_else(|| {
            MembraneError::validation(format!("pipeline lead node '{lead_name}' does not exist"))
        })?;
        self.nodes.insert(lead + 1, node);
        Ok(())
    }

    /// Chain handlers applicable to a trap on `shadow`, in pipeline order.
    pub fn inserted_chains(&self, shadow: Option<ObjectHandle>) -> Vec<ChainHandlerId> {
        self.nodes
            .iter()
            .filter(|n| n.phase == StagePhase::Inserted)
            .filter(|n| match (n.insert_target, shadow) {
                (None, _) => true,
                (Some(t), Some(s)) => t == s,
                (Some(_), None) => false,
            })
            .filter_map(|n| n.chain)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // 1. TrapName labels
    // -----------------------------------------------------------------------

    #[test]
    fn trap_names_cover_all_thirteen() {
        assert_eq!(TrapName::ALL.len(), 13);
        let mut labels: Vec<&str> = TrapName::ALL.iter().map(|t| t.as_label()).collect();
        labels.dedup();
        assert_eq!(labels.len(), 13);
    }

    #[test]
    fn trap_name_serde_uses_camel_case() {
        let json = serde_json::to_string(&TrapName::GetOwnPropertyDescriptor).expect("serialize");
        assert_eq!(json, "\"getOwnPropertyDescriptor\"");
    }

    // -----------------------------------------------------------------------
    // 2. TrapReply coercions
    // -----------------------------------------------------------------------

    #[test]
    fn trap_reply_coercions() {
        assert_eq!(
            TrapReply::Bool(true).into_bool().expect("bool"),
            true
        );
        assert!(TrapReply::Bool(true).into_value().is_err());
        assert!(TrapReply::Value(Value::Int(1)).into_keys().is_err());
        assert_eq!(
            TrapReply::MaybeDescriptor(None)
                .into_maybe_descriptor()
                .expect("descriptor"),
            None
        );
    }

    // -----------------------------------------------------------------------
    // 3. Pipeline shape
    // -----------------------------------------------------------------------

    #[test]
    fn standard_pipeline_phases_in_forward_order() {
        let p = HandlerPipeline::standard();
        let phases: Vec<StagePhase> = p.nodes().iter().map(|n| n.phase).collect();
        assert_eq!(
            phases,
            vec![
                StagePhase::GraphInvariantIn,
                StagePhase::Forwarding,
                StagePhase::ConvertFromShadow,
                StagePhase::UpdateShadow,
                StagePhase::GraphInvariantOut,
            ]
        );
    }

    #[test]
    fn tracing_prepends_once() {
        let mut p = HandlerPipeline::standard();
        p.enable_tracing();
        p.enable_tracing();
        assert_eq!(p.nodes()[0].phase, StagePhase::Tracing);
        assert_eq!(
            p.nodes()
                .iter()
                .filter(|n| n.phase == StagePhase::Tracing)
                .count(),
            1
        );
    }

    #[test]
    fn insert_handler_validates_lead() {
        let mut p = HandlerPipeline::standard();
        let node = PipelineNode::inserted("app-stage", ChainHandlerId(0), None);
        assert!(p.insert_handler("no-such-lead", node.clone()).is_err());
        p.insert_handler("convert-from-shadow", node)
            .expect("insert");
        let idx = p.find("app-stage").expect("inserted");
        assert_eq!(p.nodes()[idx - 1].name, "convert-from-shadow");
    }

    #[test]
    fn insert_handler_rejects_duplicate_name() {
        let mut p = HandlerPipeline::standard();
        p.insert_handler(
            "forwarding",
            PipelineNode::inserted("app-stage", ChainHandlerId(0), None),
        )
        .expect("insert");
        assert!(p
            .insert_handler(
                "forwarding",
                PipelineNode::inserted("app-stage", ChainHandlerId(1), None),
            )
            .is_err());
    }

    #[test]
    fn inserted_chains_respect_target_scope() {
        let mut p = HandlerPipeline::standard();
        p.insert_handler(
            "forwarding",
            PipelineNode::inserted("global-stage", ChainHandlerId(0), None),
        )
        .expect("insert");
        p.insert_handler(
            "global-stage",
            PipelineNode::inserted("scoped-stage", ChainHandlerId(1), Some(ObjectHandle(7))),
        )
        .expect("insert");

        assert_eq!(
            p.inserted_chains(Some(ObjectHandle(7))),
            vec![ChainHandlerId(0), ChainHandlerId(1)]
        );
        assert_eq!(
            p.inserted_chains(Some(ObjectHandle(8))),
            vec![ChainHandlerId(0)]
        );
        assert_eq!(p.inserted_chains(None), vec![ChainHandlerId(0)]);
    }

    // -----------------------------------------------------------------------
    // 4. Chain handlers
    // -----------------------------------------------------------------------

    #[test]
    fn chain_handler_override_lifecycle() {
        let mut ch = ChainHandler::new(GraphName::string("dry"), ChainBase::Forwarding);
        assert!(!ch.has_override(TrapName::Get));
        ch.set_trap(
            TrapName::Get,
            Rc::new(|_, _| Ok(TrapReply::Value(Value::Int(5)))),
        );
        assert!(ch.has_override(TrapName::Get));
        assert!(ch.override_for(TrapName::Get).is_some());
        ch.clear_trap(TrapName::Get);
        assert!(!ch.has_override(TrapName::Get));
    }
}
