//! Error taxonomy for the membrane engine.
//!
//! One crate-wide enum: validation failures and contract violations are
//! returned synchronously; errors raised inside user callbacks (getters,
//! setters, function bodies, listeners) propagate through the traps
//! untouched except where a notify loop explicitly swallows them.

use serde::{Deserialize, Serialize};

use crate::object_model::{GraphName, ObjectHandle};
use crate::pipeline::TrapName;

/// Failures surfaced by membrane operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MembraneError {
    /// Caller attempted to wrap or bind a primitive where an object was
    /// required.
    #[error("primitive value cannot be wrapped or bound")]
    PrimitiveWrap,

    /// A cylinder or membrane lookup named a graph that was never
    /// registered.
    #[error("unknown graph '{graph}'")]
    UnknownGraph { graph: GraphName },

    /// The named graph exists on the cylinder but has been marked dead.
    #[error("graph '{graph}' is dead")]
    DeadGraph { graph: GraphName },

    /// The cylinder's origin field was never populated.
    #[error("original value has not been set")]
    OriginalNotSet,

    /// A proxy/handler pair does not belong to this membrane or graph.
    #[error("ownership violation: {detail}")]
    GraphOwnershipViolation { detail: String },

    /// Re-registering an already-initialized graph without override.
    #[error("graph '{graph}' is already registered")]
    DuplicateGraph { graph: GraphName },

    /// A host-language proxy invariant was violated: a non-configurable
    /// descriptor rejected by the shadow, a non-extensible shadow rejecting
    /// a new key, or a lazy getter discovering a sealed shadow.
    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },

    /// The trap has been explicitly disabled for this proxy.
    #[error("trap '{trap}' is disabled for this proxy")]
    TrapDisabled { trap: TrapName },

    /// Operation on a revoked proxy, a revoked graph, or a proxy whose
    /// origin graph has died.
    #[error("proxy has been revoked")]
    Revoked,

    /// A rule-modification request conflicts with established state, such
    /// as filtering own keys on a non-extensible proxy.
    #[error("rule conflict: {detail}")]
    RuleConflict { detail: String },

    /// Bad argument shape: non-function listener, wrong value type, and so
    /// on.
    #[error("validation failure: {detail}")]
    ValidationFailure { detail: String },

    /// Heap handle does not name a live object.
    #[error("{handle} not found")]
    ObjectNotFound { handle: ObjectHandle },

    /// TypeError in the mediated object model (non-callable call target,
    /// accessor misuse, and similar).
    #[error("type error: {detail}")]
    TypeError { detail: String },

    /// Prototype chain cycle detected while walking `[[Prototype]]` links.
    #[error("prototype chain cycle detected")]
    PrototypeCycleDetected,

    /// Prototype chain exceeded the engine's depth bound.
    #[error("prototype chain depth {depth} exceeds max {max}")]
    PrototypeChainTooDeep { depth: u32, max: u32 },
}

impl MembraneError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::ValidationFailure {
            detail: detail.into(),
        }
    }

    pub fn type_error(detail: impl Into<String>) -> Self {
        Self::TypeError {
            detail: detail.into(),
        }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            detail: detail.into(),
        }
    }

    pub fn ownership(detail: impl Into<String>) -> Self {
        Self::GraphOwnershipViolation {
            detail: detail.into(),
        }
    }

    pub fn rule_conflict(detail: impl Into<String>) -> Self {
        Self::RuleConflict {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_coverage() {
        let errors = [
            MembraneError::PrimitiveWrap,
            MembraneError::UnknownGraph {
                graph: GraphName::string("wet"),
            },
            MembraneError::DeadGraph {
                graph: GraphName::string("dry"),
            },
            MembraneError::OriginalNotSet,
            MembraneError::ownership("not ours"),
            MembraneError::DuplicateGraph {
                graph: GraphName::string("wet"),
            },
            MembraneError::invariant("shadow sealed"),
            MembraneError::TrapDisabled {
                trap: TrapName::Get,
            },
            MembraneError::Revoked,
            MembraneError::rule_conflict("non-extensible"),
            MembraneError::validation("bad listener"),
            MembraneError::ObjectNotFound {
                handle: ObjectHandle(9),
            },
            MembraneError::type_error("not callable"),
            MembraneError::PrototypeCycleDetected,
            MembraneError::PrototypeChainTooDeep { depth: 10, max: 5 },
        ];
        for e in errors {
            assert!(!e.to_string().is_empty());
        }
    }

    #[test]
    fn error_serde_roundtrip() {
        let errors = [
            MembraneError::Revoked,
            MembraneError::TrapDisabled {
                trap: TrapName::OwnKeys,
            },
            MembraneError::DeadGraph {
                graph: GraphName::string("damp"),
            },
        ];
        for e in errors {
            let json = serde_json::to_string(&e).expect("serialize");
            let back: MembraneError = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(e, back);
        }
    }
}
