//! Object-graph membrane.
//!
//! A membrane is a mediating boundary between named object graphs: a value
//! owned by one graph is exposed to another only through an interposed
//! proxy, so property accesses, mutations, prototype walks, function calls,
//! and lifetime operations observed on one side are reflected, transformed,
//! or denied on the other.
//!
//! - **Cylinders** bind one real value to its proxy in every graph it
//!   crosses into, plus per-graph local rules.
//! - **Graph handlers** implement the 13 traps, enforce language
//!   invariants against shadow targets, and re-wrap crossing values.
//! - **ModifyRules** installs per-proxy distortions: local stores, local
//!   deletes, own-keys filters, argument truncation, disabled traps.
//! - **DistortionsListener** applies declarative configurations at first
//!   crossing.
//! - **Revocation** is total: a revoked graph fails every subsequent trap.
//!
//! `BTreeMap`/`BTreeSet` for deterministic ordering.
//! `#![forbid(unsafe_code)]` — no unsafe anywhere.

#![forbid(unsafe_code)]

pub mod cylinder;
pub mod distortions;
pub mod error;
pub mod events;
pub mod handler;
pub mod membrane;
pub mod object_model;
pub mod pipeline;
pub mod primordials;
pub mod rules;
pub mod shadow;
pub mod value_map;

pub use cylinder::{
    disable_trap_flag, ArgLimit, CachedOwnKeys, EntryState, KeyFilter, ProxyCylinder,
    FLAG_REQUIRE_LOCAL_DELETE, FLAG_STORE_UNKNOWN_AS_LOCAL,
};
pub use distortions::{
    sample_config, DistortionCategory, DistortionsConfig, DistortionsListener, TruncateSetting,
    ValuePredicate,
};
pub use error::MembraneError;
pub use events::{
    CallPhase, FunctionEvent, FunctionListener, LogLevel, LogRecord, MembraneLogger,
    MemoryLogger, RecordingFunctionListener, TrapPhase, TrapTraceEvent,
};
pub use handler::{ObjectGraphHandler, ProxyListener, ProxyMessage, ShadowUse};
pub use membrane::{
    ConvertOptions, GraphDispatch, Membrane, MembraneConfig, PassThroughFilter,
    GRAPH_NAME_SENTINEL,
};
pub use object_model::{
    ChainHandlerId, FunctionId, GraphName, HeapObject, MembraneProxyState, NativeFunction,
    ObjectHandle, ObjectHeap, ObjectKind, OrdinaryObject, PropertyDescriptor, PropertyKey,
    SymbolId, Value,
};
pub use pipeline::{
    ChainBase, ChainHandler, HandlerPipeline, PipelineNode, StagePhase, TrapName, TrapOverride,
    TrapReply, TrapRequest,
};
pub use primordials::PRIMORDIAL_NAMES;
pub use shadow::make_shadow_target;
pub use value_map::{CylinderRef, MembraneValueMap};
