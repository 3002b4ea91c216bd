//! Structured observability records.
//!
//! The membrane reports through in-process, serde-serializable records:
//! a general log channel behind the `MembraneLogger` sink, trap-trace
//! events appended by the pipeline's tracing stage, and function-call
//! events delivered to registered function listeners.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::MembraneError;
use crate::object_model::{GraphName, Value};
use crate::pipeline::TrapName;

// ---------------------------------------------------------------------------
// Log records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub component: String,
    pub event: String,
    pub detail: String,
}

impl LogRecord {
    pub fn new(
        level: LogLevel,
        component: impl Into<String>,
        event: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            level,
            component: component.into(),
            event: event.into(),
            detail: detail.into(),
        }
    }
}

/// Sink for membrane log records.
pub trait MembraneLogger {
    fn log(&self, record: LogRecord);
}

/// Buffering logger for tests and embedders without their own sink.
#[derive(Default)]
pub struct MemoryLogger {
    records: RefCell<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.borrow().clone()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

impl MembraneLogger for MemoryLogger {
    fn log(&self, record: LogRecord) {
        self.records.borrow_mut().push(record);
    }
}

// ---------------------------------------------------------------------------
// Trap trace events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapPhase {
    Enter,
    Exit,
}

/// One record appended by the tracing stage at trap entry and exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapTraceEvent {
    pub graph: GraphName,
    pub trap: TrapName,
    pub phase: TrapPhase,
    /// "ok" or the error display of a failed trap; empty on entry.
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// Function listener events
// ---------------------------------------------------------------------------

/// Why a function listener fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Enter,
    Return,
    Throw,
}

impl CallPhase {
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Return => "return",
            Self::Throw => "throw",
        }
    }
}

/// Event delivered to function listeners around `apply`/`construct`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEvent {
    pub reason: CallPhase,
    pub trap: TrapName,
    pub this_graph: GraphName,
    pub origin_graph: GraphName,
    /// The real function being invoked.
    pub target: Value,
    /// Return value on `Return`; absent otherwise.
    pub payload: Option<Value>,
    /// Error display on `Throw`; absent otherwise.
    pub error: Option<String>,
}

/// Observer of mediated function calls. Errors returned here are logged
/// and swallowed; they never interrupt the traced call.
pub trait FunctionListener {
    fn on_call(&self, event: &FunctionEvent) -> Result<(), MembraneError>;
}

/// Buffering function listener for tests.
#[derive(Default)]
pub struct RecordingFunctionListener {
    events: RefCell<Vec<FunctionEvent>>,
}

impl RecordingFunctionListener {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FunctionEvent> {
        self.events.borrow().clone()
    }
}

impl FunctionListener for RecordingFunctionListener {
    fn on_call(&self, event: &FunctionEvent) -> Result<(), MembraneError> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}
