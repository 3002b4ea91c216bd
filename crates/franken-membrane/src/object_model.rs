//! Object model mediated by the membrane.
//!
//! Property descriptors (data vs accessor), prototype chains, an arena heap
//! of ordinary objects and membrane proxies, and a native-function table.
//! Primitives are never wrapped by the membrane; only `Value::Object`
//! references cross graph boundaries through proxies.
//!
//! `BTreeMap`/`BTreeSet` for deterministic ordering.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::MembraneError;
use crate::membrane::Membrane;

/// Maximum prototype chain depth to prevent runaway walks.
pub(crate) const MAX_PROTOTYPE_CHAIN_DEPTH: u32 = 1024;

// ---------------------------------------------------------------------------
// SymbolId / PropertyKey
// ---------------------------------------------------------------------------

/// Unique symbol identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SymbolId(pub u32);

/// A property key: either a string or a symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    String(String),
    Symbol(SymbolId),
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Symbol(id) => write!(f, "Symbol({})", id.0),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

// ---------------------------------------------------------------------------
// GraphName — identifier of one object graph
// ---------------------------------------------------------------------------

/// Name of an object graph: a string, or a private symbol for graphs that
/// must not be discoverable by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GraphName {
    String(String),
    Symbol(SymbolId),
}

impl GraphName {
    pub fn string(name: impl Into<String>) -> Self {
        Self::String(name.into())
    }

    /// Printable form, used by the `membraneGraphName` sentinel property.
    pub fn as_display_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Symbol(id) => format!("Symbol({})", id.0),
        }
    }
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_display_string())
    }
}

impl From<&str> for GraphName {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque handle referencing an object on the managed heap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectHandle(pub u32);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Index into the heap's native-function table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FunctionId(pub u32);

/// Routing tag for proxies served by a replaced (chain) handler instead of
/// the graph's base handler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChainHandlerId(pub u32);

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Runtime value. Everything but `Object` is a primitive and passes through
/// the membrane unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Symbol(SymbolId),
    Object(ObjectHandle),
}

impl Value {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Self::Object(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(h) => Some(*h),
            _ => None,
        }
    }

    /// SameValue comparison.
    pub fn same_value(&self, other: &Self) -> bool {
        self == other
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "number",
            Self::Str(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Object(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Symbol(id) => write!(f, "Symbol({})", id.0),
            Self::Object(h) => write!(f, "[{h}]"),
        }
    }
}

impl From<ObjectHandle> for Value {
    fn from(h: ObjectHandle) -> Self {
        Self::Object(h)
    }
}

// ---------------------------------------------------------------------------
// ObjectKind — structural classification
// ---------------------------------------------------------------------------

/// Structural kind of a heap object. Shadow targets are created with the
/// same kind as the real value they mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Plain,
    Array,
    Function {
        /// Declared arity, consulted by argument truncation.
        arity: u32,
        /// Host callback backing this function, if any. Shadows of
        /// functions carry `None`.
        native: Option<FunctionId>,
    },
}

impl ObjectKind {
    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function { .. })
    }

    /// Kind for a shadow of this kind: same shape, no native backing.
    pub fn shadow_kind(&self) -> Self {
        match self {
            Self::Function { arity, .. } => Self::Function {
                arity: *arity,
                native: None,
            },
            other => *other,
        }
    }
}

// ---------------------------------------------------------------------------
// PropertyDescriptor
// ---------------------------------------------------------------------------

/// Property descriptor: tagged data vs accessor variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyDescriptor {
    Data {
        value: Value,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    },
    Accessor {
        get: Option<ObjectHandle>,
        set: Option<ObjectHandle>,
        enumerable: bool,
        configurable: bool,
    },
}

impl PropertyDescriptor {
    /// Default data descriptor (writable, enumerable, configurable).
    pub fn data(value: Value) -> Self {
        Self::Data {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Non-writable, non-enumerable, non-configurable data descriptor.
    pub fn data_frozen(value: Value) -> Self {
        Self::Data {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }

    pub fn is_configurable(&self) -> bool {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => *configurable,
        }
    }

    pub fn is_enumerable(&self) -> bool {
        match self {
            Self::Data { enumerable, .. } | Self::Accessor { enumerable, .. } => *enumerable,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_accessor(&self) -> bool {
        matches!(self, Self::Accessor { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Data { value, .. } => Some(value),
            Self::Accessor { .. } => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Self::Data { writable, .. } => *writable,
            Self::Accessor { .. } => false,
        }
    }

    pub fn set_non_configurable(&mut self) {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => {
                *configurable = false;
            }
        }
    }

    pub fn set_configurable(&mut self, flag: bool) {
        match self {
            Self::Data { configurable, .. } | Self::Accessor { configurable, .. } => {
                *configurable = flag;
            }
        }
    }

    pub fn set_non_writable(&mut self) {
        if let Self::Data { writable, .. } = self {
            *writable = false;
        }
    }
}

// ---------------------------------------------------------------------------
// OrdinaryObject
// ---------------------------------------------------------------------------

/// An ordinary object with internal slots `[[Prototype]]`, `[[Extensible]]`
/// and an own-property map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdinaryObject {
    pub prototype: Option<ObjectHandle>,
    pub extensible: bool,
    pub properties: BTreeMap<PropertyKey, PropertyDescriptor>,
    pub kind: ObjectKind,
}

impl OrdinaryObject {
    pub fn new(kind: ObjectKind, prototype: Option<ObjectHandle>) -> Self {
        Self {
            prototype,
            extensible: true,
            properties: BTreeMap::new(),
            kind,
        }
    }

    // -- [[GetOwnProperty]] -------------------------------------------------

    pub fn get_own_property(&self, key: &PropertyKey) -> Option<&PropertyDescriptor> {
        self.properties.get(key)
    }

    pub fn has_own_property(&self, key: &PropertyKey) -> bool {
        self.properties.contains_key(key)
    }

    // -- [[DefineOwnProperty]] ----------------------------------------------

    /// Define or update a property. Returns `Ok(true)` on success,
    /// `Ok(false)` when rejected by a non-configurable conflict or a
    /// non-extensible object.
    pub fn define_own_property(
        &mut self,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, MembraneError> {
        if let Some(current) = self.properties.get(&key) {
            if !current.is_configurable() {
                if desc.is_configurable() {
                    return Ok(false);
                }
                if desc.is_enumerable() != current.is_enumerable() {
                    return Ok(false);
                }
                if current.is_data() != desc.is_data() {
                    return Ok(false);
                }
                if let (
                    PropertyDescriptor::Data {
                        writable: current_w,
                        value: current_v,
                        ..
                    },
                    PropertyDescriptor::Data {
                        writable: new_w,
                        value: new_v,
                        ..
                    },
                ) = (current, &desc)
                {
                    if !current_w {
                        if *new_w {
                            return Ok(false);
                        }
                        if !current_v.same_value(new_v) {
                            return Ok(false);
                        }
                    }
                }
                if let (
                    PropertyDescriptor::Accessor {
                        get: cur_get,
                        set: cur_set,
                        ..
                    },
                    PropertyDescriptor::Accessor {
                        get: new_get,
                        set: new_set,
                        ..
                    },
                ) = (current, &desc)
                {
                    if cur_get != new_get || cur_set != new_set {
                        return Ok(false);
                    }
                }
            }
            self.properties.insert(key, desc);
            Ok(true)
        } else {
            if !self.extensible {
                return Ok(false);
            }
            self.properties.insert(key, desc);
            Ok(true)
        }
    }

    // -- [[Delete]] ----------------------------------------------------------

    /// Delete a property. `false` when the property is non-configurable.
    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        match self.properties.get(key) {
            Some(desc) if !desc.is_configurable() => false,
            Some(_) => {
                self.properties.remove(key);
                true
            }
            None => true,
        }
    }

    // -- [[OwnPropertyKeys]] -------------------------------------------------

    /// Own keys in canonical order: integer indices numerically, then
    /// string keys, then symbol keys.
    pub fn own_property_keys(&self) -> Vec<PropertyKey> {
        let mut int_keys: Vec<(u64, PropertyKey)> = Vec::new();
        let mut str_keys: Vec<PropertyKey> = Vec::new();
        let mut sym_keys: Vec<PropertyKey> = Vec::new();

        for key in self.properties.keys() {
            match key {
                PropertyKey::String(s) => {
                    if let Ok(n) = s.parse::<u64>() {
                        int_keys.push((n, key.clone()));
                    } else {
                        str_keys.push(key.clone());
                    }
                }
                PropertyKey::Symbol(_) => sym_keys.push(key.clone()),
            }
        }

        int_keys.sort_by_key(|(n, _)| *n);
        let mut result: Vec<PropertyKey> = int_keys.into_iter().map(|(_, k)| k).collect();
        result.extend(str_keys);
        result.extend(sym_keys);
        result
    }

    // -- Extensibility -------------------------------------------------------

    pub fn prevent_extensions(&mut self) {
        self.extensible = false;
    }

    pub fn freeze(&mut self) {
        self.extensible = false;
        for desc in self.properties.values_mut() {
            desc.set_non_configurable();
            desc.set_non_writable();
        }
    }

    pub fn seal(&mut self) {
        self.extensible = false;
        for desc in self.properties.values_mut() {
            desc.set_non_configurable();
        }
    }

    pub fn is_frozen(&self) -> bool {
        !self.extensible
            && self.properties.values().all(|d| {
                !d.is_configurable()
                    && match d {
                        PropertyDescriptor::Data { writable, .. } => !writable,
                        PropertyDescriptor::Accessor { .. } => true,
                    }
            })
    }

    pub fn is_sealed(&self) -> bool {
        !self.extensible && self.properties.values().all(|d| !d.is_configurable())
    }
}

// ---------------------------------------------------------------------------
// Membrane proxies on the heap
// ---------------------------------------------------------------------------

/// Internal state of a membrane proxy. The apparent target the proxy layer
/// observes is the shadow stored on the value's cylinder; the proxy itself
/// only records how to route traps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembraneProxyState {
    /// Graph this proxy lives in.
    pub graph: GraphName,
    /// When set, traps route through the replaced (chain) handler.
    pub chain: Option<ChainHandlerId>,
    /// Flipped by revocation; every subsequent trap fails.
    pub revoked: bool,
}

/// A heap object: ordinary, or a membrane proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HeapObject {
    Ordinary(OrdinaryObject),
    Proxy(MembraneProxyState),
}

// ---------------------------------------------------------------------------
// Native functions
// ---------------------------------------------------------------------------

/// Host callback backing a function object. Receives the membrane (for
/// re-entrant mediation), the `this` value, and the argument list.
pub type NativeFunction =
    Rc<dyn Fn(&mut Membrane, Value, &[Value]) -> Result<Value, MembraneError>>;

// ---------------------------------------------------------------------------
// ObjectHeap
// ---------------------------------------------------------------------------

/// Arena of heap objects plus the native-function table and symbol
/// allocator.
pub struct ObjectHeap {
    objects: Vec<HeapObject>,
    natives: Vec<NativeFunction>,
    next_symbol: u32,
}

impl fmt::Debug for ObjectHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("objects", &self.objects.len())
            .field("natives", &self.natives.len())
            .field("next_symbol", &self.next_symbol)
            .finish()
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            natives: Vec::new(),
            next_symbol: 1,
        }
    }

    // -- allocation ----------------------------------------------------------

    pub fn alloc(&mut self, kind: ObjectKind, prototype: Option<ObjectHandle>) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects
            .push(HeapObject::Ordinary(OrdinaryObject::new(kind, prototype)));
        handle
    }

    pub fn alloc_plain(&mut self) -> ObjectHandle {
        self.alloc(ObjectKind::Plain, None)
    }

    pub fn alloc_array(&mut self) -> ObjectHandle {
        self.alloc(ObjectKind::Array, None)
    }

    /// Allocate a function object backed by a host callback.
    pub fn alloc_function(&mut self, arity: u32, native: NativeFunction) -> ObjectHandle {
        let id = FunctionId(self.natives.len() as u32);
        self.natives.push(native);
        self.alloc(
            ObjectKind::Function {
                arity,
                native: Some(id),
            },
            None,
        )
    }

    pub fn alloc_proxy(&mut self, graph: GraphName, chain: Option<ChainHandlerId>) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects.push(HeapObject::Proxy(MembraneProxyState {
            graph,
            chain,
            revoked: false,
        }));
        handle
    }

    pub fn alloc_symbol(&mut self) -> SymbolId {
        let id = SymbolId(self.next_symbol);
        self.next_symbol += 1;
        id
    }

    // -- access --------------------------------------------------------------

    pub fn get(&self, handle: ObjectHandle) -> Result<&HeapObject, MembraneError> {
        self.objects
            .get(handle.0 as usize)
            .ok_or(MembraneError::ObjectNotFound { handle })
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut HeapObject, MembraneError> {
        self.objects
            .get_mut(handle.0 as usize)
            .ok_or(MembraneError::ObjectNotFound { handle })
    }

    /// The ordinary object behind `handle`, or a type error for proxies.
    pub fn ordinary(&self, handle: ObjectHandle) -> Result<&OrdinaryObject, MembraneError> {
        match self.get(handle)? {
            HeapObject::Ordinary(o) => Ok(o),
            HeapObject::Proxy(_) => Err(MembraneError::type_error(format!(
                "{handle} is a proxy; operation requires an ordinary object"
            ))),
        }
    }

    pub fn ordinary_mut(
        &mut self,
        handle: ObjectHandle,
    ) -> Result<&mut OrdinaryObject, MembraneError> {
        match self.get_mut(handle)? {
            HeapObject::Ordinary(o) => Ok(o),
            HeapObject::Proxy(_) => Err(MembraneError::type_error(format!(
                "{handle} is a proxy; operation requires an ordinary object"
            ))),
        }
    }

    pub fn is_proxy(&self, handle: ObjectHandle) -> bool {
        matches!(self.get(handle), Ok(HeapObject::Proxy(_)))
    }

    pub fn proxy_state(&self, handle: ObjectHandle) -> Result<&MembraneProxyState, MembraneError> {
        match self.get(handle)? {
            HeapObject::Proxy(p) => Ok(p),
            HeapObject::Ordinary(_) => Err(MembraneError::type_error(format!(
                "{handle} is not a membrane proxy"
            ))),
        }
    }

    pub fn proxy_state_mut(
        &mut self,
        handle: ObjectHandle,
    ) -> Result<&mut MembraneProxyState, MembraneError> {
        match self.get_mut(handle)? {
            HeapObject::Proxy(p) => Ok(p),
            HeapObject::Ordinary(_) => Err(MembraneError::type_error(format!(
                "{handle} is not a membrane proxy"
            ))),
        }
    }

    /// Structural kind of an ordinary object; proxies report the kind of
    /// nothing here (callers resolve through the cylinder first).
    pub fn kind_of(&self, handle: ObjectHandle) -> Result<ObjectKind, MembraneError> {
        Ok(self.ordinary(handle)?.kind)
    }

    pub fn is_callable(&self, handle: ObjectHandle) -> bool {
        match self.get(handle) {
            Ok(HeapObject::Ordinary(o)) => o.kind.is_function(),
            _ => false,
        }
    }

    pub fn native(&self, id: FunctionId) -> Option<NativeFunction> {
        self.natives.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    // -- convenience ---------------------------------------------------------

    /// Define a default data property on an ordinary object.
    pub fn set_data_property(
        &mut self,
        handle: ObjectHandle,
        key: impl Into<PropertyKey>,
        value: Value,
    ) -> Result<bool, MembraneError> {
        self.ordinary_mut(handle)?
            .define_own_property(key.into(), PropertyDescriptor::data(value))
    }
}
