//! Frozen primordials.
//!
//! Each membrane ships a fixed set of intrinsic constructors and their
//! prototypes, created at construction and frozen. The list is exposed
//! read-only; `DistortionsListener::ignore_primordials` adds it to the
//! pass-through set so shared intrinsics cross unwrapped.

use std::rc::Rc;

use crate::object_model::{ObjectHandle, ObjectHeap, PropertyDescriptor, Value};

/// Names of the shipped primordial constructors.
pub const PRIMORDIAL_NAMES: [&str; 8] = [
    "Object", "Function", "Array", "Boolean", "Number", "String", "Symbol", "Error",
];

fn define_frozen(heap: &mut ObjectHeap, on: ObjectHandle, key: &str, value: Value) {
    let object = heap.ordinary_mut(on).expect("primordial handle is live");
    object
        .define_own_property(key.into(), PropertyDescriptor::data_frozen(value))
        .expect("primordial object is extensible during setup");
}

/// Allocate and freeze the primordial set, returning constructors and
/// prototypes in declaration order.
pub(crate) fn install(heap: &mut ObjectHeap) -> Vec<Value> {
    let mut out = Vec::with_capacity(PRIMORDIAL_NAMES.len() * 2);
    for name in PRIMORDIAL_NAMES {
        let proto = heap.alloc_plain();
        let ctor = match name {
            "Object" => heap.alloc_function(
                1,
                Rc::new(|m, _this, _args| Ok(Value::Object(m.heap_mut().alloc_plain()))),
            ),
            "Array" => heap.alloc_function(
                1,
                Rc::new(|m, _this, _args| Ok(Value::Object(m.heap_mut().alloc_array()))),
            ),
            "Error" => heap.alloc_function(
                1,
                Rc::new(|m, _this, args| {
                    let handle = m.heap_mut().alloc_plain();
                    if let Some(message) = args.first() {
                        m.heap_mut()
                            .set_data_property(handle, "message", message.clone())?;
                    }
                    Ok(Value::Object(handle))
                }),
            ),
            _ => heap.alloc_function(
                1,
                Rc::new(|_m, _this, args| Ok(args.first().cloned().unwrap_or(Value::Undefined))),
            ),
        };

        define_frozen(heap, ctor, "name", Value::Str(name.to_string()));
        define_frozen(heap, ctor, "prototype", Value::Object(proto));
        define_frozen(heap, proto, "constructor", Value::Object(ctor));

        heap.ordinary_mut(ctor)
            .expect("constructor is live")
            .freeze();
        heap.ordinary_mut(proto)
            .expect("prototype is live")
            .freeze();

        out.push(Value::Object(ctor));
        out.push(Value::Object(proto));
    }
    out
}
