//! Quantified membrane invariants.

use frankenengine_membrane::{
    ConvertOptions, GraphName, KeyFilter, Membrane, MembraneConfig, MembraneError,
    PropertyDescriptor, PropertyKey, Value, GRAPH_NAME_SENTINEL,
};

fn wet() -> GraphName {
    GraphName::string("wet")
}

fn dry() -> GraphName {
    GraphName::string("dry")
}

fn membrane() -> Membrane {
    let mut m = Membrane::new(MembraneConfig::default());
    m.get_handler_by_name(&wet(), true).expect("wet handler");
    m.get_handler_by_name(&dry(), true).expect("dry handler");
    m
}

fn convert(m: &mut Membrane, from: &GraphName, to: &GraphName, v: Value) -> Value {
    m.convert_argument_to_proxy(from, to, v, ConvertOptions::default())
        .expect("convert")
}

fn object_with_x(m: &mut Membrane) -> Value {
    let o = m.heap_mut().alloc_plain();
    m.heap_mut()
        .set_data_property(o, "x", Value::Int(10))
        .expect("x");
    Value::Object(o)
}

// ---------------------------------------------------------------------------
// 1. Identity preservation
// ---------------------------------------------------------------------------

#[test]
fn identity_preservation() {
    let mut m = membrane();
    let o = object_with_x(&mut m);

    let p1 = convert(&mut m, &wet(), &dry(), o.clone());
    let p2 = convert(&mut m, &wet(), &dry(), o.clone());
    assert_eq!(p1, p2);

    // Unwrapping the proxy lands on the original value.
    let back = convert(&mut m, &dry(), &wet(), p1);
    assert_eq!(back, o);
}

// ---------------------------------------------------------------------------
// 2. Primitive transparency
// ---------------------------------------------------------------------------

#[test]
fn primitive_transparency() {
    let mut m = membrane();
    for v in [
        Value::Undefined,
        Value::Null,
        Value::Bool(true),
        Value::Int(42),
        Value::Str("s".to_string()),
    ] {
        let crossed = convert(&mut m, &wet(), &dry(), v.clone());
        assert_eq!(crossed, v);
        assert!(!m.has_proxy_for_value(&dry(), &v));
    }
}

// ---------------------------------------------------------------------------
// 3. Filter invisibility
// ---------------------------------------------------------------------------

#[test]
fn filter_invisibility() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    m.heap_mut()
        .set_data_property(o.as_object().expect("object"), "y", Value::Int(2))
        .expect("y");
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    m.filter_own_keys(
        &dry(),
        &p,
        Some(KeyFilter::allow_list([PropertyKey::from("x")])),
    )
    .expect("filter");

    assert!(!m.has(p.clone(), "y").expect("has"));
    assert_eq!(
        m.get_own_property_descriptor(p.clone(), "y").expect("desc"),
        None
    );
    assert_eq!(m.keys(p.clone()).expect("keys"), vec!["x".to_string()]);

    // define and delete of the hidden key succeed without touching the
    // real side.
    assert!(m
        .define_property(p.clone(), "y", PropertyDescriptor::data(Value::Int(5)))
        .expect("define"));
    assert!(m.delete_property(p, "y").expect("delete"));
    assert_eq!(m.get(o, "y").expect("raw y"), Value::Int(2));
}

// ---------------------------------------------------------------------------
// 4. Local-first layering
// ---------------------------------------------------------------------------

#[test]
fn local_first_layering() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    m.set_local_descriptor(&dry(), &p, "x", PropertyDescriptor::data(Value::Int(99)))
        .expect("local");
    assert_eq!(m.get(p.clone(), "x").expect("local x"), Value::Int(99));
    assert_eq!(m.get(o.clone(), "x").expect("raw x"), Value::Int(10));

    // A second graph sees the real value, not the dry-local one.
    let damp = GraphName::string("damp");
    m.get_handler_by_name(&damp, true).expect("damp handler");
    let q = convert(&mut m, &wet(), &damp, o.clone());
    assert_eq!(m.get(q, "x").expect("damp x"), Value::Int(10));

    m.unset_local_descriptor(&dry(), &p, "x").expect("unset");
    assert_eq!(m.get(p, "x").expect("restored x"), Value::Int(10));
}

// ---------------------------------------------------------------------------
// 5. Revocation totality
// ---------------------------------------------------------------------------

#[test]
fn revocation_totality() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o);

    m.revoke_everything(&dry()).expect("revoke");

    assert_eq!(m.get(p.clone(), "x"), Err(MembraneError::Revoked));
    assert_eq!(m.has(p.clone(), "x"), Err(MembraneError::Revoked));
    assert_eq!(m.own_keys(p.clone()), Err(MembraneError::Revoked));
    assert_eq!(
        m.get_own_property_descriptor(p.clone(), "x"),
        Err(MembraneError::Revoked)
    );
    assert_eq!(
        m.define_property(p.clone(), "z", PropertyDescriptor::data(Value::Int(1))),
        Err(MembraneError::Revoked)
    );
    assert_eq!(m.delete_property(p.clone(), "x"), Err(MembraneError::Revoked));
    assert_eq!(m.get_prototype_of(p.clone()), Err(MembraneError::Revoked));
    assert_eq!(m.is_extensible(p.clone()), Err(MembraneError::Revoked));
    assert_eq!(m.prevent_extensions(p), Err(MembraneError::Revoked));
}

#[test]
fn revoke_mapping_kills_one_cylinder_only() {
    let mut m = membrane();
    let o1 = object_with_x(&mut m);
    let o2 = object_with_x(&mut m);
    let p1 = convert(&mut m, &wet(), &dry(), o1.clone());
    let p2 = convert(&mut m, &wet(), &dry(), o2);

    m.revoke_mapping(&o1).expect("revoke one");
    assert_eq!(m.get(p1, "x"), Err(MembraneError::Revoked));
    assert_eq!(m.get(p2, "x").expect("p2 alive"), Value::Int(10));
    // The real value keeps its identity.
    assert_eq!(m.get(o1, "x").expect("raw"), Value::Int(10));
}

// ---------------------------------------------------------------------------
// 6. Round-trip descriptor
// ---------------------------------------------------------------------------

#[test]
fn descriptor_round_trip_is_a_noop() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    let desc = m
        .get_own_property_descriptor(p.clone(), "x")
        .expect("read")
        .expect("present");
    assert!(m.define_property(p.clone(), "x", desc).expect("write back"));

    assert_eq!(m.get(p, "x").expect("proxy x"), Value::Int(10));
    assert_eq!(m.get(o, "x").expect("raw x"), Value::Int(10));
}

#[test]
fn object_valued_descriptors_wrap_their_value() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let child = m.heap_mut().alloc_plain();
    m.heap_mut()
        .set_data_property(child, "n", Value::Int(1))
        .expect("n");
    m.heap_mut()
        .set_data_property(o.as_object().expect("object"), "child", Value::Object(child))
        .expect("child");

    let p = convert(&mut m, &wet(), &dry(), o);
    let desc = m
        .get_own_property_descriptor(p.clone(), "child")
        .expect("read")
        .expect("present");
    let wrapped_child = desc.value().cloned().expect("data descriptor");
    assert!(wrapped_child.is_object());
    assert_ne!(wrapped_child, Value::Object(child));
    assert_eq!(m.get(wrapped_child.clone(), "n").expect("n"), Value::Int(1));
    // Identity: the property read produces the same proxy.
    assert_eq!(m.get(p, "child").expect("get child"), wrapped_child);
}

// ---------------------------------------------------------------------------
// 7. Own-keys cache coherence
// ---------------------------------------------------------------------------

#[test]
fn own_keys_cache_invalidated_by_real_mutation() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    assert_eq!(m.keys(p.clone()).expect("keys"), vec!["x".to_string()]);

    m.heap_mut()
        .set_data_property(o.as_object().expect("object"), "z", Value::Int(3))
        .expect("z");
    assert_eq!(
        m.keys(p).expect("keys"),
        vec!["x".to_string(), "z".to_string()]
    );
}

// ---------------------------------------------------------------------------
// 8. Invariant mirror
// ---------------------------------------------------------------------------

#[test]
fn non_extensible_real_propagates() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    m.prevent_extensions(o.clone()).expect("prevent");

    let p = convert(&mut m, &wet(), &dry(), o);
    assert!(!m.is_extensible(p.clone()).expect("extensible"));
    assert_eq!(m.keys(p).expect("keys"), vec!["x".to_string()]);
}

#[test]
fn prevent_extensions_through_proxy_locks_both_sides() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    assert!(m.is_extensible(p.clone()).expect("extensible"));
    assert!(m.prevent_extensions(p.clone()).expect("prevent"));
    assert!(!m.is_extensible(p.clone()).expect("extensible"));
    assert!(!m.is_extensible(o).expect("real extensible"));
    assert_eq!(m.keys(p).expect("keys"), vec!["x".to_string()]);
}

// ---------------------------------------------------------------------------
// Graph-name sentinel
// ---------------------------------------------------------------------------

#[test]
fn graph_name_sentinel_exposed_when_enabled() {
    let mut m = Membrane::new(MembraneConfig {
        show_graph_name: true,
        ..MembraneConfig::default()
    });
    m.get_handler_by_name(&wet(), true).expect("wet handler");
    m.get_handler_by_name(&dry(), true).expect("dry handler");

    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o);

    assert_eq!(
        m.get(p.clone(), GRAPH_NAME_SENTINEL).expect("sentinel"),
        Value::Str("dry".to_string())
    );
    assert!(m.has(p.clone(), GRAPH_NAME_SENTINEL).expect("has"));
    assert!(m
        .own_keys(p.clone())
        .expect("keys")
        .contains(&PropertyKey::from(GRAPH_NAME_SENTINEL)));
    // The sentinel cannot be defined away.
    assert!(!m
        .define_property(
            p,
            GRAPH_NAME_SENTINEL,
            PropertyDescriptor::data(Value::Int(0))
        )
        .expect("define"));
}

#[test]
fn sentinel_is_ordinary_when_disabled() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    assert!(!m.has(p.clone(), GRAPH_NAME_SENTINEL).expect("has"));
    assert!(m
        .define_property(
            p.clone(),
            GRAPH_NAME_SENTINEL,
            PropertyDescriptor::data(Value::Int(1))
        )
        .expect("define"));
    assert_eq!(m.get(p, GRAPH_NAME_SENTINEL).expect("get"), Value::Int(1));
    assert_eq!(
        m.get(o, GRAPH_NAME_SENTINEL).expect("raw"),
        Value::Int(1)
    );
}
