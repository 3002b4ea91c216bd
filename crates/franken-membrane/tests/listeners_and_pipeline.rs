//! Proxy listeners, structured logging, tracing, and the handler pipeline.

use std::cell::RefCell;
use std::rc::Rc;

use frankenengine_membrane::{
    ChainBase, ConvertOptions, GraphName, LogLevel, Membrane, MembraneConfig, MembraneError,
    MembraneLogger, MemoryLogger, PipelineNode, ProxyListener, ProxyMessage, ShadowUse,
    TrapName, TrapPhase, TrapReply, TrapRequest, Value,
};

fn wet() -> GraphName {
    GraphName::string("wet")
}

fn dry() -> GraphName {
    GraphName::string("dry")
}

fn membrane_with(config: MembraneConfig) -> Membrane {
    let mut m = Membrane::new(config);
    m.get_handler_by_name(&wet(), true).expect("wet handler");
    m.get_handler_by_name(&dry(), true).expect("dry handler");
    m
}

fn membrane() -> Membrane {
    membrane_with(MembraneConfig::default())
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
// Proxy listener plumbing
// ---------------------------------------------------------------------------

struct NamedListener {
    name: &'static str,
    log: Rc<RefCell<Vec<String>>>,
    stop: bool,
    fail: bool,
    shadow_mode: Option<ShadowUse>,
}

impl NamedListener {
    fn new(name: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Rc<Self> {
        Rc::new(Self {
            name,
            log: Rc::clone(log),
            stop: false,
            fail: false,
            shadow_mode: None,
        })
    }
}

impl ProxyListener for NamedListener {
    fn handle_proxy(
        &self,
        _membrane: &mut Membrane,
        message: &mut ProxyMessage,
    ) -> Result<(), MembraneError> {
        self.log.borrow_mut().push(format!(
            "{}:{}:{}",
            self.name,
            message.graph,
            if message.is_origin_graph { "origin" } else { "foreign" }
        ));
        if let Some(mode) = self.shadow_mode {
            message.use_shadow_target(mode);
        }
        if self.stop {
            message.stop_iteration();
        }
        if self.fail {
            return Err(MembraneError::validation("listener failure"));
        }
        Ok(())
    }
}

#[test]
fn listeners_fire_origin_handler_first() {
    let mut m = membrane();
    let log = Rc::new(RefCell::new(Vec::new()));
    let wet_listener = NamedListener::new("w", &log);
    let dry_listener = NamedListener::new("d", &log);
    m.add_proxy_listener(&wet(), wet_listener as Rc<dyn ProxyListener>)
        .expect("wet listener");
    m.add_proxy_listener(&dry(), dry_listener as Rc<dyn ProxyListener>)
        .expect("dry listener");

    let o = object_with_x(&mut m);
    convert(&mut m, &wet(), &dry(), o);

    assert_eq!(
        log.borrow().clone(),
        vec!["w:wet:origin".to_string(), "d:dry:foreign".to_string()]
    );
}

#[test]
fn stop_iteration_skips_later_listeners() {
    let mut m = membrane();
    let log = Rc::new(RefCell::new(Vec::new()));
    let first = Rc::new(NamedListener {
        name: "first",
        log: Rc::clone(&log),
        stop: true,
        fail: false,
        shadow_mode: None,
    });
    let second = NamedListener::new("second", &log);
    m.add_proxy_listener(&dry(), first as Rc<dyn ProxyListener>)
        .expect("first");
    m.add_proxy_listener(&dry(), second as Rc<dyn ProxyListener>)
        .expect("second");

    let o = object_with_x(&mut m);
    convert(&mut m, &wet(), &dry(), o);

    assert_eq!(log.borrow().len(), 1);
}

struct ThrowingListener;

impl ProxyListener for ThrowingListener {
    fn handle_proxy(
        &self,
        _membrane: &mut Membrane,
        message: &mut ProxyMessage,
    ) -> Result<(), MembraneError> {
        message.throw_exception(MembraneError::validation("crossing denied"));
        Ok(())
    }
}

#[test]
fn throw_exception_aborts_the_crossing() {
    let mut m = membrane();
    m.add_proxy_listener(&dry(), Rc::new(ThrowingListener) as Rc<dyn ProxyListener>)
        .expect("listener");

    let o = object_with_x(&mut m);
    let result = m.convert_argument_to_proxy(&wet(), &dry(), o, ConvertOptions::default());
    assert_eq!(
        result,
        Err(MembraneError::ValidationFailure {
            detail: "crossing denied".to_string()
        })
    );
}

#[test]
fn listener_errors_are_swallowed_and_logged() {
    let logger = MemoryLogger::new();
    let mut m = membrane_with(MembraneConfig {
        logger: Some(Rc::clone(&logger) as Rc<dyn MembraneLogger>),
        ..MembraneConfig::default()
    });
    let log = Rc::new(RefCell::new(Vec::new()));
    let failing = Rc::new(NamedListener {
        name: "failing",
        log: Rc::clone(&log),
        stop: false,
        fail: true,
        shadow_mode: None,
    });
    let after = NamedListener::new("after", &log);
    m.add_proxy_listener(&dry(), failing as Rc<dyn ProxyListener>)
        .expect("failing");
    m.add_proxy_listener(&dry(), after as Rc<dyn ProxyListener>)
        .expect("after");

    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o);
    assert_eq!(m.get(p, "x").expect("proxy works"), Value::Int(10));

    // Both listeners ran; the failure went to the log.
    assert_eq!(log.borrow().len(), 2);
    let records = logger.records();
    assert!(records
        .iter()
        .any(|r| r.level == LogLevel::Error && r.event == "proxy_listener_error"));
}

#[test]
fn use_shadow_target_prepared_keeps_the_proxy_working() {
    let mut m = membrane();
    let log = Rc::new(RefCell::new(Vec::new()));
    let preparing = Rc::new(NamedListener {
        name: "preparing",
        log,
        stop: false,
        fail: false,
        shadow_mode: Some(ShadowUse::Prepared),
    });
    m.add_proxy_listener(&dry(), preparing as Rc<dyn ProxyListener>)
        .expect("listener");

    let o = object_with_x(&mut m);
    m.heap_mut()
        .set_data_property(o.as_object().expect("object"), "y", Value::Int(2))
        .expect("y");

    let p = convert(&mut m, &wet(), &dry(), o);
    assert_eq!(m.get(p.clone(), "x").expect("x"), Value::Int(10));
    assert_eq!(m.get(p, "y").expect("y"), Value::Int(2));
}

// ---------------------------------------------------------------------------
// warn_once and structured logging
// ---------------------------------------------------------------------------

#[test]
fn warn_once_deduplicates() {
    let logger = MemoryLogger::new();
    let mut m = membrane_with(MembraneConfig {
        logger: Some(Rc::clone(&logger) as Rc<dyn MembraneLogger>),
        ..MembraneConfig::default()
    });

    m.warn_once("deprecated thing");
    m.warn_once("deprecated thing");
    m.warn_once("other thing");

    let records = logger.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.level == LogLevel::Warn));
}

// ---------------------------------------------------------------------------
// Tracing stage
// ---------------------------------------------------------------------------

#[test]
fn tracing_records_trap_entry_and_exit() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o);

    m.enable_tracing(&dry()).expect("tracing");
    assert_eq!(m.get(p.clone(), "x").expect("x"), Value::Int(10));

    let events = m.drain_trace_events();
    assert!(!events.is_empty());
    assert_eq!(events[0].trap, TrapName::Get);
    assert_eq!(events[0].phase, TrapPhase::Enter);
    let exit = events
        .iter()
        .rev()
        .find(|e| e.trap == TrapName::Get && e.phase == TrapPhase::Exit)
        .expect("exit event");
    assert_eq!(exit.outcome, "ok");

    // Errors show up in the exit outcome.
    m.disable_traps(&dry(), &p, &[TrapName::Get]).expect("disable");
    let _ = m.get(p, "x");
    let events = m.drain_trace_events();
    let exit = events
        .iter()
        .find(|e| e.trap == TrapName::Get && e.phase == TrapPhase::Exit)
        .expect("exit event");
    assert!(exit.outcome.contains("disabled"));
}

// ---------------------------------------------------------------------------
// Pipeline-inserted chain handlers
// ---------------------------------------------------------------------------

#[test]
fn pipeline_dispatch_supports_inserted_stages() {
    let mut m = Membrane::new(MembraneConfig {
        refactor: Some("0.10".to_string()),
        ..MembraneConfig::default()
    });
    m.get_handler_by_name(&wet(), true).expect("wet handler");
    m.get_handler_by_name(&dry(), true).expect("dry handler");

    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o);

    let chain = m
        .create_chain_handler(&dry(), ChainBase::Graph(dry()))
        .expect("chain");
    m.chain_handler_mut(chain)
        .expect("chain")
        .set_trap(
            TrapName::Get,
            Rc::new(|_m: &mut Membrane, req: &TrapRequest| {
                match &req.key {
                    Some(k) if *k == "x".into() => Ok(TrapReply::Value(Value::Int(-1))),
                    _ => Ok(TrapReply::Value(Value::Undefined)),
                }
            }),
        );
    m.insert_pipeline_handler(
        &dry(),
        "convert-from-shadow",
        PipelineNode::inserted("censor", chain, None),
    )
    .expect("insert");

    // The inserted stage overrides get; other traps still reach the
    // terminal handler.
    assert_eq!(m.get(p.clone(), "x").expect("get"), Value::Int(-1));
    assert!(m.has(p.clone(), "x").expect("has"));
    assert_eq!(m.keys(p).expect("keys"), vec!["x".to_string()]);
}

#[test]
fn legacy_dispatch_rejects_pipeline_insertion() {
    let mut m = membrane();
    let chain = m
        .create_chain_handler(&dry(), ChainBase::Forwarding)
        .expect("chain");
    // The legacy pipeline has no lead nodes to insert after.
    assert!(m
        .insert_pipeline_handler(
            &dry(),
            "convert-from-shadow",
            PipelineNode::inserted("censor", chain, None),
        )
        .is_err());
}

// ---------------------------------------------------------------------------
// Membrane lookups and graph registry
// ---------------------------------------------------------------------------

#[test]
fn membrane_value_and_proxy_lookups() {
    let mut m = membrane();
    let o = object_with_x(&mut m);
    let p = convert(&mut m, &wet(), &dry(), o.clone());

    assert!(m.has_proxy_for_value(&dry(), &o));
    assert_eq!(
        m.get_membrane_value(&dry(), &p).expect("value"),
        Some(o.clone())
    );
    assert_eq!(
        m.get_membrane_proxy(&dry(), &o).expect("proxy"),
        Some(p.clone())
    );
    assert_eq!(
        m.get_membrane_proxy(&wet(), &p).expect("proxy"),
        Some(o.clone())
    );

    let stranger = Value::Object(m.heap_mut().alloc_plain());
    assert!(!m.has_proxy_for_value(&dry(), &stranger));
    assert_eq!(m.get_membrane_value(&dry(), &stranger).expect("none"), None);

    let missing = GraphName::string("missing");
    assert_eq!(
        m.get_membrane_value(&missing, &o),
        Err(MembraneError::UnknownGraph { graph: missing })
    );
}

#[test]
fn graph_registry_contract() {
    let mut m = Membrane::new(MembraneConfig::default());
    m.add_graph(wet()).expect("add");
    assert_eq!(
        m.add_graph(wet()),
        Err(MembraneError::DuplicateGraph { graph: wet() })
    );
    assert_eq!(
        m.get_handler_by_name(&dry(), false),
        Err(MembraneError::UnknownGraph { graph: dry() })
    );
    m.get_handler_by_name(&dry(), true).expect("create");
    assert!(m.has_graph(&dry()));
    assert_eq!(m.graph_names().len(), 2);
}

#[test]
fn bind_conflicts_fail_atomically() {
    let mut m = membrane();
    let o1 = Value::Object(m.heap_mut().alloc_plain());
    let o2 = Value::Object(m.heap_mut().alloc_plain());
    let o3 = Value::Object(m.heap_mut().alloc_plain());

    m.bind_values_by_handlers(&wet(), o1.clone(), &dry(), o2.clone())
        .expect("bind");
    // o1 is already bound to o2 in dry.
    assert!(m
        .bind_values_by_handlers(&wet(), o1.clone(), &dry(), o3.clone())
        .is_err());
    // Two primitives cannot be bound.
    assert_eq!(
        m.bind_values_by_handlers(&wet(), Value::Int(1), &dry(), Value::Int(2)),
        Err(MembraneError::PrimitiveWrap)
    );
    // Same graph, different values.
    assert!(m
        .bind_values_by_handlers(&wet(), o1, &wet(), o3)
        .is_err());
}

#[test]
fn primordials_are_exposed_read_only() {
    let m = Membrane::new(MembraneConfig::default());
    let primordials = m.primordials().to_vec();
    assert_eq!(
        primordials.len(),
        frankenengine_membrane::PRIMORDIAL_NAMES.len() * 2
    );
    for value in primordials {
        let handle = value.as_object().expect("object");
        assert!(m.heap().ordinary(handle).expect("ordinary").is_frozen());
    }
}
