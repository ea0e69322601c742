//! Scheduling Tests
//!
//! Drain behaviour: greedy and normal reactions, feedback limits, error
//! isolation, disposal of pending work and the tokio host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft_core::reactive::validators;
use weft_core::{
    ClassDef, Engine, EngineConfig, EngineError, Entity, EntityId, PropertyDef, ReactionDef,
    TokioHost, Value,
};

fn slider() -> ClassDef {
    ClassDef::builder("Slider")
        .property(PropertyDef::input("value", 0.0).validator(validators::float()).settable())
        .build()
        .unwrap()
}

fn value_of(s: &Entity) -> f64 {
    s.get("value").unwrap().as_f64().unwrap()
}

/// Drain until nothing is pending. Returns the number of drains.
fn settle(engine: &Engine, limit: usize) -> usize {
    let mut drains = 0;
    while engine.has_pending() && drains < limit {
        engine.drain_now().unwrap();
        drains += 1;
    }
    drains
}

/// Mirror one slider onto another with a normal reaction.
fn follow(engine: &Engine, from: &Entity, to: &Entity, name: &str) {
    let to = to.id();
    engine
        .attach_reaction(
            Some(from.id()),
            ReactionDef::new(name, ["value"], move |engine, _, events| {
                if let Some(event) = events.last() {
                    engine.invoke_action(to, "set_value", &[event.new_value.clone()])?;
                }
                Ok(())
            }),
        )
        .unwrap();
}

/// Test that two normal reactions need a second drain to settle.
#[test]
fn normal_binding_takes_two_drains() {
    let engine = Engine::default();
    let a = engine.create(&slider(), &[]).unwrap();
    let b = engine.create(&slider(), &[]).unwrap();
    follow(&engine, &a, &b, "a_to_b");
    follow(&engine, &b, &a, "b_to_a");
    settle(&engine, 10);

    a.invoke("set_value", &[Value::Float(5.0)]).unwrap();
    assert_eq!(settle(&engine, 10), 2);
    assert_eq!((value_of(&a), value_of(&b)), (5.0, 5.0));
}

/// Test that competing writes make normal reactions ping-pong.
#[test]
fn normal_binding_ping_pongs_on_competing_writes() {
    let engine = Engine::default();
    let a = engine.create(&slider(), &[]).unwrap();
    let b = engine.create(&slider(), &[]).unwrap();
    follow(&engine, &a, &b, "a_to_b");
    follow(&engine, &b, &a, "b_to_a");
    settle(&engine, 10);

    a.invoke("set_value", &[Value::Float(5.0)]).unwrap();
    b.invoke("set_value", &[Value::Float(7.0)]).unwrap();
    for _ in 0..4 {
        engine.drain_now().unwrap();
        assert_ne!(value_of(&a), value_of(&b));
    }
    assert!(engine.has_pending());
}

fn greedy_binding(engine: &Engine, a: &Entity, b: &Entity) {
    engine.expose("a", Value::Entity(a.id()));
    engine.expose("b", Value::Entity(b.id()));
    let ids = [a.id(), b.id()];
    engine
        .attach_reaction(
            None,
            ReactionDef::new("sync", ["a.value", "b.value"], move |engine, _, events| {
                let Some(event) = events.last() else {
                    return Ok(());
                };
                for id in ids {
                    engine.invoke_action(id, "set_value", &[event.new_value.clone()])?;
                }
                Ok(())
            })
            .greedy(),
        )
        .unwrap();
}

/// Test that a greedy binding settles within one drain.
#[test]
fn greedy_binding_takes_one_drain() {
    let engine = Engine::default();
    let a = engine.create(&slider(), &[]).unwrap();
    let b = engine.create(&slider(), &[]).unwrap();
    greedy_binding(&engine, &a, &b);
    settle(&engine, 10);

    a.invoke("set_value", &[Value::Float(5.0)]).unwrap();
    assert_eq!(settle(&engine, 10), 1);
    assert_eq!((value_of(&a), value_of(&b)), (5.0, 5.0));
}

/// Test that a greedy binding converges to the last external write.
#[test]
fn greedy_binding_converges_on_competing_writes() {
    let engine = Engine::default();
    let a = engine.create(&slider(), &[]).unwrap();
    let b = engine.create(&slider(), &[]).unwrap();
    greedy_binding(&engine, &a, &b);
    settle(&engine, 10);

    a.invoke("set_value", &[Value::Float(5.0)]).unwrap();
    b.invoke("set_value", &[Value::Float(7.0)]).unwrap();
    assert_eq!(settle(&engine, 10), 1);
    assert_eq!((value_of(&a), value_of(&b)), (7.0, 7.0));
}

/// Test that a self-triggering greedy reaction hits the iteration limit.
#[test]
fn runaway_feedback_is_bounded() {
    let engine = Engine::new(EngineConfig::default().with_max_iterations(10));
    let counter = ClassDef::builder("Counter")
        .property(PropertyDef::input("n", 0).settable())
        .action("bump", |engine, this, _| {
            let n = engine.get(this, "n")?.as_i64().unwrap_or_default();
            engine.mutate(this, "n", Value::Int(n + 1))
        })
        .build()
        .unwrap();
    let c = engine.create(&counter, &[]).unwrap();
    engine
        .attach_reaction(
            Some(c.id()),
            ReactionDef::new("again", ["n"], |engine, owner, _| {
                if let Some(owner) = owner {
                    engine.invoke_action(owner, "bump", &[])?;
                }
                Ok(())
            })
            .greedy(),
        )
        .unwrap();

    let err = engine.drain_now().unwrap_err();
    assert!(matches!(err, EngineError::IterationLimit { limit: 10 }));
    assert_eq!(c.get("n").unwrap(), Value::Int(10));
    assert!(engine.has_pending());
}

/// Test that a failing reaction does not stop the others.
#[test]
fn reaction_errors_are_isolated() {
    let engine = Engine::default();
    let s = engine.create(&slider(), &[]).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    engine
        .attach_reaction(
            Some(s.id()),
            ReactionDef::new("broken", ["value"], |_, _, _| Err("broken on purpose".into())),
        )
        .unwrap();
    let counted = runs.clone();
    engine
        .attach_reaction(
            Some(s.id()),
            ReactionDef::new("healthy", ["value"], move |_, _, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    engine.drain_now().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let errors = engine.take_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].node, "Slider1.broken");
    assert_eq!(errors[0].message, "broken on purpose");
}

/// Test the re-entrancy guards around drains and mutations.
#[test]
fn reentrancy_is_refused() {
    let engine = Engine::default();
    let class = ClassDef::builder("Pump")
        .property(PropertyDef::input("x", 0))
        .action("drain", |engine, _, _| engine.drain_now())
        .build()
        .unwrap();
    let g = engine.create(&class, &[]).unwrap();

    let err = g.invoke("drain", &[]).unwrap_err();
    assert!(matches!(err, EngineError::IllegalReentrancy(_)));
    let err = engine.mutate(&g, "x", Value::Int(1)).unwrap_err();
    assert!(matches!(err, EngineError::IllegalMutation(_)));
}

/// Test that events of a disposed entity are dropped, not delivered.
#[test]
fn disposal_drops_pending_events() {
    let engine = Engine::default();
    let s = engine.create(&slider(), &[]).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let handle = engine
        .attach_reaction(
            Some(s.id()),
            ReactionDef::new("watch", ["value"], move |_, _, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    s.invoke("set_value", &[Value::Float(1.0)]).unwrap();
    s.dispose().unwrap();
    engine.drain_now().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // The free reaction outlives the entity it observed, unconnected.
    let info = handle.connection_info().unwrap();
    assert!(info[0].1.is_empty());
    handle.dispose();
}

/// Test that dropping the last handle disposes at the next drain.
#[test]
fn dropped_handles_dispose_at_next_drain() {
    let engine = Engine::default();
    let s = engine.create(&slider(), &[]).unwrap();
    let id: EntityId = s.id();
    let copy = s.clone();
    drop(s);
    assert!(engine.get(id, "value").is_ok());

    drop(copy);
    assert!(engine.has_pending());
    assert!(engine.get(id, "value").is_ok());
    engine.drain_now().unwrap();
    assert!(matches!(engine.get(id, "value"), Err(EngineError::Disposed(_))));
}

fn holder() -> ClassDef {
    ClassDef::builder("Holder")
        .property(
            PropertyDef::input("held", Value::Null)
                .validator(validators::entity())
                .settable(),
        )
        .property(PropertyDef::lazy("reading", ["held.value"], |_, v| Ok(v[0].clone())))
        .build()
        .unwrap()
}

/// Test that an entity held by another entity's property survives its
/// handles, and goes once the property lets go.
#[test]
fn referenced_entities_outlive_their_handles() {
    let engine = Engine::default();
    let holder = engine.create(&holder(), &[]).unwrap();
    let id = {
        let s = engine.create(&slider(), &[("value", Value::Float(0.25))]).unwrap();
        holder.invoke("set_held", &[Value::Entity(s.id())]).unwrap();
        s.id()
    };
    engine.drain_now().unwrap();
    assert_eq!(holder.get("reading").unwrap(), Value::Float(0.25));
    assert!(engine.get(id, "value").is_ok());
    assert!(!engine.has_pending());

    holder.invoke("set_held", &[Value::Null]).unwrap();
    engine.drain_now().unwrap();
    assert!(matches!(engine.get(id, "value"), Err(EngineError::Disposed(_))));
}

/// Test that references inside lists keep entities alive too.
#[test]
fn listed_entities_outlive_their_handles() {
    let engine = Engine::default();
    let rack = ClassDef::builder("Rack")
        .property(PropertyDef::input("items", Value::List(Vec::new())).validator(validators::list()))
        .action("clear", |engine, this, _| engine.mutate(this, "items", Value::List(Vec::new())))
        .build()
        .unwrap();
    let rack = engine.create(&rack, &[]).unwrap();
    let s = engine.create(&slider(), &[]).unwrap();
    let id = s.id();
    engine
        .batch(|engine| engine.mutate(&rack, "items", Value::List(vec![Value::Entity(id)])))
        .unwrap();
    drop(s);
    engine.drain_now().unwrap();
    assert!(engine.get(id, "value").is_ok());

    rack.invoke("clear", &[]).unwrap();
    engine.drain_now().unwrap();
    assert!(matches!(engine.get(id, "value"), Err(EngineError::Disposed(_))));
}

/// Test that deferred calls run before reactions.
#[test]
fn deferred_calls_run_first() {
    let engine = Engine::default();
    let s = engine.create(&slider(), &[]).unwrap();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let log = order.clone();
    engine
        .attach_reaction(
            Some(s.id()),
            ReactionDef::new("watch", ["value"], move |_, _, _| {
                log.lock().push("reaction");
                Ok(())
            }),
        )
        .unwrap();
    let log = order.clone();
    engine.call_soon(move |_| log.lock().push("call"));

    engine.drain_now().unwrap();
    assert_eq!(*order.lock(), ["call", "reaction"]);
}

/// Test that the tokio host drains without being asked.
#[tokio::test]
async fn tokio_host_drains_automatically() {
    let host = TokioHost::new();
    let engine = Engine::with_host(EngineConfig::default(), host.clone());
    let task = host.spawn(&engine);

    let s = engine.create(&slider(), &[]).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    engine
        .attach_reaction(
            Some(s.id()),
            ReactionDef::new("watch", ["value"], move |_, _, events| {
                for event in events {
                    tx.send(event.new_value.clone()).ok();
                }
                Ok(())
            }),
        )
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(first, Some(Value::Float(0.0)));

    s.invoke("set_value", &[Value::Float(0.5)]).unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(next, Some(Value::Float(0.5)));

    host.shutdown();
    task.await.unwrap();
}
