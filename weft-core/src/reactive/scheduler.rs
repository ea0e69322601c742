//! Batch Loop
//!
//! Changes are gathered into a batch and processed in two steps.
//!
//! **Commit** runs when the outermost action returns. It repeats propagation
//! rounds until no input changed any more: each round marks everything
//! downstream of the changed inputs stale, then walks the affected nodes in
//! topological order, re-resolving paths whose intermediate values changed
//! and recomputing eager nodes (and lazy ones somebody is watching). Actions
//! invoked by those computations join the running commit.
//!
//! **Drain** delivers the accumulated events. It runs, in order:
//!
//! 1. deferred calls and disposals of dropped entity handles
//! 2. the initial events of freshly created entities
//! 3. a commit
//! 4. the reaction phase: reactions run one at a time, lowest
//!    `(label, creation order)` first, each with all events queued for it
//!
//! Events caused by reactions are committed immediately. Greedy reactions
//! get them within the same drain; normal reactions get them at the next
//! drain, which is requested from the host.

use std::collections::{HashMap, VecDeque};

use indexmap::{IndexMap, IndexSet};

use super::context::MutationContext;
use super::reaction::{Event, ReactionFn, ReactionMode};
use super::runtime::{Engine, EngineState};
use crate::error::{ComputationError, EngineError, Result};
use crate::graph::{Node, NodeId, NodeKind};
use crate::logging::targets;
use crate::value::EntityId;

/// A callback queued with [`Engine::call_soon`].
pub(crate) type DeferredCall = Box<dyn FnOnce(&Engine) + Send>;

/// Pending work of an engine.
#[derive(Default)]
pub(crate) struct Batch {
    /// Inputs changed since the last commit round.
    pub(crate) changed: IndexSet<NodeId>,
    /// Nodes that must re-resolve their connections.
    pub(crate) relink: IndexSet<NodeId>,
    /// Events for reactions, delivered in the current (or next) drain.
    pub(crate) queue: IndexMap<NodeId, Vec<Event>>,
    /// Events for normal reactions produced during the reaction phase.
    pub(crate) deferred: IndexMap<NodeId, Vec<Event>>,
    /// Initial events of new entities.
    pub(crate) initial: Vec<Event>,
    pub(crate) calls: VecDeque<DeferredCall>,
    pub(crate) draining: bool,
    pub(crate) reacting: bool,
    pub(crate) committing: bool,
    pub(crate) drain_requested: bool,
}

impl Batch {
    /// Queue an event for a reaction.
    pub(crate) fn enqueue(&mut self, reaction: NodeId, mode: ReactionMode, event: Event) {
        let target = if self.reacting && mode == ReactionMode::Normal {
            &mut self.deferred
        } else {
            &mut self.queue
        };
        target.entry(reaction).or_default().push(event);
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.changed.is_empty()
            || !self.relink.is_empty()
            || !self.queue.is_empty()
            || !self.deferred.is_empty()
            || !self.initial.is_empty()
            || !self.calls.is_empty()
    }

    /// Drop everything pending, keeping the graph.
    fn clear(&mut self) -> Vec<DeferredCall> {
        self.changed.clear();
        self.relink.clear();
        self.queue.clear();
        self.deferred.clear();
        self.initial.clear();
        self.drain_requested = false;
        self.calls.drain(..).collect()
    }
}

/// A reaction picked for invocation.
struct ReactionJob {
    id: NodeId,
    name: String,
    owner: Option<EntityId>,
    func: ReactionFn,
    events: Vec<Event>,
}

impl EngineState {
    /// Take the queued reaction that sorts first.
    fn next_reaction(&mut self) -> Option<ReactionJob> {
        let graph = &self.graph;
        self.batch.queue.retain(|id, _| graph.contains(*id));

        let id = self
            .batch
            .queue
            .keys()
            .copied()
            .min_by_key(|id| graph.get(*id).and_then(|n| n.reactor.as_ref()).map(|r| r.order()))?;
        let events = self.batch.queue.shift_remove(&id)?;
        let node = self.graph.get(id)?;
        let reactor = node.reactor.as_ref()?;
        let job = ReactionJob {
            id,
            name: node.fullname().to_string(),
            owner: node.owner(),
            func: reactor.func.clone(),
            events,
        };
        self.stats.reactions_run += 1;
        Some(job)
    }
}

/// Clears a batch flag when dropped.
struct FlagGuard<'a> {
    engine: &'a Engine,
    clear: fn(&mut Batch),
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        (self.clear)(&mut self.engine.lock().batch);
    }
}

fn is_observed(node: &Node, st: &EngineState) -> bool {
    !node.reconnect_downstream.is_empty()
        || node
            .downstream
            .iter()
            .any(|id| st.graph.get(*id).is_some_and(Node::is_reaction))
}

impl Engine {
    /// Propagate pending changes until the graph settles.
    ///
    /// Does nothing when called from within a running commit; the running
    /// commit picks the changes up in its next round.
    pub(crate) fn commit(&self) -> Result<()> {
        {
            let mut st = self.lock();
            if st.batch.committing {
                return Ok(());
            }
            st.batch.committing = true;
        }
        let _guard = FlagGuard {
            engine: self,
            clear: |b| b.committing = false,
        };

        let mut rounds = 0;
        loop {
            let order = {
                let mut st = self.lock();
                if st.batch.changed.is_empty() && st.batch.relink.is_empty() {
                    return Ok(());
                }
                rounds += 1;
                let limit = st.config.max_iterations;
                if rounds > limit {
                    tracing::error!(target: targets::SCHEDULER, limit, "propagation did not settle");
                    return Err(EngineError::IterationLimit { limit });
                }
                let changed: Vec<NodeId> = st.batch.changed.drain(..).collect();
                let relink: Vec<NodeId> = st.batch.relink.drain(..).collect();
                st.graph.propagate(&changed, &relink)
            };

            for id in order {
                self.settle(id);
            }
        }
    }

    /// Bring one affected node up to date during a commit.
    fn settle(&self, id: NodeId) {
        let (reconnect, evaluate) = {
            let st = self.lock();
            let Some(node) = st.graph.get(id) else {
                return;
            };
            let evaluate = match node.kind() {
                NodeKind::Eager => true,
                NodeKind::Lazy => is_observed(node, &st),
                NodeKind::Input | NodeKind::Reaction => false,
            };
            (node.needs_reconnect, evaluate)
        };

        if reconnect {
            if let Err(error) = self.connect_node(id, false) {
                self.report(error);
            }
        }
        if evaluate {
            if let Err(error) = self.evaluate(id) {
                self.report(error);
            }
        }
    }

    /// Log an error caught during propagation or the reaction phase.
    pub(crate) fn report(&self, error: EngineError) {
        match error {
            EngineError::Computation(error) => {
                tracing::error!(
                    target: targets::GRAPH,
                    node = %error.node,
                    error = %error.message,
                    "recompute failed"
                );
                self.lock().record_error(error);
            }
            EngineError::NotConnected(error) => {
                tracing::debug!(target: targets::GRAPH, node = %error.node, reason = %error.reason, "skipped unconnected node");
            }
            other => {
                tracing::warn!(target: targets::GRAPH, error = %other, "propagation error");
            }
        }
    }

    /// Ask the host for a drain if work is pending and none was requested.
    pub(crate) fn poke(&self) {
        let wake = {
            let mut st = self.lock();
            let batch = &mut st.batch;
            if !batch.draining && !batch.drain_requested && batch.has_work() {
                batch.drain_requested = true;
                true
            } else {
                false
            }
        };
        if wake {
            self.inner_host().schedule_drain();
        }
    }

    /// Request a drain at the host's next opportunity.
    pub fn schedule_drain(&self) {
        let wake = {
            let mut st = self.lock();
            !std::mem::replace(&mut st.batch.drain_requested, true)
        };
        if wake {
            self.inner_host().schedule_drain();
        }
    }

    /// Whether anything is waiting for a drain.
    pub fn has_pending(&self) -> bool {
        self.lock().batch.has_work() || !self.graveyard_is_empty()
    }

    /// Queue `f` to run at the start of the next drain.
    pub fn call_soon<F>(&self, f: F)
    where
        F: FnOnce(&Engine) + Send + 'static,
    {
        self.lock().batch.calls.push_back(Box::new(f));
        self.poke();
    }

    /// Run one drain now.
    ///
    /// Fails with an `IllegalReentrancyError` when called from inside an
    /// action or from within a running drain.
    pub fn drain_now(&self) -> Result<()> {
        if MutationContext::is_active(self.id()) {
            return Err(EngineError::reentrancy("drain_now (inside an action)"));
        }
        {
            let mut st = self.lock();
            if st.batch.draining {
                return Err(EngineError::reentrancy("drain_now"));
            }
            st.batch.draining = true;
            st.batch.drain_requested = false;
            st.stats.drains += 1;
            let deferred = std::mem::take(&mut st.batch.deferred);
            for (reaction, events) in deferred {
                st.batch.queue.entry(reaction).or_default().extend(events);
            }
        }

        let result = {
            let _guard = FlagGuard {
                engine: self,
                clear: |b| {
                    b.draining = false;
                    b.reacting = false;
                },
            };
            tracing::trace!(target: targets::SCHEDULER, engine = self.id(), "drain started");
            self.run_drain()
        };

        self.poke();
        result
    }

    fn run_drain(&self) -> Result<()> {
        self.run_calls();

        {
            let mut st = self.lock();
            let initial = std::mem::take(&mut st.batch.initial);
            for event in initial {
                st.deliver(event.node, event);
            }
        }

        self.commit()?;

        let limit = {
            let mut st = self.lock();
            st.batch.reacting = true;
            st.config.max_iterations
        };
        let mut runs: HashMap<NodeId, usize> = HashMap::new();
        loop {
            let Some(job) = self.lock().next_reaction() else {
                break;
            };
            let count = runs.entry(job.id).or_default();
            *count += 1;
            if *count > limit {
                tracing::error!(target: targets::SCHEDULER, reaction = %job.name, limit, "reaction keeps re-triggering itself");
                // Left for the next drain.
                self.lock().batch.queue.insert(job.id, job.events);
                return Err(EngineError::IterationLimit { limit });
            }
            self.invoke_reaction(job);
        }

        tracing::trace!(target: targets::SCHEDULER, engine = self.id(), "drain finished");
        Ok(())
    }

    /// Run deferred calls and dispose entities whose handles were dropped.
    fn run_calls(&self) {
        let mut recheck = true;
        loop {
            let doomed = self.collect_unowned(recheck);
            // A disposal may release references to other unowned entities.
            recheck = !doomed.is_empty();
            for entity in doomed {
                if let Err(error) = self.dispose(entity) {
                    tracing::debug!(target: targets::LIFECYCLE, %entity, %error, "skipped disposal of dropped entity");
                }
            }
            if recheck {
                continue;
            }
            let Some(call) = self.lock().batch.calls.pop_front() else {
                break;
            };
            call(self);
        }
    }

    /// Entities without handles that nothing refers to any more.
    ///
    /// Freshly buried entities are always examined; those kept alive by a
    /// reference earlier only when `recheck` is set.
    fn collect_unowned(&self, recheck: bool) -> Vec<EntityId> {
        let mut candidates = self.take_graveyard();
        let mut st = self.lock();
        if recheck {
            candidates.extend(std::mem::take(&mut st.unowned));
        }
        let mut doomed = Vec::new();
        for entity in candidates {
            match st.entities.get(&entity) {
                Some(record) if !record.disposed => {}
                _ => continue,
            }
            if st.is_referenced(entity) {
                tracing::trace!(target: targets::LIFECYCLE, %entity, "dropped entity is still referenced");
                st.unowned.insert(entity);
            } else {
                doomed.push(entity);
            }
        }
        doomed
    }

    fn invoke_reaction(&self, job: ReactionJob) {
        tracing::trace!(target: targets::SCHEDULER, reaction = %job.name, events = job.events.len(), "invoking reaction");
        if let Err(error) = (job.func)(self, job.owner, &job.events) {
            let error = ComputationError::new(job.name, error.to_string());
            tracing::error!(
                target: targets::SCHEDULER,
                reaction = %error.node,
                error = %error.message,
                "reaction failed"
            );
            self.lock().record_error(error);
        }
    }

    /// Discard everything pending: queued events, deferred calls, initial
    /// events and uncommitted changes. The graph itself is kept. A batch that
    /// is already being drained, or written by a running action, cannot be
    /// reset.
    pub fn reset(&self) -> Result<()> {
        if MutationContext::is_active(self.id()) {
            return Err(EngineError::reentrancy("reset (inside an action)"));
        }
        let calls = {
            let mut st = self.lock();
            if st.batch.draining {
                return Err(EngineError::reentrancy("reset"));
            }
            st.batch.clear()
        };
        self.take_graveyard();
        drop(calls);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::reactive::{ClassDef, PropertyDef, ReactionDef};
    use crate::value::Value;

    fn slider() -> ClassDef {
        ClassDef::builder("Slider")
            .property(PropertyDef::input("value", 0).settable())
            .build()
            .unwrap()
    }

    #[test]
    fn reactions_run_in_label_order() {
        let engine = Engine::default();
        let s = engine.create(&slider(), &[]).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, label) in [("first", "b"), ("second", "a"), ("third", "c")] {
            let order = order.clone();
            engine
                .attach_reaction(
                    Some(s.id()),
                    ReactionDef::new(name, ["value"], move |_, _, _| {
                        order.lock().unwrap().push(name);
                        Ok(())
                    })
                    .label(label),
                )
                .unwrap();
        }

        engine.drain_now().unwrap();
        assert_eq!(*order.lock().unwrap(), ["second", "first", "third"]);
    }

    #[test]
    fn drain_inside_a_reaction_is_refused() {
        let engine = Engine::default();
        let s = engine.create(&slider(), &[]).unwrap();
        let refused = Arc::new(AtomicUsize::new(0));
        let seen = refused.clone();
        engine
            .attach_reaction(
                Some(s.id()),
                ReactionDef::new("nested", ["value"], move |engine, _, _| {
                    if let Err(EngineError::IllegalReentrancy(_)) = engine.drain_now() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .unwrap();

        engine.drain_now().unwrap();
        assert_eq!(refused.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn call_soon_runs_once_in_order() {
        let engine = Engine::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            engine.call_soon(move |_| log.lock().unwrap().push(i));
        }
        assert!(engine.has_pending());
        engine.drain_now().unwrap();
        engine.drain_now().unwrap();
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
        assert!(!engine.has_pending());
    }

    #[test]
    fn reset_discards_pending_work() {
        let engine = Engine::default();
        let s = engine.create(&slider(), &[]).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        engine
            .attach_reaction(
                Some(s.id()),
                ReactionDef::new("count", ["value"], move |_, _, _| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        s.invoke("set_value", &[Value::Int(3)]).unwrap();

        engine.reset().unwrap();
        assert!(!engine.has_pending());
        engine.drain_now().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // The value itself was committed before the reset.
        assert_eq!(s.get("value").unwrap(), Value::Int(3));
    }

    #[test]
    fn reset_inside_an_action_is_refused() {
        let engine = Engine::default();
        let class = ClassDef::builder("Counter")
            .property(PropertyDef::input("count", 1).settable())
            .property(PropertyDef::eager("doubled", ["count"], |_, v| {
                Ok(Value::Int(v[0].as_i64().unwrap_or_default() * 2))
            }))
            .build()
            .unwrap();
        let c = engine.create(&class, &[]).unwrap();

        let result = engine.batch(|engine| {
            engine.mutate(&c, "count", Value::Int(5))?;
            engine.reset()
        });
        assert!(matches!(result, Err(EngineError::IllegalReentrancy(_))));
        // The change was still committed.
        assert_eq!(c.get("doubled").unwrap(), Value::Int(10));
    }
}
