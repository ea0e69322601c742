//! Host Integration
//!
//! The engine has no timers and no event loop of its own. Whenever work is
//! pending it asks its [`Host`] to schedule a drain, at most once until that
//! drain has run. The host then calls [`Engine::drain_now`] at a point where
//! no action is running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::runtime::Engine;
use crate::logging::targets;

/// The event loop an engine is embedded in.
pub trait Host: Send + Sync {
    /// Arrange for [`Engine::drain_now`] to be called soon.
    fn schedule_drain(&self);

    /// The engine is going away.
    fn detach(&self) {}
}

/// Host for engines driven by hand. It only counts requests.
#[derive(Debug, Default)]
pub struct ManualHost {
    requests: AtomicUsize,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of drains requested so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Host for ManualHost {
    fn schedule_drain(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Host that drains on a tokio task.
///
/// ```no_run
/// # async fn run() {
/// use weft_core::{Engine, EngineConfig, TokioHost};
///
/// let host = TokioHost::new();
/// let engine = Engine::with_host(EngineConfig::default(), host.clone());
/// let task = host.spawn(&engine);
/// // ... create entities, invoke actions ...
/// host.shutdown();
/// task.await.ok();
/// # }
/// ```
#[derive(Debug, Default)]
pub struct TokioHost {
    notify: Notify,
    shutdown: AtomicBool,
}

impl TokioHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn the drain task on the current runtime.
    ///
    /// The task holds the engine weakly; it ends when the engine is dropped
    /// or [`TokioHost::shutdown`] is called.
    pub fn spawn(self: &Arc<Self>, engine: &Engine) -> JoinHandle<()> {
        let host = Arc::clone(self);
        let engine = engine.downgrade();
        tokio::spawn(async move {
            loop {
                host.notify.notified().await;
                if host.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(error) = engine.drain_now() {
                    tracing::warn!(target: targets::SCHEDULER, %error, "drain failed");
                }
            }
            tracing::debug!(target: targets::SCHEDULER, "drain task stopped");
        })
    }

    /// Stop the drain task.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Host for TokioHost {
    fn schedule_drain(&self) {
        // Stores a permit if the task is busy, so no request is lost.
        self.notify.notify_one();
    }

    fn detach(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::reactive::{ClassDef, PropertyDef, ReactionDef};
    use crate::value::Value;

    #[test]
    fn manual_host_counts_one_request_per_drain() {
        let host = Arc::new(ManualHost::new());
        let engine = Engine::with_host(EngineConfig::default(), host.clone());
        let class = ClassDef::builder("Lamp")
            .property(PropertyDef::input("on", false).settable())
            .build()
            .unwrap();

        let lamp = engine.create(&class, &[]).unwrap();
        engine
            .attach_reaction(Some(lamp.id()), ReactionDef::new("log", ["on"], |_, _, _| Ok(())))
            .unwrap();
        assert_eq!(host.requests(), 1);
        lamp.invoke("set_on", &[Value::Bool(true)]).unwrap();
        lamp.invoke("set_on", &[Value::Bool(false)]).unwrap();
        assert_eq!(host.requests(), 1);

        engine.drain_now().unwrap();
        lamp.invoke("set_on", &[Value::Bool(true)]).unwrap();
        assert_eq!(host.requests(), 2);
    }

    #[tokio::test]
    async fn tokio_host_stops_with_the_engine() {
        let host = TokioHost::new();
        let engine = Engine::with_host(EngineConfig::default(), host.clone());
        let task = host.spawn(&engine);

        drop(engine);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("drain task did not stop")
            .unwrap();
        assert!(host.is_shut_down());
    }
}
