//! Mutation Context
//!
//! Tracks which actions are currently running, so that property mutations
//! can be refused outside of them and so the outermost action knows it has
//! to commit.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Invoking an action (or running an
//! entity's initializer) pushes a frame tagged with the engine it belongs
//! to; the returned guard pops it again, also when the action body returns
//! early with an error. Several engines may be active on one thread; each
//! only sees its own frames.

use std::cell::RefCell;

use crate::value::EntityId;

thread_local! {
    static FRAME_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Why mutations are currently allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Inside an action body.
    Action,
    /// Inside an entity's initializer.
    Init,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    engine: u64,
    entity: Option<EntityId>,
    kind: FrameKind,
}

/// Guard that pops its frame when dropped.
pub(crate) struct MutationContext {
    engine: u64,
}

impl MutationContext {
    /// Enter a new frame for `engine`. The frame is exited when the returned
    /// guard is dropped.
    pub(crate) fn enter(engine: u64, entity: Option<EntityId>, kind: FrameKind) -> Self {
        FRAME_STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                engine,
                entity,
                kind,
            });
        });
        Self { engine }
    }

    /// Whether any frame of `engine` is active on this thread.
    pub(crate) fn is_active(engine: u64) -> bool {
        Self::depth(engine) > 0
    }

    /// Number of active frames of `engine` on this thread.
    pub(crate) fn depth(engine: u64) -> usize {
        FRAME_STACK.with(|stack| stack.borrow().iter().filter(|f| f.engine == engine).count())
    }

    /// Entity and kind of the innermost frame of `engine`.
    pub(crate) fn current(engine: u64) -> Option<(Option<EntityId>, FrameKind)> {
        FRAME_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|f| f.engine == engine)
                .map(|f| (f.entity, f.kind))
        })
    }
}

impl Drop for MutationContext {
    fn drop(&mut self) {
        FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Frames of one engine are strictly nested.
            if let Some(pos) = stack.iter().rposition(|f| f.engine == self.engine) {
                stack.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_frames() {
        assert!(!MutationContext::is_active(1));

        {
            let _ctx = MutationContext::enter(1, Some(EntityId::new(4)), FrameKind::Action);
            assert!(MutationContext::is_active(1));
            assert_eq!(
                MutationContext::current(1),
                Some((Some(EntityId::new(4)), FrameKind::Action))
            );
        }

        // Context should be cleaned up after drop
        assert!(!MutationContext::is_active(1));
        assert!(MutationContext::current(1).is_none());
    }

    #[test]
    fn nested_frames() {
        let _outer = MutationContext::enter(2, None, FrameKind::Init);
        {
            let _inner = MutationContext::enter(2, None, FrameKind::Action);
            assert_eq!(MutationContext::depth(2), 2);
            assert_eq!(MutationContext::current(2).map(|c| c.1), Some(FrameKind::Action));
        }
        assert_eq!(MutationContext::depth(2), 1);
        assert_eq!(MutationContext::current(2).map(|c| c.1), Some(FrameKind::Init));
    }

    #[test]
    fn engines_are_isolated() {
        let _a = MutationContext::enter(3, None, FrameKind::Action);
        assert!(MutationContext::is_active(3));
        assert!(!MutationContext::is_active(5));
    }
}
