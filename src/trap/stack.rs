//! Interceptor stacks
//!
//! Each thread owns a stack of *activations*. The bottom activation holds the
//! interceptors pushed by ordinary code; every `pre`/`post` callback runs
//! inside a fresh activation on top, so calls made from a callback never see
//! the interceptor that is currently running. Pushes and pops are strictly
//! nested and undone by RAII guards, including during unwinding.
//!
//! Global interceptors apply to every thread. They are published as an
//! immutable snapshot and read without locking.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;

use super::Interceptor;

struct Activations {
    frames: Vec<Vec<Interceptor>>,
}

impl Activations {
    fn top_mut(&mut self) -> (usize, &mut Vec<Interceptor>) {
        if self.frames.is_empty() {
            self.frames.push(Vec::new());
        }
        let depth = self.frames.len() - 1;
        (depth, &mut self.frames[depth])
    }

    fn top_is_empty(&self) -> bool {
        self.frames.last().map_or(true, Vec::is_empty)
    }

    fn in_callback(&self) -> bool {
        self.frames.len() > 1
    }
}

thread_local! {
    static LOCAL: RefCell<Activations> = const {
        RefCell::new(Activations { frames: Vec::new() })
    };
}

/// Guard returned by [`push_interceptor`]; pops the interceptor on drop.
#[must_use = "the interceptor is popped as soon as the guard is dropped"]
pub struct InterceptorGuard {
    depth: usize,
    len: usize,
    // Guards are tied to the thread whose stack they modified.
    _local: PhantomData<*const ()>,
}

impl Drop for InterceptorGuard {
    fn drop(&mut self) {
        let _ = LOCAL.try_with(|local| {
            if let Some(frame) = local.borrow_mut().frames.get_mut(self.depth) {
                frame.truncate(self.len);
            }
        });
    }
}

impl std::fmt::Debug for InterceptorGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorGuard")
            .field("depth", &self.depth)
            .field("len", &self.len)
            .finish()
    }
}

/// Push `interceptor` onto the current thread's active stack until the
/// returned guard is dropped.
pub fn push_interceptor(interceptor: Interceptor) -> InterceptorGuard {
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let (depth, frame) = local.top_mut();
        let len = frame.len();
        frame.push(interceptor);
        InterceptorGuard {
            depth,
            len,
            _local: PhantomData,
        }
    })
}

/// Run `f` with `interceptor` active on the current thread.
///
/// The interceptor is visible to every instrumented call `f` makes, directly
/// or indirectly, and to nothing after `f` returns or unwinds.
pub fn with_interceptor<R>(interceptor: Interceptor, f: impl FnOnce() -> R) -> R {
    let _guard = push_interceptor(interceptor);
    f()
}

/// A fresh, empty activation for the duration of one callback.
pub(crate) struct Activation {
    _local: PhantomData<*const ()>,
}

impl Activation {
    pub(crate) fn enter() -> Self {
        LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            // Materialize the bottom activation first so the callback frame
            // is never mistaken for it.
            local.top_mut();
            local.frames.push(Vec::new());
        });
        Activation {
            _local: PhantomData,
        }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        let _ = LOCAL.try_with(|local| {
            local.borrow_mut().frames.pop();
        });
    }
}

/// Whether the current activation has any interceptor.
pub(crate) fn local_active() -> bool {
    LOCAL
        .try_with(|local| !local.borrow().top_is_empty())
        .unwrap_or(false)
}

/// Interceptors of the current activation, most recently pushed first, and
/// whether the thread is inside a callback.
pub(crate) fn snapshot() -> (Vec<Interceptor>, bool) {
    LOCAL
        .try_with(|local| {
            let local = local.borrow();
            let chain = local
                .frames
                .last()
                .map(|frame| frame.iter().rev().cloned().collect())
                .unwrap_or_default();
            (chain, local.in_callback())
        })
        .unwrap_or_default()
}

/// Number of interceptors in the current activation.
pub fn depth() -> usize {
    LOCAL
        .try_with(|local| local.borrow().frames.last().map_or(0, Vec::len))
        .unwrap_or(0)
}

// ============================================================================
// Global interceptors
// ============================================================================

struct Globals {
    list: ArcSwap<Vec<(u64, Interceptor)>>,
    writer: Mutex<()>,
    next_id: AtomicU64,
}

static GLOBALS: OnceLock<Globals> = OnceLock::new();

fn globals() -> &'static Globals {
    GLOBALS.get_or_init(|| Globals {
        list: ArcSwap::from_pointee(Vec::new()),
        writer: Mutex::new(()),
        next_id: AtomicU64::new(1),
    })
}

pub(crate) fn has_globals() -> bool {
    GLOBALS.get().map_or(false, |g| !g.list.load().is_empty())
}

/// Global interceptors, most recently added first.
pub(crate) fn global_chain() -> Vec<Interceptor> {
    match GLOBALS.get() {
        Some(g) => g.list.load().iter().rev().map(|(_, i)| i.clone()).collect(),
        None => Vec::new(),
    }
}

/// Handle to a global interceptor. Dropping it removes the interceptor;
/// [`keep`](Self::keep) leaves it installed for the rest of the process.
#[must_use = "dropping the handle removes the global interceptor"]
#[derive(Debug)]
pub struct GlobalInterceptorHandle {
    id: u64,
    active: bool,
}

impl GlobalInterceptorHandle {
    /// Remove the interceptor. Calling it again is a no-op.
    pub fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let globals = globals();
        let _writer = globals
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = globals.list.load();
        let next: Vec<_> = current
            .iter()
            .filter(|(id, _)| *id != self.id)
            .cloned()
            .collect();
        globals.list.store(Arc::new(next));
    }

    pub fn keep(mut self) {
        self.active = false;
    }
}

impl Drop for GlobalInterceptorHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Install `interceptor` for every thread.
///
/// Global interceptors run after the thread-local ones and before any patch,
/// and are not applied to calls made from inside a callback.
pub fn add_global_interceptor(interceptor: Interceptor) -> GlobalInterceptorHandle {
    let globals = globals();
    let _writer = globals
        .writer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = globals.next_id.fetch_add(1, Ordering::Relaxed);
    let mut next = Vec::clone(&globals.list.load());
    next.push((id, interceptor));
    globals.list.store(Arc::new(next));
    tracing::debug!(id, "global interceptor added");
    GlobalInterceptorHandle { id, active: true }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_pop_in_lifo_order() {
        assert_eq!(depth(), 0);
        let outer = push_interceptor(Interceptor::new().named("outer"));
        {
            let _inner = push_interceptor(Interceptor::new().named("inner"));
            let (chain, in_callback) = snapshot();
            assert_eq!(
                chain.iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
                ["inner", "outer"]
            );
            assert!(!in_callback);
        }
        assert_eq!(depth(), 1);
        drop(outer);
        assert_eq!(depth(), 0);
        assert!(!local_active());
    }

    #[test]
    fn test_activation_hides_outer_interceptors() {
        let _outer = push_interceptor(Interceptor::new().named("outer"));
        {
            let _activation = Activation::enter();
            assert!(!local_active());
            let (chain, in_callback) = snapshot();
            assert!(chain.is_empty());
            assert!(in_callback);

            let _nested = push_interceptor(Interceptor::new().named("nested"));
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 1);
        assert_eq!(snapshot().0[0].name(), "outer");
    }

    #[test]
    fn test_guard_pops_on_panic() {
        let result = std::panic::catch_unwind(|| {
            with_interceptor(Interceptor::new(), || {
                assert_eq!(depth(), 1);
                panic!("unwind through the scope");
            })
        });
        assert!(result.is_err());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_stacks_are_per_thread() {
        let _guard = push_interceptor(Interceptor::new());
        let other = std::thread::spawn(depth).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(depth(), 1);
    }
}
