//! Trap Dispatcher
//!
//! Every instrumented function calls [`dispatch`] on entry with its identity
//! and object views of its receiver, arguments and results. The dispatcher
//! runs the active interceptor chain and tells the caller whether to run the
//! original body:
//!
//! ```ignore
//! match trap::dispatch(&ADD, &mut recv, &mut args, &mut results) {
//!     Dispatch::Skip => { /* results already written by an interceptor */ }
//!     Dispatch::Proceed(after) => {
//!         let value = body();
//!         if let Some(after) = after {
//!             after.run(&mut recv, &mut args, &mut results);
//!         }
//!     }
//! }
//! ```
//!
//! Most code uses the typed helpers ([`call`], [`call_ref`], [`call_mut`],
//! [`read_var`]) which do this bookkeeping.
//!
//! ## Chain order
//!
//! For one call, outermost first:
//!
//! 1. the trace stage, when tracing is enabled,
//! 2. thread-local interceptors, most recently pushed first,
//! 3. global interceptors, most recently added first,
//! 4. the patch installed for the function's address, if any.
//!
//! `pre` callbacks run in that order; `post` callbacks run in reverse. Inside
//! a callback only patches and interceptors pushed by that callback apply.

mod call;
mod interceptor;
mod stack;

pub use call::{call, call_mut, call_ref, read_var, ArgList};
pub use interceptor::{Call, Data, Flow, Interceptor};
pub use stack::{
    add_global_interceptor, depth, push_interceptor, with_interceptor, GlobalInterceptorHandle,
    InterceptorGuard,
};

use std::sync::{Arc, RwLock};

use calltrap_object::{Object, TrapError};

use crate::functab::{self, FuncIdentity, FuncInfo};
use crate::mock;
use crate::trace::{self, Span};
use stack::Activation;

// ============================================================================
// Error Handling
// ============================================================================

/// Callback for interceptor errors that no result slot absorbed.
pub type ErrorHandler = Arc<dyn Fn(&FuncInfo, &TrapError) + Send + Sync>;

static ERROR_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

/// Default error handler that logs the error.
fn default_error_handler(info: &FuncInfo, err: &TrapError) {
    tracing::warn!(func = %info.identity, error = %err, "interceptor error dropped");
}

/// Replace the handler for interceptor errors that cannot be surfaced
/// through a result slot.
///
/// # Example
///
/// ```ignore
/// trap::set_error_handler(|info, err| {
///     metrics::increment("interceptor_errors");
///     eprintln!("{}: {}", info, err);
/// });
/// ```
pub fn set_error_handler<F>(handler: F)
where
    F: Fn(&FuncInfo, &TrapError) + Send + Sync + 'static,
{
    let handler: ErrorHandler = Arc::new(handler);
    let mut slot = ERROR_HANDLER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(handler);
}

/// Restore the default (logging) error handler.
pub fn reset_error_handler() {
    let mut slot = ERROR_HANDLER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = None;
}

/// Surface `err` through the last result slot when the signature allows it,
/// otherwise hand it to the error handler.
fn surface_error(info: &FuncInfo, results: &mut Object<'_>, err: &TrapError) {
    if info.last_result_is_error {
        if let Some(slot) = results.slots_mut().last_mut() {
            if slot.absorb_error(err) {
                return;
            }
        }
    }
    let handler = ERROR_HANDLER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    match handler {
        Some(handler) => handler(info, err),
        None => default_error_handler(info, err),
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Outcome of [`dispatch`].
#[must_use]
pub enum Dispatch {
    /// Run the original body, then the `After` if there is one.
    Proceed(Option<After>),
    /// Do not run the body; the results are whatever interceptors wrote.
    /// Results nobody wrote have been reported as an error.
    Skip,
}

impl Dispatch {
    pub fn is_skip(&self) -> bool {
        matches!(self, Dispatch::Skip)
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Proceed(None) => f.write_str("Proceed(None)"),
            Dispatch::Proceed(Some(_)) => f.write_str("Proceed(Some(After))"),
            Dispatch::Skip => f.write_str("Skip"),
        }
    }
}

/// Whether any dispatch work can happen on this thread right now.
///
/// When this is false, dispatch returns `Proceed(None)` without allocating.
pub fn is_active() -> bool {
    trace::is_enabled() || mock::has_patches() || stack::has_globals() || stack::local_active()
}

/// Dispatch one call of the function registered under `identity`.
///
/// Unregistered identities are logged and proceed untouched.
pub fn dispatch<'a>(
    identity: &FuncIdentity,
    recv: &mut Object<'a>,
    args: &mut Object<'a>,
    results: &mut Object<'a>,
) -> Dispatch {
    if !is_active() {
        return Dispatch::Proceed(None);
    }
    match functab::lookup(identity) {
        Some(info) => dispatch_info(info, recv, args, results),
        None => {
            tracing::warn!(func = %identity, "dispatch for unregistered function");
            Dispatch::Proceed(None)
        }
    }
}

/// Attach the registered slot names to the views when the shapes agree.
fn name_views<'a>(info: &'static FuncInfo, args: &mut Object<'a>, results: &mut Object<'a>) {
    if args.len() == info.arg_names.len() {
        args.set_names(&info.arg_names);
    }
    if results.len() == info.res_names.len() {
        results.set_names(&info.res_names);
    }
}

/// [`dispatch`] for an already resolved record.
pub fn dispatch_info<'a>(
    info: &'static FuncInfo,
    recv: &mut Object<'a>,
    args: &mut Object<'a>,
    results: &mut Object<'a>,
) -> Dispatch {
    let (mut chain, in_callback) = stack::snapshot();
    if !in_callback {
        chain.extend(stack::global_chain());
    }
    if let Some(patch) = mock::active_patch(info.address) {
        chain.push(patch.interceptor().clone());
    }
    let traced = !in_callback && trace::is_enabled();
    if chain.is_empty() && !traced {
        return Dispatch::Proceed(None);
    }

    name_views(info, args, results);
    let span = traced.then(|| Span::begin(info, recv, args));

    let mut after = After {
        info,
        stages: Vec::with_capacity(chain.len()),
        span,
        failed: false,
    };
    let mut skipped = false;
    for interceptor in chain {
        let flow = match interceptor.pre_fn() {
            Some(pre) => {
                let _activation = Activation::enter();
                pre(&mut Call {
                    info,
                    recv: &mut *recv,
                    args: &mut *args,
                    results: &mut *results,
                })
            }
            None => Ok(Flow::proceed()),
        };
        match flow {
            Ok(Flow::Continue(data)) => after.stages.push((interceptor, data)),
            Ok(Flow::Skip) => {
                tracing::trace!(func = %info.identity, interceptor = interceptor.name(), "skip");
                after.stages.push((interceptor, None));
                skipped = true;
                break;
            }
            Err(err) => {
                tracing::debug!(
                    func = %info.identity,
                    interceptor = interceptor.name(),
                    error = %err,
                    "pre failed; skipping body"
                );
                after.fail(results, &err);
                after.stages.push((interceptor, None));
                skipped = true;
                break;
            }
        }
    }

    if skipped {
        after.run_posts(recv, args, results);
        after.require_results(results);
        after.close(results);
        return Dispatch::Skip;
    }
    if after.span.is_none() && !after.stages.iter().any(|(i, _)| i.has_post()) {
        return Dispatch::Proceed(None);
    }
    Dispatch::Proceed(Some(after))
}

/// The post phase of a dispatched call.
///
/// Run it with fresh views once the original body has produced its results.
/// Dropping it without running (for instance while the body unwinds) closes
/// the trace event with an error and runs no `post` callbacks.
#[must_use = "post callbacks only run through After::run"]
pub struct After {
    info: &'static FuncInfo,
    stages: Vec<(Interceptor, Data)>,
    span: Option<Span>,
    /// An interceptor error was already surfaced for this call.
    failed: bool,
}

impl After {
    /// Run the `post` callbacks, innermost first, and close the trace event.
    pub fn run<'a>(mut self, recv: &mut Object<'a>, args: &mut Object<'a>, results: &mut Object<'a>) {
        name_views(self.info, args, results);
        self.finish(recv, args, results);
    }

    pub fn info(&self) -> &'static FuncInfo {
        self.info
    }

    fn fail(&mut self, results: &mut Object<'_>, err: &TrapError) {
        self.failed = true;
        if let Some(span) = self.span.as_mut() {
            span.record_error(err);
        }
        surface_error(self.info, results, err);
    }

    /// A skipped call must leave its results written. Report the ones nobody
    /// wrote, unless an earlier error already explains the skip.
    fn require_results(&mut self, results: &mut Object<'_>) {
        if self.failed {
            return;
        }
        let unset: Vec<_> = results
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_result() && !slot.is_set())
            .map(|(i, _)| results.name(i).into_owned())
            .collect();
        if !unset.is_empty() {
            let err = TrapError::msg(format!("call skipped without setting {}", unset.join(", ")));
            self.fail(results, &err);
        }
    }

    fn finish<'a>(&mut self, recv: &mut Object<'a>, args: &mut Object<'a>, results: &mut Object<'a>) {
        self.run_posts(recv, args, results);
        self.close(results);
    }

    fn close(&mut self, results: &Object<'_>) {
        if let Some(span) = self.span.take() {
            span.end(results);
        }
    }

    fn run_posts<'a>(&mut self, recv: &mut Object<'a>, args: &mut Object<'a>, results: &mut Object<'a>) {
        let info = self.info;
        for (interceptor, data) in std::mem::take(&mut self.stages).into_iter().rev() {
            let Some(post) = interceptor.post_fn() else {
                continue;
            };
            let outcome = {
                let _activation = Activation::enter();
                post(
                    &mut Call {
                        info,
                        recv: &mut *recv,
                        args: &mut *args,
                        results: &mut *results,
                    },
                    data,
                )
            };
            if let Err(err) = outcome {
                tracing::debug!(
                    func = %info.identity,
                    interceptor = interceptor.name(),
                    error = %err,
                    "post failed"
                );
                self.fail(results, &err);
            }
        }
    }
}

impl Drop for After {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            let reason = if std::thread::panicking() {
                "panicked"
            } else {
                "after not run"
            };
            span.abandon(reason);
        }
    }
}

impl std::fmt::Debug for After {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("After")
            .field("func", &self.info.identity)
            .field("stages", &self.stages.len())
            .field("traced", &self.span.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltrap_object::Slot;

    fn leaked(info: FuncInfo) -> &'static FuncInfo {
        Box::leak(Box::new(info))
    }

    fn plain() -> &'static FuncInfo {
        leaked(
            FuncInfo::builder(FuncIdentity::func("unit", "plain"))
                .args::<(i32,)>(&["x"])
                .result::<i32>()
                .build(),
        )
    }

    #[test]
    fn test_no_interceptors_proceeds_without_after() {
        let info = plain();
        let mut x = 1;
        let mut out: Option<i32> = None;
        let mut recv = Object::nil();
        let mut args = Object::args(vec![Slot::value(&mut x)]);
        let mut results = Object::results(vec![Slot::result(&mut out)]);
        let decision = dispatch_info(info, &mut recv, &mut args, &mut results);
        assert!(matches!(decision, Dispatch::Proceed(None)));
    }

    #[test]
    fn test_pre_error_skips_and_reaches_error_handler_path() {
        let info = leaked(
            FuncInfo::builder(FuncIdentity::func("unit", "fallible"))
                .args::<(i32,)>(&["x"])
                .result::<Result<i32, String>>()
                .last_result_is_error(true)
                .build(),
        );
        let _guard = push_interceptor(
            Interceptor::new().pre(|_call| Err(TrapError::msg("denied"))),
        );

        let mut x = 1;
        let mut out: Option<Result<i32, String>> = None;
        {
            let mut recv = Object::nil();
            let mut args = Object::args(vec![Slot::value(&mut x)]);
            let mut results = Object::results(vec![Slot::result(&mut out)]);
            let decision = dispatch_info(info, &mut recv, &mut args, &mut results);
            assert!(decision.is_skip());
        }
        assert_eq!(out, Some(Err("denied".to_string())));
    }

    #[test]
    fn test_skip_without_results_is_reported() {
        let info = leaked(
            FuncInfo::builder(FuncIdentity::func("unit", "lookup"))
                .args::<(i32,)>(&["x"])
                .named_result::<Result<i32, String>>("found")
                .last_result_is_error(true)
                .build(),
        );
        let _guard = push_interceptor(Interceptor::new().pre(|_call| Ok(Flow::Skip)));

        let mut x = 1;
        let mut out: Option<Result<i32, String>> = None;
        {
            let mut recv = Object::nil();
            let mut args = Object::args(vec![Slot::value(&mut x)]);
            let mut results = Object::results(vec![Slot::result(&mut out)]);
            let decision = dispatch_info(info, &mut recv, &mut args, &mut results);
            assert!(decision.is_skip());
        }
        assert_eq!(out, Some(Err("call skipped without setting found".to_string())));
    }

    #[test]
    fn test_posts_run_innermost_first_with_own_data() {
        use std::sync::Mutex;

        let info = plain();
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = |name: &'static str| {
            let pre_log = Arc::clone(&log);
            let post_log = Arc::clone(&log);
            Interceptor::new()
                .pre(move |_call| {
                    pre_log.lock().unwrap().push(format!("pre {}", name));
                    Ok(Flow::with_data(name))
                })
                .post(move |_call, data| {
                    let tag = data.and_then(|d| d.downcast::<&'static str>().ok());
                    post_log
                        .lock()
                        .unwrap()
                        .push(format!("post {} {:?}", name, tag.map(|t| *t)));
                    Ok(())
                })
        };
        let _outer = push_interceptor(make("outer"));
        let _inner = push_interceptor(make("inner"));

        let mut x = 1;
        let mut out: Option<i32> = None;
        let mut recv = Object::nil();
        let mut args = Object::args(vec![Slot::value(&mut x)]);
        let mut results = Object::results(vec![Slot::result(&mut out)]);
        match dispatch_info(info, &mut recv, &mut args, &mut results) {
            Dispatch::Proceed(Some(after)) => after.run(&mut recv, &mut args, &mut results),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            *log.lock().unwrap(),
            [
                "pre inner",
                "pre outer",
                "post outer Some(\"outer\")",
                "post inner Some(\"inner\")",
            ]
        );
    }

    #[test]
    fn test_views_carry_registered_names() {
        let info = plain();
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let _guard = push_interceptor(Interceptor::new().pre(move |call| {
            *sink.lock().unwrap() = call.args.name(0).into_owned();
            Ok(Flow::proceed())
        }));

        let mut x = 1;
        let mut out: Option<i32> = None;
        let mut recv = Object::nil();
        let mut args = Object::args(vec![Slot::value(&mut x)]);
        let mut results = Object::results(vec![Slot::result(&mut out)]);
        let _ = dispatch_info(info, &mut recv, &mut args, &mut results);
        assert_eq!(*seen.lock().unwrap(), "x");
    }
}
