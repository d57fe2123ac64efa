//! Mock Patch Engine
//!
//! Replace instrumented functions at runtime, keyed by their code address:
//!
//! ```ignore
//! let handle = mock::patch(func_addr!(shipping_cost), |weight: u32| -> u64 { 0 })?;
//! assert_eq!(shipping_cost(12), 0);
//! drop(handle); // original behavior is back
//! ```
//!
//! A patch is the innermost interceptor of its function's chain. Its `pre`
//! copies the live arguments out of the views, runs the replacement, writes
//! the result and skips the original body.
//!
//! Replacement closures must annotate their parameter types so the
//! signature can be checked against the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;
use calltrap_object::{Object, ObjectError, SlotValue, TrapError, TypeTag};
use thiserror::Error;

pub use crate::functab::{FuncAddr, Target};
use crate::functab::{self, FuncInfo};
use crate::trap::{Call, Flow, Interceptor};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("no instrumented function at address {addr:#x}")]
    NotInstrumented { addr: usize },

    #[error("receiver mismatch patching {func}: registered {expected}, replacement takes {got}")]
    ReceiverMismatch {
        func: String,
        expected: String,
        got: String,
    },

    #[error("signature mismatch patching {func}: registered {expected}, replacement is {got}")]
    SignatureMismatch {
        func: String,
        expected: String,
        got: String,
    },

    #[error("{func} is already patched")]
    AlreadyPatched { func: String },

    #[error("{func} is not a variable")]
    NotAVariable { func: String },
}

// ============================================================================
// Patch table
// ============================================================================

/// One installed patch.
pub struct PatchEntry {
    id: u64,
    info: &'static FuncInfo,
    interceptor: Interceptor,
}

impl PatchEntry {
    pub fn info(&self) -> &'static FuncInfo {
        self.info
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }
}

impl fmt::Debug for PatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchEntry")
            .field("id", &self.id)
            .field("func", &self.info.identity)
            .finish()
    }
}

struct PatchTable {
    map: ArcSwap<HashMap<usize, Arc<PatchEntry>>>,
    writer: Mutex<()>,
    next_id: AtomicU64,
}

static TABLE: OnceLock<PatchTable> = OnceLock::new();

fn table() -> &'static PatchTable {
    TABLE.get_or_init(|| PatchTable {
        map: ArcSwap::from_pointee(HashMap::new()),
        writer: Mutex::new(()),
        next_id: AtomicU64::new(1),
    })
}

pub(crate) fn has_patches() -> bool {
    TABLE.get().map_or(false, |t| !t.map.load().is_empty())
}

/// The patch for `addr` as of now. Callers keep the entry for the whole
/// call, so a concurrent undo does not affect a call already in flight.
pub(crate) fn active_patch(addr: usize) -> Option<Arc<PatchEntry>> {
    if addr == 0 {
        return None;
    }
    TABLE.get()?.map.load().get(&addr).cloned()
}

fn install(info: &'static FuncInfo, interceptor: Interceptor) -> Result<PatchHandle, PatchError> {
    let table = table();
    let _writer = table
        .writer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let current = table.map.load();
    if current.contains_key(&info.address) {
        return Err(PatchError::AlreadyPatched {
            func: info.to_string(),
        });
    }
    let id = table.next_id.fetch_add(1, Ordering::Relaxed);
    let mut next = HashMap::clone(&current);
    next.insert(info.address, Arc::new(PatchEntry { id, info, interceptor }));
    table.map.store(Arc::new(next));
    tracing::debug!(func = %info.identity, addr = info.address, id, "patch installed");
    Ok(PatchHandle {
        addr: info.address,
        id,
        info,
        active: true,
    })
}

/// Owns one installed patch. Dropping the handle undoes the patch.
#[must_use = "dropping the handle undoes the patch"]
pub struct PatchHandle {
    addr: usize,
    id: u64,
    info: &'static FuncInfo,
    active: bool,
}

impl PatchHandle {
    /// Remove this patch. Calling it again is a no-op.
    pub fn undo(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let table = table();
        let _writer = table
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = table.map.load();
        if current.get(&self.addr).map(|entry| entry.id) != Some(self.id) {
            return;
        }
        let mut next = HashMap::clone(&current);
        next.remove(&self.addr);
        table.map.store(Arc::new(next));
        tracing::debug!(func = %self.info.identity, addr = self.addr, id = self.id, "patch undone");
    }

    /// Leave the patch installed for the rest of the process.
    pub fn keep(mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn info(&self) -> &'static FuncInfo {
        self.info
    }
}

impl Drop for PatchHandle {
    fn drop(&mut self) {
        self.undo();
    }
}

impl fmt::Debug for PatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchHandle")
            .field("func", &self.info.identity)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("active", &self.active)
            .finish()
    }
}

// ============================================================================
// Replacement signatures
// ============================================================================

/// A closure usable as a free-function replacement: `Fn(A1, ..) -> R`.
pub trait Replacement<Args>: Send + Sync + 'static {
    type Output: SlotValue;

    fn arg_types() -> Vec<TypeTag>;

    fn invoke(&self, args: &Object<'_>) -> Result<Self::Output, ObjectError>;
}

/// A closure usable as a `&self` method replacement: `Fn(&S, A1, ..) -> R`.
pub trait MethodReplacement<S, Args>: Send + Sync + 'static {
    type Output: SlotValue;

    fn arg_types() -> Vec<TypeTag>;

    fn invoke(&self, recv: &S, args: &Object<'_>) -> Result<Self::Output, ObjectError>;
}

/// A closure usable as a `&mut self` method replacement:
/// `Fn(&mut S, A1, ..) -> R`.
pub trait MethodMutReplacement<S, Args>: Send + Sync + 'static {
    type Output: SlotValue;

    fn arg_types() -> Vec<TypeTag>;

    fn invoke(&self, recv: &mut S, args: &Object<'_>) -> Result<Self::Output, ObjectError>;
}

macro_rules! impl_replacements {
    ($($arg:ident $idx:tt),*) => {
        impl<F, R, $($arg),*> Replacement<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: SlotValue,
            $($arg: SlotValue + Clone,)*
        {
            type Output = R;

            fn arg_types() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),*]
            }

            #[allow(unused_variables)]
            fn invoke(&self, args: &Object<'_>) -> Result<R, ObjectError> {
                Ok(self($(args.value_as::<$arg>($idx)?.clone()),*))
            }
        }

        impl<F, S, R, $($arg),*> MethodReplacement<S, ($($arg,)*)> for F
        where
            F: Fn(&S, $($arg),*) -> R + Send + Sync + 'static,
            S: SlotValue,
            R: SlotValue,
            $($arg: SlotValue + Clone,)*
        {
            type Output = R;

            fn arg_types() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),*]
            }

            #[allow(unused_variables)]
            fn invoke(&self, recv: &S, args: &Object<'_>) -> Result<R, ObjectError> {
                Ok(self(recv, $(args.value_as::<$arg>($idx)?.clone()),*))
            }
        }

        impl<F, S, R, $($arg),*> MethodMutReplacement<S, ($($arg,)*)> for F
        where
            F: Fn(&mut S, $($arg),*) -> R + Send + Sync + 'static,
            S: SlotValue,
            R: SlotValue,
            $($arg: SlotValue + Clone,)*
        {
            type Output = R;

            fn arg_types() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),*]
            }

            #[allow(unused_variables)]
            fn invoke(&self, recv: &mut S, args: &Object<'_>) -> Result<R, ObjectError> {
                Ok(self(recv, $(args.value_as::<$arg>($idx)?.clone()),*))
            }
        }
    };
}

impl_replacements!();
impl_replacements!(A1 0);
impl_replacements!(A1 0, A2 1);
impl_replacements!(A1 0, A2 1, A3 2);
impl_replacements!(A1 0, A2 1, A3 2, A4 3);
impl_replacements!(A1 0, A2 1, A3 2, A4 3, A5 4);
impl_replacements!(A1 0, A2 1, A3 2, A4 3, A5 4, A6 5);

fn result_types<R: SlotValue>() -> Vec<TypeTag> {
    let tag = TypeTag::of::<R>();
    if tag.is_unit() {
        Vec::new()
    } else {
        vec![tag]
    }
}

fn store_result<R: SlotValue>(call: &mut Call<'_, '_>, value: R) -> Result<(), TrapError> {
    if TypeTag::of::<R>().is_unit() {
        return Ok(());
    }
    call.results.field_index(0)?.set(value)?;
    Ok(())
}

fn describe_signature(args: &[TypeTag], results: &[TypeTag]) -> String {
    let list = |tags: &[TypeTag]| {
        tags.iter()
            .map(|tag| tag.name())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match results.len() {
        0 => format!("fn({})", list(args)),
        1 => format!("fn({}) -> {}", list(args), results[0].name()),
        _ => format!("fn({}) -> ({})", list(args), list(results)),
    }
}

fn describe_receiver(recv: Option<(TypeTag, bool)>) -> String {
    match recv {
        None => "no receiver".to_string(),
        Some((tag, false)) => format!("&{}", tag.name()),
        Some((tag, true)) => format!("&mut {}", tag.name()),
    }
}

fn check_receiver(info: &FuncInfo, wanted: Option<(TypeTag, bool)>) -> Result<(), PatchError> {
    let registered = match (&info.recv_type, info.identity.is_method()) {
        (Some(tag), true) => Some((*tag, info.identity.recv_ptr)),
        (None, true) => {
            return Err(PatchError::ReceiverMismatch {
                func: info.to_string(),
                expected: "an untyped receiver".to_string(),
                got: describe_receiver(wanted),
            })
        }
        (_, false) => None,
    };
    if registered != wanted {
        return Err(PatchError::ReceiverMismatch {
            func: info.to_string(),
            expected: describe_receiver(registered),
            got: describe_receiver(wanted),
        });
    }
    Ok(())
}

fn check_signature(info: &FuncInfo, args: &[TypeTag], results: &[TypeTag]) -> Result<(), PatchError> {
    if info.arg_types != args || info.res_types != results {
        return Err(PatchError::SignatureMismatch {
            func: info.to_string(),
            expected: describe_signature(&info.arg_types, &info.res_types),
            got: describe_signature(args, results),
        });
    }
    Ok(())
}

fn resolve(target: &impl Target) -> Result<&'static FuncInfo, PatchError> {
    let addr = target.addr();
    functab::lookup_by_address(addr).ok_or(PatchError::NotInstrumented { addr })
}

// ============================================================================
// Public API
// ============================================================================

/// Replace the free function at `target` with `replacement`.
pub fn patch<T, Args, F>(target: T, replacement: F) -> Result<PatchHandle, PatchError>
where
    T: Target,
    F: Replacement<Args>,
{
    let info = resolve(&target)?;
    check_receiver(info, None)?;
    check_signature(
        info,
        &<F as Replacement<Args>>::arg_types(),
        &result_types::<<F as Replacement<Args>>::Output>(),
    )?;
    let interceptor = Interceptor::new()
        .named(format!("patch {}", info.identity))
        .pre(move |call| {
            let value = <F as Replacement<Args>>::invoke(&replacement, call.args)?;
            store_result(call, value)?;
            Ok(Flow::Skip)
        });
    install(info, interceptor)
}

/// Replace the `&self` method at `target`.
pub fn patch_method<T, S, Args, F>(target: T, replacement: F) -> Result<PatchHandle, PatchError>
where
    T: Target,
    S: SlotValue,
    F: MethodReplacement<S, Args>,
{
    let info = resolve(&target)?;
    check_receiver(info, Some((TypeTag::of::<S>(), false)))?;
    check_signature(
        info,
        &<F as MethodReplacement<S, Args>>::arg_types(),
        &result_types::<<F as MethodReplacement<S, Args>>::Output>(),
    )?;
    let interceptor = Interceptor::new()
        .named(format!("patch {}", info.identity))
        .pre(move |call| {
            let recv = call.recv.value_as::<S>(0)?;
            let value = <F as MethodReplacement<S, Args>>::invoke(&replacement, recv, call.args)?;
            store_result(call, value)?;
            Ok(Flow::Skip)
        });
    install(info, interceptor)
}

/// Replace the `&mut self` method at `target`.
pub fn patch_method_mut<T, S, Args, F>(target: T, replacement: F) -> Result<PatchHandle, PatchError>
where
    T: Target,
    S: SlotValue,
    F: MethodMutReplacement<S, Args>,
{
    let info = resolve(&target)?;
    check_receiver(info, Some((TypeTag::of::<S>(), true)))?;
    check_signature(
        info,
        &<F as MethodMutReplacement<S, Args>>::arg_types(),
        &result_types::<<F as MethodMutReplacement<S, Args>>::Output>(),
    )?;
    let interceptor = Interceptor::new()
        .named(format!("patch {}", info.identity))
        .pre(move |call| {
            let mut field = call.recv.field_index(0)?;
            let recv = field.get_mut_as::<S>()?;
            let value =
                <F as MethodMutReplacement<S, Args>>::invoke(&replacement, recv, call.args)?;
            store_result(call, value)?;
            Ok(Flow::Skip)
        });
    install(info, interceptor)
}

/// Install a raw callback for `target` that always bypasses the original
/// body. The callback writes the results itself; results it leaves unset are
/// reported as a [`TrapError`] and the caller gets the zero value.
///
/// ```ignore
/// let _mock = mock::mock(func_addr!(fetch), |call| {
///     let id: &u64 = call.arg(0)?;
///     call.set_result(0, Ok::<_, FetchError>(format!("cached-{}", id)))?;
///     Ok(())
/// })?;
/// ```
pub fn mock<T, F>(target: T, callback: F) -> Result<PatchHandle, PatchError>
where
    T: Target,
    F: Fn(&mut Call<'_, '_>) -> Result<(), TrapError> + Send + Sync + 'static,
{
    let info = resolve(&target)?;
    let interceptor = Interceptor::new()
        .named(format!("mock {}", info.identity))
        .pre(move |call| {
            callback(call)?;
            Ok(Flow::Skip)
        });
    install(info, interceptor)
}

/// Make reads of the instrumented variable `var` return clones of `value`.
pub fn patch_var<T>(var: &'static T, value: T) -> Result<PatchHandle, PatchError>
where
    T: SlotValue + Clone + Send + Sync,
{
    let info = resolve(&FuncAddr::of_var(var))?;
    if !info.kind.is_var() {
        return Err(PatchError::NotAVariable {
            func: info.to_string(),
        });
    }
    check_signature(info, &[], &[TypeTag::of::<T>()])?;
    let interceptor = Interceptor::new()
        .named(format!("patch var {}", info.identity))
        .pre(move |call| {
            call.results.field_index(0)?.set(value.clone())?;
            Ok(Flow::Skip)
        });
    install(info, interceptor)
}

/// Whether a patch is currently installed for `target`.
pub fn is_patched<T: Target>(target: T) -> bool {
    active_patch(target.addr()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functab::FuncIdentity;

    struct Meter;

    calltrap_object::impl_opaque_slot_value!(Meter);

    fn leaked(info: FuncInfo) -> &'static FuncInfo {
        Box::leak(Box::new(info))
    }

    // Table tests use addresses no real function can have.
    fn at(address: usize, name: &'static str) -> &'static FuncInfo {
        leaked(
            FuncInfo::builder(FuncIdentity::func("unit", name))
                .address(address)
                .build(),
        )
    }

    #[test]
    fn test_install_rejects_double_patch_and_undo_is_idempotent() {
        let info = at(0x11, "doubled");
        let mut first = install(info, Interceptor::new()).unwrap();
        assert!(active_patch(0x11).is_some());

        let err = install(info, Interceptor::new()).unwrap_err();
        assert_eq!(
            err,
            PatchError::AlreadyPatched {
                func: "unit::doubled".to_string()
            }
        );

        first.undo();
        first.undo();
        assert!(active_patch(0x11).is_none());
        drop(first);
        assert!(active_patch(0x11).is_none());
    }

    #[test]
    fn test_stale_handle_does_not_remove_newer_patch() {
        let info = at(0x22, "reinstalled");
        let mut old = install(info, Interceptor::new()).unwrap();
        old.undo();
        let newer = install(info, Interceptor::new()).unwrap();
        drop(old);
        assert!(active_patch(0x22).is_some());
        newer.keep();
        assert!(active_patch(0x22).is_some());
    }

    #[test]
    fn test_in_flight_entry_survives_undo() {
        let info = at(0x33, "in_flight");
        let handle = install(info, Interceptor::new().named("held")).unwrap();
        let entry = active_patch(0x33).unwrap();
        drop(handle);
        assert!(active_patch(0x33).is_none());
        assert_eq!(entry.interceptor().name(), "held");
    }

    #[test]
    fn test_signature_checks() {
        let info = leaked(
            FuncInfo::builder(FuncIdentity::func("unit", "scale"))
                .args::<(i64, f64)>(&[])
                .result::<f64>()
                .build(),
        );
        assert!(check_signature(
            info,
            &<fn(i64, f64) -> f64 as Replacement<(i64, f64)>>::arg_types(),
            &result_types::<f64>()
        )
        .is_ok());

        let err = check_signature(info, &[TypeTag::of::<i64>()], &result_types::<f64>()).unwrap_err();
        match err {
            PatchError::SignatureMismatch { expected, got, .. } => {
                assert_eq!(expected, "fn(i64, f64) -> f64");
                assert_eq!(got, "fn(i64) -> f64");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(result_types::<()>().is_empty());
    }

    #[test]
    fn test_receiver_checks() {
        let method = leaked(
            FuncInfo::builder(FuncIdentity::method("unit", "Meter", "read"))
                .receiver::<Meter>()
                .build(),
        );
        assert!(check_receiver(method, Some((TypeTag::of::<Meter>(), false))).is_ok());
        assert!(matches!(
            check_receiver(method, Some((TypeTag::of::<Meter>(), true))),
            Err(PatchError::ReceiverMismatch { .. })
        ));
        assert!(matches!(
            check_receiver(method, None),
            Err(PatchError::ReceiverMismatch { .. })
        ));

        let free = at(0x44, "free");
        assert!(check_receiver(free, None).is_ok());
        assert!(check_receiver(free, Some((TypeTag::of::<Meter>(), false))).is_err());
    }

    #[test]
    fn test_replacement_reads_typed_args() {
        let mut a = 4i64;
        let mut b = "x".to_string();
        let view = Object::args(vec![
            calltrap_object::Slot::value(&mut a),
            calltrap_object::Slot::value(&mut b),
        ]);
        let repeat = |n: i64, s: String| s.repeat(n as usize);
        assert_eq!(Replacement::<(i64, String)>::invoke(&repeat, &view).unwrap(), "xxxx");

        let wrong = |n: i32| n;
        assert!(matches!(
            Replacement::<(i32,)>::invoke(&wrong, &view),
            Err(ObjectError::TypeMismatch { .. })
        ));
    }
}
