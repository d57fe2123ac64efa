//! Function Registry
//!
//! Process-wide table of instrumented functions. Instrumented code registers
//! one [`FuncInfo`] per declared function during initialization; the
//! dispatcher and the mock engine look records up by identity or by resolved
//! code address afterwards.
//!
//! The global registry has two phases. While it is being built, registration
//! goes through a mutex. [`freeze`] (or the first lookup) publishes an
//! immutable [`Registry`] into a `OnceLock`; from then on lookups are
//! lock-free and further registration fails with [`RegistryError::Frozen`].
//!
//! # Example
//!
//! ```ignore
//! fn add(a: i64, b: i64) -> i64 { a + b }
//!
//! static ADD: FuncIdentity = FuncIdentity::func("demo", "add");
//!
//! functab::register(
//!     FuncInfo::builder(ADD.clone())
//!         .address(add as usize)
//!         .args::<(i64, i64)>(&["a", "b"])
//!         .result::<i64>()
//!         .build(),
//! )?;
//!
//! let info = functab::info_func(func_addr!(add)).unwrap();
//! assert_eq!(info.arg_names, ["a", "b"]);
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use calltrap_object::{SlotValue, TypeTag};
use thiserror::Error;

use crate::trap::ArgList;

// ============================================================================
// Identity
// ============================================================================

/// Stable key naming one declared function or method.
///
/// Equality and hashing use the package path, the receiver shape and the
/// identity name. The identity name defaults to `Type.name` for methods and
/// to `name` for free functions.
#[derive(Clone)]
pub struct FuncIdentity {
    pub pkg_path: Cow<'static, str>,
    pub recv_type_name: Option<Cow<'static, str>>,
    /// The receiver is taken by `&mut self`.
    pub recv_ptr: bool,
    pub name: Cow<'static, str>,
    identity_name: Option<Cow<'static, str>>,
    closure: bool,
}

impl FuncIdentity {
    /// A free function.
    pub const fn func(pkg_path: &'static str, name: &'static str) -> Self {
        Self {
            pkg_path: Cow::Borrowed(pkg_path),
            recv_type_name: None,
            recv_ptr: false,
            name: Cow::Borrowed(name),
            identity_name: None,
            closure: false,
        }
    }

    /// A method taking `&self`.
    pub const fn method(pkg_path: &'static str, recv_type: &'static str, name: &'static str) -> Self {
        Self {
            pkg_path: Cow::Borrowed(pkg_path),
            recv_type_name: Some(Cow::Borrowed(recv_type)),
            recv_ptr: false,
            name: Cow::Borrowed(name),
            identity_name: None,
            closure: false,
        }
    }

    /// A method taking `&mut self`.
    pub const fn method_mut(
        pkg_path: &'static str,
        recv_type: &'static str,
        name: &'static str,
    ) -> Self {
        Self {
            pkg_path: Cow::Borrowed(pkg_path),
            recv_type_name: Some(Cow::Borrowed(recv_type)),
            recv_ptr: true,
            name: Cow::Borrowed(name),
            identity_name: None,
            closure: false,
        }
    }

    /// A closure defined inside `parent`. Closures get synthetic names of the
    /// form `<parent>.func<n>`.
    pub fn closure(pkg_path: impl Into<Cow<'static, str>>, parent: &str, n: usize) -> Self {
        Self {
            pkg_path: pkg_path.into(),
            recv_type_name: None,
            recv_ptr: false,
            name: Cow::Owned(format!("{}.func{}", parent, n)),
            identity_name: None,
            closure: true,
        }
    }

    /// Fully specified identity, as emitted for generic instantiations where
    /// the identity name tells instances apart.
    pub const fn new(
        pkg_path: &'static str,
        recv_type_name: Option<&'static str>,
        recv_ptr: bool,
        name: &'static str,
        identity_name: &'static str,
    ) -> Self {
        let recv_type_name = match recv_type_name {
            Some(recv) => Some(Cow::Borrowed(recv)),
            None => None,
        };
        Self {
            pkg_path: Cow::Borrowed(pkg_path),
            recv_type_name,
            recv_ptr,
            name: Cow::Borrowed(name),
            identity_name: Some(Cow::Borrowed(identity_name)),
            closure: false,
        }
    }

    /// Override the identity name.
    pub fn with_identity_name(mut self, identity_name: impl Into<Cow<'static, str>>) -> Self {
        self.identity_name = Some(identity_name.into());
        self
    }

    pub fn identity_name(&self) -> Cow<'_, str> {
        match &self.identity_name {
            Some(name) => Cow::Borrowed(&**name),
            None => match &self.recv_type_name {
                Some(recv) => Cow::Owned(format!("{}.{}", recv, self.name)),
                None => Cow::Borrowed(&*self.name),
            },
        }
    }

    /// Built by [`FuncIdentity::closure`].
    pub fn is_closure(&self) -> bool {
        self.closure
    }

    pub fn is_method(&self) -> bool {
        self.recv_type_name.is_some()
    }

    /// The identity name as string pieces, so hashing and comparison do not
    /// need to allocate.
    fn identity_parts(&self) -> [&str; 3] {
        match (&self.identity_name, &self.recv_type_name) {
            (Some(name), _) => [&**name, "", ""],
            (None, Some(recv)) => [&**recv, ".", &*self.name],
            (None, None) => [&*self.name, "", ""],
        }
    }

    fn recv_shape(&self) -> (Option<&str>, bool) {
        (self.recv_type_name.as_deref(), self.recv_ptr)
    }
}

impl PartialEq for FuncIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.pkg_path == other.pkg_path
            && self.recv_shape() == other.recv_shape()
            && self
                .identity_parts()
                .iter()
                .flat_map(|part| part.bytes())
                .eq(other.identity_parts().iter().flat_map(|part| part.bytes()))
    }
}

impl Eq for FuncIdentity {}

impl Hash for FuncIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pkg_path.hash(state);
        self.recv_shape().hash(state);
        for part in self.identity_parts() {
            state.write(part.as_bytes());
        }
        state.write_u8(0xff);
    }
}

impl fmt::Display for FuncIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.recv_type_name {
            Some(recv) => write!(f, "{}::{}::{}", self.pkg_path, recv, self.name),
            None => write!(f, "{}::{}", self.pkg_path, self.name),
        }
    }
}

impl fmt::Debug for FuncIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuncIdentity({} as {})", self, self.identity_name())
    }
}

// ============================================================================
// Function records
// ============================================================================

/// What a registered record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FuncKind {
    #[default]
    Func,
    Var,
    /// A variable whose address is taken.
    VarPtr,
    Const,
}

impl FuncKind {
    pub fn is_var(self) -> bool {
        matches!(self, FuncKind::Var | FuncKind::VarPtr)
    }
}

/// Registry record for one instrumented function or variable.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub identity: FuncIdentity,
    /// Resolved code address (or the address of a variable). `0` when the
    /// record has no address, e.g. a generic template.
    pub address: usize,
    pub kind: FuncKind,
    pub interface: bool,
    pub generic: bool,
    pub closure: bool,
    pub arg_names: Vec<String>,
    pub res_names: Vec<String>,
    pub arg_types: Vec<TypeTag>,
    pub res_types: Vec<TypeTag>,
    pub recv_type: Option<TypeTag>,
    pub first_arg_is_context: bool,
    pub last_result_is_error: bool,
    pub file: Cow<'static, str>,
    pub line: u32,
}

impl FuncInfo {
    pub fn builder(identity: FuncIdentity) -> FuncInfoBuilder {
        FuncInfoBuilder::new(identity)
    }

    pub fn pkg(&self) -> &str {
        &self.identity.pkg_path
    }

    /// Display name without the package, e.g. `add` or `Counter.get`.
    pub fn display_name(&self) -> Cow<'_, str> {
        self.identity.identity_name()
    }
}

impl fmt::Display for FuncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.identity, f)
    }
}

/// Builder for [`FuncInfo`].
pub struct FuncInfoBuilder {
    info: FuncInfo,
}

impl FuncInfoBuilder {
    fn new(identity: FuncIdentity) -> Self {
        let closure = identity.is_closure();
        Self {
            info: FuncInfo {
                identity,
                address: 0,
                kind: FuncKind::Func,
                interface: false,
                generic: false,
                closure,
                arg_names: Vec::new(),
                res_names: Vec::new(),
                arg_types: Vec::new(),
                res_types: Vec::new(),
                recv_type: None,
                first_arg_is_context: false,
                last_result_is_error: false,
                file: Cow::Borrowed(""),
                line: 0,
            },
        }
    }

    pub fn address(mut self, address: usize) -> Self {
        self.info.address = address;
        self
    }

    pub fn kind(mut self, kind: FuncKind) -> Self {
        self.info.kind = kind;
        self
    }

    pub fn interface(mut self, interface: bool) -> Self {
        self.info.interface = interface;
        self
    }

    pub fn generic(mut self, generic: bool) -> Self {
        self.info.generic = generic;
        self
    }

    pub fn closure(mut self, closure: bool) -> Self {
        self.info.closure = closure;
        self
    }

    /// Receiver type; its shape (`&self` / `&mut self`) comes from the identity.
    pub fn receiver<S: SlotValue>(mut self) -> Self {
        self.info.recv_type = Some(TypeTag::of::<S>());
        self
    }

    /// Argument types from a tuple, with optional names. Missing or empty
    /// names become `_a{i}`.
    pub fn args<A: ArgList>(mut self, names: &[&str]) -> Self {
        self.info.arg_types = A::type_tags();
        self.info.arg_names = names.iter().map(|name| name.to_string()).collect();
        self
    }

    /// A single result. Unit results register no result slot.
    pub fn result<R: SlotValue>(self) -> Self {
        self.named_result::<R>("")
    }

    pub fn named_result<R: SlotValue>(mut self, name: &str) -> Self {
        let tag = TypeTag::of::<R>();
        if tag.is_unit() {
            self.info.res_types.clear();
            self.info.res_names.clear();
        } else {
            self.info.res_types = vec![tag];
            self.info.res_names = vec![name.to_string()];
        }
        self
    }

    pub fn first_arg_is_context(mut self, yes: bool) -> Self {
        self.info.first_arg_is_context = yes;
        self
    }

    /// The last result can carry interceptor errors.
    pub fn last_result_is_error(mut self, yes: bool) -> Self {
        self.info.last_result_is_error = yes;
        self
    }

    pub fn location(mut self, file: &'static str, line: u32) -> Self {
        self.info.file = Cow::Borrowed(file);
        self.info.line = line;
        self
    }

    pub fn build(self) -> FuncInfo {
        self.info
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate registration of {0}")]
    Duplicate(String),

    #[error("Registry is frozen; cannot register {0}")]
    Frozen(String),

    #[error("Malformed function info for {func}: {reason}")]
    Malformed { func: String, reason: String },
}

/// Mutable registry used during initialization.
#[derive(Default)]
pub struct RegistryBuilder {
    infos: Vec<&'static FuncInfo>,
    by_identity: HashMap<FuncIdentity, &'static FuncInfo>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, normalize and store `info`.
    ///
    /// Records are leaked: they live for the rest of the process so that
    /// lookups can hand out `&'static` references.
    pub fn register(&mut self, info: FuncInfo) -> Result<&'static FuncInfo, RegistryError> {
        let info = normalize(info)?;
        if self.by_identity.contains_key(&info.identity) {
            return Err(RegistryError::Duplicate(info.identity.to_string()));
        }
        let info: &'static FuncInfo = Box::leak(Box::new(info));
        tracing::debug!(func = %info.identity, addr = info.address, "registered function");
        self.by_identity.insert(info.identity.clone(), info);
        self.infos.push(info);
        Ok(info)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Freeze into an immutable registry.
    pub fn build(self) -> Registry {
        let mut by_address: HashMap<usize, &'static FuncInfo> =
            HashMap::with_capacity(self.infos.len());
        for info in &self.infos {
            if info.address == 0 {
                continue;
            }
            match by_address.get(&info.address) {
                Some(first) => {
                    tracing::warn!(
                        func = %info.identity,
                        kept = %first.identity,
                        addr = info.address,
                        "address collision; keeping the first record"
                    );
                }
                None => {
                    by_address.insert(info.address, *info);
                }
            }
        }
        Registry {
            infos: self.infos,
            by_identity: self.by_identity,
            by_address,
        }
    }
}

fn normalize(mut info: FuncInfo) -> Result<FuncInfo, RegistryError> {
    let malformed = |info: &FuncInfo, reason: &str| RegistryError::Malformed {
        func: info.identity.to_string(),
        reason: reason.to_string(),
    };

    if info.identity.pkg_path.is_empty() {
        return Err(malformed(&info, "empty package path"));
    }
    if info.identity.name.is_empty() {
        return Err(malformed(&info, "empty name"));
    }
    if info.recv_type.is_some() && !info.identity.is_method() {
        return Err(malformed(&info, "receiver type given for a free function"));
    }
    if !info.arg_names.is_empty() && info.arg_names.len() > info.arg_types.len() {
        return Err(malformed(&info, "more argument names than argument types"));
    }
    if !info.res_names.is_empty() && info.res_names.len() > info.res_types.len() {
        return Err(malformed(&info, "more result names than result types"));
    }
    if info.last_result_is_error && info.res_types.is_empty() {
        return Err(malformed(&info, "last_result_is_error without results"));
    }

    fill_names(&mut info.arg_names, info.arg_types.len(), "_a");
    fill_names(&mut info.res_names, info.res_types.len(), "_r");
    Ok(info)
}

fn fill_names(names: &mut Vec<String>, len: usize, prefix: &str) {
    names.resize(len, String::new());
    for (i, name) in names.iter_mut().enumerate() {
        if name.is_empty() {
            *name = format!("{}{}", prefix, i);
        }
    }
}

/// Immutable registry snapshot.
pub struct Registry {
    infos: Vec<&'static FuncInfo>,
    by_identity: HashMap<FuncIdentity, &'static FuncInfo>,
    by_address: HashMap<usize, &'static FuncInfo>,
}

impl Registry {
    pub fn lookup(&self, identity: &FuncIdentity) -> Option<&'static FuncInfo> {
        self.by_identity.get(identity).copied()
    }

    pub fn lookup_by_address(&self, address: usize) -> Option<&'static FuncInfo> {
        if address == 0 {
            return None;
        }
        self.by_address.get(&address).copied()
    }

    /// All records in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &'static FuncInfo> + '_ {
        self.infos.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ============================================================================
// Global registry
// ============================================================================

struct Pending {
    builder: RegistryBuilder,
    frozen: bool,
}

static PENDING: OnceLock<Mutex<Pending>> = OnceLock::new();
static FROZEN: OnceLock<Registry> = OnceLock::new();
static PENDING_COUNT: AtomicUsize = AtomicUsize::new(0);

fn pending() -> MutexGuard<'static, Pending> {
    let lock = PENDING.get_or_init(|| {
        Mutex::new(Pending {
            builder: RegistryBuilder::new(),
            frozen: false,
        })
    });
    // Registration never leaves the builder half-updated, so a poisoned
    // lock is still consistent.
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register `info` in the global registry.
pub fn register(info: FuncInfo) -> Result<&'static FuncInfo, RegistryError> {
    let mut pending = pending();
    if pending.frozen {
        return Err(RegistryError::Frozen(info.identity.to_string()));
    }
    let info = pending.builder.register(info)?;
    PENDING_COUNT.fetch_add(1, Ordering::Relaxed);
    Ok(info)
}

/// End the registration phase and publish the immutable registry.
///
/// Idempotent. Called implicitly by the first lookup.
pub fn freeze() -> &'static Registry {
    FROZEN.get_or_init(|| {
        let mut pending = pending();
        pending.frozen = true;
        let builder = std::mem::take(&mut pending.builder);
        tracing::debug!(functions = builder.len(), "function registry frozen");
        builder.build()
    })
}

pub fn is_frozen() -> bool {
    FROZEN.get().is_some()
}

/// Number of records registered so far, frozen or not.
pub fn registered_count() -> usize {
    PENDING_COUNT.load(Ordering::Relaxed)
}

pub fn lookup(identity: &FuncIdentity) -> Option<&'static FuncInfo> {
    freeze().lookup(identity)
}

pub fn lookup_by_address(address: usize) -> Option<&'static FuncInfo> {
    freeze().lookup_by_address(address)
}

/// The record for a function value.
pub fn info_func<T: Target>(target: T) -> Option<&'static FuncInfo> {
    lookup_by_address(target.addr())
}

/// All registered records, in registration order.
pub fn all() -> impl Iterator<Item = &'static FuncInfo> {
    freeze().iter()
}

// ============================================================================
// Function values
// ============================================================================

/// A resolved code address.
///
/// Usually built with [`func_addr!`](crate::func_addr) from a function item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncAddr(pub usize);

impl FuncAddr {
    /// The address of a variable.
    pub fn of_var<T>(var: &'static T) -> Self {
        FuncAddr(var as *const T as usize)
    }
}

/// A function value that resolves to a code address.
pub trait Target {
    fn addr(&self) -> usize;
}

impl Target for FuncAddr {
    fn addr(&self) -> usize {
        self.0
    }
}

macro_rules! impl_fn_target {
    ($($arg:ident),*) => {
        impl<R, $($arg),*> Target for fn($($arg),*) -> R {
            fn addr(&self) -> usize {
                *self as usize
            }
        }
    };
}

impl_fn_target!();
impl_fn_target!(A1);
impl_fn_target!(A1, A2);
impl_fn_target!(A1, A2, A3);
impl_fn_target!(A1, A2, A3, A4);
impl_fn_target!(A1, A2, A3, A4, A5);
impl_fn_target!(A1, A2, A3, A4, A5, A6);
impl_fn_target!(A1, A2, A3, A4, A5, A6, A7);

/// The [`FuncAddr`] of a function item or method path.
///
/// ```ignore
/// let addr = func_addr!(Counter::get);
/// ```
#[macro_export]
macro_rules! func_addr {
    ($path:path) => {
        $crate::functab::FuncAddr($path as usize)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_add(a: i64, b: i64) -> i64 {
        a + b
    }

    fn sample_neg(a: i64) -> i64 {
        -a
    }

    fn add_info() -> FuncInfo {
        FuncInfo::builder(FuncIdentity::func("sample", "add"))
            .address(sample_add as usize)
            .args::<(i64, i64)>(&["a"])
            .result::<i64>()
            .build()
    }

    #[test]
    fn test_identity_name_defaults() {
        let func = FuncIdentity::func("pkg", "run");
        assert_eq!(func.identity_name(), "run");

        let method = FuncIdentity::method("pkg", "Counter", "get");
        assert_eq!(method.identity_name(), "Counter.get");
        assert_eq!(method.to_string(), "pkg::Counter::get");

        let explicit = FuncIdentity::method("pkg", "Counter", "get").with_identity_name("Counter.get");
        assert_eq!(method, explicit);
        assert_ne!(method, FuncIdentity::method_mut("pkg", "Counter", "get"));
    }

    #[test]
    fn test_identity_hash_matches_eq() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(FuncIdentity::method("pkg", "T", "m"));
        assert!(set.contains(&FuncIdentity::method("pkg", "T", "m").with_identity_name("T.m")));
        assert!(!set.contains(&FuncIdentity::func("pkg", "T.m")));
    }

    #[test]
    fn test_register_normalizes_names() {
        let mut builder = RegistryBuilder::new();
        let info = builder.register(add_info()).unwrap();
        assert_eq!(info.arg_names, ["a", "_a1"]);
        assert_eq!(info.res_names, ["_r0"]);
        assert_eq!(info.arg_types, [TypeTag::of::<i64>(), TypeTag::of::<i64>()]);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.register(add_info()).unwrap();
        let err = builder.register(add_info()).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("sample::add".to_string()));
    }

    #[test]
    fn test_malformed_info_rejected() {
        let mut builder = RegistryBuilder::new();
        let err = builder
            .register(FuncInfo::builder(FuncIdentity::func("", "x")).build())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Malformed { .. }));

        let err = builder
            .register(
                FuncInfo::builder(FuncIdentity::func("p", "x"))
                    .last_result_is_error(true)
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Malformed { .. }));
    }

    #[test]
    fn test_lookup_by_identity_and_address() {
        let mut builder = RegistryBuilder::new();
        builder.register(add_info()).unwrap();
        builder
            .register(
                FuncInfo::builder(FuncIdentity::func("sample", "neg"))
                    .address(sample_neg as usize)
                    .args::<(i64,)>(&[])
                    .result::<i64>()
                    .build(),
            )
            .unwrap();
        let registry = builder.build();

        let add = registry.lookup(&FuncIdentity::func("sample", "add")).unwrap();
        let neg = registry.lookup(&FuncIdentity::func("sample", "neg")).unwrap();
        assert!(!std::ptr::eq(add, neg));
        assert!(std::ptr::eq(
            registry.lookup_by_address(sample_add as usize).unwrap(),
            add
        ));
        assert!(registry.lookup_by_address(0).is_none());
        assert_eq!(
            registry.iter().map(|i| i.display_name().into_owned()).collect::<Vec<_>>(),
            ["add", "neg"]
        );
    }

    #[test]
    fn test_address_collision_keeps_first() {
        let mut builder = RegistryBuilder::new();
        let first = builder.register(add_info()).unwrap();
        builder
            .register(
                FuncInfo::builder(FuncIdentity::func("sample", "alias"))
                    .address(sample_add as usize)
                    .build(),
            )
            .unwrap();
        let registry = builder.build();
        assert!(std::ptr::eq(
            registry.lookup_by_address(sample_add as usize).unwrap(),
            first
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_closure_identity() {
        let id = FuncIdentity::closure("pkg", "main", 1);
        assert_eq!(id.name, "main.func1");
        let info = FuncInfo::builder(id).build();
        assert!(info.closure);

        // Only the closure constructor (or the builder flag) marks closures.
        let table = FuncInfo::builder(FuncIdentity::func("parse", "parse.function_table")).build();
        assert!(!table.closure);
        let marked = FuncInfo::builder(FuncIdentity::func("parse", "callback"))
            .closure(true)
            .build();
        assert!(marked.closure);
    }

    #[test]
    fn test_fn_pointer_target() {
        let f: fn(i64, i64) -> i64 = sample_add;
        assert_eq!(f.addr(), sample_add as usize);
        assert_eq!(func_addr!(sample_add), FuncAddr(sample_add as usize));
    }
}
