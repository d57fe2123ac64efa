//! Linkage
//!
//! The capability interface generated code is written against. Instrumented
//! crates register their functions and variables at start-up and dispatch
//! every call through a [`Linkage`], so a test build can swap the runtime
//! for [`NoopLinkage`] without touching the generated code.

use std::sync::Mutex;

use calltrap_object::Object;

use crate::functab::{self, FuncIdentity, FuncInfo, FuncKind};
use crate::trap::{self, Dispatch};

/// What instrumented code needs from the runtime.
pub trait Linkage: Send + Sync {
    /// Register one instrumented function. Called once per identity.
    fn register_func(&self, info: FuncInfo);

    /// Register one instrumented variable.
    fn register_var(&self, info: FuncInfo);

    /// Dispatch one call; see [`trap::dispatch`].
    fn dispatch<'a>(
        &self,
        identity: &FuncIdentity,
        recv: &mut Object<'a>,
        args: &mut Object<'a>,
        results: &mut Object<'a>,
    ) -> Dispatch;
}

/// Forwards to the process-wide registry and dispatcher.
///
/// Registration errors mean the generated code is inconsistent with itself,
/// so they abort start-up with a panic.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeLinkage;

impl RuntimeLinkage {
    fn register(&self, info: FuncInfo) {
        if let Err(err) = functab::register(info) {
            panic!("calltrap: function registration failed: {}", err);
        }
    }
}

impl Linkage for RuntimeLinkage {
    fn register_func(&self, info: FuncInfo) {
        self.register(info);
    }

    fn register_var(&self, mut info: FuncInfo) {
        if info.kind == FuncKind::Func {
            info.kind = FuncKind::Var;
        }
        self.register(info);
    }

    fn dispatch<'a>(
        &self,
        identity: &FuncIdentity,
        recv: &mut Object<'a>,
        args: &mut Object<'a>,
        results: &mut Object<'a>,
    ) -> Dispatch {
        trap::dispatch(identity, recv, args, results)
    }
}

/// Records registrations and never intercepts anything.
#[derive(Debug, Default)]
pub struct NoopLinkage {
    registered: Mutex<Vec<FuncIdentity>>,
}

impl NoopLinkage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities registered so far, in order.
    pub fn registered(&self) -> Vec<FuncIdentity> {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, info: FuncInfo) {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(info.identity);
    }
}

impl Linkage for NoopLinkage {
    fn register_func(&self, info: FuncInfo) {
        self.record(info);
    }

    fn register_var(&self, info: FuncInfo) {
        self.record(info);
    }

    fn dispatch<'a>(
        &self,
        _identity: &FuncIdentity,
        _recv: &mut Object<'a>,
        _args: &mut Object<'a>,
        _results: &mut Object<'a>,
    ) -> Dispatch {
        Dispatch::Proceed(None)
    }
}
