//! Typed helpers for instrumented code.
//!
//! These wrap the dispatch protocol around a body closure:
//!
//! ```ignore
//! static ADD: FuncIdentity = FuncIdentity::func("demo", "add");
//!
//! fn add(a: i64, b: i64) -> i64 {
//!     trap::call(&ADD, (a, b), |(a, b)| *a + *b)
//! }
//! ```
//!
//! Arguments travel as a tuple; interceptors may rewrite them before the
//! body sees them, which is why the body borrows the tuple mutably.

use calltrap_object::{Object, Slot, SlotValue, TypeTag};

use super::{dispatch, is_active, Dispatch};
use crate::functab::FuncIdentity;

/// A tuple of call arguments.
pub trait ArgList: 'static {
    /// Element types, in order.
    fn type_tags() -> Vec<TypeTag>;

    /// One writable slot per element.
    fn slots(&mut self) -> Vec<Slot<'_>>;
}

macro_rules! impl_arg_list {
    ($($name:ident $idx:tt),*) => {
        impl<$($name: SlotValue),*> ArgList for ($($name,)*) {
            fn type_tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$name>()),*]
            }

            fn slots(&mut self) -> Vec<Slot<'_>> {
                vec![$(Slot::value(&mut self.$idx)),*]
            }
        }
    };
}

impl_arg_list!();
impl_arg_list!(A1 0);
impl_arg_list!(A1 0, A2 1);
impl_arg_list!(A1 0, A2 1, A3 2);
impl_arg_list!(A1 0, A2 1, A3 2, A4 3);
impl_arg_list!(A1 0, A2 1, A3 2, A4 3, A5 4);
impl_arg_list!(A1 0, A2 1, A3 2, A4 3, A5 4, A6 5);

// ============================================================================
// Receivers
// ============================================================================

/// How a helper exposes its receiver to interceptors.
trait Receiver {
    fn view(&mut self) -> Object<'_>;
}

struct NoReceiver;

impl Receiver for NoReceiver {
    fn view(&mut self) -> Object<'_> {
        Object::nil()
    }
}

struct Shared<'s, S>(&'s S);

impl<S: SlotValue> Receiver for Shared<'_, S> {
    fn view(&mut self) -> Object<'_> {
        Object::receiver(Slot::shared(self.0))
    }
}

struct Exclusive<'s, S>(&'s mut S);

impl<S: SlotValue> Receiver for Exclusive<'_, S> {
    fn view(&mut self) -> Object<'_> {
        Object::receiver(Slot::value(&mut *self.0))
    }
}

fn result_view<R: SlotValue>(out: &mut Option<R>) -> Object<'_> {
    if TypeTag::of::<R>().is_unit() {
        Object::results(Vec::new())
    } else {
        Object::results(vec![Slot::result(out)])
    }
}

fn intercept<V, A, R>(
    identity: &FuncIdentity,
    recv: &mut V,
    args: &mut A,
    body: impl FnOnce(&mut V, &mut A) -> R,
) -> R
where
    V: Receiver,
    A: ArgList,
    R: SlotValue,
{
    if !is_active() {
        return body(recv, args);
    }

    let mut out: Option<R> = None;
    let decision = {
        let mut recv_view = recv.view();
        let mut args_view = Object::args(args.slots());
        let mut results_view = result_view(&mut out);
        dispatch(identity, &mut recv_view, &mut args_view, &mut results_view)
    };

    match decision {
        // The dispatcher has already reported an unset result; what is left
        // is the zero value, since a skipped body never runs.
        Dispatch::Skip => match out.or_else(R::zero) {
            Some(value) => value,
            None => panic!(
                "{} was skipped without a result and {} has no zero value",
                identity,
                TypeTag::of::<R>()
            ),
        },
        Dispatch::Proceed(None) => body(recv, args),
        Dispatch::Proceed(Some(after)) => {
            let value = body(recv, args);
            if TypeTag::of::<R>().is_unit() {
                let mut recv_view = recv.view();
                let mut args_view = Object::args(args.slots());
                let mut results_view = Object::results(Vec::new());
                after.run(&mut recv_view, &mut args_view, &mut results_view);
                return value;
            }
            out = Some(value);
            {
                let mut recv_view = recv.view();
                let mut args_view = Object::args(args.slots());
                let mut results_view = result_view(&mut out);
                after.run(&mut recv_view, &mut args_view, &mut results_view);
            }
            match out {
                Some(value) => value,
                None => unreachable!("result slots cannot be cleared"),
            }
        }
    }
}

/// Call a free function's `body` through the dispatcher.
pub fn call<A, R>(identity: &FuncIdentity, mut args: A, body: impl FnOnce(&mut A) -> R) -> R
where
    A: ArgList,
    R: SlotValue,
{
    intercept(identity, &mut NoReceiver, &mut args, |_, args| body(args))
}

/// Call a `&self` method's `body` through the dispatcher.
pub fn call_ref<S, A, R>(
    identity: &FuncIdentity,
    recv: &S,
    mut args: A,
    body: impl FnOnce(&S, &mut A) -> R,
) -> R
where
    S: SlotValue,
    A: ArgList,
    R: SlotValue,
{
    intercept(identity, &mut Shared(recv), &mut args, |recv, args| body(recv.0, args))
}

/// Call a `&mut self` method's `body` through the dispatcher.
pub fn call_mut<S, A, R>(
    identity: &FuncIdentity,
    recv: &mut S,
    mut args: A,
    body: impl FnOnce(&mut S, &mut A) -> R,
) -> R
where
    S: SlotValue,
    A: ArgList,
    R: SlotValue,
{
    intercept(identity, &mut Exclusive(recv), &mut args, |recv, args| {
        body(&mut *recv.0, args)
    })
}

/// Read an instrumented variable; patches installed with
/// [`mock::patch_var`](crate::mock::patch_var) take effect here.
pub fn read_var<T>(identity: &FuncIdentity, var: &'static T) -> T
where
    T: SlotValue + Clone,
{
    call(identity, (), |_| var.clone())
}
