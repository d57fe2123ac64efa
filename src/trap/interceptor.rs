//! Interceptors and the call bundle they observe.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use calltrap_object::{Object, ObjectError, TrapError};

use crate::functab::FuncInfo;

/// Token returned by a `pre` callback and handed back to the matching `post`.
pub type Data = Option<Box<dyn Any>>;

/// Decision of a `pre` callback.
pub enum Flow {
    /// Keep going; `data` is threaded into this interceptor's `post`.
    Continue(Data),
    /// Stop the pre phase and bypass the original body.
    Skip,
}

impl Flow {
    /// Continue without data.
    pub fn proceed() -> Self {
        Flow::Continue(None)
    }

    /// Continue, keeping `data` for the matching `post`.
    pub fn with_data<T: Any>(data: T) -> Self {
        Flow::Continue(Some(Box::new(data)))
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Continue(data) => f
                .debug_tuple("Continue")
                .field(&data.as_ref().map(|_| "..."))
                .finish(),
            Flow::Skip => f.write_str("Skip"),
        }
    }
}

/// The views of one dispatched call, as seen by a callback.
///
/// The views borrow the instrumented call's own storage; writes through
/// [`Object::field_index`] are visible to the rest of the call.
pub struct Call<'c, 'a> {
    pub info: &'static FuncInfo,
    /// The receiver, or a nil object for free functions.
    pub recv: &'c mut Object<'a>,
    pub args: &'c mut Object<'a>,
    pub results: &'c mut Object<'a>,
}

impl<'c, 'a> Call<'c, 'a> {
    /// Typed read of argument `index`.
    pub fn arg<T: Any>(&self, index: usize) -> Result<&T, ObjectError> {
        self.args.value_as(index)
    }

    /// Typed read of the receiver.
    pub fn receiver<T: Any>(&self) -> Result<&T, ObjectError> {
        self.recv.value_as(0)
    }

    /// Typed read of result `index`; unset results report
    /// [`ObjectError::Unset`].
    pub fn result<T: Any>(&self, index: usize) -> Result<&T, ObjectError> {
        self.results.value_as(index)
    }

    pub fn set_arg<T: Any>(&mut self, index: usize, value: T) -> Result<(), ObjectError> {
        self.args.field_index(index)?.set(value)
    }

    pub fn set_result<T: Any>(&mut self, index: usize, value: T) -> Result<(), ObjectError> {
        self.results.field_index(index)?.set(value)
    }
}

pub(crate) type PreFn = dyn Fn(&mut Call<'_, '_>) -> Result<Flow, TrapError> + Send + Sync;
pub(crate) type PostFn = dyn Fn(&mut Call<'_, '_>, Data) -> Result<(), TrapError> + Send + Sync;

/// A pair of optional `pre`/`post` callbacks.
///
/// `pre` runs before the original body, in chain order. Returning
/// [`Flow::Skip`] or an error bypasses the body. `post` runs after the body
/// (or right away on skip), innermost interceptor first, and receives the
/// data its own `pre` returned.
///
/// # Example
///
/// ```ignore
/// let logger = Interceptor::new()
///     .pre(|call| {
///         tracing::info!(func = %call.info, "enter");
///         Ok(Flow::with_data(Instant::now()))
///     })
///     .post(|call, data| {
///         let started = data.and_then(|d| d.downcast::<Instant>().ok());
///         tracing::info!(func = %call.info, elapsed = ?started.map(|s| s.elapsed()), "exit");
///         Ok(())
///     });
/// ```
#[derive(Clone, Default)]
pub struct Interceptor {
    name: Option<Cow<'static, str>>,
    pre: Option<Arc<PreFn>>,
    post: Option<Arc<PostFn>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in diagnostics.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pre<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Call<'_, '_>) -> Result<Flow, TrapError> + Send + Sync + 'static,
    {
        let pre: Arc<PreFn> = Arc::new(f);
        self.pre = Some(pre);
        self
    }

    pub fn post<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Call<'_, '_>, Data) -> Result<(), TrapError> + Send + Sync + 'static,
    {
        let post: Arc<PostFn> = Arc::new(f);
        self.post = Some(post);
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    pub(crate) fn pre_fn(&self) -> Option<&PreFn> {
        self.pre.as_deref()
    }

    pub(crate) fn post_fn(&self) -> Option<&PostFn> {
        self.post.as_deref()
    }

    pub(crate) fn has_post(&self) -> bool {
        self.post.is_some()
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("name", &self.name())
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish()
    }
}
