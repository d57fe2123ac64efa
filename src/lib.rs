//! calltrap: in-process call interception
//!
//! Instrumented functions hand every call to a dispatcher, which runs the
//! interceptors active for that call. Interceptors can observe a call, rewrite
//! its arguments, short-circuit it with their own results, or replace the
//! function outright.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           instrumented code             │
//! │      trap::call / linkage::Linkage      │
//! ├─────────────────────────────────────────┤
//! │  trap     - dispatcher, scoped stacks   │
//! │  mock     - address-keyed patches       │
//! │  trace    - call trees, JSON marshal    │
//! │  functab  - function registry           │
//! ├─────────────────────────────────────────┤
//! │   calltrap-object (Object/Slot views)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Instrumenting a function
//!
//! ```ignore
//! use calltrap::{functab, trap, FuncIdentity, FuncInfo};
//!
//! static GREET: FuncIdentity = FuncIdentity::func("demo", "greet");
//!
//! fn greet(name: String) -> String {
//!     trap::call(&GREET, (name,), |(name,)| format!("hello {}", name))
//! }
//!
//! fn init() {
//!     functab::register(
//!         FuncInfo::builder(GREET.clone())
//!             .address(greet as usize)
//!             .args::<(String,)>(&["name"])
//!             .result::<String>()
//!             .build(),
//!     )
//!     .expect("register greet");
//! }
//! ```
//!
//! ## Intercepting it
//!
//! ```ignore
//! let _guard = trap::push_interceptor(Interceptor::new().pre(|call| {
//!     call.set_arg(0, "world".to_string())?;
//!     Ok(Flow::proceed())
//! }));
//! assert_eq!(greet("anyone".into()), "hello world");
//!
//! let _patch = mock::patch(func_addr!(greet), |name: String| name)?;
//! assert_eq!(greet("bob".into()), "bob");
//! ```

pub mod functab;
pub mod linkage;
pub mod mock;
pub mod trace;
pub mod trap;

pub use calltrap_object::{
    Field, Fields, Object, ObjectError, ObjectKind, Slot, SlotValue, TrapError, TypeTag,
};
pub use functab::{FuncAddr, FuncIdentity, FuncInfo, FuncKind, RegistryError, Target};
pub use linkage::{Linkage, NoopLinkage, RuntimeLinkage};
pub use mock::{PatchError, PatchHandle};
pub use trap::{Call, Dispatch, Flow, Interceptor};
