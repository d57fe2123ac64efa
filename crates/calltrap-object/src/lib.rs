//! Object views over live call arguments and results.
//!
//! Instrumented functions expose their receiver, arguments and results to
//! interceptors as [`Object`]s: ordered, named, type-erased windows over the
//! call's own storage. Reads and writes are checked at runtime:
//!
//! - [`Object::field_index`] is bounds-checked,
//! - [`Field::set`] checks the value's type against the slot's element type,
//! - read-only slots (`&self` receivers) reject writes,
//! - results start unset and report so on typed reads.
//!
//! ```
//! use calltrap_object::{Object, Slot};
//!
//! let mut a = 20i64;
//! let mut out: Option<i64> = None;
//! {
//!     let mut args = Object::args(vec![Slot::value(&mut a)]);
//!     let mut results = Object::results(vec![Slot::result(&mut out)]);
//!
//!     let doubled = *args.field_index(0)?.get_as::<i64>()? * 2;
//!     results.field_index(0)?.set(doubled)?;
//! }
//! assert_eq!(out, Some(40));
//! # Ok::<(), calltrap_object::ObjectError>(())
//! ```
//!
//! Element values implement [`SlotValue`]. With the `derive` feature,
//! `#[derive(SlotValue)]` implements it for `serde::Serialize` types.

mod error;
pub mod json;
mod object;
mod slot;
mod value;

pub use error::{ObjectError, TrapError};
pub use object::{Field, Fields, Object, ObjectKind};
pub use slot::{SetRefusal, Slot};
pub use value::{json_or_placeholder, placeholder, AsAny, SlotValue, TypeTag};

#[cfg(feature = "derive")]
pub use calltrap_derive::SlotValue;

#[doc(hidden)]
pub mod __private {
    pub use serde;
    pub use serde_json;
    pub use std::convert::From;
    pub use std::default::Default;
    pub use std::option::Option::{self, Some};
}
