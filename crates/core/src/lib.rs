//! Core types for fleet.
//!
//! - **Object model**: [`DynamicObject`], [`ObjectMeta`], [`ResourceKind`], [`OwnerReference`]
//! - **Selectors**: [`LabelSelector`] for label and annotation matching
//! - **Errors**: [`Error`] and [`Result`] shared by cluster backends

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod object;
pub mod result;
pub mod selector;

pub use error::Error;
pub use object::{DynamicObject, NamespacedName, ObjectMeta, OwnerReference, ResourceKind};
pub use result::{Result, ResultExt};
pub use selector::{LabelSelector, Operator, Requirement};
