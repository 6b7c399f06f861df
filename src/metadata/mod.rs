//! Metadata lookup surface consumed by the weaver.
//!
//! - [`token`] - table/row tokens referencing definitions
//! - [`model`] - type, method, field and property definitions with cached lookups
//! - [`module`] - a model together with the method bodies to weave
//! - [`diagnostics`] - severity-leveled reports collected during a pass

pub mod diagnostics;
pub mod model;
pub mod module;
pub mod token;
