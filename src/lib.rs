// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # dotweave
//!
//! An aspect weaver for CIL method bodies. Advices are registered against
//! join points (instructions such as calls, field accesses and throws, or
//! whole-method positions such as "before the body" or "on exception") and
//! the weaver splices the code they emit directly into each affected method,
//! keeping branch targets, exception regions and constructor initialization
//! order intact.
//!
//! ## Features
//!
//! - **Instruction-level join points** - before, after or instead of calls, field and array accesses, throws and argument accesses
//! - **Method-level join points** - before body, on success, on exception (typed), always
//! - **Constructor awareness** - hooks before and after the chained base constructor call
//! - **Field interception** - synthesized accessors, property promotion and field removal
//! - **Priority composition** - up to 32 advices per kind and method, deterministically ordered
//! - **Parallel weaving** - independent methods are woven on the rayon pool
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dotweave::prelude::*;
//!
//! struct Count(i32);
//!
//! impl Advice for Count {
//!     fn priority(&self) -> i32 {
//!         self.0
//!     }
//!
//!     fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> dotweave::Result<()> {
//!         let mut writer = ctx.writer(block)?;
//!         writer.emit_i4(self.0)?;
//!         writer.emit(OpCode::Pop)
//!     }
//! }
//!
//! let mut model = MetadataModel::new();
//! let ty = model.add_type("Demo", "Widget", None, TypeFlags::empty());
//! let run = model.add_method(ty, "Run", MethodSignature::new_static(vec![], TypeSig::Void), MethodFlags::STATIC)?;
//! let mut module = Module::new(model);
//! module.set_body(run, MethodBody::linear(vec![Instruction::simple(OpCode::Ret)])?)?;
//!
//! let mut weaver = Weaver::new(WeaverConfig::default());
//! weaver.register_advice(
//!     Arc::new(Count(1)),
//!     MethodTargets::Methods(vec![run]),
//!     JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
//!     OperandTargets::All,
//! )?;
//! let outcome = weaver.weave(&mut module)?;
//! assert!(outcome.success);
//! # Ok::<(), dotweave::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - tokens, the metadata model, modules and diagnostics
//! - [`assembly`] - block-structured method bodies, readers, writers and layout
//! - [`weaver`] - join points, advice index, restructuring and the weaving state machine
//! - [`emulation`] - a reference evaluator for executing woven bodies
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result`]. Problems that do not stop a
//! weaving pass (an advice over capacity, an unsupported constructor shape,
//! a risky field address) are reported as
//! [`metadata::diagnostics::Diagnostic`]s instead.

#[macro_use]
pub(crate) mod error;

#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// ```rust
/// use dotweave::prelude::*;
///
/// let model = MetadataModel::new();
/// assert!(model.find_type("System", "Object").is_none());
/// ```
pub mod prelude;

/// Block-structured method bodies.
///
/// Bodies are trees of blocks over instruction sequences. Exception handlers
/// attach to the block they protect and branches target sequences, so splicing
/// code never invalidates offsets.
pub mod assembly;

/// Reference evaluator for method bodies.
pub mod emulation;

/// Tokens, definitions, modules and diagnostics.
pub mod metadata;

/// The weaving engine.
pub mod weaver;

/// `dotweave` Result type.
///
/// Shorthand for `std::result::Result<T, dotweave::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// `dotweave` Error type.
pub use error::Error;

pub use metadata::{diagnostics::Diagnostics, module::Module, token::Token};
pub use weaver::{Weaver, WeaverConfig};
