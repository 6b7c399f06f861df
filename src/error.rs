use thiserror::Error;

use crate::{metadata::token::Token, weaver::JoinPointKinds};

macro_rules! consistency_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::InternalConsistency {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InternalConsistency {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most problems found while weaving are *not* returned through this type: they are reported as
/// [`crate::metadata::diagnostics::Diagnostic`] entries and the offending operation is skipped.
/// An `Err` escaping [`crate::weaver::Weaver::weave`] therefore means either the pass was
/// cancelled or one of the block-tree invariants was violated by a bug.
///
/// # Error Categories
///
/// ## Registration Errors
/// - [`Error::TooManyAdvices`] - An advice bucket would exceed its capacity
/// - [`Error::InvalidJoinPointKinds`] - A registration named no usable join-point kind
///
/// ## Lookup Errors
/// - [`Error::TypeNotFound`] - A required type is not part of the metadata model
/// - [`Error::MethodNotFound`] - A method token does not resolve
/// - [`Error::FieldNotFound`] - A field token does not resolve
///
/// ## Structural Errors
/// - [`Error::InvalidBody`] - A method body violates the block-tree rules
/// - [`Error::UnsupportedShape`] - A body shape the weaver refuses to transform
/// - [`Error::InternalConsistency`] - Traversal invariants broken (always a bug)
///
/// ## Control Errors
/// - [`Error::Cancelled`] - The pass observed its cancellation flag between methods
/// - [`Error::Emulation`] - The reference evaluator failed to execute a body
///
/// # Examples
///
/// ```rust,no_run
/// use dotweave::{Error, prelude::*};
///
/// # fn run(weaver: &Weaver, module: &mut Module) {
/// match weaver.weave(module) {
///     Ok(outcome) if outcome.success => println!("woven {} methods", outcome.methods_woven),
///     Ok(_) => eprintln!("{}", weaver.diagnostics().summary()),
///     Err(Error::Cancelled) => eprintln!("cancelled"),
///     Err(e) => eprintln!("fatal: {e}"),
/// }
/// # }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Registration errors
    /// An advice bucket would exceed [`crate::weaver::MAX_ADVICES_PER_KIND`] entries.
    ///
    /// Weaving evaluates each bucket into a 32-bit participation mask, so a bucket can never
    /// hold more advices than the mask has bits.
    ///
    /// # Fields
    ///
    /// * `method` - The method the bucket belongs to
    /// * `kind` - The (single-bit) join-point kind of the bucket
    /// * `operand` - The operand key of the bucket, if any
    #[error("Too many advices for method {method}, kind {kind:?}, operand {operand:?}")]
    TooManyAdvices {
        /// The method the bucket belongs to
        method: Token,
        /// The join-point kind of the bucket
        kind: JoinPointKinds,
        /// The operand key of the bucket
        operand: Option<Token>,
    },

    /// A registration named no join-point kind that the target accepts.
    #[error("Invalid join-point kinds - {0}")]
    InvalidJoinPointKinds(String),

    // Lookup errors
    /// Failed to find a type in the metadata model.
    ///
    /// Carries the full name (`Namespace.Name`) that was looked up.
    #[error("Failed to find type - {0}")]
    TypeNotFound(String),

    /// Failed to resolve a method token.
    #[error("Failed to find method - {0}")]
    MethodNotFound(Token),

    /// Failed to resolve a field token.
    #[error("Failed to find field - {0}")]
    FieldNotFound(Token),

    // Structural errors
    /// A method body violates the instruction-block tree rules.
    ///
    /// Raised by [`crate::assembly::MethodBody::verify_structure`] and by the layout pass,
    /// e.g. for dangling branch targets or a block that owns both children and sequences.
    #[error("Invalid method body - {0}")]
    InvalidBody(String),

    /// The body has a shape the weaver refuses to transform.
    #[error("Unsupported body shape - {0}")]
    UnsupportedShape(String),

    /// A traversal or tree invariant was violated.
    ///
    /// This always indicates a bug in the weaver, never bad input. The error records the
    /// source location where the violation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the broken invariant
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Internal consistency - {file}:{line}: {message}")]
    InternalConsistency {
        /// The message to be printed for the violation
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    // Control errors
    /// The pass was cancelled between two methods.
    #[error("Weaving was cancelled")]
    Cancelled,

    /// The reference evaluator failed.
    #[error("Emulation - {0}")]
    Emulation(String),
}
