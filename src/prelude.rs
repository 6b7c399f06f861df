//! # dotweave Prelude
//!
//! The types needed to describe a module, write advices and run a weaving
//! pass. Import it with `use dotweave::prelude::*;`.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotweave operations
pub use crate::Error;

/// The result type used throughout dotweave
pub use crate::Result;

// ================================================================================================
// Metadata
// ================================================================================================

/// Metadata token type for referencing definitions
pub use crate::metadata::token::Token;

/// Definitions and signatures
pub use crate::metadata::model::{
    FieldDef, FieldFlags, MetadataModel, MethodDef, MethodFlags, MethodSignature, PropertyDef,
    TypeDef, TypeFlags, TypeSig,
};

/// A module under weaving
pub use crate::metadata::module::Module;

/// Diagnostics reported during a pass
pub use crate::metadata::diagnostics::{
    Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics,
};

// ================================================================================================
// Method Bodies
// ================================================================================================

/// Block tree, instructions and editing
pub use crate::assembly::{
    BlockId, HandlerKind, Instruction, InstructionWriter, MethodBody, OpCode, Operand, SequenceId,
};

// ================================================================================================
// Weaving
// ================================================================================================

/// Advice traits
pub use crate::weaver::{
    Advice, BeforeStaticConstructorAdvice, ExceptionFlow, FieldAdvice, FieldAdviceOptions,
    TypedExceptionAdvice,
};

/// What an advice sees while it is woven
pub use crate::weaver::{FieldAccessContext, JoinPoint, JoinPointKinds, WeavingContext};

/// Running a pass
pub use crate::weaver::{
    FieldAccessors, MethodTargets, OperandTargets, WeaveOutcome, Weaver, WeaverConfig,
};
