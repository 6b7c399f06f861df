//! The advice capability surface.
//!
//! An [`Advice`] is an opaque code generator supplied by the host. The weaver
//! only ever asks it three things: its priority, whether it wants to fire at a
//! given join point, and to emit its code into a target block. Everything else
//! is an optional capability queried through `as_*` methods returning `None`
//! by default.

use crate::{
    assembly::BlockId,
    metadata::{model::MetadataModel, token::Token},
    weaver::context::{FieldAccessContext, WeavingContext},
    Result,
};

/// A priority-ordered, conditionally-invoked code generator.
///
/// Implementations must be `Send + Sync`: the same advice instance is shared by
/// every method it is registered on, and methods may be woven concurrently.
pub trait Advice: Send + Sync {
    /// Composition priority; higher priorities run first before and instead of
    /// an instruction, and last after it.
    fn priority(&self) -> i32;

    /// Whether the advice wants to fire at `ctx.join_point()`.
    fn requires_weave(&self, ctx: &WeavingContext<'_>) -> bool {
        let _ = ctx;
        true
    }

    /// Emits the advice code into `block`.
    ///
    /// Code is emitted through [`WeavingContext::writer`]; every call appends a
    /// new sequence to `block`, so consecutive calls lay out in call order.
    ///
    /// # Errors
    /// Any error is reported as a diagnostic against the woven method; weaving
    /// then continues with the next advice.
    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()>;

    /// Exception advices that catch a specific type
    fn as_typed_exception(&self) -> Option<&dyn TypedExceptionAdvice> {
        None
    }

    /// Type-initializer advices with `beforefieldinit` requirements
    fn as_before_static_constructor(&self) -> Option<&dyn BeforeStaticConstructorAdvice> {
        None
    }
}

/// What a catch handler does once its advice code has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionFlow {
    /// Re-raise the caught exception
    #[default]
    Rethrow,
    /// Swallow it and leave to the method exit, returning the current value
    /// of the return local
    Return,
}

/// Optional capability: an exception advice bound to a specific exception type.
pub trait TypedExceptionAdvice {
    /// The caught type; `None` falls back to the configured root exception type
    fn exception_type(&self, model: &MetadataModel) -> Option<Token>;

    /// Control flow after the handler code
    fn exception_flow(&self) -> ExceptionFlow {
        ExceptionFlow::Rethrow
    }
}

/// Optional capability: an advice woven into a type initializer.
pub trait BeforeStaticConstructorAdvice {
    /// Whether the type must lose `beforefieldinit` so the initializer runs
    /// eagerly at first access
    fn clears_before_field_init(&self) -> bool;
}

/// An advice intercepting reads and writes of a single field.
///
/// Field advices run inside the synthesized accessors, never at the access
/// sites: every access site is rewritten into an accessor call.
pub trait FieldAdvice: Send + Sync {
    /// Ordering between several advices of the same field
    fn priority(&self) -> i32 {
        0
    }

    /// Whether reads are intercepted
    fn intercepts_get(&self) -> bool;

    /// Whether writes are intercepted
    fn intercepts_set(&self) -> bool;

    /// Emits code into the getter. The loaded value sits in
    /// [`FieldAccessContext::value_local`] and is returned after the advice code.
    ///
    /// # Errors
    /// Reported as a diagnostic against the getter.
    fn weave_get(&self, ctx: &mut FieldAccessContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Emits code into the setter. The written value sits in
    /// [`FieldAccessContext::value_local`] and is stored after the advice code;
    /// branching to [`FieldAccessContext::exit_target`] skips the store.
    ///
    /// # Errors
    /// Reported as a diagnostic against the setter.
    fn weave_set(&self, ctx: &mut FieldAccessContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Per-field behaviour of a field registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldAdviceOptions {
    /// Expose the accessors as a property named like the field; the field is
    /// renamed into a backing field
    pub promote_to_property: bool,
    /// Drop the backing storage; accessors no longer load or store it
    pub remove_backing_field: bool,
}
