//! Contexts handed to advices.
//!
//! [`WeavingContext`] is rebuilt for every advice invocation at a join point;
//! it borrows the method body mutably for the duration of that call only.
//! [`FieldAccessContext`] plays the same role inside synthesized field
//! accessors.

use crate::{
    assembly::{BlockId, Instruction, InstructionWriter, MethodBody, SequenceId},
    metadata::{
        diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
        model::{FieldDef, MetadataModel, MethodDef, TypeSig},
    },
    weaver::{joinpoint::JoinPoint, restructure::ConstructorKind},
    Result,
};

/// Locals and targets synthesized by the body restructurer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSymbols {
    /// Local holding the return value, for non-void methods with after-body advice
    pub return_local: Option<u16>,
    /// Local holding the caught exception, inside a catch handler
    pub exception_local: Option<u16>,
    /// The shared exit sequence `ret` instructions were redirected to
    pub exit: Option<SequenceId>,
}

/// What an advice sees while it is woven.
pub struct WeavingContext<'a> {
    body: &'a mut MethodBody,
    model: &'a MetadataModel,
    method: &'a MethodDef,
    diagnostics: &'a Diagnostics,
    join_point: JoinPoint,
    symbols: MethodSymbols,
    constructor: ConstructorKind,
    initialized: bool,
    next_instruction: Option<Instruction>,
    consume_next: bool,
}

impl<'a> WeavingContext<'a> {
    pub(crate) fn new(
        body: &'a mut MethodBody,
        model: &'a MetadataModel,
        method: &'a MethodDef,
        diagnostics: &'a Diagnostics,
        join_point: JoinPoint,
    ) -> Self {
        WeavingContext {
            body,
            model,
            method,
            diagnostics,
            join_point,
            symbols: MethodSymbols::default(),
            constructor: ConstructorKind::NotConstructor,
            initialized: true,
            next_instruction: None,
            consume_next: false,
        }
    }

    pub(crate) fn with_symbols(mut self, symbols: MethodSymbols) -> Self {
        self.symbols = symbols;
        self
    }

    pub(crate) fn with_constructor(mut self, kind: ConstructorKind, initialized: bool) -> Self {
        self.constructor = kind;
        self.initialized = initialized;
        self
    }

    pub(crate) fn with_next_instruction(mut self, next: Option<Instruction>) -> Self {
        self.next_instruction = next;
        self
    }

    pub(crate) fn set_join_point(&mut self, join_point: JoinPoint) {
        self.join_point = join_point;
    }

    pub(crate) fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    pub(crate) fn next_consumed(&self) -> bool {
        self.consume_next
    }

    /// The join point being woven
    #[must_use]
    pub fn join_point(&self) -> &JoinPoint {
        &self.join_point
    }

    /// The method being woven
    #[must_use]
    pub fn method(&self) -> &MethodDef {
        self.method
    }

    /// Metadata lookup surface
    #[must_use]
    pub fn model(&self) -> &MetadataModel {
        self.model
    }

    /// The method body
    #[must_use]
    pub fn body(&self) -> &MethodBody {
        &*self.body
    }

    /// The method body, for advices that build their own block structure
    pub fn body_mut(&mut self) -> &mut MethodBody {
        &mut *self.body
    }

    /// Diagnostics sink of the pass
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        self.diagnostics
    }

    /// Appends a new sequence to `block` and attaches a writer to it.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidBody`] if `block` holds child blocks, and
    /// an internal consistency error if a writer is already attached.
    pub fn writer(&mut self, block: BlockId) -> Result<InstructionWriter<'_>> {
        let sequence = self.body.add_sequence(block)?;
        self.body.attach_writer(sequence)
    }

    /// Declares a local in the woven method.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidBody`] past 65535 locals.
    pub fn define_local(&mut self, sig: TypeSig) -> Result<u16> {
        self.body.define_local(sig)
    }

    /// Local holding the return value, when the body was restructured
    #[must_use]
    pub fn return_local(&self) -> Option<u16> {
        self.symbols.return_local
    }

    /// Local holding the caught exception, inside an exception advice
    #[must_use]
    pub fn exception_local(&self) -> Option<u16> {
        self.symbols.exception_local
    }

    /// The shared method exit, when the body was restructured
    #[must_use]
    pub fn exit_target(&self) -> Option<SequenceId> {
        self.symbols.exit
    }

    /// Constructor classification of the woven method
    #[must_use]
    pub fn constructor_kind(&self) -> ConstructorKind {
        self.constructor
    }

    /// False in constructors before the chained constructor call has run
    #[must_use]
    pub fn is_this_initialized(&self) -> bool {
        self.initialized
    }

    /// The instruction following the join point in the same sequence
    #[must_use]
    pub fn next_instruction(&self) -> Option<&Instruction> {
        self.next_instruction.as_ref()
    }

    /// Removes the following instruction from the body once the advice is woven.
    ///
    /// Returns false if there is no following instruction in the sequence.
    pub fn consume_next_instruction(&mut self) -> bool {
        if self.next_instruction.is_none() {
            return false;
        }
        self.consume_next = true;
        true
    }

    /// Reports a diagnostic located at the join point
    pub fn report(
        &self,
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) {
        let mut diagnostic =
            Diagnostic::new(severity, category, message).with_method(self.method.token);
        if let Some((sequence, offset)) = self.join_point.location {
            diagnostic = diagnostic.with_position(sequence, offset);
        }
        if let Some(operand) = self.join_point.operand {
            diagnostic = diagnostic.with_token(operand);
        }
        self.diagnostics.push(diagnostic);
    }
}

/// What a field advice sees inside a synthesized accessor.
pub struct FieldAccessContext<'a> {
    pub(crate) body: &'a mut MethodBody,
    pub(crate) model: &'a MetadataModel,
    pub(crate) field: &'a FieldDef,
    pub(crate) accessor: &'a MethodDef,
    pub(crate) block: BlockId,
    pub(crate) value_local: u16,
    pub(crate) store: Option<SequenceId>,
    pub(crate) exit: SequenceId,
}

impl FieldAccessContext<'_> {
    /// The intercepted field
    #[must_use]
    pub fn field(&self) -> &FieldDef {
        self.field
    }

    /// The accessor being generated
    #[must_use]
    pub fn accessor(&self) -> &MethodDef {
        self.accessor
    }

    /// Metadata lookup surface
    #[must_use]
    pub fn model(&self) -> &MetadataModel {
        self.model
    }

    /// Local holding the value read or about to be written
    #[must_use]
    pub fn value_local(&self) -> u16 {
        self.value_local
    }

    /// Sequence performing the store into the backing field, setters only.
    /// `None` when the backing field was removed.
    #[must_use]
    pub fn store_target(&self) -> Option<SequenceId> {
        self.store
    }

    /// Sequence returning from the accessor
    #[must_use]
    pub fn exit_target(&self) -> SequenceId {
        self.exit
    }

    /// Appends a new sequence to the advice block and attaches a writer to it.
    ///
    /// # Errors
    /// Returns an internal consistency error if a writer is already attached.
    pub fn writer(&mut self) -> Result<InstructionWriter<'_>> {
        let sequence = self.body.add_sequence(self.block)?;
        self.body.attach_writer(sequence)
    }

    /// Declares a local in the accessor.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidBody`] past 65535 locals.
    pub fn define_local(&mut self, sig: TypeSig) -> Result<u16> {
        self.body.define_local(sig)
    }
}
