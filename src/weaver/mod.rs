//! The weaving engine.
//!
//! A [`Weaver`] collects advice registrations and applies them to a
//! [`Module`] in one pass:
//!
//! 1. field advices synthesize accessors and register access rewrites,
//! 2. type-level and all-method registrations are expanded to methods,
//! 3. every method's advice buckets are merged and priority sorted,
//! 4. every method with advices is restructured (method-level kinds) and then
//!    traversed by the weaving state machine (instruction-level kinds),
//! 5. optionally each woven body is verified.
//!
//! Methods are independent: with [`WeaverConfig::parallel`] they are woven on
//! the rayon pool, each body exclusively owned by one task while metadata,
//! advice index and diagnostics are shared.
//!
//! # Key Components
//!
//! - [`joinpoint`] - join-point kinds and the opcode classifier
//! - [`advice`] - the [`Advice`] and [`FieldAdvice`] traits
//! - [`index`] - the per-method advice index with its capacity rules
//! - [`context`] - what an advice sees while it is woven
//! - [`restructure`] - return normalization and around-body regions
//! - [`fields`] - accessor synthesis and access rewriting
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use dotweave::prelude::*;
//!
//! struct Trace;
//!
//! impl Advice for Trace {
//!     fn priority(&self) -> i32 {
//!         0
//!     }
//!
//!     fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> dotweave::Result<()> {
//!         ctx.writer(block)?.emit(OpCode::Nop)
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
//!     Arc::new(Trace),
//!     MethodTargets::All,
//!     JoinPointKinds::BEFORE_METHOD_BODY,
//!     OperandTargets::All,
//! )?;
//! let outcome = weaver.weave(&mut module)?;
//! assert!(outcome.success);
//! assert_eq!(outcome.methods_woven, 1);
//! # Ok::<(), dotweave::Error>(())
//! ```

pub mod advice;
pub mod collection;
pub mod config;
pub mod context;
pub mod fields;
pub mod index;
pub mod joinpoint;
pub mod restructure;
pub mod tags;

mod splitter;
mod state;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rayon::prelude::*;

use crate::{
    assembly::{analyze_stack, linearize, Instruction, MethodBody, OpCode},
    metadata::{
        diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
        model::{MetadataModel, MethodFlags, MethodSignature, TypeFlags, TypeSig},
        module::Module,
        token::Token,
    },
    Error, Result,
};

pub use advice::{
    Advice, BeforeStaticConstructorAdvice, ExceptionFlow, FieldAdvice, FieldAdviceOptions,
    TypedExceptionAdvice,
};
pub use collection::{AdviceCollection, WeaveOrder};
pub use config::WeaverConfig;
pub use context::{FieldAccessContext, MethodSymbols, WeavingContext};
pub use fields::FieldAccessors;
pub use index::{AdviceEntry, AdviceIndex, MethodLevelAdvices, MAX_ADVICES_PER_KIND};
pub use joinpoint::{classify, JoinPoint, JoinPointCategory, JoinPointKinds, JoinPointPosition};
pub use restructure::{classify_constructor, ConstructorKind};
pub use tags::WeaveTags;

use fields::FieldRegistration;

/// Methods an advice is registered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodTargets {
    /// Every method of the module that has a body
    All,
    /// The listed methods
    Methods(Vec<Token>),
}

/// Operands an instruction-level advice is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandTargets {
    /// Any operand
    All,
    /// Only instructions referencing one of the listed fields or methods
    Tokens(Vec<Token>),
}

impl OperandTargets {
    fn keys(&self) -> Vec<Option<Token>> {
        match self {
            OperandTargets::All => vec![None],
            OperandTargets::Tokens(tokens) => tokens.iter().copied().map(Some).collect(),
        }
    }
}

struct DeferredRegistration {
    advice: Arc<dyn Advice>,
    kinds: JoinPointKinds,
    operands: OperandTargets,
}

struct TypeLevelRegistration {
    advice: Arc<dyn Advice>,
    ty: Token,
    kinds: JoinPointKinds,
}

/// Result of a [`Weaver::weave`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeaveOutcome {
    /// False if an error diagnostic (or, with `warnings_as_errors`, a warning) was reported
    pub success: bool,
    /// Number of method bodies that changed
    pub methods_woven: usize,
    /// Accessors synthesized for intercepted fields
    pub fields: Vec<FieldAccessors>,
}

/// Registration surface and entry point of a weaving pass.
pub struct Weaver {
    config: WeaverConfig,
    index: AdviceIndex,
    deferred: Vec<DeferredRegistration>,
    type_level: Vec<TypeLevelRegistration>,
    fields: Vec<FieldRegistration>,
    tags: WeaveTags,
    diagnostics: Diagnostics,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for Weaver {
    fn default() -> Self {
        Self::new(WeaverConfig::default())
    }
}

impl Weaver {
    /// Creates a weaver without registrations
    #[must_use]
    pub fn new(config: WeaverConfig) -> Self {
        Weaver {
            config,
            index: AdviceIndex::new(),
            deferred: Vec::new(),
            type_level: Vec::new(),
            fields: Vec::new(),
            tags: WeaveTags::new(),
            diagnostics: Diagnostics::new(),
            cancel: None,
        }
    }

    /// The configuration of the pass
    #[must_use]
    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    /// Diagnostics reported by registrations and passes so far
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Registrations collected for explicitly targeted methods
    #[must_use]
    pub fn index(&self) -> &AdviceIndex {
        &self.index
    }

    /// Registers `advice` on `methods` for `kinds`, restricted to `operands`.
    ///
    /// Explicit method targets are indexed immediately, so bucket overflow is
    /// reported here; [`MethodTargets::All`] is expanded when the pass starts.
    ///
    /// # Errors
    /// Returns [`Error::InvalidJoinPointKinds`] for an empty kind set and
    /// [`Error::TooManyAdvices`] when a bucket is full. Both are also reported
    /// as diagnostics.
    pub fn register_advice(
        &mut self,
        advice: Arc<dyn Advice>,
        methods: MethodTargets,
        kinds: JoinPointKinds,
        operands: OperandTargets,
    ) -> Result<()> {
        if kinds.is_empty() {
            return Err(self.registration_error(
                Error::InvalidJoinPointKinds("no join-point kind selected".to_string()),
                None,
            ));
        }

        match methods {
            MethodTargets::All => {
                self.deferred.push(DeferredRegistration {
                    advice,
                    kinds,
                    operands,
                });
                Ok(())
            }
            MethodTargets::Methods(targets) => {
                let mut first_error = None;
                for method in targets {
                    for operand in operands.keys() {
                        if let Err(error) =
                            self.index.add(method, Arc::clone(&advice), kinds, operand)
                        {
                            let error = self.registration_error(error, Some(method));
                            first_error.get_or_insert(error);
                        }
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Registers a field advice on `field`.
    pub fn register_field_advice(
        &mut self,
        advice: Arc<dyn FieldAdvice>,
        field: Token,
        options: FieldAdviceOptions,
    ) {
        let order = self.fields.len() as u64;
        self.fields.push(FieldRegistration {
            field,
            advice,
            options,
            order,
        });
    }

    /// Registers a constructor-hook advice on every constructor of `ty`.
    ///
    /// [`JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR`] targets the type
    /// initializer, which is synthesized when the type has none; the instance
    /// constructor kinds target every instance constructor.
    ///
    /// # Errors
    /// Returns [`Error::InvalidJoinPointKinds`] if `kinds` holds anything else.
    pub fn register_type_level_advice(
        &mut self,
        advice: Arc<dyn Advice>,
        ty: Token,
        kinds: JoinPointKinds,
    ) -> Result<()> {
        let allowed =
            JoinPointKinds::INSTANCE_CONSTRUCTOR | JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR;
        if kinds.is_empty() || !allowed.contains(kinds) {
            return Err(self.registration_error(
                Error::InvalidJoinPointKinds(format!(
                    "type-level advices take constructor kinds only, got {kinds:?}"
                )),
                None,
            ));
        }
        self.type_level.push(TypeLevelRegistration { advice, ty, kinds });
        Ok(())
    }

    /// Excludes `method` from weaving
    pub fn ignore_method(&mut self, method: Token) {
        self.tags.ignore(method);
    }

    /// Installs a flag checked between methods; once set, [`Weaver::weave`]
    /// stops with [`Error::Cancelled`].
    pub fn set_cancellation(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    fn registration_error(&self, error: Error, method: Option<Token>) -> Error {
        let mut diagnostic = Diagnostic::new(
            DiagnosticSeverity::Error,
            DiagnosticCategory::Registration,
            error.to_string(),
        );
        if let Some(method) = method {
            diagnostic = diagnostic.with_method(method);
        }
        if let Error::TooManyAdvices {
            operand: Some(operand),
            ..
        } = &error
        {
            diagnostic = diagnostic.with_token(*operand);
        }
        self.diagnostics.push(diagnostic);
        error
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Weaves every registration into `module`.
    ///
    /// The weaver itself is not modified; the same registrations can be applied
    /// to several modules.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if the cancellation flag was observed and
    /// [`Error::InternalConsistency`] if a traversal invariant broke. Everything
    /// else is reported through [`Weaver::diagnostics`].
    pub fn weave(&self, module: &mut Module) -> Result<WeaveOutcome> {
        let errors_before = self.diagnostics.error_count();
        let warnings_before = self.diagnostics.warning_count();

        let mut index = self.index.clone();
        let mut tags = self.tags.clone();

        let fields = fields::prepare_fields(
            module,
            &self.fields,
            &mut index,
            &mut tags,
            &self.diagnostics,
            &self.config,
        )?;
        for registration in &self.type_level {
            self.expand_type_level(module, registration, &mut index, &tags)?;
        }
        for registration in &self.deferred {
            for method in module.methods_with_bodies() {
                if tags.is_ignored(method) {
                    continue;
                }
                for operand in registration.operands.keys() {
                    if let Err(error) = index.add(
                        method,
                        Arc::clone(&registration.advice),
                        registration.kinds,
                        operand,
                    ) {
                        self.registration_error(error, Some(method));
                    }
                }
            }
        }
        clear_before_field_init(module, &index)?;
        index.merge_and_sort(&self.diagnostics);

        let woven = self.weave_bodies(module, &index, &tags)?;

        let errors = self.diagnostics.error_count() - errors_before;
        let warnings = self.diagnostics.warning_count() - warnings_before;
        let success = errors == 0 && !(self.config.warnings_as_errors && warnings > 0);
        log::debug!(
            "weaving finished: {woven} method(s) woven, {errors} error(s), {warnings} warning(s)"
        );

        Ok(WeaveOutcome {
            success,
            methods_woven: woven,
            fields,
        })
    }

    fn weave_bodies(
        &self,
        module: &mut Module,
        index: &AdviceIndex,
        tags: &WeaveTags,
    ) -> Result<usize> {
        let (model, bodies) = module.parts_mut();
        let mut jobs: Vec<(Token, &mut MethodBody)> = bodies
            .iter_mut()
            .filter(|(token, _)| !tags.is_ignored(**token) && index.method(**token).is_some())
            .map(|(token, body)| (*token, body))
            .collect();
        jobs.sort_by_key(|(token, _)| *token);

        let weave_job = |(token, body): (Token, &mut MethodBody)| -> Result<bool> {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(advices) = index.method(token) else {
                return Ok(false);
            };
            self.weave_one(model, token, body, advices)
        };

        let changed: Vec<bool> = if self.config.parallel {
            jobs.into_par_iter().map(weave_job).collect::<Result<_>>()?
        } else {
            jobs.into_iter().map(weave_job).collect::<Result<_>>()?
        };
        Ok(changed.into_iter().filter(|&c| c).count())
    }

    fn weave_one(
        &self,
        model: &MetadataModel,
        token: Token,
        body: &mut MethodBody,
        advices: &MethodLevelAdvices,
    ) -> Result<bool> {
        let Some(method) = model.method(token) else {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagnosticSeverity::Error,
                    DiagnosticCategory::Metadata,
                    format!("body registered for unknown method {token}"),
                )
                .with_method(token),
            );
            return Ok(false);
        };

        let outcome = match state::weave_method(
            body,
            model,
            method,
            advices,
            &self.diagnostics,
            &self.config,
        ) {
            Ok(outcome) => outcome,
            Err(error @ (Error::InternalConsistency { .. } | Error::Cancelled)) => {
                return Err(error)
            }
            Err(error) => {
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticSeverity::Error,
                        DiagnosticCategory::Weaving,
                        format!("weaving {} failed, body left unchanged: {error}", method.name),
                    )
                    .with_method(token),
                );
                return Ok(false);
            }
        };

        if outcome.changed() && self.config.verify_bodies {
            let verified = body.verify_structure().and_then(|()| {
                let linear = linearize(body);
                analyze_stack(&linear, model, !method.signature.ret.is_void())
            });
            if let Err(error) = verified {
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticSeverity::Error,
                        DiagnosticCategory::Weaving,
                        format!("woven body of {} does not verify: {error}", method.name),
                    )
                    .with_method(token),
                );
            }
        }
        log::debug!(
            "woven {} ({}): restructured {}, {} splice(s)",
            method.name,
            token,
            outcome.restructured,
            outcome.splices
        );
        Ok(outcome.changed())
    }

    fn expand_type_level(
        &self,
        module: &mut Module,
        registration: &TypeLevelRegistration,
        index: &mut AdviceIndex,
        tags: &WeaveTags,
    ) -> Result<()> {
        let ty = registration.ty;
        if module.metadata.type_def(ty).is_none() {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagnosticSeverity::Error,
                    DiagnosticCategory::Registration,
                    format!("type-level advice registered on unknown type {ty}"),
                )
                .with_token(ty),
            );
            return Ok(());
        }

        if registration
            .kinds
            .contains(JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR)
        {
            let cctor = match module.metadata.static_constructor(ty) {
                Some(cctor) => cctor,
                None => {
                    let cctor = module.metadata.add_method(
                        ty,
                        ".cctor",
                        MethodSignature::new_static(Vec::new(), TypeSig::Void),
                        MethodFlags::STATIC
                            | MethodFlags::SPECIAL_NAME
                            | MethodFlags::RT_SPECIAL_NAME,
                    )?;
                    module.set_body(
                        cctor,
                        MethodBody::linear(vec![Instruction::simple(OpCode::Ret)])?,
                    )?;
                    log::debug!("synthesized type initializer for {ty}");
                    cctor
                }
            };
            if !tags.is_ignored(cctor) {
                if let Err(error) = index.add(
                    cctor,
                    Arc::clone(&registration.advice),
                    JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR,
                    None,
                ) {
                    self.registration_error(error, Some(cctor));
                }
            }
        }

        let instance = registration.kinds & JoinPointKinds::INSTANCE_CONSTRUCTOR;
        if !instance.is_empty() {
            for ctor in module.metadata.instance_constructors(ty) {
                if tags.is_ignored(ctor) {
                    continue;
                }
                if let Err(error) =
                    index.add(ctor, Arc::clone(&registration.advice), instance, None)
                {
                    self.registration_error(error, Some(ctor));
                }
            }
        }
        Ok(())
    }
}

/// Clears `beforefieldinit` on every type whose initializer gets an advice
/// asking for it.
fn clear_before_field_init(module: &mut Module, index: &AdviceIndex) -> Result<()> {
    let mut types = Vec::new();
    for method in index.methods() {
        let Some(advices) = index.method(method) else {
            continue;
        };
        let clears = advices
            .get_advices(JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR, None)
            .iter()
            .filter_map(|entry| entry.advice.as_before_static_constructor())
            .any(|capability| capability.clears_before_field_init());
        if !clears {
            continue;
        }
        if let Some(def) = module.metadata.method(method) {
            if def.is_static_constructor() {
                types.push(def.declaring_type);
            }
        }
    }
    for ty in types {
        module
            .metadata
            .clear_type_flags(ty, TypeFlags::BEFORE_FIELD_INIT)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{ExhaustLocals, MarkerAdvice, TestModel};

    #[test]
    fn test_empty_kinds_rejected() {
        let mut weaver = Weaver::default();
        let result = weaver.register_advice(
            MarkerAdvice::arc(0, 0),
            MethodTargets::All,
            JoinPointKinds::empty(),
            OperandTargets::All,
        );
        assert!(matches!(result, Err(Error::InvalidJoinPointKinds(_))));
        assert_eq!(weaver.diagnostics().error_count(), 1);
    }

    #[test]
    fn test_type_level_kinds_validated() {
        let test = TestModel::new();
        let mut weaver = Weaver::default();
        assert!(weaver
            .register_type_level_advice(
                MarkerAdvice::arc(0, 0),
                test.ty,
                JoinPointKinds::BEFORE_CALL
            )
            .is_err());
        assert!(weaver
            .register_type_level_advice(
                MarkerAdvice::arc(0, 0),
                test.ty,
                JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR
            )
            .is_ok());
    }

    #[test]
    fn test_cap_reported_at_registration() -> Result<()> {
        let test = TestModel::new();
        let mut weaver = Weaver::default();
        for i in 0..MAX_ADVICES_PER_KIND {
            weaver.register_advice(
                MarkerAdvice::arc(i as i32, i as i32),
                MethodTargets::Methods(vec![test.method]),
                JoinPointKinds::BEFORE_CALL,
                OperandTargets::All,
            )?;
        }
        assert!(!weaver.diagnostics().has_errors());

        let overflow = weaver.register_advice(
            MarkerAdvice::arc(99, 99),
            MethodTargets::Methods(vec![test.method]),
            JoinPointKinds::BEFORE_CALL,
            OperandTargets::All,
        );
        assert!(matches!(overflow, Err(Error::TooManyAdvices { .. })));
        assert_eq!(weaver.diagnostics().error_count(), 1);
        Ok(())
    }

    #[test]
    fn test_static_constructor_synthesized() -> Result<()> {
        let test = TestModel::new();
        let mut module = test.module_with_field_reader()?;
        let mut weaver = Weaver::new(WeaverConfig::default().with_parallel(false));
        weaver.register_type_level_advice(
            MarkerAdvice::arc(1, 7),
            test.ty,
            JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR,
        )?;

        let outcome = weaver.weave(&mut module)?;
        assert!(outcome.success);
        let cctor = module
            .metadata
            .static_constructor(test.ty)
            .ok_or(Error::MethodNotFound(test.method))?;
        let body = module.body(cctor).ok_or(Error::MethodNotFound(cctor))?;
        let opcodes: Vec<OpCode> = body.instructions().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![OpCode::LdcI4, OpCode::Pop, OpCode::Ret]);
        Ok(())
    }

    #[test]
    fn test_cancellation() -> Result<()> {
        let test = TestModel::new();
        let mut module = test.module_with_field_reader()?;
        let mut weaver = Weaver::new(WeaverConfig::default().with_parallel(false));
        weaver.register_advice(
            MarkerAdvice::arc(0, 1),
            MethodTargets::All,
            JoinPointKinds::BEFORE_METHOD_BODY,
            OperandTargets::All,
        )?;
        let flag = Arc::new(AtomicBool::new(true));
        weaver.set_cancellation(Arc::clone(&flag));
        assert!(matches!(weaver.weave(&mut module), Err(Error::Cancelled)));

        flag.store(false, Ordering::Relaxed);
        assert!(weaver.weave(&mut module)?.success);
        Ok(())
    }

    #[test]
    fn test_failed_method_left_unchanged_and_not_counted() -> Result<()> {
        let test = TestModel::new();
        let mut module = test.module_with_field_reader()?;
        let original = module.body(test.method).cloned();
        let mut weaver = Weaver::new(WeaverConfig::default().with_parallel(false));
        weaver.register_advice(
            Arc::new(ExhaustLocals { priority: 10 }),
            MethodTargets::Methods(vec![test.method]),
            JoinPointKinds::AFTER_METHOD_BODY_SUCCESS,
            OperandTargets::All,
        )?;
        weaver.register_advice(
            MarkerAdvice::arc(5, 5),
            MethodTargets::Methods(vec![test.method]),
            JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION,
            OperandTargets::All,
        )?;

        let outcome = weaver.weave(&mut module)?;
        assert!(!outcome.success);
        assert_eq!(outcome.methods_woven, 0);
        assert_eq!(module.body(test.method).cloned(), original);
        let reported = weaver.diagnostics().for_method(test.method);
        assert_eq!(reported.len(), 1);
        assert!(reported[0].message.contains("body left unchanged"));
        Ok(())
    }
}
