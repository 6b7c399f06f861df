//! Integration tests for method-level weaving: before/after body advices,
//! exception handlers and constructor hooks.

use std::sync::{Arc, Mutex};

use dotweave::{
    emulation::{Emulator, Outcome, Value},
    prelude::*,
};

const CTOR: MethodFlags = MethodFlags::SPECIAL_NAME.union(MethodFlags::RT_SPECIAL_NAME);

struct Fixture {
    model: MetadataModel,
    object_ctor: Token,
    exception_ctor: Token,
    error_ctor: Token,
    ty: Token,
    log: Token,
}

fn fixture() -> Result<Fixture> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut model = MetadataModel::new();
    let object = model.add_type("System", "Object", None, TypeFlags::empty());
    let exception = model.add_type("System", "Exception", Some(object), TypeFlags::empty());
    let error = model.add_type("Demo", "MyError", Some(exception), TypeFlags::empty());
    let ty = model.add_type("Demo", "Widget", Some(object), TypeFlags::BEFORE_FIELD_INIT);

    let ctor = || MethodSignature::instance(vec![], TypeSig::Void);
    let object_ctor = model.add_method(object, ".ctor", ctor(), CTOR)?;
    let exception_ctor = model.add_method(exception, ".ctor", ctor(), CTOR)?;
    let error_ctor = model.add_method(error, ".ctor", ctor(), CTOR)?;
    let log = model.add_method(
        ty,
        "Log",
        MethodSignature::new_static(vec![TypeSig::I4], TypeSig::Void),
        MethodFlags::STATIC,
    )?;
    Ok(Fixture {
        model,
        object_ctor,
        exception_ctor,
        error_ctor,
        ty,
        log,
    })
}

impl Fixture {
    fn static_method(&mut self, name: &str, ret: TypeSig) -> Result<Token> {
        self.model.add_method(
            self.ty,
            name,
            MethodSignature::new_static(vec![], ret),
            MethodFlags::STATIC,
        )
    }
}

// Helper function to run `method` with `Log` (and optionally `Object::.ctor`) recorded
fn emulate(
    module: &Module,
    fixture: &Fixture,
    method: Token,
    args: Vec<Value>,
) -> Result<(Outcome, Vec<i32>)> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut emulator = Emulator::new(module);

    let sink = Arc::clone(&calls);
    emulator.register_host(fixture.log, move |call| {
        let marker = call.i4(0)?;
        sink.lock()
            .map_err(|_| Error::Emulation("log poisoned".into()))?
            .push(marker);
        Ok(None)
    });
    let sink = Arc::clone(&calls);
    emulator.register_host(fixture.object_ctor, move |_| {
        sink.lock()
            .map_err(|_| Error::Emulation("log poisoned".into()))?
            .push(0);
        Ok(None)
    });

    let outcome = emulator.invoke(method, args)?;
    let recorded = calls
        .lock()
        .map_err(|_| Error::Emulation("log poisoned".into()))?
        .clone();
    Ok((outcome, recorded))
}

/// Calls `Log(marker)`; `raise` appends `throw new Exception()`.
struct LogAdvice {
    priority: i32,
    marker: i32,
    log: Token,
    raise: Option<Token>,
}

impl LogAdvice {
    fn arc(priority: i32, log: Token) -> Arc<dyn Advice> {
        Arc::new(LogAdvice {
            priority,
            marker: priority,
            log,
            raise: None,
        })
    }
}

impl Advice for LogAdvice {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let mut writer = ctx.writer(block)?;
        writer.emit_i4(self.marker)?;
        writer.emit_method(OpCode::Call, self.log)?;
        if let Some(ctor) = self.raise {
            writer.emit_method(OpCode::Newobj, ctor)?;
            writer.emit(OpCode::Throw)?;
        }
        Ok(())
    }
}

fn weave(weaver: &Weaver, module: &mut Module) -> Result<WeaveOutcome> {
    let outcome = weaver.weave(module)?;
    assert!(outcome.success, "{}", weaver.diagnostics().summary());
    Ok(outcome)
}

#[test]
fn test_success_path_ordering() -> Result<()> {
    let mut fixture = fixture()?;
    let compute = fixture.static_method("Compute", TypeSig::I4)?;
    let mut module = Module::new(fixture.model.clone());
    module.set_body(
        compute,
        MethodBody::linear(vec![Instruction::ldc_i4(7), Instruction::simple(OpCode::Ret)])?,
    )?;

    let mut weaver = Weaver::new(WeaverConfig::default());
    for priority in [5, 10] {
        weaver.register_advice(
            LogAdvice::arc(priority, fixture.log),
            MethodTargets::Methods(vec![compute]),
            JoinPointKinds::BEFORE_METHOD_BODY
                | JoinPointKinds::AFTER_METHOD_BODY_SUCCESS
                | JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
            OperandTargets::All,
        )?;
    }
    weave(&weaver, &mut module)?;

    // Before: outermost first. Success and always: innermost first.
    let (outcome, log) = emulate(&module, &fixture, compute, vec![])?;
    assert_eq!(outcome.value(), Some(&Value::I4(7)));
    assert_eq!(log, vec![10, 5, 5, 10, 5, 10]);
    Ok(())
}

#[test]
fn test_exception_path_ordering() -> Result<()> {
    let mut fixture = fixture()?;
    let fail = fixture.static_method("Fail", TypeSig::Void)?;
    let mut module = Module::new(fixture.model.clone());
    module.set_body(
        fail,
        MethodBody::linear(vec![
            Instruction::new(OpCode::Newobj, Operand::Token(fixture.exception_ctor))?,
            Instruction::simple(OpCode::Throw),
        ])?,
    )?;

    let mut weaver = Weaver::new(WeaverConfig::default());
    for priority in [10, 5] {
        weaver.register_advice(
            LogAdvice::arc(priority, fixture.log),
            MethodTargets::Methods(vec![fail]),
            JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION | JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
            OperandTargets::All,
        )?;
    }
    weave(&weaver, &mut module)?;

    let (outcome, log) = emulate(&module, &fixture, fail, vec![])?;
    assert!(matches!(outcome, Outcome::Threw(Value::Obj(_))));
    assert_eq!(log, vec![5, 10, 5, 10]);
    Ok(())
}

#[test]
fn test_always_advice_observes_exception_from_handler_code() -> Result<()> {
    let mut fixture = fixture()?;
    let fail = fixture.static_method("Fail", TypeSig::Void)?;
    let mut module = Module::new(fixture.model.clone());
    module.set_body(
        fail,
        MethodBody::linear(vec![
            Instruction::new(OpCode::Newobj, Operand::Token(fixture.exception_ctor))?,
            Instruction::simple(OpCode::Throw),
        ])?,
    )?;

    let mut weaver = Weaver::new(WeaverConfig::default());
    weaver.register_advice(
        Arc::new(LogAdvice {
            priority: 10,
            marker: 10,
            log: fixture.log,
            raise: Some(fixture.exception_ctor),
        }),
        MethodTargets::Methods(vec![fail]),
        JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION,
        OperandTargets::All,
    )?;
    weaver.register_advice(
        LogAdvice::arc(5, fixture.log),
        MethodTargets::Methods(vec![fail]),
        JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
        OperandTargets::All,
    )?;
    weave(&weaver, &mut module)?;

    let (outcome, log) = emulate(&module, &fixture, fail, vec![])?;
    assert!(matches!(outcome, Outcome::Threw(_)));
    assert_eq!(log, vec![10, 5]);
    Ok(())
}

/// Catches `Demo.MyError` and returns 42 from the method.
struct Recover;

impl Advice for Recover {
    fn priority(&self) -> i32 {
        0
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let result = ctx
            .return_local()
            .ok_or_else(|| Error::InvalidBody("no return value".into()))?;
        let mut writer = ctx.writer(block)?;
        writer.emit_i4(42)?;
        writer.emit_local(OpCode::Stloc, result)
    }

    fn as_typed_exception(&self) -> Option<&dyn TypedExceptionAdvice> {
        Some(self)
    }
}

impl TypedExceptionAdvice for Recover {
    fn exception_type(&self, model: &MetadataModel) -> Option<Token> {
        model.find_type("Demo", "MyError")
    }

    fn exception_flow(&self) -> ExceptionFlow {
        ExceptionFlow::Return
    }
}

#[test]
fn test_typed_handler_swallows_and_returns() -> Result<()> {
    let mut fixture = fixture()?;
    let typed = fixture.static_method("ThrowsTyped", TypeSig::I4)?;
    let untyped = fixture.static_method("ThrowsBase", TypeSig::I4)?;
    let mut module = Module::new(fixture.model.clone());
    for (method, ctor) in [(typed, fixture.error_ctor), (untyped, fixture.exception_ctor)] {
        module.set_body(
            method,
            MethodBody::linear(vec![
                Instruction::new(OpCode::Newobj, Operand::Token(ctor))?,
                Instruction::simple(OpCode::Throw),
            ])?,
        )?;
    }

    let mut weaver = Weaver::new(WeaverConfig::default());
    weaver.register_advice(
        Arc::new(Recover),
        MethodTargets::Methods(vec![typed, untyped]),
        JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION,
        OperandTargets::All,
    )?;
    weave(&weaver, &mut module)?;

    let (outcome, _) = emulate(&module, &fixture, typed, vec![])?;
    assert_eq!(outcome, Outcome::Returned(Some(Value::I4(42))));
    let (outcome, _) = emulate(&module, &fixture, untyped, vec![])?;
    assert!(matches!(outcome, Outcome::Threw(_)));
    Ok(())
}

#[test]
fn test_constructor_hooks_around_base_call() -> Result<()> {
    let mut fixture = fixture()?;
    let ty = fixture.ty;
    let value = fixture.model.add_field(ty, "value", TypeSig::I4, FieldFlags::empty())?;
    let ctor = fixture
        .model
        .add_method(ty, ".ctor", MethodSignature::instance(vec![], TypeSig::Void), CTOR)?;
    let chained = fixture.model.add_method(
        ty,
        ".ctor",
        MethodSignature::instance(vec![TypeSig::I4], TypeSig::Void),
        CTOR,
    )?;
    let make = fixture.static_method("Make", TypeSig::I4)?;
    let make_chained = fixture.static_method("MakeChained", TypeSig::I4)?;

    let mut module = Module::new(fixture.model.clone());
    // .ctor() : base() { value = 5; }
    module.set_body(
        ctor,
        MethodBody::linear(vec![
            Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
            Instruction::new(OpCode::Call, Operand::Token(fixture.object_ctor))?,
            Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
            Instruction::ldc_i4(5),
            Instruction::new(OpCode::Stfld, Operand::Token(value))?,
            Instruction::simple(OpCode::Ret),
        ])?,
    )?;
    // .ctor(int) : this() { }
    module.set_body(
        chained,
        MethodBody::linear(vec![
            Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
            Instruction::new(OpCode::Call, Operand::Token(ctor))?,
            Instruction::simple(OpCode::Ret),
        ])?,
    )?;
    module.set_body(
        make,
        MethodBody::linear(vec![
            Instruction::new(OpCode::Newobj, Operand::Token(ctor))?,
            Instruction::new(OpCode::Ldfld, Operand::Token(value))?,
            Instruction::simple(OpCode::Ret),
        ])?,
    )?;
    module.set_body(
        make_chained,
        MethodBody::linear(vec![
            Instruction::ldc_i4(3),
            Instruction::new(OpCode::Newobj, Operand::Token(chained))?,
            Instruction::new(OpCode::Ldfld, Operand::Token(value))?,
            Instruction::simple(OpCode::Ret),
        ])?,
    )?;

    let mut weaver = Weaver::new(WeaverConfig::default());
    weaver.register_type_level_advice(
        LogAdvice::arc(1, fixture.log),
        ty,
        JoinPointKinds::BEFORE_INSTANCE_CONSTRUCTOR,
    )?;
    weaver.register_type_level_advice(
        LogAdvice::arc(2, fixture.log),
        ty,
        JoinPointKinds::AFTER_INSTANCE_INITIALIZATION,
    )?;
    weave(&weaver, &mut module)?;

    // Constructors delegating to a sibling are left alone and reported
    let skipped = weaver.diagnostics().for_method(chained);
    assert!(skipped
        .iter()
        .any(|d| d.severity == DiagnosticSeverity::Info));

    let (outcome, log) = emulate(&module, &fixture, make, vec![])?;
    assert_eq!(outcome.value(), Some(&Value::I4(5)));
    assert_eq!(log, vec![1, 0, 2]);

    let (outcome, log) = emulate(&module, &fixture, make_chained, vec![])?;
    assert_eq!(outcome.value(), Some(&Value::I4(5)));
    assert_eq!(log, vec![1, 0, 2]);
    Ok(())
}

/// Type-initializer advice that makes the initializer run eagerly.
struct EagerInit {
    log: Token,
}

impl Advice for EagerInit {
    fn priority(&self) -> i32 {
        0
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let mut writer = ctx.writer(block)?;
        writer.emit_i4(3)?;
        writer.emit_method(OpCode::Call, self.log)
    }

    fn as_before_static_constructor(&self) -> Option<&dyn BeforeStaticConstructorAdvice> {
        Some(self)
    }
}

impl BeforeStaticConstructorAdvice for EagerInit {
    fn clears_before_field_init(&self) -> bool {
        true
    }
}

#[test]
fn test_type_initializer_synthesized_and_woven() -> Result<()> {
    let fixture = fixture()?;
    let ty = fixture.ty;
    let mut module = Module::new(fixture.model.clone());
    assert!(module.metadata.static_constructor(ty).is_none());

    let mut weaver = Weaver::new(WeaverConfig::default());
    weaver.register_type_level_advice(
        Arc::new(EagerInit { log: fixture.log }),
        ty,
        JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR,
    )?;
    weave(&weaver, &mut module)?;

    let cctor = module
        .metadata
        .static_constructor(ty)
        .ok_or_else(|| Error::TypeNotFound("no type initializer".into()))?;
    let flags = module
        .metadata
        .type_def(ty)
        .map(|def| def.flags)
        .ok_or_else(|| Error::TypeNotFound("Demo.Widget".into()))?;
    assert!(!flags.contains(TypeFlags::BEFORE_FIELD_INIT));

    let (outcome, log) = emulate(&module, &fixture, cctor, vec![])?;
    assert_eq!(outcome, Outcome::Returned(None));
    assert_eq!(log, vec![3]);
    Ok(())
}

/// Logs from a block it nests inside the block it is handed.
struct NestedLogAdvice {
    marker: i32,
    log: Token,
}

impl Advice for NestedLogAdvice {
    fn priority(&self) -> i32 {
        self.marker
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let nested = ctx.body_mut().add_block(block)?;
        let mut writer = ctx.writer(nested)?;
        writer.emit_i4(self.marker)?;
        writer.emit_method(OpCode::Call, self.log)
    }
}

#[test]
fn test_boundary_advices_may_nest_blocks() -> Result<()> {
    let mut fixture = fixture()?;
    let compute = fixture.static_method("Compute", TypeSig::I4)?;
    let fail = fixture.static_method("Fail", TypeSig::Void)?;
    let mut module = Module::new(fixture.model.clone());
    module.set_body(
        compute,
        MethodBody::linear(vec![Instruction::ldc_i4(7), Instruction::simple(OpCode::Ret)])?,
    )?;
    module.set_body(
        fail,
        MethodBody::linear(vec![
            Instruction::new(OpCode::Newobj, Operand::Token(fixture.exception_ctor))?,
            Instruction::simple(OpCode::Throw),
        ])?,
    )?;

    let mut weaver = Weaver::new(WeaverConfig::default());
    weaver.register_advice(
        Arc::new(NestedLogAdvice {
            marker: 3,
            log: fixture.log,
        }),
        MethodTargets::Methods(vec![compute, fail]),
        JoinPointKinds::AFTER_METHOD_BODY_SUCCESS
            | JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION
            | JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
        OperandTargets::All,
    )?;
    let outcome = weave(&weaver, &mut module)?;
    assert_eq!(outcome.methods_woven, 2);
    assert!(!weaver.diagnostics().has_errors());
    for method in [compute, fail] {
        module
            .body(method)
            .ok_or(Error::MethodNotFound(method))?
            .verify_structure()?;
    }

    let (outcome, log) = emulate(&module, &fixture, compute, vec![])?;
    assert_eq!(outcome.value(), Some(&Value::I4(7)));
    assert_eq!(log, vec![3, 3]);

    let (outcome, log) = emulate(&module, &fixture, fail, vec![])?;
    assert!(matches!(outcome, Outcome::Threw(Value::Obj(_))));
    assert_eq!(log, vec![3, 3]);
    Ok(())
}
