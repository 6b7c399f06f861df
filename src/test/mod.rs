//! Shared fixtures for unit tests.
//!
//! [`TestModel`] is a small module shape that covers the cases the weaver
//! distinguishes: a base type with a bodiless constructor, an exception type,
//! an instance field, a constructor chaining to its base, an instance method
//! and a static helper.

use std::sync::Arc;

use crate::{
    assembly::{BlockId, Instruction, MethodBody, OpCode, Operand},
    metadata::{
        model::{
            FieldFlags, MetadataModel, MethodDef, MethodFlags, MethodSignature, TypeFlags,
            TypeSig,
        },
        module::Module,
        token::Token,
    },
    weaver::{Advice, WeavingContext},
    Result,
};

const CTOR_FLAGS: MethodFlags = MethodFlags::SPECIAL_NAME.union(MethodFlags::RT_SPECIAL_NAME);

/// Metadata of the test module and the tokens tests refer to.
pub struct TestModel {
    pub metadata: MetadataModel,
    /// `Tests.Widget`
    pub ty: Token,
    /// `int Widget::Read()`, returns `this.value`
    pub method: Token,
    /// `Widget::.ctor()`, chains to `Object::.ctor()`
    pub ctor: Token,
    /// `Object::.ctor()`, no body
    pub object_ctor: Token,
    /// `static void Widget::Helper()`
    pub helper: Token,
    /// `int Widget::value`
    pub field: Token,
}

impl TestModel {
    pub fn new() -> Self {
        let mut metadata = MetadataModel::new();
        let object = metadata.add_type("System", "Object", None, TypeFlags::empty());
        let exception = metadata.add_type("System", "Exception", Some(object), TypeFlags::empty());
        let ty = metadata.add_type("Tests", "Widget", Some(object), TypeFlags::BEFORE_FIELD_INIT);

        let instance_void = || MethodSignature::instance(vec![], TypeSig::Void);
        let object_ctor = metadata
            .add_method(object, ".ctor", instance_void(), CTOR_FLAGS)
            .expect("object ctor");
        metadata
            .add_method(exception, ".ctor", instance_void(), CTOR_FLAGS)
            .expect("exception ctor");
        let field = metadata
            .add_field(ty, "value", TypeSig::I4, FieldFlags::empty())
            .expect("field");
        let ctor = metadata
            .add_method(ty, ".ctor", instance_void(), CTOR_FLAGS)
            .expect("widget ctor");
        let method = metadata
            .add_method(
                ty,
                "Read",
                MethodSignature::instance(vec![], TypeSig::I4),
                MethodFlags::empty(),
            )
            .expect("read");
        let helper = metadata
            .add_method(
                ty,
                "Helper",
                MethodSignature::new_static(vec![], TypeSig::Void),
                MethodFlags::STATIC,
            )
            .expect("helper");

        TestModel {
            metadata,
            ty,
            method,
            ctor,
            object_ctor,
            helper,
            field,
        }
    }

    /// Definition of [`TestModel::method`]
    pub fn method(&self) -> &MethodDef {
        self.metadata.method(self.method).expect("test method")
    }

    /// A module with bodies for `Read`, `.ctor` and `Helper`.
    pub fn module_with_field_reader(&self) -> Result<Module> {
        let mut module = Module::new(self.metadata.clone());
        module.set_body(
            self.method,
            MethodBody::linear(vec![
                Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
                Instruction::new(OpCode::Ldfld, Operand::Token(self.field))?,
                Instruction::simple(OpCode::Ret),
            ])?,
        )?;
        module.set_body(
            self.ctor,
            MethodBody::linear(vec![
                Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
                Instruction::new(OpCode::Call, Operand::Token(self.object_ctor))?,
                Instruction::simple(OpCode::Ret),
            ])?,
        )?;
        module.set_body(
            self.helper,
            MethodBody::linear(vec![Instruction::simple(OpCode::Ret)])?,
        )?;
        Ok(module)
    }
}

/// Emits `ldc.i4 marker; pop` wherever it is woven.
pub struct MarkerAdvice {
    priority: i32,
    marker: i32,
}

impl MarkerAdvice {
    // Helper function to create a shared marker advice
    pub fn arc(priority: i32, marker: i32) -> Arc<dyn Advice> {
        Arc::new(MarkerAdvice { priority, marker })
    }
}

impl Advice for MarkerAdvice {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, block: BlockId) -> Result<()> {
        let mut writer = ctx.writer(block)?;
        writer.emit_i4(self.marker)?;
        writer.emit(OpCode::Pop)
    }
}

/// Fills the local table of every method it is woven into.
pub struct ExhaustLocals {
    pub priority: i32,
}

impl Advice for ExhaustLocals {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn weave(&self, ctx: &mut WeavingContext<'_>, _block: BlockId) -> Result<()> {
        while ctx.define_local(TypeSig::I4).is_ok() {}
        Ok(())
    }
}

/// Markers in layout order.
pub fn marker_values(body: &MethodBody) -> Vec<i32> {
    let instructions: Vec<&Instruction> = body.instructions().collect();
    instructions
        .windows(2)
        .filter_map(|pair| match (pair[0], pair[1].opcode) {
            (
                Instruction {
                    opcode: OpCode::LdcI4,
                    operand: Operand::Int32(marker),
                },
                OpCode::Pop,
            ) => Some(*marker),
            _ => None,
        })
        .collect()
}
