//! Reference evaluator for method bodies.
//!
//! The evaluator executes the bodies of a [`Module`] directly from their block
//! trees, which makes it possible to check what a woven method actually does:
//! which advices ran, in what order, and what an exception handler observed.
//! It is deliberately small. There is no type loading, no verification and no
//! garbage collection; every method either has a body in the module, is an
//! instance constructor without one (treated as a no-op), or is served by a
//! host function registered with [`Emulator::register_host`].
//!
//! # Key Components
//!
//! - [`Emulator`] - Owns the heap and static storage and runs calls
//! - [`Value`] / [`Address`] - Runtime values and managed pointers
//! - [`EmulationLimits`] - Instruction and call-depth budgets
//! - [`Outcome`] - Normal return or escaped exception of a call
//!
//! # Semantics
//!
//! - `callvirt` dispatches on the runtime type of the receiver by name and signature
//! - Catch clauses match by [`MetadataModel::is_assignable`]; a thrown `null` is caught by any clause
//! - `leave` runs the finally handlers it crosses, innermost first
//! - Filter clauses are reported as [`crate::Error::Emulation`]
//!
//! # Example
//!
//! ```rust
//! use dotweave::prelude::*;
//! use dotweave::emulation::{Emulator, Outcome, Value};
//!
//! # fn main() -> dotweave::Result<()> {
//! let mut model = MetadataModel::new();
//! let ty = model.add_type("Demo", "Math", None, TypeFlags::empty());
//! let add = model.add_method(
//!     ty,
//!     "Add",
//!     MethodSignature::new_static(vec![TypeSig::I4, TypeSig::I4], TypeSig::I4),
//!     MethodFlags::STATIC,
//! )?;
//! let mut module = Module::new(model);
//! module.set_body(
//!     add,
//!     MethodBody::linear(vec![
//!         Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
//!         Instruction::new(OpCode::Ldarg, Operand::Argument(1))?,
//!         Instruction::simple(OpCode::Add),
//!         Instruction::simple(OpCode::Ret),
//!     ])?,
//! )?;
//!
//! let mut emulator = Emulator::new(&module);
//! let outcome = emulator.invoke(add, vec![Value::I4(40), Value::I4(2)])?;
//! assert_eq!(outcome, Outcome::Returned(Some(Value::I4(42))));
//! # Ok(())
//! # }
//! ```

mod interpreter;
mod value;

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    assembly::LinearBody,
    metadata::{model::MetadataModel, module::Module, token::Token},
    Error, Result,
};

use interpreter::Frame;

pub use value::{Address, Heap, HeapObject, Value};

/// Execution budgets of an [`Emulator`].
///
/// A limit of 0 disables the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationLimits {
    /// Maximum instructions executed across all calls
    pub max_instructions: u64,
    /// Maximum nesting of calls
    pub max_call_depth: usize,
}

impl Default for EmulationLimits {
    fn default() -> Self {
        EmulationLimits {
            max_instructions: 1_000_000,
            max_call_depth: 256,
        }
    }
}

/// How a call completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The method returned, with its value unless it is `void`
    Returned(Option<Value>),
    /// An exception escaped the method
    Threw(Value),
}

impl Outcome {
    /// The returned value, if the call returned one
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Returned(value) => value.as_ref(),
            Outcome::Threw(_) => None,
        }
    }
}

/// Arguments of a call served by a host function.
#[derive(Debug)]
pub struct HostCall {
    /// The called method
    pub method: Token,
    /// Arguments, `this` first for instance methods
    pub args: Vec<Value>,
}

impl HostCall {
    /// Argument `index`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if the argument does not exist.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| Error::Emulation(format!("host call has no argument {index}")))
    }

    /// Argument `index` as `int32`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if the argument is missing or not an `int32`.
    pub fn i4(&self, index: usize) -> Result<i32> {
        self.arg(index)?.as_i4()
    }
}

/// A host implementation of a method.
pub type HostFn = Arc<dyn Fn(&mut HostCall) -> Result<Option<Value>> + Send + Sync>;

/// Executes method bodies of one module.
pub struct Emulator<'m> {
    module: &'m Module,
    limits: EmulationLimits,
    hosts: HashMap<Token, HostFn>,
    heap: Heap,
    statics: HashMap<Token, Value>,
    bodies: HashMap<Token, Arc<LinearBody>>,
    frames: Vec<Frame>,
    steps: u64,
}

impl fmt::Debug for Emulator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emulator")
            .field("limits", &self.limits)
            .field("hosts", &self.hosts.len())
            .field("objects", &self.heap.object_count())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl<'m> Emulator<'m> {
    /// Creates an emulator over `module` with default limits
    #[must_use]
    pub fn new(module: &'m Module) -> Self {
        Emulator {
            module,
            limits: EmulationLimits::default(),
            hosts: HashMap::new(),
            heap: Heap::default(),
            statics: HashMap::new(),
            bodies: HashMap::new(),
            frames: Vec::new(),
            steps: 0,
        }
    }

    /// Replaces the execution limits
    #[must_use]
    pub fn with_limits(mut self, limits: EmulationLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Serves calls to `method` with `host` instead of its body.
    pub fn register_host<F>(&mut self, method: Token, host: F)
    where
        F: Fn(&mut HostCall) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.hosts.insert(method, Arc::new(host));
    }

    /// The module being executed
    #[must_use]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    fn model(&self) -> &'m MetadataModel {
        &self.module.metadata
    }

    /// The managed heap
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Instructions executed so far
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Allocates an instance of `ty` without running a constructor.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `ty` is not defined.
    pub fn new_object(&mut self, ty: Token) -> Result<Value> {
        let model = self.model();
        if model.type_def(ty).is_none() {
            return Err(Error::TypeNotFound(ty.to_string()));
        }
        Ok(self.heap.alloc(ty, model))
    }

    /// Runtime type of a heap object
    #[must_use]
    pub fn object_type(&self, value: &Value) -> Option<Token> {
        match value {
            Value::Obj(index) => self.heap.object(*index).ok().map(|o| o.ty),
            Value::Struct { ty, .. } => Some(*ty),
            _ => None,
        }
    }

    /// Reads an instance field of an object or value-type instance.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `target` has no such field.
    pub fn get_field(&self, target: &Value, field: Token) -> Result<Value> {
        self.load_field(target, field)
    }

    /// Writes an instance field of a heap object.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if `target` is not a heap object.
    pub fn set_field(&mut self, target: &Value, field: Token, value: Value) -> Result<()> {
        self.store_field(target, field, value)
    }

    /// Reads a static field, zero if never written.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the field is not defined.
    pub fn get_static(&self, field: Token) -> Result<Value> {
        self.load(&Address::Static(field))
    }

    /// Writes a static field.
    ///
    /// # Errors
    /// Currently infallible; the signature matches the other stores.
    pub fn set_static(&mut self, field: Token, value: Value) -> Result<()> {
        self.store(&Address::Static(field), value)
    }

    /// Calls `method` with `args` (`this` first for instance methods).
    ///
    /// An exception escaping the method is reported as [`Outcome::Threw`],
    /// not as an error.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for unknown methods and
    /// [`Error::Emulation`] for malformed bodies, exceeded limits or
    /// unsupported constructs.
    pub fn invoke(&mut self, method: Token, args: Vec<Value>) -> Result<Outcome> {
        self.frames.clear();
        let outcome = self.call_method(method, args);
        self.frames.clear();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        assembly::{HandlerKind, Instruction, MethodBody, OpCode, Operand},
        metadata::model::{MethodFlags, MethodSignature, TypeSig},
        test::TestModel,
    };

    fn static_method(
        model: &mut MetadataModel,
        ty: Token,
        name: &str,
        ret: TypeSig,
    ) -> Result<Token> {
        model.add_method(
            ty,
            name,
            MethodSignature::new_static(vec![], ret),
            MethodFlags::STATIC,
        )
    }

    #[test]
    fn test_loop_sums() -> Result<()> {
        let mut model = MetadataModel::new();
        let ty = model.add_type("T", "Loop", None, crate::metadata::model::TypeFlags::empty());
        let sum = static_method(&mut model, ty, "Sum", TypeSig::I4)?;

        // s = 0; i = 0; while (i < 5) { s += i; i++ } return s;
        let mut body = MethodBody::new();
        let total = body.define_local(TypeSig::I4)?;
        let counter = body.define_local(TypeSig::I4)?;
        let root = body.root();
        let check = body.new_sequence();
        let head = body.add_sequence(root)?;
        {
            let mut w = body.attach_writer(head)?;
            w.emit_branch(OpCode::Br, check)?;
        }
        let looped = body.add_sequence(root)?;
        {
            let mut w = body.attach_writer(looped)?;
            w.emit_local(OpCode::Ldloc, total)?;
            w.emit_local(OpCode::Ldloc, counter)?;
            w.emit(OpCode::Add)?;
            w.emit_local(OpCode::Stloc, total)?;
            w.emit_local(OpCode::Ldloc, counter)?;
            w.emit_i4(1)?;
            w.emit(OpCode::Add)?;
            w.emit_local(OpCode::Stloc, counter)?;
        }
        body.append_sequence(root, check)?;
        {
            let mut w = body.attach_writer(check)?;
            w.emit_local(OpCode::Ldloc, counter)?;
            w.emit_i4(5)?;
            w.emit_branch(OpCode::Blt, looped)?;
            w.emit_local(OpCode::Ldloc, total)?;
            w.emit(OpCode::Ret)?;
        }
        let mut module = Module::new(model);
        module.set_body(sum, body)?;

        let mut emulator = Emulator::new(&module);
        let outcome = emulator.invoke(sum, vec![])?;
        assert_eq!(outcome.value(), Some(&Value::I4(10)));
        Ok(())
    }

    #[test]
    fn test_finally_runs_on_leave_and_on_exception() -> Result<()> {
        let test = TestModel::new();
        let mut model = test.metadata.clone();
        let ty = test.ty;
        let log = static_method(&mut model, ty, "Log", TypeSig::Void)?;
        let run = model.add_method(
            ty,
            "Run",
            MethodSignature::new_static(vec![TypeSig::Boolean], TypeSig::Void),
            MethodFlags::STATIC,
        )?;

        // try { if (fail) throw null; leave exit } finally { Log() } exit: ret
        let mut body = MethodBody::new();
        let root = body.root();
        let tried = body.add_block(root)?;
        let exit_block = body.add_block(root)?;
        let exit = body.add_sequence(exit_block)?;
        body.sequence_mut(exit).instructions.push(Instruction::simple(OpCode::Ret));
        let guarded = body.add_sequence(tried)?;
        let throwing = body.new_sequence();
        let leaving = body.new_sequence();
        {
            let mut w = body.attach_writer(guarded)?;
            w.emit_argument(OpCode::Ldarg, 0)?;
            w.emit_branch(OpCode::Brfalse, leaving)?;
        }
        body.append_sequence(tried, throwing)?;
        body.sequence_mut(throwing).instructions.extend([
            Instruction::simple(OpCode::Ldnull),
            Instruction::simple(OpCode::Throw),
        ]);
        body.append_sequence(tried, leaving)?;
        body.sequence_mut(leaving)
            .instructions
            .push(Instruction::new(OpCode::Leave, Operand::Target(exit))?);
        let handler = body.add_handler(tried, HandlerKind::Finally, None)?;
        let fin = body.add_sequence(handler)?;
        body.sequence_mut(fin).instructions.extend([
            Instruction::new(OpCode::Call, Operand::Token(log))?,
            Instruction::simple(OpCode::Endfinally),
        ]);

        let mut module = Module::new(model);
        module.set_body(run, body)?;

        let calls = Arc::new(Mutex::new(0));
        let mut emulator = Emulator::new(&module);
        let counter = Arc::clone(&calls);
        emulator.register_host(log, move |_| {
            if let Ok(mut n) = counter.lock() {
                *n += 1;
            }
            Ok(None)
        });

        assert_eq!(emulator.invoke(run, vec![Value::I4(0)])?, Outcome::Returned(None));
        assert_eq!(emulator.invoke(run, vec![Value::I4(1)])?, Outcome::Threw(Value::Null));
        assert_eq!(*calls.lock().map_err(|_| Error::Emulation("poisoned".into()))?, 2);
        Ok(())
    }

    #[test]
    fn test_typed_catch_and_rethrow() -> Result<()> {
        let test = TestModel::new();
        let mut model = test.metadata.clone();
        let exception = model
            .find_type("System", "Exception")
            .ok_or_else(|| Error::TypeNotFound("System.Exception".into()))?;
        let exception_ctor = model
            .instance_constructors(exception)
            .first()
            .copied()
            .ok_or(Error::MethodNotFound(exception))?;
        let run = static_method(&mut model, test.ty, "Run", TypeSig::I4)?;

        // try { try { throw new Exception() } catch (Exception) { rethrow } }
        // catch (Exception) { leave ret7 }
        let mut body = MethodBody::new();
        let root = body.root();
        let outer = body.add_block(root)?;
        let exit_block = body.add_block(root)?;
        let exit = body.add_sequence(exit_block)?;
        body.sequence_mut(exit)
            .instructions
            .extend([Instruction::ldc_i4(7), Instruction::simple(OpCode::Ret)]);
        let inner = body.add_block(outer)?;
        let thrown = body.add_sequence(inner)?;
        body.sequence_mut(thrown).instructions.extend([
            Instruction::new(OpCode::Newobj, Operand::Token(exception_ctor))?,
            Instruction::simple(OpCode::Throw),
        ]);
        let inner_catch = body.add_handler(inner, HandlerKind::Catch, Some(exception))?;
        let rethrow = body.add_sequence(inner_catch)?;
        body.sequence_mut(rethrow).instructions.extend([
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::Rethrow),
        ]);
        let outer_catch = body.add_handler(outer, HandlerKind::Catch, Some(exception))?;
        let caught = body.add_sequence(outer_catch)?;
        body.sequence_mut(caught).instructions.extend([
            Instruction::simple(OpCode::Pop),
            Instruction::new(OpCode::Leave, Operand::Target(exit))?,
        ]);

        let mut module = Module::new(model);
        module.set_body(run, body)?;
        let mut emulator = Emulator::new(&module);
        assert_eq!(emulator.invoke(run, vec![])?.value(), Some(&Value::I4(7)));
        Ok(())
    }

    #[test]
    fn test_instruction_limit() -> Result<()> {
        let mut model = MetadataModel::new();
        let ty = model.add_type("T", "Spin", None, crate::metadata::model::TypeFlags::empty());
        let spin = static_method(&mut model, ty, "Spin", TypeSig::Void)?;
        let mut body = MethodBody::new();
        let root = body.root();
        let seq = body.add_sequence(root)?;
        body.sequence_mut(seq)
            .instructions
            .push(Instruction::new(OpCode::Br, Operand::Target(seq))?);
        let mut module = Module::new(model);
        module.set_body(spin, body)?;

        let mut emulator = Emulator::new(&module).with_limits(EmulationLimits {
            max_instructions: 100,
            max_call_depth: 8,
        });
        assert!(matches!(emulator.invoke(spin, vec![]), Err(Error::Emulation(_))));
        assert_eq!(emulator.steps(), 101);
        Ok(())
    }
}
