//! Instruction dispatch, calls and exception handling.
//!
//! Each call runs in its own [`Frame`] over the flattened layout of the
//! callee. Exception dispatch walks the protected regions innermost first;
//! `leave` runs every finally handler it crosses before reaching its target,
//! and `endfinally` resumes whatever the handler interrupted.

use std::sync::Arc;

use crate::{
    assembly::{linearize, HandlerKind, Instruction, LinearBody, OpCode, Operand},
    emulation::{
        value::{Address, Value},
        Emulator, Outcome,
    },
    metadata::token::Token,
    Error, Result,
};

/// Result of executing one instruction.
#[derive(Debug)]
pub(super) enum StepResult {
    Continue,
    Branch(usize),
    Return(Option<Value>),
    Throw(Value),
    Leave(usize),
    EndFinally,
}

/// Work interrupted by a running finally or fault handler.
#[derive(Debug)]
enum Pending {
    /// A `leave` crossing the remaining finallies (innermost last)
    Leave {
        region: usize,
        remaining: Vec<usize>,
        target: usize,
    },
    /// Exception dispatch to continue at region `next`
    Unwind {
        region: usize,
        exception: Value,
        origin: usize,
        next: usize,
    },
}

impl Pending {
    fn region(&self) -> usize {
        match self {
            Pending::Leave { region, .. } | Pending::Unwind { region, .. } => *region,
        }
    }
}

enum Dispatch {
    Handler(usize),
    Escape(Value),
}

/// Activation record of one call.
#[derive(Debug)]
pub(super) struct Frame {
    method: Token,
    linear: Arc<LinearBody>,
    returns_value: bool,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    pending: Vec<Pending>,
    caught: Vec<(usize, Value)>,
}

fn malformed(method: Token, pc: usize, message: &str) -> Error {
    Error::Emulation(format!("{method} at {pc}: {message}"))
}

impl Emulator<'_> {
    fn linear(&mut self, method: Token) -> Result<Arc<LinearBody>> {
        if let Some(linear) = self.bodies.get(&method) {
            return Ok(Arc::clone(linear));
        }
        let module = self.module;
        let body = module.body(method).ok_or(Error::MethodNotFound(method))?;
        let linear = Arc::new(linearize(body));
        self.bodies.insert(method, Arc::clone(&linear));
        Ok(linear)
    }

    /// Calls `method` with fully evaluated arguments.
    pub(super) fn call_method(&mut self, method: Token, args: Vec<Value>) -> Result<Outcome> {
        let module = self.module;
        let model = &module.metadata;
        let def = model.method(method).ok_or(Error::MethodNotFound(method))?;
        if args.len() != def.signature.arg_count() {
            return Err(Error::Emulation(format!(
                "{} takes {} argument(s), got {}",
                def.name,
                def.signature.arg_count(),
                args.len()
            )));
        }
        if let Some(host) = self.hosts.get(&method).cloned() {
            let mut call = super::HostCall { method, args };
            return host(&mut call).map(Outcome::Returned);
        }
        let Some(body) = module.body(method) else {
            if def.is_instance_constructor() {
                return Ok(Outcome::Returned(None));
            }
            return Err(Error::Emulation(format!("{} has no body", def.name)));
        };
        if self.limits.max_call_depth > 0 && self.frames.len() >= self.limits.max_call_depth {
            return Err(Error::Emulation(format!(
                "call depth limit of {} exceeded",
                self.limits.max_call_depth
            )));
        }

        let locals = body
            .locals()
            .iter()
            .map(|sig| Value::default_of(sig, model))
            .collect();
        let returns_value = !def.signature.ret.is_void();
        log::trace!("emulating {}", def.name);
        let linear = self.linear(method)?;
        self.frames.push(Frame {
            method,
            linear,
            returns_value,
            args,
            locals,
            stack: Vec::new(),
            pending: Vec::new(),
            caught: Vec::new(),
        });
        let result = self.run_frame();
        self.frames.pop();
        result
    }

    fn run_frame(&mut self) -> Result<Outcome> {
        let depth = self.frames.len() - 1;
        let linear = Arc::clone(&self.frames[depth].linear);
        let method = self.frames[depth].method;
        let mut pc = 0;
        loop {
            self.steps += 1;
            if self.limits.max_instructions > 0 && self.steps > self.limits.max_instructions {
                return Err(Error::Emulation(format!(
                    "instruction limit of {} exceeded",
                    self.limits.max_instructions
                )));
            }
            let insn = linear
                .instructions
                .get(pc)
                .ok_or_else(|| malformed(method, pc, "execution fell off the end of the body"))?;

            pc = match self.step(depth, pc, insn, &linear)? {
                StepResult::Continue => pc + 1,
                StepResult::Branch(target) => target,
                StepResult::Return(value) => return Ok(Outcome::Returned(value)),
                StepResult::Leave(target) => self.leave(depth, &linear, pc, target),
                StepResult::Throw(exception) => {
                    let frame = &mut self.frames[depth];
                    frame
                        .pending
                        .retain(|p| !linear.regions[p.region()].in_handler(pc));
                    frame
                        .caught
                        .retain(|(r, _)| !linear.regions[*r].in_handler(pc));
                    match self.dispatch(depth, &linear, exception, pc, 0)? {
                        Dispatch::Handler(start) => start,
                        Dispatch::Escape(exception) => return Ok(Outcome::Threw(exception)),
                    }
                }
                StepResult::EndFinally => {
                    let pending = self.frames[depth]
                        .pending
                        .pop()
                        .ok_or_else(|| malformed(method, pc, "endfinally outside a handler"))?;
                    match pending {
                        Pending::Leave {
                            mut remaining,
                            target,
                            ..
                        } => match remaining.pop() {
                            Some(next) => {
                                self.frames[depth].pending.push(Pending::Leave {
                                    region: next,
                                    remaining,
                                    target,
                                });
                                linear.regions[next].handler_start
                            }
                            None => target,
                        },
                        Pending::Unwind {
                            exception,
                            origin,
                            next,
                            ..
                        } => match self.dispatch(depth, &linear, exception, origin, next)? {
                            Dispatch::Handler(start) => start,
                            Dispatch::Escape(exception) => {
                                return Ok(Outcome::Threw(exception))
                            }
                        },
                    }
                }
            };
        }
    }

    fn leave(&mut self, depth: usize, linear: &LinearBody, pc: usize, target: usize) -> usize {
        let frame = &mut self.frames[depth];
        frame.stack.clear();
        frame.caught.retain(|(r, _)| {
            let region = &linear.regions[*r];
            !(region.in_handler(pc) && !region.in_handler(target))
        });

        let mut remaining: Vec<usize> = linear
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.kind == HandlerKind::Finally && r.protects(pc) && !r.protects(target)
            })
            .map(|(i, _)| i)
            .collect();
        remaining.reverse();
        match remaining.pop() {
            Some(first) => {
                frame.pending.push(Pending::Leave {
                    region: first,
                    remaining,
                    target,
                });
                linear.regions[first].handler_start
            }
            None => target,
        }
    }

    fn dispatch(
        &mut self,
        depth: usize,
        linear: &LinearBody,
        exception: Value,
        origin: usize,
        from: usize,
    ) -> Result<Dispatch> {
        for (index, region) in linear.regions.iter().enumerate().skip(from) {
            if !region.protects(origin) {
                continue;
            }
            match region.kind {
                HandlerKind::Catch => {
                    if !self.catches(region.catch_type, &exception) {
                        continue;
                    }
                    let frame = &mut self.frames[depth];
                    frame.stack.clear();
                    frame.stack.push(exception.clone());
                    frame.caught.push((index, exception));
                    return Ok(Dispatch::Handler(region.handler_start));
                }
                HandlerKind::Finally | HandlerKind::Fault => {
                    let frame = &mut self.frames[depth];
                    frame.stack.clear();
                    frame.pending.push(Pending::Unwind {
                        region: index,
                        exception,
                        origin,
                        next: index + 1,
                    });
                    return Ok(Dispatch::Handler(region.handler_start));
                }
                HandlerKind::Filter => {
                    return Err(malformed(
                        self.frames[depth].method,
                        origin,
                        "filter clauses are not emulated",
                    ))
                }
            }
        }
        Ok(Dispatch::Escape(exception))
    }

    /// `null` is caught by every clause.
    fn catches(&self, catch_type: Option<Token>, exception: &Value) -> bool {
        match (catch_type, exception) {
            (Some(ty), Value::Obj(index)) => self
                .heap
                .object(*index)
                .is_ok_and(|o| self.module.metadata.is_assignable(o.ty, ty)),
            _ => true,
        }
    }

    fn pop(&mut self, depth: usize) -> Result<Value> {
        let frame = &mut self.frames[depth];
        frame
            .stack
            .pop()
            .ok_or_else(|| Error::Emulation(format!("{}: stack underflow", frame.method)))
    }

    fn pop_n(&mut self, depth: usize, count: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop(depth)?);
        }
        values.reverse();
        Ok(values)
    }

    fn push(&mut self, depth: usize, value: Value) {
        self.frames[depth].stack.push(value);
    }

    fn pop_i4(&mut self, depth: usize) -> Result<i32> {
        self.pop(depth)?.as_i4()
    }

    fn pop_address(&mut self, depth: usize) -> Result<Address> {
        match self.pop(depth)? {
            Value::Addr(address) => Ok(address),
            other => Err(Error::Emulation(format!("expected an address, got {other}"))),
        }
    }

    fn step(
        &mut self,
        depth: usize,
        pc: usize,
        insn: &Instruction,
        linear: &LinearBody,
    ) -> Result<StepResult> {
        let method = self.frames[depth].method;
        let token = || {
            insn.token()
                .ok_or_else(|| malformed(method, pc, "missing token operand"))
        };
        let target = || match &insn.operand {
            Operand::Target(seq) => linear.resolve(*seq),
            _ => Err(malformed(method, pc, "missing branch target")),
        };
        let local = || match insn.operand {
            Operand::Local(index) => Ok(index),
            _ => Err(malformed(method, pc, "missing local operand")),
        };
        let argument = || match insn.operand {
            Operand::Argument(index) => Ok(index),
            _ => Err(malformed(method, pc, "missing argument operand")),
        };

        match insn.opcode {
            OpCode::Nop => {}
            OpCode::Ldarg => {
                let value = self.load(&Address::Argument {
                    frame: depth,
                    index: argument()?,
                })?;
                self.push(depth, value);
            }
            OpCode::Ldarga => self.push(
                depth,
                Value::Addr(Address::Argument {
                    frame: depth,
                    index: argument()?,
                }),
            ),
            OpCode::Starg => {
                let value = self.pop(depth)?;
                self.store(
                    &Address::Argument {
                        frame: depth,
                        index: argument()?,
                    },
                    value,
                )?;
            }
            OpCode::Ldloc => {
                let value = self.load(&Address::Local {
                    frame: depth,
                    index: local()?,
                })?;
                self.push(depth, value);
            }
            OpCode::Ldloca => self.push(
                depth,
                Value::Addr(Address::Local {
                    frame: depth,
                    index: local()?,
                }),
            ),
            OpCode::Stloc => {
                let value = self.pop(depth)?;
                self.store(
                    &Address::Local {
                        frame: depth,
                        index: local()?,
                    },
                    value,
                )?;
            }
            OpCode::Ldnull => self.push(depth, Value::Null),
            OpCode::LdcI4 => match insn.operand {
                Operand::Int32(v) => self.push(depth, Value::I4(v)),
                _ => return Err(malformed(method, pc, "missing int32 operand")),
            },
            OpCode::LdcI8 => match insn.operand {
                Operand::Int64(v) => self.push(depth, Value::I8(v)),
                _ => return Err(malformed(method, pc, "missing int64 operand")),
            },
            OpCode::Ldstr => match &insn.operand {
                Operand::String(s) => self.push(depth, Value::Str(Arc::from(s.as_str()))),
                _ => return Err(malformed(method, pc, "missing string operand")),
            },
            OpCode::Dup => {
                let value = self.pop(depth)?;
                self.push(depth, value.clone());
                self.push(depth, value);
            }
            OpCode::Pop => {
                self.pop(depth)?;
            }
            OpCode::Call => return self.call(depth, token()?, false),
            OpCode::Callvirt => return self.call(depth, token()?, true),
            OpCode::Newobj => return self.new_object_call(depth, token()?),
            OpCode::Ret => {
                let value = if self.frames[depth].returns_value {
                    Some(self.pop(depth)?)
                } else {
                    None
                };
                return Ok(StepResult::Return(value));
            }
            OpCode::Br => return Ok(StepResult::Branch(target()?)),
            OpCode::Brfalse | OpCode::Brtrue => {
                let taken = self.pop(depth)?.is_true() == (insn.opcode == OpCode::Brtrue);
                if taken {
                    return Ok(StepResult::Branch(target()?));
                }
            }
            OpCode::Beq | OpCode::BneUn | OpCode::Blt | OpCode::Bgt | OpCode::Ble | OpCode::Bge => {
                let right = self.pop(depth)?;
                let left = self.pop(depth)?;
                let taken = match insn.opcode {
                    OpCode::Beq => equals(&left, &right),
                    OpCode::BneUn => !equals(&left, &right),
                    _ => {
                        let (l, r) = integers(&left, &right)?;
                        match insn.opcode {
                            OpCode::Blt => l < r,
                            OpCode::Bgt => l > r,
                            OpCode::Ble => l <= r,
                            _ => l >= r,
                        }
                    }
                };
                if taken {
                    return Ok(StepResult::Branch(target()?));
                }
            }
            OpCode::Switch => {
                let index = self.pop_i4(depth)?;
                let Operand::Switch(targets) = &insn.operand else {
                    return Err(malformed(method, pc, "missing switch table"));
                };
                if let Some(seq) = usize::try_from(index).ok().and_then(|i| targets.get(i)) {
                    return Ok(StepResult::Branch(linear.resolve(*seq)?));
                }
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Rem
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Shl
            | OpCode::Shr => {
                let right = self.pop(depth)?;
                let left = self.pop(depth)?;
                let value = binary(insn.opcode, &left, &right)
                    .map_err(|e| malformed(method, pc, &e.to_string()))?;
                self.push(depth, value);
            }
            OpCode::Neg | OpCode::Not => {
                let value = match self.pop(depth)? {
                    Value::I4(v) if insn.opcode == OpCode::Neg => Value::I4(v.wrapping_neg()),
                    Value::I4(v) => Value::I4(!v),
                    Value::I8(v) if insn.opcode == OpCode::Neg => Value::I8(v.wrapping_neg()),
                    Value::I8(v) => Value::I8(!v),
                    other => {
                        return Err(malformed(method, pc, &format!("cannot negate {other}")))
                    }
                };
                self.push(depth, value);
            }
            OpCode::Ceq | OpCode::Cgt | OpCode::Clt => {
                let right = self.pop(depth)?;
                let left = self.pop(depth)?;
                let result = match insn.opcode {
                    OpCode::Ceq => equals(&left, &right),
                    OpCode::Cgt => {
                        let (l, r) = integers(&left, &right)?;
                        l > r
                    }
                    _ => {
                        let (l, r) = integers(&left, &right)?;
                        l < r
                    }
                };
                self.push(depth, Value::I4(i32::from(result)));
            }
            OpCode::ConvI4 | OpCode::ConvI8 => {
                let value = self.pop(depth)?;
                let wide = value
                    .as_i64()
                    .ok_or_else(|| malformed(method, pc, &format!("cannot convert {value}")))?;
                #[allow(clippy::cast_possible_truncation)]
                let converted = if insn.opcode == OpCode::ConvI4 {
                    Value::I4(wide as i32)
                } else {
                    Value::I8(wide)
                };
                self.push(depth, converted);
            }
            OpCode::Ldfld => {
                let target = self.pop(depth)?;
                let value = self.load_field(&target, token()?)?;
                self.push(depth, value);
            }
            OpCode::Ldflda => {
                let target = self.pop(depth)?;
                let field = token()?;
                let address = match target {
                    Value::Obj(object) => Address::Field { object, field },
                    Value::Addr(base) => Address::StructField {
                        base: Box::new(base),
                        field,
                    },
                    other => {
                        return Err(malformed(
                            method,
                            pc,
                            &format!("cannot take a field address of {other}"),
                        ))
                    }
                };
                self.push(depth, Value::Addr(address));
            }
            OpCode::Stfld => {
                let value = self.pop(depth)?;
                let target = self.pop(depth)?;
                self.store_field(&target, token()?, value)?;
            }
            OpCode::Ldsfld => {
                let value = self.load(&Address::Static(token()?))?;
                self.push(depth, value);
            }
            OpCode::Ldsflda => self.push(depth, Value::Addr(Address::Static(token()?))),
            OpCode::Stsfld => {
                let value = self.pop(depth)?;
                self.store(&Address::Static(token()?), value)?;
            }
            OpCode::Ldobj | OpCode::LdindI4 | OpCode::LdindRef => {
                let address = self.pop_address(depth)?;
                let value = self.load(&address)?;
                self.push(depth, value);
            }
            OpCode::Stobj | OpCode::StindI4 | OpCode::StindRef => {
                let value = self.pop(depth)?;
                let address = self.pop_address(depth)?;
                self.store(&address, value)?;
            }
            OpCode::Initobj => {
                let address = self.pop_address(depth)?;
                let value = self.zero_of_type(token()?);
                self.store(&address, value)?;
            }
            OpCode::Box | OpCode::UnboxAny => {}
            OpCode::Castclass | OpCode::Isinst => {
                let value = self.pop(depth)?;
                let ty = token()?;
                let fits = match &value {
                    Value::Obj(index) => self
                        .heap
                        .object(*index)
                        .is_ok_and(|o| self.module.metadata.is_assignable(o.ty, ty)),
                    _ => true,
                };
                match (fits, insn.opcode) {
                    (true, _) => self.push(depth, value),
                    (false, OpCode::Isinst) => self.push(depth, Value::Null),
                    (false, _) => {
                        return Err(malformed(method, pc, &format!("invalid cast of {value}")))
                    }
                }
            }
            OpCode::Newarr => {
                let length = usize::try_from(self.pop_i4(depth)?)
                    .map_err(|_| malformed(method, pc, "negative array length"))?;
                let init = self.zero_of_type(token()?);
                let array = self.heap.alloc_array(length, init);
                self.push(depth, array);
            }
            OpCode::Ldlen => {
                let Value::Array(array) = self.pop(depth)? else {
                    return Err(malformed(method, pc, "ldlen on a non-array"));
                };
                let length = self.heap.array(array)?.len();
                let length = i32::try_from(length)
                    .map_err(|_| malformed(method, pc, "array length overflows int32"))?;
                self.push(depth, Value::I4(length));
            }
            OpCode::Ldelem | OpCode::Ldelema => {
                let index = self.pop_i4(depth)?;
                let address = self.element(depth, index)?;
                let value = if insn.opcode == OpCode::Ldelema {
                    Value::Addr(address)
                } else {
                    self.load(&address)?
                };
                self.push(depth, value);
            }
            OpCode::Stelem => {
                let value = self.pop(depth)?;
                let index = self.pop_i4(depth)?;
                let address = self.element(depth, index)?;
                self.store(&address, value)?;
            }
            OpCode::Throw => return Ok(StepResult::Throw(self.pop(depth)?)),
            OpCode::Rethrow => {
                let exception = self.frames[depth]
                    .caught
                    .iter()
                    .rev()
                    .find(|(r, _)| linear.regions[*r].in_handler(pc))
                    .map(|(_, e)| e.clone())
                    .ok_or_else(|| malformed(method, pc, "rethrow outside a catch handler"))?;
                return Ok(StepResult::Throw(exception));
            }
            OpCode::Leave => return Ok(StepResult::Leave(target()?)),
            OpCode::Endfinally => return Ok(StepResult::EndFinally),
            OpCode::Endfilter => {
                return Err(malformed(method, pc, "filter clauses are not emulated"))
            }
        }
        Ok(StepResult::Continue)
    }

    fn call(&mut self, depth: usize, method: Token, virtual_call: bool) -> Result<StepResult> {
        let module = self.module;
        let model = &module.metadata;
        let def = model.method(method).ok_or(Error::MethodNotFound(method))?;
        let args = self.pop_n(depth, def.signature.arg_count())?;

        let mut resolved = method;
        if virtual_call && def.signature.has_this {
            if let Some(Value::Obj(index)) = args.first() {
                let mut current = Some(self.heap.object(*index)?.ty);
                while let Some(ty) = current {
                    if let Some(found) = model.find_method(ty, &def.name, Some(&def.signature)) {
                        resolved = found;
                        break;
                    }
                    current = model.type_def(ty).and_then(|t| t.base);
                }
            }
        }

        match self.call_method(resolved, args)? {
            Outcome::Returned(Some(value)) => {
                self.push(depth, value);
                Ok(StepResult::Continue)
            }
            Outcome::Returned(None) => Ok(StepResult::Continue),
            Outcome::Threw(exception) => Ok(StepResult::Throw(exception)),
        }
    }

    fn new_object_call(&mut self, depth: usize, ctor: Token) -> Result<StepResult> {
        let module = self.module;
        let model = &module.metadata;
        let def = model.method(ctor).ok_or(Error::MethodNotFound(ctor))?;
        let ty = def.declaring_type;
        let mut args = self.pop_n(depth, def.signature.params.len())?;
        let object = self.heap.alloc(ty, model);
        args.insert(0, object.clone());
        match self.call_method(ctor, args)? {
            Outcome::Threw(exception) => Ok(StepResult::Throw(exception)),
            Outcome::Returned(_) => {
                self.push(depth, object);
                Ok(StepResult::Continue)
            }
        }
    }

    fn element(&mut self, depth: usize, index: i32) -> Result<Address> {
        let Value::Array(array) = self.pop(depth)? else {
            return Err(Error::Emulation("element access on a non-array".to_string()));
        };
        let index = usize::try_from(index)
            .ok()
            .filter(|&i| self.heap.array(array).is_ok_and(|a| i < a.len()))
            .ok_or_else(|| Error::Emulation(format!("index {index} out of range")))?;
        Ok(Address::Element { array, index })
    }

    fn zero_of_type(&self, ty: Token) -> Value {
        let model = &self.module.metadata;
        match model.type_def(ty) {
            Some(def) if def.namespace == "System" => match def.name.as_str() {
                "Int32" | "Boolean" => Value::I4(0),
                "Int64" => Value::I8(0),
                _ if def.is_value_type() => Value::default_struct(ty, model),
                _ => Value::Null,
            },
            Some(def) if def.is_value_type() => Value::default_struct(ty, model),
            _ => Value::Null,
        }
    }

    pub(super) fn load_field(&self, target: &Value, field: Token) -> Result<Value> {
        match target {
            Value::Obj(object) => self.load(&Address::Field {
                object: *object,
                field,
            }),
            Value::Addr(base) => struct_field(&self.load(base)?, field),
            Value::Struct { .. } => struct_field(target, field),
            other => Err(Error::Emulation(format!("field load from {other}"))),
        }
    }

    pub(super) fn store_field(&mut self, target: &Value, field: Token, value: Value) -> Result<()> {
        match target {
            Value::Obj(object) => self.store(
                &Address::Field {
                    object: *object,
                    field,
                },
                value,
            ),
            Value::Addr(base) => self.store(
                &Address::StructField {
                    base: Box::new(base.clone()),
                    field,
                },
                value,
            ),
            other => Err(Error::Emulation(format!("field store to {other}"))),
        }
    }

    pub(super) fn load(&self, address: &Address) -> Result<Value> {
        let missing = || Error::Emulation(format!("invalid address {address:?}"));
        match address {
            Address::Local { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|f| f.locals.get(usize::from(*index)))
                .cloned()
                .ok_or_else(missing),
            Address::Argument { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|f| f.args.get(usize::from(*index)))
                .cloned()
                .ok_or_else(missing),
            Address::Field { object, field } => self
                .heap
                .object(*object)?
                .fields
                .get(field)
                .cloned()
                .ok_or_else(missing),
            Address::StructField { base, field } => struct_field(&self.load(base)?, *field),
            Address::Static(field) => match self.statics.get(field) {
                Some(value) => Ok(value.clone()),
                None => {
                    let model = &self.module.metadata;
                    let def = model.field(*field).ok_or(Error::FieldNotFound(*field))?;
                    Ok(Value::default_of(&def.field_type, model))
                }
            },
            Address::Element { array, index } => self
                .heap
                .array(*array)?
                .get(*index)
                .cloned()
                .ok_or_else(missing),
        }
    }

    pub(super) fn store(&mut self, address: &Address, value: Value) -> Result<()> {
        let missing = || Error::Emulation(format!("invalid address {address:?}"));
        let slot = match address {
            Address::Local { frame, index } => self
                .frames
                .get_mut(*frame)
                .and_then(|f| f.locals.get_mut(usize::from(*index))),
            Address::Argument { frame, index } => self
                .frames
                .get_mut(*frame)
                .and_then(|f| f.args.get_mut(usize::from(*index))),
            Address::Field { object, field } => {
                self.heap.object_mut(*object)?.fields.insert(*field, value);
                return Ok(());
            }
            Address::StructField { base, field } => {
                let mut container = self.load(base)?;
                let Value::Struct { fields, .. } = &mut container else {
                    return Err(Error::Emulation(format!(
                        "field store into non-struct {container}"
                    )));
                };
                fields.insert(*field, value);
                return self.store(base, container);
            }
            Address::Static(field) => {
                self.statics.insert(*field, value);
                return Ok(());
            }
            Address::Element { array, index } => self.heap.array_mut(*array)?.get_mut(*index),
        };
        *slot.ok_or_else(missing)? = value;
        Ok(())
    }
}

fn struct_field(container: &Value, field: Token) -> Result<Value> {
    match container {
        Value::Struct { fields, .. } => fields
            .get(&field)
            .cloned()
            .ok_or_else(|| Error::Emulation(format!("struct has no field {field}"))),
        other => Err(Error::Emulation(format!("field load from {other}"))),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left.as_i64(), right.as_i64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn integers(left: &Value, right: &Value) -> Result<(i64, i64)> {
    match (left.as_i64(), right.as_i64()) {
        (Some(l), Some(r)) => Ok((l, r)),
        _ => Err(Error::Emulation(format!("cannot compare {left} and {right}"))),
    }
}

fn binary(opcode: OpCode, left: &Value, right: &Value) -> Result<Value> {
    if let (Value::I4(l), Value::I4(r)) = (left, right) {
        let (l, r) = (*l, *r);
        #[allow(clippy::cast_sign_loss)]
        let value = match opcode {
            OpCode::Add => l.wrapping_add(r),
            OpCode::Sub => l.wrapping_sub(r),
            OpCode::Mul => l.wrapping_mul(r),
            OpCode::Div | OpCode::Rem if r == 0 => {
                return Err(Error::Emulation("division by zero".to_string()))
            }
            OpCode::Div => l.wrapping_div(r),
            OpCode::Rem => l.wrapping_rem(r),
            OpCode::And => l & r,
            OpCode::Or => l | r,
            OpCode::Xor => l ^ r,
            OpCode::Shl => l.wrapping_shl(r as u32),
            OpCode::Shr => l.wrapping_shr(r as u32),
            other => return Err(Error::Emulation(format!("{other} is not arithmetic"))),
        };
        return Ok(Value::I4(value));
    }

    let (l, r) = integers(left, right)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = match opcode {
        OpCode::Add => l.wrapping_add(r),
        OpCode::Sub => l.wrapping_sub(r),
        OpCode::Mul => l.wrapping_mul(r),
        OpCode::Div | OpCode::Rem if r == 0 => {
            return Err(Error::Emulation("division by zero".to_string()))
        }
        OpCode::Div => l.wrapping_div(r),
        OpCode::Rem => l.wrapping_rem(r),
        OpCode::And => l & r,
        OpCode::Or => l | r,
        OpCode::Xor => l ^ r,
        OpCode::Shl => l.wrapping_shl(r as u32),
        OpCode::Shr => l.wrapping_shr(r as u32),
        other => return Err(Error::Emulation(format!("{other} is not arithmetic"))),
    };
    Ok(Value::I8(value))
}
