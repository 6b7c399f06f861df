//! Instructions, operands and their control-flow / stack metadata.
//!
//! Branch operands do not hold byte offsets: they reference a
//! [`SequenceId`], the stable identity of an instruction sequence in the
//! method's block tree. Offsets only exist after
//! [`crate::assembly::layout::linearize`].

use std::fmt;

use crate::{
    assembly::{
        body::SequenceId,
        opcodes::{OpCode, OperandType},
    },
    metadata::{model::MetadataModel, token::Token},
    Error, Result,
};

/// Operand of an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// No operand
    None,
    /// 32-bit immediate
    Int32(i32),
    /// 64-bit immediate
    Int64(i64),
    /// User string literal
    String(String),
    /// Field, method or type token
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Argument index (`this` is argument 0 of instance methods)
    Argument(u16),
    /// Branch target
    Target(SequenceId),
    /// Switch targets
    Switch(Vec<SequenceId>),
}

impl Operand {
    fn matches(&self, expected: OperandType) -> bool {
        match (self, expected) {
            (Operand::None, OperandType::None)
            | (Operand::Int32(_), OperandType::Int32)
            | (Operand::Int64(_), OperandType::Int64)
            | (Operand::String(_), OperandType::String)
            | (Operand::Local(_), OperandType::Local)
            | (Operand::Argument(_), OperandType::Argument)
            | (Operand::Target(_), OperandType::Target)
            | (Operand::Switch(_), OperandType::Switch) => true,
            (Operand::Token(t), OperandType::Field) => t.is_field(),
            (Operand::Token(t), OperandType::Method) => t.is_method(),
            (Operand::Token(t), OperandType::Type) => t.is_type(),
            _ => false,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int32(v) => write!(f, "{v}"),
            Operand::Int64(v) => write!(f, "{v}"),
            Operand::String(s) => write!(f, "{s:?}"),
            Operand::Token(t) => write!(f, "{t}"),
            Operand::Local(l) => write!(f, "V_{l}"),
            Operand::Argument(a) => write!(f, "A_{a}"),
            Operand::Target(t) => write!(f, "S_{}", t.0),
            Operand::Switch(targets) => {
                write!(f, "(")?;
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "S_{}", t.0)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Control flow behaviour of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Continues with the next instruction
    Sequential,
    /// May branch or fall through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method and continues
    Call,
    /// Leaves the method
    Return,
    /// Jumps through a table or falls through
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter handler
    EndFinally,
    /// Exits a protected region, running finally handlers
    Leave,
}

/// Evaluation stack effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped
    pub pops: u8,
    /// Number of items pushed
    pub pushes: u8,
}

impl StackBehavior {
    /// Net change of the stack depth
    #[must_use]
    pub fn net_effect(&self) -> i16 {
        i16::from(self.pushes) - i16::from(self.pops)
    }
}

/// A single instruction, exclusively owned by one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The opcode
    pub opcode: OpCode,
    /// The operand, matching [`OpCode::operand_type`]
    pub operand: Operand,
}

impl Instruction {
    /// An instruction without operand
    #[must_use]
    pub fn simple(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// Builds an instruction, checking that the operand fits the opcode.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] on an operand mismatch.
    pub fn new(opcode: OpCode, operand: Operand) -> Result<Self> {
        if !operand.matches(opcode.operand_type()) {
            return Err(Error::InvalidBody(format!(
                "operand '{operand}' does not fit '{opcode}'"
            )));
        }
        Ok(Instruction { opcode, operand })
    }

    /// `ldc.i4 value`
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        Instruction {
            opcode: OpCode::LdcI4,
            operand: Operand::Int32(value),
        }
    }

    /// Control flow behaviour
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        self.opcode.flow_type()
    }

    /// Returns true for branches, leaves and switches
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// Token operand, if any
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(t) => Some(t),
            _ => None,
        }
    }

    /// All sequences this instruction may branch to
    #[must_use]
    pub fn branch_targets(&self) -> Vec<SequenceId> {
        match &self.operand {
            Operand::Target(t) => vec![*t],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Rewrites every branch target equal to `from` into `to`; returns true if one changed.
    pub fn redirect(&mut self, from: SequenceId, to: SequenceId) -> bool {
        let mut changed = false;
        match &mut self.operand {
            Operand::Target(t) if *t == from => {
                *t = to;
                changed = true;
            }
            Operand::Switch(targets) => {
                for t in targets.iter_mut().filter(|t| **t == from) {
                    *t = to;
                    changed = true;
                }
            }
            _ => {}
        }
        changed
    }

    /// Stack effect, resolving call signatures through `model`.
    ///
    /// `returns_value` tells whether a `ret` in the enclosing method pops a value.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if a call target cannot be resolved.
    pub fn stack_behavior(
        &self,
        model: &MetadataModel,
        returns_value: bool,
    ) -> Result<StackBehavior> {
        if let Some((pops, pushes)) = self.opcode.fixed_stack() {
            return Ok(StackBehavior { pops, pushes });
        }

        if self.opcode == OpCode::Ret {
            return Ok(StackBehavior {
                pops: u8::from(returns_value),
                pushes: 0,
            });
        }

        let token = self.token().ok_or_else(|| {
            Error::InvalidBody(format!("'{}' without method operand", self.opcode))
        })?;
        let method = model.method(token).ok_or(Error::MethodNotFound(token))?;
        let params = u8::try_from(method.signature.params.len())
            .map_err(|_| Error::InvalidBody(format!("too many parameters on {token}")))?;

        Ok(match self.opcode {
            OpCode::Newobj => StackBehavior { pops: params, pushes: 1 },
            _ => StackBehavior {
                pops: params + u8::from(method.signature.has_this),
                pushes: u8::from(!method.signature.ret.is_void()),
            },
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::{MethodFlags, MethodSignature, TypeFlags, TypeSig};

    #[test]
    fn test_operand_validation() {
        let field = Token::from_parts(Token::FIELD, 1);
        assert!(Instruction::new(OpCode::Ldfld, Operand::Token(field)).is_ok());
        assert!(Instruction::new(OpCode::Call, Operand::Token(field)).is_err());
        assert!(Instruction::new(OpCode::Ret, Operand::Int32(1)).is_err());
    }

    #[test]
    fn test_redirect_switch() {
        let mut insn = Instruction {
            opcode: OpCode::Switch,
            operand: Operand::Switch(vec![SequenceId(1), SequenceId(2), SequenceId(1)]),
        };
        assert!(insn.redirect(SequenceId(1), SequenceId(9)));
        assert_eq!(
            insn.branch_targets(),
            vec![SequenceId(9), SequenceId(2), SequenceId(9)]
        );
        assert!(!insn.redirect(SequenceId(1), SequenceId(9)));
    }

    #[test]
    fn test_call_stack_behavior() -> Result<()> {
        let mut model = MetadataModel::new();
        let ty = model.add_type("App", "C", None, TypeFlags::empty());
        let m = model.add_method(
            ty,
            "Add",
            MethodSignature::instance(vec![TypeSig::I4, TypeSig::I4], TypeSig::I4),
            MethodFlags::empty(),
        )?;

        let call = Instruction::new(OpCode::Call, Operand::Token(m))?;
        let effect = call.stack_behavior(&model, false)?;
        assert_eq!((effect.pops, effect.pushes), (3, 1));

        let newobj = Instruction::new(OpCode::Newobj, Operand::Token(m))?;
        assert_eq!(newobj.stack_behavior(&model, false)?.net_effect(), -1);

        let ret = Instruction::simple(OpCode::Ret);
        assert_eq!(ret.stack_behavior(&model, true)?.pops, 1);
        Ok(())
    }

    #[test]
    fn test_display() {
        assert_eq!(Instruction::ldc_i4(42).to_string(), "ldc.i4 42");
        assert_eq!(Instruction::simple(OpCode::Ret).to_string(), "ret");
    }
}
