//! Scoped instruction emission into a sequence.
//!
//! [`MethodBody::attach_writer`] attaches an [`InstructionWriter`] to one
//! sequence; the writer detaches itself when dropped. Because detaching is tied
//! to `Drop`, every exit path of an advice (including early returns through
//! `?`) leaves the body without an attached writer.
//!
//! Branches are emitted against a symbolic [`SequenceId`]. Forward targets are
//! obtained with [`InstructionWriter::new_label`] and placed later with
//! [`InstructionWriter::place_label`]; picking short or long branch encodings
//! is left to the binary encoder.

use crate::{
    assembly::{
        body::{MethodBody, SequenceId},
        instruction::{Instruction, Operand},
        opcodes::OpCode,
    },
    metadata::token::Token,
    Error, Result,
};

/// Emits instructions at the end of the attached sequence.
#[derive(Debug)]
pub struct InstructionWriter<'b> {
    body: &'b mut MethodBody,
    sequence: SequenceId,
}

impl MethodBody {
    /// Attaches a writer to `sequence`.
    ///
    /// # Errors
    /// Returns an internal consistency error if another writer is attached,
    /// and [`Error::InvalidBody`] if `sequence` is not owned by a block.
    pub fn attach_writer(&mut self, sequence: SequenceId) -> Result<InstructionWriter<'_>> {
        if let Some(attached) = self.attached {
            return Err(consistency_error!(
                "writer already attached to sequence {}",
                attached.0
            ));
        }
        if self.sequence(sequence).block().is_none() {
            return Err(Error::InvalidBody(format!(
                "cannot write into detached sequence {}",
                sequence.0
            )));
        }
        self.attached = Some(sequence);
        Ok(InstructionWriter {
            body: self,
            sequence,
        })
    }

    /// Returns true while a writer is attached
    #[must_use]
    pub fn has_attached_writer(&self) -> bool {
        self.attached.is_some()
    }
}

impl Drop for InstructionWriter<'_> {
    fn drop(&mut self) {
        self.body.attached = None;
    }
}

impl InstructionWriter<'_> {
    /// The sequence currently written to
    #[must_use]
    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    /// Emits a validated instruction.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if the operand does not fit the opcode.
    pub fn emit_instruction(&mut self, instruction: Instruction) -> Result<()> {
        let checked = Instruction::new(instruction.opcode, instruction.operand)?;
        self.body
            .sequence_mut(self.sequence)
            .instructions
            .push(checked);
        Ok(())
    }

    /// Emits an instruction without operand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `opcode` requires an operand.
    pub fn emit(&mut self, opcode: OpCode) -> Result<()> {
        self.emit_instruction(Instruction::simple(opcode))
    }

    /// Emits `ldc.i4 value`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for uniformity.
    pub fn emit_i4(&mut self, value: i32) -> Result<()> {
        self.emit_instruction(Instruction::ldc_i4(value))
    }

    /// Emits `ldc.i8 value`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for uniformity.
    pub fn emit_i8(&mut self, value: i64) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode: OpCode::LdcI8,
            operand: Operand::Int64(value),
        })
    }

    /// Emits `ldstr value`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for uniformity.
    pub fn emit_string(&mut self, value: &str) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode: OpCode::Ldstr,
            operand: Operand::String(value.to_string()),
        })
    }

    /// Emits a field instruction (`ldfld`, `stsfld`, ...).
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `opcode` takes no field or `field` is no field token.
    pub fn emit_field(&mut self, opcode: OpCode, field: Token) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode,
            operand: Operand::Token(field),
        })
    }

    /// Emits a method instruction (`call`, `callvirt`, `newobj`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] on a mismatching opcode or token.
    pub fn emit_method(&mut self, opcode: OpCode, method: Token) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode,
            operand: Operand::Token(method),
        })
    }

    /// Emits a type instruction (`initobj`, `box`, `newarr`, ...).
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] on a mismatching opcode or token.
    pub fn emit_type(&mut self, opcode: OpCode, ty: Token) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode,
            operand: Operand::Token(ty),
        })
    }

    /// Emits a local instruction (`ldloc`, `stloc`, `ldloca`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] on a mismatching opcode or an undeclared local.
    pub fn emit_local(&mut self, opcode: OpCode, local: u16) -> Result<()> {
        if usize::from(local) >= self.body.locals().len() {
            return Err(Error::InvalidBody(format!("local {local} is not declared")));
        }
        self.emit_instruction(Instruction {
            opcode,
            operand: Operand::Local(local),
        })
    }

    /// Emits an argument instruction (`ldarg`, `starg`, `ldarga`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] on a mismatching opcode.
    pub fn emit_argument(&mut self, opcode: OpCode, argument: u16) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode,
            operand: Operand::Argument(argument),
        })
    }

    /// Emits a branch (`br`, `brtrue`, `leave`, ...) to `target`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `opcode` is not a branch.
    pub fn emit_branch(&mut self, opcode: OpCode, target: SequenceId) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode,
            operand: Operand::Target(target),
        })
    }

    /// Emits `switch` over `targets`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for uniformity.
    pub fn emit_switch(&mut self, targets: Vec<SequenceId>) -> Result<()> {
        self.emit_instruction(Instruction {
            opcode: OpCode::Switch,
            operand: Operand::Switch(targets),
        })
    }

    /// Allocates a branch target to be placed later.
    pub fn new_label(&mut self) -> SequenceId {
        self.body.new_sequence()
    }

    /// Places `label` right after the current sequence and continues writing there.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `label` was already placed.
    pub fn place_label(&mut self, label: SequenceId) -> Result<()> {
        if self.body.sequence(label).block().is_some() {
            return Err(Error::InvalidBody(format!(
                "label {} is already placed",
                label.0
            )));
        }
        self.body.insert_sequence_after(self.sequence, label)?;
        self.sequence = label;
        self.body.attached = Some(label);
        Ok(())
    }

    /// Declares a local variable.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] past 65535 locals.
    pub fn define_local(&mut self, sig: crate::metadata::model::TypeSig) -> Result<u16> {
        self.body.define_local(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::TypeSig;

    #[test]
    fn test_writer_detaches_on_drop() -> Result<()> {
        let mut body = MethodBody::new();
        let seq = body.add_sequence(body.root())?;
        {
            let mut writer = body.attach_writer(seq)?;
            writer.emit_i4(1)?;
            writer.emit(OpCode::Ret)?;
        }
        assert!(!body.has_attached_writer());
        assert_eq!(body.sequence(seq).instructions.len(), 2);
        body.verify_structure()?;
        Ok(())
    }

    #[test]
    fn test_writer_detaches_on_error_path() -> Result<()> {
        fn failing(body: &mut MethodBody, seq: SequenceId) -> Result<()> {
            let mut writer = body.attach_writer(seq)?;
            writer.emit(OpCode::Nop)?;
            writer.emit(OpCode::Ldfld)?;
            writer.emit(OpCode::Ret)
        }

        let mut body = MethodBody::new();
        let seq = body.add_sequence(body.root())?;
        assert!(failing(&mut body, seq).is_err());
        assert!(!body.has_attached_writer());
        Ok(())
    }

    #[test]
    fn test_labels() -> Result<()> {
        let mut body = MethodBody::new();
        let seq = body.add_sequence(body.root())?;
        let local = body.define_local(TypeSig::I4)?;
        {
            let mut writer = body.attach_writer(seq)?;
            let done = writer.new_label();
            writer.emit_local(OpCode::Ldloc, local)?;
            writer.emit_branch(OpCode::Brfalse, done)?;
            writer.emit(OpCode::Nop)?;
            writer.place_label(done)?;
            assert!(writer.place_label(done).is_err());
            writer.emit(OpCode::Ret)?;
            assert!(writer.emit_local(OpCode::Ldloc, 9).is_err());
        }
        assert_eq!(body.sequences_in_order().len(), 2);
        body.verify_structure()?;
        Ok(())
    }
}
