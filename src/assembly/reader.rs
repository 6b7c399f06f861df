//! Cursor-style reader over a block tree.
//!
//! The reader holds positions only; every read borrows the body for the
//! duration of the call. This lets the weaver mutate the tree between reads
//! (split the current sequence, splice blocks) and then re-synchronise the
//! reader, instead of holding a borrow across the mutation.

use crate::{
    assembly::{
        body::{BlockId, MethodBody, SequenceId},
        instruction::Instruction,
    },
    Result,
};

/// Saved reader position, see [`InstructionReader::bookmark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bookmark {
    sequence: Option<SequenceId>,
    position: usize,
    current: Option<usize>,
}

/// Reads instructions sequence by sequence while tracking entered blocks.
#[derive(Debug, Default)]
pub struct InstructionReader {
    blocks: Vec<BlockId>,
    sequence: Option<SequenceId>,
    position: usize,
    current: Option<usize>,
}

impl InstructionReader {
    /// Creates a reader outside of any block
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters `block`
    pub fn enter_block(&mut self, block: BlockId) {
        self.blocks.push(block);
    }

    /// Leaves `block`, which must be the innermost entered block.
    ///
    /// # Errors
    /// Returns an internal consistency error on a mismatched leave.
    pub fn leave_block(&mut self, block: BlockId) -> Result<()> {
        match self.blocks.pop() {
            Some(top) if top == block => Ok(()),
            top => Err(consistency_error!(
                "reader left block {} while block {:?} was innermost",
                block.0,
                top.map(|b| b.0)
            )),
        }
    }

    /// Enters `sequence`, positioning before its first instruction
    pub fn enter_sequence(&mut self, sequence: SequenceId) {
        self.sequence = Some(sequence);
        self.position = 0;
        self.current = None;
    }

    /// Leaves the current sequence
    pub fn leave_sequence(&mut self) {
        self.sequence = None;
        self.position = 0;
        self.current = None;
    }

    /// Reads the next instruction of the current sequence, `None` at its end
    pub fn read_instruction<'b>(&mut self, body: &'b MethodBody) -> Option<&'b Instruction> {
        let sequence = self.sequence?;
        let insn = body.sequence(sequence).instructions.get(self.position)?;
        self.current = Some(self.position);
        self.position += 1;
        Some(insn)
    }

    /// Sequence being read
    #[must_use]
    pub fn current_sequence(&self) -> Option<SequenceId> {
        self.sequence
    }

    /// Index of the last instruction read in the current sequence
    #[must_use]
    pub fn current_offset(&self) -> Option<usize> {
        self.current
    }

    /// Innermost entered block
    #[must_use]
    pub fn current_block(&self) -> Option<BlockId> {
        self.blocks.last().copied()
    }

    /// Number of entered blocks
    #[must_use]
    pub fn block_depth(&self) -> usize {
        self.blocks.len()
    }

    /// Entered blocks, outermost first
    #[must_use]
    pub fn open_blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Saves the position inside the current sequence
    #[must_use]
    pub fn bookmark(&self) -> Bookmark {
        Bookmark {
            sequence: self.sequence,
            position: self.position,
            current: self.current,
        }
    }

    /// Restores a position saved by [`InstructionReader::bookmark`]
    pub fn rewind(&mut self, bookmark: Bookmark) {
        self.sequence = bookmark.sequence;
        self.position = bookmark.position;
        self.current = bookmark.current;
    }

    /// The instruction following the current one in the same sequence,
    /// without moving the reader.
    #[must_use]
    pub fn peek_next(&mut self, body: &MethodBody) -> Option<Instruction> {
        let bookmark = self.bookmark();
        let next = self.read_instruction(body).cloned();
        self.rewind(bookmark);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::opcodes::OpCode;

    #[test]
    fn test_read_and_peek() -> Result<()> {
        let body = MethodBody::linear(vec![
            Instruction::simple(OpCode::Nop),
            Instruction::ldc_i4(7),
            Instruction::simple(OpCode::Ret),
        ])?;
        let seq = body.sequences_in_order()[0];

        let mut reader = InstructionReader::new();
        reader.enter_block(body.root());
        reader.enter_sequence(seq);

        assert_eq!(reader.read_instruction(&body).map(|i| i.opcode), Some(OpCode::Nop));
        assert_eq!(reader.current_offset(), Some(0));
        assert_eq!(reader.peek_next(&body), Some(Instruction::ldc_i4(7)));
        assert_eq!(reader.current_offset(), Some(0));
        assert_eq!(reader.read_instruction(&body), Some(&Instruction::ldc_i4(7)));
        assert_eq!(reader.read_instruction(&body).map(|i| i.opcode), Some(OpCode::Ret));
        assert!(reader.read_instruction(&body).is_none());
        assert!(reader.peek_next(&body).is_none());

        reader.leave_sequence();
        reader.leave_block(body.root())?;
        assert_eq!(reader.block_depth(), 0);
        Ok(())
    }

    #[test]
    fn test_mismatched_leave() {
        let mut reader = InstructionReader::new();
        reader.enter_block(BlockId(0));
        reader.enter_block(BlockId(1));
        assert!(reader.leave_block(BlockId(0)).is_err());
    }
}
