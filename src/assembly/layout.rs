//! Flattening a block tree into an instruction stream.
//!
//! [`linearize`] is the hand-off format for a binary encoder: instructions in
//! layout order, the start index of every sequence (branch targets) and the
//! protected regions, innermost first, as an exception table expects them.
//! [`analyze_stack`] runs the usual data-flow check over that stream: the stack
//! depth must never go negative and must agree wherever control flow joins.

use std::collections::{HashMap, VecDeque};

use crate::{
    assembly::{
        body::{BlockContent, BlockId, HandlerKind, MethodBody, SequenceId},
        instruction::{FlowType, Instruction},
        opcodes::OpCode,
    },
    metadata::{model::MetadataModel, token::Token},
    Error, Result,
};

/// A protected region of the flattened body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRegion {
    /// Clause kind
    pub kind: HandlerKind,
    /// Caught type for catch clauses
    pub catch_type: Option<Token>,
    /// Block forming the protected range
    pub protected: BlockId,
    /// First protected instruction
    pub try_start: usize,
    /// One past the last protected instruction
    pub try_end: usize,
    /// First filter instruction, for filter clauses
    pub filter_start: Option<usize>,
    /// First handler instruction
    pub handler_start: usize,
    /// One past the last handler instruction
    pub handler_end: usize,
}

impl ProtectedRegion {
    /// Returns true if `index` lies in the protected range
    #[must_use]
    pub fn protects(&self, index: usize) -> bool {
        index >= self.try_start && index < self.try_end
    }

    /// Returns true if `index` lies in the handler (or filter) range
    #[must_use]
    pub fn in_handler(&self, index: usize) -> bool {
        let start = self.filter_start.unwrap_or(self.handler_start);
        index >= start && index < self.handler_end
    }
}

/// A method body flattened into layout order.
#[derive(Debug, Clone)]
pub struct LinearBody {
    /// Instructions in layout order
    pub instructions: Vec<Instruction>,
    /// Index of the first instruction of every reachable sequence
    pub sequence_offsets: HashMap<SequenceId, usize>,
    /// Protected regions, innermost first
    pub regions: Vec<ProtectedRegion>,
}

impl LinearBody {
    /// Instruction index a branch to `target` lands on.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] for an unknown sequence.
    pub fn resolve(&self, target: SequenceId) -> Result<usize> {
        self.sequence_offsets.get(&target).copied().ok_or_else(|| {
            Error::InvalidBody(format!("branch to unknown sequence {}", target.0))
        })
    }

    /// Count of instructions with `opcode`
    #[must_use]
    pub fn count_opcode(&self, opcode: OpCode) -> usize {
        self.instructions.iter().filter(|i| i.opcode == opcode).count()
    }
}

/// Flattens `body` into layout order.
#[must_use]
pub fn linearize(body: &MethodBody) -> LinearBody {
    let mut linear = LinearBody {
        instructions: Vec::new(),
        sequence_offsets: HashMap::new(),
        regions: Vec::new(),
    };
    emit_block(body, body.root(), &mut linear);
    linear
}

fn emit_block(body: &MethodBody, block: BlockId, out: &mut LinearBody) {
    let b = body.block(block);
    let try_start = out.instructions.len();
    match b.content() {
        BlockContent::Empty => {}
        BlockContent::Sequences(seqs) => {
            for &seq in seqs {
                out.sequence_offsets.insert(seq, out.instructions.len());
                out.instructions
                    .extend(body.sequence(seq).instructions.iter().cloned());
            }
        }
        BlockContent::Children(children) => {
            for &child in children {
                emit_block(body, child, out);
            }
        }
    }
    let try_end = out.instructions.len();

    for handler in b.handlers() {
        let filter_start = handler.filter.map(|filter| {
            let start = out.instructions.len();
            emit_block(body, filter, out);
            start
        });
        let handler_start = out.instructions.len();
        emit_block(body, handler.handler, out);
        out.regions.push(ProtectedRegion {
            kind: handler.kind,
            catch_type: handler.catch_type,
            protected: block,
            try_start,
            try_end,
            filter_start,
            handler_start,
            handler_end: out.instructions.len(),
        });
    }
}

/// Computes the maximum stack depth of a flattened body.
///
/// Catch and filter handlers start with the exception object on the stack,
/// finally and fault handlers with an empty stack. `leave` empties the stack.
/// Unreachable instructions are not checked.
///
/// # Errors
/// Returns [`Error::InvalidBody`] on underflow, on a depth mismatch at a join,
/// on a `ret` with a non-empty remainder, or on a branch to an unknown sequence.
pub fn analyze_stack(
    linear: &LinearBody,
    model: &MetadataModel,
    returns_value: bool,
) -> Result<u16> {
    let mut depths: Vec<Option<u16>> = vec![None; linear.instructions.len()];
    let mut work = VecDeque::new();
    let mut max_depth = 0u16;

    seed(&mut depths, &mut work, 0, 0)?;
    for region in &linear.regions {
        let entry = match region.kind {
            HandlerKind::Catch | HandlerKind::Filter => 1,
            HandlerKind::Finally | HandlerKind::Fault => 0,
        };
        if let Some(filter) = region.filter_start {
            seed(&mut depths, &mut work, filter, 1)?;
        }
        seed(&mut depths, &mut work, region.handler_start, entry)?;
    }

    while let Some(index) = work.pop_front() {
        let Some(depth) = depths[index] else {
            continue;
        };
        let insn = &linear.instructions[index];
        let effect = insn.stack_behavior(model, returns_value)?;
        if u16::from(effect.pops) > depth {
            return Err(Error::InvalidBody(format!(
                "stack underflow at instruction {index} ('{insn}')"
            )));
        }
        let after = depth - u16::from(effect.pops) + u16::from(effect.pushes);
        max_depth = max_depth.max(after).max(depth);

        match insn.flow_type() {
            FlowType::Return => {
                if after != 0 {
                    return Err(Error::InvalidBody(format!(
                        "'ret' at instruction {index} leaves {after} item(s) on the stack"
                    )));
                }
            }
            FlowType::Throw | FlowType::EndFinally => {}
            FlowType::Leave => {
                for target in insn.branch_targets() {
                    seed(&mut depths, &mut work, linear.resolve(target)?, 0)?;
                }
            }
            FlowType::UnconditionalBranch => {
                for target in insn.branch_targets() {
                    seed(&mut depths, &mut work, linear.resolve(target)?, after)?;
                }
            }
            FlowType::ConditionalBranch | FlowType::Switch => {
                for target in insn.branch_targets() {
                    seed(&mut depths, &mut work, linear.resolve(target)?, after)?;
                }
                seed(&mut depths, &mut work, index + 1, after)?;
            }
            FlowType::Sequential | FlowType::Call => {
                seed(&mut depths, &mut work, index + 1, after)?
            }
        }
    }

    Ok(max_depth)
}

fn seed(
    depths: &mut [Option<u16>],
    work: &mut VecDeque<usize>,
    index: usize,
    depth: u16,
) -> Result<()> {
    let Some(slot) = depths.get_mut(index) else {
        return Ok(());
    };
    match *slot {
        None => {
            *slot = Some(depth);
            work.push_back(index);
            Ok(())
        }
        Some(existing) if existing == depth => Ok(()),
        Some(existing) => Err(Error::InvalidBody(format!(
            "stack depth mismatch at instruction {index}: {existing} vs {depth}"
        ))),
    }
}
