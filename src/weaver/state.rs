//! The per-method weaving state machine.
//!
//! Traversal is an explicit state value advanced in a loop, not recursion over
//! the block tree: splicing replaces the very block being traversed, and the
//! next state is computed from the tree as it is after the splice. Blocks
//! produced by advices are recorded in a skip set and never entered.
//!
//! ```text
//! BeforeBody -> BeforeBlock(root)
//! BeforeBlock(b)     -> BeforeSequence(first) | BeforeBlock(first unit) | AfterBlock(b)
//! BeforeSequence(s)  -> BeforeInstruction
//! BeforeInstruction  -> BeforeInstruction | AfterSequence | <splice>
//! AfterSequence      -> BeforeSequence(next) | BeforeBlock(handler) | AfterBlock(b)
//! AfterBlock(b)      -> BeforeBlock(next unit) | AfterBlock(parent) | AfterBody
//! ```

use std::collections::HashSet;

use crate::{
    assembly::{BlockId, HandlerKind, Instruction, InstructionReader, MethodBody, SequenceId},
    metadata::{
        diagnostics::Diagnostics,
        model::{MetadataModel, MethodDef},
    },
    weaver::{
        collection::AdviceCollection,
        config::WeaverConfig,
        context::{MethodSymbols, WeavingContext},
        index::MethodLevelAdvices,
        joinpoint::{classify, JoinPoint, JoinPointKinds, JoinPointPosition},
        restructure::{self, is_chained_constructor_call, ConstructorKind},
        splitter::{BucketMatch, SpliceSite},
    },
    Result,
};

/// Traversal state of [`MethodWeaver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WeaveState {
    BeforeBody,
    BeforeBlock(BlockId),
    BeforeSequence(SequenceId),
    BeforeInstruction,
    AfterSequence,
    AfterBlock(BlockId),
    AfterBody,
}

/// Weaves the instruction-level advices of one method.
pub(crate) struct MethodWeaver<'a> {
    pub(crate) body: &'a mut MethodBody,
    pub(crate) model: &'a MetadataModel,
    pub(crate) method: &'a MethodDef,
    pub(crate) advices: &'a MethodLevelAdvices,
    pub(crate) diagnostics: &'a Diagnostics,
    pub(crate) symbols: MethodSymbols,
    pub(crate) constructor: ConstructorKind,
    pub(crate) initialized: bool,
    pub(crate) skip: HashSet<BlockId>,
    pub(crate) stack: Vec<BlockId>,
    pub(crate) reader: InstructionReader,
    pub(crate) splices: usize,
}

impl<'a> MethodWeaver<'a> {
    pub(crate) fn new(
        body: &'a mut MethodBody,
        model: &'a MetadataModel,
        method: &'a MethodDef,
        advices: &'a MethodLevelAdvices,
        diagnostics: &'a Diagnostics,
    ) -> Self {
        MethodWeaver {
            body,
            model,
            method,
            advices,
            diagnostics,
            symbols: MethodSymbols::default(),
            constructor: ConstructorKind::NotConstructor,
            initialized: true,
            skip: HashSet::new(),
            stack: Vec::new(),
            reader: InstructionReader::new(),
            splices: 0,
        }
    }

    /// Runs the state machine to `AfterBody`.
    ///
    /// # Errors
    /// Returns an internal consistency error if traversal and tree disagree.
    pub(crate) fn run(&mut self) -> Result<()> {
        let mut state = WeaveState::BeforeBody;
        loop {
            state = match state {
                WeaveState::BeforeBody => WeaveState::BeforeBlock(self.body.root()),
                WeaveState::BeforeBlock(block) => self.before_block(block),
                WeaveState::BeforeSequence(sequence) => {
                    self.reader.enter_sequence(sequence);
                    WeaveState::BeforeInstruction
                }
                WeaveState::BeforeInstruction => self.before_instruction()?,
                WeaveState::AfterSequence => self.after_sequence()?,
                WeaveState::AfterBlock(block) => self.after_block(block)?,
                WeaveState::AfterBody => {
                    if !self.stack.is_empty() || self.reader.block_depth() != 0 {
                        return Err(consistency_error!(
                            "traversal of {} ended with {} open block(s)",
                            self.method.name,
                            self.stack.len()
                        ));
                    }
                    log::trace!("{}: {} splice(s)", self.method.name, self.splices);
                    return Ok(());
                }
            };
        }
    }

    fn before_block(&mut self, block: BlockId) -> WeaveState {
        if self.skip.contains(&block) {
            return self.advance_from(block);
        }
        self.stack.push(block);
        self.reader.enter_block(block);

        if let Some(&first) = self.body.block(block).sequences().first() {
            return WeaveState::BeforeSequence(first);
        }
        match self.body.unit_blocks(block).first() {
            Some(&unit) => WeaveState::BeforeBlock(unit),
            None => WeaveState::AfterBlock(block),
        }
    }

    fn after_sequence(&mut self) -> Result<WeaveState> {
        let sequence = self
            .reader
            .current_sequence()
            .ok_or_else(|| consistency_error!("left a sequence that was never entered"))?;
        self.reader.leave_sequence();
        let block = self.current_block()?;

        let sequences = self.body.block(block).sequences();
        let position = sequences
            .iter()
            .position(|&s| s == sequence)
            .ok_or_else(|| {
                consistency_error!("sequence {} is not in block {}", sequence.0, block.0)
            })?;
        if let Some(&next) = sequences.get(position + 1) {
            return Ok(WeaveState::BeforeSequence(next));
        }
        Ok(match self.body.unit_blocks(block).first() {
            Some(&unit) => WeaveState::BeforeBlock(unit),
            None => WeaveState::AfterBlock(block),
        })
    }

    fn after_block(&mut self, block: BlockId) -> Result<WeaveState> {
        match self.stack.pop() {
            Some(top) if top == block => {}
            top => {
                return Err(consistency_error!(
                    "left block {} while {:?} was open",
                    block.0,
                    top.map(|b| b.0)
                ))
            }
        }
        self.reader.leave_block(block)?;
        Ok(self.advance_from(block))
    }

    /// The state after `block` and everything below it are done.
    pub(crate) fn advance_from(&self, block: BlockId) -> WeaveState {
        if block == self.body.root() {
            return WeaveState::AfterBody;
        }
        if let Some(next) = self.body.next_unit(block) {
            return WeaveState::BeforeBlock(next);
        }
        match self.body.block(block).parent() {
            Some(parent) => WeaveState::AfterBlock(parent),
            None => WeaveState::AfterBody,
        }
    }

    pub(crate) fn current_block(&self) -> Result<BlockId> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| consistency_error!("no block is open"))
    }

    /// Innermost handler (or filter) block on the open-block stack.
    fn enclosing_handler(&self) -> Option<HandlerKind> {
        for &block in self.stack.iter().rev() {
            if !self.body.is_handler_block(block) {
                continue;
            }
            let parent = self.body.block(block).parent()?;
            for handler in self.body.block(parent).handlers() {
                if handler.filter == Some(block) {
                    return Some(HandlerKind::Filter);
                }
                if handler.handler == block {
                    return Some(handler.kind);
                }
            }
        }
        None
    }

    fn before_instruction(&mut self) -> Result<WeaveState> {
        let Some(insn) = self.reader.read_instruction(self.body).cloned() else {
            return Ok(WeaveState::AfterSequence);
        };

        let completes_init =
            !self.initialized && is_chained_constructor_call(self.model, self.method, &insn);
        let category = classify(insn.opcode);
        let operand = category.operand_of(&insn);

        let advices = self.advices;
        let before = AdviceCollection::new(advices.get_advices(category.before, operand));
        let instead = AdviceCollection::new(advices.get_advices(category.instead_of, operand));
        let after = AdviceCollection::new(advices.get_advices(category.after, operand));
        if before.is_empty() && instead.is_empty() && after.is_empty() {
            if completes_init {
                self.initialized = true;
            }
            return Ok(WeaveState::BeforeInstruction);
        }

        let (Some(sequence), Some(offset)) =
            (self.reader.current_sequence(), self.reader.current_offset())
        else {
            return Err(consistency_error!("read an instruction outside a sequence"));
        };
        let next = self.reader.peek_next(self.body);
        let template = JoinPoint {
            kind: JoinPointKinds::empty(),
            position: JoinPointPosition::Before,
            instruction: Some(insn),
            operand,
            location: Some((sequence, offset)),
            handler: self.enclosing_handler(),
        };

        let before = self.bucket_match(
            before,
            category.before,
            JoinPointPosition::Before,
            &template,
            &next,
            false,
        );
        let instead = self.bucket_match(
            instead,
            category.instead_of,
            JoinPointPosition::InsteadOf,
            &template,
            &next,
            false,
        );
        let after = self.bucket_match(
            after,
            category.after,
            JoinPointPosition::After,
            &template,
            &next,
            completes_init,
        );

        if (before.mask | instead.mask | after.mask) == 0 {
            if completes_init {
                self.initialized = true;
            }
            return Ok(WeaveState::BeforeInstruction);
        }

        let state = self.splice(SpliceSite {
            sequence,
            offset,
            template,
            next,
            before,
            instead,
            after,
            completes_init,
        })?;
        if completes_init {
            self.initialized = true;
        }
        Ok(state)
    }

    fn bucket_match<'e>(
        &mut self,
        collection: AdviceCollection<'e>,
        kind: JoinPointKinds,
        position: JoinPointPosition,
        template: &JoinPoint,
        next: &Option<Instruction>,
        initialized_after: bool,
    ) -> BucketMatch<'e> {
        let mask = if collection.is_empty() {
            0
        } else {
            let join_point = JoinPoint {
                kind,
                position,
                ..template.clone()
            };
            let ctx = self.context(join_point, next.clone(), initialized_after);
            collection.requires_weave(&ctx)
        };
        BucketMatch {
            kind,
            position,
            collection,
            mask,
        }
    }

    /// Context for an advice at `join_point`.
    pub(crate) fn context(
        &mut self,
        join_point: JoinPoint,
        next: Option<Instruction>,
        initialized_after: bool,
    ) -> WeavingContext<'_> {
        WeavingContext::new(
            self.body,
            self.model,
            self.method,
            self.diagnostics,
            join_point,
        )
        .with_symbols(self.symbols)
        .with_constructor(self.constructor, self.initialized || initialized_after)
        .with_next_instruction(next)
    }
}

/// Outcome of weaving one method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MethodOutcome {
    pub restructured: bool,
    pub splices: usize,
}

impl MethodOutcome {
    pub(crate) fn changed(&self) -> bool {
        self.restructured || self.splices > 0
    }
}

/// Restructures `body` for its method-level advices, then weaves every
/// instruction-level join point.
///
/// Either the whole weave lands or `body` is left as it was: on error the
/// body is restored before returning.
///
/// # Errors
/// Returns internal consistency errors and failures of the weaver's own tree
/// edits; advice failures become diagnostics.
pub(crate) fn weave_method(
    body: &mut MethodBody,
    model: &MetadataModel,
    method: &MethodDef,
    advices: &MethodLevelAdvices,
    diagnostics: &Diagnostics,
    config: &WeaverConfig,
) -> Result<MethodOutcome> {
    let original = body.clone();
    let result = weave_in_place(body, model, method, advices, diagnostics, config);
    if result.is_err() {
        *body = original;
    }
    result
}

fn weave_in_place(
    body: &mut MethodBody,
    model: &MetadataModel,
    method: &MethodDef,
    advices: &MethodLevelAdvices,
    diagnostics: &Diagnostics,
    config: &WeaverConfig,
) -> Result<MethodOutcome> {
    let constructor = restructure::classify_constructor(model, method, body);
    let restructured = restructure::restructure(
        body,
        model,
        method,
        advices,
        diagnostics,
        config,
        constructor,
    )?;

    let mut weaver = MethodWeaver::new(body, model, method, advices, diagnostics);
    weaver.constructor = constructor;
    weaver.initialized = !constructor.starts_uninitialized();
    weaver.symbols = restructured.symbols;
    weaver.skip = restructured.skip;
    weaver.run()?;

    Ok(MethodOutcome {
        restructured: restructured.changed,
        splices: weaver.splices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        assembly::{OpCode, Operand},
        test::{marker_values, ExhaustLocals, MarkerAdvice, TestModel},
        weaver::index::AdviceEntry,
        Error,
    };

    fn advices_for(
        model: &TestModel,
        entries: &[(i32, JoinPointKinds)],
    ) -> MethodLevelAdvices {
        let mut advices = MethodLevelAdvices::new(model.method().token);
        for (order, &(priority, kinds)) in entries.iter().enumerate() {
            advices
                .add(
                    AdviceEntry {
                        advice: MarkerAdvice::arc(priority, priority),
                        kinds,
                        order: order as u64,
                    },
                    None,
                )
                .ok();
        }
        advices.merge_and_sort(&Diagnostics::new());
        advices
    }

    #[test]
    fn test_traversal_without_advices_leaves_body() -> Result<()> {
        let model = TestModel::new();
        let advices = advices_for(&model, &[]);
        let mut body = MethodBody::linear(vec![
            Instruction::ldc_i4(1),
            Instruction::new(OpCode::Call, Operand::Token(model.helper))?,
            Instruction::simple(OpCode::Ret),
        ])?;
        let original = body.clone();
        let diagnostics = Diagnostics::new();
        let outcome = weave_method(
            &mut body,
            &model.metadata,
            model.method(),
            &advices,
            &diagnostics,
            &WeaverConfig::default(),
        )?;
        assert!(!outcome.changed());
        assert_eq!(body, original);
        Ok(())
    }

    #[test]
    fn test_before_and_after_call() -> Result<()> {
        let model = TestModel::new();
        let advices = advices_for(
            &model,
            &[
                (5, JoinPointKinds::BEFORE_CALL | JoinPointKinds::AFTER_CALL),
                (10, JoinPointKinds::BEFORE_CALL | JoinPointKinds::AFTER_CALL),
            ],
        );
        let mut body = MethodBody::linear(vec![
            Instruction::new(OpCode::Call, Operand::Token(model.helper))?,
            Instruction::new(OpCode::Call, Operand::Token(model.helper))?,
            Instruction::simple(OpCode::Ret),
        ])?;
        let diagnostics = Diagnostics::new();
        let outcome = weave_method(
            &mut body,
            &model.metadata,
            model.method(),
            &advices,
            &diagnostics,
            &WeaverConfig::default(),
        )?;

        assert_eq!(outcome.splices, 2);
        assert_eq!(marker_values(&body), vec![10, 5, 5, 10, 10, 5, 5, 10]);
        let calls = body.instructions().filter(|i| i.opcode == OpCode::Call).count();
        assert_eq!(calls, 2);
        body.verify_structure()?;
        assert!(!diagnostics.has_errors());
        Ok(())
    }

    #[test]
    fn test_loop_target_survives_split() -> Result<()> {
        let model = TestModel::new();
        let advices = advices_for(&model, &[(1, JoinPointKinds::BEFORE_CALL)]);

        // loop: call helper; br loop
        let mut body = MethodBody::new();
        let root = body.root();
        let head = body.add_sequence(root)?;
        {
            let mut writer = body.attach_writer(head)?;
            writer.emit_method(OpCode::Call, model.helper)?;
            writer.emit_branch(OpCode::Br, head)?;
        }
        let diagnostics = Diagnostics::new();
        weave_method(
            &mut body,
            &model.metadata,
            model.method(),
            &advices,
            &diagnostics,
            &WeaverConfig::default(),
        )?;
        body.verify_structure()?;

        let order = body.sequences_in_order();
        let branch = body
            .instructions()
            .find(|i| i.opcode == OpCode::Br)
            .map(|i| i.branch_targets())
            .unwrap_or_default();
        // The back edge lands on the advice code, which is laid out first.
        assert_eq!(branch.first(), order.first());
        assert_eq!(
            body.sequence(order[0]).instructions.first().map(|i| i.opcode),
            None
        );
        assert_eq!(marker_values(&body), vec![1]);
        Ok(())
    }

    #[test]
    fn test_failed_restructure_restores_body() -> Result<()> {
        let model = TestModel::new();
        let mut advices = MethodLevelAdvices::new(model.method().token);
        advices.add(
            AdviceEntry {
                advice: Arc::new(ExhaustLocals { priority: 10 }),
                kinds: JoinPointKinds::AFTER_METHOD_BODY_SUCCESS,
                order: 0,
            },
            None,
        )?;
        advices.add(
            AdviceEntry {
                advice: MarkerAdvice::arc(5, 5),
                kinds: JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION,
                order: 1,
            },
            None,
        )?;
        advices.merge_and_sort(&Diagnostics::new());

        // The catch region needs a local after the success advice took them all.
        let mut body = MethodBody::linear(vec![
            Instruction::ldc_i4(7),
            Instruction::simple(OpCode::Ret),
        ])?;
        let original = body.clone();
        let result = weave_method(
            &mut body,
            &model.metadata,
            model.method(),
            &advices,
            &Diagnostics::new(),
            &WeaverConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidBody(_))));
        assert_eq!(body, original);
        body.verify_structure()?;
        Ok(())
    }
}
