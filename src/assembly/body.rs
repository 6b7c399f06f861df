//! Method bodies as a tree of instruction blocks.
//!
//! A [`MethodBody`] is an arena: blocks and sequences are addressed by the
//! stable ids [`BlockId`] and [`SequenceId`], never by reference. Splicing a
//! block therefore only rewrites child lists and parent ids; ids held by a
//! traversal cursor, a branch operand or a diagnostic stay valid (a detached
//! block or sequence is simply no longer reachable from the root).
//!
//! Every block owns exactly one of:
//! - nothing ([`BlockContent::Empty`]),
//! - a list of child blocks ([`BlockContent::Children`]),
//! - a list of instruction sequences ([`BlockContent::Sequences`]).
//!
//! A block may additionally own exception handlers. The block itself is the
//! protected region; handler (and filter) blocks hang off it and are laid out
//! right after its content. The root block stands for the whole method and
//! never carries handlers.

use std::collections::{HashMap, HashSet};

use crate::{
    assembly::instruction::Instruction,
    metadata::{model::TypeSig, token::Token},
    Error, Result,
};

/// Stable id of a block inside its [`MethodBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Stable id of an instruction sequence; this is what branch operands reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(pub u32);

/// The kind of an exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Typed catch clause
    Catch,
    /// Filter block deciding whether the handler runs
    Filter,
    /// Runs on every exit of the protected block
    Finally,
    /// Runs only when the protected block exits by exception
    Fault,
}

/// An exception handler attached to a protected block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Kind of clause
    pub kind: HandlerKind,
    /// Caught type, for [`HandlerKind::Catch`]
    pub catch_type: Option<Token>,
    /// Filter block, for [`HandlerKind::Filter`]
    pub filter: Option<BlockId>,
    /// Handler block
    pub handler: BlockId,
}

/// What a block owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockContent {
    /// Nothing yet
    Empty,
    /// Nested blocks, in layout order
    Children(Vec<BlockId>),
    /// Instruction sequences, in layout order
    Sequences(Vec<SequenceId>),
}

/// Why a block exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    /// Ordinary block nested in its parent's children
    Plain,
    /// Handler block of its parent
    Handler,
    /// Filter block of its parent
    Filter,
}

/// Debug name of a local variable, scoped to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSymbol {
    /// Local index
    pub local: u16,
    /// Source name
    pub name: String,
}

/// A node of the block tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBlock {
    parent: Option<BlockId>,
    content: BlockContent,
    handlers: Vec<ExceptionHandler>,
    local_symbols: Vec<LocalSymbol>,
    role: BlockRole,
    detached: bool,
}

impl InstructionBlock {
    fn new(parent: Option<BlockId>, role: BlockRole) -> Self {
        InstructionBlock {
            parent,
            content: BlockContent::Empty,
            handlers: Vec::new(),
            local_symbols: Vec::new(),
            role,
            detached: parent.is_none(),
        }
    }

    /// Parent block; for handler blocks this is the protected block
    #[must_use]
    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    /// Owned content
    #[must_use]
    pub fn content(&self) -> &BlockContent {
        &self.content
    }

    /// Attached exception handlers
    #[must_use]
    pub fn handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    /// Local variable names declared in this scope
    #[must_use]
    pub fn local_symbols(&self) -> &[LocalSymbol] {
        &self.local_symbols
    }

    /// Role of the block
    #[must_use]
    pub fn role(&self) -> BlockRole {
        self.role
    }

    /// Child blocks, empty unless the content is [`BlockContent::Children`]
    #[must_use]
    pub fn children(&self) -> &[BlockId] {
        match &self.content {
            BlockContent::Children(c) => c,
            _ => &[],
        }
    }

    /// Sequences, empty unless the content is [`BlockContent::Sequences`]
    #[must_use]
    pub fn sequences(&self) -> &[SequenceId] {
        match &self.content {
            BlockContent::Sequences(s) => s,
            _ => &[],
        }
    }

    /// Returns true if the block was removed from the tree
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

/// A linear run of instructions; the unit branches target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    block: Option<BlockId>,
    /// The instructions, in execution order
    pub instructions: Vec<Instruction>,
}

impl Sequence {
    /// Owning block, `None` once detached
    #[must_use]
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }
}

/// The body of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    blocks: Vec<InstructionBlock>,
    sequences: Vec<Sequence>,
    root: BlockId,
    locals: Vec<TypeSig>,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    pub(crate) attached: Option<SequenceId>,
}

impl Default for MethodBody {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodBody {
    /// Creates a body with an empty root block
    #[must_use]
    pub fn new() -> Self {
        let mut root = InstructionBlock::new(None, BlockRole::Plain);
        root.detached = false;
        MethodBody {
            blocks: vec![root],
            sequences: Vec::new(),
            root: BlockId(0),
            locals: Vec::new(),
            init_locals: true,
            attached: None,
        }
    }

    /// Creates a body holding `instructions` in a single sequence.
    ///
    /// # Errors
    /// Propagates errors from [`MethodBody::add_sequence`].
    pub fn linear(instructions: Vec<Instruction>) -> Result<Self> {
        let mut body = MethodBody::new();
        let seq = body.add_sequence(body.root)?;
        body.sequences[seq.0 as usize].instructions = instructions;
        Ok(body)
    }

    /// The root block
    #[must_use]
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Block by id
    #[must_use]
    pub fn block(&self, id: BlockId) -> &InstructionBlock {
        &self.blocks[id.0 as usize]
    }

    fn block_mut(&mut self, id: BlockId) -> &mut InstructionBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// Sequence by id
    #[must_use]
    pub fn sequence(&self, id: SequenceId) -> &Sequence {
        &self.sequences[id.0 as usize]
    }

    /// Mutable sequence by id
    pub fn sequence_mut(&mut self, id: SequenceId) -> &mut Sequence {
        &mut self.sequences[id.0 as usize]
    }

    /// Number of blocks ever allocated, detached ones included
    #[must_use]
    pub fn block_capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Declared local variable types
    #[must_use]
    pub fn locals(&self) -> &[TypeSig] {
        &self.locals
    }

    /// Declares a new local and returns its index.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] past 65535 locals.
    pub fn define_local(&mut self, sig: TypeSig) -> Result<u16> {
        let index = u16::try_from(self.locals.len())
            .map_err(|_| Error::InvalidBody("too many locals".to_string()))?;
        self.locals.push(sig);
        Ok(index)
    }

    /// Declares a debug name for `local`, scoped to `block`.
    pub fn add_local_symbol(&mut self, block: BlockId, local: u16, name: &str) {
        self.block_mut(block).local_symbols.push(LocalSymbol {
            local,
            name: name.to_string(),
        });
    }

    /// Allocates a block that is not yet part of the tree.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(InstructionBlock::new(None, BlockRole::Plain));
        id
    }

    /// Allocates a sequence that is not yet owned by any block.
    pub fn new_sequence(&mut self) -> SequenceId {
        let id = SequenceId(self.sequences.len() as u32);
        self.sequences.push(Sequence {
            block: None,
            instructions: Vec::new(),
        });
        id
    }

    /// Appends a new child block to `parent`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `parent` holds sequences.
    pub fn add_block(&mut self, parent: BlockId) -> Result<BlockId> {
        let child = self.new_block();
        self.append_child(parent, child)?;
        Ok(child)
    }

    /// Appends an existing (detached) block to `parent`'s children.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `parent` holds sequences.
    pub fn append_child(&mut self, parent: BlockId, child: BlockId) -> Result<()> {
        let block = self.block_mut(parent);
        match &mut block.content {
            BlockContent::Empty => block.content = BlockContent::Children(vec![child]),
            BlockContent::Children(children) => children.push(child),
            BlockContent::Sequences(_) => {
                return Err(Error::InvalidBody(format!(
                    "block {} holds sequences, cannot add child block",
                    parent.0
                )))
            }
        }
        let child = self.block_mut(child);
        child.parent = Some(parent);
        child.detached = false;
        Ok(())
    }

    /// Appends a new sequence to `block`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `block` holds child blocks.
    pub fn add_sequence(&mut self, block: BlockId) -> Result<SequenceId> {
        let seq = self.new_sequence();
        self.append_sequence(block, seq)?;
        Ok(seq)
    }

    /// Appends an existing sequence to `block`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `block` holds child blocks.
    pub fn append_sequence(&mut self, block: BlockId, seq: SequenceId) -> Result<()> {
        let owner = self.block_mut(block);
        match &mut owner.content {
            BlockContent::Empty => owner.content = BlockContent::Sequences(vec![seq]),
            BlockContent::Sequences(seqs) => seqs.push(seq),
            BlockContent::Children(_) => {
                return Err(Error::InvalidBody(format!(
                    "block {} holds child blocks, cannot add sequence",
                    block.0
                )))
            }
        }
        self.sequence_mut(seq).block = Some(block);
        Ok(())
    }

    /// Places the detached sequence `seq` right after `after` in `after`'s block.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `after` is detached.
    pub fn insert_sequence_after(&mut self, after: SequenceId, seq: SequenceId) -> Result<()> {
        let block = self
            .sequence(after)
            .block
            .ok_or_else(|| Error::InvalidBody(format!("sequence {} is detached", after.0)))?;
        if let BlockContent::Sequences(seqs) = &mut self.block_mut(block).content {
            let index = seqs.iter().position(|&s| s == after).unwrap_or(seqs.len() - 1);
            seqs.insert(index + 1, seq);
        }
        self.sequence_mut(seq).block = Some(block);
        Ok(())
    }

    /// Replaces the content of `block` by `children`, re-parenting them.
    pub fn set_children(&mut self, block: BlockId, children: Vec<BlockId>) {
        for &child in &children {
            let c = self.block_mut(child);
            c.parent = Some(block);
            c.detached = false;
        }
        self.block_mut(block).content = if children.is_empty() {
            BlockContent::Empty
        } else {
            BlockContent::Children(children)
        };
    }

    /// Replaces the content of `block` by `sequences`, re-homing them.
    pub fn set_sequences(&mut self, block: BlockId, sequences: Vec<SequenceId>) {
        for &seq in &sequences {
            self.sequence_mut(seq).block = Some(block);
        }
        self.block_mut(block).content = if sequences.is_empty() {
            BlockContent::Empty
        } else {
            BlockContent::Sequences(sequences)
        };
    }

    /// Takes the content out of `block`, leaving it empty.
    pub fn take_content(&mut self, block: BlockId) -> BlockContent {
        std::mem::replace(&mut self.block_mut(block).content, BlockContent::Empty)
    }

    /// Gives a block previously emptied by [`MethodBody::take_content`] new content.
    pub fn put_content(&mut self, block: BlockId, content: BlockContent) {
        match content {
            BlockContent::Empty => self.block_mut(block).content = BlockContent::Empty,
            BlockContent::Children(children) => self.set_children(block, children),
            BlockContent::Sequences(sequences) => self.set_sequences(block, sequences),
        }
    }

    /// Attaches an exception handler to `protected` and returns the handler block.
    ///
    /// For [`HandlerKind::Filter`] a filter block is created as well, see
    /// [`ExceptionHandler::filter`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] for the root block, which cannot be protected.
    pub fn add_handler(
        &mut self,
        protected: BlockId,
        kind: HandlerKind,
        catch_type: Option<Token>,
    ) -> Result<BlockId> {
        if protected == self.root {
            return Err(Error::InvalidBody(
                "the root block cannot carry exception handlers".to_string(),
            ));
        }

        let filter = if kind == HandlerKind::Filter {
            let id = self.new_block();
            let block = self.block_mut(id);
            block.parent = Some(protected);
            block.role = BlockRole::Filter;
            block.detached = false;
            Some(id)
        } else {
            None
        };

        let handler = self.new_block();
        let block = self.block_mut(handler);
        block.parent = Some(protected);
        block.role = BlockRole::Handler;
        block.detached = false;

        self.block_mut(protected).handlers.push(ExceptionHandler {
            kind,
            catch_type,
            filter,
            handler,
        });
        Ok(handler)
    }

    /// Wraps `children` (detached or not) in a new detached block.
    pub fn wrap(&mut self, children: Vec<BlockId>) -> BlockId {
        let wrapper = self.new_block();
        self.set_children(wrapper, children);
        wrapper
    }

    /// Moves the content of `block` into a new child so handlers can be attached
    /// to that child without affecting `block`'s own scope. Returns the child.
    pub fn isolate(&mut self, block: BlockId) -> BlockId {
        let inner = self.new_block();
        let content = self.take_content(block);
        self.put_content(inner, content);
        self.set_children(block, vec![inner]);
        inner
    }

    /// Replaces `block` in its parent's children by `replacements`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `block` is not a plain child of its parent.
    pub fn replace_in_parent(&mut self, block: BlockId, replacements: Vec<BlockId>) -> Result<()> {
        let parent = self
            .block(block)
            .parent
            .ok_or_else(|| Error::InvalidBody(format!("block {} has no parent", block.0)))?;
        let position = self
            .block(parent)
            .children()
            .iter()
            .position(|&c| c == block)
            .ok_or_else(|| {
                Error::InvalidBody(format!(
                    "block {} is not a child of block {}",
                    block.0, parent.0
                ))
            })?;

        for &r in &replacements {
            let b = self.block_mut(r);
            b.parent = Some(parent);
            b.detached = false;
        }
        let parent_block = self.block_mut(parent);
        if let BlockContent::Children(children) = &mut parent_block.content {
            children.splice(position..=position, replacements);
            if children.is_empty() {
                parent_block.content = BlockContent::Empty;
            }
        }

        let old = self.block_mut(block);
        old.parent = None;
        old.detached = true;
        Ok(())
    }

    /// Blocks traversed below `block`: its children, then filter and handler blocks.
    #[must_use]
    pub fn unit_blocks(&self, block: BlockId) -> Vec<BlockId> {
        let b = self.block(block);
        let mut units: Vec<BlockId> = b.children().to_vec();
        for handler in &b.handlers {
            if let Some(filter) = handler.filter {
                units.push(filter);
            }
            units.push(handler.handler);
        }
        units
    }

    /// The unit following `block` under its parent, if any.
    #[must_use]
    pub fn next_unit(&self, block: BlockId) -> Option<BlockId> {
        let parent = self.block(block).parent?;
        let units = self.unit_blocks(parent);
        let index = units.iter().position(|&u| u == block)?;
        units.get(index + 1).copied()
    }

    /// Returns true for handler and filter blocks
    #[must_use]
    pub fn is_handler_block(&self, block: BlockId) -> bool {
        self.block(block).role != BlockRole::Plain
    }

    /// Moves `instructions[at..]` of `seq` into a new sequence placed right after
    /// `seq` in the same block and returns it.
    ///
    /// Branches keep targeting `seq`, which now holds the prefix.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] if `seq` is detached or `at` is out of range.
    pub fn split_sequence(&mut self, seq: SequenceId, at: usize) -> Result<SequenceId> {
        let block = self
            .sequence(seq)
            .block
            .ok_or_else(|| Error::InvalidBody(format!("sequence {} is detached", seq.0)))?;
        if at > self.sequence(seq).instructions.len() {
            return Err(Error::InvalidBody(format!(
                "split position {at} past the end of sequence {}",
                seq.0
            )));
        }

        let tail = self.sequence_mut(seq).instructions.split_off(at);
        let new = self.new_sequence();
        self.sequence_mut(new).instructions = tail;
        self.sequence_mut(new).block = Some(block);

        if let BlockContent::Sequences(seqs) = &mut self.block_mut(block).content {
            if let Some(index) = seqs.iter().position(|&s| s == seq) {
                seqs.insert(index + 1, new);
            }
        }
        Ok(new)
    }

    /// Removes `seq` from its block. Its id stays allocated but unreachable.
    pub fn detach_sequence(&mut self, seq: SequenceId) {
        if let Some(block) = self.sequence(seq).block {
            let owner = self.block_mut(block);
            if let BlockContent::Sequences(seqs) = &mut owner.content {
                seqs.retain(|&s| s != seq);
                if seqs.is_empty() {
                    owner.content = BlockContent::Empty;
                }
            }
        }
        self.sequence_mut(seq).block = None;
    }

    /// Rewrites every branch to `from` into a branch to `to`; returns the count.
    pub fn redirect_branches(&mut self, from: SequenceId, to: SequenceId) -> usize {
        let mut count = 0;
        for seq in &mut self.sequences {
            if seq.block.is_none() {
                continue;
            }
            for insn in &mut seq.instructions {
                if insn.redirect(from, to) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Sequences in layout order (content first, then filter and handler blocks).
    #[must_use]
    pub fn sequences_in_order(&self) -> Vec<SequenceId> {
        let mut out = Vec::new();
        self.collect_sequences(self.root, &mut out);
        out
    }

    fn collect_sequences(&self, block: BlockId, out: &mut Vec<SequenceId>) {
        let b = self.block(block);
        match &b.content {
            BlockContent::Empty => {}
            BlockContent::Sequences(seqs) => out.extend(seqs.iter().copied()),
            BlockContent::Children(children) => {
                for &child in children {
                    self.collect_sequences(child, out);
                }
            }
        }
        for handler in &b.handlers {
            if let Some(filter) = handler.filter {
                self.collect_sequences(filter, out);
            }
            self.collect_sequences(handler.handler, out);
        }
    }

    /// All reachable instructions in layout order
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.sequences_in_order()
            .into_iter()
            .flat_map(move |s| self.sequence(s).instructions.iter())
    }

    /// Number of reachable instructions
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.instructions().count()
    }

    /// First reachable instruction matching `predicate`, as (sequence, index).
    pub fn find_instruction<F>(&self, mut predicate: F) -> Option<(SequenceId, usize)>
    where
        F: FnMut(&Instruction) -> bool,
    {
        for seq in self.sequences_in_order() {
            if let Some(index) = self.sequence(seq).instructions.iter().position(&mut predicate) {
                return Some((seq, index));
            }
        }
        None
    }

    /// Chain of blocks from the root down to `block`, both included.
    #[must_use]
    pub fn path_to(&self, block: BlockId) -> Vec<BlockId> {
        let mut path = vec![block];
        let mut current = block;
        while let Some(parent) = self.block(current).parent {
            path.push(parent);
            current = parent;
            if path.len() > self.blocks.len() {
                break;
            }
        }
        path.reverse();
        path
    }

    /// Checks the tree invariants.
    ///
    /// - every reachable block is reached exactly once and points at its parent
    /// - every reachable sequence is owned by exactly one block, which it points at
    /// - handlers are only attached below the root
    /// - every branch target is a reachable sequence
    /// - no instruction writer is attached
    ///
    /// # Errors
    /// Returns [`Error::InvalidBody`] describing the first violation.
    pub fn verify_structure(&self) -> Result<()> {
        if self.attached.is_some() {
            return Err(Error::InvalidBody(
                "an instruction writer is still attached".to_string(),
            ));
        }
        if !self.block(self.root).handlers.is_empty() {
            return Err(Error::InvalidBody(
                "the root block carries exception handlers".to_string(),
            ));
        }

        let mut seen_blocks = HashSet::new();
        let mut seen_sequences = HashMap::new();
        let mut stack = vec![(self.root, None)];
        while let Some((block, expected_parent)) = stack.pop() {
            if !seen_blocks.insert(block) {
                return Err(Error::InvalidBody(format!(
                    "block {} is reachable twice",
                    block.0
                )));
            }
            let b = self.block(block);
            if b.parent != expected_parent || b.detached {
                return Err(Error::InvalidBody(format!(
                    "block {} has an inconsistent parent link",
                    block.0
                )));
            }
            if matches!(&b.content, BlockContent::Children(c) if c.is_empty())
                || matches!(&b.content, BlockContent::Sequences(s) if s.is_empty())
            {
                return Err(Error::InvalidBody(format!(
                    "block {} has an empty content list",
                    block.0
                )));
            }
            for &seq in b.sequences() {
                if seen_sequences.insert(seq, block).is_some() {
                    return Err(Error::InvalidBody(format!(
                        "sequence {} is owned twice",
                        seq.0
                    )));
                }
                if self.sequence(seq).block != Some(block) {
                    return Err(Error::InvalidBody(format!(
                        "sequence {} does not point at its block {}",
                        seq.0, block.0
                    )));
                }
            }
            for unit in self.unit_blocks(block) {
                stack.push((unit, Some(block)));
            }
        }

        for &seq in seen_sequences.keys() {
            for insn in &self.sequence(seq).instructions {
                for target in insn.branch_targets() {
                    if !seen_sequences.contains_key(&target) {
                        return Err(Error::InvalidBody(format!(
                            "'{insn}' in sequence {} targets unreachable sequence {}",
                            seq.0, target.0
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
