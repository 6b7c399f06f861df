//! The method-body restructurer.
//!
//! Runs once per method, before instruction-level weaving, when a method-level
//! kind (body boundary or constructor hook) has advices that want to fire. The
//! resulting root layout is
//!
//! ```text
//! [static-ctor hooks] [before-ctor hooks] [pre-init code] [after-init hooks]
//! [before-body]
//! finally_high { ... finally_low { catch_high { ... catch_low {
//!     body, success_low, ..., success_high
//! } } } }
//! exit
//! ```
//!
//! Every `ret` of the body becomes `stloc ret; leave success_low` (or `leave
//! exit` without success advice). Each success block ends with a `leave` to the
//! next one and the last leaves to the exit, which reloads the return value and
//! performs the single real `ret`. Catch regions are nested with the lowest
//! priority innermost; every finally region encloses every catch region, so an
//! exception raised by exception-advice code is still observed by all
//! always-advices.
//!
//! Success blocks and catch handlers open with an entry block (the branch
//! target, or the `stloc` of the caught exception). Every generated region then
//! holds an empty block the advices weave into, followed by a terminator block
//! with the `leave`, `rethrow` or `endfinally`, so advices may emit sequences
//! or nest blocks of their own.
//!
//! In constructors that chain to another constructor the body is cut right
//! after the chained call: only the remainder is wrapped, the hooks surround
//! the call.

use std::collections::HashSet;

use crate::{
    assembly::{
        BlockId, HandlerKind, Instruction, MethodBody, OpCode, Operand, SequenceId,
    },
    metadata::{
        diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
        model::{MetadataModel, MethodDef, TypeSig},
    },
    weaver::{
        advice::ExceptionFlow,
        collection::{AdviceCollection, WeaveOrder},
        config::WeaverConfig,
        context::{MethodSymbols, WeavingContext},
        index::MethodLevelAdvices,
        joinpoint::{JoinPoint, JoinPointKinds, JoinPointPosition},
    },
    Error, Result,
};

/// How a method relates to object construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConstructorKind {
    /// An ordinary method
    NotConstructor,
    /// The type initializer
    Static,
    /// An instance constructor calling a base-type constructor
    ChainsToBase,
    /// An instance constructor delegating to another constructor of its own type
    ChainsToThis,
    /// An instance constructor without chained call (value types)
    NoChainedCall,
}

impl ConstructorKind {
    /// Returns true if the instance-constructor hooks apply
    #[must_use]
    pub fn takes_instance_hooks(self) -> bool {
        matches!(self, ConstructorKind::ChainsToBase | ConstructorKind::NoChainedCall)
    }

    /// Returns true if `this` is uninitialized at method entry
    #[must_use]
    pub fn starts_uninitialized(self) -> bool {
        matches!(self, ConstructorKind::ChainsToBase | ConstructorKind::ChainsToThis)
    }
}

/// Returns true if `insn` is the call chaining `method` to a constructor of
/// its own or of its base type.
#[must_use]
pub fn is_chained_constructor_call(
    model: &MetadataModel,
    method: &MethodDef,
    insn: &Instruction,
) -> bool {
    if insn.opcode != OpCode::Call {
        return false;
    }
    let Some(callee) = insn.token().and_then(|t| model.method(t)) else {
        return false;
    };
    if !callee.is_instance_constructor() {
        return false;
    }
    let own = method.declaring_type;
    let base = model.type_def(own).and_then(|t| t.base);
    callee.declaring_type == own || Some(callee.declaring_type) == base
}

/// Classifies `method` by scanning `body` for its chained constructor call.
#[must_use]
pub fn classify_constructor(
    model: &MetadataModel,
    method: &MethodDef,
    body: &MethodBody,
) -> ConstructorKind {
    if method.is_static_constructor() {
        return ConstructorKind::Static;
    }
    if !method.is_instance_constructor() {
        return ConstructorKind::NotConstructor;
    }

    let chained = body
        .find_instruction(|i| is_chained_constructor_call(model, method, i))
        .and_then(|(seq, index)| body.sequence(seq).instructions[index].token())
        .and_then(|token| model.method(token));
    match chained {
        Some(callee) if callee.declaring_type == method.declaring_type => {
            ConstructorKind::ChainsToThis
        }
        Some(_) => ConstructorKind::ChainsToBase,
        None => ConstructorKind::NoChainedCall,
    }
}

/// Result of restructuring one method.
#[derive(Debug, Default)]
pub(crate) struct Restructured {
    /// Generated blocks the instruction-level traversal must not enter
    pub skip: HashSet<BlockId>,
    /// Locals and exit target handed to later advices
    pub symbols: MethodSymbols,
    /// False if the body was left untouched
    pub changed: bool,
}

struct Env<'a> {
    model: &'a MetadataModel,
    method: &'a MethodDef,
    diagnostics: &'a Diagnostics,
    constructor: ConstructorKind,
}

impl Env<'_> {
    fn context<'b>(
        &'b self,
        body: &'b mut MethodBody,
        kind: JoinPointKinds,
        position: JoinPointPosition,
        symbols: MethodSymbols,
        initialized: bool,
    ) -> WeavingContext<'b> {
        WeavingContext::new(
            body,
            self.model,
            self.method,
            self.diagnostics,
            JoinPoint::method_level(kind, position),
        )
        .with_symbols(symbols)
        .with_constructor(self.constructor, initialized)
    }

    fn mask(
        &self,
        body: &mut MethodBody,
        collection: AdviceCollection<'_>,
        kind: JoinPointKinds,
        position: JoinPointPosition,
    ) -> u32 {
        if collection.is_empty() {
            return 0;
        }
        let initialized = kind != JoinPointKinds::BEFORE_INSTANCE_CONSTRUCTOR;
        let ctx = self.context(body, kind, position, MethodSymbols::default(), initialized);
        collection.requires_weave(&ctx)
    }

    #[allow(clippy::too_many_arguments)]
    fn weave(
        &self,
        body: &mut MethodBody,
        collection: AdviceCollection<'_>,
        mask: u32,
        kind: JoinPointKinds,
        position: JoinPointPosition,
        block: BlockId,
        symbols: MethodSymbols,
    ) -> Result<()> {
        let initialized = kind != JoinPointKinds::BEFORE_INSTANCE_CONSTRUCTOR;
        let mut ctx = self.context(body, kind, position, symbols, initialized);
        collection.weave(mask, &mut ctx, block, WeaveOrder::Direct)
    }

    fn report(&self, severity: DiagnosticSeverity, category: DiagnosticCategory, message: String) {
        self.diagnostics.push(
            Diagnostic::new(severity, category, message).with_method(self.method.token),
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Masks {
    before_body: u32,
    success: u32,
    exception: u32,
    always: u32,
    after_init: u32,
    before_ctor: u32,
    static_ctor: u32,
}

impl Masks {
    fn needs_wrap(&self) -> bool {
        (self.success | self.exception | self.always) != 0
    }

    fn is_empty(&self) -> bool {
        (self.before_body
            | self.success
            | self.exception
            | self.always
            | self.after_init
            | self.before_ctor
            | self.static_ctor)
            == 0
    }
}

/// Restructures `body` for the method-level advices of `advices`.
///
/// # Errors
/// Propagates internal consistency errors; everything else is reported.
pub(crate) fn restructure(
    body: &mut MethodBody,
    model: &MetadataModel,
    method: &MethodDef,
    advices: &MethodLevelAdvices,
    diagnostics: &Diagnostics,
    config: &WeaverConfig,
    constructor: ConstructorKind,
) -> Result<Restructured> {
    if !advices.has_method_level() {
        return Ok(Restructured::default());
    }

    let env = Env {
        model,
        method,
        diagnostics,
        constructor,
    };
    let boundary = AdviceCollection::new(advices.boundary_advices());
    let before_ctor = AdviceCollection::new(
        advices.get_advices(JoinPointKinds::BEFORE_INSTANCE_CONSTRUCTOR, None),
    );
    let static_ctor = AdviceCollection::new(
        advices.get_advices(JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR, None),
    );

    let mut masks = Masks {
        before_body: env.mask(
            body,
            boundary,
            JoinPointKinds::BEFORE_METHOD_BODY,
            JoinPointPosition::Before,
        ),
        success: env.mask(
            body,
            boundary,
            JoinPointKinds::AFTER_METHOD_BODY_SUCCESS,
            JoinPointPosition::After,
        ),
        exception: env.mask(
            body,
            boundary,
            JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION,
            JoinPointPosition::After,
        ),
        always: env.mask(
            body,
            boundary,
            JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
            JoinPointPosition::After,
        ),
        ..Masks::default()
    };

    if method.is_instance_constructor() {
        masks.after_init = env.mask(
            body,
            boundary,
            JoinPointKinds::AFTER_INSTANCE_INITIALIZATION,
            JoinPointPosition::After,
        );
        masks.before_ctor = env.mask(
            body,
            before_ctor,
            JoinPointKinds::BEFORE_INSTANCE_CONSTRUCTOR,
            JoinPointPosition::Before,
        );
        if !constructor.takes_instance_hooks() && (masks.after_init | masks.before_ctor) != 0 {
            env.report(
                DiagnosticSeverity::Info,
                DiagnosticCategory::Constructor,
                format!(
                    "constructor hooks skipped on {}: it chains to a constructor of its own type",
                    method.name
                ),
            );
            masks.after_init = 0;
            masks.before_ctor = 0;
        }
    }
    if constructor == ConstructorKind::Static {
        masks.static_ctor = env.mask(
            body,
            static_ctor,
            JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR,
            JoinPointPosition::Before,
        );
    }

    if masks.is_empty() {
        return Ok(Restructured::default());
    }

    // Locate the chained constructor call before touching the tree.
    let chained_call = if constructor.starts_uninitialized() {
        body.find_instruction(|i| is_chained_constructor_call(model, method, i))
    } else {
        None
    };
    if let Some((seq, _)) = chained_call {
        if !is_splittable(body, seq) {
            env.report(
                DiagnosticSeverity::Warning,
                DiagnosticCategory::Constructor,
                format!(
                    "method-level advices skipped on {}: the chained constructor call sits in a \
                     protected region",
                    method.name
                ),
            );
            return Ok(Restructured::default());
        }
    }

    let root = body.root();
    let mut main = body.isolate(root);
    let mut pre = None;
    if let Some((seq, index)) = chained_call {
        let (head, tail) = split_tree_after(body, main, seq, index + 1)?;
        pre = Some(head);
        main = tail;
    }

    let mut layout = Vec::new();
    let mut skip = HashSet::new();
    let mut symbols = MethodSymbols::default();

    if masks.static_ctor != 0 {
        let block = body.new_block();
        env.weave(
            body,
            static_ctor,
            masks.static_ctor,
            JoinPointKinds::BEFORE_STATIC_CONSTRUCTOR,
            JoinPointPosition::Before,
            block,
            symbols,
        )?;
        layout.push(block);
        skip.insert(block);
    }
    if masks.before_ctor != 0 {
        let block = body.new_block();
        env.weave(
            body,
            before_ctor,
            masks.before_ctor,
            JoinPointKinds::BEFORE_INSTANCE_CONSTRUCTOR,
            JoinPointPosition::Before,
            block,
            symbols,
        )?;
        layout.push(block);
        skip.insert(block);
    }
    if let Some(pre) = pre {
        layout.push(pre);
    }
    if masks.after_init != 0 {
        let block = body.new_block();
        env.weave(
            body,
            boundary,
            masks.after_init,
            JoinPointKinds::AFTER_INSTANCE_INITIALIZATION,
            JoinPointPosition::After,
            block,
            symbols,
        )?;
        layout.push(block);
        skip.insert(block);
    }
    if masks.before_body != 0 {
        let block = body.new_block();
        env.weave(
            body,
            boundary,
            masks.before_body,
            JoinPointKinds::BEFORE_METHOD_BODY,
            JoinPointPosition::Before,
            block,
            symbols,
        )?;
        layout.push(block);
        skip.insert(block);
    }

    if masks.needs_wrap() {
        let (wrapped, exit) = wrap_body(
            body,
            &env,
            config,
            boundary,
            masks,
            main,
            &mut symbols,
            &mut skip,
        )?;
        layout.push(wrapped);
        layout.push(exit);
    } else {
        layout.push(main);
    }

    body.set_children(root, layout);
    log::debug!(
        "restructured {} ({constructor}): {} generated block(s)",
        method.name,
        skip.len()
    );

    Ok(Restructured {
        skip,
        symbols,
        changed: true,
    })
}

/// Advice indices set in `mask`, lowest priority first.
fn lowest_first(mask: u32) -> impl Iterator<Item = usize> {
    (0..32usize).rev().filter(move |i| mask & (1 << i) != 0)
}

#[allow(clippy::too_many_arguments)]
fn wrap_body(
    body: &mut MethodBody,
    env: &Env<'_>,
    config: &WeaverConfig,
    boundary: AdviceCollection<'_>,
    masks: Masks,
    main: BlockId,
    symbols: &mut MethodSymbols,
    skip: &mut HashSet<BlockId>,
) -> Result<(BlockId, BlockId)> {
    let ret = env.method.signature.ret.clone();
    let return_local = if ret.is_void() {
        None
    } else {
        Some(body.define_local(ret)?)
    };

    let exit_block = body.new_block();
    let exit = body.add_sequence(exit_block)?;
    {
        let mut writer = body.attach_writer(exit)?;
        if let Some(local) = return_local {
            writer.emit_local(OpCode::Ldloc, local)?;
        }
        writer.emit(OpCode::Ret)?;
    }
    skip.insert(exit_block);
    symbols.return_local = return_local;
    symbols.exit = Some(exit);

    // Success regions run innermost, lowest priority first.
    let mut success = Vec::new();
    for index in lowest_first(masks.success) {
        let block = body.new_block();
        let (region, head) = Region::with_entry(body, block)?;
        success.push((index, region, head));
    }
    let first_target = success.first().map_or(exit, |&(_, _, head)| head);
    let redirected = normalize_returns(body, main, return_local, first_target)?;
    log::trace!("{redirected} return(s) redirected in {}", env.method.name);

    for (position, (index, region, _)) in success.iter().enumerate() {
        env.weave(
            body,
            boundary,
            1 << *index,
            JoinPointKinds::AFTER_METHOD_BODY_SUCCESS,
            JoinPointPosition::After,
            region.advice,
            *symbols,
        )?;
        let next = success.get(position + 1).map_or(exit, |&(_, _, head)| head);
        let seq = region.terminator(body)?;
        body.attach_writer(seq)?.emit_branch(OpCode::Leave, next)?;
        skip.insert(region.block);
    }

    let mut inner = if success.is_empty() {
        main
    } else {
        let mut children = vec![main];
        children.extend(success.iter().map(|(_, region, _)| region.block));
        body.wrap(children)
    };

    let (namespace, name) = &config.root_exception_type;
    let root_exception = env.model.find_type(namespace, name);
    for index in lowest_first(masks.exception) {
        let Some(entry) = boundary.entries().get(index) else {
            continue;
        };
        let typed = entry.advice.as_typed_exception();
        let Some(catch_type) = typed
            .and_then(|t| t.exception_type(env.model))
            .or(root_exception)
        else {
            env.report(
                DiagnosticSeverity::Error,
                DiagnosticCategory::Restructuring,
                format!("exception type {namespace}.{name} not found; exception advice skipped"),
            );
            continue;
        };
        let flow = typed.map(|t| t.exception_flow()).unwrap_or_default();

        let protected = body.wrap(vec![inner]);
        let handler = body.add_handler(protected, HandlerKind::Catch, Some(catch_type))?;
        let exception_local = body.define_local(TypeSig::Class(catch_type))?;
        let (region, head) = Region::with_entry(body, handler)?;
        body.attach_writer(head)?
            .emit_local(OpCode::Stloc, exception_local)?;

        let catch_symbols = MethodSymbols {
            exception_local: Some(exception_local),
            ..*symbols
        };
        env.weave(
            body,
            boundary,
            1 << index,
            JoinPointKinds::AFTER_METHOD_BODY_EXCEPTION,
            JoinPointPosition::After,
            region.advice,
            catch_symbols,
        )?;

        let terminator = region.terminator(body)?;
        {
            let mut writer = body.attach_writer(terminator)?;
            match flow {
                ExceptionFlow::Rethrow => writer.emit(OpCode::Rethrow)?,
                ExceptionFlow::Return => writer.emit_branch(OpCode::Leave, exit)?,
            }
        }
        skip.insert(handler);
        inner = protected;
    }

    for index in lowest_first(masks.always) {
        let protected = body.wrap(vec![inner]);
        let handler = body.add_handler(protected, HandlerKind::Finally, None)?;
        let region = Region::new(body, handler)?;
        env.weave(
            body,
            boundary,
            1 << index,
            JoinPointKinds::AFTER_METHOD_BODY_ALWAYS,
            JoinPointPosition::After,
            region.advice,
            *symbols,
        )?;
        let terminator = region.terminator(body)?;
        body.attach_writer(terminator)?.emit(OpCode::Endfinally)?;
        skip.insert(handler);
        inner = protected;
    }

    Ok((inner, exit_block))
}

/// A generated region: an optional entry sequence, an empty block handed to
/// the advices and, once they ran, a terminator block.
struct Region {
    block: BlockId,
    advice: BlockId,
}

impl Region {
    fn new(body: &mut MethodBody, block: BlockId) -> Result<Self> {
        let advice = body.add_block(block)?;
        Ok(Region { block, advice })
    }

    /// Region whose first sequence, returned alongside, is a branch target or
    /// handler prologue.
    fn with_entry(body: &mut MethodBody, block: BlockId) -> Result<(Self, SequenceId)> {
        let entry = body.add_block(block)?;
        let head = body.add_sequence(entry)?;
        Ok((Self::new(body, block)?, head))
    }

    fn terminator(&self, body: &mut MethodBody) -> Result<SequenceId> {
        let tail = body.add_block(self.block)?;
        body.add_sequence(tail)
    }
}

/// Rewrites every `ret` below `block` into `[stloc local;] leave target`.
fn normalize_returns(
    body: &mut MethodBody,
    block: BlockId,
    local: Option<u16>,
    target: SequenceId,
) -> Result<usize> {
    let mut sequences = Vec::new();
    collect_sequences(body, block, &mut sequences);

    let mut count = 0;
    for seq in sequences {
        if !body
            .sequence(seq)
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::Ret)
        {
            continue;
        }
        let original = std::mem::take(&mut body.sequence_mut(seq).instructions);
        let mut rewritten = Vec::with_capacity(original.len() + 1);
        for insn in original {
            if insn.opcode != OpCode::Ret {
                rewritten.push(insn);
                continue;
            }
            if let Some(local) = local {
                rewritten.push(Instruction::new(OpCode::Stloc, Operand::Local(local))?);
            }
            rewritten.push(Instruction::new(OpCode::Leave, Operand::Target(target))?);
            count += 1;
        }
        body.sequence_mut(seq).instructions = rewritten;
    }
    Ok(count)
}

fn collect_sequences(body: &MethodBody, block: BlockId, out: &mut Vec<SequenceId>) {
    out.extend(body.block(block).sequences().iter().copied());
    for unit in body.unit_blocks(block) {
        collect_sequences(body, unit, out);
    }
}

/// The chained call can only be cut out of plain, unprotected blocks.
fn is_splittable(body: &MethodBody, seq: SequenceId) -> bool {
    let Some(block) = body.sequence(seq).block() else {
        return false;
    };
    body.path_to(block)
        .into_iter()
        .all(|b| !body.is_handler_block(b) && body.block(b).handlers().is_empty())
}

/// Cuts the tree below `top` right before `instructions[at]` of `seq` and
/// returns the detached (head, tail) halves.
fn split_tree_after(
    body: &mut MethodBody,
    top: BlockId,
    seq: SequenceId,
    at: usize,
) -> Result<(BlockId, BlockId)> {
    let tail_seq = body.split_sequence(seq, at)?;
    let leaf = body
        .sequence(seq)
        .block()
        .ok_or_else(|| consistency_error!("split sequence {} lost its block", seq.0))?;

    let sequences = body.block(leaf).sequences().to_vec();
    let cut = sequences
        .iter()
        .position(|&s| s == tail_seq)
        .ok_or_else(|| consistency_error!("split tail {} not in block {}", tail_seq.0, leaf.0))?;
    let symbols = body.block(leaf).local_symbols().to_vec();

    let mut head = body.new_block();
    let mut tail = body.new_block();
    body.take_content(leaf);
    body.set_sequences(head, sequences[..cut].to_vec());
    body.set_sequences(tail, sequences[cut..].to_vec());
    for symbol in &symbols {
        body.add_local_symbol(head, symbol.local, &symbol.name);
        body.add_local_symbol(tail, symbol.local, &symbol.name);
    }

    let mut current = leaf;
    while current != top {
        let parent = body.block(current).parent().ok_or_else(|| {
            Error::UnsupportedShape(format!("block {} is not below block {}", current.0, top.0))
        })?;
        let children = body.block(parent).children().to_vec();
        let index = children
            .iter()
            .position(|&c| c == current)
            .ok_or_else(|| {
                consistency_error!("block {} is not a child of {}", current.0, parent.0)
            })?;

        let mut head_children = children[..index].to_vec();
        head_children.push(head);
        let mut tail_children = vec![tail];
        tail_children.extend_from_slice(&children[index + 1..]);

        body.take_content(parent);
        head = body.wrap(head_children);
        tail = body.wrap(tail_children);
        current = parent;
    }

    Ok((head, tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestModel;

    #[test]
    fn test_classify_constructors() -> Result<()> {
        let model = TestModel::new();
        let base_ctor = model.object_ctor;

        let body = MethodBody::linear(vec![
            Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
            Instruction::new(OpCode::Call, Operand::Token(base_ctor))?,
            Instruction::simple(OpCode::Ret),
        ])?;
        let ctor = model.metadata.method(model.ctor).ok_or(Error::MethodNotFound(model.ctor))?;
        assert_eq!(
            classify_constructor(&model.metadata, ctor, &body),
            ConstructorKind::ChainsToBase
        );

        let chained = MethodBody::linear(vec![
            Instruction::new(OpCode::Ldarg, Operand::Argument(0))?,
            Instruction::new(OpCode::Call, Operand::Token(model.ctor))?,
            Instruction::simple(OpCode::Ret),
        ])?;
        assert_eq!(
            classify_constructor(&model.metadata, ctor, &chained),
            ConstructorKind::ChainsToThis
        );

        let bare = MethodBody::linear(vec![Instruction::simple(OpCode::Ret)])?;
        assert_eq!(
            classify_constructor(&model.metadata, ctor, &bare),
            ConstructorKind::NoChainedCall
        );
        assert_eq!(
            classify_constructor(&model.metadata, model.method(), &bare),
            ConstructorKind::NotConstructor
        );
        Ok(())
    }

    #[test]
    fn test_split_tree_after() -> Result<()> {
        let mut body = MethodBody::new();
        let root = body.root();
        let outer = body.add_block(root)?;
        let first = body.add_block(outer)?;
        let seq = body.add_sequence(first)?;
        body.sequence_mut(seq).instructions.extend([
            Instruction::ldc_i4(1),
            Instruction::simple(OpCode::Pop),
            Instruction::ldc_i4(2),
            Instruction::simple(OpCode::Pop),
        ]);
        let second = body.add_block(outer)?;
        let last = body.add_sequence(second)?;
        body.sequence_mut(last).instructions.push(Instruction::simple(OpCode::Ret));

        let (head, tail) = split_tree_after(&mut body, outer, seq, 2)?;
        body.set_children(root, vec![head, tail]);
        body.verify_structure()?;

        let mut head_seqs = Vec::new();
        collect_sequences(&body, head, &mut head_seqs);
        let mut tail_seqs = Vec::new();
        collect_sequences(&body, tail, &mut tail_seqs);
        assert_eq!(head_seqs, vec![seq]);
        assert_eq!(tail_seqs.len(), 2);
        assert_eq!(body.instruction_count(), 5);
        Ok(())
    }

    #[test]
    fn test_normalize_returns() -> Result<()> {
        let mut body = MethodBody::linear(vec![
            Instruction::ldc_i4(3),
            Instruction::simple(OpCode::Ret),
        ])?;
        let root = body.root();
        let local = body.define_local(TypeSig::I4)?;
        let exit_block = body.new_block();
        let exit = body.add_sequence(exit_block)?;
        let main = body.isolate(root);

        assert_eq!(normalize_returns(&mut body, main, Some(local), exit)?, 1);
        let opcodes: Vec<OpCode> = body.instructions().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![OpCode::LdcI4, OpCode::Stloc, OpCode::Leave]);
        Ok(())
    }
}
