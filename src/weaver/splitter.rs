//! Splitting a block around one join-point instruction.
//!
//! The block `B` holding the instruction is replaced by up to five siblings:
//!
//! | block | holds                                       | traversed |
//! |-------|---------------------------------------------|-----------|
//! | UB    | sequences before the instruction            | already   |
//! | AB    | before-advice code                          | never     |
//! | IB/OB | instead-of advice code, or the instruction  | never     |
//! | AA    | after-advice code                           | never     |
//! | UA    | sequences after the instruction             | next      |
//!
//! Generated blocks hold an empty entry sequence (the branch redirect target)
//! in a first child block and hand the advices a second, empty child block,
//! so an advice may emit sequences or build its own nested blocks.
//!
//! `B` itself survives as the parent of the siblings when it carries scope
//! (handlers, local symbols, a handler role) or is the root; otherwise the
//! siblings take its place in its parent. Branches into the sequence that
//! started with the instruction are redirected to the first generated
//! sequence so jumps run the advices too.

use crate::{
    assembly::{BlockId, Instruction, SequenceId},
    weaver::{
        collection::{AdviceCollection, WeaveOrder},
        context::WeavingContext,
        joinpoint::{JoinPoint, JoinPointKinds, JoinPointPosition},
        state::{MethodWeaver, WeaveState},
    },
    Result,
};

/// One bucket resolved for the join point, with its participation mask.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketMatch<'e> {
    pub kind: JoinPointKinds,
    pub position: JoinPointPosition,
    pub collection: AdviceCollection<'e>,
    pub mask: u32,
}

/// A join point that has at least one participating advice.
#[derive(Debug)]
pub(crate) struct SpliceSite<'e> {
    pub sequence: SequenceId,
    pub offset: usize,
    pub template: JoinPoint,
    pub next: Option<Instruction>,
    pub before: BucketMatch<'e>,
    pub instead: BucketMatch<'e>,
    pub after: BucketMatch<'e>,
    pub completes_init: bool,
}

struct Generated {
    block: BlockId,
    head: SequenceId,
    advice: BlockId,
}

impl MethodWeaver<'_> {
    fn advice_block(&mut self) -> Result<Generated> {
        let block = self.body.new_block();
        let entry = self.body.add_block(block)?;
        let head = self.body.add_sequence(entry)?;
        let advice = self.body.add_block(block)?;
        Ok(Generated {
            block,
            head,
            advice,
        })
    }

    /// Splices the advices of `site` around its instruction and returns the
    /// state resuming after it.
    ///
    /// # Errors
    /// Returns an internal consistency error if the reader is not positioned on
    /// the instruction.
    pub(crate) fn splice(&mut self, site: SpliceSite<'_>) -> Result<WeaveState> {
        let block = self.current_block()?;
        let original = site.sequence;
        self.reader.leave_sequence();

        let suffix = self.body.split_sequence(original, site.offset + 1)?;
        let matched = if site.offset > 0 {
            self.body.split_sequence(original, site.offset)?
        } else {
            original
        };

        let sequences = self.body.block(block).sequences().to_vec();
        let position = |seq: SequenceId| {
            sequences
                .iter()
                .position(|&s| s == seq)
                .ok_or_else(|| consistency_error!("sequence {} left block {}", seq.0, block.0))
        };
        let unchanged_before = sequences[..position(matched)?].to_vec();
        let mut unchanged_after = sequences[position(suffix)?..].to_vec();

        let advice_before = if site.before.mask != 0 {
            Some(self.advice_block()?)
        } else {
            None
        };
        let replaced = site.instead.mask != 0;
        let center = if replaced {
            self.advice_block()?
        } else {
            let block = self.body.new_block();
            Generated {
                block,
                head: matched,
                advice: block,
            }
        };
        let advice_after = if site.after.mask != 0 {
            Some(self.body.new_block())
        } else {
            None
        };

        // Only the original sequence can be a branch target.
        if site.offset == 0 {
            let entry = advice_before.as_ref().map_or(center.head, |g| g.head);
            if entry != matched {
                let redirected = self.body.redirect_branches(matched, entry);
                log::trace!(
                    "{}: {redirected} branch(es) redirected to advice code",
                    self.method.name
                );
            }
        }
        if self.body.sequence(suffix).instructions.is_empty() {
            unchanged_after.retain(|&s| s != suffix);
            self.body.detach_sequence(suffix);
        }
        if replaced {
            self.body.detach_sequence(matched);
        }

        self.body.take_content(block);
        let mut siblings = Vec::with_capacity(5);
        if !unchanged_before.is_empty() {
            let ub = self.body.new_block();
            self.body.set_sequences(ub, unchanged_before);
            siblings.push(ub);
        }
        if let Some(generated) = &advice_before {
            siblings.push(generated.block);
            self.skip.insert(generated.block);
        }
        if !replaced {
            self.body.set_sequences(center.block, vec![matched]);
        }
        siblings.push(center.block);
        self.skip.insert(center.block);
        if let Some(aa) = advice_after {
            siblings.push(aa);
            self.skip.insert(aa);
        }
        let resume = if unchanged_after.is_empty() {
            None
        } else {
            let ua = self.body.new_block();
            self.body.set_sequences(ua, unchanged_after);
            siblings.push(ua);
            Some(ua)
        };
        let last = siblings.last().copied().unwrap_or(center.block);

        let b = self.body.block(block);
        let keeps_scope = block == self.body.root()
            || self.body.is_handler_block(block)
            || !b.handlers().is_empty()
            || !b.local_symbols().is_empty();
        if keeps_scope {
            self.body.set_children(block, siblings);
        } else {
            self.body.replace_in_parent(block, siblings)?;
            self.stack.pop();
            self.reader.leave_block(block)?;
        }

        let consumed = self.invoke(
            &site,
            advice_before.map(|g| g.advice),
            replaced.then_some(center.advice),
            advice_after,
        )?;
        if consumed {
            let instructions = &mut self.body.sequence_mut(suffix).instructions;
            if !instructions.is_empty() {
                instructions.remove(0);
            }
        }
        self.splices += 1;

        Ok(match resume {
            Some(ua) => WeaveState::BeforeBlock(ua),
            None => self.advance_from(last),
        })
    }

    /// Invokes the three buckets; returns true if an advice consumed the
    /// following instruction.
    fn invoke(
        &mut self,
        site: &SpliceSite<'_>,
        before: Option<BlockId>,
        instead: Option<BlockId>,
        after: Option<BlockId>,
    ) -> Result<bool> {
        let mut ctx = self.context(site.template.clone(), site.next.clone(), false);
        weave_bucket(&mut ctx, site, &site.before, before, WeaveOrder::Direct)?;
        weave_bucket(&mut ctx, site, &site.instead, instead, WeaveOrder::Direct)?;
        if site.completes_init {
            ctx.set_initialized(true);
        }
        weave_bucket(&mut ctx, site, &site.after, after, WeaveOrder::Inverse)?;
        Ok(ctx.next_consumed())
    }
}

fn weave_bucket(
    ctx: &mut WeavingContext<'_>,
    site: &SpliceSite<'_>,
    matched: &BucketMatch<'_>,
    block: Option<BlockId>,
    order: WeaveOrder,
) -> Result<()> {
    let Some(block) = block else {
        return Ok(());
    };
    ctx.set_join_point(JoinPoint {
        kind: matched.kind,
        position: matched.position,
        ..site.template.clone()
    });
    matched.collection.weave(matched.mask, ctx, block, order)
}
