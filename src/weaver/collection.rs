//! Participation masks and ordered invocation of one advice bucket.

use crate::{
    assembly::BlockId,
    metadata::diagnostics::{DiagnosticCategory, DiagnosticSeverity},
    weaver::{context::WeavingContext, index::AdviceEntry},
    Error, Result,
};

/// Invocation order of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaveOrder {
    /// Highest priority first: before and instead-of advices
    Direct,
    /// Lowest priority first: after advices
    Inverse,
}

/// A priority-sorted bucket of advices resolved for one join point.
#[derive(Debug, Clone, Copy)]
pub struct AdviceCollection<'e> {
    entries: &'e [AdviceEntry],
}

impl<'e> AdviceCollection<'e> {
    /// Wraps a sorted bucket
    #[must_use]
    pub fn new(entries: &'e [AdviceEntry]) -> Self {
        AdviceCollection { entries }
    }

    /// Returns true if the bucket holds no advice
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The advices, in priority order
    #[must_use]
    pub fn entries(&self) -> &'e [AdviceEntry] {
        self.entries
    }

    /// Bit `i` is set if the `i`-th advice was registered for the join point's
    /// kind and wants to fire there.
    #[must_use]
    pub fn requires_weave(&self, ctx: &WeavingContext<'_>) -> u32 {
        let kind = ctx.join_point().kind;
        self.entries
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, entry)| entry.kinds.contains(kind) && entry.advice.requires_weave(ctx))
            .fold(0u32, |mask, (i, _)| mask | (1 << i))
    }

    /// Invokes the advices selected by `mask` into `block`.
    ///
    /// An advice error becomes an error diagnostic and the remaining advices are
    /// still invoked.
    ///
    /// # Errors
    /// Only internal consistency errors and cancellation are propagated.
    pub fn weave(
        &self,
        mask: u32,
        ctx: &mut WeavingContext<'_>,
        block: BlockId,
        order: WeaveOrder,
    ) -> Result<()> {
        let count = self.entries.len().min(32);
        let indices: Box<dyn Iterator<Item = usize>> = match order {
            WeaveOrder::Direct => Box::new(0..count),
            WeaveOrder::Inverse => Box::new((0..count).rev()),
        };

        for i in indices {
            if mask & (1 << i) == 0 {
                continue;
            }
            let entry = &self.entries[i];
            if let Err(error) = entry.advice.weave(ctx, block) {
                match error {
                    Error::InternalConsistency { .. } | Error::Cancelled => return Err(error),
                    other => ctx.report(
                        DiagnosticSeverity::Error,
                        DiagnosticCategory::Weaving,
                        format!(
                            "advice (priority {}) failed at {:?}: {other}",
                            entry.priority(),
                            ctx.join_point().kind
                        ),
                    ),
                }
            }
        }
        Ok(())
    }
}
