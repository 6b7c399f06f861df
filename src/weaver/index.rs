//! The advice index: method → join-point kind → operand → ordered advices.
//!
//! Building the index is two-phase. Registrations are collected with
//! [`MethodLevelAdvices::add`] in any order; [`MethodLevelAdvices::merge_and_sort`]
//! then runs once per method, before any lookup, to make operand-less advices
//! visible in every operand bucket and to put every bucket in composition order.
//! Lookups after that point are plain slice borrows.

use std::{collections::HashMap, sync::Arc};

use crate::{
    metadata::{
        diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
        token::Token,
    },
    weaver::{advice::Advice, joinpoint::JoinPointKinds},
    Error, Result,
};

/// Maximum number of advices in one bucket; participation is tracked in a `u32`.
pub const MAX_ADVICES_PER_KIND: usize = 32;

/// One registration of an advice.
#[derive(Clone)]
pub struct AdviceEntry {
    /// The advice
    pub advice: Arc<dyn Advice>,
    /// Kinds the advice was registered for
    pub kinds: JoinPointKinds,
    /// Registration sequence number, the tie breaker between equal priorities
    pub order: u64,
}

impl AdviceEntry {
    /// Priority of the advice
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.advice.priority()
    }
}

impl std::fmt::Debug for AdviceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdviceEntry")
            .field("priority", &self.priority())
            .field("kinds", &self.kinds)
            .field("order", &self.order)
            .finish()
    }
}

/// The advices of one (method, kind) pair, split by operand.
#[derive(Debug, Clone, Default)]
pub struct AdvicePerKindCollection {
    universal: Vec<AdviceEntry>,
    by_operand: HashMap<Token, Vec<AdviceEntry>>,
}

impl AdvicePerKindCollection {
    fn bucket_mut(&mut self, operand: Option<Token>) -> &mut Vec<AdviceEntry> {
        match operand {
            Some(token) => self.by_operand.entry(token).or_default(),
            None => &mut self.universal,
        }
    }

    fn add(&mut self, entry: AdviceEntry, operand: Option<Token>) -> bool {
        let bucket = self.bucket_mut(operand);
        if bucket.len() >= MAX_ADVICES_PER_KIND {
            return false;
        }
        bucket.push(entry);
        true
    }

    /// Advices for `operand`, falling back to the operand-less ones
    #[must_use]
    pub fn get(&self, operand: Option<Token>) -> &[AdviceEntry] {
        operand
            .and_then(|token| self.by_operand.get(&token))
            .unwrap_or(&self.universal)
    }

    /// Returns true if no advice is registered at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.universal.is_empty() && self.by_operand.values().all(Vec::is_empty)
    }

    /// Merges universal advices into every operand bucket and sorts every bucket.
    ///
    /// Returns the operands whose merged bucket overflowed and was truncated.
    fn merge_and_sort(&mut self) -> Vec<(Option<Token>, usize)> {
        let mut overflows = Vec::new();

        sort_bucket(&mut self.universal);
        for (&token, bucket) in &mut self.by_operand {
            bucket.extend(self.universal.iter().cloned());
            sort_bucket(bucket);
            bucket.dedup_by_key(|entry| entry.order);
            if bucket.len() > MAX_ADVICES_PER_KIND {
                overflows.push((Some(token), bucket.len()));
                bucket.truncate(MAX_ADVICES_PER_KIND);
            }
        }
        overflows.sort_by_key(|(token, _)| *token);
        overflows
    }
}

fn sort_bucket(bucket: &mut [AdviceEntry]) {
    bucket.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.order.cmp(&b.order))
    });
}

/// The bucket a registered kind is stored under.
#[must_use]
pub fn bucket_kind(kind: JoinPointKinds) -> JoinPointKinds {
    if JoinPointKinds::METHOD_BOUNDARY.contains(kind) {
        JoinPointKinds::AFTER_METHOD_BODY_ALWAYS
    } else {
        kind
    }
}

/// All advices registered on one method.
#[derive(Debug, Clone)]
pub struct MethodLevelAdvices {
    method: Token,
    buckets: HashMap<JoinPointKinds, AdvicePerKindCollection>,
    kinds: JoinPointKinds,
    merged: bool,
}

impl MethodLevelAdvices {
    /// Creates an empty set for `method`
    #[must_use]
    pub fn new(method: Token) -> Self {
        MethodLevelAdvices {
            method,
            buckets: HashMap::new(),
            kinds: JoinPointKinds::empty(),
            merged: false,
        }
    }

    /// The method the advices belong to
    #[must_use]
    pub fn method(&self) -> Token {
        self.method
    }

    /// Union of all bucket kinds holding at least one advice
    #[must_use]
    pub fn kinds(&self) -> JoinPointKinds {
        self.kinds
    }

    /// Returns true once [`MethodLevelAdvices::merge_and_sort`] ran
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.merged
    }

    /// Registers `entry` for each of its kinds.
    ///
    /// The method-boundary kinds share one bucket and the entry lands there at
    /// most once per call. A full bucket rejects the entry for that kind only;
    /// the other kinds are still registered.
    ///
    /// # Errors
    /// Returns [`Error::TooManyAdvices`] for the first full bucket.
    pub fn add(&mut self, entry: AdviceEntry, operand: Option<Token>) -> Result<()> {
        let mut boundary_added = false;
        let mut first_error = None;

        for kind in entry.kinds.single_kinds() {
            let bucket = bucket_kind(kind);
            if bucket != kind {
                if boundary_added {
                    continue;
                }
                boundary_added = true;
            }

            // The boundary bucket is keyed by method only.
            let key = if bucket == JoinPointKinds::AFTER_METHOD_BODY_ALWAYS {
                None
            } else {
                operand
            };

            let collection = self.buckets.entry(bucket).or_default();
            if collection.add(entry.clone(), key) {
                self.kinds |= bucket;
                self.merged = false;
            } else if first_error.is_none() {
                first_error = Some(Error::TooManyAdvices {
                    method: self.method,
                    kind: bucket,
                    operand: key,
                });
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Merges and sorts every bucket; overflowing buckets are truncated to the
    /// [`MAX_ADVICES_PER_KIND`] highest-priority advices and reported.
    pub fn merge_and_sort(&mut self, diagnostics: &Diagnostics) {
        if self.merged {
            return;
        }

        let mut kinds: Vec<JoinPointKinds> = self.buckets.keys().copied().collect();
        kinds.sort();
        for kind in kinds {
            let Some(collection) = self.buckets.get_mut(&kind) else {
                continue;
            };
            for (operand, count) in collection.merge_and_sort() {
                let mut diagnostic = Diagnostic::new(
                    DiagnosticSeverity::Error,
                    DiagnosticCategory::Registration,
                    format!(
                        "{count} advices apply to {kind:?}; only the {MAX_ADVICES_PER_KIND} \
                         highest-priority ones are woven"
                    ),
                )
                .with_method(self.method);
                if let Some(operand) = operand {
                    diagnostic = diagnostic.with_token(operand);
                }
                diagnostics.push(diagnostic);
            }
        }
        self.merged = true;
    }

    /// Ordered advices of `kind` for `operand`
    #[must_use]
    pub fn get_advices(&self, kind: JoinPointKinds, operand: Option<Token>) -> &[AdviceEntry] {
        if !self.kinds.intersects(kind) {
            return &[];
        }
        self.buckets
            .get(&kind)
            .map_or(&[], |collection| collection.get(operand))
    }

    /// Ordered advices of the shared method-boundary bucket
    #[must_use]
    pub fn boundary_advices(&self) -> &[AdviceEntry] {
        self.get_advices(JoinPointKinds::AFTER_METHOD_BODY_ALWAYS, None)
    }

    /// Returns true if any method-level kind (boundary or constructor hook) is registered
    #[must_use]
    pub fn has_method_level(&self) -> bool {
        self.kinds.intersects(JoinPointKinds::WHOLE_METHOD)
    }
}

/// Advices of every method in the pass.
#[derive(Debug, Clone, Default)]
pub struct AdviceIndex {
    methods: HashMap<Token, MethodLevelAdvices>,
    next_order: u64,
}

impl AdviceIndex {
    /// Creates an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `advice` on `method` for `kinds`, optionally restricted to `operand`.
    ///
    /// # Errors
    /// Returns [`Error::TooManyAdvices`] when a bucket is full.
    pub fn add(
        &mut self,
        method: Token,
        advice: Arc<dyn Advice>,
        kinds: JoinPointKinds,
        operand: Option<Token>,
    ) -> Result<()> {
        let entry = AdviceEntry {
            advice,
            kinds,
            order: self.next_order,
        };
        self.next_order += 1;
        self.methods
            .entry(method)
            .or_insert_with(|| MethodLevelAdvices::new(method))
            .add(entry, operand)
    }

    /// Advices of `method`
    #[must_use]
    pub fn method(&self, method: Token) -> Option<&MethodLevelAdvices> {
        self.methods.get(&method)
    }

    /// Methods with at least one registration, in token order
    #[must_use]
    pub fn methods(&self) -> Vec<Token> {
        let mut methods: Vec<Token> = self.methods.keys().copied().collect();
        methods.sort();
        methods
    }

    /// Number of methods with registrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Runs [`MethodLevelAdvices::merge_and_sort`] on every method
    pub fn merge_and_sort(&mut self, diagnostics: &Diagnostics) {
        for advices in self.methods.values_mut() {
            advices.merge_and_sort(diagnostics);
        }
    }

    /// Removes and returns the advices of `method`
    pub fn take(&mut self, method: Token) -> Option<MethodLevelAdvices> {
        self.methods.remove(&method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MarkerAdvice;

    fn method() -> Token {
        Token::from_parts(Token::METHOD_DEF, 1)
    }

    fn field(row: u32) -> Token {
        Token::from_parts(Token::FIELD, row)
    }

    fn priorities(entries: &[AdviceEntry]) -> Vec<i32> {
        entries.iter().map(AdviceEntry::priority).collect()
    }

    #[test]
    fn test_cap_is_32() {
        let mut index = AdviceIndex::new();
        for i in 0..MAX_ADVICES_PER_KIND {
            assert!(index
                .add(method(), MarkerAdvice::arc(0, i as i32), JoinPointKinds::BEFORE_CALL, None)
                .is_ok());
        }
        let result = index.add(
            method(),
            MarkerAdvice::arc(0, 99),
            JoinPointKinds::BEFORE_CALL,
            None,
        );
        assert!(matches!(result, Err(Error::TooManyAdvices { operand: None, .. })));
    }

    #[test]
    fn test_full_bucket_keeps_other_kinds() {
        let mut advices = MethodLevelAdvices::new(method());
        for order in 0..MAX_ADVICES_PER_KIND as u64 {
            let entry = AdviceEntry {
                advice: MarkerAdvice::arc(0, 0),
                kinds: JoinPointKinds::BEFORE_CALL,
                order,
            };
            assert!(advices.add(entry, None).is_ok());
        }
        let entry = AdviceEntry {
            advice: MarkerAdvice::arc(0, 1),
            kinds: JoinPointKinds::BEFORE_CALL | JoinPointKinds::AFTER_CALL,
            order: 100,
        };
        assert!(advices.add(entry, None).is_err());
        assert_eq!(advices.get_advices(JoinPointKinds::AFTER_CALL, None).len(), 1);
    }

    #[test]
    fn test_boundary_kinds_collapse_once() {
        let mut index = AdviceIndex::new();
        index
            .add(
                method(),
                MarkerAdvice::arc(1, 1),
                JoinPointKinds::BEFORE_METHOD_BODY
                    | JoinPointKinds::AFTER_METHOD_BODY_SUCCESS
                    | JoinPointKinds::AFTER_METHOD_BODY_ALWAYS
                    | JoinPointKinds::AFTER_INSTANCE_INITIALIZATION,
                None,
            )
            .ok();
        let advices = index.method(method()).map(|m| m.boundary_advices().len());
        assert_eq!(advices, Some(1));
    }

    #[test]
    fn test_merge_and_sort_orders_by_priority_then_registration() {
        let diagnostics = Diagnostics::new();
        let mut index = AdviceIndex::new();
        let f = field(1);
        index
            .add(
                method(),
                MarkerAdvice::arc(5, 1),
                JoinPointKinds::BEFORE_GET_FIELD,
                Some(f),
            )
            .ok();
        index.add(method(), MarkerAdvice::arc(10, 2), JoinPointKinds::BEFORE_GET_FIELD, None).ok();
        index.add(method(), MarkerAdvice::arc(5, 3), JoinPointKinds::BEFORE_GET_FIELD, None).ok();
        index.merge_and_sort(&diagnostics);

        let advices = index.method(method()).map(|m| {
            (
                priorities(m.get_advices(JoinPointKinds::BEFORE_GET_FIELD, Some(f))),
                priorities(m.get_advices(JoinPointKinds::BEFORE_GET_FIELD, Some(field(2)))),
                m.get_advices(JoinPointKinds::BEFORE_GET_FIELD, Some(f))
                    .iter()
                    .map(|e| e.order)
                    .collect::<Vec<_>>(),
            )
        });
        let (specific, fallback, orders) = advices.unwrap_or_default();
        assert_eq!(specific, vec![10, 5, 5]);
        assert_eq!(fallback, vec![10, 5]);
        assert_eq!(orders, vec![1, 0, 2]);
        assert!(!diagnostics.has_any());
    }

    #[test]
    fn test_merge_overflow_keeps_highest() {
        let diagnostics = Diagnostics::new();
        let mut advices = MethodLevelAdvices::new(method());
        let f = field(7);
        let mut order = 0;
        for p in 0..20 {
            let entry = AdviceEntry {
                advice: MarkerAdvice::arc(p, p),
                kinds: JoinPointKinds::AFTER_SET_FIELD,
                order,
            };
            order += 1;
            advices.add(entry, Some(f)).ok();
            let entry = AdviceEntry {
                advice: MarkerAdvice::arc(100 + p, p),
                kinds: JoinPointKinds::AFTER_SET_FIELD,
                order,
            };
            order += 1;
            advices.add(entry, None).ok();
        }
        advices.merge_and_sort(&diagnostics);

        let merged = advices.get_advices(JoinPointKinds::AFTER_SET_FIELD, Some(f));
        assert_eq!(merged.len(), MAX_ADVICES_PER_KIND);
        assert_eq!(merged[0].priority(), 119);
        assert_eq!(merged[31].priority(), 8);
        assert_eq!(diagnostics.error_count(), 1);
        assert!(advices.is_merged());
    }

    #[test]
    fn test_unregistered_kind_is_empty() {
        let advices = MethodLevelAdvices::new(method());
        assert!(advices.get_advices(JoinPointKinds::INSTEAD_OF_CALL, None).is_empty());
        assert!(!advices.has_method_level());
    }
}
