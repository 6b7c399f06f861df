//! Side tables the weaving pass keeps about methods.
//!
//! Tags live next to the pass, keyed by token, instead of being attached to
//! the metadata objects.

use std::collections::{HashMap, HashSet};

use crate::metadata::token::Token;

/// Per-method tags of one weaving pass.
#[derive(Debug, Clone, Default)]
pub struct WeaveTags {
    ignored: HashSet<Token>,
    accessors: HashMap<Token, Token>,
}

impl WeaveTags {
    /// Creates empty tables
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Excludes `method` from weaving
    pub fn ignore(&mut self, method: Token) {
        self.ignored.insert(method);
    }

    /// Returns true if `method` must not be woven
    #[must_use]
    pub fn is_ignored(&self, method: Token) -> bool {
        self.ignored.contains(&method)
    }

    /// Records `method` as a synthesized accessor of `field`; accessors are ignored
    pub fn tag_accessor(&mut self, method: Token, field: Token) {
        self.ignored.insert(method);
        self.accessors.insert(method, field);
    }

    /// The field `method` is an accessor of
    #[must_use]
    pub fn accessor_field(&self, method: Token) -> Option<Token> {
        self.accessors.get(&method).copied()
    }

    /// Number of ignored methods
    #[must_use]
    pub fn ignored_count(&self) -> usize {
        self.ignored.len()
    }
}
