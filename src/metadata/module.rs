//! A module under weaving: metadata plus the method bodies it defines.

use std::collections::HashMap;

use crate::{
    assembly::MethodBody,
    metadata::{model::MetadataModel, token::Token},
    Error, Result,
};

/// Metadata and method bodies of one module.
///
/// Bodies are keyed by method token. Methods without an entry (abstract,
/// runtime-provided or external) are never woven.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Type, method, field and property definitions
    pub metadata: MetadataModel,
    bodies: HashMap<Token, MethodBody>,
}

impl Module {
    /// Creates a module without bodies
    #[must_use]
    pub fn new(metadata: MetadataModel) -> Self {
        Module {
            metadata,
            bodies: HashMap::new(),
        }
    }

    /// Sets (or replaces) the body of `method`.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the method is not defined.
    pub fn set_body(&mut self, method: Token, body: MethodBody) -> Result<()> {
        if self.metadata.method(method).is_none() {
            return Err(Error::MethodNotFound(method));
        }
        self.bodies.insert(method, body);
        Ok(())
    }

    /// Body of `method`, if it has one
    #[must_use]
    pub fn body(&self, method: Token) -> Option<&MethodBody> {
        self.bodies.get(&method)
    }

    /// Mutable body of `method`, if it has one
    pub fn body_mut(&mut self, method: Token) -> Option<&mut MethodBody> {
        self.bodies.get_mut(&method)
    }

    /// Tokens of all methods that have a body, in token order
    #[must_use]
    pub fn methods_with_bodies(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.bodies.keys().copied().collect();
        tokens.sort();
        tokens
    }

    /// Splits the module into its metadata and its bodies, so bodies can be
    /// mutated concurrently while the metadata is shared.
    pub(crate) fn parts_mut(&mut self) -> (&MetadataModel, &mut HashMap<Token, MethodBody>) {
        (&self.metadata, &mut self.bodies)
    }
}
