//! In-memory metadata model: types, methods, fields and properties.
//!
//! The weaver treats metadata as lookup data. It is only mutated during the
//! sequential preparation phase of a pass (accessor synthesis, property
//! promotion, static constructor synthesis); while method bodies are woven the
//! model is shared immutably between workers.
//!
//! Name lookups are cached in a [`DashMap`] so concurrent workers resolving the
//! same helper type (e.g. `System.Exception`) pay for the scan once.

use std::fmt;

use bitflags::bitflags;
use dashmap::DashMap;

use crate::{metadata::token::Token, Error, Result};

bitflags! {
    /// Attributes of a type definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// The type derives from `System.ValueType`
        const VALUE_TYPE = 0x0001;
        /// The type is an interface
        const INTERFACE = 0x0002;
        /// The runtime may run the type initializer lazily
        const BEFORE_FIELD_INIT = 0x0004;
        /// The type cannot be derived from
        const SEALED = 0x0008;
        /// The type cannot be instantiated
        const ABSTRACT = 0x0010;
    }
}

bitflags! {
    /// Attributes of a method definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u32 {
        /// The method has no `this` parameter
        const STATIC = 0x0001;
        /// The method is dispatched virtually
        const VIRTUAL = 0x0002;
        /// The method name is special (accessors, constructors)
        const SPECIAL_NAME = 0x0004;
        /// The runtime treats the name specially (constructors)
        const RT_SPECIAL_NAME = 0x0008;
        /// The method has no body
        const ABSTRACT = 0x0010;
        /// The method was synthesized by a compiler or weaver
        const COMPILER_GENERATED = 0x0020;
    }
}

bitflags! {
    /// Attributes of a field definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldFlags: u32 {
        /// The field is per-type rather than per-instance
        const STATIC = 0x0001;
        /// The field may only be written in constructors
        const INIT_ONLY = 0x0002;
        /// The field was removed and only survives as a lookup entry
        const REMOVED = 0x0004;
    }
}

/// A type as seen in signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// No value
    Void,
    /// `bool`
    Boolean,
    /// `int32`
    I4,
    /// `int64`
    I8,
    /// `string`
    String,
    /// `object`
    Object,
    /// A reference type defined in the model
    Class(Token),
    /// A value type defined in the model
    ValueType(Token),
    /// A single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
}

impl TypeSig {
    /// Returns true for [`TypeSig::Void`]
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSig::Void)
    }

    /// Returns true if values of this type are copied by value
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            TypeSig::Boolean | TypeSig::I4 | TypeSig::I8 | TypeSig::ValueType(_)
        )
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Boolean => write!(f, "bool"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::Class(token) => write!(f, "class {token}"),
            TypeSig::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSig::SzArray(element) => write!(f, "{element}[]"),
        }
    }
}

/// Calling signature of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Whether the method takes an implicit `this` argument
    pub has_this: bool,
    /// Declared parameters, excluding `this`
    pub params: Vec<TypeSig>,
    /// Return type
    pub ret: TypeSig,
}

impl MethodSignature {
    /// Signature of an instance method
    #[must_use]
    pub fn instance(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        MethodSignature {
            has_this: true,
            params,
            ret,
        }
    }

    /// Signature of a static method
    #[must_use]
    pub fn new_static(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        MethodSignature {
            has_this: false,
            params,
            ret,
        }
    }

    /// Number of argument slots, including `this`
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }
}

/// A type definition.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Token of the definition
    pub token: Token,
    /// Namespace, empty for the global namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Base type, `None` for `System.Object` and interfaces
    pub base: Option<Token>,
    /// Attributes
    pub flags: TypeFlags,
}

impl TypeDef {
    /// `Namespace.Name`, or `Name` in the global namespace
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Returns true for value types
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.flags.contains(TypeFlags::VALUE_TYPE)
    }
}

/// A method definition.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Token of the definition
    pub token: Token,
    /// Owning type
    pub declaring_type: Token,
    /// Name, `.ctor` / `.cctor` for constructors
    pub name: String,
    /// Calling signature
    pub signature: MethodSignature,
    /// Attributes
    pub flags: MethodFlags,
}

impl MethodDef {
    /// Returns true if the method has no `this`
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Returns true for instance constructors
    #[must_use]
    pub fn is_instance_constructor(&self) -> bool {
        self.name == ".ctor" && !self.is_static()
    }

    /// Returns true for the type initializer
    #[must_use]
    pub fn is_static_constructor(&self) -> bool {
        self.name == ".cctor" && self.is_static()
    }
}

/// A field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Token of the definition
    pub token: Token,
    /// Owning type
    pub declaring_type: Token,
    /// Name
    pub name: String,
    /// Type of the stored value
    pub field_type: TypeSig,
    /// Attributes
    pub flags: FieldFlags,
}

impl FieldDef {
    /// Returns true for static fields
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    /// Returns true once the field lost its storage
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.flags.contains(FieldFlags::REMOVED)
    }
}

/// A property definition tying accessor methods together.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    /// Token of the definition
    pub token: Token,
    /// Owning type
    pub declaring_type: Token,
    /// Name
    pub name: String,
    /// Type of the property
    pub property_type: TypeSig,
    /// `get_` accessor
    pub getter: Option<Token>,
    /// `set_` accessor
    pub setter: Option<Token>,
}

/// The metadata of one module.
#[derive(Debug, Clone, Default)]
pub struct MetadataModel {
    types: Vec<TypeDef>,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
    properties: Vec<PropertyDef>,
    type_cache: DashMap<(String, String), Option<Token>>,
    method_cache: DashMap<(Token, String), Option<Token>>,
}

fn row_index(token: Token, table: u8) -> Option<usize> {
    if token.table() != table || token.row() == 0 {
        return None;
    }
    Some(token.row() as usize - 1)
}

fn next_token(table: u8, len: usize) -> Token {
    Token::from_parts(table, u32::try_from(len + 1).unwrap_or(0x00FF_FFFF))
}

impl MetadataModel {
    /// Creates an empty model
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type definition and returns its token.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        base: Option<Token>,
        flags: TypeFlags,
    ) -> Token {
        let token = next_token(Token::TYPE_DEF, self.types.len());
        self.types.push(TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            base,
            flags,
        });
        self.type_cache.clear();
        token
    }

    /// Adds a method definition and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `declaring_type` is not defined.
    pub fn add_method(
        &mut self,
        declaring_type: Token,
        name: &str,
        signature: MethodSignature,
        flags: MethodFlags,
    ) -> Result<Token> {
        if self.type_def(declaring_type).is_none() {
            return Err(Error::TypeNotFound(declaring_type.to_string()));
        }
        let token = next_token(Token::METHOD_DEF, self.methods.len());
        self.methods.push(MethodDef {
            token,
            declaring_type,
            name: name.to_string(),
            signature,
            flags,
        });
        self.method_cache.clear();
        Ok(token)
    }

    /// Adds a field definition and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `declaring_type` is not defined.
    pub fn add_field(
        &mut self,
        declaring_type: Token,
        name: &str,
        field_type: TypeSig,
        flags: FieldFlags,
    ) -> Result<Token> {
        if self.type_def(declaring_type).is_none() {
            return Err(Error::TypeNotFound(declaring_type.to_string()));
        }
        let token = next_token(Token::FIELD, self.fields.len());
        self.fields.push(FieldDef {
            token,
            declaring_type,
            name: name.to_string(),
            field_type,
            flags,
        });
        Ok(token)
    }

    /// Adds a property definition and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `declaring_type` is not defined.
    pub fn add_property(
        &mut self,
        declaring_type: Token,
        name: &str,
        property_type: TypeSig,
        getter: Option<Token>,
        setter: Option<Token>,
    ) -> Result<Token> {
        if self.type_def(declaring_type).is_none() {
            return Err(Error::TypeNotFound(declaring_type.to_string()));
        }
        let token = next_token(Token::PROPERTY, self.properties.len());
        self.properties.push(PropertyDef {
            token,
            declaring_type,
            name: name.to_string(),
            property_type,
            getter,
            setter,
        });
        Ok(token)
    }

    /// Renames a field.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] for an unknown token.
    pub fn rename_field(&mut self, field: Token, name: &str) -> Result<()> {
        let index = row_index(field, Token::FIELD).ok_or(Error::FieldNotFound(field))?;
        let def = self
            .fields
            .get_mut(index)
            .ok_or(Error::FieldNotFound(field))?;
        def.name = name.to_string();
        Ok(())
    }

    /// Marks a field as removed. Its token stays resolvable.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] for an unknown token.
    pub fn remove_field(&mut self, field: Token) -> Result<()> {
        let index = row_index(field, Token::FIELD).ok_or(Error::FieldNotFound(field))?;
        let def = self
            .fields
            .get_mut(index)
            .ok_or(Error::FieldNotFound(field))?;
        def.flags |= FieldFlags::REMOVED;
        Ok(())
    }

    /// Clears attributes of a type.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for an unknown token.
    pub fn clear_type_flags(&mut self, ty: Token, flags: TypeFlags) -> Result<()> {
        let index =
            row_index(ty, Token::TYPE_DEF).ok_or_else(|| Error::TypeNotFound(ty.to_string()))?;
        let def = self
            .types
            .get_mut(index)
            .ok_or_else(|| Error::TypeNotFound(ty.to_string()))?;
        def.flags.remove(flags);
        Ok(())
    }

    /// Resolves a type token
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        row_index(token, Token::TYPE_DEF).and_then(|i| self.types.get(i))
    }

    /// Resolves a method token
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        row_index(token, Token::METHOD_DEF).and_then(|i| self.methods.get(i))
    }

    /// Resolves a field token
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        row_index(token, Token::FIELD).and_then(|i| self.fields.get(i))
    }

    /// Resolves a property token
    #[must_use]
    pub fn property(&self, token: Token) -> Option<&PropertyDef> {
        row_index(token, Token::PROPERTY).and_then(|i| self.properties.get(i))
    }

    /// All type definitions
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.iter()
    }

    /// All method definitions
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter()
    }

    /// All field definitions
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    /// All property definitions
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.iter()
    }

    /// Methods declared by `ty`
    pub fn methods_of(&self, ty: Token) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter().filter(move |m| m.declaring_type == ty)
    }

    /// Finds a type by namespace and name.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<Token> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(hit) = self.type_cache.get(&key) {
            return *hit;
        }

        let found = self
            .types
            .iter()
            .find(|t| t.namespace == namespace && t.name == name)
            .map(|t| t.token);
        self.type_cache.insert(key, found);
        found
    }

    /// Finds a method of `ty` by name and, optionally, signature.
    ///
    /// Without a signature the first method with a matching name wins.
    #[must_use]
    pub fn find_method(
        &self,
        ty: Token,
        name: &str,
        signature: Option<&MethodSignature>,
    ) -> Option<Token> {
        match signature {
            Some(sig) => self
                .methods_of(ty)
                .find(|m| m.name == name && &m.signature == sig)
                .map(|m| m.token),
            None => {
                let key = (ty, name.to_string());
                if let Some(hit) = self.method_cache.get(&key) {
                    return *hit;
                }
                let found = self
                    .methods_of(ty)
                    .find(|m| m.name == name)
                    .map(|m| m.token);
                self.method_cache.insert(key, found);
                found
            }
        }
    }

    /// Finds a field of `ty` by name.
    #[must_use]
    pub fn find_field(&self, ty: Token, name: &str) -> Option<Token> {
        self.fields
            .iter()
            .find(|f| f.declaring_type == ty && f.name == name)
            .map(|f| f.token)
    }

    /// Instance constructors of `ty`
    #[must_use]
    pub fn instance_constructors(&self, ty: Token) -> Vec<Token> {
        self.methods_of(ty)
            .filter(|m| m.is_instance_constructor())
            .map(|m| m.token)
            .collect()
    }

    /// The type initializer of `ty`, if it has one
    #[must_use]
    pub fn static_constructor(&self, ty: Token) -> Option<Token> {
        self.methods_of(ty)
            .find(|m| m.is_static_constructor())
            .map(|m| m.token)
    }

    /// Returns true if `from` is `to` or derives from it.
    #[must_use]
    pub fn is_assignable(&self, from: Token, to: Token) -> bool {
        let mut current = Some(from);
        let mut depth = 0;
        while let Some(ty) = current {
            if ty == to {
                return true;
            }
            depth += 1;
            if depth > self.types.len() {
                return false;
            }
            current = self.type_def(ty).and_then(|t| t.base);
        }
        false
    }

    /// Returns true if `ty` is a value type
    #[must_use]
    pub fn is_value_type(&self, ty: Token) -> bool {
        self.type_def(ty).is_some_and(TypeDef::is_value_type)
    }
}
