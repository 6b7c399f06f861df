//! Metadata tokens used to reference types, methods, fields and properties.
//!
//! Tokens follow the ECMA-335 layout: the high byte selects the table, the low
//! 24 bits select the (1-based) row. The weaver only ever deals with the four
//! definition tables, so only those have named constructors here.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A metadata token representing a reference to a metadata table entry.
///
/// Tokens in .NET metadata consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table type
/// - The low 24 bits (bits 0-23) indicate the row index within that table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Table id of `TypeDef`
    pub const TYPE_DEF: u8 = 0x02;
    /// Table id of `Field`
    pub const FIELD: u8 = 0x04;
    /// Table id of `MethodDef`
    pub const METHOD_DEF: u8 = 0x06;
    /// Table id of `Property`
    pub const PROPERTY: u8 = 0x17;

    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table id and a row index
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token((u32::from(table) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token points into the `TypeDef` table
    #[must_use]
    pub fn is_type(&self) -> bool {
        self.table() == Self::TYPE_DEF
    }

    /// Returns true if the token points into the `MethodDef` table
    #[must_use]
    pub fn is_method(&self) -> bool {
        self.table() == Self::METHOD_DEF
    }

    /// Returns true if the token points into the `Field` table
    #[must_use]
    pub fn is_field(&self) -> bool {
        self.table() == Self::FIELD
    }

    /// Returns true if the token points into the `Property` table
    #[must_use]
    pub fn is_property(&self) -> bool {
        self.table() == Self::PROPERTY
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_from_parts() {
        let token = Token::from_parts(Token::METHOD_DEF, 7);
        assert_eq!(token.value(), 0x06000007);
        assert_eq!(token.table(), Token::METHOD_DEF);
        assert_eq!(token.row(), 7);
    }

    #[test]
    fn test_token_row_masking() {
        let token = Token::from_parts(Token::FIELD, 0x0100_0001);
        assert_eq!(token.row(), 1);
        assert!(token.is_field());
    }

    #[test]
    fn test_token_table_predicates() {
        assert!(Token::from_parts(Token::TYPE_DEF, 1).is_type());
        assert!(Token::from_parts(Token::METHOD_DEF, 1).is_method());
        assert!(Token::from_parts(Token::PROPERTY, 1).is_property());
        assert!(!Token::from_parts(Token::PROPERTY, 1).is_method());
        assert!(Token::new(0).is_null());
    }

    #[test]
    fn test_token_display() {
        let token = Token(0x04000012);
        assert_eq!(format!("{token}"), "0x04000012");
        assert_eq!(
            format!("{token:?}"),
            "Token(0x04000012, table: 0x04, row: 18)"
        );
    }

    #[test]
    fn test_token_hash() {
        let mut set = HashSet::new();
        set.insert(Token(0x06000001));
        set.insert(Token::from_parts(Token::METHOD_DEF, 1));
        set.insert(Token(0x06000002));
        assert_eq!(set.len(), 2);
    }
}
