//! Runtime values and the managed heap of the evaluator.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    metadata::{
        model::{MetadataModel, TypeSig},
        token::Token,
    },
    Error, Result,
};

/// A storage location an address value points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Local `index` of the frame at call depth `frame`
    Local {
        /// Call depth of the owning frame
        frame: usize,
        /// Local index
        index: u16,
    },
    /// Argument `index` of the frame at call depth `frame`
    Argument {
        /// Call depth of the owning frame
        frame: usize,
        /// Argument index, `this` included
        index: u16,
    },
    /// Instance field of a heap object
    Field {
        /// Heap index of the object
        object: usize,
        /// The field
        field: Token,
    },
    /// Field of a value-type value stored at `base`
    StructField {
        /// Location of the containing value
        base: Box<Address>,
        /// The field
        field: Token,
    },
    /// Static field
    Static(Token),
    /// Array element
    Element {
        /// Heap index of the array
        array: usize,
        /// Element index
        index: usize,
    },
}

/// A value on the evaluation stack or in a storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// The null reference
    Null,
    /// 32-bit integer (also booleans)
    I4(i32),
    /// 64-bit integer
    I8(i64),
    /// String reference
    Str(Arc<str>),
    /// Reference to a heap object
    Obj(usize),
    /// Reference to a heap array
    Array(usize),
    /// Managed pointer
    Addr(Address),
    /// Unboxed value-type instance
    Struct {
        /// The value type
        ty: Token,
        /// Instance field values
        fields: BTreeMap<Token, Value>,
    },
}

impl Value {
    /// Integer view of the value, widened to 64 bits
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I4(v) => Some(i64::from(*v)),
            Value::I8(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as `int32`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for non-integer values.
    pub fn as_i4(&self) -> Result<i32> {
        match self {
            Value::I4(v) => Ok(*v),
            other => Err(Error::Emulation(format!("expected int32, got {other}"))),
        }
    }

    /// Truth value as tested by `brtrue`
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I4(v) => *v != 0,
            Value::I8(v) => *v != 0,
            _ => true,
        }
    }

    /// The zero value of a signature type
    #[must_use]
    pub fn default_of(sig: &TypeSig, model: &MetadataModel) -> Value {
        match sig {
            TypeSig::Boolean | TypeSig::I4 => Value::I4(0),
            TypeSig::I8 => Value::I8(0),
            TypeSig::ValueType(ty) => Value::default_struct(*ty, model),
            TypeSig::Void
            | TypeSig::String
            | TypeSig::Object
            | TypeSig::Class(_)
            | TypeSig::SzArray(_) => Value::Null,
        }
    }

    /// A value-type instance with every instance field zeroed
    #[must_use]
    pub fn default_struct(ty: Token, model: &MetadataModel) -> Value {
        let fields = model
            .fields()
            .filter(|f| f.declaring_type == ty && !f.is_static())
            .map(|f| (f.token, Value::default_of(&f.field_type, model)))
            .collect();
        Value::Struct { ty, fields }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::I4(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}L"),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Obj(i) => write!(f, "obj#{i}"),
            Value::Array(i) => write!(f, "array#{i}"),
            Value::Addr(a) => write!(f, "&{a:?}"),
            Value::Struct { ty, .. } => write!(f, "struct {ty}"),
        }
    }
}

/// A reference-type instance.
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// Runtime type
    pub ty: Token,
    /// Instance field values
    pub fields: BTreeMap<Token, Value>,
}

/// Objects and arrays allocated during emulation.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    arrays: Vec<Vec<Value>>,
}

impl Heap {
    /// Allocates an object of `ty` with zeroed instance fields
    pub fn alloc(&mut self, ty: Token, model: &MetadataModel) -> Value {
        let mut fields = BTreeMap::new();
        let mut current = Some(ty);
        while let Some(t) = current {
            for field in model.fields().filter(|f| f.declaring_type == t && !f.is_static()) {
                fields.insert(field.token, Value::default_of(&field.field_type, model));
            }
            current = model.type_def(t).and_then(|d| d.base);
        }
        self.objects.push(HeapObject { ty, fields });
        Value::Obj(self.objects.len() - 1)
    }

    /// Allocates an array of `length` copies of `init`
    pub fn alloc_array(&mut self, length: usize, init: Value) -> Value {
        self.arrays.push(vec![init; length]);
        Value::Array(self.arrays.len() - 1)
    }

    /// The object at `index`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for a dangling index.
    pub fn object(&self, index: usize) -> Result<&HeapObject> {
        self.objects
            .get(index)
            .ok_or_else(|| Error::Emulation(format!("dangling object #{index}")))
    }

    /// The object at `index`, mutably.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for a dangling index.
    pub fn object_mut(&mut self, index: usize) -> Result<&mut HeapObject> {
        self.objects
            .get_mut(index)
            .ok_or_else(|| Error::Emulation(format!("dangling object #{index}")))
    }

    /// The array at `index`.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for a dangling index.
    pub fn array(&self, index: usize) -> Result<&Vec<Value>> {
        self.arrays
            .get(index)
            .ok_or_else(|| Error::Emulation(format!("dangling array #{index}")))
    }

    /// The array at `index`, mutably.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] for a dangling index.
    pub fn array_mut(&mut self, index: usize) -> Result<&mut Vec<Value>> {
        self.arrays
            .get_mut(index)
            .ok_or_else(|| Error::Emulation(format!("dangling array #{index}")))
    }

    /// Number of allocated objects
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}
