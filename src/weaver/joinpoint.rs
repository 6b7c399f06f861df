//! Join-point kinds and the opcode classifier.
//!
//! Every instruction-level category (field get, call, throw, ...) owns three
//! kinds: before, instead-of and after. [`classify`] maps an opcode to its
//! category in O(1) so the weaver can test the three advice buckets of an
//! instruction without allocating; opcodes without a category yield
//! [`JoinPointCategory::NONE`].

use bitflags::bitflags;

use crate::{
    assembly::{HandlerKind, Instruction, OpCode, SequenceId},
    metadata::token::Token,
};

bitflags! {
    /// Set of join-point kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct JoinPointKinds: u64 {
        /// Entry of the method body
        const BEFORE_METHOD_BODY = 1 << 0;
        /// Normal exit of the method body
        const AFTER_METHOD_BODY_SUCCESS = 1 << 1;
        /// Exit of the method body by exception
        const AFTER_METHOD_BODY_EXCEPTION = 1 << 2;
        /// Any exit of the method body
        const AFTER_METHOD_BODY_ALWAYS = 1 << 3;
        /// Instance constructor, before the chained constructor call
        const BEFORE_INSTANCE_CONSTRUCTOR = 1 << 4;
        /// Instance constructor, right after the chained constructor call
        const AFTER_INSTANCE_INITIALIZATION = 1 << 5;
        /// Entry of the type initializer
        const BEFORE_STATIC_CONSTRUCTOR = 1 << 6;

        /// Before `ldfld` / `ldsfld`
        const BEFORE_GET_FIELD = 1 << 8;
        /// Replaces `ldfld` / `ldsfld`
        const INSTEAD_OF_GET_FIELD = 1 << 9;
        /// After `ldfld` / `ldsfld`
        const AFTER_GET_FIELD = 1 << 10;
        /// Before `stfld` / `stsfld`
        const BEFORE_SET_FIELD = 1 << 11;
        /// Replaces `stfld` / `stsfld`
        const INSTEAD_OF_SET_FIELD = 1 << 12;
        /// After `stfld` / `stsfld`
        const AFTER_SET_FIELD = 1 << 13;
        /// Before `ldflda` / `ldsflda`
        const BEFORE_GET_FIELD_ADDRESS = 1 << 14;
        /// Replaces `ldflda` / `ldsflda`
        const INSTEAD_OF_GET_FIELD_ADDRESS = 1 << 15;
        /// After `ldflda` / `ldsflda`
        const AFTER_GET_FIELD_ADDRESS = 1 << 16;

        /// Before `ldelem` / `ldelema`
        const BEFORE_GET_ARRAY_ELEMENT = 1 << 17;
        /// Replaces `ldelem` / `ldelema`
        const INSTEAD_OF_GET_ARRAY_ELEMENT = 1 << 18;
        /// After `ldelem` / `ldelema`
        const AFTER_GET_ARRAY_ELEMENT = 1 << 19;
        /// Before `stelem`
        const BEFORE_SET_ARRAY_ELEMENT = 1 << 20;
        /// Replaces `stelem`
        const INSTEAD_OF_SET_ARRAY_ELEMENT = 1 << 21;
        /// After `stelem`
        const AFTER_SET_ARRAY_ELEMENT = 1 << 22;

        /// Before `call` / `callvirt`
        const BEFORE_CALL = 1 << 23;
        /// Replaces `call` / `callvirt`
        const INSTEAD_OF_CALL = 1 << 24;
        /// After `call` / `callvirt`
        const AFTER_CALL = 1 << 25;
        /// Before `newobj`
        const BEFORE_NEW_OBJECT = 1 << 26;
        /// Replaces `newobj`
        const INSTEAD_OF_NEW_OBJECT = 1 << 27;
        /// After `newobj`
        const AFTER_NEW_OBJECT = 1 << 28;

        /// Before `throw`
        const BEFORE_THROW = 1 << 29;
        /// Replaces `throw`
        const INSTEAD_OF_THROW = 1 << 30;
        /// Before `rethrow`
        const BEFORE_RETHROW = 1 << 31;
        /// Replaces `rethrow`
        const INSTEAD_OF_RETHROW = 1 << 32;

        /// Before `ldarg`
        const BEFORE_LOAD_ARGUMENT = 1 << 33;
        /// Replaces `ldarg`
        const INSTEAD_OF_LOAD_ARGUMENT = 1 << 34;
        /// After `ldarg`
        const AFTER_LOAD_ARGUMENT = 1 << 35;
        /// Before `starg`
        const BEFORE_STORE_ARGUMENT = 1 << 36;
        /// Replaces `starg`
        const INSTEAD_OF_STORE_ARGUMENT = 1 << 37;
        /// After `starg`
        const AFTER_STORE_ARGUMENT = 1 << 38;
        /// Before `ldarga`
        const BEFORE_LOAD_ARGUMENT_ADDRESS = 1 << 39;
        /// Replaces `ldarga`
        const INSTEAD_OF_LOAD_ARGUMENT_ADDRESS = 1 << 40;
        /// After `ldarga`
        const AFTER_LOAD_ARGUMENT_ADDRESS = 1 << 41;

        /// The kinds that share the method-boundary advice bucket
        const METHOD_BOUNDARY = Self::BEFORE_METHOD_BODY.bits()
            | Self::AFTER_METHOD_BODY_SUCCESS.bits()
            | Self::AFTER_METHOD_BODY_EXCEPTION.bits()
            | Self::AFTER_METHOD_BODY_ALWAYS.bits()
            | Self::AFTER_INSTANCE_INITIALIZATION.bits();
        /// Kinds handled by the method-body restructurer
        const WHOLE_METHOD = Self::METHOD_BOUNDARY.bits()
            | Self::BEFORE_INSTANCE_CONSTRUCTOR.bits()
            | Self::BEFORE_STATIC_CONSTRUCTOR.bits();
        /// Kinds that only apply to instance constructors
        const INSTANCE_CONSTRUCTOR = Self::BEFORE_INSTANCE_CONSTRUCTOR.bits()
            | Self::AFTER_INSTANCE_INITIALIZATION.bits();
        /// All field-access kinds
        const FIELD_ACCESS = Self::BEFORE_GET_FIELD.bits()
            | Self::INSTEAD_OF_GET_FIELD.bits()
            | Self::AFTER_GET_FIELD.bits()
            | Self::BEFORE_SET_FIELD.bits()
            | Self::INSTEAD_OF_SET_FIELD.bits()
            | Self::AFTER_SET_FIELD.bits()
            | Self::BEFORE_GET_FIELD_ADDRESS.bits()
            | Self::INSTEAD_OF_GET_FIELD_ADDRESS.bits()
            | Self::AFTER_GET_FIELD_ADDRESS.bits();
    }
}

impl JoinPointKinds {
    /// The individual kinds of the set, lowest bit first
    pub fn single_kinds(self) -> impl Iterator<Item = JoinPointKinds> {
        (0..u64::BITS)
            .map(|bit| 1u64 << bit)
            .filter(move |bit| self.bits() & bit != 0)
            .map(JoinPointKinds::from_bits_retain)
    }
}

/// Where advice code goes relative to the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinPointPosition {
    /// Before the instruction (or at method entry)
    Before,
    /// In place of the instruction
    InsteadOf,
    /// After the instruction (or at method exit)
    After,
}

/// Which operand an instruction category is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand key
    None,
    /// The field token
    Field,
    /// The method token
    Method,
    /// The argument index (not used as an index key)
    Argument,
}

/// The three kinds an opcode can raise, plus its operand key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPointCategory {
    /// Before kind
    pub before: JoinPointKinds,
    /// Instead-of kind
    pub instead_of: JoinPointKinds,
    /// After kind, empty when the instruction never falls through
    pub after: JoinPointKinds,
    /// Operand key
    pub operand: OperandKind,
}

impl JoinPointCategory {
    /// No join point
    pub const NONE: JoinPointCategory = JoinPointCategory {
        before: JoinPointKinds::empty(),
        instead_of: JoinPointKinds::empty(),
        after: JoinPointKinds::empty(),
        operand: OperandKind::None,
    };

    const fn new(
        before: JoinPointKinds,
        instead_of: JoinPointKinds,
        after: JoinPointKinds,
        operand: OperandKind,
    ) -> Self {
        JoinPointCategory {
            before,
            instead_of,
            after,
            operand,
        }
    }

    /// Returns true for the degenerate "no join point" category
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.before.is_empty() && self.instead_of.is_empty() && self.after.is_empty()
    }

    /// The three kinds paired with their positions, skipping empty ones
    pub fn kinds(&self) -> impl Iterator<Item = (JoinPointKinds, JoinPointPosition)> {
        [
            (self.before, JoinPointPosition::Before),
            (self.instead_of, JoinPointPosition::InsteadOf),
            (self.after, JoinPointPosition::After),
        ]
        .into_iter()
        .filter(|(k, _)| !k.is_empty())
    }

    /// Operand key of `instruction` for this category
    #[must_use]
    pub fn operand_of(&self, instruction: &Instruction) -> Option<Token> {
        match self.operand {
            OperandKind::Field | OperandKind::Method => instruction.token(),
            OperandKind::None | OperandKind::Argument => None,
        }
    }
}

const GET_FIELD: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_GET_FIELD,
    JoinPointKinds::INSTEAD_OF_GET_FIELD,
    JoinPointKinds::AFTER_GET_FIELD,
    OperandKind::Field,
);
const SET_FIELD: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_SET_FIELD,
    JoinPointKinds::INSTEAD_OF_SET_FIELD,
    JoinPointKinds::AFTER_SET_FIELD,
    OperandKind::Field,
);
const GET_FIELD_ADDRESS: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_GET_FIELD_ADDRESS,
    JoinPointKinds::INSTEAD_OF_GET_FIELD_ADDRESS,
    JoinPointKinds::AFTER_GET_FIELD_ADDRESS,
    OperandKind::Field,
);
const GET_ARRAY_ELEMENT: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_GET_ARRAY_ELEMENT,
    JoinPointKinds::INSTEAD_OF_GET_ARRAY_ELEMENT,
    JoinPointKinds::AFTER_GET_ARRAY_ELEMENT,
    OperandKind::None,
);
const SET_ARRAY_ELEMENT: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_SET_ARRAY_ELEMENT,
    JoinPointKinds::INSTEAD_OF_SET_ARRAY_ELEMENT,
    JoinPointKinds::AFTER_SET_ARRAY_ELEMENT,
    OperandKind::None,
);
const CALL: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_CALL,
    JoinPointKinds::INSTEAD_OF_CALL,
    JoinPointKinds::AFTER_CALL,
    OperandKind::Method,
);
const NEW_OBJECT: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_NEW_OBJECT,
    JoinPointKinds::INSTEAD_OF_NEW_OBJECT,
    JoinPointKinds::AFTER_NEW_OBJECT,
    OperandKind::Method,
);
const THROW: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_THROW,
    JoinPointKinds::INSTEAD_OF_THROW,
    JoinPointKinds::empty(),
    OperandKind::None,
);
const RETHROW: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_RETHROW,
    JoinPointKinds::INSTEAD_OF_RETHROW,
    JoinPointKinds::empty(),
    OperandKind::None,
);
const LOAD_ARGUMENT: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_LOAD_ARGUMENT,
    JoinPointKinds::INSTEAD_OF_LOAD_ARGUMENT,
    JoinPointKinds::AFTER_LOAD_ARGUMENT,
    OperandKind::Argument,
);
const STORE_ARGUMENT: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_STORE_ARGUMENT,
    JoinPointKinds::INSTEAD_OF_STORE_ARGUMENT,
    JoinPointKinds::AFTER_STORE_ARGUMENT,
    OperandKind::Argument,
);
const LOAD_ARGUMENT_ADDRESS: JoinPointCategory = JoinPointCategory::new(
    JoinPointKinds::BEFORE_LOAD_ARGUMENT_ADDRESS,
    JoinPointKinds::INSTEAD_OF_LOAD_ARGUMENT_ADDRESS,
    JoinPointKinds::AFTER_LOAD_ARGUMENT_ADDRESS,
    OperandKind::Argument,
);

/// Maps an opcode to the join-point category it raises.
#[must_use]
pub fn classify(opcode: OpCode) -> JoinPointCategory {
    match opcode {
        OpCode::Ldfld | OpCode::Ldsfld => GET_FIELD,
        OpCode::Stfld | OpCode::Stsfld => SET_FIELD,
        OpCode::Ldflda | OpCode::Ldsflda => GET_FIELD_ADDRESS,
        OpCode::Ldelem | OpCode::Ldelema => GET_ARRAY_ELEMENT,
        OpCode::Stelem => SET_ARRAY_ELEMENT,
        OpCode::Call | OpCode::Callvirt => CALL,
        OpCode::Newobj => NEW_OBJECT,
        OpCode::Throw => THROW,
        OpCode::Rethrow => RETHROW,
        OpCode::Ldarg => LOAD_ARGUMENT,
        OpCode::Starg => STORE_ARGUMENT,
        OpCode::Ldarga => LOAD_ARGUMENT_ADDRESS,
        _ => JoinPointCategory::NONE,
    }
}

/// A weavable location, rebuilt at every candidate instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPoint {
    /// The single kind being woven
    pub kind: JoinPointKinds,
    /// Position relative to the instruction
    pub position: JoinPointPosition,
    /// The instruction, `None` for method-level join points
    pub instruction: Option<Instruction>,
    /// Operand key of the instruction
    pub operand: Option<Token>,
    /// Sequence and index of the instruction before it was split out
    pub location: Option<(SequenceId, usize)>,
    /// Innermost exception handler the instruction sits in
    pub handler: Option<HandlerKind>,
}

impl JoinPoint {
    /// A method-level join point (body boundary or constructor hook)
    #[must_use]
    pub fn method_level(kind: JoinPointKinds, position: JoinPointPosition) -> Self {
        JoinPoint {
            kind,
            position,
            instruction: None,
            operand: None,
            location: None,
            handler: None,
        }
    }
}
