//! CIL opcodes handled by the weaver (ECMA-335, long forms only).
//!
//! Short encodings (`ldarg.0`, `br.s`, `ldc.i4.s`, ...) are an encoder concern:
//! bodies are kept in long form and the binary writer picks the compact form
//! when it lays out bytes. [`OpCode::encoding`] gives the long-form value, with
//! two-byte opcodes reported as `0xFE00 | second_byte`.

use strum::{Display, EnumCount, EnumIter, IntoStaticStr};

use crate::assembly::instruction::FlowType;

/// Prefix byte shared by all two-byte opcodes.
pub const FE_PREFIX: u8 = 0xFE;

/// The kind of operand an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// 32-bit immediate
    Int32,
    /// 64-bit immediate
    Int64,
    /// User string
    String,
    /// Field token
    Field,
    /// Method token
    Method,
    /// Type token
    Type,
    /// Local variable index
    Local,
    /// Argument index
    Argument,
    /// Branch target sequence
    Target,
    /// Switch target table
    Switch,
}

/// A CIL opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount, IntoStaticStr)]
#[allow(missing_docs)]
pub enum OpCode {
    #[strum(serialize = "nop")]
    Nop,
    #[strum(serialize = "ldarg")]
    Ldarg,
    #[strum(serialize = "ldarga")]
    Ldarga,
    #[strum(serialize = "starg")]
    Starg,
    #[strum(serialize = "ldloc")]
    Ldloc,
    #[strum(serialize = "ldloca")]
    Ldloca,
    #[strum(serialize = "stloc")]
    Stloc,
    #[strum(serialize = "ldnull")]
    Ldnull,
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    #[strum(serialize = "ldc.i8")]
    LdcI8,
    #[strum(serialize = "ldstr")]
    Ldstr,
    #[strum(serialize = "dup")]
    Dup,
    #[strum(serialize = "pop")]
    Pop,
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "callvirt")]
    Callvirt,
    #[strum(serialize = "newobj")]
    Newobj,
    #[strum(serialize = "ret")]
    Ret,
    #[strum(serialize = "br")]
    Br,
    #[strum(serialize = "brfalse")]
    Brfalse,
    #[strum(serialize = "brtrue")]
    Brtrue,
    #[strum(serialize = "beq")]
    Beq,
    #[strum(serialize = "bne.un")]
    BneUn,
    #[strum(serialize = "blt")]
    Blt,
    #[strum(serialize = "bgt")]
    Bgt,
    #[strum(serialize = "ble")]
    Ble,
    #[strum(serialize = "bge")]
    Bge,
    #[strum(serialize = "switch")]
    Switch,
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "mul")]
    Mul,
    #[strum(serialize = "div")]
    Div,
    #[strum(serialize = "rem")]
    Rem,
    #[strum(serialize = "neg")]
    Neg,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "xor")]
    Xor,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "shl")]
    Shl,
    #[strum(serialize = "shr")]
    Shr,
    #[strum(serialize = "ceq")]
    Ceq,
    #[strum(serialize = "cgt")]
    Cgt,
    #[strum(serialize = "clt")]
    Clt,
    #[strum(serialize = "conv.i4")]
    ConvI4,
    #[strum(serialize = "conv.i8")]
    ConvI8,
    #[strum(serialize = "ldfld")]
    Ldfld,
    #[strum(serialize = "ldflda")]
    Ldflda,
    #[strum(serialize = "stfld")]
    Stfld,
    #[strum(serialize = "ldsfld")]
    Ldsfld,
    #[strum(serialize = "ldsflda")]
    Ldsflda,
    #[strum(serialize = "stsfld")]
    Stsfld,
    #[strum(serialize = "ldobj")]
    Ldobj,
    #[strum(serialize = "stobj")]
    Stobj,
    #[strum(serialize = "initobj")]
    Initobj,
    #[strum(serialize = "box")]
    Box,
    #[strum(serialize = "unbox.any")]
    UnboxAny,
    #[strum(serialize = "castclass")]
    Castclass,
    #[strum(serialize = "isinst")]
    Isinst,
    #[strum(serialize = "newarr")]
    Newarr,
    #[strum(serialize = "ldlen")]
    Ldlen,
    #[strum(serialize = "ldelem")]
    Ldelem,
    #[strum(serialize = "ldelema")]
    Ldelema,
    #[strum(serialize = "stelem")]
    Stelem,
    #[strum(serialize = "ldind.i4")]
    LdindI4,
    #[strum(serialize = "ldind.ref")]
    LdindRef,
    #[strum(serialize = "stind.i4")]
    StindI4,
    #[strum(serialize = "stind.ref")]
    StindRef,
    #[strum(serialize = "throw")]
    Throw,
    #[strum(serialize = "rethrow")]
    Rethrow,
    #[strum(serialize = "leave")]
    Leave,
    #[strum(serialize = "endfinally")]
    Endfinally,
    #[strum(serialize = "endfilter")]
    Endfilter,
}

impl OpCode {
    /// The mnemonic, e.g. `"ldc.i4"`
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// Long-form encoding; two-byte opcodes are `0xFE00 | second_byte`.
    #[must_use]
    pub fn encoding(self) -> u16 {
        let fe = u16::from(FE_PREFIX) << 8;
        match self {
            OpCode::Nop => 0x00,
            OpCode::Ldnull => 0x14,
            OpCode::LdcI4 => 0x20,
            OpCode::LdcI8 => 0x21,
            OpCode::Dup => 0x25,
            OpCode::Pop => 0x26,
            OpCode::Call => 0x28,
            OpCode::Ret => 0x2A,
            OpCode::Br => 0x38,
            OpCode::Brfalse => 0x39,
            OpCode::Brtrue => 0x3A,
            OpCode::Beq => 0x3B,
            OpCode::Bge => 0x3C,
            OpCode::Bgt => 0x3D,
            OpCode::Ble => 0x3E,
            OpCode::Blt => 0x3F,
            OpCode::BneUn => 0x40,
            OpCode::Switch => 0x45,
            OpCode::LdindI4 => 0x4A,
            OpCode::LdindRef => 0x50,
            OpCode::StindRef => 0x51,
            OpCode::StindI4 => 0x54,
            OpCode::Add => 0x58,
            OpCode::Sub => 0x59,
            OpCode::Mul => 0x5A,
            OpCode::Div => 0x5B,
            OpCode::Rem => 0x5D,
            OpCode::And => 0x5F,
            OpCode::Or => 0x60,
            OpCode::Xor => 0x61,
            OpCode::Shl => 0x62,
            OpCode::Shr => 0x63,
            OpCode::Neg => 0x65,
            OpCode::Not => 0x66,
            OpCode::ConvI8 => 0x6A,
            OpCode::ConvI4 => 0x69,
            OpCode::Callvirt => 0x6F,
            OpCode::Ldobj => 0x71,
            OpCode::Ldstr => 0x72,
            OpCode::Newobj => 0x73,
            OpCode::Castclass => 0x74,
            OpCode::Isinst => 0x75,
            OpCode::Throw => 0x7A,
            OpCode::Ldfld => 0x7B,
            OpCode::Ldflda => 0x7C,
            OpCode::Stfld => 0x7D,
            OpCode::Ldsfld => 0x7E,
            OpCode::Ldsflda => 0x7F,
            OpCode::Stsfld => 0x80,
            OpCode::Stobj => 0x81,
            OpCode::Box => 0x8C,
            OpCode::Newarr => 0x8D,
            OpCode::Ldlen => 0x8E,
            OpCode::Ldelema => 0x8F,
            OpCode::Ldelem => 0xA3,
            OpCode::Stelem => 0xA4,
            OpCode::UnboxAny => 0xA5,
            OpCode::Endfinally => 0xDC,
            OpCode::Leave => 0xDD,
            OpCode::Ceq => fe | 0x01,
            OpCode::Cgt => fe | 0x02,
            OpCode::Clt => fe | 0x04,
            OpCode::Ldarg => fe | 0x09,
            OpCode::Ldarga => fe | 0x0A,
            OpCode::Starg => fe | 0x0B,
            OpCode::Ldloc => fe | 0x0C,
            OpCode::Ldloca => fe | 0x0D,
            OpCode::Stloc => fe | 0x0E,
            OpCode::Endfilter => fe | 0x11,
            OpCode::Initobj => fe | 0x15,
            OpCode::Rethrow => fe | 0x1A,
        }
    }

    /// The operand the opcode carries
    #[must_use]
    pub fn operand_type(self) -> OperandType {
        match self {
            OpCode::Ldarg | OpCode::Ldarga | OpCode::Starg => OperandType::Argument,
            OpCode::Ldloc | OpCode::Ldloca | OpCode::Stloc => OperandType::Local,
            OpCode::LdcI4 => OperandType::Int32,
            OpCode::LdcI8 => OperandType::Int64,
            OpCode::Ldstr => OperandType::String,
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => OperandType::Method,
            OpCode::Br
            | OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Beq
            | OpCode::BneUn
            | OpCode::Blt
            | OpCode::Bgt
            | OpCode::Ble
            | OpCode::Bge
            | OpCode::Leave => OperandType::Target,
            OpCode::Switch => OperandType::Switch,
            OpCode::Ldfld
            | OpCode::Ldflda
            | OpCode::Stfld
            | OpCode::Ldsfld
            | OpCode::Ldsflda
            | OpCode::Stsfld => OperandType::Field,
            OpCode::Ldobj
            | OpCode::Stobj
            | OpCode::Initobj
            | OpCode::Box
            | OpCode::UnboxAny
            | OpCode::Castclass
            | OpCode::Isinst
            | OpCode::Newarr
            | OpCode::Ldelem
            | OpCode::Ldelema
            | OpCode::Stelem => OperandType::Type,
            _ => OperandType::None,
        }
    }

    /// How the opcode transfers control
    #[must_use]
    pub fn flow_type(self) -> FlowType {
        match self {
            OpCode::Br => FlowType::UnconditionalBranch,
            OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Beq
            | OpCode::BneUn
            | OpCode::Blt
            | OpCode::Bgt
            | OpCode::Ble
            | OpCode::Bge => FlowType::ConditionalBranch,
            OpCode::Switch => FlowType::Switch,
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => FlowType::Call,
            OpCode::Ret => FlowType::Return,
            OpCode::Throw | OpCode::Rethrow => FlowType::Throw,
            OpCode::Leave => FlowType::Leave,
            OpCode::Endfinally | OpCode::Endfilter => FlowType::EndFinally,
            _ => FlowType::Sequential,
        }
    }

    /// Fixed `(pops, pushes)`; `None` when the effect depends on a signature.
    #[must_use]
    pub fn fixed_stack(self) -> Option<(u8, u8)> {
        let effect = match self {
            OpCode::Nop
            | OpCode::Br
            | OpCode::Leave
            | OpCode::Endfinally
            | OpCode::Rethrow => (0, 0),
            OpCode::Ldarg
            | OpCode::Ldarga
            | OpCode::Ldloc
            | OpCode::Ldloca
            | OpCode::Ldnull
            | OpCode::LdcI4
            | OpCode::LdcI8
            | OpCode::Ldstr
            | OpCode::Ldsfld
            | OpCode::Ldsflda => (0, 1),
            OpCode::Starg
            | OpCode::Stloc
            | OpCode::Pop
            | OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Switch
            | OpCode::Stsfld
            | OpCode::Initobj
            | OpCode::Throw
            | OpCode::Endfilter => (1, 0),
            OpCode::Dup => (1, 2),
            OpCode::Beq
            | OpCode::BneUn
            | OpCode::Blt
            | OpCode::Bgt
            | OpCode::Ble
            | OpCode::Bge
            | OpCode::Stfld
            | OpCode::Stobj
            | OpCode::StindI4
            | OpCode::StindRef => (2, 0),
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Rem
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::Ceq
            | OpCode::Cgt
            | OpCode::Clt
            | OpCode::Ldelem
            | OpCode::Ldelema => (2, 1),
            OpCode::Neg
            | OpCode::Not
            | OpCode::ConvI4
            | OpCode::ConvI8
            | OpCode::Ldfld
            | OpCode::Ldflda
            | OpCode::Ldobj
            | OpCode::Box
            | OpCode::UnboxAny
            | OpCode::Castclass
            | OpCode::Isinst
            | OpCode::Newarr
            | OpCode::Ldlen
            | OpCode::LdindI4
            | OpCode::LdindRef => (1, 1),
            OpCode::Stelem => (3, 0),
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj | OpCode::Ret => return None,
        };
        Some(effect)
    }

    /// Returns true if execution can continue with the next instruction
    #[must_use]
    pub fn falls_through(self) -> bool {
        !matches!(
            self.flow_type(),
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::Leave
                | FlowType::EndFinally
        )
    }
}
