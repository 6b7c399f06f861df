//! CIL method bodies as mutable block trees.
//!
//! # Key Components
//!
//! - [`opcodes`] - the opcode set with operand types, flow and stack metadata
//! - [`instruction`] - [`Instruction`] and [`Operand`]
//! - [`body`] - the [`MethodBody`] arena of blocks and sequences
//! - [`reader`] - [`InstructionReader`], a cursor with bookmarks for lookahead
//! - [`writer`] - [`InstructionWriter`], scoped emission into a sequence
//! - [`layout`] - flattening into instruction streams and stack-depth checking
//!
//! # Examples
//!
//! ```rust
//! use dotweave::assembly::{MethodBody, OpCode};
//!
//! let mut body = MethodBody::new();
//! let seq = body.add_sequence(body.root())?;
//! {
//!     let mut writer = body.attach_writer(seq)?;
//!     writer.emit_i4(42)?;
//!     writer.emit(OpCode::Ret)?;
//! }
//! body.verify_structure()?;
//! # Ok::<(), dotweave::Error>(())
//! ```

pub mod body;
pub mod instruction;
pub mod layout;
pub mod opcodes;
pub mod reader;
pub mod writer;

pub use body::{
    BlockContent, BlockId, BlockRole, ExceptionHandler, HandlerKind, InstructionBlock,
    LocalSymbol, MethodBody, Sequence, SequenceId,
};
pub use instruction::{FlowType, Instruction, Operand, StackBehavior};
pub use layout::{analyze_stack, linearize, LinearBody, ProtectedRegion};
pub use opcodes::{OpCode, OperandType};
pub use reader::{Bookmark, InstructionReader};
pub use writer::InstructionWriter;
