//! Error types. Build-time errors abort module construction; run-time errors either are Erlang
//! faults (`Fault`, catchable by compiled code) or indicate an interpreter bug (`InternalError`).

use thiserror::Error;

use crate::bytecode::{Family, Operation};
use crate::functor::{Atom, ArityType};
use crate::operand::{Operand, Variant};
use crate::vm::Fault;

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
  #[error("unknown operation code {0}")]
  UnknownOperation(u8),

  #[error("{operation} takes {expected} operands but was given {found}")]
  WrongArity {
    operation : Operation,
    expected  : usize,
    found     : usize
  },

  #[error("operand {index} of {operation} must be {expected}, found {found}")]
  UnexpectedOperand {
    operation : Operation,
    index     : usize,
    expected  : &'static str,
    found     : Operand
  },

  #[error("operand {index} of {operation} does not fit in an instruction word: {value}")]
  OutOfRange {
    operation : Operation,
    index     : usize,
    value     : i64
  },

  #[error("{operation} reads more than two source operands")]
  TooManySources { operation: Operation },

  #[error("no internal opcode executes {family} with operand variants {variants:?}")]
  NoOpcode {
    family   : Family,
    variants : Vec<Variant>
  },

  #[error("label {0} is defined more than once")]
  DuplicateLabel(u32),

  #[error("label {0} is referenced but never defined")]
  UndefinedLabel(u32),

  #[error("function {function}/{arity} never binds its entry label {label}")]
  MissingEntry {
    function : Atom,
    arity    : ArityType,
    label    : u32
  },

  #[error("function {0}/{1} is defined more than once")]
  DuplicateFunction(Atom, ArityType),

  #[error("exported function {0}/{1} is not defined")]
  UndefinedExport(Atom, ArityType),

  #[error("the {0} table is full")]
  TableOverflow(&'static str),

  #[error("the code array exceeds the addressable range")]
  CodeTooLarge,
}

/// Errors reading an assembly listing.
#[derive(Debug, Error, PartialEq)]
pub enum AssemblyError {
  #[error("line {line}: {message}")]
  Syntax {
    line    : usize,
    message : String
  },

  #[error("line {line}: {name} is not an operation")]
  UnknownOperation {
    line : usize,
    name : String
  },

  #[error("line {line}: {operation} requires {expected} operands but was given {found}")]
  WrongArity {
    line      : usize,
    operation : Operation,
    expected  : usize,
    found     : usize
  },

  #[error("line {line}: {form} is not a module attribute or an instruction")]
  BadForm {
    line : usize,
    form : String
  },

  #[error("line {0}: instruction outside of any function")]
  OutsideFunction(usize),

  #[error("the listing does not name its module")]
  MissingModule,

  #[error(transparent)]
  Encode(#[from] EncodeError),
}

/// Conditions that cannot arise from code produced by the encoder.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InternalError {
  #[error("unimplemented internal opcode {opcode} at {pc}")]
  UnimplementedOpcode {
    opcode : u16,
    pc     : usize
  },

  #[error("bad jump to {pc} (from {from})")]
  BadJump {
    pc   : usize,
    from : usize
  },

  #[error("stack depth {found} at return differs from depth {expected} at entry")]
  StackImbalance {
    expected : usize,
    found    : usize
  },

  #[error("stack slot y{slot} is outside the current stack of depth {depth}")]
  BadStackSlot {
    slot  : usize,
    depth : usize
  },

  #[error("{0} without a tuple under construction")]
  NoTuple(&'static str),

  #[error("{0} without a binary under construction")]
  NoBinary(&'static str),

  #[error("{0} applied to a slot that holds no match context")]
  NoMatchContext(&'static str),

  #[error("end of a catch region whose slot y{0} holds no catch tag")]
  NoCatchTag(usize),

  #[error("match context has no save slot {0}")]
  BadSaveSlot(i32),
}

/// Everything that can go wrong while running code.
#[derive(Debug, Error, Clone)]
pub enum ExecError {
  #[error(transparent)]
  Fault(#[from] Fault),

  #[error(transparent)]
  Internal(#[from] InternalError),
}

impl ExecError {
  /// The fault, if this is an Erlang-level fault.
  pub fn fault(&self) -> Option<&Fault> {
    match self {
      ExecError::Fault(fault) => Some(fault),
      ExecError::Internal(_)  => None
    }
  }
}
