use std::fmt::{Display, Formatter};

use strum_macros::{Display as StrumDisplay, IntoStaticStr, EnumString, EnumIter};
use num_enum::{TryFromPrimitive, IntoPrimitive};

use crate::operand::Operand;

/**
  Generic operations of compiled module code, as produced by the upstream decoder. Each carries a
  fixed operand shape, listed next to the variant as `L` (label), `S` (source: x, y or constant),
  `D` (destination: x or y), `I` (immediate integer), `F` (float register), `E` (imported
  function), `A` (atom), `T` (literal) and `V` (select list).

  The textual names are the conventional lower case BEAM names, so the assembly reader can look
  operations up with `Operation::from_str`.
*/
#[derive(
StrumDisplay, IntoStaticStr, EnumString, EnumIter, TryFromPrimitive, IntoPrimitive,
Clone,        Copy,          Eq, PartialEq,  Debug,            Hash
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Operation {
  // Structure
  Label,              // label( I )
  Line,               // line( I )
  FuncInfo,           // func_info( A, A, I )
  IntCodeEnd,         // int_code_end

  // Control
  Return,             // return
  Jump,               // jump( L )
  IfEnd,              // if_end
  Badmatch,           // badmatch( S )
  CaseEnd,            // case_end( S )
  TryCaseEnd,         // try_case_end( S )

  // Stack
  Allocate,           // allocate( I, I )
  AllocateZero,       // allocate_zero( I, I )
  AllocateHeap,       // allocate_heap( I, I, I )
  AllocateHeapZero,   // allocate_heap_zero( I, I, I )
  TestHeap,           // test_heap( I, I )
  Init,               // init( D )
  Trim,               // trim( I, I )
  Deallocate,         // deallocate( I )

  // Data
  Move,               // move( S, D )
  PutList,            // put_list( S, S, D )
  GetList,            // get_list( S, D, D )
  GetTupleElement,    // get_tuple_element( S, I, D )
  PutTuple,           // put_tuple( I, D )
  Put,                // put( S )
  SetTupleElement,    // set_tuple_element( S, D, I )

  // Tests
  IsInteger,          // is_integer( L, S )
  IsFloat,            // is_float( L, S )
  IsNumber,           // is_number( L, S )
  IsAtom,             // is_atom( L, S )
  IsPid,              // is_pid( L, S )
  IsReference,        // is_reference( L, S )
  IsPort,             // is_port( L, S )
  IsNil,              // is_nil( L, S )
  IsBinary,           // is_binary( L, S )
  IsList,             // is_list( L, S )
  IsNonemptyList,     // is_nonempty_list( L, S )
  IsTuple,            // is_tuple( L, S )
  IsFunction,         // is_function( L, S )
  IsBoolean,          // is_boolean( L, S )
  IsBitstr,           // is_bitstr( L, S )
  TestArity,          // test_arity( L, S, I )
  #[strum(serialize = "is_function2")]
  IsFunction2,        // is_function2( L, S, S )
  IsEqExact,          // is_eq_exact( L, S, S )
  IsNeExact,          // is_ne_exact( L, S, S )
  IsEq,               // is_eq( L, S, S )
  IsNe,               // is_ne( L, S, S )
  IsLt,               // is_lt( L, S, S )
  IsGe,               // is_ge( L, S, S )
  SelectVal,          // select_val( S, L, V )
  SelectTupleArity,   // select_tuple_arity( S, L, V )

  // Calls
  Call,               // call( I, L )
  CallOnly,           // call_only( I, L )
  CallLast,           // call_last( I, L, I )
  CallExt,            // call_ext( I, E )
  CallExtOnly,        // call_ext_only( I, E )
  CallExtLast,        // call_ext_last( I, E, I )
  Apply,              // apply( I )
  ApplyLast,          // apply_last( I, I )
  CallFun,            // call_fun( I )
  #[strum(serialize = "make_fun2")]
  MakeFun2,           // make_fun2( L, I, I )
  #[strum(serialize = "bif0")]
  Bif0,               // bif0( E, D )
  #[strum(serialize = "bif1")]
  Bif1,               // bif1( L, E, S, D )
  #[strum(serialize = "bif2")]
  Bif2,               // bif2( L, E, S, S, D )
  #[strum(serialize = "gc_bif1")]
  GcBif1,             // gc_bif1( L, I, E, S, D )
  #[strum(serialize = "gc_bif2")]
  GcBif2,             // gc_bif2( L, I, E, S, S, D )

  // Messages
  Send,               // send
  LoopRec,            // loop_rec( L, D )
  LoopRecEnd,         // loop_rec_end( L )
  RemoveMessage,      // remove_message
  Wait,               // wait( L )
  WaitTimeout,        // wait_timeout( L, S )
  Timeout,            // timeout

  // Binary matching
  #[strum(serialize = "bs_start_match2")]
  BsStartMatch2,      // bs_start_match2( L, S, I, I, D )
  #[strum(serialize = "bs_get_integer2")]
  BsGetInteger2,      // bs_get_integer2( L, D, I, S, I, I, D )
  #[strum(serialize = "bs_get_float2")]
  BsGetFloat2,        // bs_get_float2( L, D, I, S, I, I, D )
  #[strum(serialize = "bs_get_binary2")]
  BsGetBinary2,       // bs_get_binary2( L, D, I, S, I, I, D )
  #[strum(serialize = "bs_skip_bits2")]
  BsSkipBits2,        // bs_skip_bits2( L, D, S, I, I )
  #[strum(serialize = "bs_test_tail2")]
  BsTestTail2,        // bs_test_tail2( L, D, I )
  BsTestUnit,         // bs_test_unit( L, D, I )
  BsMatchString,      // bs_match_string( L, D, T )
  #[strum(serialize = "bs_get_utf8")]
  BsGetUtf8,          // bs_get_utf8( L, D, I, I, D )
  #[strum(serialize = "bs_get_utf16")]
  BsGetUtf16,         // bs_get_utf16( L, D, I, I, D )
  #[strum(serialize = "bs_get_utf32")]
  BsGetUtf32,         // bs_get_utf32( L, D, I, I, D )
  #[strum(serialize = "bs_skip_utf8")]
  BsSkipUtf8,         // bs_skip_utf8( L, D, I, I )
  #[strum(serialize = "bs_skip_utf16")]
  BsSkipUtf16,        // bs_skip_utf16( L, D, I, I )
  #[strum(serialize = "bs_skip_utf32")]
  BsSkipUtf32,        // bs_skip_utf32( L, D, I, I )
  #[strum(serialize = "bs_save2")]
  BsSave2,            // bs_save2( D, I )
  #[strum(serialize = "bs_restore2")]
  BsRestore2,         // bs_restore2( D, I )
  BsContextToBinary,  // bs_context_to_binary( D )

  // Binary construction
  #[strum(serialize = "bs_init2")]
  BsInit2,            // bs_init2( L, S, I, I, I, D )
  BsInitBits,         // bs_init_bits( L, S, I, I, I, D )
  BsInitWritable,     // bs_init_writable
  BsPutInteger,       // bs_put_integer( L, S, I, I, S )
  BsPutBinary,        // bs_put_binary( L, S, I, I, S )
  BsPutFloat,         // bs_put_float( L, S, I, I, S )
  BsPutString,        // bs_put_string( T )
  #[strum(serialize = "bs_put_utf8")]
  BsPutUtf8,          // bs_put_utf8( L, I, S )
  #[strum(serialize = "bs_put_utf16")]
  BsPutUtf16,         // bs_put_utf16( L, I, S )
  #[strum(serialize = "bs_put_utf32")]
  BsPutUtf32,         // bs_put_utf32( L, I, S )
  #[strum(serialize = "bs_utf8_size")]
  BsUtf8Size,         // bs_utf8_size( L, S, D )
  #[strum(serialize = "bs_utf16_size")]
  BsUtf16Size,        // bs_utf16_size( L, S, D )
  BsAdd,              // bs_add( L, S, S, I, D )
  BsAppend,           // bs_append( L, S, I, I, I, S, I, D )
  BsPrivateAppend,    // bs_private_append( L, S, I, S, I, D )

  // Exceptions
  Catch,              // catch( D, L )
  CatchEnd,           // catch_end( D )
  Try,                // try( D, L )
  TryEnd,             // try_end( D )
  TryCase,            // try_case( D )
  Raise,              // raise( S, S )

  // Floating point
  Fmove,              // fmove( S|F, D|F )
  Fconv,              // fconv( S|F, D|F )
  Fadd,               // fadd( L, F, F, F )
  Fsub,               // fsub( L, F, F, F )
  Fmul,               // fmul( L, F, F, F )
  Fdiv,               // fdiv( L, F, F, F )
  Fnegate,            // fnegate( L, F, F )
  Fclearerror,        // fclearerror
  Fcheckerror,        // fcheckerror( L )
}

impl Operation {
  pub fn code(&self) -> u8 {
    Into::<u8>::into(*self)
  }

  /// The number of operands the operation takes.
  pub fn arity(&self) -> usize {
    use Operation::*;
    match self {
      IntCodeEnd | Return | IfEnd | Send | RemoveMessage | Timeout | BsInitWritable
      | Fclearerror => 0,

      Label | Line | Jump | Badmatch | CaseEnd | TryCaseEnd | Init | Deallocate | Put | Apply
      | CallFun | LoopRecEnd | Wait | BsContextToBinary | BsPutString | CatchEnd | TryEnd
      | TryCase | Fcheckerror => 1,

      Allocate | AllocateZero | TestHeap | Trim | Move | PutTuple | IsInteger | IsFloat
      | IsNumber | IsAtom | IsPid | IsReference | IsPort | IsNil | IsBinary | IsList
      | IsNonemptyList | IsTuple | IsFunction | IsBoolean | IsBitstr | Call | CallOnly | CallExt
      | CallExtOnly | ApplyLast | Bif0 | LoopRec | WaitTimeout | BsSave2 | BsRestore2 | Catch
      | Try | Raise | Fmove | Fconv => 2,

      FuncInfo | AllocateHeap | AllocateHeapZero | PutList | GetList | GetTupleElement
      | SetTupleElement | TestArity | IsFunction2 | IsEqExact | IsNeExact | IsEq | IsNe | IsLt
      | IsGe | SelectVal | SelectTupleArity | CallLast | CallExtLast | MakeFun2 | BsTestTail2
      | BsTestUnit | BsMatchString | BsPutUtf8 | BsPutUtf16 | BsPutUtf32 | BsUtf8Size
      | BsUtf16Size | Fnegate => 3,

      Bif1 | BsSkipUtf8 | BsSkipUtf16 | BsSkipUtf32 | Fadd | Fsub | Fmul | Fdiv => 4,

      Bif2 | GcBif1 | BsStartMatch2 | BsSkipBits2 | BsGetUtf8 | BsGetUtf16 | BsGetUtf32
      | BsPutInteger | BsPutBinary | BsPutFloat | BsAdd => 5,

      GcBif2 | BsInit2 | BsInitBits | BsPrivateAppend => 6,

      BsGetInteger2 | BsGetFloat2 | BsGetBinary2 => 7,

      BsAppend => 8,
    }
  }

  /// Operations that only carry information for the loader and emit no code.
  pub fn is_annotation(&self) -> bool {
    match self {
      | Operation::Line
      | Operation::TestHeap
      | Operation::IntCodeEnd
      | Operation::Fclearerror
      | Operation::Fcheckerror => true,
      _ => false
    }
  }
}

/// A symbolic instruction: an operation and its operands, exactly as decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
  pub operation : Operation,
  pub operands  : Vec<Operand>,
}

impl Instruction {
  pub fn new(operation: Operation, operands: Vec<Operand>) -> Instruction {
    Instruction { operation, operands }
  }
}

impl Display for Instruction {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self.operands.is_empty() {
      true  => write!(f, "{}", self.operation),
      false => {
        let operands: Vec<String> = self.operands.iter().map(Operand::to_string).collect();
        write!(f, "{}({})", self.operation, operands.join(", "))
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::str::FromStr;

  #[test]
  fn names_round_trip() {
    assert_eq!(Operation::from_str("bs_start_match2"), Ok(Operation::BsStartMatch2));
    assert_eq!(Operation::from_str("is_nonempty_list"), Ok(Operation::IsNonemptyList));
    assert_eq!(Operation::from_str("gc_bif2"), Ok(Operation::GcBif2));
    assert_eq!(Operation::GetTupleElement.to_string(), "get_tuple_element");
    assert!(Operation::from_str("no_such_op").is_err());
  }

  #[test]
  fn display() {
    let move_ = Instruction::new(Operation::Move, vec![Operand::X(0), Operand::Y(1)]);
    assert_eq!(move_.to_string(), "move({x,0}, {y,1})");
    assert_eq!(Instruction::new(Operation::Return, vec![]).to_string(), "return");
  }
}
