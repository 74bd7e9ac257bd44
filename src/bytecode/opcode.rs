/*!
  Internal opcodes.

  Each symbolic operation is executed by one opcode *family*: a single, variant-erased body in the
  dispatch loop. A family declares the layout of the words that follow its opcode in the code
  array. Some layout slots are polymorphic (a destination may be a register or a stack slot), and
  a family gets one internal opcode per combination of variants of its polymorphic slots. The
  mapping between (family, variants) and internal opcode numbers is computed from the layouts
  when the table is first used, so families are listed once and never hand-numbered.

  Opcodes are numbered consecutively in family declaration order, with the variant combinations
  of a family numbered in mixed radix, first polymorphic slot most significant. The prefetch
  families come last, so the prefetch opcodes form one reserved block at the end of the table.

  Source operands are never polymorphic slots of ordinary families. Instead the encoder emits a
  `fetch_s` or `fetch_s_s` opcode specialized on the source variants ahead of the instruction,
  which decodes up to two sources into interpreter-local slots. Both prefetch families enumerate
  every combination, including two sources of the same kind.
*/

use std::fmt::{Display, Formatter};
use std::ops::Range;

use strum::IntoEnumIterator;
use strum_macros::{Display as StrumDisplay, IntoStaticStr, EnumIter};
use num_enum::{TryFromPrimitive, IntoPrimitive};

use crate::operand::Variant;

/// The encoded form of "no fail label": failure raises instead of branching.
pub const NO_LABEL: u16 = u16::MAX;

/// The most polymorphic slots any family has.
pub const MAX_POLYMORPHIC: usize = 2;

/// The kind of one operand word in a family's layout.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Slot {
  /// A raw integer.
  Imm,
  /// An absolute code offset, or `NO_LABEL`.
  Label,
  /// A register or a stack slot.
  Dst,
  /// A register, a stack slot, or a constant pool index.
  Src,
  /// A register, a stack slot, a constant pool index or a float register.
  FSrc,
  /// A register, a stack slot or a float register.
  FDst,
  /// A float register.
  Fr,
  /// A stack slot.
  Y,
  /// A constant pool index.
  Const,
  /// A value jump table index.
  VTable,
  /// An arity jump table index.
  ATable,
  /// An import table index.
  Import,
}

impl Slot {
  /// The variants of a polymorphic slot, in resolution order. Empty for monomorphic slots.
  pub fn variants(self) -> &'static [Variant] {
    match self {
      Slot::Dst  => &[Variant::X, Variant::Y],
      Slot::Src  => &[Variant::X, Variant::Y, Variant::C],
      Slot::FSrc => &[Variant::X, Variant::Y, Variant::C, Variant::F],
      Slot::FDst => &[Variant::X, Variant::Y, Variant::F],
      _          => &[]
    }
  }

  pub fn is_polymorphic(self) -> bool {
    !self.variants().is_empty()
  }
}

macro_rules! families {
  ( $( $(#[$meta:meta])* $name:ident = [ $( $slot:ident ),* ]; )* ) => {
    /// Variant-erased opcode bodies of the dispatch loop.
    #[derive(
    StrumDisplay, IntoStaticStr, EnumIter, TryFromPrimitive, IntoPrimitive,
    Clone,        Copy,          Eq, PartialEq,  Debug,            Hash
    )]
    #[strum(serialize_all = "snake_case")]
    #[repr(u8)]
    pub enum Family {
      $( $(#[$meta])* $name, )*
    }

    impl Family {
      /// The operand words following the opcode, in emission order.
      pub fn layout(self) -> &'static [Slot] {
        match self {
          $( Family::$name => &[ $( Slot::$slot ),* ], )*
        }
      }
    }
  };
}

families! {
  Return            = [];
  Send              = [];
  RemoveMessage     = [];
  Timeout           = [];
  IfEnd             = [];
  FuncInfo          = [Const, Const, Imm];
  Badmatch          = [];
  CaseEnd           = [];
  TryCaseEnd        = [];
  Jump              = [Label];

  Allocate          = [Imm];
  AllocateZero      = [Imm];
  Deallocate        = [Imm];
  Trim              = [Imm];
  Init              = [Dst];

  Move              = [Dst];
  PutList           = [Dst];
  GetList           = [Dst, Dst];
  GetTupleElement   = [Imm, Dst];
  PutTuple          = [Imm, Dst];
  Put               = [Imm];
  SetTupleElement   = [Dst, Imm];

  IsInteger         = [Label];
  IsFloat           = [Label];
  IsNumber          = [Label];
  IsAtom            = [Label];
  IsPid             = [Label];
  IsReference       = [Label];
  IsPort            = [Label];
  IsNil             = [Label];
  IsBinary          = [Label];
  IsList            = [Label];
  IsNonemptyList    = [Label];
  IsTuple           = [Label];
  IsFunction        = [Label];
  IsBoolean         = [Label];
  IsBitstr          = [Label];
  TestArity         = [Label, Imm];
  #[strum(serialize = "is_function2")]
  IsFunction2       = [Label];
  IsEqExact         = [Label];
  IsNeExact         = [Label];
  IsEq              = [Label];
  IsNe              = [Label];
  IsLt              = [Label];
  IsGe              = [Label];
  SelectVal         = [Label, VTable];
  SelectTupleArity  = [Label, ATable];

  Call              = [Imm, Label];
  CallOnly          = [Imm, Label];
  CallLast          = [Imm, Label, Imm];
  CallExt           = [Imm, Import];
  CallExtOnly       = [Imm, Import];
  CallExtLast       = [Imm, Import, Imm];
  Apply             = [Imm];
  ApplyLast         = [Imm, Imm];
  CallFun           = [Imm];
  MakeFun           = [Label, Imm, Imm];
  #[strum(serialize = "bif0")]
  Bif0              = [Import, Dst];
  #[strum(serialize = "bif1")]
  Bif1              = [Import, Label, Dst];
  #[strum(serialize = "bif2")]
  Bif2              = [Import, Label, Dst];

  LoopRec           = [Label, Dst];
  LoopRecEnd        = [Label];
  Wait              = [Label];
  WaitTimeout       = [Label];

  BsStartMatch      = [Label, Imm, Dst];
  BsGetInteger      = [Dst, Imm, Imm, Dst, Label];
  BsGetFloat        = [Dst, Imm, Imm, Dst, Label];
  BsGetBinary       = [Dst, Imm, Imm, Dst, Label];
  BsSkipBits        = [Dst, Imm, Imm, Label];
  BsTestTail        = [Dst, Imm, Label];
  BsTestUnit        = [Dst, Imm, Label];
  BsMatchString     = [Dst, Const, Label];
  #[strum(serialize = "bs_get_utf8")]
  BsGetUtf8         = [Dst, Imm, Dst, Label];
  #[strum(serialize = "bs_get_utf16")]
  BsGetUtf16        = [Dst, Imm, Dst, Label];
  #[strum(serialize = "bs_get_utf32")]
  BsGetUtf32        = [Dst, Imm, Dst, Label];
  #[strum(serialize = "bs_skip_utf8")]
  BsSkipUtf8        = [Dst, Imm, Label];
  #[strum(serialize = "bs_skip_utf16")]
  BsSkipUtf16       = [Dst, Imm, Label];
  #[strum(serialize = "bs_skip_utf32")]
  BsSkipUtf32       = [Dst, Imm, Label];
  BsSave            = [Dst, Imm];
  BsRestore         = [Dst, Imm];
  BsContextToBinary = [Dst];

  BsInit            = [Imm, Dst, Label];
  BsInitBits        = [Imm, Dst, Label];
  BsInitWritable    = [];
  BsPutInteger      = [Imm, Imm, Label];
  BsPutBinary       = [Imm, Imm, Label];
  BsPutFloat        = [Imm, Imm, Label];
  BsPutString       = [Const];
  #[strum(serialize = "bs_put_utf8")]
  BsPutUtf8         = [Imm, Label];
  #[strum(serialize = "bs_put_utf16")]
  BsPutUtf16        = [Imm, Label];
  #[strum(serialize = "bs_put_utf32")]
  BsPutUtf32        = [Imm, Label];
  #[strum(serialize = "bs_utf8_size")]
  BsUtf8Size        = [Dst, Label];
  #[strum(serialize = "bs_utf16_size")]
  BsUtf16Size       = [Dst, Label];
  BsAdd             = [Imm, Dst, Label];
  BsAppend          = [Imm, Imm, Dst, Label];
  BsPrivateAppend   = [Imm, Imm, Dst, Label];

  Catch             = [Y, Label];
  CatchEnd          = [Y];
  Try               = [Y, Label];
  TryEnd            = [Y];
  TryCase           = [Y];
  Raise             = [];

  Fmove             = [FSrc, FDst];
  Fconv             = [FSrc, FDst];
  Fadd              = [Fr, Fr, Fr];
  Fsub              = [Fr, Fr, Fr];
  Fmul              = [Fr, Fr, Fr];
  Fdiv              = [Fr, Fr, Fr];
  Fnegate           = [Fr, Fr];

  // Synthetic opcodes. These must stay last.
  FetchS            = [Src];
  FetchSS           = [Src, Src];
  EnsureCapacity    = [Imm];
}

impl Family {
  pub fn code(&self) -> u8 {
    Into::<u8>::into(*self)
  }

  /// The number of internal opcodes the family expands to.
  pub fn width(self) -> usize {
    self.layout()
        .iter()
        .filter(|slot| slot.is_polymorphic())
        .map(|slot| slot.variants().len())
        .product()
  }

  pub fn is_prefetch(self) -> bool {
    self == Family::FetchS || self == Family::FetchSS
  }
}

/// A decoded internal opcode: its family and the variants of its polymorphic slots.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Decoded {
  pub family : Family,
  variants   : [Variant; MAX_POLYMORPHIC],
  count      : usize,
}

impl Decoded {
  pub fn variants(&self) -> &[Variant] {
    &self.variants[..self.count]
  }

  /// The variant of the `k`-th polymorphic slot.
  pub fn variant(&self, k: usize) -> Variant {
    self.variants[k]
  }
}

impl Display for Decoded {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self.count {
      0 => write!(f, "{}", self.family),
      _ => {
        let suffix: String = self.variants().iter().map(Variant::to_string).collect();
        write!(f, "{}_{}", self.family, suffix)
      }
    }
  }
}

pub struct OpcodeTable {
  /// First opcode of each family, indexed by family code.
  base    : Vec<u16>,
  decoded : Vec<Decoded>,
}

impl OpcodeTable {

  fn build() -> OpcodeTable {
    let mut base    = vec![];
    let mut decoded = vec![];

    for family in Family::iter() {
      base.push(decoded.len() as u16);
      let radices: Vec<&'static [Variant]> = family.layout()
        .iter()
        .filter(|slot| slot.is_polymorphic())
        .map(|slot| slot.variants())
        .collect();
      debug_assert!(radices.len() <= MAX_POLYMORPHIC);

      for combination in 0..family.width() {
        let mut variants = [Variant::X; MAX_POLYMORPHIC];
        let mut rest = combination;
        for (k, choices) in radices.iter().enumerate().rev() {
          variants[k] = choices[rest % choices.len()];
          rest /= choices.len();
        }
        decoded.push(Decoded { family, variants, count: radices.len() });
      }
    }

    OpcodeTable { base, decoded }
  }

  /// The internal opcode executing `family` with the given slot variants.
  pub fn opcode(&self, family: Family, variants: &[Variant]) -> Option<u16> {
    let polymorphic = family.layout().iter().filter(|slot| slot.is_polymorphic());
    let mut count = 0;
    let mut offset = 0usize;
    for (slot, variant) in polymorphic.zip(variants.iter()) {
      let choices = slot.variants();
      let digit = choices.iter().position(|v| v == variant)?;
      offset = offset * choices.len() + digit;
      count += 1;
    }
    let expected = family.layout().iter().filter(|slot| slot.is_polymorphic()).count();
    match count == expected && variants.len() == expected {
      true  => Some(self.base[family.code() as usize] + offset as u16),
      false => None
    }
  }

  pub fn decode(&self, opcode: u16) -> Option<&Decoded> {
    self.decoded.get(opcode as usize)
  }

  pub fn len(&self) -> usize {
    self.decoded.len()
  }

  /// The reserved block of prefetch opcodes.
  pub fn prefetch_range(&self) -> Range<u16> {
    let start = self.base[Family::FetchS.code() as usize];
    let end   = self.base[Family::FetchSS.code() as usize] + Family::FetchSS.width() as u16;
    start..end
  }
}

lazy_static! {
  pub static ref OPCODES: OpcodeTable = OpcodeTable::build();
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_opcode_decodes_to_its_own_combination() {
    for opcode in 0..OPCODES.len() as u16 {
      let decoded = *OPCODES.decode(opcode).unwrap();
      assert_eq!(OPCODES.opcode(decoded.family, decoded.variants()), Some(opcode));
    }
    assert!(OPCODES.decode(OPCODES.len() as u16).is_none());
  }

  #[test]
  fn widths() {
    assert_eq!(Family::Return.width(), 1);
    assert_eq!(Family::Move.width(), 2);
    assert_eq!(Family::GetList.width(), 4);
    assert_eq!(Family::Fmove.width(), 12);
    assert_eq!(Family::FetchS.width(), 3);
    assert_eq!(Family::FetchSS.width(), 9);
  }

  #[test]
  fn prefetch_block_is_last_but_one_family() {
    let range = OPCODES.prefetch_range();
    assert_eq!(range.len(), 12);
    assert_eq!(range.end as usize + Family::EnsureCapacity.width(), OPCODES.len());
    for opcode in range {
      assert!(OPCODES.decode(opcode).unwrap().family.is_prefetch());
    }
  }

  #[test]
  fn same_kind_source_pairs_are_encodable() {
    for v in &[Variant::X, Variant::Y, Variant::C] {
      assert!(OPCODES.opcode(Family::FetchSS, &[*v, *v]).is_some());
    }
    assert!(OPCODES.opcode(Family::FetchS, &[Variant::F]).is_none());
    assert!(OPCODES.opcode(Family::Move, &[]).is_none());
  }

  #[test]
  fn names() {
    let opcode = OPCODES.opcode(Family::GetList, &[Variant::X, Variant::Y]).unwrap();
    assert_eq!(OPCODES.decode(opcode).unwrap().to_string(), "get_list_xy");
    let opcode = OPCODES.opcode(Family::Return, &[]).unwrap();
    assert_eq!(OPCODES.decode(opcode).unwrap().to_string(), "return");
  }
}
