/*!
  The encoder turns the symbolic instructions of a module into the 16 bit code array executed by
  the dispatch loop.

  For every instruction, the operands are classified (register, stack slot, constant, float
  register) and the classification selects the concrete internal opcode of the instruction's
  family. Source operands are not encoded in the instruction itself: a `fetch_s`/`fetch_s_s`
  prefetch opcode specialized on the source variants is emitted ahead of it. Constants go to
  the module's constant pool, select lists to its jump tables and external functions to its
  import table. Labels are resolved to code offsets once the whole module has been seen.

  Every function entry begins with an `ensure_capacity` opcode carrying the number of registers
  the function uses, so that the register file never has to grow in the middle of a function.
*/

use std::collections::HashMap;
use std::convert::TryFrom;

use crate::error::EncodeError;
use crate::functor::{Atom, ArityType, FunId};
use crate::module::{ArityJumpTable, Export, Import, Module, ValueJumpTable};
use crate::operand::{Operand, Variant};
use crate::symboltable::{FunctionName, FunctionTable};
use crate::term::Term;

use super::instruction::{Instruction, Operation};
use super::opcode::{Family, NO_LABEL, OPCODES};

/// A word whose value is only known once all labels are bound.
enum Word {
  Raw(u16),
  Label(u32),
}

struct Function {
  name  : FunctionName,
  start : usize,
  entry : u32,
}

pub struct Encoder {
  name         : Atom,
  code         : Vec<u16>,
  constants    : Vec<Term>,
  value_tables : Vec<Vec<(Term, u32)>>,
  arity_tables : Vec<Vec<(usize, u32)>>,
  imports      : Vec<Import>,
  labels       : HashMap<u32, usize>,
  fixups       : Vec<(usize, u32)>,
  functions    : Vec<Function>,
  exports      : Vec<FunctionName>,

  // State of the function being encoded
  entry_label  : Option<u32>,
  capacity_at  : Option<usize>,
  registers    : usize,
  tuple_pos    : u16,
}

impl Encoder {

  pub fn new(module: &str) -> Encoder {
    Encoder {
      name         : Atom::from(module),
      code         : vec![],
      constants    : vec![],
      value_tables : vec![],
      arity_tables : vec![],
      imports      : vec![],
      labels       : HashMap::new(),
      fixups       : vec![],
      functions    : vec![],
      exports      : vec![],
      entry_label  : None,
      capacity_at  : None,
      registers    : 0,
      tuple_pos    : 0,
    }
  }

  /// Marks `name/arity` as exported. The function may be encoded before or after this call.
  pub fn export(&mut self, name: &str, arity: ArityType) -> &mut Self {
    self.exports.push((Atom::from(name), arity));
    self
  }

  /**
    Encodes the body of function `name/arity`, whose entry point is label `entry_label`. The body
    is the full instruction sequence of the function as decoded, including its `label` and
    `func_info` instructions.
  */
  pub fn function(&mut self, name: &str, arity: ArityType, entry_label: u32, body: &[Instruction])
    -> Result<(), EncodeError>
  {
    let start = self.code.len();
    self.entry_label = Some(entry_label);
    self.capacity_at = None;
    self.registers   = arity as usize;
    self.tuple_pos   = 0;

    for instruction in body {
      self.encode(instruction)?;
    }

    let name = (Atom::from(name), arity);
    match self.capacity_at {
      Some(at) => {
        self.code[at] = u16::try_from(self.registers).map_err(|_| EncodeError::CodeTooLarge)?;
      }
      None => {
        return Err(EncodeError::MissingEntry { function: name.0, arity, label: entry_label });
      }
    }
    self.entry_label = None;
    self.functions.push(Function { name, start, entry: entry_label });
    Ok(())
  }

  /// Resolves labels, builds the tables and produces the module.
  pub fn finish(self) -> Result<Module, EncodeError> {
    let Encoder {
      name,
      mut code,
      constants,
      value_tables,
      arity_tables,
      imports,
      labels,
      fixups,
      functions,
      exports,
      ..
    } = self;

    let resolve = |label: u32| -> Result<usize, EncodeError> {
      labels.get(&label).copied().ok_or(EncodeError::UndefinedLabel(label))
    };

    for (at, label) in fixups {
      let offset = resolve(label)?;
      code[at] = u16::try_from(offset)
          .ok()
          .filter(|word| *word != NO_LABEL)
          .ok_or(EncodeError::CodeTooLarge)?;
    }

    let value_tables = value_tables
      .into_iter()
      .map(|table| {
        let entries = table.into_iter()
                           .map(|(value, label)| Ok((value, resolve(label)?)))
                           .collect::<Result<Vec<_>, EncodeError>>()?;
        Ok(ValueJumpTable::new(entries))
      })
      .collect::<Result<Vec<_>, EncodeError>>()?;

    let arity_tables = arity_tables
      .into_iter()
      .map(|table| {
        let entries = table.into_iter()
                           .map(|(arity, label)| Ok((arity, resolve(label)?)))
                           .collect::<Result<Vec<_>, EncodeError>>()?;
        Ok(ArityJumpTable::new(entries))
      })
      .collect::<Result<Vec<_>, EncodeError>>()?;

    let mut table = FunctionTable::new();
    for function in functions {
      let entry = resolve(function.entry)?;
      table.insert(function.name, function.start, entry)
           .map_err(|((name, arity), _)| EncodeError::DuplicateFunction(name, arity))?;
    }

    let exports = exports
      .into_iter()
      .map(|(function, arity)| {
        match table.get_entry(&function, arity) {
          Some(entry) => Ok(Export { function, arity, entry }),
          None        => Err(EncodeError::UndefinedExport(function, arity))
        }
      })
      .collect::<Result<Vec<_>, EncodeError>>()?;

    #[cfg(feature = "trace_computation")]
    println!(
      "Encoded module {}: {} words, {} constants, {} imports, {} exports",
      name, code.len(), constants.len(), imports.len(), exports.len()
    );

    Ok(Module::new(name, code, constants, value_tables, arity_tables, table, exports, imports))
  }

  // region Tables

  fn constant(&mut self, term: Term) -> Result<u16, EncodeError> {
    if let Some(index) = self.constants.iter().position(|c| c.exact_eq(&term)) {
      return Ok(index as u16);
    }
    let index = Encoder::next_index(self.constants.len(), "constant")?;
    self.constants.push(term);
    Ok(index)
  }

  fn import(&mut self, id: &FunId, guard: bool) -> Result<u16, EncodeError> {
    if let Some(index) = self.imports.iter().position(|i| i.id == *id && i.guard == guard) {
      return Ok(index as u16);
    }
    let index = Encoder::next_index(self.imports.len(), "import")?;
    self.imports.push(Import { id: id.clone(), guard });
    Ok(index)
  }

  fn next_index(len: usize, table: &'static str) -> Result<u16, EncodeError> {
    match u16::try_from(len) {
      Ok(index) if index != u16::MAX => Ok(index),
      _                              => Err(EncodeError::TableOverflow(table))
    }
  }

  fn note_registers(&mut self, count: usize) {
    self.registers = self.registers.max(count);
  }

  // endregion

  fn bind_label(&mut self, label: u32) -> Result<(), EncodeError> {
    if self.labels.insert(label, self.code.len()).is_some() {
      return Err(EncodeError::DuplicateLabel(label));
    }
    if self.entry_label == Some(label) {
      let opcode = OPCODES.opcode(Family::EnsureCapacity, &[])
                          .ok_or(EncodeError::NoOpcode { family: Family::EnsureCapacity, variants: vec![] })?;
      self.code.push(opcode);
      self.capacity_at = Some(self.code.len());
      self.code.push(0);
    }
    Ok(())
  }

  fn encode(&mut self, instruction: &Instruction) -> Result<(), EncodeError> {
    use Operation::*;

    let operation = instruction.operation;
    if instruction.operands.len() != operation.arity() {
      return Err(EncodeError::WrongArity {
        operation,
        expected : operation.arity(),
        found    : instruction.operands.len()
      });
    }
    if operation.is_annotation() {
      return Ok(());
    }

    if operation == Label {
      let label = match &instruction.operands[0] {
        Operand::Int(n) if *n > 0 && *n <= u32::MAX as i64 => *n as u32,
        Operand::Label(n) if *n > 0                         => *n,
        other => {
          return Err(EncodeError::UnexpectedOperand {
            operation,
            index    : 0,
            expected : "a label number",
            found    : other.clone()
          });
        }
      };
      return self.bind_label(label);
    }

    if operation == PutTuple {
      self.tuple_pos = 0;
    }

    let mut e = Emit::new(self, instruction);
    match operation {
      FuncInfo => {
        e.atom(0)?.atom(1)?.imm(2)?;
        e.finish(Family::FuncInfo)
      }

      Return         => e.finish(Family::Return),
      Send           => e.finish(Family::Send),
      RemoveMessage  => e.finish(Family::RemoveMessage),
      Timeout        => e.finish(Family::Timeout),
      IfEnd          => e.finish(Family::IfEnd),
      BsInitWritable => e.finish(Family::BsInitWritable),

      Jump       => { e.label(0)?; e.finish(Family::Jump) }
      Badmatch   => { e.src(0)?; e.finish(Family::Badmatch) }
      CaseEnd    => { e.src(0)?; e.finish(Family::CaseEnd) }
      TryCaseEnd => { e.src(0)?; e.finish(Family::TryCaseEnd) }

      // region Stack

      Allocate         => { e.imm(0)?.skip(1)?; e.finish(Family::Allocate) }
      AllocateZero     => { e.imm(0)?.skip(1)?; e.finish(Family::AllocateZero) }
      AllocateHeap     => { e.imm(0)?.skip(1)?.skip(2)?; e.finish(Family::Allocate) }
      AllocateHeapZero => { e.imm(0)?.skip(1)?.skip(2)?; e.finish(Family::AllocateZero) }
      Init             => { e.dst(0)?; e.finish(Family::Init) }
      Trim             => { e.imm(0)?.skip(1)?; e.finish(Family::Trim) }
      Deallocate       => { e.imm(0)?; e.finish(Family::Deallocate) }

      // endregion

      // region Data

      Move            => { e.src(0)?.dst(1)?; e.finish(Family::Move) }
      PutList         => { e.src(0)?.src(1)?.dst(2)?; e.finish(Family::PutList) }
      GetList         => { e.src(0)?.dst(1)?.dst(2)?; e.finish(Family::GetList) }
      GetTupleElement => { e.src(0)?.imm(1)?.dst(2)?; e.finish(Family::GetTupleElement) }
      PutTuple        => { e.imm(0)?.dst(1)?; e.finish(Family::PutTuple) }
      Put             => {
        e.src(0)?;
        e.encoder.tuple_pos += 1;
        let position = e.encoder.tuple_pos;
        e.raw(position);
        e.finish(Family::Put)
      }
      SetTupleElement => { e.src(0)?.dst(1)?.imm(2)?; e.finish(Family::SetTupleElement) }

      // endregion

      // region Tests

      IsInteger      => e.test(Family::IsInteger),
      IsFloat        => e.test(Family::IsFloat),
      IsNumber       => e.test(Family::IsNumber),
      IsAtom         => e.test(Family::IsAtom),
      IsPid          => e.test(Family::IsPid),
      IsReference    => e.test(Family::IsReference),
      IsPort         => e.test(Family::IsPort),
      IsNil          => e.test(Family::IsNil),
      IsBinary       => e.test(Family::IsBinary),
      IsList         => e.test(Family::IsList),
      IsNonemptyList => e.test(Family::IsNonemptyList),
      IsTuple        => e.test(Family::IsTuple),
      IsFunction     => e.test(Family::IsFunction),
      IsBoolean      => e.test(Family::IsBoolean),
      IsBitstr       => e.test(Family::IsBitstr),
      TestArity      => { e.src(1)?.label(0)?.imm(2)?; e.finish(Family::TestArity) }
      IsFunction2    => e.comparison(Family::IsFunction2),
      IsEqExact      => e.comparison(Family::IsEqExact),
      IsNeExact      => e.comparison(Family::IsNeExact),
      IsEq           => e.comparison(Family::IsEq),
      IsNe           => e.comparison(Family::IsNe),
      IsLt           => e.comparison(Family::IsLt),
      IsGe           => e.comparison(Family::IsGe),

      SelectVal        => { e.src(0)?.label(1)?.value_table(2)?; e.finish(Family::SelectVal) }
      SelectTupleArity => { e.src(0)?.label(1)?.arity_table(2)?; e.finish(Family::SelectTupleArity) }

      // endregion

      // region Calls

      Call        => { e.call_arity(0, 0)?.label(1)?; e.finish(Family::Call) }
      CallOnly    => { e.call_arity(0, 0)?.label(1)?; e.finish(Family::CallOnly) }
      CallLast    => { e.call_arity(0, 0)?.label(1)?.imm(2)?; e.finish(Family::CallLast) }
      CallExt     => { let n = e.arity(0)?; e.call_arity(0, 0)?.import(1, n, false)?; e.finish(Family::CallExt) }
      CallExtOnly => { let n = e.arity(0)?; e.call_arity(0, 0)?.import(1, n, false)?; e.finish(Family::CallExtOnly) }
      CallExtLast => {
        let n = e.arity(0)?;
        e.call_arity(0, 0)?.import(1, n, false)?.imm(2)?;
        e.finish(Family::CallExtLast)
      }
      // Module and function follow the arguments.
      Apply       => { e.call_arity(0, 2)?; e.finish(Family::Apply) }
      ApplyLast   => { e.call_arity(0, 2)?.imm(1)?; e.finish(Family::ApplyLast) }
      // The fun follows the arguments.
      CallFun     => { e.call_arity(0, 1)?; e.finish(Family::CallFun) }
      MakeFun2    => { e.label(0)?.imm(1)?.call_arity(2, 0)?; e.finish(Family::MakeFun) }

      Bif0   => { e.import(0, 0, false)?.dst(1)?; e.finish(Family::Bif0) }
      Bif1   => {
        let guard = e.has_fail_label(0);
        e.src(2)?.import(1, 1, guard)?.label(0)?.dst(3)?;
        e.finish(Family::Bif1)
      }
      Bif2   => {
        let guard = e.has_fail_label(0);
        e.src(2)?.src(3)?.import(1, 2, guard)?.label(0)?.dst(4)?;
        e.finish(Family::Bif2)
      }
      GcBif1 => {
        let guard = e.has_fail_label(0);
        e.skip(1)?.src(3)?.import(2, 1, guard)?.label(0)?.dst(4)?;
        e.finish(Family::Bif1)
      }
      GcBif2 => {
        let guard = e.has_fail_label(0);
        e.skip(1)?.src(3)?.src(4)?.import(2, 2, guard)?.label(0)?.dst(5)?;
        e.finish(Family::Bif2)
      }

      // endregion

      // region Messages

      LoopRec     => { e.label(0)?.dst(1)?; e.finish(Family::LoopRec) }
      LoopRecEnd  => { e.label(0)?; e.finish(Family::LoopRecEnd) }
      Wait        => { e.label(0)?; e.finish(Family::Wait) }
      WaitTimeout => { e.src(1)?.label(0)?; e.finish(Family::WaitTimeout) }

      // endregion

      // region Binary matching

      BsStartMatch2 => {
        e.skip(2)?.src(1)?.label(0)?.imm(3)?.dst(4)?;
        e.finish(Family::BsStartMatch)
      }
      BsGetInteger2 => e.bs_get(Family::BsGetInteger),
      BsGetFloat2   => e.bs_get(Family::BsGetFloat),
      BsGetBinary2  => e.bs_get(Family::BsGetBinary),
      BsSkipBits2   => {
        e.src(2)?.dst(1)?.imm(3)?.imm(4)?.label(0)?;
        e.finish(Family::BsSkipBits)
      }
      BsTestTail2   => { e.dst(1)?.imm(2)?.label(0)?; e.finish(Family::BsTestTail) }
      BsTestUnit    => { e.dst(1)?.imm(2)?.label(0)?; e.finish(Family::BsTestUnit) }
      BsMatchString => { e.dst(1)?.bits(2)?.label(0)?; e.finish(Family::BsMatchString) }
      BsGetUtf8     => e.bs_get_utf(Family::BsGetUtf8),
      BsGetUtf16    => e.bs_get_utf(Family::BsGetUtf16),
      BsGetUtf32    => e.bs_get_utf(Family::BsGetUtf32),
      BsSkipUtf8    => e.bs_skip_utf(Family::BsSkipUtf8),
      BsSkipUtf16   => e.bs_skip_utf(Family::BsSkipUtf16),
      BsSkipUtf32   => e.bs_skip_utf(Family::BsSkipUtf32),
      BsSave2       => { e.dst(0)?.save_slot(1)?; e.finish(Family::BsSave) }
      BsRestore2    => { e.dst(0)?.save_slot(1)?; e.finish(Family::BsRestore) }
      BsContextToBinary => { e.dst(0)?; e.finish(Family::BsContextToBinary) }

      // endregion

      // region Binary construction

      BsInit2      => {
        e.skip(2)?.skip(3)?.src(1)?.imm(4)?.dst(5)?.label(0)?;
        e.finish(Family::BsInit)
      }
      BsInitBits   => {
        e.skip(2)?.skip(3)?.src(1)?.imm(4)?.dst(5)?.label(0)?;
        e.finish(Family::BsInitBits)
      }
      BsPutInteger => e.bs_put(Family::BsPutInteger),
      BsPutBinary  => e.bs_put(Family::BsPutBinary),
      BsPutFloat   => e.bs_put(Family::BsPutFloat),
      BsPutString  => { e.bits(0)?; e.finish(Family::BsPutString) }
      BsPutUtf8    => { e.src(2)?.imm(1)?.label(0)?; e.finish(Family::BsPutUtf8) }
      BsPutUtf16   => { e.src(2)?.imm(1)?.label(0)?; e.finish(Family::BsPutUtf16) }
      BsPutUtf32   => { e.src(2)?.imm(1)?.label(0)?; e.finish(Family::BsPutUtf32) }
      BsUtf8Size   => { e.src(1)?.dst(2)?.label(0)?; e.finish(Family::BsUtf8Size) }
      BsUtf16Size  => { e.src(1)?.dst(2)?.label(0)?; e.finish(Family::BsUtf16Size) }
      BsAdd        => {
        e.src(1)?.src(2)?.imm(3)?.dst(4)?.label(0)?;
        e.finish(Family::BsAdd)
      }
      BsAppend     => {
        e.skip(2)?.skip(3)?.src(1)?.src(5)?.imm(4)?.imm(6)?.dst(7)?.label(0)?;
        e.finish(Family::BsAppend)
      }
      BsPrivateAppend => {
        e.src(1)?.src(3)?.imm(2)?.imm(4)?.dst(5)?.label(0)?;
        e.finish(Family::BsPrivateAppend)
      }

      // endregion

      // region Exceptions

      Catch    => { e.y(0)?.label(1)?; e.finish(Family::Catch) }
      CatchEnd => { e.y(0)?; e.finish(Family::CatchEnd) }
      Try      => { e.y(0)?.label(1)?; e.finish(Family::Try) }
      TryEnd   => { e.y(0)?; e.finish(Family::TryEnd) }
      TryCase  => { e.y(0)?; e.finish(Family::TryCase) }
      Raise    => { e.src(0)?.src(1)?; e.finish(Family::Raise) }

      // endregion

      // region Floating point

      Fmove   => { e.fsrc(0)?.fdst(1)?; e.finish(Family::Fmove) }
      Fconv   => { e.fsrc(0)?.fdst(1)?; e.finish(Family::Fconv) }
      Fadd    => { e.skip_label(0)?.fr(1)?.fr(2)?.fr(3)?; e.finish(Family::Fadd) }
      Fsub    => { e.skip_label(0)?.fr(1)?.fr(2)?.fr(3)?; e.finish(Family::Fsub) }
      Fmul    => { e.skip_label(0)?.fr(1)?.fr(2)?.fr(3)?; e.finish(Family::Fmul) }
      Fdiv    => { e.skip_label(0)?.fr(1)?.fr(2)?.fr(3)?; e.finish(Family::Fdiv) }
      Fnegate => { e.skip_label(0)?.fr(1)?.fr(2)?; e.finish(Family::Fnegate) }

      // endregion

      Label | Line | IntCodeEnd | TestHeap | Fclearerror | Fcheckerror => Ok(()),
    }
  }
}

/**
  Collects the encoding of one instruction. Operands are visited in the order of the family's
  layout, which is not necessarily the order of the symbolic operands; each accessor takes the
  index of the symbolic operand it encodes.
*/
struct Emit<'e> {
  encoder     : &'e mut Encoder,
  instruction : &'e Instruction,
  sources     : Vec<(Variant, u16)>,
  variants    : Vec<Variant>,
  words       : Vec<Word>,
}

impl<'e> Emit<'e> {

  fn new(encoder: &'e mut Encoder, instruction: &'e Instruction) -> Emit<'e> {
    Emit {
      encoder,
      instruction,
      sources  : vec![],
      variants : vec![],
      words    : vec![]
    }
  }

  fn operand(&self, index: usize) -> &'e Operand {
    let instruction: &'e Instruction = self.instruction;
    &instruction.operands[index]
  }

  fn unexpected(&self, index: usize, expected: &'static str) -> EncodeError {
    EncodeError::UnexpectedOperand {
      operation : self.instruction.operation,
      index,
      expected,
      found     : self.operand(index).clone()
    }
  }

  fn out_of_range(&self, index: usize, value: i64) -> EncodeError {
    EncodeError::OutOfRange { operation: self.instruction.operation, index, value }
  }

  fn raw(&mut self, word: u16) {
    self.words.push(Word::Raw(word));
  }

  fn note_register(&mut self, operand: &Operand) {
    if let Operand::X(n) = operand {
      self.encoder.note_registers(*n as usize + 1);
    }
  }

  fn has_fail_label(&self, index: usize) -> bool {
    match self.operand(index) {
      Operand::Label(0) => false,
      Operand::Label(_) => true,
      _                 => false
    }
  }

  // region Operand kinds

  /// A source operand, decoded ahead of the instruction by a prefetch opcode.
  fn src(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let operand = self.operand(index);
    let source = match operand {
      Operand::X(n) => (Variant::X, *n),
      Operand::Y(n) => (Variant::Y, *n),
      other         => match other.constant() {
        Some(term) => (Variant::C, self.encoder.constant(term)?),
        None       => return Err(self.unexpected(index, "a register, a stack slot or a constant"))
      }
    };
    if self.sources.len() == 2 {
      return Err(EncodeError::TooManySources { operation: self.instruction.operation });
    }
    self.note_register(operand);
    self.sources.push(source);
    Ok(self)
  }

  fn dst(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let operand = self.operand(index);
    let (variant, word) = match operand {
      Operand::X(n) => (Variant::X, *n),
      Operand::Y(n) => (Variant::Y, *n),
      _             => return Err(self.unexpected(index, "a register or a stack slot"))
    };
    self.note_register(operand);
    self.variants.push(variant);
    self.raw(word);
    Ok(self)
  }

  fn fsrc(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let operand = self.operand(index);
    let (variant, word) = match operand {
      Operand::X(n)  => (Variant::X, *n),
      Operand::Y(n)  => (Variant::Y, *n),
      Operand::Fr(n) => (Variant::F, *n),
      other          => match other.constant() {
        Some(term) => (Variant::C, self.encoder.constant(term)?),
        None       => return Err(self.unexpected(index, "a register, a stack slot, a float register or a constant"))
      }
    };
    self.note_register(operand);
    self.variants.push(variant);
    self.raw(word);
    Ok(self)
  }

  fn fdst(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let operand = self.operand(index);
    let (variant, word) = match operand {
      Operand::X(n)  => (Variant::X, *n),
      Operand::Y(n)  => (Variant::Y, *n),
      Operand::Fr(n) => (Variant::F, *n),
      _              => return Err(self.unexpected(index, "a register, a stack slot or a float register"))
    };
    self.note_register(operand);
    self.variants.push(variant);
    self.raw(word);
    Ok(self)
  }

  fn fr(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Fr(n) => {
        self.raw(*n);
        Ok(self)
      }
      _ => Err(self.unexpected(index, "a float register"))
    }
  }

  fn y(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Y(n) => {
        self.raw(*n);
        Ok(self)
      }
      _ => Err(self.unexpected(index, "a stack slot"))
    }
  }

  fn integer(&self, index: usize) -> Result<i64, EncodeError> {
    match self.operand(index) {
      Operand::Int(n) => Ok(*n),
      _               => Err(self.unexpected(index, "an integer"))
    }
  }

  fn imm(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let value = self.integer(index)?;
    let word = u16::try_from(value).map_err(|_| self.out_of_range(index, value))?;
    self.raw(word);
    Ok(self)
  }

  fn arity(&self, index: usize) -> Result<usize, EncodeError> {
    let value = self.integer(index)?;
    usize::try_from(value).map_err(|_| self.out_of_range(index, value))
  }

  /// A count of arguments, which also tells how many registers the instruction touches.
  fn call_arity(&mut self, index: usize, extra: usize) -> Result<&mut Self, EncodeError> {
    let value = self.integer(index)?;
    let word = u16::try_from(value).map_err(|_| self.out_of_range(index, value))?;
    self.encoder.note_registers(word as usize + extra);
    self.raw(word);
    Ok(self)
  }

  /// A match context save slot. `-1` denotes the start of the match.
  fn save_slot(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let value = match self.operand(index) {
      Operand::Atom(a) if &**a == "start" => -1,
      _                                   => self.integer(index)?
    };
    let word = i16::try_from(value).map_err(|_| self.out_of_range(index, value))?;
    self.raw(word as u16);
    Ok(self)
  }

  /// An operand that is validated but not encoded, such as a live register count.
  fn skip(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    self.integer(index)?;
    Ok(self)
  }

  fn skip_label(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Label(_) => Ok(self),
      _                 => Err(self.unexpected(index, "a label"))
    }
  }

  fn label(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Label(0) => self.raw(NO_LABEL),
      Operand::Label(n) => self.words.push(Word::Label(*n)),
      _                 => return Err(self.unexpected(index, "a label"))
    }
    Ok(self)
  }

  fn atom(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Atom(a) => {
        let word = self.encoder.constant(Term::Atom(a.clone()))?;
        self.raw(word);
        Ok(self)
      }
      _ => Err(self.unexpected(index, "an atom"))
    }
  }

  /// A literal bit string, pooled as a constant.
  fn bits(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Literal(term @ Term::Binary(_)) => {
        let word = self.encoder.constant(term.clone())?;
        self.raw(word);
        Ok(self)
      }
      _ => Err(self.unexpected(index, "a literal bit string"))
    }
  }

  /// An external function, which must take the `arity` arguments the instruction passes it.
  fn import(&mut self, index: usize, arity: usize, guard: bool) -> Result<&mut Self, EncodeError> {
    match self.operand(index) {
      Operand::Extfunc(id) if id.arity as usize != arity => {
        Err(self.unexpected(index, "an external function taking the arguments passed to it"))
      }
      Operand::Extfunc(id) => {
        let word = self.encoder.import(id, guard)?;
        self.raw(word);
        Ok(self)
      }
      _ => Err(self.unexpected(index, "an external function"))
    }
  }

  fn value_table(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let items = match self.operand(index) {
      Operand::List(items) if items.len() % 2 == 0 => items,
      _ => return Err(self.unexpected(index, "a list of value/label pairs"))
    };
    let mut table = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
      match (pair[0].constant(), &pair[1]) {
        (Some(value), Operand::Label(label)) => table.push((value, *label)),
        _ => return Err(self.unexpected(index, "a list of value/label pairs"))
      }
    }
    let word = Encoder::next_index(self.encoder.value_tables.len(), "value jump")?;
    self.encoder.value_tables.push(table);
    self.raw(word);
    Ok(self)
  }

  fn arity_table(&mut self, index: usize) -> Result<&mut Self, EncodeError> {
    let items = match self.operand(index) {
      Operand::List(items) if items.len() % 2 == 0 => items,
      _ => return Err(self.unexpected(index, "a list of arity/label pairs"))
    };
    let mut table = Vec::with_capacity(items.len() / 2);
    for pair in items.chunks(2) {
      match (&pair[0], &pair[1]) {
        (Operand::Int(arity), Operand::Label(label)) if *arity >= 0 => {
          table.push((*arity as usize, *label))
        }
        _ => return Err(self.unexpected(index, "a list of arity/label pairs"))
      }
    }
    let word = Encoder::next_index(self.encoder.arity_tables.len(), "arity jump")?;
    self.encoder.arity_tables.push(table);
    self.raw(word);
    Ok(self)
  }

  // endregion

  // region Shapes shared by several operations

  /// `op(Fail, Src)`
  fn test(&mut self, family: Family) -> Result<(), EncodeError> {
    self.src(1)?.label(0)?;
    self.finish(family)
  }

  /// `op(Fail, Src1, Src2)`
  fn comparison(&mut self, family: Family) -> Result<(), EncodeError> {
    self.src(1)?.src(2)?.label(0)?;
    self.finish(family)
  }

  /// `op(Fail, Ctx, Live, Size, Unit, Flags, Dst)`
  fn bs_get(&mut self, family: Family) -> Result<(), EncodeError> {
    self.skip(2)?.src(3)?.dst(1)?.imm(4)?.imm(5)?.dst(6)?.label(0)?;
    self.finish(family)
  }

  /// `op(Fail, Ctx, Live, Flags, Dst)`
  fn bs_get_utf(&mut self, family: Family) -> Result<(), EncodeError> {
    self.skip(2)?.dst(1)?.imm(3)?.dst(4)?.label(0)?;
    self.finish(family)
  }

  /// `op(Fail, Ctx, Live, Flags)`
  fn bs_skip_utf(&mut self, family: Family) -> Result<(), EncodeError> {
    self.skip(2)?.dst(1)?.imm(3)?.label(0)?;
    self.finish(family)
  }

  /// `op(Fail, Size, Unit, Flags, Src)`
  fn bs_put(&mut self, family: Family) -> Result<(), EncodeError> {
    self.src(1)?.src(4)?.imm(2)?.imm(3)?.label(0)?;
    self.finish(family)
  }

  // endregion

  /// Emits the prefetch opcode, if any, then the instruction itself.
  fn finish(&mut self, family: Family) -> Result<(), EncodeError> {
    if !self.sources.is_empty() {
      let fetch = match self.sources.len() {
        1 => Family::FetchS,
        _ => Family::FetchSS,
      };
      let variants: Vec<Variant> = self.sources.iter().map(|(v, _)| *v).collect();
      let opcode = OPCODES.opcode(fetch, &variants)
                          .ok_or_else(|| EncodeError::NoOpcode { family: fetch, variants: variants.clone() })?;
      self.encoder.code.push(opcode);
      for (_, word) in &self.sources {
        self.encoder.code.push(*word);
      }
    }

    let opcode = OPCODES.opcode(family, &self.variants)
                        .ok_or_else(|| EncodeError::NoOpcode { family, variants: self.variants.clone() })?;
    self.encoder.code.push(opcode);
    for word in self.words.drain(..) {
      match word {
        Word::Raw(raw)     => self.encoder.code.push(raw),
        Word::Label(label) => {
          self.encoder.fixups.push((self.encoder.code.len(), label));
          self.encoder.code.push(0);
        }
      }
    }
    if self.encoder.code.len() >= NO_LABEL as usize {
      return Err(EncodeError::CodeTooLarge);
    }
    Ok(())
  }
}
