/*!
  A `Module` is the artifact produced by the encoder: the code array of 16 bit instruction words,
  the constant pool, the jump tables, and the export and import descriptors. Everything but the
  import table is immutable once built. Each import table entry is written at most once, by a
  `Linker`, before code that calls it runs.
*/

use std::collections::HashMap;
use std::fmt::Write;

use once_cell::sync::OnceCell;

use crate::bytecode::{Decoded, Slot, OPCODES, NO_LABEL};
use crate::functor::{Atom, ArityType, FunId};
use crate::linker::Callable;
use crate::operand::Variant;
use crate::symboltable::{FunctionName, FunctionTable};
use crate::term::Term;

#[derive(Clone, Debug, PartialEq)]
pub struct Export {
  pub function : Atom,
  pub arity    : ArityType,
  pub entry    : usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Import {
  pub id    : FunId,
  /// Whether the import is called from guard context, where only natives may be bound.
  pub guard : bool,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
enum Key {
  Integer(i64),
  Atom(Atom),
}

/**
  The value to label table of a `select_val`. Integer and atom keys are hashed; keys of other
  types are compared one by one with exact equality.
*/
#[derive(Debug, Default)]
pub struct ValueJumpTable {
  keyed  : HashMap<Key, usize>,
  linear : Vec<(Term, usize)>,
}

impl ValueJumpTable {
  pub fn new(entries: Vec<(Term, usize)>) -> ValueJumpTable {
    let mut table = ValueJumpTable::default();
    for (value, target) in entries {
      match value {
        Term::Integer(i) => { table.keyed.entry(Key::Integer(i)).or_insert(target); }
        Term::Atom(a)    => { table.keyed.entry(Key::Atom(a)).or_insert(target); }
        other            => table.linear.push((other, target)),
      }
    }
    table
  }

  pub fn lookup(&self, value: &Term) -> Option<usize> {
    match value {
      Term::Integer(i) => self.keyed.get(&Key::Integer(*i)).copied(),
      Term::Atom(a)    => self.keyed.get(&Key::Atom(a.clone())).copied(),
      other            => self.linear
                              .iter()
                              .find(|(candidate, _)| candidate.exact_eq(other))
                              .map(|(_, target)| *target),
    }
  }

  pub fn len(&self) -> usize {
    self.keyed.len() + self.linear.len()
  }
}

/// The arity to label table of a `select_tuple_arity`.
#[derive(Debug, Default)]
pub struct ArityJumpTable {
  // Sorted by arity.
  entries: Vec<(usize, usize)>,
}

impl ArityJumpTable {
  pub fn new(mut entries: Vec<(usize, usize)>) -> ArityJumpTable {
    entries.sort_by_key(|(arity, _)| *arity);
    entries.dedup_by_key(|(arity, _)| *arity);
    ArityJumpTable { entries }
  }

  pub fn lookup(&self, arity: usize) -> Option<usize> {
    self.entries
        .binary_search_by_key(&arity, |(a, _)| *a)
        .ok()
        .map(|i| self.entries[i].1)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

pub struct Module {
  name         : Atom,
  code         : Vec<u16>,
  constants    : Vec<Term>,
  value_tables : Vec<ValueJumpTable>,
  arity_tables : Vec<ArityJumpTable>,
  functions    : FunctionTable,
  exports      : Vec<Export>,
  imports      : Vec<Import>,
  bindings     : Vec<OnceCell<Callable>>,
}

impl Module {

  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    name         : Atom,
    code         : Vec<u16>,
    constants    : Vec<Term>,
    value_tables : Vec<ValueJumpTable>,
    arity_tables : Vec<ArityJumpTable>,
    functions    : FunctionTable,
    exports      : Vec<Export>,
    imports      : Vec<Import>,
  ) -> Module {
    let bindings = imports.iter().map(|_| OnceCell::new()).collect();
    Module {
      name,
      code,
      constants,
      value_tables,
      arity_tables,
      functions,
      exports,
      imports,
      bindings
    }
  }

  // region Accessors

  pub fn name(&self) -> &Atom {
    &self.name
  }

  pub fn code(&self) -> &[u16] {
    &self.code
  }

  pub fn constants(&self) -> &[Term] {
    &self.constants
  }

  pub fn constant(&self, index: u16) -> &Term {
    &self.constants[index as usize]
  }

  pub fn value_table(&self, index: u16) -> &ValueJumpTable {
    &self.value_tables[index as usize]
  }

  pub fn arity_table(&self, index: u16) -> &ArityJumpTable {
    &self.arity_tables[index as usize]
  }

  pub fn functions(&self) -> &FunctionTable {
    &self.functions
  }

  pub fn exports(&self) -> &[Export] {
    &self.exports
  }

  pub fn imports(&self) -> &[Import] {
    &self.imports
  }

  pub fn export_entry(&self, function: &Atom, arity: ArityType) -> Option<usize> {
    self.exports
        .iter()
        .find(|e| e.function == *function && e.arity == arity)
        .map(|e| e.entry)
  }

  /// The function containing code offset `pc`.
  pub fn function_at(&self, pc: usize) -> Option<&FunctionName> {
    self.functions.enclosing(pc)
  }

  // endregion

  // region Imports

  /// Binds import `index` to `target`. Returns `false` if it was already bound.
  pub fn bind_import(&self, index: usize, target: Callable) -> bool {
    match self.bindings.get(index) {
      Some(cell) => cell.set(target).is_ok(),
      None       => false
    }
  }

  pub fn import_target(&self, index: usize) -> Option<&Callable> {
    self.bindings.get(index).and_then(OnceCell::get)
  }

  // endregion

  // region Disassembly

  fn operand_text(&self, slot: Slot, variant: Option<Variant>, word: u16) -> String {
    let register = |variant: Variant| match variant {
      Variant::X => format!("x{}", word),
      Variant::Y => format!("y{}", word),
      Variant::F => format!("fr{}", word),
      Variant::C => match self.constants.get(word as usize) {
        Some(term) => term.to_string(),
        None       => format!("const#{}", word)
      }
    };
    match (slot, variant) {
      (_, Some(variant)) => register(variant),
      (Slot::Label, _)   => match word {
        NO_LABEL => "-".to_string(),
        offset   => format!("@{}", offset)
      },
      (Slot::Fr, _)      => register(Variant::F),
      (Slot::Y, _)       => register(Variant::Y),
      (Slot::Const, _)   => register(Variant::C),
      (Slot::VTable, _)  => format!("values#{}", word),
      (Slot::ATable, _)  => format!("arities#{}", word),
      (Slot::Import, _)  => match self.imports.get(word as usize) {
        Some(import) => import.id.to_string(),
        None         => format!("import#{}", word)
      },
      _                  => word.to_string(),
    }
  }

  /**
    Renders the instruction at `pc` and returns it together with the offset of the next
    instruction, or `None` if `pc` does not hold a valid opcode.
  */
  pub fn instruction_at(&self, pc: usize) -> Option<(String, usize)> {
    let decoded: &Decoded = OPCODES.decode(*self.code.get(pc)?)?;
    let layout = decoded.family.layout();
    if pc + layout.len() >= self.code.len() {
      return None;
    }
    let mut text = decoded.to_string();
    let mut polymorphic = 0;
    for (i, slot) in layout.iter().enumerate() {
      let variant = match slot.is_polymorphic() {
        true  => {
          polymorphic += 1;
          Some(decoded.variant(polymorphic - 1))
        }
        false => None
      };
      let separator = if i == 0 { " " } else { ", " };
      text.push_str(separator);
      text.push_str(&self.operand_text(*slot, variant, self.code[pc + 1 + i]));
    }
    Some((text, pc + 1 + layout.len()))
  }

  /// A listing of the whole code array, one instruction per line.
  pub fn disassemble(&self) -> String {
    let mut listing = String::new();
    let mut pc = 0;
    while pc < self.code.len() {
      if let Some((name, arity)) = self.functions.get_function(pc) {
        let _ = writeln!(listing, "{}/{}:", Term::Atom(name.clone()), arity);
      }
      match self.instruction_at(pc) {
        Some((text, next)) => {
          let _ = writeln!(listing, "{:>6}  {}", pc, text);
          pc = next;
        }
        None => {
          let _ = writeln!(listing, "{:>6}  ??? {}", pc, self.code[pc]);
          pc += 1;
        }
      }
    }
    listing
  }

  // endregion
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn value_table_lookup() {
    let table = ValueJumpTable::new(vec![
      (Term::Integer(1), 10),
      (Term::atom("a"), 20),
      (Term::Float(1.0), 30),
      (Term::tuple(vec![Term::Nil]), 40),
    ]);
    assert_eq!(table.len(), 4);
    assert_eq!(table.lookup(&Term::Integer(1)), Some(10));
    assert_eq!(table.lookup(&Term::atom("a")), Some(20));
    assert_eq!(table.lookup(&Term::Float(1.0)), Some(30));
    assert_eq!(table.lookup(&Term::tuple(vec![Term::Nil])), Some(40));
    assert_eq!(table.lookup(&Term::Integer(2)), None);
  }

  #[test]
  fn arity_table_lookup() {
    let table = ArityJumpTable::new(vec![(3, 7), (0, 5), (1, 6)]);
    assert_eq!(table.lookup(0), Some(5));
    assert_eq!(table.lookup(3), Some(7));
    assert_eq!(table.lookup(2), None);
  }
}
