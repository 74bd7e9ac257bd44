//! Operands of symbolic instructions, and the operand variants internal opcodes are specialized on.

use std::fmt::{Display, Formatter};

use crate::functor::{Atom, FunId};
use crate::term::Term;

// Register and stack indices fit in one instruction word.
pub type SlotIndex = u16;

#[derive(Clone, PartialEq, Debug)]
pub enum Operand {
  /// A slot of the register file.
  X(SlotIndex),
  /// A slot of the value stack, counted from the top.
  Y(SlotIndex),
  /// A floating point register.
  Fr(SlotIndex),
  /// An integer, either a constant or an untyped immediate such as an arity or a count.
  Int(i64),
  Atom(Atom),
  Nil,
  /// Any other constant: floats, tuples, lists, binaries.
  Literal(Term),
  /// A label number. Label `0` means "no fail label".
  Label(u32),
  /// An imported function.
  Extfunc(FunId),
  /// The value/label pairs of a select instruction.
  List(Vec<Operand>),
}

impl Operand {
  pub fn atom(name: &str) -> Operand {
    Operand::Atom(Atom::from(name))
  }

  pub fn extfunc(module: &str, function: &str, arity: u32) -> Operand {
    Operand::Extfunc(FunId::new(module, function, arity))
  }

  /// The term a constant operand denotes.
  pub fn constant(&self) -> Option<Term> {
    match self {
      Operand::Int(i)     => Some(Term::Integer(*i)),
      Operand::Atom(a)    => Some(Term::Atom(a.clone())),
      Operand::Nil        => Some(Term::Nil),
      Operand::Literal(t) => Some(t.clone()),
      _                   => None
    }
  }

  pub fn is_register(&self) -> bool {
    match self {
      Operand::X(_) | Operand::Y(_) => true,
      _                             => false
    }
  }
}

impl Display for Operand {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Operand::X(i)        => write!(f, "{{x,{}}}", i),
      Operand::Y(i)        => write!(f, "{{y,{}}}", i),
      Operand::Fr(i)       => write!(f, "{{fr,{}}}", i),
      Operand::Int(i)      => write!(f, "{{integer,{}}}", i),
      Operand::Atom(a)     => write!(f, "{{atom,{}}}", Term::Atom(a.clone())),
      Operand::Nil         => write!(f, "nil"),
      Operand::Literal(t)  => write!(f, "{{literal,{}}}", t),
      Operand::Label(l)    => write!(f, "{{f,{}}}", l),
      Operand::Extfunc(id) => {
        write!(f, "{{extfunc,{},{},{}}}", Term::Atom(id.module.clone()), Term::Atom(id.function.clone()), id.arity)
      }
      Operand::List(items) => {
        let items: Vec<String> = items.iter().map(Operand::to_string).collect();
        write!(f, "{{list,[{}]}}", items.join(","))
      }
    }
  }
}

/**
  The kinds an operand may resolve to in encoded code. A polymorphic operand position resolves
  to one of these, and the resolved variants select the concrete internal opcode. Variants are
  always tried in this order: register, stack, constant, float register.
*/
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Variant {
  X,
  Y,
  C,
  F,
}

impl Display for Variant {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let letter = match self {
      Variant::X => 'x',
      Variant::Y => 'y',
      Variant::C => 'c',
      Variant::F => 'f',
    };
    write!(f, "{}", letter)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn constants() {
    assert_eq!(Operand::Int(3).constant(), Some(Term::Integer(3)));
    assert_eq!(Operand::atom("ok").constant(), Some(Term::atom("ok")));
    assert_eq!(Operand::X(0).constant(), None);
    assert!(Operand::Y(2).is_register());
  }

  #[test]
  fn display() {
    let list = Operand::List(vec![Operand::atom("a"), Operand::Label(4)]);
    assert_eq!(format!("{}", list), "{list,[{atom,a},{f,4}]}");
    assert_eq!(format!("{}", Operand::extfunc("erlang", "+", 2)), "{extfunc,erlang,'+',2}");
  }
}
