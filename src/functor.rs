//! Function identities. A function is only known after linking by its module, its name and its
//! arity, so a `FunId` carries all three.

use std::fmt::{Display, Formatter};

use string_cache::DefaultAtom;

/// Atoms are interned strings. Clones are cheap and comparison is a pointer comparison.
pub type Atom = DefaultAtom;

pub type ArityType = u32;

/**
  The `FunId` struct represents a symbol `m:f/n`. As with all strings in this codebase, the module
  and function names are interned. Note that `m:f/2 != m:f/3`: functions are the same if and only
  if their module, name, and arity are all the same.
*/
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FunId {
  pub module   : Atom,
  pub function : Atom,
  pub arity    : ArityType,
}

impl FunId {
  pub fn new(module: &str, function: &str, arity: ArityType) -> FunId {
    FunId {
      module   : Atom::from(module),
      function : Atom::from(function),
      arity
    }
  }
}

impl Display for FunId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}/{}", self.module, self.function, self.arity)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn arity_distinguishes_functions() {
    let f2 = FunId::new("lists", "map", 2);
    let f3 = FunId::new("lists", "map", 3);
    assert_ne!(f2, f3);
    assert_eq!(f2, FunId::new("lists", "map", 2));
    assert_eq!(format!("{}", f3), "lists:map/3");
  }
}
