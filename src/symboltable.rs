use bimap::BiMap;

use crate::functor::{Atom, ArityType};

/// A local function of a module, `name/arity`.
pub type FunctionName = (Atom, ArityType);

/**
  The function table of a module maps each function `f/n` to its entry offset in code memory, and
  records where each function's code starts so that a code offset can be attributed to the
  function containing it. Entry offsets are unique, so the name/entry mapping is kept in a BiMap.
*/
#[derive(Debug)]
pub struct FunctionTable {
  entries : BiMap<FunctionName, usize>,
  // Sorted by start offset.
  starts  : Vec<(usize, FunctionName)>,
}

impl FunctionTable {

  pub fn new() -> FunctionTable {
    FunctionTable {
      entries : BiMap::new(),
      starts  : vec![]
    }
  }

  pub fn get_entry(&self, name: &Atom, arity: ArityType) -> Option<usize> {
    self.entries.get_by_left(&(name.clone(), arity)).copied()
  }

  pub fn get_function(&self, entry: usize) -> Option<&FunctionName> {
    self.entries.get_by_right(&entry)
  }

  /// The function whose code contains `pc`.
  pub fn enclosing(&self, pc: usize) -> Option<&FunctionName> {
    match self.starts.binary_search_by(|(start, _)| start.cmp(&pc)) {
      Ok(i)  => Some(&self.starts[i].1),
      Err(0) => None,
      Err(i) => Some(&self.starts[i - 1].1),
    }
  }

  /// Fails, returning the rejected pair, if the function or the entry is already present.
  pub fn insert(&mut self, function: FunctionName, start: usize, entry: usize)
    -> Result<(), (FunctionName, usize)>
  {
    self.entries.insert_no_overwrite(function.clone(), entry)?;
    let at = self.starts.partition_point(|(s, _)| *s <= start);
    self.starts.insert(at, (start, function));
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&FunctionName, &usize)> {
    self.entries.iter()
  }
}
