/*!
  The linking context. A `Linker` owns the loaded modules and the native functions, and resolves
  each module's imports into that module's write-once import table. Nothing here is global:
  independent linkers can link independent sets of modules concurrently.
*/

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::functor::{Atom, ArityType, FunId};
use crate::module::Module;
use crate::natives;
use crate::term::{Closure, Term};
use crate::vm::{Fault, Runtime};

/// A function implemented by the runtime rather than by module code.
pub type NativeFn = Arc<dyn Fn(&mut dyn Runtime, &[Term]) -> Result<Term, Fault> + Send + Sync>;

/// Something that can be called: the target of an import, an `apply`, or a fun.
#[derive(Clone)]
pub enum Callable {
  Native {
    id       : FunId,
    function : NativeFn
  },
  Function {
    module : Arc<Module>,
    entry  : usize,
    arity  : usize
  },
  Closure(Arc<Closure>),
}

impl Callable {
  /// The number of arguments the callable expects.
  pub fn arity(&self) -> usize {
    match self {
      Callable::Native { id, .. }      => id.arity as usize,
      Callable::Function { arity, .. } => *arity,
      Callable::Closure(closure)       => closure.arity,
    }
  }
}

impl Debug for Callable {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Callable::Native { id, .. } => write!(f, "Native({})", id),
      Callable::Function { module, entry, arity } => {
        write!(f, "Function({}@{}/{})", module.name(), entry, arity)
      }
      Callable::Closure(closure) => write!(f, "{:?}", closure),
    }
  }
}

pub struct Linker {
  modules : HashMap<Atom, Arc<Module>>,
  natives : HashMap<FunId, NativeFn>,
}

impl Linker {

  pub fn new() -> Linker {
    Linker {
      modules : HashMap::new(),
      natives : HashMap::new()
    }
  }

  /// A linker that already knows the standard `erlang` built-ins.
  pub fn with_erlang_natives() -> Linker {
    let mut linker = Linker::new();
    natives::register_erlang(&mut linker);
    linker
  }

  /// Defines a native. It is only ever handed exactly `arity` arguments; any other count is `badarg`.
  pub fn define_native<F>(&mut self, module: &str, function: &str, arity: ArityType, native: F)
    where F: Fn(&mut dyn Runtime, &[Term]) -> Result<Term, Fault> + Send + Sync + 'static
  {
    let checked = move |runtime: &mut dyn Runtime, args: &[Term]| {
      match args.len() == arity as usize {
        true  => native(runtime, args),
        false => Err(Fault::badarg())
      }
    };
    self.natives.insert(FunId::new(module, function, arity), Arc::new(checked));
  }

  /// Adds a module, replacing any module of the same name. Its imports are not linked yet.
  pub fn load(&mut self, module: Module) -> Arc<Module> {
    let module = Arc::new(module);
    self.modules.insert(module.name().clone(), module.clone());
    module
  }

  pub fn module(&self, name: &Atom) -> Option<&Arc<Module>> {
    self.modules.get(name)
  }

  /// Natives take precedence over module exports.
  pub fn resolve(&self, id: &FunId) -> Option<Callable> {
    if let Some(native) = self.natives.get(id) {
      return Some(Callable::Native { id: id.clone(), function: native.clone() });
    }
    let module = self.modules.get(&id.module)?;
    let entry = module.export_entry(&id.function, id.arity)?;
    Some(Callable::Function {
      module : module.clone(),
      entry,
      arity  : id.arity as usize
    })
  }

  /**
    Binds every still unbound import of `module`. Imports used in guard context only bind to
    natives. Returns the imports that could not be resolved; calling one of them raises `undef`.
  */
  pub fn link(&self, module: &Module) -> Vec<FunId> {
    let mut unresolved = vec![];
    for (index, import) in module.imports().iter().enumerate() {
      if module.import_target(index).is_some() {
        continue;
      }
      let target = self.resolve(&import.id).filter(|callable| {
        match callable {
          Callable::Native { .. } => true,
          _                       => !import.guard
        }
      });
      match target {
        Some(callable) => {
          module.bind_import(index, callable);
        }
        None => unresolved.push(import.id.clone())
      }
    }
    unresolved
  }

  /// Links every loaded module. Returns all unresolved imports.
  pub fn link_all(&self) -> Vec<FunId> {
    self.modules.values().flat_map(|module| self.link(module)).collect()
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::bytecode::{Encoder, Instruction, Operation};
  use crate::operand::Operand;

  fn caller() -> Module {
    let mut encoder = Encoder::new("caller");
    encoder.function("go", 0, 2, &[
      Instruction::new(Operation::Label, vec![Operand::Int(1)]),
      Instruction::new(Operation::FuncInfo, vec![Operand::atom("caller"), Operand::atom("go"), Operand::Int(0)]),
      Instruction::new(Operation::Label, vec![Operand::Int(2)]),
      Instruction::new(Operation::CallExtOnly, vec![Operand::Int(0), Operand::extfunc("callee", "f", 0)]),
      Instruction::new(Operation::CallExtOnly, vec![Operand::Int(0), Operand::extfunc("nowhere", "g", 0)]),
    ]).unwrap();
    encoder.export("go", 0);
    encoder.finish().unwrap()
  }

  fn callee() -> Module {
    let mut encoder = Encoder::new("callee");
    encoder.function("f", 0, 2, &[
      Instruction::new(Operation::Label, vec![Operand::Int(1)]),
      Instruction::new(Operation::FuncInfo, vec![Operand::atom("callee"), Operand::atom("f"), Operand::Int(0)]),
      Instruction::new(Operation::Label, vec![Operand::Int(2)]),
      Instruction::new(Operation::Return, vec![]),
    ]).unwrap();
    encoder.export("f", 0);
    encoder.finish().unwrap()
  }

  #[test]
  fn resolves_exports_and_reports_missing() {
    let mut linker = Linker::new();
    let caller = linker.load(caller());
    linker.load(callee());
    let unresolved = linker.link(&caller);
    assert_eq!(unresolved, vec![FunId::new("nowhere", "g", 0)]);
    match caller.import_target(0) {
      Some(Callable::Function { module, .. }) => assert_eq!(module.name(), &Atom::from("callee")),
      other => panic!("unexpected binding {:?}", other),
    }
    // Linking again leaves existing bindings alone.
    assert_eq!(linker.link(&caller).len(), 1);
  }

  #[test]
  fn natives_take_precedence() {
    let mut linker = Linker::new();
    linker.load(callee());
    linker.define_native("callee", "f", 0, |_, _| Ok(Term::atom("native")));
    match linker.resolve(&FunId::new("callee", "f", 0)) {
      Some(Callable::Native { id, .. }) => assert_eq!(id.function, Atom::from("f")),
      other => panic!("unexpected resolution {:?}", other),
    }
  }
}
