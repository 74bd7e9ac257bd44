//! Erlang-level faults and the handler frames that catch them.

use std::str::FromStr;
use std::sync::Arc;

use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::atoms;
use crate::functor::Atom;
use crate::term::Term;

#[derive(StrumDisplay, EnumString, IntoStaticStr, Clone, Copy, Eq, PartialEq, Debug, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum FaultClass {
  Error,
  Exit,
  Throw,
}

impl FaultClass {
  pub fn atom(self) -> Atom {
    Atom::from(Into::<&'static str>::into(self))
  }

  pub fn from_atom(atom: &Atom) -> Option<FaultClass> {
    FaultClass::from_str(atom).ok()
  }
}

/**
  A typed Erlang exception. The trace lists `{Module, Function, Arity}` tuples, innermost first,
  one for each activation the fault has left without being caught.
*/
#[derive(Clone, Debug, Error)]
#[error("{class}: {reason}")]
pub struct Fault {
  pub class  : FaultClass,
  pub reason : Term,
  pub trace  : Vec<Term>,
}

impl Fault {

  pub fn new(class: FaultClass, reason: Term) -> Fault {
    Fault { class, reason, trace: vec![] }
  }

  pub fn error(reason: Term) -> Fault {
    Fault::new(FaultClass::Error, reason)
  }

  pub fn exit(reason: Term) -> Fault {
    Fault::new(FaultClass::Exit, reason)
  }

  pub fn throw(value: Term) -> Fault {
    Fault::new(FaultClass::Throw, value)
  }

  // region Standard reasons

  pub fn badarg() -> Fault {
    Fault::error(Term::Atom(atoms::BADARG.clone()))
  }

  pub fn badarith() -> Fault {
    Fault::error(Term::Atom(atoms::BADARITH.clone()))
  }

  pub fn badmatch(value: Term) -> Fault {
    Fault::error(Term::tuple(vec![Term::Atom(atoms::BADMATCH.clone()), value]))
  }

  pub fn case_clause(value: Term) -> Fault {
    Fault::error(Term::tuple(vec![Term::Atom(atoms::CASE_CLAUSE.clone()), value]))
  }

  pub fn try_clause(value: Term) -> Fault {
    Fault::error(Term::tuple(vec![Term::Atom(atoms::TRY_CLAUSE.clone()), value]))
  }

  pub fn if_clause() -> Fault {
    Fault::error(Term::Atom(atoms::IF_CLAUSE.clone()))
  }

  pub fn function_clause() -> Fault {
    Fault::error(Term::Atom(atoms::FUNCTION_CLAUSE.clone()))
  }

  pub fn undef() -> Fault {
    Fault::error(Term::Atom(atoms::UNDEF.clone()))
  }

  pub fn badfun(value: Term) -> Fault {
    Fault::error(Term::tuple(vec![Term::Atom(atoms::BADFUN.clone()), value]))
  }

  pub fn badarity(fun: Term, args: Vec<Term>) -> Fault {
    Fault::error(Term::tuple(vec![
      Term::Atom(atoms::BADARITY.clone()),
      Term::tuple(vec![fun, Term::list(args)])
    ]))
  }

  // endregion

  pub fn trace_term(&self) -> Term {
    Term::list(self.trace.clone())
  }

  /// The value an old-style `catch` delivers for this fault.
  pub fn catch_value(&self) -> Term {
    let exit = || Term::Atom(atoms::EXIT.clone());
    match self.class {
      FaultClass::Throw => self.reason.clone(),
      FaultClass::Exit  => Term::tuple(vec![exit(), self.reason.clone()]),
      FaultClass::Error => {
        Term::tuple(vec![exit(), Term::tuple(vec![self.reason.clone(), self.trace_term()])])
      }
    }
  }

  pub(crate) fn frame(module: &Atom, function: &Atom, arity: u32) -> Term {
    Term::tuple(vec![
      Term::Atom(module.clone()),
      Term::Atom(function.clone()),
      Term::Integer(arity as i64)
    ])
  }

  pub(crate) fn push_frame(&mut self, module: &Atom, function: &Atom, arity: u32) {
    self.trace.push(Fault::frame(module, function, arity));
  }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HandlerKind {
  /// Old-style `catch Expr`: the handler receives one value in x0.
  Catch,
  /// `try ... catch`: the handler receives class, reason and trace in x0, x1 and x2.
  Try,
}

/**
  One frame of the handler chain. Frames are immutable and linked to the frame that was current
  when they were established; the chain is shared between the activation and the stack slot that
  marks the protected region.
*/
#[derive(Debug)]
pub struct Handler {
  pub kind     : HandlerKind,
  /// Code offset at which execution resumes.
  pub label    : usize,
  /// Value stack depth to restore.
  pub depth    : usize,
  pub previous : Option<Arc<Handler>>,
}
