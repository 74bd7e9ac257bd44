/*!
  The execution side of the machine.

  A `Process` holds everything one worker owns while it runs code: the register file of the
  running activation, the value stack shared by all activations on its call chain, the float
  registers, and the last fault caught by a handler. The dispatch loop in `interpreter` runs
  one activation at a time over a process. Calls that are not tail calls run the callee in a
  nested dispatch loop and restore the caller's register file when it returns.

  Running code ends in one of three ways: it returns a term, it raises a fault nobody caught,
  or it suspends. A suspended call chain is returned to the caller of `interpret` as a
  `Continuation`, which the scheduler resumes later, possibly on another thread.
*/

mod continuation;
mod exception;
mod interpreter;
mod runtime;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use prettytable::{format as TableFormat, Table};

use crate::error::{ExecError, InternalError};
use crate::functor::{ArityType, FunId};
use crate::linker::Callable;
use crate::module::Module;
use crate::term::Term;

pub use continuation::{Continuation, Resumption, SuspendReason};
pub use exception::{Fault, FaultClass, Handler, HandlerKind};
pub use runtime::{LocalRuntime, Runtime};

/// How running code ended, if it did not fault.
#[derive(Debug)]
pub enum Outcome {
  Return(Term),
  Suspend(Continuation),
}

impl Outcome {
  /// The returned term, if the code ran to completion.
  pub fn value(&self) -> Option<&Term> {
    match self {
      Outcome::Return(value) => Some(value),
      Outcome::Suspend(_)    => None
    }
  }
}

#[derive(Debug, Default)]
pub struct Process {
  pub registers      : Vec<Term>,
  pub stack          : Vec<Term>,
  pub fregs          : Vec<f64>,
  pub last_exception : Option<Fault>,
}

impl Process {

  pub fn new() -> Process {
    Process::default()
  }

  // region Register file

  /// Register `n`. Registers that were never written read as `[]`.
  pub fn x(&self, n: usize) -> Term {
    self.registers.get(n).cloned().unwrap_or_default()
  }

  pub fn set_x(&mut self, n: usize, term: Term) {
    if n >= self.registers.len() {
      self.registers.resize(n + 1, Term::Nil);
    }
    self.registers[n] = term;
  }

  /// Grows the register file to at least `n` slots. It never shrinks.
  pub fn ensure_registers(&mut self, n: usize) {
    if n > self.registers.len() {
      self.registers.resize(n, Term::Nil);
    }
  }

  // endregion

  // region Value stack

  /// Stack slot `y(n)`, counted from the top of the stack.
  pub fn y(&self, n: usize) -> Result<&Term, InternalError> {
    let depth = self.stack.len();
    match n < depth {
      true  => Ok(&self.stack[depth - 1 - n]),
      false => Err(InternalError::BadStackSlot { slot: n, depth })
    }
  }

  pub fn y_mut(&mut self, n: usize) -> Result<&mut Term, InternalError> {
    let depth = self.stack.len();
    match n < depth {
      true  => Ok(&mut self.stack[depth - 1 - n]),
      false => Err(InternalError::BadStackSlot { slot: n, depth })
    }
  }

  pub fn allocate(&mut self, n: usize) {
    self.stack.resize(self.stack.len() + n, Term::Nil);
  }

  // endregion

  // region Float registers

  pub fn fr(&self, n: usize) -> f64 {
    self.fregs.get(n).copied().unwrap_or(0.0)
  }

  pub fn set_fr(&mut self, n: usize, value: f64) {
    if n >= self.fregs.len() {
      self.fregs.resize(n + 1, 0.0);
    }
    self.fregs[n] = value;
  }

  // endregion

  // region Display methods

  fn make_register_table<T> (
      name      : &str,
      registers : &[T],
      reversed  : bool
    ) -> Table
    where T: Display
  {
    let mut table = Table::new();

    table.set_format(*TABLE_DISPLAY_FORMAT);
    table.set_titles(row![ubr->"Slot", ubl->"Contents"]);

    let count = registers.len();
    for i in 0..count {
      // The stack is listed top first, so that row n is y(n).
      let cell = match reversed {
        true  => &registers[count - 1 - i],
        false => &registers[i]
      };
      table.add_row(row![r->format!("{}{} =", name, i), format!("{}", cell)]);
    }
    table
  }

  // endregion
}

lazy_static! {
  pub(crate) static ref TABLE_DISPLAY_FORMAT: TableFormat::TableFormat =
    TableFormat::FormatBuilder::new()
      .column_separator('│')
      .borders(' ')
      .separator(
        TableFormat::LinePosition::Title,
        TableFormat::LineSeparator::new('─', '┼', ' ', ' ')
      )
      .separator(
        TableFormat::LinePosition::Bottom,
        TableFormat::LineSeparator::new('─', '┴', ' ', ' ')
      )
      .padding(1, 1)
      .build();
}

impl Display for Process {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let x_table = Process::make_register_table("x", &self.registers, false);
    let y_table = Process::make_register_table("y", &self.stack,     true);
    let f_table = Process::make_register_table("fr", &self.fregs,    false);

    let mut combined_table = table!([x_table, y_table, f_table]);

    combined_table.set_titles(row![ub->"Registers", ub->"Stack", ub->"Float Registers"]);
    combined_table.set_format(*TABLE_DISPLAY_FORMAT);

    match &self.last_exception {
      Some(fault) => write!(f, "Last exception: {}\n{}", fault, combined_table),
      None        => write!(f, "{}", combined_table)
    }
  }
}

// region Entry points

/**
  Runs the code of `module` from `start_pc` using the process's current register file as the
  argument vector.
*/
pub fn interpret(
  module  : &Arc<Module>,
  process : &mut Process,
  runtime : &mut dyn Runtime,
  start_pc: usize
) -> Result<Outcome, ExecError>
{
  let exit = interpreter::Machine::new(module.clone(), process, runtime, start_pc).run()?;
  interpreter::complete(process, runtime, exit)
}

/// Calls `callable` with `args`.
pub fn call(
  process  : &mut Process,
  runtime  : &mut dyn Runtime,
  callable : Callable,
  args     : Vec<Term>
) -> Result<Outcome, ExecError>
{
  if callable.arity() != args.len() {
    return Err(Fault::badarg().into());
  }
  interpreter::invoke(process, runtime, callable, args)
}

/// Calls `module:function` with `args`, resolving it through the runtime.
pub fn call_export(
  process  : &mut Process,
  runtime  : &mut dyn Runtime,
  module   : &str,
  function : &str,
  args     : Vec<Term>
) -> Result<Outcome, ExecError>
{
  let id = FunId::new(module, function, args.len() as ArityType);
  match runtime.resolve(&id) {
    Some(callable) => interpreter::invoke(process, runtime, callable, args),
    None           => Err(Fault::undef().into())
  }
}

// endregion
