/*!
  The dispatch loop.

  A `Machine` runs one activation: it fetches an internal opcode, decodes it into its family and
  operand variants, and executes the family's body, which reads exactly the operand words the
  encoder emitted for it. Source operands were already decoded by a preceding prefetch opcode
  into `prefetched`.

  Every test-like instruction follows the same convention: on success execution continues with
  the next instruction, on failure it continues at the fail label. An instruction without a fail
  label raises `badarg` instead.

  A fault raised by a body, or by a callee, is handed to the innermost handler established in
  this activation. Without one, the fault leaves the activation with the activation's function
  appended to its trace.
*/

mod binary;

use std::mem;
use std::sync::Arc;

use crate::atoms;
use crate::bits::BitBuilder;
use crate::bytecode::{Decoded, Family, NO_LABEL, OPCODES};
use crate::error::{ExecError, InternalError};
use crate::functor::{ArityType, FunId};
use crate::linker::Callable;
use crate::module::Module;
use crate::operand::Variant;
use crate::term::{Closure, Fun, Term};

use super::continuation::{Continuation, SavedFrame, Wake};
use super::{Fault, Handler, HandlerKind, Outcome, Process, Runtime};

/// A register or stack slot written by an instruction.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Dest {
  X(u16),
  Y(u16),
}

struct TupleBuilder {
  dest     : Dest,
  elements : Vec<Term>,
  arity    : usize,
}

/// The interpreter-local state of an activation.
#[derive(Default)]
pub(crate) struct Frame {
  pub(crate) pc         : usize,
  last_pc               : usize,
  /// Stack depth on entry. The stack must be back at this depth when the activation exits.
  stack_base            : usize,
  handlers              : Option<Arc<Handler>>,
  tuple                 : Option<TupleBuilder>,
  bits                  : Option<(BitBuilder, Dest)>,
  prefetched            : [Term; 2],
  /// Set when resuming from a yield, so the interrupted call does not yield again.
  pub(crate) skip_yield : bool,
}

/// How an activation ended.
pub(crate) enum Exit {
  Return(Term),
  TailCall(Callable, Vec<Term>),
  Suspend(Continuation),
}

pub(crate) enum Flow {
  Next,
  Exit(Exit),
}

pub(crate) struct Machine<'a> {
  module  : Arc<Module>,
  process : &'a mut Process,
  runtime : &'a mut dyn Runtime,
  frame   : Frame,
}

impl<'a> Machine<'a> {

  pub(crate) fn new(
    module  : Arc<Module>,
    process : &'a mut Process,
    runtime : &'a mut dyn Runtime,
    pc      : usize
  ) -> Machine<'a>
  {
    let frame = Frame {
      pc,
      last_pc    : pc,
      stack_base : process.stack.len(),
      ..Frame::default()
    };
    Machine { module, process, runtime, frame }
  }

  pub(crate) fn resume(
    module  : Arc<Module>,
    process : &'a mut Process,
    runtime : &'a mut dyn Runtime,
    frame   : Frame
  ) -> Machine<'a>
  {
    Machine { module, process, runtime, frame }
  }

  /// Delivers a callee's result to a resumed caller.
  pub(crate) fn deliver(&mut self, value: Term) {
    self.process.set_x(0, value);
  }

  pub(crate) fn run(&mut self) -> Result<Exit, ExecError> {
    loop {
      self.frame.last_pc = self.frame.pc;
      match self.step() {
        Ok(Flow::Next)               => {}
        Ok(Flow::Exit(exit))         => return Ok(exit),
        Err(ExecError::Fault(fault)) => self.handle_fault(fault)?,
        Err(internal)                => return Err(internal),
      }
    }
  }

  /// Transfers control to the innermost handler, or lets the fault leave the activation.
  pub(crate) fn handle_fault(&mut self, mut fault: Fault) -> Result<(), ExecError> {
    if let Some((function, arity)) = self.module.function_at(self.frame.last_pc) {
      fault.push_frame(self.module.name(), function, *arity);
    }

    let handler = match self.frame.handlers.take() {
      Some(handler) => handler,
      None          => {
        self.process.stack.truncate(self.frame.stack_base);
        #[cfg(feature = "trace_computation")]
        println!("Uncaught {} leaves {}\n{}", fault, self.module.name(), self.process);
        return Err(fault.into());
      }
    };

    #[cfg(feature = "trace_computation")]
    println!("Caught {}, continuing at {}", fault, handler.label);

    self.process.stack.truncate(handler.depth);
    self.frame.tuple = None;
    self.frame.bits  = None;
    match handler.kind {
      HandlerKind::Catch => self.process.set_x(0, fault.catch_value()),
      HandlerKind::Try   => {
        self.process.set_x(0, Term::Atom(fault.class.atom()));
        self.process.set_x(1, fault.reason.clone());
        self.process.set_x(2, fault.trace_term());
      }
    }
    self.process.last_exception = Some(fault);
    self.frame.handlers = handler.previous.clone();
    self.frame.pc = handler.label;
    Ok(())
  }

  // region Operand access

  fn fetch(&mut self) -> Result<u16, InternalError> {
    let pc = self.frame.pc;
    match self.module.code().get(pc) {
      Some(word) => {
        self.frame.pc += 1;
        Ok(*word)
      }
      None => Err(InternalError::BadJump { pc, from: self.frame.last_pc })
    }
  }

  fn label(&mut self) -> Result<Option<usize>, InternalError> {
    match self.fetch()? {
      NO_LABEL => Ok(None),
      target   => Ok(Some(target as usize))
    }
  }

  /// A label the instruction cannot do without.
  fn target(&mut self) -> Result<usize, InternalError> {
    let from = self.frame.last_pc;
    self.label()?.ok_or(InternalError::BadJump { pc: NO_LABEL as usize, from })
  }

  fn dest(&mut self, variant: Variant) -> Result<Dest, InternalError> {
    let word = self.fetch()?;
    match variant {
      Variant::Y => Ok(Dest::Y(word)),
      _          => Ok(Dest::X(word)),
    }
  }

  fn y_index(&self, n: u16) -> Result<usize, InternalError> {
    let depth = self.process.stack.len().saturating_sub(self.frame.stack_base);
    match (n as usize) < depth {
      true  => Ok(n as usize),
      false => Err(InternalError::BadStackSlot { slot: n as usize, depth })
    }
  }

  fn source(&self, variant: Variant, word: u16) -> Result<Term, InternalError> {
    match variant {
      Variant::X => Ok(self.process.x(word as usize)),
      Variant::Y => self.process.y(self.y_index(word)?).map(Clone::clone),
      Variant::C => Ok(self.module.constant(word).clone()),
      Variant::F => Ok(Term::Float(self.process.fr(word as usize))),
    }
  }

  fn read(&self, at: Dest) -> Result<Term, InternalError> {
    match at {
      Dest::X(n) => Ok(self.process.x(n as usize)),
      Dest::Y(n) => self.process.y(self.y_index(n)?).map(Clone::clone),
    }
  }

  fn slot_mut(&mut self, at: Dest) -> Result<&mut Term, InternalError> {
    match at {
      Dest::X(n) => {
        self.process.ensure_registers(n as usize + 1);
        Ok(&mut self.process.registers[n as usize])
      }
      Dest::Y(n) => {
        let index = self.y_index(n)?;
        self.process.y_mut(index)
      }
    }
  }

  fn write(&mut self, at: Dest, term: Term) -> Result<(), InternalError> {
    *self.slot_mut(at)? = term;
    Ok(())
  }

  /// Takes the value left by the preceding prefetch opcode.
  fn prefetched(&mut self, i: usize) -> Term {
    mem::take(&mut self.frame.prefetched[i])
  }

  fn arguments(&self, arity: usize) -> Vec<Term> {
    (0..arity).map(|i| self.process.x(i)).collect()
  }

  // endregion

  // region Control helpers

  fn fail(&mut self, label: Option<usize>) -> Result<Flow, ExecError> {
    match label {
      Some(target) => {
        self.frame.pc = target;
        Ok(Flow::Next)
      }
      None => Err(Fault::badarg().into())
    }
  }

  /// Continues at the next instruction when `passed`, otherwise at the fail label.
  fn branch(&mut self, passed: bool, label: Option<usize>) -> Result<Flow, ExecError> {
    match passed {
      true  => Ok(Flow::Next),
      false => self.fail(label)
    }
  }

  fn suspend(&mut self, wake: Wake) -> Flow {
    let saved = SavedFrame {
      module    : self.module.clone(),
      frame     : mem::take(&mut self.frame),
      registers : mem::take(&mut self.process.registers),
      wake
    };
    Flow::Exit(Exit::Suspend(Continuation::new(saved)))
  }

  /// Suspends before the current instruction if the runtime asks for it.
  fn yield_point(&mut self) -> Option<Flow> {
    if mem::replace(&mut self.frame.skip_yield, false) {
      return None;
    }
    match self.runtime.should_yield() {
      true  => {
        self.frame.pc = self.frame.last_pc;
        Some(self.suspend(Wake::Yield { retry: true }))
      }
      false => None
    }
  }

  fn check_balance(&self) -> Result<(), InternalError> {
    let found = self.process.stack.len();
    match found == self.frame.stack_base {
      true  => Ok(()),
      false => Err(InternalError::StackImbalance { expected: self.frame.stack_base, found })
    }
  }

  fn deallocate(&mut self, n: usize) -> Result<(), InternalError> {
    let depth = self.process.stack.len() - self.frame.stack_base;
    match n <= depth {
      true  => {
        let keep = self.process.stack.len() - n;
        self.process.stack.truncate(keep);
        Ok(())
      }
      false => Err(InternalError::StackImbalance { expected: self.frame.stack_base + n, found: self.process.stack.len() })
    }
  }

  // endregion

  // region Calls

  fn import(&self, index: u16) -> Result<Callable, Fault> {
    self.module
        .import_target(index as usize)
        .cloned()
        .ok_or_else(Fault::undef)
  }

  /// Calls an import that must be a native, as bifs do.
  fn call_bif(&mut self, index: u16, args: &[Term]) -> Result<Term, Fault> {
    match self.module.import_target(index as usize) {
      Some(Callable::Native { function, .. }) => {
        let function = function.clone();
        function(&mut *self.runtime, args)
      }
      _ => Err(Fault::undef())
    }
  }

  fn apply_target(&self, arity: usize) -> Result<Callable, Fault> {
    let module   = self.process.x(arity);
    let function = self.process.x(arity + 1);
    match (module.as_atom(), function.as_atom()) {
      (Some(module), Some(function)) => {
        let id = FunId {
          module   : module.clone(),
          function : function.clone(),
          arity    : arity as ArityType
        };
        self.runtime.resolve(&id).ok_or_else(Fault::undef)
      }
      _ => Err(Fault::badarg())
    }
  }

  fn fun_target(&self, fun: Term, args: &[Term]) -> Result<Callable, Fault> {
    match &fun {
      Term::Fun(Fun::Closure(closure)) if closure.arity == args.len() => {
        Ok(Callable::Closure(closure.clone()))
      }
      Term::Fun(Fun::Export(id)) if id.arity as usize == args.len() => {
        self.runtime.resolve(id).ok_or_else(Fault::undef)
      }
      Term::Fun(_) => Err(Fault::badarity(fun.clone(), args.to_vec())),
      _            => Err(Fault::badfun(fun.clone()))
    }
  }

  /// A call that returns here. The caller's register file is restored around the callee.
  fn call_nested(&mut self, callable: Callable, args: Vec<Term>) -> Result<Flow, ExecError> {
    if let Callable::Native { function, .. } = &callable {
      let value = function(&mut *self.runtime, &args)?;
      self.process.set_x(0, value);
      return Ok(Flow::Next);
    }

    let saved = mem::take(&mut self.process.registers);
    match invoke(self.process, self.runtime, callable, args) {
      Ok(Outcome::Return(value)) => {
        self.process.registers = saved;
        self.process.set_x(0, value);
        Ok(Flow::Next)
      }
      Ok(Outcome::Suspend(mut continuation)) => {
        continuation.frames.push(SavedFrame {
          module    : self.module.clone(),
          frame     : mem::take(&mut self.frame),
          registers : saved,
          wake      : Wake::Call
        });
        Ok(Flow::Exit(Exit::Suspend(continuation)))
      }
      Err(error) => {
        self.process.registers = saved;
        Err(error)
      }
    }
  }

  fn tail_call(&mut self, callable: Callable, args: Vec<Term>) -> Result<Flow, ExecError> {
    self.check_balance()?;
    Ok(Flow::Exit(Exit::TailCall(callable, args)))
  }

  // endregion

  #[cfg(feature = "trace_computation")]
  fn trace(&self, pc: usize) {
    match self.module.instruction_at(pc) {
      Some((text, _)) => println!("{:>6}  {}", pc, text),
      None            => println!("{:>6}  ???", pc)
    }
  }

  fn step(&mut self) -> Result<Flow, ExecError> {
    let pc = self.frame.pc;
    let opcode = self.fetch()?;
    let decoded: Decoded = *OPCODES.decode(opcode)
                                   .ok_or(InternalError::UnimplementedOpcode { opcode, pc })?;

    #[cfg(feature = "trace_computation")]
    self.trace(pc);

    match decoded.family {

      // region Prefetch and pseudo-ops

      Family::FetchS => {
        let word = self.fetch()?;
        self.frame.prefetched[0] = self.source(decoded.variant(0), word)?;
      }

      Family::FetchSS => {
        let first  = self.fetch()?;
        let second = self.fetch()?;
        self.frame.prefetched[0] = self.source(decoded.variant(0), first)?;
        self.frame.prefetched[1] = self.source(decoded.variant(1), second)?;
      }

      Family::EnsureCapacity => {
        let n = self.fetch()? as usize;
        self.process.ensure_registers(n);
      }

      // endregion

      // region Control

      Family::Return => {
        self.check_balance()?;
        #[cfg(feature = "trace_computation")]
        println!("Return from {}\n{}", self.module.name(), self.process);
        return Ok(Flow::Exit(Exit::Return(self.process.x(0))));
      }

      Family::Jump => {
        self.frame.pc = self.target()?;
      }

      Family::FuncInfo => {
        for _ in 0..3 {
          self.fetch()?;
        }
        return Err(Fault::function_clause().into());
      }

      Family::IfEnd      => return Err(Fault::if_clause().into()),
      Family::Badmatch   => return Err(Fault::badmatch(self.prefetched(0)).into()),
      Family::CaseEnd    => return Err(Fault::case_clause(self.prefetched(0)).into()),
      Family::TryCaseEnd => return Err(Fault::try_clause(self.prefetched(0)).into()),

      // endregion

      // region Stack

      Family::Allocate | Family::AllocateZero => {
        let n = self.fetch()? as usize;
        self.process.allocate(n);
      }

      Family::Deallocate | Family::Trim => {
        let n = self.fetch()? as usize;
        self.deallocate(n)?;
      }

      Family::Init => {
        let at = self.dest(decoded.variant(0))?;
        self.write(at, Term::Nil)?;
      }

      // endregion

      // region Data

      Family::Move => {
        let value = self.prefetched(0);
        let at = self.dest(decoded.variant(0))?;
        self.write(at, value)?;
      }

      Family::PutList => {
        let head = self.prefetched(0);
        let tail = self.prefetched(1);
        let at = self.dest(decoded.variant(0))?;
        self.write(at, Term::cons(head, tail))?;
      }

      Family::GetList => {
        let list = self.prefetched(0);
        let head_at = self.dest(decoded.variant(0))?;
        let tail_at = self.dest(decoded.variant(1))?;
        match list {
          Term::Cons(cell) => {
            self.write(head_at, cell.head.clone())?;
            self.write(tail_at, cell.tail.clone())?;
          }
          _ => return Err(Fault::badarg().into())
        }
      }

      Family::GetTupleElement => {
        let tuple = self.prefetched(0);
        let index = self.fetch()? as usize;
        let at = self.dest(decoded.variant(0))?;
        match tuple.as_tuple().and_then(|elements| elements.get(index)) {
          Some(element) => self.write(at, element.clone())?,
          None          => return Err(Fault::badarg().into())
        }
      }

      Family::PutTuple => {
        let arity = self.fetch()? as usize;
        let dest = self.dest(decoded.variant(0))?;
        match arity {
          0 => self.write(dest, Term::tuple(vec![]))?,
          _ => {
            self.frame.tuple = Some(TupleBuilder { dest, elements: Vec::with_capacity(arity), arity });
          }
        }
      }

      Family::Put => {
        let value = self.prefetched(0);
        let position = self.fetch()? as usize;
        let builder = self.frame.tuple.as_mut().ok_or(InternalError::NoTuple("put"))?;
        if position != builder.elements.len() + 1 {
          return Err(InternalError::NoTuple("put out of order").into());
        }
        builder.elements.push(value);
        if builder.elements.len() == builder.arity {
          if let Some(TupleBuilder { dest, elements, .. }) = self.frame.tuple.take() {
            self.write(dest, Term::tuple(elements))?;
          }
        }
      }

      Family::SetTupleElement => {
        let value = self.prefetched(0);
        let at = self.dest(decoded.variant(0))?;
        let index = self.fetch()? as usize;
        let mut elements = match self.read(at)? {
          Term::Tuple(elements) => (*elements).clone(),
          _                     => return Err(Fault::badarg().into())
        };
        match elements.get_mut(index) {
          Some(slot) => *slot = value,
          None       => return Err(Fault::badarg().into())
        }
        self.write(at, Term::tuple(elements))?;
      }

      // endregion

      // region Tests

      | Family::IsInteger
      | Family::IsFloat
      | Family::IsNumber
      | Family::IsAtom
      | Family::IsPid
      | Family::IsReference
      | Family::IsPort
      | Family::IsNil
      | Family::IsBinary
      | Family::IsList
      | Family::IsNonemptyList
      | Family::IsTuple
      | Family::IsFunction
      | Family::IsBoolean
      | Family::IsBitstr => {
        let value = self.prefetched(0);
        let label = self.label()?;
        return self.branch(type_test(decoded.family, &value), label);
      }

      Family::TestArity => {
        let value = self.prefetched(0);
        let label = self.label()?;
        let arity = self.fetch()? as usize;
        let passed = value.as_tuple().map_or(false, |elements| elements.len() == arity);
        return self.branch(passed, label);
      }

      Family::IsFunction2 => {
        let value = self.prefetched(0);
        let arity = self.prefetched(1);
        let label = self.label()?;
        let passed = match (value.function_arity(), arity.as_size()) {
          (Some(actual), Some(expected)) => actual == expected,
          _                              => false
        };
        return self.branch(passed, label);
      }

      | Family::IsEqExact
      | Family::IsNeExact
      | Family::IsEq
      | Family::IsNe
      | Family::IsLt
      | Family::IsGe => {
        let a = self.prefetched(0);
        let b = self.prefetched(1);
        let label = self.label()?;
        let passed = match decoded.family {
          Family::IsEqExact => a.exact_eq(&b),
          Family::IsNeExact => !a.exact_eq(&b),
          Family::IsEq      => a.compare(&b) == std::cmp::Ordering::Equal,
          Family::IsNe      => a.compare(&b) != std::cmp::Ordering::Equal,
          Family::IsLt      => a.compare(&b) == std::cmp::Ordering::Less,
          _                 => a.compare(&b) != std::cmp::Ordering::Less,
        };
        return self.branch(passed, label);
      }

      Family::SelectVal => {
        let value = self.prefetched(0);
        let default = self.target()?;
        let table = self.fetch()?;
        let target = self.module.value_table(table).lookup(&value);
        self.frame.pc = target.unwrap_or(default);
      }

      Family::SelectTupleArity => {
        let value = self.prefetched(0);
        let default = self.target()?;
        let table = self.fetch()?;
        let target = match value.as_tuple() {
          Some(elements) => self.module.arity_table(table).lookup(elements.len()),
          None           => None
        };
        self.frame.pc = target.unwrap_or(default);
      }

      // endregion

      // region Calls

      Family::Call | Family::CallOnly | Family::CallLast => {
        if let Some(flow) = self.yield_point() {
          return Ok(flow);
        }
        let arity = self.fetch()? as usize;
        let entry = self.target()?;
        let callable = Callable::Function { module: self.module.clone(), entry, arity };
        let args = self.arguments(arity);
        return match decoded.family {
          Family::Call     => self.call_nested(callable, args),
          Family::CallOnly => self.tail_call(callable, args),
          _                => {
            let n = self.fetch()? as usize;
            self.deallocate(n)?;
            self.tail_call(callable, args)
          }
        };
      }

      Family::CallExt | Family::CallExtOnly | Family::CallExtLast => {
        if let Some(flow) = self.yield_point() {
          return Ok(flow);
        }
        let arity = self.fetch()? as usize;
        let index = self.fetch()?;
        let deallocate = match decoded.family {
          Family::CallExtLast => Some(self.fetch()? as usize),
          _                   => None
        };
        let callable = self.import(index)?;
        let args = self.arguments(arity);
        return match decoded.family {
          Family::CallExt => self.call_nested(callable, args),
          _               => {
            if let Some(n) = deallocate {
              self.deallocate(n)?;
            }
            self.tail_call(callable, args)
          }
        };
      }

      Family::Apply | Family::ApplyLast => {
        if let Some(flow) = self.yield_point() {
          return Ok(flow);
        }
        let arity = self.fetch()? as usize;
        let deallocate = match decoded.family {
          Family::ApplyLast => Some(self.fetch()? as usize),
          _                 => None
        };
        let callable = self.apply_target(arity)?;
        let args = self.arguments(arity);
        return match deallocate {
          None    => self.call_nested(callable, args),
          Some(n) => {
            self.deallocate(n)?;
            self.tail_call(callable, args)
          }
        };
      }

      Family::CallFun => {
        if let Some(flow) = self.yield_point() {
          return Ok(flow);
        }
        let arity = self.fetch()? as usize;
        let args = self.arguments(arity);
        let callable = self.fun_target(self.process.x(arity), &args)?;
        return self.call_nested(callable, args);
      }

      Family::MakeFun => {
        let entry = self.target()?;
        let arity = self.fetch()? as usize;
        let free  = self.fetch()? as usize;
        let closure = Closure {
          module : self.module.clone(),
          entry,
          arity,
          env    : self.arguments(free)
        };
        self.process.set_x(0, Term::Fun(Fun::Closure(Arc::new(closure))));
      }

      Family::Bif0 => {
        let index = self.fetch()?;
        let at = self.dest(decoded.variant(0))?;
        let value = self.call_bif(index, &[])?;
        self.write(at, value)?;
      }

      Family::Bif1 | Family::Bif2 => {
        let args = match decoded.family {
          Family::Bif1 => vec![self.prefetched(0)],
          _            => vec![self.prefetched(0), self.prefetched(1)],
        };
        let index = self.fetch()?;
        let label = self.label()?;
        let at = self.dest(decoded.variant(0))?;
        match self.call_bif(index, &args) {
          Ok(value)                   => self.write(at, value)?,
          Err(_) if label.is_some()   => return self.fail(label),
          Err(fault)                  => return Err(fault.into())
        }
      }

      // endregion

      // region Messages

      Family::Send => {
        let to = self.process.x(0);
        let message = self.process.x(1);
        self.runtime.send(&to, message.clone())?;
        self.process.set_x(0, message);
        if self.runtime.should_yield() {
          return Ok(self.suspend(Wake::Yield { retry: false }));
        }
      }

      Family::LoopRec => {
        let label = self.target()?;
        let at = self.dest(decoded.variant(0))?;
        match self.runtime.peek_message() {
          Some(message) => self.write(at, message)?,
          None          => self.frame.pc = label
        }
      }

      Family::LoopRecEnd => {
        let label = self.target()?;
        self.runtime.next_message();
        self.frame.pc = label;
      }

      Family::RemoveMessage => {
        self.runtime.remove_message();
      }

      Family::Timeout => {
        self.runtime.timeout();
      }

      Family::Wait => {
        let label = self.target()?;
        self.frame.pc = label;
        return Ok(self.suspend(Wake::Receive { on_message: label, timeout: None }));
      }

      Family::WaitTimeout => {
        let after = self.prefetched(0);
        let label = self.target()?;
        let next = self.frame.pc;
        match &after {
          Term::Integer(0) => {}
          Term::Integer(n) if *n > 0 => {
            return Ok(self.suspend(Wake::Receive { on_message: label, timeout: Some((next, after)) }));
          }
          Term::Atom(a) if *a == *atoms::INFINITY => {
            return Ok(self.suspend(Wake::Receive { on_message: label, timeout: None }));
          }
          _ => return Err(Fault::error(Term::Atom(atoms::TIMEOUT_VALUE.clone())).into())
        }
      }

      // endregion

      // region Exceptions

      Family::Catch | Family::Try => {
        let slot = self.fetch()?;
        let label = self.target()?;
        let kind = match decoded.family {
          Family::Catch => HandlerKind::Catch,
          _             => HandlerKind::Try
        };
        let handler = Arc::new(Handler {
          kind,
          label,
          depth    : self.process.stack.len(),
          previous : self.frame.handlers.clone()
        });
        self.write(Dest::Y(slot), Term::CatchTag(handler.clone()))?;
        self.frame.handlers = Some(handler);
      }

      Family::CatchEnd | Family::TryEnd | Family::TryCase => {
        let slot = self.fetch()?;
        match self.read(Dest::Y(slot))? {
          Term::CatchTag(handler) => self.frame.handlers = handler.previous.clone(),
          _                       => return Err(InternalError::NoCatchTag(slot as usize).into())
        }
        self.write(Dest::Y(slot), Term::Nil)?;
      }

      Family::Raise => {
        let _trace = self.prefetched(0);
        let reason = self.prefetched(1);
        let fault = match self.process.last_exception.take() {
          Some(last) if last.reason.exact_eq(&reason) => {
            let mut trace = last.trace;
            // The handler that caught it already recorded this activation.
            let own = self.module
                          .function_at(self.frame.last_pc)
                          .map(|(function, arity)| Fault::frame(self.module.name(), function, *arity));
            if let (Some(own), Some(last_frame)) = (&own, trace.last()) {
              if own.exact_eq(last_frame) {
                trace.pop();
              }
            }
            Fault { class: last.class, reason, trace }
          }
          _ => Fault::error(reason)
        };
        return Err(fault.into());
      }

      // endregion

      // region Floating point

      Family::Fmove | Family::Fconv => {
        let from = self.fetch()?;
        let to   = self.fetch()?;
        let value = self.source(decoded.variant(0), from)?;
        let value = match (decoded.family, &value) {
          (Family::Fmove, Term::Float(x)) => *x,
          (Family::Fconv, number)         => number.as_float().ok_or_else(Fault::badarith)?,
          _                               => return Err(Fault::badarith().into())
        };
        match decoded.variant(1) {
          Variant::F => self.process.set_fr(to as usize, value),
          Variant::Y => self.write(Dest::Y(to), Term::Float(value))?,
          _          => self.write(Dest::X(to), Term::Float(value))?,
        }
      }

      Family::Fadd | Family::Fsub | Family::Fmul | Family::Fdiv => {
        let a = self.fetch()? as usize;
        let b = self.fetch()? as usize;
        let d = self.fetch()? as usize;
        let (a, b) = (self.process.fr(a), self.process.fr(b));
        let result = match decoded.family {
          Family::Fadd => a + b,
          Family::Fsub => a - b,
          Family::Fmul => a * b,
          _            => a / b,
        };
        if !result.is_finite() {
          return Err(Fault::badarith().into());
        }
        self.process.set_fr(d, result);
      }

      Family::Fnegate => {
        let a = self.fetch()? as usize;
        let d = self.fetch()? as usize;
        let value = -self.process.fr(a);
        self.process.set_fr(d, value);
      }

      // endregion

      _ => return self.binary_op(decoded),
    }

    Ok(Flow::Next)
  }
}

fn type_test(family: Family, term: &Term) -> bool {
  match family {
    Family::IsInteger      => term.is_integer(),
    Family::IsFloat        => term.is_float(),
    Family::IsNumber       => term.is_number(),
    Family::IsAtom         => term.is_atom(),
    Family::IsPid          => term.is_pid(),
    Family::IsReference    => term.is_reference(),
    Family::IsPort         => term.is_port(),
    Family::IsNil          => term.is_nil(),
    Family::IsBinary       => term.is_binary(),
    Family::IsList         => term.is_list(),
    Family::IsNonemptyList => term.is_nonempty_list(),
    Family::IsTuple        => term.is_tuple(),
    Family::IsFunction     => term.is_function(),
    Family::IsBoolean      => term.is_boolean(),
    Family::IsBitstr       => term.is_bitstr(),
    _                      => false
  }
}

/// Runs `callable`, following tail calls until something returns or suspends.
pub(crate) fn invoke(
  process      : &mut Process,
  runtime      : &mut dyn Runtime,
  mut callable : Callable,
  mut args     : Vec<Term>
) -> Result<Outcome, ExecError>
{
  loop {
    let (module, entry) = match callable {
      Callable::Native { function, .. } => {
        return Ok(Outcome::Return(function(&mut *runtime, &args)?));
      }
      Callable::Function { module, entry, .. } => (module, entry),
      Callable::Closure(closure) => {
        args.extend(closure.env.iter().cloned());
        (closure.module.clone(), closure.entry)
      }
    };

    process.registers = args;
    let exit = Machine::new(module, &mut *process, &mut *runtime, entry).run()?;
    match exit {
      Exit::Return(value)         => return Ok(Outcome::Return(value)),
      Exit::Suspend(continuation) => return Ok(Outcome::Suspend(continuation)),
      Exit::TailCall(next, next_args) => {
        callable = next;
        args = next_args;
      }
    }
  }
}

/// Finishes an activation's exit: tail calls are followed, everything else is passed on.
pub(crate) fn complete(process: &mut Process, runtime: &mut dyn Runtime, exit: Exit)
  -> Result<Outcome, ExecError>
{
  match exit {
    Exit::Return(value)         => Ok(Outcome::Return(value)),
    Exit::Suspend(continuation) => Ok(Outcome::Suspend(continuation)),
    Exit::TailCall(callable, args) => invoke(process, runtime, callable, args),
  }
}


#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::{Flow, Machine};
  use crate::bytecode::assemble;
  use crate::error::{ExecError, InternalError};
  use crate::functor::Atom;
  use crate::linker::Linker;
  use crate::term::Term;
  use crate::vm::{
    call_export, Fault, FaultClass, LocalRuntime, Outcome, Process, Resumption, SuspendReason
  };

  const LISTING: &str = "
    {module, t}.
    {exports, [{pair,0}, {check,1}, {leak,0}, {nested,0}, {attempt,0}, {reraise,0},
               {split,1}, {build,1}, {adder,1}, {apply_adder,2}, {recv,0}, {recv_after,0},
               {twice,1}, {wrapper,1}, {classify,1}, {copy,1}, {fail_deep,0}, {notify,1},
               {floats,1}, {fquotient,2}, {shape,1}, {swap,1}, {second,1}, {slots,1},
               {dispatch,3}, {dispatch_last,3}, {safe_hd,1}, {lookup,2}, {append_bytes,1},
               {markers,1}, {utf,1}, {poll,1}]}.

    {function, pair, 0, 2}.
      {label,1}. {func_info,{atom,t},{atom,pair},0}.
      {label,2}.
        {put_tuple,2,{x,0}}.
        {put,{atom,a}}.
        {put,{atom,b}}.
        return.

    {function, check, 1, 4}.
      {label,3}. {func_info,{atom,t},{atom,check},1}.
      {label,4}.
        {is_integer,{f,5},{x,0}}.
        {move,{atom,ok},{x,0}}.
        return.
      {label,5}.
        {badmatch,{x,0}}.

    {function, leak, 0, 7}.
      {label,6}. {func_info,{atom,t},{atom,leak},0}.
      {label,7}.
        {allocate,1,0}.
        {move,nil,{x,0}}.
        return.

    {function, nested, 0, 9}.
      {label,8}. {func_info,{atom,t},{atom,nested},0}.
      {label,9}.
        {allocate,3,0}.
        {'catch',{y,0},{f,11}}.
        {'catch',{y,1},{f,10}}.
        {move,{atom,inner},{x,0}}.
        {call_ext,1,{extfunc,erlang,throw,1}}.
      {label,10}.
        {catch_end,{y,1}}.
        {move,{x,0},{y,2}}.
        {move,{atom,outer},{x,0}}.
        {call_ext,1,{extfunc,erlang,throw,1}}.
      {label,11}.
        {catch_end,{y,0}}.
        {put_tuple,2,{x,0}}.
        {put,{y,2}}.
        {put,{x,0}}.
        {deallocate,3}.
        return.

    {function, attempt, 0, 13}.
      {label,12}. {func_info,{atom,t},{atom,attempt},0}.
      {label,13}.
        {allocate,1,0}.
        {'try',{y,0},{f,14}}.
        {move,{atom,boom},{x,0}}.
        {call_ext,1,{extfunc,erlang,error,1}}.
        {try_end,{y,0}}.
        {deallocate,1}.
        return.
      {label,14}.
        {try_case,{y,0}}.
        {put_tuple,2,{x,0}}.
        {put,{x,0}}.
        {put,{x,1}}.
        {deallocate,1}.
        return.

    {function, reraise, 0, 46}.
      {label,45}. {func_info,{atom,t},{atom,reraise},0}.
      {label,46}.
        {allocate,1,0}.
        {'try',{y,0},{f,47}}.
        {move,{atom,bye},{x,0}}.
        {call_ext,1,{extfunc,erlang,exit,1}}.
        {try_end,{y,0}}.
        {deallocate,1}.
        return.
      {label,47}.
        {try_case,{y,0}}.
        {deallocate,1}.
        {raise,{x,2},{x,1}}.

    {function, split, 1, 16}.
      {label,15}. {func_info,{atom,t},{atom,split},1}.
      {label,16}.
        {bs_start_match2,{f,17},{x,0},1,0,{x,0}}.
        {bs_get_integer2,{f,17},{x,0},1,{integer,8},1,{field_flags,[]},{x,1}}.
        {bs_get_binary2,{f,17},{x,0},2,{atom,all},8,{field_flags,[]},{x,2}}.
        {put_tuple,2,{x,0}}.
        {put,{x,1}}.
        {put,{x,2}}.
        return.
      {label,17}.
        {move,{atom,nomatch},{x,0}}.
        return.

    {function, build, 1, 19}.
      {label,18}. {func_info,{atom,t},{atom,build},1}.
      {label,19}.
        {bs_init2,{f,0},2,0,1,{field_flags,[]},{x,1}}.
        {bs_put_integer,{f,0},{integer,8},1,{field_flags,[]},{x,0}}.
        {bs_put_integer,{f,0},{integer,8},1,{field_flags,[]},{integer,255}}.
        {move,{x,1},{x,0}}.
        return.

    {function, adder, 1, 21}.
      {label,20}. {func_info,{atom,t},{atom,adder},1}.
      {label,21}.
        {make_fun2,{f,23},1,1}.
        return.

    {function, '-adder/1-fun-0-', 2, 23}.
      {label,22}. {func_info,{atom,t},{atom,'-adder/1-fun-0-'},2}.
      {label,23}.
        {gc_bif2,{f,0},2,{extfunc,erlang,'+',2},{x,0},{x,1},{x,0}}.
        return.

    {function, apply_adder, 2, 25}.
      {label,24}. {func_info,{atom,t},{atom,apply_adder},2}.
      {label,25}.
        {move,{x,0},{x,2}}.
        {move,{x,1},{x,0}}.
        {move,{x,2},{x,1}}.
        {call_fun,1}.
        return.

    {function, recv, 0, 27}.
      {label,26}. {func_info,{atom,t},{atom,recv},0}.
      {label,27}.
      {label,28}.
        {loop_rec,{f,29},{x,0}}.
        remove_message.
        return.
      {label,29}.
        {wait,{f,28}}.

    {function, recv_after, 0, 31}.
      {label,30}. {func_info,{atom,t},{atom,recv_after},0}.
      {label,31}.
      {label,32}.
        {loop_rec,{f,33},{x,0}}.
        remove_message.
        return.
      {label,33}.
        {wait_timeout,{f,32},{integer,100}}.
        timeout.
        {move,{atom,timeout},{x,0}}.
        return.

    {function, twice, 1, 35}.
      {label,34}. {func_info,{atom,t},{atom,twice},1}.
      {label,35}.
        {allocate,0,1}.
        {call,1,{f,37}}.
        {call_last,1,{f,37},0}.

    {function, inc, 1, 37}.
      {label,36}. {func_info,{atom,t},{atom,inc},1}.
      {label,37}.
        {gc_bif2,{f,0},1,{extfunc,erlang,'+',2},{x,0},{integer,1},{x,0}}.
        return.

    {function, wrapper, 1, 39}.
      {label,38}. {func_info,{atom,t},{atom,wrapper},1}.
      {label,39}.
        {allocate,0,1}.
        {call,1,{f,4}}.
        {deallocate,0}.
        return.

    {function, classify, 1, 41}.
      {label,40}. {func_info,{atom,t},{atom,classify},1}.
      {label,41}.
        {select_val,{x,0},{f,44},{list,[{atom,a},{f,42},{atom,b},{f,43}]}}.
      {label,42}.
        {move,{integer,1},{x,0}}.
        return.
      {label,43}.
        {move,{integer,2},{x,0}}.
        return.
      {label,44}.
        {move,{integer,0},{x,0}}.
        return.

    {function, copy, 1, 51}.
      {label,50}. {func_info,{atom,t},{atom,copy},1}.
      {label,51}.
        {move,{x,0},{x,1}}.
        {move,{atom,ok},{x,0}}.
        return.

    {function, fail_deep, 0, 53}.
      {label,52}. {func_info,{atom,t},{atom,fail_deep},0}.
      {label,53}.
        {allocate,2,0}.
        {move,{atom,oops},{x,0}}.
        {call_ext,1,{extfunc,erlang,error,1}}.
        {deallocate,2}.
        return.

    {function, notify, 1, 55}.
      {label,54}. {func_info,{atom,t},{atom,notify},1}.
      {label,55}.
        {move,{x,0},{x,1}}.
        {bif0,{extfunc,erlang,self,0},{x,0}}.
        send.
        {call_only,1,{f,37}}.

    {function, floats, 1, 57}.
      {label,56}. {func_info,{atom,t},{atom,floats},1}.
      {label,57}.
        {fconv,{x,0},{fr,0}}.
        {fmove,{float,1.5},{fr,1}}.
        {fadd,{f,0},{fr,0},{fr,1},{fr,2}}.
        {fsub,{f,0},{fr,2},{fr,0},{fr,3}}.
        {fmul,{f,0},{fr,2},{fr,3},{fr,4}}.
        {fdiv,{f,0},{fr,4},{fr,1},{fr,5}}.
        {fnegate,{f,0},{fr,5},{fr,6}}.
        {fmove,{fr,2},{x,0}}.
        {fmove,{fr,6},{x,1}}.
        {put_tuple,2,{x,0}}.
        {put,{x,0}}.
        {put,{x,1}}.
        return.

    {function, fquotient, 2, 59}.
      {label,58}. {func_info,{atom,t},{atom,fquotient},2}.
      {label,59}.
        {fconv,{x,0},{fr,0}}.
        {fconv,{x,1},{fr,1}}.
        {fdiv,{f,0},{fr,0},{fr,1},{fr,0}}.
        {fmove,{fr,0},{x,0}}.
        return.

    {function, shape, 1, 61}.
      {label,60}. {func_info,{atom,t},{atom,shape},1}.
      {label,61}.
        {select_tuple_arity,{x,0},{f,64},{list,[2,{f,62},3,{f,63}]}}.
      {label,62}.
        {move,{atom,two},{x,0}}.
        return.
      {label,63}.
        {move,{atom,three},{x,0}}.
        return.
      {label,64}.
        {move,{atom,other},{x,0}}.
        return.

    {function, swap, 1, 66}.
      {label,65}. {func_info,{atom,t},{atom,swap},1}.
      {label,66}.
        {get_list,{x,0},{x,1},{x,2}}.
        {put_list,{x,2},{x,1},{x,0}}.
        return.

    {function, second, 1, 68}.
      {label,67}. {func_info,{atom,t},{atom,second},1}.
      {label,68}.
        {test_arity,{f,69},{x,0},2}.
        {get_tuple_element,{x,0},1,{x,1}}.
        {set_tuple_element,{atom,seen},{x,0},0}.
        {put_tuple,2,{x,2}}.
        {put,{x,1}}.
        {put,{x,0}}.
        {move,{x,2},{x,0}}.
        return.
      {label,69}.
        {move,{atom,nomatch},{x,0}}.
        return.

    {function, slots, 1, 71}.
      {label,70}. {func_info,{atom,t},{atom,slots},1}.
      {label,71}.
        {allocate,3,1}.
        {move,{x,0},{y,2}}.
        {move,{x,0},{y,0}}.
        {init,{y,0}}.
        {move,{y,0},{x,1}}.
        {trim,2,1}.
        {put_tuple,2,{x,0}}.
        {put,{y,0}}.
        {put,{x,1}}.
        {deallocate,1}.
        return.

    {function, dispatch, 3, 73}.
      {label,72}. {func_info,{atom,t},{atom,dispatch},3}.
      {label,73}.
        {apply,1}.
        return.

    {function, dispatch_last, 3, 75}.
      {label,74}. {func_info,{atom,t},{atom,dispatch_last},3}.
      {label,75}.
        {allocate,0,3}.
        {apply_last,1,0}.

    {function, safe_hd, 1, 77}.
      {label,76}. {func_info,{atom,t},{atom,safe_hd},1}.
      {label,77}.
        {bif1,{f,78},{extfunc,erlang,hd,1},{x,0},{x,0}}.
        return.
      {label,78}.
        {move,{atom,empty},{x,0}}.
        return.

    {function, lookup, 2, 80}.
      {label,79}. {func_info,{atom,t},{atom,lookup},2}.
      {label,80}.
        {bif2,{f,81},{extfunc,erlang,element,2},{x,0},{x,1},{x,0}}.
        return.
      {label,81}.
        {move,{atom,none},{x,0}}.
        return.

    {function, append_bytes, 1, 83}.
      {label,82}. {func_info,{atom,t},{atom,append_bytes},1}.
      {label,83}.
        {move,{x,0},{x,1}}.
        bs_init_writable.
        {bs_append,{f,0},{integer,8},0,2,8,{x,0},{field_flags,[]},{x,0}}.
        {bs_put_integer,{f,0},{integer,8},1,{field_flags,[]},{integer,7}}.
        {bs_private_append,{f,0},{integer,8},1,{x,0},{field_flags,[]},{x,0}}.
        {bs_put_integer,{f,0},{integer,8},1,{field_flags,[]},{x,1}}.
        return.

    {function, markers, 1, 85}.
      {label,84}. {func_info,{atom,t},{atom,markers},1}.
      {label,85}.
        {bs_start_match2,{f,86},{x,0},1,1,{x,0}}.
        {bs_get_integer2,{f,86},{x,0},1,{integer,8},1,{field_flags,[]},{x,1}}.
        {bs_save2,{x,0},0}.
        {bs_get_integer2,{f,86},{x,0},2,{integer,8},1,{field_flags,[]},{x,2}}.
        {bs_restore2,{x,0},0}.
        {bs_get_integer2,{f,86},{x,0},3,{integer,8},1,{field_flags,[]},{x,3}}.
        {bs_restore2,{x,0},{atom,start}}.
        {bs_get_integer2,{f,86},{x,0},4,{integer,8},1,{field_flags,[]},{x,4}}.
        {put_tuple,4,{x,0}}.
        {put,{x,1}}.
        {put,{x,2}}.
        {put,{x,3}}.
        {put,{x,4}}.
        return.
      {label,86}.
        {move,{atom,nomatch},{x,0}}.
        return.

    {function, utf, 1, 88}.
      {label,87}. {func_info,{atom,t},{atom,utf},1}.
      {label,88}.
        {bs_utf8_size,{f,89},{x,0},{x,1}}.
        {bs_utf16_size,{f,89},{x,0},{x,2}}.
        {bs_init2,{f,0},8,0,3,{field_flags,[]},{x,3}}.
        {bs_put_utf8,{f,89},{field_flags,[]},{x,0}}.
        {bs_put_utf16,{f,89},{field_flags,[]},{x,0}}.
        {bs_put_utf32,{f,89},{field_flags,[]},{x,0}}.
        {put_tuple,3,{x,0}}.
        {put,{x,1}}.
        {put,{x,2}}.
        {put,{x,3}}.
        return.
      {label,89}.
        {move,{atom,invalid},{x,0}}.
        return.

    {function, poll, 1, 91}.
      {label,90}. {func_info,{atom,t},{atom,poll},1}.
      {label,91}.
        {allocate,1,1}.
        {move,{x,0},{y,0}}.
      {label,92}.
        {loop_rec,{f,93},{x,0}}.
        remove_message.
        {deallocate,1}.
        return.
      {label,93}.
        {wait_timeout,{f,92},{y,0}}.
        timeout.
        {move,{atom,timeout},{x,0}}.
        {deallocate,1}.
        return.
  ";

  fn runtime() -> LocalRuntime {
    let mut linker = Linker::with_erlang_natives();
    let module = linker.load(assemble(LISTING).expect("listing assembles"));
    assert!(linker.link(&module).is_empty());
    LocalRuntime::new(Arc::new(linker))
  }

  fn run(function: &str, args: Vec<Term>) -> Result<Outcome, ExecError> {
    call_export(&mut Process::new(), &mut runtime(), "t", function, args)
  }

  fn value(function: &str, args: Vec<Term>) -> Term {
    match run(function, args) {
      Ok(Outcome::Return(value)) => value,
      other                      => panic!("t:{} did not return: {:?}", function, other),
    }
  }

  fn fault(function: &str, args: Vec<Term>) -> Fault {
    match run(function, args) {
      Err(ExecError::Fault(fault)) => fault,
      other                        => panic!("t:{} did not fault: {:?}", function, other),
    }
  }

  #[test]
  fn move_copies_between_registers() {
    let mut process = Process::new();
    let outcome = call_export(&mut process, &mut runtime(), "t", "copy", vec![Term::Integer(42)]);
    assert_eq!(outcome.ok().and_then(|o| o.value().cloned()), Some(Term::atom("ok")));
    assert_eq!(process.x(1), Term::Integer(42));
  }

  #[test]
  fn builds_tuples() {
    assert_eq!(value("pair", vec![]).to_string(), "{a,b}");
  }

  #[test]
  fn tests_fall_through_or_branch() {
    assert_eq!(value("check", vec![Term::Integer(42)]), Term::atom("ok"));

    let fault = fault("check", vec![Term::atom("foo")]);
    assert_eq!(fault.class, FaultClass::Error);
    assert_eq!(fault.reason.to_string(), "{badmatch,foo}");
    assert_eq!(fault.trace_term().to_string(), "[{t,check,1}]");
  }

  #[test]
  fn test_opcodes_continue_after_themselves_or_at_the_fail_label() {
    let mut runtime = runtime();
    let module = runtime.linker().module(&Atom::from("t")).cloned().expect("t is loaded");
    let entry = module.export_entry(&Atom::from("check"), 1).expect("check/1 is exported");
    // ensure_capacity N, fetch_s_x 0, is_integer L
    let next = entry + 6;
    let fail_label = module.code()[entry + 5] as usize;
    assert_ne!(fail_label, next);

    for (argument, expected) in vec![(Term::Integer(1), next), (Term::atom("a"), fail_label)] {
      let mut process = Process::new();
      process.set_x(0, argument);
      let mut machine = Machine::new(module.clone(), &mut process, &mut runtime, entry);
      for _ in 0..3 {
        assert!(matches!(machine.step(), Ok(Flow::Next)));
      }
      assert_eq!(machine.frame.pc, expected);
    }
  }

  #[test]
  fn select_val_dispatches_on_value() {
    assert_eq!(value("classify", vec![Term::atom("a")]), Term::Integer(1));
    assert_eq!(value("classify", vec![Term::atom("b")]), Term::Integer(2));
    assert_eq!(value("classify", vec![Term::Integer(7)]), Term::Integer(0));
  }

  #[test]
  fn select_tuple_arity_dispatches_on_size() {
    let tuple = |n: usize| Term::tuple(vec![Term::atom("a"); n]);
    assert_eq!(value("shape", vec![tuple(2)]), Term::atom("two"));
    assert_eq!(value("shape", vec![tuple(3)]), Term::atom("three"));
    assert_eq!(value("shape", vec![tuple(1)]), Term::atom("other"));
    assert_eq!(value("shape", vec![Term::Nil]), Term::atom("other"));
  }

  #[test]
  fn list_cells() {
    let list = Term::list(vec![Term::Integer(1), Term::Integer(2)]);
    assert_eq!(value("swap", vec![list]).to_string(), "[[2]|1]");
    assert_eq!(fault("swap", vec![Term::Nil]).reason, Term::atom("badarg"));
  }

  #[test]
  fn tuple_elements() {
    let pair = Term::tuple(vec![Term::atom("a"), Term::atom("b")]);
    assert_eq!(value("second", vec![pair]).to_string(), "{b,{seen,b}}");
    assert_eq!(value("second", vec![Term::tuple(vec![Term::atom("a")])]), Term::atom("nomatch"));
    assert_eq!(value("second", vec![Term::atom("a")]), Term::atom("nomatch"));
  }

  #[test]
  fn init_and_trim() {
    let mut process = Process::new();
    let outcome = call_export(&mut process, &mut runtime(), "t", "slots", vec![Term::Integer(7)]);
    assert_eq!(outcome.ok().and_then(|o| o.value().cloned()).map(|v| v.to_string()), Some("{7,[]}".to_string()));
    assert!(process.stack.is_empty());
  }

  #[test]
  fn apply_resolves_at_run_time() {
    let args = |arg: Term, module: &str, function: &str| vec![arg, Term::atom(module), Term::atom(function)];
    assert_eq!(value("dispatch", args(Term::Integer(-5), "erlang", "abs")), Term::Integer(5));
    assert_eq!(value("dispatch_last", args(Term::Integer(42), "t", "check")), Term::atom("ok"));
    assert_eq!(fault("dispatch", args(Term::Integer(1), "t", "nope")).reason, Term::atom("undef"));
    let not_a_module = vec![Term::Integer(1), Term::Integer(2), Term::atom("abs")];
    assert_eq!(fault("dispatch", not_a_module).reason, Term::atom("badarg"));
  }

  #[test]
  fn guard_bifs_branch_to_their_fail_label() {
    let one = Term::list(vec![Term::Integer(1)]);
    assert_eq!(value("safe_hd", vec![one]), Term::Integer(1));
    assert_eq!(value("safe_hd", vec![Term::Nil]), Term::atom("empty"));

    let tuple = Term::tuple(vec![Term::atom("a")]);
    assert_eq!(value("lookup", vec![Term::Integer(1), tuple.clone()]), Term::atom("a"));
    assert_eq!(value("lookup", vec![Term::Integer(5), tuple]), Term::atom("none"));
  }

  #[test]
  fn float_registers() {
    let expected = Term::tuple(vec![Term::Float(3.5), Term::Float(-3.5)]);
    assert_eq!(value("floats", vec![Term::Integer(2)]), expected);
    assert_eq!(value("floats", vec![Term::Float(2.0)]), expected);
    assert_eq!(fault("floats", vec![Term::atom("x")]).reason, Term::atom("badarith"));

    assert_eq!(value("fquotient", vec![Term::Integer(1), Term::Integer(4)]), Term::Float(0.25));
    assert_eq!(fault("fquotient", vec![Term::Integer(1), Term::Integer(0)]).reason, Term::atom("badarith"));
    assert_eq!(fault("fquotient", vec![Term::Integer(0), Term::Integer(0)]).reason, Term::atom("badarith"));
  }

  #[test]
  fn unbalanced_stack_is_detected() {
    match run("leak", vec![]) {
      Err(ExecError::Internal(InternalError::StackImbalance { expected: 0, found: 1 })) => {}
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn catch_handlers_unwind_innermost_first() {
    assert_eq!(value("nested", vec![]).to_string(), "{inner,outer}");
  }

  #[test]
  fn try_delivers_class_reason_and_trace() {
    let mut process = Process::new();
    let outcome = call_export(&mut process, &mut runtime(), "t", "attempt", vec![]);
    assert_eq!(outcome.ok().and_then(|o| o.value().cloned()).map(|v| v.to_string()), Some("{error,boom}".to_string()));
    assert_eq!(process.x(2).to_string(), "[{t,attempt,0}]");
    assert!(process.stack.is_empty());
  }

  #[test]
  fn raise_rethrows_with_the_original_class() {
    let fault = fault("reraise", vec![]);
    assert_eq!(fault.class, FaultClass::Exit);
    assert_eq!(fault.reason, Term::atom("bye"));
    assert_eq!(fault.trace_term().to_string(), "[{t,reraise,0}]");
  }

  #[test]
  fn faults_collect_a_frame_per_activation() {
    let fault = fault("wrapper", vec![Term::atom("foo")]);
    assert_eq!(fault.trace_term().to_string(), "[{t,check,1},{t,wrapper,1}]");
    assert_eq!(value("wrapper", vec![Term::Integer(1)]), Term::atom("ok"));
  }

  #[test]
  fn binary_matching() {
    let input = Term::binary(&[1, 2, 3]);
    let first = value("split", vec![input.clone()]);
    assert_eq!(first.to_string(), "{1,<<2,3>>}");
    assert_eq!(value("split", vec![input]), first);
    assert_eq!(value("split", vec![Term::binary(&[])]), Term::atom("nomatch"));
    assert_eq!(value("split", vec![Term::atom("x")]), Term::atom("nomatch"));
  }

  #[test]
  fn binary_construction() {
    assert_eq!(value("build", vec![Term::Integer(65)]).to_string(), "<<65,255>>");
    assert_eq!(fault("build", vec![Term::atom("x")]).reason, Term::atom("badarg"));
  }

  #[test]
  fn writable_binaries_grow_by_appending() {
    assert_eq!(value("append_bytes", vec![Term::Integer(9)]).to_string(), "<<7,9>>");
    assert_eq!(fault("append_bytes", vec![Term::atom("x")]).reason, Term::atom("badarg"));
  }

  #[test]
  fn save_and_restore_match_positions() {
    assert_eq!(value("markers", vec![Term::binary(&[1, 2])]).to_string(), "{1,2,2,1}");
    assert_eq!(value("markers", vec![Term::binary(&[1])]), Term::atom("nomatch"));
  }

  #[test]
  fn utf_segments() {
    assert_eq!(value("utf", vec![Term::Integer(0xE9)]).to_string(), "{2,2,<<195,169,0,233,0,0,0,233>>}");
    assert_eq!(value("utf", vec![Term::Integer(-1)]), Term::atom("invalid"));
    assert_eq!(value("utf", vec![Term::Integer(0xD800)]), Term::atom("invalid"));
  }

  #[test]
  fn closures_capture_their_environment() {
    let fun = value("adder", vec![Term::Integer(10)]);
    assert!(fun.is_function());
    assert_eq!(value("apply_adder", vec![fun.clone(), Term::Integer(5)]), Term::Integer(15));
    assert_eq!(fault("apply_adder", vec![Term::atom("nope"), Term::Integer(5)]).reason.to_string(), "{badfun,nope}");
  }

  #[test]
  fn receive_suspends_until_a_message_arrives() {
    let mut process = Process::new();
    let mut runtime = runtime();
    let continuation = match call_export(&mut process, &mut runtime, "t", "recv", vec![]) {
      Ok(Outcome::Suspend(continuation)) => continuation,
      other                              => panic!("unexpected {:?}", other),
    };
    assert_eq!(continuation.reason(), SuspendReason::Receive);

    runtime.deliver(Term::atom("hello"));
    match continuation.resume(&mut process, &mut runtime, Resumption::MessageArrived) {
      Ok(Outcome::Return(value)) => assert_eq!(value, Term::atom("hello")),
      other                      => panic!("unexpected {:?}", other),
    }
    assert!(runtime.mailbox().is_empty());
  }

  #[test]
  fn receive_times_out() {
    let mut process = Process::new();
    let mut runtime = runtime();
    let continuation = match call_export(&mut process, &mut runtime, "t", "recv_after", vec![]) {
      Ok(Outcome::Suspend(continuation)) => continuation,
      other                              => panic!("unexpected {:?}", other),
    };
    assert_eq!(continuation.reason(), SuspendReason::ReceiveTimeout(Term::Integer(100)));
    match continuation.resume(&mut process, &mut runtime, Resumption::TimedOut) {
      Ok(Outcome::Return(value)) => assert_eq!(value, Term::atom("timeout")),
      other                      => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn wait_timeout_values() {
    assert_eq!(value("poll", vec![Term::Integer(0)]), Term::atom("timeout"));

    let mut process = Process::new();
    let mut runtime = runtime();
    let continuation = match call_export(&mut process, &mut runtime, "t", "poll", vec![Term::atom("infinity")]) {
      Ok(Outcome::Suspend(continuation)) => continuation,
      other                              => panic!("unexpected {:?}", other),
    };
    assert_eq!(continuation.reason(), SuspendReason::Receive);
    runtime.deliver(Term::Integer(3));
    match continuation.resume(&mut process, &mut runtime, Resumption::MessageArrived) {
      Ok(Outcome::Return(value)) => assert_eq!(value, Term::Integer(3)),
      other                      => panic!("unexpected {:?}", other),
    }
    assert!(process.stack.is_empty());

    for invalid in vec![Term::atom("never"), Term::Integer(-1)] {
      assert_eq!(fault("poll", vec![invalid]).reason, Term::atom("timeout_value"));
    }
  }

  #[test]
  fn uncaught_faults_release_the_stack() {
    let mut process = Process::new();
    let mut runtime = runtime();
    for _ in 0..3 {
      match call_export(&mut process, &mut runtime, "t", "fail_deep", vec![]) {
        Err(ExecError::Fault(fault)) => assert_eq!(fault.reason, Term::atom("oops")),
        other                        => panic!("unexpected {:?}", other),
      }
      assert!(process.stack.is_empty());
    }
  }

  #[test]
  fn a_yield_after_send_does_not_skip_the_next_call_check() {
    let mut process = Process::new();
    let mut runtime = runtime().with_yield_interval(1);
    let mut outcome = call_export(&mut process, &mut runtime, "t", "notify", vec![Term::Integer(4)]);
    let mut yields = 0;
    while let Ok(Outcome::Suspend(continuation)) = outcome {
      yields += 1;
      outcome = continuation.resume(&mut process, &mut runtime, Resumption::Continue);
    }
    assert_eq!(outcome.ok().and_then(|o| o.value().cloned()), Some(Term::Integer(5)));
    // One after the send, one before the tail call.
    assert_eq!(yields, 2);
    assert_eq!(runtime.mailbox(), &[Term::Integer(4)]);
  }

  #[test]
  fn yielding_calls_resume_where_they_left_off() {
    let mut process = Process::new();
    let mut runtime = runtime().with_yield_interval(1);
    let mut outcome = call_export(&mut process, &mut runtime, "t", "twice", vec![Term::Integer(10)]);
    let mut yields = 0;
    while let Ok(Outcome::Suspend(continuation)) = outcome {
      assert_eq!(continuation.reason(), SuspendReason::Yield);
      yields += 1;
      outcome = continuation.resume(&mut process, &mut runtime, Resumption::Continue);
    }
    assert_eq!(outcome.ok().and_then(|o| o.value().cloned()), Some(Term::Integer(12)));
    assert_eq!(yields, 2);
    assert!(process.stack.is_empty());
  }
}
