//! Suspended call chains.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::error::ExecError;
use crate::module::Module;
use crate::term::Term;

use super::interpreter::{complete, Frame, Machine};
use super::{Fault, Outcome, Process, Runtime};

/// What a suspended activation is waiting for.
pub(crate) enum Wake {
  /// The scheduler preempted it. With `retry` set the interrupted call runs again on resumption,
  /// without a second yield check; otherwise execution continues with the next instruction.
  Yield { retry: bool },
  /// It waits for a message, and possibly for a timeout, which continues at `on_timeout`.
  Receive {
    on_message : usize,
    timeout    : Option<(usize, Term)>
  },
  /// It waits for a callee to return. The result goes to x0.
  Call,
}

pub(crate) struct SavedFrame {
  pub(crate) module    : Arc<Module>,
  pub(crate) frame     : Frame,
  pub(crate) registers : Vec<Term>,
  pub(crate) wake      : Wake,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SuspendReason {
  Yield,
  Receive,
  /// Waiting for a message for at most the given time.
  ReceiveTimeout(Term),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Resumption {
  /// Continue after a yield, or check the mailbox again.
  Continue,
  MessageArrived,
  TimedOut,
}

/**
  The saved state of a suspended call chain, innermost activation first. The register files and
  handler chains of all activations are held here; their stack slots stay on the process's value
  stack, so a continuation must be resumed with the process it was suspended from.
*/
pub struct Continuation {
  pub(crate) frames: Vec<SavedFrame>,
}

impl Continuation {

  pub(crate) fn new(frame: SavedFrame) -> Continuation {
    Continuation { frames: vec![frame] }
  }

  pub fn reason(&self) -> SuspendReason {
    match self.frames.first().map(|saved| &saved.wake) {
      Some(Wake::Receive { timeout: Some((_, after)), .. }) => SuspendReason::ReceiveTimeout(after.clone()),
      Some(Wake::Receive { .. })                            => SuspendReason::Receive,
      _                                                     => SuspendReason::Yield
    }
  }

  /// The number of suspended activations.
  pub fn depth(&self) -> usize {
    self.frames.len()
  }

  /**
    Continues the suspended chain. The innermost activation resumes according to `resumption`;
    each enclosing activation then receives its callee's result, or its fault, exactly as if the
    call had never been interrupted.
  */
  pub fn resume(
    self,
    process    : &mut Process,
    runtime    : &mut dyn Runtime,
    resumption : Resumption
  ) -> Result<Outcome, ExecError>
  {
    let mut frames = self.frames.into_iter();
    let mut incoming: Option<Result<Term, Fault>> = None;

    while let Some(saved) = frames.next() {
      let SavedFrame { module, mut frame, registers, wake } = saved;
      process.registers = registers;

      #[cfg(feature = "trace_computation")]
      println!("Resuming {} at {} ({:?})", module.name(), frame.pc, resumption);

      let result = {
        match wake {
          Wake::Yield { retry }                  => frame.skip_yield = retry,
          Wake::Receive { on_message, timeout }  => {
            frame.pc = match (resumption, timeout) {
              (Resumption::TimedOut, Some((on_timeout, _))) => on_timeout,
              _                                             => on_message
            };
          }
          Wake::Call => {}
        }
        let mut machine = Machine::resume(module, process, runtime, frame);
        match incoming.take() {
          Some(Ok(value)) => {
            machine.deliver(value);
            machine.run()
          }
          Some(Err(fault)) => machine.handle_fault(fault).and_then(|_| machine.run()),
          None             => machine.run()
        }
      };

      match result.and_then(|exit| complete(process, runtime, exit)) {
        Ok(Outcome::Return(value)) => incoming = Some(Ok(value)),
        Ok(Outcome::Suspend(mut continuation)) => {
          continuation.frames.extend(frames);
          return Ok(Outcome::Suspend(continuation));
        }
        Err(ExecError::Fault(fault)) => incoming = Some(Err(fault)),
        Err(internal)                => return Err(internal)
      }
    }

    match incoming {
      Some(Ok(value))  => Ok(Outcome::Return(value)),
      Some(Err(fault)) => Err(fault.into()),
      None             => Ok(Outcome::Return(Term::Nil))
    }
  }
}

impl Debug for Continuation {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let frames: Vec<String> = self.frames
      .iter()
      .map(|saved| format!("{}@{}", saved.module.name(), saved.frame.pc))
      .collect();
    write!(f, "Continuation({:?}, [{}])", self.reason(), frames.join(", "))
  }
}
