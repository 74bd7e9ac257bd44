/*!
  The services the dispatch loop needs from its surroundings: resolving functions at run time,
  message passing, and the scheduler's decision to preempt. The interpreter only calls these; a
  scheduler provides the real implementation. `LocalRuntime` is a complete single-process
  implementation.
*/

use std::sync::Arc;

use crate::functor::FunId;
use crate::linker::{Callable, Linker};
use crate::term::Term;
use crate::vm::Fault;

pub trait Runtime {
  /// Resolves a function by name, for `apply` and external funs.
  fn resolve(&self, id: &FunId) -> Option<Callable>;

  fn self_pid(&self) -> Term;

  fn send(&mut self, to: &Term, message: Term) -> Result<(), Fault>;

  /// The message at the receive cursor, if any.
  fn peek_message(&self) -> Option<Term>;

  /// Moves the receive cursor past the current message.
  fn next_message(&mut self);

  /// Removes the message at the receive cursor and rewinds the cursor.
  fn remove_message(&mut self) -> Option<Term>;

  /// A receive timed out: rewinds the cursor.
  fn timeout(&mut self);

  /// Asked before calls and after sends. Returning `true` suspends the running code.
  fn should_yield(&mut self) -> bool;
}

/// A runtime for one process with a local mailbox.
pub struct LocalRuntime {
  linker         : Arc<Linker>,
  pid            : u64,
  mailbox        : Vec<Term>,
  cursor         : usize,
  outbox         : Vec<(Term, Term)>,
  yield_interval : Option<usize>,
  reductions     : usize,
}

impl LocalRuntime {

  pub fn new(linker: Arc<Linker>) -> LocalRuntime {
    LocalRuntime {
      linker,
      pid            : 1,
      mailbox        : vec![],
      cursor         : 0,
      outbox         : vec![],
      yield_interval : None,
      reductions     : 0,
    }
  }

  /// Yields once every `interval` yield checks.
  pub fn with_yield_interval(mut self, interval: usize) -> LocalRuntime {
    self.yield_interval = Some(interval.max(1));
    self
  }

  pub fn linker(&self) -> &Linker {
    &self.linker
  }

  /// Appends a message to the mailbox.
  pub fn deliver(&mut self, message: Term) {
    self.mailbox.push(message);
  }

  pub fn mailbox(&self) -> &[Term] {
    &self.mailbox
  }

  /// Messages sent to other processes, with their destinations.
  pub fn sent(&self) -> &[(Term, Term)] {
    &self.outbox
  }
}

impl Runtime for LocalRuntime {

  fn resolve(&self, id: &FunId) -> Option<Callable> {
    self.linker.resolve(id)
  }

  fn self_pid(&self) -> Term {
    Term::Pid(self.pid)
  }

  fn send(&mut self, to: &Term, message: Term) -> Result<(), Fault> {
    match to {
      Term::Pid(pid) if *pid == self.pid => self.mailbox.push(message),
      Term::Pid(_) | Term::Atom(_)       => self.outbox.push((to.clone(), message)),
      _                                  => return Err(Fault::badarg())
    }
    Ok(())
  }

  fn peek_message(&self) -> Option<Term> {
    self.mailbox.get(self.cursor).cloned()
  }

  fn next_message(&mut self) {
    if self.cursor < self.mailbox.len() {
      self.cursor += 1;
    }
  }

  fn remove_message(&mut self) -> Option<Term> {
    let message = match self.cursor < self.mailbox.len() {
      true  => Some(self.mailbox.remove(self.cursor)),
      false => None
    };
    self.cursor = 0;
    message
  }

  fn timeout(&mut self) {
    self.cursor = 0;
  }

  fn should_yield(&mut self) -> bool {
    match self.yield_interval {
      None           => false,
      Some(interval) => {
        self.reductions += 1;
        match self.reductions >= interval {
          true  => {
            self.reductions = 0;
            true
          }
          false => false
        }
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn receive_cursor() {
    let mut runtime = LocalRuntime::new(Arc::new(Linker::new()));
    runtime.deliver(Term::Integer(1));
    runtime.deliver(Term::Integer(2));
    assert_eq!(runtime.peek_message(), Some(Term::Integer(1)));
    runtime.next_message();
    assert_eq!(runtime.remove_message(), Some(Term::Integer(2)));
    assert_eq!(runtime.peek_message(), Some(Term::Integer(1)));
    runtime.next_message();
    assert_eq!(runtime.peek_message(), None);
    runtime.timeout();
    assert_eq!(runtime.mailbox().len(), 1);
  }

  #[test]
  fn send_to_self_and_others() {
    let mut runtime = LocalRuntime::new(Arc::new(Linker::new()));
    let me = runtime.self_pid();
    runtime.send(&me, Term::atom("hi")).unwrap();
    runtime.send(&Term::Pid(7), Term::atom("there")).unwrap();
    assert!(runtime.send(&Term::Integer(3), Term::Nil).is_err());
    assert_eq!(runtime.mailbox(), &[Term::atom("hi")]);
    assert_eq!(runtime.sent().len(), 1);
  }

  #[test]
  fn yield_interval() {
    let mut runtime = LocalRuntime::new(Arc::new(Linker::new())).with_yield_interval(2);
    assert!(!runtime.should_yield());
    assert!(runtime.should_yield());
    assert!(!runtime.should_yield());
  }
}
