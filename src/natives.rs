/*!
  Built-in functions of the `erlang` module. These are the functions compiled code reaches through
  `bif`, `gc_bif` and `call_ext` imports of `erlang`. Integers are 64 bits wide; an operation whose
  result does not fit raises `badarith`, as does any float operation with a non-finite result.
*/

use std::cmp::Ordering;
use std::convert::TryFrom;

use crate::atoms;
use crate::linker::Linker;
use crate::term::Term;
use crate::vm::{Fault, FaultClass, Runtime};

type Binary = fn(&Term, &Term) -> Result<Term, Fault>;
type Unary  = fn(&Term) -> Result<Term, Fault>;

/// Registers the `erlang` built-ins with `linker`.
pub fn register_erlang(linker: &mut Linker) {
  let binary: &[(&str, Binary)] = &[
    ("+",    add),
    ("-",    subtract),
    ("*",    multiply),
    ("/",    divide),
    ("div",  int_div),
    ("rem",  int_rem),
    ("band", |a, b| bitwise(a, b, |x, y| Some(x & y))),
    ("bor",  |a, b| bitwise(a, b, |x, y| Some(x | y))),
    ("bxor", |a, b| bitwise(a, b, |x, y| Some(x ^ y))),
    ("bsl",  |a, b| bitwise(a, b, shift_left)),
    ("bsr",  |a, b| bitwise(a, b, |x, y| shift_left(x, y.checked_neg()?))),
    ("==",   |a, b| Ok(Term::boolean(a.compare(b) == Ordering::Equal))),
    ("/=",   |a, b| Ok(Term::boolean(a.compare(b) != Ordering::Equal))),
    ("=:=",  |a, b| Ok(Term::boolean(a.exact_eq(b)))),
    ("=/=",  |a, b| Ok(Term::boolean(!a.exact_eq(b)))),
    ("<",    |a, b| Ok(Term::boolean(a.compare(b) == Ordering::Less))),
    ("=<",   |a, b| Ok(Term::boolean(a.compare(b) != Ordering::Greater))),
    (">",    |a, b| Ok(Term::boolean(a.compare(b) == Ordering::Greater))),
    (">=",   |a, b| Ok(Term::boolean(a.compare(b) != Ordering::Less))),
    ("and",  |a, b| logic(a, b, |x, y| x && y)),
    ("or",   |a, b| logic(a, b, |x, y| x || y)),
    ("xor",  |a, b| logic(a, b, |x, y| x != y)),
    ("element",  element),
    ("max",  |a, b| Ok(match a.compare(b) { Ordering::Less => b.clone(), _ => a.clone() })),
    ("min",  |a, b| Ok(match a.compare(b) { Ordering::Greater => b.clone(), _ => a.clone() })),
  ];
  for (name, function) in binary {
    let function = *function;
    linker.define_native("erlang", name, 2, move |_, args| match args {
      [a, b] => function(a, b),
      _      => Err(Fault::badarg())
    });
  }

  let unary: &[(&str, Unary)] = &[
    ("-",            negate),
    ("+",            |a| number(a).map(|_| a.clone())),
    ("not",          |a| boolean(a).map(|x| Term::boolean(!x))),
    ("bnot",         |a| a.as_integer().map(|i| Term::Integer(!i)).ok_or_else(Fault::badarg)),
    ("abs",          abs),
    ("float",        |a| number(a).map(Term::Float)),
    ("trunc",        |a| to_integer(a, f64::trunc)),
    ("round",        |a| to_integer(a, f64::round)),
    ("byte_size",    |a| bits(a).map(|n| Term::Integer(((n + 7) / 8) as i64))),
    ("bit_size",     |a| bits(a).map(|n| Term::Integer(n as i64))),
    ("length",       |a| list(a).map(|items| Term::Integer(items.len() as i64))),
    ("hd",           |a| cons(a).map(|(head, _)| head)),
    ("tl",           |a| cons(a).map(|(_, tail)| tail)),
    ("tuple_size",   |a| tuple(a).map(|elements| Term::Integer(elements.len() as i64))),
    ("tuple_to_list", |a| tuple(a).map(|elements| Term::list(elements.to_vec()))),
    ("list_to_tuple", |a| list(a).map(Term::tuple)),
    ("throw",        |a| Err(Fault::throw(a.clone()))),
    ("error",        |a| Err(Fault::error(a.clone()))),
    ("exit",         |a| Err(Fault::exit(a.clone()))),
  ];
  for (name, function) in unary {
    let function = *function;
    linker.define_native("erlang", name, 1, move |_, args| match args {
      [a] => function(a),
      _   => Err(Fault::badarg())
    });
  }

  linker.define_native("erlang", "self", 0, |runtime, _| Ok(runtime.self_pid()));
  linker.define_native("erlang", "setelement", 3, |_, args| match args {
    [index, tuple, value] => setelement(index, tuple, value),
    _                     => Err(Fault::badarg())
  });
  linker.define_native("erlang", "raise", 3, |_, args| match args {
    [class, reason, trace] => Err(raise(class, reason, trace)),
    _                      => Err(Fault::badarg())
  });
  for name in &["!", "send"] {
    linker.define_native("erlang", name, 2, send);
  }
}

// region Arithmetic

fn number(term: &Term) -> Result<f64, Fault> {
  term.as_float().ok_or_else(Fault::badarith)
}

fn finite(value: f64) -> Result<Term, Fault> {
  match value.is_finite() {
    true  => Ok(Term::Float(value)),
    false => Err(Fault::badarith())
  }
}

/// Integer arithmetic when both operands are integers, float arithmetic otherwise.
fn arithmetic(
  a        : &Term,
  b        : &Term,
  integer  : fn(i64, i64) -> Option<i64>,
  float    : fn(f64, f64) -> f64
) -> Result<Term, Fault>
{
  match (a, b) {
    (Term::Integer(x), Term::Integer(y)) => integer(*x, *y).map(Term::Integer).ok_or_else(Fault::badarith),
    _                                    => finite(float(number(a)?, number(b)?))
  }
}

fn add(a: &Term, b: &Term) -> Result<Term, Fault> {
  arithmetic(a, b, i64::checked_add, |x, y| x + y)
}

fn subtract(a: &Term, b: &Term) -> Result<Term, Fault> {
  arithmetic(a, b, i64::checked_sub, |x, y| x - y)
}

fn multiply(a: &Term, b: &Term) -> Result<Term, Fault> {
  arithmetic(a, b, i64::checked_mul, |x, y| x * y)
}

fn divide(a: &Term, b: &Term) -> Result<Term, Fault> {
  let divisor = number(b)?;
  if divisor == 0.0 {
    return Err(Fault::badarith());
  }
  finite(number(a)? / divisor)
}

fn integers(a: &Term, b: &Term) -> Result<(i64, i64), Fault> {
  match (a, b) {
    (Term::Integer(x), Term::Integer(y)) => Ok((*x, *y)),
    _                                    => Err(Fault::badarith())
  }
}

fn int_div(a: &Term, b: &Term) -> Result<Term, Fault> {
  let (x, y) = integers(a, b)?;
  x.checked_div(y).map(Term::Integer).ok_or_else(Fault::badarith)
}

fn int_rem(a: &Term, b: &Term) -> Result<Term, Fault> {
  let (x, y) = integers(a, b)?;
  x.checked_rem(y).map(Term::Integer).ok_or_else(Fault::badarith)
}

fn bitwise(a: &Term, b: &Term, op: fn(i64, i64) -> Option<i64>) -> Result<Term, Fault> {
  let (x, y) = integers(a, b)?;
  op(x, y).map(Term::Integer).ok_or_else(Fault::badarith)
}

/// `x bsl n`, or an arithmetic right shift for negative `n`. Fails when bits would be lost.
fn shift_left(x: i64, n: i64) -> Option<i64> {
  match n {
    n if n >= 0 => {
      let shifted = x.checked_shl(u32::try_from(n).ok()?)?;
      match shifted >> n == x {
        true  => Some(shifted),
        false => None
      }
    }
    n if n <= -64 => Some(if x < 0 { -1 } else { 0 }),
    n             => Some(x >> -n)
  }
}

fn negate(a: &Term) -> Result<Term, Fault> {
  match a {
    Term::Integer(i) => i.checked_neg().map(Term::Integer).ok_or_else(Fault::badarith),
    Term::Float(x)   => Ok(Term::Float(-x)),
    _                => Err(Fault::badarith())
  }
}

fn abs(a: &Term) -> Result<Term, Fault> {
  match a {
    Term::Integer(i) => i.checked_abs().map(Term::Integer).ok_or_else(Fault::badarith),
    Term::Float(x)   => Ok(Term::Float(x.abs())),
    _                => Err(Fault::badarg())
  }
}

fn to_integer(a: &Term, rounding: fn(f64) -> f64) -> Result<Term, Fault> {
  match a {
    Term::Integer(_) => Ok(a.clone()),
    Term::Float(x)   => {
      let rounded = rounding(*x);
      match rounded >= i64::MIN as f64 && rounded < i64::MAX as f64 {
        true  => Ok(Term::Integer(rounded as i64)),
        false => Err(Fault::badarith())
      }
    }
    _ => Err(Fault::badarg())
  }
}

// endregion

// region Terms

fn boolean(term: &Term) -> Result<bool, Fault> {
  match term {
    Term::Atom(a) if *a == *atoms::TRUE  => Ok(true),
    Term::Atom(a) if *a == *atoms::FALSE => Ok(false),
    _                                    => Err(Fault::badarg())
  }
}

fn logic(a: &Term, b: &Term, op: fn(bool, bool) -> bool) -> Result<Term, Fault> {
  Ok(Term::boolean(op(boolean(a)?, boolean(b)?)))
}

fn bits(term: &Term) -> Result<usize, Fault> {
  term.as_bitstring().map(|b| b.bit_len()).ok_or_else(Fault::badarg)
}

fn list(term: &Term) -> Result<Vec<Term>, Fault> {
  term.list_to_vec().ok_or_else(Fault::badarg)
}

fn cons(term: &Term) -> Result<(Term, Term), Fault> {
  match term {
    Term::Cons(cell) => Ok((cell.head.clone(), cell.tail.clone())),
    _                => Err(Fault::badarg())
  }
}

fn tuple(term: &Term) -> Result<&[Term], Fault> {
  term.as_tuple().ok_or_else(Fault::badarg)
}

/// A one-based tuple index.
fn index(term: &Term, len: usize) -> Result<usize, Fault> {
  match term.as_size() {
    Some(i) if i >= 1 && i <= len => Ok(i - 1),
    _                             => Err(Fault::badarg())
  }
}

fn element(n: &Term, t: &Term) -> Result<Term, Fault> {
  let elements = tuple(t)?;
  Ok(elements[index(n, elements.len())?].clone())
}

fn setelement(n: &Term, t: &Term, value: &Term) -> Result<Term, Fault> {
  let mut elements = tuple(t)?.to_vec();
  let i = index(n, elements.len())?;
  elements[i] = value.clone();
  Ok(Term::tuple(elements))
}

fn raise(class: &Term, reason: &Term, trace: &Term) -> Fault {
  let class = class.as_atom().and_then(FaultClass::from_atom);
  match (class, trace.list_to_vec()) {
    (Some(class), Some(trace)) => Fault { class, reason: reason.clone(), trace },
    _                          => Fault::badarg()
  }
}

fn send(runtime: &mut dyn Runtime, args: &[Term]) -> Result<Term, Fault> {
  match args {
    [to, message] => {
      runtime.send(to, message.clone())?;
      Ok(message.clone())
    }
    _ => Err(Fault::badarg())
  }
}

// endregion


#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::functor::FunId;
  use crate::linker::Callable;
  use crate::vm::LocalRuntime;

  fn call(name: &str, args: &[Term]) -> Result<Term, Fault> {
    let linker = Linker::with_erlang_natives();
    let mut runtime = LocalRuntime::new(Arc::new(Linker::new()));
    match linker.resolve(&FunId::new("erlang", name, args.len() as u32)) {
      Some(Callable::Native { function, .. }) => function(&mut runtime, args),
      other => panic!("erlang:{}/{} resolved to {:?}", name, args.len(), other),
    }
  }

  fn value(name: &str, args: &[Term]) -> Term {
    match call(name, args) {
      Ok(value)  => value,
      Err(fault) => panic!("erlang:{}/{} raised {}", name, args.len(), fault),
    }
  }

  fn reason(result: Result<Term, Fault>) -> String {
    match result {
      Err(fault) => fault.reason.to_string(),
      Ok(value)  => panic!("expected a fault, got {}", value),
    }
  }

  #[test]
  fn integer_arithmetic() {
    assert_eq!(value("+", &[Term::Integer(2), Term::Integer(3)]), Term::Integer(5));
    assert_eq!(value("div", &[Term::Integer(-7), Term::Integer(2)]), Term::Integer(-3));
    assert_eq!(value("rem", &[Term::Integer(-7), Term::Integer(2)]), Term::Integer(-1));
    assert_eq!(reason(call("div", &[Term::Integer(1), Term::Integer(0)])), "badarith");
    assert_eq!(reason(call("*", &[Term::Integer(i64::MAX), Term::Integer(2)])), "badarith");
    assert_eq!(reason(call("+", &[Term::atom("a"), Term::Integer(1)])), "badarith");
  }

  #[test]
  fn float_arithmetic() {
    assert_eq!(value("+", &[Term::Integer(1), Term::Float(0.5)]), Term::Float(1.5));
    assert_eq!(value("/", &[Term::Integer(1), Term::Integer(4)]), Term::Float(0.25));
    assert_eq!(reason(call("/", &[Term::Integer(1), Term::Integer(0)])), "badarith");
    assert_eq!(value("round", &[Term::Float(2.5)]), Term::Integer(3));
  }

  #[test]
  fn shifts() {
    assert_eq!(value("bsl", &[Term::Integer(1), Term::Integer(4)]), Term::Integer(16));
    assert_eq!(value("bsr", &[Term::Integer(-16), Term::Integer(2)]), Term::Integer(-4));
    assert_eq!(reason(call("bsl", &[Term::Integer(1), Term::Integer(63)])), "badarith");
  }

  #[test]
  fn comparisons_and_logic() {
    assert_eq!(value("==", &[Term::Integer(1), Term::Float(1.0)]), Term::boolean(true));
    assert_eq!(value("=:=", &[Term::Integer(1), Term::Float(1.0)]), Term::boolean(false));
    assert_eq!(value("<", &[Term::Integer(1), Term::atom("a")]), Term::boolean(true));
    assert_eq!(value("and", &[Term::boolean(true), Term::boolean(false)]), Term::boolean(false));
    assert_eq!(reason(call("not", &[Term::Integer(1)])), "badarg");
  }

  #[test]
  fn tuples_and_lists() {
    let t = Term::tuple(vec![Term::atom("a"), Term::atom("b")]);
    assert_eq!(value("element", &[Term::Integer(2), t.clone()]), Term::atom("b"));
    assert_eq!(reason(call("element", &[Term::Integer(3), t.clone()])), "badarg");
    assert_eq!(value("setelement", &[Term::Integer(1), t.clone(), Term::Nil]).to_string(), "{[],b}");
    let l = Term::list(vec![Term::Integer(1), Term::Integer(2)]);
    assert_eq!(value("length", &[l.clone()]), Term::Integer(2));
    assert_eq!(value("hd", &[l.clone()]), Term::Integer(1));
    assert_eq!(value("list_to_tuple", &[l]).to_string(), "{1,2}");
    assert_eq!(reason(call("hd", &[Term::Nil])), "badarg");
    assert_eq!(value("byte_size", &[Term::binary(b"abc")]), Term::Integer(3));
  }

  #[test]
  fn raising() {
    match call("throw", &[Term::atom("ball")]) {
      Err(fault) => assert_eq!(fault.class, FaultClass::Throw),
      other      => panic!("unexpected {:?}", other),
    }
    let trace = Term::list(vec![Term::tuple(vec![Term::atom("m"), Term::atom("f"), Term::Integer(0)])]);
    match call("raise", &[Term::atom("exit"), Term::atom("bye"), trace]) {
      Err(fault) => {
        assert_eq!(fault.class, FaultClass::Exit);
        assert_eq!(fault.trace.len(), 1);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(reason(call("raise", &[Term::atom("oops"), Term::Nil, Term::Nil])), "badarg");
  }

  #[test]
  fn wrong_argument_counts_are_badarg() {
    let linker = Linker::with_erlang_natives();
    let mut runtime = LocalRuntime::new(Arc::new(Linker::new()));
    let plus = match linker.resolve(&FunId::new("erlang", "+", 2)) {
      Some(Callable::Native { function, .. }) => function,
      other                                   => panic!("erlang:'+'/2 resolved to {:?}", other),
    };
    assert_eq!(reason(plus(&mut runtime, &[Term::Integer(1)])), "badarg");
    assert_eq!(reason(plus(&mut runtime, &[])), "badarg");
    assert_eq!(plus(&mut runtime, &[Term::Integer(1), Term::Integer(1)]).ok(), Some(Term::Integer(2)));
  }

  #[test]
  fn self_and_send() {
    assert_eq!(value("self", &[]), Term::Pid(1));
    assert_eq!(value("!", &[Term::Pid(9), Term::atom("hi")]), Term::atom("hi"));
    assert_eq!(reason(call("send", &[Term::Nil, Term::atom("hi")])), "badarg");
  }
}
