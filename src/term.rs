/*!
  Erlang terms as seen by the interpreter. Compound terms are reference counted and immutable, so
  a term can be copied between registers, stack slots, and the constant pool of a module shared
  between threads without copying its contents.

  Two variants never escape the interpreter. A `MatchContext` holds a binary match cursor and is
  owned by whichever register or stack slot currently holds it. A `CatchTag` is stored in the stack
  slot reserved by a `catch`/`try` instruction and remembers the handler established there.
*/

use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use crate::atoms;
use crate::bits::{BitString, MatchState};
use crate::functor::{Atom, FunId};
use crate::module::Module;
use crate::vm::Handler;

#[derive(Clone, Debug)]
pub enum Term {
  Integer(i64),
  Float(f64),
  Atom(Atom),
  Reference(u64),
  Fun(Fun),
  Port(u64),
  Pid(u64),
  Tuple(Arc<Vec<Term>>),
  Nil,
  Cons(Arc<Cons>),
  Binary(BitString),
  MatchContext(Box<MatchState>),
  CatchTag(Arc<Handler>),
}

#[derive(Clone, Debug)]
pub struct Cons {
  pub head: Term,
  pub tail: Term,
}

#[derive(Clone, Debug)]
pub enum Fun {
  /// A fun created by `make_fun2`: code in a loaded module plus its captured free variables.
  Closure(Arc<Closure>),
  /// `fun m:f/a`, resolved by name whenever it is called.
  Export(Arc<FunId>),
}

/**
  A closure bundles a code offset with its captured environment. When it is called the free
  variables are placed in the register slots immediately following the formal arguments.
*/
pub struct Closure {
  pub module : Arc<Module>,
  pub entry  : usize,
  /// The number of formal arguments, not counting the environment.
  pub arity  : usize,
  pub env    : Vec<Term>,
}

impl Debug for Closure {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Closure")
      .field("module", &self.module.name())
      .field("entry", &self.entry)
      .field("arity", &self.arity)
      .field("env", &self.env)
      .finish()
  }
}

impl Default for Term {
  fn default() -> Term {
    Term::Nil
  }
}

impl Term {

  // region Constructors

  pub fn atom(name: &str) -> Term {
    Term::Atom(Atom::from(name))
  }

  pub fn boolean(value: bool) -> Term {
    match value {
      true  => Term::Atom(atoms::TRUE.clone()),
      false => Term::Atom(atoms::FALSE.clone())
    }
  }

  pub fn tuple(elements: Vec<Term>) -> Term {
    Term::Tuple(Arc::new(elements))
  }

  pub fn cons(head: Term, tail: Term) -> Term {
    Term::Cons(Arc::new(Cons { head, tail }))
  }

  /// A proper list of `items`.
  pub fn list(items: Vec<Term>) -> Term {
    items.into_iter().rev().fold(Term::Nil, |tail, head| Term::cons(head, tail))
  }

  pub fn binary(bytes: &[u8]) -> Term {
    Term::Binary(BitString::from_bytes(bytes.to_vec()))
  }

  // endregion

  // region Type tests

  pub fn is_integer(&self) -> bool {
    match self { Term::Integer(_) => true, _ => false }
  }

  pub fn is_float(&self) -> bool {
    match self { Term::Float(_) => true, _ => false }
  }

  pub fn is_number(&self) -> bool {
    self.is_integer() || self.is_float()
  }

  pub fn is_atom(&self) -> bool {
    match self { Term::Atom(_) => true, _ => false }
  }

  pub fn is_boolean(&self) -> bool {
    match self {
      Term::Atom(a) => *a == *atoms::TRUE || *a == *atoms::FALSE,
      _             => false
    }
  }

  pub fn is_nil(&self) -> bool {
    match self { Term::Nil => true, _ => false }
  }

  pub fn is_list(&self) -> bool {
    match self { Term::Nil | Term::Cons(_) => true, _ => false }
  }

  pub fn is_nonempty_list(&self) -> bool {
    match self { Term::Cons(_) => true, _ => false }
  }

  pub fn is_tuple(&self) -> bool {
    match self { Term::Tuple(_) => true, _ => false }
  }

  pub fn is_binary(&self) -> bool {
    match self { Term::Binary(b) => b.is_binary(), _ => false }
  }

  pub fn is_bitstr(&self) -> bool {
    match self { Term::Binary(_) => true, _ => false }
  }

  pub fn is_function(&self) -> bool {
    match self { Term::Fun(_) => true, _ => false }
  }

  pub fn is_pid(&self) -> bool {
    match self { Term::Pid(_) => true, _ => false }
  }

  pub fn is_reference(&self) -> bool {
    match self { Term::Reference(_) => true, _ => false }
  }

  pub fn is_port(&self) -> bool {
    match self { Term::Port(_) => true, _ => false }
  }

  // endregion

  // region Accessors

  pub fn as_integer(&self) -> Option<i64> {
    match self { Term::Integer(i) => Some(*i), _ => None }
  }

  /// Any number as a float.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      Term::Integer(i) => Some(*i as f64),
      Term::Float(x)   => Some(*x),
      _                => None
    }
  }

  pub fn as_atom(&self) -> Option<&Atom> {
    match self { Term::Atom(a) => Some(a), _ => None }
  }

  pub fn as_tuple(&self) -> Option<&[Term]> {
    match self { Term::Tuple(elements) => Some(elements.as_slice()), _ => None }
  }

  pub fn as_bitstring(&self) -> Option<&BitString> {
    match self { Term::Binary(b) => Some(b), _ => None }
  }

  /// A non-negative integer as a size or index.
  pub fn as_size(&self) -> Option<usize> {
    match self {
      Term::Integer(i) if *i >= 0 => Some(*i as usize),
      _                           => None
    }
  }

  /// The elements of a proper list.
  pub fn list_to_vec(&self) -> Option<Vec<Term>> {
    let mut items = vec![];
    let mut cursor = self;
    loop {
      match cursor {
        Term::Nil     => return Some(items),
        Term::Cons(c) => {
          items.push(c.head.clone());
          cursor = &c.tail;
        }
        _             => return None
      }
    }
  }

  /// The number of arguments a fun accepts.
  pub fn function_arity(&self) -> Option<usize> {
    match self {
      Term::Fun(Fun::Closure(c)) => Some(c.arity),
      Term::Fun(Fun::Export(id)) => Some(id.arity as usize),
      _                          => None
    }
  }

  // endregion

  // region Comparison

  fn rank(&self) -> u8 {
    match self {
      Term::Integer(_) | Term::Float(_) => 0,
      Term::Atom(_)                     => 1,
      Term::Reference(_)                => 2,
      Term::Fun(_)                      => 3,
      Term::Port(_)                     => 4,
      Term::Pid(_)                      => 5,
      Term::Tuple(_)                    => 6,
      Term::Nil                         => 7,
      Term::Cons(_)                     => 8,
      Term::Binary(_)                   => 9,
      Term::MatchContext(_)             => 10,
      Term::CatchTag(_)                 => 11,
    }
  }

  /**
    The standard term order: number < atom < reference < fun < port < pid < tuple < nil < list <
    bitstring. Integers and floats compare by value, so `compare(1, 1.0)` is `Equal`; use
    `exact_eq` for `=:=`.
  */
  pub fn compare(&self, other: &Term) -> Ordering {
    match (self, other) {
      (Term::Integer(a), Term::Integer(b)) => a.cmp(b),
      (Term::Float(a),   Term::Float(b))   => a.partial_cmp(b).unwrap_or(Ordering::Equal),
      (Term::Integer(a), Term::Float(b))   => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
      (Term::Float(a),   Term::Integer(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
      (Term::Atom(a),    Term::Atom(b))    => (**a).cmp(&**b),
      | (Term::Reference(a), Term::Reference(b))
      | (Term::Port(a),      Term::Port(b))
      | (Term::Pid(a),       Term::Pid(b)) => a.cmp(b),
      (Term::Fun(a), Term::Fun(b))         => compare_funs(a, b),
      (Term::Tuple(a), Term::Tuple(b))     => {
        a.len().cmp(&b.len()).then_with(|| {
          for (x, y) in a.iter().zip(b.iter()) {
            match x.compare(y) {
              Ordering::Equal => {}
              unequal         => return unequal
            }
          }
          Ordering::Equal
        })
      }
      (Term::Cons(_), Term::Cons(_))       => {
        let (mut x, mut y) = (self, other);
        loop {
          match (x, y) {
            (Term::Cons(a), Term::Cons(b)) => {
              match a.head.compare(&b.head) {
                Ordering::Equal => {
                  x = &a.tail;
                  y = &b.tail;
                }
                unequal         => return unequal
              }
            }
            _ => return x.compare(y)
          }
        }
      }
      (Term::Binary(a), Term::Binary(b))   => a.compare(b),
      _                                    => self.rank().cmp(&other.rank())
    }
  }

  /// `=:=`: like `compare(..) == Equal` except that an integer never equals a float.
  pub fn exact_eq(&self, other: &Term) -> bool {
    match (self, other) {
      | (Term::Integer(_), Term::Float(_))
      | (Term::Float(_), Term::Integer(_)) => false,
      (Term::Tuple(a), Term::Tuple(b))     => {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.exact_eq(y))
      }
      (Term::Cons(_), Term::Cons(_))       => {
        let (mut x, mut y) = (self, other);
        loop {
          match (x, y) {
            (Term::Cons(a), Term::Cons(b)) => {
              if !a.head.exact_eq(&b.head) {
                return false;
              }
              x = &a.tail;
              y = &b.tail;
            }
            _ => return x.exact_eq(y)
          }
        }
      }
      _ => self.compare(other) == Ordering::Equal
    }
  }

  // endregion
}

fn compare_funs(a: &Fun, b: &Fun) -> Ordering {
  match (a, b) {
    (Fun::Closure(x), Fun::Closure(y)) => {
      (**x.module.name()).cmp(&**y.module.name())
        .then(x.entry.cmp(&y.entry))
        .then(x.env.len().cmp(&y.env.len()))
        .then_with(|| {
          for (p, q) in x.env.iter().zip(y.env.iter()) {
            match p.compare(q) {
              Ordering::Equal => {}
              unequal         => return unequal
            }
          }
          Ordering::Equal
        })
    }
    (Fun::Export(x), Fun::Export(y)) => {
      (*x.module).cmp(&*y.module)
        .then((*x.function).cmp(&*y.function))
        .then(x.arity.cmp(&y.arity))
    }
    (Fun::Closure(_), Fun::Export(_)) => Ordering::Less,
    (Fun::Export(_), Fun::Closure(_)) => Ordering::Greater,
  }
}

impl PartialEq for Term {
  fn eq(&self, other: &Term) -> bool {
    self.exact_eq(other)
  }
}

// region Display

fn write_atom(f: &mut Formatter<'_>, atom: &Atom) -> std::fmt::Result {
  let text: &str = &**atom;
  let mut chars = text.chars();
  let bare = match chars.next() {
    Some(c) if c.is_ascii_lowercase() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@'),
    _                                 => false
  };
  match bare {
    true  => write!(f, "{}", text),
    false => write!(f, "'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
  }
}

fn write_bitstring(f: &mut Formatter<'_>, bits: &BitString) -> std::fmt::Result {
  let bytes = bits.to_bytes();
  let whole = bits.byte_len();
  let printable = bits.is_binary()
    && whole > 0
    && bytes.iter().all(|b| (0x20..0x7F).contains(b) && *b != b'"' && *b != b'\\');
  if printable {
    return write!(f, "<<\"{}\">>", String::from_utf8_lossy(&bytes));
  }
  let mut parts: Vec<String> = bytes[..whole].iter().map(u8::to_string).collect();
  let tail_bits = bits.bit_len() % 8;
  if tail_bits != 0 {
    parts.push(format!("{}:{}", bits.read(whole * 8, tail_bits), tail_bits));
  }
  write!(f, "<<{}>>", parts.join(","))
}

impl Display for Term {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Term::Integer(i)   => write!(f, "{}", i),
      Term::Float(x)     => write!(f, "{:?}", x),
      Term::Atom(a)      => write_atom(f, a),
      Term::Reference(r) => write!(f, "#Ref<0.{}>", r),
      Term::Port(p)      => write!(f, "#Port<0.{}>", p),
      Term::Pid(p)       => write!(f, "<0.{}.0>", p),
      Term::Fun(Fun::Closure(c)) => write!(f, "#Fun<{}.{}.{}>", c.module.name(), c.entry, c.arity),
      Term::Fun(Fun::Export(id)) => write!(f, "fun {}", id),
      Term::Tuple(elements) => {
        write!(f, "{{")?;
        for (i, e) in elements.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}", e)?;
        }
        write!(f, "}}")
      }
      Term::Nil          => write!(f, "[]"),
      Term::Cons(_)      => {
        write!(f, "[")?;
        let mut cursor = self;
        let mut first = true;
        loop {
          match cursor {
            Term::Cons(c) => {
              if !first {
                write!(f, ",")?;
              }
              write!(f, "{}", c.head)?;
              first = false;
              cursor = &c.tail;
            }
            Term::Nil     => break,
            improper      => {
              write!(f, "|{}", improper)?;
              break;
            }
          }
        }
        write!(f, "]")
      }
      Term::Binary(b)       => write_bitstring(f, b),
      Term::MatchContext(m) => write!(f, "#MatchState<{}>", m.offset()),
      Term::CatchTag(h)     => write!(f, "#Catch<{}>", h.label),
    }
  }
}

// endregion
