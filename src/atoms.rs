//! Atoms the interpreter itself needs to produce, interned once.

use crate::functor::Atom;

lazy_static! {
  pub static ref TRUE           : Atom = Atom::from("true");
  pub static ref FALSE          : Atom = Atom::from("false");
  pub static ref ALL            : Atom = Atom::from("all");
  pub static ref INFINITY       : Atom = Atom::from("infinity");
  pub static ref EXIT           : Atom = Atom::from("EXIT");
  pub static ref BADARG         : Atom = Atom::from("badarg");
  pub static ref BADARITH       : Atom = Atom::from("badarith");
  pub static ref BADARITY       : Atom = Atom::from("badarity");
  pub static ref BADFUN         : Atom = Atom::from("badfun");
  pub static ref BADMATCH       : Atom = Atom::from("badmatch");
  pub static ref CASE_CLAUSE    : Atom = Atom::from("case_clause");
  pub static ref TRY_CLAUSE     : Atom = Atom::from("try_clause");
  pub static ref IF_CLAUSE      : Atom = Atom::from("if_clause");
  pub static ref FUNCTION_CLAUSE: Atom = Atom::from("function_clause");
  pub static ref UNDEF          : Atom = Atom::from("undef");
  pub static ref TIMEOUT_VALUE  : Atom = Atom::from("timeout_value");
}
