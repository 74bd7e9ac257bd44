/*!
  An interpreter core for compiled Erlang module code.

  Symbolic instructions, as the compiler lists them, are encoded by `bytecode::Encoder` into a
  `Module`: a flat array of 16 bit words whose opcodes are specialized on the kinds of their
  operands. A `linker::Linker` binds the module's imports, and `vm::interpret` runs the code
  until it returns, raises an uncaught fault, or suspends.
*/

#[macro_use] extern crate prettytable;
#[macro_use] extern crate lazy_static;

pub mod atoms;
pub mod bits;
pub mod bytecode;
pub mod error;
pub mod functor;
pub mod linker;
pub mod module;
pub mod natives;
pub mod operand;
pub mod symboltable;
pub mod term;
pub mod vm;
