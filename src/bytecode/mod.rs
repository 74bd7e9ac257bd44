/*!
  Module code in its two forms.

  The symbolic form is what the upstream decoder produces: a list of `Instruction`s, each an
  `Operation` with a vector of operands. The encoded form is what the dispatch loop runs: a flat
  array of 16 bit words. Each instruction becomes an internal opcode word followed by its operand
  words, and internal opcodes are specialized on the kinds of their operands (`opcode`), so the
  interpreter never has to inspect an operand tag at run time. `Encoder` translates the first form
  into the second. `assembly` reads the symbolic form from its textual listing format.

  One design decision that needed to be made is whether to store the operands of an instruction
  as data members of enum variants, with one variant per opcode. The largest instruction has eight
  operands, so every instruction would pay for eight. Instead, an enum is only used for the opcode
  itself, and operands follow it as plain words in the code array.
*/

mod assembly;
mod encoder;
mod instruction;
mod opcode;

pub use assembly::{assemble, parse_listing, parse_term, FunctionListing, Listing};
pub use encoder::Encoder;
pub use instruction::{Instruction, Operation};
pub use opcode::{Decoded, Family, OpcodeTable, Slot, MAX_POLYMORPHIC, NO_LABEL, OPCODES};
