/*!
  Bodies of the binary matching and construction families.

  Matching runs against a match context held in a register or stack slot. Construction goes
  through the activation's single binary builder: `bs_init*` and `bs_append` open it, each
  `bs_put_*` appends one segment, and the finished binary is published to the destination as
  soon as the declared size has been written.
*/

use crate::atoms;
use crate::bits::{utf16_size, utf8_size, BitBuilder, BitString, MatchState};
use crate::bytecode::{Decoded, Family};
use crate::error::{ExecError, InternalError};
use crate::term::Term;

use super::{Dest, Flow, Machine};

/// The size of a segment, already multiplied by its unit.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Size {
  Bits(usize),
  All,
}

impl Size {
  /// `None` when `size` is neither a non-negative integer nor `all`.
  fn of(size: &Term, unit: u16) -> Option<Size> {
    match size {
      Term::Atom(a) if *a == *atoms::ALL => Some(Size::All),
      other => other.as_size()
                    .and_then(|n| n.checked_mul(unit as usize))
                    .map(Size::Bits)
    }
  }

  fn bits(self) -> Option<usize> {
    match self {
      Size::Bits(n) => Some(n),
      Size::All     => None
    }
  }
}

impl<'a> Machine<'a> {

  fn match_state(&mut self, at: Dest, op: &'static str) -> Result<&mut MatchState, InternalError> {
    match self.slot_mut(at)? {
      Term::MatchContext(state) => Ok(state),
      _                         => Err(InternalError::NoMatchContext(op))
    }
  }

  fn builder(&mut self, op: &'static str) -> Result<&mut BitBuilder, InternalError> {
    match &mut self.frame.bits {
      Some((builder, _)) => Ok(builder),
      None               => Err(InternalError::NoBinary(op))
    }
  }

  /// Writes the binary under construction to its destination once it is complete.
  fn publish(&mut self) -> Result<(), InternalError> {
    let complete = match &self.frame.bits {
      Some((builder, _)) => builder.is_complete(),
      None               => false
    };
    if complete {
      if let Some((builder, dest)) = self.frame.bits.take() {
        self.write(dest, Term::Binary(builder.bitstring()))?;
      }
    }
    Ok(())
  }

  fn open_builder(&mut self, builder: BitBuilder, dest: Dest) -> Result<(), InternalError> {
    self.write(dest, Term::Binary(builder.bitstring()))?;
    self.frame.bits = Some((builder, dest));
    self.publish()
  }

  fn constant_bits(&self, index: u16) -> Result<BitString, InternalError> {
    match self.module.constant(index) {
      Term::Binary(bits) => Ok(bits.clone()),
      _                  => Err(InternalError::NoBinary("constant"))
    }
  }

  pub(super) fn binary_op(&mut self, decoded: Decoded) -> Result<Flow, ExecError> {
    match decoded.family {

      // region Matching

      Family::BsStartMatch => {
        let source = self.prefetched(0);
        let label = self.label()?;
        let slots = self.fetch()? as usize;
        let dest = self.dest(decoded.variant(0))?;
        let state = match source {
          Term::Binary(bin)         => MatchState::new(bin, slots),
          Term::MatchContext(state) => state.reuse(slots),
          _                         => return self.fail(label)
        };
        self.write(dest, Term::MatchContext(Box::new(state)))?;
      }

      Family::BsGetInteger | Family::BsGetFloat | Family::BsGetBinary => {
        let size = self.prefetched(0);
        let context = self.dest(decoded.variant(0))?;
        let unit = self.fetch()?;
        let flags = self.fetch()?;
        let dest = self.dest(decoded.variant(1))?;
        let label = self.label()?;
        let size = match Size::of(&size, unit) {
          Some(size) => size,
          None       => return self.fail(label)
        };

        let state = self.match_state(context, "bs_get")?;
        let value = match (decoded.family, size) {
          (Family::BsGetInteger, Size::Bits(n)) => state.get_integer(n, flags).map(Term::Integer),
          (Family::BsGetFloat, Size::Bits(n))   => state.get_float(n, flags).map(Term::Float),
          (Family::BsGetBinary, size)           => {
            state.get_binary(size.bits(), unit as usize).map(Term::Binary)
          }
          _                                     => None
        };
        match value {
          Some(value) => self.write(dest, value)?,
          None        => return self.fail(label)
        }
      }

      Family::BsSkipBits => {
        let size = self.prefetched(0);
        let context = self.dest(decoded.variant(0))?;
        let unit = self.fetch()?;
        let _flags = self.fetch()?;
        let label = self.label()?;
        let passed = match Size::of(&size, unit) {
          Some(size) => self.match_state(context, "bs_skip_bits")?.skip(size.bits(), unit as usize),
          None       => false
        };
        return self.branch(passed, label);
      }

      Family::BsTestTail | Family::BsTestUnit => {
        let context = self.dest(decoded.variant(0))?;
        let n = self.fetch()? as usize;
        let label = self.label()?;
        let state = self.match_state(context, "bs_test")?;
        let passed = match decoded.family {
          Family::BsTestTail => state.test_tail(n),
          _                  => state.test_unit(n)
        };
        return self.branch(passed, label);
      }

      Family::BsMatchString => {
        let context = self.dest(decoded.variant(0))?;
        let expected = self.fetch()?;
        let label = self.label()?;
        let expected = self.constant_bits(expected)?;
        let passed = self.match_state(context, "bs_match_string")?.match_string(&expected);
        return self.branch(passed, label);
      }

      Family::BsGetUtf8 | Family::BsGetUtf16 | Family::BsGetUtf32 => {
        let context = self.dest(decoded.variant(0))?;
        let flags = self.fetch()?;
        let dest = self.dest(decoded.variant(1))?;
        let label = self.label()?;
        let state = self.match_state(context, "bs_get_utf")?;
        let c = match decoded.family {
          Family::BsGetUtf8  => state.get_utf8(),
          Family::BsGetUtf16 => state.get_utf16(flags),
          _                  => state.get_utf32(flags),
        };
        match c {
          Some(c) => self.write(dest, Term::Integer(c as i64))?,
          None    => return self.fail(label)
        }
      }

      Family::BsSkipUtf8 | Family::BsSkipUtf16 | Family::BsSkipUtf32 => {
        let context = self.dest(decoded.variant(0))?;
        let flags = self.fetch()?;
        let label = self.label()?;
        let state = self.match_state(context, "bs_skip_utf")?;
        let passed = match decoded.family {
          Family::BsSkipUtf8  => state.get_utf8().is_some(),
          Family::BsSkipUtf16 => state.get_utf16(flags).is_some(),
          _                   => state.get_utf32(flags).is_some(),
        };
        return self.branch(passed, label);
      }

      Family::BsSave | Family::BsRestore => {
        let context = self.dest(decoded.variant(0))?;
        let slot = self.fetch()? as i16 as i32;
        let state = self.match_state(context, "bs_save")?;
        let done = match decoded.family {
          Family::BsSave => state.save(slot),
          _              => state.restore(slot)
        };
        if !done {
          return Err(InternalError::BadSaveSlot(slot).into());
        }
      }

      Family::BsContextToBinary => {
        let at = self.dest(decoded.variant(0))?;
        let binary = match self.read(at)? {
          Term::MatchContext(state) => Some(state.to_binary()),
          _                         => None
        };
        if let Some(binary) = binary {
          self.write(at, Term::Binary(binary))?;
        }
      }

      // endregion

      // region Construction

      Family::BsInit | Family::BsInitBits => {
        let size = self.prefetched(0);
        let _flags = self.fetch()?;
        let dest = self.dest(decoded.variant(0))?;
        let label = self.label()?;
        let unit = match decoded.family {
          Family::BsInit => 8,
          _              => 1
        };
        match Size::of(&size, unit) {
          Some(Size::Bits(n)) => self.open_builder(BitBuilder::new(n), dest)?,
          _                   => return self.fail(label)
        }
      }

      Family::BsInitWritable => {
        self.process.set_x(0, Term::Binary(BitString::empty()));
      }

      Family::BsAppend | Family::BsPrivateAppend => {
        let extra = self.prefetched(0);
        let binary = self.prefetched(1);
        let unit = self.fetch()?;
        let _flags = self.fetch()?;
        let dest = self.dest(decoded.variant(0))?;
        let label = self.label()?;
        let (existing, extra) = match (binary, extra.as_size()) {
          (Term::Binary(bits), Some(extra)) if unit <= 1 || bits.bit_len() % unit as usize == 0 => (bits, extra),
          _                                                                                      => return self.fail(label)
        };
        self.open_builder(BitBuilder::append(existing, extra), dest)?;
      }

      Family::BsPutInteger | Family::BsPutFloat | Family::BsPutBinary => {
        let size = self.prefetched(0);
        let value = self.prefetched(1);
        let unit = self.fetch()?;
        let flags = self.fetch()?;
        let label = self.label()?;
        let size = match Size::of(&size, unit) {
          Some(size) => size,
          None       => return self.fail(label)
        };

        let builder = self.builder("bs_put")?;
        let done = match (decoded.family, size, &value) {
          (Family::BsPutInteger, Size::Bits(n), Term::Integer(i)) => builder.put_integer(*i, n, flags),
          (Family::BsPutFloat, Size::Bits(n), number) => match number.as_float() {
            Some(x) => builder.put_float(x, n, flags),
            None    => false
          },
          (Family::BsPutBinary, size, Term::Binary(bits)) => builder.put_bitstring(bits, size.bits()),
          _ => false
        };
        match done {
          true  => self.publish()?,
          false => return self.fail(label)
        }
      }

      Family::BsPutString => {
        let index = self.fetch()?;
        let bits = self.constant_bits(index)?;
        self.builder("bs_put_string")?.put_bitstring(&bits, None);
        self.publish()?;
      }

      Family::BsPutUtf8 | Family::BsPutUtf16 | Family::BsPutUtf32 => {
        let value = self.prefetched(0);
        let flags = self.fetch()?;
        let label = self.label()?;
        let code_point = match value.as_integer() {
          Some(code_point) => code_point,
          None             => return self.fail(label)
        };
        let builder = self.builder("bs_put_utf")?;
        let done = match decoded.family {
          Family::BsPutUtf8  => builder.put_utf8(code_point),
          Family::BsPutUtf16 => builder.put_utf16(code_point, flags),
          _                  => builder.put_utf32(code_point, flags),
        };
        match done {
          true  => self.publish()?,
          false => return self.fail(label)
        }
      }

      Family::BsUtf8Size | Family::BsUtf16Size => {
        let value = self.prefetched(0);
        let dest = self.dest(decoded.variant(0))?;
        let label = self.label()?;
        let size = value.as_integer().and_then(|code_point| match decoded.family {
          Family::BsUtf8Size => utf8_size(code_point),
          _                  => utf16_size(code_point)
        });
        match size {
          Some(n) => self.write(dest, Term::Integer(n as i64))?,
          None    => return self.fail(label)
        }
      }

      Family::BsAdd => {
        let a = self.prefetched(0);
        let b = self.prefetched(1);
        let unit = self.fetch()?;
        let dest = self.dest(decoded.variant(0))?;
        let label = self.label()?;
        let sum = match (a.as_size(), b.as_size()) {
          (Some(a), Some(b)) => b.checked_mul(unit as usize).and_then(|b| a.checked_add(b)),
          _                  => None
        };
        match sum {
          Some(sum) if sum <= i64::MAX as usize => self.write(dest, Term::Integer(sum as i64))?,
          _                                     => return self.fail(label)
        }
      }

      // endregion

      _ => {
        return Err(InternalError::UnimplementedOpcode { opcode: decoded.family.code() as u16, pc: self.frame.last_pc }.into());
      }
    }

    Ok(Flow::Next)
  }
}
