//! The cursor driven by binary matching instructions.

use super::{BitString, is_little, is_signed, significance};

/**
  A match context: a binary plus a bit offset into it, together with the numbered save slots used
  by `bs_save2`/`bs_restore2`. Slot `-1` refers to the position at which matching started.

  Every operation either succeeds and advances the cursor, or fails and leaves the cursor where it
  was. There is no other state, so running the same sequence of operations on the same binary
  always produces the same values and final offset.
*/
#[derive(Clone, Debug)]
pub struct MatchState {
  bin    : BitString,
  offset : usize,
  start  : usize,
  saved  : Vec<usize>,
}

impl MatchState {

  pub fn new(bin: BitString, slots: usize) -> MatchState {
    MatchState {
      bin,
      offset : 0,
      start  : 0,
      saved  : vec![0; slots]
    }
  }

  /// Restarts matching from the current position with a fresh set of save slots.
  pub fn reuse(&self, slots: usize) -> MatchState {
    MatchState {
      bin    : self.bin.clone(),
      offset : self.offset,
      start  : self.offset,
      saved  : vec![self.offset; slots]
    }
  }

  pub fn offset(&self) -> usize {
    self.offset
  }

  pub fn remaining(&self) -> usize {
    self.bin.bit_len() - self.offset
  }

  pub fn binary(&self) -> &BitString {
    &self.bin
  }

  pub fn get_integer(&mut self, n: usize, flags: u16) -> Option<i64> {
    if n > self.remaining() {
      return None;
    }
    let little = is_little(flags);
    let signed = is_signed(flags);
    let value = match !little && n <= 64 {
      true  => self.bin.read(self.offset, n),
      false => {
        let mut value = 0u64;
        for s in 0..n {
          let bit = self.bin.bit(self.offset + s) as u64;
          let i = significance(s, n, little);
          match i < 64 {
            true  => value |= bit << i,
            // Integers are 64 bits wide. Wider segments only match when the excess bits are
            // pure sign extension.
            false => {
              let fill = match signed {
                true  => (self.bin.bit(self.offset + significance_inverse(63, n, little)) as u64),
                false => 0
              };
              if bit != fill {
                return None;
              }
            }
          }
        }
        value
      }
    };
    let value = match signed {
      true if n > 0 && n < 64 && (value >> (n - 1)) & 1 == 1 => (value | (!0u64 << n)) as i64,
      true  => value as i64,
      false => {
        if n >= 64 && (value as i64) < 0 {
          return None;
        }
        value as i64
      }
    };
    self.offset += n;
    Some(value)
  }

  pub fn get_float(&mut self, n: usize, flags: u16) -> Option<f64> {
    if (n != 32 && n != 64) || n > self.remaining() {
      return None;
    }
    let saved = self.offset;
    let raw = self.get_integer(n, flags & !super::FLAG_SIGNED)? as u64;
    let value = match n {
      32 => f32::from_bits(raw as u32) as f64,
      _  => f64::from_bits(raw)
    };
    match value.is_finite() {
      true  => Some(value),
      false => {
        self.offset = saved;
        None
      }
    }
  }

  /// Takes `n` bits as a sub-binary, or everything left when `n` is `None`.
  pub fn get_binary(&mut self, n: Option<usize>, unit: usize) -> Option<BitString> {
    let n = self.segment_size(n, unit)?;
    let value = self.bin.slice(self.offset, n);
    self.offset += n;
    Some(value)
  }

  pub fn skip(&mut self, n: Option<usize>, unit: usize) -> bool {
    match self.segment_size(n, unit) {
      Some(n) => {
        self.offset += n;
        true
      }
      None => false
    }
  }

  fn segment_size(&self, n: Option<usize>, unit: usize) -> Option<usize> {
    match n {
      Some(n) if n <= self.remaining() => Some(n),
      Some(_)                          => None,
      None if unit <= 1 || self.remaining() % unit == 0 => Some(self.remaining()),
      None                             => None
    }
  }

  pub fn test_tail(&self, bits: usize) -> bool {
    self.remaining() == bits
  }

  pub fn test_unit(&self, unit: usize) -> bool {
    unit == 0 || self.remaining() % unit == 0
  }

  pub fn match_string(&mut self, expected: &BitString) -> bool {
    let n = expected.bit_len();
    if n > self.remaining() || !self.bin.slice(self.offset, n).exact_eq(expected) {
      return false;
    }
    self.offset += n;
    true
  }

  pub fn get_utf8(&mut self) -> Option<char> {
    if self.remaining() < 8 {
      return None;
    }
    let lead = self.bin.read(self.offset, 8) as u8;
    let len = match lead {
      0x00..=0x7F => 1,
      0xC2..=0xDF => 2,
      0xE0..=0xEF => 3,
      0xF0..=0xF4 => 4,
      _           => return None
    };
    if self.remaining() < len * 8 {
      return None;
    }
    let bytes: Vec<u8> = (0..len)
      .map(|i| self.bin.read(self.offset + 8 * i, 8) as u8)
      .collect();
    let c = std::str::from_utf8(&bytes).ok()?.chars().next()?;
    self.offset += len * 8;
    Some(c)
  }

  pub fn get_utf16(&mut self, flags: u16) -> Option<char> {
    let saved = self.offset;
    let flags = flags & !super::FLAG_SIGNED;
    let first = self.get_integer(16, flags)? as u16;
    let units = match first {
      0xD800..=0xDBFF => match self.get_integer(16, flags) {
        Some(second) => vec![first, second as u16],
        None         => {
          self.offset = saved;
          return None;
        }
      },
      _ => vec![first]
    };
    match std::char::decode_utf16(units.into_iter()).next() {
      Some(Ok(c)) => Some(c),
      _           => {
        self.offset = saved;
        None
      }
    }
  }

  pub fn get_utf32(&mut self, flags: u16) -> Option<char> {
    let saved = self.offset;
    let value = self.get_integer(32, flags & !super::FLAG_SIGNED)?;
    match std::char::from_u32(value as u32) {
      Some(c) => Some(c),
      None    => {
        self.offset = saved;
        None
      }
    }
  }

  /// Records the current position in `slot`. Returns `false` for a slot that was never reserved.
  pub fn save(&mut self, slot: i32) -> bool {
    match slot {
      -1 => self.start = self.offset,
      _ => match self.saved.get_mut(slot as usize) {
        Some(saved) => *saved = self.offset,
        None        => return false
      }
    }
    true
  }

  pub fn restore(&mut self, slot: i32) -> bool {
    match slot {
      -1 => self.offset = self.start,
      _ => match self.saved.get(slot as usize) {
        Some(saved) => self.offset = *saved,
        None        => return false
      }
    }
    true
  }

  /// The binary from the position recorded in the first save slot to the end.
  pub fn to_binary(&self) -> BitString {
    let from = self.saved.first().copied().unwrap_or(self.start);
    self.bin.slice(from, self.bin.bit_len() - from)
  }
}

/// The stream position of the bit with significance `i` in an `n` bit segment.
fn significance_inverse(i: usize, n: usize, little: bool) -> usize {
  (0..n).find(|&s| significance(s, n, little) == i).unwrap_or(0)
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::bits::{BitBuilder, FLAG_LITTLE, FLAG_SIGNED};

  fn state(bytes: &[u8]) -> MatchState {
    MatchState::new(BitString::from_bytes(bytes.to_vec()), 2)
  }

  #[test]
  fn integers() {
    let mut ms = state(&[0xFF, 0x01, 0x02, 0x80]);
    assert_eq!(ms.get_integer(8, FLAG_SIGNED), Some(-1));
    assert_eq!(ms.get_integer(16, FLAG_LITTLE), Some(0x0201));
    assert_eq!(ms.get_integer(4, 0), Some(8));
    assert_eq!(ms.offset(), 28);
    // Not enough bits left: the cursor stays put.
    assert_eq!(ms.get_integer(8, 0), None);
    assert_eq!(ms.offset(), 28);
  }

  #[test]
  fn wide_integers_must_fit() {
    let mut zero_padded = state(&[0, 0, 0, 0, 0, 0, 0, 0, 5]);
    assert_eq!(zero_padded.get_integer(72, 0), Some(5));
    let mut too_big = state(&[1, 0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(too_big.get_integer(72, 0), None);
    let mut negative = state(&[0xFF; 9]);
    assert_eq!(negative.get_integer(72, FLAG_SIGNED), Some(-1));
  }

  #[test]
  fn floats_round_trip_through_builder() {
    let mut builder = BitBuilder::new(96);
    builder.put_float(1.5, 64, 0);
    builder.put_float(-2.25, 32, FLAG_LITTLE);
    let mut ms = MatchState::new(builder.bitstring(), 0);
    assert_eq!(ms.get_float(64, 0), Some(1.5));
    assert_eq!(ms.get_float(32, FLAG_LITTLE), Some(-2.25));
    assert!(ms.test_tail(0));
  }

  #[test]
  fn binaries_and_units() {
    let mut ms = state(b"hello world");
    assert!(ms.test_unit(8));
    let hello = ms.get_binary(Some(40), 8).unwrap();
    assert_eq!(hello.to_bytes(), b"hello".to_vec());
    assert!(ms.skip(Some(8), 8));
    assert!(ms.match_string(&BitString::from_bytes(b"wor".to_vec())));
    assert!(!ms.match_string(&BitString::from_bytes(b"xx".to_vec())));
    let rest = ms.get_binary(None, 8).unwrap();
    assert_eq!(rest.to_bytes(), b"ld".to_vec());
    assert!(ms.test_tail(0));
  }

  #[test]
  fn save_and_restore() {
    let mut ms = state(&[1, 2, 3]);
    ms.get_integer(8, 0);
    assert!(ms.save(1));
    ms.get_integer(8, 0);
    assert!(ms.restore(1));
    assert_eq!(ms.get_integer(8, 0), Some(2));
    assert!(ms.restore(-1));
    assert_eq!(ms.offset(), 0);
    assert!(!ms.save(7));
  }

  #[test]
  fn utf_decoding() {
    let mut ms = state(&[0xC3, 0xA9, 0xD8, 0x3D, 0xDE, 0x00, 0xFF]);
    assert_eq!(ms.get_utf8(), Some('\u{E9}'));
    assert_eq!(ms.get_utf16(0), Some('\u{1F600}'));
    assert_eq!(ms.get_utf8(), None);
    assert_eq!(ms.remaining(), 8);
  }

  #[test]
  fn repeated_runs_are_identical() {
    let run = || {
      let mut ms = state(&[0x12, 0x34, 0x56]);
      let values = vec![ms.get_integer(4, 0), ms.get_integer(12, 0), ms.get_integer(3, 0)];
      (values, ms.offset())
    };
    assert_eq!(run(), run());
  }
}
