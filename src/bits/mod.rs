/*!
  Bit-addressable binary data. A `BitString` is an immutable window onto a shared byte buffer,
  so taking a sub-binary during matching never copies. Bits are numbered from the most
  significant bit of the first byte, which is the order Erlang binaries are written in.

  Matching is done through a `MatchState` cursor and construction through a `BitBuilder`; both
  are defined in the submodules.
*/

mod builder;
mod matching;

use std::cmp::Ordering;
use std::sync::Arc;

pub use builder::{BitBuilder, BitWriter, utf8_size, utf16_size};
pub use matching::MatchState;

// Segment flags as they appear in the instruction stream.
pub const FLAG_LITTLE: u16 = 0x02;
pub const FLAG_SIGNED: u16 = 0x04;
pub const FLAG_NATIVE: u16 = 0x10;

pub fn is_little(flags: u16) -> bool {
  flags & FLAG_LITTLE != 0 || (flags & FLAG_NATIVE != 0 && cfg!(target_endian = "little"))
}

pub fn is_signed(flags: u16) -> bool {
  flags & FLAG_SIGNED != 0
}

/**
  Maps the position `s` of a bit inside an `n` bit segment, counted in stream order, to the
  significance of that bit in the segment's value (0 is the least significant bit).

  Big endian segments are written most significant bit first. Little endian segments are written
  as a sequence of bytes from least to most significant, where the last chunk may be shorter than
  a byte.
*/
pub(crate) fn significance(s: usize, n: usize, little: bool) -> usize {
  match little {
    false => n - 1 - s,
    true  => {
      let chunk_start = s - s % 8;
      let chunk_len   = std::cmp::min(8, n - chunk_start);
      chunk_start + (chunk_len - 1 - (s - chunk_start))
    }
  }
}

#[derive(Clone, Debug)]
pub struct BitString {
  data   : Arc<Vec<u8>>,
  offset : usize,
  bits   : usize,
}

impl BitString {

  pub fn empty() -> BitString {
    BitString::from_bytes(vec![])
  }

  pub fn from_bytes(bytes: Vec<u8>) -> BitString {
    let bits = bytes.len() * 8;
    BitString {
      data   : Arc::new(bytes),
      offset : 0,
      bits
    }
  }

  /// Takes the first `bits` bits of `bytes`. Trailing bits of the last byte are ignored.
  pub fn from_bits(bytes: Vec<u8>, bits: usize) -> BitString {
    debug_assert!(bits <= bytes.len() * 8);
    BitString {
      data   : Arc::new(bytes),
      offset : 0,
      bits
    }
  }

  pub fn bit_len(&self) -> usize {
    self.bits
  }

  /// Number of whole bytes.
  pub fn byte_len(&self) -> usize {
    self.bits / 8
  }

  pub fn is_binary(&self) -> bool {
    self.bits % 8 == 0
  }

  pub fn bit(&self, at: usize) -> u8 {
    let i = self.offset + at;
    (self.data[i / 8] >> (7 - i % 8)) & 1
  }

  /// Reads `n <= 64` bits starting at `at` as a big endian unsigned value.
  pub fn read(&self, at: usize, n: usize) -> u64 {
    debug_assert!(n <= 64 && at + n <= self.bits);
    let mut value = 0u64;
    let start = self.offset + at;
    if start % 8 == 0 && n % 8 == 0 {
      for byte in &self.data[start / 8 .. (start + n) / 8] {
        value = (value << 8) | *byte as u64;
      }
      return value;
    }
    for i in 0..n {
      value = (value << 1) | self.bit(at + i) as u64;
    }
    value
  }

  /// A window of `n` bits starting at `at`, sharing this bitstring's buffer.
  pub fn slice(&self, at: usize, n: usize) -> BitString {
    debug_assert!(at + n <= self.bits);
    BitString {
      data   : self.data.clone(),
      offset : self.offset + at,
      bits   : n
    }
  }

  /// The contents as whole bytes when the bitstring is byte aligned in its buffer.
  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self.offset % 8 == 0 && self.bits % 8 == 0 {
      true  => Some(&self.data[self.offset / 8 .. (self.offset + self.bits) / 8]),
      false => None
    }
  }

  /// Copies the contents out. A trailing partial byte is padded with zero bits.
  pub fn to_bytes(&self) -> Vec<u8> {
    if let Some(bytes) = self.as_bytes() {
      return bytes.to_vec();
    }
    let mut writer = BitWriter::new();
    writer.push_bitstring(self);
    writer.into_bytes()
  }

  /**
    Takes the buffer for appending. The buffer is reused in place when this bitstring is its only
    owner and covers it from the start; otherwise its bits are copied.
  */
  pub(crate) fn into_writer(self) -> BitWriter {
    let BitString { data, offset, bits } = self;
    if offset == 0 {
      match Arc::try_unwrap(data) {
        Ok(mut bytes) => {
          bytes.truncate((bits + 7) / 8);
          return BitWriter::from_parts(bytes, bits);
        }
        Err(shared) => {
          let copy = BitString { data: shared, offset, bits };
          let mut writer = BitWriter::new();
          writer.push_bitstring(&copy);
          return writer;
        }
      }
    }
    let mut writer = BitWriter::new();
    writer.push_bitstring(&BitString { data, offset, bits });
    writer
  }

  pub fn exact_eq(&self, other: &BitString) -> bool {
    self.compare(other) == Ordering::Equal
  }

  /// Bitwise lexicographic order; a proper prefix sorts first.
  pub fn compare(&self, other: &BitString) -> Ordering {
    if let (Some(a), Some(b)) = (self.as_bytes(), other.as_bytes()) {
      return a.cmp(b);
    }
    let common = std::cmp::min(self.bits, other.bits);
    for i in 0..common {
      match self.bit(i).cmp(&other.bit(i)) {
        Ordering::Equal => {}
        unequal         => return unequal
      }
    }
    self.bits.cmp(&other.bits)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn read_unaligned() {
    let bits = BitString::from_bytes(vec![0b1010_1100, 0b0101_0000]);
    assert_eq!(bits.read(0, 4), 0b1010);
    assert_eq!(bits.read(4, 8), 0b1100_0101);
    assert_eq!(bits.read(0, 16), 0b1010_1100_0101_0000);
  }

  #[test]
  fn slices_share_and_compare() {
    let bits = BitString::from_bytes(vec![1, 2, 3, 4]);
    let tail = bits.slice(16, 16);
    assert_eq!(tail.to_bytes(), vec![3, 4]);
    assert!(tail.exact_eq(&BitString::from_bytes(vec![3, 4])));
    assert_eq!(bits.slice(0, 8).compare(&bits), Ordering::Less);
  }

  #[test]
  fn unaligned_copy_pads_last_byte() {
    let bits = BitString::from_bytes(vec![0xFF, 0x00]).slice(4, 6);
    assert_eq!(bits.bit_len(), 6);
    assert_eq!(bits.to_bytes(), vec![0b1111_0000]);
  }

  #[test]
  fn little_endian_significance() {
    // 16 bit little endian: the first byte holds the low order bits.
    assert_eq!(significance(0, 16, true), 7);
    assert_eq!(significance(8, 16, true), 15);
    assert_eq!(significance(0, 16, false), 15);
  }
}
