//! Incremental binary construction.

use super::{BitString, is_little, significance};

/// A growable bit buffer. Bits are appended most significant first.
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
  buf  : Vec<u8>,
  bits : usize,
}

impl BitWriter {

  pub fn new() -> BitWriter {
    BitWriter::default()
  }

  pub fn with_capacity(bits: usize) -> BitWriter {
    BitWriter {
      buf  : Vec::with_capacity((bits + 7) / 8),
      bits : 0
    }
  }

  pub(crate) fn from_parts(buf: Vec<u8>, bits: usize) -> BitWriter {
    BitWriter { buf, bits }
  }

  pub fn bit_len(&self) -> usize {
    self.bits
  }

  pub fn push_bit(&mut self, bit: u8) {
    if self.bits % 8 == 0 {
      self.buf.push(0);
    }
    if bit != 0 {
      let last = self.buf.len() - 1;
      self.buf[last] |= 0x80 >> (self.bits % 8);
    }
    self.bits += 1;
  }

  /// Appends the low `n <= 64` bits of `value`, most significant first.
  pub fn push_bits(&mut self, value: u64, n: usize) {
    if self.bits % 8 == 0 && n % 8 == 0 {
      for i in (0..n / 8).rev() {
        self.buf.push((value >> (8 * i)) as u8);
      }
      self.bits += n;
      return;
    }
    for i in (0..n).rev() {
      self.push_bit(((value >> i) & 1) as u8);
    }
  }

  pub fn push_bytes(&mut self, bytes: &[u8]) {
    match self.bits % 8 {
      0 => {
        self.buf.extend_from_slice(bytes);
        self.bits += bytes.len() * 8;
      }
      _ => for byte in bytes {
        self.push_bits(*byte as u64, 8);
      }
    }
  }

  pub fn push_bitstring(&mut self, bits: &BitString) {
    if let Some(bytes) = bits.as_bytes() {
      self.push_bytes(bytes);
      return;
    }
    for i in 0..bits.bit_len() {
      self.push_bit(bits.bit(i));
    }
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.buf
  }

  pub fn to_bitstring(&self) -> BitString {
    BitString::from_bits(self.buf.clone(), self.bits)
  }
}

/// Bytes needed to encode `code_point` as UTF-8, or `None` if it is not a scalar value.
pub fn utf8_size(code_point: i64) -> Option<usize> {
  scalar(code_point).map(char::len_utf8)
}

/// Bytes needed to encode `code_point` as UTF-16, or `None` if it is not a scalar value.
pub fn utf16_size(code_point: i64) -> Option<usize> {
  scalar(code_point).map(|c| c.len_utf16() * 2)
}

fn scalar(code_point: i64) -> Option<char> {
  match code_point {
    0..=0x10FFFF => std::char::from_u32(code_point as u32),
    _            => None
  }
}

/**
  A binary under construction. The declared size is known when the builder is created (the
  compiler computes it ahead of the `bs_put_*` sequence), so the builder can report when it is
  complete and its contents should be published as an immutable term.

  Every `put` returns `false` when the value cannot be encoded. Nothing is written in that case.
*/
#[derive(Clone, Debug)]
pub struct BitBuilder {
  writer : BitWriter,
  target : usize,
}

impl BitBuilder {

  /// A builder for exactly `bits` bits.
  pub fn new(bits: usize) -> BitBuilder {
    BitBuilder {
      writer : BitWriter::with_capacity(bits),
      target : bits
    }
  }

  /// A builder that extends `existing` by `extra` bits, reusing its buffer when possible.
  pub fn append(existing: BitString, extra: usize) -> BitBuilder {
    let target = existing.bit_len() + extra;
    BitBuilder {
      writer : existing.into_writer(),
      target
    }
  }

  pub fn is_complete(&self) -> bool {
    self.writer.bit_len() >= self.target
  }

  pub fn bitstring(&self) -> BitString {
    self.writer.to_bitstring()
  }

  pub fn put_integer(&mut self, value: i64, n: usize, flags: u16) -> bool {
    let little = is_little(flags);
    if !little && n <= 64 {
      self.writer.push_bits(value as u64, n);
      return true;
    }
    for s in 0..n {
      let i = significance(s, n, little);
      let bit = match i < 64 {
        true  => ((value >> i) & 1) as u8,
        false => (value < 0) as u8
      };
      self.writer.push_bit(bit);
    }
    true
  }

  pub fn put_float(&mut self, value: f64, n: usize, flags: u16) -> bool {
    match n {
      32 => self.put_integer((value as f32).to_bits() as i64, 32, flags),
      64 => self.put_integer(value.to_bits() as i64, 64, flags),
      _  => false
    }
  }

  /// Appends `n` bits of `value`, or all of it when `n` is `None`.
  pub fn put_bitstring(&mut self, value: &BitString, n: Option<usize>) -> bool {
    match n {
      None                              => self.writer.push_bitstring(value),
      Some(n) if n <= value.bit_len()   => self.writer.push_bitstring(&value.slice(0, n)),
      Some(_)                           => return false
    }
    true
  }

  pub fn put_utf8(&mut self, code_point: i64) -> bool {
    match scalar(code_point) {
      Some(c) => {
        let mut buf = [0u8; 4];
        self.writer.push_bytes(c.encode_utf8(&mut buf).as_bytes());
        true
      }
      None => false
    }
  }

  pub fn put_utf16(&mut self, code_point: i64, flags: u16) -> bool {
    match scalar(code_point) {
      Some(c) => {
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units).iter() {
          self.put_integer(*unit as i64, 16, flags);
        }
        true
      }
      None => false
    }
  }

  pub fn put_utf32(&mut self, code_point: i64, flags: u16) -> bool {
    match scalar(code_point) {
      Some(c) => self.put_integer(c as i64, 32, flags),
      None    => false
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::bits::FLAG_LITTLE;

  #[test]
  fn integers_big_and_little() {
    let mut builder = BitBuilder::new(32);
    assert!(builder.put_integer(0x0102, 16, 0));
    assert!(!builder.is_complete());
    assert!(builder.put_integer(0x0102, 16, FLAG_LITTLE));
    assert!(builder.is_complete());
    assert_eq!(builder.bitstring().to_bytes(), vec![1, 2, 2, 1]);
  }

  #[test]
  fn negative_integer_wider_than_a_word() {
    let mut builder = BitBuilder::new(72);
    builder.put_integer(-1, 72, 0);
    assert_eq!(builder.bitstring().to_bytes(), vec![0xFF; 9]);
  }

  #[test]
  fn unaligned_segments() {
    let mut builder = BitBuilder::new(12);
    builder.put_integer(0b101, 3, 0);
    builder.put_integer(0b1_1111_0000, 9, 0);
    let bits = builder.bitstring();
    assert_eq!(bits.bit_len(), 12);
    assert_eq!(bits.to_bytes(), vec![0b1011_1111, 0b0000_0000]);
  }

  #[test]
  fn utf_encodings() {
    let mut builder = BitBuilder::new(0);
    assert!(builder.put_utf8(0xE9));
    assert!(builder.put_utf16(0x1F600, 0));
    assert!(!builder.put_utf32(0xD800, 0));
    assert_eq!(builder.bitstring().to_bytes(), vec![0xC3, 0xA9, 0xD8, 0x3D, 0xDE, 0x00]);
    assert_eq!(utf8_size(0x1F600), Some(4));
    assert_eq!(utf16_size(0x41), Some(2));
    assert_eq!(utf8_size(-1), None);
  }

  #[test]
  fn append_extends_existing() {
    let mut builder = BitBuilder::append(BitString::from_bytes(vec![7]), 8);
    assert!(!builder.is_complete());
    builder.put_integer(9, 8, 0);
    assert!(builder.is_complete());
    assert_eq!(builder.bitstring().to_bytes(), vec![7, 9]);
  }
}
