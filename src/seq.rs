//! Sequence number comparisons in 32-bit wrapping space (RFC 1982 style).
//!
//! `a` precedes `b` when `b - a`, taken as a signed 32-bit value, is positive.

#[inline]
pub fn lt(a: u32, b: u32) -> bool {
  (b.wrapping_sub(a) as i32) > 0
}

#[inline]
pub fn le(a: u32, b: u32) -> bool {
  a == b || lt(a, b)
}

/// Add a byte count to a sequence number.
#[inline]
pub fn add(seq: u32, len: usize) -> u32 {
  seq.wrapping_add(len as u32)
}
