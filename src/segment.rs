//! Segment header codec and checksum.
//!
//! Layout follows RFC 793: ports, sequence and acknowledgement numbers, a
//! 16-bit word carrying the header length (in 32-bit words, high nibble) and
//! the control flags, the advertised window, checksum and urgent pointer.
//! Options are skipped on decode and never emitted.

use crate::codec::{self, Decode, Encode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{fmt, net::Ipv4Addr, ops::BitOr};

/// Maximum segment size, the largest payload carried by a single segment.
pub const MSS: usize = 1460;

/// Length of a header without options.
pub const HEADER_LEN: usize = 20;

/// Window advertised on every outgoing segment. Peers' windows are not tracked.
pub const WINDOW: u16 = (8 * MSS) as u16;

const PROTOCOL_TCP: u8 = 6;
const CHECKSUM_OFFSET: usize = 16;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
  pub const FIN: Flags = Flags(1 << 0);
  pub const SYN: Flags = Flags(1 << 1);
  pub const RST: Flags = Flags(1 << 2);
  pub const PSH: Flags = Flags(1 << 3);
  pub const ACK: Flags = Flags(1 << 4);

  const MASK: u16 = 0x01ff;

  pub const fn empty() -> Self {
    Self(0)
  }

  /// Keep only the control bits of a raw offset/flags word.
  pub const fn from_bits(bits: u16) -> Self {
    Self(bits & Self::MASK)
  }

  pub const fn bits(self) -> u16 {
    self.0
  }

  pub const fn contains(self, other: Flags) -> bool {
    self.0 & other.0 == other.0
  }
}

impl BitOr for Flags {
  type Output = Flags;

  fn bitor(self, rhs: Flags) -> Flags {
    Flags(self.0 | rhs.0)
  }
}

impl fmt::Debug for Flags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names = [
      (Flags::SYN, "SYN"),
      (Flags::ACK, "ACK"),
      (Flags::FIN, "FIN"),
      (Flags::RST, "RST"),
      (Flags::PSH, "PSH"),
    ];
    let mut list = f.debug_set();
    for (flag, name) in names {
      if self.contains(flag) {
        list.entry(&format_args!("{}", name));
      }
    }
    list.finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
  pub src_port: u16,
  pub dst_port: u16,
  pub seq: u32,
  pub ack: u32,
  /// Header length in 32-bit words.
  pub header_len: u8,
  pub flags: Flags,
  pub window: u16,
  pub checksum: u16,
  pub urgent: u16,
}

impl Header {
  pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: Flags) -> Self {
    Self {
      src_port,
      dst_port,
      seq,
      ack,
      header_len: (HEADER_LEN / 4) as u8,
      flags,
      window: WINDOW,
      checksum: 0,
      urgent: 0,
    }
  }

  /// Header length in bytes, options included.
  pub fn len(&self) -> usize {
    self.header_len as usize * 4
  }
}

impl Encode for Header {
  fn encode<B: BufMut>(&self, buf: &mut B) {
    self.src_port.encode(buf);
    self.dst_port.encode(buf);
    self.seq.encode(buf);
    self.ack.encode(buf);
    ((self.header_len as u16) << 12 | self.flags.bits()).encode(buf);
    self.window.encode(buf);
    self.checksum.encode(buf);
    self.urgent.encode(buf);
  }
}

impl Decode for Header {
  fn decode<B: Buf>(buf: &mut B) -> codec::Result<Self> {
    let src_port = u16::decode(buf)?;
    let dst_port = u16::decode(buf)?;
    let seq = u32::decode(buf)?;
    let ack = u32::decode(buf)?;
    let offset_flags = u16::decode(buf)?;
    let window = u16::decode(buf)?;
    let checksum = u16::decode(buf)?;
    let urgent = u16::decode(buf)?;

    let header_len = (offset_flags >> 12) as u8;
    if (header_len as usize) * 4 < HEADER_LEN {
      return Err(codec::Error::InvalidHeaderLength(header_len));
    }
    let options = header_len as usize * 4 - HEADER_LEN;
    if buf.remaining() < options {
      return Err(codec::Error::UnexpectedEof);
    }
    buf.advance(options);

    Ok(Self {
      src_port,
      dst_port,
      seq,
      ack,
      header_len,
      flags: Flags::from_bits(offset_flags),
      window,
      checksum,
      urgent,
    })
  }
}

/// Split a raw segment into its header and payload.
pub fn parse(segment: &[u8]) -> codec::Result<(Header, &[u8])> {
  let mut buf = segment;
  let header = Header::decode(&mut buf)?;
  Ok((header, &segment[header.len()..]))
}

/// Encode a bare header with a zero checksum.
pub fn make_header(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: Flags) -> BytesMut {
  let mut buf = BytesMut::with_capacity(HEADER_LEN);
  Header::new(src_port, dst_port, seq, ack, flags).encode(&mut buf);
  buf
}

/// One's complement checksum over the IPv4 pseudo-header and `segment`.
///
/// Computing this over a segment whose checksum field is already filled in
/// yields zero when the segment is intact.
pub fn checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
  let mut sum = 0u32;
  sum += ones_complement_sum(&src.octets());
  sum += ones_complement_sum(&dst.octets());
  sum += PROTOCOL_TCP as u32;
  sum += segment.len() as u32;
  sum += ones_complement_sum(segment);
  while sum >> 16 != 0 {
    sum = (sum & 0xffff) + (sum >> 16);
  }
  !(sum as u16)
}

pub fn verify(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
  checksum(segment, src, dst) == 0
}

/// Compute and store the checksum of a segment sent from `src` to `dst`.
pub fn fix_checksum(mut segment: BytesMut, src: Ipv4Addr, dst: Ipv4Addr) -> Bytes {
  segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&[0, 0]);
  let sum = checksum(&segment, src, dst);
  segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
  segment.freeze()
}

fn ones_complement_sum(data: &[u8]) -> u32 {
  let mut chunks = data.chunks_exact(2);
  let mut sum = 0u32;
  for word in &mut chunks {
    sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
  }
  if let [last] = chunks.remainder() {
    sum = sum.wrapping_add((*last as u32) << 8);
  }
  sum
}
