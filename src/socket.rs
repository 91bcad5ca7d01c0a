use bytes::Bytes;
use indexmap::IndexMap;
use mio::net::UdpSocket;
use std::{
  io,
  net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
};

/// The unreliable substrate segments travel over.
pub trait Network {
  /// Hand `segment` over for delivery to `dst`.
  ///
  /// Delivery is not confirmed and failures are not reported; reliability is
  /// the retransmission layer's job.
  fn send(&mut self, segment: &Bytes, dst: Ipv4Addr);

  /// Accept inbound segments without validating their checksum.
  fn ignore_checksum(&self) -> bool {
    false
  }

  /// The segment being received from `addr:port` passed validation and
  /// belongs to a connection. Replies to that peer follow.
  fn routed(&mut self, _addr: Ipv4Addr, _port: u16) {}

  /// The connection with `addr:port` left the connection table.
  fn forget(&mut self, _addr: Ipv4Addr, _port: u16) {}
}

/// Carries one segment per UDP datagram.
///
/// The datagram's source IP stands in for the segment's source address. The
/// UDP endpoint a peer used is remembered per (address, port) pair once one of
/// its segments is routed, so replies reach the socket that sent the segment.
pub struct UdpTunnel {
  socket: UdpSocket,
  local: Ipv4Addr,
  endpoints: IndexMap<SocketAddrV4, SocketAddr>,
  /// Sender of the last received datagram, until it is routed
  pending: Option<(SocketAddrV4, SocketAddr)>,
  ignore_checksum: bool,
}

impl UdpTunnel {
  pub fn bind(addr: SocketAddrV4, ignore_checksum: bool) -> io::Result<Self> {
    let socket = UdpSocket::bind(SocketAddr::V4(addr))?;
    Ok(Self {
      socket,
      local: *addr.ip(),
      endpoints: IndexMap::new(),
      pending: None,
      ignore_checksum,
    })
  }

  /// Address used as the destination of inbound segments.
  pub fn local_addr(&self) -> Ipv4Addr {
    self.local
  }

  pub fn local_endpoint(&self) -> io::Result<SocketAddr> {
    self.socket.local_addr()
  }

  pub fn socket_mut(&mut self) -> &mut UdpSocket {
    &mut self.socket
  }

  pub fn endpoint(&self, peer: SocketAddrV4) -> Option<SocketAddr> {
    self.endpoints.get(&peer).copied()
  }

  /// Route segments addressed to `peer` through `endpoint`.
  pub fn add_endpoint(&mut self, peer: SocketAddrV4, endpoint: SocketAddr) {
    self.endpoints.insert(peer, endpoint);
  }

  /// Receive one segment, returning its length and source address.
  ///
  /// Returns `WouldBlock` when no datagram is pending.
  pub fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
    self.pending = None;
    loop {
      let (size, from) = self.socket.recv_from(buf)?;
      let src = match from.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => {
          log::warn!("dropping datagram from non-IPv4 source {}", ip);
          continue;
        }
      };
      if size >= 2 {
        let port = u16::from_be_bytes([buf[0], buf[1]]);
        self.pending = Some((SocketAddrV4::new(src, port), from));
      }
      return Ok((size, src));
    }
  }
}

impl Network for UdpTunnel {
  fn send(&mut self, segment: &Bytes, dst: Ipv4Addr) {
    if segment.len() < 4 {
      return;
    }
    let port = u16::from_be_bytes([segment[2], segment[3]]);
    let endpoint = match self.endpoints.get(&SocketAddrV4::new(dst, port)) {
      Some(endpoint) => *endpoint,
      None => {
        log::warn!("no route to {}:{}", dst, port);
        return;
      }
    };
    match self.socket.send_to(&segment[..], endpoint) {
      Ok(_) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        // lost like any other datagram, the retransmission timer recovers it.
        log::debug!("socket busy, dropped segment to {}", endpoint);
      }
      Err(e) => log::warn!("failed to send segment to {}: {}", endpoint, e),
    }
  }

  fn ignore_checksum(&self) -> bool {
    self.ignore_checksum
  }

  fn routed(&mut self, addr: Ipv4Addr, port: u16) {
    let peer = SocketAddrV4::new(addr, port);
    match self.pending {
      Some((pending, endpoint)) if pending == peer => {
        self.endpoints.insert(peer, endpoint);
      }
      _ => {}
    }
  }

  fn forget(&mut self, addr: Ipv4Addr, port: u16) {
    self.endpoints.swap_remove(&SocketAddrV4::new(addr, port));
  }
}

/// Records every sent segment instead of delivering it.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Capture {
  pub sent: Vec<(Bytes, Ipv4Addr)>,
  pub ignore_checksum: bool,
  pub routed: Vec<(Ipv4Addr, u16)>,
  pub forgotten: Vec<(Ipv4Addr, u16)>,
}

#[cfg(test)]
impl Capture {
  /// Take everything sent so far.
  pub fn take(&mut self) -> Vec<Bytes> {
    self.sent.drain(..).map(|(segment, _)| segment).collect()
  }
}

#[cfg(test)]
impl Network for Capture {
  fn send(&mut self, segment: &Bytes, dst: Ipv4Addr) {
    self.sent.push((segment.clone(), dst));
  }

  fn ignore_checksum(&self) -> bool {
    self.ignore_checksum
  }

  fn routed(&mut self, addr: Ipv4Addr, port: u16) {
    self.routed.push((addr, port));
  }

  fn forget(&mut self, addr: Ipv4Addr, port: u16) {
    self.forgotten.push((addr, port));
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq, std::time::Duration};

  fn recv_blocking(tunnel: &mut UdpTunnel, buf: &mut [u8]) -> (usize, Ipv4Addr) {
    for _ in 0..200 {
      match tunnel.recv_from(buf) {
        Ok(v) => return v,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
          std::thread::sleep(Duration::from_millis(5))
        }
        Err(e) => panic!("{}", e),
      }
    }
    panic!("no datagram arrived");
  }

  #[test]
  fn tunnel_replies_to_sender_endpoint() {
    let localhost = Ipv4Addr::LOCALHOST;
    let mut server = UdpTunnel::bind(SocketAddrV4::new(localhost, 0), false).unwrap();
    let mut client = UdpTunnel::bind(SocketAddrV4::new(localhost, 0), false).unwrap();
    let server_endpoint = server.local_endpoint().unwrap();
    assert_eq!(server.local_addr(), localhost);

    // client segment from port 0x1f90 to port 80
    client.add_endpoint(SocketAddrV4::new(localhost, 80), server_endpoint);
    let outbound = Bytes::from_static(&[0x1f, 0x90, 0x00, 0x50, 1, 2, 3]);
    client.send(&outbound, localhost);

    let mut buf = [0u8; 64];
    let (size, src) = recv_blocking(&mut server, &mut buf);
    assert_eq!(&buf[..size], &outbound[..]);
    assert_eq!(src, localhost);

    // nothing is remembered until the segment is routed
    let peer = SocketAddrV4::new(localhost, 0x1f90);
    assert_eq!(server.endpoint(peer), None);
    server.routed(localhost, 0x1f91);
    assert_eq!(server.endpoint(peer), None);
    server.routed(localhost, 0x1f90);
    assert_eq!(server.endpoint(peer), client.local_endpoint().ok());

    // the reply is routed by the destination port of the segment
    let reply = Bytes::from_static(&[0x00, 0x50, 0x1f, 0x90, 9]);
    server.send(&reply, localhost);
    let (size, _) = recv_blocking(&mut client, &mut buf);
    assert_eq!(&buf[..size], &reply[..]);

    server.forget(localhost, 0x1f90);
    assert_eq!(server.endpoint(peer), None);
  }
}
