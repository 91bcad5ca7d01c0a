use crate::{
  conn::{Connection, ConnectionId, Incoming, Params, State},
  error::Reason,
  handler::Handler,
  segment::{self, Flags},
  socket::Network,
};
use indexmap::IndexMap;
use std::{net::Ipv4Addr, time::Instant};

type ConnectionTable = IndexMap<ConnectionId, Connection>;

/// Routes inbound segments for one local port to their connections.
pub struct Demultiplexer {
  port: u16,
  params: Params,
  capacity: usize,
  table: ConnectionTable,
  isn: Box<dyn FnMut() -> u32 + Send>,
}

impl Demultiplexer {
  pub fn new(port: u16, params: Params, capacity: usize) -> Self {
    Self {
      port,
      params,
      capacity,
      table: ConnectionTable::with_capacity(capacity),
      isn: Box::new(rand::random::<u32>),
    }
  }

  /// Replace the source of initial sequence numbers.
  pub fn with_isn<F>(mut self, isn: F) -> Self
  where
    F: FnMut() -> u32 + Send + 'static,
  {
    self.isn = Box::new(isn);
    self
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn len(&self) -> usize {
    self.table.len()
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty()
  }

  pub fn get(&self, conn: &ConnectionId) -> Option<&Connection> {
    self.table.get(conn)
  }

  pub fn connections(&self) -> impl Iterator<Item = &ConnectionId> + '_ {
    self.table.keys()
  }

  /// Handle one datagram delivered by the network from `src` to `dst`.
  pub fn received<N: Network, H: Handler>(
    &mut self,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    raw: &[u8],
    now: Instant,
    net: &mut N,
    handler: &mut H,
  ) {
    let (header, payload) = match segment::parse(raw) {
      Ok(parsed) => parsed,
      Err(e) => {
        log::warn!("{} -> {}: dropping malformed segment: {}", src, dst, e);
        return;
      }
    };
    if header.dst_port != self.port {
      log::debug!(
        "{} -> {}: dropping segment for port {}",
        src,
        dst,
        header.dst_port
      );
      return;
    }
    if !net.ignore_checksum() && !segment::verify(raw, src, dst) {
      log::warn!("{}:{} -> {}: dropping segment with incorrect checksum", src, header.src_port, dst);
      return;
    }

    let id = ConnectionId {
      src_addr: src,
      src_port: header.src_port,
      dst_addr: dst,
      dst_port: header.dst_port,
    };

    if header.flags.contains(Flags::SYN) {
      self.accept(id, header.seq, net, handler);
      return;
    }

    let conn = match self.table.get_mut(&id) {
      Some(conn) => conn,
      None => {
        log::warn!("{} (segment for unknown connection)", id);
        return;
      }
    };
    net.routed(id.src_addr, id.src_port);
    let incoming = Incoming {
      seq: header.seq,
      ack: header.ack,
      flags: header.flags,
      payload,
    };
    conn.received(incoming, now, net, handler);
    if conn.state() == State::Closed {
      self.table.swap_remove(&id);
      net.forget(id.src_addr, id.src_port);
      notify_disconnect(handler, id, Reason::Normal);
    }
  }

  /// Queue `data` on a connection. Returns `false` if the connection is unknown.
  pub fn send<N: Network>(&mut self, conn: ConnectionId, data: &[u8], now: Instant, net: &mut N) -> bool {
    match self.table.get_mut(&conn) {
      Some(c) => {
        c.send(data, now, net);
        true
      }
      None => {
        log::debug!("{} send on unknown connection", conn);
        false
      }
    }
  }

  /// Start closing a connection. Returns `false` if the connection is unknown.
  pub fn close<N: Network>(&mut self, conn: ConnectionId, net: &mut N) -> bool {
    match self.table.get_mut(&conn) {
      Some(c) => {
        c.close(net);
        true
      }
      None => {
        log::debug!("{} close on unknown connection", conn);
        false
      }
    }
  }

  pub fn close_all<N: Network>(&mut self, net: &mut N) {
    for conn in self.table.values_mut() {
      conn.close(net);
    }
  }

  /// Fire every retransmission timer due at `now`.
  pub fn poll_timers<N: Network>(&mut self, now: Instant, net: &mut N) {
    for conn in self.table.values_mut() {
      conn.poll_timer(now, net);
    }
  }

  /// The earliest armed retransmission deadline.
  pub fn next_deadline(&self) -> Option<Instant> {
    self.table.values().filter_map(Connection::deadline).min()
  }

  fn accept<N: Network, H: Handler>(
    &mut self,
    id: ConnectionId,
    peer_isn: u32,
    net: &mut N,
    handler: &mut H,
  ) {
    if !self.table.contains_key(&id) && self.table.len() >= self.capacity {
      log::warn!("{} refused, {} connections open", id, self.table.len());
      return;
    }
    net.routed(id.src_addr, id.src_port);
    let iss = (self.isn)();
    let conn = Connection::accept(id, peer_isn, iss, &self.params, net);
    if self.table.insert(id, conn).is_some() {
      notify_disconnect(handler, id, Reason::Replaced);
    }
    if let Err(e) = handler.on_accept(id) {
      handler.on_error(e);
    }
  }
}

fn notify_disconnect<H: Handler>(handler: &mut H, id: ConnectionId, reason: Reason) {
  if let Err(e) = handler.on_disconnect(id, reason) {
    handler.on_error(e);
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{error::Error, handler::Recorder, segment::Header, socket::Capture},
    bytes::Bytes,
    pretty_assertions::assert_eq,
    std::time::Duration,
  };

  const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
  const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
  const PORT: u16 = 7000;
  const PEER_PORT: u16 = 40000;
  const ISS: u32 = 5000;

  fn demux() -> Demultiplexer {
    Demultiplexer::new(PORT, Params::default(), 4).with_isn(|| ISS)
  }

  fn id() -> ConnectionId {
    ConnectionId {
      src_addr: PEER,
      src_port: PEER_PORT,
      dst_addr: LOCAL,
      dst_port: PORT,
    }
  }

  fn packet(seq: u32, ack: u32, flags: Flags, payload: &[u8]) -> Bytes {
    let mut segment = segment::make_header(PEER_PORT, PORT, seq, ack, flags);
    segment.extend_from_slice(payload);
    segment::fix_checksum(segment, PEER, LOCAL)
  }

  fn decode(segment: &Bytes) -> (Header, Vec<u8>) {
    let (header, payload) = segment::parse(segment).unwrap();
    (header, payload.to_vec())
  }

  struct Peer {
    demux: Demultiplexer,
    net: Capture,
    app: Recorder,
    now: Instant,
  }

  impl Peer {
    fn new() -> Self {
      Self {
        demux: demux(),
        net: Capture::default(),
        app: Recorder::default(),
        now: Instant::now(),
      }
    }

    fn deliver(&mut self, raw: &[u8]) -> Vec<Bytes> {
      self
        .demux
        .received(PEER, LOCAL, raw, self.now, &mut self.net, &mut self.app);
      self.net.take()
    }

    fn connect(&mut self) {
      let replies = self.deliver(&packet(100, 0, Flags::SYN, &[]));
      assert_eq!(replies.len(), 1);
      self.deliver(&packet(101, ISS + 1, Flags::ACK, &[]));
    }
  }

  #[test]
  fn handshake_and_close() {
    let mut peer = Peer::new();

    let replies = peer.deliver(&packet(100, 0, Flags::SYN, &[]));
    assert_eq!(replies.len(), 1);
    let (header, _) = decode(&replies[0]);
    assert_eq!(header.flags, Flags::SYN | Flags::ACK);
    assert_eq!(header.seq, ISS);
    assert_eq!(header.ack, 101);
    assert_eq!(peer.app.accepted, vec![id()]);
    assert_eq!(peer.demux.get(&id()).unwrap().state(), State::Open);
    assert_eq!(peer.net.sent.len(), 0);

    let replies = peer.deliver(&packet(101, ISS + 1, Flags::FIN | Flags::ACK, &[]));
    assert_eq!(replies.len(), 1);
    let (header, _) = decode(&replies[0]);
    assert_eq!(header.flags, Flags::ACK);
    assert_eq!(header.ack, 102);
    assert_eq!(peer.app.payloads, vec![(id(), vec![])]);
    assert_eq!(peer.demux.get(&id()).unwrap().state(), State::Closing);

    assert!(peer.demux.close(id(), &mut peer.net));
    let replies = peer.net.take();
    let (header, _) = decode(&replies[0]);
    assert_eq!(header.flags, Flags::FIN | Flags::ACK);
    assert_eq!(header.seq, ISS + 1);

    peer.deliver(&packet(102, ISS + 2, Flags::ACK, &[]));
    assert!(peer.demux.get(&id()).is_none());
    assert_eq!(peer.app.disconnected, vec![(id(), Reason::Normal)]);
    assert_eq!(peer.net.forgotten, vec![(PEER, PEER_PORT)]);
  }

  #[test]
  fn segments_are_routed_by_connection() {
    let mut peer = Peer::new();
    peer.connect();

    // a second connection from another port of the same host
    let syn = segment::make_header(PEER_PORT + 1, PORT, 900, 0, Flags::SYN);
    peer.deliver(&segment::fix_checksum(syn, PEER, LOCAL));
    assert_eq!(peer.demux.len(), 2);

    peer.deliver(&packet(101, ISS + 1, Flags::ACK, b"first"));
    let mut other = segment::make_header(PEER_PORT + 1, PORT, 901, ISS + 1, Flags::ACK);
    other.extend_from_slice(b"second");
    peer.deliver(&segment::fix_checksum(other, PEER, LOCAL));

    let second = ConnectionId {
      src_port: PEER_PORT + 1,
      ..id()
    };
    assert_eq!(
      peer.app.payloads,
      vec![(id(), b"first".to_vec()), (second, b"second".to_vec())]
    );
  }

  #[test]
  fn drops_invalid_segments() {
    let mut peer = Peer::new();

    // wrong destination port
    let segment = segment::make_header(PEER_PORT, PORT + 1, 100, 0, Flags::SYN);
    let wrong_port = segment::fix_checksum(segment, PEER, LOCAL);
    assert!(peer.deliver(&wrong_port).is_empty());

    // corrupted checksum
    let mut corrupted = packet(100, 0, Flags::SYN, &[]).to_vec();
    corrupted[4] ^= 0xff;
    assert!(peer.deliver(&corrupted).is_empty());

    // truncated header
    assert!(peer.deliver(&packet(100, 0, Flags::SYN, &[])[..12]).is_empty());

    // unknown connection, no reset is sent
    assert!(peer.deliver(&packet(100, 1, Flags::ACK, b"data")).is_empty());

    assert!(peer.demux.is_empty());
    assert!(peer.app.accepted.is_empty());
    // the transport learns no route from rejected segments
    assert!(peer.net.routed.is_empty());
  }

  #[test]
  fn checksum_bypass() {
    let mut peer = Peer::new();
    peer.net.ignore_checksum = true;
    let mut corrupted = packet(100, 0, Flags::SYN, &[]).to_vec();
    corrupted[16] ^= 0xff;
    assert_eq!(peer.deliver(&corrupted).len(), 1);
    assert_eq!(peer.demux.len(), 1);
  }

  #[test]
  fn capacity_limits_new_connections() {
    let mut peer = Peer::new();
    peer.demux = Demultiplexer::new(PORT, Params::default(), 1).with_isn(|| ISS);
    peer.connect();

    let segment = segment::make_header(PEER_PORT + 1, PORT, 1, 0, Flags::SYN);
    assert!(peer
      .deliver(&segment::fix_checksum(segment, PEER, LOCAL))
      .is_empty());
    assert_eq!(peer.demux.len(), 1);
    assert!(!peer.net.routed.contains(&(PEER, PEER_PORT + 1)));

    // a SYN for the existing id still replaces it
    assert_eq!(peer.deliver(&packet(700, 0, Flags::SYN, &[])).len(), 1);
    assert_eq!(peer.app.disconnected, vec![(id(), Reason::Replaced)]);
    assert_eq!(peer.demux.get(&id()).unwrap().rcv_nxt(), 701);
  }

  #[test]
  fn send_and_close_on_unknown_connection() {
    let mut peer = Peer::new();
    assert!(!peer.demux.send(id(), b"x", peer.now, &mut peer.net));
    assert!(!peer.demux.close(id(), &mut peer.net));
    assert!(peer.net.sent.is_empty());
  }

  #[test]
  fn loss_free_transfer_is_exact() {
    let mut peer = Peer::new();
    peer.connect();

    let data = (0..20_000u32).map(|n| (n % 251) as u8).collect::<Vec<_>>();
    assert!(peer.demux.send(id(), &data, peer.now, &mut peer.net));

    let mut received = Vec::new();
    let mut expected = ISS + 1;
    let mut segments = peer.net.take();
    let mut rounds = 0;
    while !segments.is_empty() {
      rounds += 1;
      let mut replies = Vec::new();
      for segment in segments {
        let (header, payload) = decode(&segment);
        assert_eq!(header.seq, expected);
        expected += payload.len() as u32;
        received.extend_from_slice(&payload);
        peer.now += Duration::from_millis(1);
        replies.extend(peer.deliver(&packet(101, expected, Flags::ACK, &[])));
      }
      segments = replies;
    }

    assert_eq!(received, data);
    // slow start doubles the window every round
    assert!(rounds < 8, "{} rounds", rounds);
    assert_eq!(peer.demux.get(&id()).unwrap().bytes_in_flight(), 0);
    assert_eq!(peer.demux.next_deadline(), None);
  }

  #[test]
  fn inbound_stream_is_delivered_exactly_once() {
    let mut peer = Peer::new();
    peer.connect();

    let chunks: [&[u8]; 3] = [b"one ", b"two ", b"three"];
    let mut seq = 101;
    for chunk in chunks {
      let segment = packet(seq, ISS + 1, Flags::ACK, chunk);
      let acks = peer.deliver(&segment);
      seq += chunk.len() as u32;
      assert_eq!(decode(&acks[0]).0.ack, seq);
      // duplicated by the network
      assert!(peer.deliver(&segment).is_empty());
      assert_eq!(peer.demux.get(&id()).unwrap().rcv_nxt(), seq);
    }
    assert_eq!(peer.app.stream(), b"one two three".to_vec());
    assert_eq!(peer.app.payloads.len(), 3);
  }

  #[test]
  fn timers_retransmit_through_the_table() {
    let mut peer = Peer::new();
    peer.connect();

    peer.demux.send(id(), b"hello", peer.now, &mut peer.net);
    let original = peer.net.take();
    let deadline = peer.demux.next_deadline().unwrap();
    assert_eq!(deadline, peer.now + Duration::from_secs(1));

    peer.demux.poll_timers(deadline, &mut peer.net);
    assert_eq!(peer.net.take(), original);
  }

  #[test]
  fn handler_errors_are_reported() {
    #[derive(Default)]
    struct Failing {
      errors: usize,
    }
    impl Handler for Failing {
      fn on_payload(&mut self, _: ConnectionId, _: &[u8]) -> Result<(), Error> {
        Err(Error::custom(std::io::Error::new(
          std::io::ErrorKind::Other,
          "rejected",
        )))
      }
      fn on_error(&mut self, _: Error) {
        self.errors += 1;
      }
    }

    let mut demux = demux();
    let mut net = Capture::default();
    let mut app = Failing::default();
    let now = Instant::now();
    demux.received(PEER, LOCAL, &packet(100, 0, Flags::SYN, &[]), now, &mut net, &mut app);
    demux.received(PEER, LOCAL, &packet(101, ISS + 1, Flags::ACK, b"x"), now, &mut net, &mut app);
    assert_eq!(app.errors, 1);
    // the data is still acknowledged
    assert_eq!(demux.get(&id()).unwrap().rcv_nxt(), 102);
  }
}
