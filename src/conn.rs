use crate::{
  congestion::{Observed, Window, DUPLICATE_THRESHOLD},
  handler::Handler,
  rtt::Estimator,
  segment::{self, Flags},
  seq,
  socket::Network,
  timer::{Timer, Token},
};
use bytes::{Bytes, BytesMut};
use std::{
  collections::VecDeque,
  fmt,
  net::Ipv4Addr,
  time::{Duration, Instant},
};

/// Identifies a connection. `src` is the remote peer, `dst` is us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
  pub src_addr: Ipv4Addr,
  pub src_port: u16,
  pub dst_addr: Ipv4Addr,
  pub dst_port: u16,
}

impl fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{} -> {}:{}",
      self.src_addr, self.src_port, self.dst_addr, self.dst_port
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  /// Data flows both ways.
  Open,
  /// A FIN was sent or received; waiting for the close handshake to finish.
  Closing,
  /// Terminal. All input is ignored.
  Closed,
}

/// When an unacknowledged segment was put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentAt {
  /// Sent once, at this instant. Its acknowledgement is a valid RTT sample.
  Fresh(Instant),
  /// Sent more than once; which copy an ACK answers is ambiguous (Karn).
  Retransmitted,
}

#[derive(Debug, Clone)]
struct Unacked {
  seq: u32,
  len: usize,
  /// The exact bytes that were sent, reused verbatim on retransmission.
  segment: Bytes,
  sent_at: SentAt,
}

impl Unacked {
  fn end(&self) -> u32 {
    seq::add(self.seq, self.len)
  }
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct Params {
  pub mss: usize,
  pub initial_rto: Duration,
  pub min_rto: Duration,
}

impl Default for Params {
  fn default() -> Self {
    Self {
      mss: segment::MSS,
      initial_rto: Duration::from_secs(1),
      min_rto: Duration::from_millis(100),
    }
  }
}

/// The fields of an inbound segment a connection cares about.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
  pub seq: u32,
  pub ack: u32,
  pub flags: Flags,
  pub payload: &'a [u8],
}

/// The protocol engine of one passive connection.
pub struct Connection {
  id: ConnectionId,
  state: State,
  /// Sequence number of the next byte we send
  snd_nxt: u32,
  /// Sequence number of the next byte we expect from the peer
  rcv_nxt: u32,
  /// Sent but unacknowledged segments, oldest first
  unacked: VecDeque<Unacked>,
  /// Accepted from the application, not yet sent
  send_buffer: BytesMut,
  sending: bool,
  fin_sent: bool,
  peer_fin: bool,
  mss: usize,
  rtt: Estimator,
  window: Window,
  timer: Timer,
}

impl Connection {
  /// Accept a connection request whose SYN carried `peer_isn`, answering
  /// with a SYN+ACK that starts our side of the stream at `iss`.
  pub fn accept<N: Network>(
    id: ConnectionId,
    peer_isn: u32,
    iss: u32,
    params: &Params,
    net: &mut N,
  ) -> Self {
    let mss = params.mss.max(1);
    let mut conn = Self {
      id,
      state: State::Open,
      snd_nxt: iss,
      rcv_nxt: peer_isn.wrapping_add(1),
      unacked: VecDeque::new(),
      send_buffer: BytesMut::new(),
      sending: false,
      fin_sent: false,
      peer_fin: false,
      mss,
      rtt: Estimator::new(params.initial_rto, params.min_rto),
      window: Window::new(mss),
      timer: Timer::new(),
    };
    conn.transmit_control(Flags::SYN | Flags::ACK, net);
    // the SYN occupies one sequence number
    conn.snd_nxt = iss.wrapping_add(1);
    conn
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn state(&self) -> State {
    self.state
  }

  pub fn snd_nxt(&self) -> u32 {
    self.snd_nxt
  }

  pub fn rcv_nxt(&self) -> u32 {
    self.rcv_nxt
  }

  pub fn window(&self) -> &Window {
    &self.window
  }

  pub fn rtt(&self) -> &Estimator {
    &self.rtt
  }

  /// Whether a transmission is outstanding.
  pub fn is_sending(&self) -> bool {
    self.sending
  }

  /// Bytes sent but not yet acknowledged.
  pub fn bytes_in_flight(&self) -> usize {
    self.unacked.iter().map(|u| u.len).sum()
  }

  /// Bytes accepted by `send` but held back by the congestion window.
  pub fn buffered(&self) -> usize {
    self.send_buffer.len()
  }

  /// When the retransmission timer fires next, if armed.
  pub fn deadline(&self) -> Option<Instant> {
    self.timer.deadline()
  }

  /// Process one inbound segment.
  pub fn received<N: Network, H: Handler>(
    &mut self,
    incoming: Incoming<'_>,
    now: Instant,
    net: &mut N,
    handler: &mut H,
  ) {
    if self.state == State::Closed {
      return;
    }

    if incoming.flags.contains(Flags::FIN) {
      self.on_fin(incoming, net, handler);
      return;
    }

    if incoming.flags.contains(Flags::ACK) {
      self.on_ack(incoming.ack, !incoming.payload.is_empty(), now, net);
    }

    match self.state {
      State::Closing => {
        if !incoming.payload.is_empty() {
          log::debug!(
            "{} closing, ignoring {} bytes",
            self.id,
            incoming.payload.len()
          );
        }
        if self.fin_sent && incoming.flags.contains(Flags::ACK) && incoming.ack == self.snd_nxt {
          self.finish();
        }
      }
      State::Open => {
        if incoming.payload.is_empty() {
          return;
        }
        if incoming.seq != self.rcv_nxt {
          log::debug!(
            "{} dropping segment at {}, expected {}",
            self.id,
            incoming.seq,
            self.rcv_nxt
          );
          return;
        }
        self.rcv_nxt = seq::add(self.rcv_nxt, incoming.payload.len());
        if let Err(e) = handler.on_payload(self.id, incoming.payload) {
          handler.on_error(e);
        }
        self.transmit_control(Flags::ACK, net);
      }
      State::Closed => {}
    }
  }

  /// Queue `data` for transmission and send as much as the window admits.
  pub fn send<N: Network>(&mut self, data: &[u8], now: Instant, net: &mut N) {
    if data.is_empty() {
      return;
    }
    if self.state == State::Closed || self.fin_sent {
      log::debug!("{} send after close, discarding {} bytes", self.id, data.len());
      return;
    }
    self.send_buffer.extend_from_slice(data);
    self.transmit_buffered(now, net);
  }

  /// Send our FIN. Anything still buffered is discarded, since it could not
  /// be sequenced after the FIN.
  pub fn close<N: Network>(&mut self, net: &mut N) {
    if self.state == State::Closed || self.fin_sent {
      return;
    }
    if !self.send_buffer.is_empty() {
      log::debug!(
        "{} closing with {} unsent bytes",
        self.id,
        self.send_buffer.len()
      );
      self.send_buffer.clear();
    }
    self.transmit_control(Flags::FIN | Flags::ACK, net);
    self.snd_nxt = self.snd_nxt.wrapping_add(1);
    self.fin_sent = true;
    self.state = State::Closing;
  }

  /// Fire the retransmission timer if its deadline has passed.
  pub fn poll_timer<N: Network>(&mut self, now: Instant, net: &mut N) {
    if let Some(token) = self.timer.expired(now) {
      self.on_timeout(token, now, net);
    }
  }

  /// Retransmit the oldest unacknowledged segment.
  ///
  /// Does nothing unless `token` identifies the currently armed deadline.
  pub fn on_timeout<N: Network>(&mut self, token: Token, now: Instant, net: &mut N) {
    if !self.timer.fire(token) || self.state == State::Closed {
      return;
    }
    if let Some(head) = self.unacked.front_mut() {
      log::debug!("{} timeout, retransmitting {}", self.id, head.seq);
      net.send(&head.segment, self.id.src_addr);
      head.sent_at = SentAt::Retransmitted;
      self.window.on_loss();
      self.arm(now);
    }
  }

  fn on_fin<N: Network, H: Handler>(&mut self, incoming: Incoming<'_>, net: &mut N, handler: &mut H) {
    self.rcv_nxt = incoming.seq.wrapping_add(1);
    self.transmit_control(Flags::ACK, net);

    if !self.peer_fin {
      self.peer_fin = true;
      if let Err(e) = handler.on_payload(self.id, &[]) {
        handler.on_error(e);
      }
    }

    if self.state == State::Open {
      self.state = State::Closing;
    } else if self.fin_sent
      && incoming.flags.contains(Flags::ACK)
      && incoming.ack == self.snd_nxt
    {
      // a FIN+ACK covering our FIN closes at once, no separate ACK follows
      self.finish();
    }
  }

  fn on_ack<N: Network>(&mut self, ack: u32, carries_data: bool, now: Instant, net: &mut N) {
    if seq::lt(self.snd_nxt, ack) {
      log::debug!("{} ack {} for unsent data, ignoring", self.id, ack);
      return;
    }

    let countable = !carries_data && !self.unacked.is_empty();
    if let Observed::Duplicate(n) = self.window.observe(ack, countable) {
      if n == DUPLICATE_THRESHOLD {
        self.fast_retransmit(now, net);
      }
    }

    let mut advanced = false;
    while let Some(head) = self.unacked.front() {
      if !seq::le(head.end(), ack) {
        break;
      }
      if let SentAt::Fresh(sent_at) = head.sent_at {
        self.rtt.update(now.saturating_duration_since(sent_at));
      }
      self.unacked.pop_front();
      advanced = true;
    }

    if advanced {
      self.timer.cancel();
      self.window.on_ack();
      if self.unacked.is_empty() {
        self.sending = false;
      } else {
        self.arm(now);
      }
      self.transmit_buffered(now, net);
    }
  }

  fn fast_retransmit<N: Network>(&mut self, now: Instant, net: &mut N) {
    if let Some(head) = self.unacked.front_mut() {
      log::debug!("{} fast retransmit of {}", self.id, head.seq);
      net.send(&head.segment, self.id.src_addr);
      head.sent_at = SentAt::Retransmitted;
      self.window.on_fast_retransmit();
      self.arm(now);
    }
  }

  fn transmit_buffered<N: Network>(&mut self, now: Instant, net: &mut N) {
    if self.fin_sent || self.state == State::Closed {
      return;
    }
    let was_empty = self.unacked.is_empty();
    let mut in_flight = self.bytes_in_flight();
    while !self.send_buffer.is_empty() {
      let len = std::cmp::min(self.mss, self.send_buffer.len());
      if !self.window.admits(in_flight as u64, len as u64) {
        break;
      }
      let chunk = self.send_buffer.split_to(len);
      let segment = self.build(self.snd_nxt, Flags::ACK, &chunk);
      net.send(&segment, self.id.src_addr);
      self.unacked.push_back(Unacked {
        seq: self.snd_nxt,
        len,
        segment,
        sent_at: SentAt::Fresh(now),
      });
      self.snd_nxt = seq::add(self.snd_nxt, len);
      self.sending = true;
      in_flight += len;
    }
    if was_empty && !self.unacked.is_empty() {
      self.arm(now);
    }
  }

  fn arm(&mut self, now: Instant) {
    self.timer.arm(now, self.rtt.rto());
  }

  fn finish(&mut self) {
    log::info!("{} closed", self.id);
    self.state = State::Closed;
    self.timer.cancel();
    self.unacked.clear();
    self.send_buffer.clear();
    self.sending = false;
  }

  /// Send a segment without payload at `snd_nxt`.
  fn transmit_control<N: Network>(&self, flags: Flags, net: &mut N) {
    let segment = self.build(self.snd_nxt, flags, &[]);
    net.send(&segment, self.id.src_addr);
  }

  fn build(&self, seq: u32, flags: Flags, payload: &[u8]) -> Bytes {
    let mut segment = segment::make_header(self.id.dst_port, self.id.src_port, seq, self.rcv_nxt, flags);
    segment.extend_from_slice(payload);
    segment::fix_checksum(segment, self.id.dst_addr, self.id.src_addr)
  }
}
