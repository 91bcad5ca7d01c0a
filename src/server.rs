use crate::{
  conn::{ConnectionId, Params},
  demux::Demultiplexer,
  error::{Error, Result},
  handler::Handler,
  segment,
  socket::UdpTunnel,
};
use crossbeam::channel::{self, Receiver as RawReceiver, Sender as RawSender};
use mio::{Events, Interest, Poll, Token};
use std::{
  io,
  net::{Ipv4Addr, SocketAddr, SocketAddrV4},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

enum Command {
  Send {
    conn: ConnectionId,
    payload: Vec<u8>,
  },
  Close {
    conn: ConnectionId,
  },
  Shutdown {
    signal: channel::Sender<()>,
  },
}

fn recv_some<H: Handler>(
  net: &mut UdpTunnel,
  demux: &mut Demultiplexer,
  buffer: &mut [u8],
  handler: &mut H,
) -> Result<()> {
  loop {
    match net.recv_from(buffer) {
      Ok((size, src)) => {
        let dst = net.local_addr();
        demux.received(src, dst, &buffer[..size], Instant::now(), net, handler);
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
      // ICMP errors from earlier sends surface here
      Err(e)
        if e.kind() == io::ErrorKind::ConnectionRefused
          || e.kind() == io::ErrorKind::ConnectionReset =>
      {
        log::debug!("{}", e);
      }
      Err(e) => return Err(e.into()),
    }
  }

  Ok(())
}

pub struct Config {
  /// Where the tunnel socket binds. Its IP is the local address of every connection.
  pub addr: SocketAddrV4,
  /// Transport port connections are accepted on.
  pub port: u16,
  pub mss: usize,
  pub initial_rto: Duration,
  pub min_rto: Duration,
  /// Accept segments without validating their checksum.
  pub ignore_checksum: bool,
  pub max_connections: usize,
  /// Upper bound on how long the event loop sleeps.
  pub poll_timeout: Duration,
}

impl Config {
  fn validate(&self) -> Result<()> {
    if self.mss == 0 {
      return Err(Error::Config("mss must be at least one byte"));
    }
    if self.max_connections == 0 {
      return Err(Error::Config("max_connections must be at least one"));
    }
    Ok(())
  }

  fn params(&self) -> Params {
    Params {
      mss: self.mss,
      initial_rto: self.initial_rto,
      min_rto: self.min_rto,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000),
      port: 7000,
      mss: segment::MSS,
      initial_rto: Duration::from_secs(1),
      min_rto: Duration::from_millis(100),
      ignore_checksum: false,
      max_connections: 64,
      poll_timeout: Duration::from_secs_f32(1.0 / 60.0),
    }
  }
}

struct State<H: Handler> {
  net: UdpTunnel,
  chan: RawReceiver<Command>,
  handler: H,
  buffer: Vec<u8>,
  poll_timeout: Duration,
  poll: Poll,
  events: Events,
  demux: Demultiplexer,
  running: bool,
}

impl<H: Handler> State<H> {
  const SOCKET: Token = Token(0);
  fn new(config: Config, mut net: UdpTunnel, chan: RawReceiver<Command>, handler: H) -> Result<Self> {
    let poll = Poll::new()?;
    poll
      .registry()
      .register(net.socket_mut(), Self::SOCKET, Interest::READABLE)?;
    let demux = Demultiplexer::new(config.port, config.params(), config.max_connections);
    Ok(Self {
      net,
      chan,
      handler,
      // enough to hold the maximum size of a UDP datagram
      buffer: vec![0u8; 1 << 16],
      poll_timeout: config.poll_timeout,
      poll,
      events: Events::with_capacity(1024),
      demux,
      running: true,
    })
  }

  /// Sleep no longer than the nearest retransmission deadline.
  fn timeout(&self, now: Instant) -> Duration {
    match self.demux.next_deadline() {
      Some(deadline) => self
        .poll_timeout
        .min(deadline.saturating_duration_since(now)),
      None => self.poll_timeout,
    }
  }

  fn run(&mut self) -> Result<()> {
    log::info!(
      "listening on port {} via {}",
      self.demux.port(),
      self.net.local_endpoint()?
    );
    while self.running {
      // 1. socket events
      let timeout = self.timeout(Instant::now());
      if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
        if e.kind() != io::ErrorKind::Interrupted {
          return Err(e.into());
        }
      }
      for event in self.events.iter() {
        match event.token() {
          Self::SOCKET => {
            if event.is_readable() {
              recv_some(
                &mut self.net,
                &mut self.demux,
                &mut self.buffer,
                &mut self.handler,
              )?;
            }
          }
          _ => unreachable!(),
        }
      }

      // 2. retransmission timers
      self.demux.poll_timers(Instant::now(), &mut self.net);

      // 3. commands
      loop {
        match self.chan.try_recv() {
          Ok(cmd) => match cmd {
            Command::Send { conn, payload } => {
              self
                .demux
                .send(conn, &payload, Instant::now(), &mut self.net);
            }
            Command::Close { conn } => {
              self.demux.close(conn, &mut self.net);
            }
            Command::Shutdown { signal } => {
              self.demux.close_all(&mut self.net);
              let _ = signal.send(());
              self.running = false;
              break;
            }
          },
          Err(channel::TryRecvError::Empty) => break,
          Err(channel::TryRecvError::Disconnected) => return Ok(()),
        }
      }
    }

    Ok(())
  }
}

/// Hands commands to the event loop.
///
/// Commands are applied in the order they were sent, after the event that is
/// currently being handled. Commands sent after `shutdown` are ignored.
#[derive(Clone)]
pub struct Sender {
  chan: RawSender<Command>,
  local: SocketAddr,
}

impl Sender {
  fn new(chan: RawSender<Command>, local: SocketAddr) -> Self {
    Self { chan, local }
  }

  /// The UDP endpoint peers reach the server through.
  pub fn local_endpoint(&self) -> SocketAddr {
    self.local
  }

  /// Append `payload` to the connection's outbound stream.
  pub fn send(&self, conn: ConnectionId, payload: impl Into<Vec<u8>>) {
    let payload = payload.into();
    if self.chan.send(Command::Send { conn, payload }).is_err() {
      log::debug!("{} send after shutdown", conn);
    }
  }

  /// Send the connection's FIN right away.
  ///
  /// Bytes still waiting for the congestion window are discarded.
  pub fn close(&self, conn: ConnectionId) {
    if self.chan.send(Command::Close { conn }).is_err() {
      log::debug!("{} close after shutdown", conn);
    }
  }

  /// Close every connection and stop the event loop. This call blocks until the loop exits.
  ///
  /// Must not be called from inside a [`Handler`] callback.
  pub fn shutdown(&self) {
    let (signal, wait) = channel::bounded(1);
    if self.chan.send(Command::Shutdown { signal }).is_ok() {
      let _ = wait.recv();
    }
  }
}

/// Serve `port` through a tunnel bound on `addr` with default configuration,
/// and start the event loop on a new thread.
pub fn listen<F, H>(addr: SocketAddrV4, port: u16, factory: F) -> Result<(Sender, JoinHandle<Result<()>>)>
where
  F: FnOnce(Sender) -> H,
  H: Handler + Send + 'static,
{
  listen_with(
    Config {
      addr,
      port,
      ..Config::default()
    },
    factory,
  )
}

/// Bind the tunnel with custom configuration, and start the event loop on a new thread.
pub fn listen_with<F, H>(config: Config, factory: F) -> Result<(Sender, JoinHandle<Result<()>>)>
where
  F: FnOnce(Sender) -> H,
  H: Handler + Send + 'static,
{
  config.validate()?;
  let net = UdpTunnel::bind(config.addr, config.ignore_checksum)?;
  // handlers send from the event loop thread itself, so the queue must never block
  let (sender, receiver) = channel::unbounded();
  let sender = Sender::new(sender, net.local_endpoint()?);
  let handler = factory(sender.clone());
  let mut state = State::new(config, net, receiver, handler)?;
  let handle = thread::spawn(move || state.run());
  Ok((sender, handle))
}
