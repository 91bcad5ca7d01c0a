//! Reno style congestion window: slow start, congestion avoidance, and fast
//! retransmit on three duplicate acknowledgements.
//!
//! All quantities are in bytes.

/// Number of duplicate acknowledgements that triggers a fast retransmit.
pub const DUPLICATE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
  /// The acknowledgement number moved.
  New,
  /// The acknowledgement number repeated on a pure ACK with data outstanding,
  /// for the n-th time in a row.
  Duplicate(u32),
  /// The acknowledgement number repeated but cannot signal a loss. Not counted.
  Repeated,
}

#[derive(Debug, Clone)]
pub struct Window {
  cwnd: u64,
  ssthresh: u64,
  duplicates: u32,
  last_ack: Option<u32>,
  mss: u64,
}

impl Window {
  pub fn new(mss: usize) -> Self {
    Self {
      cwnd: mss as u64,
      ssthresh: u64::MAX,
      duplicates: 0,
      last_ack: None,
      mss: mss as u64,
    }
  }

  pub fn get(&self) -> u64 {
    self.cwnd
  }

  pub fn ssthresh(&self) -> u64 {
    self.ssthresh
  }

  pub fn duplicates(&self) -> u32 {
    self.duplicates
  }

  /// Whether `chunk` more bytes may be sent with `in_flight` bytes unacknowledged.
  pub fn admits(&self, in_flight: u64, chunk: u64) -> bool {
    in_flight + chunk <= self.cwnd
  }

  /// Track the acknowledgement number of an incoming ACK.
  ///
  /// A repeat only counts as a duplicate when `countable`: the ACK carries no
  /// data and something is waiting to be acknowledged.
  pub fn observe(&mut self, ack: u32, countable: bool) -> Observed {
    if self.last_ack == Some(ack) {
      if !countable {
        return Observed::Repeated;
      }
      self.duplicates += 1;
      Observed::Duplicate(self.duplicates)
    } else {
      self.duplicates = 0;
      self.last_ack = Some(ack);
      Observed::New
    }
  }

  /// Grow the window after an acknowledgement retired queued data.
  pub fn on_ack(&mut self) {
    if self.cwnd < self.ssthresh {
      // slow start
      self.cwnd += self.mss;
    } else {
      // congestion avoidance, roughly one MSS per window of acknowledged data
      self.cwnd += std::cmp::max(1, self.mss * self.mss / self.cwnd);
    }
  }

  /// Multiplicative decrease after a timeout or a fast retransmit.
  pub fn on_loss(&mut self) {
    self.ssthresh = std::cmp::max(self.cwnd / 2, 2 * self.mss);
    self.cwnd = self.mss;
  }

  pub fn on_fast_retransmit(&mut self) {
    self.on_loss();
    self.duplicates = 0;
  }
}
