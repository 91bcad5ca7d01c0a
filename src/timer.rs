//! Single retransmission deadline per connection.
//!
//! There is no cancellation machinery: arming stores a new deadline and a new
//! token, and whoever acts on an expiry must present the token it observed.
//! A token from a superseded or cancelled deadline is rejected by [`Timer::fire`].

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

#[derive(Debug, Clone, Copy)]
struct Armed {
  deadline: Instant,
  token: Token,
}

#[derive(Debug, Default)]
pub struct Timer {
  armed: Option<Armed>,
  generation: u64,
}

impl Timer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Arm the timer to expire `interval` after `now`, replacing any previous deadline.
  pub fn arm(&mut self, now: Instant, interval: Duration) -> Token {
    self.generation += 1;
    let token = Token(self.generation);
    self.armed = Some(Armed {
      deadline: now + interval,
      token,
    });
    token
  }

  pub fn cancel(&mut self) {
    self.armed = None;
  }

  pub fn is_armed(&self) -> bool {
    self.armed.is_some()
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.armed.map(|a| a.deadline)
  }

  /// The token of the current deadline, if it has passed at `now`.
  pub fn expired(&self, now: Instant) -> Option<Token> {
    self
      .armed
      .filter(|a| a.deadline <= now)
      .map(|a| a.token)
  }

  /// Consume the current deadline if `token` still identifies it.
  ///
  /// Returns `false` for stale tokens, in which case nothing changes.
  pub fn fire(&mut self, token: Token) -> bool {
    match self.armed {
      Some(armed) if armed.token == token => {
        self.armed = None;
        true
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use {super::*, pretty_assertions::assert_eq};

  macro_rules! ms {
    ($v:literal) => {
      Duration::from_millis($v)
    };
  }

  #[test]
  fn expires_at_deadline() {
    let now = Instant::now();
    let mut timer = Timer::new();
    assert_eq!(timer.expired(now), None);

    let token = timer.arm(now, ms!(100));
    assert_eq!(timer.deadline(), Some(now + ms!(100)));
    assert_eq!(timer.expired(now + ms!(99)), None);
    assert_eq!(timer.expired(now + ms!(100)), Some(token));

    assert!(timer.fire(token));
    assert!(!timer.is_armed());
    // firing twice is a no-op
    assert!(!timer.fire(token));
  }

  #[test]
  fn rearm_supersedes() {
    let now = Instant::now();
    let mut timer = Timer::new();
    let first = timer.arm(now, ms!(100));
    let second = timer.arm(now + ms!(50), ms!(100));
    assert_ne!(first, second);
    assert_eq!(timer.expired(now + ms!(120)), None);
    assert!(!timer.fire(first));
    assert!(timer.is_armed());
    assert_eq!(timer.expired(now + ms!(150)), Some(second));
  }

  #[test]
  fn cancel_invalidates_token() {
    let now = Instant::now();
    let mut timer = Timer::new();
    let token = timer.arm(now, ms!(10));
    timer.cancel();
    assert_eq!(timer.expired(now + ms!(20)), None);
    assert!(!timer.fire(token));
  }
}
