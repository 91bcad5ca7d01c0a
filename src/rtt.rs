use std::time::Duration;

/// Smoothed round-trip time estimate, based on RFC6298.
///
/// Gains are α = 1/8 for the estimate and β = 1/4 for the deviation, applied
/// in integer nanoseconds so a fixed series of samples always produces the
/// same estimate.
#[derive(Debug, Clone)]
pub struct Estimator {
  /// The smoothed round-trip time, `None` until the first sample
  estimated: Option<Duration>,
  /// The mean deviation of samples from `estimated`
  deviation: Duration,
  /// Timeout used before any sample is available
  initial_rto: Duration,
  /// Lower bound on the timeout
  min_rto: Duration,
}

impl Estimator {
  pub fn new(initial_rto: Duration, min_rto: Duration) -> Self {
    Self {
      estimated: None,
      deviation: Duration::ZERO,
      initial_rto,
      min_rto,
    }
  }

  pub fn estimated(&self) -> Option<Duration> {
    self.estimated
  }

  pub fn deviation(&self) -> Duration {
    self.deviation
  }

  /// Update the estimate with the time between sending a segment and
  /// receiving the acknowledgement that retired it.
  pub fn update(&mut self, sample: Duration) {
    match self.estimated {
      None => {
        self.estimated = Some(sample);
        self.deviation = sample / 2;
      }
      Some(estimated) => {
        let error = if sample > estimated {
          sample - estimated
        } else {
          estimated - sample
        };
        // dev = (1 - β) * dev + β * |sample - est|
        self.deviation = (3 * self.deviation + error) / 4;
        // est = (1 - α) * est + α * sample
        self.estimated = Some((7 * estimated + sample) / 8);
      }
    }
  }

  /// How long to wait for an acknowledgement before retransmitting.
  pub fn rto(&self) -> Duration {
    match self.estimated {
      None => self.initial_rto,
      Some(estimated) => std::cmp::max(self.min_rto, estimated + 4 * self.deviation),
    }
  }
}
