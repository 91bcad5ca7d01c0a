use crate::{
  conn::ConnectionId,
  error::{Error, Reason},
};

/// Upward notifications from the engine to the application.
///
/// Callbacks run synchronously in the middle of segment processing and must
/// not block. They cannot reach back into the engine; replies go through the
/// [`Sender`](crate::server::Sender) and are applied once the current event
/// has been handled.
pub trait Handler {
  /// Called once for every new connection, right after the SYN+ACK went out.
  fn on_accept(&mut self, conn: ConnectionId) -> Result<(), Error> {
    log::info!("{} accepted", conn);
    Ok(())
  }
  /// Called with every in-order chunk of the peer's byte stream.
  ///
  /// An empty `payload` means the peer sent its FIN; this happens once per
  /// connection and nothing else is delivered afterwards.
  fn on_payload(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), Error>;
  /// Called when a connection leaves the connection table.
  fn on_disconnect(&mut self, conn: ConnectionId, reason: Reason) -> Result<(), Error> {
    log::info!("{} disconnected ({:?})", conn, reason);
    Ok(())
  }
  /// Called with errors returned by the other callbacks.
  ///
  /// The engine keeps running; errors never tear down a connection.
  fn on_error(&mut self, error: Error) {
    log::error!("{}", error);
  }
}

/// Collects everything delivered, per connection.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Recorder {
  pub accepted: Vec<ConnectionId>,
  pub payloads: Vec<(ConnectionId, Vec<u8>)>,
  pub disconnected: Vec<(ConnectionId, Reason)>,
}

#[cfg(test)]
impl Recorder {
  /// All bytes delivered so far, in delivery order, without the FIN marker.
  pub fn stream(&self) -> Vec<u8> {
    self
      .payloads
      .iter()
      .flat_map(|(_, payload)| payload.iter().copied())
      .collect()
  }

  pub fn peer_closed(&self) -> usize {
    self.payloads.iter().filter(|(_, p)| p.is_empty()).count()
  }
}

#[cfg(test)]
impl Handler for Recorder {
  fn on_accept(&mut self, conn: ConnectionId) -> Result<(), Error> {
    self.accepted.push(conn);
    Ok(())
  }

  fn on_payload(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), Error> {
    self.payloads.push((conn, payload.to_vec()));
    Ok(())
  }

  fn on_disconnect(&mut self, conn: ConnectionId, reason: Reason) -> Result<(), Error> {
    self.disconnected.push((conn, reason));
    Ok(())
  }
}
