use anyhow::Result;
use seastream::{ConnectionId, Error, Handler, Reason, Sender};
use std::net::SocketAddrV4;

fn init_log() -> Result<()> {
  // default RUST_LOG=info
  std::env::set_var(
    "RUST_LOG",
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
  );
  Ok(env_logger::try_init()?)
}

/// Writes every received byte back, and closes once the peer does.
struct Echo {
  sender: Sender,
}

impl Handler for Echo {
  fn on_payload(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), Error> {
    if payload.is_empty() {
      log::info!("{} peer closed", conn);
      self.sender.close(conn);
    } else {
      log::info!("{} echoing {} bytes", conn, payload.len());
      self.sender.send(conn, payload);
    }
    Ok(())
  }

  fn on_disconnect(&mut self, conn: ConnectionId, reason: Reason) -> Result<(), Error> {
    log::info!("{} gone ({:?})", conn, reason);
    Ok(())
  }
}

/// Usage: echo [TUNNEL_ADDR] [PORT]
fn main() -> Result<()> {
  init_log()?;

  let mut args = std::env::args().skip(1);
  let addr: SocketAddrV4 = args
    .next()
    .unwrap_or_else(|| "127.0.0.1:9000".into())
    .parse()?;
  let port: u16 = args.next().unwrap_or_else(|| "7000".into()).parse()?;

  let (_sender, handle) = seastream::listen(addr, port, |sender| Echo { sender })?;
  log::info!("Echo server on port {} via {}", port, addr);

  match handle.join() {
    Ok(result) => Ok(result?),
    Err(_) => anyhow::bail!("event loop panicked"),
  }
}
