//! A reliable byte stream over an unreliable datagram substrate.
//!
//! Connections are accepted passively: a [`demux::Demultiplexer`] owns every
//! [`conn::Connection`] for one local port and routes inbound segments to them.
//! [`server::listen`] runs the whole thing on an event loop over a UDP tunnel.

pub mod codec;
pub mod congestion;
pub mod conn;
pub mod demux;
pub mod error;
pub mod handler;
pub mod rtt;
pub mod segment;
pub mod server;
pub mod socket;
pub mod timer;

mod seq;

pub use conn::{ConnectionId, State};
pub use error::{Error, Reason, Result};
pub use handler::Handler;
pub use server::{listen, listen_with, Config, Sender};
