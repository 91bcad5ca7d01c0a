use crate::codec;
use std::{error::Error as StdError, fmt::Debug, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  #[error("Malformed segment: {0}")]
  Codec(#[from] codec::Error),
  #[error("Invalid configuration: {0}")]
  Config(&'static str),
  #[error("User error: {0}")]
  User(Box<dyn StdError + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  pub fn custom<T>(err: T) -> Error
  where
    T: StdError + Send + Sync + 'static,
  {
    Error::User(Box::new(err))
  }

  pub fn downcast<T>(&self) -> Option<&T>
  where
    T: StdError + Send + Sync + 'static,
  {
    match self {
      Error::User(err) => err.downcast_ref(),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
  /// The close handshake completed and our FIN was acknowledged.
  Normal,
  /// A new SYN arrived for the same connection id and took over its slot.
  Replaced,
}
