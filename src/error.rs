use thiserror::Error;

use crate::oob::{ConnectionCloseReason, ConnectionType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Socket(#[from] crate::socket::Error),
    #[error(transparent)]
    Tend(#[from] crate::tend::Error),
    #[error("invalid out-of-band message: {0}")]
    Oob(#[from] crate::oob::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session is already connecting or connected")]
    AlreadyConnected,
    #[error("session is not connected")]
    NotConnected,
    #[error("kick requests cannot be sent from a {0:?} connection")]
    KickNotAllowed(ConnectionType),
    #[error("packet sequence id is not the next one to send")]
    InvalidSequence,
    #[error("packet buffer was rented before the connection mtu changed")]
    StaleBuffer,
    #[error("packet size exceeded, got {0} but the connection mtu is {1}")]
    PacketTooLarge(usize, usize),
    #[error("connection denied: {reason}")]
    ConnectionDenied {
        reason: ConnectionCloseReason,
        host_payload: Vec<u8>,
    },
    #[error("connection closed: {0}")]
    ConnectionClosed(ConnectionCloseReason),
}

