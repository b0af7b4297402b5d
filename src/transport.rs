use std::{
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{error::Error, session::ConnectSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
}

/// Asynchronous notifications from a [`Transport`], drained by the session on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Error(String),
}

/// A trait for sending and receiving datagrams to a single endpoint.
///
/// The session creates one transport per connection attempt through a factory and polls it
/// from its own tick, so no method may block. The transport is also reached from the
/// keep-alive worker thread (behind a mutex), hence the `Send` bound.
///
/// See [`UdpTransport`](crate::UdpTransport) for the default implementation.
pub trait Transport: Send + 'static {
    type IntoError: Into<Error>;
    /// Starts opening a connection to `endpoint`.
    ///
    /// Completion is reported later as [`TransportEvent::Opened`] or [`TransportEvent::Error`].
    fn open(&mut self, endpoint: SocketAddr, settings: &ConnectSettings)
        -> Result<(), Self::IntoError>;
    fn poll_event(&mut self) -> Option<TransportEvent>;
    /// Sends one datagram. The first [`header_size`](Transport::header_size) bytes are reserved
    /// for the transport and may be overwritten by it.
    ///
    /// Should **NOT** block if the datagram cannot be sent.
    fn send(&mut self, buf: &[u8]) -> Result<usize, Self::IntoError>;
    /// Receives one datagram, if one is available. The returned length includes the header region.
    ///
    /// Should **NOT** block if no datagram is available.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Self::IntoError>;
    /// Called right before the session sends its farewell message.
    fn prepare_disconnect(&mut self);
    fn close(&mut self);
    fn can_send(&self) -> bool;
    fn state(&self) -> TransportState;
    /// Number of bytes at the front of every datagram that belong to the transport.
    fn header_size(&self) -> usize;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Locks a shared transport. A panic while holding the lock leaves the transport usable,
/// so poisoning is ignored.
pub(crate) fn lock<T: Transport>(transport: &Mutex<T>) -> MutexGuard<'_, T> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}
