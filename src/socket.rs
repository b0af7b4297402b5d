use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    consts::{SOCKET_RECV_BUF_SIZE, SOCKET_SEND_BUF_SIZE},
    session::ConnectSettings,
    transport::{Transport, TransportEvent, TransportState},
};

#[derive(thiserror::Error, Debug)]
#[error("udp socket error: {0}")]
pub struct Error(#[from] std::io::Error);

pub type Result<T> = std::result::Result<T, Error>;

/// Non-blocking UDP transport. Datagrams carry no transport header.
#[derive(Debug, Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    events: VecDeque<TransportEvent>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }
    fn bind(endpoint: SocketAddr) -> Result<UdpSocket> {
        let local: SocketAddr = if endpoint.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        if local.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_send_buffer_size(SOCKET_SEND_BUF_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_RECV_BUF_SIZE)?;
        socket.bind(&local.into())?;
        socket.connect(&endpoint.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Transport for UdpTransport {
    type IntoError = Error;

    fn open(&mut self, endpoint: SocketAddr, _settings: &ConnectSettings) -> Result<()> {
        let socket = Self::bind(endpoint)?;
        log::debug!(
            "udp transport bound to {:?}, sending to {endpoint}",
            socket.local_addr().ok()
        );
        self.socket = Some(socket);
        self.peer = Some(endpoint);
        self.events.push_back(TransportEvent::Opened);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed").into());
        };
        match socket.send(buf) {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        match socket.recv(buf) {
            Ok(len) if len > 0 => Ok(Some(len)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from a previous send; the peer may still come up
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn prepare_disconnect(&mut self) {}

    fn close(&mut self) {
        self.socket = None;
        self.peer = None;
        self.events.clear();
    }

    fn can_send(&self) -> bool {
        self.socket.is_some()
    }

    fn state(&self) -> TransportState {
        match self.socket {
            Some(_) => TransportState::Open,
            None => TransportState::Closed,
        }
    }

    fn header_size(&self) -> usize {
        0
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
