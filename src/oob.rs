use std::{fmt, io};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    bytes::{read_payload, write_payload, Bytes},
    consts::OOB_PROTOCOL_VERSION,
};

pub type ClientId = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported out-of-band protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown out-of-band message type {0}")]
    UnknownType(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The role a connection plays towards the replication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Client,
    /// An authoritative host. Only simulators may kick other clients.
    Simulator,
}

impl ConnectionType {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionType::Client => 0,
            ConnectionType::Simulator => 1,
        }
    }
    fn from_u8(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(ConnectionType::Client),
            1 => Ok(ConnectionType::Simulator),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid connection type {value}"),
            )),
        }
    }
}

/// Why a connection was closed, as carried by a disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseReason {
    Unknown,
    /// Closed by a local call to `disconnect`.
    Disconnected,
    Timeout,
    ServerShutdown,
    Kicked,
    HostRejected,
    InvalidProtocolVersion,
    TransportError,
}

impl ConnectionCloseReason {
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectionCloseReason::Unknown => 0,
            ConnectionCloseReason::Disconnected => 1,
            ConnectionCloseReason::Timeout => 2,
            ConnectionCloseReason::ServerShutdown => 3,
            ConnectionCloseReason::Kicked => 4,
            ConnectionCloseReason::HostRejected => 5,
            ConnectionCloseReason::InvalidProtocolVersion => 6,
            ConnectionCloseReason::TransportError => 7,
        }
    }
    /// Codes from newer peers are mapped to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionCloseReason::Disconnected,
            2 => ConnectionCloseReason::Timeout,
            3 => ConnectionCloseReason::ServerShutdown,
            4 => ConnectionCloseReason::Kicked,
            5 => ConnectionCloseReason::HostRejected,
            6 => ConnectionCloseReason::InvalidProtocolVersion,
            7 => ConnectionCloseReason::TransportError,
            _ => ConnectionCloseReason::Unknown,
        }
    }
}

impl fmt::Display for ConnectionCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub connection_type: ConnectionType,
    pub mtu: u16,
    pub user_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub mtu: u16,
    pub send_frequency: u16,
    pub client_id: ClientId,
    pub host_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRequest {
    pub reason: ConnectionCloseReason,
    pub host_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickRequest {
    pub client_id: ClientId,
    pub host_payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSendFrequencyRequest {
    pub rate: u16,
}

/// Asks this host whether a client may join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateConnectionRequest {
    pub client_id: ClientId,
    pub user_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateConnectionResponse {
    pub client_id: ClientId,
    pub accepted: bool,
    pub host_payload: Vec<u8>,
}

/// Control messages exchanged outside of the application data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobMessage {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    Ack,
    KeepAlive,
    DisconnectRequest(DisconnectRequest),
    KickRequest(KickRequest),
    ChangeSendFrequencyRequest(ChangeSendFrequencyRequest),
    ValidateConnectionRequest(ValidateConnectionRequest),
    ValidateConnectionResponse(ValidateConnectionResponse),
}

impl OobMessage {
    pub const CONNECT_REQUEST: u8 = 0;
    pub const CONNECT_RESPONSE: u8 = 1;
    pub const ACK: u8 = 2;
    pub const KEEP_ALIVE: u8 = 3;
    pub const DISCONNECT_REQUEST: u8 = 4;
    pub const KICK_REQUEST: u8 = 5;
    pub const CHANGE_SEND_FREQUENCY_REQUEST: u8 = 6;
    pub const VALIDATE_CONNECTION_REQUEST: u8 = 7;
    pub const VALIDATE_CONNECTION_RESPONSE: u8 = 8;

    pub fn message_type(&self) -> u8 {
        match self {
            OobMessage::ConnectRequest(_) => Self::CONNECT_REQUEST,
            OobMessage::ConnectResponse(_) => Self::CONNECT_RESPONSE,
            OobMessage::Ack => Self::ACK,
            OobMessage::KeepAlive => Self::KEEP_ALIVE,
            OobMessage::DisconnectRequest(_) => Self::DISCONNECT_REQUEST,
            OobMessage::KickRequest(_) => Self::KICK_REQUEST,
            OobMessage::ChangeSendFrequencyRequest(_) => Self::CHANGE_SEND_FREQUENCY_REQUEST,
            OobMessage::ValidateConnectionRequest(_) => Self::VALIDATE_CONNECTION_REQUEST,
            OobMessage::ValidateConnectionResponse(_) => Self::VALIDATE_CONNECTION_RESPONSE,
        }
    }
    pub fn is_ack(&self) -> bool {
        matches!(self, OobMessage::Ack)
    }
    /// Writes the version and type tag followed by the message fields.
    pub fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), Error> {
        writer.write_u8(OOB_PROTOCOL_VERSION)?;
        writer.write_u8(self.message_type())?;
        match self {
            OobMessage::Ack | OobMessage::KeepAlive => {}
            OobMessage::ConnectRequest(msg) => msg.write_to(writer)?,
            OobMessage::ConnectResponse(msg) => msg.write_to(writer)?,
            OobMessage::DisconnectRequest(msg) => msg.write_to(writer)?,
            OobMessage::KickRequest(msg) => msg.write_to(writer)?,
            OobMessage::ChangeSendFrequencyRequest(msg) => msg.write_to(writer)?,
            OobMessage::ValidateConnectionRequest(msg) => msg.write_to(writer)?,
            OobMessage::ValidateConnectionResponse(msg) => msg.write_to(writer)?,
        }
        Ok(())
    }
    pub fn read(reader: &mut impl ReadBytesExt) -> Result<Self, Error> {
        let version = reader.read_u8()?;
        if version != OOB_PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let message = match reader.read_u8()? {
            Self::CONNECT_REQUEST => OobMessage::ConnectRequest(ConnectRequest::read_from(reader)?),
            Self::CONNECT_RESPONSE => {
                OobMessage::ConnectResponse(ConnectResponse::read_from(reader)?)
            }
            Self::ACK => OobMessage::Ack,
            Self::KEEP_ALIVE => OobMessage::KeepAlive,
            Self::DISCONNECT_REQUEST => {
                OobMessage::DisconnectRequest(DisconnectRequest::read_from(reader)?)
            }
            Self::KICK_REQUEST => OobMessage::KickRequest(KickRequest::read_from(reader)?),
            Self::CHANGE_SEND_FREQUENCY_REQUEST => OobMessage::ChangeSendFrequencyRequest(
                ChangeSendFrequencyRequest::read_from(reader)?,
            ),
            Self::VALIDATE_CONNECTION_REQUEST => OobMessage::ValidateConnectionRequest(
                ValidateConnectionRequest::read_from(reader)?,
            ),
            Self::VALIDATE_CONNECTION_RESPONSE => OobMessage::ValidateConnectionResponse(
                ValidateConnectionResponse::read_from(reader)?,
            ),
            other => return Err(Error::UnknownType(other)),
        };
        Ok(message)
    }
}

impl fmt::Display for OobMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OobMessage::ConnectRequest(_) => "connect request",
            OobMessage::ConnectResponse(_) => "connect response",
            OobMessage::Ack => "ack",
            OobMessage::KeepAlive => "keep-alive",
            OobMessage::DisconnectRequest(_) => "disconnect request",
            OobMessage::KickRequest(_) => "kick request",
            OobMessage::ChangeSendFrequencyRequest(_) => "change send frequency request",
            OobMessage::ValidateConnectionRequest(_) => "validate connection request",
            OobMessage::ValidateConnectionResponse(_) => "validate connection response",
        };
        f.write_str(name)
    }
}

impl Bytes for ConnectRequest {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(self.connection_type.to_u8())?;
        writer.write_u16::<LittleEndian>(self.mtu)?;
        write_payload(writer, &self.user_payload)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            connection_type: ConnectionType::from_u8(reader.read_u8()?)?,
            mtu: reader.read_u16::<LittleEndian>()?,
            user_payload: read_payload(reader)?,
        })
    }
}

impl Bytes for ConnectResponse {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u16::<LittleEndian>(self.mtu)?;
        writer.write_u16::<LittleEndian>(self.send_frequency)?;
        writer.write_u32::<LittleEndian>(self.client_id)?;
        write_payload(writer, &self.host_payload)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            mtu: reader.read_u16::<LittleEndian>()?,
            send_frequency: reader.read_u16::<LittleEndian>()?,
            client_id: reader.read_u32::<LittleEndian>()?,
            host_payload: read_payload(reader)?,
        })
    }
}

impl Bytes for DisconnectRequest {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(self.reason.to_u8())?;
        write_payload(writer, &self.host_payload)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            reason: ConnectionCloseReason::from_u8(reader.read_u8()?),
            host_payload: read_payload(reader)?,
        })
    }
}

impl Bytes for KickRequest {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u32::<LittleEndian>(self.client_id)?;
        write_payload(writer, &self.host_payload)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_id: reader.read_u32::<LittleEndian>()?,
            host_payload: read_payload(reader)?,
        })
    }
}

impl Bytes for ChangeSendFrequencyRequest {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u16::<LittleEndian>(self.rate)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            rate: reader.read_u16::<LittleEndian>()?,
        })
    }
}

impl Bytes for ValidateConnectionRequest {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u32::<LittleEndian>(self.client_id)?;
        write_payload(writer, &self.user_payload)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_id: reader.read_u32::<LittleEndian>()?,
            user_payload: read_payload(reader)?,
        })
    }
}

impl Bytes for ValidateConnectionResponse {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u32::<LittleEndian>(self.client_id)?;
        writer.write_u8(u8::from(self.accepted))?;
        write_payload(writer, &self.host_payload)
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_id: reader.read_u32::<LittleEndian>()?,
            accepted: reader.read_u8()? != 0,
            host_payload: read_payload(reader)?,
        })
    }
}
