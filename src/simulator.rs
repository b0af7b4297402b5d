use std::{
    collections::{HashMap, VecDeque},
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use byteorder::ReadBytesExt;
use rand::Rng;

use crate::{
    oob::{ClientId, ConnectResponse, OobMessage},
    outgoing::DeliveryInfo,
    packet::PacketMode,
    sequence::SequenceId,
    session::ConnectSettings,
    tend::{Tend, TendHeader},
    transport::{Transport, TransportEvent, TransportState},
};

/// Marker written over the transport header region of every simulated datagram.
const HEADER_FILL: u8 = 0xEE;

#[derive(Debug, Clone)]
pub struct PacketEntry {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub packet: Vec<u8>,
}

pub struct Channel {
    pub tx: Sender<PacketEntry>,
    pub rx: Receiver<PacketEntry>,
}

pub type RoutingTable = Arc<Mutex<HashMap<u16, Channel>>>;

fn lock_table(table: &RoutingTable) -> MutexGuard<'_, HashMap<u16, Channel>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fn register(table: &RoutingTable, port: u16) {
    let (tx, rx) = mpsc::channel::<PacketEntry>();
    lock_table(table).insert(port, Channel { tx, rx });
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationConfig {
    pub packet_loss_percent: f64,
    /// Bytes reserved for the transport at the front of every datagram.
    pub header_size: usize,
}

#[derive(Debug, Default)]
struct ControlState {
    events: VecDeque<TransportEvent>,
    manual_open: bool,
    blocked: bool,
    recv_error: Option<String>,
    opens: usize,
    closes: usize,
    prepared: usize,
}

/// Test handle shared with every transport a session creates, used to inject faults
/// and observe how the session drives its transport.
#[derive(Debug, Clone, Default)]
pub struct SimControl(Arc<Mutex<ControlState>>);

impl SimControl {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn push_event(&self, event: TransportEvent) {
        self.lock().events.push_back(event);
    }
    /// When set, `open` leaves the transport opening until an `Opened` event is pushed.
    pub fn set_manual_open(&self, manual: bool) {
        self.lock().manual_open = manual;
    }
    pub fn set_blocked(&self, blocked: bool) {
        self.lock().blocked = blocked;
    }
    pub fn fail_next_recv(&self, msg: &str) {
        self.lock().recv_error = Some(msg.to_string());
    }
    pub fn opens(&self) -> usize {
        self.lock().opens
    }
    pub fn closes(&self) -> usize {
        self.lock().closes
    }
    pub fn prepared(&self) -> usize {
        self.lock().prepared
    }
}

/// In-memory transport routed through a shared table of channels.
pub struct NetworkSimulator {
    port: u16,
    cfg: SimulationConfig,
    routing_table: RoutingTable,
    control: SimControl,
    peer: Option<SocketAddr>,
    state: TransportState,
}

impl NetworkSimulator {
    pub fn routing_table() -> RoutingTable {
        Arc::new(Mutex::new(HashMap::new()))
    }
    pub fn new(port: u16, table: RoutingTable, cfg: SimulationConfig) -> Self {
        Self::with_control(port, table, cfg, SimControl::default())
    }
    pub fn with_control(
        port: u16,
        table: RoutingTable,
        cfg: SimulationConfig,
        control: SimControl,
    ) -> Self {
        register(&table, port);
        Self {
            port,
            cfg,
            routing_table: table,
            control,
            peer: None,
            state: TransportState::Closed,
        }
    }
    pub fn addr(&self) -> SocketAddr {
        local_addr(self.port)
    }
}

impl Transport for NetworkSimulator {
    type IntoError = io::Error;

    fn open(&mut self, endpoint: SocketAddr, _settings: &ConnectSettings) -> io::Result<()> {
        self.peer = Some(endpoint);
        let mut control = self.control.lock();
        control.opens += 1;
        if control.manual_open {
            self.state = TransportState::Opening;
        } else {
            self.state = TransportState::Open;
            control.events.push_back(TransportEvent::Opened);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let event = self.control.lock().events.pop_front()?;
        match event {
            TransportEvent::Opened => self.state = TransportState::Open,
            TransportEvent::Error(_) => self.state = TransportState::Closed,
        }
        Some(event)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (Some(peer), TransportState::Open) = (self.peer, self.state) else {
            return Err(io::Error::new(ErrorKind::NotConnected, "simulator is not open"));
        };
        if self.cfg.packet_loss_percent > 0.0
            && rand::thread_rng().gen_range(0.0..100.0) < self.cfg.packet_loss_percent
        {
            return Ok(buf.len());
        }
        let mut packet = buf.to_vec();
        for byte in packet.iter_mut().take(self.cfg.header_size) {
            *byte = HEADER_FILL;
        }
        let table = lock_table(&self.routing_table);
        let Some(tx) = table.get(&peer.port()).map(|c| &c.tx) else {
            return Ok(0);
        };
        tx.send(PacketEntry {
            from: self.addr(),
            to: peer,
            packet,
        })
        .ok();
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if let Some(msg) = self.control.lock().recv_error.take() {
            return Err(io::Error::new(ErrorKind::Other, msg));
        }
        let table = lock_table(&self.routing_table);
        let Some(rx) = table.get(&self.port).map(|c| &c.rx) else {
            return Ok(None);
        };
        let Ok(entry) = rx.try_recv() else {
            return Ok(None);
        };
        if entry.to != self.addr() {
            return Err(io::Error::new(
                ErrorKind::Other,
                "received packet for wrong address",
            ));
        }
        let len = entry.packet.len().min(buf.len());
        buf[..len].copy_from_slice(&entry.packet[..len]);
        Ok(Some(len))
    }

    fn prepare_disconnect(&mut self) {
        self.control.lock().prepared += 1;
    }

    fn close(&mut self) {
        self.state = TransportState::Closed;
        self.control.lock().closes += 1;
    }

    fn can_send(&self) -> bool {
        self.state == TransportState::Open && !self.control.lock().blocked
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn header_size(&self) -> usize {
        self.cfg.header_size
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// A datagram as seen by the [`TestHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPacket {
    pub header: TendHeader,
    pub message: Option<OobMessage>,
    pub payload: Vec<u8>,
}

impl HostPacket {
    pub fn packet_id(&self) -> Option<SequenceId> {
        match self.header {
            TendHeader::Reliable(header) => Some(header.packet_id),
            TendHeader::Unreliable => None,
        }
    }
}

/// Scripted server side of a session: speaks the wire protocol with its own [`Tend`].
pub struct TestHost {
    port: u16,
    header_size: usize,
    routing_table: RoutingTable,
    client: Option<SocketAddr>,
    pub tend: Tend,
}

impl TestHost {
    pub fn new(port: u16, table: RoutingTable, header_size: usize) -> Self {
        register(&table, port);
        Self {
            port,
            header_size,
            routing_table: table,
            client: None,
            tend: Tend::new(),
        }
    }
    pub fn addr(&self) -> SocketAddr {
        local_addr(self.port)
    }
    /// Drains every datagram addressed to the host without processing it.
    pub fn recv_raw(&mut self) -> Vec<Vec<u8>> {
        let table = lock_table(&self.routing_table);
        let Some(channel) = table.get(&self.port) else {
            return Vec::new();
        };
        let mut datagrams = Vec::new();
        while let Ok(entry) = channel.rx.try_recv() {
            assert_eq!(entry.to, self.addr());
            assert!(entry.packet[..self.header_size]
                .iter()
                .all(|&b| b == HEADER_FILL));
            self.client = Some(entry.from);
            datagrams.push(entry.packet);
        }
        datagrams
    }
    /// Parses a datagram without feeding it to the host's reliability engine.
    pub fn decode(&self, datagram: &[u8]) -> HostPacket {
        let mut reader = io::Cursor::new(&datagram[self.header_size..]);
        let header = TendHeader::read(&mut reader).unwrap();
        Self::decode_body(header, &mut reader)
    }
    /// Processes a datagram like a server would. `None` if the reliability layer dropped it.
    pub fn accept(&mut self, datagram: &[u8]) -> Option<HostPacket> {
        let mut reader = io::Cursor::new(&datagram[self.header_size..]);
        let received = self.tend.read_header(&mut reader).ok()?;
        Some(Self::decode_body(received.header, &mut reader))
    }
    fn decode_body(header: TendHeader, reader: &mut io::Cursor<&[u8]>) -> HostPacket {
        let mode = PacketMode::from_u8(reader.read_u8().unwrap()).unwrap();
        let message = match mode {
            PacketMode::OutOfBand => Some(OobMessage::read(reader).unwrap()),
            PacketMode::Normal => None,
        };
        let start = reader.position() as usize;
        HostPacket {
            header,
            message,
            payload: reader.get_ref()[start..].to_vec(),
        }
    }
    pub fn recv(&mut self) -> Vec<HostPacket> {
        self.recv_raw()
            .iter()
            .filter_map(|datagram| self.accept(datagram))
            .collect()
    }
    pub fn deliveries(&mut self) -> Vec<DeliveryInfo> {
        std::iter::from_fn(|| self.tend.dequeue_delivery()).collect()
    }
    /// Encodes a datagram for the client, advancing the host's sequence if reliable.
    pub fn build(&mut self, mode: PacketMode, reliable: bool, body: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0u8; self.header_size];
        let sequence_id = self.tend.outgoing_sequence_id();
        self.tend.write_header(&mut datagram, reliable).unwrap();
        datagram.push(mode as u8);
        datagram.extend_from_slice(body);
        self.tend.on_packet_sent(sequence_id, reliable);
        datagram
    }
    pub fn deliver(&self, datagram: Vec<u8>) {
        let client = self.client.expect("the client has not sent anything yet");
        let table = lock_table(&self.routing_table);
        if let Some(channel) = table.get(&client.port()) {
            channel
                .tx
                .send(PacketEntry {
                    from: self.addr(),
                    to: client,
                    packet: datagram,
                })
                .unwrap();
        }
    }
    pub fn send_oob(&mut self, message: &OobMessage, reliable: bool) {
        let mut body = Vec::new();
        message.write(&mut body).unwrap();
        let datagram = self.build(PacketMode::OutOfBand, reliable, &body);
        self.deliver(datagram);
    }
    pub fn send_payload(&mut self, payload: &[u8], reliable: bool) {
        let datagram = self.build(PacketMode::Normal, reliable, payload);
        self.deliver(datagram);
    }
    /// Answers a connect request and starts processing reliable packets.
    pub fn accept_connection(&mut self, mtu: u16, send_frequency: u16, client_id: ClientId) {
        let response = ConnectResponse {
            mtu,
            send_frequency,
            client_id,
            host_payload: b"welcome".to_vec(),
        };
        self.send_oob(&OobMessage::ConnectResponse(response), false);
        self.tend.set_connected(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::Error,
        oob::{
            ChangeSendFrequencyRequest, ConnectRequest, ConnectionCloseReason, ConnectionType,
            DisconnectRequest, KickRequest, ValidateConnectionRequest, ValidateConnectionResponse,
        },
        packet::InPacket,
        session::{Session, SessionConfig, SessionState},
    };

    const CLIENT_PORT: u16 = 40000;
    const HOST_PORT: u16 = 50000;
    const HEADER_SIZE: usize = 4;

    fn enable_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Debug, Default)]
    struct Events {
        state_changes: Vec<(SessionState, SessionState)>,
        connects: Vec<ClientId>,
        disconnects: Vec<ConnectionCloseReason>,
        errors: Vec<String>,
        deliveries: Vec<DeliveryInfo>,
    }

    fn recording_config() -> SessionConfig<Events> {
        SessionConfig::with_context(Events::default())
            .keep_alive_interval(None)
            .on_state_change(|from, to, events: &mut Events| events.state_changes.push((from, to)))
            .on_connect(|client_id, events| events.connects.push(client_id))
            .on_disconnect(|reason, events| events.disconnects.push(reason))
            .on_error(|err, events| events.errors.push(err.to_string()))
            .on_delivery_info(|info, events| events.deliveries.push(info))
    }

    fn setup<Ctx>(
        cfg: SessionConfig<Ctx>,
        sim: SimulationConfig,
    ) -> (Session<NetworkSimulator, Ctx>, TestHost, SimControl) {
        enable_logging();
        let table = NetworkSimulator::routing_table();
        let control = SimControl::default();
        let host = TestHost::new(HOST_PORT, table.clone(), sim.header_size);
        let factory_control = control.clone();
        let session = Session::with_config(
            move || {
                NetworkSimulator::with_control(
                    CLIENT_PORT,
                    table.clone(),
                    sim,
                    factory_control.clone(),
                )
            },
            cfg,
        );
        (session, host, control)
    }

    fn sim_config() -> SimulationConfig {
        SimulationConfig {
            packet_loss_percent: 0.0,
            header_size: HEADER_SIZE,
        }
    }

    /// Runs the handshake at time zero.
    fn connect<Ctx>(
        session: &mut Session<NetworkSimulator, Ctx>,
        host: &mut TestHost,
        connection_type: ConnectionType,
        settings: ConnectSettings,
    ) {
        session.connect(host.addr(), connection_type, settings).unwrap();
        session.update(0.0);
        let received = host.recv();
        assert!(matches!(
            received.last().and_then(|p| p.message.as_ref()),
            Some(OobMessage::ConnectRequest(_))
        ));
        host.accept_connection(1280, 20, 7);
        let mut packets = Vec::new();
        session.receive(&mut packets).unwrap();
        assert!(packets.is_empty());
        assert_eq!(session.state(), SessionState::Connected);
    }

    fn receive<Ctx>(session: &mut Session<NetworkSimulator, Ctx>) -> Vec<InPacket> {
        let mut packets = Vec::new();
        session.receive(&mut packets).unwrap();
        packets
    }

    #[test]
    fn handshake_adopts_server_parameters() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        let settings = ConnectSettings::default()
            .mtu(1400)
            .user_payload(b"player".to_vec());
        session
            .connect(host.addr(), ConnectionType::Client, settings)
            .unwrap();
        assert_eq!(session.state(), SessionState::Opening);
        session.update(0.0);
        assert_eq!(session.state(), SessionState::Connecting);

        let received = host.recv();
        assert_eq!(received.len(), 1);
        assert!(!received[0].header.is_reliable());
        assert_eq!(
            received[0].message,
            Some(OobMessage::ConnectRequest(ConnectRequest {
                connection_type: ConnectionType::Client,
                mtu: 1400,
                user_payload: b"player".to_vec(),
            }))
        );

        host.accept_connection(1280, 20, 7);
        receive(&mut session);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.client_id(), Some(7));
        assert_eq!(session.connection_mtu(), 1280);
        assert_eq!(session.send_frequency(), 20);
        assert_eq!(session.host_payload(), b"welcome");
        assert_eq!(session.context().connects, vec![7]);
        assert_eq!(
            session.context().state_changes,
            vec![
                (SessionState::Disconnected, SessionState::Opening),
                (SessionState::Opening, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Connected),
            ]
        );

        // a late duplicate of the response changes nothing
        host.accept_connection(1500, 60, 8);
        receive(&mut session);
        assert_eq!(session.client_id(), Some(7));
        assert_eq!(session.context().connects, vec![7]);
        assert_eq!(control.opens(), 1);
    }

    #[test]
    fn connect_request_is_repeated_until_answered() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        session
            .connect(host.addr(), ConnectionType::Client, ConnectSettings::default())
            .unwrap();
        session.update(0.0);
        assert_eq!(host.recv().len(), 1);
        session.update(0.01);
        assert!(host.recv().is_empty());
        session.update(0.06);
        let received = host.recv();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            received[0].message,
            Some(OobMessage::ConnectRequest(_))
        ));
    }

    #[test]
    fn connect_while_connecting_fails() {
        let (mut session, host, _) = setup(recording_config(), sim_config());
        session
            .connect(host.addr(), ConnectionType::Client, ConnectSettings::default())
            .unwrap();
        assert!(matches!(
            session.connect(host.addr(), ConnectionType::Simulator, ConnectSettings::default()),
            Err(Error::AlreadyConnected)
        ));
        assert_eq!(session.state(), SessionState::Opening);
        session.update(0.0);
        assert!(matches!(
            session.connect(host.addr(), ConnectionType::Client, ConnectSettings::default()),
            Err(Error::AlreadyConnected)
        ));
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.connection_type(), ConnectionType::Client);

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.disconnect();
        assert_eq!(
            session.context().disconnects,
            vec![ConnectionCloseReason::Disconnected]
        );
    }

    #[test]
    fn transport_stays_opening_until_opened() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        control.set_manual_open(true);
        session
            .connect(host.addr(), ConnectionType::Client, ConnectSettings::default())
            .unwrap();
        session.update(0.0);
        assert_eq!(session.state(), SessionState::Opening);
        assert!(host.recv_raw().is_empty());

        control.push_event(TransportEvent::Opened);
        session.update(0.1);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(host.recv().len(), 1);
    }

    #[test]
    fn change_send_frequency_is_clamped() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        host.send_oob(
            &OobMessage::ChangeSendFrequencyRequest(ChangeSendFrequencyRequest { rate: 0 }),
            true,
        );
        receive(&mut session);
        assert_eq!(session.send_frequency(), 1);

        host.send_oob(
            &OobMessage::ChangeSendFrequencyRequest(ChangeSendFrequencyRequest { rate: 60 }),
            false,
        );
        receive(&mut session);
        assert_eq!(session.send_frequency(), 60);
    }

    #[test]
    fn packets_before_connected_are_discarded() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        session
            .connect(host.addr(), ConnectionType::Client, ConnectSettings::default())
            .unwrap();
        session.update(0.0);
        host.recv();

        host.send_payload(b"early", false);
        host.send_payload(b"early reliable", true);
        assert!(receive(&mut session).is_empty());
        assert_eq!(session.state(), SessionState::Connecting);

        host.accept_connection(1280, 20, 7);
        host.send_payload(b"late", false);
        let packets = receive(&mut session);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), b"late");
        assert!(!packets[0].is_reliable());
        assert!(!packets[0].is_oob());
        assert_eq!(packets[0].peer_addr(), host.addr());

        host.send_payload(b"reliable", true);
        let packets = receive(&mut session);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sequence_id(), Some(SequenceId::new(1)));
        assert_eq!(packets[0].payload(), b"reliable");
    }

    #[test]
    fn reliable_deliveries_are_reported_in_order() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        for i in 0..5u8 {
            let mut packet = session.create_packet(true).unwrap();
            assert_eq!(packet.sequence_id(), SequenceId::new(u16::from(i)));
            io::Write::write_all(&mut packet, &[i]).unwrap();
            session.send(packet).unwrap();
        }
        let received = host.recv();
        let payloads: Vec<_> = received.iter().map(|p| p.payload.clone()).collect();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);

        host.send_oob(&OobMessage::Ack, true);
        receive(&mut session);
        host.send_oob(&OobMessage::Ack, true);
        receive(&mut session);

        let deliveries = &session.context().deliveries;
        assert_eq!(deliveries.len(), 5);
        for (i, info) in deliveries.iter().enumerate() {
            assert_eq!(info.sequence_id, SequenceId::new(i as u16));
            assert!(info.was_delivered);
        }
    }

    #[test]
    fn unacknowledged_packet_is_resent_verbatim() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        let mut packet = session.create_packet(true).unwrap();
        io::Write::write_all(&mut packet, b"hello").unwrap();
        session.send(packet).unwrap();
        let original = host.recv_raw();
        assert_eq!(original.len(), 1);

        session.update(0.1);
        let resent = host.recv_raw();
        assert_eq!(resent, original);

        // the resend did not consume a sequence id
        let next = session.create_packet(true).unwrap();
        assert_eq!(next.sequence_id(), SequenceId::new(1));
    }

    #[test]
    fn lost_oob_message_is_sent_again() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Simulator,
            ConnectSettings::default(),
        );
        session.update(0.1);
        session.send_kick_request(9, b"afk".to_vec()).unwrap();
        let mut packet = session.create_packet(true).unwrap();
        io::Write::write_all(&mut packet, b"state").unwrap();
        session.send(packet).unwrap();

        let raw = host.recv_raw();
        assert_eq!(raw.len(), 3);
        assert_eq!(host.accept(&raw[0]).unwrap().message, Some(OobMessage::Ack));
        // raw[1], the kick request, is lost on the way
        assert_eq!(host.accept(&raw[2]).unwrap().payload, b"state");

        host.send_oob(&OobMessage::Ack, true);
        receive(&mut session);
        let deliveries: Vec<_> = session
            .context()
            .deliveries
            .iter()
            .map(|info| (info.sequence_id.value(), info.was_delivered))
            .collect();
        assert_eq!(deliveries, vec![(0, true), (1, false), (2, true)]);

        let resent = host.recv_raw();
        assert_eq!(resent.len(), 1);
        let packet = host.decode(&resent[0]);
        assert_eq!(packet.packet_id(), Some(SequenceId::new(3)));
        assert_eq!(
            packet.message,
            Some(OobMessage::KickRequest(KickRequest {
                client_id: 9,
                host_payload: b"afk".to_vec(),
            }))
        );
    }

    #[test]
    fn lost_ack_is_not_sent_again() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        session.update(0.1);
        let mut packet = session.create_packet(true).unwrap();
        io::Write::write_all(&mut packet, b"state").unwrap();
        session.send(packet).unwrap();

        let raw = host.recv_raw();
        assert_eq!(raw.len(), 2);
        host.accept(&raw[1]).unwrap();
        host.send_oob(&OobMessage::Ack, true);
        receive(&mut session);
        assert_eq!(
            session.context().deliveries[0],
            DeliveryInfo {
                sequence_id: SequenceId::new(0),
                was_delivered: false
            }
        );
        assert!(host.recv_raw().is_empty());
    }

    #[test]
    fn only_simulators_may_kick() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        assert!(matches!(
            session.send_kick_request(3, Vec::new()),
            Err(Error::KickNotAllowed(ConnectionType::Client))
        ));
        assert!(host.recv_raw().is_empty());
    }

    #[test]
    fn window_overflow_fails_packet_creation() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        for _ in 0..crate::consts::WINDOW_SIZE {
            let packet = session.create_packet(true).unwrap();
            session.send(packet).unwrap();
        }
        assert!(matches!(
            session.create_packet(true),
            Err(Error::Tend(crate::tend::Error::TooManyInFlight(32)))
        ));
        assert!(session.create_packet(false).is_ok());
        assert_eq!(session.state(), SessionState::Connected);

        assert_eq!(host.recv().len(), 32);
        host.send_oob(&OobMessage::Ack, true);
        receive(&mut session);
        assert_eq!(session.context().deliveries.len(), 32);
        let packet = session.create_packet(true).unwrap();
        assert_eq!(packet.sequence_id(), SequenceId::new(32));
    }

    #[test]
    fn packet_from_an_earlier_connection_is_rejected() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        let stale = session.create_packet(false).unwrap();
        session.disconnect();
        host.recv_raw();

        host.tend = Tend::new();
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        assert!(matches!(session.send(stale), Err(Error::StaleBuffer)));
        assert!(host.recv_raw().is_empty());
        let fresh = session.create_packet(false).unwrap();
        session.send(fresh).unwrap();
        assert_eq!(host.recv_raw().len(), 1);
    }

    #[test]
    fn reliable_packet_must_be_sent_before_the_next_is_created() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        let first = session.create_packet(true).unwrap();
        let second = session.create_packet(true).unwrap();
        assert_eq!(first.sequence_id(), second.sequence_id());
        session.send(first).unwrap();
        assert!(matches!(session.send(second), Err(Error::InvalidSequence)));
        assert_eq!(host.recv_raw().len(), 1);
    }

    #[test]
    fn ping_follows_the_round_trip_of_reliable_packets() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default().ping_interval(0.0),
        );
        session.update(0.1);
        let sent = host.recv();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_id(), Some(SequenceId::new(0)));

        // advance the clock without sending anything
        control.set_blocked(true);
        session.update(0.15);
        control.set_blocked(false);
        assert!(host.recv_raw().is_empty());

        host.send_oob(&OobMessage::Ack, true);
        receive(&mut session);
        assert_eq!(session.ping().latest_ms, 0.0);

        session.update(0.2);
        let ping = session.ping();
        assert!((ping.latest_ms - 25.0).abs() < 1e-6);
        assert!((ping.average_ms - 25.0).abs() < 1e-6);
        assert_eq!(ping.jitter_ms, 0.0);
    }

    fn validation_response(host: &mut TestHost) -> Option<ValidateConnectionResponse> {
        host.recv().into_iter().find_map(|p| match p.message {
            Some(OobMessage::ValidateConnectionResponse(response)) => Some(response),
            _ => None,
        })
    }

    #[test]
    fn validation_requests_are_accepted_by_default() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        host.send_oob(
            &OobMessage::ValidateConnectionRequest(ValidateConnectionRequest {
                client_id: 12,
                user_payload: b"token".to_vec(),
            }),
            true,
        );
        receive(&mut session);
        assert!(host.recv_raw().is_empty());

        session.update(0.1);
        assert_eq!(
            validation_response(&mut host),
            Some(ValidateConnectionResponse {
                client_id: 12,
                accepted: true,
                host_payload: Vec::new(),
            })
        );
    }

    #[test]
    fn validation_may_be_answered_from_another_thread() {
        let cfg = SessionConfig::with_context(())
            .keep_alive_interval(None)
            .on_validate_connection_request(|request, responder, _| {
                assert_eq!(request.user_payload, b"token");
                std::thread::spawn(move || responder.reject(b"banned".to_vec()))
                    .join()
                    .unwrap();
            });
        let (mut session, mut host, _) = setup(cfg, sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        host.send_oob(
            &OobMessage::ValidateConnectionRequest(ValidateConnectionRequest {
                client_id: 5,
                user_payload: b"token".to_vec(),
            }),
            true,
        );
        receive(&mut session);
        session.update(0.1);
        assert_eq!(
            validation_response(&mut host),
            Some(ValidateConnectionResponse {
                client_id: 5,
                accepted: false,
                host_payload: b"banned".to_vec(),
            })
        );
    }

    #[test]
    fn server_disconnect_closes_the_session() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        host.send_oob(
            &OobMessage::DisconnectRequest(DisconnectRequest {
                reason: ConnectionCloseReason::Kicked,
                host_payload: b"bye".to_vec(),
            }),
            true,
        );
        host.send_payload(b"after", false);
        assert!(receive(&mut session).is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.client_id(), None);
        assert_eq!(
            session.context().disconnects,
            vec![ConnectionCloseReason::Kicked]
        );
        assert_eq!(session.context().errors.len(), 1);
        assert!(session.context().errors[0].contains("Kicked"));
        assert_eq!(control.closes(), 1);
        // the peer initiated, so nothing is sent back
        assert_eq!(control.prepared(), 0);
        assert!(host.recv_raw().is_empty());

        // the session is immediately reusable
        host.tend = Tend::new();
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        assert_eq!(control.opens(), 2);
    }

    #[test]
    fn suppressed_connection_errors_still_disconnect() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default().suppress_connection_errors(true),
        );
        host.send_oob(
            &OobMessage::DisconnectRequest(DisconnectRequest {
                reason: ConnectionCloseReason::ServerShutdown,
                host_payload: Vec::new(),
            }),
            false,
        );
        receive(&mut session);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.context().errors.is_empty());
        assert_eq!(
            session.context().disconnects,
            vec![ConnectionCloseReason::ServerShutdown]
        );
    }

    #[test]
    fn local_disconnect_notifies_server() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(control.prepared(), 1);
        assert_eq!(control.closes(), 1);
        let received = host.recv();
        assert_eq!(received.len(), 1);
        assert!(received[0].header.is_reliable());
        assert_eq!(
            received[0].message,
            Some(OobMessage::DisconnectRequest(DisconnectRequest {
                reason: ConnectionCloseReason::Disconnected,
                host_payload: Vec::new(),
            }))
        );
        assert!(session.context().errors.is_empty());
        assert!(matches!(session.create_packet(false), Err(Error::NotConnected)));
    }

    #[test]
    fn session_times_out_without_traffic() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default().disconnect_timeout(2.0),
        );
        session.update(1.9);
        host.send_oob(&OobMessage::KeepAlive, false);
        receive(&mut session);
        session.update(3.0);
        assert_eq!(session.state(), SessionState::Connected);

        session.update(4.0);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.context().disconnects,
            vec![ConnectionCloseReason::Timeout]
        );
        assert_eq!(session.context().errors.len(), 1);
    }

    #[test]
    fn disabled_timeout_never_fires() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default().disconnect_timeout(0.0),
        );
        session.update(1_000_000.0);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn transport_error_disconnects() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        control.push_event(TransportEvent::Error("network unreachable".into()));
        session.update(0.1);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.context().disconnects,
            vec![ConnectionCloseReason::TransportError]
        );
        assert!(session.context().errors[0].contains("network unreachable"));
        assert_eq!(control.prepared(), 0);
    }

    #[test]
    fn receive_error_disconnects() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        control.fail_next_recv("connection reset");
        let mut packets = Vec::new();
        assert!(session.receive(&mut packets).is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.context().disconnects,
            vec![ConnectionCloseReason::TransportError]
        );
    }

    #[test]
    fn blocked_transport_skips_the_tick() {
        let (mut session, mut host, control) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        control.set_blocked(true);
        session.update(0.1);
        assert!(host.recv_raw().is_empty());
        control.set_blocked(false);
        session.update(0.1);
        let received = host.recv();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, Some(OobMessage::Ack));
    }

    #[test]
    fn malformed_packets_are_dropped() {
        let (mut session, mut host, _) = setup(recording_config(), sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        host.deliver(vec![0u8; 2]);
        host.deliver(vec![0, 0, 0, 0, 0, 7]);
        host.deliver(vec![0, 0, 0, 0, 0x80, 1]);
        host.send_oob(&OobMessage::KeepAlive, false);
        host.send_payload(b"still here", false);
        let packets = receive(&mut session);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload(), b"still here");
    }

    #[test]
    fn keep_alive_worker_sends_while_idle() {
        let cfg = SessionConfig::with_context(()).keep_alive_interval(Some(0.01));
        let (mut session, mut host, _) = setup(cfg, sim_config());
        connect(
            &mut session,
            &mut host,
            ConnectionType::Client,
            ConnectSettings::default(),
        );
        let mut keep_alive = None;
        for _ in 0..200 {
            keep_alive = host
                .recv()
                .into_iter()
                .find(|p| p.message == Some(OobMessage::KeepAlive));
            if keep_alive.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let keep_alive = keep_alive.unwrap();
        assert!(!keep_alive.header.is_reliable());

        session.disconnect();
        host.recv_raw();
        std::thread::sleep(Duration::from_millis(50));
        assert!(host.recv_raw().is_empty());
    }

    #[test]
    fn lossy_network_keeps_a_single_packet_in_flight() {
        let sim = SimulationConfig {
            packet_loss_percent: 25.0,
            header_size: HEADER_SIZE,
        };
        let (mut session, mut host, _) = setup(recording_config(), sim);
        session
            .connect(host.addr(), ConnectionType::Client, ConnectSettings::default())
            .unwrap();
        let delta = 0.05;
        let mut time = 0.0;
        for _ in 0..300 {
            session.update(time);
            for packet in host.recv() {
                if let Some(OobMessage::ConnectRequest(_)) = packet.message {
                    if !host.tend.is_connected() {
                        host.accept_connection(1280, 20, 7);
                    }
                }
            }
            if host.tend.is_connected() && host.tend.outgoing().can_increment_outgoing_sequence() {
                host.send_oob(&OobMessage::Ack, true);
            }
            receive(&mut session);
            time += delta;
        }
        assert_eq!(session.state(), SessionState::Connected);
        let deliveries = &session.context().deliveries;
        assert!(deliveries.len() > 50);
        assert!(deliveries.iter().all(|info| info.was_delivered));
        for pair in deliveries.windows(2) {
            assert_eq!(pair[0].sequence_id.next(), pair[1].sequence_id);
        }
    }
}
