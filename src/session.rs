use std::{
    io,
    net::SocketAddr,
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use byteorder::ReadBytesExt;

use crate::{
    ack_queue::OobAckQueue,
    consts::{
        DEFAULT_DISCONNECT_TIMEOUT_SEC, DEFAULT_KEEP_ALIVE_INTERVAL_SEC, DEFAULT_MTU,
        DEFAULT_PING_INTERVAL_SEC, DEFAULT_SEND_FREQUENCY, MAX_MTU, MIN_MTU,
    },
    error::{Error, Result},
    keep_alive::KeepAlive,
    latency::{LatencyTracker, Ping},
    oob::{
        ClientId, ConnectRequest, ConnectResponse, ConnectionCloseReason, ConnectionType,
        DisconnectRequest, KickRequest, OobMessage, ValidateConnectionRequest,
        ValidateConnectionResponse,
    },
    outgoing::DeliveryInfo,
    pacing::SendPacer,
    packet::{InPacket, OutPacket, PacketMode},
    pool::BufferPool,
    sequence::SequenceId,
    socket::UdpTransport,
    tend::{Tend, TendHeader},
    transport::{lock, Transport, TransportEvent, TransportState},
};

const MAX_POOLED_BUFFERS: usize = 64;

type StateCallback<Ctx> =
    Box<dyn FnMut(SessionState, SessionState, &mut Ctx) + Send + Sync + 'static>;
type ConnectCallback<Ctx> = Box<dyn FnMut(ClientId, &mut Ctx) + Send + Sync + 'static>;
type DisconnectCallback<Ctx> =
    Box<dyn FnMut(ConnectionCloseReason, &mut Ctx) + Send + Sync + 'static>;
type ErrorCallback<Ctx> = Box<dyn FnMut(&Error, &mut Ctx) + Send + Sync + 'static>;
type DeliveryCallback<Ctx> = Box<dyn FnMut(DeliveryInfo, &mut Ctx) + Send + Sync + 'static>;
type ValidateCallback<Ctx> = Box<
    dyn FnMut(&ValidateConnectionRequest, ValidationResponder, &mut Ctx) + Send + Sync + 'static,
>;
type TransportFactory<T> = Box<dyn FnMut() -> T + Send + 'static>;

/// Settings for a single connection attempt.
///
/// # Example
/// ```
/// use brisk::ConnectSettings;
///
/// let settings = ConnectSettings::default()
///     .mtu(1200)
///     .disconnect_timeout(5.0)
///     .user_payload(b"player-1".to_vec());
/// assert_eq!(settings.get_mtu(), 1200);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectSettings {
    mtu: usize,
    disconnect_timeout: f64,
    ping_interval: f64,
    debug_stream: bool,
    suppress_connection_errors: bool,
    user_payload: Vec<u8>,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT_SEC,
            ping_interval: DEFAULT_PING_INTERVAL_SEC,
            debug_stream: false,
            suppress_connection_errors: false,
            user_payload: Vec::new(),
        }
    }
}

impl ConnectSettings {
    /// Set the MTU requested from the server, clamped to [`MIN_MTU`]..=[`MAX_MTU`].
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.clamp(MIN_MTU, MAX_MTU);
        self
    }
    /// Set how long the session waits for the peer before giving up, in seconds.
    /// A value of zero or less disables the timeout. The default is 15 seconds.
    pub fn disconnect_timeout(mut self, seconds: f64) -> Self {
        self.disconnect_timeout = seconds;
        self
    }
    /// Set how often the [`Ping`] snapshot is refreshed, in seconds.
    pub fn ping_interval(mut self, seconds: f64) -> Self {
        self.ping_interval = seconds;
        self
    }
    /// Log every datagram sent and received as a hex dump at trace level.
    pub fn debug_stream(mut self, enabled: bool) -> Self {
        self.debug_stream = enabled;
        self
    }
    /// Keep connection-level faults away from the error callback.
    /// The disconnect callback still fires.
    pub fn suppress_connection_errors(mut self, enabled: bool) -> Self {
        self.suppress_connection_errors = enabled;
        self
    }
    /// Set the payload forwarded to the server in the connect request.
    pub fn user_payload(mut self, payload: Vec<u8>) -> Self {
        self.user_payload = payload;
        self
    }
    pub fn get_mtu(&self) -> usize {
        self.mtu
    }
    pub fn get_disconnect_timeout(&self) -> f64 {
        self.disconnect_timeout
    }
    pub fn get_ping_interval(&self) -> f64 {
        self.ping_interval
    }
    pub fn get_user_payload(&self) -> &[u8] {
        &self.user_payload
    }
}

/// Configuration for a session: the user context and the listeners that receive it.
///
/// Callbacks run on the thread that drives the session, from inside
/// [`update`](Session::update), [`receive`](Session::receive), [`connect`](Session::connect)
/// or [`disconnect`](Session::disconnect). They must not block.
///
/// # Example
/// ```
/// use brisk::{SessionConfig, SessionState};
///
/// #[derive(Default)]
/// struct Stats {
///     connects: usize,
/// }
///
/// let cfg = SessionConfig::with_context(Stats::default())
///     .keep_alive_interval(None)
///     .on_connect(|_client_id, stats| stats.connects += 1)
///     .on_state_change(|from, to, _stats| {
///         if let (SessionState::Connecting, SessionState::Connected) = (from, to) {
///             println!("handshake complete");
///         }
///     });
/// ```
pub struct SessionConfig<Ctx> {
    context: Ctx,
    keep_alive_interval: Option<f64>,
    on_state_change: Option<StateCallback<Ctx>>,
    on_connect: Option<ConnectCallback<Ctx>>,
    on_disconnect: Option<DisconnectCallback<Ctx>>,
    on_error: Option<ErrorCallback<Ctx>>,
    on_delivery_info: Option<DeliveryCallback<Ctx>>,
    on_validate_connection_request: Option<ValidateCallback<Ctx>>,
}

impl Default for SessionConfig<()> {
    fn default() -> Self {
        SessionConfig::with_context(())
    }
}

impl<Ctx> SessionConfig<Ctx> {
    /// Create a new, default session configuration with no context.
    pub fn new() -> SessionConfig<()> {
        SessionConfig::<()>::default()
    }
    /// Create a new session configuration with context that will be passed to the callbacks.
    pub fn with_context(ctx: Ctx) -> Self {
        Self {
            context: ctx,
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL_SEC),
            on_state_change: None,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
            on_delivery_info: None,
            on_validate_connection_request: None,
        }
    }
    /// Set the keep-alive interval in seconds, or `None` to run without the keep-alive worker.
    /// The default is 1 second. An interval that is not a positive number of seconds
    /// also runs without the worker.
    pub fn keep_alive_interval(mut self, seconds: Option<f64>) -> Self {
        self.keep_alive_interval = seconds;
        self
    }
    pub fn on_state_change<F>(mut self, cb: F) -> Self
    where
        F: FnMut(SessionState, SessionState, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(cb));
        self
    }
    /// Called once per successful handshake with the id assigned by the server.
    pub fn on_connect<F>(mut self, cb: F) -> Self
    where
        F: FnMut(ClientId, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_connect = Some(Box::new(cb));
        self
    }
    pub fn on_disconnect<F>(mut self, cb: F) -> Self
    where
        F: FnMut(ConnectionCloseReason, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(cb));
        self
    }
    pub fn on_error<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&Error, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(cb));
        self
    }
    /// Called once for every reliable packet the server reported on, in sequence order.
    ///
    /// This includes the session's own reliable control packets (acks, kick requests and
    /// validation responses), which share the sequence space with application packets.
    pub fn on_delivery_info<F>(mut self, cb: F) -> Self
    where
        F: FnMut(DeliveryInfo, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_delivery_info = Some(Box::new(cb));
        self
    }
    /// Without this callback every validation request is accepted.
    pub fn on_validate_connection_request<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&ValidateConnectionRequest, ValidationResponder, &mut Ctx)
            + Send
            + Sync
            + 'static,
    {
        self.on_validate_connection_request = Some(Box::new(cb));
        self
    }
}

/// Answers one [`ValidateConnectionRequest`].
///
/// Responding consumes the responder, so an answer is given at most once. It may be
/// moved to and used from any thread; the answer is sent on the next
/// [`update`](Session::update). Dropping it without responding leaves the request unanswered.
#[derive(Debug)]
pub struct ValidationResponder {
    client_id: ClientId,
    tx: mpsc::Sender<ValidateConnectionResponse>,
}

impl ValidationResponder {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
    pub fn respond(self, accepted: bool, host_payload: Vec<u8>) {
        let response = ValidateConnectionResponse {
            client_id: self.client_id,
            accepted,
            host_payload,
        };
        if self.tx.send(response).is_err() {
            log::debug!(
                "connection closed before the validation of client {} was answered",
                self.client_id
            );
        }
    }
    pub fn accept(self, host_payload: Vec<u8>) {
        self.respond(true, host_payload)
    }
    pub fn reject(self, host_payload: Vec<u8>) {
        self.respond(false, host_payload)
    }
}

/// The states in the session state machine.
///
/// The initial state is `Disconnected`. [`connect`](Session::connect) moves to `Opening` while
/// the transport comes up, then to `Connecting` once it is open and the first connect request
/// has been sent. A connect response from the server completes the handshake.
///
/// While `Connected`:
///
///  - The application may create and send packets.
///  - The session sends an ack packet every pacing interval, or resends the last reliable
///    packet if the server has not reported on it yet.
///  - If nothing is received from the server within the disconnect timeout,
///    the session disconnects with [`ConnectionCloseReason::Timeout`].
///
/// Application packets received before `Connected` are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Waiting for the transport to open.
    Opening,
    /// Sending connect requests and waiting for the response.
    Connecting,
    Connected,
}

/// The client side of a connection to a replication server.
///
/// The session performs no IO on its own. It should be driven from one thread at a fixed rate
/// (e.g., 60Hz): [`update`](Session::update) first, then [`receive`](Session::receive).
///
/// # Example
/// ```no_run
/// use brisk::{ConnectSettings, ConnectionType, Session};
/// use std::time::{Duration, Instant};
///
/// let mut session = Session::new();
/// let server = "127.0.0.1:7777".parse().unwrap();
/// session
///     .connect(server, ConnectionType::Client, ConnectSettings::default())
///     .unwrap();
///
/// let start = Instant::now();
/// let mut received = Vec::new();
/// loop {
///     session.update(start.elapsed().as_secs_f64());
///     session.receive(&mut received).unwrap();
///     for packet in received.drain(..) {
///         println!("{} bytes from the server", packet.payload().len());
///     }
///     std::thread::sleep(Duration::from_millis(16));
/// }
/// ```
pub struct Session<T: Transport, Ctx = ()> {
    factory: TransportFactory<T>,
    transport: Option<Arc<Mutex<T>>>,
    tend: Option<Tend>,
    state: SessionState,
    connection_type: ConnectionType,
    settings: ConnectSettings,
    endpoint: Option<SocketAddr>,
    header_size: usize,
    pool: Arc<BufferPool>,
    pacer: SendPacer,
    latency: LatencyTracker,
    ack_queue: OobAckQueue,
    last_reliable: Option<(SequenceId, Vec<u8>)>,
    keep_alive: Option<KeepAlive>,
    validation_tx: mpsc::Sender<ValidateConnectionResponse>,
    validation_rx: mpsc::Receiver<ValidateConnectionResponse>,
    recv_buf: Vec<u8>,
    time: f64,
    last_receive_time: Option<f64>,
    client_id: Option<ClientId>,
    mtu: usize,
    host_payload: Vec<u8>,
    cfg: SessionConfig<Ctx>,
}

impl Session<UdpTransport> {
    /// Create a new session over UDP with a default configuration.
    pub fn new() -> Self {
        Session::with_config(UdpTransport::new, SessionConfig::default())
    }
}

impl Default for Session<UdpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Session<T> {
    /// Create a new session over a custom transport with a default configuration.
    ///
    /// `factory` is called once per [`connect`](Session::connect).
    pub fn with_transport<F>(factory: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Session::with_config(factory, SessionConfig::default())
    }
}

impl<T: Transport, Ctx> Session<T, Ctx> {
    /// Create a new session with a custom transport and configuration.
    /// See [`SessionConfig`] for the available callbacks.
    pub fn with_config<F>(factory: F, cfg: SessionConfig<Ctx>) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        let (validation_tx, validation_rx) = mpsc::channel();
        Self {
            factory: Box::new(factory),
            transport: None,
            tend: None,
            state: SessionState::Disconnected,
            connection_type: ConnectionType::Client,
            settings: ConnectSettings::default(),
            endpoint: None,
            header_size: 0,
            pool: BufferPool::new(DEFAULT_MTU, MAX_POOLED_BUFFERS),
            pacer: SendPacer::new(DEFAULT_SEND_FREQUENCY),
            latency: LatencyTracker::new(DEFAULT_PING_INTERVAL_SEC),
            ack_queue: OobAckQueue::new(),
            last_reliable: None,
            keep_alive: None,
            validation_tx,
            validation_rx,
            recv_buf: vec![0u8; MAX_MTU],
            time: 0.0,
            last_receive_time: None,
            client_id: None,
            mtu: DEFAULT_MTU,
            host_payload: Vec::new(),
            cfg,
        }
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
    /// The id the server assigned to this session, once connected.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }
    pub fn ping(&self) -> Ping {
        self.latency.ping()
    }
    /// Packets per second the session sends acks (or resends) at.
    pub fn send_frequency(&self) -> u16 {
        self.pacer.frequency()
    }
    /// The MTU negotiated with the server. Before the handshake completes this is the requested one.
    pub fn connection_mtu(&self) -> usize {
        self.mtu
    }
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }
    /// The validation payload the server sent with its connect response.
    pub fn host_payload(&self) -> &[u8] {
        &self.host_payload
    }
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }
    pub fn context(&self) -> &Ctx {
        &self.cfg.context
    }
    pub fn context_mut(&mut self) -> &mut Ctx {
        &mut self.cfg.context
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("session state changing from {:?} to {:?}", self.state, state);
        if let Some(ref mut cb) = self.cfg.on_state_change {
            cb(self.state, state, &mut self.cfg.context)
        }
        self.state = state;
    }
    fn report_error(&mut self, err: Error) {
        log::error!("{err}");
        if let Some(ref mut cb) = self.cfg.on_error {
            cb(&err, &mut self.cfg.context)
        }
    }
    fn report_connection_error(&mut self, err: Error) {
        if self.settings.suppress_connection_errors {
            log::debug!("suppressed connection error: {err}");
            return;
        }
        self.report_error(err);
    }

    /// Starts connecting to `endpoint`.
    ///
    /// This only opens the transport; the handshake runs on subsequent calls to
    /// [`update`](Session::update) and [`receive`](Session::receive).
    /// Fails with [`Error::AlreadyConnected`] unless the session is `Disconnected`,
    /// in which case nothing about the current connection changes.
    pub fn connect(
        &mut self,
        endpoint: SocketAddr,
        connection_type: ConnectionType,
        settings: ConnectSettings,
    ) -> Result<()> {
        if self.state != SessionState::Disconnected || self.transport.is_some() {
            return Err(Error::AlreadyConnected);
        }
        let mut transport = (self.factory)();
        if let Err(e) = transport.open(endpoint, &settings) {
            let err: Error = e.into();
            log::error!("failed to open transport to {endpoint}: {err}");
            return Err(err);
        }
        self.header_size = transport.header_size();
        self.transport = Some(Arc::new(Mutex::new(transport)));
        self.tend = Some(Tend::new());
        self.endpoint = Some(endpoint);
        self.connection_type = connection_type;
        self.mtu = settings.mtu;
        self.settings = settings;
        self.last_receive_time = None;
        self.set_state(SessionState::Opening);
        log::info!("session connecting to {endpoint} as {connection_type:?}");
        Ok(())
    }

    /// Disconnects from the server.
    ///
    /// If the transport is still open a disconnect request is sent first, on a best-effort basis.
    /// The session can be connected again right away. Does nothing when already `Disconnected`.
    pub fn disconnect(&mut self) {
        self.close(ConnectionCloseReason::Disconnected, true);
    }

    /// Advances the session clock and performs the periodic sends.
    pub fn update(&mut self, time: f64) {
        self.time = time;
        self.poll_transport();
        if self.state == SessionState::Disconnected {
            return;
        }
        let last_receive_time = *self.last_receive_time.get_or_insert(time);
        let timeout = self.settings.disconnect_timeout;
        if timeout > 0.0 && time - last_receive_time > timeout {
            log::info!("session timed out after {timeout}s without hearing from the server");
            self.report_connection_error(Error::ConnectionClosed(ConnectionCloseReason::Timeout));
            self.close(ConnectionCloseReason::Timeout, false);
            return;
        }
        self.latency.update(time);
        self.send_periodic_packets();
        if self.state == SessionState::Connected {
            self.flush_validation_responses();
        }
    }

    fn send_periodic_packets(&mut self) {
        if !self.pacer.is_ready(self.time) {
            return;
        }
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        if !lock(transport).can_send() {
            return;
        }
        let can_send = self.tend.as_ref().map_or(false, Tend::can_send);
        let result = match self.state {
            SessionState::Connected | SessionState::Connecting if !can_send => {
                self.resend_last_reliable()
            }
            SessionState::Connected => {
                log::trace!("session sending ack");
                self.send_oob(OobMessage::Ack, true)
            }
            SessionState::Connecting => self.send_connect_request(),
            SessionState::Opening | SessionState::Disconnected => return,
        };
        match result {
            Ok(()) => self.pacer.on_sent(self.time),
            Err(e) => self.report_error(e),
        }
    }

    fn poll_transport(&mut self) {
        loop {
            let Some(transport) = self.transport.as_ref() else {
                return;
            };
            let Some(event) = lock(transport).poll_event() else {
                return;
            };
            match event {
                TransportEvent::Opened if self.state == SessionState::Opening => {
                    self.on_transport_opened()
                }
                TransportEvent::Opened => log::trace!("ignoring transport open in {:?}", self.state),
                TransportEvent::Error(msg) => {
                    log::info!("session lost its transport: {msg}");
                    self.report_connection_error(Error::Transport(msg));
                    self.close(ConnectionCloseReason::TransportError, false);
                }
            }
        }
    }

    fn on_transport_opened(&mut self) {
        self.client_id = None;
        self.host_payload.clear();
        self.pacer = SendPacer::new(DEFAULT_SEND_FREQUENCY);
        self.latency = LatencyTracker::new(self.settings.ping_interval);
        self.ack_queue.clear();
        self.last_reliable = None;
        // answers meant for an earlier connection must not leak into this one
        let (tx, rx) = mpsc::channel();
        self.validation_tx = tx;
        self.validation_rx = rx;
        self.last_receive_time = Some(self.time);
        self.set_state(SessionState::Connecting);
        match self.send_connect_request() {
            Ok(()) => self.pacer.on_sent(self.time),
            Err(e) => self.report_error(e),
        }
    }

    fn send_connect_request(&mut self) -> Result<()> {
        log::debug!("session sending connect request");
        let request = ConnectRequest {
            connection_type: self.connection_type,
            mtu: self.settings.mtu as u16,
            user_payload: self.settings.user_payload.clone(),
        };
        self.send_oob(OobMessage::ConnectRequest(request), false)
    }

    fn on_connect_response(&mut self, response: ConnectResponse) {
        let mtu = usize::from(response.mtu).clamp(MIN_MTU, MAX_MTU);
        if mtu != usize::from(response.mtu) {
            log::warn!("server sent mtu {}, using {mtu}", response.mtu);
        }
        self.mtu = mtu;
        self.pool.resize(mtu);
        self.pacer.set_frequency(response.send_frequency);
        self.pacer.reset();
        self.client_id = Some(response.client_id);
        self.host_payload = response.host_payload;
        self.set_state(SessionState::Connected);
        log::info!(
            "session connected as client {} (mtu {mtu}, {} packets/s)",
            response.client_id,
            self.pacer.frequency()
        );
        if let Some(ref mut cb) = self.cfg.on_connect {
            cb(response.client_id, &mut self.cfg.context)
        }
        self.start_keep_alive();
        if let Some(tend) = self.tend.as_mut() {
            tend.set_connected(true);
        }
    }

    fn start_keep_alive(&mut self) {
        let Some(seconds) = self.cfg.keep_alive_interval else {
            return;
        };
        let interval = match Duration::try_from_secs_f64(seconds) {
            Ok(interval) if !interval.is_zero() => interval,
            _ => {
                log::warn!("keep-alive interval of {seconds}s is not usable, running without it");
                return;
            }
        };
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let mut datagram = vec![0u8; self.header_size];
        let encoded = TendHeader::Unreliable
            .write(&mut datagram)
            .map_err(Error::from)
            .and_then(|()| {
                datagram.push(PacketMode::OutOfBand as u8);
                OobMessage::KeepAlive.write(&mut datagram).map_err(Error::from)
            });
        if let Err(e) = encoded {
            log::warn!("failed to encode keep-alive: {e}");
            return;
        }
        match KeepAlive::spawn(Arc::clone(transport), datagram, interval) {
            Ok(worker) => self.keep_alive = Some(worker),
            Err(e) => log::warn!("failed to start keep-alive worker: {e}"),
        }
    }

    fn close(&mut self, reason: ConnectionCloseReason, notify_server: bool) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if notify_server {
            self.send_disconnect_request();
        }
        // the worker must stop before the transport closes underneath it
        self.keep_alive = None;
        if let Some(transport) = self.transport.take() {
            lock(&transport).close();
        }
        self.tend = None;
        self.ack_queue.clear();
        self.last_reliable = None;
        self.client_id = None;
        self.last_receive_time = None;
        self.set_state(SessionState::Disconnected);
        log::info!("session disconnected: {reason}");
        if let Some(ref mut cb) = self.cfg.on_disconnect {
            cb(reason, &mut self.cfg.context)
        }
    }

    fn send_disconnect_request(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        {
            let mut transport = lock(transport);
            if transport.state() != TransportState::Open {
                return;
            }
            transport.prepare_disconnect();
        }
        let request = DisconnectRequest {
            reason: ConnectionCloseReason::Disconnected,
            host_payload: Vec::new(),
        };
        if let Err(e) = self.send_oob(OobMessage::DisconnectRequest(request), true) {
            log::debug!("failed to send disconnect request: {e}");
        }
    }

    /// Creates a packet for application data.
    ///
    /// A reliable packet takes the next sequence id and must be [sent](Session::send)
    /// before another reliable packet is created.
    pub fn create_packet(&mut self, reliable: bool) -> Result<OutPacket> {
        if self.state != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        self.create_raw_packet(reliable, PacketMode::Normal)
    }

    fn create_raw_packet(&mut self, reliable: bool, mode: PacketMode) -> Result<OutPacket> {
        let tend = self.tend.as_ref().ok_or(Error::NotConnected)?;
        let mut buf = self.pool.rent();
        let sequence_id = tend.outgoing_sequence_id();
        let data = buf.as_vec_mut();
        data.resize(self.header_size, 0);
        tend.write_header(&mut *data, reliable)?;
        data.push(mode as u8);
        Ok(OutPacket::new(
            buf,
            sequence_id,
            reliable,
            mode == PacketMode::OutOfBand,
        ))
    }

    /// Sends a packet created with [`create_packet`](Session::create_packet).
    pub fn send(&mut self, packet: OutPacket) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        self.send_packet(&packet)
    }

    fn send_packet(&mut self, packet: &OutPacket) -> Result<()> {
        if !packet.buffer().is_current() {
            return Err(Error::StaleBuffer);
        }
        let bytes = packet.as_bytes();
        if bytes.len() > self.mtu {
            return Err(Error::PacketTooLarge(bytes.len(), self.mtu));
        }
        let tend = self.tend.as_mut().ok_or(Error::NotConnected)?;
        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;
        let sequence_id = packet.sequence_id();
        if packet.is_reliable() && !tend.is_valid_seq_to_send(sequence_id) {
            return Err(Error::InvalidSequence);
        }
        if self.settings.debug_stream {
            log::trace!("sending {} bytes: {:02x?}", bytes.len(), bytes);
        }
        lock(transport).send(bytes).map_err(Into::<Error>::into)?;
        tend.on_packet_sent(sequence_id, packet.is_reliable());
        if packet.is_reliable() {
            self.latency.on_sent(sequence_id, self.time);
            match self.last_reliable.as_mut() {
                Some((id, buf)) => {
                    *id = sequence_id;
                    buf.clear();
                    buf.extend_from_slice(bytes);
                }
                None => self.last_reliable = Some((sequence_id, bytes.to_vec())),
            }
        }
        Ok(())
    }

    fn resend_last_reliable(&mut self) -> Result<()> {
        let Some((sequence_id, bytes)) = self.last_reliable.as_ref() else {
            return Ok(());
        };
        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;
        log::trace!("session resending reliable packet {sequence_id}");
        if self.settings.debug_stream {
            log::trace!("sending {} bytes: {:02x?}", bytes.len(), bytes);
        }
        lock(transport).send(bytes).map_err(Into::<Error>::into)?;
        if let Some(tend) = self.tend.as_mut() {
            tend.on_packet_sent(*sequence_id, true);
        }
        self.latency.on_sent(*sequence_id, self.time);
        Ok(())
    }

    fn send_oob(&mut self, message: OobMessage, reliable: bool) -> Result<()> {
        let mut packet = self.create_raw_packet(reliable, PacketMode::OutOfBand)?;
        message.write(&mut packet)?;
        self.send_packet(&packet)?;
        if reliable {
            self.ack_queue.enqueue(message, packet.sequence_id());
        }
        Ok(())
    }

    /// Sends a kick request for another client. Only `Simulator` connections may kick.
    pub fn send_kick_request(&mut self, client_id: ClientId, host_payload: Vec<u8>) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        if self.connection_type != ConnectionType::Simulator {
            return Err(Error::KickNotAllowed(self.connection_type));
        }
        log::debug!("session sending kick request for client {client_id}");
        self.send_oob(
            OobMessage::KickRequest(KickRequest {
                client_id,
                host_payload,
            }),
            true,
        )
    }

    fn flush_validation_responses(&mut self) {
        while let Ok(response) = self.validation_rx.try_recv() {
            log::debug!(
                "session answering validation of client {}: {}",
                response.client_id,
                if response.accepted { "accepted" } else { "rejected" }
            );
            if let Err(e) = self.send_oob(OobMessage::ValidateConnectionResponse(response), true) {
                self.report_error(e);
            }
        }
    }

    /// Receives every datagram the transport has buffered.
    ///
    /// Application packets are appended to `packets`; control messages are handled here.
    /// Malformed, duplicate and out-of-order datagrams are dropped.
    pub fn receive(&mut self, packets: &mut Vec<InPacket>) -> Result<()> {
        self.poll_transport();
        let mut buf = std::mem::take(&mut self.recv_buf);
        let result = self.receive_into(&mut buf, packets);
        self.recv_buf = buf;
        result
    }

    fn receive_into(&mut self, buf: &mut [u8], packets: &mut Vec<InPacket>) -> Result<()> {
        loop {
            // a packet in this batch may have closed the connection
            if self.state == SessionState::Disconnected {
                return Ok(());
            }
            let Some(transport) = self.transport.as_ref() else {
                return Ok(());
            };
            let received = lock(transport).recv(buf).map_err(Into::<Error>::into);
            let len = match received {
                Ok(Some(len)) => len,
                Ok(None) => return Ok(()),
                Err(err) => {
                    log::info!("session failed to receive: {err}");
                    self.report_connection_error(Error::Transport(err.to_string()));
                    self.close(ConnectionCloseReason::TransportError, false);
                    return Err(err);
                }
            };
            self.process_datagram(&buf[..len], packets);
        }
    }

    fn process_datagram(&mut self, datagram: &[u8], packets: &mut Vec<InPacket>) {
        if self.settings.debug_stream {
            log::trace!("received {} bytes: {:02x?}", datagram.len(), datagram);
        }
        let Some(body) = datagram.get(self.header_size..) else {
            log::trace!("dropped datagram shorter than the transport header");
            return;
        };
        let Some(tend) = self.tend.as_mut() else {
            return;
        };
        let mut reader = io::Cursor::new(body);
        let received = match tend.read_header(&mut reader) {
            Ok(received) => received,
            Err(e) => {
                log::trace!("dropped packet: {e}");
                return;
            }
        };
        let deliveries: Vec<DeliveryInfo> = std::iter::from_fn(|| tend.dequeue_delivery()).collect();
        self.last_receive_time = Some(self.time);
        if let (true, TendHeader::Reliable(header)) = (received.did_ack, received.header) {
            self.latency.on_acked(header.received_id, self.time);
        }
        for info in deliveries {
            self.on_delivery(info);
        }
        let mode = match reader.read_u8() {
            Ok(mode) => PacketMode::from_u8(mode),
            Err(_) => {
                log::trace!("dropped packet without a mode byte");
                return;
            }
        };
        match mode {
            Some(PacketMode::OutOfBand) => match OobMessage::read(&mut reader) {
                Ok(message) => self.handle_oob(message),
                Err(e) => log::warn!("ignored out-of-band message: {e}"),
            },
            Some(PacketMode::Normal) if self.state == SessionState::Connected => {
                let start = reader.position() as usize;
                packets.push(InPacket {
                    payload: body[start..].to_vec(),
                    sequence_id: match received.header {
                        TendHeader::Reliable(header) => Some(header.packet_id),
                        TendHeader::Unreliable => None,
                    },
                    is_oob: false,
                    from: self.peer_addr(),
                });
            }
            Some(PacketMode::Normal) => {
                log::trace!("discarded application packet while {:?}", self.state)
            }
            None => log::trace!("dropped packet with an invalid mode byte"),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.transport
            .as_ref()
            .and_then(|transport| lock(transport).peer_addr())
            .or(self.endpoint)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    fn on_delivery(&mut self, info: DeliveryInfo) {
        if let Some(ref mut cb) = self.cfg.on_delivery_info {
            cb(info, &mut self.cfg.context)
        }
        let Some(message) = self.ack_queue.resolve(info) else {
            return;
        };
        log::debug!("session resending lost {message}");
        if let Err(e) = self.send_oob(message, true) {
            self.report_error(e);
        }
    }

    fn handle_oob(&mut self, message: OobMessage) {
        log::trace!("session received {message}");
        match message {
            OobMessage::ConnectResponse(response) if self.state == SessionState::Connecting => {
                self.on_connect_response(response)
            }
            OobMessage::DisconnectRequest(request) => {
                log::info!("server closed the connection: {}", request.reason);
                self.report_connection_error(Error::ConnectionDenied {
                    reason: request.reason,
                    host_payload: request.host_payload,
                });
                self.close(request.reason, false);
            }
            OobMessage::ChangeSendFrequencyRequest(request)
                if self.state == SessionState::Connected =>
            {
                let applied = self.pacer.set_frequency(request.rate);
                log::debug!(
                    "session send frequency changed to {applied} (requested {})",
                    request.rate
                );
            }
            OobMessage::ValidateConnectionRequest(request) => self.on_validate_request(request),
            OobMessage::Ack | OobMessage::KeepAlive => {}
            OobMessage::ConnectResponse(_) | OobMessage::ChangeSendFrequencyRequest(_) => {
                log::debug!("ignored {message} while {:?}", self.state)
            }
            OobMessage::ConnectRequest(_)
            | OobMessage::KickRequest(_)
            | OobMessage::ValidateConnectionResponse(_) => {
                log::warn!("ignored unexpected {message} from the server")
            }
        }
    }

    fn on_validate_request(&mut self, request: ValidateConnectionRequest) {
        log::debug!("session validating client {}", request.client_id);
        let responder = ValidationResponder {
            client_id: request.client_id,
            tx: self.validation_tx.clone(),
        };
        match self.cfg.on_validate_connection_request {
            Some(ref mut cb) => cb(&request, responder, &mut self.cfg.context),
            None => responder.accept(Vec::new()),
        }
    }
}

impl<T: Transport, Ctx> Drop for Session<T, Ctx> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
