use std::{
    io::{self, Write},
    net::{SocketAddr, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use brisk::{
    oob::ConnectResponse, ConnectSettings, ConnectionType, OobMessage, PacketMode, Session,
    SessionConfig, SessionState, Tend, TendHeader,
};

fn other<E: std::error::Error + Send + Sync + 'static>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Minimal echo host: accepts one client and sends every application payload back.
fn run_host(socket: UdpSocket) -> io::Result<()> {
    let mut tend = Tend::new();
    let mut buf = [0u8; 1500];
    let mut client: Option<SocketAddr> = None;
    socket.set_read_timeout(Some(Duration::from_secs(10)))?;
    loop {
        let (len, from) = socket.recv_from(&mut buf)?;
        let mut reader = io::Cursor::new(&buf[..len]);
        let Ok(received) = tend.read_header(&mut reader) else {
            continue;
        };
        while let Some(info) = tend.dequeue_delivery() {
            log::debug!("host: {info:?}");
        }
        let mode = byteorder::ReadBytesExt::read_u8(&mut reader)?;
        let mut reply = Vec::new();
        match PacketMode::from_u8(mode) {
            Some(PacketMode::OutOfBand) => match OobMessage::read(&mut reader) {
                Ok(OobMessage::ConnectRequest(request)) if client.is_none() => {
                    log::info!(
                        "host: accepting {:?} with mtu {}",
                        request.connection_type,
                        request.mtu
                    );
                    client = Some(from);
                    tend.write_header(&mut reply, false).map_err(other)?;
                    reply.push(PacketMode::OutOfBand as u8);
                    OobMessage::ConnectResponse(ConnectResponse {
                        mtu: request.mtu,
                        send_frequency: 10,
                        client_id: 1,
                        host_payload: b"hello from the host".to_vec(),
                    })
                    .write(&mut reply)
                    .map_err(other)?;
                    tend.set_connected(true);
                }
                Ok(OobMessage::DisconnectRequest(request)) => {
                    log::info!("host: client left ({})", request.reason);
                    return Ok(());
                }
                Ok(_) if received.header.is_reliable() => {
                    let sequence_id = tend.outgoing_sequence_id();
                    tend.write_header(&mut reply, true).map_err(other)?;
                    reply.push(PacketMode::OutOfBand as u8);
                    OobMessage::Ack.write(&mut reply).map_err(other)?;
                    tend.on_packet_sent(sequence_id, true);
                }
                _ => continue,
            },
            Some(PacketMode::Normal) => {
                let payload = &buf[reader.position() as usize..len];
                tend.write_header(&mut reply, false).map_err(other)?;
                reply.push(PacketMode::Normal as u8);
                reply.extend_from_slice(payload);
            }
            None => continue,
        }
        if let TendHeader::Reliable(header) = received.header {
            log::trace!("host: accepted reliable packet {}", header.packet_id);
        }
        socket.send_to(&reply, from)?;
    }
}

fn main() -> brisk::Result<()> {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .init();

    let host_socket = UdpSocket::bind("127.0.0.1:0")?;
    let host_addr = host_socket.local_addr()?;
    let host = thread::spawn(move || run_host(host_socket));

    let cfg = SessionConfig::with_context(0usize)
        .on_connect(|client_id, _| log::info!("connected as client {client_id}"))
        .on_disconnect(|reason, _| log::info!("disconnected: {reason}"))
        .on_delivery_info(|info, delivered| {
            if info.was_delivered {
                *delivered += 1;
            }
        });
    let mut session = Session::with_config(brisk::UdpTransport::new, cfg);
    session.connect(
        host_addr,
        ConnectionType::Client,
        ConnectSettings::default().user_payload(b"demo".to_vec()),
    )?;

    let start = Instant::now();
    let tick_rate = 1.0 / 60.0;
    let mut received = Vec::new();
    let mut echoes = 0;
    while start.elapsed() < Duration::from_secs(5) && echoes < 10 {
        session.update(start.elapsed().as_secs_f64());
        session.receive(&mut received)?;
        for packet in received.drain(..) {
            echoes += 1;
            println!("echo: {}", String::from_utf8_lossy(packet.payload()));
        }
        if session.state() == SessionState::Connected {
            let mut packet = session.create_packet(false)?;
            write!(packet, "tick {:.2}", start.elapsed().as_secs_f64())?;
            session.send(packet)?;
        }
        thread::sleep(Duration::from_secs_f64(tick_rate));
    }
    println!(
        "ping {:.1}ms, {} reliable packets delivered",
        session.ping().average_ms,
        session.context()
    );
    session.disconnect();
    match host.join() {
        Ok(result) => result?,
        Err(_) => log::error!("host thread panicked"),
    }
    Ok(())
}
