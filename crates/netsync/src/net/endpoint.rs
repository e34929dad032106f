use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use super::channel::QosType;
use super::protocol::{MAX_PACKET_SIZE, Packet, PacketType};
use super::session::{TransportError, TransportSession};
use super::stats::NetworkStats;
use super::tracking::LinkState;

fn encode(packet: &Packet) -> io::Result<Vec<u8>> {
    let data = packet.serialize().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Serialization error: {}", e),
        )
    })?;

    if data.len() > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Packet exceeds MTU",
        ));
    }
    Ok(data)
}

/// Non-blocking UDP socket speaking [`Packet`]s. Shared with every
/// [`UdpSession`] it hands out.
pub struct NetworkEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = encode(packet)?;
        let bytes = self.socket.send_to(&data, addr)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        Ok(bytes)
    }

    pub fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size < 8 {
                        self.stats.packets_rejected += 1;
                        continue;
                    }

                    match Packet::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) if packet.header.is_valid() => {
                            self.stats.packets_received += 1;
                            self.stats.bytes_received += size as u64;
                            packets.push((packet, addr));
                        }
                        Ok(_) | Err(_) => {
                            self.stats.packets_rejected += 1;
                            log::debug!("Dropped malformed datagram from {}", addr);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(packets)
    }

    /// A session that frames payloads for `remote` using the peer's
    /// sequencing state.
    pub fn session_for(&self, remote: SocketAddr, link: Arc<Mutex<LinkState>>) -> UdpSession {
        UdpSession {
            socket: Arc::clone(&self.socket),
            remote,
            link,
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// Sends channel frames as [`PacketType::Payload`] datagrams. Every packet
/// carries acks for the peer, which is what feeds RTT sampling; lost
/// reliable frames are not retransmitted.
#[derive(Debug)]
pub struct UdpSession {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    link: Arc<Mutex<LinkState>>,
    open: Arc<AtomicBool>,
}

impl UdpSession {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Handle that observes (and can end) this session from elsewhere.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }
}

impl TransportSession for UdpSession {
    fn send(&mut self, frame: &[u8], qos: QosType) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let header = self.link.lock().next_header(Instant::now());
        let packet = Packet::new(
            header,
            PacketType::Payload {
                reliable: qos.is_reliable(),
                frame: frame.to_vec(),
            },
        );
        let data = encode(&packet)?;
        self.socket.send_to(&data, self.remote)?;
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
