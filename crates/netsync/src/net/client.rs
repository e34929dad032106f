use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::event::{ClientStateChanged, DeferredPublisher};

use super::connection::{
    AUTHORITY_UNSET, AuthorityId, Connection, ConnectionHandle, ConnectionState, CorrelationId,
    LinkResources, Triage,
};
use super::endpoint::NetworkEndpoint;
use super::protocol::{Packet, PacketType};
use super::stats::{NetworkStats, rand_nonzero_u64, rand_u64};
use super::tracking::LinkState;

pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const CONNECT_TOKEN_EXPIRY: Duration = Duration::from_secs(120);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Time-boxed credentials for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToken {
    pub correlation_id: CorrelationId,
    pub server_endpoints: Vec<SocketAddr>,
    pub issued_at: SystemTime,
    pub expires_in: Duration,
    /// Connect window before the handshake completes, idle timeout after.
    pub timeout: Duration,
}

impl ConnectToken {
    pub fn new(correlation_id: CorrelationId, server_endpoints: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            correlation_id,
            server_endpoints,
            issued_at: SystemTime::now(),
            expires_in: CONNECT_TOKEN_EXPIRY,
            timeout,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.issued_at)
            .is_ok_and(|age| age > self.expires_in)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStep {
    Send,
    Wait,
    Expired,
}

/// Paces handshake retries at a fixed rate until the connect window closes.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    started: Instant,
    window: Duration,
    last_sent: Option<Instant>,
}

impl ConnectAttempt {
    pub fn new(started: Instant, window: Duration) -> Self {
        Self {
            started,
            window,
            last_sent: None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> AttemptStep {
        if now.saturating_duration_since(self.started) > self.window {
            return AttemptStep::Expired;
        }
        match self.last_sent {
            Some(sent) if now.saturating_duration_since(sent) < CONNECT_RETRY_INTERVAL => {
                AttemptStep::Wait
            }
            _ => {
                self.last_sent = Some(now);
                AttemptStep::Send
            }
        }
    }
}

/// Publishes [`ClientStateChanged`] only when the sampled state differs
/// from the previous sample.
#[derive(Debug)]
pub struct StateWatch {
    current: ConnectionState,
    publisher: DeferredPublisher,
}

impl StateWatch {
    pub fn new(publisher: DeferredPublisher) -> Self {
        Self {
            current: ConnectionState::Disconnected,
            publisher,
        }
    }

    pub fn observe(&mut self, state: ConnectionState) -> bool {
        if state == self.current {
            return false;
        }
        let previous = self.current;
        self.current = state;
        log::info!("Client state {} -> {}", previous, state);
        self.publisher.publish(ClientStateChanged {
            previous,
            current: state,
        });
        true
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },
    #[error("{0}:{1} resolved to no addresses")]
    NoAddress(String, u16),
    #[error("already {0}")]
    AlreadyActive(ConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Requesting,
    Responding { combined_salt: u64 },
}

/// Client side of a UDP session: handshake, retries, keepalive, idle
/// timeout and the [`Connection`] once accepted.
pub struct ClientLink {
    endpoint: NetworkEndpoint,
    resources: LinkResources,
    triage: Arc<dyn Triage>,
    watch: StateWatch,
    destination: Option<(String, u16)>,
    server_addr: Option<SocketAddr>,
    correlation_id: Option<CorrelationId>,
    token: Option<ConnectToken>,
    attempt: Option<ConnectAttempt>,
    handshake: Handshake,
    client_salt: u64,
    authority_id: AuthorityId,
    link: Arc<Mutex<LinkState>>,
    connection: Option<Connection>,
    idle_timeout: Duration,
    last_receive: Instant,
    last_send: Instant,
}

impl ClientLink {
    pub fn new<A: ToSocketAddrs>(
        bind_addr: A,
        resources: LinkResources,
        triage: Arc<dyn Triage>,
        publisher: DeferredPublisher,
    ) -> io::Result<Self> {
        let now = Instant::now();
        Ok(Self {
            endpoint: NetworkEndpoint::bind(bind_addr)?,
            resources,
            triage,
            watch: StateWatch::new(publisher),
            destination: None,
            server_addr: None,
            correlation_id: None,
            token: None,
            attempt: None,
            handshake: Handshake::Requesting,
            client_salt: 0,
            authority_id: AUTHORITY_UNSET,
            link: Arc::new(Mutex::new(LinkState::new())),
            connection: None,
            idle_timeout: Duration::ZERO,
            last_receive: now,
            last_send: now,
        })
    }

    pub fn connect(&mut self, host: &str, port: u16, timeout_secs: u64) -> Result<(), ConnectError> {
        self.connect_at(host, port, timeout_secs, Instant::now())
    }

    /// Starts a handshake with `host:port`. The correlation id survives
    /// reconnects to the same destination.
    pub fn connect_at(
        &mut self,
        host: &str,
        port: u16,
        timeout_secs: u64,
        now: Instant,
    ) -> Result<(), ConnectError> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                return Err(ConnectError::AlreadyActive(self.state()));
            }
            ConnectionState::Disconnected | ConnectionState::TimedOut => {}
        }

        let endpoints: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Resolve {
                host: host.to_string(),
                port,
                source,
            })?
            .collect();
        let server_addr = endpoints
            .iter()
            .copied()
            .find(SocketAddr::is_ipv4)
            .or_else(|| endpoints.first().copied())
            .ok_or_else(|| ConnectError::NoAddress(host.to_string(), port))?;

        let destination = (host.to_string(), port);
        let correlation_id = match self.correlation_id {
            Some(id) if self.destination.as_ref() == Some(&destination) => id,
            _ => rand_nonzero_u64(),
        };

        let timeout = Duration::from_secs(timeout_secs);
        self.destination = Some(destination);
        self.correlation_id = Some(correlation_id);
        self.token = Some(ConnectToken::new(correlation_id, endpoints, timeout));
        self.attempt = Some(ConnectAttempt::new(now, timeout));
        self.server_addr = Some(server_addr);
        self.handshake = Handshake::Requesting;
        self.client_salt = rand_u64();
        self.authority_id = AUTHORITY_UNSET;
        self.idle_timeout = timeout;
        self.link = Arc::new(Mutex::new(LinkState::new()));
        self.last_receive = now;

        log::info!(
            "Connecting to {} (correlation {:016x}, timeout {}s)",
            server_addr,
            correlation_id,
            timeout_secs
        );
        self.watch.observe(ConnectionState::Connecting);
        Ok(())
    }

    /// Pumps the socket and advances the state machine. Call every tick.
    pub fn update(&mut self, now: Instant) -> io::Result<()> {
        let Some(server_addr) = self.server_addr else {
            return Ok(());
        };

        for (packet, addr) in self.endpoint.receive()? {
            if addr != server_addr {
                continue;
            }
            self.handle_packet(packet, now)?;
        }

        match self.state() {
            ConnectionState::Connecting => self.drive_handshake(server_addr, now)?,
            ConnectionState::Connected => {
                if now.saturating_duration_since(self.last_receive) > self.idle_timeout {
                    log::warn!("Server {} went quiet, timing out", server_addr);
                    self.teardown(ConnectionState::TimedOut);
                } else if now.saturating_duration_since(self.last_send) >= KEEPALIVE_INTERVAL {
                    self.send_packet(PacketType::KeepAlive, now)?;
                }
            }
            ConnectionState::Disconnected | ConnectionState::TimedOut => {}
        }
        Ok(())
    }

    fn drive_handshake(&mut self, server_addr: SocketAddr, now: Instant) -> io::Result<()> {
        let expired = self
            .token
            .as_ref()
            .is_some_and(|t| t.is_expired(SystemTime::now()));
        let step = match self.attempt.as_mut() {
            Some(attempt) if !expired => attempt.poll(now),
            _ => AttemptStep::Expired,
        };

        match step {
            AttemptStep::Wait => Ok(()),
            AttemptStep::Expired => {
                log::warn!("Connect attempt to {} timed out", server_addr);
                self.teardown(ConnectionState::TimedOut);
                Ok(())
            }
            AttemptStep::Send => {
                let payload = match self.handshake {
                    Handshake::Requesting => PacketType::ConnectionRequest {
                        correlation_id: self.correlation_id.unwrap_or_default(),
                        client_salt: self.client_salt,
                        timeout_secs: self.idle_timeout.as_secs().min(u32::MAX as u64) as u32,
                    },
                    Handshake::Responding { combined_salt } => {
                        PacketType::ChallengeResponse { combined_salt }
                    }
                };
                self.send_packet(payload, now)
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) -> io::Result<()> {
        let Some(samples) = self.link.lock().on_header(&packet.header, now) else {
            return Ok(());
        };
        self.last_receive = now;
        if let Some(conn) = self.connection.as_mut() {
            for rtt in samples {
                conn.record_rtt(rtt);
            }
        }

        match packet.payload {
            PacketType::ConnectionChallenge {
                server_salt,
                challenge,
            } if self.state() == ConnectionState::Connecting => {
                let combined_salt = self.client_salt ^ server_salt;
                if combined_salt != challenge {
                    log::warn!("Ignoring challenge that does not match our salt");
                    return Ok(());
                }
                self.handshake = Handshake::Responding { combined_salt };
                self.send_packet(PacketType::ChallengeResponse { combined_salt }, now)?;
            }
            PacketType::ConnectionAccepted { authority_id }
                if self.state() == ConnectionState::Connecting =>
            {
                self.accept(authority_id);
            }
            PacketType::ConnectionDenied { reason } => {
                log::warn!("Connection denied: {}", reason);
                self.teardown(ConnectionState::Disconnected);
            }
            PacketType::Payload { frame, .. } => match self.connection.as_ref() {
                Some(conn) => {
                    if let Err(e) = conn.on_receive(&frame) {
                        log::warn!("Dropping bad frame from server: {}", e);
                    }
                }
                None => log::debug!("Payload before accept, dropping"),
            },
            PacketType::Disconnect => {
                log::info!("Server closed the connection");
                self.teardown(ConnectionState::Disconnected);
            }
            _ => {}
        }
        Ok(())
    }

    fn accept(&mut self, authority_id: AuthorityId) {
        let Some(server_addr) = self.server_addr else {
            return;
        };
        self.authority_id = authority_id;
        self.attempt = None;

        let handle = ConnectionHandle {
            correlation_id: self.correlation_id.unwrap_or_default(),
            authority_id,
        };
        let session = self.endpoint.session_for(server_addr, Arc::clone(&self.link));
        self.connection = Some(Connection::new(
            handle,
            Box::new(session),
            self.resources.clone(),
            Arc::clone(&self.triage),
        ));
        log::info!("Connected to {} as authority {}", server_addr, authority_id);
        self.watch.observe(ConnectionState::Connected);
    }

    fn send_packet(&mut self, payload: PacketType, now: Instant) -> io::Result<()> {
        let Some(addr) = self.server_addr else {
            return Ok(());
        };
        let header = self.link.lock().next_header(now);
        self.endpoint.send_to(&Packet::new(header, payload), addr)?;
        self.last_send = now;
        Ok(())
    }

    fn teardown(&mut self, state: ConnectionState) {
        if let Some(mut conn) = self.connection.take() {
            conn.disconnect();
        }
        self.attempt = None;
        self.authority_id = AUTHORITY_UNSET;
        self.watch.observe(state);
    }

    /// Tells the server goodbye and drops the connection.
    pub fn disconnect(&mut self) {
        if self.state() != ConnectionState::Connected {
            log::warn!("Disconnect requested while {}", self.state());
            if self.state() == ConnectionState::Connecting {
                self.teardown(ConnectionState::Disconnected);
            }
            return;
        }

        if let Err(e) = self.send_packet(PacketType::Disconnect, Instant::now()) {
            log::warn!("Failed to notify server of disconnect: {}", e);
        }
        self.teardown(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.watch.current()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub fn token(&self) -> Option<&ConnectToken> {
        self.token.as_ref()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn authority_id(&self) -> AuthorityId {
        self.authority_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }
}
