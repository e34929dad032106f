use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netsync::config::{SharedConfig, SyncConfig};
use netsync::event::{
    ClientTypeFlagsChanged, ControlReceived, RemoteClientStateChanged, Route,
};
use netsync::ids::{BatchLedger, ServerIdAuthority};
use netsync::net::{
    AUTHORITY_SERVER, AuthorityId, ClientTypeFlags, ConnectionHandle, ConnectionState,
    ControlMessage, ControlTriage, KEEPALIVE_INTERVAL, NetworkEndpoint, NetworkStats, Packet,
    PacketHeader, PacketType, PeerTable, RemotePeer, Triage,
};
use netsync::pool::ScalerStats;
use netsync::SyncContext;

use crate::config::ServerConfig;

/// Authority for a set of remote clients: runs the handshake, owns the id
/// ledger and hands out batches over the control channel.
pub struct SyncServer {
    endpoint: NetworkEndpoint,
    peers: PeerTable,
    ids: ServerIdAuthority,
    context: SyncContext,
    shared: SharedConfig,
    triage: Arc<dyn Triage>,
    control_inbox: Rc<RefCell<VecDeque<ControlReceived>>>,
    config: ServerConfig,
    tick: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    last_keepalive: Instant,
}

impl SyncServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;
        let shared = SharedConfig::new(config.sync.clone());
        let context = SyncContext::new(Arc::new(shared.clone()));
        context.bus().set_local_authority(AUTHORITY_SERVER);

        let control_inbox = Rc::new(RefCell::new(VecDeque::new()));
        let inbox = Rc::clone(&control_inbox);
        context
            .bus()
            .subscribe::<ControlReceived>(move |envelope| {
                if let Some(control) = envelope.event_as::<ControlReceived>() {
                    inbox.borrow_mut().push_back(control.clone());
                }
                Ok(())
            })
            .map_err(io::Error::other)?;
        context
            .bus()
            .subscribe::<RemoteClientStateChanged>(|envelope| {
                if let Some(change) = envelope.event_as::<RemoteClientStateChanged>() {
                    log::info!(
                        "Client {} (correlation {:016x}) is now {}",
                        change.authority_id,
                        change.correlation_id,
                        change.state
                    );
                }
                Ok(())
            })
            .map_err(io::Error::other)?;

        let triage: Arc<dyn Triage> = Arc::new(ControlTriage::new(context.publisher()));
        let now = Instant::now();

        Ok(Self {
            endpoint,
            peers: PeerTable::new(config.max_clients),
            ids: ServerIdAuthority::new(BatchLedger::new(&config.sync)),
            context,
            shared,
            triage,
            control_inbox,
            tick: 0,
            tick_duration: config.tick_duration(),
            last_tick_time: now,
            accumulator: Duration::ZERO,
            last_keepalive: now,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Swaps in new sync settings; pool bounds, compression and batch size
    /// follow on the next use.
    pub fn apply_config(&mut self, sync: SyncConfig) {
        if sync == self.config.sync {
            return;
        }
        log::info!("Applying updated sync configuration");
        self.shared.replace(sync.clone());
        self.config.sync = sync;
        self.context.refresh_config();
        self.ids.ledger_mut().refresh(&self.shared);
    }

    pub fn tick_once(&mut self, now: Instant) {
        let delta = now.saturating_duration_since(self.last_tick_time);
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network(now) {
            log::error!("Network error: {}", e);
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        self.tick += 1;

        let report = self.context.tick(self.peers.connected_count(), now);
        if report.events.failures > 0 {
            log::warn!(
                "{} event handler(s) failed on tick {}",
                report.events.failures,
                self.tick
            );
        }
        self.process_control();

        for peer in self.peers.reap_timed_out(now) {
            log::warn!("Client {} timed out", peer.authority_id);
            self.release_peer(peer);
        }

        if now.saturating_duration_since(self.last_keepalive) >= KEEPALIVE_INTERVAL {
            self.last_keepalive = now;
            self.send_keepalives(now);
        }
    }

    fn process_network(&mut self, now: Instant) -> io::Result<()> {
        for (packet, addr) in self.endpoint.receive()? {
            self.handle_packet(packet, addr, now)?;
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr, now: Instant) -> io::Result<()> {
        if let PacketType::ConnectionRequest {
            correlation_id,
            client_salt,
            timeout_secs,
        } = packet.payload
        {
            return self.handle_connection_request(
                addr,
                &packet.header,
                correlation_id,
                client_salt,
                timeout_secs,
                now,
            );
        }

        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            return Ok(());
        };
        let Some(samples) = peer.link.lock().on_header(&packet.header, now) else {
            return Ok(());
        };
        peer.touch(now);
        if let Some(conn) = peer.connection.as_mut() {
            for rtt in samples {
                conn.record_rtt(rtt);
            }
        }

        match packet.payload {
            PacketType::ChallengeResponse { combined_salt } => {
                self.handle_challenge_response(addr, combined_salt, now)?;
            }
            PacketType::Payload { frame, .. } => match peer.connection.as_ref() {
                Some(conn) => {
                    if let Err(e) = conn.on_receive(&frame) {
                        log::warn!("Dropping bad frame from {}: {}", addr, e);
                    }
                }
                None => log::debug!("Payload from {} before accept, dropping", addr),
            },
            PacketType::Disconnect => {
                if let Some(peer) = self.peers.remove_by_addr(&addr) {
                    log::info!("Client {} disconnected", peer.authority_id);
                    self.release_peer(peer);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_connection_request(
        &mut self,
        addr: SocketAddr,
        header: &PacketHeader,
        correlation_id: u64,
        client_salt: u64,
        timeout_secs: u32,
        now: Instant,
    ) -> io::Result<()> {
        let is_new = self.peers.get_by_addr(&addr).is_none();
        let idle_timeout = Duration::from_secs(timeout_secs.max(1) as u64);

        let peer = match self.peers.get_or_create_pending(
            addr,
            correlation_id,
            client_salt,
            idle_timeout,
            now,
        ) {
            Ok(peer) => peer,
            Err(reason) => {
                log::warn!("Connection denied to {}: {}", addr, reason);
                let packet = Packet::new(
                    PacketHeader::new(0, 0, 0),
                    PacketType::ConnectionDenied {
                        reason: reason.to_string(),
                    },
                );
                self.endpoint.send_to(&packet, addr)?;
                return Ok(());
            }
        };

        if peer.link.lock().on_header(header, now).is_none() {
            return Ok(());
        }
        peer.touch(now);

        if peer.state == ConnectionState::Connected {
            return Ok(());
        }
        if peer.client_salt != client_salt || peer.correlation_id != correlation_id {
            log::debug!("Client {} restarted its handshake", addr);
            peer.client_salt = client_salt;
            peer.correlation_id = correlation_id;
        }

        let handle = peer.handle();
        let payload = PacketType::ConnectionChallenge {
            server_salt: peer.server_salt,
            challenge: peer.combined_salt(),
        };
        let header = peer.link.lock().next_header(now);
        self.endpoint.send_to(&Packet::new(header, payload), addr)?;

        if is_new {
            log::info!("Connection request from {}", addr);
            self.publish_remote_state(handle, ConnectionState::Connecting);
        }
        Ok(())
    }

    fn handle_challenge_response(
        &mut self,
        addr: SocketAddr,
        combined_salt: u64,
        now: Instant,
    ) -> io::Result<()> {
        let Some(peer) = self.peers.get_by_addr_mut(&addr) else {
            return Ok(());
        };

        if combined_salt != peer.combined_salt() {
            log::warn!("Invalid challenge response from {}", addr);
            return Ok(());
        }

        let authority_id = peer.authority_id;
        let header = peer.link.lock().next_header(now);
        let accepted = Packet::new(header, PacketType::ConnectionAccepted { authority_id });

        if peer.state == ConnectionState::Connected {
            // Our accept was lost; say it again.
            self.endpoint.send_to(&accepted, addr)?;
            return Ok(());
        }

        peer.state = ConnectionState::Connected;
        let session = self.endpoint.session_for(addr, Arc::clone(&peer.link));
        peer.connection = Some(self.context.open_connection(
            peer.handle(),
            Box::new(session),
            Arc::clone(&self.triage),
        ));
        let handle = peer.handle();
        self.endpoint.send_to(&accepted, addr)?;

        log::info!("Client {} connected from {}", authority_id, addr);
        self.grant_batch(authority_id);
        self.publish_remote_state(handle, ConnectionState::Connected);
        Ok(())
    }

    fn process_control(&mut self) {
        let pending: Vec<ControlReceived> = self.control_inbox.borrow_mut().drain(..).collect();

        for control in pending {
            let authority_id = control.from.authority_id;
            match control.message {
                ControlMessage::BatchRequest => self.grant_batch(authority_id),
                ControlMessage::TypeFlags { flags } => self.set_type_flags(authority_id, flags),
                ControlMessage::BatchGrant { .. } => {
                    log::warn!("Client {} sent a batch grant, ignoring", authority_id);
                }
            }
        }
    }

    fn grant_batch(&mut self, authority_id: AuthorityId) {
        let Some(peer) = self.peers.get_mut(authority_id) else {
            return;
        };
        let Some(conn) = peer.connection.as_mut() else {
            return;
        };

        let Some(batch_start) = self.ids.grant_batch() else {
            log::error!("Id space exhausted, no batch for client {}", authority_id);
            return;
        };

        match (ControlMessage::BatchGrant { batch_start }).send_on(conn) {
            Ok(_) => {
                peer.id_batches.push(batch_start);
                log::debug!("Granted batch {} to client {}", batch_start, authority_id);
            }
            Err(e) => {
                log::warn!("Failed to send batch to client {}: {}", authority_id, e);
                self.ids.release_batch(batch_start);
            }
        }
    }

    fn set_type_flags(&mut self, authority_id: AuthorityId, bits: u32) {
        let Some(peer) = self.peers.get_mut(authority_id) else {
            return;
        };
        let flags = ClientTypeFlags::from_bits_truncate(bits);
        if peer.type_flags == flags {
            return;
        }
        peer.type_flags = flags;

        let event = ClientTypeFlagsChanged {
            authority_id,
            flags,
        };
        if let Err(e) = self
            .context
            .bus()
            .publish_with(event, Route::from_source(authority_id))
        {
            log::error!("Failed to publish type flags for {}: {}", authority_id, e);
        }
    }

    fn release_peer(&mut self, mut peer: RemotePeer) {
        for batch_start in peer.id_batches.drain(..) {
            self.ids.release_batch(batch_start);
        }
        if let Some(conn) = peer.connection.as_mut() {
            conn.disconnect();
        }
        let state = match peer.state {
            ConnectionState::TimedOut => ConnectionState::TimedOut,
            _ => ConnectionState::Disconnected,
        };
        self.publish_remote_state(peer.handle(), state);
    }

    fn publish_remote_state(&self, handle: ConnectionHandle, state: ConnectionState) {
        self.context.publisher().publish(RemoteClientStateChanged {
            authority_id: handle.authority_id,
            correlation_id: handle.correlation_id,
            state,
        });
    }

    fn send_keepalives(&mut self, now: Instant) {
        let targets: Vec<(SocketAddr, PacketHeader)> = self
            .peers
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| (p.addr, p.link.lock().next_header(now)))
            .collect();

        for (addr, header) in targets {
            if let Err(e) = self
                .endpoint
                .send_to(&Packet::new(header, PacketType::KeepAlive), addr)
            {
                log::warn!("Keepalive to {} failed: {}", addr, e);
            }
        }
    }

    pub fn kick_client(&mut self, authority_id: AuthorityId) {
        let Some(peer) = self.peers.remove(authority_id) else {
            return;
        };
        let header = peer.link.lock().next_header(Instant::now());
        if let Err(e) = self
            .endpoint
            .send_to(&Packet::new(header, PacketType::Disconnect), peer.addr)
        {
            log::warn!("Failed to notify client {} of kick: {}", authority_id, e);
        }
        log::info!("Client {} kicked", authority_id);
        self.release_peer(peer);
    }

    pub fn shutdown(&mut self) {
        let ids: Vec<AuthorityId> = self.peers.iter().map(|p| p.authority_id).collect();
        for authority_id in ids {
            self.kick_client(authority_id);
        }
        self.context.bus().drain_deferred();
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            client_count: self.peers.connected_count(),
            max_clients: self.config.max_clients,
            granted_batches: self.ids.ledger().len(),
            scaler: self.context.scaler_stats(),
            network_stats: self.endpoint.stats().clone(),
        }
    }

    #[cfg(test)]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u64,
    pub client_count: usize,
    pub max_clients: usize,
    pub granted_batches: usize,
    pub scaler: ScalerStats,
    pub network_stats: NetworkStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync::event::EventBus;
    use netsync::ids::ClientIdAllocator;
    use netsync::net::{ClientLink, ConnectionState, LinkResources};
    use std::thread;

    fn test_config() -> ServerConfig {
        ServerConfig {
            tick_rate: 1000,
            max_clients: 4,
            sync: SyncConfig {
                compression: false,
                id_batch_size: 100,
                ..SyncConfig::default()
            },
        }
    }

    fn pump(server: &mut SyncServer, client: &mut ClientLink, bus: &EventBus, rounds: usize) {
        for _ in 0..rounds {
            server.tick_once(Instant::now());
            client.update(Instant::now()).unwrap();
            bus.drain_deferred();
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn client_for(server: &SyncServer, bus: &EventBus) -> ClientLink {
        let ctx = SyncContext::new(Arc::new(test_config().sync));
        let resources: LinkResources = ctx.link_resources();
        let triage = Arc::new(ControlTriage::new(bus.deferred_publisher()));
        let mut client = ClientLink::new("127.0.0.1:0", resources, triage, bus.deferred_publisher())
            .unwrap();
        client
            .connect("127.0.0.1", server.local_addr().port(), 5)
            .unwrap();
        client
    }

    #[test]
    fn connected_client_receives_a_batch() {
        let mut server = SyncServer::new("127.0.0.1:0", test_config()).unwrap();
        let bus = EventBus::new();
        let grants = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&grants);
        bus.subscribe::<ControlReceived>(move |envelope| {
            if let Some(ControlReceived {
                message: ControlMessage::BatchGrant { batch_start },
                ..
            }) = envelope.event_as::<ControlReceived>()
            {
                sink.borrow_mut().push(*batch_start);
            }
            Ok(())
        })
        .unwrap();

        let mut client = client_for(&server, &bus);
        pump(&mut server, &mut client, &bus, 100);

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(server.stats().client_count, 1);
        assert_eq!(grants.borrow().len(), 1);

        let mut allocator = ClientIdAllocator::new(&test_config().sync);
        assert!(allocator.add_batch(grants.borrow()[0]));
        assert!(allocator.try_allocate_next_id().is_some());
    }

    #[test]
    fn disconnect_releases_batches() {
        let mut server = SyncServer::new("127.0.0.1:0", test_config()).unwrap();
        let bus = EventBus::new();
        let mut client = client_for(&server, &bus);
        pump(&mut server, &mut client, &bus, 100);
        assert_eq!(server.stats().granted_batches, 1);

        client.disconnect();
        pump(&mut server, &mut client, &bus, 20);

        assert_eq!(server.stats().client_count, 0);
        assert_eq!(server.stats().granted_batches, 0);
    }

    #[test]
    fn batch_request_grants_another() {
        let mut server = SyncServer::new("127.0.0.1:0", test_config()).unwrap();
        let bus = EventBus::new();
        let mut client = client_for(&server, &bus);
        pump(&mut server, &mut client, &bus, 100);

        let conn = client.connection_mut().unwrap();
        ControlMessage::BatchRequest.send_on(conn).unwrap();
        ControlMessage::TypeFlags {
            flags: ClientTypeFlags::PLAYER_STANDARD.bits(),
        }
        .send_on(conn)
        .unwrap();
        pump(&mut server, &mut client, &bus, 20);

        assert_eq!(server.stats().granted_batches, 2);
        let peer = server.peers().iter().next().unwrap();
        assert_eq!(peer.id_batches.len(), 2);
        assert_eq!(peer.type_flags, ClientTypeFlags::PLAYER_STANDARD);
    }
}
