use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ids::NetId;

use super::connection::{
    AUTHORITY_SERVER, AUTHORITY_UNSET, AuthorityId, ClientTypeFlags, Connection, ConnectionHandle,
    ConnectionState, CorrelationId,
};
use super::stats::rand_u64;
use super::tracking::LinkState;

/// Server-side record of one remote client.
#[derive(Debug)]
pub struct RemotePeer {
    pub addr: SocketAddr,
    pub correlation_id: CorrelationId,
    pub authority_id: AuthorityId,
    pub state: ConnectionState,
    pub client_salt: u64,
    pub server_salt: u64,
    pub idle_timeout: Duration,
    pub last_receive: Instant,
    pub link: Arc<Mutex<LinkState>>,
    pub connection: Option<Connection>,
    pub id_batches: Vec<NetId>,
    pub type_flags: ClientTypeFlags,
}

impl RemotePeer {
    fn new(
        addr: SocketAddr,
        authority_id: AuthorityId,
        correlation_id: CorrelationId,
        client_salt: u64,
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            correlation_id,
            authority_id,
            state: ConnectionState::Connecting,
            client_salt,
            server_salt: rand_u64(),
            idle_timeout,
            last_receive: now,
            link: Arc::new(Mutex::new(LinkState::new())),
            connection: None,
            id_batches: Vec::new(),
            type_flags: ClientTypeFlags::empty(),
        }
    }

    pub fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            correlation_id: self.correlation_id,
            authority_id: self.authority_id,
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_receive) > self.idle_timeout
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("server full")]
    Full,
}

/// Authority-side peer registry keyed by authority id and address.
#[derive(Debug)]
pub struct PeerTable {
    by_addr: HashMap<SocketAddr, AuthorityId>,
    peers: HashMap<AuthorityId, RemotePeer>,
    next_authority: AuthorityId,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_authority: 1,
            max_peers: max_peers.min(AUTHORITY_SERVER as usize - 1),
        }
    }

    /// Returns the existing record for `addr` or a fresh `Connecting` one.
    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
        correlation_id: CorrelationId,
        client_salt: u64,
        idle_timeout: Duration,
        now: Instant,
    ) -> Result<&mut RemotePeer, PeerError> {
        if let Some(id) = self.by_addr.get(&addr).copied() {
            if self.peers.contains_key(&id) {
                return self.peers.get_mut(&id).ok_or(PeerError::Full);
            }
            self.by_addr.remove(&addr);
        }

        if self.peers.len() >= self.max_peers {
            return Err(PeerError::Full);
        }

        let id = self.allocate_authority();
        let peer = RemotePeer::new(addr, id, correlation_id, client_salt, idle_timeout, now);
        self.by_addr.insert(addr, id);
        Ok(self.peers.entry(id).or_insert(peer))
    }

    fn allocate_authority(&mut self) -> AuthorityId {
        loop {
            let id = self.next_authority;
            self.next_authority = match self.next_authority.wrapping_add(1) {
                AUTHORITY_UNSET | AUTHORITY_SERVER => 1,
                next => next,
            };
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, authority_id: AuthorityId) -> Option<&RemotePeer> {
        self.peers.get(&authority_id)
    }

    pub fn get_mut(&mut self, authority_id: AuthorityId) -> Option<&mut RemotePeer> {
        self.peers.get_mut(&authority_id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&RemotePeer> {
        self.by_addr.get(addr).and_then(|id| self.peers.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut RemotePeer> {
        let id = *self.by_addr.get(addr)?;
        self.peers.get_mut(&id)
    }

    pub fn remove(&mut self, authority_id: AuthorityId) -> Option<RemotePeer> {
        let peer = self.peers.remove(&authority_id)?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<RemotePeer> {
        let id = self.by_addr.remove(addr)?;
        self.peers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemotePeer> {
        self.peers.values_mut()
    }

    /// Removes and returns every peer idle past its timeout, marked `TimedOut`.
    pub fn reap_timed_out(&mut self, now: Instant) -> Vec<RemotePeer> {
        let expired: Vec<AuthorityId> = self
            .peers
            .values()
            .filter(|p| p.is_timed_out(now))
            .map(|p| p.authority_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.remove(id))
            .map(|mut peer| {
                peer.state = ConnectionState::TimedOut;
                if let Some(conn) = peer.connection.as_mut() {
                    conn.disconnect();
                }
                peer
            })
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
