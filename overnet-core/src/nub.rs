//! Packet nub: turns any datagram transport into mesh links.
//!
//! Handshake per address: `Announce` -> `Hello` -> `HelloAck`. Each packet
//! carries the sender's node id and a fresh X25519 key generated for that
//! handshake, so every link gets its own key and nonces start at zero.
//! The answering side publishes its link on `HelloAck` or on the first data
//! packet that decrypts, whichever comes first.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::NubConfig;
use crate::endpoint::RouterEndpoint;
use crate::identity::{
    decrypt_wire, derive_session_key, direction_bit, encrypt_wire, CryptoError, Keypair, NodeId,
    PublicKey,
};
use crate::protocol::PROTOCOL_VERSION;
use crate::router::Link;
use crate::slice::Slice;
use crate::status::Status;
use crate::timer::{Timeout, Timestamp};

/// Outbound half of a datagram transport.
///
/// `send_to` must not call back into the nub or the endpoint synchronously.
pub trait PacketSender<A> {
    fn send_to(&self, addr: &A, packet: &[u8]) -> Result<(), Status>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NubPacket {
    Announce {
        version: u8,
        node: NodeId,
        key: PublicKey,
    },
    Hello {
        version: u8,
        node: NodeId,
        key: PublicKey,
    },
    HelloAck {
        version: u8,
        node: NodeId,
        key: PublicKey,
    },
    /// One routed frame sealed with the link key.
    Data { nonce: u64, ciphertext: Vec<u8> },
}

impl NubPacket {
    pub fn encode(&self) -> Result<Vec<u8>, NubError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NubError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NubError {
    #[error("packet codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("datagram of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<NubError> for Status {
    fn from(e: NubError) -> Self {
        match e {
            NubError::Codec(_) => Status::failed_precondition(e.to_string()),
            NubError::TooLarge { .. } => Status::resource_exhausted(e.to_string()),
            NubError::Crypto(c) => c.into(),
        }
    }
}

/// Sliding window of the last 64 nonces accepted on a link.
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    fn accept(&mut self, nonce: u64) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(nonce);
            self.bitmap = 1;
            return true;
        };
        if nonce > highest {
            let shift = nonce - highest;
            self.bitmap = if shift >= 64 { 1 } else { (self.bitmap << shift) | 1 };
            self.highest = Some(nonce);
            return true;
        }
        let back = highest - nonce;
        if back >= 64 {
            return false;
        }
        let bit = 1u64 << back;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// Key material shared by a session and the link it publishes.
struct LinkKeys {
    own: NodeId,
    peer: NodeId,
    key: [u8; 32],
    next_nonce: Cell<u64>,
}

/// Link over one peer address, installed in the endpoint's router.
pub struct NubLink<A> {
    addr: A,
    keys: Rc<LinkKeys>,
    sender: Rc<dyn PacketSender<A>>,
    max_datagram_size: usize,
}

impl<A: fmt::Debug> NubLink<A> {
    fn seal(&self, frame: &[u8]) -> Result<Vec<u8>, NubError> {
        let nonce = self.keys.next_nonce.get();
        let ciphertext = encrypt_wire(
            &self.keys.key,
            direction_bit(self.keys.own, self.keys.peer),
            nonce,
            frame,
        )?;
        let packet = NubPacket::Data { nonce, ciphertext }.encode()?;
        if packet.len() > self.max_datagram_size {
            return Err(NubError::TooLarge {
                size: packet.len(),
                max: self.max_datagram_size,
            });
        }
        self.keys.next_nonce.set(nonce + 1);
        Ok(packet)
    }
}

impl<A: fmt::Debug> Link for NubLink<A> {
    fn peer(&self) -> NodeId {
        self.keys.peer
    }

    fn forward(&self, frame: Slice) -> Result<(), Status> {
        let packet = self.seal(&frame)?;
        self.sender.send_to(&self.addr, &packet)
    }

    fn describe(&self) -> String {
        format!("packet link to {} at {:?}", self.keys.peer, self.addr)
    }
}

struct Session {
    keys: Rc<LinkKeys>,
    /// Handshake key the peer used; a different one means it restarted.
    their_key: PublicKey,
    /// Answer repeated when the peer resends its last handshake packet.
    reply: Vec<u8>,
    replay: ReplayWindow,
    last_seen: Timestamp,
    published: bool,
}

enum AddressState {
    /// Our `Announce` is out; waiting for `Hello`.
    Announcing {
        keypair: Keypair,
        announce: Vec<u8>,
        attempts: u32,
        retry: Option<Timeout>,
    },
    Session(Session),
}

struct NubState<A> {
    addresses: HashMap<A, AddressState>,
    /// Address currently carrying each peer's published link.
    peers: HashMap<NodeId, A>,
}

struct NubInner<A> {
    endpoint: RouterEndpoint,
    sender: Rc<dyn PacketSender<A>>,
    config: NubConfig,
    state: RefCell<NubState<A>>,
}

/// Something the nub must tell the endpoint after releasing its own borrow.
enum Effect<A> {
    Publish(NubLink<A>),
    Deliver(NodeId, Slice),
    Remove(NodeId),
}

/// Datagram-to-link adapter for one endpoint. Cheap to clone.
pub struct PacketNub<A> {
    inner: Rc<NubInner<A>>,
}

impl<A> Clone for PacketNub<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> PacketNub<A>
where
    A: Clone + Eq + Hash + fmt::Debug + 'static,
{
    pub fn new(
        endpoint: RouterEndpoint,
        sender: Rc<dyn PacketSender<A>>,
        config: NubConfig,
    ) -> Self {
        Self {
            inner: Rc::new(NubInner {
                endpoint,
                sender,
                config,
                state: RefCell::new(NubState {
                    addresses: HashMap::new(),
                    peers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn endpoint(&self) -> &RouterEndpoint {
        &self.inner.endpoint
    }

    fn own(&self) -> NodeId {
        self.inner.endpoint.node_id()
    }

    fn send(&self, addr: &A, packet: &[u8]) {
        if let Err(e) = self.inner.sender.send_to(addr, packet) {
            trace!(node = %self.own(), ?addr, error = %e, "datagram not sent");
        }
    }

    fn handshake_packet(
        &self,
        make: fn(u8, NodeId, PublicKey) -> NubPacket,
        key: &PublicKey,
    ) -> Result<Vec<u8>, NubError> {
        make(PROTOCOL_VERSION, self.own(), key.clone()).encode()
    }

    /// Start a handshake with `addr`, typically after discovery reported it.
    /// Does nothing if the address is already linked or handshaking.
    pub fn initiate(&self, addr: A) -> Result<(), Status> {
        if self.inner.state.borrow().addresses.contains_key(&addr) {
            return Ok(());
        }
        let keypair = Keypair::generate();
        let announce = self.handshake_packet(
            |version, node, key| NubPacket::Announce { version, node, key },
            keypair.public_key(),
        )?;
        debug!(node = %self.own(), ?addr, "announcing");
        self.send(&addr, &announce);
        let retry = self.arm_announce(addr.clone());
        self.inner.state.borrow_mut().addresses.insert(
            addr,
            AddressState::Announcing {
                keypair,
                announce,
                attempts: 1,
                retry: Some(retry),
            },
        );
        Ok(())
    }

    fn arm_announce(&self, addr: A) -> Timeout {
        let weak: Weak<NubInner<A>> = Rc::downgrade(&self.inner);
        Timeout::after(
            &self.inner.endpoint.timer(),
            self.inner.config.announce_interval,
            move |status| {
                if !status.is_ok() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    PacketNub { inner }.on_announce_timer(addr);
                }
            },
        )
    }

    fn on_announce_timer(&self, addr: A) {
        let mut st = self.inner.state.borrow_mut();
        let Some(AddressState::Announcing {
            announce, attempts, ..
        }) = st.addresses.get_mut(&addr)
        else {
            return;
        };
        if *attempts >= self.inner.config.max_announce_attempts {
            warn!(node = %self.own(), ?addr, attempts = *attempts, "no answer to announce, giving up");
            st.addresses.remove(&addr);
            return;
        }
        *attempts += 1;
        trace!(node = %self.own(), ?addr, attempt = *attempts, "re-announcing");
        let packet = announce.clone();
        drop(st);
        self.send(&addr, &packet);
        let retry = self.arm_announce(addr.clone());
        if let Some(AddressState::Announcing { retry: slot, .. }) =
            self.inner.state.borrow_mut().addresses.get_mut(&addr)
        {
            *slot = Some(retry);
        }
    }

    /// Feed one datagram received from `from`.
    pub fn process(&self, now: Timestamp, from: A, packet: &[u8]) {
        let packet = match NubPacket::decode(packet) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(node = %self.own(), addr = ?from, error = %e, "dropping malformed datagram");
                return;
            }
        };
        let effects = match packet {
            NubPacket::Announce { version, node, key } => {
                self.check_handshake(version, node, &from)
                    .and_then(|()| self.on_announce(now, &from, node, key))
            }
            NubPacket::Hello { version, node, key } => self
                .check_handshake(version, node, &from)
                .and_then(|()| self.on_hello(now, &from, node, key)),
            NubPacket::HelloAck { version, node, key } => self
                .check_handshake(version, node, &from)
                .map(|()| self.on_hello_ack(now, &from, node, &key)),
            NubPacket::Data { nonce, ciphertext } => {
                Ok(self.on_data(now, &from, nonce, &ciphertext))
            }
        };
        match effects {
            Ok(effects) => self.apply(effects),
            Err(e) => debug!(node = %self.own(), addr = ?from, error = %e, "handshake packet rejected"),
        }
    }

    fn check_handshake(&self, version: u8, node: NodeId, from: &A) -> Result<(), Status> {
        if version != PROTOCOL_VERSION {
            return Err(Status::failed_precondition(format!(
                "protocol version {} from {:?}, expected {}",
                version, from, PROTOCOL_VERSION
            )));
        }
        if node == self.own() {
            return Err(Status::invalid_argument("handshake from our own node id"));
        }
        Ok(())
    }

    fn new_session(
        &self,
        now: Timestamp,
        keypair: &Keypair,
        peer: NodeId,
        their_key: PublicKey,
        reply: Vec<u8>,
    ) -> Session {
        let shared = keypair.shared_secret(&their_key);
        Session {
            keys: Rc::new(LinkKeys {
                own: self.own(),
                peer,
                key: derive_session_key(&shared, self.own(), peer),
                next_nonce: Cell::new(0),
            }),
            their_key,
            reply,
            replay: ReplayWindow::default(),
            last_seen: now,
            published: false,
        }
    }

    fn link_for(&self, addr: &A, session: &Session) -> NubLink<A> {
        NubLink {
            addr: addr.clone(),
            keys: session.keys.clone(),
            sender: self.inner.sender.clone(),
            max_datagram_size: self.inner.config.max_datagram_size,
        }
    }

    fn on_announce(
        &self,
        now: Timestamp,
        from: &A,
        peer: NodeId,
        their_key: PublicKey,
    ) -> Result<Vec<Effect<A>>, Status> {
        let mut st = self.inner.state.borrow_mut();
        match st.addresses.get_mut(from) {
            Some(AddressState::Session(s)) if s.their_key == their_key => {
                s.last_seen = now;
                let reply = s.reply.clone();
                drop(st);
                self.send(from, &reply);
                return Ok(Vec::new());
            }
            // Both sides announced; the lower node id's handshake wins.
            Some(AddressState::Announcing { .. }) if self.own() < peer => {
                trace!(node = %self.own(), %peer, "ignoring crossed announce");
                return Ok(Vec::new());
            }
            _ => {}
        }
        let keypair = Keypair::generate();
        let hello = self.handshake_packet(
            |version, node, key| NubPacket::Hello { version, node, key },
            keypair.public_key(),
        )?;
        let session = self.new_session(now, &keypair, peer, their_key, hello.clone());
        debug!(node = %self.own(), %peer, addr = ?from, "answering announce");
        st.addresses
            .insert(from.clone(), AddressState::Session(session));
        drop(st);
        self.send(from, &hello);
        Ok(Vec::new())
    }

    fn on_hello(
        &self,
        now: Timestamp,
        from: &A,
        peer: NodeId,
        their_key: PublicKey,
    ) -> Result<Vec<Effect<A>>, Status> {
        let mut st = self.inner.state.borrow_mut();
        if let Some(AddressState::Session(s)) = st.addresses.get_mut(from) {
            if s.their_key == their_key {
                // Our HelloAck was lost.
                s.last_seen = now;
                let reply = s.reply.clone();
                drop(st);
                self.send(from, &reply);
                return Ok(Vec::new());
            }
        }
        let keypair = match st.addresses.remove(from) {
            Some(AddressState::Announcing { keypair, .. }) => keypair,
            other => {
                if let Some(state) = other {
                    st.addresses.insert(from.clone(), state);
                }
                return Err(Status::failed_precondition("hello without a pending announce"));
            }
        };
        let ack = self.handshake_packet(
            |version, node, key| NubPacket::HelloAck { version, node, key },
            keypair.public_key(),
        )?;
        let mut session = self.new_session(now, &keypair, peer, their_key, ack.clone());
        session.published = true;
        let link = self.link_for(from, &session);
        st.addresses
            .insert(from.clone(), AddressState::Session(session));
        st.peers.insert(peer, from.clone());
        drop(st);
        debug!(node = %self.own(), %peer, addr = ?from, "link established");
        self.send(from, &ack);
        Ok(vec![Effect::Publish(link)])
    }

    fn on_hello_ack(
        &self,
        now: Timestamp,
        from: &A,
        peer: NodeId,
        their_key: &PublicKey,
    ) -> Vec<Effect<A>> {
        let mut st = self.inner.state.borrow_mut();
        let Some(AddressState::Session(s)) = st.addresses.get_mut(from) else {
            return Vec::new();
        };
        if s.keys.peer != peer || &s.their_key != their_key {
            trace!(node = %self.own(), %peer, "stale hello ack");
            return Vec::new();
        }
        s.last_seen = now;
        if s.published {
            return Vec::new();
        }
        s.published = true;
        let link = self.link_for(from, s);
        st.peers.insert(peer, from.clone());
        debug!(node = %self.own(), %peer, addr = ?from, "link established");
        vec![Effect::Publish(link)]
    }

    fn on_data(&self, now: Timestamp, from: &A, nonce: u64, ciphertext: &[u8]) -> Vec<Effect<A>> {
        let mut st = self.inner.state.borrow_mut();
        let Some(AddressState::Session(s)) = st.addresses.get_mut(from) else {
            trace!(node = %self.own(), addr = ?from, "data from unknown address");
            return Vec::new();
        };
        let keys = s.keys.clone();
        let plain = match decrypt_wire(
            &keys.key,
            direction_bit(keys.peer, keys.own),
            nonce,
            ciphertext,
        ) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(node = %self.own(), peer = %keys.peer, error = %e, "dropping undecryptable datagram");
                return Vec::new();
            }
        };
        if !s.replay.accept(nonce) {
            trace!(node = %self.own(), peer = %keys.peer, nonce, "replayed datagram");
            return Vec::new();
        }
        s.last_seen = now;
        let mut effects = Vec::new();
        if !s.published {
            s.published = true;
            effects.push(Effect::Publish(self.link_for(from, s)));
            st.peers.insert(keys.peer, from.clone());
            debug!(node = %self.own(), peer = %keys.peer, addr = ?from, "link established by data");
        }
        effects.push(Effect::Deliver(keys.peer, Slice::from(plain)));
        effects
    }

    fn apply(&self, effects: Vec<Effect<A>>) {
        for effect in effects {
            match effect {
                Effect::Publish(link) => self.inner.endpoint.publish_link(Box::new(link)),
                Effect::Deliver(peer, frame) => self.inner.endpoint.on_link_frame(peer, frame),
                Effect::Remove(peer) => self.inner.endpoint.remove_link(peer),
            }
        }
    }

    fn forget(st: &mut NubState<A>, addr: &A) -> Option<Effect<A>> {
        match st.addresses.remove(addr)? {
            AddressState::Session(s) if s.published => {
                let peer = s.keys.peer;
                if st.peers.get(&peer) == Some(addr) {
                    st.peers.remove(&peer);
                    return Some(Effect::Remove(peer));
                }
                None
            }
            _ => None,
        }
    }

    /// The transport lost `addr`; drop its handshake or link.
    pub fn remove_address(&self, addr: &A) {
        let effect = Self::forget(&mut self.inner.state.borrow_mut(), addr);
        if effect.is_some() {
            debug!(node = %self.own(), ?addr, "address removed");
        }
        self.apply(effect.into_iter().collect());
    }

    /// Remove sessions silent for longer than the idle timeout.
    pub fn expire_idle(&self) {
        let now = self.inner.endpoint.timer().now();
        let idle = self.inner.config.link_idle_timeout;
        let effects: Vec<Effect<A>> = {
            let mut st = self.inner.state.borrow_mut();
            let stale: Vec<A> = st
                .addresses
                .iter()
                .filter_map(|(addr, state)| match state {
                    AddressState::Session(s) if now.saturating_since(s.last_seen) > idle => {
                        Some(addr.clone())
                    }
                    _ => None,
                })
                .collect();
            stale
                .iter()
                .filter_map(|addr| {
                    debug!(node = %self.own(), ?addr, "link idle, expiring");
                    Self::forget(&mut st, addr)
                })
                .collect()
        };
        self.apply(effects);
    }

    /// Peer whose link runs over `addr`, once the handshake completed.
    pub fn peer_at(&self, addr: &A) -> Option<NodeId> {
        match self.inner.state.borrow().addresses.get(addr) {
            Some(AddressState::Session(s)) if s.published => Some(s.keys.peer),
            _ => None,
        }
    }

    /// Addresses still waiting for an answer to our announce.
    pub fn pending_handshakes(&self) -> usize {
        self.inner
            .state
            .borrow()
            .addresses
            .values()
            .filter(|s| matches!(s, AddressState::Announcing { .. }))
            .count()
    }
}
