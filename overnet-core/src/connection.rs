//! Per-peer connection: the control stream, its lifecycle and gossip.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::endpoint::EndpointState;
use crate::identity::{NodeId, StreamId};
use crate::protocol::{PeerMessage, ReliabilityAndOrdering, PROTOCOL_VERSION};
use crate::slice::Slice;
use crate::status::Status;
use crate::stream::StreamState;
use crate::timer::{Timeout, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Known peer, nothing sent yet (no route, or not needed yet).
    Unconnected,
    /// Our `Hello` is out, theirs has not arrived.
    Connecting,
    Active,
    /// `Goodbye` sent, waiting for it to be acknowledged.
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Traffic for a peer stream whose fork we have not decoded yet.
#[derive(Debug, Default)]
pub(crate) struct EarlyStream {
    pub(crate) frames: BTreeMap<u64, Slice>,
    pub(crate) close: Option<(u64, Status)>,
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) state: ConnectionState,
    pub(crate) hello_sent: bool,
    /// Forks allocated by us so far.
    pub(crate) next_fork: u64,
    /// Stream ids that must never be accepted again.
    pub(crate) retired: HashSet<StreamId>,
    pub(crate) early: BTreeMap<StreamId, EarlyStream>,
    pub(crate) gossip: Option<Timeout>,
    pub(crate) gossip_interval: Duration,
}

impl Connection {
    fn new(gossip_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Unconnected,
            hello_sent: false,
            next_fork: 0,
            retired: HashSet::new(),
            early: BTreeMap::new(),
            gossip: None,
            gossip_interval,
        }
    }
}

/// Status given to forked streams when their connection goes away.
pub(crate) fn parent_closed(status: &Status) -> Status {
    let code = if status.is_ok() {
        crate::status::StatusCode::Cancelled
    } else {
        status.code()
    };
    Status::new(
        code,
        format!("parent connection closed: {}", status.reason()),
    )
}

impl EndpointState {
    /// Replace a missing or closed connection with a fresh record. Stream ids
    /// allocated under an earlier connection to the same peer stay used: the
    /// fork counter and the retired set carry over.
    pub(crate) fn open_connection_record(&mut self, peer: NodeId) {
        let mut conn = Connection::new(self.config.gossip_initial_interval);
        match self.connections.get_mut(&peer) {
            Some(old) if old.state != ConnectionState::Closed => return,
            Some(old) => {
                conn.next_fork = old.next_fork;
                conn.retired = std::mem::take(&mut old.retired);
            }
            None => {}
        }
        self.connections.insert(peer, conn);
        self.streams.insert(
            (peer, StreamId::CONNECTION),
            StreamState::new(
                ReliabilityAndOrdering::ReliableOrdered,
                self.config.recv_window,
            ),
        );
    }

    pub(crate) fn register_peer(&mut self, peer: NodeId) {
        if peer == self.own || self.closing {
            return;
        }
        self.open_connection_record(peer);
        self.start_connecting(peer);
    }

    fn hello(&self) -> PeerMessage {
        PeerMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            description: self.own_description(),
        }
    }

    fn send_hello(&mut self, peer: NodeId) {
        let hello = self.hello();
        self.send_control(peer, &hello);
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.hello_sent = true;
        }
    }

    pub(crate) fn start_connecting(&mut self, peer: NodeId) {
        let ready = !self.closing
            && self.router.is_reachable(peer)
            && self
                .connections
                .get(&peer)
                .map(|c| c.state == ConnectionState::Unconnected)
                .unwrap_or(false);
        if !ready {
            return;
        }
        debug!(node = %self.own, %peer, "connecting");
        self.send_hello(peer);
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.state = ConnectionState::Connecting;
        }
    }

    /// Start every registered peer that has become reachable.
    pub(crate) fn connect_pending(&mut self) {
        let waiting: Vec<NodeId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Unconnected)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in waiting {
            self.start_connecting(peer);
        }
    }

    /// Close every connection that no longer has a route.
    pub(crate) fn close_unreachable(&mut self) {
        let lost: Vec<NodeId> = self
            .connections
            .iter()
            .filter(|(peer, c)| {
                !matches!(c.state, ConnectionState::Unconnected | ConnectionState::Closed)
                    && !self.router.is_reachable(**peer)
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in lost {
            self.close_connection(peer, Status::unavailable("link lost"), false);
        }
    }

    /// Begin closing the connection to `peer`. Forked streams close at once;
    /// the control stream stays up until our `Goodbye` is acknowledged when
    /// `notify_peer` is set and the peer can be reached.
    pub(crate) fn close_connection(&mut self, peer: NodeId, status: Status, notify_peer: bool) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        if matches!(conn.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        let started = conn.hello_sent;
        conn.state = ConnectionState::Closing;
        conn.gossip = None;
        conn.early.clear();
        debug!(node = %self.own, %peer, %status, "closing connection");

        let parent = parent_closed(&status);
        let forked: Vec<StreamId> = self
            .streams
            .keys()
            .filter(|(p, id)| *p == peer && !id.is_connection())
            .map(|(_, id)| *id)
            .collect();
        for id in forked {
            self.close_locally((peer, id), parent.clone());
        }

        if notify_peer && started && self.router.is_reachable(peer) {
            self.send_control(peer, &PeerMessage::Goodbye { status });
        } else {
            self.finalize_connection(peer);
        }
    }

    pub(crate) fn finalize_connection(&mut self, peer: NodeId) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            if conn.state == ConnectionState::Closed {
                return;
            }
            conn.state = ConnectionState::Closed;
            conn.gossip = None;
            conn.early.clear();
        }
        self.streams.remove(&(peer, StreamId::CONNECTION));
        info!(node = %self.own, %peer, "connection closed");
        self.quiesce.notify_waiters();
    }

    /// The control stream ran out of retransmissions.
    pub(crate) fn control_unresponsive(&mut self, peer: NodeId) {
        let closing = self
            .connections
            .get(&peer)
            .map(|c| c.state == ConnectionState::Closing)
            .unwrap_or(false);
        if closing {
            self.finalize_connection(peer);
        } else {
            self.close_connection(peer, Status::unavailable("peer stopped responding"), false);
        }
    }

    pub(crate) fn all_closed(&self) -> bool {
        self.connections
            .values()
            .all(|c| c.state == ConnectionState::Closed)
    }

    pub(crate) fn on_peer_message(&mut self, peer: NodeId, message: PeerMessage) {
        let Some(state) = self.connections.get(&peer).map(|c| c.state) else {
            return;
        };
        if state == ConnectionState::Closing {
            if let PeerMessage::Goodbye { .. } = message {
                self.finalize_connection(peer);
            }
            return;
        }
        match message {
            PeerMessage::Hello {
                protocol_version,
                description,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(node = %self.own, %peer, protocol_version, "incompatible peer");
                    self.close_connection(
                        peer,
                        Status::failed_precondition(format!(
                            "protocol version {} not supported",
                            protocol_version
                        )),
                        true,
                    );
                    return;
                }
                self.router.update_description(peer, description);
                let hello_sent = self
                    .connections
                    .get(&peer)
                    .map(|c| c.hello_sent)
                    .unwrap_or(false);
                if !hello_sent {
                    self.send_hello(peer);
                }
                if state != ConnectionState::Active {
                    if let Some(conn) = self.connections.get_mut(&peer) {
                        conn.state = ConnectionState::Active;
                    }
                    info!(node = %self.own, %peer, "connection active");
                    let initial = self.config.gossip_initial_interval;
                    self.arm_gossip(peer, initial);
                }
            }
            _ if state != ConnectionState::Active => {
                self.close_connection(
                    peer,
                    Status::failed_precondition("expected hello"),
                    true,
                );
            }
            PeerMessage::Fork(frame) => {
                let stream_id = frame.stream_id;
                match self.unwrap_fork(peer, frame) {
                    Ok(intro) => self.deliver_intro(intro),
                    Err(status) => {
                        warn!(node = %self.own, %peer, stream = %stream_id, %status, "rejecting fork");
                        self.send_control(
                            peer,
                            &PeerMessage::CloseStream {
                                stream_id,
                                final_seq: 0,
                                status,
                            },
                        );
                    }
                }
            }
            PeerMessage::CloseStream {
                stream_id,
                final_seq,
                status,
            } => self.on_remote_close(peer, stream_id, final_seq, status),
            PeerMessage::Ping { nonce } => self.send_control(peer, &PeerMessage::Pong { nonce }),
            PeerMessage::Pong { nonce } => {
                let rtt = self.timer.now().saturating_since(Timestamp::from_micros(nonce));
                self.router.record_rtt(peer, rtt);
            }
            PeerMessage::Describe { node, description } => {
                self.router.update_description(node, description);
            }
            PeerMessage::LinkState { links } => {
                if self.router.update_link_state(peer, &links) {
                    self.connect_pending();
                }
            }
            PeerMessage::Goodbye { status } => {
                debug!(node = %self.own, %peer, %status, "peer said goodbye");
                self.close_connection(peer, status, false);
            }
        }
    }

    pub(crate) fn arm_gossip(&mut self, peer: NodeId, delay: Duration) {
        let weak = self.weak.clone();
        let timeout = Timeout::after(&self.timer, delay, move |status| {
            if status.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    inner.on_gossip_timer(peer);
                }
            }
        });
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.gossip_interval = delay;
            conn.gossip = Some(timeout);
        }
    }

    /// Local services or links changed: gossip again soon on every connection.
    pub(crate) fn reset_gossip(&mut self) {
        let active: Vec<NodeId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Active)
            .map(|(peer, _)| *peer)
            .collect();
        let initial = self.config.gossip_initial_interval;
        for peer in active {
            self.arm_gossip(peer, initial);
        }
    }

    pub(crate) fn gossip_round(&mut self, peer: NodeId) {
        let Some(conn) = self.connections.get(&peer) else {
            return;
        };
        if conn.state != ConnectionState::Active {
            return;
        }
        let next = (conn.gossip_interval * 2).min(self.config.gossip_max_interval);

        let mut messages = vec![PeerMessage::Describe {
            node: self.own,
            description: self.own_description(),
        }];
        messages.extend(
            self.router
                .descriptions()
                .filter(|(node, _)| *node != peer)
                .map(|(node, description)| PeerMessage::Describe {
                    node,
                    description: description.clone(),
                }),
        );
        messages.push(PeerMessage::LinkState {
            links: self.router.link_descriptions(),
        });
        messages.push(PeerMessage::Ping {
            nonce: self.timer.now().as_micros(),
        });
        for message in &messages {
            self.send_control(peer, message);
        }
        self.arm_gossip(peer, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use crate::test_util::{connect, endpoint, run_local, LossMode};

    #[test]
    fn parent_closed_keeps_failure_code() {
        let s = parent_closed(&Status::unavailable("link lost"));
        assert_eq!(s.code(), StatusCode::Unavailable);
        assert_eq!(s.reason(), "parent connection closed: link lost");
        assert_eq!(parent_closed(&Status::ok()).code(), StatusCode::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_reaches_active_on_both_sides() {
        run_local(async {
            let a = endpoint(1);
            let b = endpoint(2);
            a.register_peer(b.node_id());
            assert_eq!(a.connection_state(b.node_id()), Some(ConnectionState::Unconnected));
            connect(&a, &b, LossMode::DropFirstCopy);
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(a.connection_state(b.node_id()), Some(ConnectionState::Active));
            assert_eq!(b.connection_state(a.node_id()), Some(ConnectionState::Active));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn gossip_backs_off_and_resets() {
        run_local(async {
            let a = endpoint(1);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            tokio::time::sleep(Duration::from_secs(60)).await;
            let interval = |e: &crate::endpoint::RouterEndpoint, peer| {
                e.with_state(|st| st.connections.get(&peer).map(|c| c.gossip_interval))
            };
            assert_eq!(interval(&a, b.node_id()), Some(a.config().gossip_max_interval));

            a.register_service("svc");
            assert_eq!(
                interval(&a, b.node_id()),
                Some(a.config().gossip_initial_interval)
            );
        })
        .await;
    }
}
