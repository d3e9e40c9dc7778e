//! Per-node API: peers, streams, forks and the services this node offers.
//!
//! All state lives in one `RefCell` that is never held across an `.await`.
//! Timer callbacks and link deliveries re-borrow it from a fresh task.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::codec::{Discard, ForkUnwrapper};
use crate::config::EndpointConfig;
use crate::connection::{Connection, ConnectionState};
use crate::identity::{NodeId, StreamId};
use crate::protocol::{
    ForkFrame, Introduction, NodeDescription, PeerMessage, ReliabilityAndOrdering,
};
use crate::router::{Link, LinkMetrics, Router};
use crate::slice::Slice;
use crate::status::Status;
use crate::stream::{NewStream, ReceivedIntroduction, StreamState};
use crate::timer::{Timeout, Timer};
use crate::wire::{self, Frame, FrameHeader, FrameKind};

pub(crate) type StreamKey = (NodeId, StreamId);

type IntroResult = Result<ReceivedIntroduction, Status>;

pub(crate) struct EndpointInner {
    pub(crate) node_id: NodeId,
    pub(crate) config: EndpointConfig,
    pub(crate) timer: Rc<dyn Timer>,
    pub(crate) state: RefCell<EndpointState>,
    quiesce: Rc<Notify>,
}

impl EndpointInner {
    fn on_retransmit_timer(&self, key: StreamKey) {
        self.state.borrow_mut().retransmit(key);
    }

    pub(crate) fn on_gossip_timer(&self, peer: NodeId) {
        self.state.borrow_mut().gossip_round(peer);
    }
}

pub(crate) struct EndpointState {
    pub(crate) own: NodeId,
    pub(crate) config: EndpointConfig,
    pub(crate) timer: Rc<dyn Timer>,
    pub(crate) weak: Weak<EndpointInner>,
    pub(crate) quiesce: Rc<Notify>,
    pub(crate) router: Router,
    pub(crate) connections: BTreeMap<NodeId, Connection>,
    pub(crate) streams: HashMap<StreamKey, StreamState>,
    services: BTreeSet<String>,
    label: Option<String>,
    description_version: u64,
    intro_queue: VecDeque<ReceivedIntroduction>,
    intro_waiters: VecDeque<oneshot::Sender<IntroResult>>,
    pub(crate) closing: bool,
}

impl Drop for EndpointState {
    fn drop(&mut self) {
        // The endpoint is going away with nobody left to accept these.
        for intro in self.intro_queue.drain(..) {
            let _ = intro.new_stream.into_parts();
        }
    }
}

/// Outcome of one attempt to queue a message on a stream.
pub(crate) enum PushAttempt {
    Sent,
    Full,
    Closed(Status),
}

pub(crate) enum PullAttempt {
    Message(Slice),
    Empty,
    Closed(Status),
}

/// Status reported to stream users once a stream is closed.
fn closed_error(status: &Status) -> Status {
    if status.is_ok() {
        Status::cancelled("stream closed")
    } else {
        status.clone()
    }
}

impl EndpointState {
    pub(crate) fn own_description(&self) -> NodeDescription {
        NodeDescription {
            version: self.description_version,
            label: self.label.clone(),
            services: self.services.clone(),
        }
    }

    fn description_changed(&mut self) {
        self.description_version += 1;
        self.reset_gossip();
    }

    /// Encode and hand one frame to the router. Send failures are not
    /// reported; reliable streams recover through retransmission.
    pub(crate) fn transmit(
        &mut self,
        peer: NodeId,
        stream_id: StreamId,
        kind: FrameKind,
        payload: &[u8],
    ) {
        let header = FrameHeader {
            src: self.own,
            dst: peer,
            stream_id,
            kind,
        };
        let frame = match wire::encode_frame(&header, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %self.own, %peer, stream = %stream_id, error = %e, "cannot encode frame");
                return;
            }
        };
        if let Err(e) = self.router.forward(peer, frame) {
            trace!(node = %self.own, %peer, error = %e, "frame not sent");
        }
    }

    pub(crate) fn send_data(&mut self, key: StreamKey, payload: Slice) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        let seq = stream.send.record_sent(payload.clone());
        let reliable = stream.reliability.is_reliable();
        self.transmit(key.0, key.1, FrameKind::Data { seq }, &payload);
        if reliable {
            self.arm_retransmit(key);
        }
    }

    pub(crate) fn send_control(&mut self, peer: NodeId, message: &PeerMessage) {
        match message.encode() {
            Ok(bytes) => self.send_data((peer, StreamId::CONNECTION), bytes),
            Err(e) => warn!(node = %self.own, %peer, error = %e, "cannot encode control message"),
        }
    }

    fn arm_retransmit(&mut self, key: StreamKey) {
        let delay = match self.streams.get(&key) {
            Some(s) if s.retransmit.is_none() && !s.send.is_drained() => {
                self.config.retransmit_delay(s.send.retries() + 1)
            }
            _ => return,
        };
        let weak = self.weak.clone();
        let timeout = Timeout::after(&self.timer, delay, move |status| {
            if status.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    inner.on_retransmit_timer(key);
                }
            }
        });
        if let Some(s) = self.streams.get_mut(&key) {
            s.retransmit = Some(timeout);
        }
    }

    fn retransmit(&mut self, key: StreamKey) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        stream.retransmit = None;
        if stream.send.is_drained() || stream.closed.is_some() {
            return;
        }
        let heard = stream.send.take_heard();
        let round = stream.send.bump_retries();
        if round > self.config.max_retransmits && heard {
            // The peer is alive and holding our data for a slow reader.
            stream.send.clamp_retries(self.config.max_retransmits);
        } else if round > self.config.max_retransmits {
            debug!(node = %self.own, peer = %key.0, stream = %key.1, "giving up after {} rounds", round - 1);
            if key.1.is_connection() {
                self.control_unresponsive(key.0);
            } else {
                self.abort_stream(key, Status::unavailable("peer stopped acknowledging"));
            }
            return;
        }
        let pending: Vec<(u64, Slice)> = stream
            .send
            .outstanding()
            .map(|(seq, payload)| (seq, payload.clone()))
            .collect();
        trace!(node = %self.own, peer = %key.0, stream = %key.1, round, count = pending.len(), "retransmit");
        for (seq, payload) in pending {
            self.transmit(key.0, key.1, FrameKind::Data { seq }, &payload);
        }
        self.arm_retransmit(key);
    }

    /// Close a stream on this side only: wake its users, stop retransmitting.
    pub(crate) fn close_locally(&mut self, key: StreamKey, status: Status) {
        if let Some(s) = self.streams.get_mut(&key) {
            if s.closed.is_none() {
                s.closed = Some(status);
                s.send.abandon();
                s.retransmit = None;
                s.notify.notify_waiters();
            }
        }
    }

    /// Close a stream and tell the peer at once, without draining.
    fn abort_stream(&mut self, key: StreamKey, status: Status) {
        let Some(s) = self.streams.get(&key) else {
            return;
        };
        if s.closed.is_some() {
            return;
        }
        let final_seq = s.send.next_seq();
        self.close_locally(key, status.clone());
        self.send_close_stream(key, final_seq, status);
    }

    fn send_close_stream(&mut self, key: StreamKey, final_seq: u64, status: Status) {
        let live = self
            .connections
            .get(&key.0)
            .map(|c| matches!(c.state, ConnectionState::Connecting | ConnectionState::Active))
            .unwrap_or(false);
        if live {
            self.send_control(
                key.0,
                &PeerMessage::CloseStream {
                    stream_id: key.1,
                    final_seq,
                    status,
                },
            );
        }
    }

    fn retire(&mut self, key: StreamKey) {
        if let Some(conn) = self.connections.get_mut(&key.0) {
            conn.retired.insert(key.1);
        }
    }

    pub(crate) fn handle_frame(&mut self, frame: Frame) {
        let peer = frame.header.src;
        let id = frame.header.stream_id;
        match frame.header.kind {
            FrameKind::Ack { seq } => self.on_ack((peer, id), seq),
            FrameKind::Held { seq } => self.on_held((peer, id), seq),
            FrameKind::Data { seq } if id.is_connection() => {
                self.on_control_data(peer, seq, frame.payload)
            }
            FrameKind::Data { seq } => self.on_stream_data((peer, id), seq, frame.payload),
        }
    }

    fn on_ack(&mut self, key: StreamKey, seq: u64) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if !stream.send.ack(seq) {
            return;
        }
        if stream.send.is_drained() {
            stream.retransmit = None;
        }
        stream.notify.notify_waiters();
        let drained = stream.send.is_drained();
        if key.1.is_connection() && drained {
            let closing = self
                .connections
                .get(&key.0)
                .map(|c| c.state == ConnectionState::Closing)
                .unwrap_or(false);
            if closing {
                self.finalize_connection(key.0);
            }
        }
    }

    fn on_held(&mut self, key: StreamKey, seq: u64) {
        if let Some(stream) = self.streams.get_mut(&key) {
            if stream.send.hold(seq) {
                trace!(node = %self.own, peer = %key.0, stream = %key.1, seq, "held by peer");
            }
        }
    }

    fn on_control_data(&mut self, peer: NodeId, seq: u64, payload: Slice) {
        let fresh = self
            .connections
            .get(&peer)
            .map(|c| c.state == ConnectionState::Closed)
            .unwrap_or(true);
        if fresh {
            if seq != 0 || self.closing {
                debug!(node = %self.own, %peer, seq, "control data without a connection");
                return;
            }
            self.open_connection_record(peer);
        }
        let key = (peer, StreamId::CONNECTION);
        let Some(control) = self.streams.get_mut(&key) else {
            return;
        };
        // Control messages are consumed as they are delivered.
        let received = control.recv.on_data(seq, payload, 0);
        if received.refused {
            trace!(node = %self.own, %peer, seq, "control data beyond window");
            return;
        }
        self.transmit(peer, StreamId::CONNECTION, FrameKind::Ack { seq }, &[]);
        for (_, bytes) in received.deliver {
            let state = self.connections.get(&peer).map(|c| c.state);
            if matches!(state, None | Some(ConnectionState::Closed)) {
                break;
            }
            match PeerMessage::decode(&bytes) {
                Ok(message) => self.on_peer_message(peer, message),
                Err(e) => {
                    warn!(node = %self.own, %peer, error = %e, "bad control message");
                    self.close_connection(peer, e, true);
                    break;
                }
            }
        }
    }

    /// Reliable data is acknowledged once the reader pulls it, so a slow
    /// reader holds back the sender's window. Until then a retransmitted
    /// copy is answered with `Held`.
    fn on_stream_data(&mut self, key: StreamKey, seq: u64, payload: Slice) {
        if let Some(s) = self.streams.get_mut(&key) {
            let reliable = s.reliability.is_reliable();
            if s.closed.is_some() {
                if reliable {
                    self.transmit(key.0, key.1, FrameKind::Ack { seq }, &[]);
                }
                return;
            }
            let received = s.recv.on_data(seq, payload, s.inbox.len());
            // Fresh data waits for the pull; refused data waits for a resend.
            let reply = (reliable && received.discarded).then(|| {
                if s.recv.holds(seq) || s.inbox.iter().any(|(q, _)| *q == seq) {
                    FrameKind::Held { seq }
                } else {
                    FrameKind::Ack { seq }
                }
            });
            if received.refused {
                trace!(node = %self.own, peer = %key.0, stream = %key.1, seq, "data beyond receive window");
            }
            if !received.deliver.is_empty() {
                s.inbox.extend(received.deliver);
                s.notify.notify_waiters();
            }
            if let Some(kind) = reply {
                self.transmit(key.0, key.1, kind, &[]);
            }
            self.try_apply_remote_close(key);
            return;
        }
        if self.buffer_early(key, |early, max| {
            if early.frames.len() < max || early.frames.contains_key(&seq) {
                early.frames.insert(seq, payload);
                true
            } else {
                false
            }
        }) {
            self.transmit(key.0, key.1, FrameKind::Ack { seq }, &[]);
        } else {
            trace!(node = %self.own, peer = %key.0, stream = %key.1, seq, "dropping data for unknown stream");
        }
    }

    /// Run `f` on the early buffer for a peer-allocated stream whose fork has
    /// not been seen. Returns false when the stream cannot be buffered.
    fn buffer_early(
        &mut self,
        key: StreamKey,
        f: impl FnOnce(&mut crate::connection::EarlyStream, usize) -> bool,
    ) -> bool {
        let own = self.own;
        let max = self.config.max_early_frames;
        let Some(conn) = self.connections.get_mut(&key.0) else {
            return false;
        };
        if conn.state != ConnectionState::Active
            || !key.1.allocated_by(key.0, own)
            || conn.retired.contains(&key.1)
        {
            return false;
        }
        if !conn.early.contains_key(&key.1) && conn.early.len() >= max {
            return false;
        }
        f(conn.early.entry(key.1).or_default(), max)
    }

    pub(crate) fn on_remote_close(
        &mut self,
        peer: NodeId,
        stream_id: StreamId,
        final_seq: u64,
        status: Status,
    ) {
        let key = (peer, stream_id);
        match self.streams.get_mut(&key) {
            Some(s) => {
                if s.closed.is_none() {
                    s.remote_close = Some((final_seq, status));
                    self.try_apply_remote_close(key);
                }
            }
            None => {
                self.buffer_early(key, |early, _| {
                    early.close = Some((final_seq, status));
                    true
                });
            }
        }
    }

    fn try_apply_remote_close(&mut self, key: StreamKey) {
        let Some(s) = self.streams.get(&key) else {
            return;
        };
        let ready = match (&s.remote_close, &s.closed) {
            (Some((final_seq, status)), None) => {
                (!status.is_ok() || s.recv.is_complete(*final_seq)).then(|| status.clone())
            }
            _ => None,
        };
        if let Some(status) = ready {
            debug!(node = %self.own, peer = %key.0, stream = %key.1, %status, "closed by peer");
            self.close_locally(key, status);
        }
    }

    /// Reserve a locally allocated stream towards `peer`.
    fn reserve_local(
        &mut self,
        peer: NodeId,
        reliability: ReliabilityAndOrdering,
    ) -> Result<StreamId, Status> {
        if peer == self.own {
            return Err(Status::invalid_argument("cannot open a stream to the local node"));
        }
        if self.closing {
            return Err(Status::cancelled("endpoint is closing"));
        }
        if !self.router.is_reachable(peer) {
            return Err(Status::unavailable(format!("no route to {}", peer)));
        }
        self.register_peer(peer);
        let own = self.own;
        let conn = self
            .connections
            .get_mut(&peer)
            .ok_or_else(|| Status::internal("connection missing after registration"))?;
        if conn.state == ConnectionState::Closing {
            return Err(Status::unavailable(format!("connection to {} is closing", peer)));
        }
        // Streams from an earlier connection may still be held open by
        // their handles.
        let id = loop {
            conn.next_fork += 1;
            let id = StreamId::for_fork(own, peer, conn.next_fork);
            if !conn.retired.contains(&id) && !self.streams.contains_key(&(peer, id)) {
                break id;
            }
        };
        match self.streams.entry((peer, id)) {
            Entry::Occupied(_) => return Err(Status::internal(format!("stream {} in use", id))),
            Entry::Vacant(slot) => {
                slot.insert(StreamState::new(reliability, self.config.recv_window));
            }
        }
        debug!(node = %own, %peer, stream = %id, ?reliability, "stream reserved");
        Ok(id)
    }

    pub(crate) fn initiate_stream(
        &mut self,
        peer: NodeId,
        reliability: ReliabilityAndOrdering,
        introduction: Introduction,
    ) -> Result<StreamId, Status> {
        let id = self.reserve_local(peer, reliability)?;
        self.send_control(
            peer,
            &PeerMessage::Fork(ForkFrame {
                stream_id: id,
                reliability,
                introduction,
            }),
        );
        Ok(id)
    }

    pub(crate) fn make_fork(
        &mut self,
        peer: NodeId,
        reliability: ReliabilityAndOrdering,
        introduction: Introduction,
    ) -> Result<(StreamId, Slice), Status> {
        let id = self.reserve_local(peer, reliability)?;
        let frame = ForkFrame {
            stream_id: id,
            reliability,
            introduction,
        };
        match frame.encode() {
            Ok(bytes) => Ok((id, bytes)),
            Err(e) => {
                self.fail_reserved((peer, id), e.clone());
                Err(e)
            }
        }
    }

    /// Validate a peer's fork and reserve its stream slot.
    pub(crate) fn unwrap_fork(
        &mut self,
        peer: NodeId,
        frame: ForkFrame,
    ) -> Result<ReceivedIntroduction, Status> {
        if self.closing {
            return Err(Status::cancelled("endpoint is closing"));
        }
        let own = self.own;
        let id = frame.stream_id;
        let conn = self
            .connections
            .get_mut(&peer)
            .filter(|c| c.state == ConnectionState::Active)
            .ok_or_else(|| {
                Status::failed_precondition(format!("no active connection to {}", peer))
            })?;
        if !id.allocated_by(peer, own) {
            return Err(Status::failed_precondition(format!(
                "{} cannot allocate stream {}",
                peer, id
            )));
        }
        if conn.retired.contains(&id) || self.streams.contains_key(&(peer, id)) {
            return Err(Status::failed_precondition(format!("stream {} reused", id)));
        }
        let early = conn.early.remove(&id);
        // Early frames were acknowledged when buffered, so the window never
        // refuses them.
        let mut state = StreamState::new(frame.reliability, usize::MAX);
        if let Some(early) = early {
            for (seq, payload) in early.frames {
                let received = state.recv.on_data(seq, payload, 0);
                state.inbox.extend(received.deliver);
            }
            state.remote_close = early.close;
        }
        state.recv.resize(self.config.recv_window);
        self.streams.insert((peer, id), state);
        self.try_apply_remote_close((peer, id));
        debug!(node = %own, %peer, stream = %id, service = %frame.introduction.service_name, "fork accepted");
        Ok(ReceivedIntroduction {
            new_stream: NewStream::new(self.weak.clone(), peer, id, frame.reliability),
            introduction: frame.introduction,
        })
    }

    pub(crate) fn deliver_intro(&mut self, mut intro: ReceivedIntroduction) {
        if self.closing {
            let (peer, id) = intro.new_stream.into_parts();
            self.fail_reserved((peer, id), Status::cancelled("endpoint is closing"));
            return;
        }
        while let Some(waiter) = self.intro_waiters.pop_front() {
            match waiter.send(Ok(intro)) {
                Ok(()) => return,
                Err(Ok(back)) => intro = back,
                Err(Err(_)) => return,
            }
        }
        self.intro_queue.push_back(intro);
    }

    /// Release a reserved stream that will never be used and tell the peer.
    pub(crate) fn fail_reserved(&mut self, key: StreamKey, status: Status) {
        if let Some(s) = self.streams.remove(&key) {
            let final_seq = s.send.next_seq();
            let was_open = s.closed.is_none();
            self.retire(key);
            if was_open {
                debug!(node = %self.own, peer = %key.0, stream = %key.1, %status, "stream failed");
                self.send_close_stream(key, final_seq, status);
            }
        }
    }

    pub(crate) fn push_attempt(&mut self, key: StreamKey, message: &Slice) -> PushAttempt {
        let window = self.config.send_window;
        let Some(s) = self.streams.get(&key) else {
            return PushAttempt::Closed(Status::cancelled("stream released"));
        };
        if let Some(status) = &s.closed {
            return PushAttempt::Closed(closed_error(status));
        }
        if s.local_close {
            return PushAttempt::Closed(Status::cancelled("stream is closing"));
        }
        if !s.send.has_capacity(window) {
            return PushAttempt::Full;
        }
        self.send_data(key, message.clone());
        PushAttempt::Sent
    }

    pub(crate) fn pull_attempt(&mut self, key: StreamKey) -> PullAttempt {
        let Some(s) = self.streams.get_mut(&key) else {
            return PullAttempt::Closed(Status::cancelled("stream released"));
        };
        if let Some((seq, message)) = s.inbox.pop_front() {
            if s.reliability.is_reliable() {
                self.transmit(key.0, key.1, FrameKind::Ack { seq }, &[]);
            }
            return PullAttempt::Message(message);
        }
        match &s.closed {
            Some(status) => PullAttempt::Closed(status.clone()),
            None => PullAttempt::Empty,
        }
    }

    /// Start a local close. Returns false if the stream is already closing.
    pub(crate) fn begin_close(&mut self, key: StreamKey) -> bool {
        match self.streams.get_mut(&key) {
            Some(s) if !s.local_close && s.closed.is_none() => {
                s.local_close = true;
                s.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn close_drained(&self, key: StreamKey) -> bool {
        self.streams
            .get(&key)
            .map(|s| s.closed.is_some() || s.send.is_drained())
            .unwrap_or(true)
    }

    pub(crate) fn finish_close(&mut self, key: StreamKey, status: Status) {
        let Some(s) = self.streams.get(&key) else {
            return;
        };
        if s.closed.is_some() {
            return;
        }
        let final_seq = s.send.next_seq();
        debug!(node = %self.own, peer = %key.0, stream = %key.1, %status, final_seq, "stream closed");
        self.close_locally(key, status.clone());
        self.send_close_stream(key, final_seq, status);
    }

    /// The last handle to a stream went away.
    pub(crate) fn release_stream(&mut self, key: StreamKey) {
        let open = self
            .streams
            .get(&key)
            .map(|s| s.closed.is_none())
            .unwrap_or(false);
        if open {
            self.abort_stream(key, Status::cancelled("stream dropped"));
        }
        self.streams.remove(&key);
        self.retire(key);
    }

    pub(crate) fn stream_notify(&self, key: StreamKey) -> Option<Rc<Notify>> {
        self.streams.get(&key).map(|s| s.notify.clone())
    }

    pub(crate) fn stream_status(&self, key: StreamKey) -> Option<Status> {
        match self.streams.get(&key) {
            Some(s) => s.closed.clone(),
            None => Some(Status::cancelled("stream released")),
        }
    }
}

/// A mesh node. Cheap to clone; all clones share one node.
#[derive(Clone)]
pub struct RouterEndpoint {
    inner: Rc<EndpointInner>,
}

impl fmt::Debug for RouterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterEndpoint")
            .field("node_id", &self.inner.node_id)
            .finish_non_exhaustive()
    }
}

/// Cancels an introduction that was handed to a `recv_intro` future dropped
/// before it could return it.
struct PendingIntro(oneshot::Receiver<IntroResult>);

impl Drop for PendingIntro {
    fn drop(&mut self) {
        self.0.close();
        if let Ok(Ok(intro)) = self.0.try_recv() {
            intro
                .new_stream
                .fail(Status::cancelled("introduction abandoned"));
        }
    }
}

impl RouterEndpoint {
    pub fn new(node_id: NodeId, timer: Rc<dyn Timer>, config: EndpointConfig) -> Self {
        let quiesce = Rc::new(Notify::new());
        let inner = Rc::new_cyclic(|weak| EndpointInner {
            node_id,
            config: config.clone(),
            timer: timer.clone(),
            state: RefCell::new(EndpointState {
                own: node_id,
                config,
                timer,
                weak: weak.clone(),
                quiesce: quiesce.clone(),
                router: Router::new(node_id),
                connections: BTreeMap::new(),
                streams: HashMap::new(),
                services: BTreeSet::new(),
                label: None,
                description_version: 1,
                intro_queue: VecDeque::new(),
                intro_waiters: VecDeque::new(),
                closing: false,
            }),
            quiesce,
        });
        debug!(node = %node_id, "endpoint created");
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EndpointInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&EndpointState) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn timer(&self) -> Rc<dyn Timer> {
        self.inner.timer.clone()
    }

    /// Make `peer` known and start connecting as soon as it is reachable.
    pub fn register_peer(&self, peer: NodeId) {
        if peer == self.inner.node_id {
            return;
        }
        self.inner.state.borrow_mut().register_peer(peer);
    }

    /// Reserve a stream to `peer` and send the fork on its connection.
    pub fn initiate_stream(
        &self,
        peer: NodeId,
        reliability: ReliabilityAndOrdering,
        introduction: Introduction,
    ) -> Result<NewStream, Status> {
        let id = self
            .inner
            .state
            .borrow_mut()
            .initiate_stream(peer, reliability, introduction)?;
        Ok(NewStream::new(self.downgrade(), peer, id, reliability))
    }

    /// Reserve a stream to `peer` and return the fork frame that announces it,
    /// for embedding in a message.
    pub fn make_fork(
        &self,
        peer: NodeId,
        reliability: ReliabilityAndOrdering,
        introduction: Introduction,
    ) -> Result<(NewStream, Slice), Status> {
        let (id, frame) = self
            .inner
            .state
            .borrow_mut()
            .make_fork(peer, reliability, introduction)?;
        Ok((NewStream::new(self.downgrade(), peer, id, reliability), frame))
    }

    /// Turn a fork frame received from `peer` inside a message into a stream
    /// slot.
    pub fn unwrap_fork_frame(
        &self,
        peer: NodeId,
        frame: &[u8],
    ) -> Result<ReceivedIntroduction, Status> {
        let frame = ForkFrame::decode(frame)?;
        self.inner.state.borrow_mut().unwrap_fork(peer, frame)
    }

    /// Wait for the next stream a peer opens towards this node. Resolves with
    /// `Cancelled` once the endpoint closes.
    pub async fn recv_intro(&self) -> Result<ReceivedIntroduction, Status> {
        let rx = {
            let mut st = self.inner.state.borrow_mut();
            if st.closing {
                return Err(Status::cancelled("endpoint is closing"));
            }
            if let Some(intro) = st.intro_queue.pop_front() {
                return Ok(intro);
            }
            let (tx, rx) = oneshot::channel();
            st.intro_waiters.push_back(tx);
            rx
        };
        let mut pending = PendingIntro(rx);
        (&mut pending.0)
            .await
            .unwrap_or_else(|_| Err(Status::cancelled("endpoint dropped")))
    }

    /// Stop accepting streams, say goodbye to every peer and wait until all
    /// connections are closed. Later calls only wait.
    pub async fn close(&self) {
        let waiters = {
            let mut st = self.inner.state.borrow_mut();
            if st.closing {
                VecDeque::new()
            } else {
                st.closing = true;
                debug!(node = %st.own, "endpoint closing");
                let queued: Vec<ReceivedIntroduction> = st.intro_queue.drain(..).collect();
                for intro in queued {
                    let key = intro.new_stream.into_parts();
                    st.fail_reserved(key, Status::cancelled("endpoint is closing"));
                }
                let peers: Vec<NodeId> = st.connections.keys().copied().collect();
                for peer in peers {
                    st.close_connection(peer, Status::cancelled("endpoint closing"), true);
                }
                std::mem::take(&mut st.intro_waiters)
            }
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Status::cancelled("endpoint is closing")));
        }
        loop {
            let notified = self.inner.quiesce.notified();
            if self.inner.state.borrow().all_closed() {
                break;
            }
            notified.await;
        }
        debug!(node = %self.inner.node_id, "endpoint closed");
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.borrow().closing
    }

    pub fn set_label(&self, label: Option<String>) {
        let mut st = self.inner.state.borrow_mut();
        st.label = label;
        st.description_changed();
    }

    /// Advertise `name` to the mesh. Returns false if it was already offered.
    pub fn register_service(&self, name: impl Into<String>) -> bool {
        let mut st = self.inner.state.borrow_mut();
        let added = st.services.insert(name.into());
        if added {
            st.description_changed();
        }
        added
    }

    pub fn unregister_service(&self, name: &str) -> bool {
        let mut st = self.inner.state.borrow_mut();
        let removed = st.services.remove(name);
        if removed {
            st.description_changed();
        }
        removed
    }

    /// Services `node` advertises, as far as gossip has told us.
    pub fn services_of(&self, node: NodeId) -> Option<BTreeSet<String>> {
        let st = self.inner.state.borrow();
        if node == st.own {
            return Some(st.services.clone());
        }
        st.router.description(node).map(|d| d.services.clone())
    }

    /// Remote nodes advertising `service`.
    pub fn nodes_offering(&self, service: &str) -> Vec<NodeId> {
        self.inner.state.borrow().router.nodes_offering(service)
    }

    pub fn known_nodes(&self) -> BTreeSet<NodeId> {
        self.inner.state.borrow().router.known_nodes()
    }

    pub fn is_reachable(&self, node: NodeId) -> bool {
        self.inner.state.borrow().router.is_reachable(node)
    }

    pub fn connection_state(&self, peer: NodeId) -> Option<ConnectionState> {
        self.inner.state.borrow().connections.get(&peer).map(|c| c.state)
    }

    pub fn link_metrics(&self, peer: NodeId) -> Option<LinkMetrics> {
        self.inner.state.borrow().router.link_metrics(peer)
    }

    /// Install a link established by a transport.
    pub fn publish_link(&self, link: Box<dyn Link>) {
        let mut st = self.inner.state.borrow_mut();
        let peer = link.peer();
        if peer == st.own {
            warn!(node = %st.own, "ignoring link to self");
            return;
        }
        st.router.add_link(link);
        st.register_peer(peer);
        st.connect_pending();
        st.reset_gossip();
    }

    /// The transport lost its path to `peer`.
    pub fn remove_link(&self, peer: NodeId) {
        let mut st = self.inner.state.borrow_mut();
        if !st.router.remove_link(peer) {
            return;
        }
        st.close_unreachable();
        st.reset_gossip();
    }

    /// Deliver a frame received on the link to `from`.
    pub fn on_link_frame(&self, from: NodeId, frame: Slice) {
        let mut st = self.inner.state.borrow_mut();
        match st.router.route_inbound(from, frame) {
            Ok(Some(frame)) => st.handle_frame(frame),
            Ok(None) => {}
            Err(e) => warn!(node = %st.own, %from, error = %e, "dropping inbound frame"),
        }
    }
}

impl ForkUnwrapper for RouterEndpoint {
    type Fork = ReceivedIntroduction;

    fn unwrap_fork_frame(&self, peer: NodeId, frame: Slice) -> Result<ReceivedIntroduction, Status> {
        RouterEndpoint::unwrap_fork_frame(self, peer, &frame)
    }
}

impl Discard for ReceivedIntroduction {
    fn discard(self, status: &Status) {
        self.new_stream.fail(status.clone());
    }
}
