//! Application streams and the single-use `NewStream` capability.

use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::Notify;
use tracing::warn;

use crate::codec::Discard;
use crate::endpoint::{EndpointInner, PullAttempt, PushAttempt, StreamKey};
use crate::identity::{NodeId, StreamId};
use crate::protocol::{ForkFrame, Introduction, ReliabilityAndOrdering};
use crate::sequencing::{ReceiveWindow, SendWindow};
use crate::slice::Slice;
use crate::status::Status;
use crate::timer::Timeout;

/// Endpoint-side bookkeeping for one stream.
pub(crate) struct StreamState {
    pub(crate) reliability: ReliabilityAndOrdering,
    pub(crate) send: SendWindow,
    pub(crate) recv: ReceiveWindow,
    /// Delivered messages not yet pulled, with their sequence numbers.
    pub(crate) inbox: VecDeque<(u64, Slice)>,
    /// `Stream::close` has started.
    pub(crate) local_close: bool,
    /// Close announced by the peer, applied once `final_seq` is complete.
    pub(crate) remote_close: Option<(u64, Status)>,
    pub(crate) closed: Option<Status>,
    pub(crate) retransmit: Option<Timeout>,
    pub(crate) notify: Rc<Notify>,
}

impl StreamState {
    pub(crate) fn new(reliability: ReliabilityAndOrdering, recv_window: usize) -> Self {
        Self {
            reliability,
            send: SendWindow::new(reliability),
            recv: ReceiveWindow::new(reliability, recv_window),
            inbox: VecDeque::new(),
            local_close: false,
            remote_close: None,
            closed: None,
            retransmit: None,
            notify: Rc::new(Notify::new()),
        }
    }
}

/// Permission to use a reserved stream slot. Must end in [`Stream::new`] or
/// [`NewStream::fail`]; dropping it otherwise is a bug caught by a debug
/// assertion.
pub struct NewStream {
    endpoint: Weak<EndpointInner>,
    peer: NodeId,
    id: StreamId,
    reliability: ReliabilityAndOrdering,
    consumed: bool,
}

impl NewStream {
    pub(crate) fn new(
        endpoint: Weak<EndpointInner>,
        peer: NodeId,
        id: StreamId,
        reliability: ReliabilityAndOrdering,
    ) -> Self {
        Self {
            endpoint,
            peer,
            id,
            reliability,
            consumed: false,
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn reliability(&self) -> ReliabilityAndOrdering {
        self.reliability
    }

    /// Give the slot back and close the stream on the peer with `status`.
    pub fn fail(mut self, status: Status) {
        self.consumed = true;
        let Some(inner) = self.endpoint.upgrade() else {
            return;
        };
        match inner.state.try_borrow_mut() {
            Ok(mut st) => st.fail_reserved((self.peer, self.id), status),
            Err(_) => warn!(peer = %self.peer, stream = %self.id, "cannot fail stream re-entrantly"),
        };
    }

    /// Mark consumed and return the slot key; the caller releases the slot.
    pub(crate) fn into_parts(mut self) -> StreamKey {
        self.consumed = true;
        (self.peer, self.id)
    }
}

impl Drop for NewStream {
    fn drop(&mut self) {
        debug_assert!(
            self.consumed || std::thread::panicking(),
            "NewStream for {} on {} dropped without Stream::new or fail",
            self.id,
            self.peer
        );
    }
}

impl Discard for NewStream {
    fn discard(self, status: &Status) {
        self.fail(status.clone());
    }
}

impl fmt::Debug for NewStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewStream")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("reliability", &self.reliability)
            .finish()
    }
}

/// A stream a peer opened towards this node.
#[derive(Debug)]
pub struct ReceivedIntroduction {
    pub new_stream: NewStream,
    pub introduction: Introduction,
}

/// One multiplexed conversation with a peer.
pub struct Stream {
    endpoint: Weak<EndpointInner>,
    peer: NodeId,
    id: StreamId,
    reliability: ReliabilityAndOrdering,
    notify: Rc<Notify>,
}

impl Stream {
    pub fn new(mut new_stream: NewStream) -> Stream {
        new_stream.consumed = true;
        let key = (new_stream.peer, new_stream.id);
        let notify = new_stream
            .endpoint
            .upgrade()
            .and_then(|inner| {
                let st = inner.state.borrow();
                st.stream_notify(key)
            })
            .unwrap_or_default();
        Stream {
            endpoint: new_stream.endpoint.clone(),
            peer: new_stream.peer,
            id: new_stream.id,
            reliability: new_stream.reliability,
            notify,
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn reliability(&self) -> ReliabilityAndOrdering {
        self.reliability
    }

    fn key(&self) -> StreamKey {
        (self.peer, self.id)
    }

    fn inner(&self) -> Result<Rc<EndpointInner>, Status> {
        self.endpoint
            .upgrade()
            .ok_or_else(|| Status::cancelled("endpoint dropped"))
    }

    /// Queue `message` for the peer, waiting while a reliable stream's send
    /// window is full.
    pub async fn push(&self, message: Slice) -> Result<(), Status> {
        let inner = self.inner()?;
        if message.len() > inner.config.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "message of {} bytes exceeds limit of {}",
                message.len(),
                inner.config.max_message_size
            )));
        }
        loop {
            let notified = self.notify.notified();
            let attempt = inner.state.borrow_mut().push_attempt(self.key(), &message);
            match attempt {
                PushAttempt::Sent => return Ok(()),
                PushAttempt::Closed(status) => return Err(status),
                PushAttempt::Full => notified.await,
            }
        }
    }

    /// Next message. `Ok(None)` once the stream closed cleanly; a failed close
    /// is returned as the error. Queued messages always come first.
    pub async fn pull(&self) -> Result<Option<Slice>, Status> {
        let inner = self.inner()?;
        loop {
            let notified = self.notify.notified();
            let attempt = inner.state.borrow_mut().pull_attempt(self.key());
            match attempt {
                PullAttempt::Message(message) => return Ok(Some(message)),
                PullAttempt::Closed(status) if status.is_ok() => return Ok(None),
                PullAttempt::Closed(status) => return Err(status),
                PullAttempt::Empty => notified.await,
            }
        }
    }

    /// Close the stream with `status`. Reliable streams first wait for every
    /// pushed message to be acknowledged. A second call does nothing.
    pub async fn close(&self, status: Status) {
        let Ok(inner) = self.inner() else {
            return;
        };
        let key = self.key();
        if !inner.state.borrow_mut().begin_close(key) {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if inner.state.borrow().close_drained(key) {
                break;
            }
            notified.await;
        }
        inner.state.borrow_mut().finish_close(key, status);
    }

    /// Reserve a sibling stream to the same peer. The returned frame announces
    /// it and is meant to travel inside a message on this stream.
    pub fn fork(
        &self,
        reliability: ReliabilityAndOrdering,
        introduction: Introduction,
    ) -> Result<(NewStream, Slice), Status> {
        let inner = self.inner()?;
        let (id, frame) = inner
            .state
            .borrow_mut()
            .make_fork(self.peer, reliability, introduction)?;
        Ok((
            NewStream::new(self.endpoint.clone(), self.peer, id, reliability),
            frame,
        ))
    }

    /// Accept a fork frame the peer sent inside a message on this stream.
    pub fn unwrap_fork_frame(&self, frame: &[u8]) -> Result<ReceivedIntroduction, Status> {
        let inner = self.inner()?;
        let frame = ForkFrame::decode(frame)?;
        let mut st = inner.state.borrow_mut();
        st.unwrap_fork(self.peer, frame)
    }

    /// `None` while open.
    pub fn closed_status(&self) -> Option<Status> {
        let Some(inner) = self.endpoint.upgrade() else {
            return Some(Status::cancelled("endpoint dropped"));
        };
        let st = inner.state.borrow();
        st.stream_status(self.key())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let Some(inner) = self.endpoint.upgrade() else {
            return;
        };
        let key = self.key();
        match inner.state.try_borrow_mut() {
            Ok(mut st) => st.release_stream(key),
            Err(_) => warn!(peer = %self.peer, stream = %self.id, "stream dropped re-entrantly"),
        };
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("reliability", &self.reliability)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use crate::test_util::{connect, endpoint, run_local, settle, LossMode};
    use std::time::Duration;

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dropped without Stream::new or fail")]
    fn dropping_unconsumed_new_stream_panics() {
        let ns = NewStream::new(
            Weak::new(),
            NodeId(2),
            StreamId(3),
            ReliabilityAndOrdering::ReliableOrdered,
        );
        drop(ns);
    }

    #[test]
    fn consumed_new_stream_drops_quietly() {
        let ns = NewStream::new(
            Weak::new(),
            NodeId(2),
            StreamId(3),
            ReliabilityAndOrdering::ReliableOrdered,
        );
        ns.fail(Status::cancelled("unused"));
        let ns = NewStream::new(
            Weak::new(),
            NodeId(2),
            StreamId(5),
            ReliabilityAndOrdering::ReliableOrdered,
        );
        let s = Stream::new(ns);
        assert_eq!(s.closed_status().map(|s| s.code()), Some(StatusCode::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn close_twice_sends_one_close() {
        run_local(async {
            let a = endpoint(1);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("s"))
                    .unwrap(),
            );
            let sb = Stream::new(b.recv_intro().await.unwrap().new_stream);

            sa.close(Status::ok()).await;
            sa.close(Status::internal("second close is ignored")).await;
            assert_eq!(sa.closed_status().map(|s| s.code()), Some(StatusCode::Ok));
            assert!(sb.pull().await.unwrap().is_none());
            settle().await;
            assert_eq!(sb.closed_status().map(|s| s.code()), Some(StatusCode::Ok));
            assert_eq!(
                sa.push(Slice::from_static(b"x")).await.unwrap_err().code(),
                StatusCode::Cancelled
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_waits_for_window() {
        run_local(async {
            let config = crate::config::EndpointConfig::default().with_send_window(2);
            let a = crate::test_util::endpoint_with(1, config);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Rc::new(Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("s"))
                    .unwrap(),
            ));
            let sb = Stream::new(b.recv_intro().await.unwrap().new_stream);

            // pushes complete as acks free the window
            let pusher = {
                let sa = sa.clone();
                tokio::task::spawn_local(async move {
                    for i in 0..10u8 {
                        sa.push(Slice::from(vec![i])).await.unwrap();
                    }
                })
            };
            for i in 0..10u8 {
                assert_eq!(sb.pull().await.unwrap().unwrap().as_bytes(), &[i]);
            }
            pusher.await.unwrap();
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reader_holds_back_sender() {
        run_local(async {
            let config = crate::config::EndpointConfig::default().with_send_window(2);
            let a = crate::test_util::endpoint_with(1, config);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Rc::new(Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("s"))
                    .unwrap(),
            ));
            let sb = Stream::new(b.recv_intro().await.unwrap().new_stream);

            let pushed = Rc::new(std::cell::Cell::new(0usize));
            let pusher = {
                let (sa, pushed) = (sa.clone(), pushed.clone());
                tokio::task::spawn_local(async move {
                    for i in 0..50u8 {
                        sa.push(Slice::from(vec![i])).await.unwrap();
                        pushed.set(pushed.get() + 1);
                    }
                })
            };
            settle().await;
            assert_eq!(pushed.get(), 2);
            let queued = |b: &crate::endpoint::RouterEndpoint| {
                b.with_state(|st| st.streams.get(&(NodeId(1), sb.id())).map(|s| s.inbox.len()))
            };
            assert_eq!(queued(&b), Some(2));

            // Long past the retransmission limit the sender is still waiting,
            // not failed.
            tokio::time::sleep(Duration::from_secs(300)).await;
            assert_eq!(pushed.get(), 2);
            assert!(sa.closed_status().is_none());
            assert!(queued(&b).unwrap_or(0) <= 2);

            for i in 0..50u8 {
                assert_eq!(sb.pull().await.unwrap().unwrap().as_bytes(), &[i]);
            }
            pusher.await.unwrap();
            assert_eq!(pushed.get(), 50);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_push_rejected() {
        run_local(async {
            let config = crate::config::EndpointConfig::default().with_max_message_size(8);
            let a = crate::test_util::endpoint_with(1, config);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("s"))
                    .unwrap(),
            );
            let err = sa.push(Slice::from(vec![0u8; 9])).await.unwrap_err();
            assert_eq!(err.code(), StatusCode::ResourceExhausted);
            sa.push(Slice::from(vec![0u8; 8])).await.unwrap();
            let intro = b.recv_intro().await.unwrap();
            intro.new_stream.fail(Status::cancelled("not needed"));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_closes_peer() {
        run_local(async {
            let a = endpoint(1);
            let b = endpoint(2);
            connect(&a, &b, LossMode::None);
            let sa = Stream::new(
                a.initiate_stream(b.node_id(), ReliabilityAndOrdering::ReliableOrdered, Introduction::new("s"))
                    .unwrap(),
            );
            let sb = Stream::new(b.recv_intro().await.unwrap().new_stream);
            drop(sa);
            assert_eq!(sb.pull().await.unwrap_err().code(), StatusCode::Cancelled);
        })
        .await;
    }
}
