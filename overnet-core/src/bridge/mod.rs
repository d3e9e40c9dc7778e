//! Bridges between a mesh stream and a local I/O primitive.
//!
//! Every bridge runs as one local task with two loops. Local to network reads
//! one local message, translates it, pushes it and only then reads again, so
//! local input is never consumed faster than the stream takes it. Network to
//! local pulls one message and writes it; a full local buffer parks that
//! message until the primitive is writable, without pulling more.

mod channel;
pub mod memory;
mod socket;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::debug;

use crate::codec::{CodecLimits, Discard, ForkUnwrapper};
use crate::identity::NodeId;
use crate::protocol::Introduction;
use crate::slice::Slice;
use crate::status::Status;
use crate::stream::{NewStream, Stream};

/// Service name carried by forks that stand for a proxied channel handle.
pub const CHANNEL_FORK_SERVICE: &str = "overnet.channel";

/// The stream side of a bridge.
#[allow(async_fn_in_trait)]
pub trait BridgedStream: Sized + 'static {
    /// A reserved sibling stream that is not open yet.
    type Fork: Discard;

    fn peer(&self) -> NodeId;

    async fn push(&self, message: Slice) -> Result<(), Status>;

    /// `Ok(None)` once the stream closed cleanly.
    async fn pull(&self) -> Result<Option<Slice>, Status>;

    async fn close(&self, status: Status);

    /// Reserve a sibling for a proxied handle; the frame travels in a message.
    fn fork(&self, introduction: Introduction) -> Result<(Self::Fork, Slice), Status>;

    /// Accept a fork frame received in a message on this stream.
    fn unwrap_fork(&self, frame: Slice) -> Result<Self::Fork, Status>;

    fn open(fork: Self::Fork) -> Self;
}

impl BridgedStream for Stream {
    type Fork = NewStream;

    fn peer(&self) -> NodeId {
        Stream::peer(self)
    }

    async fn push(&self, message: Slice) -> Result<(), Status> {
        Stream::push(self, message).await
    }

    async fn pull(&self) -> Result<Option<Slice>, Status> {
        Stream::pull(self).await
    }

    async fn close(&self, status: Status) {
        Stream::close(self, status).await
    }

    fn fork(&self, introduction: Introduction) -> Result<(NewStream, Slice), Status> {
        Stream::fork(self, self.reliability(), introduction)
    }

    fn unwrap_fork(&self, frame: Slice) -> Result<NewStream, Status> {
        let intro = self.unwrap_fork_frame(&frame)?;
        if intro.introduction.service_name != CHANNEL_FORK_SERVICE {
            let status = Status::failed_precondition(format!(
                "fork for service {:?} inside a bridged message",
                intro.introduction.service_name
            ));
            intro.new_stream.fail(status.clone());
            return Err(status);
        }
        Ok(intro.new_stream)
    }

    fn open(fork: NewStream) -> Stream {
        Stream::new(fork)
    }
}

/// Decode-time adapter from a bridged stream to the codec's unwrapper.
struct StreamForks<'a, S>(&'a S);

impl<S: BridgedStream> ForkUnwrapper for StreamForks<'_, S> {
    type Fork = S::Fork;

    fn unwrap_fork_frame(&self, _peer: NodeId, frame: Slice) -> Result<S::Fork, Status> {
        self.0.unwrap_fork(frame)
    }
}

/// A handle the bridge cannot proxy. It is released when a message carrying
/// it is rejected.
pub trait OpaqueHandle {
    fn kind(&self) -> &str;

    fn release(self: Box<Self>);
}

pub enum LocalHandle<C> {
    Channel(C),
    Other(Box<dyn OpaqueHandle>),
}

impl<C: LocalChannel> LocalHandle<C> {
    pub(crate) fn release(self, status: &Status) {
        match self {
            LocalHandle::Channel(c) => c.close(status),
            LocalHandle::Other(h) => h.release(),
        }
    }
}

impl<C> fmt::Debug for LocalHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalHandle::Channel(_) => f.write_str("Channel"),
            LocalHandle::Other(h) => write!(f, "Other({})", h.kind()),
        }
    }
}

/// One message on a local channel.
#[derive(Debug)]
pub struct LocalMessage<C> {
    pub txid: u32,
    pub ordinal: u32,
    pub body: Slice,
    pub handles: Vec<LocalHandle<C>>,
}

impl<C> LocalMessage<C> {
    pub fn new(ordinal: u32, body: impl Into<Slice>) -> Self {
        Self {
            txid: 0,
            ordinal,
            body: body.into(),
            handles: Vec::new(),
        }
    }

    pub fn with_txid(mut self, txid: u32) -> Self {
        self.txid = txid;
        self
    }

    pub fn with_handle(mut self, handle: LocalHandle<C>) -> Self {
        self.handles.push(handle);
        self
    }
}

pub enum WriteError<C> {
    /// The local buffer is full; the message is handed back unchanged.
    ShouldWait(LocalMessage<C>),
    Closed(Status),
}

/// A local message channel with handle passing.
#[allow(async_fn_in_trait)]
pub trait LocalChannel: Sized + 'static {
    /// Next message; `Ok(None)` once the other end is gone.
    async fn read(&self) -> Result<Option<LocalMessage<Self>>, Status>;

    fn try_write(&self, message: LocalMessage<Self>) -> Result<(), WriteError<Self>>;

    /// Resolves once `try_write` may succeed again.
    async fn writable(&self);

    /// A new connected pair of the same kind, for forks arriving from the mesh.
    fn create_pair(&self) -> Result<(Self, Self), Status>;

    fn close(&self, status: &Status);
}

/// Close request and completion shared by a bridge task and its handle.
#[derive(Default)]
struct Control {
    requested: RefCell<Option<Status>>,
    request: Notify,
    finished: RefCell<Option<Status>>,
    done: Notify,
}

impl Control {
    async fn requested(&self) -> Status {
        loop {
            let notified = self.request.notified();
            if let Some(status) = self.requested.borrow().clone() {
                return status;
            }
            notified.await;
        }
    }

    fn finish(&self, status: Status) {
        *self.finished.borrow_mut() = Some(status);
        self.done.notify_waiters();
    }
}

/// Handle to a running bridge. Dropping it leaves the bridge running.
pub struct BridgeHandle {
    control: Rc<Control>,
}

impl BridgeHandle {
    /// Ask the bridge to stop with `status`. Only the first request counts.
    pub fn request_close(&self, status: Status) {
        let mut requested = self.control.requested.borrow_mut();
        if requested.is_none() && self.control.finished.borrow().is_none() {
            *requested = Some(status);
            self.control.request.notify_waiters();
        }
    }

    /// Wait for the bridge to finish; returns the status it closed with.
    pub async fn closed(&self) -> Status {
        loop {
            let notified = self.control.done.notified();
            if let Some(status) = self.control.finished.borrow().clone() {
                return status;
            }
            notified.await;
        }
    }

    pub async fn close(&self, status: Status) -> Status {
        self.request_close(status);
        self.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.control.finished.borrow().is_some()
    }
}

struct FactoryInner {
    limits: CodecLimits,
    active: Cell<usize>,
    idle: Notify,
}

/// Creates bridges. Forked handles are bound by the factory that bound the
/// parent, so one factory serves a whole tree of bridges.
#[derive(Clone)]
pub struct BridgeFactory {
    inner: Rc<FactoryInner>,
}

impl BridgeFactory {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            inner: Rc::new(FactoryInner {
                limits,
                active: Cell::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> &CodecLimits {
        &self.inner.limits
    }

    /// Bridges still running.
    pub fn active(&self) -> usize {
        self.inner.active.get()
    }

    /// Wait until no bridge made by this factory is running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.active.get() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Pump messages between `stream` and `channel` until either side closes.
    pub fn bind_channel<S: BridgedStream, C: LocalChannel>(
        &self,
        stream: S,
        channel: C,
    ) -> BridgeHandle {
        let control = Rc::new(Control::default());
        self.started(stream.peer());
        tokio::task::spawn_local(channel::run(
            self.clone(),
            stream,
            channel,
            control.clone(),
        ));
        BridgeHandle { control }
    }

    /// Pump bytes between `stream` and a local byte stream.
    pub fn bind_socket<S, T>(&self, stream: S, io: T) -> BridgeHandle
    where
        S: BridgedStream,
        T: AsyncRead + AsyncWrite + 'static,
    {
        let control = Rc::new(Control::default());
        self.started(stream.peer());
        tokio::task::spawn_local(socket::run(self.clone(), stream, io, control.clone()));
        BridgeHandle { control }
    }

    fn started(&self, peer: NodeId) {
        let active = self.inner.active.get() + 1;
        self.inner.active.set(active);
        debug!(%peer, active, "bridge started");
    }

    fn finished(&self, control: &Control, status: Status) {
        let active = self.inner.active.get().saturating_sub(1);
        self.inner.active.set(active);
        debug!(%status, active, "bridge finished");
        control.finish(status);
        if active == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}
