//! Stream to local message channel bridge.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use super::{
    BridgeFactory, BridgedStream, Control, LocalChannel, LocalHandle, LocalMessage, StreamForks,
    WriteError, CHANNEL_FORK_SERVICE,
};
use crate::codec::{self, DecodedMessage, Discard};
use crate::protocol::Introduction;
use crate::slice::Slice;
use crate::status::Status;

/// Forks reserved for one outbound message, bound only once it was pushed.
struct Forked<S: BridgedStream, C: LocalChannel> {
    forks: Vec<(S::Fork, C)>,
}

impl<S: BridgedStream, C: LocalChannel> Forked<S, C> {
    fn bind(mut self, factory: &BridgeFactory) {
        for (fork, channel) in self.forks.drain(..) {
            factory.bind_channel(S::open(fork), channel);
        }
    }
}

impl<S: BridgedStream, C: LocalChannel> Discard for Forked<S, C> {
    fn discard(mut self, status: &Status) {
        for (fork, channel) in self.forks.drain(..) {
            fork.discard(status);
            channel.close(status);
        }
    }
}

impl<S: BridgedStream, C: LocalChannel> Drop for Forked<S, C> {
    fn drop(&mut self) {
        let status = Status::cancelled("bridge stopped before the message was sent");
        for (fork, channel) in self.forks.drain(..) {
            fork.discard(&status);
            channel.close(&status);
        }
    }
}

/// Encode a local message, turning channel handles into forks. Any other
/// handle fails the message; every handle is released on failure.
fn translate_outbound<S: BridgedStream, C: LocalChannel>(
    factory: &BridgeFactory,
    stream: &S,
    message: LocalMessage<C>,
) -> Result<(Slice, Forked<S, C>), Status> {
    let LocalMessage {
        txid,
        ordinal,
        body,
        handles,
    } = message;
    let mut forked = Forked { forks: Vec::new() };
    let mut frames = Vec::new();
    let mut handles = handles.into_iter();
    let mut failure = None;
    for handle in handles.by_ref() {
        match handle {
            LocalHandle::Channel(channel) => {
                match stream.fork(Introduction::new(CHANNEL_FORK_SERVICE)) {
                    Ok((fork, frame)) => {
                        forked.forks.push((fork, channel));
                        frames.push(frame);
                    }
                    Err(e) => {
                        channel.close(&e);
                        failure = Some(e);
                        break;
                    }
                }
            }
            LocalHandle::Other(handle) => {
                let status = Status::failed_precondition(format!(
                    "cannot proxy a {} handle",
                    handle.kind()
                ));
                handle.release();
                failure = Some(status);
                break;
            }
        }
    }
    let failure = match failure {
        None => match codec::encode(txid, ordinal, &body, &frames, factory.limits()) {
            Ok(encoded) => return Ok((encoded, forked)),
            Err(e) => e,
        },
        Some(e) => e,
    };
    for handle in handles {
        handle.release(&failure);
    }
    forked.discard(&failure);
    Err(failure)
}

/// Decode a stream message for the local channel. Each fork gets a fresh
/// channel pair: one end is bound to the forked stream, the other is handed
/// to the local reader.
fn translate_inbound<S: BridgedStream, C: LocalChannel>(
    factory: &BridgeFactory,
    stream: &S,
    channel: &C,
    raw: &Slice,
) -> Result<LocalMessage<C>, Status> {
    let decoded = DecodedMessage::decode(raw, stream.peer(), &StreamForks(stream))?;
    if decoded.unknown_handles > 0 {
        debug!(peer = %stream.peer(), count = decoded.unknown_handles, "skipping unknown handles");
    }
    let mut pairs = Vec::with_capacity(decoded.forks.len());
    let mut forks = decoded.forks.into_iter();
    let mut failure = None;
    for fork in forks.by_ref() {
        match channel.create_pair() {
            Ok(pair) => pairs.push((fork, pair)),
            Err(e) => {
                let status = e.with_context("creating channel for fork");
                fork.discard(&status);
                failure = Some(status);
                break;
            }
        }
    }
    if let Some(status) = failure {
        for fork in forks {
            fork.discard(&status);
        }
        for (fork, (local, remote)) in pairs {
            fork.discard(&status);
            local.close(&status);
            remote.close(&status);
        }
        return Err(status);
    }
    let mut handles = Vec::with_capacity(pairs.len());
    for (fork, (local, remote)) in pairs {
        factory.bind_channel(S::open(fork), remote);
        handles.push(LocalHandle::Channel(local));
    }
    Ok(LocalMessage {
        txid: decoded.txid,
        ordinal: decoded.ordinal,
        body: decoded.body,
        handles,
    })
}

async fn local_to_network<S: BridgedStream, C: LocalChannel>(
    factory: &BridgeFactory,
    stream: &S,
    channel: &C,
) -> Status {
    loop {
        let message = match channel.read().await {
            Ok(Some(message)) => message,
            Ok(None) => return Status::ok(),
            Err(e) => return e.with_context("reading local channel"),
        };
        let (encoded, forked) = match translate_outbound(factory, stream, message) {
            Ok(translated) => translated,
            Err(e) => return e,
        };
        if let Err(e) = stream.push(encoded).await {
            forked.discard(&e);
            return e;
        }
        forked.bind(factory);
    }
}

async fn network_to_local<S: BridgedStream, C: LocalChannel>(
    factory: &BridgeFactory,
    stream: &S,
    channel: &C,
    parked: &RefCell<Option<LocalMessage<C>>>,
) -> Status {
    loop {
        let raw = match stream.pull().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Status::ok(),
            Err(e) => return e,
        };
        let mut message = match translate_inbound(factory, stream, channel, &raw) {
            Ok(message) => message,
            Err(e) => return e,
        };
        loop {
            match channel.try_write(message) {
                Ok(()) => break,
                Err(WriteError::Closed(status)) => return status,
                Err(WriteError::ShouldWait(back)) => {
                    trace!(peer = %stream.peer(), "local channel full");
                    *parked.borrow_mut() = Some(back);
                    channel.writable().await;
                    match parked.borrow_mut().take() {
                        Some(back) => message = back,
                        None => return Status::internal("parked message vanished"),
                    }
                }
            }
        }
    }
}

pub(super) async fn run<S: BridgedStream, C: LocalChannel>(
    factory: BridgeFactory,
    stream: S,
    channel: C,
    control: Rc<Control>,
) {
    let parked = RefCell::new(None);
    let status = tokio::select! {
        status = local_to_network(&factory, &stream, &channel) => status,
        status = network_to_local(&factory, &stream, &channel, &parked) => status,
        status = control.requested() => status,
    };
    // A message already pulled from the stream still reaches the channel.
    let parked = parked.borrow_mut().take();
    if let Some(message) = parked {
        match channel.try_write(message) {
            Ok(()) | Err(WriteError::Closed(_)) => {}
            Err(WriteError::ShouldWait(message)) => {
                debug!(peer = %stream.peer(), "dropping message parked at close");
                for handle in message.handles {
                    handle.release(&status);
                }
            }
        }
    }
    channel.close(&status);
    stream.close(status.clone()).await;
    factory.finished(&control, status);
}
