//! In-memory links and node helpers shared by the unit tests.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::EndpointConfig;
use crate::endpoint::RouterEndpoint;
use crate::identity::NodeId;
use crate::router::Link;
use crate::slice::Slice;
use crate::status::Status;
use crate::timer::TokioTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossMode {
    None,
    /// The first copy of every distinct frame is lost; retransmissions pass.
    DropFirstCopy,
}

struct MemoryLink {
    from: NodeId,
    to: NodeId,
    tx: mpsc::UnboundedSender<(NodeId, Slice)>,
    loss: LossMode,
    seen: RefCell<HashSet<Vec<u8>>>,
}

impl Link for MemoryLink {
    fn peer(&self) -> NodeId {
        self.to
    }

    fn forward(&self, frame: Slice) -> Result<(), Status> {
        if self.loss == LossMode::DropFirstCopy && self.seen.borrow_mut().insert(frame.to_vec()) {
            return Ok(());
        }
        self.tx
            .send((self.from, frame))
            .map_err(|_| Status::unavailable("memory link closed"))
    }

    fn describe(&self) -> String {
        format!("memory link {} -> {}", self.from, self.to)
    }
}

fn half(from: &RouterEndpoint, to: &RouterEndpoint, loss: LossMode) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, Slice)>();
    let receiver = to.clone();
    tokio::task::spawn_local(async move {
        while let Some((src, frame)) = rx.recv().await {
            receiver.on_link_frame(src, frame);
        }
    });
    from.publish_link(Box::new(MemoryLink {
        from: from.node_id(),
        to: to.node_id(),
        tx,
        loss,
        seen: RefCell::new(HashSet::new()),
    }));
}

/// Link `a` and `b` in both directions.
pub(crate) fn connect(a: &RouterEndpoint, b: &RouterEndpoint, loss: LossMode) {
    half(a, b, loss);
    half(b, a, loss);
}

pub(crate) fn endpoint(n: u64) -> RouterEndpoint {
    endpoint_with(n, EndpointConfig::default())
}

pub(crate) fn endpoint_with(n: u64, config: EndpointConfig) -> RouterEndpoint {
    RouterEndpoint::new(NodeId(n), Rc::new(TokioTimer::new()), config)
}

pub(crate) async fn run_local<F: Future>(f: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(f).await
}

/// Let queued link deliveries and short timers run.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
