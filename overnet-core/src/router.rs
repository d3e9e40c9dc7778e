//! Links, next hops and gossip-learned topology.
//!
//! The router only ever relays one hop: a frame for a node we have no link to
//! is sent to a neighbour whose last `LinkState` lists a link to that node.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::identity::NodeId;
use crate::protocol::{LinkDescription, NodeDescription};
use crate::slice::Slice;
use crate::status::Status;
use crate::wire::{self, Frame};

/// One transport path to a directly connected peer.
///
/// `forward` must not call back into the endpoint synchronously; inbound
/// traffic is delivered later through `RouterEndpoint::on_link_frame`.
pub trait Link {
    fn peer(&self) -> NodeId;

    fn forward(&self, frame: Slice) -> Result<(), Status>;

    /// Short human-readable name of the medium, for logs.
    fn describe(&self) -> String {
        format!("link to {}", self.peer())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkMetrics {
    pub rtt: Option<Duration>,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
}

struct LinkEntry {
    link: Box<dyn Link>,
    metrics: LinkMetrics,
}

pub struct Router {
    own: NodeId,
    links: BTreeMap<NodeId, LinkEntry>,
    descriptions: BTreeMap<NodeId, NodeDescription>,
    /// Last `LinkState` from each neighbour: node -> nodes it links to.
    reported: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("own", &self.own)
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("descriptions", &self.descriptions)
            .field("reported", &self.reported)
            .finish()
    }
}

impl Router {
    pub fn new(own: NodeId) -> Self {
        Self {
            own,
            links: BTreeMap::new(),
            descriptions: BTreeMap::new(),
            reported: BTreeMap::new(),
        }
    }

    pub fn own_node_id(&self) -> NodeId {
        self.own
    }

    /// Install `link`, replacing any previous link to the same peer. Returns
    /// true when the peer had no link before.
    pub fn add_link(&mut self, link: Box<dyn Link>) -> bool {
        let peer = link.peer();
        debug!(own = %self.own, %peer, link = %link.describe(), "link up");
        self.links
            .insert(
                peer,
                LinkEntry {
                    link,
                    metrics: LinkMetrics::default(),
                },
            )
            .is_none()
    }

    /// Drop the link to `peer` and whatever it told us about its own links.
    pub fn remove_link(&mut self, peer: NodeId) -> bool {
        let removed = self.links.remove(&peer).is_some();
        if removed {
            debug!(own = %self.own, %peer, "link down");
            self.reported.remove(&peer);
        }
        removed
    }

    pub fn has_link(&self, peer: NodeId) -> bool {
        self.links.contains_key(&peer)
    }

    pub fn next_hop(&self, dst: NodeId) -> Option<NodeId> {
        if self.links.contains_key(&dst) {
            return Some(dst);
        }
        self.reported
            .iter()
            .find(|(via, reach)| self.links.contains_key(via) && reach.contains(&dst))
            .map(|(via, _)| *via)
    }

    pub fn is_reachable(&self, dst: NodeId) -> bool {
        self.next_hop(dst).is_some()
    }

    /// Send an encoded frame towards `dst`.
    pub fn forward(&mut self, dst: NodeId, frame: Slice) -> Result<(), Status> {
        let hop = self
            .next_hop(dst)
            .ok_or_else(|| Status::unavailable(format!("no route to {}", dst)))?;
        let entry = self
            .links
            .get_mut(&hop)
            .ok_or_else(|| Status::internal("next hop without link"))?;
        entry.metrics.frames_sent += 1;
        entry.metrics.bytes_sent += frame.len() as u64;
        trace!(own = %self.own, %dst, via = %hop, len = frame.len(), "forward");
        entry.link.forward(frame)
    }

    /// Handle a frame that arrived on the link to `from`. Frames for this node
    /// are returned; others are relayed when we have a direct link to their
    /// destination.
    pub fn route_inbound(&mut self, from: NodeId, bytes: Slice) -> Result<Option<Frame>, Status> {
        if let Some(entry) = self.links.get_mut(&from) {
            entry.metrics.frames_received += 1;
        }
        let frame = wire::decode_frame(&bytes)?;
        let dst = frame.header.dst;
        if dst == self.own {
            return Ok(Some(frame));
        }
        if frame.header.src == self.own {
            warn!(own = %self.own, %from, "dropping frame that looped back");
            return Ok(None);
        }
        match self.links.get_mut(&dst) {
            Some(entry) => {
                trace!(own = %self.own, src = %frame.header.src, %dst, "relay");
                entry.metrics.frames_sent += 1;
                entry.metrics.bytes_sent += bytes.len() as u64;
                entry.link.forward(bytes)?;
                Ok(None)
            }
            None => Err(Status::unavailable(format!("cannot relay to {}", dst))),
        }
    }

    /// Replace what `from` reports about its links. Returns true if it changed.
    pub fn update_link_state(&mut self, from: NodeId, links: &[LinkDescription]) -> bool {
        let reach: BTreeSet<NodeId> = links
            .iter()
            .filter(|l| l.from == from && l.to != from)
            .map(|l| l.to)
            .collect();
        if self.reported.get(&from) == Some(&reach) {
            return false;
        }
        self.reported.insert(from, reach);
        true
    }

    /// Keep `description` if it is newer than what we hold for `node`.
    pub fn update_description(&mut self, node: NodeId, description: NodeDescription) -> bool {
        if node == self.own {
            return false;
        }
        match self.descriptions.get(&node) {
            Some(known) if known.version >= description.version => false,
            _ => {
                debug!(own = %self.own, %node, version = description.version, "description updated");
                self.descriptions.insert(node, description);
                true
            }
        }
    }

    pub fn description(&self, node: NodeId) -> Option<&NodeDescription> {
        self.descriptions.get(&node)
    }

    pub fn descriptions(&self) -> impl Iterator<Item = (NodeId, &NodeDescription)> {
        self.descriptions.iter().map(|(n, d)| (*n, d))
    }

    pub fn nodes_offering(&self, service: &str) -> Vec<NodeId> {
        self.descriptions
            .iter()
            .filter(|(_, d)| d.services.contains(service))
            .map(|(n, _)| *n)
            .collect()
    }

    /// Every node we have heard of, directly or through gossip.
    pub fn known_nodes(&self) -> BTreeSet<NodeId> {
        let mut out: BTreeSet<NodeId> = self.links.keys().copied().collect();
        out.extend(self.descriptions.keys().copied());
        for reach in self.reported.values() {
            out.extend(reach.iter().copied());
        }
        out.remove(&self.own);
        out
    }

    /// Our direct links, as gossiped to neighbours.
    pub fn link_descriptions(&self) -> Vec<LinkDescription> {
        self.links
            .iter()
            .map(|(peer, entry)| LinkDescription {
                from: self.own,
                to: *peer,
                rtt_us: entry.metrics.rtt.map(|d| d.as_micros() as u64),
            })
            .collect()
    }

    pub fn record_rtt(&mut self, peer: NodeId, rtt: Duration) {
        if let Some(entry) = self.links.get_mut(&peer) {
            entry.metrics.rtt = Some(rtt);
        }
    }

    pub fn link_metrics(&self, peer: NodeId) -> Option<LinkMetrics> {
        self.links.get(&peer).map(|e| e.metrics)
    }
}
