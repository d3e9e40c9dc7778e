//! Overnet mesh core: nodes linked by arbitrary datagram transports, reliable
//! and unreliable streams multiplexed between any two of them, and bridges
//! from those streams to local channels and sockets.
//!
//! Everything runs on a single-threaded `tokio::task::LocalSet`.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod identity;
pub mod nub;
pub mod protocol;
pub mod router;
mod sequencing;
pub mod slice;
pub mod status;
pub mod stream;
pub mod timer;
pub mod varint;
pub mod wire;

#[cfg(test)]
mod test_util;

pub use bridge::{BridgeFactory, BridgeHandle, BridgedStream, LocalChannel, LocalMessage};
pub use codec::CodecLimits;
pub use config::{EndpointConfig, NubConfig};
pub use connection::ConnectionState;
pub use endpoint::RouterEndpoint;
pub use identity::{Keypair, NodeId, PublicKey, StreamId};
pub use nub::{PacketNub, PacketSender};
pub use protocol::{Introduction, ReliabilityAndOrdering, PROTOCOL_VERSION};
pub use router::{Link, LinkMetrics};
pub use slice::Slice;
pub use status::{Status, StatusCode};
pub use stream::{NewStream, ReceivedIntroduction, Stream};
pub use timer::{Timer, TokioTimer};
