//! Tunables for the endpoint and the packet nub.

use std::time::Duration;

use crate::codec::CodecLimits;

/// Default initial gossip interval.
pub const DEFAULT_GOSSIP_INITIAL_INTERVAL: Duration = Duration::from_millis(42);

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// First gossip round after a connection becomes active, and the interval
    /// used again whenever local services or links change.
    pub gossip_initial_interval: Duration,
    /// Gossip interval stops doubling here.
    pub gossip_max_interval: Duration,
    /// Largest application message (after framing) a stream accepts.
    pub max_message_size: usize,
    /// Most forks a single message may carry.
    pub max_forks: usize,
    /// Unacknowledged messages allowed per reliable stream.
    pub send_window: usize,
    /// Received messages a stream queues before the application reads them.
    /// Reliable data beyond this is left for the peer to retransmit;
    /// unreliable data is dropped.
    pub recv_window: usize,
    /// First retransmission delay; doubles on each unanswered round.
    pub retransmit_timeout: Duration,
    /// Rounds without progress before a stream is given up.
    pub max_retransmits: u32,
    /// Frames buffered for a peer stream whose fork has not been seen yet.
    pub max_early_frames: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            gossip_initial_interval: DEFAULT_GOSSIP_INITIAL_INTERVAL,
            gossip_max_interval: Duration::from_secs(5),
            max_message_size: 60 * 1024,
            max_forks: 64,
            send_window: 32,
            recv_window: 128,
            retransmit_timeout: Duration::from_millis(200),
            max_retransmits: 8,
            max_early_frames: 64,
        }
    }
}

impl EndpointConfig {
    pub fn with_gossip_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.gossip_initial_interval = initial;
        self.gossip_max_interval = max.max(initial);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_forks(mut self, forks: usize) -> Self {
        self.max_forks = forks;
        self
    }

    pub fn with_send_window(mut self, window: usize) -> Self {
        self.send_window = window.max(1);
        self
    }

    pub fn with_recv_window(mut self, window: usize) -> Self {
        self.recv_window = window.max(1);
        self
    }

    pub fn with_retransmit(mut self, timeout: Duration, max_retransmits: u32) -> Self {
        self.retransmit_timeout = timeout;
        self.max_retransmits = max_retransmits;
        self
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_message_size: self.max_message_size,
            max_forks: self.max_forks,
        }
    }

    /// Delay before retransmission round `round` (1-based).
    pub fn retransmit_delay(&self, round: u32) -> Duration {
        self.retransmit_timeout
            .saturating_mul(1u32 << round.min(16).saturating_sub(1))
    }
}

/// Packet nub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NubConfig {
    pub announce_interval: Duration,
    pub max_announce_attempts: u32,
    /// Largest datagram handed to the packet sender.
    pub max_datagram_size: usize,
    /// Links silent for this long are removed by `PacketNub::expire_idle`.
    pub link_idle_timeout: Duration,
}

impl Default for NubConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_millis(500),
            max_announce_attempts: 10,
            max_datagram_size: 65_507,
            link_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl NubConfig {
    pub fn with_announce(mut self, interval: Duration, attempts: u32) -> Self {
        self.announce_interval = interval;
        self.max_announce_attempts = attempts;
        self
    }

    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    pub fn with_link_idle_timeout(mut self, timeout: Duration) -> Self {
        self.link_idle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EndpointConfig::default();
        assert_eq!(c.gossip_initial_interval, Duration::from_millis(42));
        assert!(c.gossip_max_interval > c.gossip_initial_interval);
        assert_eq!(c.codec_limits().max_forks, 64);
        assert!(c.recv_window >= c.send_window);
        assert_eq!(c.with_recv_window(0).recv_window, 1);
    }

    #[test]
    fn retransmit_backoff_doubles() {
        let c = EndpointConfig::default().with_retransmit(Duration::from_millis(100), 3);
        assert_eq!(c.retransmit_delay(1), Duration::from_millis(100));
        assert_eq!(c.retransmit_delay(2), Duration::from_millis(200));
        assert_eq!(c.retransmit_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn max_gossip_never_below_initial() {
        let c = EndpointConfig::default()
            .with_gossip_intervals(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(c.gossip_max_interval, Duration::from_secs(2));
    }
}
