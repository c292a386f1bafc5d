use std::sync::Arc;

use crate::error::Result;
use crate::types::{Protocol, QoS};

/// Callback a transport invokes for every message received on one of its
/// subscriptions, with the concrete topic and the payload. Runs on the
/// transport's own loop thread and must not block it.
pub type SubscribeFn = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Transport-level subscription handle.
pub type TransportHandle = u64;

/// A pluggable point-to-point transport.
///
/// The engine multiplexes `publish` over every selected transport and feeds
/// each transport the discovery traffic addressed to it. Implementations own
/// their sockets and worker threads; `unsubscribe` must release everything a
/// `subscribe` acquired before it returns.
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Send `payload` to every known remote subscriber matching `topic`.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()>;

    /// Start serving `topic`; `cb` fires for every inbound message.
    fn subscribe(&self, topic: &str, qos: QoS, cb: SubscribeFn) -> Result<TransportHandle>;

    /// Tear down the endpoint created by `subscribe`.
    fn unsubscribe(&self, handle: TransportHandle) -> Result<()>;

    /// Current advertisement blob, or `None` while nothing is served.
    fn discovery_message(&self) -> Option<Vec<u8>>;

    /// Discovery traffic addressed to this transport from `peer_id`. A
    /// departed status retracts everything known about the peer.
    fn remote_discovered(&self, peer_id: &str, status: &str, payload: &[u8]);
}
