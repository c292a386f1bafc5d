//! Core vocabulary of the AITT pub/sub fabric.
//!
//! Everything the engine and the pluggable transports need to agree on lives
//! here: the [`Protocol`] transport selection mask, delivery [`QoS`], the
//! error taxonomy, MQTT-style topic wildcard matching, the [`MsgInfo`]
//! envelope handed to subscription callbacks and the [`Transport`] trait a
//! point-to-point transport implements.

mod error;
mod message;
mod topic;
mod transport;
mod types;

pub use self::error::{Error, Result};
pub use self::message::MsgInfo;
pub use self::topic::{topic_matches, valid_filter, valid_topic};
pub use self::transport::{SubscribeFn, Transport, TransportHandle};
pub use self::types::{Protocol, QoS, SubscribeId};

/// Hard upper bound on a decoded direct-channel payload. Anything larger is
/// treated as a hostile or corrupted length field and aborts the connection.
pub const MESSAGE_MAX: usize = 10 * 1024 * 1024;

/// Discovery status advertised by a live peer.
pub const JOIN_NETWORK: &str = "connected";

/// Discovery status carried by a broker will or an explicit goodbye.
pub const WILL_LEAVE_NETWORK: &str = "disconnected";
