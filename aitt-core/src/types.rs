use bitflags::bitflags;
use derive_more::Display;
use num_enum::TryFromPrimitive;

bitflags! {
    /// Transport selection mask.
    ///
    /// `publish` accepts a union of flags and fans the message out to every
    /// selected transport; `subscribe` expects exactly one flag.
    pub struct Protocol: u32 {
        /// Route through the central broker.
        const MQTT = 0b0001;
        /// Direct peer-to-peer TCP channel.
        const TCP = 0b0010;
        /// Direct TCP channel with authenticated encryption.
        const TCP_SECURE = 0b0100;
        /// Reserved for the WebRTC media transport.
        const WEBRTC = 0b1000;
    }
}

impl Protocol {
    /// Key under which this transport advertises itself in the discovery map.
    pub fn discovery_key(self) -> &'static str {
        if self == Protocol::MQTT {
            "mqtt"
        } else if self == Protocol::TCP {
            "tcp"
        } else if self == Protocol::TCP_SECURE {
            "tcp_secure"
        } else if self == Protocol::WEBRTC {
            "webrtc"
        } else {
            "unknown"
        }
    }
}

/// Delivery assurance levels, following MQTT.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Display, Hash, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive,
)]
pub enum QoS {
    /// Fire and forget; the message arrives once or not at all.
    #[display(fmt = "at-most-once")]
    AtMostOnce = 0,

    /// Acknowledged delivery; duplicates are possible.
    #[display(fmt = "at-least-once")]
    AtLeastOnce = 1,

    /// Assured single delivery at the cost of a four-way handshake.
    #[display(fmt = "exactly-once")]
    ExactlyOnce = 2,
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtMostOnce
    }
}

/// Opaque handle identifying one subscription.
///
/// Handles are drawn from a process-wide counter and resolved through a
/// registry, so a stale or foreign handle fails cleanly instead of
/// dereferencing freed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscribeId(u64);

impl SubscribeId {
    #[doc(hidden)]
    pub fn from_raw(raw: u64) -> Self {
        SubscribeId(raw)
    }

    #[doc(hidden)]
    pub fn into_raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn test_protocol_mask() {
        let mask = Protocol::MQTT | Protocol::TCP;

        assert!(mask.contains(Protocol::MQTT));
        assert!(mask.contains(Protocol::TCP));
        assert!(!mask.contains(Protocol::TCP_SECURE));

        assert_eq!(Protocol::MQTT.bits(), 1);
        assert_eq!(Protocol::TCP.bits(), 2);
        assert_eq!(Protocol::TCP_SECURE.bits(), 4);
        assert_eq!(Protocol::WEBRTC.bits(), 8);
    }

    #[test]
    fn test_discovery_keys() {
        assert_eq!(Protocol::TCP.discovery_key(), "tcp");
        assert_eq!(Protocol::TCP_SECURE.discovery_key(), "tcp_secure");
        assert_eq!((Protocol::MQTT | Protocol::TCP).discovery_key(), "unknown");
    }

    #[test]
    fn test_qos() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());

        assert_eq!(QoS::default(), QoS::AtMostOnce);
        assert_eq!(QoS::ExactlyOnce.to_string(), "exactly-once");
    }
}
