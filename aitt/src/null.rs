use aitt_core::{
    Error, Protocol, QoS, Result, SubscribeFn, Transport, TransportHandle,
};

/// Stand-in for transports that are not part of this build (WebRTC).
///
/// Publishes vanish with a warning so a multi-transport fan-out keeps
/// working; subscriptions are refused.
pub(crate) struct NullTransport {
    protocol: Protocol,
}

impl NullTransport {
    pub fn new(protocol: Protocol) -> NullTransport {
        NullTransport { protocol }
    }
}

impl Transport for NullTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn publish(&self, topic: &str, _payload: &[u8], _qos: QoS, _retain: bool) -> Result<()> {
        warn!(
            "{:?} transport is not available, dropping publish on {}",
            self.protocol, topic
        );
        Ok(())
    }

    fn subscribe(&self, _topic: &str, _qos: QoS, _cb: SubscribeFn) -> Result<TransportHandle> {
        Err(Error::NotReady("transport not available in this build"))
    }

    fn unsubscribe(&self, handle: TransportHandle) -> Result<()> {
        Err(Error::InvalidParameter(format!(
            "unknown subscription handle {}",
            handle
        )))
    }

    fn discovery_message(&self) -> Option<Vec<u8>> {
        None
    }

    fn remote_discovered(&self, _peer_id: &str, _status: &str, _payload: &[u8]) {}
}
