use std::sync::{Arc, Mutex};

use aitt_core::{MsgInfo, QoS, Result, Transport, JOIN_NETWORK, WILL_LEAVE_NETWORK};

use crate::mq::Mq;
use crate::DISCOVERY_TOPIC_BASE;

/// Maintains the eventually-consistent discovery view.
///
/// Every peer owns one retained broker topic under `/aitt/discovery/` where
/// it publishes a flexbuffers map of its current direct-channel
/// subscriptions; a broker will with an empty retained payload marks the peer
/// as departed. The agent runs its own broker session (the peer id with a
/// `d` discriminator, always a clean session) so discovery traffic never
/// competes with data traffic.
pub(crate) struct DiscoveryAgent {
    id: String,
    mq: Mq,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    handle: Mutex<Option<u64>>,
}

impl DiscoveryAgent {
    pub fn new(id: &str) -> DiscoveryAgent {
        DiscoveryAgent {
            id: id.to_owned(),
            mq: Mq::new(&format!("d{}", id), true),
            transports: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    /// Register a transport interested in discovery traffic. Must precede
    /// `connect`.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports.lock().unwrap().push(transport);
    }

    pub fn connect(
        agent: &Arc<DiscoveryAgent>,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        agent
            .mq
            .set_will_info(&agent.own_topic(), &[], QoS::ExactlyOnce, true);
        agent.mq.connect(host, port, username, password)?;

        let receiver = Arc::clone(agent);
        let handle = agent.mq.subscribe(
            &format!("{}+", DISCOVERY_TOPIC_BASE),
            QoS::ExactlyOnce,
            Arc::new(move |msg: &mut MsgInfo, payload: &[u8]| {
                receiver.on_message(msg, payload);
            }),
        )?;
        *agent.handle.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Re-publish the retained advertisement of the local subscription
    /// tables.
    pub fn advertise(&self) -> Result<()> {
        let mut builder = flexbuffers::Builder::default();
        {
            let mut map = builder.start_map();
            map.push("status", JOIN_NETWORK);

            for transport in self.transports.lock().unwrap().iter() {
                if let Some(blob) = transport.discovery_message() {
                    map.push(
                        transport.protocol().discovery_key(),
                        flexbuffers::Blob(&blob[..]),
                    );
                }
            }

            map.end_map();
        }

        self.mq
            .publish(&self.own_topic(), builder.view(), QoS::ExactlyOnce, true)
    }

    /// Retained empty payload on the own discovery topic, so remote routing
    /// tables evict this peer even after a clean disconnect.
    pub fn goodbye(&self) -> Result<()> {
        self.mq
            .publish(&self.own_topic(), &[], QoS::ExactlyOnce, true)
    }

    pub fn is_connected(&self) -> bool {
        self.mq.is_connected()
    }

    pub fn disconnect(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = self.mq.unsubscribe(handle);
        }
        self.mq.disconnect();
    }

    fn own_topic(&self) -> String {
        format!("{}{}", DISCOVERY_TOPIC_BASE, self.id)
    }

    fn on_message(&self, msg: &MsgInfo, payload: &[u8]) {
        let peer_id = msg
            .topic
            .strip_prefix(DISCOVERY_TOPIC_BASE)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("");
        if peer_id.is_empty() {
            warn!("discovery message on malformed topic {}", msg.topic);
            return;
        }

        let transports = self.transports.lock().unwrap().clone();

        if payload.is_empty() {
            debug!("peer {} left the network", peer_id);
            for transport in &transports {
                transport.remote_discovered(peer_id, WILL_LEAVE_NETWORK, &[]);
            }
            return;
        }

        let root = match flexbuffers::Reader::get_root(payload) {
            Ok(root) => root,
            Err(e) => {
                warn!("malformed advertisement from {}: {}", peer_id, e);
                return;
            }
        };
        let map = root.as_map();
        let status = map.idx("status").as_str().to_owned();

        for key in map.iter_keys() {
            if key == "status" {
                continue;
            }

            let blob = map.idx(key).as_blob();
            for transport in &transports {
                if transport.protocol().discovery_key() == key {
                    transport.remote_discovered(peer_id, &status, blob.0);
                }
            }
        }
    }
}
