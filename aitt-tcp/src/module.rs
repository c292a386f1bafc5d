use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use aitt_core::{
    topic_matches, valid_filter, Error, Protocol, QoS, Result, SubscribeFn, Transport,
    TransportHandle, WILL_LEAVE_NETWORK,
};

use crate::crypto::{IV_LEN, KEY_LEN};
use crate::server::Listener;
use crate::stream::FrameStream;

/// Remote endpoint advertised for one (topic, peer) pair, plus the lazily
/// established outbound connection to it.
struct Route {
    port: u16,
    secret: Option<([u8; KEY_LEN], [u8; IV_LEN])>,
    conn: Option<FrameStream>,
}

/// The direct-channel transport, in plaintext or secure flavour.
///
/// Keeps three tables: the local listeners (one per subscription), the routes
/// learned from discovery keyed by (topic, peer), and the peer address map
/// translating peer ids into host addresses. Lock ordering is listeners,
/// then routes, then peers; publishing never takes the listeners lock.
pub struct TcpTransport {
    my_ip: String,
    secure: bool,
    listeners: Mutex<HashMap<TransportHandle, Listener>>,
    routes: Mutex<HashMap<(String, String), Route>>,
    peers: Mutex<HashMap<String, String>>,
    next_handle: AtomicU64,
    on_change: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl TcpTransport {
    pub fn new(my_ip: &str, secure: bool) -> TcpTransport {
        TcpTransport {
            my_ip: my_ip.to_owned(),
            secure,
            listeners: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            on_change: Mutex::new(None),
        }
    }

    /// Invoked after every local subscription change, so the engine can
    /// republish the retained advertisement.
    pub fn set_change_listener(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        *self.on_change.lock().unwrap() = Some(listener);
    }

    fn notify_change(&self) {
        let listener = self.on_change.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn update_route(
        &self,
        topic: &str,
        peer_id: &str,
        port: u16,
        secret: Option<([u8; KEY_LEN], [u8; IV_LEN])>,
    ) {
        let mut routes = self.routes.lock().unwrap();
        let key = (topic.to_owned(), peer_id.to_owned());

        match routes.get_mut(&key) {
            // Re-advertisement of the same port keeps the cached connection.
            Some(route) if route.port == port => {}
            Some(route) => {
                debug!("peer {} moved topic {} to port {}", peer_id, topic, port);
                route.port = port;
                route.secret = secret;
                route.conn = None;
            }
            None => {
                routes.insert(key, Route { port, secret, conn: None });
            }
        }
    }

    fn forget_peer(&self, peer_id: &str) {
        self.routes
            .lock()
            .unwrap()
            .retain(|(_, peer), _| peer != peer_id);
        self.peers.lock().unwrap().remove(peer_id);
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        if self.secure {
            Protocol::TCP_SECURE
        } else {
            Protocol::TCP
        }
    }

    fn publish(&self, topic: &str, payload: &[u8], _qos: QoS, _retain: bool) -> Result<()> {
        let mut routes = self.routes.lock().unwrap();

        for ((route_topic, peer_id), route) in routes.iter_mut() {
            // The recorded subscriber topic may itself contain wildcards.
            if !topic_matches(route_topic, topic) {
                continue;
            }

            if route.conn.is_none() {
                let host = self.peers.lock().unwrap().get(peer_id).cloned();
                let host = match host {
                    Some(host) => host,
                    None => {
                        warn!("no address known for peer {}", peer_id);
                        continue;
                    }
                };

                match FrameStream::connect(
                    &host,
                    route.port,
                    route.secret.as_ref().map(|(key, iv)| (key, iv)),
                ) {
                    Ok(conn) => route.conn = Some(conn),
                    Err(e) => {
                        warn!("connect to {}:{} failed: {}", host, route.port, e);
                        continue;
                    }
                }
            }

            if let Some(conn) = route.conn.as_mut() {
                if let Err(e) = conn.send_message(topic, payload) {
                    // Drop the dead connection; the next re-advertisement or
                    // publish rebuilds it.
                    warn!("send to peer {} failed: {}", peer_id, e);
                    route.conn = None;
                }
            }
        }

        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QoS, cb: SubscribeFn) -> Result<TransportHandle> {
        if !valid_filter(topic) {
            return Err(Error::InvalidParameter(format!("invalid topic '{}'", topic)));
        }

        let listener = Listener::spawn(topic, self.secure, cb)?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().insert(handle, listener);

        self.notify_change();
        Ok(handle)
    }

    fn unsubscribe(&self, handle: TransportHandle) -> Result<()> {
        let listener = self.listeners.lock().unwrap().remove(&handle);
        match listener {
            // Dropping the listener stops the accept thread and closes every
            // accepted connection before returning.
            Some(listener) => drop(listener),
            None => {
                return Err(Error::InvalidParameter(format!(
                    "unknown subscription handle {}",
                    handle
                )))
            }
        }

        self.notify_change();
        Ok(())
    }

    fn discovery_message(&self) -> Option<Vec<u8>> {
        let listeners = self.listeners.lock().unwrap();
        if listeners.is_empty() {
            return None;
        }

        let mut builder = flexbuffers::Builder::default();
        {
            let mut map = builder.start_map();
            map.push("host", self.my_ip.as_str());

            for listener in listeners.values() {
                let mut endpoint = map.start_vector(listener.topic());
                endpoint.push(listener.port());
                if let Some((key, iv)) = listener.secret() {
                    endpoint.push(flexbuffers::Blob(&key[..]));
                    endpoint.push(flexbuffers::Blob(&iv[..]));
                }
                endpoint.end_vector();
            }

            map.end_map();
        }

        Some(builder.view().to_vec())
    }

    fn remote_discovered(&self, peer_id: &str, status: &str, payload: &[u8]) {
        if status == WILL_LEAVE_NETWORK {
            debug!("peer {} left, dropping its routes", peer_id);
            self.forget_peer(peer_id);
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

        let host = map.idx("host").as_str().to_owned();
        if host.is_empty() {
            warn!("advertisement from {} carries no host", peer_id);
            return;
        }
        self.peers
            .lock()
            .unwrap()
            .insert(peer_id.to_owned(), host);

        for topic in map.iter_keys() {
            if topic == "host" {
                continue;
            }

            let endpoint = map.idx(topic).as_vector();
            let port = endpoint.idx(0).as_u16();
            if port == 0 {
                warn!("peer {} advertises a dead endpoint for {}", peer_id, topic);
                continue;
            }

            let secret = if self.secure {
                if endpoint.len() != 3 {
                    warn!("peer {} advertises {} without key material", peer_id, topic);
                    continue;
                }

                let key_blob = endpoint.idx(1).as_blob();
                let iv_blob = endpoint.idx(2).as_blob();
                if key_blob.0.len() != KEY_LEN || iv_blob.0.len() != IV_LEN {
                    warn!("peer {} advertises malformed key material for {}", peer_id, topic);
                    continue;
                }

                let mut key = [0u8; KEY_LEN];
                let mut iv = [0u8; IV_LEN];
                key.copy_from_slice(key_blob.0);
                iv.copy_from_slice(iv_blob.0);
                Some((key, iv))
            } else {
                None
            };

            self.update_route(topic, peer_id, port, secret);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use aitt_core::JOIN_NETWORK;

    use super::*;

    fn collector() -> (SubscribeFn, mpsc::Receiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let cb: SubscribeFn = Arc::new(move |topic: &str, payload: &[u8]| {
            let _ = tx.lock().unwrap().send((topic.to_owned(), payload.to_vec()));
        });
        (cb, rx)
    }

    /// Feed one instance's advertisement into another and publish across the
    /// resulting route, with no broker involved.
    fn link(subscriber: &TcpTransport, publisher: &TcpTransport, peer_id: &str) {
        let blob = subscriber.discovery_message().expect("advertisement");
        publisher.remote_discovered(peer_id, JOIN_NETWORK, &blob);
    }

    #[test]
    fn test_wildcard_fan_out() {
        let _ = pretty_env_logger::try_init();
        let subscriber = TcpTransport::new("127.0.0.1", false);
        let publisher = TcpTransport::new("127.0.0.1", false);

        let (cb, rx) = collector();
        subscriber.subscribe("test/#", QoS::AtMostOnce, cb).unwrap();
        link(&subscriber, &publisher, "peer-a");

        publisher.publish("test/a/x", &[0u8; 12], QoS::AtMostOnce, false).unwrap();
        publisher.publish("test/b/x", &[0u8; 1600], QoS::AtMostOnce, false).unwrap();
        publisher.publish("test/b/x", &[0u8; 1600], QoS::AtMostOnce, false).unwrap();

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let (_, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            sizes.push(payload.len());
        }
        assert_eq!(sizes, vec![12, 1600, 1600]);
    }

    #[test]
    fn test_plus_wildcard_precision() {
        let subscriber = TcpTransport::new("127.0.0.1", false);
        let publisher = TcpTransport::new("127.0.0.1", false);

        let (cb, rx) = collector();
        subscriber.subscribe("test/+", QoS::AtMostOnce, cb).unwrap();
        link(&subscriber, &publisher, "peer-a");

        publisher.publish("test/a", b"match", QoS::AtMostOnce, false).unwrap();
        publisher.publish("test/a/b", b"skip", QoS::AtMostOnce, false).unwrap();

        let (topic, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(topic, "test/a");
        assert_eq!(payload, b"match");
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_secure_channel() {
        let subscriber = TcpTransport::new("127.0.0.1", true);
        let publisher = TcpTransport::new("127.0.0.1", true);

        let (cb, rx) = collector();
        subscriber.subscribe("vault/#", QoS::AtMostOnce, cb).unwrap();
        link(&subscriber, &publisher, "peer-a");

        publisher.publish("vault/doc", b"classified", QoS::AtMostOnce, false).unwrap();

        let (topic, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(topic, "vault/doc");
        assert_eq!(payload, b"classified");
    }

    #[test]
    fn test_departed_peer_is_forgotten() {
        let subscriber = TcpTransport::new("127.0.0.1", false);
        let publisher = TcpTransport::new("127.0.0.1", false);

        let (cb, rx) = collector();
        subscriber.subscribe("test/#", QoS::AtMostOnce, cb).unwrap();
        link(&subscriber, &publisher, "peer-a");

        publisher.remote_discovered("peer-a", WILL_LEAVE_NETWORK, &[]);
        publisher.publish("test/a", b"lost", QoS::AtMostOnce, false).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(publisher.routes.lock().unwrap().is_empty());
        assert!(publisher.peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_route_updates_are_idempotent() {
        let transport = TcpTransport::new("127.0.0.1", false);

        transport.update_route("sensor/#", "peer-a", 4242, None);
        transport.update_route("sensor/#", "peer-a", 4242, None);
        transport.update_route("sensor/#", "peer-a", 5353, None);

        let routes = transport.routes.lock().unwrap();
        assert_eq!(routes.len(), 1);
        let route = routes
            .get(&("sensor/#".to_owned(), "peer-a".to_owned()))
            .unwrap();
        assert_eq!(route.port, 5353);
        assert!(route.conn.is_none());
    }

    #[test]
    fn test_unsubscribe_closes_endpoint() {
        let transport = TcpTransport::new("127.0.0.1", false);

        let (cb, _rx) = collector();
        let handle = transport.subscribe("test/#", QoS::AtMostOnce, cb).unwrap();

        assert!(transport.discovery_message().is_some());
        transport.unsubscribe(handle).unwrap();
        assert!(transport.discovery_message().is_none());

        assert!(transport.unsubscribe(handle).is_err());
    }
}
