use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;

use aitt_core::{valid_filter, valid_topic, Error, MsgInfo, Protocol, QoS, Result, SubscribeFn, SubscribeId, Transport};
use aitt_tcp::TcpTransport;

use crate::discovery::DiscoveryAgent;
use crate::event_loop::EventLoop;
use crate::mq::{ConnectionCallback, Mq, MqCallback};
use crate::null::NullTransport;
use crate::options::AittOption;
use crate::RESPONSE_POSTFIX;

/// Callback invoked for every message delivered to a subscription. MQTT
/// deliveries arrive on the engine's event-loop thread, direct-channel
/// deliveries on the transport's reader thread; neither may be blocked for
/// long.
pub type SubscribeCallback = Arc<dyn Fn(&mut MsgInfo, &[u8]) + Send + Sync>;

struct SubscriptionRecord {
    protocol: Protocol,
    inner: u64,
}

/// The transport-router engine.
///
/// One instance is one peer on the fabric: it owns the data and discovery
/// broker sessions, the direct-channel transports and the event-loop thread
/// user callbacks are dispatched on. Cloning is cheap and shares the
/// instance.
#[derive(Clone)]
pub struct Aitt {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    options: AittOption,
    mq: Mq,
    discovery: Arc<DiscoveryAgent>,
    tcp: Arc<TcpTransport>,
    tcp_secure: Arc<TcpTransport>,
    webrtc: Arc<NullTransport>,
    event_loop: EventLoop,
    subscriptions: Mutex<HashMap<SubscribeId, SubscriptionRecord>>,
    next_subscription: AtomicU64,
    next_reply: AtomicU64,
}

impl Aitt {
    /// Create an engine identified by `id` on the fabric; an empty `id` gets
    /// a generated printable one.
    pub fn new(id: &str, options: AittOption) -> Result<Aitt> {
        let id = if id.is_empty() {
            format!("aitt-{:08x}", rand::thread_rng().gen::<u32>())
        } else {
            id.to_owned()
        };

        let discovery = Arc::new(DiscoveryAgent::new(&id));
        let tcp = Arc::new(TcpTransport::new(&options.my_ip, false));
        let tcp_secure = Arc::new(TcpTransport::new(&options.my_ip, true));
        discovery.add_transport(tcp.clone());
        discovery.add_transport(tcp_secure.clone());

        // Any local change of a direct-channel table republishes the
        // retained advertisement, so late joiners converge without a
        // dedicated handshake.
        for transport in [&tcp, &tcp_secure].iter() {
            let discovery = Arc::downgrade(&discovery);
            transport.set_change_listener(Arc::new(move || advertise_weak(&discovery)));
        }

        let inner = Arc::new(Inner {
            mq: Mq::new(&id, options.clean_session),
            id,
            options,
            discovery,
            tcp,
            tcp_secure,
            webrtc: Arc::new(NullTransport::new(Protocol::WEBRTC)),
            event_loop: EventLoop::spawn("aitt-loop")?,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            next_reply: AtomicU64::new(0),
        });

        Ok(Aitt { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Register the testament published on the data session if this peer
    /// dies without a clean disconnect. Must precede `connect`.
    pub fn set_will_info(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        self.inner.mq.set_will_info(topic, payload, qos, retain);
    }

    /// Observe data-session state; invoked with `true` on (re)connection and
    /// `false` when the session drops.
    pub fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        self.inner.mq.set_connection_callback(cb);
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connect_with_credentials(host, port, None, None)
    }

    pub fn connect_with_credentials(
        &self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        if self.inner.options.custom_broker {
            debug!("using application-managed broker at {}:{}", host, port);
        }

        DiscoveryAgent::connect(&self.inner.discovery, host, port, username, password)?;
        self.inner.mq.connect(host, port, username, password)?;

        // Cover subscriptions made before the connection was up.
        self.inner.discovery.advertise()?;
        Ok(())
    }

    /// Tear down every subscription, say goodbye on the discovery topic and
    /// drop both broker sessions.
    pub fn disconnect(&self) -> Result<()> {
        let ids: Vec<SubscribeId> = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Err(e) = self.unsubscribe(id) {
                warn!("unsubscribe during disconnect failed: {}", e);
            }
        }

        if self.inner.discovery.is_connected() {
            if let Err(e) = self.inner.discovery.goodbye() {
                warn!("discovery goodbye failed: {}", e);
            }
        }
        self.inner.discovery.disconnect();
        self.inner.mq.disconnect();
        Ok(())
    }

    /// Fan `payload` out to every transport selected in `protocols`.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        protocols: Protocol,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        if !valid_topic(topic) {
            return Err(Error::InvalidParameter(format!("invalid topic '{}'", topic)));
        }
        if protocols.is_empty() {
            return Err(Error::InvalidParameter("no transport selected".to_owned()));
        }

        if protocols.contains(Protocol::MQTT) {
            self.inner.mq.publish(topic, payload, qos, retain)?;
        }
        if protocols.contains(Protocol::TCP) {
            self.inner.tcp.publish(topic, payload, qos, retain)?;
        }
        if protocols.contains(Protocol::TCP_SECURE) {
            self.inner.tcp_secure.publish(topic, payload, qos, retain)?;
        }
        if protocols.contains(Protocol::WEBRTC) {
            self.inner.webrtc.publish(topic, payload, qos, retain)?;
        }
        Ok(())
    }

    /// Subscribe `cb` to `topic` over exactly one transport.
    pub fn subscribe(
        &self,
        topic: &str,
        cb: SubscribeCallback,
        protocol: Protocol,
        qos: QoS,
    ) -> Result<SubscribeId> {
        if protocol.bits().count_ones() != 1 {
            return Err(Error::InvalidParameter(
                "subscribe expects exactly one transport".to_owned(),
            ));
        }
        if !valid_filter(topic) {
            return Err(Error::InvalidParameter(format!("invalid topic '{}'", topic)));
        }

        let id = self.next_subscription_id();
        let inner = if protocol == Protocol::MQTT {
            self.inner.mq.subscribe(topic, qos, self.detached(id, cb))?
        } else {
            let transport = self.direct_transport(protocol)?;
            let wrapper: SubscribeFn = Arc::new(move |msg_topic: &str, payload: &[u8]| {
                let mut msg = MsgInfo::new(msg_topic, protocol);
                msg.id = Some(id);
                cb(&mut msg, payload);
            });
            transport.subscribe(topic, qos, wrapper)?
        };

        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(id, SubscriptionRecord { protocol, inner });

        debug!("subscribed {:?} to {} over {:?}", id, topic, protocol);
        Ok(id)
    }

    /// Synchronously tear down everything `subscribe` created.
    pub fn unsubscribe(&self, id: SubscribeId) -> Result<()> {
        let record = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("unknown subscription handle {:?}", id))
            })?;

        if record.protocol == Protocol::MQTT {
            self.inner.mq.unsubscribe(record.inner)
        } else {
            self.direct_transport(record.protocol)?.unsubscribe(record.inner)
        }
    }

    /// Publish a request and stream the correlated responses into `cb`. The
    /// reply subscription removes itself once the end-marked response
    /// arrived.
    pub fn publish_with_reply(
        &self,
        topic: &str,
        payload: &[u8],
        protocol: Protocol,
        qos: QoS,
        cb: SubscribeCallback,
        correlation: &str,
    ) -> Result<()> {
        if protocol != Protocol::MQTT {
            return Err(Error::InvalidParameter(
                "replies are only supported over the broker".to_owned(),
            ));
        }

        let reply_topic = self.next_reply_topic(topic);
        let engine = self.clone();
        let wrapper: SubscribeCallback = Arc::new(move |msg: &mut MsgInfo, payload: &[u8]| {
            cb(msg, payload);

            if msg.end_sequence {
                if let Some(id) = msg.id {
                    if let Err(e) = engine.unsubscribe(id) {
                        warn!("reply unsubscribe failed: {}", e);
                    }
                }
            }
        });
        self.subscribe(&reply_topic, wrapper, Protocol::MQTT, qos)?;

        self.inner
            .mq
            .publish_with_reply(topic, payload, qos, false, &reply_topic, correlation)
    }

    /// Like `publish_with_reply`, but parks the caller until the end-marked
    /// response arrives. A non-zero `timeout` bounds the wait and re-arms on
    /// every received response frame; expiry yields [`Error::TimedOut`].
    pub fn publish_with_reply_sync(
        &self,
        topic: &str,
        payload: &[u8],
        protocol: Protocol,
        qos: QoS,
        cb: SubscribeCallback,
        correlation: &str,
        timeout: Duration,
    ) -> Result<()> {
        if protocol != Protocol::MQTT {
            return Err(Error::InvalidParameter(
                "replies are only supported over the broker".to_owned(),
            ));
        }

        let reply_topic = self.next_reply_topic(topic);
        let id = self.next_subscription_id();

        // Replies bypass the engine loop and land on this private channel;
        // the subscribing thread is the one event loop that consumes them.
        let (tx, rx) = mpsc::channel::<(MsgInfo, Vec<u8>)>();
        let sender = Mutex::new(tx);
        let wrapper: MqCallback = Arc::new(move |msg: &mut MsgInfo, payload: &[u8]| {
            msg.id = Some(id);
            let _ = sender.lock().unwrap().send((msg.clone(), payload.to_vec()));
        });

        let inner = self.inner.mq.subscribe(&reply_topic, qos, wrapper)?;
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(id, SubscriptionRecord { protocol: Protocol::MQTT, inner });

        let result = self
            .inner
            .mq
            .publish_with_reply(topic, payload, qos, false, &reply_topic, correlation)
            .and_then(|_| loop {
                let received = if timeout.as_millis() == 0 {
                    rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
                } else {
                    rx.recv_timeout(timeout)
                };

                match received {
                    Ok((mut msg, payload)) => {
                        cb(&mut msg, &payload);
                        if msg.end_sequence {
                            break Ok(());
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        error!("reply wait on {} timed out", reply_topic);
                        break Err(Error::TimedOut);
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        break Err(Error::Broker("reply channel closed".to_owned()))
                    }
                }
            });

        if let Err(e) = self.unsubscribe(id) {
            warn!("reply unsubscribe failed: {}", e);
        }
        result
    }

    /// Echo a response into the reply topic of `msg`, advancing its sequence
    /// number. A lone response flagged `end` keeps sequence 0.
    pub fn send_reply(&self, msg: &mut MsgInfo, payload: &[u8], end: bool) -> Result<()> {
        if !msg.protocol.contains(Protocol::MQTT) {
            return Err(Error::InvalidParameter(
                "replies are only supported over the broker".to_owned(),
            ));
        }

        if !end || msg.sequence > 0 {
            msg.increase_sequence();
        }
        msg.end_sequence = end;

        self.inner.mq.send_reply(msg, payload, QoS::AtMostOnce, false)
    }

    fn next_subscription_id(&self) -> SubscribeId {
        SubscribeId::from_raw(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst))
    }

    fn next_reply_topic(&self, topic: &str) -> String {
        format!(
            "{}{}{}",
            topic,
            RESPONSE_POSTFIX,
            self.inner.next_reply.fetch_add(1, Ordering::SeqCst)
        )
    }

    /// Wraps a user callback so the broker thread only posts it to the
    /// engine loop instead of running it, with a detached copy of the
    /// payload.
    fn detached(&self, id: SubscribeId, cb: SubscribeCallback) -> MqCallback {
        let event_loop = self.inner.event_loop.handle();

        Arc::new(move |msg: &mut MsgInfo, payload: &[u8]| {
            msg.id = Some(id);

            let mut msg = msg.clone();
            let payload = payload.to_vec();
            let cb = cb.clone();
            event_loop.post(move || cb(&mut msg, &payload));
        })
    }

    fn direct_transport(&self, protocol: Protocol) -> Result<Arc<dyn Transport>> {
        if protocol == Protocol::TCP {
            Ok(self.inner.tcp.clone())
        } else if protocol == Protocol::TCP_SECURE {
            Ok(self.inner.tcp_secure.clone())
        } else if protocol == Protocol::WEBRTC {
            Ok(self.inner.webrtc.clone())
        } else {
            Err(Error::InvalidParameter(format!(
                "unsupported transport {:?}",
                protocol
            )))
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.discovery.disconnect();
        self.mq.disconnect();
    }
}

fn advertise_weak(agent: &Weak<DiscoveryAgent>) {
    if let Some(agent) = agent.upgrade() {
        if !agent.is_connected() {
            return;
        }
        if let Err(e) = agent.advertise() {
            debug!("discovery advertisement deferred: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Aitt {
        Aitt::new("", AittOption::default()).unwrap()
    }

    fn noop() -> SubscribeCallback {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_generated_id_is_unique() {
        let a = engine();
        let b = engine();

        assert!(a.id().starts_with("aitt-"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_publish_argument_validation() {
        let engine = engine();

        assert!(matches!(
            engine.publish("", b"x", Protocol::MQTT, QoS::AtMostOnce, false),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            engine.publish("a/#", b"x", Protocol::MQTT, QoS::AtMostOnce, false),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            engine.publish("a/b", b"x", Protocol::empty(), QoS::AtMostOnce, false),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_subscribe_wants_a_single_transport() {
        let engine = engine();

        assert!(matches!(
            engine.subscribe("a/b", noop(), Protocol::MQTT | Protocol::TCP, QoS::AtMostOnce),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_mqtt_needs_a_connection() {
        let engine = engine();

        assert!(matches!(
            engine.subscribe("a/b", noop(), Protocol::MQTT, QoS::AtMostOnce),
            Err(Error::NotReady(_))
        ));
        assert!(matches!(
            engine.publish("a/b", b"x", Protocol::MQTT, QoS::AtMostOnce, false),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_direct_subscription_without_broker() {
        let engine = engine();

        // Direct-channel endpoints live locally; no broker is involved until
        // the advertisement is published.
        let id = engine
            .subscribe("local/#", noop(), Protocol::TCP, QoS::AtMostOnce)
            .unwrap();
        engine.unsubscribe(id).unwrap();

        assert!(matches!(
            engine.unsubscribe(id),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_webrtc_subscription_is_refused() {
        let engine = engine();

        assert!(matches!(
            engine.subscribe("media/#", noop(), Protocol::WEBRTC, QoS::AtMostOnce),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_reply_topics_are_unique_per_request() {
        let engine = engine();

        let first = engine.next_reply_topic("rpc");
        let second = engine.next_reply_topic("rpc");

        assert_eq!(first, "rpc_AittRe_0");
        assert_eq!(second, "rpc_AittRe_1");
    }

    #[test]
    fn test_reply_sequence_rule() {
        let engine = engine();

        // A lone end-marked reply keeps sequence 0; everything else
        // advances.
        let mut msg = MsgInfo::new("rpc", Protocol::MQTT);
        msg.response_topic = Some("rpc_AittRe_0".to_owned());

        let _ = engine.send_reply(&mut msg, b"only", true);
        assert_eq!(msg.sequence, 0);
        assert!(msg.end_sequence);

        let mut msg = MsgInfo::new("rpc", Protocol::MQTT);
        msg.response_topic = Some("rpc_AittRe_0".to_owned());

        let _ = engine.send_reply(&mut msg, b"part", false);
        assert_eq!(msg.sequence, 1);
        let _ = engine.send_reply(&mut msg, b"part", false);
        assert_eq!(msg.sequence, 2);
        let _ = engine.send_reply(&mut msg, b"done", true);
        assert_eq!(msg.sequence, 3);
        assert!(msg.end_sequence);
    }

    #[test]
    fn test_reply_needs_the_broker_transport() {
        let engine = engine();
        let mut msg = MsgInfo::new("rpc", Protocol::TCP);

        assert!(matches!(
            engine.send_reply(&mut msg, b"x", true),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            engine.publish_with_reply("rpc", b"x", Protocol::TCP, QoS::AtMostOnce, noop(), ""),
            Err(Error::InvalidParameter(_))
        ));
    }
}
