use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rumqttc::v5::mqttbytes::v5::{LastWill, Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::{Client, Event, MqttOptions};

use aitt_core::{topic_matches, Error, MsgInfo, Protocol, QoS, Result};

/// Reserved user-property keys carrying streamed-reply bookkeeping.
const REPLY_SEQUENCE_NUM_KEY: &str = "sequenceNum";
const REPLY_IS_END_SEQUENCE_KEY: &str = "isEndSequence";

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Callback registered with the adapter; receives the reassembled envelope
/// and the payload on the broker client's network thread.
pub(crate) type MqCallback = Arc<dyn Fn(&mut MsgInfo, &[u8]) + Send + Sync>;

/// Observer of broker session state, invoked with `true` on (re)connection
/// and `false` when the session drops.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct WillInfo {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

struct SubscribeData {
    topic: String,
    cb: MqCallback,
}

/// Thin adapter over the MQTT v5 client.
///
/// Owns one broker session and a registry of pattern subscriptions; every
/// incoming publish is matched against the registry and handed to each
/// matching callback. Reply correlation state (response topic, correlation
/// data, sequence and end markers) travels in v5 properties and is unpacked
/// into the [`MsgInfo`] envelope here.
pub(crate) struct Mq {
    id: String,
    clean_session: bool,
    client: Mutex<Option<Client>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    subscribers: Arc<Mutex<HashMap<u64, SubscribeData>>>,
    next_handle: AtomicU64,
    will: Mutex<Option<WillInfo>>,
    connection_cb: Arc<Mutex<Option<ConnectionCallback>>>,
    closing: Arc<AtomicBool>,
}

impl Mq {
    pub fn new(id: &str, clean_session: bool) -> Mq {
        Mq {
            id: id.to_owned(),
            clean_session,
            client: Mutex::new(None),
            poller: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            will: Mutex::new(None),
            connection_cb: Arc::new(Mutex::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the testament published by the broker if this session dies
    /// without a clean disconnect. Must precede `connect`.
    pub fn set_will_info(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        *self.will.lock().unwrap() = Some(WillInfo {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
    }

    pub fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        *self.connection_cb.lock().unwrap() = cb;
    }

    pub fn is_connected(&self) -> bool {
        self.client.lock().unwrap().is_some()
    }

    pub fn connect(
        &self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let mut options = MqttOptions::new(self.id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(self.clean_session);
        if let (Some(username), Some(password)) = (username, password) {
            options.set_credentials(username, password);
        }
        if let Some(will) = self.will.lock().unwrap().as_ref() {
            options.set_last_will(LastWill {
                topic: will.topic.clone().into(),
                message: will.payload.clone().into(),
                qos: to_mqtt_qos(will.qos),
                retain: will.retain,
                properties: None,
            });
        }

        let (client, mut connection) = Client::new(options, 64);
        self.closing.store(false, Ordering::SeqCst);
        *self.client.lock().unwrap() = Some(client);

        let id = self.id.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let connection_cb = Arc::clone(&self.connection_cb);
        let closing = Arc::clone(&self.closing);
        let poller = thread::Builder::new()
            .name(format!("aitt-mq-{}", self.id))
            .spawn(move || {
                let mut connected = false;
                let notify = |connected: &mut bool| {
                    if *connected {
                        warn!("session {} lost its broker", id);
                        *connected = false;
                        if let Some(cb) = connection_cb.lock().unwrap().clone() {
                            cb(false);
                        }
                    }
                };

                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            debug!("session {} connected", id);
                            connected = true;
                            if let Some(cb) = connection_cb.lock().unwrap().clone() {
                                cb(true);
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            dispatch(&subscribers, &publish);
                        }
                        Ok(Event::Incoming(Packet::Disconnect(_))) => notify(&mut connected),
                        Err(e) => {
                            if closing.load(Ordering::SeqCst) {
                                break;
                            }
                            notify(&mut connected);
                            debug!("session {} connection error: {}", id, e);
                            // The client retries on its own; pace the error
                            // stream down while the broker is unreachable.
                            thread::sleep(Duration::from_secs(1));
                        }
                        Ok(_) => {}
                    }
                }
                debug!("session {} poller finished", id);
            })
            .map_err(Error::System)?;
        *self.poller.lock().unwrap() = Some(poller);

        Ok(())
    }

    pub fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(client) = self.client.lock().unwrap().take() {
            let _ = client.disconnect();
        }
        if let Some(poller) = self.poller.lock().unwrap().take() {
            let _ = poller.join();
        }
        self.subscribers.lock().unwrap().clear();
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        self.publish_with_properties(topic, payload, qos, retain, None)
    }

    /// Publish a request carrying the reply topic and correlation tag the
    /// responder will echo back.
    pub fn publish_with_reply(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        reply_topic: &str,
        correlation: &str,
    ) -> Result<()> {
        let properties = PublishProperties {
            response_topic: Some(reply_topic.to_owned()),
            correlation_data: Some(correlation.as_bytes().to_vec().into()),
            ..Default::default()
        };
        self.publish_with_properties(topic, payload, qos, retain, Some(properties))
    }

    /// Echo a response into the reply topic recorded in `msg`, carrying its
    /// current sequence number and end marker.
    pub fn send_reply(&self, msg: &MsgInfo, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        let reply_topic = msg
            .response_topic
            .as_ref()
            .ok_or(Error::NoData("message carries no reply topic"))?;

        let properties = PublishProperties {
            correlation_data: Some(msg.correlation.clone().into_bytes().into()),
            user_properties: vec![
                (REPLY_SEQUENCE_NUM_KEY.to_owned(), msg.sequence.to_string()),
                (REPLY_IS_END_SEQUENCE_KEY.to_owned(), msg.end_sequence.to_string()),
            ],
            ..Default::default()
        };
        self.publish_with_properties(reply_topic, payload, qos, retain, Some(properties))
    }

    fn publish_with_properties(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        properties: Option<PublishProperties>,
    ) -> Result<()> {
        let guard = self.client.lock().unwrap();
        let client = guard
            .as_ref()
            .ok_or(Error::NotReady("broker connection not established"))?;

        let result = match properties {
            Some(properties) => client.publish_with_properties(
                topic.to_owned(),
                to_mqtt_qos(qos),
                retain,
                payload.to_vec(),
                properties,
            ),
            None => client.publish(topic.to_owned(), to_mqtt_qos(qos), retain, payload.to_vec()),
        };

        result.map_err(|e| Error::Broker(e.to_string()))
    }

    pub fn subscribe(&self, topic: &str, qos: QoS, cb: MqCallback) -> Result<u64> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(
            handle,
            SubscribeData { topic: topic.to_owned(), cb },
        );

        let subscribed = {
            let guard = self.client.lock().unwrap();
            match guard.as_ref() {
                Some(client) => client
                    .subscribe(topic.to_owned(), to_mqtt_qos(qos))
                    .map_err(|e| Error::Broker(e.to_string())),
                None => Err(Error::NotReady("broker connection not established")),
            }
        };

        if let Err(e) = subscribed {
            self.subscribers.lock().unwrap().remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn unsubscribe(&self, handle: u64) -> Result<()> {
        let removed = self.subscribers.lock().unwrap().remove(&handle);
        let data = removed.ok_or_else(|| {
            Error::InvalidParameter(format!("unknown subscription handle {}", handle))
        })?;

        // Keep the broker subscription alive while another registration still
        // listens on the same pattern.
        let still_used = self
            .subscribers
            .lock()
            .unwrap()
            .values()
            .any(|other| other.topic == data.topic);
        if still_used {
            return Ok(());
        }

        let guard = self.client.lock().unwrap();
        if let Some(client) = guard.as_ref() {
            client
                .unsubscribe(data.topic)
                .map_err(|e| Error::Broker(e.to_string()))?;
        }
        Ok(())
    }
}

fn dispatch(subscribers: &Mutex<HashMap<u64, SubscribeData>>, publish: &Publish) {
    let topic = match std::str::from_utf8(&publish.topic) {
        Ok(topic) => topic.to_owned(),
        Err(_) => {
            warn!("dropping publish with non UTF-8 topic");
            return;
        }
    };

    let mut msg = MsgInfo::new(&topic, Protocol::MQTT);
    if let Some(properties) = publish.properties.as_ref() {
        msg.response_topic = properties.response_topic.clone();
        if let Some(correlation) = properties.correlation_data.as_ref() {
            msg.correlation = String::from_utf8_lossy(correlation).into_owned();
        }
        for (key, value) in &properties.user_properties {
            match key.as_str() {
                REPLY_SEQUENCE_NUM_KEY => msg.sequence = value.parse().unwrap_or(0),
                REPLY_IS_END_SEQUENCE_KEY => msg.end_sequence = value == "true",
                _ => {}
            }
        }
    }

    // Snapshot the matching callbacks so user code never runs under the
    // registry lock and may itself subscribe or unsubscribe.
    let matched: Vec<MqCallback> = subscribers
        .lock()
        .unwrap()
        .values()
        .filter(|data| topic_matches(&data.topic, &topic))
        .map(|data| data.cb.clone())
        .collect();

    for cb in matched {
        let mut msg = msg.clone();
        cb(&mut msg, &publish.payload);
    }
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_before_connect() {
        let mq = Mq::new("test-client", true);

        assert!(!mq.is_connected());
        assert!(matches!(
            mq.publish("any/topic", b"payload", QoS::AtMostOnce, false),
            Err(Error::NotReady(_))
        ));
        assert!(matches!(
            mq.subscribe("any/topic", QoS::AtMostOnce, Arc::new(|_, _| {})),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_failed_subscribe_leaves_no_registration() {
        let mq = Mq::new("test-client", true);

        let _ = mq.subscribe("any/topic", QoS::AtMostOnce, Arc::new(|_, _| {}));
        assert!(mq.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_handle() {
        let mq = Mq::new("test-client", true);

        assert!(matches!(
            mq.unsubscribe(42),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_dispatch_unpacks_reply_properties() {
        let subscribers = Mutex::new(HashMap::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let cb: MqCallback = Arc::new(move |msg: &mut MsgInfo, payload: &[u8]| {
            sink.lock().unwrap().push((msg.clone(), payload.to_vec()));
        });
        subscribers
            .lock()
            .unwrap()
            .insert(1, SubscribeData { topic: "rpc/#".to_owned(), cb });

        let publish = Publish {
            dup: false,
            qos: MqttQoS::AtMostOnce,
            retain: false,
            topic: "rpc/echo".into(),
            pkid: 0,
            payload: (&b"ping"[..]).into(),
            properties: Some(PublishProperties {
                response_topic: Some("rpc/echo_AittRe_0".to_owned()),
                correlation_data: Some(b"0001".to_vec().into()),
                user_properties: vec![
                    (REPLY_SEQUENCE_NUM_KEY.to_owned(), "3".to_owned()),
                    (REPLY_IS_END_SEQUENCE_KEY.to_owned(), "true".to_owned()),
                ],
                ..Default::default()
            }),
        };

        dispatch(&subscribers, &publish);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (msg, payload) = &seen[0];
        assert_eq!(msg.topic, "rpc/echo");
        assert_eq!(msg.response_topic.as_deref(), Some("rpc/echo_AittRe_0"));
        assert_eq!(msg.correlation, "0001");
        assert_eq!(msg.sequence, 3);
        assert!(msg.end_sequence);
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn test_dispatch_skips_unrelated_patterns() {
        let subscribers = Mutex::new(HashMap::new());
        let seen = Arc::new(Mutex::new(0u32));

        let sink = Arc::clone(&seen);
        let cb: MqCallback = Arc::new(move |_: &mut MsgInfo, _: &[u8]| {
            *sink.lock().unwrap() += 1;
        });
        subscribers
            .lock()
            .unwrap()
            .insert(1, SubscribeData { topic: "sensor/+".to_owned(), cb });

        let matching = Publish {
            dup: false,
            qos: MqttQoS::AtMostOnce,
            retain: false,
            topic: "sensor/temp".into(),
            pkid: 0,
            payload: (&b"21"[..]).into(),
            properties: None,
        };
        let unrelated = Publish {
            topic: "actuator/fan".into(),
            payload: (&b"on"[..]).into(),
            ..matching.clone()
        };
        dispatch(&subscribers, &matching);
        dispatch(&subscribers, &unrelated);

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
