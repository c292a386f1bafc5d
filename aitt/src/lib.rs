//! AITT: topic-addressed publish/subscribe for devices on a LAN.
//!
//! Applications address messages by hierarchical topics (`+` matches one
//! level, `#` a trailing suffix) and pick, per call, how they travel: through
//! the central MQTT broker for small control messages, or over a direct TCP
//! channel for payloads that should not traverse the broker. Peers advertise
//! the topics they serve directly through a retained discovery topic on the
//! broker; remote engines then connect and publish to them point-to-point.
//! A request/reply pattern with multi-part streamed responses is layered on
//! top of the broker transport.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use aitt::{Aitt, AittOption, Protocol, QoS, SubscribeCallback};
//!
//! # fn main() -> aitt::Result<()> {
//! let engine = Aitt::new("bedroom-sensor", AittOption::default())?;
//! engine.connect("127.0.0.1", 1883)?;
//!
//! let on_temperature: SubscribeCallback = Arc::new(|msg, payload| {
//!     println!("{}: {} bytes", msg.topic, payload.len());
//! });
//! engine.subscribe(
//!     "home/+/temperature",
//!     on_temperature,
//!     Protocol::MQTT,
//!     QoS::AtMostOnce,
//! )?;
//!
//! engine.publish(
//!     "home/bedroom/temperature",
//!     b"21.5",
//!     Protocol::MQTT | Protocol::TCP,
//!     QoS::AtMostOnce,
//!     false,
//! )?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

mod discovery;
mod engine;
mod event_loop;
mod mq;
mod null;
mod options;

pub use aitt_core::{Error, MsgInfo, Protocol, QoS, Result, SubscribeId};

pub use self::engine::{Aitt, SubscribeCallback};
pub use self::mq::ConnectionCallback;
pub use self::options::AittOption;

/// Base of the per-peer retained discovery topics.
pub(crate) const DISCOVERY_TOPIC_BASE: &str = "/aitt/discovery/";

/// Suffix joining a request topic to its synthetic reply topic.
pub(crate) const RESPONSE_POSTFIX: &str = "_AittRe_";
