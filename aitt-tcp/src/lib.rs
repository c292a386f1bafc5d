//! Direct-channel transport: point-to-point TCP links established on demand
//! between peers, bypassing the broker for payloads that should not traverse
//! it.
//!
//! Every local subscription binds its own listening socket and advertises the
//! OS-assigned port through discovery; remote publishers connect lazily and
//! keep the connection cached for later publishes. Messages travel as two
//! length-prefixed frames (topic, then payload), optionally sealed with
//! AES-128-GCM under key material carried in the advertisement.

#[macro_use]
extern crate log;

mod crypto;
mod module;
mod server;
mod stream;

pub use self::crypto::{FrameCipher, IV_LEN, KEY_LEN};
pub use self::module::TcpTransport;
pub use self::stream::FrameStream;
