use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use byteorder::{ByteOrder, LittleEndian};
use rand::Rng;

use aitt_core::MESSAGE_MAX;

use crate::crypto::{FrameCipher, IV_LEN, KEY_LEN, SALT_LEN};

/// Sentinel length denoting an intentionally empty payload. Distinguishes a
/// zero-byte message from a closed socket, which yields a short read instead.
const EMPTY_SENTINEL: u64 = u32::max_value() as u64;

const LEN_FIELD: usize = 8;

/// A TCP connection carrying sized frames.
///
/// Each logical message is two consecutive frames: the topic bytes, then the
/// payload bytes. A frame is an 8-byte little-endian length followed by that
/// many payload bytes; in secure mode the length field and the payload are
/// sealed as two separate AEAD sections and the length field carries the
/// ciphertext length of the payload section.
pub struct FrameStream {
    stream: TcpStream,
    cipher: Option<FrameCipher>,
}

impl FrameStream {
    /// Open an outbound connection to a remote listener. For a secure
    /// endpoint, a fresh connection salt is sent in the clear before any
    /// frame.
    pub fn connect(
        host: &str,
        port: u16,
        secret: Option<(&[u8; KEY_LEN], &[u8; IV_LEN])>,
    ) -> io::Result<FrameStream> {
        if port == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "endpoint advertises port 0",
            ));
        }

        let mut stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;

        let cipher = match secret {
            Some((key, iv)) => {
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill(&mut salt[..]);
                stream.write_all(&salt)?;
                Some(FrameCipher::new(key, iv, salt))
            }
            None => None,
        };

        Ok(FrameStream { stream, cipher })
    }

    /// Wrap a freshly accepted connection; reads the publisher's connection
    /// salt when the endpoint is secure.
    pub fn accepted(
        mut stream: TcpStream,
        secret: Option<(&[u8; KEY_LEN], &[u8; IV_LEN])>,
    ) -> io::Result<FrameStream> {
        stream.set_nodelay(true)?;

        let cipher = match secret {
            Some((key, iv)) => {
                let mut salt = [0u8; SALT_LEN];
                stream.read_exact(&mut salt)?;
                Some(FrameCipher::new(key, iv, salt))
            }
            None => None,
        };

        Ok(FrameStream { stream, cipher })
    }

    pub fn send_message(&mut self, topic: &str, payload: &[u8]) -> io::Result<()> {
        self.send_frame(topic.as_bytes())?;
        self.send_frame(payload)
    }

    pub fn recv_message(&mut self) -> io::Result<(String, Vec<u8>)> {
        let topic = self.recv_frame()?;
        let topic = String::from_utf8(topic)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "topic is not UTF-8"))?;
        if topic.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty topic frame"));
        }

        let payload = self.recv_frame()?;
        Ok((topic, payload))
    }

    pub fn send_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let FrameStream { stream, cipher } = self;
        let mut len_field = [0u8; LEN_FIELD];

        match cipher {
            Some(cipher) => {
                if payload.is_empty() {
                    LittleEndian::write_u64(&mut len_field, EMPTY_SENTINEL);
                    let sealed_len = cipher.seal(&len_field)?;
                    stream.write_all(&sealed_len)
                } else {
                    let sealed_payload = cipher.seal(payload)?;
                    LittleEndian::write_u64(&mut len_field, sealed_payload.len() as u64);
                    let sealed_len = cipher.seal(&len_field)?;
                    stream.write_all(&sealed_len)?;
                    stream.write_all(&sealed_payload)
                }
            }
            None => {
                if payload.is_empty() {
                    LittleEndian::write_u64(&mut len_field, EMPTY_SENTINEL);
                    stream.write_all(&len_field)
                } else {
                    LittleEndian::write_u64(&mut len_field, payload.len() as u64);
                    stream.write_all(&len_field)?;
                    stream.write_all(payload)
                }
            }
        }
    }

    pub fn recv_frame(&mut self) -> io::Result<Vec<u8>> {
        let FrameStream { stream, cipher } = self;

        match cipher {
            Some(cipher) => {
                let mut sealed_len = [0u8; FrameCipher::sealed_len(LEN_FIELD)];
                stream.read_exact(&mut sealed_len)?;
                let len_field = cipher.open(&sealed_len)?;
                if len_field.len() != LEN_FIELD {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "malformed length field",
                    ));
                }

                let sealed_size = LittleEndian::read_u64(&len_field);
                if sealed_size == EMPTY_SENTINEL {
                    return Ok(Vec::new());
                }
                if sealed_size as usize > FrameCipher::sealed_len(MESSAGE_MAX) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds the message size limit",
                    ));
                }

                let mut sealed = vec![0u8; sealed_size as usize];
                stream.read_exact(&mut sealed)?;
                cipher.open(&sealed)
            }
            None => {
                let mut len_field = [0u8; LEN_FIELD];
                stream.read_exact(&mut len_field)?;

                let size = LittleEndian::read_u64(&len_field);
                if size == EMPTY_SENTINEL {
                    return Ok(Vec::new());
                }
                if size as usize > MESSAGE_MAX {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds the message size limit",
                    ));
                }

                let mut payload = vec![0u8; size as usize];
                stream.read_exact(&mut payload)?;
                Ok(payload)
            }
        }
    }

    /// Abort both directions; any blocked reader observes a short read.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn secret() -> ([u8; KEY_LEN], [u8; IV_LEN]) {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill(&mut key[..]);
        rand::thread_rng().fill(&mut iv[..]);
        (key, iv)
    }

    fn loopback_pair(
        secret: Option<([u8; KEY_LEN], [u8; IV_LEN])>,
    ) -> (FrameStream, FrameStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let outbound = FrameStream::connect(
            "127.0.0.1",
            port,
            secret.as_ref().map(|(key, iv)| (key, iv)),
        )
        .unwrap();
        let inbound =
            FrameStream::accepted(accept.join().unwrap(), secret.as_ref().map(|(key, iv)| (key, iv)))
                .unwrap();

        (outbound, inbound)
    }

    #[test]
    fn test_plain_round_trip() {
        let (mut tx, mut rx) = loopback_pair(None);

        tx.send_message("test/a/x", &[0u8; 12]).unwrap();
        tx.send_message("test/b/x", &[7u8; 1600]).unwrap();

        assert_eq!(rx.recv_message().unwrap(), ("test/a/x".to_owned(), vec![0u8; 12]));
        assert_eq!(rx.recv_message().unwrap(), ("test/b/x".to_owned(), vec![7u8; 1600]));
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let (mut tx, mut rx) = loopback_pair(None);

        tx.send_message("test/empty", &[]).unwrap();

        let (topic, payload) = rx.recv_message().unwrap();
        assert_eq!(topic, "test/empty");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_secure_round_trip() {
        let (mut tx, mut rx) = loopback_pair(Some(secret()));

        tx.send_message("test/secure", b"confidential").unwrap();
        tx.send_message("test/secure", &[]).unwrap();

        assert_eq!(
            rx.recv_message().unwrap(),
            ("test/secure".to_owned(), b"confidential".to_vec())
        );
        assert_eq!(rx.recv_message().unwrap(), ("test/secure".to_owned(), Vec::new()));
    }

    #[test]
    fn test_secure_matches_plain_payloads() {
        let payloads: Vec<Vec<u8>> = vec![vec![], vec![1], vec![0xaa; 1600]];

        let (mut plain_tx, mut plain_rx) = loopback_pair(None);
        let (mut secure_tx, mut secure_rx) = loopback_pair(Some(secret()));

        for payload in &payloads {
            plain_tx.send_frame(payload).unwrap();
            secure_tx.send_frame(payload).unwrap();

            assert_eq!(plain_rx.recv_frame().unwrap(), *payload);
            assert_eq!(secure_rx.recv_frame().unwrap(), *payload);
        }
    }

    #[test]
    fn test_disconnect_is_not_a_frame() {
        let (tx, mut rx) = loopback_pair(None);

        drop(tx);

        assert!(rx.recv_frame().is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut rx = FrameStream::accepted(accept.join().unwrap(), None).unwrap();

        let mut len_field = [0u8; LEN_FIELD];
        LittleEndian::write_u64(&mut len_field, (MESSAGE_MAX + 1) as u64);
        raw.write_all(&len_field).unwrap();

        assert!(rx.recv_frame().is_err());
    }
}
