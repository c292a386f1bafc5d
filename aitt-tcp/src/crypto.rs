use std::io;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};

/// Session key length advertised through discovery.
pub const KEY_LEN: usize = 16;

/// Session IV length advertised through discovery.
pub const IV_LEN: usize = 16;

/// AEAD expansion of every sealed section.
pub const TAG_LEN: usize = 16;

/// GCM nonce length; also the length of the per-connection salt exchanged in
/// the clear when a secure connection opens.
pub const SALT_LEN: usize = 12;

/// Per-connection AES-128-GCM context.
///
/// Listeners hand the same key and IV to every publisher, so nonces mix in a
/// salt chosen per connection plus a per-direction message counter. Contexts
/// are never shared between connections, even when the key material is.
pub struct FrameCipher {
    cipher: Aes128Gcm,
    iv: [u8; IV_LEN],
    salt: [u8; SALT_LEN],
    seal_count: u64,
    open_count: u64,
}

impl FrameCipher {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], salt: [u8; SALT_LEN]) -> FrameCipher {
        FrameCipher {
            cipher: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)),
            iv: *iv,
            salt,
            seal_count: 0,
            open_count: 0,
        }
    }

    /// Ciphertext length of a sealed section.
    pub const fn sealed_len(plain_len: usize) -> usize {
        plain_len + TAG_LEN
    }

    pub fn seal(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.nonce(self.seal_count);
        self.seal_count += 1;

        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "frame encryption failed"))
    }

    pub fn open(&mut self, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.nonce(self.open_count);
        self.open_count += 1;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "frame authentication failed")
            })
    }

    fn nonce(&self, count: u64) -> [u8; SALT_LEN] {
        let mut nonce = [0u8; SALT_LEN];
        nonce.copy_from_slice(&self.iv[..SALT_LEN]);

        for (byte, salt) in nonce.iter_mut().zip(self.salt.iter()) {
            *byte ^= salt;
        }
        for (byte, count) in nonce[4..].iter_mut().zip(count.to_be_bytes().iter()) {
            *byte ^= count;
        }

        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (FrameCipher, FrameCipher) {
        let key = [7u8; KEY_LEN];
        let iv = [3u8; IV_LEN];
        let salt = [9u8; SALT_LEN];

        (FrameCipher::new(&key, &iv, salt), FrameCipher::new(&key, &iv, salt))
    }

    #[test]
    fn test_seal_open() {
        let (mut tx, mut rx) = pair();

        for payload in &[&b"hello"[..], &[0u8; 1600][..], &b"x"[..]] {
            let sealed = tx.seal(payload).unwrap();
            assert_eq!(sealed.len(), FrameCipher::sealed_len(payload.len()));
            assert_eq!(rx.open(&sealed).unwrap(), *payload);
        }
    }

    #[test]
    fn test_tamper_detected() {
        let (mut tx, mut rx) = pair();

        let mut sealed = tx.seal(b"payload").unwrap();
        sealed[0] ^= 0xff;

        assert!(rx.open(&sealed).is_err());
    }

    #[test]
    fn test_counter_mismatch_detected() {
        let (mut tx, mut rx) = pair();

        let first = tx.seal(b"first").unwrap();
        let second = tx.seal(b"second").unwrap();

        // Skipping a frame desynchronizes the counters and must not decrypt.
        assert!(rx.open(&second).is_err());
        let _ = first;
    }

    #[test]
    fn test_salt_separates_connections() {
        let key = [7u8; KEY_LEN];
        let iv = [3u8; IV_LEN];
        let mut a = FrameCipher::new(&key, &iv, [1u8; SALT_LEN]);
        let mut b = FrameCipher::new(&key, &iv, [2u8; SALT_LEN]);

        assert_ne!(a.seal(b"same").unwrap(), b.seal(b"same").unwrap());
    }
}
