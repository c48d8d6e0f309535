//! Sealed payloads bound to their topic.
//!
//! Wire layout: `nonce (12) || ciphertext || tag (16)`, ChaCha20-Poly1305 with
//! the topic as associated data. The key is the SHA-256 digest of the
//! pre-shared secret held in the device configuration.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_TOPIC_LEN: usize = 128;
pub const MAX_MESSAGE_LEN: usize = 512;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Largest cleartext whose sealed form still fits under [`MAX_MESSAGE_LEN`].
pub const MAX_CLEARTEXT_LEN: usize = MAX_MESSAGE_LEN - 1 - NONCE_LEN - TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: topic {topic_len} bytes, payload {payload_len} bytes")]
    MalformedEnvelope { topic_len: usize, payload_len: usize },
    #[error("envelope authentication failed")]
    AuthenticationFailure,
    #[error("failed to seal payload")]
    Seal,
}

/// Length gate applied before any cryptographic work.
pub fn check_bounds(topic: &str, payload: &[u8]) -> Result<(), EnvelopeError> {
    let topic_ok = !topic.is_empty() && topic.len() < MAX_TOPIC_LEN;
    let payload_ok = !payload.is_empty() && payload.len() < MAX_MESSAGE_LEN;
    if topic_ok && payload_ok {
        Ok(())
    } else {
        Err(EnvelopeError::MalformedEnvelope {
            topic_len: topic.len(),
            payload_len: payload.len(),
        })
    }
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    cipher: ChaCha20Poly1305,
}

impl EnvelopeCodec {
    pub fn from_shared_secret(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&digest)),
        }
    }

    pub fn seal(&self, topic: &str, cleartext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: cleartext,
                    aad: topic.as_bytes(),
                },
            )
            .map_err(|_| EnvelopeError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// `None` for every failure: wrong key, wrong topic, tampering, truncation.
    pub fn open(&self, topic: &str, sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: topic.as_bytes(),
                },
            )
            .ok()
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "/config/v2/0004711/1700000000/open_until";

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::from_shared_secret(b"00112233445566778899aabbccddeeff")
    }

    #[test]
    fn opens_what_it_seals() {
        let codec = codec();
        for body in [
            &b""[..],
            &b"1"[..],
            &b"ssid=home&rssi=-61"[..],
            &[0xAB; MAX_CLEARTEXT_LEN][..],
        ] {
            let sealed = codec.seal(TOPIC, body).unwrap();
            assert!(sealed.len() < MAX_MESSAGE_LEN);
            assert_eq!(codec.open(TOPIC, &sealed).as_deref(), Some(body));
        }
    }

    #[test]
    fn topic_is_authenticated() {
        let codec = codec();
        let sealed = codec.seal(TOPIC, b"250").unwrap();
        assert_eq!(codec.open("/config/v2/0004711/1700000000/open", &sealed), None);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = codec().seal(TOPIC, b"close").unwrap();
        let other = EnvelopeCodec::from_shared_secret(b"another secret");
        assert_eq!(other.open(TOPIC, &sealed), None);
    }

    #[test]
    fn tampering_and_truncation_fail() {
        let codec = codec();
        let mut sealed = codec.seal(TOPIC, b"open").unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(codec.open(TOPIC, &sealed), None);
        sealed[last] ^= 0x01;

        sealed[NONCE_LEN] ^= 0x80;
        assert_eq!(codec.open(TOPIC, &sealed), None);
        sealed[NONCE_LEN] ^= 0x80;

        assert_eq!(codec.open(TOPIC, &sealed[..sealed.len() - 1]), None);
        assert_eq!(codec.open(TOPIC, &sealed[..NONCE_LEN + TAG_LEN - 1]), None);
        assert_eq!(codec.open(TOPIC, &[]), None);
    }

    #[test]
    fn each_seal_uses_a_fresh_nonce() {
        let codec = codec();
        let a = codec.seal(TOPIC, b"same").unwrap();
        let b = codec.seal(TOPIC, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn bounds_reject_empty_and_oversized() {
        assert!(check_bounds(TOPIC, &[1]).is_ok());
        assert!(check_bounds("", &[1]).is_err());
        assert!(check_bounds(TOPIC, &[]).is_err());
        assert!(check_bounds(&"t".repeat(MAX_TOPIC_LEN), &[1]).is_err());
        assert!(check_bounds(&"t".repeat(MAX_TOPIC_LEN - 1), &[1]).is_ok());
        assert!(check_bounds(TOPIC, &[0; MAX_MESSAGE_LEN]).is_err());
        assert!(check_bounds(TOPIC, &[0; MAX_MESSAGE_LEN - 1]).is_ok());
    }
}
