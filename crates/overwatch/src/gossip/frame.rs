//! Encrypted gossip framing: `nonce (12 bytes) || ChaCha20-Poly1305(body)`.
//!
//! Every frame carries a fresh random nonce. The Poly1305 tag authenticates
//! the sender as a holder of the cluster key; a frame sealed under another
//! key, or altered in transit, fails to open.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use gslb_common::GslbError;

/// Length of the leading nonce
pub const NONCE_LEN: usize = 12;

/// Length of the trailing Poly1305 tag
pub const TAG_LEN: usize = 16;

/// Bytes a frame adds on top of its body
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn cipher(key: &[u8; 32]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

/// Encrypt `body` under a fresh nonce
pub fn seal(key: &[u8; 32], body: &[u8]) -> Result<Vec<u8>, GslbError> {
    let nonce: [u8; NONCE_LEN] = rand::random();
    let ciphertext = cipher(key)
        .encrypt(Nonce::from_slice(&nonce), body)
        .map_err(|_| GslbError::Gossip("frame encryption failed".to_string()))?;

    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Authenticate and decrypt a frame, returning the body
pub fn open(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>, GslbError> {
    if frame.len() < OVERHEAD {
        return Err(GslbError::Gossip(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let (nonce, ciphertext) = frame.split_at(NONCE_LEN);

    cipher(key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| GslbError::Gossip("frame authentication failed".to_string()))
}
