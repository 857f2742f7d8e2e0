use anyhow::Result;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::time::{Duration, Instant};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Shared symmetric key for frame payloads
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FrameKey([u8; KEY_LEN]);

impl FrameKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key given as 64 hex characters
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let mut bytes = hex::decode(hex_key.trim())?;
        anyhow::ensure!(
            bytes.len() == KEY_LEN,
            "Key must be {} bytes ({} hex characters), got {} bytes",
            KEY_LEN,
            KEY_LEN * 2,
            bytes.len()
        );
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self::from_bytes(key))
    }

    /// Derive a key from a passphrase using BLAKE3
    pub fn from_passphrase(passphrase: &str) -> Self {
        let hash = blake3::hash(passphrase.as_bytes());
        Self::from_bytes(*hash.as_bytes())
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }
}

impl std::fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameKey(..)")
    }
}

/// Encrypt a compressed frame with a fresh random nonce.
///
/// Returns `nonce ‖ ciphertext` and the time spent in the cipher.
pub fn encrypt_frame(key: &FrameKey, plaintext: &[u8]) -> Result<(Vec<u8>, Duration)> {
    let start = Instant::now();
    let cipher = key.cipher();

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| anyhow::anyhow!("Encryption failed"))?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend(ciphertext);

    Ok((output, start.elapsed()))
}

/// Decrypt `nonce ‖ ciphertext` produced by [`encrypt_frame`]
pub fn decrypt_frame(key: &FrameKey, envelope: &[u8]) -> Result<Vec<u8>> {
    anyhow::ensure!(envelope.len() > NONCE_LEN, "Envelope shorter than nonce");

    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
    let plaintext = key
        .cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("Decryption failed (wrong key or corrupted data)"))?;

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption() {
        let key = FrameKey::from_bytes([7u8; KEY_LEN]);
        let frame = b"\xff\xd8\xff\xe0 not really a jpeg";

        let (envelope, _) = encrypt_frame(&key, frame).unwrap();
        assert_eq!(decrypt_frame(&key, &envelope).unwrap(), frame);
    }

    #[test]
    fn test_fresh_nonce_per_frame() {
        let key = FrameKey::from_passphrase("bench");
        let (a, _) = encrypt_frame(&key, b"same").unwrap();
        let (b, _) = encrypt_frame(&key, b"same").unwrap();

        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_and_tampering() {
        let key = FrameKey::from_passphrase("right");
        let (mut envelope, _) = encrypt_frame(&key, b"payload").unwrap();

        assert!(decrypt_frame(&FrameKey::from_passphrase("wrong"), &envelope).is_err());

        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert!(decrypt_frame(&key, &envelope).is_err());
        assert!(decrypt_frame(&key, &envelope[..NONCE_LEN]).is_err());
    }

    #[test]
    fn test_key_parsing() {
        let hex_key = "43".repeat(KEY_LEN);
        assert!(FrameKey::from_hex(&hex_key).is_ok());
        assert!(FrameKey::from_hex("4303").is_err());
        assert!(FrameKey::from_hex("not hex").is_err());
    }
}
