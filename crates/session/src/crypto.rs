use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SessionError};

const KEY_CONTEXT: &str = "peerlog-session-v1";
const NONCE_LEN: usize = 12;

/// Symmetric key shared by both ends of one connection.
///
/// The key is erased from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    encryption_key: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    pub fn new(encryption_key: [u8; 32]) -> Self {
        Self { encryption_key }
    }

    /// ChaCha20-Poly1305 with a random nonce prepended to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(SessionError::Decryption("ciphertext too short".to_string()));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.encryption_key)
            .map_err(|e| SessionError::Decryption(e.to_string()))?;

        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|e| SessionError::Decryption(e.to_string()))
    }
}

/// One side of an X25519 exchange. Consumed when the key is derived.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Both ends derive the same key regardless of who initiated.
    pub fn derive(self, remote_public: [u8; 32]) -> Result<SessionKeys> {
        let remote = PublicKey::from(remote_public);
        let shared = self.secret.diffie_hellman(&remote);
        if !shared.was_contributory() {
            return Err(SessionError::Protocol(
                "non-contributory key exchange".to_string(),
            ));
        }

        let local = self.public_key();
        let (first, second) = if local <= remote_public {
            (local, remote_public)
        } else {
            (remote_public, local)
        };

        let mut material = Vec::with_capacity(96);
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(&first);
        material.extend_from_slice(&second);

        let key = blake3::derive_key(KEY_CONTEXT, &material);
        material.zeroize();
        Ok(SessionKeys::new(key))
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}
