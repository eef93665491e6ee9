//! NaCl-box session encryption layered on top of the envelope (C2, spec
//! §4.2). Every session gets a fresh X25519 keypair; once the
//! counterparty's public key is known, `!auth`/`!ioauth`/`!tx`/`!sig`
//! payloads are boxed and base64-encoded into the single `args` slot.

use base64::{engine::general_purpose::STANDARD, Engine};
use crypto_box::{
    aead::{Aead, OsRng},
    PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey,
};
use rand::RngCore;

use crate::error::CryptoError;

/// A session's ephemeral NaCl keypair (spec §3 Session: "NaCl keypair for
/// this session").
pub struct SessionKeypair {
    secret: BoxSecretKey,
}

impl SessionKeypair {
    pub fn generate() -> Self {
        SessionKeypair {
            secret: BoxSecretKey::generate(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> BoxPublicKey {
        self.secret.public_key()
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key().as_bytes())
    }
}

pub fn parse_peer_public_key(b64: &str) -> Result<BoxPublicKey, CryptoError> {
    let bytes = STANDARD.decode(b64).map_err(|_| CryptoError::Malformed)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::Malformed)?;
    Ok(BoxPublicKey::from(arr))
}

/// Encrypt a single command's rendered payload for the session peer,
/// returning the base64 blob that becomes the sole `args` entry.
pub fn encrypt(
    my_keys: &SessionKeypair,
    peer_public: &BoxPublicKey,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let cbox = SalsaBox::new(peer_public, &my_keys.secret);
    let mut nonce_bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = nonce_bytes.into();
    let ciphertext = cbox
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::DecryptFailed)?;

    let mut blob = Vec::with_capacity(24 + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
}

pub fn decrypt(
    my_keys: &SessionKeypair,
    peer_public: &BoxPublicKey,
    blob_b64: &str,
) -> Result<String, CryptoError> {
    let blob = STANDARD.decode(blob_b64).map_err(|_| CryptoError::DecryptFailed)?;
    if blob.len() < 24 {
        return Err(CryptoError::DecryptFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(24);
    let nonce = crypto_box::Nonce::clone_from_slice(nonce_bytes);

    let cbox = SalsaBox::new(peer_public, &my_keys.secret);
    let plaintext = cbox
        .decrypt(&nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let alice = SessionKeypair::generate();
        let bob = SessionKeypair::generate();

        let blob = encrypt(&alice, &bob.public_key(), "hello maker").unwrap();
        let plaintext = decrypt(&bob, &alice.public_key(), &blob).unwrap();
        assert_eq!(plaintext, "hello maker");
    }

    #[test]
    fn decrypt_fails_for_wrong_key() {
        let alice = SessionKeypair::generate();
        let bob = SessionKeypair::generate();
        let mallory = SessionKeypair::generate();

        let blob = encrypt(&alice, &bob.public_key(), "secret").unwrap();
        assert!(decrypt(&bob, &mallory.public_key(), &blob).is_err());
    }

    #[test]
    fn out_of_phase_decrypt_is_rejected_cleanly() {
        let alice = SessionKeypair::generate();
        let bob = SessionKeypair::generate();
        // Garbage blob simulating an encrypted message received before a
        // session has exchanged keys: must error, not panic.
        assert!(decrypt(&bob, &alice.public_key(), "not-a-real-blob").is_err());
    }
}
