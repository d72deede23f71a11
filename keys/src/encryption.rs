// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The peer-exchange envelope behind the onboarding challenge: X25519 ECDH,
//! HKDF-SHA256 key derivation, AES-256-GCM with the fresh nonce prefixed to
//! the ciphertext, standard base64 on the wire. Because the shared secret is
//! symmetric in the two keypairs, `decrypt` with the roles swapped inverts
//! `encrypt`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use snafu::Snafu;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

pub const ENCRYPTION_INFO: &[u8] = b"beckn-onix-encryption";
pub const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Debug, Snafu)]
pub enum CryptoError {
    #[snafu(display("key must be {} bytes, got {}", KEY_SIZE, len))]
    BadKeyLength { len: usize },

    #[snafu(display("invalid base64 ciphertext: {}", msg))]
    BadEncoding { msg: String },

    #[snafu(display("ciphertext too short: {} bytes, need at least {}", len, NONCE_SIZE))]
    TooShort { len: usize },

    #[snafu(display("authenticated decryption failed"))]
    Aead,

    #[snafu(display("encryption failed"))]
    Seal,

    #[snafu(display("decrypted payload is not valid UTF-8"))]
    NotUtf8,
}

fn scalar(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadKeyLength { len: bytes.len() })
}

/// ECDH + HKDF-SHA256 down to one AES-256 key. Symmetric in
/// `(local, peer)` / `(peer, local)`.
fn derive_key(local_private: &[u8], peer_public: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let secret = StaticSecret::from(scalar(local_private)?);
    let peer = PublicKey::from(scalar(peer_public)?);
    let shared = secret.diffie_hellman(&peer);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hk.expand(ENCRYPTION_INFO, &mut key)
        .map_err(|_| CryptoError::Seal)?;
    Ok(key)
}

pub struct EncryptionService;

impl EncryptionService {
    /// Encrypt `plaintext` for the holder of `peer_public`; returns
    /// base64(nonce || ciphertext).
    pub fn encrypt(
        plaintext: &str,
        local_private: &[u8],
        peer_public: &[u8],
    ) -> Result<String, CryptoError> {
        let key = derive_key(local_private, peer_public)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Seal)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(base64::encode(out))
    }

    /// Invert [`Self::encrypt`] using the local private key and the sender's
    /// public key.
    pub fn decrypt(
        ciphertext_b64: &str,
        local_private: &[u8],
        peer_public: &[u8],
    ) -> Result<String, CryptoError> {
        let bytes = base64::decode(ciphertext_b64).map_err(|err| CryptoError::BadEncoding {
            msg: err.to_string(),
        })?;
        if bytes.len() < NONCE_SIZE {
            return Err(CryptoError::TooShort { len: bytes.len() });
        }
        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);

        let key = derive_key(local_private, peer_public)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Seal)?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Aead)?;

        String::from_utf8(plain).map_err(|_| CryptoError::NotUtf8)
    }
}

/// Issues the plaintext a subscriber must echo back to prove possession of
/// its decryption key. Freshly generated per attempt; replay prevention is
/// not a goal.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChallengeService;

impl ChallengeService {
    pub fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Generate an X25519 keypair as `(private scalar, base64 public key)`.
pub fn generate_encryption_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> (Vec<u8>, String) {
    let secret = StaticSecret::random_from_rng(rng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes().to_vec(), base64::encode(public.as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand_chacha::{rand_core::SeedableRng, ChaChaRng};

    fn keypairs() -> ((Vec<u8>, Vec<u8>), (Vec<u8>, Vec<u8>)) {
        let mut rng = ChaChaRng::from_seed([3u8; 32]);
        let (a_priv, a_pub) = generate_encryption_keypair(&mut rng);
        let (b_priv, b_pub) = generate_encryption_keypair(&mut rng);
        (
            (a_priv, base64::decode(a_pub).unwrap()),
            (b_priv, base64::decode(b_pub).unwrap()),
        )
    }

    #[test]
    fn round_trip_with_swapped_roles() {
        let ((a_priv, a_pub), (b_priv, b_pub)) = keypairs();
        let plaintext = "d6c8ff3e-05ae-4ff0-b54f-d067c0cbd8e4";

        let sealed = EncryptionService::encrypt(plaintext, &a_priv, &b_pub).unwrap();
        let opened = EncryptionService::decrypt(&sealed, &b_priv, &a_pub).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn nonces_make_ciphertexts_distinct() {
        let ((a_priv, _), (_, b_pub)) = keypairs();
        let one = EncryptionService::encrypt("same", &a_priv, &b_pub).unwrap();
        let two = EncryptionService::encrypt("same", &a_priv, &b_pub).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn truncated_ciphertext_is_too_short() {
        let ((a_priv, a_pub), _) = keypairs();
        let short = base64::encode([0u8; NONCE_SIZE - 1]);
        assert!(matches!(
            EncryptionService::decrypt(&short, &a_priv, &a_pub),
            Err(CryptoError::TooShort { len }) if len == NONCE_SIZE - 1
        ));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ((a_priv, a_pub), (_, b_pub)) = keypairs();
        let mut rng = ChaChaRng::from_seed([9u8; 32]);
        let (mallory_priv, _) = generate_encryption_keypair(&mut rng);

        let sealed = EncryptionService::encrypt("secret", &a_priv, &b_pub).unwrap();
        assert!(matches!(
            EncryptionService::decrypt(&sealed, &mallory_priv, &a_pub),
            Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn challenges_are_fresh() {
        let challenge = ChallengeService;
        assert_ne!(challenge.generate(), challenge.generate());
    }
}
