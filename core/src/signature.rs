// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The Beckn `Authorization` header: grammar, canonical signing string, and
//! Ed25519 sign/verify over it.
//!
//! Header shape:
//!
//! ```text
//! Signature keyId="{subscriber_id}|{key_id}|ed25519",algorithm="ed25519",
//!   created="{unix}",expires="{unix}",headers="(created) (expires) digest",
//!   signature="{base64}"
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use snafu::Snafu;
use std::collections::HashMap;

pub const SIGNATURE_ALGORITHM: &str = "ed25519";
pub const SIGNED_HEADERS: &str = "(created) (expires) digest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureParts {
    pub subscriber_id: String,
    pub unique_key_id: String,
    pub algorithm: String,
    pub created: i64,
    pub expires: i64,
    pub headers: String,
    pub signature: String,
}

#[derive(Debug, Snafu)]
pub enum SignatureError {
    #[snafu(display("authorization header does not start with \"Signature\""))]
    MissingPrefix,

    #[snafu(display("missing authorization field: {}", field))]
    MissingField { field: String },

    #[snafu(display("malformed authorization field: {}", field))]
    MalformedField { field: String },

    #[snafu(display(
        "keyId must be \"subscriber|key|algorithm\", got {:?}",
        key_id
    ))]
    MalformedKeyId { key_id: String },

    #[snafu(display("unsupported signature algorithm: {}", algorithm))]
    UnsupportedAlgorithm { algorithm: String },

    #[snafu(display("signature created timestamp {} is in the future", created))]
    NotYetValid { created: i64 },

    #[snafu(display("signature expired at {}", expires))]
    Expired { expires: i64 },

    #[snafu(display("invalid signing key: {}", msg))]
    BadSigningKey { msg: String },

    #[snafu(display("invalid public key: {}", msg))]
    BadPublicKey { msg: String },

    #[snafu(display("invalid signature encoding: {}", msg))]
    BadEncoding { msg: String },

    #[snafu(display("signature verification failed"))]
    Verification,
}

/// SHA-256 digest of the body, standard base64.
pub fn body_digest(body: &[u8]) -> String {
    base64::encode(Sha256::digest(body))
}

/// Canonical string the signature covers.
pub fn signing_string(created: i64, expires: i64, body: &[u8]) -> String {
    format!(
        "(created): {}\n(expires): {}\ndigest: SHA-256={}",
        created,
        expires,
        body_digest(body)
    )
}

fn key32(bytes: &[u8]) -> Result<[u8; 32], String> {
    bytes
        .try_into()
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
}

/// Sign the canonical string with a 32-byte Ed25519 seed; returns the
/// base64 signature.
pub fn sign(
    signing_key: &[u8],
    body: &[u8],
    created: i64,
    expires: i64,
) -> Result<String, SignatureError> {
    let seed = key32(signing_key).map_err(|msg| SignatureError::BadSigningKey { msg })?;
    let key = SigningKey::from_bytes(&seed);
    let sig = key.sign(signing_string(created, expires, body).as_bytes());
    Ok(base64::encode(sig.to_bytes()))
}

/// Assemble a complete `Authorization` header value for an outbound call.
pub fn authorization_header(
    subscriber_id: &str,
    unique_key_id: &str,
    signing_key: &[u8],
    body: &[u8],
    created: i64,
    expires: i64,
) -> Result<String, SignatureError> {
    let signature = sign(signing_key, body, created, expires)?;
    Ok(format!(
        "Signature keyId=\"{}|{}|{}\",algorithm=\"{}\",created=\"{}\",expires=\"{}\",headers=\"{}\",signature=\"{}\"",
        subscriber_id,
        unique_key_id,
        SIGNATURE_ALGORITHM,
        SIGNATURE_ALGORITHM,
        created,
        expires,
        SIGNED_HEADERS,
        signature
    ))
}

/// Parse an `Authorization: Signature ...` header into its fields.
pub fn parse_authorization(header: &str) -> Result<SignatureParts, SignatureError> {
    let rest = header
        .trim()
        .strip_prefix("Signature")
        .ok_or(SignatureError::MissingPrefix)?
        .trim_start();

    let mut fields: HashMap<&str, String> = HashMap::new();
    for piece in rest.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (name, value) = piece
            .split_once('=')
            .ok_or_else(|| SignatureError::MalformedField {
                field: piece.to_string(),
            })?;
        let value = value.trim().trim_matches('"');
        fields.insert(name.trim(), value.to_string());
    }

    let take = |name: &str| -> Result<String, SignatureError> {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| SignatureError::MissingField { field: name.into() })
    };
    let numeric = |name: &str, value: &str| -> Result<i64, SignatureError> {
        value
            .parse()
            .map_err(|_| SignatureError::MalformedField { field: name.into() })
    };

    let key_id = take("keyId")?;
    let mut parts = key_id.split('|');
    let (subscriber_id, unique_key_id, key_algorithm) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(sid), Some(kid), Some(alg), None) if !sid.is_empty() && !kid.is_empty() => {
                (sid.to_string(), kid.to_string(), alg.to_string())
            }
            _ => return Err(SignatureError::MalformedKeyId { key_id }),
        };

    let algorithm = take("algorithm")?;
    if !algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM)
        || !key_algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM)
    {
        return Err(SignatureError::UnsupportedAlgorithm { algorithm });
    }

    let created = numeric("created", &take("created")?)?;
    let expires = numeric("expires", &take("expires")?)?;

    Ok(SignatureParts {
        subscriber_id,
        unique_key_id,
        algorithm,
        created,
        expires,
        headers: take("headers")?,
        signature: take("signature")?,
    })
}

/// Verify parsed header fields against the body and a base64 Ed25519 public
/// key. `now` is unix seconds; the `created..=expires` window is enforced
/// with a small allowance for clock skew on `created`.
pub fn verify(
    public_key_b64: &str,
    parts: &SignatureParts,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    const CLOCK_SKEW_SECONDS: i64 = 30;

    if parts.created > now + CLOCK_SKEW_SECONDS {
        return Err(SignatureError::NotYetValid {
            created: parts.created,
        });
    }
    if parts.expires < now {
        return Err(SignatureError::Expired {
            expires: parts.expires,
        });
    }

    let key_bytes = base64::decode(public_key_b64).map_err(|err| SignatureError::BadPublicKey {
        msg: err.to_string(),
    })?;
    let key_bytes = key32(&key_bytes).map_err(|msg| SignatureError::BadPublicKey { msg })?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|err| SignatureError::BadPublicKey {
        msg: err.to_string(),
    })?;

    let sig_bytes = base64::decode(&parts.signature).map_err(|err| SignatureError::BadEncoding {
        msg: err.to_string(),
    })?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|err| SignatureError::BadEncoding {
        msg: err.to_string(),
    })?;

    key.verify(
        signing_string(parts.created, parts.expires, body).as_bytes(),
        &sig,
    )
    .map_err(|_| SignatureError::Verification)
}

/// Generate an Ed25519 keypair as `(seed, base64 public key)`.
pub fn generate_signing_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> (Vec<u8>, String) {
    let key = SigningKey::generate(rng);
    (
        key.to_bytes().to_vec(),
        base64::encode(key.verifying_key().to_bytes()),
    )
}
