// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Inbound transaction authentication. The sender's public key is resolved
//! through the key cache; the identity asserted by the auth header is
//! authoritative, and an envelope that disagrees with it is rejected.

use crate::GatewayError;
use chrono::Utc;
use onix_core::auth::AuthError;
use onix_core::context::TxnContext;
use onix_core::signature;
use onix_keys::{KeyError, KeyManager};

#[derive(Clone)]
pub struct TxnSignValidator {
    keys: KeyManager,
}

impl TxnSignValidator {
    pub fn new(keys: KeyManager) -> Self {
        Self { keys }
    }

    /// Verify the sender's signature over `body`. Returns the authenticated
    /// subscriber id.
    pub async fn validate(
        &self,
        body: &[u8],
        authorization: Option<&str>,
        context: &TxnContext,
    ) -> Result<String, GatewayError> {
        let header = authorization.ok_or_else(AuthError::missing_header)?;
        let parts = signature::parse_authorization(header)
            .map_err(|err| AuthError::from_signature(err, None))?;
        let subscriber_id = parts.subscriber_id.clone();

        if let Some(bap_id) = context.bap_id.as_deref() {
            if bap_id != subscriber_id {
                return Err(AuthError::subscriber_mismatch(&subscriber_id, bap_id).into());
            }
        }

        let (signing_public, _encr_public) = self
            .keys
            .lookup_np_keys(&subscriber_id, &parts.unique_key_id)
            .await
            .map_err(|err| match err {
                KeyError::NotFound { .. } => {
                    GatewayError::from(AuthError::subscriber_not_found(&subscriber_id))
                }
                KeyError::Unavailable { msg } => GatewayError::Internal { msg },
            })?;
        let signing_public =
            String::from_utf8(signing_public).map_err(|_| GatewayError::Internal {
                msg: format!("registered signing key for {} is not text", subscriber_id),
            })?;

        signature::verify(&signing_public, &parts, body, Utc::now().timestamp())
            .map_err(|err| AuthError::from_signature(err, Some(subscriber_id.clone())))?;
        Ok(subscriber_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_std::sync::Arc;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use onix_core::auth::AuthErrorKind;
    use onix_core::model::{
        LookupRequest, SubscriberRole, Subscription, SubscriptionStatus,
    };
    use onix_keys::{LookupError, MemoryCache, MemorySecretStore, RegistryLookup};
    use rand_chacha::{rand_core::SeedableRng, ChaChaRng};
    use std::time::Duration;

    struct StaticLookup {
        rows: Vec<Subscription>,
    }

    #[async_trait]
    impl RegistryLookup for StaticLookup {
        async fn lookup(&self, filter: &LookupRequest) -> Result<Vec<Subscription>, LookupError> {
            Ok(self
                .rows
                .iter()
                .filter(|sub| filter.matches(sub))
                .cloned()
                .collect())
        }
    }

    fn validator_with(rows: Vec<Subscription>) -> TxnSignValidator {
        let keys = KeyManager::new(
            Arc::new(MemoryCache::new()),
            Arc::new(MemorySecretStore::new()),
            Arc::new(StaticLookup { rows }),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        TxnSignValidator::new(keys)
    }

    fn subscriber(sid: &str, signing_public_key: &str) -> Subscription {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Subscription {
            subscriber_id: sid.into(),
            url: format!("https://{}", sid),
            role: SubscriberRole::Bap,
            domain: "retail".into(),
            signing_public_key: signing_public_key.into(),
            encr_public_key: "RU5DUg==".into(),
            key_id: "k1".into(),
            valid_from: t0,
            valid_until: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            status: SubscriptionStatus::Subscribed,
            location: None,
            nonce: None,
            extended_attributes: None,
            created_at: t0,
            updated_at: t0,
        }
    }

    fn signed(seed: &[u8], sid: &str, body: &[u8]) -> String {
        let now = Utc::now().timestamp();
        signature::authorization_header(sid, "k1", seed, body, now, now + 60).unwrap()
    }

    #[async_std::test]
    async fn accepts_a_valid_sender() {
        let mut rng = ChaChaRng::from_seed([11u8; 32]);
        let (seed, public) = signature::generate_signing_keypair(&mut rng);
        let validator = validator_with(vec![subscriber("bap.x", &public)]);

        let body = br#"{"context":{"action":"search","bap_id":"bap.x"}}"#;
        let context = TxnContext {
            action: Some("search".into()),
            bap_id: Some("bap.x".into()),
            ..TxnContext::default()
        };
        let sender = validator
            .validate(body, Some(&signed(&seed, "bap.x", body)), &context)
            .await
            .unwrap();
        assert_eq!(sender, "bap.x");
    }

    #[async_std::test]
    async fn header_and_envelope_must_agree() {
        let mut rng = ChaChaRng::from_seed([11u8; 32]);
        let (seed, public) = signature::generate_signing_keypair(&mut rng);
        let validator = validator_with(vec![subscriber("bap.x", &public)]);

        let body = br#"{"context":{"bap_id":"bap.other"}}"#;
        let context = TxnContext {
            bap_id: Some("bap.other".into()),
            ..TxnContext::default()
        };
        match validator
            .validate(body, Some(&signed(&seed, "bap.x", body)), &context)
            .await
        {
            Err(GatewayError::Auth { source }) => {
                assert_eq!(source.kind, AuthErrorKind::SubscriberMismatch)
            }
            other => panic!("expected mismatch, got {:?}", other.is_ok()),
        }
    }

    #[async_std::test]
    async fn unknown_sender_is_rejected() {
        let mut rng = ChaChaRng::from_seed([11u8; 32]);
        let (seed, _) = signature::generate_signing_keypair(&mut rng);
        let validator = validator_with(vec![]);

        let body = b"{}";
        match validator
            .validate(body, Some(&signed(&seed, "bap.x", body)), &TxnContext::default())
            .await
        {
            Err(GatewayError::Auth { source }) => {
                assert_eq!(source.kind, AuthErrorKind::SubscriberNotFound)
            }
            other => panic!("expected not-found, got {:?}", other.is_ok()),
        }
    }

    #[async_std::test]
    async fn missing_header_is_rejected() {
        let validator = validator_with(vec![]);
        match validator.validate(b"{}", None, &TxnContext::default()).await {
            Err(GatewayError::Auth { source }) => {
                assert_eq!(source.kind, AuthErrorKind::MissingHeader)
            }
            other => panic!("expected missing header, got {:?}", other.is_ok()),
        }
    }
}
