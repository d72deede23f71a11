// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cache-through resolution of key material by `(subscriber_id, key_id)`.
//!
//! Private material comes from the secret store and is cached for seconds;
//! peer public material comes from a registry lookup and is cached for
//! hours. Negative results and backend errors are never cached, so a caller
//! that sees `NotFound` may re-attempt at any time.

use crate::cache::Cache;
use crate::secrets::{SecretError, SecretStore};
use async_std::sync::Arc;
use async_trait::async_trait;
use onix_core::model::{LookupRequest, Subscription};
use snafu::Snafu;
use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum KeyError {
    #[snafu(display("no key material for {}:{}", subscriber_id, key_id))]
    NotFound {
        subscriber_id: String,
        key_id: String,
    },

    #[snafu(display("key backend unavailable: {}", msg))]
    Unavailable { msg: String },
}

#[derive(Debug, Snafu)]
pub enum LookupError {
    #[snafu(display("registry lookup failed: {}", msg))]
    Failed { msg: String },
}

/// The slice of the registry the KeyManager (and the gateway) consume. The
/// registry service implements this against its own repository; the gateway
/// implements it over HTTP.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    async fn lookup(&self, filter: &LookupRequest) -> Result<Vec<Subscription>, LookupError>;
}

fn private_cache_key(class: &str, subscriber_id: &str, key_id: &str) -> String {
    format!("{}:priv:{}:{}", class, subscriber_id, key_id)
}

fn public_cache_key(subscriber_id: &str, key_id: &str) -> String {
    format!("pub:{}:{}", subscriber_id, key_id)
}

fn secret_name(subscriber_id: &str, key_id: &str, tag: &str) -> String {
    format!("{}:{}:{}", subscriber_id, key_id, tag)
}

pub(crate) fn signing_secret_name(subscriber_id: &str, key_id: &str) -> String {
    secret_name(subscriber_id, key_id, "signing")
}

pub(crate) fn encryption_secret_name(subscriber_id: &str, key_id: &str) -> String {
    secret_name(subscriber_id, key_id, "enc")
}

#[derive(Clone)]
pub struct KeyManager {
    cache: Arc<dyn Cache>,
    secrets: Arc<dyn SecretStore>,
    registry: Arc<dyn RegistryLookup>,
    private_ttl: Duration,
    public_ttl: Duration,
}

impl KeyManager {
    pub fn new(
        cache: Arc<dyn Cache>,
        secrets: Arc<dyn SecretStore>,
        registry: Arc<dyn RegistryLookup>,
        private_ttl: Duration,
        public_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            secrets,
            registry,
            private_ttl,
            public_ttl,
        }
    }

    /// The local subscriber's signing private key (a 32-byte Ed25519 seed).
    pub async fn signing_private_key(
        &self,
        subscriber_id: &str,
        key_id: &str,
    ) -> Result<Vec<u8>, KeyError> {
        self.private_key("sig", signing_secret_name(subscriber_id, key_id), subscriber_id, key_id)
            .await
    }

    /// The local subscriber's encryption private key (a 32-byte X25519
    /// scalar).
    pub async fn encryption_private_key(
        &self,
        subscriber_id: &str,
        key_id: &str,
    ) -> Result<Vec<u8>, KeyError> {
        self.private_key(
            "enc",
            encryption_secret_name(subscriber_id, key_id),
            subscriber_id,
            key_id,
        )
        .await
    }

    async fn private_key(
        &self,
        class: &str,
        secret: String,
        subscriber_id: &str,
        key_id: &str,
    ) -> Result<Vec<u8>, KeyError> {
        let cache_key = private_cache_key(class, subscriber_id, key_id);
        if let Some(bytes) = self.cache.get(&cache_key).await {
            return Ok(bytes);
        }
        match self.secrets.fetch(&secret).await {
            Ok(bytes) => {
                self.cache
                    .set(&cache_key, bytes.clone(), self.private_ttl)
                    .await;
                Ok(bytes)
            }
            Err(SecretError::NotFound { .. }) => Err(KeyError::NotFound {
                subscriber_id: subscriber_id.into(),
                key_id: key_id.into(),
            }),
            Err(SecretError::Unavailable { msg }) => Err(KeyError::Unavailable { msg }),
        }
    }

    /// A network participant's public keys, as registered: the pair of
    /// `(signing, encryption)` key strings, opaque to the manager.
    pub async fn lookup_np_keys(
        &self,
        subscriber_id: &str,
        key_id: &str,
    ) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        let cache_key = public_cache_key(subscriber_id, key_id);
        if let Some(bytes) = self.cache.get(&cache_key).await {
            if let Ok(pair) = bincode::deserialize::<(Vec<u8>, Vec<u8>)>(&bytes) {
                return Ok(pair);
            }
            // Unreadable entry; fall through to a fresh lookup.
            self.cache.delete(&cache_key).await;
        }

        let filter = LookupRequest {
            subscriber_id: Some(subscriber_id.into()),
            key_id: Some(key_id.into()),
            ..LookupRequest::default()
        };
        let matches = self
            .registry
            .lookup(&filter)
            .await
            .map_err(|err| KeyError::Unavailable {
                msg: err.to_string(),
            })?;
        let sub = matches.first().ok_or_else(|| KeyError::NotFound {
            subscriber_id: subscriber_id.into(),
            key_id: key_id.into(),
        })?;

        let pair = (
            sub.signing_public_key.clone().into_bytes(),
            sub.encr_public_key.clone().into_bytes(),
        );
        let encoded = bincode::serialize(&pair).map_err(|err| KeyError::Unavailable {
            msg: err.to_string(),
        })?;
        self.cache.set(&cache_key, encoded, self.public_ttl).await;
        Ok(pair)
    }
}
