// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! First-run provisioning of a service's own keypairs.

use crate::encryption::generate_encryption_keypair;
use crate::manager::{encryption_secret_name, signing_secret_name};
use crate::secrets::{SecretError, SecretStore};
use ed25519_dalek::SigningKey;
use onix_core::signature::generate_signing_keypair;
use x25519_dalek::{PublicKey, StaticSecret};

/// The service's own public identity, derived from the secret store.
#[derive(Clone, Debug)]
pub struct ServiceKeys {
    pub signing_public_key: String,
    pub encr_public_key: String,
}

/// Load the service's signing and encryption keypairs from the secret
/// store, generating and persisting them on first run. Returns the base64
/// public halves.
pub async fn ensure_service_keys(
    store: &dyn SecretStore,
    subscriber_id: &str,
    key_id: &str,
) -> Result<ServiceKeys, SecretError> {
    let signing_name = signing_secret_name(subscriber_id, key_id);
    let signing_public_key = match store.fetch(&signing_name).await {
        Ok(seed) => {
            let seed: [u8; 32] = seed
                .as_slice()
                .try_into()
                .map_err(|_| SecretError::Unavailable {
                    msg: format!("stored signing key {} is not 32 bytes", signing_name),
                })?;
            base64::encode(SigningKey::from_bytes(&seed).verifying_key().to_bytes())
        }
        Err(SecretError::NotFound { .. }) => {
            let (seed, public) = generate_signing_keypair(&mut rand::thread_rng());
            store.put(&signing_name, &seed).await?;
            tracing::info!("generated signing keypair for {}:{}", subscriber_id, key_id);
            public
        }
        Err(err) => return Err(err),
    };

    let encryption_name = encryption_secret_name(subscriber_id, key_id);
    let encr_public_key = match store.fetch(&encryption_name).await {
        Ok(scalar) => {
            let scalar: [u8; 32] =
                scalar
                    .as_slice()
                    .try_into()
                    .map_err(|_| SecretError::Unavailable {
                        msg: format!("stored encryption key {} is not 32 bytes", encryption_name),
                    })?;
            base64::encode(PublicKey::from(&StaticSecret::from(scalar)).as_bytes())
        }
        Err(SecretError::NotFound { .. }) => {
            let (scalar, public) = generate_encryption_keypair(&mut rand::thread_rng());
            store.put(&encryption_name, &scalar).await?;
            tracing::info!(
                "generated encryption keypair for {}:{}",
                subscriber_id,
                key_id
            );
            public
        }
        Err(err) => return Err(err),
    };

    Ok(ServiceKeys {
        signing_public_key,
        encr_public_key,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::secrets::MemorySecretStore;

    #[async_std::test]
    async fn provisioning_is_idempotent() {
        let store = MemorySecretStore::new();
        let first = ensure_service_keys(&store, "registry.onix", "k1")
            .await
            .unwrap();
        let second = ensure_service_keys(&store, "registry.onix", "k1")
            .await
            .unwrap();
        assert_eq!(first.signing_public_key, second.signing_public_key);
        assert_eq!(first.encr_public_key, second.encr_public_key);
    }
}
