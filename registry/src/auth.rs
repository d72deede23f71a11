// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Request authentication for signed subscription updates.

use crate::store::SubscriptionRepository;
use crate::RegistryError;
use async_std::sync::Arc;
use chrono::Utc;
use onix_core::auth::AuthError;
use onix_core::model::{LookupRequest, SubscriptionRequest};
use onix_core::signature;

#[derive(Clone)]
pub struct Authenticator {
    repo: Arc<dyn SubscriptionRepository>,
}

impl Authenticator {
    pub fn new(repo: Arc<dyn SubscriptionRepository>) -> Self {
        Self { repo }
    }

    /// Parse and verify a signed subscription request. The signing key is
    /// read from the repository rather than the key cache so that a
    /// just-rotated key cannot be served stale.
    pub async fn authenticated_req(
        &self,
        body: &[u8],
        auth_header: Option<&str>,
    ) -> Result<SubscriptionRequest, RegistryError> {
        let header = auth_header.ok_or_else(AuthError::missing_header)?;
        let parts = signature::parse_authorization(header)
            .map_err(|err| AuthError::from_signature(err, None))?;
        let subscriber_id = parts.subscriber_id.clone();

        let filter = LookupRequest {
            subscriber_id: Some(subscriber_id.clone()),
            key_id: Some(parts.unique_key_id.clone()),
            ..LookupRequest::default()
        };
        let rows = self.repo.select(&filter).await?;
        let subscription = rows
            .first()
            .ok_or_else(|| AuthError::subscriber_not_found(&subscriber_id))?;

        signature::verify(
            &subscription.signing_public_key,
            &parts,
            body,
            Utc::now().timestamp(),
        )
        .map_err(|err| AuthError::from_signature(err, Some(subscriber_id.clone())))?;

        let request: SubscriptionRequest =
            serde_json::from_slice(body).map_err(|err| RegistryError::Validation {
                msg: err.to_string(),
            })?;
        if request.subscriber_id != subscriber_id {
            return Err(
                AuthError::subscriber_mismatch(&subscriber_id, &request.subscriber_id).into(),
            );
        }
        Ok(request)
    }
}
