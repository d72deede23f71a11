// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Drives a pending operation to a terminal state. Rejection is a single
//! CAS; approval runs the onboarding ceremony: encrypt a fresh challenge to
//! the subscriber, POST it to their `on_subscribe` endpoint under the
//! registry's signature, and require the decrypted plaintext back.

use crate::lro::{Lro, LroStatus};
use crate::service::publish_event;
use crate::store::{LroStore, StoreError, SubscriptionRepository};
use crate::RegistryError;
use async_std::sync::{Arc, Mutex};
use async_std::task::sleep;
use chrono::Utc;
use onix_core::events::{EventType, Publisher};
use onix_core::model::{SubscriptionRequest, SubscriptionStatus};
use onix_core::signature;
use onix_keys::{ChallengeService, EncryptionService, KeyError, KeyManager};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// Validity window of the signature on the outbound `on_subscribe` call.
const CALLBACK_AUTH_VALIDITY_SECONDS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminAction {
    Approve,
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRequest {
    pub operation_id: String,
    pub action: AdminAction,
}

/// Challenge delivered to the subscriber's `on_subscribe` endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnSubscribeRequest {
    pub subscriber_id: String,
    pub challenge: String,
}

/// Expected echo: the decrypted challenge plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnSubscribeResponse {
    pub answer: String,
}

/// A failed onboarding attempt, classified for the retry loop.
struct OnboardFailure {
    retriable: bool,
    code: &'static str,
    message: String,
}

impl OnboardFailure {
    fn retriable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            code,
            message: message.into(),
        }
    }

    fn terminal(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct AdminService {
    lros: Arc<dyn LroStore>,
    repo: Arc<dyn SubscriptionRepository>,
    publisher: Arc<dyn Publisher>,
    keys: KeyManager,
    challenge: ChallengeService,
    registry_id: String,
    registry_key_id: String,
    retry_max: u32,
    retry_wait: Duration,
    callback_timeout: Duration,
    // Serializes handlers per operation; the store's CAS remains the
    // cross-process backstop.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lros: Arc<dyn LroStore>,
        repo: Arc<dyn SubscriptionRepository>,
        publisher: Arc<dyn Publisher>,
        keys: KeyManager,
        registry_id: String,
        registry_key_id: String,
        retry_max: u32,
        retry_wait: Duration,
        callback_timeout: Duration,
    ) -> Self {
        Self {
            lros,
            repo,
            publisher,
            keys,
            challenge: ChallengeService,
            registry_id,
            registry_key_id,
            retry_max,
            retry_wait,
            callback_timeout,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn action(
        &self,
        operation_id: &str,
        action: AdminAction,
    ) -> Result<Lro, RegistryError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(operation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let result = match action {
            AdminAction::Reject => self.reject(operation_id).await,
            AdminAction::Approve => self.approve(operation_id).await,
        };

        if let Ok(lro) = &result {
            if lro.status.is_terminal() {
                self.locks.lock().await.remove(operation_id);
            }
        }
        result
    }

    async fn reject(&self, operation_id: &str) -> Result<Lro, RegistryError> {
        match self
            .lros
            .update_status(
                operation_id,
                LroStatus::Pending,
                LroStatus::Rejected,
                None,
                None,
            )
            .await
        {
            Ok(lro) => {
                publish_event(
                    &*self.publisher,
                    EventType::SubscriptionRequestRejected,
                    &lro,
                )
                .await;
                Ok(lro)
            }
            // Already terminal; report the state as it stands.
            Err(StoreError::InvalidTransition { .. }) => Ok(self.lros.get(operation_id).await?),
            Err(err) => Err(err.into()),
        }
    }

    async fn approve(&self, operation_id: &str) -> Result<Lro, RegistryError> {
        let mut attempt = 0u32;
        loop {
            let lro = self.lros.get(operation_id).await?;
            if lro.status != LroStatus::Pending {
                return Ok(lro);
            }

            let request: SubscriptionRequest = match serde_json::from_value(
                lro.request_json.clone(),
            ) {
                Ok(request) => request,
                Err(err) => {
                    return self
                        .finalize_failure(
                            operation_id,
                            "INVALID_REQUEST",
                            &format!("stored request is unreadable: {}", err),
                        )
                        .await
                }
            };

            match self.onboard(operation_id, &request).await {
                Ok(()) => return self.finalize_approved(operation_id, request).await,
                Err(failure) if failure.retriable => {
                    attempt += 1;
                    if attempt >= self.retry_max {
                        return self
                            .finalize_failure(operation_id, "RETRIES_EXHAUSTED", &failure.message)
                            .await;
                    }
                    // Record the failed attempt before backing off.
                    match self
                        .lros
                        .update_status(
                            operation_id,
                            LroStatus::Pending,
                            LroStatus::Pending,
                            None,
                            None,
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(StoreError::InvalidTransition { .. }) => {
                            return Ok(self.lros.get(operation_id).await?)
                        }
                        Err(err) => return Err(err.into()),
                    }
                    tracing::warn!(
                        "approve {}: attempt {} failed ({}: {}), retrying",
                        operation_id,
                        attempt,
                        failure.code,
                        failure.message
                    );
                    sleep(self.retry_wait).await;
                }
                Err(failure) => {
                    return self
                        .finalize_failure(operation_id, failure.code, &failure.message)
                        .await
                }
            }
        }
    }

    async fn finalize_approved(
        &self,
        operation_id: &str,
        request: SubscriptionRequest,
    ) -> Result<Lro, RegistryError> {
        let subscription = request.into_subscription(SubscriptionStatus::Subscribed, Utc::now());
        if let Err(msg) = subscription.validate() {
            return self
                .finalize_failure(operation_id, "INVALID_REQUEST", &msg)
                .await;
        }
        let subscription = self.repo.upsert(subscription).await?;

        let result = json!({
            "subscriber_id": subscription.subscriber_id,
            "domain": subscription.domain,
            "type": subscription.role,
            "status": subscription.status,
        });
        match self
            .lros
            .update_status(
                operation_id,
                LroStatus::Pending,
                LroStatus::Approved,
                Some(result),
                None,
            )
            .await
        {
            Ok(lro) => {
                publish_event(
                    &*self.publisher,
                    EventType::SubscriptionRequestApproved,
                    &lro,
                )
                .await;
                Ok(lro)
            }
            // Lost the CAS race after the ceremony; the winner already
            // published.
            Err(StoreError::InvalidTransition { .. }) => Ok(self.lros.get(operation_id).await?),
            Err(err) => Err(err.into()),
        }
    }

    async fn finalize_failure(
        &self,
        operation_id: &str,
        code: &str,
        message: &str,
    ) -> Result<Lro, RegistryError> {
        tracing::error!("approve {} failed: {}: {}", operation_id, code, message);
        let error = json!({ "code": code, "message": message });
        match self
            .lros
            .update_status(
                operation_id,
                LroStatus::Pending,
                LroStatus::Failure,
                None,
                Some(error),
            )
            .await
        {
            Ok(lro) => Ok(lro),
            Err(StoreError::InvalidTransition { .. }) => Ok(self.lros.get(operation_id).await?),
            Err(err) => Err(err.into()),
        }
    }

    /// One challenge round-trip with the subscriber.
    async fn onboard(
        &self,
        operation_id: &str,
        request: &SubscriptionRequest,
    ) -> Result<(), OnboardFailure> {
        let classify_key_error = |err: KeyError| match err {
            KeyError::Unavailable { msg } => {
                OnboardFailure::retriable("REGISTRY_KEYS_UNAVAILABLE", msg)
            }
            err @ KeyError::NotFound { .. } => {
                OnboardFailure::terminal("REGISTRY_KEYS_MISSING", err.to_string())
            }
        };

        let encryption_key = self
            .keys
            .encryption_private_key(&self.registry_id, &self.registry_key_id)
            .await
            .map_err(classify_key_error)?;
        let signing_key = self
            .keys
            .signing_private_key(&self.registry_id, &self.registry_key_id)
            .await
            .map_err(classify_key_error)?;

        let peer_public = base64::decode(&request.encr_public_key).map_err(|err| {
            OnboardFailure::terminal("INVALID_ENCRYPTION_KEY", err.to_string())
        })?;

        let plaintext = self.challenge.generate();
        let cryptogram = EncryptionService::encrypt(&plaintext, &encryption_key, &peer_public)
            .map_err(|err| {
                OnboardFailure::terminal("CHALLENGE_ENCRYPTION_FAILED", err.to_string())
            })?;

        let body = serde_json::to_vec(&OnSubscribeRequest {
            subscriber_id: request.subscriber_id.clone(),
            challenge: cryptogram,
        })
        .map_err(|err| OnboardFailure::terminal("CHALLENGE_ENCRYPTION_FAILED", err.to_string()))?;

        let created = Utc::now().timestamp();
        let authorization = signature::authorization_header(
            &self.registry_id,
            &self.registry_key_id,
            &signing_key,
            &body,
            created,
            created + CALLBACK_AUTH_VALIDITY_SECONDS,
        )
        .map_err(|err| OnboardFailure::terminal("SIGNING_FAILED", err.to_string()))?;

        let url = format!("{}/on_subscribe", request.url.trim_end_matches('/'));
        let answer = self.post_challenge(&url, &authorization, body).await?;

        if answer != plaintext {
            return Err(OnboardFailure::terminal(
                "CHALLENGE_VERIFICATION_FAILED",
                "subscriber did not return the challenge plaintext",
            ));
        }

        publish_event(
            &*self.publisher,
            EventType::OnSubscribeReceived,
            &json!({ "operation_id": operation_id }),
        )
        .await;
        Ok(())
    }

    /// POST the challenge under its own timeout; the admin action's retry
    /// loop spans multiple invocations, so a slow subscriber must not pin
    /// the handler.
    async fn post_challenge(
        &self,
        url: &str,
        authorization: &str,
        body: Vec<u8>,
    ) -> Result<String, OnboardFailure> {
        let request = surf::post(url)
            .header("Authorization", authorization)
            .content_type(surf::http::mime::JSON)
            .body(body);

        let mut response =
            match async_std::future::timeout(self.callback_timeout, request).await {
                Err(_) => {
                    return Err(OnboardFailure::retriable(
                        "SUBSCRIBER_TIMEOUT",
                        format!("no response from {} within {:?}", url, self.callback_timeout),
                    ))
                }
                Ok(Err(err)) => {
                    return Err(OnboardFailure::retriable(
                        "SUBSCRIBER_UNREACHABLE",
                        err.to_string(),
                    ))
                }
                Ok(Ok(response)) => response,
            };

        let status = response.status();
        if status.is_server_error() {
            return Err(OnboardFailure::retriable(
                "SUBSCRIBER_ERROR",
                format!("{} answered {}", url, status),
            ));
        }
        if !status.is_success() {
            return Err(OnboardFailure::terminal(
                "SUBSCRIBER_REJECTED",
                format!("{} answered {}", url, status),
            ));
        }

        response
            .body_json::<OnSubscribeResponse>()
            .await
            .map(|echo| echo.answer)
            .map_err(|err| OnboardFailure::terminal("MALFORMED_RESPONSE", err.to_string()))
    }
}
