// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Intake of create/update subscription requests and the read-only lookup.

use crate::lro::{Lro, LroType};
use crate::store::{LroStore, SubscriptionRepository};
use crate::RegistryError;
use async_std::sync::Arc;
use onix_core::events::{Event, EventType, Publisher};
use onix_core::model::{LookupRequest, Subscription, SubscriptionRequest};
use serde::Serialize;

/// Publish, logging instead of failing: event delivery is at-least-once and
/// must not abort the request that triggered it.
pub(crate) async fn publish_event<T: Serialize>(
    publisher: &dyn Publisher,
    event_type: EventType,
    payload: &T,
) {
    match Event::new(event_type, payload) {
        Ok(event) => {
            if let Err(err) = publisher.publish(event).await {
                tracing::error!("failed to publish {}: {}", event_type, err);
            }
        }
        Err(err) => tracing::error!("failed to encode {} payload: {}", event_type, err),
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    lros: Arc<dyn LroStore>,
    repo: Arc<dyn SubscriptionRepository>,
    publisher: Arc<dyn Publisher>,
}

impl SubscriptionService {
    pub fn new(
        lros: Arc<dyn LroStore>,
        repo: Arc<dyn SubscriptionRepository>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            lros,
            repo,
            publisher,
        }
    }

    /// Record a new-subscriber request as a `PENDING` operation. The
    /// `message_id` doubles as the operation id, so a replayed message is a
    /// `DuplicateRequest`.
    pub async fn create(&self, request: SubscriptionRequest) -> Result<Lro, RegistryError> {
        self.intake(
            request,
            LroType::CreateSubscription,
            EventType::NewSubscriptionRequest,
        )
        .await
    }

    /// Same flow for an already-subscribed caller; the handler has verified
    /// the request signature before this point.
    pub async fn update(&self, request: SubscriptionRequest) -> Result<Lro, RegistryError> {
        self.intake(
            request,
            LroType::UpdateSubscription,
            EventType::UpdateSubscriptionRequest,
        )
        .await
    }

    async fn intake(
        &self,
        request: SubscriptionRequest,
        op_type: LroType,
        event_type: EventType,
    ) -> Result<Lro, RegistryError> {
        request
            .validate()
            .map_err(|msg| RegistryError::Validation { msg })?;
        let request_json =
            serde_json::to_value(&request).map_err(|err| RegistryError::Internal {
                msg: err.to_string(),
            })?;

        let lro = self
            .lros
            .insert(Lro::new(request.message_id.clone(), op_type, request_json))
            .await?;
        publish_event(&*self.publisher, event_type, &request).await;
        Ok(lro)
    }

    pub async fn lookup(
        &self,
        filter: &LookupRequest,
    ) -> Result<Vec<Subscription>, RegistryError> {
        Ok(self.repo.select(filter).await?)
    }

    pub async fn operation(&self, operation_id: &str) -> Result<Lro, RegistryError> {
        Ok(self.lros.get(operation_id).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{MemoryLroStore, MemorySubscriptionRepository};
    use chrono::{TimeZone, Utc};
    use onix_core::events::ChannelPublisher;
    use onix_core::model::SubscriberRole;

    fn request(message_id: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            message_id: message_id.into(),
            subscriber_id: "bap.x".into(),
            url: "https://bap.x".into(),
            role: SubscriberRole::Bap,
            domain: "retail".into(),
            signing_public_key: "U0lHTg==".into(),
            encr_public_key: "RU5DUg==".into(),
            key_id: "k1".into(),
            valid_from: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            valid_until: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            location: None,
            nonce: None,
            extended_attributes: None,
        }
    }

    fn service() -> (SubscriptionService, ChannelPublisher) {
        let publisher = ChannelPublisher::new();
        let service = SubscriptionService::new(
            Arc::new(MemoryLroStore::new()),
            Arc::new(MemorySubscriptionRepository::new()),
            Arc::new(publisher.clone()),
        );
        (service, publisher)
    }

    #[async_std::test]
    async fn create_records_a_pending_operation_and_publishes() {
        let (service, publisher) = service();
        let inbox = publisher.subscribe();

        let lro = service.create(request("m1")).await.unwrap();
        assert_eq!(lro.operation_id, "m1");
        assert_eq!(lro.op_type, LroType::CreateSubscription);

        let event = inbox.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::NewSubscriptionRequest);
        assert_eq!(event.payload["message_id"], "m1");
    }

    #[async_std::test]
    async fn duplicate_message_id_is_rejected_once() {
        let (service, _publisher) = service();
        service.create(request("m2")).await.unwrap();

        match service.create(request("m2")).await {
            Err(RegistryError::Duplicate { operation_id }) => assert_eq!(operation_id, "m2"),
            other => panic!("expected DuplicateRequest, got {:?}", other.map(|l| l.status)),
        }
        // A single operation is observable afterwards.
        assert_eq!(service.operation("m2").await.unwrap().operation_id, "m2");
    }

    #[async_std::test]
    async fn invalid_requests_never_reach_the_store() {
        let (service, _publisher) = service();
        let mut bad = request("m3");
        bad.valid_until = bad.valid_from;

        assert!(matches!(
            service.create(bad).await,
            Err(RegistryError::Validation { .. })
        ));
        assert!(matches!(
            service.operation("m3").await,
            Err(RegistryError::OperationNotFound { .. })
        ));
    }

    #[async_std::test]
    async fn update_uses_its_own_type_and_event() {
        let (service, publisher) = service();
        let inbox = publisher.subscribe();

        let lro = service.update(request("m4")).await.unwrap();
        assert_eq!(lro.op_type, LroType::UpdateSubscription);
        assert_eq!(
            inbox.recv().await.unwrap().event_type,
            EventType::UpdateSubscriptionRequest
        );
    }
}
