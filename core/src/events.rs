// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Domain events published by the registry. Delivery is at-least-once with
//! no ordering guarantee; consumers key on `event_type`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use strum_macros::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    #[strum(serialize = "NEW_SUBSCRIPTION_REQUEST")]
    NewSubscriptionRequest,
    #[strum(serialize = "UPDATE_SUBSCRIPTION_REQUEST")]
    UpdateSubscriptionRequest,
    #[strum(serialize = "SUBSCRIPTION_REQUEST_APPROVED")]
    SubscriptionRequestApproved,
    #[strum(serialize = "SUBSCRIPTION_REQUEST_REJECTED")]
    SubscriptionRequestRejected,
    #[strum(serialize = "ON_SUBSCRIBE_RECEIVED")]
    OnSubscribeReceived,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new<T: Serialize>(event_type: EventType, payload: &T) -> Result<Self, PublishError> {
        let payload = serde_json::to_value(payload).map_err(|err| PublishError::Encode {
            msg: err.to_string(),
        })?;
        Ok(Self {
            event_type,
            payload,
            published_at: Utc::now(),
        })
    }
}

#[derive(Debug, Snafu)]
pub enum PublishError {
    #[snafu(display("failed to encode event payload: {}", msg))]
    Encode { msg: String },

    #[snafu(display("event bus is closed"))]
    Closed,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), PublishError>;
}

/// In-process publisher over an unbounded MPMC channel. Every subscriber
/// receiver competes for messages; tests use a single subscriber to observe
/// the emission order.
#[derive(Clone)]
pub struct ChannelPublisher {
    sender: async_channel::Sender<Event>,
    receiver: async_channel::Receiver<Event>,
}

impl ChannelPublisher {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn subscribe(&self) -> async_channel::Receiver<Event> {
        self.receiver.clone()
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| PublishError::Closed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[async_std::test]
    async fn publish_is_observable_in_order() {
        let bus = ChannelPublisher::new();
        let inbox = bus.subscribe();

        bus.publish(Event::new(EventType::NewSubscriptionRequest, &json!({"m": 1})).unwrap())
            .await
            .unwrap();
        bus.publish(
            Event::new(EventType::SubscriptionRequestApproved, &json!({"m": 2})).unwrap(),
        )
        .await
        .unwrap();

        let first = inbox.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::NewSubscriptionRequest);
        let second = inbox.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::SubscriptionRequestApproved);
        assert_eq!(second.payload["m"], 2);
    }

    #[test]
    fn event_type_names_match_the_taxonomy() {
        assert_eq!(
            EventType::OnSubscribeReceived.to_string(),
            "ON_SUBSCRIBE_RECEIVED"
        );
        assert_eq!(
            serde_json::to_string(&EventType::UpdateSubscriptionRequest).unwrap(),
            "\"UPDATE_SUBSCRIPTION_REQUEST\""
        );
    }
}
