// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Subscriber data model shared by the registry and the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

/// Network role of a subscriber.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriberRole {
    #[strum(serialize = "BAP")]
    Bap,
    #[strum(serialize = "BPP")]
    Bpp,
    #[strum(serialize = "BG")]
    Bg,
    #[strum(serialize = "REGISTRY")]
    Registry,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    #[strum(serialize = "INITIATED")]
    Initiated,
    #[strum(serialize = "UNDER_SUBSCRIPTION")]
    UnderSubscription,
    #[strum(serialize = "SUBSCRIBED")]
    Subscribed,
    #[strum(serialize = "INVALID_SSL")]
    InvalidSsl,
    #[strum(serialize = "UNSUBSCRIBED")]
    Unsubscribed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// A registered network participant.
///
/// `(subscriber_id, domain, type)` is the primary key. Public keys are
/// carried in the encoding the subscriber registered them with (standard
/// base64); the model does not interpret them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub role: SubscriberRole,
    pub domain: String,
    pub signing_public_key: String,
    pub encr_public_key: String,
    pub key_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Network-specific attributes the core carries but does not interpret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_attributes: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Primary key, in the repository's sort order.
    pub fn key(&self) -> (String, String, String) {
        (
            self.subscriber_id.clone(),
            self.domain.clone(),
            self.role.to_string(),
        )
    }

    /// Row-level invariants: a `SUBSCRIBED` row must carry both public keys
    /// and a forward validity window.
    pub fn validate(&self) -> Result<(), String> {
        if self.valid_from >= self.valid_until {
            return Err(format!(
                "valid_from {} is not before valid_until {}",
                self.valid_from, self.valid_until
            ));
        }
        if self.status == SubscriptionStatus::Subscribed
            && (self.signing_public_key.is_empty() || self.encr_public_key.is_empty())
        {
            return Err("a SUBSCRIBED row must carry both public keys".into());
        }
        Ok(())
    }

    pub fn city(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.city.as_deref())
    }

    pub fn country(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.country.as_deref())
    }
}

/// Wire form of a create/update subscription request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub message_id: String,
    pub subscriber_id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub role: SubscriberRole,
    pub domain: String,
    pub signing_public_key: String,
    pub encr_public_key: String,
    pub key_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_attributes: Option<Value>,
}

impl SubscriptionRequest {
    /// Field-wise validation applied before anything is persisted.
    pub fn validate(&self) -> Result<(), String> {
        fn required(field: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{} must not be empty", field))
            } else {
                Ok(())
            }
        }
        required("message_id", &self.message_id)?;
        required("subscriber_id", &self.subscriber_id)?;
        required("url", &self.url)?;
        required("domain", &self.domain)?;
        required("signing_public_key", &self.signing_public_key)?;
        required("encr_public_key", &self.encr_public_key)?;
        required("key_id", &self.key_id)?;
        if self.valid_from >= self.valid_until {
            return Err(format!(
                "valid_from {} is not before valid_until {}",
                self.valid_from, self.valid_until
            ));
        }
        Ok(())
    }

    /// Build the row this request subscribes, stamped with `now`.
    pub fn into_subscription(self, status: SubscriptionStatus, now: DateTime<Utc>) -> Subscription {
        Subscription {
            subscriber_id: self.subscriber_id,
            url: self.url,
            role: self.role,
            domain: self.domain,
            signing_public_key: self.signing_public_key,
            encr_public_key: self.encr_public_key,
            key_id: self.key_id,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            status,
            location: self.location,
            nonce: self.nonce,
            extended_attributes: self.extended_attributes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Read-only query filter over subscriptions. Every field is optional;
/// absent fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<SubscriberRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl LookupRequest {
    pub fn matches(&self, sub: &Subscription) -> bool {
        fn field(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }
        field(&self.subscriber_id, &sub.subscriber_id)
            && field(&self.domain, &sub.domain)
            && self.role.map_or(true, |r| r == sub.role)
            && self.status.map_or(true, |s| s == sub.status)
            && field(&self.key_id, &sub.key_id)
            && self
                .city
                .as_deref()
                .map_or(true, |c| sub.city() == Some(c))
            && self
                .country
                .as_deref()
                .map_or(true, |c| sub.country() == Some(c))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Subscription {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Subscription {
            subscriber_id: "bap.example.com".into(),
            url: "https://bap.example.com".into(),
            role: SubscriberRole::Bap,
            domain: "retail".into(),
            signing_public_key: "c2lnbg==".into(),
            encr_public_key: "ZW5jcg==".into(),
            key_id: "k1".into(),
            valid_from: now,
            valid_until: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            status: SubscriptionStatus::Subscribed,
            location: Some(Location {
                city: Some("std:080".into()),
                country: Some("IND".into()),
            }),
            nonce: None,
            extended_attributes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn role_and_status_strings_round_trip() {
        assert_eq!(SubscriberRole::Bpp.to_string(), "BPP");
        assert_eq!(
            serde_json::to_string(&SubscriptionStatus::UnderSubscription).unwrap(),
            "\"UNDER_SUBSCRIPTION\""
        );
        let role: SubscriberRole = serde_json::from_str("\"REGISTRY\"").unwrap();
        assert_eq!(role, SubscriberRole::Registry);
    }

    #[test]
    fn subscribed_rows_require_keys_and_window() {
        let good = sample();
        assert!(good.validate().is_ok());

        let mut no_key = sample();
        no_key.encr_public_key.clear();
        assert!(no_key.validate().is_err());

        let mut inverted = sample();
        inverted.valid_until = inverted.valid_from;
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn lookup_filter_matches_fields() {
        let sub = sample();
        let mut filter = LookupRequest::default();
        assert!(filter.matches(&sub));

        filter.domain = Some("retail".into());
        filter.role = Some(SubscriberRole::Bap);
        filter.city = Some("std:080".into());
        assert!(filter.matches(&sub));

        filter.status = Some(SubscriptionStatus::Unsubscribed);
        assert!(!filter.matches(&sub));
    }
}
