// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The durable record of an asynchronous subscription workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LroType {
    #[strum(serialize = "CREATE_SUBSCRIPTION")]
    CreateSubscription,
    #[strum(serialize = "UPDATE_SUBSCRIPTION")]
    UpdateSubscription,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LroStatus {
    #[strum(serialize = "PENDING")]
    Pending,
    #[strum(serialize = "APPROVED")]
    Approved,
    #[strum(serialize = "REJECTED")]
    Rejected,
    #[strum(serialize = "FAILURE")]
    Failure,
}

impl LroStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LroStatus::Pending)
    }

    /// Transitions run monotonically forward from `PENDING`; terminal
    /// states accept nothing. A same-status "transition" is not a
    /// transition (the store uses it for retry bookkeeping).
    pub fn can_transition(self, to: LroStatus) -> bool {
        matches!(
            (self, to),
            (
                LroStatus::Pending,
                LroStatus::Approved | LroStatus::Rejected | LroStatus::Failure
            )
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lro {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub op_type: LroType,
    pub status: LroStatus,
    pub request_json: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_json: Option<Value>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lro {
    pub fn new(operation_id: impl Into<String>, op_type: LroType, request_json: Value) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.into(),
            op_type,
            status: LroStatus::Pending,
            request_json,
            result_json: None,
            error_json: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_pending_has_outgoing_transitions() {
        for to in [LroStatus::Approved, LroStatus::Rejected, LroStatus::Failure] {
            assert!(LroStatus::Pending.can_transition(to));
            for terminal in [LroStatus::Approved, LroStatus::Rejected, LroStatus::Failure] {
                assert!(!terminal.can_transition(to));
            }
        }
        assert!(!LroStatus::Pending.can_transition(LroStatus::Pending));
    }

    #[test]
    fn status_strings_match_the_wire() {
        assert_eq!(LroStatus::Failure.to_string(), "FAILURE");
        assert_eq!(
            serde_json::to_string(&LroType::UpdateSubscription).unwrap(),
            "\"UPDATE_SUBSCRIPTION\""
        );
    }

    #[test]
    fn new_operations_start_pending() {
        let lro = Lro::new(
            "m1",
            LroType::CreateSubscription,
            serde_json::json!({"message_id": "m1"}),
        );
        assert_eq!(lro.status, LroStatus::Pending);
        assert_eq!(lro.retry_count, 0);
        assert!(lro.result_json.is_none() && lro.error_json.is_none());
    }
}
