// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The slice of the Beckn envelope the gateway inspects. Transaction bodies
//! are forwarded verbatim; only `context` is parsed, and unknown fields are
//! left untouched in the raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegionCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<RegionCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<RegionCode>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TxnContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bap_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bap_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpp_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<ContextLocation>,
}

impl TxnContext {
    /// Parse the `context` member of a raw transaction body. A body without
    /// a `context` object yields `None`.
    pub fn from_body(body: &Value) -> Option<Self> {
        let ctx = body.get("context")?;
        serde_json::from_value(ctx.clone()).ok()
    }

    pub fn city(&self) -> Option<&str> {
        self.location
            .as_ref()
            .and_then(|l| l.city.as_ref())
            .and_then(|c| c.code.as_deref())
    }

    pub fn country(&self) -> Option<&str> {
        self.location
            .as_ref()
            .and_then(|l| l.country.as_ref())
            .and_then(|c| c.code.as_deref())
    }

    /// True when the envelope already names its destination provider.
    pub fn is_bound(&self) -> bool {
        self.bpp_id.as_deref().map_or(false, |id| !id.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ack,
    Nack,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckBody {
    pub status: AckStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckMessage {
    pub ack: AckBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// The synchronous response to a gateway intake: `ACK` means "accepted for
/// fan-out", not "delivered".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub message: AckMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl AckResponse {
    pub fn ack() -> Self {
        Self {
            message: AckMessage {
                ack: AckBody {
                    status: AckStatus::Ack,
                },
            },
            error: None,
        }
    }

    pub fn nack(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: AckMessage {
                ack: AckBody {
                    status: AckStatus::Nack,
                },
            },
            error: Some(AckError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}
