// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Typed authentication failure shared by the registry's request
//! authenticator and the gateway's transaction validator.

use crate::signature::{SignatureError, SIGNED_HEADERS};
use serde::{Deserialize, Serialize};
use tide::StatusCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthErrorKind {
    MissingHeader,
    MalformedHeader,
    InvalidSignature,
    Expired,
    SubscriberNotFound,
    SubscriberMismatch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
    /// Realm for the `WWW-Authenticate` challenge, when the subscriber is
    /// known from the header.
    pub subscriber_id: Option<String>,
}

impl AuthError {
    pub fn missing_header() -> Self {
        Self {
            kind: AuthErrorKind::MissingHeader,
            message: "request carries no Authorization header".into(),
            subscriber_id: None,
        }
    }

    pub fn subscriber_not_found(subscriber_id: &str) -> Self {
        Self {
            kind: AuthErrorKind::SubscriberNotFound,
            message: format!("no signing key registered for {}", subscriber_id),
            subscriber_id: Some(subscriber_id.into()),
        }
    }

    pub fn subscriber_mismatch(header: &str, body: &str) -> Self {
        Self {
            kind: AuthErrorKind::SubscriberMismatch,
            message: format!(
                "body subscriber {} does not match signing subscriber {}",
                body, header
            ),
            subscriber_id: Some(header.into()),
        }
    }

    pub fn from_signature(err: SignatureError, subscriber_id: Option<String>) -> Self {
        let kind = match &err {
            SignatureError::MissingPrefix
            | SignatureError::MissingField { .. }
            | SignatureError::MalformedField { .. }
            | SignatureError::MalformedKeyId { .. }
            | SignatureError::UnsupportedAlgorithm { .. } => AuthErrorKind::MalformedHeader,
            SignatureError::NotYetValid { .. } | SignatureError::Expired { .. } => {
                AuthErrorKind::Expired
            }
            _ => AuthErrorKind::InvalidSignature,
        };
        Self {
            kind,
            message: err.to_string(),
            subscriber_id,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::Unauthorized
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            AuthErrorKind::MissingHeader | AuthErrorKind::MalformedHeader => "UNAUTHORIZED",
            AuthErrorKind::InvalidSignature | AuthErrorKind::Expired => "INVALID_SIGNATURE",
            AuthErrorKind::SubscriberNotFound => "SUBSCRIBER_NOT_FOUND",
            AuthErrorKind::SubscriberMismatch => "SUBSCRIBER_MISMATCH",
        }
    }

    /// The challenge header a 401 response carries.
    pub fn www_authenticate(&self) -> String {
        format!(
            "Signature realm=\"{}\",headers=\"{}\"",
            self.subscriber_id.as_deref().unwrap_or_default(),
            SIGNED_HEADERS
        )
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AuthError {}
