// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Second stage of the fan-out: sign and dispatch one request to one
//! provider, retrying transport errors and 5xx with exponential backoff
//! under a total deadline. The caller already holds an `ACK`, so outcomes
//! are logged, never propagated.

use crate::tasks::AsyncTask;
use crate::GatewayState;
use async_std::task::sleep;
use chrono::Utc;
use onix_core::signature;
use onix_keys::KeyError;
use std::time::Instant;
use surf::http::headers::HeaderName;

/// Validity window of the signature on a proxied request.
const PROXY_AUTH_VALIDITY_SECONDS: i64 = 300;

/// Connection-level headers that must not survive proxying. Authorization
/// and content headers are regenerated for the outbound request.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "content-length",
    "content-type",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

enum Outcome {
    Success(surf::StatusCode),
    Retriable(String),
    Terminal(String),
}

/// The headers forwarded to the provider.
pub fn forwarded_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !STRIPPED_HEADERS.contains(&name.as_str())
        })
        .cloned()
        .collect()
}

pub async fn process(state: &GatewayState, task: &AsyncTask) {
    match dispatch(state, task).await {
        Ok(status) => tracing::info!(
            "proxy task {}: delivered to {} ({})",
            task.id,
            task.target.as_deref().unwrap_or("<unset>"),
            status
        ),
        // Do not surface: the caller was ACKed long ago. Leave enough in
        // the log to triage by task and message.
        Err(msg) => tracing::error!(
            "proxy task {} (message_id {:?}): {}",
            task.id,
            task.context.message_id,
            msg
        ),
    }
}

async fn dispatch(state: &GatewayState, task: &AsyncTask) -> Result<surf::StatusCode, String> {
    let target = task
        .target
        .as_deref()
        .ok_or_else(|| "proxy task has no target".to_string())?;
    let body = serde_json::to_vec(&task.body).map_err(|err| err.to_string())?;

    let deadline = Instant::now() + state.proxy_deadline;
    let mut wait = state.retry.wait_min;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!("deadline exhausted after {} attempts", attempt - 1));
        }

        match attempt_dispatch(state, task, target, &body, remaining.min(state.proxy_timeout))
            .await
        {
            Outcome::Success(status) => return Ok(status),
            Outcome::Terminal(msg) => return Err(msg),
            Outcome::Retriable(msg) => {
                if attempt >= state.retry.max {
                    return Err(format!(
                        "retries exhausted after {} attempts: {}",
                        attempt, msg
                    ));
                }
                tracing::warn!(
                    "proxy task {}: attempt {} failed ({}), retrying in {:?}",
                    task.id,
                    attempt,
                    msg,
                    wait
                );
                sleep(wait).await;
                wait = (wait * 2).min(state.retry.wait_max);
            }
        }
    }
}

async fn attempt_dispatch(
    state: &GatewayState,
    task: &AsyncTask,
    target: &str,
    body: &[u8],
    timeout: std::time::Duration,
) -> Outcome {
    // A fresh signature per attempt; the previous one may have expired
    // while backing off.
    let signing_key = match state
        .keys
        .signing_private_key(&state.subscriber_id, &state.key_id)
        .await
    {
        Ok(key) => key,
        Err(KeyError::Unavailable { msg }) => return Outcome::Retriable(msg),
        Err(err @ KeyError::NotFound { .. }) => return Outcome::Terminal(err.to_string()),
    };
    let created = Utc::now().timestamp();
    let authorization = match signature::authorization_header(
        &state.subscriber_id,
        &state.key_id,
        &signing_key,
        body,
        created,
        created + PROXY_AUTH_VALIDITY_SECONDS,
    ) {
        Ok(header) => header,
        Err(err) => return Outcome::Terminal(err.to_string()),
    };

    let mut request = surf::post(target)
        .content_type(surf::http::mime::JSON)
        .header("Authorization", authorization.as_str())
        .body(body.to_vec());
    for (name, value) in forwarded_headers(&task.headers) {
        if let Ok(name) = HeaderName::from_string(name.to_ascii_lowercase()) {
            request = request.header(name, value.as_str());
        }
    }

    match async_std::future::timeout(timeout, request).await {
        Err(_) => Outcome::Retriable(format!("no response from {} within {:?}", target, timeout)),
        Ok(Err(err)) => Outcome::Retriable(err.to_string()),
        Ok(Ok(response)) => {
            let status = response.status();
            if status.is_success() {
                Outcome::Success(status)
            } else if status.is_server_error() {
                Outcome::Retriable(format!("{} answered {}", target, status))
            } else {
                Outcome::Terminal(format!("{} answered {}", target, status))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hop_by_hop_and_content_headers_are_stripped() {
        let headers = vec![
            ("Authorization".to_string(), "Signature old".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Length".to_string(), "123".to_string()),
            ("Host".to_string(), "gateway.onix".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("X-Request-Id".to_string(), "r1".to_string()),
            ("Accept-Language".to_string(), "en".to_string()),
        ];
        let forwarded = forwarded_headers(&headers);
        let names: Vec<_> = forwarded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["X-Request-Id", "Accept-Language"]);
    }
}
