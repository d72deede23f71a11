// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

#![doc = include_str!("../README.md")]

use async_std::sync::{Arc, RwLock};
use async_std::task::{spawn, JoinHandle};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::time::Duration;
use tide::http::headers::HeaderValue;
use tide::security::{CorsMiddleware, Origin};
use tide::StatusCode;

use onix_core::auth::AuthError;
use onix_core::context::{AckResponse, TxnContext};
use onix_core::server::{self, add_error_body, response};
use onix_keys::{KeyManager, RegistryLookup};

use crate::tasks::{AsyncTask, FanoutGate, TaskQueue};
use crate::validator::TxnSignValidator;

pub mod client;
pub mod configuration;
pub mod lookup;
pub mod proxy;
pub mod tasks;
pub mod validator;

#[derive(Debug, Snafu)]
pub enum GatewayError {
    #[snafu(display("invalid request: {}", msg))]
    Validation { msg: String },

    #[snafu(display("{}", source))]
    Auth { source: AuthError },

    #[snafu(display("task queue is full, try again later"))]
    QueueingFailed,

    #[snafu(display("gateway is not accepting transactions"))]
    Unavailable,

    #[snafu(display("provider lookup failed: {}", msg))]
    Lookup { msg: String },

    #[snafu(display("internal server error: {}", msg))]
    Internal { msg: String },
}

impl server::Error for GatewayError {
    fn catch_all(msg: String) -> Self {
        Self::Internal { msg }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BadRequest,
            Self::Auth { source } => source.status(),
            Self::QueueingFailed | Self::Lookup { .. } | Self::Internal { .. } => {
                StatusCode::InternalServerError
            }
            Self::Unavailable => StatusCode::ServiceUnavailable,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Auth { source } => source.code(),
            Self::QueueingFailed => "QUEUEING_FAILED",
            Self::Unavailable => "SERVICE_UNAVAILABLE",
            Self::Lookup { .. } => "LOOKUP_FAILED",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(source: AuthError) -> Self {
        Self::Auth { source }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Initializing,
    Ok,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

#[derive(Clone)]
pub struct GatewayState {
    pub queue: TaskQueue,
    pub gate: FanoutGate,
    pub validator: TxnSignValidator,
    pub keys: KeyManager,
    pub registry: Arc<dyn RegistryLookup>,
    pub subscriber_id: String,
    pub key_id: String,
    pub retry: RetryPolicy,
    pub proxy_timeout: Duration,
    pub proxy_deadline: Duration,
    pub status: Arc<RwLock<GatewayStatus>>,
}

impl GatewayState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: KeyManager,
        registry: Arc<dyn RegistryLookup>,
        subscriber_id: String,
        key_id: String,
        retry: RetryPolicy,
        proxy_timeout: Duration,
        proxy_deadline: Duration,
        buffer_size: usize,
        max_fanout: usize,
    ) -> Self {
        Self {
            queue: TaskQueue::bounded(buffer_size),
            gate: FanoutGate::new(max_fanout),
            validator: TxnSignValidator::new(keys.clone()),
            keys,
            registry,
            subscriber_id,
            key_id,
            retry,
            proxy_timeout,
            proxy_deadline,
            status: Arc::new(RwLock::new(GatewayStatus::Initializing)),
        }
    }
}

async fn healthcheck(req: tide::Request<GatewayState>) -> Result<tide::Response, tide::Error> {
    let status = *req.state().status.read().await;
    response(&req, &serde_json::json!({ "status": status }))
}

/// Accept one transaction: authenticate, freeze, enqueue a lookup task.
async fn accept(
    state: &GatewayState,
    action: &str,
    body_bytes: &[u8],
    authorization: Option<&str>,
    headers: Vec<(String, String)>,
) -> Result<(), GatewayError> {
    if *state.status.read().await != GatewayStatus::Ok {
        return Err(GatewayError::Unavailable);
    }

    let body: serde_json::Value =
        serde_json::from_slice(body_bytes).map_err(|err| GatewayError::Validation {
            msg: format!("body is not valid JSON: {}", err),
        })?;
    let context = TxnContext::from_body(&body).ok_or_else(|| GatewayError::Validation {
        msg: "body carries no context object".into(),
    })?;
    let ctx_action = context
        .action
        .as_deref()
        .ok_or_else(|| GatewayError::Validation {
            msg: "context.action is required".into(),
        })?;
    if ctx_action != action {
        return Err(GatewayError::Validation {
            msg: format!(
                "request path action {} does not match context.action {}",
                action, ctx_action
            ),
        });
    }

    state
        .validator
        .validate(body_bytes, authorization, &context)
        .await?;

    state
        .queue
        .enqueue(AsyncTask::lookup(context, body, headers))
}

/// NACK with the taxonomy code; 401s carry the signature challenge.
fn nack_response(err: &GatewayError) -> tide::Response {
    use server::Error;
    let mut res = tide::Response::new(err.status());
    if let GatewayError::Auth { source } = err {
        res.insert_header("WWW-Authenticate", source.www_authenticate());
    }
    if let Ok(body) = tide::Body::from_json(&AckResponse::nack(err.code(), err.to_string())) {
        res.set_body(body);
    }
    res
}

/// Gateway intake: `POST /<beckn-action>`. The response is a synchronous
/// `ACK`/`NACK`; delivery happens asynchronously.
async fn intake(mut req: tide::Request<GatewayState>) -> Result<tide::Response, tide::Error> {
    let action = req.param("action")?.to_string();
    let authorization = req
        .header("Authorization")
        .map(|values| values.last().as_str().to_string());
    let headers: Vec<(String, String)> = req
        .iter()
        .map(|(name, values)| (name.as_str().to_string(), values.last().as_str().to_string()))
        .collect();
    let body_bytes = req.body_bytes().await?;

    match accept(
        req.state(),
        &action,
        &body_bytes,
        authorization.as_deref(),
        headers,
    )
    .await
    {
        Ok(()) => response(&req, &AckResponse::ack()),
        Err(err) => {
            tracing::warn!("rejected /{}: {}", action, err);
            Ok(nack_response(&err))
        }
    }
}

/// This function starts the web server. Workers are spawned separately via
/// [`tasks::spawn_workers`] so deployments control the pool lifecycle.
pub fn init_web_server(
    state: GatewayState,
    addr: String,
) -> JoinHandle<Result<(), std::io::Error>> {
    let mut web_server = tide::with_state(state);
    web_server.with(
        CorsMiddleware::new()
            .allow_methods("GET, POST".parse::<HeaderValue>().unwrap())
            .allow_headers("*".parse::<HeaderValue>().unwrap())
            .allow_origin(Origin::from("*")),
    );
    web_server.with(add_error_body::<_, GatewayError>);
    web_server.at("/health").get(healthcheck);
    web_server.at("/:action").post(intake);
    spawn(web_server.listen(addr))
}
