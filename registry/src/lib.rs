// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

#![doc = include_str!("../README.md")]

use async_std::sync::Arc;
use async_std::task::{sleep, spawn, JoinHandle};
use futures::Future;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tide::http::headers::HeaderValue;
use tide::security::{CorsMiddleware, Origin};
use tide::StatusCode;

use onix_core::auth::AuthError;
use onix_core::model::{LookupRequest, SubscriptionRequest, SubscriptionStatus};
use onix_core::server::{self, add_error_body, request_body, response, ErrorBody};

use crate::admin::{ActionRequest, AdminService};
use crate::auth::Authenticator;
use crate::lro::LroStatus;
use crate::service::SubscriptionService;
use crate::store::StoreError;

pub mod admin;
pub mod auth;
pub mod configuration;
pub mod lro;
pub mod service;
pub mod store;

const REGISTRY_STARTUP_RETRIES: usize = 8;

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("invalid request: {}", msg))]
    Validation { msg: String },

    #[snafu(display("{}", source))]
    Auth { source: AuthError },

    #[snafu(display("operation {} already exists", operation_id))]
    Duplicate { operation_id: String },

    #[snafu(display("operation {} not found", operation_id))]
    OperationNotFound { operation_id: String },

    #[snafu(display("operation {} is already {}", operation_id, status))]
    InvalidTransition {
        operation_id: String,
        status: LroStatus,
    },

    #[snafu(display("internal server error: {}", msg))]
    Internal { msg: String },
}

impl server::Error for RegistryError {
    fn catch_all(msg: String) -> Self {
        Self::Internal { msg }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BadRequest,
            Self::Auth { source } => source.status(),
            Self::Duplicate { .. } | Self::InvalidTransition { .. } => StatusCode::Conflict,
            Self::OperationNotFound { .. } => StatusCode::NotFound,
            Self::Internal { .. } => StatusCode::InternalServerError,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Auth { source } => source.code(),
            Self::Duplicate { .. } => "DUPLICATE_REQUEST",
            Self::OperationNotFound { .. } => "OPERATION_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<AuthError> for RegistryError {
    fn from(source: AuthError) -> Self {
        Self::Auth { source }
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists { operation_id } => Self::Duplicate { operation_id },
            StoreError::NotFound { operation_id } => Self::OperationNotFound { operation_id },
            StoreError::InvalidTransition {
                operation_id, from, ..
            } => Self::InvalidTransition {
                operation_id,
                status: from,
            },
            StoreError::Backend { msg } => Self::Internal { msg },
        }
    }
}

fn server_error(err: RegistryError) -> tide::Error {
    server::server_error(err)
}

/// 401 with the `WWW-Authenticate` challenge alongside the error body.
fn unauthorized_response(err: &AuthError) -> tide::Response {
    let body = ErrorBody {
        code: err.code().to_string(),
        message: err.to_string(),
    };
    let mut res = tide::Response::new(err.status());
    res.insert_header("WWW-Authenticate", err.www_authenticate());
    if let Ok(body) = tide::Body::from_json(&body) {
        res.set_body(body);
    }
    res
}

/// Tracks requests in flight so shutdown can stop accepting new work and
/// give running handlers (including an admin approve loop) a bounded grace
/// period to finish.
#[derive(Clone, Default)]
pub struct ShutdownGauge {
    draining: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl ShutdownGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting new requests.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Wait for in-flight requests to complete, up to `grace`.
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "{} requests still in flight after {:?}; abandoning them",
                    self.in_flight(),
                    grace
                );
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Middleware: refuse new requests while draining, and count the rest so
/// the drain knows when the server is quiet.
fn track_in_flight(
    req: tide::Request<WebState>,
    next: tide::Next<'_, WebState>,
) -> Pin<Box<dyn Future<Output = tide::Result> + Send + '_>> {
    Box::pin(async move {
        let gauge = req.state().shutdown.clone();
        if gauge.is_draining() {
            let body = ErrorBody {
                code: "SERVICE_UNAVAILABLE".to_string(),
                message: "registry is shutting down".to_string(),
            };
            let mut res = tide::Response::new(StatusCode::ServiceUnavailable);
            res.set_body(tide::Body::from_json(&body)?);
            return Ok(res);
        }
        gauge.in_flight.fetch_add(1, Ordering::SeqCst);
        let res = next.run(req).await;
        gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(res)
    })
}

#[derive(Clone)]
pub struct WebState {
    pub service: SubscriptionService,
    pub admin: AdminService,
    pub authenticator: Authenticator,
    pub shutdown: ShutdownGauge,
}

/// Synchronous answer to a subscribe/update: the caller polls the operation
/// for the terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub status: SubscriptionStatus,
    pub message_id: String,
}

async fn healthcheck(_req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    Ok(tide::Response::builder(200)
        .content_type(tide::http::mime::JSON)
        .body(tide::prelude::json!({"status": "ok"}))
        .build())
}

/// Create a subscription. Unauthenticated: identity is established later by
/// the approval challenge.
async fn subscribe(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let request: SubscriptionRequest = request_body(&mut req).await?;
    let lro = req
        .state()
        .service
        .create(request)
        .await
        .map_err(server_error)?;
    response(
        &req,
        &SubscribeResponse {
            status: SubscriptionStatus::UnderSubscription,
            message_id: lro.operation_id,
        },
    )
}

/// Update a subscription. The body must be signed by the subscriber's
/// registered signing key.
async fn update_subscription(
    mut req: tide::Request<WebState>,
) -> Result<tide::Response, tide::Error> {
    let body = req.body_bytes().await?;
    let authorization = req
        .header("Authorization")
        .map(|values| values.last().as_str().to_string());

    let request = match req
        .state()
        .authenticator
        .authenticated_req(&body, authorization.as_deref())
        .await
    {
        Ok(request) => request,
        Err(RegistryError::Auth { source }) => return Ok(unauthorized_response(&source)),
        Err(err) => return Err(server_error(err)),
    };

    let lro = req
        .state()
        .service
        .update(request)
        .await
        .map_err(server_error)?;
    response(
        &req,
        &SubscribeResponse {
            status: SubscriptionStatus::UnderSubscription,
            message_id: lro.operation_id,
        },
    )
}

async fn lookup(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let filter: LookupRequest = request_body(&mut req).await?;
    let subscriptions = req
        .state()
        .service
        .lookup(&filter)
        .await
        .map_err(server_error)?;
    response(&req, &subscriptions)
}

async fn get_operation(req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let operation_id = req.param("operation_id")?;
    let lro = req
        .state()
        .service
        .operation(operation_id)
        .await
        .map_err(server_error)?;
    response(&req, &lro)
}

async fn operation_action(
    mut req: tide::Request<WebState>,
) -> Result<tide::Response, tide::Error> {
    let action: ActionRequest = request_body(&mut req).await?;
    let lro = req
        .state()
        .admin
        .action(&action.operation_id, action.action)
        .await
        .map_err(server_error)?;
    response(&req, &lro)
}

/// This function starts the web server.
pub fn init_web_server(
    state: WebState,
    addr: String,
) -> JoinHandle<Result<(), std::io::Error>> {
    let mut web_server = tide::with_state(state);
    web_server.with(
        CorsMiddleware::new()
            .allow_methods("GET, POST, PATCH".parse::<HeaderValue>().unwrap())
            .allow_headers("*".parse::<HeaderValue>().unwrap())
            .allow_origin(Origin::from("*")),
    );
    web_server.with(add_error_body::<_, RegistryError>);
    web_server.with(track_in_flight);
    web_server.at("/health").get(healthcheck);
    web_server
        .at("/subscribe")
        .post(subscribe)
        .patch(update_subscription);
    web_server.at("/lookup").post(lookup);
    web_server.at("/operations/action").post(operation_action);
    web_server.at("/operations/:operation_id").get(get_operation);
    spawn(web_server.listen(addr))
}

/// Wait for a server to come up and start serving.
pub async fn wait_for_server(base_url: &str) {
    let mut backoff = Duration::from_millis(100);
    for _ in 0..REGISTRY_STARTUP_RETRIES {
        if surf::connect(base_url).send().await.is_ok() {
            return;
        }
        sleep(backoff).await;
        backoff *= 2;
    }
    panic!("server at {} did not start in {:?}", base_url, backoff);
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn drain_waits_for_in_flight_work() {
        let gauge = ShutdownGauge::new();
        gauge.in_flight.fetch_add(1, Ordering::SeqCst);
        gauge.begin_drain();
        assert!(gauge.is_draining());

        let worker = {
            let gauge = gauge.clone();
            async_std::task::spawn(async move {
                sleep(Duration::from_millis(100)).await;
                gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
            })
        };
        gauge.drain(Duration::from_secs(2)).await;
        assert_eq!(gauge.in_flight(), 0);
        worker.await;
    }

    #[async_std::test]
    async fn drain_gives_up_after_the_grace_period() {
        let gauge = ShutdownGauge::new();
        gauge.in_flight.fetch_add(1, Ordering::SeqCst);
        gauge.begin_drain();

        // The request never finishes; the drain must still return.
        gauge.drain(Duration::from_millis(120)).await;
        assert_eq!(gauge.in_flight(), 1);
    }
}
