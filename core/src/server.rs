// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! tide plumbing shared by the service crates: a typed error trait mapped to
//! HTTP statuses and taxonomy codes, body deserialization that accepts JSON
//! or bincode by content type, and a middleware that renders service errors
//! as JSON bodies.

use futures::Future;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::pin::Pin;
use tide::StatusCode;

/// Implemented by each service's error enum.
pub trait Error: std::error::Error + Send + Sync + Sized + 'static {
    /// Wrap an error that escaped the service's own taxonomy.
    fn catch_all(msg: String) -> Self;

    fn status(&self) -> StatusCode;

    /// Stable machine-readable code, e.g. `DUPLICATE_REQUEST`.
    fn code(&self) -> &'static str;
}

/// Convert a service error into a `tide::Error` carrying its status; the
/// `add_error_body` middleware recovers the typed error for the body.
pub fn server_error<E: Error>(err: E) -> tide::Error {
    tide::Error::new(err.status(), err)
}

/// The JSON body attached to every error response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Deserialize a request body as JSON, or as bincode when the request is
/// tagged `application/octet-stream`.
pub async fn request_body<T: DeserializeOwned, S>(
    req: &mut tide::Request<S>,
) -> Result<T, tide::Error> {
    let bytes = req.body_bytes().await?;
    let octet_stream = req
        .content_type()
        .map_or(false, |mime| mime.essence() == "application/octet-stream");
    if octet_stream {
        bincode::deserialize(&bytes)
            .map_err(|err| tide::Error::from_str(StatusCode::BadRequest, err.to_string()))
    } else {
        serde_json::from_slice(&bytes)
            .map_err(|err| tide::Error::from_str(StatusCode::BadRequest, err.to_string()))
    }
}

/// Respond 200 with a JSON body.
pub fn response<T: Serialize, S>(
    _req: &tide::Request<S>,
    body: &T,
) -> Result<tide::Response, tide::Error> {
    Ok(tide::Response::builder(StatusCode::Ok)
        .body(tide::Body::from_json(body)?)
        .build())
}

/// Middleware: replace the body of failed responses with the JSON rendering
/// of the service's typed error. Untyped failures go through `catch_all`.
///
/// Install with a turbofish naming the service error:
/// `app.with(add_error_body::<_, RegistryError>)`.
pub fn add_error_body<'a, S, E>(
    req: tide::Request<S>,
    next: tide::Next<'a, S>,
) -> Pin<Box<dyn Future<Output = tide::Result> + Send + 'a>>
where
    S: Clone + Send + Sync + 'static,
    E: Error,
{
    Box::pin(async move {
        let mut res = next.run(req).await;
        let status = res.status();
        let rendered = res.error().map(|err| match err.downcast_ref::<E>() {
            Some(typed) => ErrorBody {
                code: typed.code().to_string(),
                message: typed.to_string(),
            },
            // Untyped 4xx come from body/parameter parsing upstream of the
            // service; anything else is wrapped as the service's catch-all.
            None if status.is_client_error() => ErrorBody {
                code: "INVALID_JSON".to_string(),
                message: err.to_string(),
            },
            None => {
                let msg = err.to_string();
                ErrorBody {
                    code: E::catch_all(msg.clone()).code().to_string(),
                    message: msg,
                }
            }
        });
        if let Some(body) = rendered {
            res.set_body(tide::Body::from_json(&body)?);
            res.set_status(status);
        }
        Ok(res)
    })
}
