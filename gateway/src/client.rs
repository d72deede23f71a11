// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP client for the registry's lookup endpoint.

use async_trait::async_trait;
use onix_core::model::{LookupRequest, Subscription};
use onix_keys::{LookupError, RegistryLookup};

#[derive(Clone, Debug)]
pub struct RegistryClient {
    base: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { base }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }
}

#[async_trait]
impl RegistryLookup for RegistryClient {
    async fn lookup(&self, filter: &LookupRequest) -> Result<Vec<Subscription>, LookupError> {
        let body = surf::Body::from_json(filter).map_err(|err| LookupError::Failed {
            msg: err.to_string(),
        })?;
        let mut response = surf::post(format!("{}/lookup", self.base))
            .body(body)
            .await
            .map_err(|err| LookupError::Failed {
                msg: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(LookupError::Failed {
                msg: format!("registry answered {}", response.status()),
            });
        }
        response
            .body_json::<Vec<Subscription>>()
            .await
            .map_err(|err| LookupError::Failed {
                msg: err.to_string(),
            })
    }
}
