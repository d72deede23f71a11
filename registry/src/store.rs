// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Storage seams of the registry. The in-memory implementations carry the
//! full contract (unique insert, compare-and-set transitions, ordered
//! selects) so a relational backend can be dropped in behind the traits.

use crate::lro::{Lro, LroStatus};
use async_std::sync::{Arc, Mutex, RwLock};
use async_trait::async_trait;
use chrono::Utc;
use onix_core::model::{LookupRequest, Subscription};
use serde_json::Value;
use snafu::Snafu;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("operation {} already exists", operation_id))]
    AlreadyExists { operation_id: String },

    #[snafu(display("operation {} not found", operation_id))]
    NotFound { operation_id: String },

    #[snafu(display(
        "invalid transition {} -> {} for operation {}",
        from,
        to,
        operation_id
    ))]
    InvalidTransition {
        operation_id: String,
        from: LroStatus,
        to: LroStatus,
    },

    #[snafu(display("storage backend error: {}", msg))]
    Backend { msg: String },
}

/// Persistent map `operation_id -> LRO`.
#[async_trait]
pub trait LroStore: Send + Sync {
    /// Insert a new operation; `AlreadyExists` on a duplicate id.
    async fn insert(&self, lro: Lro) -> Result<Lro, StoreError>;

    async fn get(&self, operation_id: &str) -> Result<Lro, StoreError>;

    /// Atomic compare-and-set on status. A call with `expected == new` is
    /// retry bookkeeping: it increments `retry_count` without transitioning.
    /// A genuine transition must be legal per [`LroStatus::can_transition`].
    /// Every successful call bumps `updated_at`.
    async fn update_status(
        &self,
        operation_id: &str,
        expected: LroStatus,
        new: LroStatus,
        result_json: Option<Value>,
        error_json: Option<Value>,
    ) -> Result<Lro, StoreError>;
}

#[derive(Clone)]
pub struct MemoryLroStore {
    operations: Arc<Mutex<HashMap<String, Lro>>>,
}

impl MemoryLroStore {
    pub fn new() -> Self {
        Self {
            operations: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryLroStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LroStore for MemoryLroStore {
    async fn insert(&self, lro: Lro) -> Result<Lro, StoreError> {
        let mut operations = self.operations.lock().await;
        if operations.contains_key(&lro.operation_id) {
            return Err(StoreError::AlreadyExists {
                operation_id: lro.operation_id,
            });
        }
        operations.insert(lro.operation_id.clone(), lro.clone());
        Ok(lro)
    }

    async fn get(&self, operation_id: &str) -> Result<Lro, StoreError> {
        self.operations
            .lock()
            .await
            .get(operation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                operation_id: operation_id.into(),
            })
    }

    async fn update_status(
        &self,
        operation_id: &str,
        expected: LroStatus,
        new: LroStatus,
        result_json: Option<Value>,
        error_json: Option<Value>,
    ) -> Result<Lro, StoreError> {
        let mut operations = self.operations.lock().await;
        let lro = operations
            .get_mut(operation_id)
            .ok_or_else(|| StoreError::NotFound {
                operation_id: operation_id.into(),
            })?;

        if lro.status != expected || (expected != new && !expected.can_transition(new)) {
            return Err(StoreError::InvalidTransition {
                operation_id: operation_id.into(),
                from: lro.status,
                to: new,
            });
        }

        if expected == new {
            lro.retry_count += 1;
        } else {
            lro.status = new;
        }
        if let Some(result) = result_json {
            lro.result_json = Some(result);
        }
        if let Some(error) = error_json {
            lro.error_json = Some(error);
        }
        lro.updated_at = Utc::now();
        Ok(lro.clone())
    }
}

/// Registered subscribers, keyed by `(subscriber_id, domain, type)`.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Insert or replace a row; on replacement `created_at` is preserved.
    async fn upsert(&self, sub: Subscription) -> Result<Subscription, StoreError>;

    /// All rows matching `filter`, ordered by `(subscriber_id, domain,
    /// type)`.
    async fn select(&self, filter: &LookupRequest) -> Result<Vec<Subscription>, StoreError>;
}

#[derive(Clone)]
pub struct MemorySubscriptionRepository {
    rows: Arc<RwLock<BTreeMap<(String, String, String), Subscription>>>,
}

impl MemorySubscriptionRepository {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemorySubscriptionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionRepository for MemorySubscriptionRepository {
    async fn upsert(&self, mut sub: Subscription) -> Result<Subscription, StoreError> {
        let mut rows = self.rows.write().await;
        let key = sub.key();
        if let Some(existing) = rows.get(&key) {
            sub.created_at = existing.created_at;
        }
        sub.updated_at = Utc::now();
        rows.insert(key, sub.clone());
        Ok(sub)
    }

    async fn select(&self, filter: &LookupRequest) -> Result<Vec<Subscription>, StoreError> {
        let rows = self.rows.read().await;
        // BTreeMap iteration order is the contract order.
        Ok(rows
            .values()
            .filter(|sub| filter.matches(sub))
            .cloned()
            .collect())
    }
}

/// Adapter exposing the repository as the KeyManager's registry lookup.
#[derive(Clone)]
pub struct LocalLookup {
    repo: Arc<dyn SubscriptionRepository>,
}

impl LocalLookup {
    pub fn new(repo: Arc<dyn SubscriptionRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl onix_keys::RegistryLookup for LocalLookup {
    async fn lookup(
        &self,
        filter: &LookupRequest,
    ) -> Result<Vec<Subscription>, onix_keys::LookupError> {
        self.repo
            .select(filter)
            .await
            .map_err(|err| onix_keys::LookupError::Failed {
                msg: err.to_string(),
            })
    }
}
