// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ONIX Gateway",
    about = "Validates Beckn transactions and multicasts them to matched providers"
)]
pub struct GatewayOptions {
    /// Binding host for the gateway service.
    #[structopt(long, env = "ONIX_GATEWAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Binding port for the gateway service.
    #[structopt(long, env = "ONIX_GATEWAY_PORT", default_value = "50072")]
    pub port: u16,

    /// Base URL of the registry.
    #[structopt(
        long,
        env = "ONIX_REGISTRY_URL",
        default_value = "http://localhost:50071"
    )]
    pub registry_url: String,

    /// The gateway's own subscriber identity, used to sign proxied
    /// requests.
    #[structopt(long, env = "ONIX_GATEWAY_ID", default_value = "gateway.onix")]
    pub subscriber_id: String,

    /// Key id of the gateway's signing keypair.
    #[structopt(long, env = "ONIX_GATEWAY_KEY_ID", default_value = "k1")]
    pub key_id: String,

    /// Directory for the file-backed secret store. When absent, secrets
    /// live in memory and are regenerated on every start.
    #[structopt(long, env = "ONIX_GATEWAY_SECRET_STORE_PATH")]
    pub secret_store_path: Option<PathBuf>,

    /// Cache TTL for private key material, in seconds.
    #[structopt(long, env = "ONIX_PRIVATE_KEYS_SECONDS", default_value = "15")]
    pub private_keys_seconds: u64,

    /// Cache TTL for peer public keys, in seconds.
    #[structopt(long, env = "ONIX_PUBLIC_KEYS_SECONDS", default_value = "3600")]
    pub public_keys_seconds: u64,

    /// Maximum dispatch attempts per proxy task.
    #[structopt(long, env = "ONIX_RETRY_MAX", default_value = "3")]
    pub retry_max: u32,

    /// Initial backoff between proxy attempts, in milliseconds.
    #[structopt(long, env = "ONIX_RETRY_WAIT_MIN_MS", default_value = "250")]
    pub retry_wait_min_ms: u64,

    /// Backoff ceiling, in milliseconds.
    #[structopt(long, env = "ONIX_RETRY_WAIT_MAX_MS", default_value = "4000")]
    pub retry_wait_max_ms: u64,

    /// Per-attempt timeout for proxied requests, in milliseconds.
    #[structopt(long, env = "ONIX_PROXY_TIMEOUT_MS", default_value = "10000")]
    pub proxy_timeout_ms: u64,

    /// Total deadline across all attempts of one proxy task, in
    /// milliseconds.
    #[structopt(long, env = "ONIX_PROXY_DEADLINE_MS", default_value = "30000")]
    pub proxy_deadline_ms: u64,

    /// Capacity of the task queue; a full queue rejects intake with
    /// QUEUEING_FAILED.
    #[structopt(long, env = "ONIX_TASK_QUEUE_BUFFER_SIZE", default_value = "512")]
    pub task_queue_buffer_size: usize,

    /// Number of worker tasks draining the queue.
    #[structopt(long, env = "ONIX_TASK_QUEUE_WORKERS_COUNT", default_value = "8")]
    pub task_queue_workers_count: usize,

    /// Ceiling on proxy tasks in flight; fan-out producers block at the
    /// limit.
    #[structopt(long, env = "ONIX_MAX_CONCURRENT_FANOUT_TASKS", default_value = "64")]
    pub max_concurrent_fanout_tasks: usize,

    /// Grace period for workers to drain on shutdown, in milliseconds.
    #[structopt(long, env = "ONIX_SHUTDOWN_TIMEOUT_MS", default_value = "5000")]
    pub shutdown_timeout_ms: u64,
}

impl GatewayOptions {
    pub fn private_key_ttl(&self) -> Duration {
        Duration::from_secs(self.private_keys_seconds)
    }

    pub fn public_key_ttl(&self) -> Duration {
        Duration::from_secs(self.public_keys_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max: self.retry_max,
            wait_min: Duration::from_millis(self.retry_wait_min_ms),
            wait_max: Duration::from_millis(self.retry_wait_max_ms),
        }
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn proxy_deadline(&self) -> Duration {
        Duration::from_millis(self.proxy_deadline_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
