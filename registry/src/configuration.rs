// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ONIX Registry",
    about = "Maintains the subscriber registry and drives subscription approvals"
)]
pub struct RegistryOptions {
    /// Binding host for the registry service.
    #[structopt(long, env = "ONIX_REGISTRY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Binding port for the registry service.
    #[structopt(long, env = "ONIX_REGISTRY_PORT", default_value = "50071")]
    pub port: u16,

    /// The registry's own subscriber identity.
    #[structopt(long, env = "ONIX_REGISTRY_ID", default_value = "registry.onix")]
    pub registry_id: String,

    /// Key id of the registry's own keypairs.
    #[structopt(long, env = "ONIX_REGISTRY_KEY_ID", default_value = "k1")]
    pub registry_key_id: String,

    /// Directory for the file-backed secret store. When absent, secrets
    /// live in memory and are regenerated on every start.
    #[structopt(long, env = "ONIX_REGISTRY_SECRET_STORE_PATH")]
    pub secret_store_path: Option<PathBuf>,

    /// Cache TTL for private key material, in seconds. Kept short: private
    /// keys rarely rotate, but their exposure window must be small.
    #[structopt(long, env = "ONIX_PRIVATE_KEYS_SECONDS", default_value = "15")]
    pub private_keys_seconds: u64,

    /// Cache TTL for peer public keys, in seconds.
    #[structopt(long, env = "ONIX_PUBLIC_KEYS_SECONDS", default_value = "3600")]
    pub public_keys_seconds: u64,

    /// Maximum onboarding attempts per approve action.
    #[structopt(long, env = "ONIX_OPERATION_RETRY_MAX", default_value = "3")]
    pub operation_retry_max: u32,

    /// Pause between onboarding attempts, in milliseconds.
    #[structopt(long, env = "ONIX_OPERATION_RETRY_WAIT_MS", default_value = "500")]
    pub operation_retry_wait_ms: u64,

    /// Timeout for the `on_subscribe` callback POST, in milliseconds;
    /// bounded independently of the admin request handling it.
    #[structopt(long, env = "ONIX_CALLBACK_TIMEOUT_MS", default_value = "5000")]
    pub callback_timeout_ms: u64,

    /// Grace period for in-flight requests to finish on shutdown, in
    /// milliseconds.
    #[structopt(long, env = "ONIX_SHUTDOWN_TIMEOUT_MS", default_value = "5000")]
    pub shutdown_timeout_ms: u64,
}

impl RegistryOptions {
    pub fn private_key_ttl(&self) -> Duration {
        Duration::from_secs(self.private_keys_seconds)
    }

    pub fn public_key_ttl(&self) -> Duration {
        Duration::from_secs(self.public_keys_seconds)
    }

    pub fn operation_retry_wait(&self) -> Duration {
        Duration::from_millis(self.operation_retry_wait_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
