// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use async_std::sync::Arc;
use async_std::task::sleep;
use futures::future::{self, Either};
use futures::StreamExt;
use gateway::client::RegistryClient;
use gateway::configuration::GatewayOptions;
use gateway::tasks::{drain, spawn_workers};
use gateway::{init_web_server, GatewayState, GatewayStatus};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_async_std::Signals;
use std::time::Duration;
use structopt::StructOpt;

use onix_keys::{
    ensure_service_keys, FileSecretStore, KeyManager, MemoryCache, MemorySecretStore, SecretStore,
};

const REGISTRY_PROBE_RETRIES: usize = 8;

/// Probe the registry with capped exponential backoff. Failure is logged
/// and tolerated; lookups degrade per-task.
async fn wait_for_registry(base_url: &str) {
    let mut backoff = Duration::from_millis(500);
    for _ in 0..REGISTRY_PROBE_RETRIES {
        if surf::connect(base_url).send().await.is_ok() {
            return;
        }
        tracing::warn!("registry not reachable at {}; sleeping {:?}", base_url, backoff);
        sleep(backoff).await;
        backoff *= 2;
    }
    tracing::error!(
        "registry at {} still unreachable; continuing, lookups will fail until it returns",
        base_url
    );
}

#[async_std::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = GatewayOptions::from_args();

    let secrets: Arc<dyn SecretStore> = match &opt.secret_store_path {
        Some(path) => Arc::new(FileSecretStore::new(path.clone())?),
        None => Arc::new(MemorySecretStore::new()),
    };
    let identity = match ensure_service_keys(&*secrets, &opt.subscriber_id, &opt.key_id).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::error!("cannot provision gateway keys: {}", err);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "gateway {} key {}: signing {}",
        opt.subscriber_id,
        opt.key_id,
        identity.signing_public_key
    );

    let registry = RegistryClient::new(opt.registry_url.clone());
    wait_for_registry(registry.base_url()).await;

    let keys = KeyManager::new(
        Arc::new(MemoryCache::new()),
        secrets,
        Arc::new(registry.clone()),
        opt.private_key_ttl(),
        opt.public_key_ttl(),
    );
    let state = GatewayState::new(
        keys,
        Arc::new(registry),
        opt.subscriber_id.clone(),
        opt.key_id.clone(),
        opt.retry_policy(),
        opt.proxy_timeout(),
        opt.proxy_deadline(),
        opt.task_queue_buffer_size,
        opt.max_concurrent_fanout_tasks,
    );

    let addr = format!("{}:{}", opt.host, opt.port);
    tracing::info!("gateway listening on {}", addr);
    let server = init_web_server(state.clone(), addr);

    let workers = spawn_workers(&state, opt.task_queue_workers_count);
    *state.status.write().await = GatewayStatus::Ok;

    // Run until the listener dies or the first signal starts the drain.
    let mut signals = Signals::new([SIGINT, SIGTERM]).unwrap();
    match future::select(server, signals.next()).await {
        Either::Left((result, _)) => result?,
        Either::Right((signal, _)) => {
            if let Some(signal) = signal {
                tracing::info!("received signal {}, draining task queue", signal);
            }
            state.queue.close();
            drain(workers, opt.shutdown_timeout()).await;
        }
    }

    Ok(())
}
