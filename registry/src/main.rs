// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use async_std::sync::Arc;
use futures::future::{self, Either};
use futures::StreamExt;
use registry::admin::AdminService;
use registry::auth::Authenticator;
use registry::configuration::RegistryOptions;
use registry::service::SubscriptionService;
use registry::store::{
    LocalLookup, LroStore, MemoryLroStore, MemorySubscriptionRepository, SubscriptionRepository,
};
use registry::{init_web_server, ShutdownGauge, WebState};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_async_std::Signals;
use structopt::StructOpt;

use onix_core::events::{ChannelPublisher, Publisher};
use onix_keys::{
    ensure_service_keys, FileSecretStore, KeyManager, MemoryCache, MemorySecretStore, SecretStore,
};

/// Run the registry web server over in-memory stores.
#[async_std::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = RegistryOptions::from_args();

    let secrets: Arc<dyn SecretStore> = match &opt.secret_store_path {
        Some(path) => Arc::new(FileSecretStore::new(path.clone())?),
        None => Arc::new(MemorySecretStore::new()),
    };
    let identity = match ensure_service_keys(&*secrets, &opt.registry_id, &opt.registry_key_id)
        .await
    {
        Ok(identity) => identity,
        Err(err) => {
            tracing::error!("cannot provision registry keys: {}", err);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "registry {} key {}: signing {}, encryption {}",
        opt.registry_id,
        opt.registry_key_id,
        identity.signing_public_key,
        identity.encr_public_key
    );

    let repo: Arc<dyn SubscriptionRepository> = Arc::new(MemorySubscriptionRepository::new());
    let lros: Arc<dyn LroStore> = Arc::new(MemoryLroStore::new());
    let publisher: Arc<dyn Publisher> = Arc::new(ChannelPublisher::new());
    let keys = KeyManager::new(
        Arc::new(MemoryCache::new()),
        secrets,
        Arc::new(LocalLookup::new(repo.clone())),
        opt.private_key_ttl(),
        opt.public_key_ttl(),
    );

    let state = WebState {
        service: SubscriptionService::new(lros.clone(), repo.clone(), publisher.clone()),
        admin: AdminService::new(
            lros,
            repo.clone(),
            publisher,
            keys,
            opt.registry_id.clone(),
            opt.registry_key_id.clone(),
            opt.operation_retry_max,
            opt.operation_retry_wait(),
            opt.callback_timeout(),
        ),
        authenticator: Authenticator::new(repo),
        shutdown: ShutdownGauge::new(),
    };

    let addr = format!("{}:{}", opt.host, opt.port);
    tracing::info!("registry listening on {}", addr);
    let server = init_web_server(state.clone(), addr);

    // Run until the listener dies or the first signal starts the drain:
    // new requests are refused while in-flight handlers get a bounded
    // grace period to finish.
    let mut signals = Signals::new([SIGINT, SIGTERM]).unwrap();
    match future::select(server, signals.next()).await {
        Either::Left((result, _)) => result?,
        Either::Right((signal, _)) => {
            if let Some(signal) = signal {
                tracing::info!("received signal {}, draining in-flight requests", signal);
            }
            state.shutdown.begin_drain();
            state.shutdown.drain(opt.shutdown_timeout()).await;
        }
    }

    Ok(())
}
