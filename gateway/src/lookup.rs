// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! First stage of the fan-out: resolve the candidate providers for an
//! inbound transaction and derive one proxy task per candidate. Each proxy
//! task is enqueued under a fan-out permit, so one oversized lookup cannot
//! drain the whole buffer; producers block rather than drop.

use crate::tasks::AsyncTask;
use crate::{GatewayError, GatewayState};
use onix_core::context::TxnContext;
use onix_core::model::{LookupRequest, SubscriberRole, Subscription, SubscriptionStatus};
use serde_json::{json, Value};

/// Process one lookup task; returns the number of proxy tasks produced.
pub async fn process(state: &GatewayState, task: &AsyncTask) -> Result<usize, GatewayError> {
    let context = &task.context;

    // A bound destination skips the registry entirely.
    if context.is_bound() {
        let target = context
            .bpp_uri
            .clone()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| GatewayError::Lookup {
                msg: format!("task {}: context.bpp_id is set without bpp_uri", task.id),
            })?;
        let proxy = AsyncTask::proxy(task, target, context.clone(), task.body.clone());
        enqueue_gated(state, proxy).await?;
        return Ok(1);
    }

    let filter = LookupRequest {
        domain: context.domain.clone(),
        role: Some(SubscriberRole::Bpp),
        status: Some(SubscriptionStatus::Subscribed),
        city: context.city().map(str::to_string),
        country: context.country().map(str::to_string),
        ..LookupRequest::default()
    };
    let candidates = state
        .registry
        .lookup(&filter)
        .await
        .map_err(|err| GatewayError::Lookup {
            msg: err.to_string(),
        })?;
    if candidates.is_empty() {
        tracing::info!(
            "task {}: no subscribed providers for domain {:?}",
            task.id,
            context.domain
        );
        return Ok(0);
    }

    let mut produced = 0;
    for candidate in candidates {
        let proxy = bind_candidate(task, &candidate);
        enqueue_gated(state, proxy).await?;
        produced += 1;
    }
    Ok(produced)
}

/// Deep-copy the inbound transaction and bind it to one provider.
fn bind_candidate(task: &AsyncTask, candidate: &Subscription) -> AsyncTask {
    let mut body = task.body.clone();
    if let Some(context_obj) = body.get_mut("context").and_then(Value::as_object_mut) {
        context_obj.insert("bpp_id".into(), json!(candidate.subscriber_id));
        context_obj.insert("bpp_uri".into(), json!(candidate.url));
    }
    let mut context = task.context.clone();
    context.bpp_id = Some(candidate.subscriber_id.clone());
    context.bpp_uri = Some(candidate.url.clone());
    AsyncTask::proxy(task, candidate.url.clone(), context, body)
}

async fn enqueue_gated(state: &GatewayState, proxy: AsyncTask) -> Result<(), GatewayError> {
    state.gate.acquire().await;
    if let Err(err) = state.queue.enqueue_blocking(proxy).await {
        state.gate.release().await;
        return Err(err);
    }
    Ok(())
}
