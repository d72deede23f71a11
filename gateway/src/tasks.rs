// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The gateway's task engine: a single bounded FIFO carries lookup and
//! proxy tasks to a fixed worker pool. Intake enqueues non-blocking and
//! surfaces a full buffer as explicit backpressure; fan-out producers hold
//! a permit from the [`FanoutGate`] and block instead.

use crate::{lookup, proxy, GatewayError, GatewayState};
use async_channel::TrySendError;
use async_std::task::{spawn, JoinHandle};
use futures::future::join_all;
use onix_core::context::TxnContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Lookup,
    Proxy,
}

/// A unit of asynchronous work: the frozen copy of an inbound transaction,
/// plus the destination once one is bound.
#[derive(Clone, Debug)]
pub struct AsyncTask {
    pub id: String,
    pub kind: TaskKind,
    pub target: Option<String>,
    pub context: TxnContext,
    pub body: Value,
    pub headers: Vec<(String, String)>,
    pub attempt: u32,
}

impl AsyncTask {
    pub fn lookup(context: TxnContext, body: Value, headers: Vec<(String, String)>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Lookup,
            target: None,
            context,
            body,
            headers,
            attempt: 0,
        }
    }

    /// Derive one proxy task from a lookup task, with its own identity and
    /// a deep copy of the (possibly rewritten) body.
    pub fn proxy(parent: &AsyncTask, target: String, context: TxnContext, body: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Proxy,
            target: Some(target),
            context,
            body,
            headers: parent.headers.clone(),
            attempt: 0,
        }
    }
}

/// Bounded MPMC channel of tasks, shared by intake and workers.
#[derive(Clone)]
pub struct TaskQueue {
    sender: async_channel::Sender<AsyncTask>,
    receiver: async_channel::Receiver<AsyncTask>,
}

impl TaskQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(capacity);
        Self { sender, receiver }
    }

    /// Non-blocking enqueue for the intake path. A full buffer is rejected
    /// rather than buffered off-host.
    pub fn enqueue(&self, task: AsyncTask) -> Result<(), GatewayError> {
        self.sender.try_send(task).map_err(|err| match err {
            TrySendError::Full(_) => GatewayError::QueueingFailed,
            TrySendError::Closed(_) => GatewayError::Unavailable,
        })
    }

    /// Blocking enqueue for fan-out producers already holding a permit.
    pub async fn enqueue_blocking(&self, task: AsyncTask) -> Result<(), GatewayError> {
        self.sender
            .send(task)
            .await
            .map_err(|_| GatewayError::Unavailable)
    }

    pub async fn pop(&self) -> Option<AsyncTask> {
        self.receiver.recv().await.ok()
    }

    /// Close intake; workers drain what is already buffered.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Permit gate bounding proxy tasks in flight. A bounded channel holds the
/// permits: acquiring sends into it (blocking at capacity), releasing
/// receives one back. `release` must only be called by a holder.
#[derive(Clone)]
pub struct FanoutGate {
    permits: async_channel::Sender<()>,
    releases: async_channel::Receiver<()>,
}

impl FanoutGate {
    pub fn new(capacity: usize) -> Self {
        let (permits, releases) = async_channel::bounded(capacity);
        Self { permits, releases }
    }

    pub async fn acquire(&self) {
        // Only fails when the gate itself is dropped.
        let _ = self.permits.send(()).await;
    }

    pub async fn release(&self) {
        let _ = self.releases.recv().await;
    }

    pub fn in_flight(&self) -> usize {
        self.permits.len()
    }
}

/// One worker: dequeue and dispatch by kind until the queue closes.
pub async fn worker(id: usize, state: GatewayState) {
    while let Some(task) = state.queue.pop().await {
        match task.kind {
            TaskKind::Lookup => match lookup::process(&state, &task).await {
                Ok(produced) => {
                    tracing::info!("worker {}: task {} fanned out to {} providers", id, task.id, produced)
                }
                Err(err) => {
                    tracing::error!("worker {}: lookup task {} failed: {}", id, task.id, err)
                }
            },
            TaskKind::Proxy => {
                proxy::process(&state, &task).await;
                state.gate.release().await;
            }
        }
    }
    tracing::warn!("worker {}: exiting, task queue closed", id);
}

pub fn spawn_workers(state: &GatewayState, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| spawn(worker(id, state.clone())))
        .collect()
}

/// Give workers a bounded grace period to finish buffered tasks; after the
/// deadline in-flight work is abandoned.
pub async fn drain(workers: Vec<JoinHandle<()>>, grace: Duration) {
    if async_std::future::timeout(grace, join_all(workers))
        .await
        .is_err()
    {
        tracing::warn!("workers did not drain within {:?}; abandoning in-flight tasks", grace);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn task(n: usize) -> AsyncTask {
        AsyncTask::lookup(
            TxnContext::default(),
            json!({ "n": n }),
            vec![("x-request-id".into(), n.to_string())],
        )
    }

    #[async_std::test]
    async fn full_queue_rejects_without_discarding() {
        let queue = TaskQueue::bounded(2);
        queue.enqueue(task(1)).unwrap();
        queue.enqueue(task(2)).unwrap();

        assert!(matches!(
            queue.enqueue(task(3)),
            Err(GatewayError::QueueingFailed)
        ));

        // The two buffered tasks are intact, in order.
        assert_eq!(queue.pop().await.unwrap().body["n"], 1);
        assert_eq!(queue.pop().await.unwrap().body["n"], 2);
        // And the queue accepts again once drained.
        queue.enqueue(task(4)).unwrap();
    }

    #[async_std::test]
    async fn closed_queue_stops_accepting_and_drains() {
        let queue = TaskQueue::bounded(4);
        queue.enqueue(task(1)).unwrap();
        queue.close();

        assert!(matches!(
            queue.enqueue(task(2)),
            Err(GatewayError::Unavailable)
        ));
        // Buffered work is still delivered, then the queue ends.
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[async_std::test]
    async fn gate_blocks_at_capacity() {
        let gate = FanoutGate::new(2);
        gate.acquire().await;
        gate.acquire().await;
        assert_eq!(gate.in_flight(), 2);

        // A third producer blocks until someone releases.
        let contender = {
            let gate = gate.clone();
            async_std::task::spawn(async move {
                gate.acquire().await;
            })
        };
        async_std::task::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.in_flight(), 2);

        gate.release().await;
        contender.await;
        assert_eq!(gate.in_flight(), 2);
    }

    #[test]
    fn proxy_tasks_get_fresh_identities() {
        let parent = task(1);
        let child = AsyncTask::proxy(
            &parent,
            "https://bpp.x".into(),
            parent.context.clone(),
            parent.body.clone(),
        );
        assert_ne!(child.id, parent.id);
        assert_eq!(child.kind, TaskKind::Proxy);
        assert_eq!(child.headers, parent.headers);
        assert_eq!(child.target.as_deref(), Some("https://bpp.x"));
    }
}
