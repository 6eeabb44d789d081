/*
 * This file is part of librpc.
 *
 * librpc is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The per-connection event bus (spec.md §4.F): a concurrent queue fed by
//! the frame dispatcher, drained by one dedicated worker that invokes
//! named handlers (in registration order) then the catch-all handler.
//! A poison value shuts the worker down; push order is deliver order.

use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub args: Value,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

struct Shared {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    catch_all: Mutex<Vec<Arc<dyn EventHandler>>>,
}

impl Shared {
    async fn dispatch(&self, event: &Event) {
        let named: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .lock()
            .get(&event.name)
            .cloned()
            .unwrap_or_default();
        for handler in &named {
            handler.handle(event).await;
        }
        let catch_all: Vec<Arc<dyn EventHandler>> = self.catch_all.lock().clone();
        for handler in &catch_all {
            handler.handle(event).await;
        }
    }
}

pub struct EventBus {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Option<Event>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            handlers: Mutex::new(HashMap::new()),
            catch_all: Mutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Event>>();
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(slot) = rx.recv().await {
                match slot {
                    Some(event) => worker_shared.dispatch(&event).await,
                    None => break,
                }
            }
        });
        Self {
            shared,
            queue: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.shared
            .handlers
            .lock()
            .entry(name.into())
            .or_default()
            .push(handler);
    }

    pub fn register_catch_all(&self, handler: Arc<dyn EventHandler>) {
        self.shared.catch_all.lock().push(handler);
    }

    /// Enqueues one event. Never blocks; the worker drains independently.
    pub fn push(&self, event: Event) {
        let _ = self.queue.send(Some(event));
    }

    /// Pushes the poison value and waits for the worker to drain and
    /// exit.
    pub async fn shutdown(&self) {
        let _ = self.queue.send(None);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
