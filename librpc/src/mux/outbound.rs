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

//! The outbound call state machine (spec.md §4.E): `InProgress →
//! MoreAvailable* → Done|Error|Aborted`. Modelled as a future/promise per
//! spec.md §9 — `CallHandle::wait_async` is the future, `wait` is its
//! `block_on`.

use crate::error::{RpcError, RpcErrorKind, RpcResult};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub enum CallStatus {
    InProgress,
    /// `seqno` of the fragment just delivered.
    MoreAvailable { seqno: u64, fragment: Value },
    Done(Value),
    Error(RpcError),
    Aborted,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Done(_) | CallStatus::Error(_) | CallStatus::Aborted)
    }
}

pub(crate) struct OutboundCallState {
    status: Mutex<CallStatus>,
    changed: Notify,
}

/// A handle to one in-flight outbound call. Cloning shares the same
/// underlying state — there is exactly one `OutboundCallState` per call.
#[derive(Clone)]
pub struct CallHandle {
    pub(crate) id: String,
    pub(crate) state: Arc<OutboundCallState>,
}

impl CallHandle {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            state: Arc::new(OutboundCallState {
                status: Mutex::new(CallStatus::InProgress),
                changed: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> CallStatus {
        self.state.status.lock().clone()
    }

    pub(crate) fn transition(&self, status: CallStatus) {
        let mut guard = self.state.status.lock();
        if guard.is_terminal() {
            // Aborting (or anything else arriving after) a terminal call
            // is a no-op, per spec.md §4.E.
            return;
        }
        *guard = status;
        drop(guard);
        self.state.changed.notify_waiters();
    }

    /// Waits until the status differs from `InProgress`/the current
    /// `MoreAvailable` snapshot — i.e. until the next fragment or a
    /// terminal transition.
    pub async fn wait_async(&self) -> CallStatus {
        loop {
            let notified = self.state.changed.notified();
            let snapshot = self.status();
            if snapshot.is_terminal() {
                return snapshot;
            }
            tokio::pin!(notified);
            notified.as_mut().await;
            let next = self.status();
            if next != snapshot {
                return next;
            }
        }
    }

    /// Waits, bounded by `timeout`, transitioning the call to
    /// `Error{Timeout}` itself if the deadline elapses first.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> CallStatus {
        match tokio::time::timeout(timeout, self.wait_async()).await {
            Ok(status) => status,
            Err(_) => {
                let err = RpcError::timeout(format!("call {} exceeded its deadline", self.id));
                self.transition(CallStatus::Error(err.clone()));
                CallStatus::Error(err)
            }
        }
    }

    /// Blocking wait, for callers that cannot be `async`. Requires a
    /// Tokio runtime to already be running on the current thread.
    pub fn wait(&self) -> CallStatus {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.wait_async()))
    }

    /// Marks the call `Aborted` locally; sending `rpc/abort` to the peer
    /// is the caller's (the connection's) responsibility.
    pub fn abort_locally(&self) {
        self.transition(CallStatus::Aborted);
    }

    pub fn last_error_kind(&self) -> Option<RpcErrorKind> {
        match self.status() {
            CallStatus::Error(e) => Some(e.kind),
            _ => None,
        }
    }
}
