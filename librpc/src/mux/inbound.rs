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

//! The inbound (server-side) half of one call: what a server handler is
//! given to drive a response, fragments, or an error back to the caller.
//!
//! `on_rpc_abort` is empty in the C original (spec.md §9 open question);
//! here a peer `rpc/abort` marks the inbound call aborted, notifies a
//! cancellation token the handler may poll or `select!` against, and any
//! further `send_*` call on it becomes a no-op.

use crate::error::{RpcError, RpcResult};
use crate::frame::Frame;
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Frame) -> RpcResult<()>;
}

pub struct InboundCall {
    id: String,
    namespace_reply: &'static str,
    method: String,
    args: Value,
    sink: Arc<dyn FrameSink>,
    consumer_seqno: AtomicU64,
    done: AtomicBool,
    aborted: Arc<Notify>,
    aborted_flag: Arc<Mutex<bool>>,
}

impl InboundCall {
    /// Public so a `ServerHandler` implementation can be exercised in
    /// isolation, against a test double `FrameSink`, without a live
    /// `Connection`.
    pub fn new(id: String, method: String, args: Value, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            id,
            namespace_reply: "rpc",
            method,
            args,
            sink,
            consumer_seqno: AtomicU64::new(0),
            done: AtomicBool::new(false),
            aborted: Arc::new(Notify::new()),
            aborted_flag: Arc::new(Mutex::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// The last `continue` seqno acknowledged by the peer, for a handler
    /// that wants to backpressure a fragment producer.
    pub fn consumer_seqno(&self) -> u64 {
        self.consumer_seqno.load(Ordering::Acquire)
    }

    pub(crate) fn record_continue(&self, seqno: u64) {
        self.consumer_seqno.store(seqno, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        *self.aborted_flag.lock()
    }

    pub(crate) fn mark_aborted(&self) {
        *self.aborted_flag.lock() = true;
        self.aborted.notify_waiters();
    }

    /// Resolves once the peer sends `rpc/abort` for this call. A handler
    /// doing long-running work should `select!` against this.
    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        self.aborted.notified().await;
    }

    fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub async fn send_response(&self, result: Value) -> RpcResult<()> {
        if self.is_aborted() || !self.mark_done() {
            return Ok(());
        }
        self.sink
            .send_frame(Frame {
                namespace: self.namespace_reply.to_string(),
                name: "response".to_string(),
                id: self.id.clone(),
                args: result,
            })
            .await
    }

    pub async fn send_fragment(&self, seqno: u64, fragment: Value) -> RpcResult<()> {
        if self.is_aborted() {
            return Ok(());
        }
        let payload = Value::empty_dictionary();
        payload.dict_set("seqno", Value::uint64(seqno));
        payload.dict_set("fragment", fragment);
        self.sink
            .send_frame(Frame {
                namespace: self.namespace_reply.to_string(),
                name: "fragment".to_string(),
                id: self.id.clone(),
                args: payload,
            })
            .await
    }

    pub async fn send_end(&self, seqno: i64) -> RpcResult<()> {
        if self.is_aborted() || !self.mark_done() {
            return Ok(());
        }
        let payload = Value::empty_dictionary();
        payload.dict_set("seqno", Value::int64(seqno));
        self.sink
            .send_frame(Frame {
                namespace: self.namespace_reply.to_string(),
                name: "end".to_string(),
                id: self.id.clone(),
                args: payload,
            })
            .await
    }

    pub async fn send_error(&self, err: RpcError) -> RpcResult<()> {
        if self.is_aborted() || !self.mark_done() {
            return Ok(());
        }
        let payload = Value::empty_dictionary();
        payload.dict_set("code", Value::int64(err.kind.code()));
        payload.dict_set("message", Value::string(err.message));
        self.sink
            .send_frame(Frame {
                namespace: self.namespace_reply.to_string(),
                name: "error".to_string(),
                id: self.id.clone(),
                args: payload,
            })
            .await
    }
}

#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Dispatches one inbound `rpc/call`. The handler drives the call to
    /// completion with `send_response`/`send_fragment`+`send_end`/
    /// `send_error`; the multiplexer does not do this on its behalf.
    async fn handle_call(&self, call: Arc<InboundCall>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: Frame) -> RpcResult<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_response_is_idempotent_after_first_terminal() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let call = InboundCall::new("id-1".to_string(), "hello".to_string(), Value::null(), sink.clone());
        call.send_response(Value::int64(1)).await.unwrap();
        call.send_response(Value::int64(2)).await.unwrap();
        assert_eq!(sink.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn abort_silences_further_sends() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let call = Arc::new(InboundCall::new(
            "id-2".to_string(),
            "hello".to_string(),
            Value::null(),
            sink.clone(),
        ));
        let waiter = call.clone();
        let woke = Arc::new(AtomicUsize::new(0));
        let woke2 = woke.clone();
        let task = tokio::spawn(async move {
            waiter.aborted().await;
            woke2.fetch_add(1, Ordering::SeqCst);
        });
        call.mark_aborted();
        task.await.unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        call.send_response(Value::int64(1)).await.unwrap();
        assert!(sink.frames.lock().is_empty());
    }
}
