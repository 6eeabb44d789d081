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

//! The call multiplexer (spec.md §4.E): a `Connection` owns one
//! transport channel, a codec, the outbound- and inbound-call tables,
//! the subscription refcount maps and the event bus, and drives the
//! `(namespace, name)` dispatch table from its reader task.
//!
//! Lock order, where more than one table is touched by an operation:
//! call-table, then per-call — never the reverse (spec.md §5).

pub mod inbound;
pub mod outbound;

pub use inbound::{FrameSink, InboundCall, ServerHandler};
pub use outbound::{CallHandle, CallStatus};

use crate::codec::{self, Serializer};
use crate::error::{RpcError, RpcResult};
use crate::events::{Event, EventBus, EventHandler};
use crate::frame::{self, Frame};
use crate::transport::{self, Inbound, TransportChannel};
use crate::value::{Value, ValueKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Connection {
    channel: Box<dyn TransportChannel>,
    codec: Arc<dyn Serializer>,
    default_timeout: Duration,
    outbound: Mutex<HashMap<String, CallHandle>>,
    inbound: Mutex<HashMap<String, Arc<InboundCall>>>,
    /// Names *we* have asked the peer to notify us about.
    my_subscriptions: Mutex<HashMap<String, usize>>,
    /// Names the peer has asked *us* to notify them about, gating
    /// `emit_event`.
    peer_subscriptions: Mutex<HashMap<String, usize>>,
    send_mutex: tokio::sync::Mutex<()>,
    server: RwLock<Option<Arc<dyn ServerHandler>>>,
    events: EventBus,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Set once, right after construction, so methods taking `&self` can
    /// still hand a `'static` handle to a spawned task (the timeout
    /// watchdog in [`Connection::call`]) without widening their receiver.
    self_weak: Mutex<Option<Weak<Connection>>>,
}

impl Connection {
    /// Connects (or rendezvous-accepts, for `loopback`) over `uri` using
    /// `codec_name` to encode/decode frames, and starts the reader task.
    pub async fn connect(uri: &str, codec_name: &str) -> RpcResult<Arc<Self>> {
        Self::connect_with_timeout(uri, codec_name, DEFAULT_TIMEOUT).await
    }

    /// As [`Connection::connect`], but with a non-default call timeout —
    /// spec.md §8 scenario 3 calls for the 60s default to be
    /// test-overridable.
    pub async fn connect_with_timeout(uri: &str, codec_name: &str, timeout: Duration) -> RpcResult<Arc<Self>> {
        let channel = transport::REGISTRY.connect(uri).await?;
        let codec = codec::REGISTRY.get(codec_name)?;
        Ok(Self::from_parts(channel, codec, timeout))
    }

    fn from_parts(channel: Box<dyn TransportChannel>, codec: Arc<dyn Serializer>, timeout: Duration) -> Arc<Self> {
        let conn = Arc::new(Self {
            channel,
            codec,
            default_timeout: timeout,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            my_subscriptions: Mutex::new(HashMap::new()),
            peer_subscriptions: Mutex::new(HashMap::new()),
            send_mutex: tokio::sync::Mutex::new(()),
            server: RwLock::new(None),
            events: EventBus::new(),
            reader: Mutex::new(None),
            self_weak: Mutex::new(None),
        });
        *conn.self_weak.lock() = Some(Arc::downgrade(&conn));
        conn.clone().spawn_reader();
        conn
    }

    fn spawn_reader(self: Arc<Self>) {
        let handle = tokio::spawn(async move {
            loop {
                match self.channel.recv().await {
                    Ok(Some(inbound)) => self.clone().handle_inbound_bytes(inbound).await,
                    Ok(None) => {
                        self.on_disconnect().await;
                        break;
                    }
                    Err(e) => {
                        log::error!("transport recv failed: {e}");
                        self.on_disconnect().await;
                        break;
                    }
                }
            }
        });
        *self.reader.lock() = Some(handle);
    }

    async fn handle_inbound_bytes(self: Arc<Self>, inbound: Inbound) {
        let envelope = match self.codec.deserialize(&inbound.bytes) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("dropping frame: codec error: {e}");
                return;
            }
        };
        let id_for_error = match envelope.dict_get("id") {
            Some(v) => match v.kind() {
                ValueKind::String(s) => Some(s.to_string()),
                _ => None,
            },
            None => None,
        };
        match frame::unwrap(&envelope, &inbound.fds) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => {
                log::warn!("malformed frame: {e}");
                if let Some(id) = id_for_error {
                    let _ = self.send_frame(error_frame(id, &e)).await;
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, frame: Frame) {
        match (frame.namespace.as_str(), frame.name.as_str()) {
            ("rpc", "call") => self.on_rpc_call(frame).await,
            ("rpc", "response") => self.on_rpc_response(frame),
            ("rpc", "fragment") => self.on_rpc_fragment(frame),
            ("rpc", "continue") => self.on_rpc_continue(frame),
            ("rpc", "end") => self.on_rpc_end(frame),
            ("rpc", "abort") => self.on_rpc_abort(frame),
            ("rpc", "error") => self.on_rpc_error(frame),
            ("events", "event") => self.on_events_event(frame),
            ("events", "event_burst") => self.on_events_event_burst(frame),
            ("events", "subscribe") => self.on_events_subscribe(frame),
            ("events", "unsubscribe") => self.on_events_unsubscribe(frame),
            (ns, name) => {
                log::warn!("unknown (namespace, name) = ({ns}, {name})");
                let _ = self
                    .send_frame(error_frame(
                        frame.id,
                        &RpcError::not_found(format!("no handler for {ns}/{name}")),
                    ))
                    .await;
            }
        }
    }

    async fn on_rpc_call(self: Arc<Self>, frame: Frame) {
        let method = frame.args.dict_get("method").and_then(|v| match v.kind() {
            ValueKind::String(s) => Some(s.to_string()),
            _ => None,
        });
        let args = frame.args.dict_get("args").unwrap_or_else(Value::null);
        let method = match method {
            Some(m) => m,
            None => {
                let _ = self
                    .send_frame(error_frame(frame.id, &RpcError::invalid_argument("rpc/call missing `method`")))
                    .await;
                return;
            }
        };
        let server = self.server.read().clone();
        let server = match server {
            Some(s) => s,
            None => {
                let _ = self
                    .send_frame(error_frame(frame.id, &RpcError::not_found("no server handler registered")))
                    .await;
                return;
            }
        };
        let sink: Arc<dyn FrameSink> = self.clone();
        let call = Arc::new(InboundCall::new(frame.id.clone(), method, args, sink));
        self.inbound.lock().insert(frame.id.clone(), call.clone());
        let conn = self.clone();
        let id = frame.id;
        tokio::spawn(async move {
            server.handle_call(call).await;
            conn.inbound.lock().remove(&id);
        });
    }

    fn on_rpc_response(&self, frame: Frame) {
        if let Some(call) = self.outbound.lock().remove(&frame.id) {
            call.transition(CallStatus::Done(frame.args));
        }
    }

    fn on_rpc_fragment(&self, frame: Frame) {
        let outbound = self.outbound.lock();
        if let Some(call) = outbound.get(&frame.id) {
            let seqno = match frame.args.dict_get("seqno").map(|v| v.kind().clone()) {
                Some(ValueKind::UInt64(n)) => n,
                _ => return,
            };
            let fragment = frame.args.dict_get("fragment").unwrap_or_else(Value::null);
            call.transition(CallStatus::MoreAvailable { seqno, fragment });
        }
    }

    fn on_rpc_continue(&self, frame: Frame) {
        if let Some(call) = self.inbound.lock().get(&frame.id) {
            if let ValueKind::Int64(seqno) = frame.args.kind() {
                call.record_continue((*seqno).max(0) as u64);
            }
        }
    }

    fn on_rpc_end(&self, frame: Frame) {
        if let Some(call) = self.outbound.lock().remove(&frame.id) {
            call.transition(CallStatus::Done(Value::null()));
        }
    }

    fn on_rpc_abort(&self, frame: Frame) {
        if let Some(call) = self.outbound.lock().remove(&frame.id) {
            call.transition(CallStatus::Aborted);
        }
        if let Some(call) = self.inbound.lock().get(&frame.id) {
            call.mark_aborted();
        }
    }

    fn on_rpc_error(&self, frame: Frame) {
        if let Some(call) = self.outbound.lock().remove(&frame.id) {
            let code = match frame.args.dict_get("code").map(|v| v.kind().clone()) {
                Some(ValueKind::Int64(c)) => c,
                _ => crate::error::RpcErrorKind::Internal.code(),
            };
            let message = match frame.args.dict_get("message") {
                Some(v) => match v.kind() {
                    ValueKind::String(s) => s.to_string(),
                    _ => String::new(),
                },
                None => String::new(),
            };
            call.transition(CallStatus::Error(RpcError::new(
                crate::error::RpcErrorKind::from_code(code),
                message,
            )));
        }
    }

    fn on_events_event(&self, frame: Frame) {
        if let (Some(name), args) = (
            frame.args.dict_get("name").and_then(|v| match v.kind() {
                ValueKind::String(s) => Some(s.to_string()),
                _ => None,
            }),
            frame.args.dict_get("args").unwrap_or_else(Value::null),
        ) {
            self.events.push(Event { name, args });
        }
    }

    fn on_events_event_burst(&self, frame: Frame) {
        frame.args.array_apply(|_, item| {
            if let (Some(name), args) = (
                item.dict_get("name").and_then(|v| match v.kind() {
                    ValueKind::String(s) => Some(s.to_string()),
                    _ => None,
                }),
                item.dict_get("args").unwrap_or_else(Value::null),
            ) {
                self.events.push(Event { name, args });
            }
            true
        });
    }

    fn on_events_subscribe(&self, frame: Frame) {
        let mut subs = self.peer_subscriptions.lock();
        frame.args.array_apply(|_, item| {
            if let ValueKind::String(name) = item.kind() {
                *subs.entry(name.to_string()).or_insert(0) += 1;
            }
            true
        });
    }

    fn on_events_unsubscribe(&self, frame: Frame) {
        let mut subs = self.peer_subscriptions.lock();
        frame.args.array_apply(|_, item| {
            if let ValueKind::String(name) = item.kind() {
                if let Some(count) = subs.get_mut(name.as_ref()) {
                    *count = count.saturating_sub(1);
                }
            }
            true
        });
    }

    async fn on_disconnect(&self) {
        let pending: Vec<CallHandle> = self.outbound.lock().drain().map(|(_, c)| c).collect();
        for call in pending {
            call.transition(CallStatus::Error(RpcError::disconnected("transport closed with calls pending")));
        }
        self.events.shutdown().await;
    }

    pub fn set_server_handler(&self, handler: Arc<dyn ServerHandler>) {
        *self.server.write() = Some(handler);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register_event_handler(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.events.register(name, handler);
    }

    /// Number of outbound calls still awaiting a terminal frame from the
    /// peer. Exposed for tests asserting the outbound table doesn't leak.
    pub fn pending_call_count(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Issues an outbound call. `id` is a fresh UUIDv4, unique only
    /// within this connection's outbound table (spec.md §4.E).
    pub async fn call(&self, method: impl Into<String>, args: Value) -> RpcResult<CallHandle> {
        let id = Uuid::new_v4().to_string();
        let call = CallHandle::new(id.clone());
        self.outbound.lock().insert(id.clone(), call.clone());
        let payload = Value::empty_dictionary();
        payload.dict_set("method", Value::string(method.into()));
        payload.dict_set("args", args);
        if let Err(e) = self
            .send_frame(Frame {
                namespace: "rpc".to_string(),
                name: "call".to_string(),
                id: id.clone(),
                args: payload,
            })
            .await
        {
            // Per spec.md §7: send errors surface synchronously and do
            // not change the call's state once inserted — but this call
            // was never actually sent, so withdraw it from the table.
            self.outbound.lock().remove(&id);
            return Err(e);
        }
        let timeout = self.default_timeout;
        let timer_call = call.clone();
        let weak = self.self_weak.lock().clone();
        let timeout_id = id.clone();
        tokio::spawn(async move {
            let status = timer_call.wait_with_timeout(timeout).await;
            // Every other terminal path evicts `id` from `outbound` itself
            // (on_rpc_response/_end/_abort/_error); a call that times out
            // and whose peer never sends anything further would otherwise
            // sit in the table forever.
            if matches!(status, CallStatus::Error(ref e) if e.kind == crate::error::RpcErrorKind::Timeout) {
                if let Some(conn) = weak.and_then(|w| w.upgrade()) {
                    conn.outbound.lock().remove(&timeout_id);
                }
            }
        });
        Ok(call)
    }

    /// Sends `continue(seqno, sync=true)`: acknowledges the fragment and
    /// blocks until the next one (or a terminal transition) arrives.
    pub async fn continue_sync(&self, call: &CallHandle, next_seqno: i64) -> RpcResult<CallStatus> {
        self.send_frame(Frame {
            namespace: "rpc".to_string(),
            name: "continue".to_string(),
            id: call.id().to_string(),
            args: Value::int64(next_seqno),
        })
        .await?;
        Ok(call.wait_async().await)
    }

    pub async fn abort(&self, call: &CallHandle) -> RpcResult<()> {
        call.abort_locally();
        self.send_frame(Frame {
            namespace: "rpc".to_string(),
            name: "abort".to_string(),
            id: call.id().to_string(),
            args: Value::null(),
        })
        .await
    }

    /// Subscribes to `names`; a wire `events/subscribe` is only emitted
    /// for names whose refcount transitions 0→1.
    pub async fn subscribe(&self, names: &[&str]) -> RpcResult<()> {
        self.edit_subscriptions(names, true).await
    }

    pub async fn unsubscribe(&self, names: &[&str]) -> RpcResult<()> {
        self.edit_subscriptions(names, false).await
    }

    async fn edit_subscriptions(&self, names: &[&str], subscribing: bool) -> RpcResult<()> {
        let mut crossing = Vec::new();
        {
            let mut subs = self.my_subscriptions.lock();
            for name in names {
                let count = subs.entry(name.to_string()).or_insert(0);
                if subscribing {
                    *count += 1;
                    if *count == 1 {
                        crossing.push(name.to_string());
                    }
                } else if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        crossing.push(name.to_string());
                    }
                }
            }
        }
        if crossing.is_empty() {
            return Ok(());
        }
        let args = Value::array(crossing.into_iter().map(Value::string).collect());
        self.send_frame(Frame {
            namespace: "events".to_string(),
            name: if subscribing { "subscribe" } else { "unsubscribe" }.to_string(),
            id: Uuid::new_v4().to_string(),
            args,
        })
        .await
    }

    /// Emits `name` to the peer, but only if the peer has subscribed
    /// (refcount > 0).
    pub async fn emit_event(&self, name: &str, args: Value) -> RpcResult<()> {
        let interested = self
            .peer_subscriptions
            .lock()
            .get(name)
            .copied()
            .unwrap_or(0)
            > 0;
        if !interested {
            return Ok(());
        }
        let payload = Value::empty_dictionary();
        payload.dict_set("name", Value::string(name.to_string()));
        payload.dict_set("args", args);
        self.send_frame(Frame {
            namespace: "events".to_string(),
            name: "event".to_string(),
            id: Uuid::new_v4().to_string(),
            args: payload,
        })
        .await
    }

    pub async fn shutdown(&self) {
        self.channel.abort();
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.await;
        }
    }
}

fn error_frame(id: String, err: &RpcError) -> Frame {
    let payload = Value::empty_dictionary();
    payload.dict_set("code", Value::int64(err.kind.code()));
    payload.dict_set("message", Value::string(err.message.clone()));
    Frame {
        namespace: "rpc".to_string(),
        name: "error".to_string(),
        id,
        args: payload,
    }
}

#[async_trait]
impl FrameSink for Connection {
    async fn send_frame(&self, frame: Frame) -> RpcResult<()> {
        let wire = frame::wrap(&frame)?;
        let bytes = self.codec.serialize(&wire.envelope)?;
        let _guard = self.send_mutex.lock().await;
        self.channel.send(&bytes, &wire.fds).await
    }
}
