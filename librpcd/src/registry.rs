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

//! The standard `Discoverable`/`Observable` methods a server exposes
//! (spec.md §6). Backed by an in-memory property table — there is no
//! persisted state, per spec.md's Non-goals.

use librpc::idl::TypeSystem;
use librpc::mux::{InboundCall, ServerHandler};
use librpc::value::{Value, ValueKind};
use librpc::RpcError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const DISCOVERABLE_GET_INTERFACES: &str = "com.twoporeguys.librpc.Discoverable.get_interfaces";
const OBSERVABLE_GET: &str = "com.twoporeguys.librpc.Observable.get";
const OBSERVABLE_SET: &str = "com.twoporeguys.librpc.Observable.set";

const STANDARD_INTERFACES: &[&str] = &[
    "com.twoporeguys.librpc.Discoverable",
    "com.twoporeguys.librpc.Observable",
];

pub struct DaemonHandler {
    #[allow(dead_code)]
    schema: Option<Arc<TypeSystem>>,
    properties: Mutex<HashMap<String, Value>>,
}

impl DaemonHandler {
    pub fn new(schema: Option<Arc<TypeSystem>>) -> Self {
        Self {
            schema,
            properties: Mutex::new(HashMap::new()),
        }
    }

    async fn get_interfaces(&self, call: Arc<InboundCall>) {
        let interfaces = Value::array(STANDARD_INTERFACES.iter().map(|s| Value::string(*s)).collect());
        let _ = call.send_response(interfaces).await;
    }

    async fn observable_get(&self, call: Arc<InboundCall>) {
        let property = match call.args().array_get(0) {
            Some(v) => match v.kind() {
                ValueKind::String(s) => s.to_string(),
                _ => {
                    let _ = call
                        .send_error(RpcError::invalid_argument("Observable.get expects a string property name"))
                        .await;
                    return;
                }
            },
            None => {
                let _ = call
                    .send_error(RpcError::invalid_argument("Observable.get requires one argument"))
                    .await;
                return;
            }
        };
        match self.properties.lock().get(&property).cloned() {
            Some(v) => {
                let _ = call.send_response(v).await;
            }
            None => {
                let _ = call
                    .send_error(RpcError::not_found(format!("no such property `{property}`")))
                    .await;
            }
        }
    }

    async fn observable_set(&self, call: Arc<InboundCall>) {
        let property = call.args().array_get(0).and_then(|v| match v.kind() {
            ValueKind::String(s) => Some(s.to_string()),
            _ => None,
        });
        let value = call.args().array_get(1);
        match (property, value) {
            (Some(property), Some(value)) => {
                self.properties.lock().insert(property, value);
                let _ = call.send_response(Value::null()).await;
            }
            _ => {
                let _ = call
                    .send_error(RpcError::invalid_argument("Observable.set requires (property, value)"))
                    .await;
            }
        }
    }
}

#[async_trait]
impl ServerHandler for DaemonHandler {
    async fn handle_call(&self, call: Arc<InboundCall>) {
        match call.method() {
            DISCOVERABLE_GET_INTERFACES => self.get_interfaces(call).await,
            OBSERVABLE_GET => self.observable_get(call).await,
            OBSERVABLE_SET => self.observable_set(call).await,
            other => {
                let _ = call.send_error(RpcError::not_found(format!("no such method `{other}`"))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use librpc::error::RpcResult;
    use librpc::frame::Frame;
    use librpc::mux::FrameSink;

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

    fn recording_call(method: &str, args: Value) -> (Arc<InboundCall>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let call = Arc::new(InboundCall::new("id".to_string(), method.to_string(), args, sink.clone()));
        (call, sink)
    }

    #[tokio::test]
    async fn get_interfaces_lists_both_standard_interfaces() {
        let handler = DaemonHandler::new(None);
        let (call, sink) = recording_call(DISCOVERABLE_GET_INTERFACES, Value::empty_array());
        handler.handle_call(call).await;
        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].args.count(), 2);
    }

    #[tokio::test]
    async fn set_then_get_round_trips_a_property() {
        let handler = DaemonHandler::new(None);
        let (call, _) = recording_call(
            OBSERVABLE_SET,
            Value::array(vec![Value::string("volume"), Value::int64(11)]),
        );
        handler.handle_call(call).await;

        let (call, sink) = recording_call(OBSERVABLE_GET, Value::array(vec![Value::string("volume")]));
        handler.handle_call(call).await;
        assert_eq!(sink.frames.lock()[0].args, Value::int64(11));
    }

    #[tokio::test]
    async fn get_unknown_property_is_not_found() {
        let handler = DaemonHandler::new(None);
        let (call, sink) = recording_call(OBSERVABLE_GET, Value::array(vec![Value::string("missing")]));
        handler.handle_call(call).await;
        let frames = sink.frames.lock();
        assert_eq!(frames[0].name, "error");
        assert_eq!(
            frames[0].args.dict_get("code"),
            Some(Value::int64(librpc::error::RpcErrorKind::NotFound.code()))
        );
    }
}
