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

//! The frame layer: wraps a `{namespace, name, id, args}` envelope,
//! rewriting `Fd` leaves to out-of-band descriptor indices before a
//! codec ever sees the tree, and reversing that rewrite on receipt.
//!
//! Descriptor indices are represented on the wire as a one-entry
//! dictionary `{FD_INDEX_KEY: index}` rather than a bare integer: a
//! codec alone cannot otherwise tell "this int is a real value" from
//! "this int is a descriptor placeholder" once the `Fd` variant itself
//! is gone from the tree. See DESIGN.md for the tradeoff this implies.

use crate::error::{RpcError, RpcResult};
use crate::value::{Value, ValueKind};
use std::os::unix::io::RawFd;

/// At most this many descriptors travel with one frame (spec.md §4.D).
pub const MAX_FRAME_FDS: usize = 128;

const FD_INDEX_KEY: &str = "__rpc_fd__";

#[derive(Debug, Clone)]
pub struct Frame {
    pub namespace: String,
    pub name: String,
    pub id: String,
    pub args: Value,
}

/// A frame ready for the wire: the envelope dictionary a codec can
/// serialize, plus the descriptors that travel alongside it.
pub struct WireFrame {
    pub envelope: Value,
    pub fds: Vec<RawFd>,
}

/// Builds a `WireFrame` from `frame`, walking a clone of `frame.args` —
/// the caller's tree is never mutated (spec.md §9 design note).
pub fn wrap(frame: &Frame) -> RpcResult<WireFrame> {
    let mut fds = Vec::new();
    let args = rewrite_out(&frame.args, &mut fds)?;
    let envelope = Value::empty_dictionary();
    envelope.dict_set("namespace", Value::string(frame.namespace.clone()));
    envelope.dict_set("name", Value::string(frame.name.clone()));
    envelope.dict_set("id", Value::string(frame.id.clone()));
    envelope.dict_set("args", args);
    Ok(WireFrame { envelope, fds })
}

fn rewrite_out(v: &Value, fds: &mut Vec<RawFd>) -> RpcResult<Value> {
    match v.kind() {
        ValueKind::Fd(fd) => {
            if fds.len() >= MAX_FRAME_FDS {
                return Err(RpcError::resource_exhausted(format!(
                    "frame carries more than {MAX_FRAME_FDS} descriptors"
                )));
            }
            let index = fds.len() as u64;
            fds.push(*fd);
            let marker = Value::empty_dictionary();
            marker.dict_set(FD_INDEX_KEY, Value::uint64(index));
            Ok(marker)
        }
        ValueKind::Array(_) => {
            let mut items = Vec::with_capacity(v.count());
            let mut err = None;
            v.array_apply(|_, item| match rewrite_out(item, fds) {
                Ok(rewritten) => {
                    items.push(rewritten);
                    true
                }
                Err(e) => {
                    err = Some(e);
                    false
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Ok(Value::array(items))
        }
        ValueKind::Dictionary(_) => {
            let out = Value::empty_dictionary();
            let mut err = None;
            v.dict_apply(|k, item| match rewrite_out(item, fds) {
                Ok(rewritten) => {
                    out.dict_set(k, rewritten);
                    true
                }
                Err(e) => {
                    err = Some(e);
                    false
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Ok(out)
        }
        _ => Ok(v.clone()),
    }
}

/// Reconstructs a `Frame` from a received envelope and the descriptors
/// the transport delivered alongside it, restoring real `Fd` leaves.
pub fn unwrap(envelope: &Value, fds: &[RawFd]) -> RpcResult<Frame> {
    let namespace = required_string(envelope, "namespace")?;
    let name = required_string(envelope, "name")?;
    let id = required_string(envelope, "id")?;
    let args = envelope.dict_get("args").unwrap_or_else(Value::null);
    let args = rewrite_in(&args, fds)?;
    Ok(Frame {
        namespace,
        name,
        id,
        args,
    })
}

fn required_string(envelope: &Value, key: &str) -> RpcResult<String> {
    match envelope.dict_get(key) {
        Some(v) => match v.kind() {
            ValueKind::String(s) => Ok(s.to_string()),
            _ => Err(RpcError::invalid_argument(format!("`{key}` must be a string"))),
        },
        None => Err(RpcError::invalid_argument(format!("frame is missing `{key}`"))),
    }
}

fn fd_marker_index(v: &Value) -> Option<u64> {
    if v.count() != 1 {
        return None;
    }
    match v.kind() {
        ValueKind::Dictionary(_) => match v.dict_get(FD_INDEX_KEY)?.kind() {
            ValueKind::UInt64(idx) => Some(*idx),
            _ => None,
        },
        _ => None,
    }
}

fn rewrite_in(v: &Value, fds: &[RawFd]) -> RpcResult<Value> {
    if let Some(index) = fd_marker_index(v) {
        let fd = fds.get(index as usize).ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "frame references descriptor index {index} but only {} were delivered",
                fds.len()
            ))
        })?;
        return Ok(Value::fd(*fd));
    }
    match v.kind() {
        ValueKind::Array(_) => {
            let mut items = Vec::with_capacity(v.count());
            let mut err = None;
            v.array_apply(|_, item| match rewrite_in(item, fds) {
                Ok(rewritten) => {
                    items.push(rewritten);
                    true
                }
                Err(e) => {
                    err = Some(e);
                    false
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Ok(Value::array(items))
        }
        ValueKind::Dictionary(_) => {
            let out = Value::empty_dictionary();
            let mut err = None;
            v.dict_apply(|k, item| match rewrite_in(item, fds) {
                Ok(rewritten) => {
                    out.dict_set(k, rewritten);
                    true
                }
                Err(e) => {
                    err = Some(e);
                    false
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Ok(out)
        }
        _ => Ok(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips_without_descriptors() {
        let frame = Frame {
            namespace: "rpc".to_string(),
            name: "call".to_string(),
            id: "abc-123".to_string(),
            args: Value::array(vec![Value::int64(1), Value::string("x")]),
        };
        let wire = wrap(&frame).unwrap();
        assert!(wire.fds.is_empty());
        let back = unwrap(&wire.envelope, &wire.fds).unwrap();
        assert_eq!(back.namespace, frame.namespace);
        assert_eq!(back.name, frame.name);
        assert_eq!(back.id, frame.id);
        assert_eq!(back.args, frame.args);
    }

    #[test]
    fn descriptors_round_trip_through_indices() {
        let frame = Frame {
            namespace: "rpc".to_string(),
            name: "call".to_string(),
            id: "id-1".to_string(),
            args: Value::array(vec![Value::fd(3), Value::int64(9), Value::fd(7)]),
        };
        let wire = wrap(&frame).unwrap();
        assert_eq!(wire.fds, vec![3, 7]);
        // On the wire, the marker values are plain dictionaries — not Fd kinds.
        assert!(matches!(
            wire.envelope.dict_get("args").unwrap().array_get(0).unwrap().kind(),
            ValueKind::Dictionary(_)
        ));
        let delivered = vec![30, 70]; // transport hands back real, possibly renumbered, fds
        let back = unwrap(&wire.envelope, &delivered).unwrap();
        assert_eq!(back.args.array_get(0), Some(Value::fd(30)));
        assert_eq!(back.args.array_get(1), Some(Value::int64(9)));
        assert_eq!(back.args.array_get(2), Some(Value::fd(70)));
    }

    #[test]
    fn overflowing_descriptor_budget_is_resource_exhausted() {
        let items: Vec<Value> = (0..(MAX_FRAME_FDS as i32 + 1)).map(Value::fd).collect();
        let frame = Frame {
            namespace: "rpc".to_string(),
            name: "call".to_string(),
            id: "id-2".to_string(),
            args: Value::array(items),
        };
        let err = wrap(&frame).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::ResourceExhausted);
    }

    #[test]
    fn missing_required_field_is_invalid_argument() {
        let envelope = Value::empty_dictionary();
        envelope.dict_set("namespace", Value::string("rpc"));
        let err = unwrap(&envelope, &[]).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::InvalidArgument);
    }
}
