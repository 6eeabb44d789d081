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

//! The `native` codec: a tag-byte + length-prefixed binary encoding, in
//! the same length-prefixed spirit as the teacher's Skyhash wire format
//! (`&<len>\n`, `_<len>\n`) but binary rather than text. No `msgpack`
//! crate appears anywhere in the retrieval pack, so this stands in for
//! it rather than fabricating a dependency — see DESIGN.md.

use super::Serializer;
use crate::error::{RpcError, RpcResult};
use crate::value::{BinaryValue, Value, ValueKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::os::unix::io::RawFd;

const TAG_NULL: u8 = 0;
const TAG_BOOL_FALSE: u8 = 1;
const TAG_BOOL_TRUE: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_UINT64: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_DATE: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_BINARY: u8 = 8;
const TAG_FD: u8 = 9;
const TAG_ARRAY: u8 = 10;
const TAG_DICTIONARY: u8 = 11;

pub struct NativeCodec;

impl Serializer for NativeCodec {
    fn name(&self) -> &'static str {
        "native"
    }

    fn serialize(&self, value: &Value) -> RpcResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        write_value(&mut buf, value);
        Ok(buf.to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> RpcResult<Value> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let v = read_value(&mut buf)?;
        Ok(v)
    }
}

fn write_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u64(bytes.len() as u64);
    buf.put_slice(bytes);
}

fn write_value(buf: &mut BytesMut, v: &Value) {
    match v.kind() {
        ValueKind::Null => buf.put_u8(TAG_NULL),
        ValueKind::Bool(false) => buf.put_u8(TAG_BOOL_FALSE),
        ValueKind::Bool(true) => buf.put_u8(TAG_BOOL_TRUE),
        ValueKind::Int64(i) => {
            buf.put_u8(TAG_INT64);
            buf.put_i64(*i);
        }
        ValueKind::UInt64(u) => {
            buf.put_u8(TAG_UINT64);
            buf.put_u64(*u);
        }
        ValueKind::Double(d) => {
            buf.put_u8(TAG_DOUBLE);
            buf.put_f64(*d);
        }
        ValueKind::Date(d) => {
            buf.put_u8(TAG_DATE);
            buf.put_i64(*d);
        }
        ValueKind::String(s) => {
            buf.put_u8(TAG_STRING);
            write_len_prefixed(buf, s.as_bytes());
        }
        ValueKind::Binary(b) => {
            buf.put_u8(TAG_BINARY);
            write_len_prefixed(buf, &b.data);
        }
        ValueKind::Fd(fd) => {
            buf.put_u8(TAG_FD);
            buf.put_i64(*fd as i64);
        }
        ValueKind::Array(_) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u64(v.count() as u64);
            v.array_apply(|_, item| {
                write_value(buf, item);
                true
            });
        }
        ValueKind::Dictionary(_) => {
            buf.put_u8(TAG_DICTIONARY);
            buf.put_u64(v.count() as u64);
            v.dict_apply(|k, item| {
                write_len_prefixed(buf, k.as_bytes());
                write_value(buf, item);
                true
            });
        }
    }
}

fn need(buf: &Bytes, n: usize) -> RpcResult<()> {
    if buf.remaining() < n {
        Err(RpcError::invalid_argument("truncated native-codec frame"))
    } else {
        Ok(())
    }
}

fn read_len_prefixed(buf: &mut Bytes) -> RpcResult<Vec<u8>> {
    need(buf, 8)?;
    let len = buf.get_u64() as usize;
    need(buf, len)?;
    let out = buf.copy_to_bytes(len).to_vec();
    Ok(out)
}

fn read_value(buf: &mut Bytes) -> RpcResult<Value> {
    need(buf, 1)?;
    let tag = buf.get_u8();
    let value = match tag {
        TAG_NULL => Value::null(),
        TAG_BOOL_FALSE => Value::bool(false),
        TAG_BOOL_TRUE => Value::bool(true),
        TAG_INT64 => {
            need(buf, 8)?;
            Value::int64(buf.get_i64())
        }
        TAG_UINT64 => {
            need(buf, 8)?;
            Value::uint64(buf.get_u64())
        }
        TAG_DOUBLE => {
            need(buf, 8)?;
            Value::double(buf.get_f64())
        }
        TAG_DATE => {
            need(buf, 8)?;
            Value::date(buf.get_i64())
        }
        TAG_STRING => {
            let bytes = read_len_prefixed(buf)?;
            let s = String::from_utf8(bytes)
                .map_err(|e| RpcError::invalid_argument(format!("bad utf-8 string: {e}")))?;
            Value::string(s)
        }
        TAG_BINARY => Value::binary(BinaryValue::owned(read_len_prefixed(buf)?)),
        TAG_FD => {
            need(buf, 8)?;
            Value::fd(buf.get_i64() as RawFd)
        }
        TAG_ARRAY => {
            need(buf, 8)?;
            let count = buf.get_u64();
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(read_value(buf)?);
            }
            Value::array(items)
        }
        TAG_DICTIONARY => {
            need(buf, 8)?;
            let count = buf.get_u64();
            let mut map = std::collections::HashMap::with_capacity(count as usize);
            for _ in 0..count {
                let key = String::from_utf8(read_len_prefixed(buf)?)
                    .map_err(|e| RpcError::invalid_argument(format!("bad utf-8 key: {e}")))?;
                map.insert(key, read_value(buf)?);
            }
            Value::dictionary(map)
        }
        other => {
            return Err(RpcError::invalid_argument(format!(
                "unknown native-codec tag {other}"
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nested_tree() {
        let codec = NativeCodec;
        let tree = Value::dictionary(std::collections::HashMap::from([
            (
                "items".to_string(),
                Value::array(vec![Value::int64(1), Value::string("two"), Value::null()]),
            ),
            ("flag".to_string(), Value::bool(true)),
            ("when".to_string(), Value::date(1_700_000_000)),
            ("big".to_string(), Value::uint64(u64::MAX)),
        ]));
        let bytes = codec.serialize(&tree).unwrap();
        let back = codec.deserialize(&bytes).unwrap();
        assert_eq!(tree, back);
    }

    #[test]
    fn truncated_input_is_invalid_argument() {
        let codec = NativeCodec;
        let err = codec.deserialize(&[TAG_STRING, 0, 0, 0, 0, 0, 0, 0, 5]).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::InvalidArgument);
    }
}
