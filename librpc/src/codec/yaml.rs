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

//! The `yaml` codec. YAML has no native `uint64`/`date`/`binary`/`fd`
//! kinds, so those round-trip through single-key tagged mappings (see
//! DESIGN.md for the collision caveat this implies for dictionaries that
//! happen to use one of the tag keys as their only field).

use super::Serializer;
use crate::error::{RpcError, RpcResult};
use crate::value::{BinaryValue, Value, ValueKind};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_yaml::Value as Yaml;
use std::os::unix::io::RawFd;

const TAG_UINT64: &str = "__rpc_uint64";
const TAG_DATE: &str = "__rpc_date";
const TAG_BINARY: &str = "__rpc_binary";
const TAG_FD: &str = "__rpc_fd";

pub struct YamlCodec;

impl Serializer for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn serialize(&self, value: &Value) -> RpcResult<Vec<u8>> {
        let yaml = to_yaml(value);
        serde_yaml::to_string(&yaml)
            .map(|s| s.into_bytes())
            .map_err(|e| RpcError::internal(format!("yaml encode failed: {e}")))
    }

    fn deserialize(&self, bytes: &[u8]) -> RpcResult<Value> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RpcError::invalid_argument(format!("not valid utf-8: {e}")))?;
        let yaml: Yaml = serde_yaml::from_str(text)
            .map_err(|e| RpcError::invalid_argument(format!("yaml parse failed: {e}")))?;
        from_yaml(&yaml)
    }
}

fn to_yaml(v: &Value) -> Yaml {
    match v.kind() {
        ValueKind::Null => Yaml::Null,
        ValueKind::Bool(b) => Yaml::Bool(*b),
        ValueKind::Int64(i) => Yaml::Number((*i).into()),
        ValueKind::UInt64(u) => tagged(TAG_UINT64, Yaml::Number((*u).into())),
        ValueKind::Double(d) => Yaml::Number((*d).into()),
        ValueKind::Date(d) => tagged(TAG_DATE, Yaml::Number((*d).into())),
        ValueKind::String(s) => Yaml::String(s.to_string()),
        ValueKind::Binary(b) => tagged(TAG_BINARY, Yaml::String(STANDARD.encode(&b.data))),
        ValueKind::Fd(fd) => tagged(TAG_FD, Yaml::Number((*fd as i64).into())),
        ValueKind::Array(_) => {
            let mut out = Vec::with_capacity(v.count());
            v.array_apply(|_, item| {
                out.push(to_yaml(item));
                true
            });
            Yaml::Sequence(out)
        }
        ValueKind::Dictionary(_) => {
            let mut map = serde_yaml::Mapping::new();
            v.dict_apply(|k, item| {
                map.insert(Yaml::String(k.to_string()), to_yaml(item));
                true
            });
            Yaml::Mapping(map)
        }
    }
}

fn tagged(tag: &str, inner: Yaml) -> Yaml {
    let mut map = serde_yaml::Mapping::new();
    map.insert(Yaml::String(tag.to_string()), inner);
    Yaml::Mapping(map)
}

fn single_tag<'a>(map: &'a serde_yaml::Mapping) -> Option<(&'a str, &'a Yaml)> {
    if map.len() != 1 {
        return None;
    }
    let (k, v) = map.iter().next()?;
    k.as_str().map(|s| (s, v))
}

fn from_yaml(y: &Yaml) -> RpcResult<Value> {
    let value = match y {
        Yaml::Null => Value::null(),
        Yaml::Bool(b) => Value::bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::int64(i)
            } else if let Some(f) = n.as_f64() {
                Value::double(f)
            } else {
                return Err(RpcError::invalid_argument("unrepresentable yaml number"));
            }
        }
        Yaml::String(s) => Value::string(s.clone()),
        Yaml::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_yaml(item)?);
            }
            Value::array(out)
        }
        Yaml::Mapping(map) => {
            if let Some((tag, inner)) = single_tag(map) {
                match tag {
                    TAG_UINT64 => {
                        let u = inner
                            .as_u64()
                            .ok_or_else(|| RpcError::invalid_argument("bad uint64 tag"))?;
                        return Ok(Value::uint64(u));
                    }
                    TAG_DATE => {
                        let d = inner
                            .as_i64()
                            .ok_or_else(|| RpcError::invalid_argument("bad date tag"))?;
                        return Ok(Value::date(d));
                    }
                    TAG_BINARY => {
                        let s = inner
                            .as_str()
                            .ok_or_else(|| RpcError::invalid_argument("bad binary tag"))?;
                        let data = STANDARD
                            .decode(s)
                            .map_err(|e| RpcError::invalid_argument(format!("bad base64: {e}")))?;
                        return Ok(Value::binary(BinaryValue::owned(data)));
                    }
                    TAG_FD => {
                        let fd = inner
                            .as_i64()
                            .ok_or_else(|| RpcError::invalid_argument("bad fd tag"))?;
                        return Ok(Value::fd(fd as RawFd));
                    }
                    _ => {}
                }
            }
            let mut out = std::collections::HashMap::with_capacity(map.len());
            for (k, v) in map {
                let key = k
                    .as_str()
                    .ok_or_else(|| RpcError::invalid_argument("dictionary keys must be strings"))?
                    .to_string();
                out.insert(key, from_yaml(v)?);
            }
            Value::dictionary(out)
        }
        Yaml::Tagged(t) => from_yaml(&t.value)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_scalar_kind_but_fd() {
        let codec = YamlCodec;
        let tree = Value::dictionary(std::collections::HashMap::from([
            ("n".to_string(), Value::null()),
            ("b".to_string(), Value::bool(true)),
            ("i".to_string(), Value::int64(-5)),
            ("u".to_string(), Value::uint64(u64::MAX)),
            ("d".to_string(), Value::double(1.5)),
            ("t".to_string(), Value::date(1_700_000_000)),
            ("s".to_string(), Value::string("hi")),
            (
                "bin".to_string(),
                Value::binary(BinaryValue::owned(vec![1, 2, 3])),
            ),
            ("arr".to_string(), Value::array(vec![Value::int64(1), Value::int64(2)])),
        ]));
        let bytes = codec.serialize(&tree).unwrap();
        let back = codec.deserialize(&bytes).unwrap();
        assert_eq!(tree, back);
    }
}
