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

//! The pack/unpack mini-language (spec.md §4.A). A format string drives
//! construction (`pack`) or destructuring (`unpack`) of a value tree, one
//! token at a time, left to right.

use super::{BinaryValue, Value, ValueKind};
use crate::error::{RpcError, RpcResult};
use std::os::unix::io::RawFd;

/// One packed argument. Rust has no C-style varargs, so callers build an
/// explicit `&[PackArg]` instead of a `...` list.
#[derive(Debug, Clone)]
pub enum PackArg {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    Binary(Vec<u8>),
    Fd(RawFd),
}

/// One value bound out of a tree by `unpack`, in encounter order.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    Binary(Vec<u8>),
    Fd(RawFd),
}

#[derive(Debug, Clone)]
enum Token {
    Null,
    Bool,
    Int,
    UInt,
    Double,
    Str,
    Binary,
    Fd,
    Array(Vec<Entry>),
    Dict(Vec<Entry>),
}

#[derive(Debug, Clone)]
struct Entry {
    /// The literal name before `:`, e.g. `uint` in `uint:u`, or a numeric
    /// array index, e.g. `5` in `5:i`. `None` for a bare token.
    label: Option<String>,
    token: Token,
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start <= s.len() {
        parts.push(&s[start..]);
    }
    parts
}

fn parse_token(s: &str) -> RpcResult<Token> {
    if let Some(inner) = s.strip_prefix('[').and_then(|x| x.strip_suffix(']')) {
        return Ok(Token::Array(parse_entries(inner)?));
    }
    if let Some(inner) = s.strip_prefix('{').and_then(|x| x.strip_suffix('}')) {
        return Ok(Token::Dict(parse_entries(inner)?));
    }
    match s {
        "n" => Ok(Token::Null),
        "b" => Ok(Token::Bool),
        "i" => Ok(Token::Int),
        "u" | "uint" => Ok(Token::UInt),
        "d" => Ok(Token::Double),
        "s" => Ok(Token::Str),
        "B" | "data" => Ok(Token::Binary),
        "f" | "fd" => Ok(Token::Fd),
        other => Err(RpcError::invalid_argument(format!(
            "unknown pack/unpack token `{other}`"
        ))),
    }
}

/// Splits a `:`-separated label from its token, respecting bracket depth
/// (so `array:[i,5:i]`'s inner `5:i` isn't mistaken for the outer split).
fn split_label(entry: &str) -> (Option<&str>, &str) {
    let mut depth = 0i32;
    for (i, c) in entry.char_indices() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ':' if depth == 0 => return (Some(&entry[..i]), &entry[i + 1..]),
            _ => {}
        }
    }
    (None, entry)
}

fn parse_entries(s: &str) -> RpcResult<Vec<Entry>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(s)
        .into_iter()
        .map(|raw| {
            let (label, token_str) = split_label(raw);
            Ok(Entry {
                label: label.map(|l| l.to_string()),
                token: parse_token(token_str)?,
            })
        })
        .collect()
}

struct ArgCursor<'a> {
    args: &'a [PackArg],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    fn new(args: &'a [PackArg]) -> Self {
        Self { args, pos: 0 }
    }

    fn next(&mut self) -> RpcResult<&'a PackArg> {
        let a = self
            .args
            .get(self.pos)
            .ok_or_else(|| RpcError::invalid_argument("pack format expects more arguments"))?;
        self.pos += 1;
        Ok(a)
    }

    fn next_str(&mut self) -> RpcResult<String> {
        match self.next()? {
            PackArg::Str(s) => Ok(s.clone()),
            _ => Err(RpcError::invalid_argument("expected a string argument")),
        }
    }
}

fn pack_token(token: &Token, args: &mut ArgCursor) -> RpcResult<Value> {
    Ok(match token {
        Token::Null => Value::null(),
        Token::Bool => match args.next()? {
            PackArg::Bool(b) => Value::bool(*b),
            _ => return Err(RpcError::invalid_argument("expected a bool argument")),
        },
        Token::Int => match args.next()? {
            PackArg::Int(i) => Value::int64(*i),
            _ => return Err(RpcError::invalid_argument("expected an int argument")),
        },
        Token::UInt => match args.next()? {
            PackArg::UInt(u) => Value::uint64(*u),
            _ => return Err(RpcError::invalid_argument("expected a uint argument")),
        },
        Token::Double => match args.next()? {
            PackArg::Double(d) => Value::double(*d),
            _ => return Err(RpcError::invalid_argument("expected a double argument")),
        },
        Token::Str => Value::string(args.next_str()?),
        Token::Binary => match args.next()? {
            PackArg::Binary(b) => Value::binary(BinaryValue::owned(b.clone())),
            _ => return Err(RpcError::invalid_argument("expected a binary argument")),
        },
        Token::Fd => match args.next()? {
            PackArg::Fd(fd) => Value::fd(*fd),
            _ => return Err(RpcError::invalid_argument("expected an fd argument")),
        },
        Token::Array(entries) => {
            let array = Value::empty_array();
            let mut auto_index = 0usize;
            for entry in entries {
                let idx = match &entry.label {
                    Some(l) => l.parse::<usize>().map_err(|_| {
                        RpcError::invalid_argument(format!("`{l}` is not a valid array index"))
                    })?,
                    None => {
                        let i = auto_index;
                        auto_index += 1;
                        i
                    }
                };
                let v = pack_token(&entry.token, args)?;
                array.array_set(idx, v);
            }
            array
        }
        Token::Dict(entries) => {
            let dict = Value::empty_dictionary();
            for entry in entries {
                let key = match &entry.label {
                    Some(l) => l.clone(),
                    None => args.next_str()?,
                };
                let v = pack_token(&entry.token, args)?;
                dict.dict_set(key, v);
            }
            dict
        }
    })
}

/// Builds a [`Value`] from a format string and its arguments.
pub fn pack(format: &str, args: &[PackArg]) -> RpcResult<Value> {
    let token = parse_token(format)?;
    let mut cursor = ArgCursor::new(args);
    pack_token(&token, &mut cursor)
}

fn unpack_token(token: &Token, value: &Value, out: &mut Vec<Bound>) -> RpcResult<()> {
    match token {
        Token::Null => out.push(Bound::Null),
        Token::Bool => match value.kind() {
            ValueKind::Bool(b) => out.push(Bound::Bool(*b)),
            _ => return Err(type_mismatch("bool", value)),
        },
        Token::Int => match value.kind() {
            ValueKind::Int64(i) => out.push(Bound::Int(*i)),
            _ => return Err(type_mismatch("int64", value)),
        },
        Token::UInt => match value.kind() {
            ValueKind::UInt64(u) => out.push(Bound::UInt(*u)),
            _ => return Err(type_mismatch("uint64", value)),
        },
        Token::Double => match value.kind() {
            ValueKind::Double(d) => out.push(Bound::Double(*d)),
            _ => return Err(type_mismatch("double", value)),
        },
        Token::Str => match value.kind() {
            ValueKind::String(s) => out.push(Bound::Str(s.to_string())),
            _ => return Err(type_mismatch("string", value)),
        },
        Token::Binary => match value.kind() {
            ValueKind::Binary(b) => out.push(Bound::Binary(b.data.to_vec())),
            _ => return Err(type_mismatch("binary", value)),
        },
        Token::Fd => match value.kind() {
            ValueKind::Fd(fd) => out.push(Bound::Fd(*fd)),
            _ => return Err(type_mismatch("fd", value)),
        },
        Token::Array(entries) => {
            if !matches!(value.kind(), ValueKind::Array(_)) {
                return Err(type_mismatch("array", value));
            }
            let mut auto_index = 0usize;
            for entry in entries {
                let idx = match &entry.label {
                    Some(l) => l.parse::<usize>().map_err(|_| {
                        RpcError::invalid_argument(format!("`{l}` is not a valid array index"))
                    })?,
                    None => {
                        let i = auto_index;
                        auto_index += 1;
                        i
                    }
                };
                let elem = value
                    .array_get(idx)
                    .ok_or_else(|| RpcError::invalid_argument("array index out of range"))?;
                unpack_token(&entry.token, &elem, out)?;
            }
        }
        Token::Dict(entries) => {
            if !matches!(value.kind(), ValueKind::Dictionary(_)) {
                return Err(type_mismatch("dictionary", value));
            }
            // Named entries address a specific key; unnamed entries bind
            // positionally against the dict's remaining entries (see
            // DESIGN.md for why unpack doesn't also bind the key name).
            let mut positional: Vec<(String, Value)> = Vec::new();
            value.dict_apply(|k, v| {
                positional.push((k.to_string(), v.clone()));
                true
            });
            let mut next_positional = 0usize;
            for entry in entries {
                let elem = match &entry.label {
                    Some(key) => value
                        .dict_get(key)
                        .ok_or_else(|| RpcError::invalid_argument(format!("missing key `{key}`")))?,
                    None => {
                        let (_, v) = positional.get(next_positional).ok_or_else(|| {
                            RpcError::invalid_argument("dictionary has fewer entries than format")
                        })?;
                        next_positional += 1;
                        v.clone()
                    }
                };
                unpack_token(&entry.token, &elem, out)?;
            }
        }
    }
    Ok(())
}

fn type_mismatch(expected: &str, got: &Value) -> RpcError {
    RpcError::invalid_argument(format!("expected {expected}, got {}", got.get_type()))
}

/// Destructures `value` according to `format`, returning the values bound
/// in encounter order along with how many were bound.
pub fn unpack(format: &str, value: &Value) -> RpcResult<(usize, Vec<Bound>)> {
    let token = parse_token(format)?;
    let mut out = Vec::new();
    unpack_token(&token, value, &mut out)?;
    Ok((out.len(), out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_array() {
        let v = pack(
            "[sib]",
            &[
                PackArg::Str("world".into()),
                PackArg::Int(123),
                PackArg::Bool(true),
            ],
        )
        .unwrap();
        let (n, bound) = unpack("[sib]", &v).unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            bound,
            vec![
                Bound::Str("world".into()),
                Bound::Int(123),
                Bound::Bool(true)
            ]
        );
    }

    #[test]
    fn unpack_scenario_one_call_args() {
        // spec.md §8 scenario 1: args ["world", 123, true, {"key": 11234}]
        let dict = Value::empty_dictionary();
        dict.dict_set("key", Value::int64(11234));
        let args = Value::array(vec![
            Value::string("world"),
            Value::int64(123),
            Value::bool(true),
            dict,
        ]);
        let (n, bound) = unpack("[sib{i}]", &args).unwrap();
        assert_eq!(n, 4);
        assert_eq!(
            bound,
            vec![
                Bound::Str("world".into()),
                Bound::Int(123),
                Bound::Bool(true),
                Bound::Int(11234),
            ]
        );
    }

    #[test]
    fn pack_scenario_one_response() {
        let v = pack(
            "{s,i,uint:u,b,n,array:[i,5:i,i,{s}]}",
            &[
                PackArg::Str("hello".into()),
                PackArg::Str("world".into()),
                PackArg::Str("int".into()),
                PackArg::Int(-12345),
                PackArg::UInt(0x80808080),
                PackArg::Str("true_or_false".into()),
                PackArg::Bool(true),
                PackArg::Str("nothing".into()),
                PackArg::Int(1),
                PackArg::Int(2),
                PackArg::Int(3),
                PackArg::Str("!".into()),
                PackArg::Str("?".into()),
            ],
        )
        .unwrap();
        assert_eq!(v.dict_get("hello"), Some(Value::string("world")));
        assert_eq!(v.dict_get("int"), Some(Value::int64(-12345)));
        assert_eq!(v.dict_get("uint"), Some(Value::uint64(0x80808080)));
        assert_eq!(v.dict_get("true_or_false"), Some(Value::bool(true)));
        assert_eq!(v.dict_get("nothing"), Some(Value::null()));
        let array = v.dict_get("array").unwrap();
        assert_eq!(array.array_get(0), Some(Value::int64(1)));
        assert_eq!(array.array_get(5), Some(Value::int64(2)));
        assert_eq!(array.array_get(1), Some(Value::int64(3)));
        let inner = array.array_get(2).unwrap();
        assert_eq!(inner.dict_get("!"), Some(Value::string("?")));
    }

    #[test]
    fn unpack_missing_key_is_invalid_argument() {
        let d = Value::empty_dictionary();
        let err = unpack("missing:i", &d).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::InvalidArgument);
    }
}
