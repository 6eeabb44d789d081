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

//! Schema loader: turns a YAML document into `Type`/`Function` entries
//! registered in a realm. See spec.md §4.G for the declaration grammar.

use super::{Function, Member, Type, TypeClass, TypeInstanceRef, TypeSystem, GLOBAL_REALM};
use crate::error::{RpcError, RpcResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

lazy_static! {
    static ref TYPE_HEAD: Regex =
        Regex::new(r"^(struct|union|enum|type)\s+([A-Za-z_][A-Za-z0-9_]*)(?:<([^>]+)>)?$").unwrap();
    static ref FUNCTION_HEAD: Regex = Regex::new(r"^function\s+([A-Za-z_][A-Za-z0-9_]*)$").unwrap();
    static ref TYPE_INSTANCE: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_.]*)(?:<(.+)>)?$").unwrap();
}

/// Splits on top-level commas only; angle brackets nest.
fn split_generic_args(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start <= s.len() {
        let tail = s[start..].trim();
        if !tail.is_empty() {
            parts.push(tail.to_string());
        }
    }
    parts
}

pub fn parse_type_instance_ref(s: &str) -> RpcResult<TypeInstanceRef> {
    let caps = TYPE_INSTANCE
        .captures(s.trim())
        .ok_or_else(|| RpcError::invalid_argument(format!("bad type instance `{s}`")))?;
    let name = caps[1].to_string();
    let args = match caps.get(2) {
        Some(m) => split_generic_args(m.as_str())
            .iter()
            .map(|a| parse_type_instance_ref(a))
            .collect::<RpcResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(TypeInstanceRef { name, args })
}

struct TypeHead {
    class: TypeClass,
    name: String,
    generic_vars: Vec<String>,
}

fn parse_type_head(key: &str) -> Option<TypeHead> {
    let caps = TYPE_HEAD.captures(key)?;
    let class = match &caps[1] {
        "struct" => TypeClass::Struct,
        "union" => TypeClass::Union,
        "enum" => TypeClass::Enum,
        "type" => TypeClass::Typedef,
        _ => return None,
    };
    let name = caps[2].to_string();
    let generic_vars = caps
        .get(3)
        .map(|m| split_generic_args(m.as_str()))
        .unwrap_or_default();
    Some(TypeHead {
        class,
        name,
        generic_vars,
    })
}

struct Loader<'a> {
    ts: &'a Arc<TypeSystem>,
    realm: String,
    /// name -> (raw yaml body, parsed head), for types not yet resolved
    declared: HashMap<String, (TypeHead, serde_yaml::Value)>,
    in_progress: RefCell<HashSet<String>>,
}

impl<'a> Loader<'a> {
    fn ensure_type(&self, name: &str) -> RpcResult<Arc<Type>> {
        if let Some(t) = self.ts.find_type(&self.realm, name) {
            return Ok(t);
        }
        if !self.declared.contains_key(name) {
            return Err(RpcError::not_found(format!("unknown type `{name}`")));
        }
        if self.in_progress.borrow().contains(name) {
            return Err(RpcError::invalid_argument(format!(
                "circular type reference involving `{name}`"
            )));
        }
        self.in_progress.borrow_mut().insert(name.to_string());
        let (head, body) = &self.declared[name];
        let loaded = self.load_type(head, body)?;
        self.in_progress.borrow_mut().remove(name);
        Ok(loaded)
    }

    fn load_type(&self, head: &TypeHead, body: &serde_yaml::Value) -> RpcResult<Arc<Type>> {
        let map = body.as_mapping();
        let description = map
            .and_then(|m| m.get("description"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let parent = match map.and_then(|m| m.get("inherits")).and_then(|v| v.as_str()) {
            // Forward inheritance is forbidden: the parent must already be
            // a fully registered type, never merely declared-but-pending.
            Some(p) => Some(self.ts.find_type(&self.realm, p).ok_or_else(|| {
                RpcError::invalid_argument(format!(
                    "`{}` inherits from `{p}`, which is not yet loaded (forward inheritance is not allowed)",
                    head.name
                ))
            })?),
            None => None,
        };

        let mut variants = Vec::new();
        let mut members = Vec::new();
        if head.class == TypeClass::Enum {
            if let Some(values) = map.and_then(|m| m.get("values")).and_then(|v| v.as_sequence()) {
                for v in values {
                    if let Some(s) = v.as_str() {
                        variants.push(s.to_string());
                    }
                }
            }
        } else if let Some(members_map) = map.and_then(|m| m.get("members")).and_then(|v| v.as_mapping()) {
            let parent_names: HashSet<String> = parent
                .as_ref()
                .map(|p| p.all_members().into_iter().map(|m| m.name.clone()).collect())
                .unwrap_or_default();
            for (k, v) in members_map {
                let field_name = k
                    .as_str()
                    .ok_or_else(|| RpcError::invalid_argument("member name must be a string"))?
                    .to_string();
                if parent_names.contains(&field_name) {
                    return Err(RpcError::invalid_argument(format!(
                        "`{}` redefines inherited member `{field_name}`",
                        head.name
                    )));
                }
                let type_str = v
                    .as_mapping()
                    .and_then(|m| m.get("type"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RpcError::invalid_argument(format!("member `{field_name}` has no type")))?;
                let description = v
                    .as_mapping()
                    .and_then(|m| m.get("description"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                members.push(Member {
                    name: field_name,
                    type_instance: parse_type_instance_ref(type_str)?,
                    description,
                });
            }
        }

        let ty = Arc::new(Type {
            realm: self.realm.clone(),
            name: head.name.clone(),
            class: head.class,
            parent,
            members,
            generic_vars: head.generic_vars.clone(),
            variants,
            description,
        });
        self.ts.register_type(&self.realm, ty.clone());
        Ok(ty)
    }

    fn load_function(&self, name: &str, body: &serde_yaml::Value) -> RpcResult<()> {
        let map = body
            .as_mapping()
            .ok_or_else(|| RpcError::invalid_argument(format!("function `{name}` has no body")))?;
        let description = map.get("description").and_then(|v| v.as_str()).map(String::from);
        let mut arguments = Vec::new();
        if let Some(args) = map.get("arguments").and_then(|v| v.as_sequence()) {
            for a in args {
                let arg_map = a
                    .as_mapping()
                    .ok_or_else(|| RpcError::invalid_argument("malformed function argument"))?;
                let arg_name = arg_map
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RpcError::invalid_argument("function argument missing name"))?
                    .to_string();
                let arg_type = arg_map
                    .get("type")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RpcError::invalid_argument("function argument missing type"))?;
                arguments.push((arg_name, parse_type_instance_ref(arg_type)?));
            }
        }
        let result = map
            .get("return")
            .and_then(|v| v.as_str())
            .map(parse_type_instance_ref)
            .transpose()?;
        self.ts.register_function(
            &self.realm,
            Arc::new(Function {
                realm: self.realm.clone(),
                name: name.to_string(),
                description,
                arguments,
                result,
            }),
        );
        Ok(())
    }
}

/// Loads a YAML schema document into `ts`, returning the realm it was
/// registered under (from `meta.realm`, defaulting to `*`).
pub fn load_schema(ts: &Arc<TypeSystem>, yaml_text: &str) -> RpcResult<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(yaml_text)
        .map_err(|e| RpcError::invalid_argument(format!("invalid schema YAML: {e}")))?;
    let map = doc
        .as_mapping()
        .ok_or_else(|| RpcError::invalid_argument("schema document must be a mapping"))?;

    let realm = map
        .get("meta")
        .and_then(|m| m.as_mapping())
        .and_then(|m| m.get("realm"))
        .and_then(|v| v.as_str())
        .unwrap_or(GLOBAL_REALM)
        .to_string();

    let mut declared = HashMap::new();
    // Declaration order as written in the document (serde_yaml::Mapping
    // preserves insertion order), so that `inherits` can enforce
    // "no forward inheritance" while member/argument type references
    // still resolve lazily regardless of order.
    let mut declaration_order: Vec<String> = Vec::new();
    let mut functions: Vec<(String, serde_yaml::Value)> = Vec::new();
    for (k, v) in map {
        let key = match k.as_str() {
            Some(k) => k,
            None => continue,
        };
        if key == "meta" {
            continue;
        }
        if let Some(head) = parse_type_head(key) {
            declaration_order.push(head.name.clone());
            declared.insert(head.name.clone(), (head, v.clone()));
        } else if let Some(caps) = FUNCTION_HEAD.captures(key) {
            functions.push((caps[1].to_string(), v.clone()));
        } else {
            return Err(RpcError::invalid_argument(format!(
                "unrecognised schema declaration `{key}`"
            )));
        }
    }

    let loader = Loader {
        ts,
        realm: realm.clone(),
        declared,
        in_progress: RefCell::new(HashSet::new()),
    };
    for name in declaration_order {
        loader.ensure_type(&name)?;
    }
    for (name, body) in functions {
        loader.load_function(&name, &body)?;
    }
    Ok(realm)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
meta:
  version: 1
  realm: geometry
  description: test schema
struct Point<T>:
  description: a point
  members:
    x:
      type: T
    y:
      type: T
function distance:
  description: euclidean distance
  arguments:
    - name: a
      type: Point<int64>
    - name: b
      type: Point<int64>
  return: double
"#;

    #[test]
    fn loads_generic_struct_and_function() {
        let ts = TypeSystem::new();
        let realm = load_schema(&ts, SCHEMA).unwrap();
        assert_eq!(realm, "geometry");
        let point = ts.find_type(&realm, "Point").unwrap();
        assert!(point.is_generic());
        let f = ts.find_function(&realm, "distance").unwrap();
        assert_eq!(f.arguments.len(), 2);
        let instance = ts
            .instantiate(&realm, &parse_type_instance_ref("Point<int64>").unwrap())
            .unwrap();
        assert_eq!(instance.canonical_name(), "Point<int64>");
    }

    #[test]
    fn forward_inheritance_is_rejected() {
        let ts = TypeSystem::new();
        let schema = r#"
meta:
  realm: r
struct Child:
  inherits: Parent
  members:
    a:
      type: int64
struct Parent:
  members:
    b:
      type: int64
"#;
        let err = load_schema(&ts, schema).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::InvalidArgument);
    }

    #[test]
    fn duplicate_member_redefinition_fails() {
        let ts = TypeSystem::new();
        let schema = r#"
meta:
  realm: r
struct Parent:
  members:
    a:
      type: int64
struct Child:
  inherits: Parent
  members:
    a:
      type: string
"#;
        let err = load_schema(&ts, schema).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::InvalidArgument);
    }
}
