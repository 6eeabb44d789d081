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

//! Validates a [`Value`] against a [`TypeInstance`]: the algorithm
//! spec.md §4.G describes and §9 calls out as a stub in the original
//! (`rpct_validate_obj`/`rpct_type_is_compatible`).

use crate::error::{RpcError, RpcResult};
use crate::idl::{Member, TypeClass, TypeInstance, TypeSystem};
use crate::value::{Value, ValueKind};
use std::sync::Arc;

/// `Ok` on success, `Err(TypeError)` with a human-readable reason on the
/// first mismatch found. `ts` resolves member types that aren't bound
/// generic variables of `instance`.
pub fn validate(ts: &Arc<TypeSystem>, value: &Value, instance: &TypeInstance) -> RpcResult<()> {
    // Realm matching (declared realm vs `*`) is already enforced when a
    // type-instance reference is resolved, by `TypeSystem::find_type`'s
    // realm-then-global fallback; nothing left to check structurally here.
    match instance.ty.class {
        TypeClass::Builtin => validate_builtin(value, &instance.ty.name),
        TypeClass::Typedef => match instance.args.first() {
            Some(arg) => validate(ts, value, arg),
            None => validate_builtin(value, &instance.ty.name),
        },
        TypeClass::Enum => validate_enum(value, instance),
        TypeClass::Union => validate_union(ts, value, instance),
        TypeClass::Struct => validate_struct(ts, value, instance),
    }
}

fn validate_builtin(value: &Value, name: &str) -> RpcResult<()> {
    let ok = match name {
        "null" => matches!(value.kind(), ValueKind::Null),
        "bool" => matches!(value.kind(), ValueKind::Bool(_)),
        "int64" => matches!(value.kind(), ValueKind::Int64(_)),
        "uint64" => matches!(value.kind(), ValueKind::UInt64(_)),
        "double" => matches!(value.kind(), ValueKind::Double(_)),
        "date" => matches!(value.kind(), ValueKind::Date(_)),
        "string" => matches!(value.kind(), ValueKind::String(_)),
        "binary" | "shmem" => matches!(value.kind(), ValueKind::Binary(_)),
        "fd" => matches!(value.kind(), ValueKind::Fd(_)),
        "array" => matches!(value.kind(), ValueKind::Array(_)),
        "dictionary" | "error" => matches!(value.kind(), ValueKind::Dictionary(_)),
        "any" => true,
        other => {
            return Err(RpcError::internal(format!(
                "`{other}` is not a builtin leaf type"
            )))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(RpcError::type_error(format!(
            "expected `{name}`, got `{}`",
            value.get_type()
        )))
    }
}

fn validate_enum(value: &Value, instance: &TypeInstance) -> RpcResult<()> {
    let s = match value.kind() {
        ValueKind::String(s) => s.to_string(),
        _ => {
            return Err(RpcError::type_error(format!(
                "enum `{}` expects a string variant",
                instance.ty.name
            )))
        }
    };
    if instance.ty.variants.iter().any(|v| v == &s) {
        Ok(())
    } else {
        Err(RpcError::type_error(format!(
            "`{s}` is not a variant of `{}`",
            instance.ty.name
        )))
    }
}

fn validate_union(ts: &Arc<TypeSystem>, value: &Value, instance: &TypeInstance) -> RpcResult<()> {
    let mut last_err = None;
    for member in instance.ty.all_members() {
        let arg = resolve_member_type(ts, instance, member)?;
        match validate(ts, value, &arg) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        RpcError::type_error(format!("`{}` has no members to match against", instance.ty.name))
    }))
}

fn validate_struct(ts: &Arc<TypeSystem>, value: &Value, instance: &TypeInstance) -> RpcResult<()> {
    if !matches!(value.kind(), ValueKind::Dictionary(_)) {
        return Err(RpcError::type_error(format!(
            "struct `{}` expects a dictionary",
            instance.ty.name
        )));
    }
    for member in instance.ty.all_members() {
        let field = value.dict_get(&member.name).ok_or_else(|| {
            RpcError::type_error(format!(
                "`{}` is missing required member `{}`",
                instance.ty.name, member.name
            ))
        })?;
        let arg = resolve_member_type(ts, instance, member)?;
        validate(ts, &field, &arg)
            .map_err(|e| RpcError::type_error(format!("member `{}`: {e}", member.name)))?;
    }
    Ok(())
}

/// Resolves a member's declared type against `instance`: if the member's
/// type is one of the owning type's generic variables (e.g. bare `T`),
/// substitutes the concrete argument bound at `instance`; otherwise
/// instantiates it fresh in the owning type's realm.
fn resolve_member_type(
    ts: &Arc<TypeSystem>,
    instance: &TypeInstance,
    member: &Member,
) -> RpcResult<Arc<TypeInstance>> {
    if let Some(pos) = instance
        .ty
        .generic_vars
        .iter()
        .position(|v| v == &member.type_instance.name)
    {
        if let Some(bound) = instance.args.get(pos) {
            return Ok(bound.clone());
        }
    }
    ts.instantiate(&instance.ty.realm, &member.type_instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idl::{loader, GLOBAL_REALM};

    const SCHEMA: &str = r#"
meta:
  realm: geometry
struct Point<T>:
  members:
    x:
      type: T
    y:
      type: T
struct Segment:
  members:
    a:
      type: Point<int64>
    b:
      type: Point<int64>
"#;

    #[test]
    fn struct_validates_against_instantiated_generic() {
        let ts = TypeSystem::new();
        loader::load_schema(&ts, SCHEMA).unwrap();
        let int_point = ts
            .instantiate("geometry", &loader::parse_type_instance_ref("Point<int64>").unwrap())
            .unwrap();
        let str_point = ts
            .instantiate("geometry", &loader::parse_type_instance_ref("Point<string>").unwrap())
            .unwrap();

        let v = Value::empty_dictionary();
        v.dict_set("x", Value::int64(1));
        v.dict_set("y", Value::int64(2));

        assert!(validate(&ts, &v, &int_point).is_ok());
        assert_eq!(
            validate(&ts, &v, &str_point).unwrap_err().kind,
            crate::error::RpcErrorKind::TypeError
        );
    }

    #[test]
    fn nested_non_generic_member_type_resolves_via_type_system() {
        let ts = TypeSystem::new();
        loader::load_schema(&ts, SCHEMA).unwrap();
        let segment = ts
            .instantiate("geometry", &loader::parse_type_instance_ref("Segment").unwrap())
            .unwrap();
        let point = Value::empty_dictionary();
        point.dict_set("x", Value::int64(1));
        point.dict_set("y", Value::int64(2));
        let seg = Value::empty_dictionary();
        seg.dict_set("a", point.copy());
        seg.dict_set("b", point);
        assert!(validate(&ts, &seg, &segment).is_ok());
    }

    #[test]
    fn builtin_leaf_matches_by_kind() {
        let ts = TypeSystem::new();
        let i = ts
            .instantiate(GLOBAL_REALM, &loader::parse_type_instance_ref("int64").unwrap())
            .unwrap();
        assert!(validate(&ts, &Value::int64(5), &i).is_ok());
        assert!(validate(&ts, &Value::bool(true), &i).is_err());
    }
}
