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

//! The IDL / type system: a loadable schema of structs, unions, enums,
//! typedefs, generics and function signatures, used to validate payloads
//! and describe methods.
//!
//! The type system is scoped as an explicit handle (`TypeSystem`) rather
//! than a hidden process-wide singleton, per spec.md §9, so isolated
//! schemas can coexist in tests. [`TypeSystem::default_instance`] exposes
//! a lazily-built shared instance for ergonomics only.

pub mod loader;
pub mod validate;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const GLOBAL_REALM: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Struct,
    Union,
    Enum,
    Typedef,
    Builtin,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub type_instance: TypeInstanceRef,
    pub description: Option<String>,
}

/// An unresolved reference to a type instance, as written in a schema
/// (`T<A,B>`). Resolved lazily by [`loader`] against a realm.
#[derive(Debug, Clone)]
pub struct TypeInstanceRef {
    pub name: String,
    pub args: Vec<TypeInstanceRef>,
}

impl TypeInstanceRef {
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub realm: String,
    pub name: String,
    pub description: Option<String>,
    /// Ordered, matching the IDL's `arguments: [{name, type}, ...]`.
    pub arguments: Vec<(String, TypeInstanceRef)>,
    pub result: Option<TypeInstanceRef>,
}

/// A declared type: struct, union, enum, typedef or a built-in leaf.
#[derive(Debug)]
pub struct Type {
    pub realm: String,
    pub name: String,
    pub class: TypeClass,
    pub parent: Option<Arc<Type>>,
    /// Own members only; `all_members` also walks `parent`.
    pub members: Vec<Member>,
    pub generic_vars: Vec<String>,
    /// For `Enum`: the declared variant names.
    pub variants: Vec<String>,
    pub description: Option<String>,
}

impl Type {
    pub fn is_generic(&self) -> bool {
        !self.generic_vars.is_empty()
    }

    /// Own members plus every ancestor's, by reference (inherited members
    /// are shared, never duplicated or mutated after load).
    pub fn all_members(&self) -> Vec<&Member> {
        let mut out = Vec::new();
        if let Some(parent) = &self.parent {
            out.extend(parent.all_members());
        }
        out.extend(self.members.iter());
        out
    }
}

/// A type applied to zero or more type-instance arguments. Fully
/// specialized iff no argument is itself an unresolved generic variable.
#[derive(Debug)]
pub struct TypeInstance {
    pub ty: Arc<Type>,
    pub args: Vec<Arc<TypeInstance>>,
}

impl TypeInstance {
    /// `Name` for non-generics, `Name<canon(a0),canon(a1),...>` otherwise.
    pub fn canonical_name(&self) -> String {
        if self.args.is_empty() {
            return self.ty.name.clone();
        }
        let inner: Vec<String> = self.args.iter().map(|a| a.canonical_name()).collect();
        format!("{}<{}>", self.ty.name, inner.join(","))
    }

    pub fn is_fully_specialized(&self) -> bool {
        self.args.iter().all(|a| a.is_fully_specialized())
    }
}

/// A namespace of types and functions keyed by unique name. The realm
/// named `*` is the global realm holding built-ins.
pub struct Realm {
    pub name: String,
    types: RwLock<HashMap<String, Arc<Type>>>,
    functions: RwLock<HashMap<String, Arc<Function>>>,
}

impl Realm {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_type(&self, name: &str) -> Option<Arc<Type>> {
        self.types.read().get(name).cloned()
    }

    pub fn get_function(&self, name: &str) -> Option<Arc<Function>> {
        self.functions.read().get(name).cloned()
    }

    fn insert_type(&self, ty: Arc<Type>) {
        self.types.write().insert(ty.name.clone(), ty);
    }

    fn insert_function(&self, f: Arc<Function>) {
        self.functions.write().insert(f.name.clone(), f);
    }
}

/// An explicit handle to a loaded schema: a set of realms plus the
/// global (`*`) realm's built-ins, pre-registered at construction.
pub struct TypeSystem {
    realms: RwLock<HashMap<String, Arc<Realm>>>,
}

const BUILTIN_LEAVES: &[&str] = &[
    "null",
    "bool",
    "uint64",
    "int64",
    "double",
    "date",
    "string",
    "binary",
    "fd",
    "dictionary",
    "array",
    "shmem",
    "error",
    "any",
];

impl TypeSystem {
    pub fn new() -> Arc<Self> {
        let ts = Arc::new(Self {
            realms: RwLock::new(HashMap::new()),
        });
        let global = ts.realm_or_create(GLOBAL_REALM);
        for leaf in BUILTIN_LEAVES {
            global.insert_type(Arc::new(Type {
                realm: GLOBAL_REALM.to_string(),
                name: leaf.to_string(),
                class: TypeClass::Builtin,
                parent: None,
                members: Vec::new(),
                generic_vars: Vec::new(),
                variants: Vec::new(),
                description: None,
            }));
        }
        ts
    }

    /// A process-wide shared instance, for callers that don't need
    /// isolated schemas. Prefer [`TypeSystem::new`] in tests.
    pub fn default_instance() -> Arc<Self> {
        lazy_static::lazy_static! {
            static ref DEFAULT: Arc<TypeSystem> = TypeSystem::new();
        }
        DEFAULT.clone()
    }

    pub fn realm_or_create(&self, name: &str) -> Arc<Realm> {
        if let Some(r) = self.realms.read().get(name) {
            return r.clone();
        }
        let mut w = self.realms.write();
        w.entry(name.to_string())
            .or_insert_with(|| Arc::new(Realm::new(name)))
            .clone()
    }

    pub fn realm(&self, name: &str) -> Option<Arc<Realm>> {
        self.realms.read().get(name).cloned()
    }

    /// Looks up `name` in `realm`, falling back to the global realm.
    pub fn find_type(&self, realm: &str, name: &str) -> Option<Arc<Type>> {
        if let Some(r) = self.realm(realm) {
            if let Some(t) = r.get_type(name) {
                return Some(t);
            }
        }
        self.realm(GLOBAL_REALM).and_then(|r| r.get_type(name))
    }

    pub fn find_function(&self, realm: &str, name: &str) -> Option<Arc<Function>> {
        if let Some(r) = self.realm(realm) {
            if let Some(f) = r.get_function(name) {
                return Some(f);
            }
        }
        self.realm(GLOBAL_REALM).and_then(|r| r.get_function(name))
    }

    pub(crate) fn register_type(&self, realm: &str, ty: Arc<Type>) {
        self.realm_or_create(realm).insert_type(ty);
    }

    pub(crate) fn register_function(&self, realm: &str, f: Arc<Function>) {
        self.realm_or_create(realm).insert_function(f);
    }

    /// Resolves `T<A,B>` (or a bare `T`) against `realm`, recursively
    /// instantiating generic arguments. Arity mismatch or an unknown
    /// type name fails.
    pub fn instantiate(
        &self,
        realm: &str,
        reference: &TypeInstanceRef,
    ) -> crate::error::RpcResult<Arc<TypeInstance>> {
        let ty = self.find_type(realm, &reference.name).ok_or_else(|| {
            crate::error::RpcError::not_found(format!("unknown type `{}`", reference.name))
        })?;
        if ty.generic_vars.len() != reference.args.len() {
            return Err(crate::error::RpcError::invalid_argument(format!(
                "`{}` expects {} type argument(s), got {}",
                ty.name,
                ty.generic_vars.len(),
                reference.args.len()
            )));
        }
        let mut args = Vec::with_capacity(reference.args.len());
        for a in &reference.args {
            args.push(self.instantiate(realm, a)?);
        }
        Ok(Arc::new(TypeInstance { ty, args }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered_in_global_realm() {
        let ts = TypeSystem::new();
        assert!(ts.find_type(GLOBAL_REALM, "int64").is_some());
        assert!(ts.find_type("anything", "int64").is_some(), "falls back to *");
    }

    #[test]
    fn unknown_type_fails_instantiation() {
        let ts = TypeSystem::new();
        let err = ts
            .instantiate(GLOBAL_REALM, &TypeInstanceRef::leaf("NoSuchType"))
            .unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::NotFound);
    }

    #[test]
    fn extraneous_args_on_a_non_generic_type_fail_instantiation() {
        let ts = TypeSystem::new();
        let bogus = TypeInstanceRef {
            name: "int64".to_string(),
            args: vec![TypeInstanceRef::leaf("string")],
        };
        let err = ts.instantiate(GLOBAL_REALM, &bogus).unwrap_err();
        assert_eq!(err.kind, crate::error::RpcErrorKind::InvalidArgument);
    }
}
