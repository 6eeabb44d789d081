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

//! The serializer registry: a process-wide mapping from codec name to a
//! `{serialize, deserialize}` pair (spec.md §4.B). `Fd` leaves are not the
//! registry's concern — the frame layer rewrites them to integers before
//! a serializer ever sees the tree.

pub mod native;
pub mod yaml;

use crate::error::{RpcError, RpcResult};
use crate::value::Value;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;
    fn serialize(&self, value: &Value) -> RpcResult<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> RpcResult<Value>;
}

pub struct CodecRegistry {
    codecs: RwLock<HashMap<&'static str, Arc<dyn Serializer>>>,
}

impl CodecRegistry {
    fn new() -> Self {
        let reg = Self {
            codecs: RwLock::new(HashMap::new()),
        };
        reg.register(Arc::new(yaml::YamlCodec));
        reg.register(Arc::new(native::NativeCodec));
        reg
    }

    pub fn register(&self, codec: Arc<dyn Serializer>) {
        self.codecs.write().insert(codec.name(), codec);
    }

    pub fn get(&self, name: &str) -> RpcResult<Arc<dyn Serializer>> {
        self.codecs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("no such codec `{name}`")))
    }
}

lazy_static! {
    /// The default, process-wide codec registry. Scenarios that want
    /// isolation (tests registering a fake codec) can build their own
    /// `CodecRegistry` instead.
    pub static ref REGISTRY: CodecRegistry = CodecRegistry::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_yaml_and_native() {
        assert!(REGISTRY.get("yaml").is_ok());
        assert!(REGISTRY.get("native").is_ok());
        assert_eq!(REGISTRY.get("msgpack").unwrap_err().kind, crate::error::RpcErrorKind::NotFound);
    }
}
