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

//! The value tree: a tagged, recursively structured, reference-counted
//! payload type shared by the frame layer, the call multiplexer and the
//! IDL validator.
//!
//! Reference counting is not hand-rolled here: `Array` and `Dictionary`
//! hold an `Arc<Mutex<..>>`, so `Clone` is `retain` and `Drop` is
//! `release` for free, with the recursive-free-at-zero behaviour spec.md
//! asks for coming from `Arc`'s own drop glue. `retain`/`release` are
//! still exposed as named methods for callers translating from the
//! C original's explicit calling convention.

pub mod pack;

use crate::idl::TypeInstance;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::unix::io::RawFd;
use std::sync::Arc;

pub type Array = Arc<Mutex<Vec<Value>>>;
pub type Dictionary = Arc<Mutex<HashMap<String, Value>>>;

/// A binary blob. `borrowed` records whether the producer asserted that
/// the memory outlives this value (the C original's non-owning buffers);
/// since `Bytes` always owns its storage in safe Rust, this is metadata
/// only — see DESIGN.md for the rationale.
#[derive(Clone)]
pub struct BinaryValue {
    pub data: bytes::Bytes,
    pub borrowed: bool,
}

impl BinaryValue {
    pub fn owned(data: impl Into<bytes::Bytes>) -> Self {
        Self {
            data: data.into(),
            borrowed: false,
        }
    }

    pub fn borrowed(data: impl Into<bytes::Bytes>) -> Self {
        Self {
            data: data.into(),
            borrowed: true,
        }
    }
}

impl fmt::Debug for BinaryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryValue")
            .field("len", &self.data.len())
            .field("borrowed", &self.borrowed)
            .finish()
    }
}

impl PartialEq for BinaryValue {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// The kind discriminant, mirroring spec.md §3's sum type.
#[derive(Clone)]
pub enum ValueKind {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// Unix UTC seconds.
    Date(i64),
    String(Arc<str>),
    Binary(BinaryValue),
    /// A non-owning descriptor: ownership belongs to whoever put it here.
    Fd(RawFd),
    Array(Array),
    Dictionary(Dictionary),
}

/// A value in the tree. Carries an optional, non-owning link to the IDL
/// type instance it was constructed against (set by the type system on
/// construction, never by hand).
#[derive(Clone)]
pub struct Value {
    kind: ValueKind,
    ty: Option<Arc<TypeInstance>>,
}

impl Value {
    fn of(kind: ValueKind) -> Self {
        Self { kind, ty: None }
    }

    pub fn null() -> Self {
        Self::of(ValueKind::Null)
    }

    pub fn bool(v: bool) -> Self {
        Self::of(ValueKind::Bool(v))
    }

    pub fn int64(v: i64) -> Self {
        Self::of(ValueKind::Int64(v))
    }

    pub fn uint64(v: u64) -> Self {
        Self::of(ValueKind::UInt64(v))
    }

    pub fn double(v: f64) -> Self {
        Self::of(ValueKind::Double(v))
    }

    pub fn date(unix_utc_seconds: i64) -> Self {
        Self::of(ValueKind::Date(unix_utc_seconds))
    }

    pub fn string(v: impl Into<Arc<str>>) -> Self {
        Self::of(ValueKind::String(v.into()))
    }

    pub fn binary(v: BinaryValue) -> Self {
        Self::of(ValueKind::Binary(v))
    }

    pub fn fd(fd: RawFd) -> Self {
        Self::of(ValueKind::Fd(fd))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::of(ValueKind::Array(Arc::new(Mutex::new(items))))
    }

    pub fn empty_array() -> Self {
        Self::array(Vec::new())
    }

    pub fn dictionary(items: HashMap<String, Value>) -> Self {
        Self::of(ValueKind::Dictionary(Arc::new(Mutex::new(items))))
    }

    pub fn empty_dictionary() -> Self {
        Self::dictionary(HashMap::new())
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    /// Non-owning link to the IDL type instance this value was built
    /// against, if any.
    pub fn type_instance(&self) -> Option<&Arc<TypeInstance>> {
        self.ty.as_ref()
    }

    pub fn with_type_instance(mut self, ty: Arc<TypeInstance>) -> Self {
        self.ty = Some(ty);
        self
    }

    /// The kind tag as a short name, used by `describe` and error messages.
    pub fn get_type(&self) -> &'static str {
        match &self.kind {
            ValueKind::Null => "null",
            ValueKind::Bool(_) => "bool",
            ValueKind::Int64(_) => "int64",
            ValueKind::UInt64(_) => "uint64",
            ValueKind::Double(_) => "double",
            ValueKind::Date(_) => "date",
            ValueKind::String(_) => "string",
            ValueKind::Binary(_) => "binary",
            ValueKind::Fd(_) => "fd",
            ValueKind::Array(_) => "array",
            ValueKind::Dictionary(_) => "dictionary",
        }
    }

    /// Atomic increment, in spec.md's vocabulary. Implemented as a clone
    /// of the Arc-backed handle — see module docs.
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Atomic decrement; a no-op beyond dropping the handle, since `Drop`
    /// already recurses through `Arc`'s own release-on-zero.
    pub fn release(self) {
        drop(self)
    }

    /// A deep, independent copy: mutating the result never mutates self.
    pub fn copy(&self) -> Self {
        let kind = match &self.kind {
            ValueKind::Null => ValueKind::Null,
            ValueKind::Bool(b) => ValueKind::Bool(*b),
            ValueKind::Int64(i) => ValueKind::Int64(*i),
            ValueKind::UInt64(u) => ValueKind::UInt64(*u),
            ValueKind::Double(d) => ValueKind::Double(*d),
            ValueKind::Date(d) => ValueKind::Date(*d),
            ValueKind::String(s) => ValueKind::String(s.clone()),
            ValueKind::Binary(b) => ValueKind::Binary(b.clone()),
            ValueKind::Fd(fd) => ValueKind::Fd(*fd),
            ValueKind::Array(a) => {
                let items: Vec<Value> = a.lock().iter().map(Value::copy).collect();
                ValueKind::Array(Arc::new(Mutex::new(items)))
            }
            ValueKind::Dictionary(d) => {
                let items: HashMap<String, Value> = d
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.copy()))
                    .collect();
                ValueKind::Dictionary(Arc::new(Mutex::new(items)))
            }
        };
        Self {
            kind,
            ty: self.ty.clone(),
        }
    }

    // -- array operations --------------------------------------------------

    fn as_array(&self) -> Option<&Array> {
        match &self.kind {
            ValueKind::Array(a) => Some(a),
            _ => None,
        }
    }

    fn as_dictionary(&self) -> Option<&Dictionary> {
        match &self.kind {
            ValueKind::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Number of elements, for arrays and dictionaries only; `0` otherwise.
    pub fn count(&self) -> usize {
        if let Some(a) = self.as_array() {
            return a.lock().len();
        }
        if let Some(d) = self.as_dictionary() {
            return d.lock().len();
        }
        0
    }

    /// Appends a value to an array, retaining it (i.e. just storing the
    /// handle — no extra work needed thanks to `Arc`).
    pub fn array_append(&self, v: Value) {
        if let Some(a) = self.as_array() {
            a.lock().push(v);
        }
    }

    /// Returns a retained handle to the element at `index`, or `None` if
    /// out of range — spec.md calls this "a null pointer signal, not an
    /// error kind".
    pub fn array_get(&self, index: usize) -> Option<Value> {
        self.as_array().and_then(|a| a.lock().get(index).cloned())
    }

    /// Sets the element at `index`, padding with `Null` if `index` is
    /// beyond the current length. Releases (by dropping) the prior
    /// occupant when overwriting.
    pub fn array_set(&self, index: usize, v: Value) {
        if let Some(a) = self.as_array() {
            let mut guard = a.lock();
            if index >= guard.len() {
                guard.resize_with(index + 1, Value::null);
            }
            guard[index] = v;
        }
    }

    /// Like `array_get`, but removes the element from the array, handing
    /// ownership to the caller without an extra retain.
    pub fn array_steal(&self, index: usize) -> Option<Value> {
        self.as_array().and_then(|a| {
            let mut guard = a.lock();
            if index < guard.len() {
                Some(guard.remove(index))
            } else {
                None
            }
        })
    }

    /// Removes the element at `index`. The C original's bounds check was
    /// inverted (spec.md §9); this requires `index < count`.
    pub fn array_remove(&self, index: usize) -> bool {
        if let Some(a) = self.as_array() {
            let mut guard = a.lock();
            if index < guard.len() {
                guard.remove(index);
                return true;
            }
        }
        false
    }

    /// Visits every element in index order, stopping early if the visitor
    /// returns `false`. Returns whether iteration broke early.
    pub fn array_apply(&self, mut visitor: impl FnMut(usize, &Value) -> bool) -> bool {
        if let Some(a) = self.as_array() {
            let guard = a.lock();
            for (i, v) in guard.iter().enumerate() {
                if !visitor(i, v) {
                    return true;
                }
            }
        }
        false
    }

    // -- dictionary operations ----------------------------------------------

    pub fn has_key(&self, key: &str) -> bool {
        self.as_dictionary()
            .map(|d| d.lock().contains_key(key))
            .unwrap_or(false)
    }

    pub fn dict_set(&self, key: impl Into<String>, v: Value) {
        if let Some(d) = self.as_dictionary() {
            d.lock().insert(key.into(), v);
        }
    }

    pub fn dict_get(&self, key: &str) -> Option<Value> {
        self.as_dictionary().and_then(|d| d.lock().get(key).cloned())
    }

    pub fn dict_steal(&self, key: &str) -> Option<Value> {
        self.as_dictionary().and_then(|d| d.lock().remove(key))
    }

    pub fn dict_remove(&self, key: &str) -> bool {
        self.as_dictionary()
            .map(|d| d.lock().remove(key).is_some())
            .unwrap_or(false)
    }

    /// Visits every entry; order is stable for the duration of one call as
    /// long as nothing mutates the dictionary concurrently, but otherwise
    /// unspecified, per spec.md.
    pub fn dict_apply(&self, mut visitor: impl FnMut(&str, &Value) -> bool) -> bool {
        if let Some(d) = self.as_dictionary() {
            let guard = d.lock();
            for (k, v) in guard.iter() {
                if !visitor(k, v) {
                    return true;
                }
            }
        }
        false
    }

    /// Human-readable, indented, type-tagged rendering.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        describe_into(self, 0, &mut out);
        out
    }
}

fn describe_into(v: &Value, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match &v.kind {
        ValueKind::Array(a) => {
            out.push_str(&format!("{pad}array[{}] {{\n", a.lock().len()));
            for item in a.lock().iter() {
                out.push_str(&pad);
                out.push_str("  ");
                describe_into(item, indent + 1, out);
                out.push('\n');
            }
            out.push_str(&pad);
            out.push('}');
        }
        ValueKind::Dictionary(d) => {
            out.push_str(&format!("{pad}dictionary[{}] {{\n", d.lock().len()));
            for (k, item) in d.lock().iter() {
                out.push_str(&pad);
                out.push_str(&format!("  {k}: "));
                describe_into(item, indent + 1, out);
                out.push('\n');
            }
            out.push_str(&pad);
            out.push('}');
        }
        other => out.push_str(&format!("{}({})", v.get_type(), describe_scalar(other))),
    }
}

fn describe_scalar(kind: &ValueKind) -> String {
    match kind {
        ValueKind::Null => String::new(),
        ValueKind::Bool(b) => b.to_string(),
        ValueKind::Int64(i) => i.to_string(),
        ValueKind::UInt64(u) => u.to_string(),
        ValueKind::Double(d) => d.to_string(),
        ValueKind::Date(d) => d.to_string(),
        ValueKind::String(s) => s.to_string(),
        ValueKind::Binary(b) => format!("{} bytes", b.data.len()),
        ValueKind::Fd(fd) => fd.to_string(),
        ValueKind::Array(_) | ValueKind::Dictionary(_) => unreachable!(),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Bool(a), ValueKind::Bool(b)) => a == b,
            (ValueKind::Int64(a), ValueKind::Int64(b)) => a == b,
            (ValueKind::UInt64(a), ValueKind::UInt64(b)) => a == b,
            (ValueKind::Double(a), ValueKind::Double(b)) => a == b,
            (ValueKind::Date(a), ValueKind::Date(b)) => a == b,
            (ValueKind::String(a), ValueKind::String(b)) => a == b,
            (ValueKind::Binary(a), ValueKind::Binary(b)) => a == b,
            (ValueKind::Fd(a), ValueKind::Fd(b)) => a == b,
            (ValueKind::Array(a), ValueKind::Array(b)) => {
                let (ga, gb) = (a.lock(), b.lock());
                ga.len() == gb.len() && ga.iter().zip(gb.iter()).all(|(x, y)| x == y)
            }
            (ValueKind::Dictionary(a), ValueKind::Dictionary(b)) => {
                let (ga, gb) = (a.lock(), b.lock());
                ga.len() == gb.len()
                    && ga.iter().all(|(k, v)| gb.get(k).map(|w| w == v).unwrap_or(false))
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

/// A fast summary, asserted only as a necessary (not sufficient)
/// condition for equality, per spec.md §3.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.kind).hash(state);
        match &self.kind {
            ValueKind::Null => {}
            ValueKind::Bool(b) => b.hash(state),
            ValueKind::Int64(i) => i.hash(state),
            ValueKind::UInt64(u) => u.hash(state),
            ValueKind::Double(d) => d.to_bits().hash(state),
            ValueKind::Date(d) => d.hash(state),
            ValueKind::String(s) => s.hash(state),
            ValueKind::Binary(b) => b.data.hash(state),
            ValueKind::Fd(fd) => fd.hash(state),
            ValueKind::Array(a) => {
                for item in a.lock().iter() {
                    item.hash(state);
                }
            }
            ValueKind::Dictionary(d) => {
                // Unordered: fold entry hashes with addition so iteration
                // order (which is unspecified for dictionaries) doesn't
                // change the summary.
                let mut acc: u64 = 0;
                for (k, v) in d.lock().iter() {
                    let mut h = std::collections::hash_map::DefaultHasher::new();
                    k.hash(&mut h);
                    v.hash(&mut h);
                    acc = acc.wrapping_add(h.finish());
                }
                acc.hash(state);
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_is_deep() {
        let inner = Value::array(vec![Value::int64(1), Value::int64(2)]);
        let outer = Value::array(vec![inner.clone()]);
        let copied = outer.copy();
        copied.array_get(0).unwrap().array_set(0, Value::int64(99));
        assert_eq!(outer.array_get(0).unwrap().array_get(0), Some(Value::int64(1)));
        assert_eq!(copied.array_get(0).unwrap().array_get(0), Some(Value::int64(99)));
    }

    #[test]
    fn equal_implies_hash_equal() {
        let a = Value::dictionary(HashMap::from([
            ("x".to_string(), Value::int64(1)),
            ("y".to_string(), Value::string("hi")),
        ]));
        let b = a.copy();
        assert_eq!(a, b);
        use std::collections::hash_map::DefaultHasher;
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn array_set_pads_with_null() {
        let a = Value::empty_array();
        a.array_set(2, Value::bool(true));
        assert_eq!(a.count(), 3);
        assert_eq!(a.array_get(0), Some(Value::null()));
        assert_eq!(a.array_get(2), Some(Value::bool(true)));
    }

    #[test]
    fn array_get_out_of_range_is_none() {
        let a = Value::array(vec![Value::int64(1)]);
        assert_eq!(a.array_get(5), None);
    }

    #[test]
    fn array_remove_requires_in_bounds() {
        let a = Value::array(vec![Value::int64(1)]);
        assert!(!a.array_remove(4));
        assert!(a.array_remove(0));
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn apply_can_break_early() {
        let a = Value::array(vec![Value::int64(1), Value::int64(2), Value::int64(3)]);
        let mut seen = Vec::new();
        let broke = a.array_apply(|_, v| {
            if let ValueKind::Int64(i) = v.kind() {
                seen.push(*i);
                *i != 2
            } else {
                true
            }
        });
        assert!(broke);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn dict_has_key_and_remove() {
        let d = Value::empty_dictionary();
        d.dict_set("a", Value::int64(1));
        assert!(d.has_key("a"));
        assert!(!d.has_key("b"));
        assert!(d.dict_remove("a"));
        assert!(!d.has_key("a"));
    }

    #[test]
    fn retain_clones_the_handle() {
        let a = Value::array(vec![Value::int64(1)]);
        let retained = a.retain();
        a.array_append(Value::int64(2));
        assert_eq!(retained.count(), 2, "retain shares the same backing storage");
    }
}
