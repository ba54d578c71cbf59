use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Number, Value};

use crate::ids::SubscriptionId;

/// Marker substituted when normalization re-encounters an object already on
/// the current visiting path.
pub const CIRCULAR_MARKER: &str = "[Circular]";

/// Integers beyond this magnitude lose precision in a JSON number and are
/// rendered as text instead.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

const MAX_DEPTH: usize = 128;

/// A live host-side runtime value. Objects are shared and may form cyclic
/// graphs (parent/child back-references); normalization is the only way to
/// turn one into a transport-safe tree.
#[derive(Clone, Debug)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(i128),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    Set(Vec<HostValue>),
    Object(Arc<HostObject>),
    Callback(SubscriptionId),
}

/// Field of a live object. Function-valued members carry no data and are
/// skipped by normalization.
#[derive(Clone, Debug)]
pub enum Field {
    Value(HostValue),
    Method,
}

/// A live object with ordered, mutable fields.
#[derive(Debug, Default)]
pub struct HostObject {
    fields: RwLock<Vec<(String, Field)>>,
}

impl HostObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_fields<K: Into<String>>(pairs: impl IntoIterator<Item = (K, HostValue)>) -> Arc<Self> {
        let obj = Self::new();
        for (k, v) in pairs {
            obj.set(k, v);
        }
        obj
    }

    /// Set a field, replacing an existing one in place to keep field order.
    pub fn set(&self, key: impl Into<String>, value: HostValue) {
        self.set_field(key.into(), Field::Value(value));
    }

    /// Record a function-valued member.
    pub fn set_method(&self, key: impl Into<String>) {
        self.set_field(key.into(), Field::Method);
    }

    fn set_field(&self, key: String, field: Field) {
        let mut fields = self.fields.write();
        if let Some(slot) = fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = field;
        } else {
            fields.push((key, field));
        }
    }

    /// Read a data field. Function-valued members read as absent.
    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.fields.read().iter().find_map(|(k, f)| {
            if k == key {
                match f {
                    Field::Value(v) => Some(v.clone()),
                    Field::Method => None,
                }
            } else {
                None
            }
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.read().iter().any(|(k, _)| k == key)
    }

    fn snapshot(&self) -> Vec<(String, Field)> {
        self.fields.read().clone()
    }

    fn text_field(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(HostValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Known object shapes, checked in priority order: a host entity (identity
/// string plus type tag) is summarized shallowly; anything else falls back
/// to generic key-by-key normalization.
enum ObjectShape {
    Entity { id: String, entity_type: String },
    Plain,
}

fn classify(obj: &HostObject) -> ObjectShape {
    match (obj.text_field("id"), obj.text_field("type")) {
        (Some(id), Some(entity_type)) => ObjectShape::Entity { id, entity_type },
        _ => ObjectShape::Plain,
    }
}

struct DepthExceeded;

/// Convert an arbitrary live value graph into a transport-safe, cycle-free
/// JSON tree. Never fails: unnormalizable fields degrade to inline markers.
pub fn normalize(value: &HostValue) -> Value {
    let mut visiting = HashSet::new();
    normalize_inner(value, &mut visiting, 0).unwrap_or(Value::Null)
}

fn normalize_inner(
    value: &HostValue,
    visiting: &mut HashSet<usize>,
    depth: usize,
) -> Result<Value, DepthExceeded> {
    if depth > MAX_DEPTH {
        return Err(DepthExceeded);
    }

    Ok(match value {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(*b),
        HostValue::Int(i) => {
            if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                Value::String(i.to_string())
            } else {
                Value::Number((*i).into())
            }
        }
        HostValue::BigInt(i) => Value::String(i.to_string()),
        HostValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        HostValue::Text(s) => Value::String(s.clone()),
        HostValue::Bytes(bytes) => json!({ "__type": "bytes", "data": bytes }),
        HostValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(normalize_inner(item, visiting, depth + 1)?);
            }
            Value::Array(out)
        }
        HostValue::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push(Value::Array(vec![
                    normalize_inner(k, visiting, depth + 1)?,
                    normalize_inner(v, visiting, depth + 1)?,
                ]));
            }
            json!({ "__type": "map", "entries": out })
        }
        HostValue::Set(values) => {
            let mut out = Vec::with_capacity(values.len());
            for v in values {
                out.push(normalize_inner(v, visiting, depth + 1)?);
            }
            json!({ "__type": "set", "values": out })
        }
        HostValue::Callback(id) => json!({ "__type": "callback", "subscriptionId": id }),
        HostValue::Object(obj) => {
            let identity = Arc::as_ptr(obj) as usize;
            if !visiting.insert(identity) {
                return Ok(Value::String(CIRCULAR_MARKER.to_owned()));
            }
            let out = normalize_object(obj, visiting, depth);
            visiting.remove(&identity);
            out?
        }
    })
}

fn normalize_object(
    obj: &HostObject,
    visiting: &mut HashSet<usize>,
    depth: usize,
) -> Result<Value, DepthExceeded> {
    match classify(obj) {
        ObjectShape::Entity { id, entity_type } => Ok(entity_summary(obj, id, entity_type, visiting, depth)),
        ObjectShape::Plain => {
            let mut out = Map::new();
            for (key, field) in obj.snapshot() {
                let value = match field {
                    Field::Method => continue,
                    Field::Value(v) => v,
                };
                match normalize_inner(&value, visiting, depth + 1) {
                    Ok(normalized) => {
                        out.insert(key, normalized);
                    }
                    Err(DepthExceeded) => {
                        out.insert(key.clone(), Value::String(format!("[Error serializing {key}]")));
                    }
                }
            }
            Ok(Value::Object(out))
        }
    }
}

/// Shallow summary for entity-shaped objects: identity, type, name,
/// visibility if present, and a one-level-deep children listing. Bounds the
/// cost of normalizing deep trees.
fn entity_summary(
    obj: &HostObject,
    id: String,
    entity_type: String,
    visiting: &mut HashSet<usize>,
    depth: usize,
) -> Value {
    let mut out = Map::new();
    out.insert("id".to_owned(), Value::String(id));
    out.insert("type".to_owned(), Value::String(entity_type));
    out.insert(
        "name".to_owned(),
        obj.text_field("name").map(Value::String).unwrap_or(Value::Null),
    );

    if let Some(HostValue::Bool(visible)) = obj.get("visible") {
        out.insert("visible".to_owned(), Value::Bool(visible));
    }

    if let Some(HostValue::List(children)) = obj.get("children") {
        let summarized: Vec<Value> = children
            .iter()
            .map(|child| match child {
                HostValue::Object(c) => match classify(c) {
                    ObjectShape::Entity { id, entity_type } => json!({
                        "id": id,
                        "type": entity_type,
                        "name": c.text_field("name").map(Value::String).unwrap_or(Value::Null),
                    }),
                    ObjectShape::Plain => {
                        normalize_inner(child, visiting, depth + 1).unwrap_or(Value::Null)
                    }
                },
                other => normalize_inner(other, visiting, depth + 1).unwrap_or(Value::Null),
            })
            .collect();
        out.insert("children".to_owned(), Value::Array(summarized));
    }

    Value::Object(out)
}

impl From<&Value> for HostValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    HostValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    HostValue::BigInt(u as i128)
                } else {
                    HostValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => HostValue::Text(s.clone()),
            Value::Array(items) => HostValue::List(items.iter().map(HostValue::from).collect()),
            Value::Object(map) => {
                let obj = HostObject::new();
                for (k, v) in map {
                    obj.set(k.clone(), HostValue::from(v));
                }
                HostValue::Object(obj)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_pass_through() {
        assert_eq!(normalize(&HostValue::Null), Value::Null);
        assert_eq!(normalize(&HostValue::Bool(true)), json!(true));
        assert_eq!(normalize(&HostValue::Int(42)), json!(42));
        assert_eq!(normalize(&HostValue::Float(1.5)), json!(1.5));
        assert_eq!(normalize(&HostValue::Text("hi".into())), json!("hi"));
    }

    #[test]
    fn large_integers_render_as_text() {
        assert_eq!(normalize(&HostValue::Int(MAX_SAFE_INTEGER)), json!(MAX_SAFE_INTEGER));
        assert_eq!(
            normalize(&HostValue::Int(MAX_SAFE_INTEGER + 1)),
            json!("9007199254740992")
        );
        assert_eq!(
            normalize(&HostValue::BigInt(170_141_183_460_469_231_731_687_303_715i128)),
            json!("170141183460469231731687303715")
        );
    }

    #[test]
    fn nan_canonicalizes_to_null() {
        assert_eq!(normalize(&HostValue::Float(f64::NAN)), Value::Null);
    }

    #[test]
    fn bytes_become_tagged_structure() {
        let out = normalize(&HostValue::Bytes(vec![1, 2, 255]));
        assert_eq!(out, json!({ "__type": "bytes", "data": [1, 2, 255] }));
    }

    #[test]
    fn maps_and_sets_preserve_entry_order() {
        let map = HostValue::Map(vec![
            (HostValue::Text("b".into()), HostValue::Int(2)),
            (HostValue::Text("a".into()), HostValue::Int(1)),
        ]);
        assert_eq!(
            normalize(&map),
            json!({ "__type": "map", "entries": [["b", 2], ["a", 1]] })
        );

        let set = HostValue::Set(vec![HostValue::Int(3), HostValue::Int(1)]);
        assert_eq!(normalize(&set), json!({ "__type": "set", "values": [3, 1] }));
    }

    #[test]
    fn self_referential_graph_yields_single_circular_marker() {
        let obj = HostObject::new();
        obj.set("label", HostValue::Text("loop".into()));
        obj.set("me", HostValue::Object(Arc::clone(&obj)));

        let out = normalize(&HostValue::Object(obj));
        assert_eq!(out["label"], json!("loop"));
        assert_eq!(out["me"], json!(CIRCULAR_MARKER));

        let rendered = out.to_string();
        assert_eq!(rendered.matches(CIRCULAR_MARKER).count(), 1);
    }

    #[test]
    fn shared_but_acyclic_objects_are_not_marked_circular() {
        let shared = HostObject::with_fields([("x", HostValue::Int(1))]);
        let parent = HostObject::new();
        parent.set("a", HostValue::Object(Arc::clone(&shared)));
        parent.set("b", HostValue::Object(shared));

        let out = normalize(&HostValue::Object(parent));
        assert_eq!(out["a"], json!({ "x": 1 }));
        assert_eq!(out["b"], json!({ "x": 1 }));
    }

    #[test]
    fn entity_objects_summarize_shallowly() {
        let child = HostObject::with_fields([
            ("id", HostValue::Text("1:2".into())),
            ("type", HostValue::Text("TEXT".into())),
            ("name", HostValue::Text("Label".into())),
            ("opacity", HostValue::Float(0.5)),
        ]);
        let entity = HostObject::with_fields([
            ("id", HostValue::Text("1:1".into())),
            ("type", HostValue::Text("FRAME".into())),
            ("name", HostValue::Text("Hero".into())),
            ("visible", HostValue::Bool(true)),
            ("children", HostValue::List(vec![HostValue::Object(child)])),
        ]);

        let out = normalize(&HostValue::Object(entity));
        assert_eq!(out["id"], json!("1:1"));
        assert_eq!(out["type"], json!("FRAME"));
        assert_eq!(out["name"], json!("Hero"));
        assert_eq!(out["visible"], json!(true));
        // Children are summarized one level deep, not recursively normalized.
        assert_eq!(
            out["children"],
            json!([{ "id": "1:2", "type": "TEXT", "name": "Label" }])
        );
    }

    #[test]
    fn entity_back_references_terminate() {
        let parent = HostObject::with_fields([
            ("id", HostValue::Text("1:1".into())),
            ("type", HostValue::Text("FRAME".into())),
        ]);
        let child = HostObject::with_fields([
            ("id", HostValue::Text("1:2".into())),
            ("type", HostValue::Text("TEXT".into())),
            ("parent", HostValue::Object(Arc::clone(&parent))),
        ]);
        parent.set("children", HostValue::List(vec![HostValue::Object(child)]));

        let out = normalize(&HostValue::Object(parent));
        assert_eq!(out["children"][0]["id"], json!("1:2"));
    }

    #[test]
    fn function_members_are_skipped() {
        let obj = HostObject::new();
        obj.set("width", HostValue::Int(800));
        obj.set_method("resize");

        let out = normalize(&HostValue::Object(obj));
        assert_eq!(out, json!({ "width": 800 }));
    }

    #[test]
    fn field_normalization_failure_degrades_to_marker() {
        // Build a chain deeper than the recursion bound under one field.
        let mut deep = HostValue::Int(0);
        for _ in 0..200 {
            deep = HostValue::List(vec![deep]);
        }
        let obj = HostObject::new();
        obj.set("ok", HostValue::Int(1));
        obj.set("deep", deep);

        let out = normalize(&HostValue::Object(obj));
        assert_eq!(out["ok"], json!(1));
        assert_eq!(out["deep"], json!("[Error serializing deep]"));
    }

    #[test]
    fn callback_slots_render_as_tagged_reference() {
        let id = SubscriptionId::from_raw("sub_1");
        let out = normalize(&HostValue::Callback(id));
        assert_eq!(out, json!({ "__type": "callback", "subscriptionId": "sub_1" }));
    }

    #[test]
    fn normalization_is_idempotent() {
        let value = HostValue::List(vec![
            HostValue::Int(1),
            HostValue::Text("x".into()),
            HostValue::Bytes(vec![9]),
            HostValue::Map(vec![(HostValue::Text("k".into()), HostValue::Int(2))]),
            HostValue::Object(HostObject::with_fields([("a", HostValue::Bool(false))])),
        ]);
        let once = normalize(&value);
        let twice = normalize(&HostValue::from(&once));
        assert_eq!(once, twice);
    }
}
