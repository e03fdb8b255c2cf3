//! Document tree and identifier codec.
//!
//! Handlers return a [`Document`]: JSON-like data that may additionally hold
//! binary identifiers, raw byte blobs and lazily materialized model views.
//! Before a result crosses the message bus it is [`encode`]d: every
//! [`ObjectId`] becomes `{ "$objectId": "<24 hex>" }`. Bus responses are
//! [`decode`]d in the opposite direction. Both transforms are pure and return
//! new trees.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::ObjectId;

/// Key of the single-entry object that carries an identifier on the wire.
pub const OBJECT_ID_KEY: &str = "$objectId";

/// A view over stored data that is only converted to plain data on demand
/// (e.g. an ORM model instance).
pub trait Materialize: Send + Sync + fmt::Debug {
    fn materialize(&self) -> Document;
}

/// Result tree produced by action handlers.
#[derive(Clone, Default)]
pub enum Document {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Document>),
    Object(BTreeMap<String, Document>),
    ObjectId(ObjectId),
    Binary(Bytes),
    Model(Arc<dyn Materialize>),
}

impl Document {
    /// Build an object from key/value pairs.
    pub fn object<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Document>,
        I: IntoIterator<Item = (K, V)>,
    {
        Document::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Document::Null)
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        match self {
            Document::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Document::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Document::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    /// Replace model views by their plain data, recursively.
    pub fn materialized(&self) -> Document {
        match self {
            Document::Model(model) => model.materialize().materialized(),
            Document::Array(items) => Document::Array(items.iter().map(Self::materialized).collect()),
            Document::Object(map) => Document::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.materialized()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Plain JSON view. Identifiers render as hex strings, blobs as byte arrays.
    pub fn to_json(&self) -> Value {
        match self {
            Document::Null => Value::Null,
            Document::Bool(b) => Value::Bool(*b),
            Document::Number(n) => Value::Number(n.clone()),
            Document::String(s) => Value::String(s.clone()),
            Document::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Document::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Document::ObjectId(id) => Value::String(id.to_hex()),
            Document::Binary(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
            Document::Model(model) => model.materialize().to_json(),
        }
    }
}

/// Replace every identifier with its wire object.
///
/// Null entries stay null, binary blobs are not walked, model views are
/// materialized first.
pub fn encode(doc: &Document) -> Document {
    match doc {
        Document::ObjectId(id) => wire_object_id(id),
        Document::Model(model) => encode(&model.materialize()),
        Document::Array(items) => Document::Array(items.iter().map(encode).collect()),
        Document::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode(v)))
                .collect(),
        ),
        Document::Null
        | Document::Bool(_)
        | Document::Number(_)
        | Document::String(_)
        | Document::Binary(_) => doc.clone(),
    }
}

/// Replace every exact `{ "$objectId": "<24 hex>" }` object with an
/// identifier. Objects with extra keys or invalid hex are walked as plain
/// objects.
pub fn decode(doc: &Document) -> Document {
    match doc {
        Document::Object(map) => match wire_hex(map) {
            Some(id) => Document::ObjectId(id),
            None => Document::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), decode(v)))
                    .collect(),
            ),
        },
        Document::Array(items) => Document::Array(items.iter().map(decode).collect()),
        Document::Model(model) => decode(&model.materialize()),
        _ => doc.clone(),
    }
}

/// Decode a JSON value received from the bus.
pub fn decode_json(value: Value) -> Document {
    decode(&Document::from(value))
}

fn wire_object_id(id: &ObjectId) -> Document {
    let mut map = BTreeMap::new();
    map.insert(OBJECT_ID_KEY.to_string(), Document::String(id.to_hex()));
    Document::Object(map)
}

fn wire_hex(map: &BTreeMap<String, Document>) -> Option<ObjectId> {
    if map.len() != 1 {
        return None;
    }
    map.get(OBJECT_ID_KEY)?
        .as_str()
        .and_then(|hex| ObjectId::parse_str(hex).ok())
}

/// Parse an identifier given either as a bare hex string or as a wire object.
pub fn object_id_from_json(value: &Value) -> Option<ObjectId> {
    match value {
        Value::String(s) => ObjectId::parse_str(s).ok(),
        Value::Object(map) if map.len() == 1 => map
            .get(OBJECT_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| ObjectId::parse_str(s).ok()),
        _ => None,
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Document::Model(a), b) => a.materialize() == *b,
            (a, Document::Model(b)) => *a == b.materialize(),
            (Document::Null, Document::Null) => true,
            (Document::Bool(a), Document::Bool(b)) => a == b,
            (Document::Number(a), Document::Number(b)) => a == b,
            (Document::String(a), Document::String(b)) => a == b,
            (Document::Array(a), Document::Array(b)) => a == b,
            (Document::Object(a), Document::Object(b)) => a == b,
            (Document::ObjectId(a), Document::ObjectId(b)) => a == b,
            (Document::Binary(a), Document::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Document::Null => f.write_str("Null"),
            Document::Bool(b) => write!(f, "Bool({b})"),
            Document::Number(n) => write!(f, "Number({n})"),
            Document::String(s) => write!(f, "String({s:?})"),
            Document::Array(items) => f.debug_list().entries(items).finish(),
            Document::Object(map) => f.debug_map().entries(map).finish(),
            Document::ObjectId(id) => write!(f, "{id:?}"),
            Document::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Document::Model(model) => write!(f, "Model({model:?})"),
        }
    }
}

impl Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::{SerializeMap, SerializeSeq};

        match self {
            Document::Null => serializer.serialize_unit(),
            Document::Bool(b) => serializer.serialize_bool(*b),
            Document::Number(n) => n.serialize(serializer),
            Document::String(s) => serializer.serialize_str(s),
            Document::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Document::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Document::ObjectId(id) => id.serialize(serializer),
            Document::Binary(bytes) => serializer.serialize_bytes(bytes),
            Document::Model(model) => model.materialize().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Document::from)
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Document::Null,
            Value::Bool(b) => Document::Bool(b),
            Value::Number(n) => Document::Number(n),
            Value::String(s) => Document::String(s),
            Value::Array(items) => Document::Array(items.into_iter().map(Document::from).collect()),
            Value::Object(map) => Document::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Document::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Document {
    fn from(s: &str) -> Self {
        Document::String(s.to_string())
    }
}

impl From<String> for Document {
    fn from(s: String) -> Self {
        Document::String(s)
    }
}

impl From<bool> for Document {
    fn from(b: bool) -> Self {
        Document::Bool(b)
    }
}

impl From<i64> for Document {
    fn from(n: i64) -> Self {
        Document::Number(n.into())
    }
}

impl From<u64> for Document {
    fn from(n: u64) -> Self {
        Document::Number(n.into())
    }
}

impl From<ObjectId> for Document {
    fn from(id: ObjectId) -> Self {
        Document::ObjectId(id)
    }
}

impl From<Bytes> for Document {
    fn from(bytes: Bytes) -> Self {
        Document::Binary(bytes)
    }
}

impl From<Vec<Document>> for Document {
    fn from(items: Vec<Document>) -> Self {
        Document::Array(items)
    }
}

impl<T: Into<Document>> From<Option<T>> for Document {
    fn from(value: Option<T>) -> Self {
        value.map_or(Document::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn oid(hex: &str) -> ObjectId {
        ObjectId::parse_str(hex).unwrap()
    }

    #[derive(Debug)]
    struct StoredComment {
        id: ObjectId,
        text: String,
    }

    impl Materialize for StoredComment {
        fn materialize(&self) -> Document {
            Document::object([
                ("_id", Document::from(self.id)),
                ("text", Document::from(self.text.as_str())),
            ])
        }
    }

    #[test]
    fn encodes_nested_identifiers() {
        let doc = Document::object([
            ("_id", Document::from(oid("63fda9ec38f6a88647048a2c"))),
            ("name", Document::from("John")),
            ("docs", Document::Null),
            (
                "items",
                Document::Array(vec![
                    oid("63fdbd8a0cba5e08d5f95713").into(),
                    Document::object([("_id", oid("63fdaae02b41e8e56916883e"))]),
                ]),
            ),
        ]);

        assert_eq!(
            encode(&doc).to_json(),
            json!({
                "_id": {"$objectId": "63fda9ec38f6a88647048a2c"},
                "name": "John",
                "docs": null,
                "items": [
                    {"$objectId": "63fdbd8a0cba5e08d5f95713"},
                    {"_id": {"$objectId": "63fdaae02b41e8e56916883e"}}
                ]
            })
        );
    }

    #[test]
    fn top_level_identifier_is_encoded() {
        let encoded = encode(&oid("63fda9ec38f6a88647048a2c").into());
        assert_eq!(encoded.to_json(), json!({"$objectId": "63fda9ec38f6a88647048a2c"}));
        assert_eq!(decode(&encoded), Document::from(oid("63fda9ec38f6a88647048a2c")));
    }

    #[test]
    fn models_are_materialized_before_walking() {
        let doc = Document::object([(
            "comment",
            Document::Model(Arc::new(StoredComment {
                id: oid("63fdacaf2c8cc05cc972fda0"),
                text: "Hi!".into(),
            })),
        )]);

        assert_eq!(
            encode(&doc).to_json(),
            json!({"comment": {"_id": {"$objectId": "63fdacaf2c8cc05cc972fda0"}, "text": "Hi!"}})
        );
    }

    #[test]
    fn binary_blobs_pass_through() {
        let blob = Bytes::from_static(b"{\"$objectId\":\"63fdacaf2c8cc05cc972fda0\"}");
        let doc = Document::object([("file", Document::Binary(blob.clone()))]);

        assert_eq!(encode(&doc).get("file"), Some(&Document::Binary(blob.clone())));
        assert_eq!(decode(&doc).get("file"), Some(&Document::Binary(blob)));
    }

    #[test]
    fn decode_requires_exact_wire_shape() {
        let value = json!({
            "a": {"$objectId": "63fda9ec38f6a88647048a2c"},
            "b": {"$objectId": "63fda9ec38f6a88647048a2c", "text": "Hi!"},
            "c": {"$objectId": "not-hex"},
        });

        let decoded = decode_json(value);
        assert_eq!(decoded.get("a").and_then(Document::as_object_id), Some(oid("63fda9ec38f6a88647048a2c")));
        assert!(matches!(decoded.get("b"), Some(Document::Object(_))));
        assert!(matches!(decoded.get("c"), Some(Document::Object(_))));
    }

    #[test]
    fn serializes_identifiers_as_hex() {
        let doc = Document::object([("_id", oid("63fda9ec38f6a88647048a2c"))]);
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"_id": "63fda9ec38f6a88647048a2c"})
        );
    }

    #[test]
    fn object_id_from_either_form() {
        let hex = "63fda9ec38f6a88647048a2c";
        assert_eq!(object_id_from_json(&json!(hex)), Some(oid(hex)));
        assert_eq!(object_id_from_json(&json!({"$objectId": hex})), Some(oid(hex)));
        assert_eq!(object_id_from_json(&json!(42)), None);
    }

    fn arb_document() -> impl Strategy<Value = Document> {
        let leaf = prop_oneof![
            Just(Document::Null),
            any::<bool>().prop_map(Document::Bool),
            any::<i64>().prop_map(Document::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Document::String),
            any::<[u8; 12]>().prop_map(|b| Document::ObjectId(ObjectId::from_bytes(b))),
            proptest::collection::vec(any::<u8>(), 0..16)
                .prop_map(|b| Document::Binary(Bytes::from(b))),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Document::Array),
                proptest::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(Document::Object),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(doc in arb_document()) {
            prop_assert_eq!(decode(&encode(&doc)), doc);
        }

        #[test]
        fn encoded_trees_hold_no_identifiers(doc in arb_document()) {
            fn has_id(doc: &Document) -> bool {
                match doc {
                    Document::ObjectId(_) => true,
                    Document::Array(items) => items.iter().any(has_id),
                    Document::Object(map) => map.values().any(has_id),
                    _ => false,
                }
            }
            prop_assert!(!has_id(&encode(&doc)));
        }
    }
}
