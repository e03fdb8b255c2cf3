//! Request validation.
//!
//! Action parameter and session rules are JSON Schemas compiled once at
//! registration. The [`Validator`] trait is the seam the dispatch core uses;
//! [`JsonSchemaValidator`] backs it with the `jsonschema` crate.

use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::types::{Error, Result};

/// A compiled JSON Schema.
#[derive(Clone)]
pub struct Schema {
    raw: Arc<Value>,
    compiled: Arc<jsonschema::Validator>,
}

impl Schema {
    pub fn compile(raw: Value) -> Result<Self> {
        let compiled = jsonschema::validator_for(&raw)
            .map_err(|e| Error::registration(format!("invalid schema: {e}")))?;
        Ok(Self {
            raw: Arc::new(raw),
            compiled: Arc::new(compiled),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Messages for every violation, empty when the instance is valid.
    pub fn violations(&self, instance: &Value) -> Vec<String> {
        self.compiled
            .iter_errors(instance)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect()
    }

    /// Fill absent properties with their schema `default`, recursively.
    pub fn merge_defaults(&self, value: Value) -> Value {
        merge_defaults(&self.raw, value)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("raw", &self.raw).finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Validation contract used by the dispatch core.
pub trait Validator: Send + Sync + fmt::Debug {
    fn validate(&self, value: &Value, schema: &Schema) -> Result<()>;
}

/// Default validator backed by compiled JSON Schemas.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl Validator for JsonSchemaValidator {
    fn validate(&self, value: &Value, schema: &Schema) -> Result<()> {
        let violations = schema.violations(value);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(violations.join("; ")))
        }
    }
}

/// Rules derived for one action at registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationRules {
    /// Schema of the argument envelope: `{ params: <action rules> }`.
    pub params: Option<Schema>,
    /// Structural rule for the session, if the session type has one.
    pub session: Option<Schema>,
}

impl ValidationRules {
    /// Envelope-level schema wrapping the action's parameter rules.
    pub fn wrap_params(rules: Value) -> Value {
        json!({
            "type": "object",
            "properties": { "params": rules },
            "required": ["params"],
        })
    }
}

/// Schema accepting an identifier as bare hex or as `{ "$objectId": hex }`.
pub fn object_id_schema() -> Value {
    let key = crate::codec::OBJECT_ID_KEY;
    let hex = json!({ "type": "string", "pattern": "^[0-9a-fA-F]{24}$" });
    json!({
        "oneOf": [
            hex.clone(),
            {
                "type": "object",
                "properties": { key: hex },
                "required": [key],
                "additionalProperties": false,
            }
        ]
    })
}

/// Fill absent object properties with schema defaults.
///
/// Only `properties`/`default` are interpreted; existing values always win.
pub fn merge_defaults(schema: &Value, value: Value) -> Value {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return value;
    };

    let mut object = match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return other,
    };

    for (key, prop_schema) in properties {
        match object.remove(key) {
            Some(existing) => {
                object.insert(key.clone(), merge_defaults(prop_schema, existing));
            }
            None => {
                if let Some(default) = prop_schema.get("default") {
                    object.insert(key.clone(), merge_defaults(prop_schema, default.clone()));
                }
            }
        }
    }

    Value::Object(object)
}
