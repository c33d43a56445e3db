use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::SyncError;

pub const MAX_TEXT_CHARS: usize = 4096;

/// Scalar payload value of a record field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Converts a raw JSON value without schema knowledge.
    ///
    /// # Errors
    /// Returns [`SyncError::Serialization`] for booleans, arrays, objects and
    /// numbers that fit neither `i64` nor a finite `f64`.
    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    return Ok(Self::Integer(int));
                }
                match number.as_f64() {
                    Some(float) if float.is_finite() => Ok(Self::Float(float)),
                    _ => Err(SyncError::Serialization(format!(
                        "unsupported numeric value {number}"
                    ))),
                }
            }
            Value::Bool(_) => Err(SyncError::Serialization(
                "boolean field values are not supported".to_string(),
            )),
            Value::Array(_) => Err(SyncError::Serialization(
                "array field values are not supported".to_string(),
            )),
            Value::Object(_) => Err(SyncError::Serialization(
                "nested object field values are not supported".to_string(),
            )),
        }
    }

    /// # Errors
    /// Returns [`SyncError::Serialization`] for non-finite floats.
    pub fn to_json(&self) -> Result<Value, SyncError> {
        match self {
            Self::Null => Ok(Value::Null),
            Self::Integer(int) => Ok(Value::Number(Number::from(*int))),
            Self::Float(float) => Number::from_f64(*float).map(Value::Number).ok_or_else(|| {
                SyncError::Serialization(format!("non-finite float {float} cannot be hashed"))
            }),
            Self::Text(text) => Ok(Value::String(text.clone())),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Field name to value, always iterated in sorted key order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FieldMap(BTreeMap<String, FieldValue>);

impl FieldMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.0.insert(name.into(), value)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// SHA-256 over the canonical serialization of this map, exactly as given.
    ///
    /// # Errors
    /// Returns [`SyncError::Serialization`] for values with no JSON form.
    pub fn content_hash(&self) -> Result<ContentHash, SyncError> {
        let bytes = canonical_json_bytes(&self.to_json()?)?;
        Ok(hash_bytes(&bytes))
    }

    /// JSON object form used for storage and hashing.
    ///
    /// # Errors
    /// Returns [`SyncError::Serialization`] when a value cannot be represented.
    pub fn to_json(&self) -> Result<Value, SyncError> {
        let mut object = Map::new();
        for (name, value) in &self.0 {
            object.insert(name.clone(), value.to_json()?);
        }
        Ok(Value::Object(object))
    }
}

impl FromIterator<(String, FieldValue)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    Text,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordSchema {
    pub schema_version: String,
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    /// Default schema for daily reflection entries.
    #[must_use]
    pub fn reflection_v1() -> Self {
        Self {
            schema_version: "reflection.v1".to_string(),
            fields: vec![
                FieldSpec::new("focus_level", FieldKind::Integer),
                FieldSpec::new("understanding_level", FieldKind::Integer),
                FieldSpec::new("fatigue_level", FieldKind::Integer),
                FieldSpec::new("satisfaction_level", FieldKind::Integer),
                FieldSpec::new("difficulty_level", FieldKind::Integer),
                FieldSpec::new("study_amount", FieldKind::Integer),
                FieldSpec::new("notes", FieldKind::Text),
                FieldSpec::new("github_commits", FieldKind::Integer),
                FieldSpec::new("github_prs", FieldKind::Integer),
                FieldSpec::new("github_issues", FieldKind::Integer),
            ],
        }
    }

    /// # Errors
    /// Returns [`SyncError::Configuration`] for an empty schema, blank or
    /// duplicate field names.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.schema_version.trim().is_empty() {
            return Err(SyncError::Configuration(
                "schema_version MUST be non-empty".to_string(),
            ));
        }
        if self.fields.is_empty() {
            return Err(SyncError::Configuration(
                "schema MUST declare at least one field".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SyncError::Configuration(
                    "schema field names MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "schema field {} declared more than once",
                    field.name
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self::reflection_v1()
    }
}

/// Lowercase hex SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// # Errors
    /// Returns [`SyncError::Validation`] unless `value` is 64 lowercase hex chars.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        let well_formed = value.len() == 64
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !well_formed {
            return Err(SyncError::Validation(format!(
                "content hash MUST be 64 lowercase hex chars, got {value:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), SyncError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => out.push_str(&encode_string(text)?),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&encode_string(key)?);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_string(value: &str) -> Result<String, SyncError> {
    serde_json::to_string(value)
        .map_err(|err| SyncError::Serialization(format!("failed to encode string: {err}")))
}

/// Compact JSON with object keys sorted at every depth.
///
/// # Errors
/// Returns [`SyncError::Serialization`] when a string cannot be encoded.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, SyncError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out.into_bytes())
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash(hex::encode(hasher.finalize()))
}

/// Validates field payloads against a schema and hashes their canonical form.
#[derive(Debug, Clone)]
pub struct ContentAddresser {
    schema: RecordSchema,
}

impl ContentAddresser {
    /// # Errors
    /// Returns [`SyncError::Configuration`] when the schema is invalid.
    pub fn new(schema: RecordSchema) -> Result<Self, SyncError> {
        schema.validate()?;
        Ok(Self { schema })
    }

    #[must_use]
    pub fn reflection_v1() -> Self {
        Self {
            schema: RecordSchema::reflection_v1(),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Converts a raw JSON object into a schema-complete [`FieldMap`].
    ///
    /// # Errors
    /// Returns [`SyncError::Serialization`] for unsupported value types and
    /// [`SyncError::Validation`] for unknown names, kind mismatches or
    /// oversized text.
    pub fn normalize_json(&self, raw: &Map<String, Value>) -> Result<FieldMap, SyncError> {
        let mut fields = FieldMap::new();
        for (name, value) in raw {
            fields.insert(name.clone(), FieldValue::from_json(value)?);
        }
        self.normalize(fields)
    }

    /// Checks every value against its declared kind and fills absent fields
    /// with `Null`.
    ///
    /// # Errors
    /// See [`ContentAddresser::normalize_json`].
    pub fn normalize(&self, fields: FieldMap) -> Result<FieldMap, SyncError> {
        let mut normalized = FieldMap::new();
        for (name, value) in fields.0 {
            let Some(spec) = self.schema.field(&name) else {
                return Err(SyncError::Validation(format!(
                    "unknown field {name} for schema {}",
                    self.schema.schema_version
                )));
            };
            let value = coerce(spec, value)?;
            normalized.insert(name, value);
        }
        for spec in &self.schema.fields {
            if normalized.get(&spec.name).is_none() {
                normalized.insert(spec.name.clone(), FieldValue::Null);
            }
        }
        Ok(normalized)
    }

    /// Hash of the canonical serialization of an already normalized map.
    ///
    /// # Errors
    /// Returns [`SyncError::Serialization`] for values with no JSON form.
    #[allow(clippy::unused_self)]
    pub fn hash(&self, fields: &FieldMap) -> Result<ContentHash, SyncError> {
        fields.content_hash()
    }

    /// Normalizes then hashes in one step.
    ///
    /// # Errors
    /// See [`ContentAddresser::normalize`] and [`ContentAddresser::hash`].
    pub fn address(&self, fields: FieldMap) -> Result<(FieldMap, ContentHash), SyncError> {
        let normalized = self.normalize(fields)?;
        let hash = self.hash(&normalized)?;
        Ok((normalized, hash))
    }
}

impl Default for ContentAddresser {
    fn default() -> Self {
        Self::reflection_v1()
    }
}

#[allow(clippy::cast_precision_loss)]
fn coerce(spec: &FieldSpec, value: FieldValue) -> Result<FieldValue, SyncError> {
    match (spec.kind, value) {
        (_, FieldValue::Null) => Ok(FieldValue::Null),
        (FieldKind::Integer, FieldValue::Integer(int)) => Ok(FieldValue::Integer(int)),
        (FieldKind::Float, FieldValue::Float(float)) => {
            if float.is_finite() {
                Ok(FieldValue::Float(float))
            } else {
                Err(SyncError::Serialization(format!(
                    "field {} holds non-finite float",
                    spec.name
                )))
            }
        }
        (FieldKind::Float, FieldValue::Integer(int)) => Ok(FieldValue::Float(int as f64)),
        (FieldKind::Text, FieldValue::Text(text)) => {
            if text.chars().count() > MAX_TEXT_CHARS {
                return Err(SyncError::Validation(format!(
                    "field {} exceeds {MAX_TEXT_CHARS} characters",
                    spec.name
                )));
            }
            Ok(FieldValue::Text(text))
        }
        (kind, other) => Err(SyncError::Validation(format!(
            "field {} expects {}, got {}",
            spec.name,
            kind.as_str(),
            describe(&other)
        ))),
    }
}

fn describe(value: &FieldValue) -> &'static str {
    match value {
        FieldValue::Null => "null",
        FieldValue::Integer(_) => "integer",
        FieldValue::Float(_) => "float",
        FieldValue::Text(_) => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_depth() {
        let value = json!({"b": 1, "a": {"z": null, "m": "x"}, "c": [2, 1]});
        let bytes = must(canonical_json_bytes(&value));
        assert_eq!(
            String::from_utf8(bytes).unwrap_or_default(),
            r#"{"a":{"m":"x","z":null},"b":1,"c":[2,1]}"#
        );
    }

    #[test]
    fn absent_and_explicit_null_hash_identically() {
        let addresser = ContentAddresser::reflection_v1();
        let sparse = must(addresser.normalize_json(&object(json!({"focus_level": 7}))));
        let explicit = must(addresser.normalize_json(&object(json!({
            "focus_level": 7,
            "notes": null,
            "github_prs": null
        }))));
        assert_eq!(must(addresser.hash(&sparse)), must(addresser.hash(&explicit)));
        assert_eq!(sparse.len(), addresser.schema().fields.len());
    }

    #[test]
    fn one_differing_field_changes_the_digest() {
        let addresser = ContentAddresser::reflection_v1();
        let seven = must(addresser.normalize_json(&object(json!({"focus_level": 7}))));
        let eight = must(addresser.normalize_json(&object(json!({"focus_level": 8}))));
        assert_ne!(must(addresser.hash(&seven)), must(addresser.hash(&eight)));
    }

    #[test]
    fn unsupported_values_are_serialization_errors() {
        let addresser = ContentAddresser::reflection_v1();
        for bad in [json!(true), json!([1, 2]), json!({"nested": 1})] {
            let err = addresser.normalize_json(&object(json!({ "focus_level": bad })));
            assert!(matches!(err, Err(SyncError::Serialization(_))), "{err:?}");
        }
    }

    #[test]
    fn schema_violations_are_validation_errors() {
        let addresser = ContentAddresser::reflection_v1();
        let unknown = addresser.normalize_json(&object(json!({"mood": 3})));
        assert!(matches!(unknown, Err(SyncError::Validation(_))));

        let wrong_kind = addresser.normalize_json(&object(json!({"focus_level": "high"})));
        assert!(matches!(wrong_kind, Err(SyncError::Validation(_))));

        let long_notes = "x".repeat(MAX_TEXT_CHARS + 1);
        let too_long = addresser.normalize_json(&object(json!({ "notes": long_notes })));
        assert!(matches!(too_long, Err(SyncError::Validation(_))));
    }

    #[test]
    fn integers_widen_into_float_fields() {
        let schema = RecordSchema {
            schema_version: "test.v1".to_string(),
            fields: vec![FieldSpec::new("score", FieldKind::Float)],
        };
        let addresser = must(ContentAddresser::new(schema));
        let widened = must(addresser.normalize_json(&object(json!({"score": 3}))));
        let float = must(addresser.normalize_json(&object(json!({"score": 3.0}))));
        assert_eq!(widened.get("score"), Some(&FieldValue::Float(3.0)));
        assert_eq!(must(addresser.hash(&widened)), must(addresser.hash(&float)));
    }

    #[test]
    fn duplicate_schema_fields_are_rejected() {
        let schema = RecordSchema {
            schema_version: "dup.v1".to_string(),
            fields: vec![
                FieldSpec::new("a", FieldKind::Integer),
                FieldSpec::new("a", FieldKind::Text),
            ],
        };
        assert!(matches!(
            ContentAddresser::new(schema),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn content_hash_requires_lowercase_hex() {
        assert!(ContentHash::parse(&"A".repeat(64)).is_err());
        assert!(ContentHash::parse("abc").is_err());
        let digest = hash_bytes(b"");
        assert_eq!(
            digest.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    fn level() -> impl Strategy<Value = Value> {
        prop_oneof![Just(Value::Null), (0_i64..=10).prop_map(Value::from)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn insertion_order_never_changes_the_digest(
            focus in level(),
            fatigue in level(),
            commits in level(),
            notes in "[a-z ]{0,24}",
        ) {
            let addresser = ContentAddresser::reflection_v1();
            let mut forward = Map::new();
            forward.insert("focus_level".to_string(), focus.clone());
            forward.insert("fatigue_level".to_string(), fatigue.clone());
            forward.insert("github_commits".to_string(), commits.clone());
            forward.insert("notes".to_string(), Value::String(notes.clone()));

            let mut reversed = Map::new();
            reversed.insert("notes".to_string(), Value::String(notes));
            reversed.insert("github_commits".to_string(), commits);
            reversed.insert("fatigue_level".to_string(), fatigue);
            reversed.insert("focus_level".to_string(), focus);

            let left = addresser.normalize_json(&forward).and_then(|f| addresser.hash(&f));
            let right = addresser.normalize_json(&reversed).and_then(|f| addresser.hash(&f));
            prop_assert_eq!(left, right);
        }
    }
}
