use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Stored document field names
// ---------------------------------------------------------------------------

pub const GROUP_ID_FIELD: &str = "_groupId";
pub const ACTIVE_FIELD: &str = "_active";
pub const SCHEMA_VERSION_FIELD: &str = "_schemaVersion";
pub const TYPE_FIELD: &str = "type";
pub const SUB_TYPE_FIELD: &str = "subType";
pub const TIME_FIELD: &str = "time";

/// Bookkeeping fields that live on every stored document but are never
/// returned to callers.
pub const INTERNAL_FIELDS: [&str; 7] = [
    "_id",
    GROUP_ID_FIELD,
    "_version",
    ACTIVE_FIELD,
    SCHEMA_VERSION_FIELD,
    "createdTime",
    "modifiedTime",
];

// ---------------------------------------------------------------------------
// Identity and authorization
// ---------------------------------------------------------------------------

/// Outcome of a successful session-token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescriptor {
    pub subject_user_id: String,
    pub is_server: bool,
}

impl TokenDescriptor {
    pub fn user(subject_user_id: impl Into<String>) -> Self {
        Self {
            subject_user_id: subject_user_id.into(),
            is_server: false,
        }
    }

    pub fn server(subject_user_id: impl Into<String>) -> Self {
        Self {
            subject_user_id: subject_user_id.into(),
            is_server: true,
        }
    }
}

/// Permission name to opaque marker. A permission counts as granted only
/// when its key is present with a non-null marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeMap<String, Value>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, permission: impl Into<String>) -> Self {
        self.0.insert(permission.into(), Value::Object(Map::new()));
        self
    }

    pub fn insert(&mut self, permission: impl Into<String>, marker: Value) {
        self.0.insert(permission.into(), marker);
    }

    pub fn grants(&self, permission: &str) -> bool {
        self.0.get(permission).is_some_and(|marker| !marker.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A stored document. Field order is preserved from storage to the wire.
pub type Record = IndexMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Integers above `i64::MAX`.
    Unsigned(u64),
    Float(f64),
    String(String),
    Array(Vec<FieldValue>),
    Object(Record),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric view used by range comparisons; integers and floats compare
    /// on the same axis.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(value) => Some(*value as f64),
            FieldValue::Unsigned(value) => Some(*value as f64),
            FieldValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            FieldValue::Object(record) => Some(record),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(flag) => FieldValue::Bool(flag),
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    FieldValue::Integer(int)
                } else if let Some(unsigned) = number.as_u64() {
                    FieldValue::Unsigned(unsigned)
                } else {
                    FieldValue::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(text) => FieldValue::String(text),
            Value::Array(items) => {
                FieldValue::Array(items.into_iter().map(FieldValue::from).collect())
            }
            Value::Object(map) => FieldValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, FieldValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Bool(flag) => serializer.serialize_bool(*flag),
            FieldValue::Integer(int) => serializer.serialize_i64(*int),
            FieldValue::Unsigned(int) => serializer.serialize_u64(*int),
            // JSON has no spelling for NaN or infinity.
            FieldValue::Float(float) if !float.is_finite() => Err(S::Error::custom(format!(
                "non-finite number {float} cannot be encoded as JSON"
            ))),
            FieldValue::Float(float) => serializer.serialize_f64(*float),
            FieldValue::String(text) => serializer.serialize_str(text),
            FieldValue::Array(items) => items.serialize(serializer),
            FieldValue::Object(record) => record.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(FieldValue::from)
    }
}

/// Converts a decoded JSON object into a record; anything else is rejected.
pub fn record_from_json(value: Value) -> Option<Record> {
    FieldValue::from(value).into_record()
}

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaVersionRange {
    pub min: i64,
    pub max: i64,
}

impl SchemaVersionRange {
    pub fn new(min: i64, max: i64) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    pub fn contains(&self, version: f64) -> bool {
        version >= self.min as f64 && version <= self.max as f64
    }
}

/// Inclusive time bounds over canonical UTC timestamp strings. At least one
/// bound is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    start: Option<String>,
    end: Option<String>,
}

impl TimeRange {
    pub fn new(start: Option<String>, end: Option<String>) -> Option<Self> {
        if start.is_none() && end.is_none() {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn start(&self) -> Option<&str> {
        self.start.as_deref()
    }

    pub fn end(&self) -> Option<&str> {
        self.end.as_deref()
    }

    pub fn contains(&self, timestamp: &str) -> bool {
        if let Some(start) = self.start.as_deref()
            && timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end.as_deref()
            && timestamp > end
        {
            return false;
        }
        true
    }
}

/// Predicate over stored documents. Group and active constraints are fixed
/// at construction and cannot be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    group_id: GroupId,
    schema_versions: SchemaVersionRange,
    types: Option<Vec<String>>,
    sub_types: Option<Vec<String>>,
    time: Option<TimeRange>,
}

impl QueryFilter {
    pub fn new(group_id: GroupId, schema_versions: SchemaVersionRange) -> Self {
        Self {
            group_id,
            schema_versions,
            types: None,
            sub_types: None,
            time: None,
        }
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_sub_types(mut self, sub_types: Vec<String>) -> Self {
        self.sub_types = Some(sub_types);
        self
    }

    pub fn with_time(mut self, time: TimeRange) -> Self {
        self.time = Some(time);
        self
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Only active documents are ever selected.
    pub fn active(&self) -> bool {
        true
    }

    pub fn schema_versions(&self) -> SchemaVersionRange {
        self.schema_versions
    }

    pub fn types(&self) -> Option<&[String]> {
        self.types.as_deref()
    }

    pub fn sub_types(&self) -> Option<&[String]> {
        self.sub_types.as_deref()
    }

    pub fn time(&self) -> Option<&TimeRange> {
        self.time.as_ref()
    }

    /// Document-store rendering of the filter, used for logging and
    /// diagnostics.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        doc.insert(GROUP_ID_FIELD.into(), json!(self.group_id.as_str()));
        doc.insert(ACTIVE_FIELD.into(), json!(self.active()));
        doc.insert(
            SCHEMA_VERSION_FIELD.into(),
            json!({ "$gte": self.schema_versions.min, "$lte": self.schema_versions.max }),
        );
        if let Some(types) = &self.types {
            doc.insert(TYPE_FIELD.into(), json!({ "$in": types }));
        }
        if let Some(sub_types) = &self.sub_types {
            doc.insert(SUB_TYPE_FIELD.into(), json!({ "$in": sub_types }));
        }
        if let Some(time) = &self.time {
            let mut bounds = Map::new();
            if let Some(start) = time.start() {
                bounds.insert("$gte".into(), json!(start));
            }
            if let Some(end) = time.end() {
                bounds.insert("$lte".into(), json!(end));
            }
            doc.insert(TIME_FIELD.into(), Value::Object(bounds));
        }
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> QueryFilter {
        QueryFilter::new(
            GroupId::new("g-1"),
            SchemaVersionRange::new(0, 99).expect("valid range"),
        )
    }

    #[test]
    fn record_preserves_field_order_and_number_shape() {
        let raw = r#"{"zeta":1,"alpha":2.5,"mid":{"b":true,"a":null},"list":[1,"x"]}"#;
        let value: Value = serde_json::from_str(raw).expect("fixture should parse");
        let record = record_from_json(value).expect("object should convert");

        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid", "list"]);
        assert_eq!(record["zeta"], FieldValue::Integer(1));
        assert_eq!(record["alpha"], FieldValue::Float(2.5));

        let encoded = serde_json::to_string(&record).expect("record should encode");
        assert_eq!(encoded, raw);
    }

    #[test]
    fn integers_beyond_i64_keep_their_digits() {
        let raw = r#"{"big":18446744073709551615,"negative":-9223372036854775808}"#;
        let record =
            record_from_json(serde_json::from_str(raw).expect("fixture should parse")).expect("object");

        assert_eq!(record["big"], FieldValue::Unsigned(u64::MAX));
        assert_eq!(record["negative"], FieldValue::Integer(i64::MIN));
        assert_eq!(serde_json::to_string(&record).expect("record should encode"), raw);
    }

    #[test]
    fn non_finite_float_fails_to_encode() {
        let mut record = Record::new();
        record.insert("value".into(), FieldValue::Float(f64::NAN));

        let err = serde_json::to_string(&record).expect_err("NaN must not encode");
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn non_object_json_is_not_a_record() {
        assert!(record_from_json(json!([1, 2])).is_none());
        assert!(record_from_json(json!("text")).is_none());
    }

    #[test]
    fn permission_set_ignores_null_markers() {
        let mut perms = PermissionSet::new().grant("view");
        perms.insert("root", Value::Null);

        assert!(perms.grants("view"));
        assert!(!perms.grants("root"));
        assert!(!perms.grants("upload"));
    }

    #[test]
    fn permission_set_decodes_gatekeeper_shape() {
        let perms: PermissionSet =
            serde_json::from_str(r#"{"root":{},"upload":{}}"#).expect("perms should decode");
        assert!(perms.grants("root"));
        assert_eq!(perms.names().collect::<Vec<_>>(), vec!["root", "upload"]);
    }

    #[test]
    fn schema_range_rejects_inverted_bounds() {
        assert!(SchemaVersionRange::new(5, 1).is_none());
        let range = SchemaVersionRange::new(1, 5).expect("valid range");
        assert!(range.contains(1.0));
        assert!(range.contains(5.0));
        assert!(!range.contains(6.0));
    }

    #[test]
    fn time_range_requires_a_bound_and_is_inclusive() {
        assert!(TimeRange::new(None, None).is_none());

        let range = TimeRange::new(
            Some("2015-10-01T00:00:00.000Z".into()),
            Some("2015-10-31T00:00:00.000Z".into()),
        )
        .expect("bounded range");
        assert!(range.contains("2015-10-01T00:00:00.000Z"));
        assert!(range.contains("2015-10-31T00:00:00.000Z"));
        assert!(!range.contains("2015-11-01T00:00:00.000Z"));

        let lower_only = TimeRange::new(Some("2015-10-01T00:00:00.000Z".into()), None)
            .expect("lower bound");
        assert!(lower_only.contains("2099-01-01T00:00:00.000Z"));
        assert!(!lower_only.contains("2015-09-30T23:59:59.999Z"));
    }

    #[test]
    fn minimal_filter_renders_group_active_and_schema() {
        assert_eq!(
            filter().to_json(),
            json!({
                "_groupId": "g-1",
                "_active": true,
                "_schemaVersion": { "$gte": 0, "$lte": 99 }
            })
        );
    }

    #[test]
    fn full_filter_renders_every_clause() {
        let time = TimeRange::new(None, Some("2015-10-31T00:00:00.000Z".into()))
            .expect("upper bound");
        let rendered = filter()
            .with_types(vec!["smbg".into(), "cbg".into()])
            .with_sub_types(vec!["manual".into()])
            .with_time(time)
            .to_json();

        assert_eq!(rendered["type"], json!({ "$in": ["smbg", "cbg"] }));
        assert_eq!(rendered["subType"], json!({ "$in": ["manual"] }));
        assert_eq!(
            rendered["time"],
            json!({ "$lte": "2015-10-31T00:00:00.000Z" })
        );
        assert_eq!(rendered["_active"], json!(true));
    }
}
