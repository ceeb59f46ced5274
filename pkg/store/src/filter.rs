use schema::{
    ACTIVE_FIELD, FieldValue, GROUP_ID_FIELD, QueryFilter, Record, SCHEMA_VERSION_FIELD,
    SUB_TYPE_FIELD, TIME_FIELD, TYPE_FIELD,
};

/// Evaluates a filter against one stored document. A clause over a missing
/// or mistyped field never matches.
pub fn matches(filter: &QueryFilter, record: &Record) -> bool {
    field_str(record, GROUP_ID_FIELD) == Some(filter.group_id().as_str())
        && record.get(ACTIVE_FIELD).and_then(FieldValue::as_bool) == Some(filter.active())
        && record
            .get(SCHEMA_VERSION_FIELD)
            .and_then(FieldValue::as_f64)
            .is_some_and(|version| filter.schema_versions().contains(version))
        && in_set(record, TYPE_FIELD, filter.types())
        && in_set(record, SUB_TYPE_FIELD, filter.sub_types())
        && filter.time().is_none_or(|range| {
            field_str(record, TIME_FIELD).is_some_and(|timestamp| range.contains(timestamp))
        })
}

fn field_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(FieldValue::as_str)
}

fn in_set(record: &Record, field: &str, allowed: Option<&[String]>) -> bool {
    match allowed {
        None => true,
        Some(values) => field_str(record, field)
            .is_some_and(|value| values.iter().any(|allowed| allowed == value)),
    }
}
