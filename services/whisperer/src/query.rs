use chrono::{DateTime, SecondsFormat, Utc};
use schema::{GroupId, QueryFilter, SchemaVersionRange, TimeRange};
use serde::Deserialize;

/// Raw query-string parameters of a data request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DataQueryParams {
    #[serde(rename = "startdate")]
    pub start_date: Option<String>,
    #[serde(rename = "enddate")]
    pub end_date: Option<String>,
    #[serde(rename = "type")]
    pub types: Option<String>,
    #[serde(rename = "subtype")]
    pub sub_types: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("{field} is not an RFC 3339 timestamp: {value:?} ({reason})")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
        reason: String,
    },
}

pub fn build_query(
    group_id: GroupId,
    schema_versions: SchemaVersionRange,
    params: &DataQueryParams,
) -> Result<QueryFilter, ParamError> {
    let start = canonical_bound("startdate", params.start_date.as_deref(), Rounding::Up)?;
    let end = canonical_bound("enddate", params.end_date.as_deref(), Rounding::Down)?;

    let mut filter = QueryFilter::new(group_id, schema_versions);
    if let Some(types) = split_csv(params.types.as_deref()) {
        filter = filter.with_types(types);
    }
    if let Some(sub_types) = split_csv(params.sub_types.as_deref()) {
        filter = filter.with_sub_types(sub_types);
    }
    if let Some(time) = TimeRange::new(start, end) {
        filter = filter.with_time(time);
    }
    Ok(filter)
}

/// Splits a comma-delimited list, dropping empty entries. `None` when
/// nothing is left.
pub fn split_csv(raw: Option<&str>) -> Option<Vec<String>> {
    let values: Vec<String> = raw?
        .split(',')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();
    (!values.is_empty()).then_some(values)
}

/// Direction to move a timestamp that carries sub-millisecond digits.
/// Lower bounds round up and upper bounds round down, so the millisecond
/// range never admits anything outside the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Up,
    Down,
}

/// Re-renders an RFC 3339 timestamp as UTC with millisecond precision, the
/// form stored documents use, so string order matches time order.
pub fn canonical_timestamp(raw: &str, rounding: Rounding) -> Result<String, chrono::ParseError> {
    let mut parsed = DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc);
    let sub_milli = parsed.timestamp_subsec_nanos() % NANOS_PER_MILLI;
    if rounding == Rounding::Up && sub_milli != 0 {
        parsed += chrono::Duration::nanoseconds(i64::from(NANOS_PER_MILLI - sub_milli));
    }
    Ok(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
}

const NANOS_PER_MILLI: u32 = 1_000_000;

fn canonical_bound(
    field: &'static str,
    raw: Option<&str>,
    rounding: Rounding,
) -> Result<Option<String>, ParamError> {
    match raw {
        None | Some("") => Ok(None),
        Some(value) => canonical_timestamp(value, rounding)
            .map(Some)
            .map_err(|err| ParamError::InvalidTimestamp {
                field,
                value: value.to_string(),
                reason: err.to_string(),
            }),
    }
}
