//! Table schemas, records and batches handed to the TDP loader.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "tdp-core";

/// Postgres caps identifiers at 63 bytes; every backend shares the limit.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema has no columns")]
    Empty,
    #[error("schema must declare exactly one key column, found {found}")]
    KeyCount { found: usize },
    #[error("key column {0} cannot be nullable")]
    NullableKey(String),
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid table path {0:?}, expected container.dataset.table")]
    InvalidTablePath(String),
    #[error("record {row} carries unknown column {column}")]
    UnknownColumn { row: usize, column: String },
    #[error("record {row}: column {column} expects {expected}, got {found}")]
    TypeMismatch {
        row: usize,
        column: String,
        expected: ColumnType,
        found: String,
    },
    #[error("record {row}: column {column} is not nullable")]
    NullValue { row: usize, column: String },
    #[error("record {row} is not a JSON object")]
    NotAnObject { row: usize },
    #[error("unknown schema family {0}")]
    UnknownFamily(String),
}

pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Float,
    Integer,
    Boolean,
    Timestamp,
    Date,
    /// Nested structure pre-serialized to JSON text.
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "STRING",
            Self::Float => "FLOAT",
            Self::Integer => "INTEGER",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
            Self::Json => "JSON",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub key: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            key: true,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            key: false,
            nullable: true,
        }
    }

    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            key: false,
            nullable: false,
        }
    }
}

/// Ordered column schema shared by a destination table and its staging table.
///
/// Exactly one column is the natural key. Construction rejects anything else,
/// so a malformed registry entry fails before any table is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ColumnDef>", into = "Vec<ColumnDef>")]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
    key_index: usize,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = std::collections::BTreeSet::new();
        for column in &columns {
            if !is_valid_identifier(&column.name) {
                return Err(SchemaError::InvalidIdentifier(column.name.clone()));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
        }

        let keys = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.key)
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        let [key_index] = keys.as_slice() else {
            return Err(SchemaError::KeyCount { found: keys.len() });
        };
        if columns[*key_index].nullable {
            return Err(SchemaError::NullableKey(columns[*key_index].name.clone()));
        }

        Ok(Self {
            key_index: *key_index,
            columns,
        })
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn key_column(&self) -> &ColumnDef {
        &self.columns[self.key_index]
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.key)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl TryFrom<Vec<ColumnDef>> for TableSchema {
    type Error = SchemaError;

    fn try_from(columns: Vec<ColumnDef>) -> Result<Self, Self::Error> {
        Self::new(columns)
    }
}

impl From<TableSchema> for Vec<ColumnDef> {
    fn from(schema: TableSchema) -> Self {
        schema.columns
    }
}

/// Built-in table families produced by the platform's collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaFamily {
    DestinationDetails,
    TripDetails,
    WeatherForecasts,
}

impl SchemaFamily {
    pub const ALL: [SchemaFamily; 3] = [
        SchemaFamily::DestinationDetails,
        SchemaFamily::TripDetails,
        SchemaFamily::WeatherForecasts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::DestinationDetails => "destination_details",
            Self::TripDetails => "trip_details",
            Self::WeatherForecasts => "weather_forecasts",
        }
    }

    pub fn schema(&self) -> TableSchema {
        use ColumnType::*;

        let columns = match self {
            Self::DestinationDetails => vec![
                ColumnDef::key("destination_name", String),
                ColumnDef::nullable("description", String),
                ColumnDef::nullable("country", String),
                ColumnDef::nullable("latitude", Float),
                ColumnDef::nullable("longitude", Float),
                ColumnDef::nullable("population_count", Integer),
                ColumnDef::nullable("population_year", Integer),
                ColumnDef::nullable("timezone", String),
                ColumnDef::nullable("languages", Json),
                ColumnDef::nullable("climate", String),
                ColumnDef::nullable("image_url", String),
                ColumnDef::nullable("sections", Json),
                ColumnDef::nullable("area_km2", Float),
                ColumnDef::nullable("region", String),
                ColumnDef::nullable("attractions_count", Integer),
                ColumnDef::nullable("attractions", Json),
                ColumnDef::nullable("ingestion_timestamp", Timestamp),
            ],
            Self::TripDetails => vec![
                ColumnDef::key("trip_id", Integer),
                ColumnDef::nullable("destination", String),
                ColumnDef::nullable("start_date", Date),
                ColumnDef::nullable("end_date", Date),
                ColumnDef::nullable("duration_days", Integer),
                ColumnDef::nullable("traveler_name", String),
                ColumnDef::nullable("traveler_age", Integer),
                ColumnDef::nullable("traveler_gender", String),
                ColumnDef::nullable("traveler_nationality", String),
                ColumnDef::nullable("accommodation_type", String),
                ColumnDef::nullable("accommodation_cost", Float),
                ColumnDef::nullable("transportation_type", String),
                ColumnDef::nullable("transportation_cost", Float),
                ColumnDef::nullable("ingestion_timestamp", Timestamp),
                ColumnDef::nullable("source_file", String),
            ],
            Self::WeatherForecasts => vec![
                ColumnDef::key("logical_key", String),
                ColumnDef::required("city", String),
                ColumnDef::required("country", String),
                ColumnDef::nullable("latitude", Float),
                ColumnDef::nullable("longitude", Float),
                ColumnDef::required("forecast_date", Date),
                ColumnDef::nullable("forecast_timestamp", Timestamp),
                ColumnDef::nullable("max_temp", Float),
                ColumnDef::nullable("min_temp", Float),
                ColumnDef::nullable("day_temp", Float),
                ColumnDef::nullable("night_temp", Float),
                ColumnDef::nullable("feels_like_day", Float),
                ColumnDef::nullable("feels_like_night", Float),
                ColumnDef::nullable("humidity", Integer),
                ColumnDef::nullable("wind_speed", Float),
                ColumnDef::nullable("weather_main", String),
                ColumnDef::nullable("weather_description", String),
                ColumnDef::nullable("weather_icon", String),
                ColumnDef::nullable("precipitation_probability", Float),
                ColumnDef::nullable("rain", Float),
                ColumnDef::nullable("uvi", Float),
                ColumnDef::nullable("clouds", Integer),
                ColumnDef::nullable("sunrise", Timestamp),
                ColumnDef::nullable("sunset", Timestamp),
                ColumnDef::nullable("ingestion_timestamp", Timestamp),
            ],
        };

        TableSchema::new(columns).expect("built-in schema families are valid")
    }
}

impl FromStr for SchemaFamily {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SchemaError::UnknownFamily(s.to_string()))
    }
}

impl fmt::Display for SchemaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetRef {
    pub container: String,
    pub dataset: String,
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.container, self.dataset)
    }
}

/// Fully qualified `container.dataset.table` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub container: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        container: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let table_ref = Self {
            container: container.into(),
            dataset: dataset.into(),
            table: table.into(),
        };
        for part in [&table_ref.container, &table_ref.dataset, &table_ref.table] {
            if !is_valid_identifier(part) {
                return Err(SchemaError::InvalidIdentifier(part.clone()));
            }
        }
        Ok(table_ref)
    }

    pub fn parse(path: &str) -> Result<Self, SchemaError> {
        let parts = path.split('.').collect::<Vec<_>>();
        let [container, dataset, table] = parts.as_slice() else {
            return Err(SchemaError::InvalidTablePath(path.to_string()));
        };
        Self::new(*container, *dataset, *table)
    }

    /// Another table in the same container and dataset.
    pub fn sibling(&self, table: impl Into<String>) -> Result<Self, SchemaError> {
        Self::new(self.container.clone(), self.dataset.clone(), table)
    }

    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef {
            container: self.container.clone(),
            dataset: self.dataset.clone(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.container, self.dataset, self.table)
    }
}

impl FromStr for TableRef {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    String(String),
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Json(String),
}

static NULL_VALUE: ScalarValue = ScalarValue::Null;

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::String(_) => "STRING",
            Self::Float(_) => "FLOAT",
            Self::Integer(_) => "INTEGER",
            Self::Boolean(_) => "BOOLEAN",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::Date(_) => "DATE",
            Self::Json(_) => "JSON",
        }
    }

    /// Canonical JSON form, used for fingerprints and key comparison.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::String(s) | Self::Json(s) => JsonValue::String(s.clone()),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(f.to_string())),
            Self::Integer(i) => JsonValue::from(*i),
            Self::Boolean(b) => JsonValue::Bool(*b),
            Self::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            Self::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Postgres `IS DISTINCT FROM`: NULLs compare equal to each other, NaN
    /// equals NaN and `-0.0` equals `0.0`.
    pub fn is_distinct_from(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => !(a == b || (a.is_nan() && b.is_nan())),
            (a, b) => a != b,
        }
    }

    /// Text under which equal key values group together.
    fn grouping_key(&self) -> String {
        match self {
            Self::Float(f) if *f == 0.0 => "0.0".to_string(),
            Self::Float(f) if f.is_nan() => "NaN".to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// Fits a native value to a column. Integers widen into float columns and
    /// plain strings are accepted as pre-serialized JSON.
    fn coerce(self, column_type: ColumnType) -> Result<Self, Self> {
        match (self, column_type) {
            (Self::Null, _) => Ok(Self::Null),
            (v @ Self::String(_), ColumnType::String)
            | (v @ Self::Float(_), ColumnType::Float)
            | (v @ Self::Integer(_), ColumnType::Integer)
            | (v @ Self::Boolean(_), ColumnType::Boolean)
            | (v @ Self::Timestamp(_), ColumnType::Timestamp)
            | (v @ Self::Date(_), ColumnType::Date)
            | (v @ Self::Json(_), ColumnType::Json) => Ok(v),
            (Self::Integer(i), ColumnType::Float) => Ok(Self::Float(i as f64)),
            (Self::String(s), ColumnType::Json) => Ok(Self::Json(s)),
            (other, _) => Err(other),
        }
    }

    /// Reads a JSON value the way collectors write their blobs: timestamps as
    /// RFC 3339 or naive `YYYY-MM-DD HH:MM:SS` (taken as UTC), dates as
    /// `YYYY-MM-DD`, nested arrays and objects serialized into JSON columns.
    pub fn from_json(value: &JsonValue, column_type: ColumnType) -> Option<Self> {
        if value.is_null() {
            return Some(Self::Null);
        }
        match column_type {
            ColumnType::String => value.as_str().map(|s| Self::String(s.to_string())),
            ColumnType::Float => value.as_f64().map(Self::Float),
            ColumnType::Integer => value.as_i64().map(Self::Integer).or_else(|| {
                value
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Self::Integer(f as i64))
            }),
            ColumnType::Boolean => value.as_bool().map(Self::Boolean),
            ColumnType::Timestamp => value.as_str().and_then(parse_timestamp).map(Self::Timestamp),
            ColumnType::Date => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .map(Self::Date),
            ColumnType::Json => match value {
                JsonValue::String(s) => Some(Self::Json(s.clone())),
                other => Some(Self::Json(other.to_string())),
            },
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for ScalarValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<NaiveDate> for ScalarValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One logical entity as a flat column → value mapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    values: BTreeMap<String, ScalarValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<ScalarValue>) {
        self.values.insert(column.into(), value.into());
    }

    /// Missing columns read as NULL.
    pub fn get(&self, column: &str) -> &ScalarValue {
        self.values.get(column).unwrap_or(&NULL_VALUE)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn from_json_object(
        schema: &TableSchema,
        row: usize,
        object: &JsonMap<String, JsonValue>,
    ) -> Result<Self, SchemaError> {
        let mut record = Record::new();
        for (name, raw) in object {
            let column = schema.column(name).ok_or_else(|| SchemaError::UnknownColumn {
                row,
                column: name.clone(),
            })?;
            let value = ScalarValue::from_json(raw, column.column_type).ok_or_else(|| {
                SchemaError::TypeMismatch {
                    row,
                    column: name.clone(),
                    expected: column.column_type,
                    found: json_kind(raw).to_string(),
                }
            })?;
            record.set(name.clone(), value);
        }
        Ok(record)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Ordered records sharing one schema, consumed by a single load call.
#[derive(Debug, Clone)]
pub struct Batch {
    schema: Arc<TableSchema>,
    records: Vec<Record>,
}

impl Batch {
    /// Type-checks every record against `schema`.
    pub fn new(schema: Arc<TableSchema>, records: Vec<Record>) -> Result<Self, SchemaError> {
        let mut checked = Vec::with_capacity(records.len());
        for (row, record) in records.into_iter().enumerate() {
            checked.push(conform_record(&schema, row, record)?);
        }
        Ok(Self {
            schema,
            records: checked,
        })
    }

    pub fn empty(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    /// Builds a batch from the JSON array-of-objects layout collectors emit.
    pub fn from_json_rows(schema: Arc<TableSchema>, rows: &[JsonValue]) -> Result<Self, SchemaError> {
        let records = rows
            .iter()
            .enumerate()
            .map(|(row, value)| {
                let object = value.as_object().ok_or(SchemaError::NotAnObject { row })?;
                Record::from_json_object(&schema, row, object)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(schema, records)
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Values of each record in schema column order.
    pub fn rows(&self) -> impl Iterator<Item = Vec<&ScalarValue>> + '_ {
        self.records.iter().map(move |record| {
            self.schema
                .columns()
                .iter()
                .map(|column| record.get(&column.name))
                .collect()
        })
    }

    /// Key values occurring more than once, in first-seen order.
    pub fn duplicate_keys(&self) -> Vec<ScalarValue> {
        let key = &self.schema.key_column().name;
        let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for (idx, record) in self.records.iter().enumerate() {
            let entry = counts
                .entry(record.get(key).grouping_key())
                .or_insert((idx, 0));
            entry.1 += 1;
        }
        let mut duplicates = counts
            .into_values()
            .filter(|(_, count)| *count > 1)
            .map(|(first, _)| first)
            .collect::<Vec<_>>();
        duplicates.sort_unstable();
        duplicates
            .into_iter()
            .map(|idx| self.records[idx].get(key).clone())
            .collect()
    }

    /// SHA-256 over the column names and canonical row values.
    pub fn fingerprint(&self) -> String {
        let rows = self
            .rows()
            .map(|row| JsonValue::Array(row.into_iter().map(ScalarValue::to_json).collect()))
            .collect::<Vec<_>>();
        let canonical = serde_json::json!({
            "columns": self.schema.column_names(),
            "rows": rows,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn conform_record(schema: &TableSchema, row: usize, record: Record) -> Result<Record, SchemaError> {
    if let Some(column) = record.columns().find(|c| schema.column(c).is_none()) {
        return Err(SchemaError::UnknownColumn {
            row,
            column: column.to_string(),
        });
    }

    let mut values = record.values;
    let mut conformed = Record::new();
    for column in schema.columns() {
        let value = values.remove(&column.name).unwrap_or(ScalarValue::Null);
        let value = value.coerce(column.column_type).map_err(|found| {
            SchemaError::TypeMismatch {
                row,
                column: column.name.clone(),
                expected: column.column_type,
                found: found.kind().to_string(),
            }
        })?;
        if value.is_null() && !column.nullable {
            return Err(SchemaError::NullValue {
                row,
                column: column.name.clone(),
            });
        }
        conformed.set(column.name.clone(), value);
    }
    Ok(conformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn city_schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new(vec![
                ColumnDef::key("name", ColumnType::String),
                ColumnDef::nullable("population", ColumnType::Integer),
                ColumnDef::nullable("area_km2", ColumnType::Float),
            ])
            .expect("schema"),
        )
    }

    #[test]
    fn builtin_families_have_one_key() {
        for family in SchemaFamily::ALL {
            let schema = family.schema();
            assert_eq!(schema.columns().iter().filter(|c| c.key).count(), 1);
            assert_eq!(family.name().parse::<SchemaFamily>().unwrap(), family);
        }
        assert_eq!(
            SchemaFamily::DestinationDetails.schema().key_column().name,
            "destination_name"
        );
        assert_eq!(SchemaFamily::DestinationDetails.schema().len(), 17);
    }

    #[test]
    fn schema_rejects_wrong_key_count() {
        let none = TableSchema::new(vec![ColumnDef::nullable("a", ColumnType::String)]);
        assert_eq!(none.unwrap_err(), SchemaError::KeyCount { found: 0 });

        let two = TableSchema::new(vec![
            ColumnDef::key("a", ColumnType::String),
            ColumnDef::key("b", ColumnType::String),
        ]);
        assert_eq!(two.unwrap_err(), SchemaError::KeyCount { found: 2 });
    }

    #[test]
    fn schema_rejects_nullable_key_and_duplicates() {
        let mut key = ColumnDef::key("a", ColumnType::String);
        key.nullable = true;
        assert_eq!(
            TableSchema::new(vec![key]).unwrap_err(),
            SchemaError::NullableKey("a".into())
        );

        let dup = TableSchema::new(vec![
            ColumnDef::key("a", ColumnType::String),
            ColumnDef::nullable("a", ColumnType::Float),
        ]);
        assert_eq!(dup.unwrap_err(), SchemaError::DuplicateColumn("a".into()));

        let bad = TableSchema::new(vec![ColumnDef::key("drop table;", ColumnType::String)]);
        assert!(matches!(bad, Err(SchemaError::InvalidIdentifier(_))));
    }

    #[test]
    fn schema_deserializes_from_yaml_shaped_json() {
        let schema: TableSchema = serde_json::from_value(serde_json::json!([
            {"name": "city", "type": "string", "key": true, "nullable": false},
            {"name": "temp", "type": "float"}
        ]))
        .expect("schema");
        assert_eq!(schema.key_column().name, "city");
        assert!(schema.column("temp").unwrap().nullable);

        let err = serde_json::from_value::<TableSchema>(serde_json::json!([
            {"name": "city", "type": "string"}
        ]));
        assert!(err.is_err());
    }

    #[test]
    fn table_paths_parse_and_display() {
        let table = TableRef::parse("travler-data-platform.staging.destination_details").unwrap();
        assert_eq!(table.container, "travler-data-platform");
        assert_eq!(table.to_string(), "travler-data-platform.staging.destination_details");
        assert_eq!(
            table.sibling("destination_details_temp").unwrap().to_string(),
            "travler-data-platform.staging.destination_details_temp"
        );
        assert!(TableRef::parse("staging.destination_details").is_err());
        assert!(TableRef::parse("a.b.c.d").is_err());
    }

    #[test]
    fn batch_widens_integers_and_fills_missing_with_null() {
        let batch = Batch::new(
            city_schema(),
            vec![Record::new().with("name", "Paris").with("area_km2", 105i64)],
        )
        .expect("batch");
        let record = &batch.records()[0];
        assert_eq!(record.get("area_km2"), &ScalarValue::Float(105.0));
        assert!(record.get("population").is_null());
    }

    #[test]
    fn batch_rejects_unknown_columns_and_null_keys() {
        let unknown = Batch::new(
            city_schema(),
            vec![Record::new().with("name", "Paris").with("mayor", "Hidalgo")],
        );
        assert!(matches!(unknown, Err(SchemaError::UnknownColumn { row: 0, .. })));

        let null_key = Batch::new(city_schema(), vec![Record::new().with("population", 3i64)]);
        assert!(matches!(null_key, Err(SchemaError::NullValue { row: 0, .. })));

        let mismatch = Batch::new(
            city_schema(),
            vec![Record::new().with("name", "Paris").with("population", "many")],
        );
        assert!(matches!(mismatch, Err(SchemaError::TypeMismatch { .. })));
    }

    #[test]
    fn json_rows_follow_collector_conventions() {
        let schema = Arc::new(SchemaFamily::DestinationDetails.schema());
        let rows = vec![serde_json::json!({
            "destination_name": "Tokyo",
            "population_count": 13960000.0,
            "languages": ["Japanese"],
            "ingestion_timestamp": "2025-05-01 10:30:00"
        })];
        let batch = Batch::from_json_rows(schema, &rows).expect("batch");
        let record = &batch.records()[0];
        assert_eq!(record.get("population_count"), &ScalarValue::Integer(13_960_000));
        assert_eq!(record.get("languages"), &ScalarValue::Json("[\"Japanese\"]".into()));
        assert_eq!(
            record.get("ingestion_timestamp"),
            &ScalarValue::Timestamp(Utc.with_ymd_and_hms(2025, 5, 1, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn duplicate_keys_are_reported_once() {
        let batch = Batch::new(
            city_schema(),
            vec![
                Record::new().with("name", "Rome"),
                Record::new().with("name", "Paris"),
                Record::new().with("name", "Rome"),
                Record::new().with("name", "Rome"),
            ],
        )
        .unwrap();
        assert_eq!(batch.duplicate_keys(), vec![ScalarValue::from("Rome")]);
    }

    #[test]
    fn signed_zero_float_keys_are_duplicates() {
        let schema = Arc::new(
            TableSchema::new(vec![ColumnDef::key("reading", ColumnType::Float)]).expect("schema"),
        );
        let batch = Batch::new(
            schema,
            vec![
                Record::new().with("reading", 0.0),
                Record::new().with("reading", 1.5),
                Record::new().with("reading", -0.0),
            ],
        )
        .unwrap();
        assert_eq!(batch.duplicate_keys(), vec![ScalarValue::Float(0.0)]);
    }

    #[test]
    fn distinctness_follows_postgres() {
        let nan = ScalarValue::Float(f64::NAN);
        assert!(!nan.is_distinct_from(&ScalarValue::Float(f64::NAN)));
        assert!(!ScalarValue::Float(-0.0).is_distinct_from(&ScalarValue::Float(0.0)));
        assert!(ScalarValue::Float(1.0).is_distinct_from(&nan));
        assert!(!ScalarValue::Null.is_distinct_from(&ScalarValue::Null));
        assert!(ScalarValue::Null.is_distinct_from(&ScalarValue::Integer(0)));
        assert!(ScalarValue::from("a").is_distinct_from(&ScalarValue::from("b")));
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let make = |population: i64| {
            Batch::new(
                city_schema(),
                vec![Record::new().with("name", "Paris").with("population", population)],
            )
            .unwrap()
        };
        assert_eq!(make(2_148_271).fingerprint(), make(2_148_271).fingerprint());
        assert_ne!(make(2_148_271).fingerprint(), make(2_200_000).fingerprint());
        assert_eq!(make(1).fingerprint().len(), 64);
    }
}
