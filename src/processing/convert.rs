//! Type-conversion stage: coerces named payload fields to declared target types.
//!
//! Only fields listed in [`TypeConversionOptions::type_conversions`] are touched; every other
//! field passes through and counts as `skipped`. `null` always converts to `null`.
//!
//! A failed conversion either aborts the stage ([`TypeConversionOptions::strict_mode`]) or is
//! replaced by the configured default for the target type and counted as `failed`. Defaults
//! are not re-validated against the target type. Without a configured default the original
//! value is kept.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TransformError, TransformResult};
use crate::stats::StageStats;
use crate::types::{Envelope, Record, Value};

use super::{BatchAccumulator, StageKind, StageOutput};

pub const SUCCESSFUL: &str = "successful";
pub const FAILED: &str = "failed";
pub const SKIPPED: &str = "skipped";

const COUNTERS: &[&str] = &[SUCCESSFUL, FAILED, SKIPPED];

/// Date-time layouts tried in order; the first that parses wins.
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
/// Date-only layouts, tried after [`DATETIME_FORMATS`]; they produce midnight.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

/// Declared target type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TargetType {
    Int,
    Float,
    Bool,
    Str,
    DateTime,
    /// Any other name. Values pass through unchanged and count as failed.
    Unknown(String),
}

impl TargetType {
    pub const SUPPORTED: [&'static str; 5] = ["int", "float", "bool", "str", "datetime"];

    pub fn as_str(&self) -> &str {
        match self {
            TargetType::Int => "int",
            TargetType::Float => "float",
            TargetType::Bool => "bool",
            TargetType::Str => "str",
            TargetType::DateTime => "datetime",
            TargetType::Unknown(name) => name,
        }
    }

    /// Parse a type name, rejecting anything outside [`TargetType::SUPPORTED`].
    pub fn parse(name: &str) -> TransformResult<Self> {
        match TargetType::from(name.to_string()) {
            TargetType::Unknown(name) => Err(TransformError::UnknownConfigurationValue {
                key: "type_conversions".to_string(),
                value: name,
            }),
            known => Ok(known),
        }
    }
}

impl From<String> for TargetType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "int" => TargetType::Int,
            "float" => TargetType::Float,
            "bool" => TargetType::Bool,
            "str" => TargetType::Str,
            "datetime" => TargetType::DateTime,
            _ => TargetType::Unknown(name),
        }
    }
}

impl From<TargetType> for String {
    fn from(t: TargetType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for the [`TypeConverter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeConversionOptions {
    /// `field -> target type`, keyed by post-mapping field names.
    pub type_conversions: IndexMap<String, TargetType>,
    pub strict_mode: bool,
    /// Substitutes for failed conversions, keyed by target type name.
    pub default_values: IndexMap<String, Value>,
}

impl Default for TypeConversionOptions {
    fn default() -> Self {
        let default_values = [
            ("int", Value::Int64(0)),
            ("float", Value::Float64(0.0)),
            ("bool", Value::Bool(false)),
            ("str", Value::Utf8(String::new())),
            ("datetime", Value::Null),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            type_conversions: IndexMap::new(),
            strict_mode: false,
            default_values,
        }
    }
}

/// Summary of the configured conversion rules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionStats {
    pub total_rules: usize,
    /// Number of fields per target type name.
    pub types_distribution: IndexMap<String, usize>,
    pub configured_fields: Vec<String>,
    pub strict_mode: bool,
}

/// The type-conversion stage.
#[derive(Debug, Clone)]
pub struct TypeConverter {
    options: TypeConversionOptions,
}

impl TypeConverter {
    pub fn new(options: TypeConversionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TypeConversionOptions {
        &self.options
    }

    /// Convert `field` to `type_name` from now on. Unknown type names are rejected.
    pub fn add_conversion_rule(
        &mut self,
        field: impl Into<String>,
        type_name: &str,
    ) -> TransformResult<()> {
        let target = TargetType::parse(type_name)?;
        self.options.type_conversions.insert(field.into(), target);
        Ok(())
    }

    /// Stop converting `field`.
    pub fn remove_conversion_rule(&mut self, field: &str) -> Option<TargetType> {
        self.options.type_conversions.shift_remove(field)
    }

    pub fn conversion_stats(&self) -> ConversionStats {
        let mut types_distribution = IndexMap::new();
        for target in self.options.type_conversions.values() {
            *types_distribution.entry(target.as_str().to_string()).or_insert(0) += 1;
        }
        ConversionStats {
            total_rules: self.options.type_conversions.len(),
            types_distribution,
            configured_fields: self.options.type_conversions.keys().cloned().collect(),
            strict_mode: self.options.strict_mode,
        }
    }

    /// Convert a batch.
    pub fn convert_types(&self, batch: Vec<Envelope>) -> TransformResult<Vec<Envelope>> {
        self.apply(batch).map(|out| out.records)
    }

    /// Convert a batch and return the aggregated statistics alongside it.
    pub fn apply(&self, batch: Vec<Envelope>) -> TransformResult<StageOutput> {
        let mut acc = BatchAccumulator::new(StageKind::TypeConversion, COUNTERS, batch.len());
        for envelope in batch {
            let (data, stats) = self.convert_record(envelope.data)?;
            acc.push(Envelope::new(data, envelope.metadata), stats);
        }
        let out = acc.finish(super::snapshot(&self.options));
        debug!(stage = %StageKind::TypeConversion, stats = %out.stats, "stage_complete");
        Ok(out)
    }

    fn convert_record(&self, record: Record) -> TransformResult<(Record, StageStats)> {
        let mut stats = StageStats::default();
        let mut converted = Record::with_capacity(record.len());

        for (field, value) in record {
            let value = match self.options.type_conversions.get(&field) {
                Some(target) => {
                    let (value, ok) = self.convert_field(&field, value, target)?;
                    stats.incr(if ok { SUCCESSFUL } else { FAILED });
                    value
                }
                None => {
                    stats.incr(SKIPPED);
                    value
                }
            };
            converted.insert(field, value);
        }
        Ok((converted, stats))
    }

    /// Returns the new value and whether the conversion succeeded.
    fn convert_field(
        &self,
        field: &str,
        value: Value,
        target: &TargetType,
    ) -> TransformResult<(Value, bool)> {
        if value.is_null() {
            return Ok((Value::Null, true));
        }
        if let TargetType::Unknown(name) = target {
            warn!(field, target_type = %name, "unknown_target_type");
            return Ok((value, false));
        }
        let blank = value.as_str().is_some_and(|s| s.trim().is_empty());
        if let Some(zero) = numeric_zero(target).filter(|_| blank) {
            // Blank numeric text is a soft failure even in strict mode.
            let fallback = self
                .options
                .default_values
                .get(target.as_str())
                .cloned()
                .unwrap_or(zero);
            warn!(field, target_type = %target, "blank_numeric_text");
            return Ok((fallback, false));
        }
        match convert_value(&value, target) {
            Some(converted) => Ok((converted, true)),
            None => self.conversion_failed(field, value, target).map(|v| (v, false)),
        }
    }

    fn conversion_failed(
        &self,
        field: &str,
        original: Value,
        target: &TargetType,
    ) -> TransformResult<Value> {
        if self.options.strict_mode {
            return Err(TransformError::Conversion {
                field: field.to_string(),
                target_type: target.to_string(),
                value: original.to_text(),
            });
        }
        let fallback = self
            .options
            .default_values
            .get(target.as_str())
            .cloned()
            .unwrap_or(original);
        warn!(
            field,
            target_type = %target,
            default = %fallback.to_text(),
            "conversion_failed"
        );
        Ok(fallback)
    }
}

/// Convert `value` to `target`; `None` if it cannot be represented.
pub fn convert_value(value: &Value, target: &TargetType) -> Option<Value> {
    match target {
        TargetType::Int => to_int(value).map(Value::Int64),
        TargetType::Float => to_float(value).map(Value::Float64),
        TargetType::Bool => to_bool(value).map(Value::Bool),
        TargetType::Str => Some(Value::Utf8(value.to_text())),
        TargetType::DateTime => to_datetime(value).map(Value::Timestamp),
        TargetType::Unknown(_) => None,
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int64(n) => Some(*n),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Float64(f) => truncate(*f),
        Value::Utf8(s) => parse_float(s).and_then(truncate),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float64(f) => Some(*f),
        Value::Int64(n) => Some(*n as f64),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Utf8(s) => parse_float(s),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int64(n) => Some(*n != 0),
        Value::Float64(f) => Some(*f != 0.0),
        Value::Utf8(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Utf8(s) => parse_datetime(s.trim()),
        _ => None,
    }
}

/// Parse `s` against the fixed layout list.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_float(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

fn numeric_zero(target: &TargetType) -> Option<Value> {
    match target {
        TargetType::Int => Some(Value::Int64(0)),
        TargetType::Float => Some(Value::Float64(0.0)),
        _ => None,
    }
}

fn truncate(f: f64) -> Option<i64> {
    let t = f.trunc();
    // i64::MAX as f64 rounds up to 2^63, which is out of range.
    (t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}
