//! Cleaning stage: normalizes string payload values.
//!
//! Per string field, in order:
//!
//! 1. trim leading/trailing whitespace (counted as `fields_trimmed` when the length changes)
//! 2. replace configured null sentinels with [`Value::Null`] (`nulls_standardized`)
//! 3. lower-case and validate email-like fields (`emails_validated` / `validation_errors`)
//! 4. strip formatting from phone-like fields and validate (`phones_cleaned` / `validation_errors`)
//!
//! Non-string values pass through unchanged. With `remove_empty_strings`, a field whose cleaned
//! value is `""` is omitted from the output mapping.

use std::collections::HashSet;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TransformError, TransformResult};
use crate::stats::StageStats;
use crate::types::{Envelope, Record, Value};

use super::{BatchAccumulator, StageKind, StageOutput};

pub const FIELDS_TRIMMED: &str = "fields_trimmed";
pub const NULLS_STANDARDIZED: &str = "nulls_standardized";
pub const EMAILS_VALIDATED: &str = "emails_validated";
pub const PHONES_CLEANED: &str = "phones_cleaned";
pub const VALIDATION_ERRORS: &str = "validation_errors";

const COUNTERS: &[&str] = &[
    FIELDS_TRIMMED,
    NULLS_STANDARDIZED,
    EMAILS_VALIDATED,
    PHONES_CLEANED,
    VALIDATION_ERRORS,
];

/// Keys accepted by [`Cleaner::add_validation_rule`].
pub const EMAIL_RULE: &str = "email";
pub const PHONE_RULE: &str = "phone";

/// Which cleaning rules are active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningRules {
    pub trim_whitespace: bool,
    pub remove_empty_strings: bool,
    pub standardize_nulls: bool,
    pub validate_emails: bool,
    pub clean_phone_numbers: bool,
}

impl Default for CleaningRules {
    fn default() -> Self {
        Self {
            trim_whitespace: true,
            remove_empty_strings: true,
            standardize_nulls: true,
            validate_emails: false,
            clean_phone_numbers: false,
        }
    }
}

/// Options for the [`Cleaner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningOptions {
    pub cleaning_rules: CleaningRules,
    /// Case-sensitive set of strings that mean "no value".
    pub null_values: Vec<String>,
    /// `email` / `phone` patterns. Matched from the start of the value.
    pub validation_rules: IndexMap<String, String>,
    /// Substrings of a (lower-cased) field name that mark it as an email field.
    pub email_indicators: Vec<String>,
    /// Substrings of a (lower-cased) field name that mark it as a phone field.
    pub phone_indicators: Vec<String>,
    /// Fail the stage on the first validation error instead of counting it.
    pub strict_validation: bool,
}

impl Default for CleaningOptions {
    fn default() -> Self {
        let strings = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let mut validation_rules = IndexMap::new();
        validation_rules.insert(
            EMAIL_RULE.to_string(),
            r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$".to_string(),
        );
        validation_rules.insert(PHONE_RULE.to_string(), r"^[\+]?[1-9][\d]{0,15}$".to_string());

        Self {
            cleaning_rules: CleaningRules::default(),
            null_values: strings(&[
                "", "null", "NULL", "None", "N/A", "n/a", "undefined", "UNDEFINED",
            ]),
            validation_rules,
            email_indicators: strings(&["email", "mail", "e_mail", "electronic_mail"]),
            phone_indicators: strings(&["phone", "tel", "mobile", "cell", "number"]),
            strict_validation: false,
        }
    }
}

/// The cleaning stage.
#[derive(Debug, Clone)]
pub struct Cleaner {
    options: CleaningOptions,
    null_values: HashSet<String>,
    email_pattern: Option<Regex>,
    phone_pattern: Option<Regex>,
    phone_noise: Regex,
}

impl Cleaner {
    /// Build a cleaner, compiling the configured validation patterns.
    pub fn new(options: CleaningOptions) -> TransformResult<Self> {
        let email_pattern = options
            .validation_rules
            .get(EMAIL_RULE)
            .map(|p| compile_rule(EMAIL_RULE, p))
            .transpose()?;
        let phone_pattern = options
            .validation_rules
            .get(PHONE_RULE)
            .map(|p| compile_rule(PHONE_RULE, p))
            .transpose()?;
        let phone_noise = Regex::new(r"[^\d+]").map_err(|e| TransformError::InvalidConfig {
            message: e.to_string(),
        })?;

        Ok(Self {
            null_values: options.null_values.iter().cloned().collect(),
            options,
            email_pattern,
            phone_pattern,
            phone_noise,
        })
    }

    /// Current options.
    pub fn options(&self) -> &CleaningOptions {
        &self.options
    }

    /// Names of the enabled rules, in a fixed order.
    pub fn active_rules(&self) -> Vec<&'static str> {
        let r = &self.options.cleaning_rules;
        [
            (r.trim_whitespace, "trim_whitespace"),
            (r.remove_empty_strings, "remove_empty_strings"),
            (r.standardize_nulls, "standardize_nulls"),
            (r.validate_emails, "validate_emails"),
            (r.clean_phone_numbers, "clean_phone_numbers"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }

    /// Treat `sentinel` as a null representation from now on.
    pub fn add_null_value(&mut self, sentinel: impl Into<String>) {
        let sentinel = sentinel.into();
        if self.null_values.insert(sentinel.clone()) {
            self.options.null_values.push(sentinel);
        }
    }

    /// Stop treating `sentinel` as null.
    pub fn remove_null_value(&mut self, sentinel: &str) {
        self.null_values.remove(sentinel);
        self.options.null_values.retain(|s| s != sentinel);
    }

    /// Replace the `email` or `phone` validation pattern.
    ///
    /// Any other rule name is rejected, as is a pattern that does not compile.
    pub fn add_validation_rule(&mut self, rule: &str, pattern: &str) -> TransformResult<()> {
        let compiled = match rule {
            EMAIL_RULE | PHONE_RULE => compile_rule(rule, pattern)?,
            other => {
                return Err(TransformError::UnknownConfigurationValue {
                    key: "validation_rules".to_string(),
                    value: other.to_string(),
                });
            }
        };
        if rule == EMAIL_RULE {
            self.email_pattern = Some(compiled);
        } else {
            self.phone_pattern = Some(compiled);
        }
        self.options
            .validation_rules
            .insert(rule.to_string(), pattern.to_string());
        Ok(())
    }

    /// Clean a batch.
    pub fn clean(&self, batch: Vec<Envelope>) -> TransformResult<Vec<Envelope>> {
        self.apply(batch).map(|out| out.records)
    }

    /// Clean a batch and return the aggregated statistics alongside it.
    pub fn apply(&self, batch: Vec<Envelope>) -> TransformResult<StageOutput> {
        let mut acc = BatchAccumulator::new(StageKind::Cleaning, COUNTERS, batch.len());
        for envelope in batch {
            let (data, stats) = self.clean_record(envelope.data)?;
            acc.push(Envelope::new(data, envelope.metadata), stats);
        }
        let out = acc.finish(super::snapshot(&self.options));
        debug!(stage = %StageKind::Cleaning, stats = %out.stats, "stage_complete");
        Ok(out)
    }

    fn clean_record(&self, record: Record) -> TransformResult<(Record, StageStats)> {
        let mut stats = StageStats::default();
        let mut cleaned = Record::with_capacity(record.len());

        for (field, value) in record {
            let value = match value {
                Value::Utf8(s) => self.clean_string(&field, s, &mut stats)?,
                other => other,
            };
            if self.options.cleaning_rules.remove_empty_strings && value.as_str() == Some("") {
                continue;
            }
            cleaned.insert(field, value);
        }
        Ok((cleaned, stats))
    }

    fn clean_string(
        &self,
        field: &str,
        raw: String,
        stats: &mut StageStats,
    ) -> TransformResult<Value> {
        let rules = &self.options.cleaning_rules;
        let mut value = raw;

        if rules.trim_whitespace {
            let trimmed = value.trim();
            if trimmed.len() != value.len() {
                stats.incr(FIELDS_TRIMMED);
                value = trimmed.to_string();
            }
        }

        if rules.standardize_nulls && self.null_values.contains(&value) {
            stats.incr(NULLS_STANDARDIZED);
            return Ok(Value::Null);
        }

        if rules.validate_emails && name_matches(field, &self.options.email_indicators) {
            value = self.clean_email(field, value, stats)?;
        }

        if rules.clean_phone_numbers && name_matches(field, &self.options.phone_indicators) {
            value = self.clean_phone(field, value, stats)?;
        }

        Ok(Value::Utf8(value))
    }

    fn clean_email(
        &self,
        field: &str,
        email: String,
        stats: &mut StageStats,
    ) -> TransformResult<String> {
        if email.is_empty() {
            return Ok(email);
        }
        let normalized = email.trim().to_lowercase();
        match &self.email_pattern {
            Some(pattern) if pattern.is_match(&normalized) => {
                stats.incr(EMAILS_VALIDATED);
                Ok(normalized)
            }
            Some(_) => self.reject(field, email, "invalid email format", stats),
            None => Ok(normalized),
        }
    }

    fn clean_phone(
        &self,
        field: &str,
        phone: String,
        stats: &mut StageStats,
    ) -> TransformResult<String> {
        if phone.is_empty() {
            return Ok(phone);
        }
        let digits = self.phone_noise.replace_all(phone.trim(), "").into_owned();
        match &self.phone_pattern {
            Some(pattern) if !pattern.is_match(&digits) => {
                self.reject(field, phone, "invalid phone format", stats)
            }
            _ => {
                stats.incr(PHONES_CLEANED);
                Ok(digits)
            }
        }
    }

    /// Count a validation error; fail under strict validation, otherwise keep `original`.
    fn reject(
        &self,
        field: &str,
        original: String,
        reason: &str,
        stats: &mut StageStats,
    ) -> TransformResult<String> {
        stats.incr(VALIDATION_ERRORS);
        if self.options.strict_validation {
            return Err(TransformError::FieldValidation {
                stage: StageKind::Cleaning,
                field: field.to_string(),
                message: format!("{reason}: '{original}'"),
            });
        }
        warn!(field, value = %original, reason, "validation_error");
        Ok(original)
    }
}

fn name_matches(field: &str, indicators: &[String]) -> bool {
    let lower = field.to_lowercase();
    indicators.iter().any(|i| lower.contains(i.as_str()))
}

/// Patterns are anchored at the start of the value.
fn compile_rule(rule: &str, pattern: &str) -> TransformResult<Regex> {
    Regex::new(&format!("^(?:{pattern})")).map_err(|e| TransformError::InvalidConfig {
        message: format!("bad '{rule}' pattern: {e}"),
    })
}
