//! Flattening stage: collapses nested mappings and sequences into a single-level mapping.
//!
//! Nested keys are joined with the configured separator (`address.city`). Sequences are
//! expanded according to [`ArrayHandling`]. Once the configured maximum depth is reached the
//! remaining substructure is stored as text under the current prefix. A field path with a
//! [`CustomRule`] bypasses normal flattening and gets the rule's transform applied to its
//! whole subtree.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransformResult;
use crate::stats::StageStats;
use crate::types::{Envelope, Record, Value};

use super::{BatchAccumulator, StageKind, StageOutput};

pub const OBJECTS_FLATTENED: &str = "objects_flattened";
pub const ARRAYS_FLATTENED: &str = "arrays_flattened";
pub const FIELDS_CREATED: &str = "fields_created";
pub const MAX_DEPTH_REACHED: &str = "max_depth_reached";
/// Emitted paths that overwrote an earlier field with the same key.
pub const KEY_COLLISIONS: &str = "key_collisions";

const COUNTERS: &[&str] = &[
    OBJECTS_FLATTENED,
    ARRAYS_FLATTENED,
    FIELDS_CREATED,
    MAX_DEPTH_REACHED,
    KEY_COLLISIONS,
];

/// Key used when the root mapping itself is at or beyond the maximum depth.
pub const DEEP_OBJECT_KEY: &str = "deep_object";

/// Placeholder in [`FlattenOptions::array_index_format`].
pub const INDEX_PLACEHOLDER: &str = "{index}";

/// How sequences are expanded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayHandling {
    /// `field[0]`, `field[1]`, ... (see [`FlattenOptions::array_index_format`]).
    #[default]
    Index,
    /// `field_0`, `field_1`, ...
    Enumerate,
    /// Scalars joined with `", "` into `field`; complex items under `field_complex_N`.
    Concat,
}

/// What happens to null leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullHandling {
    #[default]
    Keep,
    Remove,
    EmptyString,
}

/// Transform applied to the whole subtree at a configured field path.
///
/// Configured as `{"type": "<name>"}`; an unrecognized name leaves the subtree unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RuleDef", into = "RuleDef")]
pub enum CustomRule {
    /// Textual rendering of the value.
    Stringify,
    /// JSON text of the value (`null` stays null).
    Json,
    /// First element of a sequence (null if empty).
    FirstElement,
    /// Length of a sequence, mapping or string.
    Length,
    /// Keys of a mapping.
    Keys,
    Unsupported(String),
}

#[derive(Serialize, Deserialize)]
struct RuleDef {
    #[serde(rename = "type", default = "default_rule_type")]
    rule_type: String,
}

fn default_rule_type() -> String {
    "string".to_string()
}

impl From<RuleDef> for CustomRule {
    fn from(def: RuleDef) -> Self {
        match def.rule_type.as_str() {
            "string" => CustomRule::Stringify,
            "json" => CustomRule::Json,
            "first_element" => CustomRule::FirstElement,
            "length" => CustomRule::Length,
            "keys" => CustomRule::Keys,
            _ => CustomRule::Unsupported(def.rule_type),
        }
    }
}

impl From<CustomRule> for RuleDef {
    fn from(rule: CustomRule) -> Self {
        let rule_type = match rule {
            CustomRule::Stringify => "string".to_string(),
            CustomRule::Json => "json".to_string(),
            CustomRule::FirstElement => "first_element".to_string(),
            CustomRule::Length => "length".to_string(),
            CustomRule::Keys => "keys".to_string(),
            CustomRule::Unsupported(name) => name,
        };
        RuleDef { rule_type }
    }
}

impl CustomRule {
    fn apply(&self, value: Value) -> Value {
        match (self, value) {
            (CustomRule::Stringify, v) => Value::Utf8(v.to_text()),
            (CustomRule::Json, Value::Null) => Value::Null,
            (CustomRule::Json, v) => Value::Utf8(v.to_json().to_string()),
            (CustomRule::FirstElement, Value::List(items)) => {
                items.into_iter().next().unwrap_or(Value::Null)
            }
            (CustomRule::Length, Value::List(items)) => len_value(items.len()),
            (CustomRule::Length, Value::Map(map)) => len_value(map.len()),
            (CustomRule::Length, Value::Utf8(s)) => len_value(s.chars().count()),
            (CustomRule::Keys, Value::Map(map)) => {
                Value::List(map.into_keys().map(Value::Utf8).collect())
            }
            (_, v) => v,
        }
    }
}

fn len_value(n: usize) -> Value {
    Value::Int64(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Options for the [`Flattener`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlattenOptions {
    pub separator: String,
    pub max_depth: usize,
    pub array_handling: ArrayHandling,
    /// Store whole sequences as text instead of expanding them.
    pub preserve_arrays: bool,
    #[serde(alias = "null_value_handling")]
    pub null_handling: NullHandling,
    pub flatten_objects: bool,
    pub flatten_arrays: bool,
    /// Suffix appended per element under [`ArrayHandling::Index`]; `{index}` is replaced.
    pub array_index_format: String,
    /// Rules keyed by full (joined) field path.
    #[serde(alias = "custom_flatteners")]
    pub custom_rules: IndexMap<String, CustomRule>,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            separator: ".".to_string(),
            max_depth: 10,
            array_handling: ArrayHandling::Index,
            preserve_arrays: false,
            null_handling: NullHandling::Keep,
            flatten_objects: true,
            flatten_arrays: true,
            array_index_format: format!("[{INDEX_PLACEHOLDER}]"),
            custom_rules: IndexMap::new(),
        }
    }
}

/// The flattening stage.
#[derive(Debug, Clone)]
pub struct Flattener {
    options: FlattenOptions,
}

impl Flattener {
    pub fn new(options: FlattenOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FlattenOptions {
        &self.options
    }

    /// Register (or replace) the rule for `path`.
    pub fn add_custom_rule(&mut self, path: impl Into<String>, rule: CustomRule) {
        self.options.custom_rules.insert(path.into(), rule);
    }

    /// Drop the rule for `path`, if any.
    pub fn remove_custom_rule(&mut self, path: &str) -> Option<CustomRule> {
        self.options.custom_rules.shift_remove(path)
    }

    /// Flatten a single payload without touching any envelope.
    pub fn preview(&self, record: Record) -> (Record, StageStats) {
        let mut walk = Walk::new(&self.options);
        walk.flatten_map(record, "", 0);
        (walk.out, walk.stats)
    }

    /// Flatten a batch.
    pub fn flatten(&self, batch: Vec<Envelope>) -> TransformResult<Vec<Envelope>> {
        self.apply(batch).map(|out| out.records)
    }

    /// Flatten a batch and return the aggregated statistics alongside it.
    pub fn apply(&self, batch: Vec<Envelope>) -> TransformResult<StageOutput> {
        let mut acc = BatchAccumulator::new(StageKind::Flattening, COUNTERS, batch.len());
        for envelope in batch {
            let (data, stats) = self.preview(envelope.data);
            acc.push(Envelope::new(data, envelope.metadata), stats);
        }
        let out = acc.finish(super::snapshot(&self.options));
        debug!(stage = %StageKind::Flattening, stats = %out.stats, "stage_complete");
        Ok(out)
    }
}

struct Walk<'a> {
    opts: &'a FlattenOptions,
    out: Record,
    stats: StageStats,
}

impl<'a> Walk<'a> {
    fn new(opts: &'a FlattenOptions) -> Self {
        Self {
            opts,
            out: Record::new(),
            stats: StageStats::default(),
        }
    }

    fn emit(&mut self, key: String, value: Value) {
        match self.out.insert(key, value) {
            None => self.stats.incr(FIELDS_CREATED),
            Some(_) => self.stats.incr(KEY_COLLISIONS),
        }
    }

    fn join(&self, prefix: &str, key: &str) -> String {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}{}{key}", self.opts.separator)
        }
    }

    fn flatten_map(&mut self, map: Record, prefix: &str, depth: usize) {
        let opts = self.opts;
        self.stats.record_max(MAX_DEPTH_REACHED, depth as u64);

        if depth >= opts.max_depth {
            let key = if prefix.is_empty() { DEEP_OBJECT_KEY } else { prefix };
            self.emit(key.to_string(), Value::Utf8(Value::Map(map).to_text()));
            return;
        }

        for (key, value) in map {
            let path = self.join(prefix, &key);
            match opts.custom_rules.get(&path) {
                Some(rule) => self.emit(path, rule.apply(value)),
                None => self.flatten_value(value, path, depth),
            }
        }
    }

    fn flatten_value(&mut self, value: Value, path: String, depth: usize) {
        let opts = self.opts;
        match value {
            Value::Null => match opts.null_handling {
                NullHandling::Keep => self.emit(path, Value::Null),
                NullHandling::EmptyString => self.emit(path, Value::Utf8(String::new())),
                NullHandling::Remove => {}
            },
            Value::Map(map) if opts.flatten_objects => {
                if map.is_empty() {
                    self.emit(path, Value::Map(map));
                } else {
                    self.stats.incr(OBJECTS_FLATTENED);
                    self.flatten_map(map, &path, depth + 1);
                }
            }
            Value::List(items) if opts.flatten_arrays => {
                if opts.preserve_arrays {
                    self.emit(path, Value::Utf8(Value::List(items).to_text()));
                } else {
                    self.flatten_list(items, path, depth);
                }
            }
            other => self.emit(path, other),
        }
    }

    fn flatten_list(&mut self, items: Vec<Value>, path: String, depth: usize) {
        let opts = self.opts;
        if items.is_empty() {
            self.emit(path, Value::List(items));
            return;
        }
        self.stats.incr(ARRAYS_FLATTENED);

        match opts.array_handling {
            ArrayHandling::Index => {
                for (i, item) in items.into_iter().enumerate() {
                    let suffix = opts.array_index_format.replace(INDEX_PLACEHOLDER, &i.to_string());
                    self.flatten_value(item, format!("{path}{suffix}"), depth);
                }
            }
            ArrayHandling::Enumerate => {
                for (i, item) in items.into_iter().enumerate() {
                    self.flatten_value(item, format!("{path}_{i}"), depth);
                }
            }
            ArrayHandling::Concat => {
                let mut scalars = Vec::new();
                let mut complex = 0usize;
                for item in items {
                    match item {
                        Value::Null => scalars.push(String::new()),
                        v if v.is_scalar() => scalars.push(v.to_text()),
                        v => {
                            self.flatten_value(v, format!("{path}_complex_{complex}"), depth);
                            complex += 1;
                        }
                    }
                }
                if !scalars.is_empty() {
                    self.emit(path, Value::Utf8(scalars.join(", ")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record_from_json;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        record_from_json(v).unwrap()
    }

    fn flatten_with(opts: FlattenOptions, v: serde_json::Value) -> (Record, StageStats) {
        Flattener::new(opts).preview(rec(v))
    }

    #[test]
    fn nested_objects_join_with_separator() {
        let (out, stats) = flatten_with(
            FlattenOptions::default(),
            json!({"address": {"city": "NYC", "zip": "10001"}}),
        );
        assert_eq!(out, rec(json!({"address.city": "NYC", "address.zip": "10001"})));
        assert_eq!(stats.get(OBJECTS_FLATTENED), 1);
        assert_eq!(stats.get(FIELDS_CREATED), 2);
        assert_eq!(stats.get(MAX_DEPTH_REACHED), 1);
    }

    #[test]
    fn single_level_record_is_unchanged() {
        let input = json!({"a": 1, "b": "x", "c": true, "d": 1.5});
        let (out, stats) = flatten_with(FlattenOptions::default(), input.clone());
        assert_eq!(out, rec(input));
        assert_eq!(stats.get(FIELDS_CREATED), 4);
        assert_eq!(stats.get(MAX_DEPTH_REACHED), 0);
    }

    #[test]
    fn dotted_key_colliding_with_flattened_path_counts_once() {
        let (out, stats) =
            flatten_with(FlattenOptions::default(), json!({"a.b": 1, "a": {"b": 2}}));
        assert_eq!(out, rec(json!({"a.b": 2})));
        assert_eq!(stats.get(FIELDS_CREATED), 1);
        assert_eq!(stats.get(KEY_COLLISIONS), 1);
    }

    #[test]
    fn index_policy_uses_index_format() {
        let (out, _) = flatten_with(FlattenOptions::default(), json!({"hobbies": ["a", "b"]}));
        assert_eq!(out, rec(json!({"hobbies[0]": "a", "hobbies[1]": "b"})));
    }

    #[test]
    fn enumerate_policy_uses_underscore_suffix() {
        let opts = FlattenOptions {
            array_handling: ArrayHandling::Enumerate,
            ..Default::default()
        };
        let (out, stats) = flatten_with(opts, json!({"tags": ["x", {"k": 1}]}));
        assert_eq!(out, rec(json!({"tags_0": "x", "tags_1.k": 1})));
        assert_eq!(stats.get(ARRAYS_FLATTENED), 1);
        assert_eq!(stats.get(OBJECTS_FLATTENED), 1);
    }

    #[test]
    fn concat_policy_joins_scalars_and_splits_complex_items() {
        let opts = FlattenOptions {
            array_handling: ArrayHandling::Concat,
            ..Default::default()
        };
        let (out, _) = flatten_with(opts, json!({"items": ["a", 1, null, {"b": 2}, [3]]}));
        assert_eq!(out.get("items"), Some(&Value::from("a, 1, ")));
        assert_eq!(out.get("items_complex_0.b"), Some(&Value::Int64(2)));
        assert_eq!(out.get("items_complex_1[0]"), Some(&Value::Int64(3)));
    }

    #[test]
    fn empty_containers_are_kept_verbatim() {
        let (out, stats) = flatten_with(FlattenOptions::default(), json!({"m": {}, "l": []}));
        assert_eq!(out.get("m"), Some(&Value::Map(Record::new())));
        assert_eq!(out.get("l"), Some(&Value::List(vec![])));
        assert_eq!(stats.get(OBJECTS_FLATTENED), 0);
        assert_eq!(stats.get(ARRAYS_FLATTENED), 0);
    }

    #[test]
    fn null_policies() {
        let input = json!({"a": {"b": null}, "c": 1});
        let (keep, _) = flatten_with(FlattenOptions::default(), input.clone());
        assert_eq!(keep.get("a.b"), Some(&Value::Null));

        let (removed, _) = flatten_with(
            FlattenOptions {
                null_handling: NullHandling::Remove,
                ..Default::default()
            },
            input.clone(),
        );
        assert!(!removed.contains_key("a.b"));
        assert_eq!(removed.len(), 1);

        let (empty, _) = flatten_with(
            FlattenOptions {
                null_handling: NullHandling::EmptyString,
                ..Default::default()
            },
            input,
        );
        assert_eq!(empty.get("a.b"), Some(&Value::from("")));
    }

    #[test]
    fn max_depth_serializes_remaining_subtree() {
        let opts = FlattenOptions {
            max_depth: 1,
            ..Default::default()
        };
        let (out, stats) = flatten_with(opts, json!({"a": {"b": {"c": 1}}, "z": 0}));
        assert_eq!(out.get("a"), Some(&Value::from(r#"{"b":{"c":1}}"#)));
        assert_eq!(out.get("z"), Some(&Value::Int64(0)));
        assert_eq!(stats.get(MAX_DEPTH_REACHED), 1);
    }

    #[test]
    fn custom_rules_short_circuit_flattening() {
        let mut flattener = Flattener::new(FlattenOptions::default());
        flattener.add_custom_rule("meta.tags", CustomRule::Length);
        flattener.add_custom_rule("meta.attrs", CustomRule::Keys);
        flattener.add_custom_rule("first", CustomRule::FirstElement);
        flattener.add_custom_rule("raw", CustomRule::Json);

        let (out, _) = flattener.preview(rec(json!({
            "meta": {"tags": ["a", "b", "c"], "attrs": {"x": 1, "y": 2}},
            "first": [9, 8],
            "raw": {"k": "v"}
        })));

        assert_eq!(out.get("meta.tags"), Some(&Value::Int64(3)));
        assert_eq!(out.get("meta.attrs"), Some(&Value::from(json!(["x", "y"]))));
        assert_eq!(out.get("first"), Some(&Value::Int64(9)));
        assert_eq!(out.get("raw"), Some(&Value::from(r#"{"k":"v"}"#)));

        assert_eq!(flattener.remove_custom_rule("raw"), Some(CustomRule::Json));
        let (out, _) = flattener.preview(rec(json!({"raw": {"k": "v"}})));
        assert_eq!(out.get("raw.k"), Some(&Value::from("v")));
    }

    #[test]
    fn custom_rules_deserialize_by_type_name() {
        let opts: FlattenOptions = serde_json::from_value(json!({
            "separator": "__",
            "custom_flatteners": {"a": {"type": "json"}, "b": {"type": "bogus"}, "c": {}}
        }))
        .unwrap();
        assert_eq!(opts.separator, "__");
        assert_eq!(opts.custom_rules.get("a"), Some(&CustomRule::Json));
        assert_eq!(opts.custom_rules.get("b"), Some(&CustomRule::Unsupported("bogus".into())));
        assert_eq!(opts.custom_rules.get("c"), Some(&CustomRule::Stringify));
        assert_eq!(opts.max_depth, 10);
    }

    #[test]
    fn preserve_arrays_stores_text() {
        let opts = FlattenOptions {
            preserve_arrays: true,
            ..Default::default()
        };
        let (out, _) = flatten_with(opts, json!({"l": [1, 2]}));
        assert_eq!(out.get("l"), Some(&Value::from("[1,2]")));
    }
}
