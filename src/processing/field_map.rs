//! Field-mapping stage: renames payload keys using per-source alias tables.
//!
//! The declared table is `source_type -> target_field -> [aliases]`. From it the mapper derives
//! a reverse index `source_type -> lookup_key -> target_field`, rebuilt whenever the table
//! changes through [`FieldMapper::add_mapping`] or [`FieldMapper::remove_mapping`].
//!
//! Aliases that collide (the same lookup key declared for two targets) resolve last-write-wins
//! in declaration order. Two payload fields that land on the same target also resolve
//! last-write-wins, in payload order, and are counted as `field_collisions`.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransformResult;
use crate::stats::StageStats;
use crate::types::{Envelope, Record, SourceType};

use super::{BatchAccumulator, StageKind, StageOutput};

pub const FIELDS_MAPPED: &str = "fields_mapped";
pub const FIELDS_KEPT: &str = "fields_kept";
pub const FIELDS_DROPPED: &str = "fields_dropped";
pub const FIELD_COLLISIONS: &str = "field_collisions";

const COUNTERS: &[&str] = &[FIELDS_MAPPED, FIELDS_KEPT, FIELDS_DROPPED, FIELD_COLLISIONS];

/// `target_field -> [source aliases]` for one source type.
pub type AliasTable = IndexMap<String, Vec<String>>;

/// Options for the [`FieldMapper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMappingOptions {
    /// `source_type -> target_field -> [aliases]`.
    pub field_mappings: IndexMap<String, AliasTable>,
    pub keep_unmapped_fields: bool,
    pub case_sensitive: bool,
}

impl Default for FieldMappingOptions {
    fn default() -> Self {
        Self {
            field_mappings: IndexMap::new(),
            keep_unmapped_fields: true,
            case_sensitive: false,
        }
    }
}

/// Summary of the declared mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub total_source_types: usize,
    pub mappings_per_source: IndexMap<String, usize>,
    /// Distinct target fields across all source types, in first-declared order.
    pub all_target_fields: Vec<String>,
    pub unique_target_fields: usize,
    pub total_source_fields: usize,
}

/// The field-mapping stage.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    options: FieldMappingOptions,
    reverse: HashMap<String, HashMap<String, String>>,
}

impl FieldMapper {
    pub fn new(options: FieldMappingOptions) -> Self {
        let mut mapper = Self {
            options,
            reverse: HashMap::new(),
        };
        mapper.rebuild_index();
        mapper
    }

    pub fn options(&self) -> &FieldMappingOptions {
        &self.options
    }

    /// Declare (or replace) the aliases of `target` for `source_type`.
    pub fn add_mapping<I, S>(&mut self, source_type: &str, target: impl Into<String>, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options
            .field_mappings
            .entry(source_type.to_string())
            .or_default()
            .insert(target.into(), aliases.into_iter().map(Into::into).collect());
        self.rebuild_index();
    }

    /// Remove the mapping for `target` under `source_type`. Returns whether one existed.
    pub fn remove_mapping(&mut self, source_type: &str, target: &str) -> bool {
        let removed = self
            .options
            .field_mappings
            .get_mut(source_type)
            .and_then(|table| table.shift_remove(target))
            .is_some();
        if removed {
            self.rebuild_index();
        }
        removed
    }

    /// Target field a payload field would be renamed to for `source_type`.
    pub fn target_for(&self, source_type: &SourceType, field: &str) -> Option<&str> {
        let key = self.lookup_key(field);
        self.reverse
            .get(source_type.as_str())
            .and_then(|index| index.get(key.as_ref()))
            .map(String::as_str)
    }

    pub fn mapping_stats(&self) -> MappingStats {
        let mut all_target_fields: Vec<String> = Vec::new();
        let mut mappings_per_source = IndexMap::new();
        let mut total_source_fields = 0;

        for (source, table) in &self.options.field_mappings {
            mappings_per_source.insert(source.clone(), table.len());
            for (target, aliases) in table {
                if !all_target_fields.contains(target) {
                    all_target_fields.push(target.clone());
                }
                total_source_fields += aliases.len();
            }
        }

        MappingStats {
            total_source_types: self.options.field_mappings.len(),
            mappings_per_source,
            unique_target_fields: all_target_fields.len(),
            all_target_fields,
            total_source_fields,
        }
    }

    /// Map a batch.
    pub fn map_fields(&self, batch: Vec<Envelope>) -> TransformResult<Vec<Envelope>> {
        self.apply(batch).map(|out| out.records)
    }

    /// Map a batch and return the aggregated statistics alongside it.
    pub fn apply(&self, batch: Vec<Envelope>) -> TransformResult<StageOutput> {
        let mut acc = BatchAccumulator::new(StageKind::FieldMapping, COUNTERS, batch.len());
        for envelope in batch {
            let (data, stats) = self.map_record(envelope.data, envelope.metadata.source_type());
            acc.push(Envelope::new(data, envelope.metadata), stats);
        }
        let out = acc.finish(super::snapshot(&self.options));
        debug!(stage = %StageKind::FieldMapping, stats = %out.stats, "stage_complete");
        Ok(out)
    }

    fn map_record(&self, record: Record, source_type: &SourceType) -> (Record, StageStats) {
        let mut stats = StageStats::default();
        let mut mapped = Record::with_capacity(record.len());
        let index = self.reverse.get(source_type.as_str());

        for (field, value) in record {
            let target = index.and_then(|idx| idx.get(self.lookup_key(&field).as_ref()));
            match target {
                Some(target) => {
                    stats.incr(FIELDS_MAPPED);
                    if mapped.insert(target.clone(), value).is_some() {
                        stats.incr(FIELD_COLLISIONS);
                    }
                }
                None if self.options.keep_unmapped_fields => {
                    stats.incr(FIELDS_KEPT);
                    if mapped.insert(field, value).is_some() {
                        stats.incr(FIELD_COLLISIONS);
                    }
                }
                None => stats.incr(FIELDS_DROPPED),
            }
        }
        (mapped, stats)
    }

    fn lookup_key<'a>(&self, name: &'a str) -> std::borrow::Cow<'a, str> {
        if self.options.case_sensitive {
            std::borrow::Cow::Borrowed(name)
        } else {
            std::borrow::Cow::Owned(name.to_lowercase())
        }
    }

    fn rebuild_index(&mut self) {
        let mut reverse = HashMap::with_capacity(self.options.field_mappings.len());
        for (source, table) in &self.options.field_mappings {
            let mut index = HashMap::new();
            for (target, aliases) in table {
                for alias in aliases {
                    index.insert(self.lookup_key(alias).into_owned(), target.clone());
                }
            }
            reverse.insert(source.clone(), index);
        }
        self.reverse = reverse;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, Value, record_from_json};
    use serde_json::json;

    fn envelope(source: SourceType, data: serde_json::Value) -> Envelope {
        Envelope::new(record_from_json(data).unwrap(), Metadata::new(source))
    }

    fn kafka_mapper() -> FieldMapper {
        let mut mapper = FieldMapper::new(FieldMappingOptions::default());
        mapper.add_mapping("kafka", "first_name", ["firstName", "fname"]);
        mapper.add_mapping("kafka", "age", ["user_age"]);
        mapper
    }

    #[test]
    fn renames_aliases_for_matching_source() {
        let out = kafka_mapper()
            .apply(vec![envelope(SourceType::Kafka, json!({"firstName": "X", "other": 1}))])
            .unwrap();
        let data = &out.records[0].data;
        assert_eq!(data.get("first_name"), Some(&Value::from("X")));
        assert_eq!(data.get("other"), Some(&Value::Int64(1)));
        assert!(!data.contains_key("firstName"));
        assert_eq!(out.stats.get(FIELDS_MAPPED), 1);
        assert_eq!(out.stats.get(FIELDS_KEPT), 1);
    }

    #[test]
    fn lookup_is_case_insensitive_by_default() {
        let out = kafka_mapper()
            .map_fields(vec![envelope(SourceType::Kafka, json!({"FIRSTNAME": "X", "User_Age": 4}))])
            .unwrap();
        assert_eq!(out[0].data, record_from_json(json!({"first_name": "X", "age": 4})).unwrap());
    }

    #[test]
    fn case_sensitive_lookup_requires_exact_alias() {
        let mut opts = FieldMappingOptions {
            case_sensitive: true,
            ..Default::default()
        };
        opts.field_mappings.insert(
            "kafka".into(),
            [("first_name".to_string(), vec!["firstName".to_string()])].into_iter().collect(),
        );
        let mapper = FieldMapper::new(opts);
        let batch = vec![envelope(SourceType::Kafka, json!({"firstname": "a", "firstName": "b"}))];
        let out = mapper.map_fields(batch).unwrap();
        assert_eq!(out[0].data.get("firstname"), Some(&Value::from("a")));
        assert_eq!(out[0].data.get("first_name"), Some(&Value::from("b")));
    }

    #[test]
    fn other_sources_are_untouched() {
        let out = kafka_mapper()
            .map_fields(vec![
                envelope(SourceType::MongoDb, json!({"firstName": "X"})),
                envelope(SourceType::Unknown, json!({"fname": "Y"})),
            ])
            .unwrap();
        assert_eq!(out[0].data.get("firstName"), Some(&Value::from("X")));
        assert_eq!(out[1].data.get("fname"), Some(&Value::from("Y")));
    }

    #[test]
    fn unmapped_fields_dropped_when_configured() {
        let mut opts = kafka_mapper().options().clone();
        opts.keep_unmapped_fields = false;
        let out = FieldMapper::new(opts)
            .apply(vec![envelope(SourceType::Kafka, json!({"firstName": "X", "junk": 1}))])
            .unwrap();
        assert_eq!(out.records[0].data.len(), 1);
        assert_eq!(out.stats.get(FIELDS_DROPPED), 1);
    }

    #[test]
    fn alias_declared_twice_resolves_to_last_target() {
        let mut mapper = FieldMapper::new(FieldMappingOptions::default());
        mapper.add_mapping("kafka", "name", ["n"]);
        mapper.add_mapping("kafka", "nickname", ["n"]);
        assert_eq!(mapper.target_for(&SourceType::Kafka, "n"), Some("nickname"));
    }

    #[test]
    fn two_fields_on_one_target_keep_the_later_value() {
        let out = kafka_mapper()
            .apply(vec![envelope(SourceType::Kafka, json!({"firstName": "a", "fname": "b"}))])
            .unwrap();
        assert_eq!(out.records[0].data.get("first_name"), Some(&Value::from("b")));
        assert_eq!(out.stats.get(FIELD_COLLISIONS), 1);
    }

    #[test]
    fn remove_mapping_rebuilds_index() {
        let mut mapper = kafka_mapper();
        assert!(mapper.remove_mapping("kafka", "first_name"));
        assert!(!mapper.remove_mapping("kafka", "first_name"));
        assert_eq!(mapper.target_for(&SourceType::Kafka, "firstName"), None);
        assert_eq!(mapper.target_for(&SourceType::Kafka, "user_age"), Some("age"));
    }

    #[test]
    fn mapping_stats_summarize_table() {
        let mut mapper = kafka_mapper();
        mapper.add_mapping("mongodb", "first_name", ["customer_name"]);
        let stats = mapper.mapping_stats();
        assert_eq!(stats.total_source_types, 2);
        assert_eq!(stats.mappings_per_source.get("kafka"), Some(&2));
        assert_eq!(stats.all_target_fields, vec!["first_name", "age"]);
        assert_eq!(stats.unique_target_fields, 2);
        assert_eq!(stats.total_source_fields, 4);
    }
}
