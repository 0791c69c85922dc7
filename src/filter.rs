//! Metadata filtering applied to ranked search candidates.
//!
//! A [`FilterRequest`] maps a metadata field name to either one acceptable
//! value or a list of them. Keys are combined with AND; the values of a
//! list are combined with OR. All comparisons use the string form of both
//! sides, so `2023` and `"2023"` are the same filter.
//!
//! A document that lacks a filtered field never matches it. Filters that
//! carry no constraint (`null`, `""`, or a list with nothing usable in it)
//! are dropped during normalization, before any document is looked at.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::{FieldValue, RecordMetadata, fields};

/// Caller-supplied constraints, keyed by metadata field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterRequest(BTreeMap<String, Value>);

impl FilterRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint. Vectors become "any of" lists.
    ///
    /// ```
    /// use vulnrag::filter::FilterRequest;
    ///
    /// let filters = FilterRequest::new()
    ///     .with("year", 2023)
    ///     .with("severity", vec!["HIGH", "CRITICAL"]);
    /// assert_eq!(filters.normalize().len(), 2);
    /// ```
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Requested field names that no document carries. Filters on them
    /// can never match.
    pub fn unknown_fields(&self) -> Vec<&str> {
        self.iter()
            .map(|(field, _)| field)
            .filter(|field| !fields::ALL.contains(field))
            .collect()
    }

    /// Drop constraint-free entries and coerce values to strings.
    pub fn normalize(&self) -> NormalizedFilters {
        let clauses = self
            .0
            .iter()
            .filter_map(|(field, value)| {
                Expected::from_value(value).map(|e| (field.clone(), e))
            })
            .collect();
        NormalizedFilters(clauses)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for FilterRequest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The acceptable value(s) for one field after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    One(String),
    AnyOf(BTreeSet<String>),
}

impl Expected {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => {
                let set: BTreeSet<String> =
                    items.iter().filter_map(string_form).collect();
                (!set.is_empty()).then_some(Self::AnyOf(set))
            }
            other => string_form(other).map(Self::One),
        }
    }

    fn accepts(&self, candidate: FieldValue<'_>) -> bool {
        match (self, candidate) {
            (Self::AnyOf(wanted), FieldValue::Set(values)) => {
                values.iter().any(|v| wanted.contains(v))
            }
            (Self::AnyOf(wanted), FieldValue::Scalar(value)) => {
                wanted.contains(value.as_ref())
            }
            (Self::One(wanted), FieldValue::Set(values)) => {
                values.contains(wanted)
            }
            (Self::One(wanted), FieldValue::Scalar(value)) => {
                value.as_ref() == wanted
            }
        }
    }
}

/// String form of a filter value; `None` for values that constrain nothing.
fn string_form(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Filters with all no-op entries removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFilters(Vec<(String, Expected)>);

impl NormalizedFilters {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(field, _)| field.as_str())
    }

    pub fn get(&self, field: &str) -> Option<&Expected> {
        self.0.iter().find(|(f, _)| f == field).map(|(_, e)| e)
    }

    /// True when every clause accepts the document's value for its field.
    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        self.0.iter().all(|(field, expected)| {
            metadata
                .field(field)
                .is_some_and(|candidate| expected.accepts(candidate))
        })
    }
}

/// Decide whether `metadata` satisfies `filters`.
pub fn matches(metadata: &RecordMetadata, filters: &FilterRequest) -> bool {
    filters.normalize().matches(metadata)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::metadata::Severity;

    fn high() -> RecordMetadata {
        RecordMetadata {
            severity: Some(Severity::High),
            ..Default::default()
        }
    }

    #[test]
    fn list_filter_accepts_any_member() {
        let filters =
            FilterRequest::new().with("severity", vec!["HIGH", "CRITICAL"]);
        assert!(matches(&high(), &filters));

        let filters = FilterRequest::new().with("severity", vec!["LOW"]);
        assert!(!matches(&high(), &filters));
    }

    #[test]
    fn missing_field_never_matches() {
        let meta = RecordMetadata::default();
        for value in [json!(2023), json!("2023"), json!([2023, 2024])] {
            let filters = FilterRequest::new().with("year", value);
            assert!(!matches(&meta, &filters));
        }
    }

    #[test]
    fn unknown_fields_are_reported() {
        let filters = FilterRequest::new()
            .with("year", 2023)
            .with("vendor", "acme")
            .with("cvss", 9.8);
        assert_eq!(filters.unknown_fields(), ["cvss", "vendor"]);

        let known: FilterRequest =
            fields::ALL.iter().map(|f| (*f, "x")).collect();
        assert!(known.unknown_fields().is_empty());
    }

    #[test]
    fn empty_list_is_normalized_away() {
        let filters = FilterRequest::new().with("year", json!([]));
        assert!(filters.normalize().is_empty());
        assert!(matches(&RecordMetadata::default(), &filters));

        let filters = FilterRequest::new().with("year", json!([null, ""]));
        assert!(filters.normalize().is_empty());
    }

    #[test]
    fn null_and_empty_scalars_are_dropped() {
        let filters = FilterRequest::new()
            .with("year", Value::Null)
            .with("severity", "");
        assert!(filters.normalize().is_empty());
    }

    #[test]
    fn list_entries_are_cleaned() {
        let filters =
            FilterRequest::new().with("vendors", json!(["acme", null, ""]));
        let normalized = filters.normalize();
        assert_eq!(
            normalized.get("vendors"),
            Some(&Expected::AnyOf(["acme".to_string()].into()))
        );
    }

    #[test]
    fn numbers_compare_by_string_form() {
        let meta = RecordMetadata {
            year: Some(2023),
            ..Default::default()
        };
        assert!(matches(&meta, &FilterRequest::new().with("year", 2023)));
        assert!(matches(&meta, &FilterRequest::new().with("year", "2023")));
        assert!(!matches(&meta, &FilterRequest::new().with("year", 2024)));
    }

    #[test]
    fn scalar_against_set_is_membership() {
        let meta = RecordMetadata {
            vendors: ["acme".to_string(), "zeta".to_string()].into(),
            ..Default::default()
        };
        assert!(matches(&meta, &FilterRequest::new().with("vendors", "zeta")));
        assert!(!matches(&meta, &FilterRequest::new().with("vendors", "beta")));
    }

    #[test]
    fn set_against_list_is_intersection() {
        let meta = RecordMetadata {
            weakness_ids: ["CWE-79".to_string()].into(),
            ..Default::default()
        };
        let hit = FilterRequest::new().with("weaknessIds", vec!["CWE-89", "CWE-79"]);
        let miss = FilterRequest::new().with("weaknessIds", vec!["CWE-89"]);
        assert!(matches(&meta, &hit));
        assert!(!matches(&meta, &miss));
    }

    #[test]
    fn keys_are_combined_with_and() {
        let meta = RecordMetadata {
            year: Some(2024),
            severity: Some(Severity::Critical),
            ..Default::default()
        };
        let both = FilterRequest::new()
            .with("year", 2024)
            .with("severity", vec!["CRITICAL"]);
        let one_wrong = FilterRequest::new()
            .with("year", 2023)
            .with("severity", vec!["CRITICAL"]);
        assert!(matches(&meta, &both));
        assert!(!matches(&meta, &one_wrong));
    }

    #[test]
    fn unknown_field_never_matches() {
        let meta = RecordMetadata {
            record_id: Some("CVE-2024-1".into()),
            ..Default::default()
        };
        let filters = FilterRequest::new().with("cveId", "CVE-2024-1");
        assert!(!matches(&meta, &filters));
    }

    #[test]
    fn request_roundtrips_through_json() {
        let raw = json!({"year": 2023, "severity": ["HIGH"]});
        let filters: FilterRequest = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(filters.get("year"), Some(&json!(2023)));
        assert_eq!(serde_json::to_value(&filters).unwrap(), raw);
    }

    fn arb_metadata() -> impl Strategy<Value = RecordMetadata> {
        (
            prop::option::of(2019i32..2025),
            prop::collection::btree_set("[a-d]", 0..3),
        )
            .prop_map(|(year, vendors)| RecordMetadata {
                year,
                vendors,
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn singleton_list_equals_scalar(meta in arb_metadata(), v in "[a-d]", y in 2019i32..2025) {
            let scalar = FilterRequest::new().with("vendors", v.clone()).with("year", y);
            let listed = FilterRequest::new().with("vendors", vec![v]).with("year", vec![y]);
            prop_assert_eq!(matches(&meta, &scalar), matches(&meta, &listed));
        }

        #[test]
        fn blank_entries_do_not_change_outcome(meta in arb_metadata(), vs in prop::collection::vec("[a-d]", 0..3)) {
            let clean = FilterRequest::new().with("vendors", vs.clone());
            let mut noisy: Vec<Value> = vs.into_iter().map(Value::from).collect();
            noisy.push(Value::Null);
            noisy.push(Value::from(""));
            let noisy = FilterRequest::new().with("vendors", noisy);
            prop_assert_eq!(matches(&meta, &clean), matches(&meta, &noisy));
        }

        #[test]
        fn absent_year_fails_every_year_filter(ys in prop::collection::vec(2000i32..2030, 1..4)) {
            let meta = RecordMetadata::default();
            prop_assert!(!matches(&meta, &FilterRequest::new().with("year", ys)));
        }
    }
}
