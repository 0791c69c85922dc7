//! Typed per-document metadata.
//!
//! Every optional field is an explicit `Option` or set. A field that is
//! absent is never stored, never serialized, and never matched by a filter;
//! [`RecordMetadata::field`] is the one place that presence is decided.

use std::{borrow::Cow, collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// The constant `type` tag carried by every vulnerability document.
pub const DOCUMENT_TYPE: &str = "cve";

/// Serialized field names, also accepted as filter keys.
pub mod fields {
    pub const RECORD_ID: &str = "recordId";
    pub const YEAR: &str = "year";
    pub const TYPE: &str = "type";
    pub const VENDORS: &str = "vendors";
    pub const PRODUCTS: &str = "products";
    pub const WEAKNESS_IDS: &str = "weaknessIds";
    pub const SEVERITY: &str = "severity";
    pub const SCORE: &str = "score";
    pub const EXPLOIT_ADDED: &str = "exploitAdded";

    pub const ALL: &[&str] = &[
        RECORD_ID,
        YEAR,
        TYPE,
        VENDORS,
        PRODUCTS,
        WEAKNESS_IDS,
        SEVERITY,
        SCORE,
        EXPLOIT_ADDED,
    ];
}

/// Coarse CVSS severity label.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Case-insensitive parse; anything outside the vocabulary is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NONE" => Some(Self::None),
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_kind() -> String {
    DOCUMENT_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub vendors: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub products: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub weakness_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Date the record entered the CISA known-exploited catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploit_added: Option<String>,
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self {
            record_id: None,
            year: None,
            kind: default_kind(),
            vendors: BTreeSet::new(),
            products: BTreeSet::new(),
            weakness_ids: BTreeSet::new(),
            severity: None,
            score: None,
            exploit_added: None,
        }
    }
}

/// A present metadata value as seen by the filter engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Scalar(Cow<'a, str>),
    Set(&'a BTreeSet<String>),
}

impl RecordMetadata {
    /// Look up a field by its serialized name.
    ///
    /// Returns `None` when the field is absent, empty, or unknown.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        fn set(values: &BTreeSet<String>) -> Option<FieldValue<'_>> {
            (!values.is_empty()).then_some(FieldValue::Set(values))
        }
        fn text(value: &str) -> Option<FieldValue<'_>> {
            (!value.is_empty()).then_some(FieldValue::Scalar(Cow::Borrowed(value)))
        }

        match name {
            fields::RECORD_ID => self.record_id.as_deref().and_then(text),
            fields::YEAR => self
                .year
                .map(|y| FieldValue::Scalar(Cow::Owned(y.to_string()))),
            fields::TYPE => text(&self.kind),
            fields::VENDORS => set(&self.vendors),
            fields::PRODUCTS => set(&self.products),
            fields::WEAKNESS_IDS => set(&self.weakness_ids),
            fields::SEVERITY => self
                .severity
                .map(|s| FieldValue::Scalar(Cow::Borrowed(s.as_str()))),
            fields::SCORE => self
                .score
                .map(|s| FieldValue::Scalar(Cow::Owned(float_repr(s)))),
            fields::EXPLOIT_ADDED => self.exploit_added.as_deref().and_then(text),
            _ => None,
        }
    }
}

/// Render a float the way the dataset tooling prints it: whole numbers keep
/// one decimal place (`7.0`), everything else uses the shortest repr.
pub fn float_repr(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_serializes_only_type() {
        let json = serde_json::to_value(RecordMetadata::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["type"], DOCUMENT_TYPE);
    }

    #[test]
    fn serialized_keys_are_camel_case() {
        let meta = RecordMetadata {
            record_id: Some("CVE-2024-1".into()),
            weakness_ids: ["CWE-79".to_string()].into(),
            exploit_added: Some("2024-02-01".into()),
            severity: Some(Severity::High),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["recordId"], "CVE-2024-1");
        assert_eq!(json["weaknessIds"][0], "CWE-79");
        assert_eq!(json["exploitAdded"], "2024-02-01");
        assert_eq!(json["severity"], "HIGH");

        let back: RecordMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn field_absent_for_empty_or_unknown() {
        let meta = RecordMetadata::default();
        assert!(meta.field(fields::YEAR).is_none());
        assert!(meta.field(fields::VENDORS).is_none());
        assert!(meta.field("cveId").is_none());
        assert_eq!(
            meta.field(fields::TYPE),
            Some(FieldValue::Scalar(Cow::Borrowed("cve")))
        );
    }

    #[test]
    fn field_renders_scalars_as_strings() {
        let meta = RecordMetadata {
            year: Some(2023),
            score: Some(7.0),
            severity: Some(Severity::Critical),
            ..Default::default()
        };
        assert_eq!(
            meta.field(fields::YEAR),
            Some(FieldValue::Scalar(Cow::Owned("2023".into())))
        );
        assert_eq!(
            meta.field(fields::SCORE),
            Some(FieldValue::Scalar(Cow::Owned("7.0".into())))
        );
        assert_eq!(
            meta.field(fields::SEVERITY),
            Some(FieldValue::Scalar(Cow::Borrowed("CRITICAL")))
        );
    }

    #[test]
    fn severity_parse_is_case_insensitive() {
        assert_eq!(Severity::parse("high"), Some(Severity::High));
        assert_eq!(Severity::parse(" Critical "), Some(Severity::Critical));
        assert_eq!(Severity::parse("severe"), None);
    }

    #[test]
    fn float_repr_matches_dataset_style() {
        assert_eq!(float_repr(9.8), "9.8");
        assert_eq!(float_repr(10.0), "10.0");
        assert_eq!(float_repr(0.5), "0.5");
    }
}
