//! Turn one normalized vulnerability record into an indexable [`Document`].
//!
//! Upstream records are inconsistently shaped, so extraction never fails:
//! sub-fields that cannot be used are skipped and the document is kept with
//! whatever metadata could be derived.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    doc_id::DocumentId,
    metadata::{RecordMetadata, Severity},
};

/// CVSS metric blocks, newest schema first.
pub const METRIC_VERSIONS: &[&str] = &[
    "cvssMetricV40",
    "cvssMetricV31",
    "cvssMetricV30",
    "cvssMetricV2",
];

/// Minimum number of `:`-separated segments in a usable platform string.
const MIN_CPE_SEGMENTS: usize = 6;
const CPE_VENDOR_SEGMENT: usize = 3;
const CPE_PRODUCT_SEGMENT: usize = 4;

/// One indexable unit: the whole record as text plus derived metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub metadata: RecordMetadata,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        metadata: RecordMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata,
        }
    }
}

/// Extract a document from a single record.
///
/// The full record is serialized into `text`; no chunking is applied.
pub fn extract(record: &Value) -> Document {
    let text = record.to_string();
    let empty = Map::new();
    let obj = record.as_object().unwrap_or(&empty);

    let record_id = non_empty_str(obj.get("cveId")).map(str::to_string);
    let (vendors, products) = platform_names(obj.get("cpes"));
    let (severity, score) = cvss_summary(obj.get("metrics"));

    let metadata = RecordMetadata {
        record_id: record_id.clone(),
        year: leading_year(
            non_empty_str(obj.get("published"))
                .or_else(|| non_empty_str(obj.get("lastModified"))),
        ),
        vendors,
        products,
        weakness_ids: weakness_ids(obj.get("cwes")),
        severity,
        score,
        exploit_added: non_empty_str(obj.get("cisaExploitAdd"))
            .map(str::to_string),
        ..Default::default()
    };

    let id = DocumentId::for_record(record_id.as_deref(), &text);
    Document {
        id: id.into_string(),
        text,
        metadata,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Year from the first four characters of a timestamp, if they are digits.
fn leading_year(timestamp: Option<&str>) -> Option<i32> {
    let head = timestamp?.get(..4)?;
    if head.bytes().all(|b| b.is_ascii_digit()) {
        head.parse().ok()
    } else {
        None
    }
}

/// Vendor and product names from CPE-like `scheme:version:part:vendor:product:...`
/// strings. Entries may be bare strings or objects carrying the URI.
fn platform_names(cpes: Option<&Value>) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut vendors = BTreeSet::new();
    let mut products = BTreeSet::new();

    let Some(entries) = cpes.and_then(Value::as_array) else {
        return (vendors, products);
    };

    for entry in entries {
        let uri = match entry {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => ["cpeName", "cpe23Uri", "criteria"]
                .iter()
                .find_map(|key| non_empty_str(obj.get(*key))),
            _ => None,
        };
        let Some(uri) = uri else { continue };

        let segments: Vec<&str> = uri.split(':').collect();
        if segments.len() < MIN_CPE_SEGMENTS {
            continue;
        }
        let vendor = segments[CPE_VENDOR_SEGMENT];
        let product = segments[CPE_PRODUCT_SEGMENT];
        if !vendor.is_empty() {
            vendors.insert(vendor.to_string());
        }
        if !product.is_empty() {
            products.insert(product.to_string());
        }
    }

    (vendors, products)
}

fn weakness_ids(cwes: Option<&Value>) -> BTreeSet<String> {
    let Some(entries) = cwes.and_then(Value::as_array) else {
        return BTreeSet::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(s) => Some(s.trim()),
            Value::Object(obj) => non_empty_str(obj.get("cweId")),
            _ => None,
        })
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Severity and base score from the newest CVSS block that yields either.
fn cvss_summary(metrics: Option<&Value>) -> (Option<Severity>, Option<f64>) {
    let Some(metrics) = metrics.and_then(Value::as_object) else {
        return (None, None);
    };

    for version in METRIC_VERSIONS {
        let Some(entry) = metrics
            .get(*version)
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
        else {
            continue;
        };

        let cvss_data = entry.get("cvssData");
        let nested = |key: &str| {
            cvss_data
                .and_then(|data| data.get(key))
                .filter(|v| !v.is_null())
                .or_else(|| entry.get(key))
        };

        let severity =
            non_empty_str(nested("baseSeverity")).and_then(Severity::parse);
        let score = nested("baseScore").and_then(numeric);

        if severity.is_some() || score.is_some() {
            return (severity, score);
        }
    }

    (None, None)
}

/// Numbers pass through, numeric strings are parsed, anything else is absent.
fn numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}
