use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// Length of the hex digest used for records without an identifier.
const SHORT_LEN: usize = 12;

/// A display identifier for an indexed document.
///
/// Records carrying a source identifier (a CVE id) use it verbatim. Records
/// without one get a `#`-prefixed short hash of their serialized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn for_record(record_id: Option<&str>, text: &str) -> Self {
        match record_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self(id.to_string()),
            None => Self(format!("#{}", short_hex(hash_text(text), SHORT_LEN))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id was derived from content rather than the record.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with('#')
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn short_hex(value: u64, len: usize) -> String {
    let full = format!("{value:016x}");
    full[..len.min(full.len())].to_string()
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
