//! Analysis chat sessions over tabular chart data.
//!
//! A session starts from the rows behind one chart or analysis. The rows
//! are summarized and turned into metadata filters, an initial report is
//! generated, and follow-up questions reuse the same summary, filters and
//! growing history. Sessions live in a [`SessionStore`] owned by the host:
//! created on first use, history only ever appended, never evicted.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{
    chat::ChatMessage,
    error::{Error, Result},
    filter::FilterRequest,
    metadata::fields,
    retriever::RagRetriever,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a security analyst assistant.";

/// Rows included in a data summary.
const SAMPLE_ROWS: usize = 5;

/// Summary used when a table has no rows.
pub const EMPTY_SUMMARY: &str = "No data provided";

/// Column-ordered rows, as produced by an analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl DataTable {
    /// Build a table from record-shaped rows. Columns are the union of the
    /// row keys, ordered by the first row that has each one.
    pub fn from_records(rows: Vec<Map<String, Value>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    /// Accept either `[{..}, ..]` or `{"columns": [..], "rows": [{..}, ..]}`.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let rows = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        Value::Object(row) => Ok(row),
                        _ => Err(Error::Input(format!("row {i} is not an object"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::from_records(rows))
            }
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            _ => Err(Error::Input(
                "table must be an array of rows or an object with columns and rows"
                    .to_string(),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    fn first_column<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates.iter().copied().find(|c| self.has_column(c))
    }

    fn column_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> {
        self.rows.iter().filter_map(move |row| row.get(name))
    }

    /// Columns, row count and the first few rows.
    pub fn summarize(&self) -> String {
        if self.is_empty() {
            return EMPTY_SUMMARY.to_string();
        }
        let sample: Vec<&Map<String, Value>> =
            self.rows.iter().take(SAMPLE_ROWS).collect();
        let sample = serde_json::to_string(&sample).unwrap_or_default();
        format!(
            "columns: {}\nrows: {}\nsample: {sample}",
            self.columns.join(", "),
            self.rows.len()
        )
    }

    /// Metadata filters implied by the table's columns.
    pub fn derive_filters(&self) -> FilterRequest {
        let mut filters = FilterRequest::new();
        if self.is_empty() {
            return filters;
        }

        if self.has_column("published")
            && let Some(year) = self.rows[0].get("published").and_then(leading_year)
        {
            filters.insert(fields::YEAR, year);
        }

        if self.has_column("cveId") {
            let ids: Vec<String> =
                self.column_values("cveId").flat_map(cell_strings).collect();
            if !ids.is_empty() {
                filters.insert(fields::RECORD_ID, ids);
            }
        }

        let sets: [(&[&str], &str, bool); 4] = [
            (&["vendor", "vendors"], fields::VENDORS, false),
            (&["product", "products"], fields::PRODUCTS, false),
            (&["cweId", "cwe", "cwes"], fields::WEAKNESS_IDS, false),
            (&["baseSeverity", "severity"], fields::SEVERITY, true),
        ];
        for (candidates, field, uppercase) in sets {
            let Some(column) = self.first_column(candidates) else {
                continue;
            };
            let values: BTreeSet<String> = self
                .column_values(column)
                .flat_map(cell_strings)
                .map(|v| if uppercase { v.to_uppercase() } else { v })
                .collect();
            if !values.is_empty() {
                filters.insert(field, values.into_iter().collect::<Vec<_>>());
            }
        }

        filters
    }
}

/// Year from a `YYYY...` string.
fn leading_year(value: &Value) -> Option<i32> {
    let head = value.as_str()?.get(..4)?;
    if head.bytes().all(|b| b.is_ascii_digit()) {
        head.parse().ok()
    } else {
        None
    }
}

/// Non-empty string forms of a cell; arrays are flattened.
fn cell_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(cell_strings).collect(),
        other => vec![other.to_string()],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSession {
    pub session_id: String,
    pub system_prompt: String,
    pub summary: String,
    pub filters: FilterRequest,
    pub history: Vec<ChatMessage>,
}

/// Sessions keyed by id, owned by the host application.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, AnalysisSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<&AnalysisSession> {
        self.sessions.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn insert(&mut self, session: AnalysisSession) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    fn get_mut(&mut self, session_id: &str) -> Result<&mut AnalysisSession> {
        self.sessions.get_mut(session_id).ok_or_else(|| Error::NotFound {
            kind: "session",
            name: session_id.to_string(),
        })
    }
}

/// Report-then-follow-up conversations about a [`DataTable`].
pub struct AnalysisChatService<'a> {
    retriever: &'a RagRetriever,
    sessions: &'a mut SessionStore,
}

impl<'a> AnalysisChatService<'a> {
    pub fn new(retriever: &'a RagRetriever, sessions: &'a mut SessionStore) -> Self {
        Self {
            retriever,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        self.sessions
    }

    /// Generate the initial report for `table` and store a new session.
    ///
    /// Starting a session under an existing id replaces it.
    pub fn start_session(
        &mut self,
        session_id: &str,
        table: &DataTable,
        system_prompt: &str,
    ) -> Result<String> {
        let summary = table.summarize();
        let filters = table.derive_filters();
        let report_prompt = compose_report_prompt(system_prompt, &summary);

        let response = self.retriever.generate_response(
            system_prompt,
            &report_prompt,
            &filters,
            &[],
            None,
        )?;

        info!(session = session_id, rows = table.rows.len(), "analysis session started");
        self.sessions.insert(AnalysisSession {
            session_id: session_id.to_string(),
            system_prompt: system_prompt.to_string(),
            summary,
            filters,
            history: vec![ChatMessage::assistant(response.clone())],
        });
        Ok(response)
    }

    /// Answer a follow-up question within an existing session.
    ///
    /// The session is only updated when generation succeeds.
    pub fn send_message(&mut self, session_id: &str, message: &str) -> Result<String> {
        let session = self.sessions.get_mut(session_id)?;
        let payload = compose_followup_payload(&session.summary, message);

        let mut history = session.history.clone();
        history.push(ChatMessage::user(message));

        let response = self.retriever.generate_response(
            &session.system_prompt,
            &payload,
            &session.filters,
            &history,
            None,
        )?;

        history.push(ChatMessage::assistant(response.clone()));
        session.history = history;
        Ok(response)
    }
}

pub fn compose_report_prompt(system_prompt: &str, summary: &str) -> String {
    format!(
        "{system_prompt}\n\n\
         You are summarizing the following analysis dataframe.\n\
         Data Summary:\n{summary}\n\
         Provide an executive report grounded on the retrieved CVE/CWE context."
    )
}

pub fn compose_followup_payload(summary: &str, message: &str) -> String {
    format!("Dataset summary: {summary}\n\nUser question: {message}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn table(value: Value) -> DataTable {
        DataTable::from_json(value).unwrap()
    }

    #[test]
    fn empty_table_summary_and_filters() {
        let t = DataTable::default();
        assert_eq!(t.summarize(), EMPTY_SUMMARY);
        assert!(t.derive_filters().is_empty());
    }

    #[test]
    fn summary_lists_columns_rows_and_sample() {
        let rows: Vec<Value> = (0..7).map(|i| json!({"vendor": format!("v{i}"), "count": i})).collect();
        let t = table(Value::Array(rows));
        let summary = t.summarize();
        let lines: Vec<_> = summary.lines().collect();
        assert_eq!(lines[0], "columns: count, vendor");
        assert_eq!(lines[1], "rows: 7");
        let sample: Vec<Value> =
            serde_json::from_str(lines[2].strip_prefix("sample: ").unwrap()).unwrap();
        assert_eq!(sample.len(), 5);
    }

    #[test]
    fn filters_use_metadata_field_names() {
        let t = table(json!([
            {"published": "2023-05-01T00:00:00", "cveId": "CVE-2023-2", "vendor": "acme",
             "cweId": "CWE-79", "baseSeverity": "high"},
            {"published": "2019-01-01", "cveId": "CVE-2023-1", "vendor": "zeta",
             "cweId": "CWE-79", "baseSeverity": "Critical"},
            {"published": null, "cveId": null, "vendor": "", "cweId": null},
        ]));
        let filters = t.derive_filters();
        assert_eq!(filters.get("year"), Some(&json!(2023)));
        assert_eq!(filters.get("recordId"), Some(&json!(["CVE-2023-2", "CVE-2023-1"])));
        assert_eq!(filters.get("vendors"), Some(&json!(["acme", "zeta"])));
        assert_eq!(filters.get("weaknessIds"), Some(&json!(["CWE-79"])));
        assert_eq!(filters.get("severity"), Some(&json!(["CRITICAL", "HIGH"])));
        assert!(filters.get("products").is_none());
    }

    #[test]
    fn list_cells_are_flattened() {
        let t = table(json!([
            {"products": ["widget", "gadget"]},
            {"products": ["widget"]},
        ]));
        assert_eq!(
            t.derive_filters().get("products"),
            Some(&json!(["gadget", "widget"]))
        );
    }

    #[test]
    fn first_matching_column_wins() {
        let t = table(json!([{"vendor": "acme", "vendors": "ignored"}]));
        assert_eq!(t.derive_filters().get("vendors"), Some(&json!(["acme"])));
    }

    #[test]
    fn unparsable_published_yields_no_year() {
        let t = table(json!([{"published": "n/a"}, {"published": "2024-01-01"}]));
        assert!(t.derive_filters().get("year").is_none());
    }

    #[test]
    fn table_accepts_columns_and_rows_shape() {
        let t = table(json!({"columns": ["a"], "rows": [{"a": 1}]}));
        assert_eq!(t.columns, ["a"]);
        assert_eq!(t.rows.len(), 1);
    }

    #[test]
    fn non_object_rows_are_rejected() {
        let err = DataTable::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::Input(_)));
        assert!(DataTable::from_json(json!("rows")).is_err());
    }

    #[test]
    fn prompts_embed_summary() {
        let report = compose_report_prompt("sys", "rows: 1");
        assert!(report.starts_with("sys\n\nYou are summarizing"));
        assert!(report.contains("Data Summary:\nrows: 1\n"));

        assert_eq!(
            compose_followup_payload("rows: 1", "why?"),
            "Dataset summary: rows: 1\n\nUser question: why?"
        );
    }

    #[test]
    fn unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = crate::data_dir::DataDir::resolve(Some(tmp.path())).unwrap();
        let retriever = RagRetriever::new(crate::config::Settings::new(&data_dir));
        let mut store = SessionStore::new();
        let mut service = AnalysisChatService::new(&retriever, &mut store);

        let err = service.send_message("missing", "hello").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "session", .. }));
    }
}
