//! Batch question answering written to a plain-text report.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::DEFAULT_TOP_K,
    data_dir::DataDir,
    error::Result,
    retriever::RagRetriever,
};

pub const REPORT_FILE: &str = "rag_report.txt";

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_citations() -> bool {
    true
}

/// One question of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPrompt {
    pub question: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_citations")]
    pub citations: bool,
}

impl ReportPrompt {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            top_k: DEFAULT_TOP_K,
            citations: true,
        }
    }
}

/// Read prompts from a JSON array of `{question, top_k?, citations?}`.
pub fn load_prompts(path: &Path) -> Result<Vec<ReportPrompt>> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// `<reports dir>/rag_report.txt`.
pub fn default_report_path(data_dir: &DataDir) -> Result<PathBuf> {
    Ok(data_dir.reports_dir()?.join(REPORT_FILE))
}

/// Answer every prompt and write `# question` / answer blocks to
/// `output_path`, loading the retriever first if needed.
pub fn summarize_with_rag(
    retriever: &mut RagRetriever,
    prompts: &[ReportPrompt],
    output_path: &Path,
) -> Result<PathBuf> {
    if !retriever.is_loaded() {
        retriever.load()?;
    }

    let mut blocks = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let answer =
            retriever.ask(&prompt.question, Some(prompt.top_k), prompt.citations)?;
        blocks.push(format!("# {}\n{answer}\n", prompt.question));
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output_path, blocks.join("\n"))?;

    info!(
        path = %output_path.display(),
        questions = prompts.len(),
        "report written"
    );
    Ok(output_path.to_path_buf())
}
