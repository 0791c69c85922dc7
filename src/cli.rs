use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use vulnrag::{
    config::EmbeddingBackend,
    filter::FilterRequest,
    indexer::DEFAULT_BATCH_SIZE,
    metadata::fields,
};

#[derive(Debug, Parser)]
#[command(
    name = "vulnrag",
    about = "Retrieval-augmented question answering over CVE/CWE datasets"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory holding the named vector index
    #[arg(long, global = true)]
    pub index_dir: Option<PathBuf>,

    /// Directory scanned for per-year dataset shards
    #[arg(long, global = true)]
    pub dataset_dir: Option<PathBuf>,

    /// Embedding backend to use
    #[arg(long, global = true, value_enum)]
    pub embedding_backend: Option<EmbeddingBackend>,

    /// Embedding model ID or local model path
    #[arg(long, global = true)]
    pub embedding_model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Embed the dataset shards and build the vector index
    BuildIndex(BuildIndexArgs),
    /// Filtered similarity search over the index
    Search(SearchArgs),
    /// Ask a question answered from retrieved records
    Ask(AskArgs),
    /// Interactive analysis chat over a table of rows
    Chat(ChatArgs),
    /// Answer a list of questions into a text report
    Report(ReportArgs),
    /// Download an embedding model snapshot for offline use
    DownloadModel(DownloadModelArgs),
    /// Show index location and statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildIndexArgs {
    /// Documents embedded per batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = parse_batch_size)]
    pub batch_size: usize,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

fn parse_batch_size(raw: &str) -> Result<usize, String> {
    let size: usize = raw.parse().map_err(|e| format!("{e}"))?;
    if size == 0 {
        return Err("batch size must be at least 1".to_string());
    }
    Ok(size)
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return (defaults to the configured count)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Only records published in this year
    #[arg(long)]
    pub year: Option<i32>,

    /// Only records affecting this vendor (repeatable)
    #[arg(long = "vendor")]
    pub vendors: Vec<String>,

    /// Only records affecting this product (repeatable)
    #[arg(long = "product")]
    pub products: Vec<String>,

    /// Only records with this weakness id, e.g. CWE-79 (repeatable)
    #[arg(long = "cwe")]
    pub cwes: Vec<String>,

    /// Only records with this severity (repeatable)
    #[arg(long = "severity")]
    pub severities: Vec<String>,

    /// Only these record ids (repeatable)
    #[arg(long = "record-id")]
    pub record_ids: Vec<String>,

    /// Return nothing instead of unfiltered results when no record matches
    #[arg(long)]
    pub strict: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

impl SearchArgs {
    pub fn filters(&self) -> FilterRequest {
        let mut filters = FilterRequest::new();
        if let Some(year) = self.year {
            filters.insert(fields::YEAR, year);
        }
        let lists = [
            (fields::VENDORS, &self.vendors),
            (fields::PRODUCTS, &self.products),
            (fields::WEAKNESS_IDS, &self.cwes),
            (fields::RECORD_ID, &self.record_ids),
        ];
        for (field, values) in lists {
            if !values.is_empty() {
                filters.insert(field, values.clone());
            }
        }
        if !self.severities.is_empty() {
            let upper: Vec<String> =
                self.severities.iter().map(|s| s.to_uppercase()).collect();
            filters.insert(fields::SEVERITY, upper);
        }
        filters
    }
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question to answer
    pub question: String,

    /// Number of records to retrieve as context
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Do not request citations
    #[arg(long)]
    pub no_citations: bool,
}

// -- Chat --

#[derive(Debug, Parser)]
pub struct ChatArgs {
    /// JSON file with the analysis rows (array of objects)
    #[arg(long)]
    pub data: PathBuf,

    /// System prompt for the analyst persona
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Session identifier
    #[arg(long, default_value = "analysis_chat")]
    pub session: String,
}

// -- Report --

#[derive(Debug, Parser)]
pub struct ReportArgs {
    /// JSON file with an array of {question, top_k?, citations?}
    #[arg(long)]
    pub prompts: PathBuf,

    /// Output file (defaults to <data-dir>/reports/rag_report.txt)
    #[arg(long)]
    pub output: Option<PathBuf>,
}

// -- Download --

#[derive(Debug, Parser)]
pub struct DownloadModelArgs {
    /// Model ID on the Hugging Face hub (defaults to the local embedding model)
    #[arg(long)]
    pub model: Option<String>,

    /// Branch, tag or commit
    #[arg(long)]
    pub revision: Option<String>,

    /// Directory to place the snapshot in (defaults to the hub cache)
    #[arg(long)]
    pub target_dir: Option<PathBuf>,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "vulnrag",
            &mut std::io::stdout(),
        );
    }
}
