//! Runtime settings resolved from environment-style options.

use std::{fmt, path::PathBuf, str::FromStr};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
};

/// Directory name of the persisted index under the index root.
pub const INDEX_NAME: &str = "cve_faiss";
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_LOCAL_EMBEDDING_MODEL: &str =
    "lightonai/GTE-ModernColBERT-v1";
pub const DEFAULT_REMOTE_EMBEDDING_MODEL: &str = "text-embedding-3-large";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

pub mod env {
    pub const EMBEDDING_BACKEND: &str = "VULNRAG_EMBEDDING_BACKEND";
    pub const LOCAL_EMBEDDING_MODEL: &str = "VULNRAG_LOCAL_EMBEDDING_MODEL";
    pub const REMOTE_EMBEDDING_MODEL: &str = "VULNRAG_REMOTE_EMBEDDING_MODEL";
    pub const EMBEDDING_MODEL: &str = "VULNRAG_EMBEDDING_MODEL";
    pub const CHAT_MODEL: &str = "VULNRAG_CHAT_MODEL";
    pub const API_KEY: &str = "OPENAI_API_KEY";
    pub const API_BASE_URL: &str = "OPENAI_BASE_URL";
    pub const INDEX_DIR: &str = "VULNRAG_INDEX_DIR";
    pub const DATASET_DIR: &str = "VULNRAG_DATASET_DIR";
    pub const TOP_K: &str = "VULNRAG_TOP_K";
}

/// Which embedding implementation turns text into vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmbeddingBackend {
    /// A model run in-process.
    Local,
    /// An OpenAI-compatible embeddings endpoint.
    #[value(alias = "openai")]
    Remote,
}

impl EmbeddingBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "openai" => Ok(Self::Remote),
            other => Err(Error::Config(format!(
                "unknown embedding backend '{other}' (expected 'local' or 'remote')"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Settings {
    pub embedding_backend: EmbeddingBackend,
    pub local_embedding_model: String,
    pub remote_embedding_model: String,
    /// Takes precedence over both backend-specific model names.
    pub embedding_model_override: Option<String>,
    pub chat_model: String,
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub index_root: PathBuf,
    pub dataset_dir: PathBuf,
    pub default_top_k: usize,
}

impl Settings {
    /// Built-in defaults rooted at `data_dir`.
    pub fn new(data_dir: &DataDir) -> Self {
        Self {
            embedding_backend: EmbeddingBackend::Local,
            local_embedding_model: DEFAULT_LOCAL_EMBEDDING_MODEL.to_string(),
            remote_embedding_model: DEFAULT_REMOTE_EMBEDDING_MODEL
                .to_string(),
            embedding_model_override: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            api_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            index_root: data_dir.index_root(),
            dataset_dir: data_dir.dataset_dir(),
            default_top_k: DEFAULT_TOP_K,
        }
    }

    /// Resolve settings from the process environment.
    pub fn from_env(data_dir: &DataDir) -> Result<Self> {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    /// Resolve settings from an arbitrary key lookup. Empty values count as
    /// unset.
    pub fn from_lookup<F>(data_dir: &DataDir, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Self::new(data_dir);

        if let Some(backend) = get(env::EMBEDDING_BACKEND) {
            settings.embedding_backend = backend.parse()?;
        }
        if let Some(model) = get(env::LOCAL_EMBEDDING_MODEL) {
            settings.local_embedding_model = model;
        }
        if let Some(model) = get(env::REMOTE_EMBEDDING_MODEL) {
            settings.remote_embedding_model = model;
        }
        settings.embedding_model_override = get(env::EMBEDDING_MODEL);
        if let Some(model) = get(env::CHAT_MODEL) {
            settings.chat_model = model;
        }
        settings.api_key = get(env::API_KEY);
        if let Some(url) = get(env::API_BASE_URL) {
            settings.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(dir) = get(env::INDEX_DIR) {
            settings.index_root = PathBuf::from(dir);
        }
        if let Some(dir) = get(env::DATASET_DIR) {
            settings.dataset_dir = PathBuf::from(dir);
        }
        if let Some(top_k) = get(env::TOP_K) {
            settings.default_top_k = parse_top_k(&top_k)?;
        }

        Ok(settings)
    }

    /// The embedding model for the selected backend, honoring the override.
    pub fn embedding_model(&self) -> &str {
        if let Some(model) = &self.embedding_model_override {
            return model;
        }
        match self.embedding_backend {
            EmbeddingBackend::Local => &self.local_embedding_model,
            EmbeddingBackend::Remote => &self.remote_embedding_model,
        }
    }

    /// Deterministic location of the persisted index.
    pub fn index_path(&self) -> PathBuf {
        self.index_root.join(INDEX_NAME)
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "{} must be set to use the remote API",
                env::API_KEY
            ))
        })
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("embedding_backend", &self.embedding_backend)
            .field("embedding_model", &self.embedding_model())
            .field("chat_model", &self.chat_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("index_root", &self.index_root)
            .field("dataset_dir", &self.dataset_dir)
            .field("default_top_k", &self.default_top_k)
            .finish()
    }
}

fn parse_top_k(raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(0) => Err(Error::Config(format!(
            "{} must be greater than zero",
            env::TOP_K
        ))),
        Ok(k) => Ok(k),
        Err(e) => Err(Error::Config(format!(
            "{} is not a valid count ({raw}): {e}",
            env::TOP_K
        ))),
    }
}
