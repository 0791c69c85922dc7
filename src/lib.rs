//! vulnrag - retrieval-augmented question answering over CVE/CWE datasets.
//!
//! vulnrag turns per-year vulnerability dataset shards into a persisted
//! vector index, answers filtered similarity queries against it, and
//! grounds chat-model answers in the retrieved records. Embeddings come
//! either from a local [ColBERT](https://github.com/stanford-futuredata/ColBERT)
//! model or from an OpenAI-compatible `/embeddings` endpoint.
//!
//! # Quick start
//!
//! ```no_run
//! use vulnrag::{DataDir, FilterRequest, RagRetriever, Settings};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let settings = Settings::from_env(&data_dir).unwrap();
//!
//! let mut retriever = RagRetriever::new(settings);
//! retriever.load().unwrap();
//!
//! let mut filters = FilterRequest::new();
//! filters.insert("year", 2023);
//!
//! let results = retriever.retrieve("sql injection", &filters, 5).unwrap();
//! for r in &results {
//!     println!("{} (score: {:.3})", r.id, r.score);
//! }
//! ```

pub mod chat;
pub mod config;
pub mod data_dir;
pub mod dataset;
pub mod doc_id;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod filter;
pub mod indexer;
pub mod metadata;
pub mod model_manager;
pub mod openai;
pub mod prompt;
pub mod report;
pub mod retriever;
pub mod session;
pub mod vector_store;

pub use config::Settings;
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use error::{Error, Result};
pub use extract::Document;
pub use filter::FilterRequest;
pub use indexer::VectorIndexer;
#[cfg(feature = "local")]
pub use model_manager::ModelManager;
pub use retriever::RagRetriever;
pub use vector_store::VectorStore;
