//! Filtered similarity search and grounded generation over a built index.
//!
//! A [`RagRetriever`] starts unloaded. [`RagRetriever::load`] resolves the
//! embedding backend, reads the persisted index into memory and, when an
//! API key is configured, prepares a chat client. Every query method fails
//! with `Error::NotLoaded` until that has succeeded. After loading, the
//! index is read-only, so a loaded retriever can serve concurrent reads.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    chat::{ChatMessage, ChatModel, OpenAiChat},
    config::Settings,
    embedding::{self, Embedder},
    error::{Error, Result},
    filter::FilterRequest,
    metadata::RecordMetadata,
    prompt,
    vector_store::{LoadedIndex, VectorStore, keys},
};

/// One ranked hit. Lower scores are closer (squared L2 distance).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: RecordMetadata,
}

/// What to return when filters reject every candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Return the unfiltered top results instead of nothing.
    #[default]
    Unfiltered,
    /// Return nothing.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieverOptions {
    pub fallback: FallbackPolicy,
    /// Candidates fetched per requested result when filters are active.
    pub over_fetch: usize,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::Unfiltered,
            over_fetch: 2,
        }
    }
}

struct Loaded {
    index: LoadedIndex,
    embedder: Box<dyn Embedder>,
    chat: Option<Box<dyn ChatModel>>,
}

pub struct RagRetriever {
    settings: Settings,
    options: RetrieverOptions,
    state: Option<Loaded>,
}

impl RagRetriever {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            options: RetrieverOptions::default(),
            state: None,
        }
    }

    pub fn with_options(mut self, options: RetrieverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn options(&self) -> RetrieverOptions {
        self.options
    }

    pub fn index_path(&self) -> PathBuf {
        self.settings.index_path()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    /// Whether generation is possible, i.e. loaded with a chat client.
    pub fn can_generate(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.chat.is_some())
    }

    /// Resolve backends from settings and load the index.
    ///
    /// The chat client is only created when an API key is configured;
    /// retrieval works without it.
    pub fn load(&mut self) -> Result<()> {
        let embedder = embedding::resolve(
            self.settings.embedding_backend,
            self.settings.embedding_model(),
            &self.settings,
        )?;
        let chat: Option<Box<dyn ChatModel>> = match self.settings.api_key {
            Some(_) => Some(Box::new(OpenAiChat::from_settings(&self.settings)?)),
            None => None,
        };
        self.load_with(embedder, chat)
    }

    /// Load the index using caller-supplied backends.
    ///
    /// Replaces any previously loaded state. On failure the previous state
    /// is kept.
    pub fn load_with(
        &mut self,
        embedder: Box<dyn Embedder>,
        chat: Option<Box<dyn ChatModel>>,
    ) -> Result<()> {
        let path = self.index_path();
        let store = VectorStore::open(&path)?;

        if let Some(built_with) = store.get_setting(keys::EMBEDDING_MODEL)?
            && built_with != embedder.model_id()
        {
            warn!(
                index_model = %built_with,
                query_model = %embedder.model_id(),
                "index was built with a different embedding model"
            );
        }

        let index = store.load()?;
        info!(
            path = %path.display(),
            documents = index.len(),
            dimension = index.dimension(),
            chat = ?chat.as_ref().map(|c| c.model_id()),
            "index loaded"
        );

        self.state = Some(Loaded {
            index,
            embedder,
            chat,
        });
        Ok(())
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.state.as_ref().ok_or(Error::NotLoaded("index"))
    }

    /// Up to `top_k` results for `query` that satisfy `filters`.
    ///
    /// With no effective filters this is a plain top-`k` search. Otherwise
    /// `top_k * over_fetch` candidates are fetched and filtered in rank
    /// order. When none survive, the [`FallbackPolicy`] decides between the
    /// unfiltered top-`k` and an empty result.
    pub fn retrieve(
        &self,
        query: &str,
        filters: &FilterRequest,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let loaded = self.loaded()?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let unknown = filters.unknown_fields();
        if !unknown.is_empty() {
            warn!(fields = ?unknown, "filtering on fields no record carries");
        }
        let filters = filters.normalize();
        let query_vector = loaded.embedder.embed_query(query)?;

        if filters.is_empty() {
            let hits = loaded.index.search(&query_vector, top_k)?;
            return to_results(&loaded.index, &hits);
        }

        let fetch = top_k
            .saturating_mul(self.options.over_fetch.max(1))
            .max(top_k);
        let candidates = loaded.index.search(&query_vector, fetch)?;

        let mut matched = Vec::with_capacity(top_k);
        for &(position, distance) in &candidates {
            let Some(document) = loaded.index.document(position) else {
                continue;
            };
            if filters.matches(&document.metadata) {
                matched.push((position, distance));
                if matched.len() == top_k {
                    break;
                }
            }
        }

        debug!(
            fetched = candidates.len(),
            matched = matched.len(),
            fields = ?filters.fields().collect::<Vec<_>>(),
            "filtered candidates"
        );

        if matched.is_empty() && !candidates.is_empty() {
            match self.options.fallback {
                FallbackPolicy::Unfiltered => {
                    debug!("no candidate matched filters; returning unfiltered results");
                    let unfiltered: Vec<_> =
                        candidates.into_iter().take(top_k).collect();
                    return to_results(&loaded.index, &unfiltered);
                }
                FallbackPolicy::Strict => return Ok(Vec::new()),
            }
        }

        to_results(&loaded.index, &matched)
    }

    /// Answer `user_prompt` grounded in freshly retrieved records.
    ///
    /// `top_k` defaults to the configured result count.
    pub fn generate_response(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        filters: &FilterRequest,
        history: &[ChatMessage],
        top_k: Option<usize>,
    ) -> Result<String> {
        let loaded = self.loaded()?;
        let chat = loaded
            .chat
            .as_deref()
            .ok_or(Error::NotLoaded("chat model"))?;

        let history = prompt::serialize_history(history);
        let results = self.retrieve(
            user_prompt,
            filters,
            top_k.unwrap_or(self.settings.default_top_k),
        )?;
        let context = prompt::format_context(&results);
        let messages =
            prompt::build_messages(system_prompt, user_prompt, &history, &context);

        debug!(sources = results.len(), "generating response");
        chat.complete(&messages)
    }

    /// Unfiltered, history-free question with a generic analyst prompt.
    ///
    /// `citations` is accepted for forward compatibility and has no effect
    /// yet; answers always carry the source numbering of the context.
    pub fn ask(
        &self,
        question: &str,
        top_k: Option<usize>,
        citations: bool,
    ) -> Result<String> {
        debug!(citations, "ask");
        self.generate_response(
            prompt::ASK_SYSTEM_PROMPT,
            question,
            &FilterRequest::new(),
            &[],
            top_k,
        )
    }
}

fn to_results(
    index: &LoadedIndex,
    hits: &[(usize, f32)],
) -> Result<Vec<RetrievalResult>> {
    hits.iter()
        .map(|&(position, score)| {
            let document = index.document(position).ok_or_else(|| Error::NotFound {
                kind: "stored document",
                name: position.to_string(),
            })?;
            Ok(RetrievalResult {
                id: document.id.clone(),
                text: document.text.clone(),
                score,
                metadata: document.metadata.clone(),
            })
        })
        .collect()
}

impl std::fmt::Debug for RagRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagRetriever")
            .field("index_path", &self.index_path())
            .field("options", &self.options)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::EmbeddingBackend, data_dir::DataDir};

    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn backend(&self) -> EmbeddingBackend {
            EmbeddingBackend::Local
        }

        fn model_id(&self) -> &str {
            "axis"
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts.iter().map(|t| self.embed_query(t)).collect()
        }

        fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
            Ok(vec![query.len() as f32])
        }
    }

    fn unloaded() -> (tempfile::TempDir, RagRetriever) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        (tmp, RagRetriever::new(Settings::new(&data_dir)))
    }

    #[test]
    fn methods_fail_before_load() {
        let (_tmp, retriever) = unloaded();
        assert!(!retriever.is_loaded());
        assert!(matches!(
            retriever.retrieve("q", &FilterRequest::new(), 5),
            Err(Error::NotLoaded(_))
        ));
        assert!(matches!(
            retriever.generate_response("s", "q", &FilterRequest::new(), &[], None),
            Err(Error::NotLoaded(_))
        ));
        assert!(matches!(
            retriever.ask("q", Some(3), true),
            Err(Error::NotLoaded(_))
        ));
    }

    #[test]
    fn load_without_index_is_not_found() {
        let (_tmp, mut retriever) = unloaded();
        let err = retriever.load_with(Box::new(AxisEmbedder), None).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(!retriever.is_loaded());
    }

    #[test]
    fn default_options() {
        let options = RetrieverOptions::default();
        assert_eq!(options.fallback, FallbackPolicy::Unfiltered);
        assert_eq!(options.over_fetch, 2);
    }
}
