//! Embedding backends and the factory that picks one.
//!
//! Both backends produce a single dense vector per text, so documents and
//! queries land in the same space and the flat L2 index can compare them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{EmbeddingBackend, Settings},
    error::{Error, Result},
    openai::ApiClient,
};

/// Turns text into vectors.
pub trait Embedder: Send + Sync {
    fn backend(&self) -> EmbeddingBackend;

    fn model_id(&self) -> &str;

    /// One vector per input text, in input order.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_query(&self, query: &str) -> Result<Vec<f32>>;
}

/// Build the embedder for `backend` using `model`.
///
/// The remote backend needs an API key; the local backend needs this crate
/// to be built with the `local` feature.
pub fn resolve(
    backend: EmbeddingBackend,
    model: &str,
    settings: &Settings,
) -> Result<Box<dyn Embedder>> {
    let model = model.trim();
    if model.is_empty() {
        return Err(Error::Config(format!(
            "no embedding model configured for the {backend} backend"
        )));
    }

    match backend {
        EmbeddingBackend::Remote => {
            let client = ApiClient::from_settings(settings)?;
            Ok(Box::new(RemoteEmbedder::new(client, model)))
        }
        EmbeddingBackend::Local => local(model),
    }
}

#[cfg(feature = "local")]
fn local(model: &str) -> Result<Box<dyn Embedder>> {
    Ok(Box::new(LocalEmbedder::new(model)))
}

#[cfg(not(feature = "local"))]
fn local(_model: &str) -> Result<Box<dyn Embedder>> {
    Err(Error::Dependency(
        "the local embedding backend is not available in this build; \
         rebuild with the `local` feature or use the remote backend"
            .to_string(),
    ))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// An OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug)]
pub struct RemoteEmbedder {
    client: ApiClient,
    model: String,
}

impl RemoteEmbedder {
    pub fn new(client: ApiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl Embedder for RemoteEmbedder {
    fn backend(&self) -> EmbeddingBackend {
        EmbeddingBackend::Remote
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch_size = texts.len(), model = %self.model, "embedding batch");

        let response: EmbeddingResponse = self.client.post_json(
            "embeddings",
            &EmbeddingRequest {
                model: &self.model,
                input: texts,
            },
            Error::Embedding,
        )?;

        order_by_index(response.data, texts.len())
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed_documents(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("API returned no embedding".into()))
    }
}

/// Put response vectors back in request order.
///
/// Entries without an `index` keep their response position.
fn order_by_index(data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        return Err(Error::Embedding(format!(
            "requested {expected} embeddings, API returned {}",
            data.len()
        )));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for (position, item) in data.into_iter().enumerate() {
        let index = item.index.unwrap_or(position);
        let slot = slots.get_mut(index).ok_or_else(|| {
            Error::Embedding(format!("API returned out-of-range index {index}"))
        })?;
        if slot.replace(item.embedding).is_some() {
            return Err(Error::Embedding(format!(
                "API returned index {index} more than once"
            )));
        }
    }

    // Every slot is filled: counts match and no index repeats.
    Ok(slots.into_iter().flatten().collect())
}

#[cfg(feature = "local")]
pub use local_backend::LocalEmbedder;

#[cfg(feature = "local")]
mod local_backend {
    use std::sync::Mutex;

    use super::Embedder;
    use crate::{
        config::EmbeddingBackend,
        error::{Error, Result},
        model_manager::{ModelManager, mean_pool_normalized, pool_each},
    };

    /// A ColBERT model run in-process, pooled to one vector per text.
    pub struct LocalEmbedder {
        model_id: String,
        manager: Mutex<ModelManager>,
    }

    impl LocalEmbedder {
        pub fn new(model_id: &str) -> Self {
            Self {
                model_id: model_id.to_string(),
                manager: Mutex::new(ModelManager::with_model_id(model_id)),
            }
        }

        fn with_manager<T>(
            &self,
            f: impl FnOnce(&mut ModelManager) -> Result<T>,
        ) -> Result<T> {
            let mut guard = self.manager.lock().map_err(|_| {
                Error::Embedding("embedding model lock poisoned".to_string())
            })?;
            f(&mut guard)
        }
    }

    impl Embedder for LocalEmbedder {
        fn backend(&self) -> EmbeddingBackend {
            EmbeddingBackend::Local
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.with_manager(|m| pool_each(texts, |one| m.encode_documents(one)))
        }

        fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
            let tokens = self.with_manager(|m| m.encode_query(query))?;
            mean_pool_normalized(&tokens)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Embedding("model returned no embedding".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_dir::DataDir;

    fn data(index: Option<usize>, v: f32) -> EmbeddingData {
        EmbeddingData {
            index,
            embedding: vec![v],
        }
    }

    fn settings(api_key: Option<&str>) -> (tempfile::TempDir, Settings) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let mut settings = Settings::new(&data_dir);
        settings.api_key = api_key.map(str::to_string);
        (tmp, settings)
    }

    #[test]
    fn response_is_reordered_by_index() {
        let ordered = order_by_index(
            vec![data(Some(2), 2.0), data(Some(0), 0.0), data(Some(1), 1.0)],
            3,
        )
        .unwrap();
        assert_eq!(ordered, vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn missing_index_keeps_position() {
        let ordered =
            order_by_index(vec![data(None, 5.0), data(None, 6.0)], 2).unwrap();
        assert_eq!(ordered, vec![vec![5.0], vec![6.0]]);
    }

    #[test]
    fn count_mismatch_is_error() {
        let err = order_by_index(vec![data(Some(0), 1.0)], 2).unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[test]
    fn duplicate_or_out_of_range_index_is_error() {
        assert!(
            order_by_index(vec![data(Some(0), 1.0), data(Some(0), 2.0)], 2)
                .is_err()
        );
        assert!(
            order_by_index(vec![data(Some(0), 1.0), data(Some(7), 2.0)], 2)
                .is_err()
        );
    }

    #[test]
    fn remote_without_key_is_config_error() {
        let (_tmp, settings) = settings(None);
        let err = resolve(EmbeddingBackend::Remote, "text-embedding-3-large", &settings)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn remote_with_key_resolves() {
        let (_tmp, settings) = settings(Some("sk-test"));
        let embedder =
            resolve(EmbeddingBackend::Remote, "text-embedding-3-large", &settings)
                .unwrap();
        assert_eq!(embedder.backend(), EmbeddingBackend::Remote);
        assert_eq!(embedder.model_id(), "text-embedding-3-large");
    }

    #[test]
    fn blank_model_is_config_error() {
        let (_tmp, settings) = settings(Some("sk-test"));
        let err = resolve(EmbeddingBackend::Remote, " ", &settings).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[cfg(not(feature = "local"))]
    #[test]
    fn local_without_feature_is_dependency_error() {
        let (_tmp, settings) = settings(None);
        let err = resolve(EmbeddingBackend::Local, "some/model", &settings)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Dependency(_)));
    }

    #[cfg(feature = "local")]
    #[test]
    fn local_resolves_lazily() {
        let (_tmp, settings) = settings(None);
        let embedder =
            resolve(EmbeddingBackend::Local, "some/model", &settings).unwrap();
        assert_eq!(embedder.backend(), EmbeddingBackend::Local);
        assert_eq!(embedder.model_id(), "some/model");
    }
}
