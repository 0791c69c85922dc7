use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use tracing::info;

use crate::error::{Error, Result};

/// Revision fetched when none is requested.
pub const DEFAULT_REVISION: &str = "main";

#[cfg(feature = "local")]
pub use colbert::ModelManager;

#[cfg(feature = "local")]
mod colbert {
    use candle_core::{Device, Tensor};
    use pylate_rs::ColBERT;
    use tracing::info;

    use crate::error::{Error, Result};

    /// Select the best available compute device.
    ///
    /// Uses CUDA when compiled with the `cuda` feature, Metal when compiled
    /// with the `metal` feature, and falls back to CPU otherwise.
    fn default_device() -> Device {
        #[cfg(feature = "cuda")]
        {
            if let Ok(device) = Device::new_cuda(0) {
                return device;
            }
        }

        #[cfg(feature = "metal")]
        {
            if let Ok(device) = Device::new_metal(0) {
                return device;
            }
        }

        Device::Cpu
    }

    /// Manages the ColBERT model lifecycle, loading it on first use.
    ///
    /// The model id may be a Hugging Face repository or a local snapshot
    /// directory produced by [`super::download`].
    pub struct ModelManager {
        model: Option<ColBERT>,
        model_id: String,
    }

    impl ModelManager {
        pub fn with_model_id(model_id: impl Into<String>) -> Self {
            Self {
                model: None,
                model_id: model_id.into(),
            }
        }

        pub fn model_id(&self) -> &str {
            &self.model_id
        }

        pub fn is_loaded(&self) -> bool {
            self.model.is_some()
        }

        /// Ensures the model is loaded, downloading from the hub if needed.
        fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
            if self.model.is_none() {
                info!(model = %self.model_id, "loading embedding model");
                let colbert: ColBERT = ColBERT::from(&self.model_id)
                    .with_device(default_device())
                    .try_into()
                    .map_err(|e| {
                        Error::Dependency(format!(
                            "failed to load embedding model {}: {e}",
                            self.model_id
                        ))
                    })?;
                self.model = Some(colbert);
            }

            self.model
                .as_mut()
                .ok_or(Error::NotLoaded("embedding model"))
        }

        /// Token-level embeddings, shape `[B, T, D]`.
        pub fn encode_documents(&mut self, texts: &[String]) -> Result<Tensor> {
            let model = self.ensure_loaded()?;
            model
                .encode(texts, false)
                .map_err(|e| Error::Embedding(format!("document encoding failed: {e}")))
        }

        /// Token-level query embeddings, shape `[1, Q, D]`.
        pub fn encode_query(&mut self, query: &str) -> Result<Tensor> {
            let model = self.ensure_loaded()?;
            model
                .encode(&[query.to_string()], true)
                .map_err(|e| Error::Embedding(format!("query encoding failed: {e}")))
        }
    }
}

/// Collapse `[B, T, D]` token embeddings into one unit-length vector per
/// batch row by averaging over tokens.
pub fn mean_pool_normalized(embeddings: &Tensor) -> Result<Vec<Vec<f32>>> {
    let pooled = embeddings
        .to_dtype(DType::F32)
        .and_then(|t| t.mean(1))
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(|e| {
            Error::Embedding(format!("unexpected embedding tensor shape: {e}"))
        })?;

    Ok(pooled.into_iter().map(normalize).collect())
}

/// Encode and pool every text on its own.
///
/// Batched encoders pad shorter texts up to the longest in the batch, and
/// a plain mean over the token axis would then depend on the neighbours.
/// One text per call has no padding, so a text's vector is the same in
/// every batch.
pub fn pool_each<F>(texts: &[String], mut encode: F) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(&[String]) -> Result<Tensor>,
{
    texts
        .iter()
        .map(|text| {
            let tokens = encode(std::slice::from_ref(text))?;
            mean_pool_normalized(&tokens)?.into_iter().next().ok_or_else(|| {
                Error::Embedding("model returned no embedding".to_string())
            })
        })
        .collect()
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// Download a full model snapshot from the Hugging Face hub.
///
/// Files land in `target_dir` when given, otherwise in the default hub
/// cache. Returns the snapshot directory, which can be used as a local
/// model id.
pub fn download(
    model_id: &str,
    revision: Option<&str>,
    target_dir: Option<&Path>,
) -> Result<PathBuf> {
    use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};

    let revision = revision.unwrap_or(DEFAULT_REVISION);
    let hub_err = |e: hf_hub::api::sync::ApiError| {
        Error::Embedding(format!("model download failed for {model_id}: {e}"))
    };

    let mut builder = ApiBuilder::new().with_progress(true);
    if let Some(dir) = target_dir {
        std::fs::create_dir_all(dir)?;
        builder = builder.with_cache_dir(dir.to_path_buf());
    }
    let api = builder.build().map_err(hub_err)?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let info = repo.info().map_err(hub_err)?;
    if info.siblings.is_empty() {
        return Err(Error::NotFound {
            kind: "model files",
            name: format!("{model_id}@{revision}"),
        });
    }

    let mut snapshot = None;
    for sibling in &info.siblings {
        let local = repo.get(&sibling.rfilename).map_err(hub_err)?;
        if snapshot.is_none() {
            snapshot = snapshot_root(&local, &sibling.rfilename);
        }
    }

    let snapshot = snapshot.ok_or_else(|| Error::NotFound {
        kind: "model snapshot",
        name: model_id.to_string(),
    })?;
    info!(
        model = model_id,
        revision,
        files = info.siblings.len(),
        path = %snapshot.display(),
        "model downloaded"
    );
    Ok(snapshot)
}

/// Strip the repository-relative `rfilename` from a downloaded file path.
fn snapshot_root(local: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    local.ancestors().nth(depth).map(Path::to_path_buf)
}
