//! Batched index construction.
//!
//! Documents are embedded and appended one batch at a time, so neither the
//! embedding backend nor memory ever holds the whole corpus. The index is
//! built in a hidden staging directory next to its final location and only
//! moved into place once the last batch has committed; a reader never sees
//! a half-built index.

use std::path::{Path, PathBuf};

use kdam::BarExt;
use tracing::{debug, info, warn};

use crate::{
    config::INDEX_NAME,
    embedding::Embedder,
    error::{Error, Result},
    extract::Document,
    vector_store::{VectorStore, keys},
};

pub const DEFAULT_BATCH_SIZE: usize = 128;

pub struct VectorIndexer<'a> {
    embedder: &'a dyn Embedder,
    index_root: PathBuf,
}

impl<'a> VectorIndexer<'a> {
    pub fn new(embedder: &'a dyn Embedder, index_root: impl Into<PathBuf>) -> Self {
        Self {
            embedder,
            index_root: index_root.into(),
        }
    }

    /// Where [`build`](Self::build) puts the finished index.
    pub fn index_path(&self) -> PathBuf {
        self.index_root.join(INDEX_NAME)
    }

    fn staging_path(&self) -> PathBuf {
        self.index_root.join(format!(".{INDEX_NAME}.partial"))
    }

    /// Embed `documents` in batches of `batch_size` and persist the index.
    ///
    /// A batch size of 0 is treated as 1. An empty document set is
    /// `Error::Input`. Returns the index directory.
    pub fn build(
        &self,
        documents: &[Document],
        batch_size: usize,
        show_progress: bool,
    ) -> Result<PathBuf> {
        if documents.is_empty() {
            return Err(Error::Input("no documents to index".to_string()));
        }
        let batch_size = batch_size.max(1);

        std::fs::create_dir_all(&self.index_root)?;
        let staging = self.staging_path();
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }

        if let Err(e) = self.build_into(&staging, documents, batch_size, show_progress) {
            // Leave nothing half-written behind.
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let final_path = self.index_path();
        if let Err(e) = replace_dir(&staging, &final_path) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        info!(
            path = %final_path.display(),
            documents = documents.len(),
            "index built"
        );
        Ok(final_path)
    }

    fn build_into(
        &self,
        staging: &Path,
        documents: &[Document],
        batch_size: usize,
        show_progress: bool,
    ) -> Result<()> {
        let store = VectorStore::create(staging)?;

        let mut progress = show_progress.then(|| {
            kdam::tqdm!(
                total = documents.len(),
                desc = "Embedding",
                unit = " docs"
            )
        });

        for (n, batch) in documents.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let vectors = self.embedder.embed_documents(&texts)?;
            let total = store.append(batch, &vectors)?;

            if n == 0 {
                debug!(
                    dimension = store.dimension()?.unwrap_or(0),
                    "initialized index from first batch"
                );
            } else {
                debug!(batch = n, total, "appended batch");
            }

            if let Some(bar) = progress.as_mut() {
                bar.update(batch.len())?;
            }
        }

        if let Some(bar) = progress.as_mut() {
            bar.refresh()?;
        }

        store.set_setting(keys::EMBEDDING_BACKEND, self.embedder.backend().as_str())?;
        store.set_setting(keys::EMBEDDING_MODEL, self.embedder.model_id())?;
        Ok(())
    }
}

/// Move `from` onto `to`, replacing any previous directory at `to`.
///
/// Two renames: the old directory steps aside to `<to>.old`, then `from`
/// takes its place. Between them `to` is briefly absent. If the second
/// rename fails the old directory is moved back.
fn replace_dir(from: &Path, to: &Path) -> Result<()> {
    if !to.exists() {
        std::fs::rename(from, to)?;
        return Ok(());
    }

    let mut retired = to.as_os_str().to_owned();
    retired.push(".old");
    let retired = PathBuf::from(retired);
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }

    std::fs::rename(to, &retired)?;
    if let Err(e) = std::fs::rename(from, to) {
        std::fs::rename(&retired, to)?;
        return Err(e.into());
    }
    if let Err(e) = std::fs::remove_dir_all(&retired) {
        warn!(path = %retired.display(), error = %e, "could not remove retired index");
    }
    Ok(())
}
