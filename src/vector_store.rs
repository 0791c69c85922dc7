use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::{Error, Result},
    extract::Document,
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const DOCUMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("documents");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// File name of the store inside an index directory.
pub const STORE_FILE: &str = "index.redb";

/// Header size: 4 bytes embedding dimension.
const HEADER_SIZE: usize = 4;

/// Keys of the `settings` table.
pub mod keys {
    pub const DIMENSION: &str = "dimension";
    pub const COUNT: &str = "count";
    pub const EMBEDDING_BACKEND: &str = "embedding_backend";
    pub const EMBEDDING_MODEL: &str = "embedding_model";
}

/// Exact L2 vector index persisted in a single redb file.
///
/// Entries are keyed by insertion position. Binary format per vector:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 values, native byte order
///
/// Documents are stored as JSON under the same position.
pub struct VectorStore {
    db: Database,
    path: PathBuf,
}

impl VectorStore {
    /// Create an empty store in `dir`, replacing any previous one.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let db = Database::create(&path)?;
        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db, path })
    }

    /// Open an existing store. A missing directory or file is `NotFound`.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::NotFound {
                kind: "index directory",
                name: dir.display().to_string(),
            });
        }
        let path = dir.join(STORE_FILE);
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "index file",
                name: path.display().to_string(),
            });
        }

        let db = Database::open(&path)?;
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append documents and their vectors in a single transaction.
    ///
    /// The first vector ever stored fixes the index dimension; every later
    /// vector must match it. Returns the total number of stored entries.
    pub fn append(
        &self,
        documents: &[Document],
        vectors: &[Vec<f32>],
    ) -> Result<usize> {
        if documents.len() != vectors.len() {
            return Err(Error::Embedding(format!(
                "got {} vectors for {} documents",
                vectors.len(),
                documents.len()
            )));
        }
        if documents.is_empty() {
            return self.len();
        }

        let txn = self.db.begin_write()?;
        let total = {
            let mut settings = txn.open_table(SETTINGS)?;
            let mut vector_table = txn.open_table(VECTORS)?;
            let mut document_table = txn.open_table(DOCUMENTS)?;

            let count: u64 = settings
                .get(keys::COUNT)?
                .and_then(|v| v.value().parse().ok())
                .unwrap_or(0);
            let stored_dim: Option<usize> = settings
                .get(keys::DIMENSION)?
                .and_then(|v| v.value().parse().ok());
            let dimension = stored_dim.unwrap_or(vectors[0].len());
            if dimension == 0 {
                return Err(Error::Embedding(
                    "embedding backend returned an empty vector".to_string(),
                ));
            }

            let mut position = count;
            for (document, vector) in documents.iter().zip(vectors) {
                if vector.len() != dimension {
                    return Err(Error::Embedding(format!(
                        "document {} has dimension {}, index expects {dimension}",
                        document.id,
                        vector.len()
                    )));
                }

                let byte_len = HEADER_SIZE + std::mem::size_of_val(vector.as_slice());
                let mut guard =
                    vector_table.insert_reserve(position, byte_len)?;
                let dest = guard.as_mut();
                dest[0..HEADER_SIZE]
                    .copy_from_slice(&(dimension as u32).to_le_bytes());
                dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(vector));
                drop(guard);

                let encoded = serde_json::to_vec(document)?;
                document_table.insert(position, encoded.as_slice())?;
                position += 1;
            }

            settings.insert(keys::COUNT, position.to_string().as_str())?;
            settings.insert(keys::DIMENSION, dimension.to_string().as_str())?;
            position as usize
        };
        txn.commit()?;
        Ok(total)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self
            .get_setting(keys::COUNT)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn dimension(&self) -> Result<Option<usize>> {
        Ok(self
            .get_setting(keys::DIMENSION)?
            .and_then(|v| v.parse().ok()))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Fetch one stored document by position.
    pub fn document(&self, position: u64) -> Result<Option<Document>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let Some(guard) = table.get(position)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(guard.value())?))
    }

    /// Read every vector and document into memory for searching.
    pub fn load(&self) -> Result<LoadedIndex> {
        let dimension = self.dimension()?.unwrap_or(0);

        let txn = self.db.begin_read()?;
        let vectors = txn.open_table(VECTORS)?;
        let documents = txn.open_table(DOCUMENTS)?;

        let mut data = Vec::new();
        let mut docs = Vec::new();
        for entry in vectors.iter()? {
            let (position, bytes) = entry?;
            let position = position.value();
            let vector = decode_vector(bytes.value(), dimension).ok_or_else(
                || {
                    Error::Embedding(format!(
                        "stored vector {position} is corrupt or has the wrong dimension"
                    ))
                },
            )?;
            let document = documents.get(position)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "stored document",
                    name: position.to_string(),
                }
            })?;
            docs.push(serde_json::from_slice::<Document>(document.value())?);
            data.extend(vector);
        }

        LoadedIndex::new(dimension, data, docs)
    }
}

fn decode_vector(bytes: &[u8], dimension: usize) -> Option<Vec<f32>> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let stored_dim =
        u32::from_le_bytes(bytes[0..HEADER_SIZE].try_into().ok()?) as usize;
    if stored_dim != dimension || bytes.len() != HEADER_SIZE + dimension * 4 {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]))
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// An in-memory, read-only snapshot of a [`VectorStore`].
pub struct LoadedIndex {
    dimension: usize,
    /// `[N, D]` matrix; `None` when the index is empty.
    matrix: Option<Tensor>,
    /// Squared L2 norm of every row of `matrix`.
    norms: Vec<f32>,
    documents: Vec<Document>,
}

impl LoadedIndex {
    pub fn new(
        dimension: usize,
        data: Vec<f32>,
        documents: Vec<Document>,
    ) -> Result<Self> {
        let rows = documents.len();
        if data.len() != rows * dimension {
            return Err(Error::Embedding(format!(
                "expected {} values for {rows} vectors of dimension {dimension}, got {}",
                rows * dimension,
                data.len()
            )));
        }
        let norms: Vec<f32> = data
            .chunks(dimension.max(1))
            .take(rows)
            .map(|row| row.iter().map(|x| x * x).sum())
            .collect();
        let matrix = if rows == 0 {
            None
        } else {
            Some(
                Tensor::from_vec(data, (rows, dimension), &Device::Cpu)
                    .map_err(map_candle_err)?,
            )
        };
        Ok(Self {
            dimension,
            matrix,
            norms,
            documents,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn document(&self, position: usize) -> Option<&Document> {
        self.documents.get(position)
    }

    /// The `k` nearest stored vectors by squared L2 distance.
    ///
    /// Returns `(position, distance)` pairs, closest first. Equal distances
    /// keep insertion order. Distances are `|m|^2 - 2 m.q + |q|^2`, so a
    /// query only allocates one `[N, 1]` product next to the matrix.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        let Some(matrix) = &self.matrix else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }

        let q = Tensor::from_slice(query, (self.dimension, 1), &Device::Cpu)
            .map_err(map_candle_err)?;
        let dots: Vec<f32> = matrix
            .matmul(&q)
            .and_then(|d| d.squeeze(1))
            .and_then(|d| d.to_vec1::<f32>())
            .map_err(map_candle_err)?;
        let query_norm: f32 = query.iter().map(|x| x * x).sum();

        // Rounding can push exact matches slightly below zero.
        let mut ranked: Vec<(usize, f32)> = dots
            .into_iter()
            .zip(&self.norms)
            .map(|(dot, norm)| (norm - 2.0 * dot + query_norm).max(0.0))
            .enumerate()
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        Ok(ranked)
    }
}

impl std::fmt::Debug for LoadedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.documents.len())
            .finish_non_exhaustive()
    }
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Embedding(format!("tensor computation error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RecordMetadata;

    fn doc(id: &str) -> Document {
        Document::new(id, format!("text of {id}"), RecordMetadata::default())
    }

    fn test_store() -> (tempfile::TempDir, VectorStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::create(&tmp.path().join("idx")).unwrap();
        (tmp, store)
    }

    #[test]
    fn append_and_load() {
        let (_tmp, store) = test_store();
        let total = store
            .append(&[doc("a"), doc("b")], &[vec![1.0, 0.0], vec![0.0, 1.0]])
            .unwrap();
        assert_eq!(total, 2);
        let total = store.append(&[doc("c")], &[vec![1.0, 1.0]]).unwrap();
        assert_eq!(total, 3);

        assert_eq!(store.dimension().unwrap(), Some(2));
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.document(2).unwrap().id, "c");
        assert_eq!(store.document(1).unwrap().unwrap().id, "b");
    }

    #[test]
    fn search_orders_by_distance() {
        let (_tmp, store) = test_store();
        store
            .append(
                &[doc("far"), doc("near"), doc("mid")],
                &[vec![10.0, 10.0], vec![1.0, 0.0], vec![3.0, 0.0]],
            )
            .unwrap();
        let loaded = store.load().unwrap();

        let hits = loaded.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<_> = hits
            .iter()
            .map(|(p, _)| loaded.document(*p).unwrap().id.as_str())
            .collect();
        assert_eq!(ids, ["near", "mid", "far"]);
        assert!(hits[0].1.abs() < 1e-6);
        assert!((hits[1].1 - 4.0).abs() < 1e-6);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let (_tmp, store) = test_store();
        store
            .append(&[doc("first"), doc("second")], &[vec![0.0, 1.0], vec![0.0, 1.0]])
            .unwrap();
        let loaded = store.load().unwrap();
        let hits = loaded.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits, vec![(0, 0.0)]);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let (_tmp, store) = test_store();
        store.append(&[doc("a")], &[vec![1.0]]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.search(&[0.0], 10).unwrap().len(), 1);
        assert!(loaded.search(&[0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let (_tmp, store) = test_store();
        store.append(&[doc("a")], &[vec![1.0, 0.0]]).unwrap();
        let err = store.append(&[doc("b")], &[vec![1.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        // The failed batch must not have been committed.
        assert_eq!(store.len().unwrap(), 1);

        let loaded = store.load().unwrap();
        assert!(matches!(
            loaded.search(&[1.0], 1),
            Err(Error::Embedding(_))
        ));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let (_tmp, store) = test_store();
        let err = store.append(&[doc("a"), doc("b")], &[vec![1.0]]).unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[test]
    fn open_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = VectorStore::open(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let err = VectorStore::open(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("idx");
        {
            let store = VectorStore::create(&dir).unwrap();
            store.append(&[doc("a")], &[vec![0.5, 0.5]]).unwrap();
            store.set_setting(keys::EMBEDDING_MODEL, "m").unwrap();
        }
        let store = VectorStore::open(&dir).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(
            store.get_setting(keys::EMBEDDING_MODEL).unwrap().as_deref(),
            Some("m")
        );
        assert_eq!(store.load().unwrap().document(0).unwrap().id, "a");
    }

    #[test]
    fn create_replaces_previous_store() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("idx");
        {
            let store = VectorStore::create(&dir).unwrap();
            store.append(&[doc("old")], &[vec![1.0]]).unwrap();
        }
        let store = VectorStore::create(&dir).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn search_agrees_with_direct_distance() {
        let rows: Vec<Vec<f32>> = (0..7)
            .map(|i| (0..5).map(|j| ((i * 5 + j) as f32 * 0.37).sin()).collect())
            .collect();
        let docs: Vec<_> = (0..7).map(|i| doc(&format!("d{i}"))).collect();
        let loaded = LoadedIndex::new(5, rows.concat(), docs).unwrap();
        let query = [0.1, -0.4, 0.9, 0.0, 0.3];

        let mut expected: Vec<(usize, f32)> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let d = row.iter().zip(&query).map(|(a, b)| (a - b) * (a - b)).sum();
                (i, d)
            })
            .collect();
        expected.sort_by(|a, b| a.1.total_cmp(&b.1));

        let hits = loaded.search(&query, 7).unwrap();
        let order: Vec<_> = hits.iter().map(|h| h.0).collect();
        let expected_order: Vec<_> = expected.iter().map(|e| e.0).collect();
        assert_eq!(order, expected_order);
        for ((_, got), (_, want)) in hits.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4, "{got} != {want}");
            assert!(*got >= 0.0);
        }
    }

    #[test]
    fn decode_accepts_unaligned_bytes() {
        let values = [1.5f32, -2.25, 3.0];
        let mut buf = vec![0u8];
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(bytemuck::cast_slice(&values));

        assert_eq!(decode_vector(&buf[1..], 3), Some(values.to_vec()));
        assert_eq!(decode_vector(&buf[1..], 2), None);
        assert_eq!(decode_vector(&buf[1..4], 3), None);
    }

    #[test]
    fn empty_store_loads_and_searches() {
        let (_tmp, store) = test_store();
        let loaded = store.load().unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.search(&[1.0, 2.0], 5).unwrap().is_empty());
    }
}
