use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "VULNRAG_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The VULNRAG_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/vulnrag/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("vulnrag")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base directory holding named vector indexes.
    pub fn index_root(&self) -> PathBuf {
        self.root.join("index")
    }

    /// Directory scanned for per-year processed dataset shards.
    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join("processed").join("cve_cwe_by_year")
    }

    pub fn reports_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("reports");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.index_root(), tmp.path().join("index"));
        assert_eq!(
            dir.dataset_dir(),
            tmp.path().join("processed").join("cve_cwe_by_year")
        );
    }

    #[test]
    fn reports_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let reports = dir.reports_dir().unwrap();

        assert!(reports.exists());
        assert_eq!(reports, tmp.path().join("reports"));
    }

    #[test]
    fn resolve_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());
    }
}
