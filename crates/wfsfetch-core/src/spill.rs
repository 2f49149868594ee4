//! On-disk spill cache for a fetch session.
//!
//! Each spill writes the pending batch to `cache_<n>.parquet` inside a
//! temporary directory owned by the cache. A file is written under a
//! `.partial` name and renamed once the Parquet footer is on disk, so only
//! complete files are ever recorded. Dropping the cache removes the directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow_array::RecordBatch;
use datafusion::parquet::arrow::ArrowWriter;
use log::debug;
use tempfile::TempDir;

use crate::error::{Result, SpillError};

/// A complete spill file recorded by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillFile {
    pub path: PathBuf,
    pub rows: usize,
}

/// Session-scoped set of spill files.
#[derive(Debug)]
pub struct SpillCache {
    dir: TempDir,
    files: Vec<SpillFile>,
}

impl SpillCache {
    /// Create the session spill directory under `parent`, or the system
    /// temporary directory when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`SpillError::CreateDir`] if the directory cannot be created.
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("wfsfetch-");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|source| SpillError::CreateDir {
            path: parent.map_or_else(std::env::temp_dir, Path::to_path_buf),
            source,
        })?;

        debug!("Spill directory: {}", dir.path().display());
        Ok(Self {
            dir,
            files: Vec::new(),
        })
    }

    /// Write `batch` as the next spill file and record it.
    ///
    /// # Errors
    ///
    /// Returns [`SpillError::Write`] if the file cannot be written or renamed;
    /// nothing is recorded in that case.
    pub fn spill(&mut self, batch: &RecordBatch) -> Result<&SpillFile> {
        let index = self.files.len();
        let path = self.dir.path().join(format!("cache_{index}.parquet"));
        let partial = self.dir.path().join(format!("cache_{index}.parquet.partial"));

        write_parquet(&partial, batch).map_err(|source| SpillError::Write {
            path: partial.clone(),
            source,
        })?;
        std::fs::rename(&partial, &path).map_err(|err| SpillError::Write {
            path: path.clone(),
            source: Box::new(err),
        })?;

        debug!("Spilled {} row(s) to {}", batch.num_rows(), path.display());
        self.files.push(SpillFile {
            path,
            rows: batch.num_rows(),
        });
        Ok(&self.files[index])
    }

    /// Recorded spill files, in spill order.
    #[must_use]
    pub fn files(&self) -> &[SpillFile] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Total rows across all recorded files.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.files.iter().map(|f| f.rows).sum()
    }
}

fn write_parquet(
    path: &Path,
    batch: &RecordBatch,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    fn batch(rows: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("ID", DataType::Int64, true),
            Field::new("NAME", DataType::Utf8, true),
        ]));
        let ids: Int64Array = (0..rows).map(Some).collect();
        let names: StringArray = (0..rows).map(|i| Some(format!("n{i}"))).collect();
        RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(names)]).unwrap()
    }

    #[test]
    fn spill_files_are_sequential() {
        let parent = tempfile::tempdir().unwrap();
        let mut cache = SpillCache::create(Some(parent.path())).unwrap();
        assert!(cache.is_empty());

        let first = cache.spill(&batch(3)).unwrap().clone();
        let second = cache.spill(&batch(2)).unwrap().clone();

        assert_eq!(first.path.file_name().unwrap(), "cache_0.parquet");
        assert_eq!(second.path.file_name().unwrap(), "cache_1.parquet");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.rows(), 5);
        assert!(first.path.exists());
        assert!(cache.dir().starts_with(parent.path()));

        let leftovers = std::fs::read_dir(cache.dir())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn directory_is_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let dir = {
            let mut cache = SpillCache::create(Some(parent.path())).unwrap();
            cache.spill(&batch(1)).unwrap();
            cache.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn missing_parent_is_a_spill_error() {
        let parent = tempfile::tempdir().unwrap();
        let missing = parent.path().join("does-not-exist");

        let err = SpillCache::create(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("spill directory"));
    }
}
