// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Filesystem store for output metadata records
//!
//! One text file per output under `<workdir>/.seqflow/outputs/`. Saves are
//! atomic (temp file + rename). While an output file exists on disk its
//! mtime is authoritative over the recorded timestamp.

use std::path::{Path, PathBuf};

use crate::errors::{SeqflowError, SeqflowResult};
use crate::meta::{mtime_ms, normalize_path, OutputMeta};

/// Store of per-output metadata records
#[derive(Debug, Clone)]
pub struct MetaStore {
    /// Working directory the pipeline runs in
    workdir: PathBuf,
    /// Directory holding the record files
    dir: PathBuf,
}

impl MetaStore {
    /// Create a store rooted at the given working directory.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let dir = workdir.join(".seqflow").join("outputs");
        Self { workdir, dir }
    }

    /// The directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file path for an output path.
    pub fn record_path(&self, output_path: &str) -> PathBuf {
        let name: String = output_path
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.properties", name))
    }

    /// Read every record in the store, sorted ascending by timestamp.
    ///
    /// A malformed record is fatal; the error names the offending file.
    pub fn scan(&self) -> SeqflowResult<Vec<OutputMeta>> {
        let mut metas = Vec::new();

        if !self.dir.exists() {
            return Ok(metas);
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| SeqflowError::FileReadError {
                path: self.dir.clone(),
                error: e.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("properties"))
            .collect();

        // Deterministic input order before the timestamp sort
        paths.sort();

        for path in paths {
            metas.push(self.read(&path)?);
        }

        metas.sort_by_key(|m| m.timestamp);
        Ok(metas)
    }

    /// Parse a single record file.
    ///
    /// If the underlying output file still exists, the record's timestamp is
    /// refreshed from its mtime.
    pub fn read(&self, path: &Path) -> SeqflowResult<OutputMeta> {
        let content = std::fs::read_to_string(path).map_err(|e| SeqflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let mut meta = OutputMeta::parse(&content, path)?;

        if let Some(mtime) = mtime_ms(&self.resolve(&meta.output_file)) {
            meta.timestamp = mtime;
        }

        Ok(meta)
    }

    /// Look up the record for an output path, if one has been saved.
    pub fn record_for(&self, output: &str) -> SeqflowResult<Option<OutputMeta>> {
        let path = self.record_path(&normalize_path(Path::new(output)));
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    /// Atomically write a record.
    pub fn save(&self, meta: &OutputMeta) -> SeqflowResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SeqflowError::FileWriteError {
            path: self.dir.clone(),
            error: e.to_string(),
        })?;

        let path = self.record_path(&meta.output_path);
        let tmp = path.with_extension("properties.tmp");

        std::fs::write(&tmp, meta.to_record()).map_err(|e| SeqflowError::FileWriteError {
            path: tmp.clone(),
            error: e.to_string(),
        })?;

        std::fs::rename(&tmp, &path).map_err(|e| SeqflowError::FileWriteError {
            path,
            error: e.to_string(),
        })?;

        Ok(())
    }

    /// Resolve a recorded output path against the working directory.
    pub fn resolve(&self, output_file: &Path) -> PathBuf {
        if output_file.is_absolute() {
            output_file.to_path_buf()
        } else {
            self.workdir.join(output_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta_with(output: &str, inputs: &[&str], timestamp: i64) -> OutputMeta {
        let mut meta = OutputMeta::new(output);
        meta.inputs = inputs.iter().map(|s| s.to_string()).collect();
        meta.command = format!("make {}", output);
        meta.timestamp = timestamp;
        meta
    }

    #[test]
    fn test_save_and_scan_sorted_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path());

        store.save(&meta_with("b.txt", &["a.txt"], 300)).unwrap();
        store.save(&meta_with("a.txt", &[], 100)).unwrap();
        store.save(&meta_with("c.txt", &["b.txt"], 200)).unwrap();

        let metas = store.scan().unwrap();
        let order: Vec<_> = metas.iter().map(|m| m.output_path.as_str()).collect();
        assert_eq!(order, vec!["a.txt", "c.txt", "b.txt"]);
    }

    #[test]
    fn test_scan_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path());
        assert!(store.scan().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_record_names_file() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path());

        let outputs = dir.path().join(".seqflow").join("outputs");
        std::fs::create_dir_all(&outputs).unwrap();
        std::fs::write(outputs.join("broken.properties"), "not a record").unwrap();

        let err = store.scan().unwrap_err();
        assert!(err.to_string().contains("broken.properties"));
    }

    #[test]
    fn test_mtime_refreshes_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path());

        // Output exists on disk: its mtime wins over the recorded value
        std::fs::write(dir.path().join("out.txt"), "data").unwrap();
        store.save(&meta_with("out.txt", &[], 1)).unwrap();

        let meta = store.record_for("out.txt").unwrap().unwrap();
        assert!(meta.timestamp > 1);
    }

    #[test]
    fn test_recorded_timestamp_kept_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::new(dir.path());

        store.save(&meta_with("gone.txt", &[], 42)).unwrap();

        let meta = store.record_for("gone.txt").unwrap().unwrap();
        assert_eq!(meta.timestamp, 42);
    }

    #[test]
    fn test_record_path_flattens_separators() {
        let store = MetaStore::new("/tmp/w");
        let path = store.record_path("work/out.bam");
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("work_out.bam"));
    }
}
