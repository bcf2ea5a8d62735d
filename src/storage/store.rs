//! Durable artifact store
//!
//! Every write goes to a temporary sibling, is fsynced, and is atomically
//! renamed over the target. Readers observe either the previous complete
//! version or the new complete version, never a partial file.

use crate::{GtmError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Filesystem-backed store rooted at a single directory
///
/// All paths passed to the store are relative to its root.
#[derive(Debug, Clone)]
pub struct DurableStore {
    root: PathBuf,
}

impl DurableStore {
    /// Open a store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Opened durable store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store-relative path, rejecting anything that escapes the root
    pub fn resolve(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        if rel.as_os_str().is_empty() {
            return Err(GtmError::InvalidPath("empty path".to_string()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(GtmError::InvalidPath(format!(
                        "{} must be relative to the store root",
                        rel.display()
                    )))
                }
            }
        }
        Ok(self.root.join(rel))
    }

    /// Atomically replace the file at `rel` with `content`
    pub fn write(&self, rel: impl AsRef<Path>, content: &str) -> Result<()> {
        self.write_bytes(rel, content.as_bytes())
    }

    pub fn write_bytes(&self, rel: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        let parent = path
            .parent()
            .ok_or_else(|| GtmError::InvalidPath(path.display().to_string()))?;

        let failed = |reason: std::io::Error| GtmError::WriteFailed {
            path: path.clone(),
            reason: reason.to_string(),
        };

        fs::create_dir_all(parent).map_err(failed)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(failed)?;
        tmp.write_all(bytes).map_err(failed)?;
        tmp.as_file().sync_all().map_err(failed)?;
        tmp.persist(&path).map_err(|e| failed(e.error))?;

        trace!(path = %path.display(), bytes = bytes.len(), "Wrote artifact");
        Ok(())
    }

    /// Read a UTF-8 artifact; a missing file is [`GtmError::NotFound`]
    pub fn read(&self, rel: impl AsRef<Path>) -> Result<String> {
        let path = self.resolve(rel)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GtmError::NotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an artifact, folding absence into `None`
    pub fn read_optional(&self, rel: impl AsRef<Path>) -> Result<Option<String>> {
        match self.read(rel) {
            Ok(content) => Ok(Some(content)),
            Err(GtmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn write_json<T: Serialize>(&self, rel: impl AsRef<Path>, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.write(rel, &json)
    }

    /// Read and deserialize a JSON artifact
    ///
    /// A file that exists but does not parse is reported as [`GtmError::Corrupt`].
    pub fn read_json<T: DeserializeOwned>(&self, rel: impl AsRef<Path>) -> Result<T> {
        let rel = rel.as_ref();
        let content = self.read(rel)?;
        serde_json::from_str(&content).map_err(|e| GtmError::Corrupt {
            path: self.root.join(rel),
            reason: e.to_string(),
        })
    }

    pub fn read_json_optional<T: DeserializeOwned>(
        &self,
        rel: impl AsRef<Path>,
    ) -> Result<Option<T>> {
        match self.read_json(rel) {
            Ok(value) => Ok(Some(value)),
            Err(GtmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Size of an artifact in bytes, without reading it
    pub fn file_len(&self, rel: impl AsRef<Path>) -> Result<u64> {
        let path = self.resolve(rel)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GtmError::NotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn modified(&self, rel: impl AsRef<Path>) -> Result<DateTime<Utc>> {
        let path = self.resolve(rel)?;
        match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(time) => Ok(DateTime::<Utc>::from(time)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GtmError::NotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the subdirectories of `rel`, sorted; empty when `rel` is absent
    pub fn list_dirs(&self, rel: impl AsRef<Path>) -> Result<Vec<String>> {
        self.list_entries(rel, |ft| ft.is_dir())
    }

    /// Names of files in `rel` matching a glob pattern such as `researcher-*-output.md`
    pub fn glob(&self, rel: impl AsRef<Path>, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| GtmError::InvalidPath(format!("bad pattern {}: {}", pattern, e)))?;
        let mut names = self.list_entries(rel, |ft| ft.is_file())?;
        names.retain(|name| pattern.matches(name));
        Ok(names)
    }

    fn list_entries(
        &self,
        rel: impl AsRef<Path>,
        keep: impl Fn(&fs::FileType) -> bool,
    ) -> Result<Vec<String>> {
        let dir = self.resolve(rel)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !keep(&entry.file_type()?) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, DurableStore) {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path().join("root")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        store.write("a/b/c.md", "hello").unwrap();
        assert_eq!(store.read("a/b/c.md").unwrap(), "hello");
        assert!(store.exists("a/b/c.md"));
    }

    #[test]
    fn test_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.read("nope.md"), Err(GtmError::NotFound(_))));
        assert_eq!(store.read_optional("nope.md").unwrap(), None);
        assert!(matches!(store.file_len("nope.md"), Err(GtmError::NotFound(_))));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (_dir, store) = store();
        assert!(matches!(
            store.write("../evil.md", "x"),
            Err(GtmError::InvalidPath(_))
        ));
        assert!(matches!(
            store.read("/etc/passwd"),
            Err(GtmError::InvalidPath(_))
        ));
        assert!(matches!(store.read(""), Err(GtmError::InvalidPath(_))));
    }

    #[test]
    fn test_overwrite_is_whole() {
        let (_dir, store) = store();
        store.write("doc.md", "a much longer first version").unwrap();
        store.write("doc.md", "short").unwrap();
        assert_eq!(store.read("doc.md").unwrap(), "short");
    }

    #[test]
    fn test_failed_write_leaves_previous_version() {
        let (_dir, store) = store();
        store.write("drop/latest.md", "v1").unwrap();
        // A regular file where a directory is needed makes the write fail
        store.write("blocker", "file").unwrap();

        let err = store.write("blocker/latest.md", "v2").unwrap_err();
        assert!(matches!(err, GtmError::WriteFailed { .. }));
        assert_eq!(store.read("drop/latest.md").unwrap(), "v1");
    }

    #[test]
    fn test_abandoned_temp_file_is_invisible() {
        let (_dir, store) = store();
        store.write("s/latest.md", "complete v1").unwrap();

        // Simulate a crash after the temp file was written but before rename
        let dir = store.resolve("s").unwrap();
        let mut tmp = NamedTempFile::new_in(&dir).unwrap();
        tmp.write_all(b"partial v2").unwrap();
        let (_file, _path) = tmp.keep().unwrap();

        assert_eq!(store.read("s/latest.md").unwrap(), "complete v1");
        assert!(store.glob("s", "*.md").unwrap() == vec!["latest.md".to_string()]);
    }

    #[test]
    fn test_json_helpers() {
        let (_dir, store) = store();
        store
            .write_json("x/state.json", &serde_json::json!({"state": "proposed"}))
            .unwrap();
        let value: serde_json::Value = store.read_json("x/state.json").unwrap();
        assert_eq!(value["state"], "proposed");

        store.write("x/bad.json", "{not json").unwrap();
        let err = store.read_json::<serde_json::Value>("x/bad.json").unwrap_err();
        assert!(matches!(err, GtmError::Corrupt { .. }));

        let missing: Option<serde_json::Value> = store.read_json_optional("x/none.json").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_listing() {
        let (_dir, store) = store();
        store.write("d/drop-2/x.md", "x").unwrap();
        store.write("d/drop-1/x.md", "x").unwrap();
        store.write("d/notes.md", "x").unwrap();
        assert_eq!(store.list_dirs("d").unwrap(), vec!["drop-1", "drop-2"]);
        assert!(store.list_dirs("missing").unwrap().is_empty());

        store.write("d/researcher-1-output.md", "x").unwrap();
        store.write("d/researcher-1-meta.json", "{}").unwrap();
        assert_eq!(
            store.glob("d", "researcher-*-output.md").unwrap(),
            vec!["researcher-1-output.md"]
        );
        assert_eq!(store.file_len("d/notes.md").unwrap(), 1);
    }
}
