use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PosmapError, Result};

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Key/value object storage for input and output artifacts.
pub trait ObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<()>;
    /// Every key under `prefix`, in no particular order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }
}

/// Lexicographically greatest key under `prefix`, optionally filtered by
/// suffix. Dated names like `positions-2025-01-31.csv` sort correctly.
pub fn latest_by_prefix(
    store: &dyn ObjectStore,
    prefix: &str,
    suffix: Option<&str>,
) -> Result<Option<String>> {
    let mut keys = store.list(prefix)?;
    if let Some(suffix) = suffix {
        keys.retain(|k| k.ends_with(suffix));
    }
    keys.sort();
    Ok(keys.pop())
}

/// Directory-backed store: `<root>/<key>`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(PosmapError::Other(format!("Invalid object key: {key}")));
        }
        Ok(self.root.join(rel))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PosmapError::NoInput(format!(
                "Object not found: {key} (under {})",
                self.root.display()
            )),
            _ => PosmapError::Io(e),
        })
    }

    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, body)?;
        debug!(key, bytes = body.len(), content_type, "object written");
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.walk(&self.root, &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }
}
