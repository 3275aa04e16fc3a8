/// JSON document storage on the local filesystem.
///
/// Documents are read whole and rewritten whole. A write lands in a temporary sibling
/// file first and is then renamed over the target, so a reader never sees a torn document.
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::CommonError;

#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and decode the document. Returns `Ok(None)` if the file does not exist.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, CommonError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CommonError::io(&self.path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CommonError::json(&self.path, e))
    }

    /// Encode `value` as pretty JSON and replace the file with it.
    pub async fn save<T: Serialize>(&self, value: &T) -> Result<(), CommonError> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| CommonError::json(&self.path, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CommonError::io(parent, e))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| CommonError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CommonError::io(&self.path, e))?;

        debug!(path = %self.path.display(), bytes = body.len(), "json document written");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
