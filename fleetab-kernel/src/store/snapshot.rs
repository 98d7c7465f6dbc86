use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

use super::StoreError;

/// Fichier JSON écrit de manière atomique (fichier temporaire + rename)
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// None si le fichier n'existe pas encore
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn save_then_load_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("nested").join("state.json"));

        let missing: Option<BTreeMap<String, u32>> = file.load().await.unwrap();
        assert!(missing.is_none());

        let mut value = BTreeMap::new();
        value.insert("tasks".to_string(), 3u32);
        file.save(&value).await.unwrap();

        let loaded: BTreeMap<String, u32> = file.load().await.unwrap().unwrap();
        assert_eq!(loaded.get("tasks"), Some(&3));
        assert!(!file.path().with_extension("json.tmp").exists());
    }
}
