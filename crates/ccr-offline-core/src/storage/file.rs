use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::KeyValueStore;

/// Extension for stored values
const VALUE_EXT: &str = "dat";

/// Extension for in-flight writes. Files with this extension are never read.
const TEMP_EXT: &str = "tmp";

/// Directory-backed store: one file per key.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so concurrent writers of the same key resolve to last-write-wins and a
/// reader never sees a torn value.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), VALUE_EXT))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let nonce: u32 = rand::random();
        self.dir
            .join(format!("{}.{:08x}.{}", encode_key(key), nonce, TEMP_EXT))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.value_path(key);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read stored value: {}", key)),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let temp = self.temp_path(key);
        fs::write(&temp, value)
            .await
            .with_context(|| format!("Failed to write stored value: {}", key))?;
        if let Err(e) = fs::rename(&temp, self.value_path(key)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("Failed to replace stored value: {}", key));
        }
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.value_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove stored value: {}", key)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list storage directory: {}", self.dir.display()))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{}", VALUE_EXT)) else {
                continue;
            };
            match decode_key(stem) {
                Some(key) => keys.push(key),
                None => debug!(file = name, "Skipping file with undecodable key"),
            }
        }
        Ok(keys)
    }
}

/// Percent-encode the key so values such as `ccr_cache_cache:donationTypes`
/// map to portable file names.
fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

/// `None` for names that do not decode to UTF-8.
fn decode_key(name: &str) -> Option<String> {
    urlencoding::decode(name).ok().map(|key| key.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_roundtrip() {
        let key = "ccr_cache_cache:donationTypes/2024";
        let encoded = encode_key(key);
        assert!(!encoded.contains(':'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[test]
    fn test_key_encoding_escapes_percent_and_spaces() {
        let key = "ccr_cache_50% off/prayer list";
        let encoded = encode_key(key);
        assert!(!encoded.contains(' '));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert_eq!(decode_key("abc%FF"), None);
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        store.set_item("ccr_offline_queue", "[]").await.unwrap();
        store.set_item("ccr_cache_a:b", "{}").await.unwrap();
        drop(store);

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get_item("ccr_offline_queue").await.unwrap().as_deref(),
            Some("[]")
        );
        let mut keys = reopened.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ccr_cache_a:b", "ccr_offline_queue"]);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.remove_item("never-written").await.unwrap();
        assert_eq!(store.get_item("never-written").await.unwrap(), None);
    }
}
