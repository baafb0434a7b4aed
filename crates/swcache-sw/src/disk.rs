//! File-backed cache store.
//!
//! Layout: `<root>/<generation>/<entry>.json`, names percent-encoded. Writes
//! go to a uniquely named `.tmp` sibling first and are renamed into place, so a
//! reader never sees a torn entry and concurrent writers of one key never share
//! a staging file.

use std::io::Write;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::{dedup_by_key, CacheEntry, CacheKey, CacheStore};
use crate::error::StoreError;

const ENTRY_EXT: &str = "json";
const STAGING_EXT: &str = "tmp";
/// Longer encoded keys are truncated and suffixed with a hash.
const MAX_FILE_STEM: usize = 180;
/// Digest bytes kept in a truncated stem.
const HASH_BYTES: usize = 8;

/// [`CacheStore`] persisting each generation as a directory of JSON files.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
        }
    }

    /// Refuse writes that grow the store past `quota_bytes`.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &str) -> PathBuf {
        self.root.join(urlencoding::encode(generation).as_ref())
    }

    fn entry_path(&self, generation: &str, key: &CacheKey) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{}.{ENTRY_EXT}", file_stem(key)))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>, StoreError> {
        let contents = match fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Bytes on disk under the root, with `replacing` files excluded.
    async fn used_bytes(&self, replacing: &[PathBuf]) -> Result<u64, StoreError> {
        let mut total = 0;
        let mut generations = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(generation) = generations.next_entry().await? {
            if !generation.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(generation.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if replacing.contains(&entry.path()) {
                    continue;
                }
                total += entry.metadata().await?.len();
            }
        }
        Ok(total)
    }

    /// Serialize a batch, check the quota, then stage and commit it.
    async fn write_batch(
        &self,
        generation: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), StoreError> {
        let entries = dedup_by_key(entries);
        let dir = self.generation_dir(generation);
        fs::create_dir_all(&dir).await?;

        let mut staged = Vec::with_capacity(entries.len());
        for entry in &entries {
            let path = self.entry_path(generation, &entry.key);
            staged.push((path, serde_json::to_vec(entry)?));
        }

        if let Some(quota) = self.quota_bytes {
            let targets: Vec<PathBuf> = staged.iter().map(|(path, _)| path.clone()).collect();
            let added: u64 = staged.iter().map(|(_, bytes)| bytes.len() as u64).sum();
            let needed = self.used_bytes(&targets).await? + added;
            if needed > quota {
                return Err(StoreError::QuotaExceeded { needed, quota });
            }
        }

        let count = staged.len();
        tokio::task::spawn_blocking(move || commit_batch(&dir, staged))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        debug!(generation, count, "Committed entries");
        Ok(())
    }
}

/// Stage every file under a unique temporary name, then rename each into place.
///
/// Staged files are removed on drop if anything fails before the renames; a
/// failed rename removes the files already committed by this batch.
fn commit_batch(dir: &Path, staged: Vec<(PathBuf, Vec<u8>)>) -> Result<(), StoreError> {
    let mut temps = Vec::with_capacity(staged.len());
    for (path, bytes) in staged {
        let mut tmp = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(&format!(".{STAGING_EXT}"))
            .tempfile_in(dir)?;
        tmp.write_all(&bytes)?;
        temps.push((tmp, path));
    }

    let mut committed: Vec<PathBuf> = Vec::with_capacity(temps.len());
    for (tmp, path) in temps {
        if let Err(e) = tmp.persist(&path) {
            warn!(path = %path.display(), error = %e.error, "Commit failed, rolling back batch");
            for done in &committed {
                let _ = std::fs::remove_file(done);
            }
            return Err(e.error.into());
        }
        committed.push(path);
    }
    Ok(())
}

impl CacheStore for FileCacheStore {
    fn open<'a>(&'a self, generation: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            fs::create_dir_all(self.generation_dir(generation)).await?;
            Ok(())
        }
        .boxed()
    }

    fn get<'a>(
        &'a self,
        generation: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, StoreError>> {
        async move {
            let entry = Self::read_entry(&self.entry_path(generation, key)).await?;
            // A truncated stem can collide; the stored key settles it.
            Ok(entry.filter(|e| &e.key == key))
        }
        .boxed()
    }

    fn put<'a>(
        &'a self,
        generation: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.write_batch(generation, vec![entry]).boxed()
    }

    fn put_all<'a>(
        &'a self,
        generation: &'a str,
        entries: Vec<CacheEntry>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.write_batch(generation, entries).boxed()
    }

    fn delete<'a>(
        &'a self,
        generation: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            let path = self.entry_path(generation, key);
            // Never remove a different key sharing a truncated stem.
            match Self::read_entry(&path).await {
                Ok(Some(entry)) if &entry.key == key => {}
                Ok(_) => return Ok(false),
                // Unreadable entries are removed so they stop failing lookups.
                Err(StoreError::Corrupt { .. }) => {}
                Err(e) => return Err(e),
            }
            match fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    fn keys<'a>(&'a self, generation: &'a str) -> BoxFuture<'a, Result<Vec<CacheKey>, StoreError>> {
        async move {
            let mut dir = match fs::read_dir(self.generation_dir(generation)).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut keys = Vec::new();
            while let Some(file) = dir.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                    continue;
                }
                if let Some(entry) = Self::read_entry(&path).await? {
                    keys.push(entry.key);
                }
            }
            keys.sort();
            Ok(keys)
        }
        .boxed()
    }

    fn generations(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        async move {
            let mut dir = match fs::read_dir(&self.root).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let raw = entry.file_name().to_string_lossy().into_owned();
                match urlencoding::decode(&raw) {
                    Ok(name) => names.push(name.into_owned()),
                    Err(e) => warn!(dir = %raw, error = %e, "Skipping undecodable generation"),
                }
            }
            names.sort();
            Ok(names)
        }
        .boxed()
    }

    fn delete_generation<'a>(
        &'a self,
        generation: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            match fs::remove_dir_all(self.generation_dir(generation)).await {
                Ok(()) => {
                    debug!(generation, "Deleted cache generation");
                    Ok(true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }
}

/// Deterministic file stem for a key.
fn file_stem(key: &CacheKey) -> String {
    let encoded = urlencoding::encode(&key.to_string()).into_owned();
    if encoded.len() <= MAX_FILE_STEM {
        return encoded;
    }
    let digest = Sha256::digest(encoded.as_bytes());
    let suffix: String = digest[..HASH_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    // Percent-encoded text is ASCII, so any byte index is a char boundary.
    let keep = MAX_FILE_STEM - suffix.len() - 1;
    format!("{}~{suffix}", &encoded[..keep])
}
