use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use lumen_core::asset::RepresentationKind;

/// Disk-backed representation cache keyed by blake3 content hash.
pub struct RepresentationCache {
    cache_dir: PathBuf,
}

impl RepresentationCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("create cache dir: {}", cache_dir.display()))?;
        Ok(Self { cache_dir })
    }

    /// Where the representation of this content hash is stored.
    pub fn path(&self, content_hash: &str, kind: RepresentationKind) -> PathBuf {
        // First 2 chars as subdirectory to avoid too many files in one dir
        let subdir = &content_hash[..2.min(content_hash.len())];
        let suffix = match kind {
            RepresentationKind::Preview => "preview",
            RepresentationKind::Thumbnail => "thumb",
        };
        self.cache_dir
            .join(subdir)
            .join(format!("{content_hash}-{suffix}.jpg"))
    }

    pub fn contains(&self, content_hash: &str, kind: RepresentationKind) -> bool {
        self.path(content_hash, kind).exists()
    }

    pub fn store(
        &self,
        content_hash: &str,
        kind: RepresentationKind,
        data: &[u8],
    ) -> Result<PathBuf> {
        let path = self.path(content_hash, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)
            .with_context(|| format!("write representation: {}", path.display()))?;
        debug!(?path, ?kind, "cached representation");
        Ok(path)
    }

    pub fn load(&self, content_hash: &str, kind: RepresentationKind) -> Option<Vec<u8>> {
        fs::read(self.path(content_hash, kind)).ok()
    }

    /// Delete a cached representation. Returns whether a file was removed.
    pub fn remove(&self, content_hash: &str, kind: RepresentationKind) -> Result<bool> {
        let path = self.path(content_hash, kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(?path, "evicted representation");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// blake3 hash of a file's contents, read in 64 KiB chunks.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open: {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREVIEW: RepresentationKind = RepresentationKind::Preview;
    const THUMB: RepresentationKind = RepresentationKind::Thumbnail;

    #[test]
    fn store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepresentationCache::new(dir.path().join("cache")).unwrap();

        let hash = "abcdef1234567890";
        assert!(!cache.contains(hash, PREVIEW));

        let path = cache.store(hash, PREVIEW, b"fake jpeg data").unwrap();
        assert!(path.exists());
        assert!(cache.contains(hash, PREVIEW));
        assert!(!cache.contains(hash, THUMB));
        assert_eq!(cache.load(hash, PREVIEW).unwrap(), b"fake jpeg data");
    }

    #[test]
    fn kinds_are_bucketed_by_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepresentationCache::new(dir.path().to_path_buf()).unwrap();

        let preview = cache.path("ff1234", PREVIEW);
        let thumb = cache.path("ff1234", THUMB);
        assert!(preview.to_string_lossy().contains("/ff/"));
        assert!(preview.to_string_lossy().ends_with("ff1234-preview.jpg"));
        assert!(thumb.to_string_lossy().ends_with("ff1234-thumb.jpg"));
    }

    #[test]
    fn remove_reports_whether_anything_was_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepresentationCache::new(dir.path().to_path_buf()).unwrap();

        cache.store("aa11", THUMB, b"x").unwrap();
        assert!(cache.remove("aa11", THUMB).unwrap());
        assert!(!cache.remove("aa11", THUMB).unwrap());
        assert!(cache.load("aa11", THUMB).is_none());
    }

    #[test]
    fn identical_content_hashes_identically() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, vec![7u8; 200_000]).unwrap();
        fs::write(&b, vec![7u8; 200_000]).unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        fs::write(&b, b"different").unwrap();
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}
