//! 管线状态缓存
//!
//! 驱动编译出的管线二进制按 `PipelineKey` 保存，启动时从文件加载，整理设备和退出时写回。
//! 文件格式带版本号，版本不符或者解码失败时丢弃整个缓存。

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::error::Result;

const CACHE_VERSION: u32 = 2;

/// BLAKE3 摘要的前 8 字节，跨进程和平台稳定
fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// 管线描述与根签名的哈希
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineKey {
    pub desc_hash: u64,
    pub root_signature_hash: u64,
}

impl PipelineKey {
    pub fn new(desc: &[u8], root_signature: &[u8]) -> Self {
        Self { desc_hash: hash_bytes(desc), root_signature_hash: hash_bytes(root_signature) }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<PipelineKey, Vec<u8>>,
}

#[derive(Default)]
pub struct PipelineCache {
    entries: Mutex<HashMap<PipelineKey, Vec<u8>>>,
    dirty: AtomicBool,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PipelineKey, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 从文件加载；文件不存在或无法解码时返回空缓存
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No pipeline cache file");
                return Self::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read pipeline cache, discarding");
                return Self::new();
            }
        };

        let file: CacheFile = match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((file, _)) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to decode pipeline cache, discarding");
                return Self::new();
            }
        };

        if file.version != CACHE_VERSION {
            warn!(
                path = %path.display(),
                version = file.version,
                expected = CACHE_VERSION,
                "Pipeline cache version mismatch, discarding"
            );
            return Self::new();
        }

        info!(path = %path.display(), entries = file.entries.len(), "Pipeline cache loaded");
        Self {
            entries: Mutex::new(file.entries.into_iter().collect()),
            dirty: AtomicBool::new(false),
        }
    }

    /// 写入临时文件后改名
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = CacheFile {
            version: CACHE_VERSION,
            entries: self.entries().iter().map(|(k, v)| (*k, v.clone())).collect(),
        };

        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = path.with_extension("tmp");
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, path)?;

        self.dirty.store(false, Ordering::Release);
        info!(path = %path.display(), entries = file.entries.len(), bytes = bytes.len(), "Pipeline cache saved");
        Ok(())
    }

    /// 有未保存的修改
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &PipelineKey) -> Option<Vec<u8>> {
        self.entries().get(key).cloned()
    }

    pub fn insert(&self, key: PipelineKey, blob: Vec<u8>) {
        let previous = self.entries().insert(key, blob.clone());
        if previous.as_ref() != Some(&blob) {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// 用缓存的二进制（如果有）构建管线，保存构建返回的二进制
    pub fn get_or_create<F>(&self, key: PipelineKey, build: F) -> Result<Vec<u8>>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Vec<u8>>,
    {
        let cached = self.get(&key);
        let blob = build(cached.as_deref())?;
        self.insert(key, blob.clone());
        Ok(blob)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
        self.dirty.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_both_parts() {
        let a = PipelineKey::new(b"opaque", b"root");
        assert_eq!(a, PipelineKey::new(b"opaque", b"root"));
        assert_ne!(a, PipelineKey::new(b"opaque", b"root2"));
        assert_ne!(a, PipelineKey::new(b"transparent", b"root"));

        let digest = blake3::hash(b"opaque");
        assert_eq!(a.desc_hash, u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap()));
    }

    #[test]
    fn test_get_or_create_passes_cached_blob() {
        let cache = PipelineCache::new();
        let key = PipelineKey::new(b"desc", b"root");

        let first = cache
            .get_or_create(key, |cached| {
                assert!(cached.is_none());
                Ok(vec![1, 2, 3])
            })
            .unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        assert!(cache.is_dirty());

        let second = cache
            .get_or_create(key, |cached| {
                assert_eq!(cached, Some(&[1u8, 2, 3][..]));
                Ok(cached.unwrap_or_default().to_vec())
            })
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_build_error_not_cached() {
        let cache = PipelineCache::new();
        let key = PipelineKey::new(b"broken", b"root");
        let result = cache.get_or_create(key, |_| {
            Err(crate::core::error::GpuError::call("CreateGraphicsPipelineState", "invalid blob"))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("pipelines.bin");

        let cache = PipelineCache::new();
        cache.insert(PipelineKey::new(b"a", b"r"), vec![7; 32]);
        cache.insert(PipelineKey::new(b"b", b"r"), vec![9; 8]);
        cache.save(&path).unwrap();
        assert!(!cache.is_dirty());
        assert!(!path.with_extension("tmp").exists());

        let loaded = PipelineCache::load(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&PipelineKey::new(b"a", b"r")), Some(vec![7; 32]));
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_corrupt_or_missing_file_discarded() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineCache::load(dir.path().join("missing.bin")).is_empty());

        let path = dir.path().join("corrupt.bin");
        fs::write(&path, [0xff; 5]).unwrap();
        assert!(PipelineCache::load(&path).is_empty());
    }

    #[test]
    fn test_version_mismatch_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.bin");

        let mut entries = BTreeMap::new();
        entries.insert(PipelineKey::new(b"a", b"r"), vec![1]);
        let file = CacheFile { version: CACHE_VERSION + 1, entries };
        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard()).unwrap();
        fs::write(&path, bytes).unwrap();

        assert!(PipelineCache::load(&path).is_empty());
    }
}
