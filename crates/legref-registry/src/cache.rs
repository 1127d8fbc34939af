use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// On-disk cache keyed by a deterministic hash of request parameters.
/// Writers acquire a file lock per key; readers do not lock and may
/// observe a stale-but-immutable payload, which is acceptable because
/// cached payloads never change once written. Partial/failed responses
/// are never cached — callers only call `put` on a confirmed success.
pub struct DiskCache {
    root: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct Ttl(pub Duration);

impl Ttl {
    pub const NO_EXPIRY: Ttl = Ttl(Duration::from_secs(u64::MAX / 2));
    pub fn days(n: u64) -> Ttl {
        Ttl(Duration::from_secs(n * 86_400))
    }
    pub fn hours(n: u64) -> Ttl {
        Ttl(Duration::from_secs(n * 3_600))
    }
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let _ = fs::create_dir_all(&root);
        Self { root }
    }

    fn key_hash(namespace: &str, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::key_hash(namespace, key)))
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str, ttl: Ttl) -> Option<T> {
        let path = self.path_for(namespace, key);
        let meta = fs::metadata(&path).ok()?;
        let modified = meta.modified().ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age > ttl.0 {
            debug!(namespace, key, "cache entry expired");
            return None;
        }
        let contents = fs::read_to_string(&path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T) {
        let path = self.path_for(namespace, key);
        let Ok(contents) = serde_json::to_string(value) else {
            return;
        };
        let lock_path = lock_path_for(&path);
        if acquire_lock(&lock_path).is_err() {
            return;
        }
        let _ = fs::write(&path, contents);
        let _ = fs::remove_file(&lock_path);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    p.set_extension("json.lock");
    p
}

/// Best-effort exclusive file lock for a single cache key: create the
/// lock file with `create_new`, so a concurrent writer for the same key
/// backs off rather than corrupting the payload. Not held across process
/// restarts; a stale lock file from a crashed writer is cleaned up after
/// a short grace period.
fn acquire_lock(lock_path: &Path) -> std::io::Result<()> {
    match fs::OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if let Ok(meta) = fs::metadata(lock_path) {
                if let Ok(age) = meta.modified().and_then(|m| SystemTime::now().duration_since(m).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::Other, "clock skew")
                })) {
                    if age > Duration::from_secs(30) {
                        let _ = fs::remove_file(lock_path);
                        return fs::OpenOptions::new().write(true).create_new(true).open(lock_path).map(|_| ());
                    }
                }
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        title: String,
    }

    #[test]
    fn round_trips_a_value() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let cache = DiskCache::new(dir.path());
        let value = Payload { title: "Ley 39/2015".into() };
        cache.put("titles", "BOE-A-2015-10565", &value);
        let got: Option<Payload> = cache.get("titles", "BOE-A-2015-10565", Ttl::days(30));
        assert_eq!(got, Some(value));
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let cache = DiskCache::new(dir.path());
        let got: Option<Payload> = cache.get("titles", "missing", Ttl::days(30));
        assert_eq!(got, None);
    }

    #[test]
    fn expired_entry_is_none() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let cache = DiskCache::new(dir.path());
        cache.put("search", "k", &Payload { title: "x".into() });
        let got: Option<Payload> = cache.get("search", "k", Ttl(Duration::from_secs(0)));
        assert_eq!(got, None);
    }
}
