use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::io;

use libc::c_int;

use crate::error::Result;

struct CacheEntry {
    fd: c_int,
    size: u64,
    freq: u32,
}

/// LFU cache of open file descriptors keyed by path.
///
/// Capacity is clamped to `rlimit(NOFILE)/2` so sockets keep room. A hit
/// bumps the entry's frequency and moves it to the front of its new bucket;
/// eviction takes the oldest entry (back) of the least-frequency bucket.
/// Cached descriptors are owned by the cache and closed on eviction/drop, so
/// callers must not close what `get` hands out.
pub struct FileCache {
    entries: HashMap<String, CacheEntry>,
    freq_buckets: HashMap<u32, VecDeque<String>>,
    min_freq: u32,
    capacity: usize,
}

impl FileCache {
    pub fn new(configured_capacity: usize) -> Self {
        let mut safe = configured_capacity;

        unsafe {
            let mut rl = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) == 0 {
                safe = (rl.rlim_cur as usize / 2).max(1);
            }
        }

        Self {
            entries: HashMap::new(),
            freq_buckets: HashMap::new(),
            min_freq: 0,
            capacity: configured_capacity.min(safe).max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor + size for `path`, opening and `fstat`-ing on a miss.
    /// Symlinks and non-regular files are rejected.
    pub fn get(&mut self, path: &str) -> Result<(c_int, u64)> {
        if self.entries.contains_key(path) {
            self.touch(path);
            let entry = &self.entries[path];
            return Ok((entry.fd, entry.size));
        }

        let (fd, size) = Self::open_regular(path)?;
        self.insert(path.to_string(), fd, size);
        Ok((fd, size))
    }

    fn open_regular(path: &str) -> Result<(c_int, u64)> {
        let cpath = CString::new(path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

        unsafe {
            let fd = libc::open(
                cpath.as_ptr(),
                libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }

            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
            if st.st_mode & libc::S_IFMT != libc::S_IFREG {
                libc::close(fd);
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file").into());
            }

            Ok((fd, st.st_size as u64))
        }
    }

    fn touch(&mut self, key: &str) {
        let (old_freq, new_freq) = {
            let entry = self.entries.get_mut(key).expect("touch on absent key");
            let old = entry.freq;
            entry.freq += 1;
            (old, entry.freq)
        };

        if let Some(bucket) = self.freq_buckets.get_mut(&old_freq) {
            if let Some(pos) = bucket.iter().position(|k| k == key) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.freq_buckets.remove(&old_freq);
                if self.min_freq == old_freq {
                    self.min_freq = new_freq;
                }
            }
        }

        self.freq_buckets
            .entry(new_freq)
            .or_default()
            .push_front(key.to_string());
    }

    fn insert(&mut self, key: String, fd: c_int, size: u64) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }

        self.freq_buckets.entry(1).or_default().push_front(key.clone());
        self.entries.insert(key, CacheEntry { fd, size, freq: 1 });
        self.min_freq = 1;
    }

    fn evict(&mut self) {
        let Some(bucket) = self.freq_buckets.get_mut(&self.min_freq) else {
            return;
        };
        let Some(victim) = bucket.pop_back() else {
            return;
        };
        if bucket.is_empty() {
            self.freq_buckets.remove(&self.min_freq);
        }

        if let Some(entry) = self.entries.remove(&victim) {
            unsafe {
                libc::close(entry.fd);
            }
        }
        // min_freq is reset by the insertion that triggered this
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            unsafe {
                libc::close(entry.fd);
            }
        }
        if !self.entries.is_empty() {
            tracing::info!("file cache closed {} cached descriptors", self.entries.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vivace-fc-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(dir: &PathBuf, name: &str, content: &[u8]) -> String {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn hit_returns_same_fd_and_size() {
        let dir = scratch_dir("hit");
        let path = write_file(&dir, "a.txt", b"hello world");

        let mut cache = FileCache::new(4);
        let (fd1, size1) = cache.get(&path).unwrap();
        let (fd2, size2) = cache.get(&path).unwrap();
        assert_eq!(fd1, fd2);
        assert_eq!(size1, 11);
        assert_eq!(size2, 11);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = scratch_dir("missing");
        let mut cache = FileCache::new(4);
        assert!(cache.get(dir.join("nope.txt").to_str().unwrap()).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn directory_is_rejected() {
        let dir = scratch_dir("dir");
        let mut cache = FileCache::new(4);
        assert!(cache.get(dir.to_str().unwrap()).is_err());
    }

    #[test]
    fn evicts_least_frequent_oldest_first() {
        let dir = scratch_dir("evict");
        let a = write_file(&dir, "a", b"a");
        let b = write_file(&dir, "b", b"b");
        let c = write_file(&dir, "c", b"c");

        let mut cache = FileCache::new(2);
        cache.get(&a).unwrap();
        cache.get(&b).unwrap();
        cache.get(&a).unwrap(); // a: freq 2, b stays at freq 1

        cache.get(&c).unwrap(); // evicts b (min freq, oldest)
        assert_eq!(cache.len(), 2);
        assert!(cache.entries.contains_key(&a));
        assert!(cache.entries.contains_key(&c));
        assert!(!cache.entries.contains_key(&b));
    }

    #[test]
    fn capacity_respects_rlimit_half() {
        let cache = FileCache::new(usize::MAX);
        let mut rl = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
        assert!(cache.capacity() <= (rl.rlim_cur as usize / 2).max(1));
    }
}
