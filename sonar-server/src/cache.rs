//! Size-bounded local audio cache
//!
//! Owns a directory of downloaded song files keyed by song id. Fetches on
//! demand, deduplicates concurrent fetches of the same id, and enforces a
//! byte budget by evicting the least-recently-used entry. The index is
//! rebuilt from the directory listing at startup; nothing else is
//! persisted.

use crate::backend::CatalogBackend;
use futures::StreamExt;
use sonar_common::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const AUDIO_EXT: &str = "mp3";
const PART_EXT: &str = "part";

/// One cached song file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub song_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Logical access clock; higher is more recent
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Song ids with a download in flight
    downloading: HashSet<String>,
    access_seq: u64,
}

impl CacheState {
    fn touch(&mut self, song_id: &str) {
        self.access_seq += 1;
        if let Some(entry) = self.entries.get_mut(song_id) {
            entry.last_access = self.access_seq;
        }
    }

    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}

/// Bounded local cache of downloaded song files.
pub struct CacheManager {
    backend: Arc<dyn CatalogBackend>,
    dir: PathBuf,
    budget_bytes: u64,
    state: Mutex<CacheState>,
}

impl CacheManager {
    /// Open (or create) the cache directory and rebuild the index from its
    /// contents. Leftover partial downloads are discarded.
    pub async fn new(
        backend: Arc<dyn CatalogBackend>,
        dir: PathBuf,
        budget_bytes: u64,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut found: Vec<(String, PathBuf, u64, SystemTime)> = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = listing.next_entry().await? {
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!(".{PART_EXT}")) {
                warn!("Discarding stale partial download: {}", path.display());
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if let Some(id) = name.strip_suffix(&format!(".{AUDIO_EXT}")) {
                let meta = dirent.metadata().await?;
                if meta.is_file() {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((id.to_string(), path, meta.len(), modified));
                }
            }
        }

        // Seed the access clock in modification-time order so eviction
        // starts from the oldest files after a restart.
        found.sort_by(|a, b| a.3.cmp(&b.3).then_with(|| a.0.cmp(&b.0)));
        let mut state = CacheState::default();
        for (song_id, path, size_bytes, _) in found {
            state.access_seq += 1;
            state.entries.insert(
                song_id.clone(),
                CacheEntry {
                    song_id,
                    path,
                    size_bytes,
                    last_access: state.access_seq,
                },
            );
        }

        info!(
            "Cache opened: {} entries, {} bytes (budget {})",
            state.entries.len(),
            state.total_bytes(),
            budget_bytes
        );

        Ok(Self {
            backend,
            dir,
            budget_bytes,
            state: Mutex::new(state),
        })
    }

    /// Fetch a song, returning the path of a complete local file.
    ///
    /// A cache hit touches the entry and returns immediately. A concurrent
    /// fetch of the same id returns `Busy` (callers retry; the status
    /// `downloading` flag tracks progress). Eviction runs after every hit
    /// and every completed download.
    pub async fn fetch(&self, song_id: &str) -> Result<PathBuf> {
        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.entries.get(song_id) {
                let path = entry.path.clone();
                state.touch(song_id);
                self.evict(&mut state).await;
                debug!("Cache hit: {}", song_id);
                return Ok(path);
            }
            if state.downloading.contains(song_id) {
                return Err(Error::Busy(format!(
                    "{song_id} is still downloading; try again shortly"
                )));
            }
            state.downloading.insert(song_id.to_string());
        }

        let result = self.download(song_id).await;

        let mut state = self.state.lock().await;
        state.downloading.remove(song_id);
        match result {
            Ok(entry) => {
                let path = entry.path.clone();
                state.entries.insert(song_id.to_string(), entry);
                state.touch(song_id);
                self.evict(&mut state).await;
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a download for the song is in flight.
    pub async fn is_downloading(&self, song_id: &str) -> bool {
        self.state.lock().await.downloading.contains(song_id)
    }

    /// Fire-and-forget fetch of a song expected to be needed soon.
    /// Collisions with an in-flight download are expected and quiet.
    pub fn prefetch(self: &Arc<Self>, song_id: String) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            match cache.fetch(&song_id).await {
                Ok(_) => debug!("Prefetched {}", song_id),
                Err(Error::Busy(_)) => debug!("Prefetch of {} already in flight", song_id),
                Err(e) => warn!("Prefetch of {} failed: {}", song_id, e),
            }
        });
    }

    /// Total bytes currently cached.
    pub async fn total_bytes(&self) -> u64 {
        self.state.lock().await.total_bytes()
    }

    /// Ids currently cached (unordered).
    pub async fn cached_ids(&self) -> Vec<String> {
        self.state.lock().await.entries.keys().cloned().collect()
    }

    fn audio_path(&self, song_id: &str) -> PathBuf {
        self.dir.join(format!("{song_id}.{AUDIO_EXT}"))
    }

    /// Stream the song to a partial file and atomically rename it into
    /// place; no partial file survives a failure.
    async fn download(&self, song_id: &str) -> Result<CacheEntry> {
        // Ids become file names; refuse anything that could leave the dir.
        if song_id.contains(['/', '\\']) || song_id.contains("..") {
            return Err(Error::Fetch(format!("invalid song id: {song_id}")));
        }

        let final_path = self.audio_path(song_id);
        let part_path = final_path.with_extension(format!("{AUDIO_EXT}.{PART_EXT}"));
        debug!("Downloading {} to {}", song_id, part_path.display());

        let result = self.write_stream(song_id, &part_path, &final_path).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part_path).await;
        }
        result
    }

    async fn write_stream(
        &self,
        song_id: &str,
        part_path: &Path,
        final_path: &Path,
    ) -> Result<CacheEntry> {
        let download = self.backend.stream(song_id).await.map_err(|e| match e {
            Error::NoSuchReference(_) => e,
            other => Error::Fetch(format!("{song_id}: {other}")),
        })?;

        let mut file = tokio::fs::File::create(part_path)
            .await
            .map_err(|e| Error::Fetch(format!("{song_id}: {e}")))?;

        let mut stream = download.stream;
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(format!("{song_id}: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Fetch(format!("{song_id}: {e}")))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| Error::Fetch(format!("{song_id}: {e}")))?;
        drop(file);

        if let Some(expected) = download.content_length {
            if written != expected {
                return Err(Error::Fetch(format!(
                    "{song_id}: truncated download ({written} of {expected} bytes)"
                )));
            }
        }

        tokio::fs::rename(part_path, final_path)
            .await
            .map_err(|e| Error::Fetch(format!("{song_id}: {e}")))?;

        debug!("Downloaded {} ({} bytes)", song_id, written);
        Ok(CacheEntry {
            song_id: song_id.to_string(),
            path: final_path.to_path_buf(),
            size_bytes: written,
            last_access: 0,
        })
    }

    /// Evict least-recently-accessed entries until the budget holds.
    /// Never evicts the last remaining entry, even if it alone exceeds
    /// the budget.
    async fn evict(&self, state: &mut CacheState) {
        while state.total_bytes() > self.budget_bytes && state.entries.len() > 1 {
            let victim = state
                .entries
                .values()
                .min_by(|a, b| {
                    a.last_access
                        .cmp(&b.last_access)
                        .then_with(|| a.song_id.cmp(&b.song_id))
                })
                .map(|e| e.song_id.clone());
            let Some(victim_id) = victim else { break };

            if let Some(entry) = state.entries.remove(&victim_id) {
                info!(
                    "Evicting {} ({} bytes) from cache",
                    victim_id, entry.size_bytes
                );
                if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                    warn!("Could not remove {}: {}", entry.path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubCatalog;
    use std::sync::atomic::Ordering;

    const KB: usize = 1024;

    async fn cache_with(
        stub: StubCatalog,
        budget: u64,
    ) -> (Arc<CacheManager>, Arc<StubCatalog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(stub);
        let cache = CacheManager::new(
            Arc::clone(&backend) as Arc<dyn CatalogBackend>,
            dir.path().to_path_buf(),
            budget,
        )
        .await
        .unwrap();
        (Arc::new(cache), backend, dir)
    }

    #[tokio::test]
    async fn test_fetch_downloads_once() {
        let mut stub = StubCatalog::default();
        stub.set_audio("s1", 4 * KB);
        let (cache, backend, _dir) = cache_with(stub, 1024 * 1024).await;

        let path = cache.fetch("s1").await.unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * KB as u64);

        // Second fetch is a hit: no new download.
        let again = cache.fetch("s1").await.unwrap();
        assert_eq!(path, again);
        assert_eq!(backend.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest() {
        // Budget 10KB, three 4KB files, then a fourth: the
        // oldest-accessed entry (and only that one) must go.
        let mut stub = StubCatalog::default();
        for id in ["s1", "s2", "s3", "s4"] {
            stub.set_audio(id, 4 * KB);
        }
        let (cache, _backend, _dir) = cache_with(stub, 10 * KB as u64).await;

        let first = cache.fetch("s1").await.unwrap();
        cache.fetch("s2").await.unwrap();
        cache.fetch("s3").await.unwrap();
        assert_eq!(cache.total_bytes().await, 8 * KB as u64);
        assert!(!first.exists(), "s1 should have been evicted");

        cache.fetch("s4").await.unwrap();
        let mut ids = cache.cached_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["s3", "s4"]);
        assert!(cache.total_bytes().await <= 10 * KB as u64);
    }

    #[tokio::test]
    async fn test_touch_protects_recently_played() {
        let mut stub = StubCatalog::default();
        for id in ["s1", "s2", "s3"] {
            stub.set_audio(id, 4 * KB);
        }
        let (cache, _backend, _dir) = cache_with(stub, 8 * KB as u64).await;

        cache.fetch("s1").await.unwrap();
        cache.fetch("s2").await.unwrap();
        // Play s1 again: the touch makes s2 the eviction candidate.
        cache.fetch("s1").await.unwrap();
        cache.fetch("s3").await.unwrap();

        let mut ids = cache.cached_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["s1", "s3"]);
    }

    #[tokio::test]
    async fn test_single_oversized_entry_survives() {
        let mut stub = StubCatalog::default();
        stub.set_audio("big", 64 * KB);
        let (cache, _backend, _dir) = cache_with(stub, KB as u64).await;

        let path = cache.fetch("big").await.unwrap();
        assert!(path.exists());
        assert_eq!(cache.cached_ids().await, vec!["big"]);
    }

    #[tokio::test]
    async fn test_duplicate_fetch_is_busy() {
        let mut stub = StubCatalog::default();
        stub.set_audio("s1", 4 * KB);
        let gate = stub.gate("s1");
        let (cache, backend, _dir) = cache_with(stub, 1024 * 1024).await;

        let in_flight = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch("s1").await })
        };
        while !cache.is_downloading("s1").await {
            tokio::task::yield_now().await;
        }

        let err = cache.fetch("s1").await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        gate.add_permits(1);
        in_flight.await.unwrap().unwrap();
        assert!(!cache.is_downloading("s1").await);
        assert_eq!(backend.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing() {
        let mut stub = StubCatalog::default();
        stub.set_audio("s1", 4 * KB);
        stub.broken.insert("s1".to_string());
        let (cache, _backend, dir) = cache_with(stub, 1024 * 1024).await;

        let err = cache.fetch("s1").await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
        assert!(!cache.is_downloading("s1").await);
        assert!(cache.cached_ids().await.is_empty());

        // No partial or final file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_index_rebuilt_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        for (id, delay_ms) in [("old", 0u64), ("new", 20)] {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            std::fs::write(dir.path().join(format!("{id}.mp3")), vec![0u8; 4 * KB]).unwrap();
        }
        std::fs::write(dir.path().join("junk.mp3.part"), b"partial").unwrap();

        let backend = Arc::new(StubCatalog::default());
        let cache = CacheManager::new(backend, dir.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();

        let mut ids = cache.cached_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(cache.total_bytes().await, 8 * KB as u64);
        assert!(!dir.path().join("junk.mp3.part").exists());
    }

    #[tokio::test]
    async fn test_budget_invariant_after_any_fetch() {
        let mut stub = StubCatalog::default();
        for i in 0..8 {
            stub.set_audio(&format!("s{i}"), 3 * KB);
        }
        let (cache, _backend, _dir) = cache_with(stub, 7 * KB as u64).await;

        for i in 0..8 {
            cache.fetch(&format!("s{i}")).await.unwrap();
            let total = cache.total_bytes().await;
            let entries = cache.cached_ids().await.len();
            assert!(
                total <= 7 * KB as u64 || entries == 1,
                "budget violated: {total} bytes in {entries} entries"
            );
        }
    }
}
