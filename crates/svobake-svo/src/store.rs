use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use svobake_voxel::VoxelGrid;
use svobake_world::ChunkKey;

use crate::codec::{decode, encode};
use crate::tree::SvoTree;

/// Bounded exponential backoff for store IO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 25,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// No retries, no sleeping.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Runs `op` until it succeeds or the attempts are spent. Returns the
    /// last error and the number of attempts made.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<T, (io::Error, u32)> {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff_ms;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= attempts => return Err((e, attempt)),
                Err(e) => {
                    log::warn!(
                        target: "store",
                        "{what} failed (attempt {attempt}/{attempts}): {e}; retrying in {backoff} ms"
                    );
                    if backoff > 0 {
                        std::thread::sleep(Duration::from_millis(backoff));
                    }
                    backoff = (backoff * 2).min(self.max_backoff_ms);
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chunk {key}: {what} failed after {attempts} attempts: {source}")]
    Io {
        key: ChunkKey,
        what: &'static str,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Result of one Load-Merge-Commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    /// False when the merged bytes equal what was already stored.
    pub written: bool,
    /// A stored file was unreadable and replaced as if empty.
    pub recovered: bool,
    pub voxel_count: u64,
    pub node_count: usize,
    pub bytes: usize,
}

/// Directory of persisted chunk octrees: `<root>/r{region:05}/c{chunk:05}.svo`.
pub struct ChunkStore {
    root: PathBuf,
    retry: RetryPolicy,
    tmp_seq: AtomicU64,
}

fn fsync_directory(path: &Path) {
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}

impl ChunkStore {
    pub fn open(root: impl Into<PathBuf>, retry: RetryPolicy) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retry,
            tmp_seq: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn region_dir(&self, region: u16) -> PathBuf {
        self.root.join(format!("r{region:05}"))
    }

    pub fn chunk_path(&self, key: ChunkKey) -> PathBuf {
        self.region_dir(key.region).join(format!("c{:05}.svo", key.chunk))
    }

    fn io_error(
        key: ChunkKey,
        what: &'static str,
        (source, attempts): (io::Error, u32),
    ) -> StoreError {
        StoreError::Io {
            key,
            what,
            attempts,
            source,
        }
    }

    fn read_bytes(&self, key: ChunkKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.chunk_path(key);
        self.retry
            .run("read", || match std::fs::read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            })
            .map_err(|e| Self::io_error(key, "read", e))
    }

    /// Decodes stored bytes; corruption is logged and yields `None`.
    fn decode_or_warn(key: ChunkKey, bytes: &[u8]) -> Option<SvoTree> {
        match decode(key, bytes) {
            Ok(tree) => Some(tree),
            Err(e) => {
                log::warn!(target: "store", "chunk {key} is corrupt ({e}); treating as empty");
                None
            }
        }
    }

    /// Persisted tree for `key`; empty when missing or corrupt.
    pub fn load(&self, key: ChunkKey) -> Result<SvoTree, StoreError> {
        Ok(self
            .read_bytes(key)?
            .and_then(|bytes| Self::decode_or_warn(key, &bytes))
            .unwrap_or_default())
    }

    /// Unions `grid` into the persisted tree for `key` and commits the result
    /// atomically. Not safe to call concurrently for the same key.
    pub fn merge(&self, key: ChunkKey, grid: &VoxelGrid) -> Result<MergeOutcome, StoreError> {
        debug_assert_eq!(grid.key(), key);
        let existing = self.read_bytes(key)?;
        let mut recovered = false;
        let mut tree = match &existing {
            Some(bytes) => Self::decode_or_warn(key, bytes).unwrap_or_else(|| {
                recovered = true;
                SvoTree::new()
            }),
            None => SvoTree::new(),
        };
        tree.merge_grid(grid);
        tree.compact();
        let encoded = encode(key, &tree);
        let mut outcome = MergeOutcome {
            written: false,
            recovered,
            voxel_count: tree.voxel_count(),
            node_count: tree.node_count(),
            bytes: encoded.len(),
        };

        let unchanged = match &existing {
            Some(old) => *old == encoded,
            // Nothing on disk and nothing to add: keep the region absent.
            None => tree.is_empty(),
        };
        if unchanged {
            log::debug!(target: "store", "chunk {key} unchanged, skipping commit");
            return Ok(outcome);
        }

        self.retry
            .run("commit", || self.commit(key, &encoded))
            .map_err(|e| Self::io_error(key, "commit", e))?;
        outcome.written = true;
        log::debug!(
            target: "store",
            "committed {key}: {} voxels, {} nodes, {} bytes",
            outcome.voxel_count,
            outcome.node_count,
            outcome.bytes
        );
        Ok(outcome)
    }

    /// Writes `bytes` to a unique temporary file beside the target, syncs it,
    /// renames it into place, then syncs the directory.
    fn commit(&self, key: ChunkKey, bytes: &[u8]) -> io::Result<()> {
        let dir = self.region_dir(key.region);
        std::fs::create_dir_all(&dir)?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = dir.join(format!(
            ".c{:05}.{}.{seq}.tmp",
            key.chunk,
            std::process::id()
        ));
        let result = (|| {
            let mut file = File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, self.chunk_path(key))
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result?;
        fsync_directory(&dir);
        Ok(())
    }

    /// Keys of every chunk file under the root, sorted.
    pub fn persisted_chunks(&self) -> io::Result<Vec<ChunkKey>> {
        fn numbered(name: &str, prefix: &str, suffix: &str) -> Option<u16> {
            let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
            if digits.len() != 5 {
                return None;
            }
            digits.parse().ok()
        }

        let mut keys = Vec::new();
        for region in std::fs::read_dir(&self.root)? {
            let region = region?;
            if !region.file_type()?.is_dir() {
                continue;
            }
            let Some(region_id) = region.file_name().to_str().and_then(|n| numbered(n, "r", ""))
            else {
                continue;
            };
            for chunk in std::fs::read_dir(region.path())? {
                let chunk = chunk?;
                if let Some(chunk_id) =
                    chunk.file_name().to_str().and_then(|n| numbered(n, "c", ".svo"))
                {
                    keys.push(ChunkKey {
                        region: region_id,
                        chunk: chunk_id,
                    });
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
