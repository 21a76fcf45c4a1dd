use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use svobake_partition::PartitionStats;
use svobake_world::ChunkKey;

/// Final state of one chunk after a run. Partitions of the same chunk fold
/// together; a failure outranks a cancellation, which outranks success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    Merged {
        partitions: u32,
        /// Occupied voxels in the persisted tree after the last merge.
        voxels: u64,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl ChunkStatus {
    fn rank(&self) -> u8 {
        match self {
            ChunkStatus::Merged { .. } => 0,
            ChunkStatus::Cancelled => 1,
            ChunkStatus::Failed { .. } => 2,
        }
    }

    fn fold(self, next: ChunkStatus) -> ChunkStatus {
        match (self, next) {
            (
                ChunkStatus::Merged { partitions: a, voxels: va },
                ChunkStatus::Merged { partitions: b, voxels: vb },
            ) => ChunkStatus::Merged {
                partitions: a + b,
                voxels: va.max(vb),
            },
            (cur, next) => {
                if next.rank() > cur.rank() {
                    next
                } else {
                    cur
                }
            }
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkStatus::Merged { partitions, voxels } => {
                write!(f, "merged ({partitions} partitions, {voxels} voxels)")
            }
            ChunkStatus::Failed { error } => write!(f, "failed: {error}"),
            ChunkStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    pub chunks: BTreeMap<ChunkKey, ChunkStatus>,
    pub partition: PartitionStats,
    pub elapsed: Duration,
    pub cancelled: bool,
    /// Jobs handed back because no memory permit freed up in time.
    pub requeued: u64,
}

impl BuildReport {
    pub fn record(&mut self, key: ChunkKey, status: ChunkStatus) {
        let folded = match self.chunks.remove(&key) {
            Some(cur) => cur.fold(status),
            None => status,
        };
        self.chunks.insert(key, folded);
    }

    pub fn merged_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|s| matches!(s, ChunkStatus::Merged { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|s| matches!(s, ChunkStatus::Failed { .. }))
            .count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|s| matches!(s, ChunkStatus::Cancelled))
            .count()
    }

    /// Every chunk merged and the run was not cancelled.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.merged_count() == self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: ChunkKey = ChunkKey {
        region: 0,
        chunk: 5,
    };

    #[test]
    fn merged_parts_accumulate() {
        let mut r = BuildReport::default();
        r.record(K, ChunkStatus::Merged { partitions: 1, voxels: 10 });
        r.record(K, ChunkStatus::Merged { partitions: 1, voxels: 25 });
        assert_eq!(r.chunks[&K], ChunkStatus::Merged { partitions: 2, voxels: 25 });
        assert!(r.is_success());
    }

    #[test]
    fn failure_outranks_other_parts() {
        let mut r = BuildReport::default();
        r.record(K, ChunkStatus::Failed { error: "disk".into() });
        r.record(K, ChunkStatus::Merged { partitions: 1, voxels: 1 });
        r.record(K, ChunkStatus::Cancelled);
        assert!(matches!(r.chunks[&K], ChunkStatus::Failed { .. }));
        assert_eq!(r.failed_count(), 1);
        assert!(!r.is_success());
    }
}
