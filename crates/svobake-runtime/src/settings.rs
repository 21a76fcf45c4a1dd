use std::path::{Path, PathBuf};
use std::time::Duration;

use svobake_partition::PartitionConfig;
use svobake_svo::RetryPolicy;

#[derive(Clone, Debug)]
pub struct BuildSettings {
    /// Root of the persisted chunk store.
    pub output_dir: PathBuf,
    /// Partition files go here; defaults to `output_dir/.scratch`.
    pub scratch_dir: Option<PathBuf>,
    /// Worker threads; 0 picks the available parallelism.
    pub workers: usize,
    /// Total bytes the run may keep resident.
    pub memory_budget: usize,
    /// Bytes one in-flight chunk is expected to hold while voxelizing and
    /// merging.
    pub chunk_footprint: usize,
    /// How long a worker waits for a memory permit before requeueing.
    pub quota_timeout: Duration,
    pub flush_bytes: usize,
    pub batch_triangles: usize,
    pub retry: RetryPolicy,
    /// Leave partition files on disk after a successful merge.
    pub keep_partitions: bool,
}

impl BuildSettings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let partition = PartitionConfig::default();
        Self {
            output_dir: output_dir.into(),
            scratch_dir: None,
            workers: 0,
            memory_budget: 2 << 30,
            chunk_footprint: 64 << 20,
            quota_timeout: Duration::from_millis(250),
            flush_bytes: partition.flush_bytes,
            batch_triangles: partition.batch_triangles,
            retry: RetryPolicy::default(),
            keep_partitions: false,
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// The partitioner's resident share: a quarter of the budget.
    #[inline]
    pub fn partition_budget(&self) -> usize {
        self.memory_budget / 4
    }

    /// What is left for workers once the partitioner's share is set aside.
    #[inline]
    pub fn worker_budget(&self) -> usize {
        self.memory_budget - self.partition_budget()
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".scratch"))
    }

    pub fn partition_config(&self, scratch: &Path) -> PartitionConfig {
        PartitionConfig {
            scratch_dir: scratch.to_path_buf(),
            flush_bytes: self.flush_bytes,
            resident_budget: self.partition_budget(),
            batch_triangles: self.batch_triangles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_split() {
        let s = BuildSettings {
            memory_budget: 1000,
            ..BuildSettings::new("/tmp/out")
        };
        assert_eq!(s.partition_budget(), 250);
        assert_eq!(s.worker_budget(), 750);
        assert_eq!(s.partition_config(Path::new("/tmp/s")).resident_budget, 250);
    }

    #[test]
    fn default_scratch_is_stable_under_output() {
        let s = BuildSettings::new("/tmp/out");
        assert_eq!(s.scratch_dir(), Path::new("/tmp/out/.scratch"));
        assert_eq!(s.clone().scratch_dir(), s.scratch_dir());
        assert!(s.worker_count() >= 1);
    }
}
