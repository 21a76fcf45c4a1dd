use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use svobake_runtime::BuildSettings;
use svobake_svo::RetryPolicy;
use svobake_world::Placement;

use crate::cli::BuildArgs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("no output directory: pass --out or set build.output_dir")]
    NoOutput,
}

/// Build options read from a TOML file. Every table and field is optional;
/// command line flags win over anything set here.
///
/// ```toml
/// [build]
/// output_dir = "out"
/// workers = 8
/// memory_budget = "4G"
/// offset = [0.0, 64.0, 0.0]
///
/// [partition]
/// flush_bytes = "8M"
///
/// [store]
/// max_attempts = 6
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub build: BuildSection,
    pub partition: PartitionSection,
    pub store: RetryPolicy,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub output_dir: Option<PathBuf>,
    pub workers: usize,
    pub memory_budget: ByteSize,
    pub chunk_footprint: ByteSize,
    pub quota_timeout_ms: u64,
    pub offset: [f32; 3],
    pub keep_partitions: bool,
}

impl Default for BuildSection {
    fn default() -> Self {
        let s = BuildSettings::new("");
        Self {
            output_dir: None,
            workers: s.workers,
            memory_budget: ByteSize(s.memory_budget),
            chunk_footprint: ByteSize(s.chunk_footprint),
            quota_timeout_ms: s.quota_timeout.as_millis() as u64,
            offset: [0.0; 3],
            keep_partitions: s.keep_partitions,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PartitionSection {
    pub scratch_dir: Option<PathBuf>,
    pub flush_bytes: ByteSize,
    pub batch_triangles: usize,
}

impl Default for PartitionSection {
    fn default() -> Self {
        let s = BuildSettings::new("");
        Self {
            scratch_dir: None,
            flush_bytes: ByteSize(s.flush_bytes),
            batch_triangles: s.batch_triangles,
        }
    }
}

/// A byte count written either as an integer or as a string with an optional
/// `K`, `M` or `G` suffix (powers of 1024).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ByteSizeRepr")]
pub struct ByteSize(pub usize);

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSizeRepr {
    Int(u64),
    Text(String),
}

impl TryFrom<ByteSizeRepr> for ByteSize {
    type Error = String;

    fn try_from(r: ByteSizeRepr) -> Result<Self, String> {
        match r {
            ByteSizeRepr::Int(n) => usize::try_from(n)
                .map(ByteSize)
                .map_err(|_| format!("{n} bytes does not fit in memory")),
            ByteSizeRepr::Text(s) => parse_bytes(&s).map(ByteSize),
        }
    }
}

pub fn parse_bytes(s: &str) -> Result<usize, String> {
    let t = s.trim();
    let (digits, shift) = match t.char_indices().last() {
        Some((i, 'k' | 'K')) => (&t[..i], 10),
        Some((i, 'm' | 'M')) => (&t[..i], 20),
        Some((i, 'g' | 'G')) => (&t[..i], 30),
        _ => (t, 0),
    };
    let n: usize = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size '{s}'"))?;
    n.checked_mul(1usize << shift)
        .ok_or_else(|| format!("byte size '{s}' overflows"))
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Settings for one run: file values overridden by any flag the user
    /// passed.
    pub fn settings(&self, args: &BuildArgs) -> Result<BuildSettings, ConfigError> {
        let b = &self.build;
        let p = &self.partition;
        let output_dir = args
            .out
            .clone()
            .or_else(|| b.output_dir.clone())
            .ok_or(ConfigError::NoOutput)?;
        Ok(BuildSettings {
            output_dir,
            scratch_dir: args.scratch.clone().or_else(|| p.scratch_dir.clone()),
            workers: args.workers.unwrap_or(b.workers),
            memory_budget: args.memory_budget.unwrap_or(b.memory_budget.0),
            chunk_footprint: b.chunk_footprint.0,
            quota_timeout: Duration::from_millis(b.quota_timeout_ms),
            flush_bytes: p.flush_bytes.0,
            batch_triangles: p.batch_triangles,
            retry: self.store,
            keep_partitions: args.keep_partitions || b.keep_partitions,
        })
    }

    pub fn placement(&self, args: &BuildArgs) -> Placement {
        Placement {
            offset: args.offset.unwrap_or(self.build.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::{Cli, Command};

    fn build_args(argv: &[&str]) -> BuildArgs {
        let mut full = vec!["svobake", "build", "mesh.tri"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Build(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn byte_suffixes() {
        assert_eq!(parse_bytes("512"), Ok(512));
        assert_eq!(parse_bytes("4K"), Ok(4096));
        assert_eq!(parse_bytes("3m"), Ok(3 << 20));
        assert_eq!(parse_bytes(" 2G "), Ok(2 << 30));
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("M").is_err());
    }

    #[test]
    fn empty_file_gives_defaults() {
        let c = BuildConfig::parse("").unwrap();
        let s = c.settings(&build_args(&["--out", "o"])).unwrap();
        let d = BuildSettings::new("o");
        assert_eq!(s.memory_budget, d.memory_budget);
        assert_eq!(s.flush_bytes, d.flush_bytes);
        assert_eq!(s.retry, d.retry);
        assert_eq!(s.quota_timeout, d.quota_timeout);
        assert_eq!(c.placement(&build_args(&["--out", "o"])), Placement::default());
    }

    #[test]
    fn file_values_apply_and_flags_override() {
        let c = BuildConfig::parse(
            r#"
            [build]
            output_dir = "from-file"
            workers = 3
            memory_budget = "1G"
            offset = [1.0, 2.0, 3.0]

            [partition]
            flush_bytes = 4096

            [store]
            max_attempts = 9
            "#,
        )
        .unwrap();

        let plain = build_args(&[]);
        let s = c.settings(&plain).unwrap();
        assert_eq!(s.output_dir, PathBuf::from("from-file"));
        assert_eq!(s.workers, 3);
        assert_eq!(s.memory_budget, 1 << 30);
        assert_eq!(s.flush_bytes, 4096);
        assert_eq!(s.retry.max_attempts, 9);
        assert_eq!(s.retry.initial_backoff_ms, RetryPolicy::default().initial_backoff_ms);
        assert_eq!(c.placement(&plain), Placement::at(1.0, 2.0, 3.0));

        let flagged = build_args(&[
            "--out",
            "cli",
            "--workers",
            "7",
            "--memory-budget",
            "256M",
            "--offset",
            "-5,0,10.5",
        ]);
        let s = c.settings(&flagged).unwrap();
        assert_eq!(s.output_dir, PathBuf::from("cli"));
        assert_eq!(s.workers, 7);
        assert_eq!(s.memory_budget, 256 << 20);
        assert_eq!(c.placement(&flagged), Placement::at(-5.0, 0.0, 10.5));
    }

    #[test]
    fn output_dir_is_required() {
        let c = BuildConfig::default();
        assert!(matches!(
            c.settings(&build_args(&[])),
            Err(ConfigError::NoOutput)
        ));
    }

    #[test]
    fn bad_byte_size_is_parse_error() {
        assert!(BuildConfig::parse("[build]\nmemory_budget = \"huge\"").is_err());
    }
}
