use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::config::parse_bytes;

#[derive(Parser, Debug)]
#[command(
    name = "svobake",
    version,
    about = "Bake triangle meshes into a persistent sparse voxel octree world"
)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG is used when unset
    #[arg(long, global = true, value_parser = parse_level)]
    pub log_level: Option<LevelFilter>,
    /// Also write the log to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Voxelize a .tri mesh and merge it into the chunk store
    Build(BuildArgs),
    /// Convert a PLY mesh to a .tri stream
    ImportPly {
        input: PathBuf,
        output: PathBuf,
    },
    /// Print a .tri header, an .svo chunk summary, or the chunks of a store
    Inspect { path: PathBuf },
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Source mesh stream
    pub mesh: PathBuf,
    /// World offset of the mesh origin, in metres: X,Y,Z
    #[arg(long, value_parser = parse_offset, allow_hyphen_values = true)]
    pub offset: Option<[f32; 3]>,
    /// Total memory budget, e.g. 2G or 512M
    #[arg(long, value_parser = parse_bytes)]
    pub memory_budget: Option<usize>,
    /// Chunk store directory
    #[arg(long, short)]
    pub out: Option<PathBuf>,
    /// TOML file with [build], [partition] and [store] tables
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Worker threads (0 = one per core)
    #[arg(long)]
    pub workers: Option<usize>,
    /// Directory for partition files
    #[arg(long)]
    pub scratch: Option<PathBuf>,
    /// Keep partition files after merging
    #[arg(long)]
    pub keep_partitions: bool,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse()
        .map_err(|_| format!("unknown log level '{s}'"))
}

fn parse_offset(s: &str) -> Result<[f32; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, z] = parts[..] else {
        return Err(format!("expected X,Y,Z, got '{s}'"));
    };
    let num = |v: &str| {
        v.parse::<f32>()
            .ok()
            .filter(|f| f.is_finite())
            .ok_or_else(|| format!("invalid coordinate '{v}'"))
    };
    Ok([num(x)?, num(y)?, num(z)?])
}
