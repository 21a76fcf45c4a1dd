mod cli;
mod config;
mod inspect;
mod logging;

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use svobake_io::ply::read_ply;
use svobake_io::write_mesh_file;
use svobake_runtime::{BuildReport, ChunkStatus, Pipeline};

use crate::cli::{BuildArgs, Cli, Command};
use crate::config::BuildConfig;

fn print_report(report: &BuildReport) {
    for (key, status) in &report.chunks {
        if !matches!(status, ChunkStatus::Merged { .. }) || log::log_enabled!(log::Level::Debug) {
            println!("{key}  {status}");
        }
    }
    let p = &report.partition;
    println!(
        "{} triangles read, {} assigned, {} outside the world, {} partitions",
        p.triangles_read, p.triangles_assigned, p.triangles_discarded, p.partitions_written
    );
    println!(
        "{} chunks: {} merged, {} failed, {} cancelled in {:.2?}",
        report.chunks.len(),
        report.merged_count(),
        report.failed_count(),
        report.cancelled_count(),
        report.elapsed
    );
    if report.requeued > 0 {
        println!("{} jobs waited for a memory permit", report.requeued);
    }
}

fn build(args: &BuildArgs) -> Result<bool, Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::default(),
    };
    let settings = config.settings(args)?;
    let placement = config.placement(args);
    let report = Pipeline::new(settings).run(&args.mesh, &placement)?;
    print_report(&report);
    Ok(report.failed_count() == 0)
}

fn import_ply(input: &std::path::Path, output: &std::path::Path) -> Result<(), Box<dyn Error>> {
    let mesh = read_ply(input)?;
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_mesh_file(output, &mesh)?;
    println!(
        "wrote {}: {} vertices, {} triangles ({:?})",
        output.display(),
        mesh.vertices.len(),
        mesh.triangles.len(),
        mesh.layout()
    );
    Ok(())
}

fn run(cli: Cli) -> Result<bool, Box<dyn Error>> {
    logging::init(cli.log_level, cli.log_file.as_deref())?;
    match cli.command {
        Command::Build(args) => build(&args),
        Command::ImportPly { input, output } => import_ply(&input, &output).map(|_| true),
        Command::Inspect { path } => inspect::run(&path).map(|_| true),
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}
