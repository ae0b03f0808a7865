//! # mcb CLI Entry Point
//!
//! Parses CLI arguments with clap and routes to the build driver.
//!
//! ## Command Structure
//!
//! - **Build**: `build` (full or `--fast` incremental), `dump`
//! - **Cache**: `cache flush`, `cache clear`

use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;

use mcbuild::driver::{self, BuildRequest};

#[cfg(windows)]
#[link(name = "kernel32")]
unsafe extern "system" {
    fn SetConsoleOutputCP(wCodePageID: u32) -> i32;
    fn SetConsoleCP(wCodePageID: u32) -> i32;
}

#[cfg(windows)]
fn enable_windows_utf8_console() {
    unsafe {
        SetConsoleOutputCP(65001);
        SetConsoleCP(65001);
    }
}

#[cfg(not(windows))]
fn enable_windows_utf8_console() {}

#[derive(Parser)]
#[command(name = "mcb")]
#[command(about = "Model-driven build orchestrator for embedded toolchains", version = env!("CARGO_PKG_VERSION"))]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, link and post-process the project
    Build {
        /// Compiler model document
        #[arg(short, long)]
        model: PathBuf,
        /// Project parameter document
        #[arg(short, long)]
        params: PathBuf,
        /// Toolchain root directory (exported as TOOL_DIR)
        #[arg(short, long)]
        bin_dir: PathBuf,
        /// Incremental mode: skip sources with an unchanged include closure
        #[arg(long)]
        fast: bool,
        /// Override the project's thread hint
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Print the rendered command lines without running anything
    Dump {
        /// Compiler model document
        #[arg(short, long)]
        model: PathBuf,
        /// Project parameter document
        #[arg(short, long)]
        params: PathBuf,
    },
    /// Inspect or reset the dependency cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Promote staging records into the confirmed table
    Flush {
        /// Directory holding the dependency store
        dir: PathBuf,
    },
    /// Delete every record in both tables
    Clear {
        /// Directory holding the dependency store
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    enable_windows_utf8_console();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build {
            model,
            params,
            bin_dir,
            fast,
            jobs,
        } => driver::run_build(&BuildRequest {
            model_path: model,
            params_path: params,
            bin_dir,
            fast,
            jobs,
        }),
        Commands::Dump { model, params } => driver::run_dump(&model, &params),
        Commands::Cache { command } => match command {
            CacheCommands::Flush { dir } => driver::run_cache_flush(&dir),
            CacheCommands::Clear { dir } => driver::run_cache_clear(&dir),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
