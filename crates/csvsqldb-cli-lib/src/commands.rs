use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "csvsqldb")]
#[command(about = "Execute SQL queries directly against CSV files", long_about = None, version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the database directory (catalog metadata lives under a
    /// `.csvdb` subdirectory here; CSV files are resolved relative to it).
    #[arg(short = 'p', long = "database-path", default_value = ".")]
    pub database_path: PathBuf,
    /// Execute this SQL and exit, instead of opening an interactive shell.
    #[arg(short = 'e', long = "execute")]
    pub execute: Option<String>,
    /// Path to a TOML engine configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print parse/preprocess/execute timings after each statement.
    #[arg(long, default_value_t = false)]
    pub stats: bool,
}
