//! Argument parsing, configuration loading, logging and the interactive
//! shell for the `csvsqldb` binary. Kept as a library so integration tests
//! can drive the whole CLI without spawning a subprocess, matching the
//! teacher's `cli-lib`/`sqruff` split.

pub mod commands;
mod config;
mod logger;
pub mod shell;

use clap::Parser as _;

use commands::Cli;

/// Parses `args`, opens the database, and either runs one statement
/// (`--execute`) or starts the interactive shell. Returns the process exit
/// code, mirroring `original_source/apps/csvsqldb/main.cpp`'s `doRun`.
pub fn run_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let _ = logger::init();
    let cli = Cli::parse_from(args);

    let engine_config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };

    let mut engine = match shell::open_engine(&cli.database_path, engine_config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };

    let handle = engine.handle();
    let _ = ctrlc::set_handler(move || handle.cancel());

    match cli.execute {
        Some(sql) => shell::run_one(&mut engine, &sql, cli.stats),
        None => shell::run_repl(&mut engine, cli.stats),
    }
}
