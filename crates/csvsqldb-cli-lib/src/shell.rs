//! Read-eval-print loop, grounded on `original_source/apps/csvsqldb/main.cpp`'s
//! `doRun` interactive branch: statements accumulate until a terminating
//! `;`, backslash commands inspect the database without going through SQL,
//! and each result is printed as a delimited table followed by the
//! statement's timing stats when enabled.

use std::io::{self, BufRead, Write};

use anstyle::{AnsiColor, Style};
use csvsqldb_core::value::Variant;
use csvsqldb_core::Result;
use csvsqldb_engine::engine::{ExecutionResult, Outcome};
use csvsqldb_engine::operators::{ColumnInfo, OutputRowOperatorNode, RowOperatorNode};
use csvsqldb_engine::{EngineConfig, ExecutionEngine};

const ERROR_STYLE: Style = AnsiColor::Red.on_default();

/// Prints `ERROR: <message>`, matching the prefix statements and queries are
/// reported under; the word itself is styled, the literal prefix is not, so
/// output stays greppable with color on or off.
fn print_error(message: impl std::fmt::Display) {
    println!("{ERROR_STYLE}ERROR{ERROR_STYLE:#}: {message}");
}

/// A finished row set replayed through `OutputRowOperatorNode`, the same
/// sink the engine uses for `Outcome::Rows` formatting — so the shell's
/// printed table uses the identical delimiter/quoting rules as a streamed
/// `SELECT ... INTO` would.
struct MaterializedRows {
    columns: Vec<ColumnInfo>,
    rows: std::vec::IntoIter<Vec<Variant>>,
}

impl MaterializedRows {
    fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Variant>>) -> MaterializedRows {
        MaterializedRows { columns, rows: rows.into_iter() }
    }
}

impl RowOperatorNode for MaterializedRows {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        Ok(self.columns.clone())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        Ok(self.rows.next())
    }

    fn dump(&self) -> String {
        "Rows".to_string()
    }
}

pub fn run_one(engine: &mut ExecutionEngine, sql: &str, show_stats: bool) -> i32 {
    match engine.execute(sql) {
        Ok(results) => {
            for result in &results {
                print_result(result, show_stats);
            }
            0
        }
        Err(e) => {
            print_error(e);
            1
        }
    }
}

pub fn run_repl(engine: &mut ExecutionEngine, mut show_stats: bool) -> i32 {
    println!("csvsqldb {} -- type \\help for shell commands", env!("CARGO_PKG_VERSION"));
    let stdin = io::stdin();
    let mut buffer = String::new();
    loop {
        print!("{}", if buffer.is_empty() { "sql> " } else { "...> " });
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            println!();
            break;
        }
        let trimmed = line.trim();

        if buffer.is_empty() {
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix('\\') {
                match run_backslash_command(engine, rest, &mut show_stats) {
                    BackslashOutcome::Continue => continue,
                    BackslashOutcome::Quit => break,
                }
            }
        }

        buffer.push_str(&line);
        if trimmed.ends_with(';') {
            let sql = buffer.trim().to_string();
            buffer.clear();
            match engine.execute(&sql) {
                Ok(results) => {
                    for result in &results {
                        print_result(result, show_stats);
                    }
                }
                Err(e) => print_error(e),
            }
        }
    }
    0
}

enum BackslashOutcome {
    Continue,
    Quit,
}

fn run_backslash_command(engine: &ExecutionEngine, command: &str, show_stats: &mut bool) -> BackslashOutcome {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or("") {
        "q" | "quit" | "exit" => return BackslashOutcome::Quit,
        "help" => {
            println!("\\help              this help");
            println!("\\quit | \\q         quit the shell");
            println!("\\tables            list the tables in the database");
            println!("\\mappings          list the file mappings in the database");
            println!("\\columns <table>   list a table's columns");
            println!("\\functions         list the available functions");
            println!("\\stats on|off      toggle statement timing output");
            println!("<sql statement>;   execute the statement");
        }
        "tables" => {
            for table in engine.catalog().get_tables() {
                println!("{}", table.name);
            }
        }
        "mappings" => {
            for mapping in engine.catalog().get_mappings() {
                println!("{}", mapping.name);
            }
        }
        "columns" => match parts.next() {
            Some(table) => match engine.catalog().get_table(table) {
                Ok(body) => {
                    for c in &body.columns {
                        println!("{} : {}", c.name, c.ty);
                    }
                }
                Err(e) => print_error(e),
            },
            None => print_error("table name parameter missing"),
        },
        "functions" => {
            for f in engine.functions().all() {
                println!("{}", f.name);
            }
        }
        "stats" => match parts.next() {
            Some("on") => *show_stats = true,
            Some("off") => *show_stats = false,
            _ => println!("stats {}", if *show_stats { "on" } else { "off" }),
        },
        other => print_error(format!("unknown command '\\{other}', try \\help")),
    }
    BackslashOutcome::Continue
}

fn print_result(result: &ExecutionResult, show_stats: bool) {
    match &result.outcome {
        Outcome::Rows { columns, rows } => {
            let row_count = rows.len();
            let source = MaterializedRows::new(columns.clone(), rows.clone());
            let mut sink = OutputRowOperatorNode::new(Box::new(source), io::stdout(), ',', true);
            if let Err(e) = sink.run() {
                print_error(e);
                return;
            }
            println!("[{row_count} row{}]", if row_count == 1 { "" } else { "s" });
        }
        Outcome::Message(message) => println!("{message}"),
    }
    if show_stats {
        let stats = &result.stats;
        println!(
            "parse {:?}  preprocess {:?}  execute {:?}",
            stats.parse_duration, stats.preprocess_duration, stats.execute_duration
        );
    }
}

pub fn open_engine(database_path: &std::path::Path, config: EngineConfig) -> std::result::Result<ExecutionEngine, String> {
    ExecutionEngine::open(database_path, config).map_err(|e| e.to_string())
}
