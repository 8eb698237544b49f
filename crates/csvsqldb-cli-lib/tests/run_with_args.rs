//! Drives the CLI's entry point in-process (no subprocess, matching
//! `csvsqldb_cli_lib::lib`'s own doc comment that this is exactly what the
//! library split is for) against a scratch database directory.

use std::fs;

#[test]
fn execute_flag_runs_one_statement_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path();

    let code = csvsqldb_cli_lib::run_with_args([
        "csvsqldb",
        "-p",
        db.to_str().unwrap(),
        "-e",
        "CREATE TABLE employees (id INT PRIMARY KEY, name STRING)",
    ]);
    assert_eq!(code, 0);

    fs::write(db.join("employees.csv"), "1,Alice\n2,Bob\n").unwrap();
    let code = csvsqldb_cli_lib::run_with_args([
        "csvsqldb",
        "-p",
        db.to_str().unwrap(),
        "-e",
        "CREATE MAPPING employees (employees.csv)",
    ]);
    assert_eq!(code, 0);

    let code = csvsqldb_cli_lib::run_with_args([
        "csvsqldb",
        "-p",
        db.to_str().unwrap(),
        "-e",
        "SELECT name FROM employees WHERE id = 2",
    ]);
    assert_eq!(code, 0);
}

#[test]
fn invalid_sql_exits_nonzero_instead_of_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let code = csvsqldb_cli_lib::run_with_args([
        "csvsqldb",
        "-p",
        dir.path().to_str().unwrap(),
        "-e",
        "SELECT FROM WHERE garbage",
    ]);
    assert_eq!(code, 1);
}

#[test]
fn missing_config_file_is_reported_and_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let code = csvsqldb_cli_lib::run_with_args([
        "csvsqldb",
        "-p",
        dir.path().to_str().unwrap(),
        "--config",
        "/no/such/config.toml",
        "-e",
        "SELECT 1",
    ]);
    assert_eq!(code, 1);
}
