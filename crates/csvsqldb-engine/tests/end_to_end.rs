//! End-to-end scenarios against the public `ExecutionEngine` API: catalog
//! persistence across a reopen, a hash join between two mapped CSV tables,
//! and a GROUP BY with an aggregate, each against real files in a scratch
//! directory.

use std::fs;

use csvsqldb_core::value::Variant;
use csvsqldb_engine::engine::{EngineConfig, ExecutionEngine, Outcome};

fn rows_of(results: &[csvsqldb_engine::engine::ExecutionResult]) -> &Vec<Vec<Variant>> {
    match &results[0].outcome {
        Outcome::Rows { rows, .. } => rows,
        Outcome::Message(m) => panic!("expected rows, got message: {m}"),
    }
}

#[test]
fn catalog_and_data_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut engine = ExecutionEngine::open(dir.path(), EngineConfig::default()).unwrap();
        engine
            .execute("CREATE TABLE employees (id INT PRIMARY KEY, name STRING, dept_id INT)")
            .unwrap();
        engine.execute("CREATE MAPPING employees (employees.csv)").unwrap();
        fs::write(dir.path().join("employees.csv"), "1,Alice,10\n2,Bob,20\n3,Carol,10\n").unwrap();
    }

    // Reopening must pick the catalog back up off disk rather than starting empty.
    let mut engine = ExecutionEngine::open(dir.path(), EngineConfig::default()).unwrap();
    let results = engine.execute("SELECT name FROM employees WHERE dept_id = 10").unwrap();
    let rows = rows_of(&results);
    assert_eq!(rows.len(), 2);
}

#[test]
fn inner_join_across_two_mapped_tables() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = ExecutionEngine::open(dir.path(), EngineConfig::default()).unwrap();

    engine
        .execute("CREATE TABLE employees (id INT PRIMARY KEY, name STRING, dept_id INT)")
        .unwrap();
    engine.execute("CREATE MAPPING employees (employees.csv)").unwrap();
    fs::write(dir.path().join("employees.csv"), "1,Alice,10\n2,Bob,20\n3,Carol,10\n").unwrap();

    engine
        .execute("CREATE TABLE departments (id INT PRIMARY KEY, name STRING)")
        .unwrap();
    engine.execute("CREATE MAPPING departments (departments.csv)").unwrap();
    fs::write(dir.path().join("departments.csv"), "10,Engineering\n20,Sales\n").unwrap();

    let results = engine
        .execute(
            "SELECT employees.name, departments.name \
             FROM employees JOIN departments ON employees.dept_id = departments.id \
             WHERE departments.name = 'Engineering'",
        )
        .unwrap();
    let rows = rows_of(&results);
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row[1].as_str().unwrap(), "Engineering");
    }
}

#[test]
fn group_by_with_count_and_sum() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = ExecutionEngine::open(dir.path(), EngineConfig::default()).unwrap();

    engine
        .execute("CREATE TABLE sales (id INT PRIMARY KEY, region STRING, amount REAL)")
        .unwrap();
    engine.execute("CREATE MAPPING sales (sales.csv)").unwrap();
    fs::write(
        dir.path().join("sales.csv"),
        "1,West,100.0\n2,East,50.0\n3,West,200.0\n4,East,25.0\n",
    )
    .unwrap();

    let results = engine
        .execute("SELECT region, COUNT(*), SUM(amount) FROM sales GROUP BY region ORDER BY region")
        .unwrap();
    let rows = rows_of(&results);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0].as_str().unwrap(), "East");
    assert_eq!(rows[0][1], Variant::int(2));
    assert_eq!(rows[1][0].as_str().unwrap(), "West");
    assert_eq!(rows[1][1], Variant::int(2));
}

#[test]
fn date_subtraction_yields_day_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = ExecutionEngine::open(dir.path(), EngineConfig::default()).unwrap();

    let results = engine
        .execute("SELECT DATE'2020-01-01' - DATE'2019-01-01' FROM SYSTEM_DUAL")
        .unwrap();
    let rows = rows_of(&results);
    assert_eq!(rows[0][0], Variant::int(365));
}
