//! System tables: read-only virtual tables whose rows are generated on
//! demand by reflecting the catalog and function registry.
//!
//! Grounded on `original_source/csvsqldb/system_tables.cpp`'s six tables and
//! their exact column lists; each `build_*` function here plays the role of
//! one of the original's `DataProvider` subclasses, materializing its rows
//! eagerly into a `SystemTableScanOperatorNode` rather than reflecting the
//! catalog lazily, since nothing here is large enough to warrant streaming.

use smol_str::SmolStr;

use csvsqldb_core::symbol::FunctionSignatures;
use csvsqldb_core::value::{Type, Variant};

use crate::catalog::Catalog;
use crate::functions::{FunctionKind, FunctionRegistry};
use crate::operators::{ColumnInfo, SystemTableScanOperatorNode};

pub const SYSTEM_DUAL: &str = "SYSTEM_DUAL";
pub const SYSTEM_TABLES: &str = "SYSTEM_TABLES";
pub const SYSTEM_COLUMNS: &str = "SYSTEM_COLUMNS";
pub const SYSTEM_FUNCTIONS: &str = "SYSTEM_FUNCTIONS";
pub const SYSTEM_PARAMETERS: &str = "SYSTEM_PARAMETERS";
pub const SYSTEM_MAPPINGS: &str = "SYSTEM_MAPPINGS";

pub const SYSTEM_TABLE_NAMES: &[&str] = &[
    SYSTEM_DUAL,
    SYSTEM_TABLES,
    SYSTEM_COLUMNS,
    SYSTEM_FUNCTIONS,
    SYSTEM_PARAMETERS,
    SYSTEM_MAPPINGS,
];

pub fn is_system_table(name: &str) -> bool {
    SYSTEM_TABLE_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
}

/// The fixed `(name, type)` schema of a system table, without materializing
/// any rows — used by the validator to type-check column references before
/// a query is actually planned.
pub fn static_columns(name: &str) -> Option<Vec<(&'static str, Type)>> {
    let upper = name.to_ascii_uppercase();
    Some(match upper.as_str() {
        SYSTEM_DUAL => vec![("x", Type::Boolean)],
        SYSTEM_TABLES => vec![("NAME", Type::String), ("SYSTEM", Type::Boolean)],
        SYSTEM_COLUMNS => vec![
            ("TABLE_NAME", Type::String),
            ("COLUMN_NAME", Type::String),
            ("TYPE", Type::String),
            ("PRIMARY_KEY", Type::Boolean),
            ("UNIQUE", Type::Boolean),
            ("DEFAULT_VALUE", Type::String),
            ("CHECK", Type::String),
            ("LENGTH", Type::Int),
        ],
        SYSTEM_FUNCTIONS => vec![("NAME", Type::String)],
        SYSTEM_PARAMETERS => vec![
            ("FUNCTION_NAME", Type::String),
            ("TYPE", Type::String),
            ("INDEX", Type::Int),
            ("RETURN", Type::Boolean),
        ],
        SYSTEM_MAPPINGS => vec![("PATTERN", Type::String), ("TABLE_NAME", Type::String)],
        _ => return None,
    })
}

fn cols_of(name: &str) -> Vec<ColumnInfo> {
    static_columns(name)
        .expect("caller only passes known system table names")
        .into_iter()
        .map(|(n, ty)| ColumnInfo { table: None, name: SmolStr::new(n), ty })
        .collect()
}

/// Builds the data-producing node for a system table, or `None` if `name`
/// doesn't name one.
pub fn scan(name: &str, catalog: &Catalog, functions: &FunctionRegistry) -> Option<SystemTableScanOperatorNode> {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        SYSTEM_DUAL => Some(dual()),
        SYSTEM_TABLES => Some(tables(catalog)),
        SYSTEM_COLUMNS => Some(columns(catalog)),
        SYSTEM_FUNCTIONS => Some(functions_table(functions)),
        SYSTEM_PARAMETERS => Some(parameters(functions)),
        SYSTEM_MAPPINGS => Some(mappings(catalog)),
        _ => None,
    }
}

fn dual() -> SystemTableScanOperatorNode {
    SystemTableScanOperatorNode::new(SmolStr::new(SYSTEM_DUAL), cols_of(SYSTEM_DUAL), vec![vec![Variant::boolean(true)]])
}

fn tables(catalog: &Catalog) -> SystemTableScanOperatorNode {
    let mut rows: Vec<Vec<Variant>> = catalog
        .get_tables()
        .map(|t| vec![Variant::string(t.name.clone()), Variant::boolean(false)])
        .collect();
    for name in SYSTEM_TABLE_NAMES {
        rows.push(vec![Variant::string(*name), Variant::boolean(true)]);
    }
    SystemTableScanOperatorNode::new(SmolStr::new(SYSTEM_TABLES), cols_of(SYSTEM_TABLES), rows)
}

fn columns(catalog: &Catalog) -> SystemTableScanOperatorNode {
    let mut rows = Vec::new();
    for table in catalog.get_tables() {
        for c in &table.columns {
            rows.push(vec![
                Variant::string(table.name.clone()),
                Variant::string(c.name.clone()),
                Variant::string(c.ty.clone()),
                Variant::boolean(c.primary_key),
                Variant::boolean(c.unique),
                Variant::string(c.default.clone()),
                Variant::string(c.check.clone()),
                Variant::int(c.length as i64),
            ]);
        }
    }
    SystemTableScanOperatorNode::new(SmolStr::new(SYSTEM_COLUMNS), cols_of(SYSTEM_COLUMNS), rows)
}

fn functions_table(functions: &FunctionRegistry) -> SystemTableScanOperatorNode {
    let rows = functions.all().map(|f| vec![Variant::string(f.name)]).collect();
    SystemTableScanOperatorNode::new(SmolStr::new(SYSTEM_FUNCTIONS), cols_of(SYSTEM_FUNCTIONS), rows)
}

fn parameters(functions: &FunctionRegistry) -> SystemTableScanOperatorNode {
    let mut rows = Vec::new();
    for f in functions.all() {
        for idx in 0..f.max_arity {
            rows.push(vec![
                Variant::string(f.name),
                Variant::string("ANY"),
                Variant::int(idx as i64),
                Variant::boolean(false),
            ]);
        }
        let return_ty = match f.kind {
            FunctionKind::Scalar => functions
                .return_type(f.name, &[])
                .map(|t| t.to_string())
                .unwrap_or_else(|| "ANY".to_string()),
            FunctionKind::Aggregate => "ANY".to_string(),
        };
        rows.push(vec![
            Variant::string(f.name),
            Variant::string(return_ty),
            Variant::int(-1),
            Variant::boolean(true),
        ]);
    }
    SystemTableScanOperatorNode::new(SmolStr::new(SYSTEM_PARAMETERS), cols_of(SYSTEM_PARAMETERS), rows)
}

fn mappings(catalog: &Catalog) -> SystemTableScanOperatorNode {
    let mut rows = Vec::new();
    for body in catalog.get_mappings() {
        for entry in &body.mappings {
            rows.push(vec![Variant::string(entry.pattern.clone()), Variant::string(body.name.clone())]);
        }
    }
    SystemTableScanOperatorNode::new(SmolStr::new(SYSTEM_MAPPINGS), cols_of(SYSTEM_MAPPINGS), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::RowOperatorNode;

    #[test]
    fn dual_has_one_row() {
        let mut node = dual();
        node.connect().unwrap();
        assert!(node.next_row().unwrap().is_some());
        assert!(node.next_row().unwrap().is_none());
    }

    #[test]
    fn tables_lists_system_tables_even_when_catalog_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let mut node = tables(&catalog);
        node.connect().unwrap();
        let mut names = Vec::new();
        while let Some(row) = node.next_row().unwrap() {
            names.push(row[0].as_str().unwrap().to_string());
        }
        assert!(names.contains(&SYSTEM_DUAL.to_string()));
    }

    #[test]
    fn functions_table_lists_builtins() {
        let registry = FunctionRegistry::new();
        let mut node = functions_table(&registry);
        node.connect().unwrap();
        let mut names = Vec::new();
        while let Some(row) = node.next_row().unwrap() {
            names.push(row[0].as_str().unwrap().to_string());
        }
        assert!(names.contains(&"UPPER".to_string()));
        assert!(names.contains(&"SUM".to_string()));
    }
}
