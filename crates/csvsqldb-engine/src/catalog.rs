//! Catalog (C4): tables, columns, constraints and file mappings, persisted
//! as one JSON file per table/mapping under `<databasePath>/.csvdb/`.
//!
//! Grounded on `original_source/csvsqldb/tabledata.h`/`.cpp` and
//! `file_mapping.h` for the schema/mapping shapes; JSON persistence via
//! `serde`/`serde_json` follows the teacher's `cli-lib/src/baseline.rs`
//! load/save idiom (read-to-string + `serde_json::from_str`, write +
//! `to_string_pretty`) in place of the original's hand-rolled JSON writer.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use csvsqldb_core::ast::{ColumnDef, CreateMappingStmt, CreateTableStmt, MappingDef, TableConstraint};
use csvsqldb_core::symbol::SchemaProvider;
use csvsqldb_core::value::Type;
use csvsqldb_core::{Error, Result};

use crate::helpers::IndexMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableColumnData {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(rename = "primary key")]
    pub primary_key: bool,
    #[serde(rename = "not null")]
    pub not_null: bool,
    pub unique: bool,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub check: String,
    #[serde(default)]
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConstraintData {
    #[serde(rename = "primary keys", default)]
    pub primary_keys: Vec<String>,
    #[serde(rename = "unique keys", default)]
    pub unique_keys: Vec<String>,
    #[serde(default)]
    pub check: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableBody {
    pub name: String,
    pub columns: Vec<TableColumnData>,
    #[serde(default)]
    pub constraints: Vec<ConstraintData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TableFile {
    #[serde(rename = "Table")]
    table: TableBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingEntryData {
    pub pattern: String,
    pub delimiter: String,
    #[serde(rename = "skipFirstLine")]
    pub skip_first_line: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingBody {
    pub name: String,
    pub mappings: Vec<MappingEntryData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct MappingFile {
    #[serde(rename = "Mapping")]
    mapping: MappingBody,
}

impl From<&ColumnDef> for TableColumnData {
    fn from(c: &ColumnDef) -> Self {
        TableColumnData {
            name: c.name.to_string(),
            ty: c.ty.to_string(),
            primary_key: c.primary_key,
            not_null: c.not_null,
            unique: c.unique,
            default: c
                .default
                .as_ref()
                .map(|v| v.to_display_string())
                .unwrap_or_default(),
            check: String::new(),
            length: c.length.unwrap_or(0),
        }
    }
}

fn constraints_to_data(constraints: &[TableConstraint]) -> Vec<ConstraintData> {
    let mut data = ConstraintData::default();
    let mut has_any = false;
    for c in constraints {
        has_any = true;
        match c {
            TableConstraint::PrimaryKey(cols) => {
                data.primary_keys = cols.iter().map(|s| s.to_string()).collect();
            }
            TableConstraint::Unique(cols) => {
                data.unique_keys = cols.iter().map(|s| s.to_string()).collect();
            }
            TableConstraint::Check(_) => {
                data.check = "<expr>".to_string();
            }
        }
    }
    if has_any { vec![data] } else { Vec::new() }
}

/// One CSV-source mapping for a table: a filename glob/regex pattern plus
/// the delimiter and header-skipping behaviour used to parse matching files.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub pattern: String,
    pub delimiter: char,
    pub skip_first_line: bool,
}

/// In-memory catalog, mirrored to `<db_path>/.csvdb/{tables,mappings}/` on
/// every mutation. Read-only during query execution per spec.md §5; schema
/// mutations only happen between statements on the single engine thread.
pub struct Catalog {
    db_path: PathBuf,
    tables: IndexMap<SmolStr, TableBody>,
    mappings: IndexMap<SmolStr, MappingBody>,
}

impl Catalog {
    /// Opens (creating if absent) the catalog rooted at `db_path`, scanning
    /// `tables/` and `mappings/` and reloading every entry found there.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Catalog> {
        let db_path = db_path.as_ref().to_path_buf();
        let root = db_path.join(".csvdb");
        let tables_dir = root.join("tables");
        let mappings_dir = root.join("mappings");
        fs::create_dir_all(&tables_dir)
            .map_err(|e| Error::filesystem(format!("{}: {e}", tables_dir.display())))?;
        fs::create_dir_all(&mappings_dir)
            .map_err(|e| Error::filesystem(format!("{}: {e}", mappings_dir.display())))?;

        let mut tables = IndexMap::default();
        for entry in fs::read_dir(&tables_dir)
            .map_err(|e| Error::filesystem(format!("{}: {e}", tables_dir.display())))?
        {
            let entry = entry.map_err(|e| Error::filesystem(e.to_string()))?;
            let content = fs::read_to_string(entry.path())
                .map_err(|e| Error::filesystem(format!("{}: {e}", entry.path().display())))?;
            let file: TableFile = serde_json::from_str(&content)
                .map_err(|e| Error::json(format!("{}: {e}", entry.path().display())))?;
            tables.insert(SmolStr::new(&file.table.name), file.table);
        }

        let mut mappings = IndexMap::default();
        for entry in fs::read_dir(&mappings_dir)
            .map_err(|e| Error::filesystem(format!("{}: {e}", mappings_dir.display())))?
        {
            let entry = entry.map_err(|e| Error::filesystem(e.to_string()))?;
            let content = fs::read_to_string(entry.path())
                .map_err(|e| Error::filesystem(format!("{}: {e}", entry.path().display())))?;
            let file: MappingFile = serde_json::from_str(&content)
                .map_err(|e| Error::json(format!("{}: {e}", entry.path().display())))?;
            mappings.insert(SmolStr::new(&file.mapping.name), file.mapping);
        }

        Ok(Catalog {
            db_path,
            tables,
            mappings,
        })
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> Result<&TableBody> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::sql(format!("table '{name}' not found")))
    }

    pub fn get_tables(&self) -> impl Iterator<Item = &TableBody> {
        self.tables.values()
    }

    pub fn get_mappings(&self) -> impl Iterator<Item = &MappingBody> {
        self.mappings.values()
    }

    pub fn get_mapping_for_table(&self, table: &str) -> Option<Vec<Mapping>> {
        self.mappings.get(table).map(|body| {
            body.mappings
                .iter()
                .map(|m| Mapping {
                    pattern: m.pattern.clone(),
                    delimiter: m.delimiter.chars().next().unwrap_or(','),
                    skip_first_line: m.skip_first_line,
                })
                .collect()
        })
    }

    pub fn add_table(&mut self, stmt: &CreateTableStmt) -> Result<()> {
        if self.tables.contains_key(stmt.name.as_str()) {
            return Err(Error::sql(format!("table '{}' already exists", stmt.name)));
        }
        let body = TableBody {
            name: stmt.name.to_string(),
            columns: stmt.columns.iter().map(TableColumnData::from).collect(),
            constraints: constraints_to_data(&stmt.constraints),
        };
        self.write_table(&body)?;
        self.tables.insert(stmt.name.clone(), body);
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        if self.tables.shift_remove(name).is_none() {
            return Err(Error::sql(format!("table '{name}' not found")));
        }
        let path = self.table_path(name);
        fs::remove_file(&path).map_err(|e| Error::filesystem(format!("{}: {e}", path.display())))
    }

    pub fn alter_add_column(&mut self, table: &str, column: &ColumnDef) -> Result<()> {
        let body = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::sql(format!("table '{table}' not found")))?;
        body.columns.push(TableColumnData::from(column));
        let snapshot = body.clone();
        self.write_table(&snapshot)
    }

    pub fn alter_drop_column(&mut self, table: &str, column: &str) -> Result<()> {
        let body = self
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::sql(format!("table '{table}' not found")))?;
        let before = body.columns.len();
        body.columns.retain(|c| c.name != column);
        if body.columns.len() == before {
            return Err(Error::sql(format!("column '{column}' not found on '{table}'")));
        }
        let snapshot = body.clone();
        self.write_table(&snapshot)
    }

    pub fn add_mapping(&mut self, stmt: &CreateMappingStmt) -> Result<()> {
        let body = MappingBody {
            name: stmt.table.to_string(),
            mappings: stmt.mappings.iter().map(mapping_def_to_data).collect(),
        };
        self.write_mapping(&body)?;
        self.mappings.insert(stmt.table.clone(), body);
        Ok(())
    }

    pub fn remove_mapping(&mut self, table: &str) -> Result<()> {
        if self.mappings.shift_remove(table).is_none() {
            return Err(Error::mapping(format!("mapping for '{table}' not found")));
        }
        let path = self.mapping_path(table);
        fs::remove_file(&path).map_err(|e| Error::filesystem(format!("{}: {e}", path.display())))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.db_path.join(".csvdb").join("tables").join(name)
    }

    fn mapping_path(&self, name: &str) -> PathBuf {
        self.db_path.join(".csvdb").join("mappings").join(name)
    }

    fn write_table(&self, body: &TableBody) -> Result<()> {
        let path = self.table_path(&body.name);
        let file = TableFile { table: body.clone() };
        let content = serde_json::to_string_pretty(&file).map_err(Error::json)?;
        fs::write(&path, content).map_err(|e| Error::filesystem(format!("{}: {e}", path.display())))
    }

    fn write_mapping(&self, body: &MappingBody) -> Result<()> {
        let path = self.mapping_path(&body.name);
        let file = MappingFile { mapping: body.clone() };
        let content = serde_json::to_string_pretty(&file).map_err(Error::json)?;
        fs::write(&path, content).map_err(|e| Error::filesystem(format!("{}: {e}", path.display())))
    }
}

fn mapping_def_to_data(m: &MappingDef) -> MappingEntryData {
    MappingEntryData {
        pattern: m.pattern.clone(),
        delimiter: m.delimiter.to_string(),
        skip_first_line: m.skip_first_line,
    }
}

impl SchemaProvider for Catalog {
    fn has_table(&self, name: &str) -> bool {
        Catalog::has_table(self, name)
    }

    fn column_type(&self, table: &str, column: &str) -> Option<Type> {
        let body = self.tables.get(table)?;
        let col = body.columns.iter().find(|c| c.name == column)?;
        Type::parse_name(&col.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csvsqldb_core::ast::ColumnDef as CoreColumnDef;

    fn column(name: &str, ty: Type, primary_key: bool) -> CoreColumnDef {
        CoreColumnDef {
            name: SmolStr::new(name),
            ty,
            length: None,
            primary_key,
            unique: false,
            not_null: primary_key,
            default: None,
            check: None,
        }
    }

    #[test]
    fn add_and_reload_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let stmt = CreateTableStmt {
            name: SmolStr::new("EMPLOYEES"),
            columns: vec![column("EMP_NO", Type::Int, true), column("NAME", Type::String, false)],
            constraints: vec![TableConstraint::PrimaryKey(vec![SmolStr::new("EMP_NO")])],
        };
        catalog.add_table(&stmt).unwrap();
        assert!(catalog.has_table("EMPLOYEES"));

        let reopened = Catalog::open(dir.path()).unwrap();
        let body = reopened.get_table("EMPLOYEES").unwrap();
        assert_eq!(body.columns.len(), 2);
        assert_eq!(body.constraints[0].primary_keys, vec!["EMP_NO".to_string()]);
    }

    #[test]
    fn drop_missing_table_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let err = catalog.drop_table("NOPE").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn add_mapping_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let stmt = CreateMappingStmt {
            table: SmolStr::new("EMPLOYEES"),
            mappings: vec![MappingDef {
                pattern: "employees_.*\\.csv".to_string(),
                delimiter: ',',
                skip_first_line: true,
            }],
        };
        catalog.add_mapping(&stmt).unwrap();
        let mappings = catalog.get_mapping_for_table("EMPLOYEES").unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].delimiter, ',');
        assert!(mappings[0].skip_first_line);
    }

    #[test]
    fn column_type_resolves_via_schema_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let stmt = CreateTableStmt {
            name: SmolStr::new("T"),
            columns: vec![column("A", Type::Int, false)],
            constraints: vec![],
        };
        catalog.add_table(&stmt).unwrap();
        assert_eq!(
            SchemaProvider::column_type(&catalog, "T", "A"),
            Some(Type::Int)
        );
    }
}
