//! Physical operator tree (C11): a pull-based iterator chain, one struct per
//! relational operation, wired together by `engine.rs`'s plan builder.
//!
//! Grounded on `original_source/csvsqldb/operatornodes/*` for the node split
//! (table scan / selection / projection / sort / grouping / join / union /
//! limit / output) and on its `dump()` convention of a short self-description
//! with each child's dump nested under a `-->` marker.

use std::collections::HashSet;
use std::path::PathBuf;

use smol_str::SmolStr;

use csvsqldb_core::block::DEFAULT_BLOCK_CAPACITY;
use csvsqldb_core::value::{Type, Variant};
use csvsqldb_core::{Error, Result};

use crate::catalog::Mapping;
use crate::csv_reader::{CsvBlockReader, DEFAULT_QUEUE_DEPTH};
use crate::functions::FunctionRegistry;
use crate::iterators::{
    group_key as dedup_key, AggregateSpec, BlockIterator, BlockProducer, CachingBlockIterator,
    GroupKey as DedupKey, GroupingBlockIterator, HashingBlockIterator, SortKey,
    SortingBlockIterator,
};
use crate::stack_machine::{self, Program};

fn not_connected() -> Error {
    Error::invalid_operation("operator pulled before connect")
}

/// One output column's name, owning table (if any) and scalar type. Built by
/// every node's `connect()` and consumed by the next node up the tree to
/// resolve identifiers to row indices.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub table: Option<SmolStr>,
    pub name: SmolStr,
    pub ty: Type,
}

/// A node in the physical plan. `connect()` must run exactly once, bottom-up,
/// before any `next_row()` call; it fixes the node's output schema and
/// resolves/pre-compiles anything that depends on the child's schema.
pub trait RowOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>>;
    fn next_row(&mut self) -> Result<Option<Vec<Variant>>>;
    fn dump(&self) -> String;
}

fn append_children(own_line: String, children: &[String]) -> String {
    let mut out = own_line;
    for child in children {
        for line in child.lines() {
            out.push_str("\n--> ");
            out.push_str(line);
        }
    }
    out
}

fn resolve_slots(program: &Program, cols: &[ColumnInfo]) -> Result<Vec<usize>> {
    program
        .variables
        .iter()
        .map(|(prefix, ident)| {
            cols.iter()
                .position(|c| {
                    c.name == *ident
                        && match prefix {
                            Some(p) => c.table.as_deref() == Some(p.as_str()),
                            None => true,
                        }
                })
                .ok_or_else(|| {
                    let qualified = match prefix {
                        Some(p) => format!("{p}.{ident}"),
                        None => ident.to_string(),
                    };
                    Error::sql(format!("unknown column '{qualified}'"))
                })
        })
        .collect()
}

fn bind(row: &[Variant], slots: &[usize]) -> Vec<Variant> {
    slots.iter().map(|&i| row[i].clone()).collect()
}

// ---------------------------------------------------------------------
// Table scans
// ---------------------------------------------------------------------

/// Concatenates the block streams of every file matching a table's mapping
/// pattern into one logical stream. Only the last file's last block keeps
/// its end-of-stream marker; every other file's is cleared via
/// `Block::clear_end` so the consuming `BlockIterator` doesn't stop early.
struct MultiFileBlockProducer {
    columns: Vec<(SmolStr, Type)>,
    delimiter: char,
    skip_first_line: bool,
    pending: Vec<PathBuf>,
    current: Option<CsvBlockReader>,
}

impl MultiFileBlockProducer {
    fn new(
        columns: Vec<(SmolStr, Type)>,
        delimiter: char,
        skip_first_line: bool,
        files: Vec<PathBuf>,
    ) -> MultiFileBlockProducer {
        MultiFileBlockProducer {
            columns,
            delimiter,
            skip_first_line,
            pending: files,
            current: None,
        }
    }
}

impl BlockProducer for MultiFileBlockProducer {
    fn get_next_block(&mut self) -> Result<Option<csvsqldb_core::block::Block>> {
        loop {
            if self.current.is_none() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let path = self.pending.remove(0);
                let reader = CsvBlockReader::spawn(
                    path,
                    self.columns.clone(),
                    self.delimiter,
                    self.skip_first_line,
                    DEFAULT_BLOCK_CAPACITY,
                    DEFAULT_QUEUE_DEPTH,
                )?;
                self.current = Some(reader);
            }
            let reader = self.current.as_mut().expect("just set");
            match reader.get_next_block()? {
                Some(mut block) => {
                    if block.is_end() {
                        self.current = None;
                        if !self.pending.is_empty() {
                            block.clear_end();
                        }
                    }
                    return Ok(Some(block));
                }
                None => {
                    self.current = None;
                    continue;
                }
            }
        }
    }
}

/// Scans every file matching a table's mapping pattern under the database's
/// data directory, in filename order.
pub struct TableScanOperatorNode {
    table: SmolStr,
    alias: Option<SmolStr>,
    columns: Vec<(SmolStr, Type)>,
    data_dir: PathBuf,
    mappings: Vec<Mapping>,
    iter: Option<BlockIterator<MultiFileBlockProducer>>,
    output: Option<Vec<ColumnInfo>>,
}

impl TableScanOperatorNode {
    pub fn new(
        table: SmolStr,
        alias: Option<SmolStr>,
        columns: Vec<(SmolStr, Type)>,
        data_dir: PathBuf,
        mappings: Vec<Mapping>,
    ) -> TableScanOperatorNode {
        TableScanOperatorNode {
            table,
            alias,
            columns,
            data_dir,
            mappings,
            iter: None,
            output: None,
        }
    }

    fn resolve_files(&self) -> Result<(Vec<PathBuf>, char, bool)> {
        let mapping = self
            .mappings
            .first()
            .ok_or_else(|| Error::mapping(format!("no mapping registered for table '{}'", self.table)))?;
        let re = regex::Regex::new(&mapping.pattern)
            .map_err(|e| Error::mapping(format!("invalid mapping pattern: {e}")))?;
        let entries = std::fs::read_dir(&self.data_dir)
            .map_err(|e| Error::filesystem(format!("{}: {e}", self.data_dir.display())))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::filesystem(e.to_string()))?;
            let name = entry.file_name();
            if re.is_match(&name.to_string_lossy()) {
                files.push(entry.path());
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(Error::mapping(format!(
                "no file matches mapping for table '{}'",
                self.table
            )));
        }
        Ok((files, mapping.delimiter, mapping.skip_first_line))
    }
}

impl RowOperatorNode for TableScanOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        for (_, ty) in &self.columns {
            if *ty == Type::None {
                return Err(Error::exception(format!(
                    "column type unsupported in table '{}'",
                    self.table
                )));
            }
        }
        let (files, delimiter, skip_first_line) = self.resolve_files()?;
        let producer = MultiFileBlockProducer::new(self.columns.clone(), delimiter, skip_first_line, files);
        self.iter = Some(BlockIterator::new(producer, self.columns.len()));
        let label = self.alias.clone().unwrap_or_else(|| self.table.clone());
        let output: Vec<ColumnInfo> = self
            .columns
            .iter()
            .map(|(name, ty)| ColumnInfo {
                table: Some(label.clone()),
                name: name.clone(),
                ty: *ty,
            })
            .collect();
        self.output = Some(output.clone());
        Ok(output)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        self.iter.as_mut().ok_or_else(not_connected)?.next_row()
    }

    fn dump(&self) -> String {
        format!("TableScan {}", self.table)
    }
}

/// A scan over an in-memory row set, used for `SYSTEM_*` catalog tables.
pub struct SystemTableScanOperatorNode {
    name: SmolStr,
    columns: Vec<ColumnInfo>,
    rows: std::vec::IntoIter<Vec<Variant>>,
    connected: bool,
}

impl SystemTableScanOperatorNode {
    pub fn new(name: SmolStr, columns: Vec<ColumnInfo>, rows: Vec<Vec<Variant>>) -> SystemTableScanOperatorNode {
        SystemTableScanOperatorNode {
            name,
            columns,
            rows: rows.into_iter(),
            connected: false,
        }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }
}

impl RowOperatorNode for SystemTableScanOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        self.connected = true;
        Ok(self.columns.clone())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        if !self.connected {
            return Err(not_connected());
        }
        Ok(self.rows.next())
    }

    fn dump(&self) -> String {
        format!("SystemTableScan {}", self.name)
    }
}

// ---------------------------------------------------------------------
// Selection / projection
// ---------------------------------------------------------------------

/// Filters rows by a compiled boolean predicate, three-valued: a `NULL`
/// result drops the row same as `FALSE`.
pub struct SelectOperatorNode {
    child: Box<dyn RowOperatorNode>,
    program: Program,
    registry: FunctionRegistry,
    slots: Option<Vec<usize>>,
}

impl SelectOperatorNode {
    pub fn new(child: Box<dyn RowOperatorNode>, program: Program) -> SelectOperatorNode {
        SelectOperatorNode {
            child,
            program,
            registry: FunctionRegistry::new(),
            slots: None,
        }
    }
}

impl RowOperatorNode for SelectOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let cols = self.child.connect()?;
        self.slots = Some(resolve_slots(&self.program, &cols)?);
        Ok(cols)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let slots = self.slots.as_ref().ok_or_else(not_connected)?;
        loop {
            match self.child.next_row()? {
                Some(row) => {
                    let vars = bind(&row, slots);
                    let keep = stack_machine::eval(&self.program, &vars, &self.registry)?;
                    if !keep.is_null() && keep.as_bool().unwrap_or(false) {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn dump(&self) -> String {
        append_children("Selection".to_string(), &[self.child.dump()])
    }
}

/// Reorders/subsets the child's columns without evaluating expressions.
pub struct ProjectionOperatorNode {
    child: Box<dyn RowOperatorNode>,
    indices: Vec<usize>,
}

impl ProjectionOperatorNode {
    pub fn new(child: Box<dyn RowOperatorNode>, indices: Vec<usize>) -> ProjectionOperatorNode {
        ProjectionOperatorNode { child, indices }
    }
}

impl RowOperatorNode for ProjectionOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let cols = self.child.connect()?;
        Ok(self.indices.iter().map(|&i| cols[i].clone()).collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        match self.child.next_row()? {
            Some(row) => Ok(Some(bind(&row, &self.indices))),
            None => Ok(None),
        }
    }

    fn dump(&self) -> String {
        append_children("Projection".to_string(), &[self.child.dump()])
    }
}

/// One item of a `SELECT` list: a plain column copy, a `table.*` expansion,
/// or an arbitrary compiled expression.
pub enum ProjectionItem {
    Column { input_index: usize, output_name: SmolStr },
    TableStar { table: SmolStr },
    Expr { program: Program, output_name: SmolStr, output_type: Type },
}

enum ResolvedItem {
    Copy(usize),
    Eval(Program, Vec<usize>),
}

/// The general `SELECT` projection: copies, `table.*` expansions and
/// evaluated expressions, resolved against the child's schema at `connect()`.
pub struct ExtendedProjectionOperatorNode {
    child: Box<dyn RowOperatorNode>,
    items: Vec<ProjectionItem>,
    registry: FunctionRegistry,
    resolved: Option<Vec<ResolvedItem>>,
}

impl ExtendedProjectionOperatorNode {
    pub fn new(child: Box<dyn RowOperatorNode>, items: Vec<ProjectionItem>) -> ExtendedProjectionOperatorNode {
        ExtendedProjectionOperatorNode {
            child,
            items,
            registry: FunctionRegistry::new(),
            resolved: None,
        }
    }
}

impl RowOperatorNode for ExtendedProjectionOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let cols = self.child.connect()?;
        let mut resolved = Vec::new();
        let mut output = Vec::new();
        for item in &self.items {
            match item {
                ProjectionItem::Column { input_index, output_name } => {
                    resolved.push(ResolvedItem::Copy(*input_index));
                    output.push(ColumnInfo {
                        table: cols[*input_index].table.clone(),
                        name: output_name.clone(),
                        ty: cols[*input_index].ty,
                    });
                }
                ProjectionItem::TableStar { table } => {
                    let mut any = false;
                    for (i, c) in cols.iter().enumerate() {
                        if c.table.as_deref() == Some(table.as_str()) {
                            any = true;
                            resolved.push(ResolvedItem::Copy(i));
                            output.push(c.clone());
                        }
                    }
                    if !any {
                        return Err(Error::sql(format!("unknown table '{table}' in projection")));
                    }
                }
                ProjectionItem::Expr { program, output_name, output_type } => {
                    let slots = resolve_slots(program, &cols)?;
                    resolved.push(ResolvedItem::Eval(program.clone(), slots));
                    output.push(ColumnInfo {
                        table: None,
                        name: output_name.clone(),
                        ty: *output_type,
                    });
                }
            }
        }
        self.resolved = Some(resolved);
        Ok(output)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let resolved = self.resolved.as_ref().ok_or_else(not_connected)?;
        let row = match self.child.next_row()? {
            Some(row) => row,
            None => return Ok(None),
        };
        let mut out = Vec::with_capacity(resolved.len());
        for item in resolved {
            match item {
                ResolvedItem::Copy(i) => out.push(row[*i].clone()),
                ResolvedItem::Eval(program, slots) => {
                    let vars = bind(&row, slots);
                    out.push(stack_machine::eval(program, &vars, &self.registry)?);
                }
            }
        }
        Ok(Some(out))
    }

    fn dump(&self) -> String {
        append_children("ExtendedProjection".to_string(), &[self.child.dump()])
    }
}

// ---------------------------------------------------------------------
// Sort / grouping
// ---------------------------------------------------------------------

/// Orders the child's rows by a list of `(column, ascending)` keys, nulls
/// sorting low for ascending keys.
pub struct SortOperatorNode {
    child: Box<dyn RowOperatorNode>,
    order_by: Vec<SortKey>,
    iter: Option<SortingBlockIterator>,
}

impl SortOperatorNode {
    pub fn new(child: Box<dyn RowOperatorNode>, order_by: Vec<SortKey>) -> SortOperatorNode {
        SortOperatorNode { child, order_by, iter: None }
    }
}

impl RowOperatorNode for SortOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let cols = self.child.connect()?;
        self.iter = Some(SortingBlockIterator::new(cols.len()));
        Ok(cols)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let child = &mut self.child;
        let order_by = &self.order_by;
        let iter = self.iter.as_mut().ok_or_else(not_connected)?;
        iter.prepare(|| child.next_row(), order_by)?;
        iter.next_row()
    }

    fn dump(&self) -> String {
        append_children("OrderBy".to_string(), &[self.child.dump()])
    }
}

/// Groups by a (possibly empty — a bare aggregate query groups everything
/// into one row) list of columns and steps one accumulator per aggregate
/// expression per group.
pub struct GroupingOperatorNode {
    child: Box<dyn RowOperatorNode>,
    group_columns: Vec<usize>,
    aggregates: Vec<AggregateSpec>,
    group_output: Vec<ColumnInfo>,
    aggregate_output: Vec<ColumnInfo>,
    registry: FunctionRegistry,
    iter: Option<GroupingBlockIterator>,
}

impl GroupingOperatorNode {
    pub fn new(
        child: Box<dyn RowOperatorNode>,
        group_columns: Vec<usize>,
        aggregates: Vec<AggregateSpec>,
        group_output: Vec<ColumnInfo>,
        aggregate_output: Vec<ColumnInfo>,
    ) -> GroupingOperatorNode {
        GroupingOperatorNode {
            child,
            group_columns,
            aggregates,
            group_output,
            aggregate_output,
            registry: FunctionRegistry::new(),
            iter: None,
        }
    }
}

impl RowOperatorNode for GroupingOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        self.child.connect()?;
        self.iter = Some(GroupingBlockIterator::new(
            self.group_columns.clone(),
            self.aggregates.clone(),
        ));
        Ok(self
            .group_output
            .iter()
            .cloned()
            .chain(self.aggregate_output.iter().cloned())
            .collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let child = &mut self.child;
        let registry = &self.registry;
        let iter = self.iter.as_mut().ok_or_else(not_connected)?;
        iter.consume(registry, || child.next_row())?;
        iter.next_row()
    }

    fn dump(&self) -> String {
        let label = if self.group_columns.is_empty() {
            "Aggregation".to_string()
        } else {
            "Grouping".to_string()
        };
        append_children(label, &[self.child.dump()])
    }
}

// ---------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------

/// Unconditional cross product: every left row paired with every right row.
pub struct CrossJoinOperatorNode {
    left: Box<dyn RowOperatorNode>,
    right: Box<dyn RowOperatorNode>,
    right_cache: Option<CachingBlockIterator>,
    left_row: Option<Vec<Variant>>,
}

impl CrossJoinOperatorNode {
    pub fn new(left: Box<dyn RowOperatorNode>, right: Box<dyn RowOperatorNode>) -> CrossJoinOperatorNode {
        CrossJoinOperatorNode { left, right, right_cache: None, left_row: None }
    }
}

impl RowOperatorNode for CrossJoinOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let left_cols = self.left.connect()?;
        let right_cols = self.right.connect()?;
        let mut cache = CachingBlockIterator::new(right_cols.len());
        let right = &mut self.right;
        cache.materialize(|| right.next_row())?;
        self.right_cache = Some(cache);
        Ok(left_cols.into_iter().chain(right_cols).collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let cache = self.right_cache.as_mut().ok_or_else(not_connected)?;
        loop {
            if self.left_row.is_none() {
                self.left_row = self.left.next_row()?;
                if self.left_row.is_none() {
                    return Ok(None);
                }
                cache.rewind();
            }
            match cache.next_row()? {
                Some(right_row) => {
                    let mut out = self.left_row.clone().expect("checked above");
                    out.extend(right_row);
                    return Ok(Some(out));
                }
                None => self.left_row = None,
            }
        }
    }

    fn dump(&self) -> String {
        append_children("CrossJoin".to_string(), &[self.left.dump(), self.right.dump()])
    }
}

/// Equi-join on one key column pair. Hashes the right child once at
/// `connect()`, then probes it once per left row, matching the original
/// engine's default of building the hash table over its right input.
pub struct InnerHashJoinOperatorNode {
    left: Box<dyn RowOperatorNode>,
    right: Box<dyn RowOperatorNode>,
    left_key: usize,
    right_key: usize,
    hash: Option<HashingBlockIterator>,
    left_row: Option<Vec<Variant>>,
}

impl InnerHashJoinOperatorNode {
    pub fn new(
        left: Box<dyn RowOperatorNode>,
        right: Box<dyn RowOperatorNode>,
        left_key: usize,
        right_key: usize,
    ) -> InnerHashJoinOperatorNode {
        InnerHashJoinOperatorNode { left, right, left_key, right_key, hash: None, left_row: None }
    }
}

impl RowOperatorNode for InnerHashJoinOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let left_cols = self.left.connect()?;
        let right_cols = self.right.connect()?;
        let mut hash = HashingBlockIterator::new(self.right_key);
        let right = &mut self.right;
        hash.build(|| right.next_row())?;
        self.hash = Some(hash);
        Ok(left_cols.into_iter().chain(right_cols).collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let hash = self.hash.as_mut().ok_or_else(not_connected)?;
        loop {
            if self.left_row.is_none() {
                match self.left.next_row()? {
                    Some(row) => {
                        hash.set_context_for_key_value(&row[self.left_key]);
                        self.left_row = Some(row);
                    }
                    None => return Ok(None),
                }
            }
            match hash.get_next_key_value_row() {
                Some(right_row) => {
                    let mut out = self.left_row.clone().expect("checked above");
                    out.extend(right_row);
                    return Ok(Some(out));
                }
                None => self.left_row = None,
            }
        }
    }

    fn dump(&self) -> String {
        append_children("InnerHashJoin".to_string(), &[self.left.dump(), self.right.dump()])
    }
}

/// Preserves every left row, padding unmatched ones with `NULL` right-side
/// values; driven by the left child to keep its row order.
pub struct LeftJoinOperatorNode {
    left: Box<dyn RowOperatorNode>,
    right: Box<dyn RowOperatorNode>,
    left_key: usize,
    right_key: usize,
    right_width: usize,
    hash: Option<HashingBlockIterator>,
    left_row: Option<Vec<Variant>>,
    matched_any: bool,
}

impl LeftJoinOperatorNode {
    pub fn new(
        left: Box<dyn RowOperatorNode>,
        right: Box<dyn RowOperatorNode>,
        left_key: usize,
        right_key: usize,
    ) -> LeftJoinOperatorNode {
        LeftJoinOperatorNode {
            left,
            right,
            left_key,
            right_key,
            right_width: 0,
            hash: None,
            left_row: None,
            matched_any: false,
        }
    }
}

impl RowOperatorNode for LeftJoinOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let left_cols = self.left.connect()?;
        let right_cols = self.right.connect()?;
        self.right_width = right_cols.len();
        let mut hash = HashingBlockIterator::new(self.right_key);
        let right = &mut self.right;
        hash.build(|| right.next_row())?;
        self.hash = Some(hash);
        Ok(left_cols.into_iter().chain(right_cols).collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let hash = self.hash.as_mut().ok_or_else(not_connected)?;
        loop {
            if self.left_row.is_none() {
                match self.left.next_row()? {
                    Some(row) => {
                        hash.set_context_for_key_value(&row[self.left_key]);
                        self.matched_any = false;
                        self.left_row = Some(row);
                    }
                    None => return Ok(None),
                }
            }
            match hash.get_next_key_value_row() {
                Some(right_row) => {
                    self.matched_any = true;
                    let mut out = self.left_row.clone().expect("checked above");
                    out.extend(right_row);
                    return Ok(Some(out));
                }
                None => {
                    let left_row = self.left_row.take().expect("checked above");
                    if !self.matched_any {
                        let mut out = left_row;
                        out.extend((0..self.right_width).map(|_| Variant::None));
                        return Ok(Some(out));
                    }
                }
            }
        }
    }

    fn dump(&self) -> String {
        append_children("LeftJoin".to_string(), &[self.left.dump(), self.right.dump()])
    }
}

/// Mirror of `LeftJoinOperatorNode`: preserves every right row, hashing the
/// left side instead and padding unmatched right rows with `NULL` left
/// values. Output column order stays left-then-right.
pub struct RightJoinOperatorNode {
    left: Box<dyn RowOperatorNode>,
    right: Box<dyn RowOperatorNode>,
    left_key: usize,
    right_key: usize,
    left_width: usize,
    hash: Option<HashingBlockIterator>,
    right_row: Option<Vec<Variant>>,
    matched_any: bool,
}

impl RightJoinOperatorNode {
    pub fn new(
        left: Box<dyn RowOperatorNode>,
        right: Box<dyn RowOperatorNode>,
        left_key: usize,
        right_key: usize,
    ) -> RightJoinOperatorNode {
        RightJoinOperatorNode {
            left,
            right,
            left_key,
            right_key,
            left_width: 0,
            hash: None,
            right_row: None,
            matched_any: false,
        }
    }
}

impl RowOperatorNode for RightJoinOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let left_cols = self.left.connect()?;
        let right_cols = self.right.connect()?;
        self.left_width = left_cols.len();
        let mut hash = HashingBlockIterator::new(self.left_key);
        let left = &mut self.left;
        hash.build(|| left.next_row())?;
        self.hash = Some(hash);
        Ok(left_cols.into_iter().chain(right_cols).collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        let hash = self.hash.as_mut().ok_or_else(not_connected)?;
        loop {
            if self.right_row.is_none() {
                match self.right.next_row()? {
                    Some(row) => {
                        hash.set_context_for_key_value(&row[self.right_key]);
                        self.matched_any = false;
                        self.right_row = Some(row);
                    }
                    None => return Ok(None),
                }
            }
            match hash.get_next_key_value_row() {
                Some(left_row) => {
                    self.matched_any = true;
                    let mut out = left_row;
                    out.extend(self.right_row.clone().expect("checked above"));
                    return Ok(Some(out));
                }
                None => {
                    let right_row = self.right_row.take().expect("checked above");
                    if !self.matched_any {
                        let mut out: Vec<Variant> = (0..self.left_width).map(|_| Variant::None).collect();
                        out.extend(right_row);
                        return Ok(Some(out));
                    }
                }
            }
        }
    }

    fn dump(&self) -> String {
        append_children("RightJoin".to_string(), &[self.left.dump(), self.right.dump()])
    }
}

// ---------------------------------------------------------------------
// Set operations / limit
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersect,
    Except,
}

/// `UNION`/`INTERSECT`/`EXCEPT`, with or without `DISTINCT`. `INTERSECT` and
/// `EXCEPT` need the right side's full key set up front; `UNION` can run
/// without ever materializing anything but its own `DISTINCT` seen-set.
pub struct SetOpOperatorNode {
    op: SetOp,
    distinct: bool,
    left: Box<dyn RowOperatorNode>,
    right: Box<dyn RowOperatorNode>,
    result: Option<std::vec::IntoIter<Vec<Variant>>>,
}

impl SetOpOperatorNode {
    pub fn new(
        op: SetOp,
        distinct: bool,
        left: Box<dyn RowOperatorNode>,
        right: Box<dyn RowOperatorNode>,
    ) -> SetOpOperatorNode {
        SetOpOperatorNode { op, distinct, left, right, result: None }
    }

    fn materialize(&mut self) -> Result<Vec<Vec<Variant>>> {
        let mut right_keys: HashSet<Vec<DedupKey>> = HashSet::new();
        if matches!(self.op, SetOp::Intersect | SetOp::Except) {
            while let Some(row) = self.right.next_row()? {
                right_keys.insert(row.iter().map(dedup_key).collect());
            }
        }
        let mut out = Vec::new();
        let mut seen: HashSet<Vec<DedupKey>> = HashSet::new();
        match self.op {
            SetOp::Union => {
                while let Some(row) = self.left.next_row()? {
                    let key: Vec<DedupKey> = row.iter().map(dedup_key).collect();
                    if !self.distinct || seen.insert(key) {
                        out.push(row);
                    }
                }
                while let Some(row) = self.right.next_row()? {
                    let key: Vec<DedupKey> = row.iter().map(dedup_key).collect();
                    if !self.distinct || seen.insert(key) {
                        out.push(row);
                    }
                }
            }
            SetOp::Intersect => {
                while let Some(row) = self.left.next_row()? {
                    let key: Vec<DedupKey> = row.iter().map(dedup_key).collect();
                    if right_keys.contains(&key) && (!self.distinct || seen.insert(key)) {
                        out.push(row);
                    }
                }
            }
            SetOp::Except => {
                while let Some(row) = self.left.next_row()? {
                    let key: Vec<DedupKey> = row.iter().map(dedup_key).collect();
                    if !right_keys.contains(&key) && (!self.distinct || seen.insert(key)) {
                        out.push(row);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl RowOperatorNode for SetOpOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let left_cols = self.left.connect()?;
        self.right.connect()?;
        Ok(left_cols)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        if self.result.is_none() {
            let rows = self.materialize()?;
            self.result = Some(rows.into_iter());
        }
        Ok(self.result.as_mut().expect("just set").next())
    }

    fn dump(&self) -> String {
        let label = match (self.op, self.distinct) {
            (SetOp::Union, false) => "UnionAll",
            (SetOp::Union, true) => "Union",
            (SetOp::Intersect, false) => "IntersectAll",
            (SetOp::Intersect, true) => "Intersect",
            (SetOp::Except, false) => "ExceptAll",
            (SetOp::Except, true) => "Except",
        };
        append_children(label.to_string(), &[self.left.dump(), self.right.dump()])
    }
}

/// `OFFSET`/`LIMIT` over the child stream.
pub struct LimitOperatorNode {
    child: Box<dyn RowOperatorNode>,
    offset: usize,
    limit: Option<usize>,
    skipped: usize,
    emitted: usize,
    connected: bool,
}

impl LimitOperatorNode {
    pub fn new(child: Box<dyn RowOperatorNode>, offset: usize, limit: Option<usize>) -> LimitOperatorNode {
        LimitOperatorNode { child, offset, limit, skipped: 0, emitted: 0, connected: false }
    }
}

impl RowOperatorNode for LimitOperatorNode {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        let cols = self.child.connect()?;
        self.connected = true;
        Ok(cols)
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        if !self.connected {
            return Err(not_connected());
        }
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return Ok(None);
            }
        }
        while self.skipped < self.offset {
            match self.child.next_row()? {
                Some(_) => self.skipped += 1,
                None => return Ok(None),
            }
        }
        match self.child.next_row()? {
            Some(row) => {
                self.emitted += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn dump(&self) -> String {
        append_children(
            format!("Limit offset={} limit={:?}", self.offset, self.limit),
            &[self.child.dump()],
        )
    }
}

// ---------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------

fn csv_quote(field: &str, delimiter: char) -> String {
    if field.contains(delimiter) || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Root sink: pulls every row from its child, formats it through
/// `Variant::to_display_string`, and writes a delimited line per row, with
/// an optional header row of column names.
pub struct OutputRowOperatorNode<W: std::io::Write> {
    child: Box<dyn RowOperatorNode>,
    writer: W,
    delimiter: char,
    emit_header: bool,
}

impl<W: std::io::Write> OutputRowOperatorNode<W> {
    pub fn new(child: Box<dyn RowOperatorNode>, writer: W, delimiter: char, emit_header: bool) -> Self {
        OutputRowOperatorNode { child, writer, delimiter, emit_header }
    }

    /// Runs the plan to completion, returning the number of rows written.
    pub fn run(&mut self) -> Result<usize> {
        let cols = self.child.connect()?;
        if self.emit_header {
            let header: Vec<String> = cols.iter().map(|c| c.name.to_string()).collect();
            writeln!(self.writer, "{}", header.join(&self.delimiter.to_string()))
                .map_err(|e| Error::filesystem(e.to_string()))?;
        }
        let mut count = 0;
        while let Some(row) = self.child.next_row()? {
            let fields: Vec<String> = row
                .iter()
                .map(|v| csv_quote(&v.to_display_string(), self.delimiter))
                .collect();
            writeln!(self.writer, "{}", fields.join(&self.delimiter.to_string()))
                .map_err(|e| Error::filesystem(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    pub fn dump(&self) -> String {
        append_children("Output".to_string(), &[self.child.dump()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csvsqldb_core::ast::{ExprArena, ExprNode};

    struct RowsNode {
        columns: Vec<ColumnInfo>,
        rows: std::vec::IntoIter<Vec<Variant>>,
    }

    impl RowsNode {
        fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Variant>>) -> RowsNode {
            RowsNode { columns, rows: rows.into_iter() }
        }
    }

    impl RowOperatorNode for RowsNode {
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

    fn col(table: &str, name: &str, ty: Type) -> ColumnInfo {
        ColumnInfo { table: Some(SmolStr::new(table)), name: SmolStr::new(name), ty }
    }

    #[test]
    fn select_drops_rows_failing_predicate() {
        let mut arena = ExprArena::new();
        let id = arena.push(ExprNode::ColumnRef { prefix: None, ident: SmolStr::new("ID") }, 0);
        let one = arena.push(ExprNode::IntLiteral(1), 0);
        let eq = arena.push(
            ExprNode::Binary { op: csvsqldb_core::ast::BinaryOp::Eq, lhs: id, rhs: one },
            0,
        );
        let program = stack_machine::compile(&arena, eq).unwrap();

        let source = RowsNode::new(
            vec![col("T", "ID", Type::Int)],
            vec![vec![Variant::int(1)], vec![Variant::int(2)]],
        );
        let mut node = SelectOperatorNode::new(Box::new(source), program);
        node.connect().unwrap();
        assert_eq!(node.next_row().unwrap().unwrap()[0].as_int().unwrap(), 1);
        assert!(node.next_row().unwrap().is_none());
    }

    #[test]
    fn projection_reorders_columns() {
        let source = RowsNode::new(
            vec![col("T", "A", Type::Int), col("T", "B", Type::String)],
            vec![vec![Variant::int(1), Variant::string("x")]],
        );
        let mut node = ProjectionOperatorNode::new(Box::new(source), vec![1, 0]);
        let cols = node.connect().unwrap();
        assert_eq!(cols[0].name, "B");
        let row = node.next_row().unwrap().unwrap();
        assert_eq!(row[0].as_str().unwrap(), "x");
        assert_eq!(row[1].as_int().unwrap(), 1);
    }

    #[test]
    fn table_star_expands_matching_columns() {
        let source = RowsNode::new(
            vec![col("T", "A", Type::Int), col("U", "B", Type::Int)],
            vec![vec![Variant::int(1), Variant::int(2)]],
        );
        let mut node = ExtendedProjectionOperatorNode::new(
            Box::new(source),
            vec![ProjectionItem::TableStar { table: SmolStr::new("T") }],
        );
        let cols = node.connect().unwrap();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name, "A");
        assert_eq!(node.next_row().unwrap().unwrap()[0].as_int().unwrap(), 1);
    }

    #[test]
    fn cross_join_pairs_every_row() {
        let left = RowsNode::new(vec![col("L", "A", Type::Int)], vec![vec![Variant::int(1)], vec![Variant::int(2)]]);
        let right = RowsNode::new(vec![col("R", "B", Type::Int)], vec![vec![Variant::int(10)], vec![Variant::int(20)]]);
        let mut node = CrossJoinOperatorNode::new(Box::new(left), Box::new(right));
        node.connect().unwrap();
        let mut count = 0;
        while node.next_row().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn inner_hash_join_matches_on_key() {
        let left = RowsNode::new(
            vec![col("L", "K", Type::Int)],
            vec![vec![Variant::int(1)], vec![Variant::int(2)]],
        );
        let right = RowsNode::new(
            vec![col("R", "K", Type::Int), col("R", "V", Type::String)],
            vec![vec![Variant::int(1), Variant::string("match")]],
        );
        let mut node = InnerHashJoinOperatorNode::new(Box::new(left), Box::new(right), 0, 0);
        node.connect().unwrap();
        let row = node.next_row().unwrap().unwrap();
        assert_eq!(row[0].as_int().unwrap(), 1);
        assert_eq!(row[2].as_str().unwrap(), "match");
        assert!(node.next_row().unwrap().is_none());
    }

    #[test]
    fn left_join_pads_unmatched_rows_with_null() {
        let left = RowsNode::new(vec![col("L", "K", Type::Int)], vec![vec![Variant::int(1)], vec![Variant::int(2)]]);
        let right = RowsNode::new(
            vec![col("R", "K", Type::Int)],
            vec![vec![Variant::int(1)]],
        );
        let mut node = LeftJoinOperatorNode::new(Box::new(left), Box::new(right), 0, 0);
        node.connect().unwrap();
        let r1 = node.next_row().unwrap().unwrap();
        assert_eq!(r1[1].as_int().unwrap(), 1);
        let r2 = node.next_row().unwrap().unwrap();
        assert!(r2[1].is_null());
        assert!(node.next_row().unwrap().is_none());
    }

    #[test]
    fn union_distinct_dedups_across_children() {
        let left = RowsNode::new(vec![col("L", "A", Type::Int)], vec![vec![Variant::int(1)], vec![Variant::int(2)]]);
        let right = RowsNode::new(vec![col("R", "A", Type::Int)], vec![vec![Variant::int(2)], vec![Variant::int(3)]]);
        let mut node = SetOpOperatorNode::new(SetOp::Union, true, Box::new(left), Box::new(right));
        node.connect().unwrap();
        let mut values = Vec::new();
        while let Some(row) = node.next_row().unwrap() {
            values.push(row[0].as_int().unwrap());
        }
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn except_removes_rows_present_on_right() {
        let left = RowsNode::new(vec![col("L", "A", Type::Int)], vec![vec![Variant::int(1)], vec![Variant::int(2)]]);
        let right = RowsNode::new(vec![col("R", "A", Type::Int)], vec![vec![Variant::int(2)]]);
        let mut node = SetOpOperatorNode::new(SetOp::Except, false, Box::new(left), Box::new(right));
        node.connect().unwrap();
        assert_eq!(node.next_row().unwrap().unwrap()[0].as_int().unwrap(), 1);
        assert!(node.next_row().unwrap().is_none());
    }

    #[test]
    fn limit_applies_offset_then_caps_rows() {
        let source = RowsNode::new(
            vec![col("T", "A", Type::Int)],
            (1..=5).map(|i| vec![Variant::int(i)]).collect(),
        );
        let mut node = LimitOperatorNode::new(Box::new(source), 1, Some(2));
        node.connect().unwrap();
        assert_eq!(node.next_row().unwrap().unwrap()[0].as_int().unwrap(), 2);
        assert_eq!(node.next_row().unwrap().unwrap()[0].as_int().unwrap(), 3);
        assert!(node.next_row().unwrap().is_none());
    }

    #[test]
    fn output_node_writes_header_and_rows() {
        let source = RowsNode::new(
            vec![col("T", "A", Type::Int)],
            vec![vec![Variant::int(1)], vec![Variant::Int(None)]],
        );
        let mut buf: Vec<u8> = Vec::new();
        let mut node = OutputRowOperatorNode::new(Box::new(source), &mut buf, ',', true);
        let count = node.run().unwrap();
        assert_eq!(count, 2);
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "A\n1\n\n");
    }
}
