//! Execution engine (C12): statement dispatch, physical plan construction
//! and per-statement timing/statistics.
//!
//! Grounded on `original_source/apps/csvsqldb/console.cpp`'s read-eval-print
//! loop for the parse/preprocess/execute phase split and on the operator
//! nodes in `operatornodes/` for plan shape; the plan builder below plays
//! the role the original's execution-context visitor plays, turning a
//! validated `Statement` into a tree of `operators::RowOperatorNode`s.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use csvsqldb_core::ast::{
    ColumnDef, CreateMappingStmt, CreateTableStmt, ExplainMode, ExprArena, ExprNode, JoinKind,
    NodeId, OrderItem, QueryExpr, SelectItem, SelectStmt, SetOpKind, SetOpStmt, Statement,
    TableRef,
};
use csvsqldb_core::block::{DEFAULT_BLOCK_CAPACITY, DEFAULT_MAX_ACTIVE_BLOCKS};
use csvsqldb_core::symbol::{FunctionSignatures, SchemaProvider};
use csvsqldb_core::value::{Type, Variant};
use csvsqldb_core::{Error, Parser, Result};

use crate::catalog::Catalog;
use crate::csv_reader::DEFAULT_QUEUE_DEPTH;
use crate::functions::{FunctionKind, FunctionRegistry};
use crate::iterators::{AggregateSpec, SortKey};
use crate::operators::{
    ColumnInfo, CrossJoinOperatorNode, ExtendedProjectionOperatorNode, GroupingOperatorNode,
    InnerHashJoinOperatorNode, LeftJoinOperatorNode, LimitOperatorNode, ProjectionItem,
    RightJoinOperatorNode, RowOperatorNode, SelectOperatorNode, SetOp, SetOpOperatorNode,
    SortOperatorNode, SystemTableScanOperatorNode, TableScanOperatorNode,
};
use crate::system_tables;

/// Block-manager sizing and CSV-reader defaults, loaded from a TOML file by
/// `csvsqldb-cli-lib` or built programmatically — replaces the original's
/// global `Configuration` singleton with a passed-through struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub block_capacity: usize,
    pub max_active_blocks: usize,
    pub queue_depth: usize,
    pub default_delimiter: char,
    pub skip_first_line_default: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            max_active_blocks: DEFAULT_MAX_ACTIVE_BLOCKS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            default_delimiter: ',',
            skip_first_line_default: false,
        }
    }
}

/// Wall-clock timings for one statement, mirroring the original console's
/// timing output. `max_used_blocks`/`total_blocks` stay zero until
/// `RowOperatorNode` grows a way to report block-manager usage up the tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub parse_duration: Duration,
    pub preprocess_duration: Duration,
    pub execute_duration: Duration,
    pub max_used_blocks: usize,
    pub total_blocks: usize,
}

/// What one statement produced: rows for a query, a plain message for DDL,
/// or descriptive text for `EXPLAIN`.
#[derive(Debug, Clone)]
pub enum Outcome {
    Rows { columns: Vec<ColumnInfo>, rows: Vec<Vec<Variant>> },
    Message(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub stats: Statistics,
}

/// A cooperative cancellation flag, handed out by `ExecutionEngine::handle`.
/// Checked between rows while a statement's result set is drained, so a long
/// `SELECT` can be aborted from another thread (e.g. the CLI's `Ctrl-C`
/// handler) without tearing down the engine. This is a coarser cut than
/// polling inside the CSV producer thread: `CsvBlockReader` takes no
/// cancellation flag, so a scan already mid-block still finishes producing
/// it before the next row-pull sees the cancellation.
#[derive(Debug, Clone)]
pub struct EngineHandle(Arc<AtomicBool>);

impl EngineHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Owns the catalog and function registry for one database directory and
/// turns SQL text into `ExecutionResult`s. Table data and catalog metadata
/// both live under `db_path`.
pub struct ExecutionEngine {
    catalog: Catalog,
    functions: FunctionRegistry,
    config: EngineConfig,
    data_dir: PathBuf,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionEngine {
    pub fn open(db_path: impl AsRef<Path>, config: EngineConfig) -> Result<ExecutionEngine> {
        let data_dir = db_path.as_ref().to_path_buf();
        Ok(ExecutionEngine {
            catalog: Catalog::open(&data_dir)?,
            functions: FunctionRegistry::new(),
            config,
            data_dir,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle(self.cancelled.clone())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            return Err(Error::exception("statement cancelled"));
        }
        Ok(())
    }

    /// Parses, validates and runs every statement in `sql`, returning one
    /// `ExecutionResult` per statement.
    pub fn execute(&mut self, sql: &str) -> Result<Vec<ExecutionResult>> {
        let parse_start = Instant::now();
        // A fresh, zero-sized registry keeps the parser's lifetime from
        // tying to `self`, which would otherwise make every `&mut self` call
        // below conflict with the parser's borrow.
        let functions = FunctionRegistry::new();
        let mut parser = Parser::new(sql, Some(&functions))?;
        let statements = parser.parse_statements()?;
        let parse_duration = parse_start.elapsed();

        let mut results = Vec::with_capacity(statements.len());
        for stmt in statements {
            let preprocess_start = Instant::now();
            if needs_validation(&stmt) {
                let root = parser.symtab.root_scope();
                let schema = EngineSchema { catalog: &self.catalog };
                parser
                    .symtab
                    .type_symbol_table(root, &schema, &mut parser.arena, &self.functions)?;
            }
            let preprocess_duration = preprocess_start.elapsed();

            let execute_start = Instant::now();
            let outcome = self.dispatch(stmt, &mut parser.arena)?;
            let execute_duration = execute_start.elapsed();

            results.push(ExecutionResult {
                outcome,
                stats: Statistics {
                    parse_duration,
                    preprocess_duration,
                    execute_duration,
                    max_used_blocks: 0,
                    total_blocks: 0,
                },
            });
        }
        Ok(results)
    }

    fn dispatch(&mut self, stmt: Statement, arena: &mut ExprArena) -> Result<Outcome> {
        match stmt {
            Statement::Query(query) => self.run_query(&query, arena),
            Statement::CreateTable(create) => self.run_create_table(&create),
            Statement::DropTable(name) => self.run_drop_table(&name),
            Statement::AlterTableAddColumn { table, column } => self.run_alter_add_column(&table, &column),
            Statement::AlterTableDropColumn { table, column } => self.run_alter_drop_column(&table, &column),
            Statement::CreateMapping(create) => self.run_create_mapping(&create),
            Statement::DropMapping(table) => self.run_drop_mapping(&table),
            Statement::Explain { mode, query } => self.run_explain(mode, &query, arena),
        }
    }

    // -------------------------------------------------------------
    // DDL
    // -------------------------------------------------------------

    fn run_create_table(&mut self, stmt: &CreateTableStmt) -> Result<Outcome> {
        self.catalog.add_table(stmt)?;
        Ok(Outcome::Message(format!("table '{}' created", stmt.name)))
    }

    fn run_drop_table(&mut self, name: &str) -> Result<Outcome> {
        self.catalog.drop_table(name)?;
        Ok(Outcome::Message(format!("table '{name}' dropped")))
    }

    fn run_alter_add_column(&mut self, table: &str, column: &ColumnDef) -> Result<Outcome> {
        self.catalog.alter_add_column(table, column)?;
        Ok(Outcome::Message(format!("column '{}' added to '{table}'", column.name)))
    }

    fn run_alter_drop_column(&mut self, table: &str, column: &str) -> Result<Outcome> {
        self.catalog.alter_drop_column(table, column)?;
        Ok(Outcome::Message(format!("column '{column}' dropped from '{table}'")))
    }

    fn run_create_mapping(&mut self, stmt: &CreateMappingStmt) -> Result<Outcome> {
        self.catalog.add_mapping(stmt)?;
        Ok(Outcome::Message(format!("mapping for '{}' created", stmt.table)))
    }

    fn run_drop_mapping(&mut self, table: &str) -> Result<Outcome> {
        self.catalog.remove_mapping(table)?;
        Ok(Outcome::Message(format!("mapping for '{table}' dropped")))
    }

    // -------------------------------------------------------------
    // EXPLAIN
    // -------------------------------------------------------------

    fn run_explain(&mut self, mode: ExplainMode, query: &QueryExpr, arena: &mut ExprArena) -> Result<Outcome> {
        match mode {
            ExplainMode::Ast => Ok(Outcome::Message(explain_ast(query, arena))),
            ExplainMode::Exec => {
                let (mut node, _cols) = self.build_query(query, arena)?;
                node.connect()?;
                Ok(Outcome::Message(node.dump()))
            }
        }
    }

    // -------------------------------------------------------------
    // DQL
    // -------------------------------------------------------------

    fn run_query(&mut self, query: &QueryExpr, arena: &mut ExprArena) -> Result<Outcome> {
        let (mut node, _cols) = self.build_query(query, arena)?;
        let columns = node.connect()?;
        let mut rows = Vec::new();
        while let Some(row) = node.next_row()? {
            self.check_cancelled()?;
            rows.push(row);
        }
        Ok(Outcome::Rows { columns, rows })
    }

    fn build_query(&self, query: &QueryExpr, arena: &mut ExprArena) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        match query {
            QueryExpr::Select(select) => self.build_select(select, arena),
            QueryExpr::SetOp(set_op) => self.build_set_op(set_op, arena),
        }
    }

    fn build_set_op(&self, stmt: &SetOpStmt, arena: &mut ExprArena) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        let (left, cols) = self.build_query(&stmt.left, arena)?;
        let (right, _) = self.build_query(&stmt.right, arena)?;
        let op = match stmt.op {
            SetOpKind::Union => SetOp::Union,
            SetOpKind::Intersect => SetOp::Intersect,
            SetOpKind::Except => SetOp::Except,
        };
        let node = SetOpOperatorNode::new(op, !stmt.all, left, right);
        Ok((Box::new(node), cols))
    }

    fn build_select(&self, select: &SelectStmt, arena: &mut ExprArena) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        let (mut node, mut cols): (Box<dyn RowOperatorNode>, Vec<ColumnInfo>) = match &select.from {
            Some(table_ref) => self.build_table_ref(table_ref, arena)?,
            None => {
                let dual_cols = vec![ColumnInfo { table: None, name: SmolStr::new("x"), ty: Type::Boolean }];
                let node = SystemTableScanOperatorNode::new(
                    SmolStr::new("DUAL"),
                    dual_cols.clone(),
                    vec![vec![Variant::boolean(true)]],
                );
                (Box::new(node), dual_cols)
            }
        };

        if let Some(where_clause) = select.where_clause {
            let program = crate::stack_machine::compile(arena, where_clause)?;
            node = Box::new(SelectOperatorNode::new(node, program));
        }

        let group_columns = select
            .group_by
            .iter()
            .map(|&e| self.resolve_column_index(arena, e, &cols))
            .collect::<Result<Vec<usize>>>()?;

        // Rewrite every aggregate call reachable from the SELECT list and
        // HAVING clause into a synthetic column reference, collecting one
        // `AggregateSpec` per call. A plain `ColumnRef` is left untouched:
        // `group_output` keeps each grouping column's original name, so
        // `resolve_column_index` finds it post-group the same way it does
        // pre-group.
        let mut aggregates: Vec<AggregateSpec> = Vec::new();
        let mut agg_names: Vec<SmolStr> = Vec::new();
        let mut plain_refs: Vec<usize> = Vec::new();
        let mut rewritten_items = Vec::with_capacity(select.items.len());
        for item in &select.items {
            match item {
                SelectItem::Expr { expr, alias } => {
                    let rewritten =
                        self.extract_aggregates(arena, *expr, &cols, &mut aggregates, &mut agg_names, &mut plain_refs)?;
                    rewritten_items.push(SelectItem::Expr { expr: rewritten, alias: alias.clone() });
                }
                other => rewritten_items.push(other.clone()),
            }
        }
        let rewritten_having = match select.having {
            Some(h) => {
                Some(self.extract_aggregates(arena, h, &cols, &mut aggregates, &mut agg_names, &mut plain_refs)?)
            }
            None => None,
        };

        let grouping_needed = !group_columns.is_empty() || !aggregates.is_empty();
        if grouping_needed {
            if plain_refs.iter().any(|idx| !group_columns.contains(idx)) {
                return Err(Error::sql("no aggregation on other than aggregation functions"));
            }
            let group_output: Vec<ColumnInfo> = group_columns.iter().map(|&i| cols[i].clone()).collect();
            let aggregate_output: Vec<ColumnInfo> = aggregates
                .iter()
                .zip(&agg_names)
                .map(|(spec, name)| ColumnInfo {
                    table: None,
                    name: name.clone(),
                    ty: aggregate_return_type(&self.functions, &spec.function, spec.input_type),
                })
                .collect();
            node = Box::new(GroupingOperatorNode::new(
                node,
                group_columns,
                aggregates,
                group_output.clone(),
                aggregate_output.clone(),
            ));
            cols = group_output.into_iter().chain(aggregate_output).collect();
        }

        if let Some(having) = rewritten_having {
            let program = crate::stack_machine::compile(arena, having)?;
            node = Box::new(SelectOperatorNode::new(node, program));
        }

        let (node2, out_cols) = self.build_projection(node, &rewritten_items, &cols, select.distinct, arena)?;
        node = node2;
        cols = out_cols;

        if !select.order_by.is_empty() {
            let keys = self.resolve_order_keys(arena, &select.order_by, &cols)?;
            node = Box::new(SortOperatorNode::new(node, keys));
        }

        if select.limit.is_some() || select.offset.is_some() {
            let offset = select.offset.unwrap_or(0).max(0) as usize;
            let limit = select.limit.map(|n| n.max(0) as usize);
            node = Box::new(LimitOperatorNode::new(node, offset, limit));
        }

        Ok((node, cols))
    }

    fn build_projection(
        &self,
        child: Box<dyn RowOperatorNode>,
        items: &[SelectItem],
        cols: &[ColumnInfo],
        distinct: bool,
        arena: &ExprArena,
    ) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        if items.len() == 1 && matches!(items[0], SelectItem::Star) {
            return Ok((self.maybe_distinct(child, cols, distinct), cols.to_vec()));
        }

        let mut projection_items = Vec::new();
        let mut output = Vec::new();
        for item in items {
            match item {
                SelectItem::Star => {
                    for (idx, c) in cols.iter().enumerate() {
                        projection_items.push(ProjectionItem::Column { input_index: idx, output_name: c.name.clone() });
                        output.push(c.clone());
                    }
                }
                SelectItem::QualifiedStar(table) => {
                    projection_items.push(ProjectionItem::TableStar { table: table.clone() });
                    for c in cols.iter().filter(|c| c.table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(table))) {
                        output.push(c.clone());
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    if let ExprNode::ColumnRef { prefix, ident } = arena.get(*expr) {
                        if let Some(idx) = find_column(cols, prefix.as_deref(), ident) {
                            let name = alias.clone().unwrap_or_else(|| cols[idx].name.clone());
                            projection_items.push(ProjectionItem::Column { input_index: idx, output_name: name.clone() });
                            output.push(ColumnInfo { table: cols[idx].table.clone(), name, ty: cols[idx].ty });
                            continue;
                        }
                    }
                    let name = alias.clone().unwrap_or_else(|| default_output_name(arena, *expr));
                    let program = crate::stack_machine::compile(arena, *expr)?;
                    let ty = arena.type_of(*expr);
                    projection_items.push(ProjectionItem::Expr { program, output_name: name.clone(), output_type: ty });
                    output.push(ColumnInfo { table: None, name, ty });
                }
            }
        }
        let node = ExtendedProjectionOperatorNode::new(child, projection_items);
        Ok((self.maybe_distinct(Box::new(node), &output, distinct), output))
    }

    /// `DISTINCT` folded into `UNION`'s own dedup machinery: pairing the
    /// real stream with an always-empty right side makes `SetOpOperatorNode`
    /// drop every row after its first occurrence without needing a second
    /// implementation of row-equality dedup.
    fn maybe_distinct(&self, node: Box<dyn RowOperatorNode>, cols: &[ColumnInfo], distinct: bool) -> Box<dyn RowOperatorNode> {
        if !distinct {
            return node;
        }
        Box::new(SetOpOperatorNode::new(SetOp::Union, true, node, Box::new(EmptyRows::new(cols.to_vec()))))
    }

    fn resolve_order_keys(&self, arena: &ExprArena, order_by: &[OrderItem], cols: &[ColumnInfo]) -> Result<Vec<SortKey>> {
        order_by
            .iter()
            .map(|item| {
                let idx = self.resolve_column_index(arena, item.expr, cols)?;
                Ok(SortKey { column: idx, ascending: !item.desc })
            })
            .collect()
    }

    fn resolve_column_index(&self, arena: &ExprArena, node: NodeId, cols: &[ColumnInfo]) -> Result<usize> {
        match arena.get(node) {
            ExprNode::ColumnRef { prefix, ident } => {
                find_column(cols, prefix.as_deref(), ident).ok_or_else(|| Error::sql(format!("unknown column '{ident}'")))
            }
            ExprNode::IntLiteral(n) => {
                let idx = (*n - 1).max(0) as usize;
                if idx < cols.len() {
                    Ok(idx)
                } else {
                    Err(Error::sql("ordinal position out of range"))
                }
            }
            _ => Err(Error::sql("expected a column reference")),
        }
    }

    /// Replaces every aggregate-function call reachable from `node` with a
    /// `ColumnRef` to a synthetic name, recording one `AggregateSpec` per
    /// call. Only a bare column reference (or no argument, for
    /// `COUNT(*)`) is supported as an aggregate's argument. Every plain
    /// `ColumnRef` encountered outside of an aggregate call is recorded in
    /// `plain_refs` by its resolved index into `cols`, so the caller can
    /// reject a column that is neither aggregated nor grouped on once it
    /// knows whether grouping applies at all.
    fn extract_aggregates(
        &self,
        arena: &mut ExprArena,
        node: NodeId,
        cols: &[ColumnInfo],
        aggregates: &mut Vec<AggregateSpec>,
        names: &mut Vec<SmolStr>,
        plain_refs: &mut Vec<usize>,
    ) -> Result<NodeId> {
        let scope = arena.scope_of(node);
        let expr = arena.get(node).clone();

        if let ExprNode::FunctionCall { name, args } = &expr {
            if matches!(self.functions.info(name).map(|f| f.kind), Some(FunctionKind::Aggregate)) {
                let (function_name, input_column, input_type) = if args.is_empty() {
                    ("COUNT_STAR".to_string(), 0usize, Type::Int)
                } else {
                    match arena.get(args[0]) {
                        ExprNode::ColumnRef { prefix, ident } => {
                            let idx = find_column(cols, prefix.as_deref(), ident)
                                .ok_or_else(|| Error::sql(format!("unknown column '{ident}'")))?;
                            (name.to_ascii_uppercase(), idx, cols[idx].ty)
                        }
                        _ => return Err(Error::sql(format!("calling function '{name}' with wrong parameter"))),
                    }
                };
                let synthetic = SmolStr::new(format!("${}_{}", function_name.to_ascii_lowercase(), aggregates.len()));
                aggregates.push(AggregateSpec { function: function_name, input_column, input_type });
                names.push(synthetic.clone());
                return Ok(arena.push(ExprNode::ColumnRef { prefix: None, ident: synthetic }, scope));
            }
        }

        let rebuilt = match expr {
            ExprNode::Unary { op, expr: inner } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::Unary { op, expr: inner })
            }
            ExprNode::Cast { ty, expr: inner } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::Cast { ty, expr: inner })
            }
            ExprNode::Binary { op, lhs, rhs } => {
                let lhs = self.extract_aggregates(arena, lhs, cols, aggregates, names, plain_refs)?;
                let rhs = self.extract_aggregates(arena, rhs, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::Binary { op, lhs, rhs })
            }
            ExprNode::Between { expr: inner, low, high } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                let low = self.extract_aggregates(arena, low, cols, aggregates, names, plain_refs)?;
                let high = self.extract_aggregates(arena, high, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::Between { expr: inner, low, high })
            }
            ExprNode::InList { expr: inner, list } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                let mut new_list = Vec::with_capacity(list.len());
                for item in list {
                    new_list.push(self.extract_aggregates(arena, item, cols, aggregates, names, plain_refs)?);
                }
                Some(ExprNode::InList { expr: inner, list: new_list })
            }
            ExprNode::Like { expr: inner, pattern } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                let pattern = self.extract_aggregates(arena, pattern, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::Like { expr: inner, pattern })
            }
            ExprNode::IsNull { expr: inner, negated } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::IsNull { expr: inner, negated })
            }
            ExprNode::IsBool { expr: inner, value, negated } => {
                let inner = self.extract_aggregates(arena, inner, cols, aggregates, names, plain_refs)?;
                Some(ExprNode::IsBool { expr: inner, value, negated })
            }
            ExprNode::FunctionCall { name, args } => {
                let mut new_args = Vec::with_capacity(args.len());
                for a in args {
                    new_args.push(self.extract_aggregates(arena, a, cols, aggregates, names, plain_refs)?);
                }
                Some(ExprNode::FunctionCall { name, args: new_args })
            }
            ExprNode::Case { operand, whens, else_expr } => {
                let operand = operand.map(|o| self.extract_aggregates(arena, o, cols, aggregates, names, plain_refs)).transpose()?;
                let mut new_whens = Vec::with_capacity(whens.len());
                for (w, t) in whens {
                    let w = self.extract_aggregates(arena, w, cols, aggregates, names, plain_refs)?;
                    let t = self.extract_aggregates(arena, t, cols, aggregates, names, plain_refs)?;
                    new_whens.push((w, t));
                }
                let else_expr = else_expr.map(|e| self.extract_aggregates(arena, e, cols, aggregates, names, plain_refs)).transpose()?;
                Some(ExprNode::Case { operand, whens: new_whens, else_expr })
            }
            ExprNode::ColumnRef { prefix, ident } => {
                if let Some(idx) = find_column(cols, prefix.as_deref(), &ident) {
                    plain_refs.push(idx);
                }
                None
            }
            _ => None,
        };

        match rebuilt {
            Some(new_node) => Ok(arena.push(new_node, scope)),
            None => Ok(node),
        }
    }

    // -------------------------------------------------------------
    // FROM clause / joins
    // -------------------------------------------------------------

    fn build_table_ref(&self, table_ref: &TableRef, arena: &mut ExprArena) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        match table_ref {
            TableRef::Named { name, alias } => self.build_named_table(name, alias.clone()),
            TableRef::Subquery { query, alias } => {
                let (node, cols) = self.build_query(query, arena)?;
                let relabelled = cols
                    .into_iter()
                    .map(|c| ColumnInfo { table: Some(alias.clone()), name: c.name, ty: c.ty })
                    .collect();
                Ok((node, relabelled))
            }
            TableRef::Join { kind: JoinKind::Full, left, right, on, .. } => self.build_full_join(left, right, *on, arena),
            TableRef::Join { kind, left, right, on, using } => {
                let (left_node, left_cols) = self.build_table_ref(left, arena)?;
                let (right_node, right_cols) = self.build_table_ref(right, arena)?;
                self.build_join(*kind, left_node, left_cols, right_node, right_cols, *on, using, arena)
            }
        }
    }

    fn build_named_table(&self, name: &str, alias: Option<SmolStr>) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        if system_tables::is_system_table(name) {
            let node = system_tables::scan(name, &self.catalog, &self.functions)
                .ok_or_else(|| Error::sql(format!("system table '{name}' not found")))?;
            let label = alias.unwrap_or_else(|| SmolStr::new(name));
            let cols = node
                .columns()
                .iter()
                .map(|c| ColumnInfo { table: Some(label.clone()), name: c.name.clone(), ty: c.ty })
                .collect();
            return Ok((Box::new(node), cols));
        }
        let body = self.catalog.get_table(name)?;
        let columns: Vec<(SmolStr, Type)> = body
            .columns
            .iter()
            .map(|c| (SmolStr::new(&c.name), Type::parse_name(&c.ty).unwrap_or(Type::None)))
            .collect();
        let mappings = self
            .catalog
            .get_mapping_for_table(name)
            .ok_or_else(|| Error::mapping(format!("no mapping registered for table '{name}'")))?;
        let label = alias.clone().unwrap_or_else(|| SmolStr::new(name));
        let cols = columns
            .iter()
            .map(|(n, t)| ColumnInfo { table: Some(label.clone()), name: n.clone(), ty: *t })
            .collect();
        let node = TableScanOperatorNode::new(SmolStr::new(name), alias, columns, self.data_dir.clone(), mappings);
        Ok((Box::new(node), cols))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_join(
        &self,
        kind: JoinKind,
        left: Box<dyn RowOperatorNode>,
        left_cols: Vec<ColumnInfo>,
        right: Box<dyn RowOperatorNode>,
        right_cols: Vec<ColumnInfo>,
        on: Option<NodeId>,
        using: &[SmolStr],
        arena: &ExprArena,
    ) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        let combined: Vec<ColumnInfo> = left_cols.iter().cloned().chain(right_cols.iter().cloned()).collect();

        if matches!(kind, JoinKind::Cross) {
            return Ok((Box::new(CrossJoinOperatorNode::new(left, right)), combined));
        }

        let equi_keys = equi_join_keys(arena, kind, on, using, &left_cols, &right_cols);
        let single_key = equi_keys.as_ref().filter(|p| p.len() == 1).map(|p| p[0]);

        match (kind, single_key) {
            (JoinKind::Inner, Some((lk, rk))) | (JoinKind::Natural, Some((lk, rk))) => {
                log::debug!("{kind:?} join: hashing right input on column {rk} (probed against left column {lk})");
                Ok((Box::new(InnerHashJoinOperatorNode::new(left, right, lk, rk)), combined))
            }
            (JoinKind::Inner, None) | (JoinKind::Natural, None) => match on {
                Some(on) => {
                    let program = crate::stack_machine::compile(arena, on)?;
                    let cross = CrossJoinOperatorNode::new(left, right);
                    Ok((Box::new(SelectOperatorNode::new(Box::new(cross), program)), combined))
                }
                None => Ok((Box::new(CrossJoinOperatorNode::new(left, right)), combined)),
            },
            (JoinKind::Left, Some((lk, rk))) => {
                log::debug!("left join: hashing right input on column {rk} (probed against left column {lk})");
                Ok((Box::new(LeftJoinOperatorNode::new(left, right, lk, rk)), combined))
            }
            (JoinKind::Right, Some((lk, rk))) => {
                log::debug!("right join: hashing left input on column {lk} (probed against right column {rk})");
                Ok((Box::new(RightJoinOperatorNode::new(left, right, lk, rk)), combined))
            }
            (JoinKind::Left, None) | (JoinKind::Right, None) => Err(Error::sql("outer join requires an equality condition")),
            (JoinKind::Full, _) => unreachable!("FULL JOIN is built by build_full_join"),
            (JoinKind::Cross, _) => unreachable!("handled above"),
        }
    }

    /// `FULL OUTER JOIN` has no dedicated operator node; it's synthesized as
    /// `LeftJoin UNION ALL (RightJoin filtered to left-unmatched rows)`. Each
    /// side of the join is built twice (once per synthesized join), since a
    /// built operator tree can only be pulled from once — an accepted
    /// simplification rather than a dedicated anti-join operator.
    fn build_full_join(
        &self,
        left: &TableRef,
        right: &TableRef,
        on: Option<NodeId>,
        arena: &mut ExprArena,
    ) -> Result<(Box<dyn RowOperatorNode>, Vec<ColumnInfo>)> {
        let on = on.ok_or_else(|| Error::sql("FULL JOIN requires an ON condition"))?;

        let (left1, left_cols) = self.build_table_ref(left, arena)?;
        let (right1, right_cols) = self.build_table_ref(right, arena)?;
        let (lk, rk) = equality_pairs(arena, on, &left_cols, &right_cols)
            .filter(|p| p.len() == 1)
            .map(|p| p[0])
            .ok_or_else(|| Error::sql("FULL JOIN requires a single equality condition"))?;
        let left_join = LeftJoinOperatorNode::new(left1, right1, lk, rk);

        let (left2, _) = self.build_table_ref(left, arena)?;
        let (right2, _) = self.build_table_ref(right, arena)?;
        let right_join = RightJoinOperatorNode::new(left2, right2, lk, rk);

        let anchor = &left_cols[lk];
        let scope = arena.scope_of(on);
        let probe = arena.push(ExprNode::ColumnRef { prefix: anchor.table.clone(), ident: anchor.name.clone() }, scope);
        let is_unmatched = arena.push(ExprNode::IsNull { expr: probe, negated: false }, scope);
        let program = crate::stack_machine::compile(arena, is_unmatched)?;
        let right_only = SelectOperatorNode::new(Box::new(right_join), program);

        let combined: Vec<ColumnInfo> = left_cols.into_iter().chain(right_cols).collect();
        Ok((
            Box::new(SetOpOperatorNode::new(SetOp::Union, false, Box::new(left_join), Box::new(right_only))),
            combined,
        ))
    }
}

fn equi_join_keys(
    arena: &ExprArena,
    kind: JoinKind,
    on: Option<NodeId>,
    using: &[SmolStr],
    left_cols: &[ColumnInfo],
    right_cols: &[ColumnInfo],
) -> Option<Vec<(usize, usize)>> {
    if !using.is_empty() {
        return using
            .iter()
            .map(|name| {
                let l = find_column(left_cols, None, name)?;
                let r = find_column(right_cols, None, name)?;
                Some((l, r))
            })
            .collect();
    }
    if matches!(kind, JoinKind::Natural) {
        let mut pairs = Vec::new();
        for rc in right_cols {
            if let Some(li) = find_column(left_cols, None, &rc.name) {
                let ri = find_column(right_cols, None, &rc.name)?;
                pairs.push((li, ri));
            }
        }
        return Some(pairs);
    }
    equality_pairs(arena, on?, left_cols, right_cols)
}

fn aggregate_return_type(functions: &FunctionRegistry, function: &str, arg_type: Type) -> Type {
    let name = if function == "COUNT_STAR" { "COUNT" } else { function };
    functions.return_type(name, &[arg_type]).unwrap_or(Type::Int)
}

fn find_column(cols: &[ColumnInfo], prefix: Option<&str>, ident: &str) -> Option<usize> {
    cols.iter().position(|c| {
        c.name.eq_ignore_ascii_case(ident)
            && prefix.is_none_or(|p| c.table.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(p)))
    })
}

/// One `a = b` comparison, or a chain of such comparisons joined by `AND`,
/// each side resolving to a distinct table's column — everything a
/// hash-join can use as an equi-join key.
fn equality_pairs(arena: &ExprArena, node: NodeId, left: &[ColumnInfo], right: &[ColumnInfo]) -> Option<Vec<(usize, usize)>> {
    use csvsqldb_core::ast::BinaryOp;
    match arena.get(node) {
        ExprNode::Binary { op: BinaryOp::And, lhs, rhs } => {
            let mut a = equality_pairs(arena, *lhs, left, right)?;
            let b = equality_pairs(arena, *rhs, left, right)?;
            a.extend(b);
            Some(a)
        }
        ExprNode::Binary { op: BinaryOp::Eq, lhs, rhs } => {
            let (ExprNode::ColumnRef { prefix: lp, ident: li }, ExprNode::ColumnRef { prefix: rp, ident: ri }) =
                (arena.get(*lhs), arena.get(*rhs))
            else {
                return None;
            };
            if let (Some(l), Some(r)) = (find_column(left, lp.as_deref(), li), find_column(right, rp.as_deref(), ri)) {
                return Some(vec![(l, r)]);
            }
            if let (Some(l), Some(r)) = (find_column(left, rp.as_deref(), ri), find_column(right, lp.as_deref(), li)) {
                return Some(vec![(l, r)]);
            }
            None
        }
        _ => None,
    }
}

fn default_output_name(arena: &ExprArena, node: NodeId) -> SmolStr {
    SmolStr::new(arena.print(node))
}

fn needs_validation(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Query(_) | Statement::Explain { .. })
}

fn explain_ast(query: &QueryExpr, arena: &ExprArena) -> String {
    match query {
        QueryExpr::Select(select) => {
            let mut lines = vec!["Select".to_string()];
            for item in &select.items {
                match item {
                    SelectItem::Star => lines.push("  item: *".to_string()),
                    SelectItem::QualifiedStar(t) => lines.push(format!("  item: {t}.*")),
                    SelectItem::Expr { expr, alias } => {
                        let printed = arena.print(*expr);
                        match alias {
                            Some(a) => lines.push(format!("  item: {printed} AS {a}")),
                            None => lines.push(format!("  item: {printed}")),
                        }
                    }
                }
            }
            if let Some(w) = select.where_clause {
                lines.push(format!("  where: {}", arena.print(w)));
            }
            if !select.group_by.is_empty() {
                let group: Vec<String> = select.group_by.iter().map(|&e| arena.print(e)).collect();
                lines.push(format!("  group by: {}", group.join(", ")));
            }
            if let Some(h) = select.having {
                lines.push(format!("  having: {}", arena.print(h)));
            }
            if !select.order_by.is_empty() {
                let order: Vec<String> = select
                    .order_by
                    .iter()
                    .map(|o| format!("{}{}", arena.print(o.expr), if o.desc { " DESC" } else { "" }))
                    .collect();
                lines.push(format!("  order by: {}", order.join(", ")));
            }
            lines.join("\n")
        }
        QueryExpr::SetOp(set_op) => format!(
            "{:?}{}\n{}\n{}",
            set_op.op,
            if set_op.all { " ALL" } else { "" },
            explain_ast(&set_op.left, arena),
            explain_ast(&set_op.right, arena)
        ),
    }
}

/// Extends the catalog with the fixed schemas of the `SYSTEM_*` tables, so
/// the validator can type-check references to them the same way it does
/// real catalog tables.
struct EngineSchema<'a> {
    catalog: &'a Catalog,
}

impl<'a> SchemaProvider for EngineSchema<'a> {
    fn has_table(&self, name: &str) -> bool {
        self.catalog.has_table(name) || system_tables::is_system_table(name)
    }

    fn column_type(&self, table: &str, column: &str) -> Option<Type> {
        if let Some(cols) = system_tables::static_columns(table) {
            return cols.into_iter().find(|(n, _)| n.eq_ignore_ascii_case(column)).map(|(_, ty)| ty);
        }
        self.catalog.column_type(table, column)
    }
}

/// An always-empty row source carrying a fixed schema, used as `UNION`'s
/// "other side" when folding a single stream's `DISTINCT` against itself.
struct EmptyRows {
    columns: Vec<ColumnInfo>,
    connected: bool,
}

impl EmptyRows {
    fn new(columns: Vec<ColumnInfo>) -> EmptyRows {
        EmptyRows { columns, connected: false }
    }
}

impl RowOperatorNode for EmptyRows {
    fn connect(&mut self) -> Result<Vec<ColumnInfo>> {
        self.connected = true;
        Ok(self.columns.clone())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Variant>>> {
        if !self.connected {
            return Err(Error::invalid_operation("operator pulled before connect"));
        }
        Ok(None)
    }

    fn dump(&self) -> String {
        "Empty".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup(dir: &std::path::Path) -> ExecutionEngine {
        let mut engine = ExecutionEngine::open(dir, EngineConfig::default()).unwrap();
        engine
            .execute("CREATE TABLE employees (id INT PRIMARY KEY, name STRING, salary REAL)")
            .unwrap();
        engine
            .execute("CREATE MAPPING employees (employees.csv)")
            .unwrap();
        fs::write(dir.join("employees.csv"), "1,Alice,1000.0\n2,Bob,2000.0\n3,Carol,1500.0\n").unwrap();
        engine
    }

    #[test]
    fn selects_rows_from_a_mapped_csv_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let results = engine.execute("SELECT name, salary FROM employees WHERE salary > 1200").unwrap();
        let Outcome::Rows { rows, .. } = &results[0].outcome else { panic!("expected rows") };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn groups_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let results = engine.execute("SELECT COUNT(*) FROM employees").unwrap();
        let Outcome::Rows { rows, .. } = &results[0].outcome else { panic!("expected rows") };
        assert_eq!(rows[0][0], Variant::int(3));
    }

    #[test]
    fn explain_ast_describes_the_query() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let results = engine.execute("EXPLAIN AST SELECT name FROM employees").unwrap();
        let Outcome::Message(text) = &results[0].outcome else { panic!("expected a message") };
        assert!(text.contains("Select"));
    }

    #[test]
    fn explain_exec_dumps_the_operator_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let results = engine.execute("EXPLAIN EXEC SELECT name FROM employees WHERE salary > 1000").unwrap();
        let Outcome::Message(text) = &results[0].outcome else { panic!("expected a message") };
        assert!(text.contains("-->"));
    }

    #[test]
    fn queries_system_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let results = engine.execute("SELECT NAME FROM SYSTEM_TABLES WHERE SYSTEM = false").unwrap();
        let Outcome::Rows { rows, .. } = &results[0].outcome else { panic!("expected rows") };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_str().unwrap(), "employees");
    }

    #[test]
    fn ungrouped_plain_column_alongside_an_aggregate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let err = engine.execute("SELECT name, COUNT(*) FROM employees").unwrap_err();
        assert_eq!(err.to_string(), "no aggregation on other than aggregation functions");
    }

    #[test]
    fn unknown_table_is_rejected_before_planning() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        assert!(engine.execute("SELECT * FROM nonexistent").is_err());
    }

    #[test]
    fn cancellation_flag_is_observed_between_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = setup(dir.path());
        let handle = engine.handle();
        handle.cancel();
        assert!(engine.execute("SELECT * FROM employees").is_err());
    }
}
