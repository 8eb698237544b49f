//! Symbol table & validator (C7).
//!
//! Grounded on `original_source/csvsqldb/symboltable.cpp`'s scoped lookup
//! (`findSymbol`, ambiguous-name detection), with each scope's symbols kept
//! in a plain insertion-ordered `Vec` rather than the original's map, since
//! lookups scan a handful of columns at a time.
//!
//! The symbol table is decoupled from the catalog and function registry
//! (both live in `csvsqldb-engine`, which depends on this crate, not the
//! reverse) via two small capability traits: `SchemaProvider` and
//! `FunctionSignatures`. `csvsqldb-engine::Catalog` and
//! `csvsqldb-engine::FunctionRegistry` implement them.

use smol_str::SmolStr;

use crate::ast::{ExprArena, ExprNode, NodeId};
use crate::error::{Error, Result};
use crate::value::Type;

pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Plain,
    Calc,
    Function,
    Table,
    Subquery,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub ty: Type,
    pub identifier: SmolStr,
    pub prefix: Option<SmolStr>,
    pub alias: Option<SmolStr>,
    pub relation: Option<SmolStr>,
    pub calc_expr: Option<NodeId>,
    pub subquery_scope: Option<ScopeId>,
}

impl Symbol {
    pub fn table(name: SmolStr, alias: Option<SmolStr>) -> Symbol {
        Symbol {
            kind: SymbolKind::Table,
            ty: Type::None,
            identifier: name.clone(),
            prefix: None,
            alias,
            relation: Some(name),
            calc_expr: None,
            subquery_scope: None,
        }
    }

    pub fn plain(prefix: Option<SmolStr>, ident: SmolStr) -> Symbol {
        Symbol {
            kind: SymbolKind::Plain,
            ty: Type::None,
            identifier: ident,
            prefix,
            alias: None,
            relation: None,
            calc_expr: None,
            subquery_scope: None,
        }
    }

    pub fn calc(ident: SmolStr, expr: NodeId) -> Symbol {
        Symbol {
            kind: SymbolKind::Calc,
            ty: Type::None,
            identifier: ident,
            prefix: None,
            alias: None,
            relation: None,
            calc_expr: Some(expr),
            subquery_scope: None,
        }
    }

    /// Either the explicit alias or, failing that, the table's own name —
    /// the lookup key client code should use when matching `prefix.ident`.
    pub fn table_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.identifier.as_str())
    }
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    symbols: Vec<Symbol>,
}

/// A capability injected by the catalog: "does a table exist, and what are
/// its columns" — everything the validator needs to type PLAIN symbols,
/// without the symbol table crate depending on the catalog crate.
pub trait SchemaProvider {
    fn has_table(&self, name: &str) -> bool;
    fn column_type(&self, table: &str, column: &str) -> Option<Type>;
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            scopes: vec![Scope {
                parent: None,
                symbols: Vec::new(),
            }],
        }
    }

    pub fn root_scope(&self) -> ScopeId {
        0
    }

    pub fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: Some(parent),
            symbols: Vec::new(),
        });
        self.scopes.len() - 1
    }

    pub fn add_symbol(&mut self, scope: ScopeId, symbol: Symbol) {
        self.scopes[scope].symbols.push(symbol);
    }

    /// Symbols in insertion order — the stable enumeration spec.md §4.7
    /// requires for output-column binding.
    pub fn symbols_in_scope(&self, scope: ScopeId) -> &[Symbol] {
        &self.scopes[scope].symbols
    }

    pub fn find_table_symbol(&self, scope: ScopeId, name_or_alias: &str) -> Option<&Symbol> {
        let mut cur = Some(scope);
        while let Some(s) = cur {
            if let Some(sym) = self.scopes[s].symbols.iter().find(|sym| {
                sym.kind == SymbolKind::Table
                    && (sym.identifier.eq_ignore_ascii_case(name_or_alias)
                        || sym
                            .alias
                            .as_deref()
                            .is_some_and(|a| a.eq_ignore_ascii_case(name_or_alias)))
            }) {
                return Some(sym);
            }
            cur = self.scopes[s].parent;
        }
        None
    }

    pub fn find_all_symbols_for_table(&self, scope: ScopeId, table: &str) -> Vec<&Symbol> {
        self.scopes[scope]
            .symbols
            .iter()
            .filter(|s| {
                s.relation
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case(table))
            })
            .collect()
    }

    pub fn find_aliased_symbol(&self, scope: ScopeId, alias: &str) -> Option<&Symbol> {
        self.scopes[scope].symbols.iter().find(|s| {
            s.alias.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(alias))
                || (s.kind == SymbolKind::Calc && s.identifier.eq_ignore_ascii_case(alias))
        })
    }

    /// Resolves a PLAIN symbol's `prefix.identifier` (or bare `identifier`)
    /// against the TABLE symbols visible in `scope`, using `schema` to
    /// check column membership. Raises `"ambigous symbol"` (sic, see
    /// spec.md §4.7) when an unqualified identifier matches more than one
    /// table in scope.
    pub fn resolve_column(
        &self,
        scope: ScopeId,
        prefix: Option<&str>,
        ident: &str,
        schema: &dyn SchemaProvider,
    ) -> Result<(SmolStr, Type)> {
        if let Some(prefix) = prefix {
            let table = self
                .find_table_symbol(scope, prefix)
                .ok_or_else(|| Error::sql(format!("unknown table or alias '{prefix}'")))?;
            let relation = table.relation.clone().unwrap();
            let ty = schema
                .column_type(&relation, ident)
                .ok_or_else(|| Error::sql(format!("unknown column '{prefix}.{ident}'")))?;
            return Ok((relation, ty));
        }

        let tables = self.tables_in_scope(scope);
        let mut matches = Vec::new();
        for table in &tables {
            let relation = table.relation.clone().unwrap();
            if let Some(ty) = schema.column_type(&relation, ident) {
                matches.push((relation, ty));
            }
        }
        match matches.len() {
            0 => Err(Error::sql(format!("unknown column '{ident}'"))),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(Error::sql("ambigous symbol")),
        }
    }

    fn tables_in_scope(&self, scope: ScopeId) -> Vec<&Symbol> {
        let mut cur = Some(scope);
        let mut out = Vec::new();
        while let Some(s) = cur {
            out.extend(
                self.scopes[s]
                    .symbols
                    .iter()
                    .filter(|sym| sym.kind == SymbolKind::Table),
            );
            cur = self.scopes[s].parent;
        }
        out
    }

    /// Types every unresolved PLAIN symbol in `scope` against `schema`,
    /// then types every CALC symbol by asking its expression for its
    /// inferred type. Recurses into SUBQUERY scopes first, matching
    /// spec.md §4.7's ordering.
    pub fn type_symbol_table(
        &mut self,
        scope: ScopeId,
        schema: &dyn SchemaProvider,
        arena: &mut ExprArena,
        functions: &dyn FunctionSignatures,
    ) -> Result<()> {
        let subquery_scopes: Vec<ScopeId> = self.scopes[scope]
            .symbols
            .iter()
            .filter_map(|s| s.subquery_scope)
            .collect();
        for sub in subquery_scopes {
            self.type_symbol_table(sub, schema, arena, functions)?;
        }

        let table_names: Vec<SmolStr> = self
            .tables_in_scope(scope)
            .into_iter()
            .map(|t| t.identifier.clone())
            .collect();
        for name in &table_names {
            if !schema.has_table(name) {
                return Err(Error::sql(format!("unknown table '{name}'")));
            }
        }

        let plain_indices: Vec<usize> = self.scopes[scope]
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SymbolKind::Plain)
            .map(|(i, _)| i)
            .collect();
        for i in plain_indices {
            let (prefix, ident) = {
                let s = &self.scopes[scope].symbols[i];
                (s.prefix.clone(), s.identifier.clone())
            };
            let (relation, ty) = self.resolve_column(scope, prefix.as_deref(), &ident, schema)?;
            let s = &mut self.scopes[scope].symbols[i];
            s.relation = Some(relation);
            s.ty = ty;
        }

        let calc_indices: Vec<usize> = self.scopes[scope]
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SymbolKind::Calc)
            .map(|(i, _)| i)
            .collect();
        for i in calc_indices {
            let expr = self.scopes[scope].symbols[i].calc_expr.unwrap();
            let ty = infer_expr_type(arena, self, scope, expr, schema, functions)?;
            self.scopes[scope].symbols[i].ty = ty;
        }

        Ok(())
    }
}

/// A capability injected by the function registry: name/arity/return-type
/// lookups, used by the validator to type `FunctionCall` nodes and reject
/// unknown functions (spec.md §4.6/§4.9).
pub trait FunctionSignatures {
    fn return_type(&self, name: &str, arg_types: &[Type]) -> Option<Type>;
    fn exists(&self, name: &str) -> bool;
}

/// Bottom-up type inference over an expression, resolving `ColumnRef`
/// leaves against the symbol table/schema and function calls against the
/// registry. Populates `arena`'s per-node type slot as it goes so later
/// passes (the stack-machine compiler) never re-infer.
pub fn infer_expr_type(
    arena: &mut ExprArena,
    symtab: &SymbolTable,
    scope: ScopeId,
    node: NodeId,
    schema: &dyn SchemaProvider,
    functions: &dyn FunctionSignatures,
) -> Result<Type> {
    let ty = match arena.get(node).clone() {
        ExprNode::NullLiteral => Type::None,
        ExprNode::BoolLiteral(_) => Type::Boolean,
        ExprNode::IntLiteral(_) => Type::Int,
        ExprNode::RealLiteral(_) => Type::Real,
        ExprNode::StringLiteral(_) => Type::String,
        ExprNode::DateLiteral(_) => Type::Date,
        ExprNode::TimeLiteral(_) => Type::Time,
        ExprNode::TimestampLiteral(_) => Type::Timestamp,
        ExprNode::ColumnRef { prefix, ident } => {
            let (_, ty) = symtab.resolve_column(scope, prefix.as_deref(), &ident, schema)?;
            ty
        }
        ExprNode::Unary { expr, .. } => {
            infer_expr_type(arena, symtab, scope, expr, schema, functions)?
        }
        ExprNode::Binary { op, lhs, rhs } => {
            let lt = infer_expr_type(arena, symtab, scope, lhs, schema, functions)?;
            let rt = infer_expr_type(arena, symtab, scope, rhs, schema, functions)?;
            binary_result_type(op, lt, rt)?
        }
        ExprNode::Cast { ty, .. } => ty,
        ExprNode::Between { expr, low, high } => {
            infer_expr_type(arena, symtab, scope, expr, schema, functions)?;
            infer_expr_type(arena, symtab, scope, low, schema, functions)?;
            infer_expr_type(arena, symtab, scope, high, schema, functions)?;
            Type::Boolean
        }
        ExprNode::InList { expr, list } => {
            infer_expr_type(arena, symtab, scope, expr, schema, functions)?;
            for e in list {
                infer_expr_type(arena, symtab, scope, e, schema, functions)?;
            }
            Type::Boolean
        }
        ExprNode::Like { expr, pattern } => {
            infer_expr_type(arena, symtab, scope, expr, schema, functions)?;
            infer_expr_type(arena, symtab, scope, pattern, schema, functions)?;
            Type::Boolean
        }
        ExprNode::IsNull { expr, .. } | ExprNode::IsBool { expr, .. } => {
            infer_expr_type(arena, symtab, scope, expr, schema, functions)?;
            Type::Boolean
        }
        ExprNode::FunctionCall { name, args } => {
            let mut arg_types = Vec::with_capacity(args.len());
            for a in &args {
                arg_types.push(infer_expr_type(arena, symtab, scope, *a, schema, functions)?);
            }
            if !functions.exists(&name) {
                return Err(Error::sql(format!("function '{name}' not found")));
            }
            functions
                .return_type(&name, &arg_types)
                .ok_or_else(|| Error::sql(format!("calling function '{name}' with wrong parameter")))?
        }
        ExprNode::Case {
            operand,
            whens,
            else_expr,
        } => {
            if let Some(op) = operand {
                infer_expr_type(arena, symtab, scope, op, schema, functions)?;
            }
            let mut result = Type::None;
            for (w, t) in whens {
                infer_expr_type(arena, symtab, scope, w, schema, functions)?;
                let tt = infer_expr_type(arena, symtab, scope, t, schema, functions)?;
                if result == Type::None {
                    result = tt;
                }
            }
            if let Some(e) = else_expr {
                let et = infer_expr_type(arena, symtab, scope, e, schema, functions)?;
                if result == Type::None {
                    result = et;
                }
            }
            result
        }
    };
    arena.set_type(node, ty);
    Ok(ty)
}

fn binary_result_type(op: crate::ast::BinaryOp, lhs: Type, rhs: Type) -> Result<Type> {
    use crate::ast::BinaryOp::*;
    match op {
        And | Or => Ok(Type::Boolean),
        Eq | Neq | Lt | Le | Gt | Ge => Ok(Type::Boolean),
        Concat => Ok(Type::String),
        Add | Sub | Mul | Div | Mod => match (lhs, rhs) {
            (Type::Real, _) | (_, Type::Real) => Ok(Type::Real),
            (Type::Int, Type::Int) => Ok(Type::Int),
            (Type::Date, Type::Date) if op == Sub => Ok(Type::Int),
            (Type::Time, Type::Time) if op == Sub => Ok(Type::Int),
            (Type::Timestamp, Type::Timestamp) if op == Sub => Ok(Type::Int),
            (Type::None, _) | (_, Type::None) => Ok(Type::None),
            _ => Err(Error::sql(format!(
                "cannot apply operator '{}' to {lhs} and {rhs}",
                op.symbol()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSchema;
    impl SchemaProvider for FakeSchema {
        fn has_table(&self, name: &str) -> bool {
            name.eq_ignore_ascii_case("EMP") || name.eq_ignore_ascii_case("DEPT")
        }
        fn column_type(&self, table: &str, column: &str) -> Option<Type> {
            match (table.to_ascii_uppercase().as_str(), column.to_ascii_uppercase().as_str()) {
                ("EMP", "ID") => Some(Type::Int),
                ("EMP", "NAME") => Some(Type::String),
                ("EMP", "DID") => Some(Type::Int),
                ("DEPT", "ID") => Some(Type::Int),
                ("DEPT", "NAME") => Some(Type::String),
                _ => None,
            }
        }
    }

    struct FakeFunctions;
    impl FunctionSignatures for FakeFunctions {
        fn return_type(&self, _name: &str, _arg_types: &[Type]) -> Option<Type> {
            Some(Type::Int)
        }
        fn exists(&self, name: &str) -> bool {
            name.eq_ignore_ascii_case("COUNT")
        }
    }

    #[test]
    fn unqualified_column_resolves_single_table() {
        let mut symtab = SymbolTable::new();
        let scope = symtab.root_scope();
        symtab.add_symbol(scope, Symbol::table(SmolStr::new("EMP"), None));
        let schema = FakeSchema;
        let (relation, ty) = symtab.resolve_column(scope, None, "NAME", &schema).unwrap();
        assert_eq!(relation, "EMP");
        assert_eq!(ty, Type::String);
    }

    #[test]
    fn ambiguous_unqualified_column_errors() {
        let mut symtab = SymbolTable::new();
        let scope = symtab.root_scope();
        symtab.add_symbol(scope, Symbol::table(SmolStr::new("EMP"), None));
        symtab.add_symbol(scope, Symbol::table(SmolStr::new("DEPT"), None));
        let schema = FakeSchema;
        let err = symtab.resolve_column(scope, None, "ID", &schema).unwrap_err();
        assert_eq!(err.to_string(), "ambigous symbol");
    }

    #[test]
    fn missing_function_errors() {
        let mut arena = ExprArena::new();
        let mut symtab = SymbolTable::new();
        let scope = symtab.root_scope();
        let node = arena.push(
            ExprNode::FunctionCall {
                name: SmolStr::new("NOPE"),
                args: vec![],
            },
            scope,
        );
        let err = infer_expr_type(&mut arena, &symtab, scope, node, &FakeSchema, &FakeFunctions)
            .unwrap_err();
        assert_eq!(err.to_string(), "function 'NOPE' not found");
    }
}
