//! AST node shapes (C6, data model only — §3 "AST node").
//!
//! Expression nodes live in an arena (`ExprArena`) rather than behind
//! reference-counted shared pointers, per spec.md §9's redesign guidance:
//! a `NodeId` is a plain index, the symbol table can hold it without
//! creating ownership cycles, and traversal is a flat match over the arena
//! instead of dynamic dispatch.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use smol_str::SmolStr;
use std::cell::RefCell;

use crate::symbol::ScopeId;
use crate::value::{Type, Variant};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Concat,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprNode {
    NullLiteral,
    BoolLiteral(bool),
    IntLiteral(i64),
    RealLiteral(f64),
    StringLiteral(SmolStr),
    DateLiteral(NaiveDate),
    TimeLiteral(NaiveTime),
    TimestampLiteral(NaiveDateTime),
    ColumnRef {
        prefix: Option<SmolStr>,
        ident: SmolStr,
    },
    Unary {
        op: UnaryOp,
        expr: NodeId,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Cast {
        ty: Type,
        expr: NodeId,
    },
    Between {
        expr: NodeId,
        low: NodeId,
        high: NodeId,
    },
    InList {
        expr: NodeId,
        list: Vec<NodeId>,
    },
    Like {
        expr: NodeId,
        pattern: NodeId,
    },
    IsNull {
        expr: NodeId,
        negated: bool,
    },
    IsBool {
        expr: NodeId,
        value: bool,
        negated: bool,
    },
    FunctionCall {
        name: SmolStr,
        args: Vec<NodeId>,
    },
    Case {
        operand: Option<NodeId>,
        whens: Vec<(NodeId, NodeId)>,
        else_expr: Option<NodeId>,
    },
}

/// Arena of expression nodes plus the per-node metadata spec.md §3 requires:
/// the owning scope, the inferred type (filled in by C7's validator), and
/// the symbol name published upward for aliased SELECT-list expressions.
#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
    scopes: Vec<ScopeId>,
    types: RefCell<Vec<Type>>,
    names: Vec<Option<SmolStr>>,
}

impl ExprArena {
    pub fn new() -> ExprArena {
        ExprArena::default()
    }

    pub fn push(&mut self, node: ExprNode, scope: ScopeId) -> NodeId {
        self.nodes.push(node);
        self.scopes.push(scope);
        self.types.borrow_mut().push(Type::None);
        self.names.push(None);
        self.nodes.len() - 1
    }

    pub fn get(&self, id: NodeId) -> &ExprNode {
        &self.nodes[id]
    }

    pub fn scope_of(&self, id: NodeId) -> ScopeId {
        self.scopes[id]
    }

    pub fn type_of(&self, id: NodeId) -> Type {
        self.types.borrow()[id]
    }

    pub fn set_type(&self, id: NodeId, ty: Type) {
        self.types.borrow_mut()[id] = ty;
    }

    pub fn symbol_name(&self, id: NodeId) -> Option<&SmolStr> {
        self.names[id].as_ref()
    }

    pub fn set_symbol_name(&mut self, id: NodeId, name: SmolStr) {
        self.names[id] = Some(name);
    }

    /// Re-emits the expression as SQL text. Used for the "parser
    /// determinism" property: printing then re-parsing an expression must
    /// reproduce the same AST (spec.md §8 item 5).
    pub fn print(&self, id: NodeId) -> String {
        match self.get(id) {
            ExprNode::NullLiteral => "NULL".to_string(),
            ExprNode::BoolLiteral(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            ExprNode::IntLiteral(v) => v.to_string(),
            ExprNode::RealLiteral(v) => format!("{v}"),
            ExprNode::StringLiteral(s) => format!("'{s}'"),
            ExprNode::DateLiteral(d) => format!("DATE'{}'", d.format("%Y-%m-%d")),
            ExprNode::TimeLiteral(t) => format!("TIME'{}'", t.format("%H:%M:%S")),
            ExprNode::TimestampLiteral(ts) => {
                format!("TIMESTAMP'{}'", ts.format("%Y-%m-%dT%H:%M:%S"))
            }
            ExprNode::ColumnRef { prefix, ident } => match prefix {
                Some(p) => format!("{p}.{ident}"),
                None => ident.to_string(),
            },
            ExprNode::Unary { op, expr } => {
                let sym = match op {
                    UnaryOp::Plus => "+",
                    UnaryOp::Minus => "-",
                    UnaryOp::Not => "NOT ",
                };
                format!("{sym}{}", self.print(*expr))
            }
            ExprNode::Binary { op, lhs, rhs } => {
                format!("({} {} {})", self.print(*lhs), op.symbol(), self.print(*rhs))
            }
            ExprNode::Cast { ty, expr } => format!("CAST({} AS {ty})", self.print(*expr)),
            ExprNode::Between { expr, low, high } => format!(
                "{} BETWEEN {} AND {}",
                self.print(*expr),
                self.print(*low),
                self.print(*high)
            ),
            ExprNode::InList { expr, list } => format!(
                "{} IN ({})",
                self.print(*expr),
                list.iter().map(|e| self.print(*e)).collect::<Vec<_>>().join(", ")
            ),
            ExprNode::Like { expr, pattern } => {
                format!("{} LIKE {}", self.print(*expr), self.print(*pattern))
            }
            ExprNode::IsNull { expr, negated } => format!(
                "{} IS{} NULL",
                self.print(*expr),
                if *negated { " NOT" } else { "" }
            ),
            ExprNode::IsBool { expr, value, negated } => format!(
                "{} IS{} {}",
                self.print(*expr),
                if *negated { " NOT" } else { "" },
                if *value { "TRUE" } else { "FALSE" }
            ),
            ExprNode::FunctionCall { name, args } => format!(
                "{name}({})",
                args.iter().map(|e| self.print(*e)).collect::<Vec<_>>().join(", ")
            ),
            ExprNode::Case {
                operand,
                whens,
                else_expr,
            } => {
                let mut s = "CASE".to_string();
                if let Some(op) = operand {
                    s.push(' ');
                    s.push_str(&self.print(*op));
                }
                for (w, t) in whens {
                    s.push_str(&format!(" WHEN {} THEN {}", self.print(*w), self.print(*t)));
                }
                if let Some(e) = else_expr {
                    s.push_str(&format!(" ELSE {}", self.print(*e)));
                }
                s.push_str(" END");
                s
            }
        }
    }

    /// Every identifier referenced transitively under `id`, for symbol
    /// resolution and stack-machine variable binding.
    pub fn collect_column_refs(&self, id: NodeId, out: &mut Vec<NodeId>) {
        match self.get(id) {
            ExprNode::ColumnRef { .. } => out.push(id),
            ExprNode::Unary { expr, .. } | ExprNode::Cast { expr, .. } => {
                self.collect_column_refs(*expr, out)
            }
            ExprNode::Binary { lhs, rhs, .. } => {
                self.collect_column_refs(*lhs, out);
                self.collect_column_refs(*rhs, out);
            }
            ExprNode::Between { expr, low, high } => {
                self.collect_column_refs(*expr, out);
                self.collect_column_refs(*low, out);
                self.collect_column_refs(*high, out);
            }
            ExprNode::InList { expr, list } => {
                self.collect_column_refs(*expr, out);
                for e in list {
                    self.collect_column_refs(*e, out);
                }
            }
            ExprNode::Like { expr, pattern } => {
                self.collect_column_refs(*expr, out);
                self.collect_column_refs(*pattern, out);
            }
            ExprNode::IsNull { expr, .. } | ExprNode::IsBool { expr, .. } => {
                self.collect_column_refs(*expr, out)
            }
            ExprNode::FunctionCall { args, .. } => {
                for a in args {
                    self.collect_column_refs(*a, out);
                }
            }
            ExprNode::Case {
                operand,
                whens,
                else_expr,
            } => {
                if let Some(op) = operand {
                    self.collect_column_refs(*op, out);
                }
                for (w, t) in whens {
                    self.collect_column_refs(*w, out);
                    self.collect_column_refs(*t, out);
                }
                if let Some(e) = else_expr {
                    self.collect_column_refs(*e, out);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub enum SelectItem {
    Star,
    QualifiedStar(SmolStr),
    Expr { expr: NodeId, alias: Option<SmolStr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Cross,
    Natural,
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone)]
pub enum TableRef {
    Named {
        name: SmolStr,
        alias: Option<SmolStr>,
    },
    Join {
        kind: JoinKind,
        left: Box<TableRef>,
        right: Box<TableRef>,
        on: Option<NodeId>,
        using: Vec<SmolStr>,
    },
    Subquery {
        query: Box<QueryExpr>,
        alias: SmolStr,
    },
}

#[derive(Debug, Clone)]
pub struct OrderItem {
    pub expr: NodeId,
    pub desc: bool,
}

#[derive(Debug, Clone)]
pub struct SelectStmt {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub where_clause: Option<NodeId>,
    pub group_by: Vec<NodeId>,
    pub having: Option<NodeId>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub scope: ScopeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone)]
pub struct SetOpStmt {
    pub op: SetOpKind,
    pub all: bool,
    pub left: Box<QueryExpr>,
    pub right: Box<QueryExpr>,
}

#[derive(Debug, Clone)]
pub enum QueryExpr {
    Select(SelectStmt),
    SetOp(SetOpStmt),
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: SmolStr,
    pub ty: Type,
    pub length: Option<usize>,
    pub primary_key: bool,
    pub unique: bool,
    pub not_null: bool,
    pub default: Option<Variant>,
    pub check: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub enum TableConstraint {
    PrimaryKey(Vec<SmolStr>),
    Unique(Vec<SmolStr>),
    Check(NodeId),
}

#[derive(Debug, Clone)]
pub struct CreateTableStmt {
    pub name: SmolStr,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
}

#[derive(Debug, Clone)]
pub struct MappingDef {
    pub pattern: String,
    pub delimiter: char,
    pub skip_first_line: bool,
}

#[derive(Debug, Clone)]
pub struct CreateMappingStmt {
    pub table: SmolStr,
    pub mappings: Vec<MappingDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainMode {
    Ast,
    Exec,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Query(QueryExpr),
    CreateTable(CreateTableStmt),
    DropTable(SmolStr),
    AlterTableAddColumn { table: SmolStr, column: ColumnDef },
    AlterTableDropColumn { table: SmolStr, column: SmolStr },
    CreateMapping(CreateMappingStmt),
    DropMapping(SmolStr),
    Explain { mode: ExplainMode, query: Box<QueryExpr> },
}
