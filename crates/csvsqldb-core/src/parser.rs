//! Recursive-descent parser producing AST nodes (C6).
//!
//! Grounded on `original_source/csvsqldb/sql_ast.h` for the node shapes and
//! on the grammar in spec.md §4.6/§6. Expression precedence, low to high:
//! `OR < AND < NOT < comparisons < concatenation < additive < multiplicative
//! < unary sign < CAST/function calls/parenthesization`.

use smol_str::SmolStr;

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{Keyword, Lexer, Punct, Token, TokenKind};
use crate::symbol::{FunctionSignatures, Symbol, SymbolKind, SymbolTable};
use crate::value::Type;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    pub arena: ExprArena,
    pub symtab: SymbolTable,
    current_scope: usize,
    functions: Option<&'a dyn FunctionSignatures>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str, functions: Option<&'a dyn FunctionSignatures>) -> Result<Parser<'a>> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next()?;
        let symtab = SymbolTable::new();
        let current_scope = symtab.root_scope();
        Ok(Parser {
            lexer,
            current,
            arena: ExprArena::new(),
            symtab,
            current_scope,
            functions,
        })
    }

    fn bump(&mut self) -> Result<Token> {
        let tok = self.current.clone();
        self.current = self.lexer.next()?;
        Ok(tok)
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::SqlParser {
            message: message.into(),
            line: self.current.line,
            column: self.current.column,
        }
    }

    fn is_punct(&self, p: Punct) -> bool {
        matches!(self.current.kind, TokenKind::Punct(x) if x == p)
    }

    fn is_keyword(&self, k: Keyword) -> bool {
        matches!(self.current.kind, TokenKind::Keyword(x) if x == k)
    }

    fn eat_punct(&mut self, p: Punct) -> Result<()> {
        if self.is_punct(p) {
            self.bump()?;
            Ok(())
        } else {
            Err(self.err(format!("expected punctuation, found '{}'", self.current.text)))
        }
    }

    fn eat_keyword(&mut self, k: Keyword) -> Result<()> {
        if self.is_keyword(k) {
            self.bump()?;
            Ok(())
        } else {
            Err(self.err(format!("expected {}, found '{}'", k.text(), self.current.text)))
        }
    }

    fn try_eat_keyword(&mut self, k: Keyword) -> Result<bool> {
        if self.is_keyword(k) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn push_expr(&mut self, node: ExprNode) -> NodeId {
        self.arena.push(node, self.current_scope)
    }

    /// Splits `;`-separated statements and parses each in turn.
    pub fn parse_statements(&mut self) -> Result<Vec<Statement>> {
        let mut out = Vec::new();
        while !matches!(self.current.kind, TokenKind::Eoi) {
            out.push(self.parse_statement()?);
            while self.is_punct(Punct::Semicolon) {
                self.bump()?;
            }
        }
        Ok(out)
    }

    pub fn parse_statement(&mut self) -> Result<Statement> {
        if self.is_keyword(Keyword::Explain) {
            return self.parse_explain();
        }
        if self.is_keyword(Keyword::Create) {
            return self.parse_create();
        }
        if self.is_keyword(Keyword::Drop) {
            return self.parse_drop();
        }
        if self.is_keyword(Keyword::Alter) {
            return self.parse_alter();
        }
        Ok(Statement::Query(self.parse_query_expr()?))
    }

    fn parse_explain(&mut self) -> Result<Statement> {
        self.eat_keyword(Keyword::Explain)?;
        let mode = if self.try_eat_keyword(Keyword::Ast)? {
            ExplainMode::Ast
        } else if self.try_eat_keyword(Keyword::Exec)? {
            ExplainMode::Exec
        } else {
            return Err(self.err("expected AST or EXEC after EXPLAIN"));
        };
        let query = Box::new(self.parse_query_expr()?);
        Ok(Statement::Explain { mode, query })
    }

    // ---- DDL ----

    fn parse_create(&mut self) -> Result<Statement> {
        self.eat_keyword(Keyword::Create)?;
        if self.try_eat_keyword(Keyword::Table)? {
            return self.parse_create_table();
        }
        if self.try_eat_keyword(Keyword::Mapping)? {
            return self.parse_create_mapping();
        }
        Err(self.err("expected TABLE or MAPPING after CREATE"))
    }

    fn parse_ident_text(&mut self) -> Result<SmolStr> {
        match self.current.kind {
            TokenKind::Identifier | TokenKind::QuotedIdentifier => {
                let tok = self.bump()?;
                Ok(SmolStr::new(tok.text))
            }
            _ => Err(self.err(format!("expected identifier, found '{}'", self.current.text))),
        }
    }

    fn parse_type(&mut self) -> Result<(Type, Option<usize>)> {
        let name = self.parse_ident_text()?;
        let ty = Type::parse_name(&name).ok_or_else(|| self.err(format!("unknown type '{name}'")))?;
        let mut length = None;
        if self.is_punct(Punct::LParen) {
            self.bump()?;
            let tok = self.bump()?;
            if let TokenKind::IntegerLiteral = tok.kind {
                length = tok.text.parse::<usize>().ok();
            }
            self.eat_punct(Punct::RParen)?;
        }
        Ok((ty, length))
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        let name = self.parse_ident_text()?;
        self.eat_punct(Punct::LParen)?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            if self.is_keyword(Keyword::Primary) {
                self.bump()?;
                self.eat_keyword(Keyword::Key)?;
                constraints.push(TableConstraint::PrimaryKey(self.parse_ident_list()?));
            } else if self.is_keyword(Keyword::Unique) {
                self.bump()?;
                constraints.push(TableConstraint::Unique(self.parse_ident_list()?));
            } else if self.is_keyword(Keyword::Check) {
                self.bump()?;
                self.eat_punct(Punct::LParen)?;
                let expr = self.parse_or_expr()?;
                self.eat_punct(Punct::RParen)?;
                constraints.push(TableConstraint::Check(expr));
            } else {
                columns.push(self.parse_column_def()?);
            }
            if self.is_punct(Punct::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.eat_punct(Punct::RParen)?;
        Ok(Statement::CreateTable(CreateTableStmt {
            name,
            columns,
            constraints,
        }))
    }

    fn parse_ident_list(&mut self) -> Result<Vec<SmolStr>> {
        self.eat_punct(Punct::LParen)?;
        let mut idents = vec![self.parse_ident_text()?];
        while self.is_punct(Punct::Comma) {
            self.bump()?;
            idents.push(self.parse_ident_text()?);
        }
        self.eat_punct(Punct::RParen)?;
        Ok(idents)
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.parse_ident_text()?;
        let (ty, length) = self.parse_type()?;
        let mut column = ColumnDef {
            name,
            ty,
            length,
            primary_key: false,
            unique: false,
            not_null: false,
            default: None,
            check: None,
        };
        loop {
            if self.try_eat_keyword(Keyword::Primary)? {
                self.eat_keyword(Keyword::Key)?;
                column.primary_key = true;
            } else if self.try_eat_keyword(Keyword::Unique)? {
                column.unique = true;
            } else if self.try_eat_keyword(Keyword::Not)? {
                self.eat_keyword(Keyword::Null)?;
                column.not_null = true;
            } else if self.try_eat_keyword(Keyword::NotNull)? {
                column.not_null = true;
            } else if self.try_eat_keyword(Keyword::Default)? {
                let expr = self.parse_unary_expr()?;
                let value = literal_to_variant(&self.arena, expr)
                    .ok_or_else(|| self.err("DEFAULT must be a literal"))?;
                column.default = Some(value);
            } else if self.try_eat_keyword(Keyword::Check)? {
                self.eat_punct(Punct::LParen)?;
                column.check = Some(self.parse_or_expr()?);
                self.eat_punct(Punct::RParen)?;
            } else {
                break;
            }
        }
        Ok(column)
    }

    fn parse_drop(&mut self) -> Result<Statement> {
        self.eat_keyword(Keyword::Drop)?;
        if self.try_eat_keyword(Keyword::Table)? {
            return Ok(Statement::DropTable(self.parse_ident_text()?));
        }
        if self.try_eat_keyword(Keyword::Mapping)? {
            return Ok(Statement::DropMapping(self.parse_ident_text()?));
        }
        Err(self.err("expected TABLE or MAPPING after DROP"))
    }

    fn parse_alter(&mut self) -> Result<Statement> {
        self.eat_keyword(Keyword::Alter)?;
        self.eat_keyword(Keyword::Table)?;
        let table = self.parse_ident_text()?;
        if self.try_eat_keyword(Keyword::Add)? {
            self.try_eat_keyword(Keyword::Column)?;
            let column = self.parse_column_def()?;
            return Ok(Statement::AlterTableAddColumn { table, column });
        }
        if self.try_eat_keyword(Keyword::Drop)? {
            self.try_eat_keyword(Keyword::Column)?;
            let column = self.parse_ident_text()?;
            return Ok(Statement::AlterTableDropColumn { table, column });
        }
        Err(self.err("expected ADD or DROP after ALTER TABLE <name>"))
    }

    fn parse_create_mapping(&mut self) -> Result<Statement> {
        let table = self.parse_ident_text()?;
        self.eat_punct(Punct::LParen)?;
        let pattern = self.parse_string_literal()?;
        let mut delimiter = ',';
        let mut skip_first_line = false;
        if self.is_punct(Punct::Comma) {
            self.bump()?;
            let d = self.parse_string_literal()?;
            delimiter = d.chars().next().unwrap_or(',');
            if self.is_punct(Punct::Comma) {
                self.bump()?;
                skip_first_line = self.is_keyword(Keyword::True);
                self.bump()?;
            }
        }
        self.eat_punct(Punct::RParen)?;
        Ok(Statement::CreateMapping(CreateMappingStmt {
            table,
            mappings: vec![MappingDef {
                pattern,
                delimiter,
                skip_first_line,
            }],
        }))
    }

    fn parse_string_literal(&mut self) -> Result<String> {
        match self.current.kind {
            TokenKind::StringLiteral => Ok(self.bump()?.text),
            _ => Err(self.err("expected string literal")),
        }
    }

    // ---- Query expressions ----

    pub fn parse_query_expr(&mut self) -> Result<QueryExpr> {
        let mut left = QueryExpr::Select(self.parse_select()?);
        loop {
            let op = if self.is_keyword(Keyword::Union) {
                SetOpKind::Union
            } else if self.is_keyword(Keyword::Intersect) {
                SetOpKind::Intersect
            } else if self.is_keyword(Keyword::Except) {
                SetOpKind::Except
            } else {
                break;
            };
            self.bump()?;
            let all = self.try_eat_keyword(Keyword::All)?;
            if !all {
                self.try_eat_keyword(Keyword::Distinct)?;
            }
            let right = QueryExpr::Select(self.parse_select()?);
            left = QueryExpr::SetOp(SetOpStmt {
                op,
                all,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_select(&mut self) -> Result<SelectStmt> {
        self.eat_keyword(Keyword::Select)?;
        let distinct = self.try_eat_keyword(Keyword::Distinct)?;
        if !distinct {
            self.try_eat_keyword(Keyword::All)?;
        }
        let items = self.parse_select_list()?;

        let mut from = None;
        if self.try_eat_keyword(Keyword::From)? {
            from = Some(self.parse_table_ref()?);
        }

        let where_clause = if self.try_eat_keyword(Keyword::Where)? {
            Some(self.parse_or_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.try_eat_keyword(Keyword::Group)? {
            self.eat_keyword(Keyword::By)?;
            group_by.push(self.parse_or_expr()?);
            while self.is_punct(Punct::Comma) {
                self.bump()?;
                group_by.push(self.parse_or_expr()?);
            }
        }

        let having = if self.try_eat_keyword(Keyword::Having)? {
            Some(self.parse_or_expr()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.try_eat_keyword(Keyword::Order)? {
            self.eat_keyword(Keyword::By)?;
            loop {
                let expr = self.parse_or_expr()?;
                let desc = if self.try_eat_keyword(Keyword::Desc)? {
                    true
                } else {
                    self.try_eat_keyword(Keyword::Asc)?;
                    false
                };
                order_by.push(OrderItem { expr, desc });
                if self.is_punct(Punct::Comma) {
                    self.bump()?;
                } else {
                    break;
                }
            }
        }

        let mut limit = None;
        let mut offset = None;
        if self.try_eat_keyword(Keyword::Limit)? {
            limit = Some(self.parse_int_literal()?);
            if self.try_eat_keyword(Keyword::Offset)? {
                offset = Some(self.parse_int_literal()?);
            }
        }

        Ok(SelectStmt {
            distinct,
            items,
            from,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
            offset,
            scope: self.current_scope,
        })
    }

    fn parse_int_literal(&mut self) -> Result<i64> {
        let tok = self.bump()?;
        match tok.kind {
            TokenKind::IntegerLiteral => tok
                .text
                .parse::<i64>()
                .map_err(|_| self.err("expected integer literal")),
            _ => Err(self.err("expected integer literal")),
        }
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>> {
        let mut items = vec![self.parse_select_item()?];
        while self.is_punct(Punct::Comma) {
            self.bump()?;
            items.push(self.parse_select_item()?);
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.is_punct(Punct::Star) {
            self.bump()?;
            return Ok(SelectItem::Star);
        }
        // T.* qualified asterisk lookahead.
        if matches!(self.current.kind, TokenKind::Identifier) {
            let ident = self.current.text.clone();
            let mut lookahead = self.lexer.clone();
            if let Ok(dot) = lookahead.next() {
                if matches!(dot.kind, TokenKind::Punct(Punct::Dot)) {
                    if let Ok(star) = lookahead.next() {
                        if matches!(star.kind, TokenKind::Punct(Punct::Star)) {
                            self.bump()?; // ident
                            self.bump()?; // dot
                            self.bump()?; // star
                            return Ok(SelectItem::QualifiedStar(SmolStr::new(ident)));
                        }
                    }
                }
            }
        }
        let expr = self.parse_or_expr()?;
        let alias = if self.try_eat_keyword(Keyword::As)? {
            Some(self.parse_ident_text()?)
        } else if matches!(self.current.kind, TokenKind::Identifier) {
            Some(self.parse_ident_text()?)
        } else {
            None
        };
        if let Some(alias) = &alias {
            self.arena.set_symbol_name(expr, alias.clone());
            self.symtab
                .add_symbol(self.current_scope, Symbol::calc(alias.clone(), expr));
        }
        Ok(SelectItem::Expr { expr, alias })
    }

    // ---- FROM / JOIN ----

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let mut left = self.parse_table_primary()?;
        loop {
            let kind = if self.try_eat_keyword(Keyword::Cross)? {
                self.eat_keyword(Keyword::Join)?;
                JoinKind::Cross
            } else if self.try_eat_keyword(Keyword::Natural)? {
                self.eat_keyword(Keyword::Join)?;
                JoinKind::Natural
            } else if self.try_eat_keyword(Keyword::Inner)? {
                self.eat_keyword(Keyword::Join)?;
                JoinKind::Inner
            } else if self.try_eat_keyword(Keyword::Left)? {
                self.try_eat_keyword(Keyword::Outer)?;
                self.eat_keyword(Keyword::Join)?;
                JoinKind::Left
            } else if self.try_eat_keyword(Keyword::Right)? {
                self.try_eat_keyword(Keyword::Outer)?;
                self.eat_keyword(Keyword::Join)?;
                JoinKind::Right
            } else if self.try_eat_keyword(Keyword::Full)? {
                self.try_eat_keyword(Keyword::Outer)?;
                self.eat_keyword(Keyword::Join)?;
                JoinKind::Full
            } else if self.is_keyword(Keyword::Join) {
                self.bump()?;
                JoinKind::Inner
            } else if self.is_punct(Punct::Comma) {
                self.bump()?;
                JoinKind::Cross
            } else {
                break;
            };

            let right = self.parse_table_primary()?;
            let mut on = None;
            let mut using = Vec::new();
            if self.try_eat_keyword(Keyword::On)? {
                on = Some(self.parse_or_expr()?);
            } else if self.try_eat_keyword(Keyword::Using)? {
                using = self.parse_ident_list()?;
            }
            left = TableRef::Join {
                kind,
                left: Box::new(left),
                right: Box::new(right),
                on,
                using,
            };
        }
        Ok(left)
    }

    fn parse_table_primary(&mut self) -> Result<TableRef> {
        if self.is_punct(Punct::LParen) {
            self.bump()?;
            let sub_scope = self.symtab.new_scope(self.current_scope);
            let saved = self.current_scope;
            self.current_scope = sub_scope;
            let query = self.parse_query_expr()?;
            self.current_scope = saved;
            self.eat_punct(Punct::RParen)?;
            self.try_eat_keyword(Keyword::As)?;
            let alias = self.parse_ident_text()?;
            self.symtab.add_symbol(
                self.current_scope,
                Symbol {
                    kind: SymbolKind::Subquery,
                    ty: Type::None,
                    identifier: alias.clone(),
                    prefix: None,
                    alias: Some(alias.clone()),
                    relation: Some(alias.clone()),
                    calc_expr: None,
                    subquery_scope: Some(sub_scope),
                },
            );
            return Ok(TableRef::Subquery {
                query: Box::new(query),
                alias,
            });
        }
        let name = self.parse_ident_text()?;
        let alias = if self.try_eat_keyword(Keyword::As)? {
            Some(self.parse_ident_text()?)
        } else if matches!(self.current.kind, TokenKind::Identifier) {
            Some(self.parse_ident_text()?)
        } else {
            None
        };
        self.symtab
            .add_symbol(self.current_scope, Symbol::table(name.clone(), alias.clone()));
        Ok(TableRef::Named { name, alias })
    }

    // ---- Expressions, precedence low to high ----

    pub fn parse_or_expr(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_and_expr()?;
        while self.try_eat_keyword(Keyword::Or)? {
            let rhs = self.parse_and_expr()?;
            lhs = self.push_expr(ExprNode::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
            });
        }
        Ok(lhs)
    }

    fn parse_and_expr(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_not_expr()?;
        while self.try_eat_keyword(Keyword::And)? {
            let rhs = self.parse_not_expr()?;
            lhs = self.push_expr(ExprNode::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            });
        }
        Ok(lhs)
    }

    fn parse_not_expr(&mut self) -> Result<NodeId> {
        if self.try_eat_keyword(Keyword::Not)? {
            let expr = self.parse_not_expr()?;
            return Ok(self.push_expr(ExprNode::Unary {
                op: UnaryOp::Not,
                expr,
            }));
        }
        self.parse_comparison_expr()
    }

    fn parse_comparison_expr(&mut self) -> Result<NodeId> {
        let lhs = self.parse_concat_expr()?;
        if self.try_eat_keyword(Keyword::Between)? {
            let low = self.parse_concat_expr()?;
            self.eat_keyword(Keyword::And)?;
            let high = self.parse_concat_expr()?;
            return Ok(self.push_expr(ExprNode::Between { expr: lhs, low, high }));
        }
        if self.try_eat_keyword(Keyword::In)? {
            self.eat_punct(Punct::LParen)?;
            let mut list = vec![self.parse_concat_expr()?];
            while self.is_punct(Punct::Comma) {
                self.bump()?;
                list.push(self.parse_concat_expr()?);
            }
            self.eat_punct(Punct::RParen)?;
            return Ok(self.push_expr(ExprNode::InList { expr: lhs, list }));
        }
        if self.try_eat_keyword(Keyword::Like)? {
            let pattern = self.parse_concat_expr()?;
            return Ok(self.push_expr(ExprNode::Like { expr: lhs, pattern }));
        }
        if self.try_eat_keyword(Keyword::Is)? {
            let negated = self.try_eat_keyword(Keyword::Not)?;
            if self.try_eat_keyword(Keyword::Null)? {
                return Ok(self.push_expr(ExprNode::IsNull { expr: lhs, negated }));
            }
            if self.try_eat_keyword(Keyword::True)? {
                return Ok(self.push_expr(ExprNode::IsBool {
                    expr: lhs,
                    value: true,
                    negated,
                }));
            }
            if self.try_eat_keyword(Keyword::False)? {
                return Ok(self.push_expr(ExprNode::IsBool {
                    expr: lhs,
                    value: false,
                    negated,
                }));
            }
            return Err(self.err("expected NULL, TRUE or FALSE after IS"));
        }
        let op = if self.is_punct(Punct::Eq) {
            BinaryOp::Eq
        } else if self.is_punct(Punct::Neq) {
            BinaryOp::Neq
        } else if self.is_punct(Punct::Lt) {
            BinaryOp::Lt
        } else if self.is_punct(Punct::Le) {
            BinaryOp::Le
        } else if self.is_punct(Punct::Gt) {
            BinaryOp::Gt
        } else if self.is_punct(Punct::Ge) {
            BinaryOp::Ge
        } else {
            return Ok(lhs);
        };
        self.bump()?;
        let rhs = self.parse_concat_expr()?;
        Ok(self.push_expr(ExprNode::Binary { op, lhs, rhs }))
    }

    fn parse_concat_expr(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_additive_expr()?;
        while self.is_punct(Punct::Concat) {
            self.bump()?;
            let rhs = self.parse_additive_expr()?;
            lhs = self.push_expr(ExprNode::Binary {
                op: BinaryOp::Concat,
                lhs,
                rhs,
            });
        }
        Ok(lhs)
    }

    fn parse_additive_expr(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_multiplicative_expr()?;
        loop {
            let op = if self.is_punct(Punct::Plus) {
                BinaryOp::Add
            } else if self.is_punct(Punct::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            self.bump()?;
            let rhs = self.parse_multiplicative_expr()?;
            lhs = self.push_expr(ExprNode::Binary { op, lhs, rhs });
        }
        Ok(lhs)
    }

    fn parse_multiplicative_expr(&mut self) -> Result<NodeId> {
        let mut lhs = self.parse_unary_expr()?;
        loop {
            let op = if self.is_punct(Punct::Star) {
                BinaryOp::Mul
            } else if self.is_punct(Punct::Slash) {
                BinaryOp::Div
            } else if self.is_punct(Punct::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            self.bump()?;
            let rhs = self.parse_unary_expr()?;
            lhs = self.push_expr(ExprNode::Binary { op, lhs, rhs });
        }
        Ok(lhs)
    }

    fn parse_unary_expr(&mut self) -> Result<NodeId> {
        if self.is_punct(Punct::Plus) {
            self.bump()?;
            let expr = self.parse_unary_expr()?;
            return Ok(self.push_expr(ExprNode::Unary {
                op: UnaryOp::Plus,
                expr,
            }));
        }
        if self.is_punct(Punct::Minus) {
            self.bump()?;
            let expr = self.parse_unary_expr()?;
            return Ok(self.push_expr(ExprNode::Unary {
                op: UnaryOp::Minus,
                expr,
            }));
        }
        self.parse_primary_expr()
    }

    fn parse_primary_expr(&mut self) -> Result<NodeId> {
        match self.current.kind.clone() {
            TokenKind::IntegerLiteral => {
                let tok = self.bump()?;
                let v = tok.text.parse::<i64>().map_err(|_| self.err("bad integer literal"))?;
                Ok(self.push_expr(ExprNode::IntLiteral(v)))
            }
            TokenKind::RealLiteral => {
                let tok = self.bump()?;
                let v = tok.text.parse::<f64>().map_err(|_| self.err("bad real literal"))?;
                Ok(self.push_expr(ExprNode::RealLiteral(v)))
            }
            TokenKind::StringLiteral => {
                let tok = self.bump()?;
                Ok(self.push_expr(ExprNode::StringLiteral(SmolStr::new(tok.text))))
            }
            TokenKind::BooleanLiteral => {
                let tok = self.bump()?;
                Ok(self.push_expr(ExprNode::BoolLiteral(tok.text.eq_ignore_ascii_case("TRUE"))))
            }
            TokenKind::DateLiteral => {
                let tok = self.bump()?;
                let d = chrono::NaiveDate::parse_from_str(&tok.text, "%Y-%m-%d")
                    .map_err(|_| self.err("bad DATE literal"))?;
                Ok(self.push_expr(ExprNode::DateLiteral(d)))
            }
            TokenKind::TimeLiteral => {
                let tok = self.bump()?;
                let t = chrono::NaiveTime::parse_from_str(&tok.text, "%H:%M:%S")
                    .map_err(|_| self.err("bad TIME literal"))?;
                Ok(self.push_expr(ExprNode::TimeLiteral(t)))
            }
            TokenKind::TimestampLiteral => {
                let tok = self.bump()?;
                let ts = chrono::NaiveDateTime::parse_from_str(&tok.text, "%Y-%m-%dT%H:%M:%S")
                    .map_err(|_| self.err("bad TIMESTAMP literal"))?;
                Ok(self.push_expr(ExprNode::TimestampLiteral(ts)))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.bump()?;
                Ok(self.push_expr(ExprNode::NullLiteral))
            }
            TokenKind::Keyword(Keyword::Cast) => self.parse_cast(),
            TokenKind::Keyword(Keyword::Case) => self.parse_case(),
            TokenKind::Punct(Punct::LParen) => {
                self.bump()?;
                let expr = self.parse_or_expr()?;
                self.eat_punct(Punct::RParen)?;
                Ok(expr)
            }
            TokenKind::Identifier | TokenKind::QuotedIdentifier => self.parse_ident_or_call(),
            _ => Err(self.err(format!("unexpected token '{}'", self.current.text))),
        }
    }

    fn parse_cast(&mut self) -> Result<NodeId> {
        self.eat_keyword(Keyword::Cast)?;
        self.eat_punct(Punct::LParen)?;
        let expr = self.parse_or_expr()?;
        self.eat_keyword(Keyword::As)?;
        let (ty, _) = self.parse_type()?;
        self.eat_punct(Punct::RParen)?;
        Ok(self.push_expr(ExprNode::Cast { ty, expr }))
    }

    fn parse_case(&mut self) -> Result<NodeId> {
        self.eat_keyword(Keyword::Case)?;
        let operand = if !self.is_keyword(Keyword::When) {
            Some(self.parse_or_expr()?)
        } else {
            None
        };
        let mut whens = Vec::new();
        while self.try_eat_keyword(Keyword::When)? {
            let when = self.parse_or_expr()?;
            self.eat_keyword(Keyword::Then)?;
            let then = self.parse_or_expr()?;
            whens.push((when, then));
        }
        let else_expr = if self.try_eat_keyword(Keyword::Else)? {
            Some(self.parse_or_expr()?)
        } else {
            None
        };
        self.eat_keyword(Keyword::End)?;
        Ok(self.push_expr(ExprNode::Case {
            operand,
            whens,
            else_expr,
        }))
    }

    fn parse_ident_or_call(&mut self) -> Result<NodeId> {
        let first = self.parse_ident_text()?;
        if self.is_punct(Punct::LParen) {
            self.bump()?;
            let mut args = Vec::new();
            if !self.is_punct(Punct::RParen) {
                if self.is_punct(Punct::Star) {
                    self.bump()?;
                } else {
                    args.push(self.parse_or_expr()?);
                    while self.is_punct(Punct::Comma) {
                        self.bump()?;
                        args.push(self.parse_or_expr()?);
                    }
                }
            }
            self.eat_punct(Punct::RParen)?;
            if let Some(functions) = self.functions {
                if !functions.exists(&first) {
                    return Err(self.err(format!("function '{first}' not found")));
                }
            }
            return Ok(self.push_expr(ExprNode::FunctionCall { name: first, args }));
        }
        if self.is_punct(Punct::Dot) {
            self.bump()?;
            let ident = self.parse_ident_text()?;
            let node = self.push_expr(ExprNode::ColumnRef {
                prefix: Some(first),
                ident,
            });
            self.symtab.add_symbol(
                self.current_scope,
                plain_symbol_from(&self.arena, node),
            );
            return Ok(node);
        }
        let node = self.push_expr(ExprNode::ColumnRef {
            prefix: None,
            ident: first,
        });
        self.symtab
            .add_symbol(self.current_scope, plain_symbol_from(&self.arena, node));
        Ok(node)
    }
}

fn plain_symbol_from(arena: &ExprArena, node: NodeId) -> Symbol {
    match arena.get(node) {
        ExprNode::ColumnRef { prefix, ident } => Symbol::plain(prefix.clone(), ident.clone()),
        _ => unreachable!("plain_symbol_from called on a non-ColumnRef node"),
    }
}

fn literal_to_variant(arena: &ExprArena, node: NodeId) -> Option<crate::value::Variant> {
    use crate::value::Variant;
    match arena.get(node) {
        ExprNode::NullLiteral => Some(Variant::None),
        ExprNode::BoolLiteral(b) => Some(Variant::boolean(*b)),
        ExprNode::IntLiteral(v) => Some(Variant::int(*v)),
        ExprNode::RealLiteral(v) => Some(Variant::real(*v)),
        ExprNode::StringLiteral(s) => Some(Variant::string(s.clone())),
        ExprNode::DateLiteral(d) => Some(Variant::date(*d)),
        ExprNode::TimeLiteral(t) => Some(Variant::time(*t)),
        ExprNode::TimestampLiteral(ts) => Some(Variant::timestamp(*ts)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_select() {
        let mut parser = Parser::new("SELECT 1 + 2 FROM SYSTEM_DUAL", None).unwrap();
        let stmt = parser.parse_statement().unwrap();
        match stmt {
            Statement::Query(QueryExpr::Select(select)) => {
                assert_eq!(select.items.len(), 1);
                assert!(select.from.is_some());
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn parses_between_and_like() {
        let mut parser =
            Parser::new("SELECT * FROM EMP WHERE NAME LIKE 'A%' AND ID BETWEEN 1 AND 10", None)
                .unwrap();
        let stmt = parser.parse_statement().unwrap();
        assert!(matches!(stmt, Statement::Query(_)));
    }

    #[test]
    fn parses_inner_join() {
        let mut parser = Parser::new(
            "SELECT E.NAME, D.NAME FROM EMP E INNER JOIN DEPT D ON E.DID = D.ID",
            None,
        )
        .unwrap();
        let stmt = parser.parse_statement().unwrap();
        match stmt {
            Statement::Query(QueryExpr::Select(select)) => {
                assert!(matches!(select.from, Some(TableRef::Join { .. })));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn parses_create_table() {
        let mut parser = Parser::new(
            "CREATE TABLE T(A INT PRIMARY KEY, B INT CHECK(B > 0))",
            None,
        )
        .unwrap();
        let stmt = parser.parse_statement().unwrap();
        match stmt {
            Statement::CreateTable(t) => {
                assert_eq!(t.name, "T");
                assert_eq!(t.columns.len(), 2);
                assert!(t.columns[0].primary_key);
            }
            _ => panic!("expected create table"),
        }
    }

    #[test]
    fn expression_printer_round_trips() {
        let mut parser = Parser::new("SELECT (1 + 2) * 3 FROM SYSTEM_DUAL", None).unwrap();
        let stmt = parser.parse_statement().unwrap();
        let expr = match stmt {
            Statement::Query(QueryExpr::Select(s)) => match &s.items[0] {
                SelectItem::Expr { expr, .. } => *expr,
                _ => panic!(),
            },
            _ => panic!(),
        };
        let printed = parser.arena.print(expr);
        let reparsed_sql = format!("SELECT {printed} FROM SYSTEM_DUAL");
        let mut reparsed = Parser::new(&reparsed_sql, None).unwrap();
        let stmt2 = reparsed.parse_statement().unwrap();
        let expr2 = match stmt2 {
            Statement::Query(QueryExpr::Select(s)) => match &s.items[0] {
                SelectItem::Expr { expr, .. } => *expr,
                _ => panic!(),
            },
            _ => panic!(),
        };
        assert_eq!(printed, reparsed.arena.print(expr2));
    }

    #[test]
    fn missing_function_rejected_at_parse_time() {
        struct NoFunctions;
        impl FunctionSignatures for NoFunctions {
            fn return_type(&self, _: &str, _: &[Type]) -> Option<Type> {
                None
            }
            fn exists(&self, _: &str) -> bool {
                false
            }
        }
        let functions = NoFunctions;
        let mut parser = Parser::new("SELECT NOPE(1) FROM SYSTEM_DUAL", Some(&functions)).unwrap();
        let err = parser.parse_statement().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
