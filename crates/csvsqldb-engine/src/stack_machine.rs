//! Stack machine: expression compiler and evaluator (C8).
//!
//! Grounded on the opcode list in the original's expression visitor
//! (`original_source/csvsqldb/*expression*`) split into a compile pass (AST
//! walk emitting postfix instructions, per spec.md §9's "discriminated union
//! of opcode + payload" guidance) and a flat evaluation loop over a single
//! `Variant` stack.

use smol_str::SmolStr;

use csvsqldb_core::ast::{BinaryOp, ExprArena, ExprNode, NodeId, UnaryOp};
use csvsqldb_core::value::{Type, Variant};
use csvsqldb_core::{Error, Result};

use crate::functions::FunctionRegistry;

#[derive(Debug, Clone)]
pub enum Opcode {
    PushConst(Variant),
    LoadVar(usize),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Pos,
    And,
    Or,
    Not,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Between,
    In(usize),
    LikeStatic(regex::Regex),
    LikeDynamic,
    IsNull(bool),
    IsBool(bool, bool),
    Cast(Type),
    Func { name: SmolStr, arity: usize },
    Case { arms: usize, has_else: bool },
    Nop,
}

/// A compiled expression plus the `{prefix, identifier}` variables it
/// references, in the order `LoadVar` slots were allocated. An operator
/// calls `resolve_variable` once per slot at `connect()` time to bind slot
/// indices to input-row column indices.
#[derive(Debug, Default, Clone)]
pub struct Program {
    pub instructions: Vec<Opcode>,
    pub variables: Vec<(Option<SmolStr>, SmolStr)>,
}

impl Program {
    fn alloc_var(&mut self, prefix: Option<SmolStr>, ident: SmolStr) -> usize {
        if let Some(idx) = self
            .variables
            .iter()
            .position(|(p, i)| *p == prefix && *i == ident)
        {
            return idx;
        }
        self.variables.push((prefix, ident));
        self.variables.len() - 1
    }
}

pub fn compile(arena: &ExprArena, node: NodeId) -> Result<Program> {
    let mut program = Program::default();
    compile_node(arena, node, &mut program)?;
    Ok(program)
}

fn compile_node(arena: &ExprArena, node: NodeId, program: &mut Program) -> Result<()> {
    match arena.get(node).clone() {
        ExprNode::NullLiteral => program.instructions.push(Opcode::PushConst(Variant::None)),
        ExprNode::BoolLiteral(b) => program.instructions.push(Opcode::PushConst(Variant::boolean(b))),
        ExprNode::IntLiteral(v) => program.instructions.push(Opcode::PushConst(Variant::int(v))),
        ExprNode::RealLiteral(v) => program.instructions.push(Opcode::PushConst(Variant::real(v))),
        ExprNode::StringLiteral(s) => {
            program.instructions.push(Opcode::PushConst(Variant::string(s)))
        }
        ExprNode::DateLiteral(d) => program.instructions.push(Opcode::PushConst(Variant::date(d))),
        ExprNode::TimeLiteral(t) => program.instructions.push(Opcode::PushConst(Variant::time(t))),
        ExprNode::TimestampLiteral(ts) => {
            program.instructions.push(Opcode::PushConst(Variant::timestamp(ts)))
        }
        ExprNode::ColumnRef { prefix, ident } => {
            let slot = program.alloc_var(prefix, ident);
            program.instructions.push(Opcode::LoadVar(slot));
        }
        ExprNode::Unary { op, expr } => {
            compile_node(arena, expr, program)?;
            program.instructions.push(match op {
                UnaryOp::Plus => Opcode::Pos,
                UnaryOp::Minus => Opcode::Neg,
                UnaryOp::Not => Opcode::Not,
            });
        }
        ExprNode::Binary { op, lhs, rhs } => {
            compile_node(arena, lhs, program)?;
            compile_node(arena, rhs, program)?;
            program.instructions.push(match op {
                BinaryOp::Add => Opcode::Add,
                BinaryOp::Sub => Opcode::Sub,
                BinaryOp::Mul => Opcode::Mul,
                BinaryOp::Div => Opcode::Div,
                BinaryOp::Mod => Opcode::Mod,
                BinaryOp::Eq => Opcode::Eq,
                BinaryOp::Neq => Opcode::Neq,
                BinaryOp::Lt => Opcode::Lt,
                BinaryOp::Le => Opcode::Le,
                BinaryOp::Gt => Opcode::Gt,
                BinaryOp::Ge => Opcode::Ge,
                BinaryOp::And => Opcode::And,
                BinaryOp::Or => Opcode::Or,
                BinaryOp::Concat => Opcode::Concat,
            });
        }
        ExprNode::Cast { ty, expr } => {
            compile_node(arena, expr, program)?;
            program.instructions.push(Opcode::Cast(ty));
        }
        ExprNode::Between { expr, low, high } => {
            compile_node(arena, expr, program)?;
            compile_node(arena, low, program)?;
            compile_node(arena, high, program)?;
            program.instructions.push(Opcode::Between);
        }
        ExprNode::InList { expr, list } => {
            compile_node(arena, expr, program)?;
            let n = list.len();
            for item in list {
                compile_node(arena, item, program)?;
            }
            program.instructions.push(Opcode::In(n));
        }
        ExprNode::Like { expr, pattern } => {
            compile_node(arena, expr, program)?;
            if let ExprNode::StringLiteral(s) = arena.get(pattern) {
                let regex = sql_like_to_regex(s)?;
                program.instructions.push(Opcode::LikeStatic(regex));
            } else {
                compile_node(arena, pattern, program)?;
                program.instructions.push(Opcode::LikeDynamic);
            }
        }
        ExprNode::IsNull { expr, negated } => {
            compile_node(arena, expr, program)?;
            program.instructions.push(Opcode::IsNull(negated));
        }
        ExprNode::IsBool { expr, value, negated } => {
            compile_node(arena, expr, program)?;
            program.instructions.push(Opcode::IsBool(value, negated));
        }
        ExprNode::FunctionCall { name, args } => {
            let arity = args.len();
            for a in args {
                compile_node(arena, a, program)?;
            }
            program.instructions.push(Opcode::Func { name, arity });
        }
        ExprNode::Case { operand, whens, else_expr } => {
            // Eagerly evaluates every branch condition and result onto the
            // stack; `Opcode::Case` then picks the first true arm at
            // runtime. Safe because expressions here have no side effects.
            let arms = whens.len();
            let has_else = else_expr.is_some();
            for (when, then) in whens {
                match &operand {
                    Some(op) => {
                        compile_node(arena, *op, program)?;
                        compile_node(arena, when, program)?;
                        program.instructions.push(Opcode::Eq);
                    }
                    None => compile_node(arena, when, program)?,
                }
                compile_node(arena, then, program)?;
            }
            if let Some(e) = else_expr {
                compile_node(arena, e, program)?;
            }
            program.instructions.push(Opcode::Case { arms, has_else });
        }
    }
    Ok(())
}

/// Translates SQL LIKE syntax (`%` any run, `_` any one char) into an
/// anchored regex.
fn sql_like_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c if "\\.+*?()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    regex::Regex::new(&out).map_err(|e| Error::sql(format!("invalid LIKE pattern: {e}")))
}

fn no_more_elements() -> Error {
    Error::exception("Cannot get next value, no more elements on stack")
}

fn no_more_on_top() -> Error {
    Error::exception("Cannot get next value, no more elements on top of stack")
}

/// Evaluates `program` against one row's bound variables (already resolved
/// to slot order) and the function registry.
pub fn eval(program: &Program, vars: &[Variant], functions: &FunctionRegistry) -> Result<Variant> {
    let mut stack: Vec<Variant> = Vec::with_capacity(program.instructions.len());
    for op in &program.instructions {
        match op {
            Opcode::PushConst(v) => stack.push(v.clone()),
            Opcode::LoadVar(slot) => {
                let v = vars.get(*slot).cloned().unwrap_or(Variant::None);
                stack.push(v);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let rhs = stack.pop().ok_or_else(no_more_on_top)?;
                let lhs = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(arithmetic(op, lhs, &rhs)?);
            }
            Opcode::Neg => {
                let v = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(v.negate()?);
            }
            Opcode::Pos => {}
            Opcode::And | Opcode::Or => {
                let rhs = stack.pop().ok_or_else(no_more_on_top)?;
                let lhs = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(bool_op(op, &lhs, &rhs)?);
            }
            Opcode::Not => {
                let v = stack.pop().ok_or_else(no_more_elements)?;
                let b = as_opt_bool(&v)?;
                stack.push(Variant::Boolean(b.map(|x| !x)));
            }
            Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let rhs = stack.pop().ok_or_else(no_more_on_top)?;
                let lhs = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(compare_op(op, &lhs, &rhs)?);
            }
            Opcode::Concat => {
                let rhs = stack.pop().ok_or_else(no_more_on_top)?;
                let lhs = stack.pop().ok_or_else(no_more_elements)?;
                if lhs.is_null() || rhs.is_null() {
                    stack.push(Variant::String(None));
                } else {
                    stack.push(Variant::string(format!(
                        "{}{}",
                        lhs.to_display_string(),
                        rhs.to_display_string()
                    )));
                }
            }
            Opcode::Between => {
                let high = stack.pop().ok_or_else(no_more_on_top)?;
                let low = stack.pop().ok_or_else(no_more_elements)?;
                let expr = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(between(&expr, &low, &high)?);
            }
            Opcode::In(n) => {
                let mut haystack = Vec::with_capacity(*n);
                for _ in 0..*n {
                    haystack.push(stack.pop().ok_or_else(no_more_on_top)?);
                }
                haystack.reverse();
                let needle = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(in_list(&needle, &haystack)?);
            }
            Opcode::LikeStatic(re) => {
                let subject = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(like(&subject, re)?);
            }
            Opcode::LikeDynamic => {
                let pattern = stack.pop().ok_or_else(no_more_on_top)?;
                let subject = stack.pop().ok_or_else(no_more_elements)?;
                if pattern.is_null() {
                    stack.push(Variant::Boolean(None));
                } else {
                    let re = sql_like_to_regex(pattern.as_str()?)?;
                    stack.push(like(&subject, &re)?);
                }
            }
            Opcode::IsNull(negated) => {
                let v = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(Variant::boolean(v.is_null() != *negated));
            }
            Opcode::IsBool(value, negated) => {
                let v = stack.pop().ok_or_else(no_more_elements)?;
                let is = !v.is_null() && v.as_bool()? == *value;
                stack.push(Variant::boolean(is != *negated));
            }
            Opcode::Cast(ty) => {
                let v = stack.pop().ok_or_else(no_more_elements)?;
                stack.push(v.cast(*ty)?);
            }
            Opcode::Func { name, arity } => {
                let mut args = Vec::with_capacity(*arity);
                for _ in 0..*arity {
                    args.push(stack.pop().ok_or_else(no_more_on_top)?);
                }
                args.reverse();
                stack.push(functions.call_scalar(name, &args)?);
            }
            Opcode::Case { arms, has_else } => {
                let else_val = if *has_else {
                    Some(stack.pop().ok_or_else(no_more_elements)?)
                } else {
                    None
                };
                let mut thens = Vec::with_capacity(*arms);
                let mut whens = Vec::with_capacity(*arms);
                for _ in 0..*arms {
                    thens.push(stack.pop().ok_or_else(no_more_elements)?);
                    whens.push(stack.pop().ok_or_else(no_more_elements)?);
                }
                let mut result = None;
                for (w, t) in whens.into_iter().rev().zip(thens.into_iter().rev()) {
                    if !w.is_null() && w.as_bool().unwrap_or(false) && result.is_none() {
                        result = Some(t);
                    }
                }
                stack.push(result.or(else_val).unwrap_or(Variant::None));
            }
            Opcode::Nop => {}
        }
    }
    stack.pop().ok_or_else(no_more_elements)
}

fn arithmetic(op: &Opcode, mut lhs: Variant, rhs: &Variant) -> Result<Variant> {
    match op {
        Opcode::Add => lhs.add_assign(rhs)?,
        Opcode::Sub => lhs.sub_assign(rhs)?,
        Opcode::Mul => lhs.mul_assign(rhs)?,
        Opcode::Div => lhs.div_assign(rhs)?,
        Opcode::Mod => lhs.mod_assign(rhs)?,
        _ => unreachable!(),
    }
    Ok(lhs)
}

fn as_opt_bool(v: &Variant) -> Result<Option<bool>> {
    match v {
        Variant::Boolean(b) => Ok(*b),
        Variant::None => Ok(None),
        _ => Err(Error::exception("expected BOOLEAN")),
    }
}

/// Three-valued AND/OR per spec.md §4.1.
fn bool_op(op: &Opcode, lhs: &Variant, rhs: &Variant) -> Result<Variant> {
    let a = as_opt_bool(lhs)?;
    let b = as_opt_bool(rhs)?;
    let result = match op {
        Opcode::And => match (a, b) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Opcode::Or => match (a, b) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        _ => unreachable!(),
    };
    Ok(Variant::Boolean(result))
}

/// `NULL = NULL` is false, matching spec.md's preserved two-valued quirk;
/// every other null comparison is also false (never NULL) here, since `IS
/// [NOT] NULL` is compiled to its own opcode and relational comparisons
/// always produce a concrete boolean.
fn compare_op(op: &Opcode, lhs: &Variant, rhs: &Variant) -> Result<Variant> {
    match op {
        Opcode::Eq => Ok(Variant::boolean(lhs == rhs)),
        Opcode::Neq => Ok(Variant::boolean(lhs != rhs)),
        _ => {
            if lhs.is_null() || rhs.is_null() {
                return Ok(Variant::Boolean(None));
            }
            let ord = lhs.compare(rhs)?.ok_or_else(|| Error::exception("expected comparable value"))?;
            let result = match op {
                Opcode::Lt => ord == std::cmp::Ordering::Less,
                Opcode::Le => ord != std::cmp::Ordering::Greater,
                Opcode::Gt => ord == std::cmp::Ordering::Greater,
                Opcode::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Variant::boolean(result))
        }
    }
}

/// `x BETWEEN NULL AND y = NULL`, matching spec.md §4.1's three-valued table.
fn between(expr: &Variant, low: &Variant, high: &Variant) -> Result<Variant> {
    if expr.is_null() || low.is_null() || high.is_null() {
        return Ok(Variant::Boolean(None));
    }
    let ge_low = expr.compare(low)?.is_some_and(|o| o != std::cmp::Ordering::Less);
    let le_high = expr.compare(high)?.is_some_and(|o| o != std::cmp::Ordering::Greater);
    Ok(Variant::boolean(ge_low && le_high))
}

fn in_list(needle: &Variant, haystack: &[Variant]) -> Result<Variant> {
    if needle.is_null() {
        return Ok(Variant::Boolean(None));
    }
    let mut saw_null = false;
    for candidate in haystack {
        if candidate.is_null() {
            saw_null = true;
            continue;
        }
        if needle == candidate {
            return Ok(Variant::boolean(true));
        }
    }
    if saw_null {
        Ok(Variant::Boolean(None))
    } else {
        Ok(Variant::boolean(false))
    }
}

fn like(subject: &Variant, re: &regex::Regex) -> Result<Variant> {
    if subject.is_null() {
        return Ok(Variant::Boolean(None));
    }
    Ok(Variant::boolean(re.is_match(subject.as_str()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use csvsqldb_core::ast::ExprArena;

    fn eval_expr(arena: &ExprArena, node: NodeId) -> Variant {
        let program = compile(arena, node).unwrap();
        eval(&program, &[], &FunctionRegistry::new()).unwrap()
    }

    #[test]
    fn arithmetic_precedence_like_expression() {
        let mut arena = ExprArena::new();
        let one = arena.push(ExprNode::IntLiteral(1), 0);
        let two = arena.push(ExprNode::IntLiteral(2), 0);
        let add = arena.push(
            ExprNode::Binary { op: BinaryOp::Add, lhs: one, rhs: two },
            0,
        );
        let three = arena.push(ExprNode::IntLiteral(3), 0);
        let mul = arena.push(
            ExprNode::Binary { op: BinaryOp::Mul, lhs: add, rhs: three },
            0,
        );
        assert_eq!(eval_expr(&arena, mul).as_int().unwrap(), 9);
    }

    #[test]
    fn null_and_false_is_false() {
        let mut arena = ExprArena::new();
        let null = arena.push(ExprNode::NullLiteral, 0);
        let typed_null = arena.push(ExprNode::Cast { ty: Type::Boolean, expr: null }, 0);
        let f = arena.push(ExprNode::BoolLiteral(false), 0);
        let and = arena.push(
            ExprNode::Binary { op: BinaryOp::And, lhs: typed_null, rhs: f },
            0,
        );
        let v = eval_expr(&arena, and);
        assert_eq!(v.as_bool().unwrap(), false);
    }

    #[test]
    fn between_with_literal_like() {
        let mut arena = ExprArena::new();
        let expr = arena.push(ExprNode::IntLiteral(5), 0);
        let low = arena.push(ExprNode::IntLiteral(1), 0);
        let high = arena.push(ExprNode::IntLiteral(10), 0);
        let node = arena.push(ExprNode::Between { expr, low, high }, 0);
        assert!(eval_expr(&arena, node).as_bool().unwrap());
    }

    #[test]
    fn empty_stack_error_message() {
        let program = Program {
            instructions: vec![Opcode::Not],
            variables: vec![],
        };
        let err = eval(&program, &[], &FunctionRegistry::new()).unwrap_err();
        assert_eq!(err.to_string(), "Cannot get next value, no more elements on stack");
    }
}
