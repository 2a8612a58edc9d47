//! Optional AST-rewriting pass, run between analysis and code generation:
//! constant folding, common-subexpression detection on simple trees,
//! strength reduction of power-of-two multiply/divide/modulo, and dead-code
//! elimination of never-referenced declarations.

use crate::{
    ast::{
        AsmStmt, Expr, IdExpr, IterStmt, JumpKind, PrimaryExpr, SourceUnit,
        Stmt,
    },
    convert,
    error::{CompileError, Diagnostics},
    symtab::CompileCtx,
    token::{Token, TokenKind},
};
use std::collections::HashMap;

pub fn optimize(
    unit: &mut SourceUnit,
    ctx: &mut CompileCtx,
    diags: &mut Diagnostics,
) {
    dead_code_elimination(unit, ctx);
    let mut optimizer = Optimizer { diags };
    for node in &mut unit.nodes {
        optimizer.optimize_block(&mut node.stmts);
    }
}

struct Optimizer<'a> {
    diags: &'a mut Diagnostics,
}

impl<'a> Optimizer<'a> {
    fn optimize_block(&mut self, stmts: &mut Vec<Stmt>) {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(es) => {
                    if let Some(expr) = &mut es.expr {
                        self.optimize_expr(expr);
                    }
                }
                Stmt::Select(sel) => {
                    self.optimize_block(&mut sel.if_block);
                    self.optimize_block(&mut sel.else_block);
                }
                Stmt::Iter(iter) => match iter {
                    IterStmt::While { body, .. }
                    | IterStmt::DoWhile { body, .. } => {
                        self.optimize_block(body)
                    }
                    IterStmt::For { body, .. } => self.optimize_block(body),
                },
                Stmt::Jump(jump) => {
                    if jump.kind == JumpKind::Return {
                        if let Some(expr) = &mut jump.expr {
                            self.optimize_expr(expr);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn optimize_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Primary(p) => self.optimize_primary(p),
            Expr::Assign(assign) => self.optimize_expr(&mut assign.right),
            _ => {}
        }
    }

    fn optimize_primary(&mut self, p: &mut Box<PrimaryExpr>) {
        self.fold(p);
        detect_common_subexpression(p);
        strength_reduce(p);
    }

    /// Folds every pure-constant arithmetic subtree to a single literal.
    fn fold(&mut self, p: &mut Box<PrimaryExpr>) {
        if p.is_operator() && !has_id(p) && is_foldable(p) {
            let with_float = has_float_literal(p);
            let loc = p.tok.loc;
            if let Some(value) = self.eval(p, with_float) {
                **p = make_literal(value, with_float, loc);
            }
            return;
        }
        if let Some(left) = &mut p.left {
            self.fold(left);
        }
        if let Some(right) = &mut p.right {
            self.fold(right);
        }
    }

    /// Evaluates a foldable subtree. All arithmetic happens in doubles; `%`
    /// truncates to integers first, the way the language itself would.
    fn eval(&mut self, p: &PrimaryExpr, with_float: bool) -> Option<f64> {
        if !p.is_operator() {
            return if p.tok.kind == TokenKind::FloatLit {
                p.tok.lexeme.parse().ok()
            } else {
                Some(convert::token_to_decimal(&p.tok) as f64)
            };
        }
        let lhs = self.eval(p.left.as_ref()?, with_float)?;
        let rhs = self.eval(p.right.as_ref()?, with_float)?;
        match p.tok.kind {
            TokenKind::Plus => Some(lhs + rhs),
            TokenKind::Minus => Some(lhs - rhs),
            TokenKind::Star => Some(lhs * rhs),
            TokenKind::Slash => {
                if rhs == 0.0 {
                    self.diags.report(p.tok.loc, CompileError::DivideByZero);
                    None
                } else {
                    Some(lhs / rhs)
                }
            }
            TokenKind::Percent => {
                if rhs as i64 == 0 {
                    self.diags.report(p.tok.loc, CompileError::DivideByZero);
                    None
                } else {
                    Some(((lhs as i64) % (rhs as i64)) as f64)
                }
            }
            _ => {
                self.diags.report(
                    p.tok.loc,
                    CompileError::InvalidFoldOperator(p.tok.lexeme.clone()),
                );
                None
            }
        }
    }
}

fn has_id(p: &PrimaryExpr) -> bool {
    p.is_id()
        || p.left.as_ref().map_or(false, |l| has_id(l))
        || p.right.as_ref().map_or(false, |r| has_id(r))
        || p.unary.as_ref().map_or(false, |u| has_id(u))
}

fn has_float_literal(p: &PrimaryExpr) -> bool {
    (!p.is_operator() && p.tok.kind == TokenKind::FloatLit)
        || p.left.as_ref().map_or(false, |l| has_float_literal(l))
        || p.right.as_ref().map_or(false, |r| has_float_literal(r))
}

/// A subtree folds when every operator in it is plain arithmetic and every
/// leaf is a literal.
fn is_foldable(p: &PrimaryExpr) -> bool {
    if p.unary.is_some() {
        return false;
    }
    if p.is_operator() {
        use TokenKind::*;
        matches!(p.tok.kind, Plus | Minus | Star | Slash | Percent)
            && p.left.as_ref().map_or(false, |l| is_foldable(l))
            && p.right.as_ref().map_or(false, |r| is_foldable(r))
    } else {
        !p.is_id() && p.is_leaf()
    }
}

fn make_literal(
    value: f64,
    with_float: bool,
    loc: crate::util::SourceLoc,
) -> PrimaryExpr {
    let tok = if with_float {
        Token::new(TokenKind::FloatLit, format!("{:.6}", value), loc)
    } else {
        let int_value = value as i64;
        if int_value < 0 {
            let hex = convert::dec_to_hex(int_value as i32 as u32);
            Token::new(TokenKind::HexLit, format!("0x{}", hex), loc)
        } else {
            Token::new(TokenKind::DecLit, int_value.to_string(), loc)
        }
    };
    PrimaryExpr::literal(tok)
}

/// Flags `(A) op (A)` nodes whose two operand subtrees spell the same
/// expression; the generator evaluates the left subtree once and applies
/// the operator to that result against itself.
fn detect_common_subexpression(p: &mut PrimaryExpr) {
    if p.is_operator() && p.left.is_some() && p.right.is_some() {
        let mut left_tokens = Vec::new();
        let mut right_tokens = Vec::new();
        inorder_lexemes(p.left.as_ref().unwrap(), &mut left_tokens);
        inorder_lexemes(p.right.as_ref().unwrap(), &mut right_tokens);
        if !left_tokens.is_empty() && left_tokens == right_tokens {
            p.shared_operands = true;
        }
    }
    if let Some(left) = &mut p.left {
        detect_common_subexpression(left);
    }
    if let Some(right) = &mut p.right {
        detect_common_subexpression(right);
    }
}

fn inorder_lexemes(p: &PrimaryExpr, out: &mut Vec<String>) {
    if let Some(left) = &p.left {
        inorder_lexemes(left, out);
    }
    out.push(p.tok.lexeme.clone());
    if let Some(right) = &p.right {
        inorder_lexemes(right, out);
    }
}

fn power_of_two(value: i64) -> Option<i64> {
    if value > 0 && value & (value - 1) == 0 {
        Some(i64::from(value.trailing_zeros() as u8))
    } else {
        None
    }
}

/// Rewrites `x * 2^n` to `x << n`, `x / 2^n` to `x >> n`, and `x % 2^n` to
/// `x & (2^n - 1)`.
fn strength_reduce(p: &mut PrimaryExpr) {
    let mut rewrite: Option<(TokenKind, &'static str, i64)> = None;
    if p.is_operator() {
        if let Some(right) = &p.right {
            if !right.is_id()
                && right.is_leaf()
                && right.tok.kind.is_integer_literal()
            {
                let value = convert::token_to_decimal(&right.tok);
                rewrite = match (p.tok.kind, power_of_two(value)) {
                    (TokenKind::Star, Some(n)) => {
                        Some((TokenKind::Shl, "<<", n))
                    }
                    (TokenKind::Slash, Some(n)) => {
                        Some((TokenKind::Shr, ">>", n))
                    }
                    (TokenKind::Percent, Some(_)) => {
                        Some((TokenKind::Amp, "&", value - 1))
                    }
                    _ => None,
                };
            }
        }
    }
    if let Some((kind, lexeme, operand)) = rewrite {
        p.tok.kind = kind;
        p.tok.lexeme = lexeme.to_string();
        if let Some(right) = &mut p.right {
            right.tok.kind = TokenKind::DecLit;
            right.tok.lexeme = operand.to_string();
        }
    }
    if let Some(left) = &mut p.left {
        strength_reduce(left);
    }
    if let Some(right) = &mut p.right {
        strength_reduce(right);
    }
}

// ===== Dead-code elimination =====

/// Counts every identifier reference in the program, then unlinks symbols
/// whose count stayed at zero from their owning table.
fn dead_code_elimination(unit: &mut SourceUnit, ctx: &mut CompileCtx) {
    let mut global_counts: HashMap<String, usize> = ctx
        .globals
        .iter()
        .map(|(_, sym)| (sym.name.clone(), 0))
        .collect();

    for node in &mut unit.nodes {
        match &mut node.scope {
            Some(scope) => {
                let mut local_counts: HashMap<String, usize> = scope
                    .symtab
                    .iter()
                    .map(|(_, sym)| (sym.name.clone(), 0))
                    .collect();
                count_block(&node.stmts, &mut local_counts, &mut global_counts);
                for (name, count) in &local_counts {
                    if *count == 0 {
                        scope.symtab.remove(name);
                    }
                }
            }
            None => {
                let mut none = HashMap::new();
                count_block(&node.stmts, &mut none, &mut global_counts);
            }
        }
    }

    for (name, count) in &global_counts {
        if *count == 0 {
            ctx.globals.remove(name);
        }
    }
}

fn bump(
    name: &str,
    locals: &mut HashMap<String, usize>,
    globals: &mut HashMap<String, usize>,
) {
    if let Some(count) = locals.get_mut(name) {
        *count += 1;
    } else if let Some(count) = globals.get_mut(name) {
        *count += 1;
    }
}

fn count_primary(
    p: &PrimaryExpr,
    locals: &mut HashMap<String, usize>,
    globals: &mut HashMap<String, usize>,
) {
    if let Some(unary) = &p.unary {
        count_primary(unary, locals, globals);
    }
    if p.is_id() {
        bump(&p.tok.lexeme, locals, globals);
    }
    if let Some(left) = &p.left {
        count_primary(left, locals, globals);
    }
    if let Some(right) = &p.right {
        count_primary(right, locals, globals);
    }
}

fn count_id(
    idexp: &IdExpr,
    locals: &mut HashMap<String, usize>,
    globals: &mut HashMap<String, usize>,
) {
    if idexp.is_id {
        bump(&idexp.tok.lexeme, locals, globals);
        for sub in &idexp.subscript {
            if sub.kind == TokenKind::Ident {
                bump(&sub.lexeme, locals, globals);
            }
        }
    }
    if let Some(left) = &idexp.left {
        count_id(left, locals, globals);
    }
    if let Some(right) = &idexp.right {
        count_id(right, locals, globals);
    }
    if let Some(unary) = &idexp.unary {
        count_id(unary, locals, globals);
    }
}

fn count_expr(
    expr: &Expr,
    locals: &mut HashMap<String, usize>,
    globals: &mut HashMap<String, usize>,
) {
    match expr {
        Expr::Primary(p) => count_primary(p, locals, globals),
        Expr::Assign(assign) => {
            count_id(&assign.left, locals, globals);
            count_expr(&assign.right, locals, globals);
        }
        Expr::Cast(cast) => count_id(&cast.expr, locals, globals),
        Expr::Id(idexp) => count_id(idexp, locals, globals),
        Expr::Call(call) => {
            count_id(&call.callee, locals, globals);
            for arg in &call.args {
                count_expr(arg, locals, globals);
            }
        }
        Expr::Sizeof(_) => {}
    }
}

fn count_asm(
    stmts: &[AsmStmt],
    locals: &mut HashMap<String, usize>,
    globals: &mut HashMap<String, usize>,
) {
    for stmt in stmts {
        for op in stmt.outputs.iter().chain(stmt.inputs.iter()) {
            if let Some(expr) = &op.expr {
                count_expr(expr, locals, globals);
            }
        }
    }
}

fn count_block(
    stmts: &[Stmt],
    locals: &mut HashMap<String, usize>,
    globals: &mut HashMap<String, usize>,
) {
    for stmt in stmts {
        match stmt {
            Stmt::Expr(es) => {
                if let Some(expr) = &es.expr {
                    count_expr(expr, locals, globals);
                }
            }
            Stmt::Select(sel) => {
                if let Some(cond) = &sel.condition {
                    count_expr(cond, locals, globals);
                }
                count_block(&sel.if_block, locals, globals);
                count_block(&sel.else_block, locals, globals);
            }
            Stmt::Iter(iter) => match iter {
                IterStmt::While {
                    condition, body, ..
                }
                | IterStmt::DoWhile {
                    condition, body, ..
                } => {
                    if let Some(cond) = condition {
                        count_expr(cond, locals, globals);
                    }
                    count_block(body, locals, globals);
                }
                IterStmt::For {
                    init,
                    condition,
                    update,
                    body,
                    ..
                } => {
                    for expr in [init, condition, update].iter().copied().flatten()
                    {
                        count_expr(expr, locals, globals);
                    }
                    count_block(body, locals, globals);
                }
            },
            Stmt::Jump(jump) => {
                if let Some(expr) = &jump.expr {
                    count_expr(expr, locals, globals);
                }
            }
            Stmt::Asm(stmts) => count_asm(stmts, locals, globals),
            Stmt::Label(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analyze, parse};

    fn optimized(src: &str) -> (SourceUnit, CompileCtx, Diagnostics) {
        let mut diags = Diagnostics::new();
        let (mut unit, mut ctx) = parse::parse_source(src, &mut diags);
        assert!(!diags.has_errors(), "parse: {:?}", diags.errors());
        analyze::analyze(&mut unit, &ctx, &mut diags);
        assert!(!diags.has_errors(), "analyze: {:?}", diags.errors());
        optimize(&mut unit, &mut ctx, &mut diags);
        (unit, ctx, diags)
    }

    fn rhs_of(unit: &SourceUnit, node: usize) -> &PrimaryExpr {
        match &unit.nodes[node].stmts[0] {
            Stmt::Expr(es) => match es.expr.as_ref().unwrap() {
                Expr::Assign(a) => match a.right.as_ref() {
                    Expr::Primary(p) => p,
                    other => panic!("expected primary rhs, got {:?}", other),
                },
                other => panic!("expected assignment, got {:?}", other),
            },
            other => panic!("expected expression stmt, got {:?}", other),
        }
    }

    #[test]
    fn test_constant_folding() {
        let (unit, _, diags) =
            optimized("global int main() { int a; a = 1 + 2 * 3; }");
        assert!(!diags.has_errors());
        let rhs = match &unit.nodes[0].stmts[0] {
            Stmt::Expr(es) => match es.expr.as_ref().unwrap() {
                Expr::Assign(a) => match a.right.as_ref() {
                    Expr::Primary(p) => p,
                    other => panic!("unexpected rhs {:?}", other),
                },
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected stmt {:?}", other),
        };
        assert!(rhs.is_leaf());
        assert_eq!(rhs.tok.lexeme, "7");
        assert_eq!(rhs.tok.kind, TokenKind::DecLit);
    }

    #[test]
    fn test_folding_negative_result_goes_hex() {
        let (unit, _, _) =
            optimized("global int main() { int a; a = 1 - 5; }");
        let rhs = match &unit.nodes[0].stmts[0] {
            Stmt::Expr(es) => match es.expr.as_ref().unwrap() {
                Expr::Assign(a) => match a.right.as_ref() {
                    Expr::Primary(p) => p,
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        assert_eq!(rhs.tok.kind, TokenKind::HexLit);
        assert_eq!(rhs.tok.lexeme, "0xFFFFFFFC");
    }

    #[test]
    fn test_float_folding() {
        let (unit, _, _) =
            optimized("global int main() { float f; f = 1.5 + 2.5; }");
        let rhs = match &unit.nodes[0].stmts[0] {
            Stmt::Expr(es) => match es.expr.as_ref().unwrap() {
                Expr::Assign(a) => match a.right.as_ref() {
                    Expr::Primary(p) => p,
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        assert_eq!(rhs.tok.kind, TokenKind::FloatLit);
        assert_eq!(rhs.tok.lexeme, "4.000000");
    }

    #[test]
    fn test_divide_by_zero_reports() {
        let mut diags = Diagnostics::new();
        let (mut unit, mut ctx) = parse::parse_source(
            "global int main() { int a; a = 1 / 0; }",
            &mut diags,
        );
        analyze::analyze(&mut unit, &ctx, &mut diags);
        optimize(&mut unit, &mut ctx, &mut diags);
        assert!(diags
            .errors()
            .iter()
            .any(|d| d.error == CompileError::DivideByZero));
    }

    #[test]
    fn test_strength_reduction() {
        let (unit, _, _) = optimized(
            "global int main() { int a; int b; b = 0; a = b * 8; a = b / 4; a = b % 8; }",
        );
        let mul = rhs_of(&unit, 0);
        // statements: b = 0, a = b * 8, a = b / 4, a = b % 8
        let stmts = &unit.nodes[0].stmts;
        let shaped: Vec<(&str, &str)> = stmts[1..]
            .iter()
            .map(|s| match s {
                Stmt::Expr(es) => match es.expr.as_ref().unwrap() {
                    Expr::Assign(a) => match a.right.as_ref() {
                        Expr::Primary(p) => (
                            p.tok.lexeme.as_str(),
                            p.right.as_ref().unwrap().tok.lexeme.as_str(),
                        ),
                        _ => unreachable!(),
                    },
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(shaped, vec![("<<", "3"), (">>", "2"), ("&", "7")]);
        let _ = mul;
    }

    #[test]
    fn test_common_subexpression_detection() {
        let (unit, _, _) = optimized(
            "global int main() { int a; int b; b = 0; a = (b + b) * (b + b); }",
        );
        match &unit.nodes[0].stmts[1] {
            Stmt::Expr(es) => match es.expr.as_ref().unwrap() {
                Expr::Assign(a) => match a.right.as_ref() {
                    Expr::Primary(p) => {
                        assert_eq!(p.tok.lexeme, "*");
                        assert!(p.shared_operands);
                    }
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_dead_code_elimination() {
        let (_, ctx, _) = optimized(
            "int unused; int used; global int main() { return used; }",
        );
        assert!(!ctx.globals.contains("unused"));
        assert!(ctx.globals.contains("used"));
    }

    #[test]
    fn test_dead_local_elimination() {
        let (unit, _, _) = optimized(
            "global int main() { int dead; int live; live = 1; return live; }",
        );
        let scope = unit.nodes[0].scope.as_ref().unwrap();
        assert!(!scope.symtab.contains("dead"));
        assert!(scope.symtab.contains("live"));
    }
}
