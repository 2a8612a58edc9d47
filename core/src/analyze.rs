//! Static semantic analysis. Runs over the complete AST after parsing:
//! resolves every identifier to a symbol handle, enforces the operand rules
//! (pointer arithmetic, bitwise/mod operand types, subscripts, member
//! access, assignment compatibility), checks call arity, label/goto closure,
//! loop scoping of `break`/`continue`, and inline-asm constraints. Errors
//! are reported and traversal continues; nothing here aborts.

use crate::{
    ast::{
        AsmOperand, AsmStmt, AssignExpr, CallExpr, CastExpr, Expr,
        FunctionScope, IdExpr, IterStmt, JumpKind, JumpStmt, LabelStmt,
        OperatorArity, PrimaryExpr, SizeofExpr, SourceUnit, Stmt,
    },
    error::{CompileError, Diagnostics},
    symtab::{CompileCtx, SymbolRef, SymbolScope, SymbolTable, TypeSpec},
    token::{Token, TokenKind},
    util::SourceLoc,
};
use std::collections::HashMap;

/// Analyzes the whole unit in place, resolving identifiers and reporting
/// semantic errors into `diags`.
pub fn analyze(unit: &mut SourceUnit, ctx: &CompileCtx, diags: &mut Diagnostics) {
    let analyzer = Analyzer {
        ctx,
        diags,
        scope: None,
        labels: HashMap::new(),
        gotos: Vec::new(),
        loop_depth: 0,
    };
    analyzer.run(unit);
}

/// A flattened view of one symbol, copied out of the tables so checks can
/// report diagnostics without holding table borrows.
#[derive(Clone, Debug)]
struct SymView {
    name: String,
    is_ptr: bool,
    ptr_count: usize,
    is_array: bool,
    dims: usize,
    is_record: bool,
    record_name: Option<String>,
    first_kind: Option<TokenKind>,
}

impl SymView {
    fn is_float_value(&self) -> bool {
        !self.is_record
            && matches!(
                self.first_kind,
                Some(TokenKind::Float) | Some(TokenKind::Double)
            )
    }
}

struct Analyzer<'a> {
    ctx: &'a CompileCtx,
    diags: &'a mut Diagnostics,
    /// Taken out of the node currently being analyzed
    scope: Option<FunctionScope>,
    labels: HashMap<String, Token>,
    gotos: Vec<Token>,
    loop_depth: u32,
}

impl<'a> Analyzer<'a> {
    fn run(mut self, unit: &mut SourceUnit) {
        check_void_decls(&self.ctx.globals, self.diags);

        for node in &mut unit.nodes {
            self.scope = node.scope.take();
            if let Some(scope) = &self.scope {
                if let Some(func) = self.ctx.functions.get(&scope.func) {
                    if !func.is_extern
                        && func.params.iter().any(|p| p.sym.name.is_empty())
                    {
                        self.diags.report(
                            func.tok.loc,
                            CompileError::ParamIdentifierExpected(
                                func.name.clone(),
                            ),
                        );
                    }
                }
            }
            if let Some(scope) = self.scope.take() {
                check_void_decls(&scope.symtab, self.diags);
                self.scope = Some(scope);
            }

            let mut stmts = std::mem::take(&mut node.stmts);
            self.analyze_block(&mut stmts);
            node.stmts = stmts;

            self.check_gotos();
            self.labels.clear();
            node.scope = self.scope.take();
        }

        self.check_local_declarations(unit);
        self.check_global_assignments(unit);
    }

    // ===== Resolution =====

    fn search_id(&self, tok: &Token) -> Option<SymbolRef> {
        if let Some(scope) = &self.scope {
            if let Some(idx) = scope.symtab.index_of(&tok.lexeme) {
                return Some(SymbolRef {
                    scope: SymbolScope::Local,
                    index: idx,
                });
            }
            if let Some(func) = self.ctx.functions.get(&scope.func) {
                if let Some(idx) = func
                    .params
                    .iter()
                    .position(|p| p.sym.name == tok.lexeme)
                {
                    return Some(SymbolRef {
                        scope: SymbolScope::Param,
                        index: idx,
                    });
                }
            }
        }
        self.ctx.globals.index_of(&tok.lexeme).map(|idx| SymbolRef {
            scope: SymbolScope::Global,
            index: idx,
        })
    }

    fn view(&self, sref: &SymbolRef) -> Option<SymView> {
        let sym = self.ctx.symbol(sref, self.scope.as_ref())?;
        Some(SymView {
            name: sym.name.clone(),
            is_ptr: sym.is_ptr,
            ptr_count: sym.ptr_count,
            is_array: sym.is_array,
            dims: sym.array_dims.len(),
            is_record: sym.type_info.spec.is_record(),
            record_name: sym.type_info.spec.record_name().map(String::from),
            first_kind: sym.type_info.spec.primary().map(|t| t.kind),
        })
    }

    // ===== Statements =====

    fn analyze_block(&mut self, stmts: &mut Vec<Stmt>) {
        for stmt in stmts {
            match stmt {
                Stmt::Label(label) => self.analyze_label(label),
                Stmt::Expr(es) => {
                    if let Some(expr) = &mut es.expr {
                        self.analyze_expr(expr);
                    }
                }
                Stmt::Select(sel) => {
                    if let Some(cond) = &mut sel.condition {
                        self.analyze_expr(cond);
                    }
                    self.analyze_block(&mut sel.if_block);
                    self.analyze_block(&mut sel.else_block);
                }
                Stmt::Iter(iter) => {
                    self.loop_depth += 1;
                    match iter {
                        IterStmt::While {
                            condition, body, ..
                        }
                        | IterStmt::DoWhile {
                            condition, body, ..
                        } => {
                            if let Some(cond) = condition {
                                self.analyze_expr(cond);
                            }
                            self.analyze_block(body);
                        }
                        IterStmt::For {
                            init,
                            condition,
                            update,
                            body,
                            ..
                        } => {
                            if let Some(e) = init {
                                self.analyze_expr(e);
                            }
                            if let Some(e) = condition {
                                self.analyze_expr(e);
                            }
                            if let Some(e) = update {
                                self.analyze_expr(e);
                            }
                            self.analyze_block(body);
                        }
                    }
                    self.loop_depth -= 1;
                }
                Stmt::Jump(jump) => self.analyze_jump(jump),
                Stmt::Asm(stmts) => self.analyze_asm(stmts),
            }
        }
    }

    fn analyze_label(&mut self, label: &LabelStmt) {
        if self.labels.contains_key(&label.label.lexeme) {
            self.diags.report(
                label.label.loc,
                CompileError::DuplicateLabel(label.label.lexeme.clone()),
            );
        } else {
            self.labels
                .insert(label.label.lexeme.clone(), label.label.clone());
        }
    }

    fn analyze_jump(&mut self, jump: &mut JumpStmt) {
        match jump.kind {
            JumpKind::Break => {
                if self.loop_depth == 0 {
                    self.diags
                        .report(jump.tok.loc, CompileError::NotInLoop("break"));
                }
            }
            JumpKind::Continue => {
                if self.loop_depth == 0 {
                    self.diags.report(
                        jump.tok.loc,
                        CompileError::NotInLoop("continue"),
                    );
                }
            }
            JumpKind::Return => {
                if let Some(expr) = &mut jump.expr {
                    self.analyze_expr(expr);
                }
                self.check_return(jump);
            }
            JumpKind::Goto => {
                if let Some(label) = &jump.goto_label {
                    self.gotos.push(label.clone());
                }
            }
        }
    }

    fn check_return(&mut self, jump: &JumpStmt) {
        let scope = match &self.scope {
            Some(s) => s,
            None => return,
        };
        let func = match self.ctx.functions.get(&scope.func) {
            Some(f) => f,
            None => return,
        };
        let returns_void = func.return_type.spec.primary().map(|t| t.kind)
            == Some(TokenKind::Void)
            && func.ret_ptr_count == 0;
        if returns_void && jump.expr.is_some() {
            self.diags.report(jump.tok.loc, CompileError::ReturnInVoid);
        }
    }

    fn check_gotos(&mut self) {
        let gotos = std::mem::take(&mut self.gotos);
        for label in gotos {
            if !self.labels.contains_key(&label.lexeme) {
                self.diags.report(
                    label.loc,
                    CompileError::LabelMissing(label.lexeme.clone()),
                );
            }
        }
    }

    // ===== Expressions =====

    fn analyze_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Primary(p) => self.analyze_primary(p),
            Expr::Assign(a) => self.analyze_assign(a),
            Expr::Sizeof(s) => self.analyze_sizeof(s),
            Expr::Cast(c) => self.analyze_cast(c),
            Expr::Id(i) => self.analyze_id_expr(i),
            Expr::Call(c) => self.analyze_call(c),
        }
    }

    fn resolve_primary(&mut self, p: &mut PrimaryExpr) {
        if p.is_id() && p.symbol().is_none() {
            match self.search_id(&p.tok) {
                Some(sref) => p.set_symbol(sref),
                None => self.diags.report(
                    p.tok.loc,
                    CompileError::Undeclared(p.tok.lexeme.clone()),
                ),
            }
        }
        if let Some(left) = &mut p.left {
            self.resolve_primary(left);
        }
        if let Some(right) = &mut p.right {
            self.resolve_primary(right);
        }
        if let Some(unary) = &mut p.unary {
            self.resolve_primary(unary);
        }
    }

    fn analyze_primary(&mut self, p: &mut PrimaryExpr) {
        self.resolve_primary(p);

        if p.unary.is_some()
            && p.is_operator()
            && p.tok.kind == TokenKind::Tilde
        {
            let ok = self.check_unary_primary(p.unary.as_ref().unwrap());
            if !ok {
                self.diags
                    .report(p.tok.loc, CompileError::BitComplementOperand);
            }
            return;
        }

        // walk the tree in post order, pairing up the two factors feeding
        // each operator, and check their types against that operator
        let order = postorder(p);
        let mut factor_1: Option<&PrimaryExpr> = None;
        let mut factor_2: Option<&PrimaryExpr> = None;
        let mut checks: Vec<(
            &PrimaryExpr,
            Option<&PrimaryExpr>,
            Option<&PrimaryExpr>,
        )> = Vec::new();
        for node in order {
            if node.is_operator() {
                checks.push((node, factor_1, factor_2));
                factor_1 = None;
                factor_2 = None;
            } else if factor_1.is_none() && factor_2.is_none() {
                factor_1 = Some(node);
            } else if factor_1.is_some() && factor_2.is_some() {
                factor_1 = factor_2;
                factor_2 = Some(node);
            } else {
                factor_2 = Some(node);
            }
        }
        for (op, f1, f2) in checks {
            if let (Some(f1), Some(f2)) = (f1, f2) {
                self.check_pointer_arithmetic(op, f1, f2);
            }
            self.check_binary_type_args(op, f1, f2);
        }
    }

    /// True when the subtree contains no float-typed value and no pointer;
    /// those are rejected for `~` and the bitwise compound assignments.
    fn check_unary_primary(&self, p: &PrimaryExpr) -> bool {
        let mut ok = true;
        if p.is_id() {
            if let Some(view) = p.symbol().and_then(|r| self.view(r)) {
                if view.is_float_value() || view.is_ptr {
                    ok = false;
                }
            }
        } else if !p.is_operator() && p.tok.kind == TokenKind::FloatLit {
            ok = false;
        }
        ok && p
            .left
            .as_ref()
            .map_or(true, |l| self.check_unary_primary(l))
            && p.right
                .as_ref()
                .map_or(true, |r| self.check_unary_primary(r))
    }

    /// Does the subtree contain any float-typed identifier or float literal?
    fn primary_has_float(&self, p: &PrimaryExpr) -> bool {
        if p.is_id() {
            if let Some(view) = p.symbol().and_then(|r| self.view(r)) {
                if view.is_float_value() {
                    return true;
                }
            }
        } else if !p.is_operator() && p.tok.kind == TokenKind::FloatLit {
            return true;
        }
        p.left.as_ref().map_or(false, |l| self.primary_has_float(l))
            || p.right.as_ref().map_or(false, |r| self.primary_has_float(r))
            || p.unary.as_ref().map_or(false, |u| self.primary_has_float(u))
    }

    fn check_pointer_arithmetic(
        &mut self,
        op: &PrimaryExpr,
        f1: &PrimaryExpr,
        f2: &PrimaryExpr,
    ) {
        let is_add_sub = matches!(op.tok.kind, TokenKind::Plus | TokenKind::Minus);
        let v1 = f1.symbol().and_then(|r| self.view(r));
        let v2 = f2.symbol().and_then(|r| self.view(r));
        let f1_ptr = f1.is_id() && v1.as_ref().map_or(false, |v| v.is_ptr);
        let f2_ptr = f2.is_id() && v2.as_ref().map_or(false, |v| v.is_ptr);

        if !f1.is_id() && !f2.is_id() {
            return;
        }
        if f1_ptr && !f2.is_id() {
            if is_add_sub {
                if matches!(f2.tok.kind, TokenKind::FloatLit | TokenKind::StrLit)
                {
                    self.diags.report(
                        op.tok.loc,
                        CompileError::InvalidBinaryOperand {
                            op: op.tok.lexeme.clone(),
                            operand: f2.tok.lexeme.clone(),
                        },
                    );
                }
            } else {
                self.diags.report(
                    op.tok.loc,
                    CompileError::InvalidBinaryOperand {
                        op: op.tok.lexeme.clone(),
                        operand: f1.tok.lexeme.clone(),
                    },
                );
            }
        } else if f2_ptr && !f1.is_id() {
            if is_add_sub {
                if matches!(f1.tok.kind, TokenKind::FloatLit | TokenKind::StrLit)
                {
                    self.diags.report(
                        op.tok.loc,
                        CompileError::InvalidBinaryOperand {
                            op: op.tok.lexeme.clone(),
                            operand: f1.tok.lexeme.clone(),
                        },
                    );
                }
            } else {
                self.diags.report(
                    op.tok.loc,
                    CompileError::InvalidBinaryOperand {
                        op: op.tok.lexeme.clone(),
                        operand: f2.tok.lexeme.clone(),
                    },
                );
            }
        } else if f1.is_id() && f2.is_id() {
            if f1_ptr && f2_ptr {
                self.diags.report(
                    op.tok.loc,
                    CompileError::InvalidBinaryOperands(op.tok.lexeme.clone()),
                );
            } else if (f1_ptr || f2_ptr) && !is_add_sub {
                self.diags.report(
                    op.tok.loc,
                    CompileError::InvalidBinaryOperands(op.tok.lexeme.clone()),
                );
            }
        }
    }

    /// Operand rules for `% & | ^ << >>`: no float or pointer operands, and
    /// the shift amount must be a literal.
    fn check_binary_type_args(
        &mut self,
        op: &PrimaryExpr,
        f1: Option<&PrimaryExpr>,
        f2: Option<&PrimaryExpr>,
    ) {
        use TokenKind::*;
        let k = op.tok.kind;
        if !matches!(k, Percent | Amp | Pipe | Caret | Shl | Shr) {
            return;
        }
        if matches!(k, Shl | Shr) {
            if let Some(f2) = f2 {
                if f2.is_id() {
                    self.diags
                        .report(op.tok.loc, CompileError::ShiftLiteralExpected);
                    return;
                }
            }
        }
        for factor in [f1, f2].iter().copied().flatten() {
            if factor.is_id() {
                if let Some(view) =
                    factor.symbol().and_then(|r| self.view(r))
                {
                    if view.is_ptr || view.is_float_value() {
                        self.diags.report(
                            op.tok.loc,
                            CompileError::InvalidBinaryOperand {
                                op: op.tok.lexeme.clone(),
                                operand: factor.tok.lexeme.clone(),
                            },
                        );
                        return;
                    }
                }
            } else if factor.tok.kind == TokenKind::FloatLit {
                self.diags.report(
                    op.tok.loc,
                    CompileError::InvalidBinaryOperand {
                        op: op.tok.lexeme.clone(),
                        operand: factor.tok.lexeme.clone(),
                    },
                );
                return;
            }
        }
    }

    // ===== Identifier expressions =====

    fn analyze_id_expr(&mut self, idexp: &mut IdExpr) {
        if idexp.unary.is_some() && idexp.is_operator {
            match idexp.tok.kind {
                TokenKind::Inc | TokenKind::Dec | TokenKind::AddrOf => {
                    let unary = idexp.unary.as_mut().unwrap();
                    self.analyze_id_expr(unary);
                    return;
                }
                _ => {}
            }
        }
        if idexp.is_ptr && idexp.unary.is_some() && !idexp.is_operator {
            // pointer indirection wrapper
            let unary = idexp.unary.as_mut().unwrap();
            self.analyze_id_expr(unary);
            return;
        }
        self.resolve_chain(idexp);
    }

    /// Resolves one member-access chain left to right, checking dot/arrow
    /// agreement and member existence. Returns the final resolved symbol.
    fn resolve_chain(
        &mut self,
        node: &mut IdExpr,
    ) -> Option<(SymbolRef, Token)> {
        if node.is_operator && node.tok.kind.is_member_op() {
            let op_kind = node.tok.kind;
            let (lref, ltok) = {
                let left = node.left.as_mut()?;
                self.resolve_chain(left)?
            };
            let lview = self.view(&lref)?;
            match op_kind {
                TokenKind::Arrow if !lview.is_ptr => {
                    self.diags.report(ltok.loc, CompileError::DotExpected)
                }
                TokenKind::Dot if lview.is_ptr => {
                    self.diags.report(ltok.loc, CompileError::ArrowExpected)
                }
                _ => {}
            }
            match lview.record_name {
                Some(recname) => {
                    let right = node.right.as_mut()?;
                    let member_idx = self
                        .ctx
                        .records
                        .get(&recname)
                        .and_then(|r| r.members.index_of(&right.tok.lexeme));
                    match member_idx {
                        Some(idx) => {
                            let sref = SymbolRef {
                                scope: SymbolScope::Record(recname),
                                index: idx,
                            };
                            right.symbol = Some(sref.clone());
                            Some((sref, right.tok.clone()))
                        }
                        None => {
                            self.diags.report(
                                right.tok.loc,
                                CompileError::NoSuchMember {
                                    record: recname,
                                    member: right.tok.lexeme.clone(),
                                },
                            );
                            None
                        }
                    }
                }
                None => {
                    self.diags.report(
                        ltok.loc,
                        CompileError::NotARecord(ltok.lexeme.clone()),
                    );
                    None
                }
            }
        } else if node.is_id {
            match self.search_id(&node.tok) {
                Some(sref) => {
                    node.symbol = Some(sref.clone());
                    if let Some(view) = self.view(&sref) {
                        if !view.is_record
                            && (view.is_array
                                || view.is_ptr
                                || node.is_subscript)
                        {
                            self.check_array_subscript(node, &view);
                        }
                    }
                    Some((sref, node.tok.clone()))
                }
                None => {
                    self.diags.report(
                        node.tok.loc,
                        CompileError::Undeclared(node.tok.lexeme.clone()),
                    );
                    None
                }
            }
        } else if node.unary.is_some() {
            let unary = node.unary.as_mut().unwrap();
            self.resolve_chain(unary)
        } else {
            None
        }
    }

    fn check_array_subscript(&mut self, node: &IdExpr, view: &SymView) {
        let ok = if view.is_array {
            node.subscript.len() <= view.dims
        } else if view.is_ptr {
            node.subscript.len() <= view.ptr_count
        } else {
            false
        };
        if !ok {
            self.diags.report(
                node.tok.loc,
                CompileError::SubscriptNotArray(node.tok.lexeme.clone()),
            );
            self.diags.report(
                node.tok.loc,
                CompileError::SubscriptDimensionMismatch(
                    node.tok.lexeme.clone(),
                ),
            );
        }
    }

    // ===== sizeof / cast / call =====

    fn analyze_sizeof(&mut self, s: &SizeofExpr) {
        if let TypeSpec::Record(tok) = &s.target {
            if !self.ctx.records.contains(&tok.lexeme)
                && self.search_id(tok).is_none()
            {
                self.diags.report(
                    tok.loc,
                    CompileError::Undeclared(tok.lexeme.clone()),
                );
            }
        }
    }

    fn analyze_cast(&mut self, c: &mut CastExpr) {
        self.analyze_id_expr(&mut c.expr);
    }

    fn analyze_call(&mut self, call: &mut CallExpr) {
        let name = call.callee.tok.lexeme.clone();
        match self.ctx.functions.get(&name) {
            None => {
                self.diags.report(
                    call.callee.tok.loc,
                    CompileError::UndeclaredFunction(name),
                );
            }
            Some(func) => {
                if func.params.len() != call.args.len() {
                    let err = CompileError::ArityMismatch {
                        func: func.name.clone(),
                        expected: func.params.len(),
                    };
                    self.diags.report(call.callee.tok.loc, err);
                }
            }
        }
        for arg in &mut call.args {
            self.analyze_expr(arg);
        }
    }

    // ===== Assignment =====

    fn analyze_assign(&mut self, assign: &mut AssignExpr) {
        self.analyze_id_expr(&mut assign.left);
        if assign.op.kind != TokenKind::Assign {
            self.simplify_compound(assign);
        }
        self.analyze_expr(&mut assign.right);

        let (tref, ttok) = match assign_target(&assign.left) {
            Some(t) => t,
            None => return,
        };
        let tview = match self.view(&tref) {
            Some(v) => v,
            None => return,
        };
        let op_loc = assign.op.loc;
        let op_kind = assign.op.kind;
        let op_lexeme = assign.op.lexeme.clone();

        match assign.right.as_ref() {
            Expr::Primary(p) => self.check_assign_primary(
                op_loc, op_kind, &op_lexeme, &tview, &ttok, p,
            ),
            Expr::Cast(c) => {
                self.check_assign_cast(op_loc, &tview, &ttok, c)
            }
            Expr::Id(i) => self.check_assign_id(
                op_loc, op_kind, &op_lexeme, &tview, &ttok, i,
            ),
            Expr::Call(c) => self.check_assign_call(op_loc, &tview, &ttok, c),
            _ => {}
        }
    }

    /// Rewrites `x op= e` into `x = x op e` when the left side is a simple
    /// identifier; the generator only ever sees plain assignments.
    fn simplify_compound(&mut self, assign: &mut AssignExpr) {
        use TokenKind::*;
        if assign.left.left.is_some() || assign.left.right.is_some() {
            return;
        }
        let (new_kind, new_lexeme) = match assign.op.kind {
            AddAssign => (Plus, "+"),
            SubAssign => (Minus, "-"),
            MulAssign => (Star, "*"),
            DivAssign => (Slash, "/"),
            ModAssign => (Percent, "%"),
            ShlAssign => (Shl, "<<"),
            ShrAssign => (Shr, ">>"),
            AndAssign => (Amp, "&"),
            OrAssign => (Pipe, "|"),
            XorAssign => (Caret, "^"),
            _ => return,
        };
        let op_loc = assign.op.loc;
        assign.op.kind = Assign;
        assign.op.lexeme = "=".to_string();

        let mut left_node = PrimaryExpr::ident(assign.left.tok.clone());
        if let Some(sref) = self.search_id(&assign.left.tok) {
            left_node.set_symbol(sref);
        }
        if let Expr::Primary(rhs) = assign.right.as_mut() {
            let old = std::mem::replace(
                rhs,
                Box::new(PrimaryExpr::literal(Token::new(
                    TokenKind::DecLit,
                    "0",
                    op_loc,
                ))),
            );
            let mut op_node = PrimaryExpr::operator(
                Token::new(new_kind, new_lexeme, op_loc),
                OperatorArity::Binary,
            );
            op_node.left = Some(Box::new(left_node));
            op_node.right = Some(old);
            *rhs = Box::new(op_node);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_assign_primary(
        &mut self,
        op_loc: crate::util::SourceLoc,
        op_kind: TokenKind,
        op_lexeme: &str,
        tview: &SymView,
        ttok: &Token,
        p: &PrimaryExpr,
    ) {
        if is_bitwise_compound(op_kind) && !self.check_unary_primary(p) {
            self.diags.report(
                op_loc,
                CompileError::SimpleTypeOperandExpected(op_lexeme.to_string()),
            );
            return;
        }

        let pview = p.symbol().and_then(|r| self.view(r));
        let p_is_ptr_id =
            p.is_id() && pview.as_ref().map_or(false, |v| v.is_ptr);

        if tview.is_ptr && p_is_ptr_id {
            // ptr = ptr: type tags must agree
            let pv = pview.as_ref().unwrap();
            if tview.is_record != pv.is_record {
                self.diags.report(
                    op_loc,
                    CompileError::IncompatibleAssignment(ttok.lexeme.clone()),
                );
            }
        } else {
            // a pointer may absorb its own arithmetic (`p = p + 1`); only
            // float-valued content is incompatible on the right
            if tview.is_ptr && !p.is_id() && self.primary_has_float(p) {
                self.diags.report(
                    op_loc,
                    CompileError::IncompatibleAssignment(ttok.lexeme.clone()),
                );
            }
            if !tview.is_ptr
                && !p.is_id()
                && tview.is_record
                && self.primary_has_float(p)
            {
                self.diags.report(
                    op_loc,
                    CompileError::IncompatibleAssignment(ttok.lexeme.clone()),
                );
            }
            if !tview.is_record
                && tview.first_kind == Some(TokenKind::Char)
                && !tview.is_array
                && !tview.is_ptr
                && p.tok.kind == TokenKind::StrLit
            {
                self.diags.report(
                    op_loc,
                    CompileError::IncompatibleStringAssignment(
                        ttok.lexeme.clone(),
                    ),
                );
                return;
            }
            if let Some(pv) = &pview {
                if !tview.is_record {
                    if !pv.is_record {
                        if tview.first_kind == Some(TokenKind::Void)
                            && pv.is_float_value()
                        {
                            self.diags.report(
                                op_loc,
                                CompileError::IncompatibleAssignment(
                                    ttok.lexeme.clone(),
                                ),
                            );
                        }
                    } else if !matches!(
                        tview.first_kind,
                        Some(TokenKind::Int) | Some(TokenKind::Void)
                    ) {
                        self.diags.report(
                            op_loc,
                            CompileError::IncompatibleAssignment(
                                ttok.lexeme.clone(),
                            ),
                        );
                    }
                } else if !pv.is_record
                    && matches!(
                        pv.first_kind,
                        Some(TokenKind::Int) | Some(TokenKind::Void)
                    )
                {
                    self.diags.report(
                        op_loc,
                        CompileError::IncompatibleAssignment(
                            ttok.lexeme.clone(),
                        ),
                    );
                    return;
                }
            }
        }

        if tview.is_record && p.is_id() {
            if let Some(pv) = &pview {
                if tview.record_name != pv.record_name {
                    self.diags.report(
                        op_loc,
                        CompileError::IncompatibleAssignment(
                            ttok.lexeme.clone(),
                        ),
                    );
                } else if tview.is_ptr != pv.is_ptr
                    && tview.ptr_count != pv.ptr_count
                {
                    self.diags.report(
                        op_loc,
                        CompileError::IncompatibleAssignment(
                            ttok.lexeme.clone(),
                        ),
                    );
                }
            }
        }
    }

    fn check_assign_cast(
        &mut self,
        op_loc: crate::util::SourceLoc,
        tview: &SymView,
        ttok: &Token,
        cast: &CastExpr,
    ) {
        match &cast.target_type {
            TypeSpec::Simple(toks) if !tview.is_record => {
                let cast_first = toks.first().map(|t| t.kind);
                let both_float = matches!(
                    tview.first_kind,
                    Some(TokenKind::Float) | Some(TokenKind::Double)
                ) && matches!(
                    cast_first,
                    Some(TokenKind::Float) | Some(TokenKind::Double)
                );
                if both_float {
                    if let Some((rref, _)) = chain_end(&cast.expr) {
                        if let Some(rv) = self.view(&rref) {
                            if rv.is_ptr {
                                self.diags.report(
                                    op_loc,
                                    CompileError::IncompatibleCastAssignment(
                                        ttok.lexeme.clone(),
                                    ),
                                );
                            }
                        }
                    }
                }
            }
            TypeSpec::Record(tok) if tview.is_record => {
                if tview.record_name.as_deref() != Some(tok.lexeme.as_str()) {
                    self.diags.report(
                        op_loc,
                        CompileError::IncompatibleCastAssignment(
                            ttok.lexeme.clone(),
                        ),
                    );
                }
            }
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_assign_id(
        &mut self,
        op_loc: crate::util::SourceLoc,
        op_kind: TokenKind,
        op_lexeme: &str,
        tview: &SymView,
        ttok: &Token,
        idexp: &IdExpr,
    ) {
        if idexp.is_operator && idexp.tok.kind == TokenKind::AddrOf {
            let rview = idexp
                .unary
                .as_ref()
                .and_then(|u| chain_end(u))
                .and_then(|(r, _)| self.view(&r));
            let rview = match rview {
                Some(v) => v,
                None => return,
            };
            if !tview.is_ptr {
                self.diags.report(
                    op_loc,
                    CompileError::PointerLhsExpected(ttok.lexeme.clone()),
                );
                return;
            }
            if rview.is_ptr && tview.ptr_count <= rview.ptr_count {
                self.diags
                    .report(op_loc, CompileError::InvalidPointerAssignment);
                return;
            }
            if tview.is_record
                && !rview.is_record
                && rview.first_kind != Some(TokenKind::Int)
            {
                self.diags
                    .report(op_loc, CompileError::InvalidPointerAssignment);
            }
            return;
        }

        let rview = match chain_end(idexp).and_then(|(r, _)| self.view(&r)) {
            Some(v) => v,
            None => return,
        };
        if is_bitwise_compound(op_kind) {
            if rview.is_record {
                self.diags.report(
                    op_loc,
                    CompileError::SimpleTypeOperandExpected(
                        op_lexeme.to_string(),
                    ),
                );
                return;
            }
            // only `float` is tested here, not `double`
            if rview.first_kind == Some(TokenKind::Float) {
                self.diags.report(
                    op_loc,
                    CompileError::WrongAssignOperand(op_lexeme.to_string()),
                );
                return;
            }
        }
        if tview.is_ptr && rview.is_ptr {
            if tview.ptr_count != rview.ptr_count {
                self.diags
                    .report(op_loc, CompileError::InvalidPointerAssignment);
            }
        } else if tview.is_ptr && !rview.is_ptr {
            if rview.first_kind != Some(TokenKind::Int) {
                self.diags.report(
                    op_loc,
                    CompileError::InvalidTypeAssignment {
                        from: rview.name.clone(),
                        to: tview.name.clone(),
                    },
                );
            }
        } else if tview.is_record && !rview.is_record {
            self.diags.report(
                op_loc,
                CompileError::InvalidTypeAssignment {
                    from: rview.name.clone(),
                    to: tview.name.clone(),
                },
            );
        }
    }

    fn check_assign_call(
        &mut self,
        op_loc: crate::util::SourceLoc,
        tview: &SymView,
        ttok: &Token,
        call: &CallExpr,
    ) {
        let func = match self.ctx.functions.get(&call.callee.tok.lexeme) {
            Some(f) => f,
            None => return,
        };
        let f_name = func.name.clone();
        let f_is_record = func.return_type.spec.is_record();
        let f_first = func.return_type.spec.primary().map(|t| t.kind);
        let f_record = func.return_type.spec.record_name().map(String::from);
        let f_ptr = func.ret_ptr_count;

        if tview.is_record != f_is_record {
            self.diags.report(
                op_loc,
                CompileError::FunctionReturnMismatch {
                    func: f_name,
                    to: ttok.lexeme.clone(),
                },
            );
            return;
        }
        if !tview.is_record {
            if tview.first_kind != f_first {
                self.diags.report(
                    op_loc,
                    CompileError::FunctionReturnMismatch {
                        func: f_name,
                        to: ttok.lexeme.clone(),
                    },
                );
                return;
            }
        } else if tview.record_name.as_deref() != f_record.as_deref() {
            self.diags.report(
                op_loc,
                CompileError::FunctionReturnMismatch {
                    func: f_name,
                    to: ttok.lexeme.clone(),
                },
            );
            return;
        }
        if tview.ptr_count != f_ptr {
            self.diags.report(
                op_loc,
                CompileError::FunctionPointerReturnMismatch {
                    func: f_name,
                    to: ttok.lexeme.clone(),
                },
            );
        }
    }

    // ===== Inline asm =====

    fn analyze_asm(&mut self, stmts: &mut Vec<AsmStmt>) {
        for stmt in stmts {
            self.check_asm_template(stmt);
            let mut outputs = std::mem::take(&mut stmt.outputs);
            for op in &mut outputs {
                self.check_asm_output(op);
                self.check_asm_operand_expr(op);
            }
            stmt.outputs = outputs;
            let mut inputs = std::mem::take(&mut stmt.inputs);
            for op in &mut inputs {
                self.check_asm_input(op);
                self.check_asm_operand_expr(op);
            }
            stmt.inputs = inputs;
        }
    }

    fn check_asm_template(&mut self, stmt: &AsmStmt) {
        let total = stmt.outputs.len() + stmt.inputs.len();
        let refs = template_refs(&stmt.template.lexeme);
        if let Some(&max) = refs.iter().max() {
            if max + 1 > total {
                self.diags.report(
                    stmt.template.loc,
                    CompileError::AsmOperandOutOfRange(max),
                );
            }
        }
    }

    fn check_asm_output(&mut self, op: &mut AsmOperand) {
        let constraint = op.constraint.lexeme.clone();
        let loc = op.constraint.loc;
        if constraint.is_empty() {
            self.diags.report(loc, CompileError::AsmOutputMissingEq);
            return;
        }
        if constraint.len() == 1 {
            if constraint == "=" {
                self.diags
                    .report(loc, CompileError::AsmImpossibleConstraint);
            } else {
                self.diags.report(loc, CompileError::AsmOutputMissingEq);
            }
            return;
        }
        if !constraint.starts_with('=') {
            self.diags.report(loc, CompileError::AsmOutputMissingEq);
            return;
        }
        match constraint.as_bytes()[1] {
            b'a' | b'b' | b'c' | b'd' | b'S' | b'D' => {}
            b'm' => {
                if op.expr.is_none() {
                    self.diags.report(
                        loc,
                        CompileError::AsmMemoryOperandExpected(constraint),
                    );
                } else if let Some(expr) = &mut op.expr {
                    self.analyze_expr(expr);
                }
            }
            _ => {
                self.diags.report(
                    loc,
                    CompileError::AsmInconsistentConstraint(constraint),
                );
            }
        }
    }

    fn check_asm_input(&mut self, op: &mut AsmOperand) {
        let constraint = op.constraint.lexeme.clone();
        let loc = op.constraint.loc;
        match constraint.as_bytes().first() {
            Some(b'a') | Some(b'b') | Some(b'c') | Some(b'd') | Some(b'S')
            | Some(b'D') | Some(b'i') => {}
            Some(b'm') => {
                if op.expr.is_none() {
                    self.diags.report(
                        loc,
                        CompileError::AsmMemoryOperandExpected(constraint),
                    );
                } else if let Some(expr) = &mut op.expr {
                    self.analyze_expr(expr);
                }
            }
            _ => {
                self.diags.report(
                    loc,
                    CompileError::AsmInconsistentConstraint(constraint),
                );
            }
        }
    }

    fn check_asm_operand_expr(&mut self, op: &AsmOperand) {
        match &op.expr {
            None => {}
            Some(Expr::Primary(p)) => {
                if p.left.is_some() || p.right.is_some() || p.unary.is_some() {
                    self.diags.report(
                        p.tok.loc,
                        CompileError::AsmSingleNodeExpected,
                    );
                }
            }
            Some(_) => {
                self.diags.report(
                    op.constraint.loc,
                    CompileError::AsmSingleNodeExpected,
                );
            }
        }
    }

    // ===== Whole-unit passes =====

    fn check_local_declarations(&mut self, unit: &SourceUnit) {
        for node in &unit.nodes {
            let scope = match &node.scope {
                Some(s) => s,
                None => continue,
            };
            let func = match self.ctx.functions.get(&scope.func) {
                Some(f) => f,
                None => continue,
            };
            if !func.is_extern && func.params.len() > 1 {
                for (i, p) in func.params.iter().enumerate() {
                    for q in func.params.iter().skip(i + 1) {
                        if !p.sym.name.is_empty() && p.sym.name == q.sym.name {
                            self.diags.report(
                                q.sym.tok.loc,
                                CompileError::DuplicateParamName(
                                    q.sym.name.clone(),
                                ),
                            );
                        }
                    }
                }
            }
            for p in &func.params {
                if !p.sym.name.is_empty() && scope.symtab.contains(&p.sym.name)
                {
                    self.diags.report(
                        p.sym.tok.loc,
                        CompileError::ParamRedeclaration(p.sym.name.clone()),
                    );
                }
            }
        }
    }

    fn check_global_assignments(&mut self, unit: &SourceUnit) {
        for node in &unit.nodes {
            if node.scope.is_some() {
                continue;
            }
            for stmt in &node.stmts {
                let expr = match stmt {
                    Stmt::Expr(es) => match &es.expr {
                        Some(e) => e,
                        None => continue,
                    },
                    _ => continue,
                };
                match expr {
                    Expr::Assign(assign) => {
                        if !has_constant_subscript(&assign.left) {
                            self.diags.report(
                                assign.op.loc,
                                CompileError::GlobalSubscriptNotConstant,
                            );
                        }
                        match assign.right.as_ref() {
                            Expr::Primary(p) => {
                                if p.left.is_some() || p.right.is_some() {
                                    self.diags.report(
                                        assign.op.loc,
                                        CompileError::GlobalInitializerNotConstant,
                                    );
                                }
                            }
                            _ => {
                                self.diags.report(
                                    assign.op.loc,
                                    CompileError::GlobalAssignmentExpected,
                                );
                            }
                        }
                    }
                    Expr::Primary(p) => {
                        self.diags.report(
                            p.tok.loc,
                            CompileError::GlobalAssignmentExpected,
                        );
                    }
                    Expr::Id(i) => {
                        self.diags.report(
                            i.tok.loc,
                            CompileError::GlobalAssignmentExpected,
                        );
                    }
                    Expr::Call(c) => {
                        self.diags.report(
                            c.callee.tok.loc,
                            CompileError::GlobalAssignmentExpected,
                        );
                    }
                    Expr::Sizeof(_) | Expr::Cast(_) => {
                        let loc = expr_loc(expr);
                        self.diags.report(
                            loc,
                            CompileError::GlobalAssignmentExpected,
                        );
                    }
                }
            }
        }
    }
}

// ===== Free helpers =====

fn is_bitwise_compound(kind: TokenKind) -> bool {
    use TokenKind::*;
    matches!(
        kind,
        ModAssign | AndAssign | OrAssign | XorAssign | ShlAssign | ShrAssign
    )
}

fn check_void_decls(table: &SymbolTable, diags: &mut Diagnostics) {
    for (_, sym) in table.iter() {
        if !sym.type_info.spec.is_record()
            && sym.type_info.spec.primary().map(|t| t.kind)
                == Some(TokenKind::Void)
            && !sym.is_ptr
        {
            diags.report(
                sym.tok.loc,
                CompileError::VoidVariable(sym.name.clone()),
            );
        }
    }
}

/// Post order over a primary tree, left child before right before parent.
fn postorder(root: &PrimaryExpr) -> Vec<&PrimaryExpr> {
    let mut work = vec![root];
    let mut out = Vec::new();
    while let Some(node) = work.pop() {
        out.push(node);
        if let Some(left) = &node.left {
            work.push(left);
        }
        if let Some(right) = &node.right {
            work.push(right);
        }
    }
    out.reverse();
    out
}

/// The final (rightmost) resolved symbol of an identifier expression: the
/// member at the end of a `.`/`->` chain, or the identifier itself.
fn chain_end(idexp: &IdExpr) -> Option<(SymbolRef, Token)> {
    if idexp.is_operator && idexp.tok.kind.is_member_op() {
        let right = idexp.right.as_ref()?;
        Some((right.symbol.clone()?, right.tok.clone()))
    } else if idexp.is_id {
        Some((idexp.symbol.clone()?, idexp.tok.clone()))
    } else if let Some(unary) = &idexp.unary {
        chain_end(unary)
    } else {
        None
    }
}

/// Assignment targets: a plain identifier or the end of a member chain.
/// Pointer-indirection and unary-wrapped left sides are not type-checked.
fn assign_target(left: &IdExpr) -> Option<(SymbolRef, Token)> {
    if left.unary.is_some() {
        return None;
    }
    if left.is_operator && !left.tok.kind.is_member_op() {
        return None;
    }
    chain_end(left)
}

fn expr_loc(expr: &Expr) -> SourceLoc {
    match expr {
        Expr::Primary(p) => p.tok.loc,
        Expr::Assign(a) => a.op.loc,
        Expr::Sizeof(s) => match &s.target {
            TypeSpec::Simple(toks) => {
                toks.first().map(|t| t.loc).unwrap_or_default()
            }
            TypeSpec::Record(tok) => tok.loc,
        },
        Expr::Cast(c) => c.expr.tok.loc,
        Expr::Id(i) => i.tok.loc,
        Expr::Call(c) => c.callee.tok.loc,
    }
}

fn has_constant_subscript(idexp: &IdExpr) -> bool {
    if !idexp.is_subscript {
        return true;
    }
    idexp
        .subscript
        .iter()
        .all(|tok| tok.kind.is_integer_literal())
}

/// `%N` operand references appearing in an asm template.
fn template_refs(template: &str) -> Vec<usize> {
    let mut refs = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                if let Ok(n) = template[start..end].parse::<usize>() {
                    refs.push(n);
                }
            }
            i = end;
        } else {
            i += 1;
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_refs() {
        assert_eq!(template_refs("mov %0, %1"), vec![0, 1]);
        assert_eq!(template_refs("mov eax, 1"), Vec::<usize>::new());
        assert_eq!(template_refs("add %2, %10"), vec![2, 10]);
    }
}
