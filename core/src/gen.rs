//! NASM code generation. Lowers the analyzed AST to a linear instruction
//! stream plus `.data`/`.bss`/`.text` section models, then renders the
//! whole listing as Intel-syntax 32-bit assembly text.
//!
//! Integer expressions evaluate through the general registers with results
//! landing in the accumulator; float expressions run on the x87 stack.
//! Locals live at negative frame-pointer displacements assigned in
//! declaration order, parameters at positive ones.

use crate::{
    ast::{
        AsmStmt, AssignExpr, CallExpr, CastExpr, Expr, FunctionScope, IdExpr,
        IterKind, IterStmt, JumpKind, JumpStmt, PrimaryExpr, SelectStmt,
        SizeofExpr, SourceUnit, Stmt,
    },
    convert,
    error::{CompileError, Diagnostics},
    insn::{
        size_cast, BssItem, BssMember, DataItem, DeclSize, Instruction, Line,
        MemRef, Op, Operand, ResSize, TextDirective,
    },
    regs::{Reg, Registers},
    symtab::{CompileCtx, FunctionInfo, SymbolInfo, SymbolRef, TypeSpec},
    token::TokenKind,
    CompileOptions,
};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Lowers the unit and renders the final assembly listing.
pub fn generate<'a>(
    unit: &'a SourceUnit,
    ctx: &'a CompileCtx,
    diags: &'a mut Diagnostics,
    options: &CompileOptions,
) -> String {
    let gen = CodeGen {
        ctx,
        diags,
        omit_frame_pointer: options.omit_frame_pointer,
        scope: None,
        regs: Registers::new(),
        lines: Vec::new(),
        data: Vec::new(),
        bss: Vec::new(),
        text: Vec::new(),
        float_count: 1,
        string_count: 1,
        if_count: 1,
        else_count: 1,
        exit_if_count: 1,
        while_count: 1,
        dowhile_count: 1,
        for_count: 1,
        loop_stack: Vec::new(),
        frames: HashMap::new(),
        record_sizes: HashMap::new(),
        initialized: HashSet::new(),
    };
    gen.generate(unit)
}

pub fn data_type_size(kind: TokenKind) -> i32 {
    use TokenKind::*;
    match kind {
        Void | Char => 1,
        Short => 2,
        Int | Long | Float => 4,
        Double => 8,
        _ => 0,
    }
}

/// Encodes a literal string as the comma-separated hex byte list the data
/// section uses, decoding recognized escapes and terminating with `0x00`.
pub fn hex_string(value: &str) -> String {
    let mut parts = Vec::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(&next) = chars.peek() {
                match convert::escape_value(next) {
                    Some(byte) => parts.push(format!("0x{:02X}", byte)),
                    None => {
                        parts.push(format!("0x{:02X}", ch as u32));
                        parts.push(format!("0x{:02X}", next as u32));
                    }
                }
                chars.next();
                continue;
            }
        }
        parts.push(format!("0x{:02X}", ch as u32));
    }
    parts.push("0x00".to_string());
    parts.join(",")
}

fn arith_op(lexeme: &str) -> Option<Op> {
    Some(match lexeme {
        "+" => Op::Add,
        "-" => Op::Sub,
        "*" => Op::Mul,
        "/" => Op::Div,
        "%" => Op::Div,
        "&" => Op::And,
        "|" => Op::Or,
        "^" => Op::Xor,
        "<<" => Op::Shl,
        ">>" => Op::Shr,
        _ => return None,
    })
}

fn float_op(lexeme: &str, reverse: bool) -> Option<Op> {
    Some(match lexeme {
        "+" => Op::Fadd,
        "-" => {
            if reverse {
                Op::Fsubr
            } else {
                Op::Fsub
            }
        }
        "*" => Op::Fmul,
        "/" => {
            if reverse {
                Op::Fdivr
            } else {
                Op::Fdiv
            }
        }
        _ => return None,
    })
}

fn direct_jump(cond: TokenKind) -> Op {
    match cond {
        TokenKind::EqEq => Op::Je,
        TokenKind::Gt => Op::Jg,
        TokenKind::Ge => Op::Jge,
        TokenKind::Lt => Op::Jl,
        TokenKind::Le => Op::Jle,
        TokenKind::NotEq => Op::Jne,
        _ => Op::Jmp,
    }
}

fn inverse_jump(cond: TokenKind) -> Op {
    match cond {
        TokenKind::EqEq => Op::Jne,
        TokenKind::Gt => Op::Jle,
        TokenKind::Ge => Op::Jl,
        TokenKind::Lt => Op::Jge,
        TokenKind::Le => Op::Jg,
        TokenKind::NotEq => Op::Je,
        _ => Op::Jmp,
    }
}

fn loop_prefix(kind: IterKind) -> &'static str {
    match kind {
        IterKind::While => "while_loop",
        IterKind::DoWhile => "dowhile_loop",
        IterKind::For => "for_loop",
    }
}

fn postorder_nodes(root: &PrimaryExpr) -> Vec<&PrimaryExpr> {
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

/// The lhs identifier an assignment stores through (unwrapping pointer
/// indirection and prefix operators).
fn assign_left(left: &IdExpr) -> &IdExpr {
    match &left.unary {
        Some(inner) => inner,
        None => left,
    }
}

/// Result classification of a generated primary expression.
enum ExprValue {
    Int(Reg),
    Float,
}

#[derive(Copy, Clone, Debug)]
struct Slot {
    size: i32,
    disp: i32,
}

#[derive(Clone, Debug, Default)]
struct Frame {
    total: i32,
    slots: HashMap<String, Slot>,
    order: Vec<String>,
}

struct CodeGen<'a> {
    ctx: &'a CompileCtx,
    diags: &'a mut Diagnostics,
    omit_frame_pointer: bool,
    scope: Option<&'a FunctionScope>,
    regs: Registers,
    lines: Vec<Line>,
    data: Vec<DataItem>,
    bss: Vec<BssItem>,
    text: Vec<TextDirective>,
    float_count: u32,
    string_count: u32,
    if_count: u32,
    else_count: u32,
    exit_if_count: u32,
    while_count: u32,
    dowhile_count: u32,
    for_count: u32,
    loop_stack: Vec<(IterKind, u32)>,
    frames: HashMap<String, Frame>,
    record_sizes: HashMap<String, i64>,
    initialized: HashSet<String>,
}

impl<'a> CodeGen<'a> {
    // ===== Plumbing =====

    fn emit(&mut self, insn: Instruction) {
        self.lines.push(Line::Insn(insn));
    }

    fn emit_label(&mut self, label: impl Into<String>) {
        self.lines.push(Line::Label(label.into()));
    }

    fn emit_comment(&mut self, text: impl Into<String>) {
        self.lines.push(Line::Comment(text.into()));
    }

    fn sym(&self, sref: &SymbolRef) -> Option<&'a SymbolInfo> {
        let ctx = self.ctx;
        ctx.symbol(sref, self.scope)
    }

    fn sym_of_primary(&self, p: &PrimaryExpr) -> Option<&'a SymbolInfo> {
        p.symbol().and_then(|r| self.sym(r))
    }

    fn sym_of_id(&self, idexp: &IdExpr) -> Option<&'a SymbolInfo> {
        idexp.symbol.as_ref().and_then(|r| self.sym(r))
    }

    fn sym_type_size(&self, sym: &SymbolInfo) -> i32 {
        match sym.type_info.spec.primary() {
            Some(tok) => data_type_size(tok.kind),
            None => 4,
        }
    }

    fn local_slot(&self, name: &str) -> Option<Slot> {
        let scope = self.scope?;
        self.frames.get(&scope.func)?.slots.get(name).copied()
    }

    fn id_mem(&self, sym: &SymbolInfo, size: i32) -> MemRef {
        match self.local_slot(&sym.name) {
            Some(slot) => MemRef::local(slot.disp, size),
            None => MemRef::global(sym.name.clone(), size),
        }
    }

    fn has_float(&self, p: &PrimaryExpr) -> bool {
        if p.is_id() {
            if let Some(sym) = self.sym_of_primary(p) {
                if sym.is_float_type() {
                    return true;
                }
            }
        } else if !p.is_operator() && p.tok.kind == TokenKind::FloatLit {
            return true;
        }
        p.left.as_ref().map_or(false, |l| self.has_float(l))
            || p.right.as_ref().map_or(false, |r| self.has_float(r))
    }

    /// Widest data type appearing in the expression; every temporary is
    /// allocated at this size.
    fn max_size(&self, p: &PrimaryExpr, acc: &mut i32) {
        if p.is_id() {
            if let Some(sym) = self.sym_of_primary(p) {
                if !sym.type_info.spec.is_record() {
                    let size = self.sym_type_size(sym);
                    if *acc < size {
                        *acc = size;
                    }
                    return;
                }
            }
        } else if !p.is_operator() {
            match p.tok.kind {
                TokenKind::CharLit => {
                    if *acc < 1 {
                        *acc = 1;
                    }
                }
                TokenKind::DecLit
                | TokenKind::OctLit
                | TokenKind::HexLit
                | TokenKind::BinLit
                | TokenKind::FloatLit => {
                    if *acc < 4 {
                        *acc = 4;
                    }
                }
                _ => {}
            }
        }
        if let Some(left) = &p.left {
            self.max_size(left, acc);
        }
        if let Some(right) = &p.right {
            self.max_size(right, acc);
        }
        if let Some(unary) = &p.unary {
            self.max_size(unary, acc);
        }
    }

    // ===== Interned constants =====

    fn intern_float(&mut self, decl: DeclSize, value: &str) -> String {
        if let Some(item) = self.data.iter().find(|d| d.value == value) {
            return item.name.clone();
        }
        let name = format!("float_val{}", self.float_count);
        self.float_count += 1;
        self.data.push(DataItem {
            name: name.clone(),
            decl,
            value: value.to_string(),
            array: Vec::new(),
            comment: String::new(),
        });
        name
    }

    fn intern_string(&mut self, value: &str) -> String {
        let encoded = hex_string(value);
        if let Some(item) = self.data.iter().find(|d| d.value == encoded) {
            return item.name.clone();
        }
        let name = format!("string_val{}", self.string_count);
        self.string_count += 1;
        self.data.push(DataItem {
            name: name.clone(),
            decl: DeclSize::Db,
            value: encoded,
            array: Vec::new(),
            comment: format!("    ; '{}'", value),
        });
        name
    }

    // ===== Integer primary expressions =====

    fn emit_load_operand(&mut self, reg: Reg, node: &PrimaryExpr, size: i32) {
        if !node.is_id() {
            let value = convert::token_to_decimal(&node.tok);
            self.emit(Instruction::binary(
                Op::Mov,
                Operand::Reg(reg),
                Operand::Literal(value.to_string()),
            ));
            return;
        }
        if let Some(sym) = self.sym_of_primary(node) {
            let mem = self.id_mem(sym, size);
            self.emit(
                Instruction::binary(
                    Op::Mov,
                    Operand::Reg(reg),
                    Operand::Mem(mem),
                )
                .with_comment(format!("  ; {}", sym.name)),
            );
        }
    }

    /// `x = y;` and other single-node expressions: one `mov` into the
    /// accumulator.
    fn gen_int_single(&mut self, p: &PrimaryExpr, size: i32) -> Option<Reg> {
        if !p.is_leaf() || p.is_operator() {
            return None;
        }
        let mut reg = Reg::accumulator(size);
        if p.is_id() {
            let sym = self.sym_of_primary(p)?;
            let mut mem_size = size;
            if sym.is_ptr {
                reg = Reg::Eax;
                mem_size = 4;
            }
            let mem = self.id_mem(sym, mem_size);
            self.emit(
                Instruction::binary(
                    Op::Mov,
                    Operand::Reg(reg),
                    Operand::Mem(mem),
                )
                .with_comment(format!("  ; assignment {}", sym.name)),
            );
        } else {
            let value = convert::token_to_decimal(&p.tok);
            self.emit(Instruction::binary(
                Op::Mov,
                Operand::Reg(reg),
                Operand::Literal(value.to_string()),
            ));
        }
        Some(reg)
    }

    /// `~x` on a single operand negates in place.
    fn gen_int_complement(&mut self, p: &PrimaryExpr, size: i32) -> bool {
        let target = match &p.unary {
            Some(node) => node,
            None => return false,
        };
        self.emit_comment(format!("; line {}", target.tok.loc.line));
        if target.is_leaf() {
            if let Some(sym) = self.sym_of_primary(target) {
                let mem = self.id_mem(sym, size);
                self.emit(
                    Instruction::unary(Op::Neg, Operand::Mem(mem))
                        .with_comment(format!("  ; {}", sym.name)),
                );
            }
            return true;
        }
        false
    }

    fn gen_string_literal(&mut self, p: &PrimaryExpr) -> Option<Reg> {
        if p.is_leaf() && !p.is_id() && p.tok.kind == TokenKind::StrLit {
            let name = self.intern_string(&p.tok.lexeme.clone());
            self.emit(Instruction::binary(
                Op::Mov,
                Operand::Reg(Reg::Eax),
                Operand::Mem(MemRef::global(name, -1)),
            ));
            return Some(Reg::Eax);
        }
        None
    }

    /// Walks the expression in postfix order. Operands collect on a pending
    /// stack; each operator pops its two factors into registers and emits
    /// the arithmetic, spilling an earlier intermediate onto the machine
    /// stack when a second one starts.
    fn gen_int_primary(&mut self, p: &PrimaryExpr) -> Option<Reg> {
        let mut dtsize = 0;
        self.max_size(p, &mut dtsize);

        if p.unary.is_some()
            && p.is_operator()
            && p.tok.kind == TokenKind::Tilde
        {
            let mut usize_ = 0;
            self.max_size(p.unary.as_ref().unwrap(), &mut usize_);
            if self.gen_int_complement(p, usize_) {
                return None;
            }
        }
        if let Some(reg) = self.gen_string_literal(p) {
            return Some(reg);
        }
        if dtsize <= 0 {
            return None;
        }

        self.emit_comment(format!("; line {}", p.tok.loc.line));

        if let Some(reg) = self.gen_int_single(p, dtsize) {
            return Some(reg);
        }

        if p.shared_operands {
            // the two operand subtrees are the same expression: compute the
            // left one once and fold it against itself
            let left = p.left.as_ref()?;
            let reg = self.gen_int_primary(left)?;
            match arith_op(&p.tok.lexeme) {
                Some(op @ Op::Mul) | Some(op @ Op::Div) => {
                    self.emit(Instruction::unary(op, Operand::Reg(reg)));
                    if p.tok.kind == TokenKind::Percent {
                        self.emit(
                            Instruction::binary(
                                Op::Mov,
                                Operand::Reg(Reg::accumulator(dtsize)),
                                Operand::Reg(Reg::data_reg(dtsize)),
                            )
                            .with_comment("  ; copy % result"),
                        );
                    }
                }
                Some(op) => {
                    self.emit(Instruction::binary(
                        op,
                        Operand::Reg(reg),
                        Operand::Reg(reg),
                    ));
                }
                None => {
                    self.diags.report(
                        p.tok.loc,
                        CompileError::UnknownOperator(p.tok.lexeme.clone()),
                    );
                }
            }
            return Some(reg);
        }

        // clear the accumulator pair before the walk
        self.emit(Instruction::binary(
            Op::Xor,
            Operand::Reg(Reg::Eax),
            Operand::Reg(Reg::Eax),
        ));
        self.emit(Instruction::binary(
            Op::Xor,
            Operand::Reg(Reg::Edx),
            Operand::Reg(Reg::Edx),
        ));

        let order = postorder_nodes(p);
        let mut pending: Vec<&PrimaryExpr> = Vec::new();
        let mut results: Vec<Reg> = Vec::new();
        let mut push_count = 0usize;
        let mut r1 = Reg::accumulator(dtsize);

        for node in order {
            if !node.is_operator() {
                push_count += 1;
                pending.push(node);
                continue;
            }
            let op = match arith_op(&node.tok.lexeme) {
                Some(op) => op,
                None => {
                    self.diags.report(
                        node.tok.loc,
                        CompileError::UnknownOperator(node.tok.lexeme.clone()),
                    );
                    continue;
                }
            };
            let is_mod = node.tok.kind == TokenKind::Percent;

            if pending.len() >= 2 && push_count > 1 {
                r1 = self.regs.allocate(dtsize);
                let r2 = self.regs.allocate(dtsize);
                let fact2 = pending.pop().unwrap();
                let fact1 = pending.pop().unwrap();

                if let Some(&prev) = results.last() {
                    // an earlier intermediate is live: spill it
                    self.emit(Instruction::unary(Op::Push, Operand::Reg(prev)));
                    self.regs.free(prev);
                    self.regs.free(r2);
                    r1 = self.regs.allocate(dtsize);
                }

                self.emit_load_operand(r1, fact1, dtsize);
                results.push(r1);

                let is_shift = matches!(op, Op::Shl | Op::Shr);
                if !is_shift {
                    if !fact2.is_id() {
                        let mut value = convert::token_to_decimal(&fact2.tok);
                        if fact1.is_id() {
                            if let Some(sym) = self.sym_of_primary(fact1) {
                                if sym.is_ptr {
                                    // pointer arithmetic steps whole words
                                    value *= 4;
                                }
                            }
                        }
                        self.emit(Instruction::binary(
                            Op::Mov,
                            Operand::Reg(r2),
                            Operand::Literal(value.to_string()),
                        ));
                    } else {
                        self.emit_load_operand(r2, fact2, dtsize);
                    }
                }
                self.regs.free(r2);

                match op {
                    Op::Mul | Op::Div => {
                        self.emit(Instruction::unary(op, Operand::Reg(r2)));
                        if is_mod {
                            self.emit(
                                Instruction::binary(
                                    Op::Mov,
                                    Operand::Reg(Reg::accumulator(dtsize)),
                                    Operand::Reg(Reg::data_reg(dtsize)),
                                )
                                .with_comment("  ; copy % result"),
                            );
                        }
                    }
                    Op::Shl | Op::Shr => {
                        let value = convert::token_to_decimal(&fact2.tok);
                        self.emit(Instruction::binary(
                            op,
                            Operand::Reg(r1),
                            Operand::Literal(value.to_string()),
                        ));
                    }
                    _ => {
                        self.emit(Instruction::binary(
                            op,
                            Operand::Reg(r1),
                            Operand::Reg(r2),
                        ));
                    }
                }
            } else if !pending.is_empty() {
                let r2 = self.regs.allocate(dtsize);
                let fact1 = pending.pop().unwrap();
                let is_shift = matches!(op, Op::Shl | Op::Shr);
                if !is_shift {
                    self.emit_load_operand(r2, fact1, dtsize);
                }
                self.regs.free(r2);
                match op {
                    Op::Mul | Op::Div => {
                        self.emit(Instruction::unary(op, Operand::Reg(r2)));
                        if is_mod {
                            self.emit(
                                Instruction::binary(
                                    Op::Mov,
                                    Operand::Reg(Reg::accumulator(dtsize)),
                                    Operand::Reg(Reg::data_reg(dtsize)),
                                )
                                .with_comment("  ; copy % result"),
                            );
                        }
                    }
                    Op::Shl | Op::Shr => {
                        let value = convert::token_to_decimal(&fact1.tok);
                        self.emit(Instruction::binary(
                            op,
                            Operand::Reg(r1),
                            Operand::Literal(value.to_string()),
                        ));
                    }
                    _ => {
                        self.emit(Instruction::binary(
                            op,
                            Operand::Reg(r1),
                            Operand::Reg(r2),
                        ));
                    }
                }
            } else {
                // both operands are earlier results: one was spilled
                let prev = results.pop().unwrap_or_else(|| Reg::accumulator(dtsize));
                self.emit(
                    Instruction::binary(
                        Op::Mov,
                        Operand::Reg(Reg::base_reg(dtsize)),
                        Operand::Reg(prev),
                    )
                    .with_comment("   ; copy result to register"),
                );
                if push_count > 0 {
                    self.emit(
                        Instruction::unary(Op::Pop, Operand::Reg(prev))
                            .with_comment("    ; pop previous result to register"),
                    );
                    push_count -= 1;
                }
                match op {
                    Op::Mul | Op::Div => {
                        self.emit(Instruction::unary(
                            op,
                            Operand::Reg(Reg::base_reg(dtsize)),
                        ));
                        if is_mod {
                            self.emit(
                                Instruction::binary(
                                    Op::Mov,
                                    Operand::Reg(Reg::accumulator(dtsize)),
                                    Operand::Reg(Reg::data_reg(dtsize)),
                                )
                                .with_comment("  ; copy % result"),
                            );
                        }
                    }
                    _ => {
                        self.emit(Instruction::binary(
                            op,
                            Operand::Reg(prev),
                            Operand::Reg(Reg::Ebx),
                        ));
                    }
                }
                r1 = prev;
            }
        }
        Some(r1)
    }

    // ===== Float primary expressions =====

    fn emit_fld(&mut self, node: &PrimaryExpr, size: i32, decl: DeclSize) {
        if !node.is_id() {
            let name = self.intern_float(decl, &node.tok.lexeme.clone());
            self.emit(
                Instruction::unary(
                    Op::Fld,
                    Operand::Mem(MemRef::global(name, size)),
                )
                .with_comment(format!("  ; {}", node.tok.lexeme)),
            );
        } else if let Some(sym) = self.sym_of_primary(node) {
            let mem = self.id_mem(sym, size);
            self.emit(
                Instruction::unary(Op::Fld, Operand::Mem(mem))
                    .with_comment(format!("  ; {}", sym.name)),
            );
        }
    }

    fn gen_float_primary(&mut self, p: &PrimaryExpr) {
        let mut dtsize = 0;
        self.max_size(p, &mut dtsize);
        if dtsize <= 0 {
            return;
        }
        let decl = if dtsize == 8 {
            DeclSize::Dq
        } else {
            DeclSize::Dd
        };
        self.emit_comment(format!("; line {}", p.tok.loc.line));

        if p.is_leaf() && !p.is_operator() {
            self.emit_fld(p, dtsize, decl);
            return;
        }

        let order = postorder_nodes(p);
        let mut pending: Vec<&PrimaryExpr> = Vec::new();
        let mut push_count = 0usize;
        for node in order {
            if !node.is_operator() {
                push_count += 1;
                pending.push(node);
                continue;
            }
            if pending.len() >= 2 && push_count > 1 {
                let _r1 = self.regs.allocate_float();
                let r2 = self.regs.allocate_float();
                let fact2 = pending.pop().unwrap();
                let fact1 = pending.pop().unwrap();
                self.emit_fld(fact1, dtsize, decl);
                self.emit_fld(fact2, dtsize, decl);
                self.regs.free_float(r2);
                if let Some(op) = float_op(&node.tok.lexeme, false) {
                    self.emit(Instruction::unary(op, Operand::FReg(r2)));
                }
                push_count = 0;
            } else if !pending.is_empty() {
                let r2 = self.regs.allocate_float();
                let fact1 = pending.pop().unwrap();
                self.emit_fld(fact1, dtsize, decl);
                if let Some(op) = float_op(&node.tok.lexeme, true) {
                    self.emit(Instruction::unary(op, Operand::FReg(r2)));
                }
                self.regs.free_float(r2);
                push_count = 0;
            }
        }
        self.regs.free_all_float();
    }

    /// Result lands in the accumulator for integers, `st0` for floats.
    fn gen_primary(&mut self, p: &PrimaryExpr) -> Option<ExprValue> {
        if self.has_float(p) {
            self.gen_float_primary(p);
            Some(ExprValue::Float)
        } else {
            let reg = self.gen_int_primary(p)?;
            self.regs.free(reg);
            Some(ExprValue::Int(reg))
        }
    }

    // ===== Assignment =====

    /// Memory operand for a store through the assignment lhs, folding
    /// constant subscripts into the displacement and indexing variable
    /// subscripts through `ecx`.
    fn lhs_mem(&mut self, left: &IdExpr, sym: &SymbolInfo, size: i32) -> MemRef {
        if let Some(slot) = self.local_slot(&sym.name) {
            return MemRef::local(slot.disp, size);
        }
        let mut mem = MemRef::global(sym.name.clone(), size);
        if left.is_subscript {
            if let Some(first) = left.subscript.first() {
                if first.kind.is_integer_literal()
                    || first.kind == TokenKind::CharLit
                {
                    mem.disp =
                        convert::token_to_decimal(first) as i32 * size;
                } else {
                    self.emit(Instruction::binary(
                        Op::Xor,
                        Operand::Reg(Reg::Ecx),
                        Operand::Reg(Reg::Ecx),
                    ));
                    let index_mem = match self.local_slot(&first.lexeme) {
                        Some(slot) => MemRef::local(slot.disp, size),
                        None => MemRef::global(first.lexeme.clone(), size),
                    };
                    self.emit(Instruction::binary(
                        Op::Mov,
                        Operand::Reg(Reg::count_reg(size)),
                        Operand::Mem(index_mem),
                    ));
                    mem.index_reg = Some(Reg::Ecx);
                    mem.scale = size;
                }
            }
        }
        mem
    }

    fn gen_assign(&mut self, assign: &AssignExpr) {
        match assign.right.as_ref() {
            Expr::Primary(p) => self.gen_assign_primary(assign, p),
            Expr::Assign(inner) => self.gen_assign(inner),
            Expr::Sizeof(s) => self.gen_assign_sizeof(assign, s),
            Expr::Cast(c) => self.gen_assign_cast(assign, c),
            Expr::Id(i) => self.gen_assign_id(assign, i),
            Expr::Call(c) => self.gen_assign_call(assign, c),
        }
    }

    fn gen_assign_primary(&mut self, assign: &AssignExpr, p: &PrimaryExpr) {
        let value = match self.gen_primary(p) {
            Some(v) => v,
            None => return,
        };
        let left = assign_left(&assign.left);
        let sym = match self.sym_of_id(left) {
            Some(s) => s,
            None => return,
        };
        let dtsize = self.sym_type_size(sym);
        let mut mem = self.lhs_mem(left, sym, dtsize);
        match value {
            ExprValue::Int(_) => {
                let reg = Reg::accumulator(dtsize);
                mem.size = reg.size();
                self.emit(Instruction::binary(
                    Op::Mov,
                    Operand::Mem(mem),
                    Operand::Reg(reg),
                ));
            }
            ExprValue::Float => {
                mem.size = dtsize;
                self.emit(Instruction::unary(Op::Fstp, Operand::Mem(mem)));
            }
        }
    }

    fn gen_assign_sizeof(&mut self, assign: &AssignExpr, s: &SizeofExpr) {
        self.gen_sizeof(s);
        let left = assign_left(&assign.left);
        let sym = match self.sym_of_id(left) {
            Some(s) => s,
            None => return,
        };
        let mut mem = self.lhs_mem(left, sym, 4);
        mem.size = 4;
        let line = assign.op.loc.line;
        self.emit(
            Instruction::binary(
                Op::Mov,
                Operand::Mem(mem),
                Operand::Reg(Reg::Eax),
            )
            .with_comment(format!("    ; line: {}", line)),
        );
    }

    fn gen_assign_cast(&mut self, assign: &AssignExpr, cast: &CastExpr) {
        self.gen_cast(cast);
        let left = assign_left(&assign.left);
        let sym = match self.sym_of_id(left) {
            Some(s) => s,
            None => return,
        };
        let dtsize = self.sym_type_size(sym);
        let mem = self.lhs_mem(left, sym, dtsize);
        let line = assign.op.loc.line;
        self.emit(
            Instruction::binary(
                Op::Mov,
                Operand::Mem(mem),
                Operand::Reg(Reg::accumulator(dtsize)),
            )
            .with_comment(format!("    ; line: {}", line)),
        );
    }

    fn gen_assign_id(&mut self, assign: &AssignExpr, idexp: &IdExpr) {
        self.gen_id_expr(idexp);
        let left = assign_left(&assign.left);
        let sym = match self.sym_of_id(left) {
            Some(s) => s,
            None => return,
        };
        let dtsize = self.sym_type_size(sym);
        let mem = self.lhs_mem(left, sym, dtsize);
        let line = assign.op.loc.line;
        self.emit(
            Instruction::binary(
                Op::Mov,
                Operand::Mem(mem),
                Operand::Reg(Reg::accumulator(dtsize)),
            )
            .with_comment(format!("    ; line: {}", line)),
        );
    }

    fn gen_assign_call(&mut self, assign: &AssignExpr, call: &CallExpr) {
        self.gen_call(call);
        let left = assign_left(&assign.left);
        let sym = match self.sym_of_id(left) {
            Some(s) => s,
            None => return,
        };
        let mut mem = self.lhs_mem(left, sym, 4);
        mem.size = 4;
        let line = assign.op.loc.line;
        self.emit(
            Instruction::binary(
                Op::Mov,
                Operand::Mem(mem),
                Operand::Reg(Reg::Eax),
            )
            .with_comment(format!(
                "    ; line: {}, assign to {}",
                line, sym.name
            )),
        );
    }

    // ===== Other expressions =====

    fn gen_sizeof(&mut self, s: &SizeofExpr) {
        let (line, name, value) = match &s.target {
            TypeSpec::Simple(toks) => {
                let first = match toks.first() {
                    Some(t) => t,
                    None => return,
                };
                let value = if s.is_ptr {
                    4
                } else {
                    i64::from(data_type_size(first.kind))
                };
                (first.loc.line, first.lexeme.clone(), value)
            }
            TypeSpec::Record(tok) => {
                let value = if s.is_ptr {
                    4
                } else {
                    self.record_sizes.get(&tok.lexeme).copied().unwrap_or(0)
                };
                (tok.loc.line, tok.lexeme.clone(), value)
            }
        };
        self.emit_comment(format!("; line {}", line));
        let mut comment = format!("    ;  sizeof {}", name);
        if s.is_ptr {
            comment.push_str(" pointer");
        }
        self.emit(
            Instruction::binary(
                Op::Mov,
                Operand::Reg(Reg::Eax),
                Operand::Literal(value.to_string()),
            )
            .with_comment(comment),
        );
    }

    fn gen_cast(&mut self, cast: &CastExpr) {
        let toks = match &cast.target_type {
            TypeSpec::Simple(toks) if !toks.is_empty() => toks,
            _ => return,
        };
        if cast.expr.tok.kind != TokenKind::Ident {
            return;
        }
        let sym = match self.sym_of_id(&cast.expr) {
            Some(s) => s,
            None => return,
        };
        self.emit_comment(format!(
            "; cast expression, line {}",
            toks[0].loc.line
        ));
        let dtsize = data_type_size(toks[0].kind);
        let mem = self.id_mem(sym, dtsize);
        self.emit(Instruction::binary(
            Op::Mov,
            Operand::Reg(Reg::accumulator(dtsize)),
            Operand::Mem(mem),
        ));
    }

    fn gen_id_expr(&mut self, idexp: &IdExpr) {
        self.emit_comment(format!("; line {}", idexp.tok.loc.line));

        if idexp.unary.is_some() && idexp.is_operator {
            let target = idexp.unary.as_ref().unwrap();
            let sym = match self.sym_of_id(target) {
                Some(s) => s,
                None => return,
            };
            let dtsize = self.sym_type_size(sym);
            match idexp.tok.kind {
                TokenKind::AddrOf => {
                    let mem = self.id_mem(sym, 0);
                    self.emit(
                        Instruction::binary(
                            Op::Lea,
                            Operand::Reg(Reg::Eax),
                            Operand::Mem(mem),
                        )
                        .with_comment("    ; address of"),
                    );
                }
                TokenKind::Inc => {
                    let mem = self.id_mem(sym, dtsize.min(4));
                    self.emit(
                        Instruction::unary(Op::Inc, Operand::Mem(mem))
                            .with_comment("    ; ++"),
                    );
                }
                TokenKind::Dec => {
                    let mem = self.id_mem(sym, dtsize.min(4));
                    self.emit(
                        Instruction::unary(Op::Dec, Operand::Mem(mem))
                            .with_comment("    ; --"),
                    );
                }
                _ => {}
            }
            return;
        }

        let sym = match self.sym_of_id(idexp) {
            Some(s) => s,
            None => return,
        };
        let dtsize = self.sym_type_size(sym);
        let reg = Reg::accumulator(dtsize);
        let mem = self.lhs_mem(idexp, sym, dtsize);
        self.emit(Instruction::binary(
            Op::Mov,
            Operand::Reg(reg),
            Operand::Mem(mem),
        ));

        // each extra indirection level loads through the accumulator
        if idexp.ptr_count > 1 {
            for _ in 1..idexp.ptr_count {
                self.emit(Instruction::binary(
                    Op::Mov,
                    Operand::Reg(Reg::Eax),
                    Operand::Mem(MemRef::global("eax", 4)),
                ));
            }
        }
    }

    /// Arguments evaluate right to left, each pushed as one machine word;
    /// float results spill through memory first. The caller pops the
    /// argument area after the call.
    fn gen_call(&mut self, call: &CallExpr) {
        self.emit_comment(format!(
            "; line: {}, func_call: {}",
            call.callee.tok.loc.line, call.callee.tok.lexeme
        ));
        let mut pushed = 0i64;
        for (index, arg) in call.args.iter().enumerate().rev() {
            let param_number = index + 1;
            match arg {
                Expr::Primary(p) => {
                    if let Some(ExprValue::Float) = self.gen_primary(p) {
                        self.emit(
                            Instruction::unary(
                                Op::Fstp,
                                Operand::Mem(MemRef::global("eax", 4)),
                            )
                            .with_comment(
                                "    ; retrieve value from float stack(st0) ",
                            ),
                        );
                    }
                    self.emit(
                        Instruction::unary(Op::Push, Operand::Reg(Reg::Eax))
                            .with_comment(format!(
                                "    ; param {}",
                                param_number
                            )),
                    );
                }
                Expr::Sizeof(s) => {
                    self.gen_sizeof(s);
                    self.emit(
                        Instruction::unary(Op::Push, Operand::Reg(Reg::Eax))
                            .with_comment(format!(
                                "    ; param {}",
                                param_number
                            )),
                    );
                }
                Expr::Id(i) => {
                    self.gen_id_expr(i);
                    self.emit(
                        Instruction::unary(Op::Push, Operand::Reg(Reg::Eax))
                            .with_comment(format!(
                                "    ; param {}",
                                param_number
                            )),
                    );
                }
                _ => {}
            }
            pushed += 4;
        }
        let callee = if call.callee.is_leaf() {
            call.callee.tok.lexeme.clone()
        } else {
            String::new()
        };
        self.emit(Instruction::unary(Op::Call, Operand::Literal(callee)));
        if !call.args.is_empty() {
            self.emit(
                Instruction::binary(
                    Op::Add,
                    Operand::Reg(Reg::Esp),
                    Operand::Literal(pushed.to_string()),
                )
                .with_comment("    ; restore func-call params stack frame"),
            );
        }
    }

    // ===== Conditions =====

    fn gen_float_condition(
        &mut self,
        left: &PrimaryExpr,
        right: &PrimaryExpr,
    ) -> bool {
        let l_float = left.is_id()
            && self.sym_of_primary(left).map_or(false, |s| s.is_float_type());
        let r_float = right.is_id()
            && self
                .sym_of_primary(right)
                .map_or(false, |s| s.is_float_type());
        let l_lit = !left.is_id() && left.tok.kind == TokenKind::FloatLit;
        let r_lit = !right.is_id() && right.tok.kind == TokenKind::FloatLit;
        if !(l_float || r_float || l_lit || r_lit) {
            return false;
        }

        // left loads, right compares
        if left.is_id() {
            if let Some(sym) = self.sym_of_primary(left) {
                let size = self.sym_type_size(sym);
                let mem = self.id_mem(sym, size);
                self.emit(
                    Instruction::unary(Op::Fld, Operand::Mem(mem))
                        .with_comment(format!("  ; {}", left.tok.lexeme)),
                );
            }
        } else {
            let name = self.intern_float(DeclSize::Dq, &left.tok.lexeme.clone());
            self.emit(
                Instruction::unary(
                    Op::Fld,
                    Operand::Mem(MemRef::global(name, 8)),
                )
                .with_comment(format!("  ; {}", left.tok.lexeme)),
            );
        }
        if right.is_id() {
            if let Some(sym) = self.sym_of_primary(right) {
                let size = self.sym_type_size(sym);
                let mem = self.id_mem(sym, size);
                self.emit(
                    Instruction::unary(Op::Fcom, Operand::Mem(mem))
                        .with_comment(format!("  ; {}", right.tok.lexeme)),
                );
            }
        } else {
            let name = self.intern_float(DeclSize::Dq, &right.tok.lexeme.clone());
            self.emit(
                Instruction::unary(
                    Op::Fcom,
                    Operand::Mem(MemRef::global(name, 8)),
                )
                .with_comment(format!("  ; {}", right.tok.lexeme)),
            );
        }
        self.emit(Instruction::unary(Op::Fstsw, Operand::Reg(Reg::Ax)));
        self.emit(Instruction::new(Op::Sahf));
        true
    }

    /// Lowers a relational condition to a `cmp` (or the x87 compare
    /// sequence) and reports which comparison it was.
    fn gen_condition(&mut self, condition: Option<&Expr>) -> Option<TokenKind> {
        let p = match condition? {
            Expr::Primary(p) => p,
            _ => return None,
        };
        if !p.is_operator() || !p.tok.kind.is_comparison_op() {
            return None;
        }
        let cond = p.tok.kind;
        self.emit_comment(format!(
            "; condition checking, line {}",
            p.tok.loc.line
        ));
        let left = p.left.as_ref()?;
        let right = p.right.as_ref()?;
        if self.gen_float_condition(left, right) {
            return Some(cond);
        }

        match (left.is_id(), right.is_id()) {
            (true, true) => {
                let lsym = self.sym_of_primary(left)?;
                let rsym = self.sym_of_primary(right)?;
                let lsize = self.sym_type_size(lsym);
                let rsize = self.sym_type_size(rsym);
                let rmem = self.id_mem(rsym, rsize);
                self.emit(Instruction::binary(
                    Op::Mov,
                    Operand::Reg(Reg::accumulator(lsize)),
                    Operand::Mem(rmem),
                ));
                let lmem = self.id_mem(lsym, lsize);
                self.emit(Instruction::binary(
                    Op::Cmp,
                    Operand::Mem(lmem),
                    Operand::Reg(Reg::accumulator(rsize)),
                ));
            }
            (true, false) => {
                let lsym = self.sym_of_primary(left)?;
                let lsize = self.sym_type_size(lsym);
                let lmem = self.id_mem(lsym, lsize);
                let value = convert::token_to_decimal(&right.tok);
                self.emit(Instruction::binary(
                    Op::Cmp,
                    Operand::Mem(lmem),
                    Operand::Literal(value.to_string()),
                ));
            }
            (false, true) => {
                let rsym = self.sym_of_primary(right)?;
                let rsize = self.sym_type_size(rsym);
                let rmem = self.id_mem(rsym, rsize);
                let value = convert::token_to_decimal(&left.tok);
                self.emit(Instruction::binary(
                    Op::Cmp,
                    Operand::Mem(rmem),
                    Operand::Literal(value.to_string()),
                ));
            }
            (false, false) => {
                let lvalue = convert::token_to_decimal(&left.tok);
                let rvalue = convert::token_to_decimal(&right.tok);
                self.emit(Instruction::binary(
                    Op::Mov,
                    Operand::Reg(Reg::Eax),
                    Operand::Literal(lvalue.to_string()),
                ));
                self.emit(Instruction::binary(
                    Op::Cmp,
                    Operand::Reg(Reg::Eax),
                    Operand::Literal(rvalue.to_string()),
                ));
            }
        }
        Some(cond)
    }

    // ===== Statements =====

    fn gen_select(&mut self, sel: &SelectStmt) {
        let if_n = self.if_count;
        self.if_count += 1;
        let else_n = self.else_count;
        self.else_count += 1;
        let exit_n = self.exit_if_count;
        self.exit_if_count += 1;

        let cond = self.gen_condition(sel.condition.as_ref());
        let jop = cond.map(direct_jump).unwrap_or(Op::Jmp);
        self.emit(Instruction::unary(
            jop,
            Operand::Literal(format!(".if_label{}", if_n)),
        ));
        self.emit(Instruction::unary(
            Op::Jmp,
            Operand::Literal(format!(".else_label{}", else_n)),
        ));
        self.emit_label(format!(".if_label{}", if_n));
        if !sel.if_block.is_empty() {
            self.gen_block(&sel.if_block);
            self.emit(Instruction::unary(
                Op::Jmp,
                Operand::Literal(format!(".exit_if{}", exit_n)),
            ));
        }
        self.emit_label(format!(".else_label{}", else_n));
        if !sel.else_block.is_empty() {
            self.gen_block(&sel.else_block);
        }
        self.emit_label(format!(".exit_if{}", exit_n));
    }

    fn gen_iter(&mut self, iter: &IterStmt) {
        match iter {
            IterStmt::While {
                tok,
                condition,
                body,
            } => {
                self.emit_comment(format!("; while loop, line {}", tok.loc.line));
                let n = self.while_count;
                self.while_count += 1;
                self.loop_stack.push((IterKind::While, n));
                self.emit_label(format!(".while_loop{}", n));
                if let Some(cond) = self.gen_condition(condition.as_ref()) {
                    self.emit(Instruction::unary(
                        inverse_jump(cond),
                        Operand::Literal(format!(".exit_while_loop{}", n)),
                    ));
                }
                self.gen_block(body);
                self.emit(
                    Instruction::unary(
                        Op::Jmp,
                        Operand::Literal(format!(".while_loop{}", n)),
                    )
                    .with_comment("    ; jmp to while loop"),
                );
                self.emit_label(format!(".exit_while_loop{}", n));
                self.loop_stack.pop();
            }
            IterStmt::DoWhile {
                tok,
                condition,
                body,
            } => {
                self.emit_comment(format!(
                    "; do-while loop, line {}",
                    tok.loc.line
                ));
                let n = self.dowhile_count;
                self.dowhile_count += 1;
                self.loop_stack.push((IterKind::DoWhile, n));
                self.emit_label(format!(".dowhile_loop{}", n));
                self.gen_block(body);
                if let Some(cond) = self.gen_condition(condition.as_ref()) {
                    self.emit(Instruction::unary(
                        direct_jump(cond),
                        Operand::Literal(format!(".dowhile_loop{}", n)),
                    ));
                }
                self.emit_label(format!(".exit_dowhile_loop{}", n));
                self.loop_stack.pop();
            }
            IterStmt::For {
                tok,
                init,
                condition,
                update,
                body,
            } => {
                self.emit_comment(format!("; for loop, line {}", tok.loc.line));
                if let Some(expr) = init {
                    self.gen_expr_stmt(expr);
                }
                let n = self.for_count;
                self.for_count += 1;
                self.loop_stack.push((IterKind::For, n));
                self.emit_label(format!(".for_loop{}", n));
                if let Some(cond) = self.gen_condition(condition.as_ref()) {
                    self.emit(Instruction::unary(
                        inverse_jump(cond),
                        Operand::Literal(format!(".exit_for_loop{}", n)),
                    ));
                }
                self.gen_block(body);
                if let Some(expr) = update {
                    self.gen_expr_stmt(expr);
                }
                self.emit(
                    Instruction::unary(
                        Op::Jmp,
                        Operand::Literal(format!(".for_loop{}", n)),
                    )
                    .with_comment("    ; jmp to for loop"),
                );
                self.emit_label(format!(".exit_for_loop{}", n));
                self.loop_stack.pop();
            }
        }
    }

    fn gen_jump(&mut self, jump: &JumpStmt) {
        match jump.kind {
            JumpKind::Break => {
                let (kind, n) = self
                    .loop_stack
                    .last()
                    .copied()
                    .unwrap_or((IterKind::While, self.while_count));
                self.emit(
                    Instruction::unary(
                        Op::Jmp,
                        Operand::Literal(format!(
                            ".exit_{}{}",
                            loop_prefix(kind),
                            n
                        )),
                    )
                    .with_comment(format!(
                        "    ; break loop, line {}",
                        jump.tok.loc.line
                    )),
                );
            }
            JumpKind::Continue => {
                let (kind, n) = self
                    .loop_stack
                    .last()
                    .copied()
                    .unwrap_or((IterKind::While, self.while_count));
                self.emit(
                    Instruction::unary(
                        Op::Jmp,
                        Operand::Literal(format!(
                            ".{}{}",
                            loop_prefix(kind),
                            n
                        )),
                    )
                    .with_comment(format!(
                        "    ; continue loop, line {}",
                        jump.tok.loc.line
                    )),
                );
            }
            JumpKind::Return => {
                if let Some(expr) = &jump.expr {
                    self.gen_expr_stmt(expr);
                }
                let func = self
                    .scope
                    .map(|s| s.func.clone())
                    .unwrap_or_default();
                self.emit(
                    Instruction::unary(
                        Op::Jmp,
                        Operand::Literal(format!("._exit_{}", func)),
                    )
                    .with_comment(format!(
                        "    ; return, line {}",
                        jump.tok.loc.line
                    )),
                );
            }
            JumpKind::Goto => {
                if let Some(label) = &jump.goto_label {
                    self.emit(
                        Instruction::unary(
                            Op::Jmp,
                            Operand::Literal(format!(".{}", label.lexeme)),
                        )
                        .with_comment(format!(
                            "    ; goto, line {}",
                            jump.tok.loc.line
                        )),
                    );
                }
            }
        }
    }

    // ===== Inline asm =====

    fn asm_register(&self, letter: u8) -> Option<&'static str> {
        Some(match letter {
            b'a' => "eax",
            b'b' => "ebx",
            b'c' => "ecx",
            b'd' => "edx",
            b'S' => "esi",
            b'D' => "edi",
            _ => return None,
        })
    }

    /// Sized memory reference for an `m`-constrained operand.
    fn asm_memory(&self, expr: &Expr) -> String {
        let p = match expr {
            Expr::Primary(p) => p,
            _ => return String::new(),
        };
        if let Some(slot) = self.local_slot(&p.tok.lexeme) {
            let cast = size_cast(slot.size);
            if slot.disp < 0 {
                return format!("{}[ebp - {}]", cast, -slot.disp);
            }
            return format!("{}[ebp + {}]", cast, slot.disp);
        }
        if let Some(sym) = self.sym_of_primary(p) {
            let cast = size_cast(self.sym_type_size(sym));
            return format!("{}[{}]", cast, p.tok.lexeme);
        }
        format!("[{}]", p.tok.lexeme)
    }

    fn materialize_output(&self, op: &crate::ast::AsmOperand) -> String {
        let constraint = op.constraint.lexeme.as_str();
        let letter = constraint.as_bytes().get(1).copied().unwrap_or(0);
        if let Some(reg) = self.asm_register(letter) {
            return reg.to_string();
        }
        if letter == b'm' {
            if let Some(expr) = &op.expr {
                return self.asm_memory(expr);
            }
        }
        String::new()
    }

    fn materialize_input(&self, op: &crate::ast::AsmOperand) -> String {
        if let Some(Expr::Primary(p)) = &op.expr {
            if p.tok.kind.is_constant() {
                let value = convert::token_to_decimal(&p.tok);
                return if value < 0 {
                    format!("0x{}", convert::dec_to_hex(value as i32 as u32))
                } else {
                    value.to_string()
                };
            }
            if p.tok.kind == TokenKind::Ident {
                return self.asm_memory(op.expr.as_ref().unwrap());
            }
        }
        let letter = op.constraint.lexeme.as_bytes().first().copied().unwrap_or(0);
        if let Some(reg) = self.asm_register(letter) {
            return reg.to_string();
        }
        String::new()
    }

    fn substitute_asm(&self, template: &str, stmt: &AsmStmt) -> String {
        let mut out = String::new();
        let mut chars = template.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                out.push(ch);
                continue;
            }
            let mut digits = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() {
                    digits.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            match digits.parse::<usize>() {
                Ok(n) => {
                    let replacement = if n < stmt.outputs.len() {
                        self.materialize_output(&stmt.outputs[n])
                    } else if n - stmt.outputs.len() < stmt.inputs.len() {
                        self.materialize_input(
                            &stmt.inputs[n - stmt.outputs.len()],
                        )
                    } else {
                        String::new()
                    };
                    out.push_str(&replacement);
                }
                Err(_) => out.push('%'),
            }
        }
        out
    }

    fn gen_asm(&mut self, stmts: &[AsmStmt]) {
        if let Some(first) = stmts.first() {
            self.emit_comment(format!(
                "; inline assembly, line {}",
                first.template.loc.line
            ));
        }
        for stmt in stmts {
            let template = stmt.template.lexeme.replace("\\t", "    ");
            let line = self.substitute_asm(&template, stmt);
            self.lines.push(Line::InlineAsm(line));
        }
    }

    // ===== Statement dispatch =====

    fn gen_expr_stmt(&mut self, expr: &Expr) {
        self.regs.free_all();
        self.regs.free_all_float();
        match expr {
            Expr::Primary(p) => {
                self.gen_primary(p);
            }
            Expr::Assign(a) => self.gen_assign(a),
            Expr::Sizeof(s) => self.gen_sizeof(s),
            Expr::Cast(c) => self.gen_cast(c),
            Expr::Id(i) => self.gen_id_expr(i),
            Expr::Call(c) => self.gen_call(c),
        }
    }

    fn gen_block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match stmt {
                Stmt::Label(label) => {
                    self.emit_comment(format!(
                        "; line {}",
                        label.label.loc.line
                    ));
                    self.emit_label(format!(".{}", label.label.lexeme));
                }
                Stmt::Expr(es) => {
                    if let Some(expr) = &es.expr {
                        self.gen_expr_stmt(expr);
                    }
                }
                Stmt::Select(sel) => self.gen_select(sel),
                Stmt::Iter(iter) => self.gen_iter(iter),
                Stmt::Jump(jump) => self.gen_jump(jump),
                Stmt::Asm(asm) => self.gen_asm(asm),
            }
        }
    }

    // ===== Frames and functions =====

    fn build_frame(&mut self, scope: &FunctionScope, func: &FunctionInfo) {
        let mut frame = Frame::default();
        let mut fp = 0i32;
        for (_, sym) in scope.symtab.iter() {
            let size = if sym.is_ptr || sym.type_info.spec.is_record() {
                4
            } else {
                self.sym_type_size(sym)
            };
            fp -= size;
            frame.total += size;
            frame
                .slots
                .insert(sym.name.clone(), Slot { size, disp: fp });
            frame.order.push(sym.name.clone());
        }
        let mut fp = 4i32;
        for param in &func.params {
            if param.sym.name.is_empty() {
                continue;
            }
            let size = if param.sym.is_ptr {
                4
            } else {
                match param.type_info.spec.primary() {
                    Some(tok) => data_type_size(tok.kind),
                    None => 4,
                }
            };
            fp += 4;
            frame
                .slots
                .insert(param.sym.name.clone(), Slot { size, disp: fp });
            frame.order.push(param.sym.name.clone());
        }
        self.frames.insert(func.name.clone(), frame);
    }

    fn gen_function(&mut self, scope: &'a FunctionScope, func: &FunctionInfo) {
        let mut banner = format!("; [ function: {}", func.name);
        if func.params.is_empty() {
            banner.push_str("()");
        } else {
            let params = func
                .params
                .iter()
                .map(|p| {
                    format!("{} {}", p.type_info.spec.display_name(), p.sym.name)
                })
                .join(", ");
            banner.push_str(&format!("({})", params));
        }
        banner.push_str(" ]");
        self.emit_comment(banner);

        self.emit_label(func.name.clone());
        self.build_frame(scope, func);

        if !self.omit_frame_pointer {
            self.emit(Instruction::unary(Op::Push, Operand::Reg(Reg::Ebp)));
            self.emit(Instruction::binary(
                Op::Mov,
                Operand::Reg(Reg::Ebp),
                Operand::Reg(Reg::Esp),
            ));
        }

        let frame = match self.frames.get(&func.name) {
            Some(f) => f.clone(),
            None => return,
        };
        if frame.total > 0 {
            self.emit(
                Instruction::binary(
                    Op::Sub,
                    Operand::Reg(Reg::Esp),
                    Operand::Literal(frame.total.to_string()),
                )
                .with_comment("    ; allocate space for local variables"),
            );
        }
        for name in &frame.order {
            if let Some(slot) = frame.slots.get(name) {
                let place = if slot.disp < 0 {
                    format!("[ebp - {}]", -slot.disp)
                } else {
                    format!("[ebp + {}]", slot.disp)
                };
                self.emit_comment(format!(
                    "    ; {} = {}, {}",
                    name,
                    place,
                    size_cast(slot.size)
                ));
            }
        }
    }

    fn gen_epilogue(&mut self, func_name: &str) {
        self.emit_label(format!("._exit_{}", func_name));
        if !self.omit_frame_pointer {
            self.emit(Instruction::binary(
                Op::Mov,
                Operand::Reg(Reg::Esp),
                Operand::Reg(Reg::Ebp),
            ));
            self.emit(Instruction::unary(Op::Pop, Operand::Reg(Reg::Ebp)));
        }
        self.emit(Instruction::new(Op::Ret));
    }

    // ===== Data / bss / records =====

    fn gen_array_inits(&mut self) {
        for (_, sym) in self.ctx.globals.iter() {
            if !sym.is_array || sym.array_init.is_empty() {
                continue;
            }
            let decl = sym
                .type_info
                .spec
                .primary()
                .and_then(|t| DeclSize::for_bytes(data_type_size(t.kind)))
                .unwrap_or(DeclSize::Db);
            let mut values = Vec::new();
            for row in &sym.array_init {
                for tok in row {
                    match tok.kind {
                        TokenKind::FloatLit => values.push(tok.lexeme.clone()),
                        TokenKind::StrLit => {
                            values.push(hex_string(&tok.lexeme))
                        }
                        _ => values
                            .push(convert::token_to_decimal(tok).to_string()),
                    }
                }
            }
            self.initialized.insert(sym.name.clone());
            self.data.push(DataItem {
                name: sym.name.clone(),
                decl,
                value: String::new(),
                array: values,
                comment: String::new(),
            });
        }
    }

    fn gen_records(&mut self) {
        for rec in self.ctx.records.iter() {
            let mut members = Vec::new();
            let mut total = 0i64;
            for (_, member) in rec.members.iter() {
                let count = if member.is_array {
                    member
                        .array_dims
                        .iter()
                        .map(convert::token_to_decimal)
                        .product::<i64>()
                        .max(1)
                } else {
                    1
                };
                let res;
                if member.is_ptr {
                    res = ResSize::Resd;
                    total += 4;
                } else if member.type_info.spec.is_record() {
                    res = ResSize::Resd;
                    total += 4 * count;
                } else {
                    let size = self.sym_type_size(member);
                    res = ResSize::for_bytes(size).unwrap_or(ResSize::Resb);
                    total += i64::from(res.bytes()) * count;
                }
                members.push(BssMember {
                    name: member.name.clone(),
                    res,
                    count,
                });
            }
            self.record_sizes.insert(rec.name.clone(), total);
            self.bss.push(BssItem::Record {
                name: rec.name.clone(),
                members,
                comment: format!("    ; record {} {{ }}", rec.name),
            });
        }
    }

    fn gen_bss(&mut self) {
        for (_, sym) in self.ctx.globals.iter() {
            if sym.type_info.is_global {
                self.push_text(TextDirective::Global(sym.name.clone()));
            } else if sym.type_info.is_extern {
                self.push_text(TextDirective::Extern(sym.name.clone()));
            }
            if self.initialized.contains(&sym.name) {
                continue;
            }
            let (res, base_count) = match &sym.type_info.spec {
                TypeSpec::Record(tok) => (
                    ResSize::Resb,
                    self.record_sizes.get(&tok.lexeme).copied().unwrap_or(1),
                ),
                TypeSpec::Simple(_) => (
                    ResSize::for_bytes(self.sym_type_size(sym))
                        .unwrap_or(ResSize::Resb),
                    1,
                ),
            };
            let mut count = base_count;
            if sym.is_array && !sym.array_dims.is_empty() {
                if sym.array_dims.len() > 1 {
                    for dim in &sym.array_dims {
                        count *= convert::token_to_decimal(dim);
                    }
                } else {
                    count = convert::token_to_decimal(&sym.array_dims[0]);
                }
            }
            if count < 1 {
                count = 1;
            }
            self.bss.push(BssItem::Reserve {
                name: sym.name.clone(),
                res,
                count,
            });
        }
    }

    fn push_text(&mut self, directive: TextDirective) {
        if !self.text.contains(&directive) {
            self.text.push(directive);
        }
    }

    /// Collects initialized globals into `.data`; this runs as a separate
    /// pass before any function body is lowered.
    fn gen_global_data(&mut self, unit: &SourceUnit) {
        self.gen_array_inits();
        for node in &unit.nodes {
            if node.scope.is_some() {
                continue;
            }
            for stmt in &node.stmts {
                let assign = match stmt {
                    Stmt::Expr(es) => match &es.expr {
                        Some(Expr::Assign(a)) => a,
                        _ => continue,
                    },
                    _ => continue,
                };
                let left = assign_left(&assign.left);
                let sym = match self.sym_of_id(left) {
                    Some(s) => s,
                    None => continue,
                };
                if self.initialized.contains(&sym.name) {
                    self.diags.report(
                        assign.op.loc,
                        CompileError::AssignedMultipleTimes(sym.name.clone()),
                    );
                    continue;
                }
                let p = match assign.right.as_ref() {
                    Expr::Primary(p) => p,
                    _ => continue,
                };
                let decl = sym
                    .type_info
                    .spec
                    .primary()
                    .and_then(|t| DeclSize::for_bytes(data_type_size(t.kind)))
                    .unwrap_or(DeclSize::Dd);
                let (value, comment) = match p.tok.kind {
                    TokenKind::StrLit => (
                        hex_string(&p.tok.lexeme),
                        format!("    ; '{}'", p.tok.lexeme),
                    ),
                    TokenKind::CharLit => (
                        convert::token_to_decimal(&p.tok).to_string(),
                        String::new(),
                    ),
                    _ => (p.tok.lexeme.clone(), String::new()),
                };
                let name = sym.name.clone();
                self.initialized.insert(name.clone());
                self.data.push(DataItem {
                    name,
                    decl,
                    value,
                    array: Vec::new(),
                    comment,
                });
            }
        }
        self.gen_records();
        self.gen_bss();
    }

    // ===== Driver =====

    fn generate(mut self, unit: &'a SourceUnit) -> String {
        self.gen_global_data(unit);

        for node in &unit.nodes {
            match &node.scope {
                Some(scope) => {
                    self.scope = Some(scope);
                    let func = match self.ctx.functions.get(&scope.func) {
                        Some(f) => f,
                        None => {
                            self.scope = None;
                            continue;
                        }
                    };
                    if func.is_global {
                        self.push_text(TextDirective::Global(
                            func.name.clone(),
                        ));
                    } else if func.is_extern {
                        self.push_text(TextDirective::Extern(
                            func.name.clone(),
                        ));
                    }
                    if !func.is_extern {
                        self.gen_function(scope, func);
                        self.if_count = 1;
                        self.else_count = 1;
                        self.exit_if_count = 1;
                        self.while_count = 1;
                        self.dowhile_count = 1;
                        self.for_count = 1;
                        self.loop_stack.clear();
                        self.gen_block(&node.stmts);
                        let name = func.name.clone();
                        self.gen_epilogue(&name);
                    }
                    self.scope = None;
                }
                None => {
                    for stmt in &node.stmts {
                        if let Stmt::Asm(asm) = stmt {
                            self.gen_asm(asm);
                        }
                    }
                }
            }
        }
        self.render()
    }

    // ===== Rendering =====

    fn render(&self) -> String {
        let mut out = String::new();
        if !self.text.is_empty() || !self.lines.is_empty() {
            out.push_str("\nsection .text\n");
            for directive in &self.text {
                match directive {
                    TextDirective::Global(name) => {
                        let _ = writeln!(out, "    global {}", name);
                    }
                    TextDirective::Extern(name) => {
                        let _ = writeln!(out, "    extern {}", name);
                    }
                }
            }
            out.push('\n');
        }
        for line in &self.lines {
            render_line(&mut out, line);
        }
        if !self.data.is_empty() {
            out.push_str("\nsection .data\n");
            for item in &self.data {
                if item.array.is_empty() {
                    let _ = writeln!(
                        out,
                        "    {} {} {}{}",
                        item.name,
                        item.decl.name(),
                        item.value,
                        item.comment
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "    {} {} {}",
                        item.name,
                        item.decl.name(),
                        item.array.iter().join(", ")
                    );
                }
            }
            out.push('\n');
        }
        if !self.bss.is_empty() {
            out.push_str("\nsection .bss\n");
            for item in &self.bss {
                match item {
                    BssItem::Reserve { name, res, count } => {
                        let _ = writeln!(
                            out,
                            "    {} {} {}",
                            name,
                            res.name(),
                            count
                        );
                    }
                    BssItem::Record {
                        name,
                        members,
                        comment,
                    } => {
                        let _ =
                            writeln!(out, "    struc {} {}", name, comment);
                        for wanted in
                            &[ResSize::Resb, ResSize::Resw, ResSize::Resd, ResSize::Resq]
                        {
                            for member in members {
                                if member.res == *wanted {
                                    let _ = writeln!(
                                        out,
                                        "      .{} {} {}",
                                        member.name,
                                        member.res.name(),
                                        member.count
                                    );
                                }
                            }
                        }
                        let _ = writeln!(out, "    endstruc");
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

fn render_line(out: &mut String, line: &Line) {
    match line {
        Line::Label(label) => {
            let _ = writeln!(out, "{}:", label);
        }
        Line::InlineAsm(text) => {
            let _ = writeln!(out, "{}", text);
        }
        Line::Comment(text) => {
            let _ = writeln!(out, "{}", text);
        }
        Line::Insn(insn) => {
            out.push_str("    ");
            out.push_str(insn.op.mnemonic());
            if let Some(dst) = &insn.dst {
                out.push(' ');
                render_operand(out, dst);
                if let Some(src) = &insn.src {
                    out.push_str(", ");
                    render_operand(out, src);
                }
            }
            out.push_str(&insn.comment);
            out.push('\n');
        }
    }
}

fn render_operand(out: &mut String, operand: &Operand) {
    match operand {
        Operand::Literal(text) => out.push_str(text),
        Operand::Reg(reg) => out.push_str(reg.name()),
        Operand::FReg(freg) => out.push_str(freg.name()),
        Operand::Mem(mem) => render_mem(out, mem),
    }
}

fn render_mem(out: &mut String, mem: &MemRef) {
    match mem.scope {
        crate::insn::MemScope::Global => {
            if mem.size < 0 {
                // bare name: the address of an interned constant
                out.push_str(&mem.name);
                return;
            }
            out.push_str(size_cast(mem.size));
            out.push('[');
            if mem.name.is_empty() {
                if let Some(reg) = mem.index_reg {
                    out.push_str(reg.name());
                }
            } else {
                out.push_str(&mem.name);
                if let Some(reg) = mem.index_reg {
                    let _ = write!(out, " + {} * {}", reg.name(), mem.scale);
                }
            }
            if mem.disp > 0 {
                let _ = write!(out, " + {}", mem.disp);
            }
            out.push(']');
        }
        crate::insn::MemScope::Local => {
            out.push_str(size_cast(mem.size));
            out.push_str("[ebp");
            if mem.disp > 0 {
                let _ = write!(out, " + {}", mem.disp);
            } else {
                let _ = write!(out, " - {}", -mem.disp);
            }
            out.push(']');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_string_encoding() {
        assert_eq!(hex_string("A"), "0x41,0x00");
        assert_eq!(hex_string("hi"), "0x68,0x69,0x00");
        assert_eq!(hex_string("a\\n"), "0x61,0x0A,0x00");
        assert_eq!(hex_string("\\t"), "0x09,0x00");
        // unrecognized escapes pass both characters through
        assert_eq!(hex_string("\\q"), "0x5C,0x71,0x00");
        assert_eq!(hex_string(""), "0x00");
    }

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(data_type_size(TokenKind::Char), 1);
        assert_eq!(data_type_size(TokenKind::Short), 2);
        assert_eq!(data_type_size(TokenKind::Int), 4);
        assert_eq!(data_type_size(TokenKind::Long), 4);
        assert_eq!(data_type_size(TokenKind::Float), 4);
        assert_eq!(data_type_size(TokenKind::Double), 8);
    }

    #[test]
    fn test_render_mem_forms() {
        let mut out = String::new();
        render_mem(&mut out, &MemRef::local(-4, 4));
        assert_eq!(out, "dword[ebp - 4]");

        let mut out = String::new();
        render_mem(&mut out, &MemRef::local(8, 2));
        assert_eq!(out, "word[ebp + 8]");

        let mut out = String::new();
        let mut mem = MemRef::global("arr", 4);
        mem.index_reg = Some(Reg::Ecx);
        mem.scale = 4;
        render_mem(&mut out, &mem);
        assert_eq!(out, "dword[arr + ecx * 4]");

        let mut out = String::new();
        render_mem(&mut out, &MemRef::global("string_val1", -1));
        assert_eq!(out, "string_val1");
    }
}
