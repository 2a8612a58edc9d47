//! All the different types that can appear in the CLX abstract syntax tree.
//! There is no functionality implemented here, just basic types; each pass
//! implements its own traversal.

use crate::{
    symtab::{SymbolRef, SymbolTable, TypeSpec},
    token::Token,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorArity {
    Unary,
    Binary,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PrimaryKind {
    Literal,
    /// Identifier; the analyzer fills in the resolved symbol
    Ident(Option<SymbolRef>),
    Operator(OperatorArity),
}

/// One node of a primary expression: a binary tree over arithmetic, bitwise,
/// comparison, and logical operators with literal and identifier leaves.
/// Unary operators hang their operand off `unary` instead of `left`/`right`.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryExpr {
    pub tok: Token,
    pub kind: PrimaryKind,
    pub left: Option<Box<PrimaryExpr>>,
    pub right: Option<Box<PrimaryExpr>>,
    pub unary: Option<Box<PrimaryExpr>>,
    /// Set by the optimizer when `left` and `right` are the same expression;
    /// the generator then evaluates the left subtree once and applies the
    /// operator to that result against itself.
    pub shared_operands: bool,
}

impl PrimaryExpr {
    fn node(tok: Token, kind: PrimaryKind) -> Self {
        Self {
            tok,
            kind,
            left: None,
            right: None,
            unary: None,
            shared_operands: false,
        }
    }

    pub fn literal(tok: Token) -> Self {
        Self::node(tok, PrimaryKind::Literal)
    }

    pub fn ident(tok: Token) -> Self {
        Self::node(tok, PrimaryKind::Ident(None))
    }

    pub fn operator(tok: Token, arity: OperatorArity) -> Self {
        Self::node(tok, PrimaryKind::Operator(arity))
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.kind, PrimaryKind::Operator(_))
    }

    pub fn is_id(&self) -> bool {
        matches!(self.kind, PrimaryKind::Ident(_))
    }

    pub fn symbol(&self) -> Option<&SymbolRef> {
        match &self.kind {
            PrimaryKind::Ident(sym) => sym.as_ref(),
            _ => None,
        }
    }

    pub fn set_symbol(&mut self, sref: SymbolRef) {
        if let PrimaryKind::Ident(sym) = &mut self.kind {
            *sym = Some(sref);
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// A node of an identifier expression: chains of `.`/`->` member access with
/// subscript lists on the leaves, plus optional prefix `++`/`--`/`&` and
/// pointer indirection wrappers.
#[derive(Clone, Debug, PartialEq)]
pub struct IdExpr {
    pub tok: Token,
    pub is_operator: bool,
    pub is_id: bool,
    pub symbol: Option<SymbolRef>,
    pub is_subscript: bool,
    /// Subscript index tokens (literals or identifiers), one per dimension
    pub subscript: Vec<Token>,
    /// Pointer-indirection wrapper (`*p = ...`)
    pub is_ptr: bool,
    pub ptr_count: usize,
    pub left: Option<Box<IdExpr>>,
    pub right: Option<Box<IdExpr>>,
    pub unary: Option<Box<IdExpr>>,
}

impl IdExpr {
    fn node(tok: Token) -> Self {
        Self {
            tok,
            is_operator: false,
            is_id: false,
            symbol: None,
            is_subscript: false,
            subscript: Vec::new(),
            is_ptr: false,
            ptr_count: 0,
            left: None,
            right: None,
            unary: None,
        }
    }

    pub fn id(tok: Token) -> Self {
        let mut n = Self::node(tok);
        n.is_id = true;
        n
    }

    pub fn operator(tok: Token) -> Self {
        let mut n = Self::node(tok);
        n.is_operator = true;
        n
    }

    /// Wraps `inner` in a pointer-indirection node of the given level.
    pub fn indirection(ptr_count: usize, inner: Box<IdExpr>) -> Self {
        let mut n = Self::node(inner.tok.clone());
        n.is_ptr = true;
        n.ptr_count = ptr_count;
        n.unary = Some(inner);
        n
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SizeofExpr {
    pub target: TypeSpec,
    pub is_ptr: bool,
    pub ptr_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CastExpr {
    pub target_type: TypeSpec,
    pub ptr_count: usize,
    pub expr: Box<IdExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignExpr {
    /// The assignment operator; compound forms are rewritten to `=` by the
    /// analyzer before generation
    pub op: Token,
    pub left: Box<IdExpr>,
    pub right: Box<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallExpr {
    pub callee: Box<IdExpr>,
    pub args: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Primary(Box<PrimaryExpr>),
    Assign(AssignExpr),
    Sizeof(SizeofExpr),
    Cast(CastExpr),
    Id(Box<IdExpr>),
    Call(CallExpr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabelStmt {
    pub label: Token,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprStmt {
    pub expr: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectStmt {
    pub if_tok: Token,
    pub condition: Option<Expr>,
    pub if_block: Vec<Stmt>,
    pub else_block: Vec<Stmt>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IterKind {
    While,
    DoWhile,
    For,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IterStmt {
    While {
        tok: Token,
        condition: Option<Expr>,
        body: Vec<Stmt>,
    },
    DoWhile {
        tok: Token,
        condition: Option<Expr>,
        body: Vec<Stmt>,
    },
    For {
        tok: Token,
        init: Option<Expr>,
        condition: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
}

impl IterStmt {
    pub fn kind(&self) -> IterKind {
        match self {
            IterStmt::While { .. } => IterKind::While,
            IterStmt::DoWhile { .. } => IterKind::DoWhile,
            IterStmt::For { .. } => IterKind::For,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JumpKind {
    Break,
    Continue,
    Return,
    Goto,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JumpStmt {
    pub kind: JumpKind,
    pub tok: Token,
    /// Return value expression
    pub expr: Option<Expr>,
    /// Target label for `goto`
    pub goto_label: Option<Token>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AsmOperand {
    pub constraint: Token,
    pub expr: Option<Expr>,
}

/// One line of an `asm { ... }` block.
#[derive(Clone, Debug, PartialEq)]
pub struct AsmStmt {
    pub template: Token,
    pub outputs: Vec<AsmOperand>,
    pub inputs: Vec<AsmOperand>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Label(LabelStmt),
    Expr(ExprStmt),
    Select(SelectStmt),
    Iter(IterStmt),
    Jump(JumpStmt),
    Asm(Vec<AsmStmt>),
}

/// Per-function scope: the function's name (keying into the function table)
/// plus the table of its locals. Owned by the [UnitNode] of the definition.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionScope {
    pub func: String,
    pub symtab: SymbolTable,
}

/// One top-level item: a function definition (with its local scope), or a
/// scope-less node holding global statements (initializers, top-level asm).
#[derive(Clone, Debug, PartialEq)]
pub struct UnitNode {
    pub scope: Option<FunctionScope>,
    pub stmts: Vec<Stmt>,
}

/// A parsed translation unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceUnit {
    pub nodes: Vec<UnitNode>,
}
