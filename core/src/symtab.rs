//! Symbol, record, and function tables. Tables are insertion-ordered arenas:
//! entries live in a `Vec` (insertion order doubles as declaration order,
//! which the code generator's frame layout depends on) with a name index on
//! the side. Removal tombstones the entry so previously issued indices stay
//! valid. Expressions refer back to symbols with [SymbolRef] handles, never
//! pointers.

use crate::{ast::FunctionScope, token::Token};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// The type named by a declaration: either a run of primitive type keywords
/// or the name of a user record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TypeSpec {
    Simple(Vec<Token>),
    Record(Token),
}

impl TypeSpec {
    pub fn is_record(&self) -> bool {
        matches!(self, TypeSpec::Record(_))
    }

    /// The leading primitive-type token, when this is a simple type.
    pub fn primary(&self) -> Option<&Token> {
        match self {
            TypeSpec::Simple(toks) => toks.first(),
            TypeSpec::Record(_) => None,
        }
    }

    pub fn record_name(&self) -> Option<&str> {
        match self {
            TypeSpec::Record(tok) => Some(&tok.lexeme),
            TypeSpec::Simple(_) => None,
        }
    }

    /// Source-level spelling, used in generated assembly comments.
    pub fn display_name(&self) -> String {
        match self {
            TypeSpec::Simple(toks) => toks
                .iter()
                .map(|t| t.lexeme.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            TypeSpec::Record(tok) => tok.lexeme.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypeInfo {
    pub spec: TypeSpec,
    pub is_const: bool,
    pub is_global: bool,
    pub is_extern: bool,
    pub is_static: bool,
}

impl TypeInfo {
    pub fn new(spec: TypeSpec) -> Self {
        Self {
            spec,
            is_const: false,
            is_global: false,
            is_extern: false,
            is_static: false,
        }
    }
}

/// Parameter type of a function-pointer member; these carry no names.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParamTypeInfo {
    pub spec: TypeSpec,
    pub is_const: bool,
    pub is_ptr: bool,
    pub ptr_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SymbolInfo {
    pub name: String,
    pub tok: Token,
    pub type_info: TypeInfo,
    pub is_ptr: bool,
    pub ptr_count: usize,
    pub is_array: bool,
    /// Declared dimensions, one constant token each
    pub array_dims: Vec<Token>,
    /// Initializer rows, flattened row-major at emission
    pub array_init: Vec<Vec<Token>>,
    pub is_func_ptr: bool,
    pub fp_ret_ptr_count: usize,
    pub fp_params: Vec<ParamTypeInfo>,
    #[serde(skip)]
    pub(crate) removed: bool,
}

impl SymbolInfo {
    pub fn new(name: impl Into<String>, tok: Token, type_info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            tok,
            type_info,
            is_ptr: false,
            ptr_count: 0,
            is_array: false,
            array_dims: Vec::new(),
            array_init: Vec::new(),
            is_func_ptr: false,
            fp_ret_ptr_count: 0,
            fp_params: Vec::new(),
            removed: false,
        }
    }

    /// Is this symbol's value float or double typed (and not a pointer)?
    pub fn is_float_type(&self) -> bool {
        use crate::token::TokenKind;
        !self.is_ptr
            && match self.type_info.spec.primary() {
                Some(t) => {
                    t.kind == TokenKind::Float || t.kind == TokenKind::Double
                }
                None => false,
            }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SymbolTable {
    entries: Vec<SymbolInfo>,
    index: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Inserts a new symbol and returns its handle, or `None` if the name is
    /// already bound (the caller reports the redeclaration).
    pub fn insert(&mut self, sym: SymbolInfo) -> Option<usize> {
        if self.index.contains_key(&sym.name) {
            return None;
        }
        let idx = self.entries.len();
        self.index.insert(sym.name.clone(), idx);
        self.entries.push(sym);
        Some(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&SymbolInfo> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SymbolInfo> {
        let idx = *self.index.get(name)?;
        Some(&mut self.entries[idx])
    }

    pub fn by_index(&self, idx: usize) -> Option<&SymbolInfo> {
        self.entries.get(idx).filter(|s| !s.removed)
    }

    /// Unlinks a name. The entry stays in the arena as a tombstone so other
    /// symbols keep their indices.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.index.remove(name) {
            Some(idx) => {
                self.entries[idx].removed = true;
                true
            }
            None => false,
        }
    }

    /// Live entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SymbolInfo)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordInfo {
    pub name: String,
    pub tok: Token,
    pub is_global: bool,
    pub is_extern: bool,
    pub members: SymbolTable,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecordTable {
    entries: Vec<RecordInfo>,
    index: HashMap<String, usize>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn insert(&mut self, rec: RecordInfo) -> Option<usize> {
        if self.index.contains_key(&rec.name) {
            return None;
        }
        let idx = self.entries.len();
        self.index.insert(rec.name.clone(), idx);
        self.entries.push(rec);
        Some(idx)
    }

    pub fn get(&self, name: &str) -> Option<&RecordInfo> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut RecordInfo> {
        let idx = *self.index.get(name)?;
        Some(&mut self.entries[idx])
    }

    /// Records in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &RecordInfo> {
        self.entries.iter()
    }
}

/// One declared function parameter: its type plus the (possibly anonymous)
/// symbol binding it inside the body.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FuncParam {
    pub type_info: TypeInfo,
    pub sym: SymbolInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub tok: Token,
    pub is_global: bool,
    pub is_extern: bool,
    /// Pointer level of the return type
    pub ret_ptr_count: usize,
    pub return_type: TypeInfo,
    pub params: Vec<FuncParam>,
}

/// Keyed by function name; `BTreeMap` keeps iteration deterministic.
pub type FunctionTable = BTreeMap<String, FunctionInfo>;

/// Which table a resolved identifier lives in.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SymbolScope {
    Local,
    Param,
    Global,
    Record(String),
}

/// A stable back-reference from an expression node to a symbol.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SymbolRef {
    pub scope: SymbolScope,
    pub index: usize,
}

/// The process-wide registries of one compilation, threaded through every
/// pass as an explicit parameter.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CompileCtx {
    pub globals: SymbolTable,
    pub records: RecordTable,
    pub functions: FunctionTable,
}

impl CompileCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a symbol reference. `scope` is the enclosing function scope,
    /// required for `Local` and `Param` references.
    pub fn symbol<'a>(
        &'a self,
        sref: &SymbolRef,
        scope: Option<&'a FunctionScope>,
    ) -> Option<&'a SymbolInfo> {
        match &sref.scope {
            SymbolScope::Local => scope?.symtab.by_index(sref.index),
            SymbolScope::Param => self
                .functions
                .get(&scope?.func)
                .and_then(|f| f.params.get(sref.index))
                .map(|p| &p.sym),
            SymbolScope::Global => self.globals.by_index(sref.index),
            SymbolScope::Record(rec) => {
                self.records.get(rec)?.members.by_index(sref.index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{token::TokenKind, util::SourceLoc};

    fn sym(name: &str) -> SymbolInfo {
        let tok = Token::new(TokenKind::Ident, name, SourceLoc::default());
        let int_tok = Token::new(TokenKind::Int, "int", SourceLoc::default());
        SymbolInfo::new(name, tok, TypeInfo::new(TypeSpec::Simple(vec![int_tok])))
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = SymbolTable::new();
        assert_eq!(table.insert(sym("a")), Some(0));
        assert_eq!(table.insert(sym("b")), Some(1));
        // duplicate insert is refused
        assert_eq!(table.insert(sym("a")), None);
        assert!(table.contains("a"));
        assert_eq!(table.get("b").unwrap().name, "b");
        assert_eq!(table.index_of("b"), Some(1));
    }

    #[test]
    fn test_removal_keeps_indices_stable() {
        let mut table = SymbolTable::new();
        table.insert(sym("a"));
        table.insert(sym("b"));
        table.insert(sym("c"));
        assert!(table.remove("b"));
        assert!(!table.contains("b"));
        assert!(table.by_index(1).is_none());
        // c keeps its original handle
        assert_eq!(table.by_index(2).unwrap().name, "c");
        assert_eq!(
            table.iter().map(|(_, s)| s.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn test_declaration_order_iteration() {
        let mut table = SymbolTable::new();
        for name in &["z", "m", "a"] {
            table.insert(sym(name));
        }
        assert_eq!(
            table.iter().map(|(_, s)| s.name.as_str()).collect::<Vec<_>>(),
            vec!["z", "m", "a"]
        );
    }
}
