//! All error-related CLX types. Every pass reports into a shared
//! [Diagnostics] sink; the driver checks the sink between passes and refuses
//! to generate code once anything has been reported.

use crate::util::SourceLoc;
use failure::Fail;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// An error found in the program being compiled. This always indicates a
/// user error, _not_ an internal compiler error. Compiler bugs will always
/// cause a panic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum CompileError {
    // ===== Lexical =====
    /// A byte that cannot begin any token
    InvalidCharacter(char),
    /// `/*` comment with no closing `*/`
    IncompleteComment,
    /// Character literal left open at end of line
    MissingTerminatingChar(String),
    /// Escape sequence in a character literal cut short by a newline
    InvalidCharEscape(String),
    /// String literal left open at end of line
    MissingTerminatingString(String),
    /// Escape sequence in a string literal cut short by a newline
    InvalidStringEscape(String),
    /// A numeric literal with digits illegal for its radix
    InvalidLiteral {
        radix: &'static str,
        lexeme: String,
    },

    // ===== Syntactic =====
    /// A specific token (or class of tokens) was required
    Expected {
        what: String,
        found: String,
    },
    UnbalancedParenthesis,
    ExpressionExpected(String),
    InvalidTokenInExpression(String),
    /// Junk at a position where a top-level construct or statement may start
    InvalidToken(String),
    ConstantExpressionExpected(String),
    InitializerLiteralExpected(String),
    InvalidRecordDefinition,
    RecordNotDefined(String),
    TypeSpecifierExpected(String),

    // ===== Semantic =====
    Undeclared(String),
    UndeclaredFunction(String),
    Redeclaration(String),
    MemberRedeclaration(String),
    RecordExists(String),
    FunctionRedeclaration(String),
    VoidVariable(String),
    InvalidBinaryOperand {
        op: String,
        operand: String,
    },
    InvalidBinaryOperands(String),
    ShiftLiteralExpected,
    BitComplementOperand,
    SubscriptNotArray(String),
    SubscriptDimensionMismatch(String),
    DotExpected,
    ArrowExpected,
    NoSuchMember {
        record: String,
        member: String,
    },
    NotARecord(String),
    IncompatibleAssignment(String),
    IncompatibleStringAssignment(String),
    IncompatibleCastAssignment(String),
    WrongAssignOperand(String),
    SimpleTypeOperandExpected(String),
    PointerLhsExpected(String),
    InvalidPointerAssignment,
    InvalidTypeAssignment {
        from: String,
        to: String,
    },
    FunctionReturnMismatch {
        func: String,
        to: String,
    },
    FunctionPointerReturnMismatch {
        func: String,
        to: String,
    },
    ArityMismatch {
        func: String,
        expected: usize,
    },
    DuplicateLabel(String),
    LabelMissing(String),
    /// `break`/`continue` with no enclosing loop; the payload is the keyword
    NotInLoop(&'static str),
    ReturnInVoid,
    ParamIdentifierExpected(String),
    DuplicateParamName(String),
    ParamRedeclaration(String),

    // ===== Global initializers =====
    GlobalSubscriptNotConstant,
    GlobalInitializerNotConstant,
    GlobalAssignmentExpected,
    AssignedMultipleTimes(String),

    // ===== Inline asm =====
    AsmOperandOutOfRange(usize),
    AsmOutputMissingEq,
    AsmImpossibleConstraint,
    AsmInconsistentConstraint(String),
    AsmMemoryOperandExpected(String),
    AsmSingleNodeExpected,

    // ===== Optimizer / code generator =====
    DivideByZero,
    InvalidFoldOperator(String),
    UnknownOperator(String),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use CompileError::*;
        match self {
            InvalidCharacter(ch) => write!(f, "invalid character '{}'", ch),
            IncompleteComment => write!(f, "incomplete comment"),
            MissingTerminatingChar(lx) => {
                write!(f, "missing terminating character '{}'", lx)
            }
            InvalidCharEscape(lx) => {
                write!(f, "invalid character incomplete escape sequence '{}'", lx)
            }
            MissingTerminatingString(lx) => {
                write!(f, "missing terminating string \"{}\"", lx)
            }
            InvalidStringEscape(lx) => {
                write!(f, "invalid string incomplete escape sequence \"{}\"", lx)
            }
            InvalidLiteral { radix, lexeme } => {
                write!(f, "invalid {} '{}'", radix, lexeme)
            }
            Expected { what, found } => {
                if found.is_empty() {
                    write!(f, "expected {}", what)
                } else {
                    write!(f, "expected {} but found '{}'", what, found)
                }
            }
            UnbalancedParenthesis => write!(f, "unbalanced parenthesis"),
            ExpressionExpected(found) => {
                write!(f, "expression expected '{}'", found)
            }
            InvalidTokenInExpression(found) => {
                write!(f, "invalid token found in expression '{}'", found)
            }
            InvalidToken(found) => {
                write!(f, "invalid token found while parsing '{}'", found)
            }
            ConstantExpressionExpected(found) => {
                write!(f, "constant expression expected but found '{}'", found)
            }
            InitializerLiteralExpected(found) => write!(
                f,
                "literal expected in array initializer but found '{}'",
                found
            ),
            InvalidRecordDefinition => write!(f, "invalid record definition"),
            RecordNotDefined(name) => {
                write!(f, "record '{}' does not exists", name)
            }
            TypeSpecifierExpected(found) => {
                write!(f, "type specifier expected but found '{}'", found)
            }
            Undeclared(name) => write!(f, "undeclared '{}'", name),
            UndeclaredFunction(name) => {
                write!(f, "undeclared function called '{}'", name)
            }
            Redeclaration(name) => {
                write!(f, "redeclaration/conflicting types of {}", name)
            }
            MemberRedeclaration(name) => write!(f, "redeclaration of {}", name),
            RecordExists(name) => write!(f, "record {} already exists", name),
            FunctionRedeclaration(name) => {
                write!(f, "redeclaration of function {}", name)
            }
            VoidVariable(name) => {
                write!(f, "variable {} is declared as void", name)
            }
            InvalidBinaryOperand { op, operand } => {
                write!(f, "invalid operand to binary {} (have {})", op, operand)
            }
            InvalidBinaryOperands(op) => {
                write!(f, "invalid operand to binary {}", op)
            }
            ShiftLiteralExpected => {
                write!(f, "only literals expected to <<, >> at right hand side")
            }
            BitComplementOperand => {
                write!(f, "wrong type argument to bit-complement")
            }
            SubscriptNotArray(name) => {
                write!(f, "subscript is neither array nor pointer '{}'", name)
            }
            SubscriptDimensionMismatch(name) => write!(
                f,
                "array dimension is different at declaration '{}'",
                name
            ),
            DotExpected => write!(f, "dot(.) expected instead of ->"),
            ArrowExpected => write!(f, "arrow(->) expected instead of dot(.)"),
            NoSuchMember { record, member } => {
                write!(f, "record '{}' has no member '{}'", record, member)
            }
            NotARecord(name) => write!(f, "'{}' is not a record type", name),
            IncompatibleAssignment(name) => {
                write!(f, "incompatible types for assignment to '{}'", name)
            }
            IncompatibleStringAssignment(name) => write!(
                f,
                "incompatible types for string assignment to '{}'",
                name
            ),
            IncompatibleCastAssignment(name) => write!(
                f,
                "incompatible types for assignment by casting to '{}'",
                name
            ),
            WrongAssignOperand(op) => {
                write!(f, "wrong type argument to '{}'", op)
            }
            SimpleTypeOperandExpected(op) => {
                write!(f, "expected only simple type argument to '{}'", op)
            }
            PointerLhsExpected(name) => write!(
                f,
                "pointer type expected to the left hand side '{}'",
                name
            ),
            InvalidPointerAssignment => {
                write!(f, "invalid pointer type assignment")
            }
            InvalidTypeAssignment { from, to } => {
                write!(f, "invalid type assignment '{}' to '{}'", from, to)
            }
            FunctionReturnMismatch { func, to } => write!(
                f,
                "mismatched type assignment of function-call '{}' to '{}'",
                func, to
            ),
            FunctionPointerReturnMismatch { func, to } => write!(
                f,
                "mismatched pointer type assignment of function-call '{}' to '{}'",
                func, to
            ),
            ArityMismatch { func, expected } => write!(
                f,
                "in function call '{}', require {} arguments",
                func, expected
            ),
            DuplicateLabel(name) => write!(f, "duplicate label '{}'", name),
            LabelMissing(name) => {
                write!(f, "label '{}' does not exists", name)
            }
            NotInLoop(kw) => {
                write!(f, "not in loop/redeclared in loop, {}", kw)
            }
            ReturnInVoid => write!(
                f,
                "return with value having 'void' function return type"
            ),
            ParamIdentifierExpected(func) => write!(
                f,
                "identifier expected in function parameter '{}'",
                func
            ),
            DuplicateParamName(name) => {
                write!(f, "same name used in function parameter '{}'", name)
            }
            ParamRedeclaration(name) => write!(
                f,
                "redeclaration of '{}', same name used for function parameter",
                name
            ),
            GlobalSubscriptNotConstant => {
                write!(f, "constant expression expected in array subscript")
            }
            GlobalInitializerNotConstant => {
                write!(f, "constant expression expected")
            }
            GlobalAssignmentExpected => {
                write!(f, "expected assignment expression")
            }
            AssignedMultipleTimes(name) => {
                write!(f, "'{}' assigned multiple times", name)
            }
            AsmOperandOutOfRange(n) => {
                write!(f, "asm operand number out of range '%{}'", n)
            }
            AsmOutputMissingEq => {
                write!(f, "asm output operand constraint lacks '='")
            }
            AsmImpossibleConstraint => {
                write!(f, "asm impossible constraint '='")
            }
            AsmInconsistentConstraint(constraint) => write!(
                f,
                "asm inconsistent operand constraints '{}'",
                constraint
            ),
            AsmMemoryOperandExpected(constraint) => write!(
                f,
                "asm constraint '{}' requires memory location id",
                constraint
            ),
            AsmSingleNodeExpected => write!(
                f,
                "only single node primary expression expected in asm operand"
            ),
            DivideByZero => {
                write!(f, "divide by zero found in optimization")
            }
            InvalidFoldOperator(op) => {
                write!(f, "invalid operator found in optimization '{}'", op)
            }
            UnknownOperator(op) => write!(f, "unknown operator '{}'", op),
        }
    }
}

/// One reported error together with the source position it points at.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Diagnostic {
    pub loc: SourceLoc,
    pub error: CompileError,
}

/// The shared error sink. Passes report into this as they run; the pipeline
/// consults [Diagnostics::has_errors] between passes and skips code
/// generation once anything has been reported.
#[derive(Debug, Default, Serialize)]
pub struct Diagnostics {
    errors: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, loc: SourceLoc, error: CompileError) {
        self.errors.push(Diagnostic { loc, error });
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Diagnostic> {
        self.errors
    }
}

/// A batch of diagnostics bound to the file they were produced from. This is
/// what the library surfaces to callers; it can be displayed without any
/// further context.
#[derive(Debug, Fail, Serialize)]
pub struct WithSource {
    file_name: String,
    errors: Vec<Diagnostic>,
}

impl WithSource {
    pub fn new(file_name: impl Into<String>, diags: Diagnostics) -> Self {
        Self {
            file_name: file_name.into(),
            errors: diags.into_errors(),
        }
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }
}

impl Display for WithSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, diag) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{}:{}:{}: {}",
                self.file_name, diag.loc.line, diag.loc.col, diag.error
            )?;
        }
        Ok(())
    }
}
