//! Core implementation of the CLX compiler: a front end and native code
//! generator for a small C-like systems language targeting 32-bit x86. The
//! main usage of this crate is [compile], which takes source text through
//! the whole pipeline — lexing, parsing, semantic analysis, the optional
//! optimizer, and NASM code generation — and returns the assembly listing
//! (the CLI then drives `nasm` and `gcc` over it).
//!
//! ```
//! let output = clx::compile(
//!     "global int main() { return 0; }",
//!     "demo.cx",
//!     &clx::CompileOptions::default(),
//! )
//! .unwrap();
//! assert!(output.assembly.contains("main:"));
//! assert!(output.assembly.contains("global main"));
//! ```

#![deny(clippy::all)]

pub mod analyze;
pub mod ast;
pub mod convert;
pub mod error;
pub mod gen;
pub mod insn;
pub mod lex;
pub mod optimize;
pub mod parse;
pub mod regs;
pub mod symtab;
pub mod token;
pub mod util;

pub use error::{CompileError, Diagnostic, Diagnostics, WithSource};
pub use symtab::CompileCtx;
pub use util::SourceLoc;

use ast::SourceUnit;

/// Knobs the driver exposes to the pipeline.
#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    /// Run the AST optimizer before code generation
    pub optimize: bool,
    /// Drop the `push ebp`/`mov ebp, esp` prologue
    pub omit_frame_pointer: bool,
}

/// Everything one compilation produces: the assembly listing plus the
/// analyzed tree and tables for the driver's debug printers.
#[derive(Debug)]
pub struct CompileOutput {
    pub assembly: String,
    pub unit: SourceUnit,
    pub ctx: CompileCtx,
}

/// Compiles one source file to NASM assembly text. Diagnostics are checked
/// between passes; code generation never runs over a program that failed an
/// earlier pass.
pub fn compile(
    source: &str,
    file_name: &str,
    options: &CompileOptions,
) -> Result<CompileOutput, WithSource> {
    let mut diags = Diagnostics::new();

    let (mut unit, mut ctx) = parse::parse_source(source, &mut diags);
    crate::debug!(println!("{:#?}", unit));
    if diags.has_errors() {
        return Err(WithSource::new(file_name, diags));
    }

    analyze::analyze(&mut unit, &ctx, &mut diags);
    if diags.has_errors() {
        return Err(WithSource::new(file_name, diags));
    }

    if options.optimize {
        optimize::optimize(&mut unit, &mut ctx, &mut diags);
        if diags.has_errors() {
            return Err(WithSource::new(file_name, diags));
        }
    }

    let assembly = gen::generate(&unit, &ctx, &mut diags, options);
    if diags.has_errors() {
        return Err(WithSource::new(file_name, diags));
    }

    Ok(CompileOutput {
        assembly,
        unit,
        ctx,
    })
}
