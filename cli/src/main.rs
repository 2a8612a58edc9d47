#![deny(clippy::all)]

use anyhow::{bail, Context};
use clx::{compile, CompileOptions};
use std::{
    fs,
    path::{Path, PathBuf},
    process::{self, Command},
};
use structopt::StructOpt;

/// CLX compiler: compiles a `.cx` source file to 32-bit x86 NASM assembly,
/// then assembles it with nasm and links the executable with gcc.
#[derive(Debug, StructOpt)]
#[structopt(name = "clx")]
struct Opt {
    /// Path to the source code file
    #[structopt(parse(from_os_str))]
    source: PathBuf,

    /// Print the parse tree
    #[structopt(short = "t", long = "print-tree")]
    print_tree: bool,

    /// Print the global symbol table
    #[structopt(short = "s", long = "print-symtab")]
    print_symtab: bool,

    /// Print the record symbol table
    #[structopt(short = "r", long = "print-record-symtab")]
    print_record_symtab: bool,

    /// Compile only: stop after writing the assembly file
    #[structopt(short = "c", long = "compile")]
    compile_only: bool,

    /// Assemble only: stop after producing the object file
    #[structopt(short = "a", long = "assemble")]
    assemble_only: bool,

    /// Run the full pipeline through the linker (the default)
    #[structopt(short = "l", long = "link")]
    link: bool,

    /// Apply the AST optimization passes
    #[structopt(short = "o", long = "optimize")]
    optimize: bool,

    /// Link with -nostdlib
    #[structopt(long = "no-stdlib")]
    no_stdlib: bool,

    /// Omit the frame pointer in generated prologues
    #[structopt(long = "no-frameptr")]
    no_frameptr: bool,

    /// Keep the intermediate .asm file
    #[structopt(long = "keep-asm-file", alias = "ak")]
    keep_asm: bool,

    /// Keep the intermediate .o file
    #[structopt(long = "keep-obj-file", alias = "ok")]
    keep_obj: bool,

    /// Select 32-bit code generation (the only supported target; reserved
    /// for a future 64-bit switch)
    #[structopt(long = "m32")]
    m32: bool,
}

fn remove_unless_kept(path: &Path, keep: bool) {
    if !keep {
        let _ = fs::remove_file(path);
    }
}

fn run(opt: Opt) -> anyhow::Result<i32> {
    let source = fs::read_to_string(&opt.source)
        .with_context(|| format!("failed to read file {:?}", opt.source))?;
    let file_name = opt
        .source
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("input")
        .to_string();

    let options = CompileOptions {
        optimize: opt.optimize,
        omit_frame_pointer: opt.no_frameptr,
    };
    let output = match compile(&source, &file_name, &options) {
        Ok(output) => output,
        Err(errors) => {
            eprintln!("{}", errors);
            return Ok(1);
        }
    };

    if opt.print_tree {
        println!("{:#?}", output.unit);
    }
    if opt.print_symtab {
        println!("{}", serde_json::to_string_pretty(&output.ctx.globals)?);
    }
    if opt.print_record_symtab {
        println!("{}", serde_json::to_string_pretty(&output.ctx.records)?);
    }

    let stem = opt
        .source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("out")
        .to_string();
    let dir = opt.source.parent().unwrap_or_else(|| Path::new("."));
    let asm_path = dir.join(format!("{}.asm", stem));
    let obj_path = dir.join(format!("{}.o", stem));
    let exe_path = dir.join(&stem);

    fs::write(&asm_path, &output.assembly)
        .with_context(|| format!("failed to write {:?}", asm_path))?;
    if opt.compile_only {
        return Ok(0);
    }

    let status = Command::new("nasm")
        .arg("-felf32")
        .arg(&asm_path)
        .status()
        .context("failed to spawn nasm")?;
    if !status.success() {
        remove_unless_kept(&asm_path, opt.keep_asm);
        bail!("nasm failed on {:?}", asm_path);
    }
    if opt.assemble_only {
        remove_unless_kept(&asm_path, opt.keep_asm);
        return Ok(0);
    }

    let mut linker = Command::new("gcc");
    linker.arg("-m32");
    if opt.no_stdlib {
        linker.arg("-nostdlib");
    }
    linker.arg(&obj_path).arg("-no-pie").arg("-o").arg(&exe_path);
    let status = linker.status().context("failed to spawn gcc")?;
    remove_unless_kept(&asm_path, opt.keep_asm);
    remove_unless_kept(&obj_path, opt.keep_obj);
    if !status.success() {
        bail!("gcc failed on {:?}", obj_path);
    }

    // `-l` and `-m32` describe the default behavior; accepted for symmetry
    // with older driver invocations
    let _ = (opt.link, opt.m32);
    Ok(0)
}

fn main() {
    let exit_code = match run(Opt::from_args()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
