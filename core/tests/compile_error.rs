//! Integration tests for CLX programs that must fail to compile. Each test
//! feeds a source string through the whole pipeline and checks the
//! rendered diagnostics.

use clx::{compile, CompileOptions};

/// Compiles the program, expecting compile error(s). Panics if the program
/// compiles successfully or if any expected message is missing.
fn expect_compile_errors(src: &str, expected: &[&str]) {
    let rendered = match compile(src, "test.cx", &CompileOptions::default()) {
        Err(errors) => format!("{}", errors),
        Ok(_) => panic!("expected compile errors for:\n{}", src),
    };
    for needle in expected {
        assert!(
            rendered.contains(needle),
            "missing {:?} in diagnostics:\n{}",
            needle,
            rendered
        );
    }
}

#[test]
fn test_undeclared_identifier() {
    expect_compile_errors(
        "global int main() { x = 5; }",
        &["undeclared 'x'"],
    );
}

#[test]
fn test_undeclared_in_expression() {
    expect_compile_errors(
        "global int main() { int a; a = b + 1; }",
        &["undeclared 'b'"],
    );
}

#[test]
fn test_pointer_multiplication() {
    expect_compile_errors(
        "global int main() { int *p; p = p * 2; }",
        &["invalid operand to binary *"],
    );
}

#[test]
fn test_two_pointers_arithmetic() {
    expect_compile_errors(
        "global int main() { int *p; int *q; int r; r = p * q; }",
        &["invalid operand to binary *"],
    );
}

#[test]
fn test_shift_needs_literal() {
    expect_compile_errors(
        "global int main() { int a; int b; a = 1; b = a << a; }",
        &["only literals expected to <<, >> at right hand side"],
    );
}

#[test]
fn test_float_bitwise_operand() {
    expect_compile_errors(
        "global int main() { float f; int a; f = 1.5; a = f & 3; }",
        &["invalid operand to binary &"],
    );
}

#[test]
fn test_dot_on_pointer() {
    expect_compile_errors(
        "record R { int x; } R *r; global int main() { r.x = 5; }",
        &["arrow(->) expected instead of dot(.)"],
    );
}

#[test]
fn test_arrow_on_value() {
    expect_compile_errors(
        "record R { int x; } R v; global int main() { v->x = 5; }",
        &["dot(.) expected instead of ->"],
    );
}

#[test]
fn test_missing_member() {
    expect_compile_errors(
        "record R { int x; } R *r; global int main() { r->y = 5; }",
        &["record 'R' has no member 'y'"],
    );
}

#[test]
fn test_break_outside_loop() {
    expect_compile_errors(
        "global void f() { break; }",
        &["not in loop/redeclared in loop, break"],
    );
}

#[test]
fn test_continue_outside_loop() {
    expect_compile_errors(
        "global void f() { continue; }",
        &["not in loop/redeclared in loop, continue"],
    );
}

#[test]
fn test_goto_missing_label() {
    expect_compile_errors(
        "global int main() { goto done; return 0; }",
        &["label 'done' does not exists"],
    );
}

#[test]
fn test_duplicate_label() {
    expect_compile_errors(
        "global int main() { here: return 0; here: return 1; }",
        &["duplicate label 'here'"],
    );
}

#[test]
fn test_void_variable() {
    expect_compile_errors(
        "void v; global int main() { v = 1; }",
        &["variable v is declared as void"],
    );
}

#[test]
fn test_call_arity() {
    expect_compile_errors(
        "extern int add(int a, int b); global int main() { add(1); }",
        &["in function call 'add', require 2 arguments"],
    );
}

#[test]
fn test_undeclared_function() {
    expect_compile_errors(
        "global int main() { missing(); }",
        &["undeclared function called 'missing'"],
    );
}

#[test]
fn test_return_value_in_void_function() {
    expect_compile_errors(
        "global void f() { return 1; }",
        &["return with value having 'void' function return type"],
    );
}

#[test]
fn test_redeclaration() {
    expect_compile_errors(
        "int a; int a;",
        &["redeclaration/conflicting types of a"],
    );
}

#[test]
fn test_duplicate_param_names() {
    expect_compile_errors(
        "global int f(int a, int a) { return 0; }",
        &["same name used in function parameter 'a'"],
    );
}

#[test]
fn test_param_collides_with_local() {
    expect_compile_errors(
        "global int f(int a) { int a; return 0; }",
        &["redeclaration of 'a', same name used for function parameter"],
    );
}

#[test]
fn test_string_into_char_scalar() {
    expect_compile_errors(
        "global int main() { char c; c = \"hi\"; }",
        &["incompatible types for string assignment to 'c'"],
    );
}

#[test]
fn test_asm_bad_output_constraint() {
    expect_compile_errors(
        "global int main() { int x; \
         asm { \"mov %0, %1\" [\"=q\"(x) : \"i\"(1)] } }",
        &["asm inconsistent operand constraints '=q'"],
    );
}

#[test]
fn test_asm_output_missing_eq() {
    expect_compile_errors(
        "global int main() { int x; \
         asm { \"mov %0, %1\" [\"a\"(x) : \"i\"(1)] } }",
        &["asm output operand constraint lacks '='"],
    );
}

#[test]
fn test_asm_template_out_of_range() {
    expect_compile_errors(
        "global int main() { int x; \
         asm { \"mov %0, %5\" [\"=a\"(x) : \"i\"(1)] } }",
        &["asm operand number out of range '%5'"],
    );
}

#[test]
fn test_unterminated_comment() {
    expect_compile_errors(
        "global int main() { return 0; } /* trailing",
        &["incomplete comment"],
    );
}

#[test]
fn test_invalid_octal_literal() {
    expect_compile_errors(
        "global int main() { int a; a = 09; }",
        &["invalid octal '09'"],
    );
}

#[test]
fn test_global_initializer_must_be_constant() {
    expect_compile_errors(
        "int g; g = 1 + 2;",
        &["constant expression expected"],
    );
}

#[test]
fn test_division_by_zero_under_optimizer() {
    let options = CompileOptions {
        optimize: true,
        omit_frame_pointer: false,
    };
    let rendered =
        match compile("global int main() { int a; a = 1 / 0; }", "test.cx", &options)
        {
            Err(errors) => format!("{}", errors),
            Ok(_) => panic!("expected divide-by-zero diagnostic"),
        };
    assert!(
        rendered.contains("divide by zero found in optimization"),
        "got:\n{}",
        rendered
    );
}

#[test]
fn test_diagnostics_carry_positions() {
    let rendered = match compile(
        "global int main() {\n    x = 5;\n}",
        "prog.cx",
        &CompileOptions::default(),
    ) {
        Err(errors) => format!("{}", errors),
        Ok(_) => panic!("expected errors"),
    };
    // file:line:col prefix, pointing into the second line
    assert!(rendered.starts_with("prog.cx:2:"), "got:\n{}", rendered);
}
